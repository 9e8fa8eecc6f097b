//! On-disk constants for chunk object files.
//!
//! Object files written with the identity codec carry no framing at
//! all, the file content is the chunk. With a real codec every object
//! starts with a fixed header: magic marker, format version, a crc32
//! over the payload and the declared (uncompressed) chunk length.

// openssl::sha::sha256(b"chunkvault raw chunk v1.0")[0..8]
pub const RAW_CHUNK_MAGIC_1_0: [u8; 8] = [251, 238, 226, 217, 202, 76, 99, 28];

// openssl::sha::sha256(b"chunkvault compressed chunk v1.0")[0..8]
pub const COMPRESSED_CHUNK_MAGIC_1_0: [u8; 8] = [89, 255, 216, 221, 128, 219, 149, 7];

/// Current header format version.
pub const CHUNK_BLOB_VERSION: u8 = 1;

/// magic (8) + version (1) + crc32 (4) + declared length (8)
pub const CHUNK_BLOB_HEADER_LEN: usize = 21;

/// Hard upper bound on a single chunk payload.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;
