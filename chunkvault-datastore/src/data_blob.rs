use anyhow::{bail, Error};

use crate::file_formats::*;

/// Codec applied to chunk payloads before they hit the disk.
///
/// The chunk digest is always computed over the uncompressed bytes;
/// the codec only changes the encoded object representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkCodec {
    /// Objects are the raw chunk bytes, no framing.
    Identity,
    /// Objects are framed and zstd-compressed. Compression is skipped
    /// per chunk when it does not shrink the payload.
    Zstd { level: i32 },
}

impl Default for ChunkCodec {
    fn default() -> Self {
        ChunkCodec::Zstd { level: 1 }
    }
}

impl ChunkCodec {
    pub fn is_identity(&self) -> bool {
        matches!(self, ChunkCodec::Identity)
    }
}

/// Encoded chunk object, ready to be written to (or just read from)
/// the store.
pub struct ChunkBlob {
    raw_data: Vec<u8>,
}

fn write_header(out: &mut Vec<u8>, magic: &[u8; 8], crc: u32, length: u64) {
    out.extend_from_slice(magic);
    out.push(CHUNK_BLOB_VERSION);
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
}

struct BlobHeader {
    magic: [u8; 8],
    version: u8,
    crc: u32,
    length: u64,
}

fn read_header(raw: &[u8]) -> Result<BlobHeader, Error> {
    if raw.len() < CHUNK_BLOB_HEADER_LEN {
        bail!("chunk object too small for header ({} bytes)", raw.len());
    }
    let mut magic = [0u8; 8];
    magic.copy_from_slice(&raw[0..8]);
    let version = raw[8];
    let crc = u32::from_le_bytes(raw[9..13].try_into().unwrap());
    let length = u64::from_le_bytes(raw[13..21].try_into().unwrap());
    Ok(BlobHeader {
        magic,
        version,
        crc,
        length,
    })
}

fn payload_crc(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

impl ChunkBlob {
    /// Encode chunk bytes for storage under the given codec.
    pub fn encode(data: &[u8], codec: &ChunkCodec) -> Result<Self, Error> {
        if data.len() > MAX_CHUNK_SIZE {
            bail!("chunk too large ({} bytes)", data.len());
        }

        let raw_data = match codec {
            ChunkCodec::Identity => data.to_vec(),
            ChunkCodec::Zstd { level } => {
                let compressed = zstd::bulk::compress(data, *level)?;
                if compressed.len() < data.len() {
                    let mut out = Vec::with_capacity(CHUNK_BLOB_HEADER_LEN + compressed.len());
                    write_header(
                        &mut out,
                        &COMPRESSED_CHUNK_MAGIC_1_0,
                        payload_crc(&compressed),
                        data.len() as u64,
                    );
                    out.extend_from_slice(&compressed);
                    out
                } else {
                    let mut out = Vec::with_capacity(CHUNK_BLOB_HEADER_LEN + data.len());
                    write_header(
                        &mut out,
                        &RAW_CHUNK_MAGIC_1_0,
                        payload_crc(data),
                        data.len() as u64,
                    );
                    out.extend_from_slice(data);
                    out
                }
            }
        };

        Ok(Self { raw_data })
    }

    /// Wrap bytes read back from the store.
    pub fn from_raw(raw_data: Vec<u8>) -> Self {
        Self { raw_data }
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.raw_data
    }

    pub fn raw_size(&self) -> u64 {
        self.raw_data.len() as u64
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.raw_data
    }

    /// The uncompressed chunk length this object declares, without
    /// decoding the payload.
    pub fn declared_len(&self, codec: &ChunkCodec) -> Result<u64, Error> {
        match codec {
            ChunkCodec::Identity => Ok(self.raw_data.len() as u64),
            ChunkCodec::Zstd { .. } => Ok(read_header(&self.raw_data)?.length),
        }
    }

    /// Decode back into chunk bytes, verifying framing and crc.
    pub fn decode(self, codec: &ChunkCodec) -> Result<Vec<u8>, Error> {
        match codec {
            ChunkCodec::Identity => Ok(self.raw_data),
            ChunkCodec::Zstd { .. } => {
                let header = read_header(&self.raw_data)?;
                if header.version != CHUNK_BLOB_VERSION {
                    bail!("unsupported chunk object version {}", header.version);
                }
                if header.length as usize > MAX_CHUNK_SIZE {
                    bail!("chunk object declares invalid length {}", header.length);
                }

                let payload = &self.raw_data[CHUNK_BLOB_HEADER_LEN..];
                if payload_crc(payload) != header.crc {
                    bail!("chunk object has wrong crc checksum");
                }

                if header.magic == COMPRESSED_CHUNK_MAGIC_1_0 {
                    let data = zstd::bulk::decompress(payload, header.length as usize)?;
                    if data.len() as u64 != header.length {
                        bail!(
                            "chunk object length mismatch ({} != {})",
                            data.len(),
                            header.length
                        );
                    }
                    Ok(data)
                } else if header.magic == RAW_CHUNK_MAGIC_1_0 {
                    if payload.len() as u64 != header.length {
                        bail!(
                            "chunk object length mismatch ({} != {})",
                            payload.len(),
                            header.length
                        );
                    }
                    Ok(payload.to_vec())
                } else {
                    bail!("chunk object has unknown magic number");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_codec_is_transparent() {
        let data = b"some chunk payload".to_vec();
        let blob = ChunkBlob::encode(&data, &ChunkCodec::Identity).unwrap();
        assert_eq!(blob.raw_data(), &data[..]);
        assert_eq!(blob.declared_len(&ChunkCodec::Identity).unwrap(), 18);
        assert_eq!(blob.decode(&ChunkCodec::Identity).unwrap(), data);
    }

    #[test]
    fn zstd_codec_frames_and_round_trips() {
        let codec = ChunkCodec::Zstd { level: 1 };

        // highly compressible
        let data = vec![0x42u8; 64 * 1024];
        let blob = ChunkBlob::encode(&data, &codec).unwrap();
        assert!(blob.raw_size() < data.len() as u64);
        assert_eq!(&blob.raw_data()[0..8], &COMPRESSED_CHUNK_MAGIC_1_0);
        assert_eq!(blob.declared_len(&codec).unwrap(), data.len() as u64);
        assert_eq!(blob.decode(&codec).unwrap(), data);
    }

    #[test]
    fn incompressible_chunks_stay_raw_framed() {
        let codec = ChunkCodec::Zstd { level: 1 };

        // tiny input, compression overhead loses
        let data = b"x".to_vec();
        let blob = ChunkBlob::encode(&data, &codec).unwrap();
        assert_eq!(&blob.raw_data()[0..8], &RAW_CHUNK_MAGIC_1_0);
        assert_eq!(blob.decode(&codec).unwrap(), data);
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let codec = ChunkCodec::Zstd { level: 1 };
        let data = vec![7u8; 4096];
        let mut raw = ChunkBlob::encode(&data, &codec).unwrap().into_inner();

        let last = raw.len() - 1;
        raw[last] ^= 0xFF;

        assert!(ChunkBlob::from_raw(raw).decode(&codec).is_err());
    }

    #[test]
    fn truncated_object_is_rejected() {
        let codec = ChunkCodec::Zstd { level: 1 };
        assert!(ChunkBlob::from_raw(vec![1, 2, 3]).decode(&codec).is_err());
    }
}
