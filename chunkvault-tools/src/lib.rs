pub mod buffer_pool;
pub mod format;
pub mod fs;
pub mod lru_cache;
pub mod xorshift;

pub use buffer_pool::{BufferPool, BufferPoolConfig, PooledBuffer, PoolStats};
pub use lru_cache::LruCache;
