//! Tiered pool of reusable byte buffers.
//!
//! Chunking reads allocate large buffers at a high rate. The pool keeps
//! released buffers around in per-capacity size classes, rounds each
//! request up to the smallest fitting class, and enforces a global
//! memory cap: once the cap worth of buffers is in flight, further
//! `acquire` calls suspend until a buffer is released. Suspension
//! happens on a semaphore await, so callers can cancel there.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Error};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const PAGE_SIZE: usize = 4096;

/// How often (in acquisitions) the adaptive resizer runs.
const ADAPT_INTERVAL: u64 = 4096;

/// Pool configuration.
#[derive(Clone, Debug)]
pub struct BufferPoolConfig {
    /// Ascending buffer capacities. Requests round up to the smallest
    /// class that fits; larger requests get an unpooled allocation.
    pub size_classes: Vec<usize>,
    /// Number of buffers preallocated per class.
    pub min_per_class: usize,
    /// Maximum number of idle buffers retained per class.
    pub max_per_class: usize,
    /// Cap on bytes handed out across all classes. Acquisitions beyond
    /// the cap suspend until a release.
    pub memory_cap: usize,
    /// Use page-aligned allocations suitable for O_DIRECT style I/O.
    pub direct_allowed: bool,
    /// Periodically adjust per-class retention from observed hit rates.
    pub adaptive_sizing: bool,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            size_classes: vec![
                4 * 1024,
                16 * 1024,
                64 * 1024,
                256 * 1024,
                1024 * 1024,
                4 * 1024 * 1024,
            ],
            min_per_class: 0,
            max_per_class: 32,
            memory_cap: 256 * 1024 * 1024,
            direct_allowed: false,
            adaptive_sizing: false,
        }
    }
}

/// Counters reported by [`BufferPool::stats`].
#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    pub acquires: u64,
    pub hits: u64,
    pub misses: u64,
    pub in_use_bytes: usize,
    pub pooled_bytes: usize,
    pub memory_cap: usize,
}

/// Page-aligned allocation, zero-initialized.
struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The allocation is uniquely owned by its AlignedBuf.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    fn alloc(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, PAGE_SIZE).expect("invalid buffer layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("buffer allocation failed");
        Self { ptr, layout }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

enum BufStorage {
    Heap(Box<[u8]>),
    Aligned(AlignedBuf),
}

impl BufStorage {
    fn alloc(capacity: usize, direct: bool) -> Self {
        if direct {
            BufStorage::Aligned(AlignedBuf::alloc(capacity))
        } else {
            BufStorage::Heap(vec![0u8; capacity].into_boxed_slice())
        }
    }

    fn capacity(&self) -> usize {
        match self {
            BufStorage::Heap(data) => data.len(),
            BufStorage::Aligned(buf) => buf.layout.size(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            BufStorage::Heap(data) => data,
            BufStorage::Aligned(buf) => buf.as_slice(),
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            BufStorage::Heap(data) => data,
            BufStorage::Aligned(buf) => buf.as_mut_slice(),
        }
    }
}

struct ClassState {
    capacity: usize,
    free: Mutex<Vec<BufStorage>>,
    /// Idle buffers the adaptive resizer tries to keep available.
    floor: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct PoolInner {
    config: BufferPoolConfig,
    classes: Vec<ClassState>,
    sem: Arc<Semaphore>,
    cap_pages: usize,
    acquires: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    in_use_bytes: AtomicUsize,
}

/// A buffer checked out of a [`BufferPool`].
///
/// Holds the full backing allocation plus a logical length, which is
/// zero right after `acquire`. Dropping the buffer releases it: the
/// storage returns to its size class (or is freed past the retention
/// limit) and the capacity is credited back against the memory cap.
/// Release consumes the value, so a released buffer cannot be touched
/// again.
pub struct PooledBuffer {
    storage: Option<BufStorage>,
    len: usize,
    class: Option<usize>,
    pool: Arc<PoolInner>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PooledBuffer {
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().map(|s| s.capacity()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The filled prefix of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage.as_ref().unwrap().as_slice()[..self.len]
    }

    /// The whole backing allocation, for filling.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        self.storage.as_mut().unwrap().as_mut_slice()
    }

    /// Declare the first `len` bytes as filled.
    pub fn set_filled(&mut self, len: usize) {
        assert!(len <= self.capacity(), "filled length exceeds capacity");
        self.len = len;
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let storage = match self.storage.take() {
            Some(storage) => storage,
            None => return,
        };
        let capacity = storage.capacity();

        if let Some(idx) = self.class {
            let class = &self.pool.classes[idx];
            let mut free = class.free.lock().unwrap();
            if free.len() < self.pool.config.max_per_class {
                free.push(storage);
            }
        }
        // unpooled storage and overflow past max_per_class are freed here

        let prev = self.pool.in_use_bytes.fetch_sub(capacity, Ordering::Relaxed);
        debug_assert!(prev >= capacity, "pool released more bytes than acquired");
        // the semaphore permit drops last and unblocks waiters
    }
}

/// Tiered pool of reusable byte buffers with a global memory cap.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Result<Self, Error> {
        if config.size_classes.is_empty() {
            bail!("buffer pool needs at least one size class");
        }
        let mut last = 0;
        for &capacity in &config.size_classes {
            if capacity == 0 || capacity <= last {
                bail!("buffer pool size classes must be ascending and non-zero");
            }
            last = capacity;
        }
        if config.min_per_class > config.max_per_class {
            bail!(
                "buffer pool min_per_class ({}) exceeds max_per_class ({})",
                config.min_per_class,
                config.max_per_class
            );
        }
        let largest = *config.size_classes.last().unwrap();
        if config.memory_cap < largest {
            bail!(
                "buffer pool memory cap ({}) below largest size class ({})",
                config.memory_cap,
                largest
            );
        }

        let cap_pages = config.memory_cap / PAGE_SIZE;

        let classes = config
            .size_classes
            .iter()
            .map(|&capacity| {
                let mut free = Vec::new();
                for _ in 0..config.min_per_class {
                    free.push(BufStorage::alloc(capacity, config.direct_allowed));
                }
                ClassState {
                    capacity,
                    free: Mutex::new(free),
                    floor: AtomicUsize::new(config.min_per_class),
                    hits: AtomicU64::new(0),
                    misses: AtomicU64::new(0),
                }
            })
            .collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                classes,
                sem: Arc::new(Semaphore::new(cap_pages)),
                cap_pages,
                acquires: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                in_use_bytes: AtomicUsize::new(0),
                config,
            }),
        })
    }

    pub fn with_defaults() -> Self {
        Self::new(BufferPoolConfig::default()).unwrap()
    }

    /// Check out a buffer with capacity >= `size` and logical length 0.
    ///
    /// Suspends while the memory cap is exhausted. The returned future
    /// is safe to cancel at the suspension point: nothing is held until
    /// the semaphore grant goes through.
    pub async fn acquire(&self, size: usize) -> Result<PooledBuffer, Error> {
        let inner = &self.inner;

        let class = inner.classes.iter().position(|c| c.capacity >= size);
        let capacity = match class {
            Some(idx) => inner.classes[idx].capacity,
            // oversized requests get an unpooled, page-rounded allocation
            None => (size + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE,
        };

        let pages = (capacity + PAGE_SIZE - 1) / PAGE_SIZE;
        if pages > inner.cap_pages {
            bail!(
                "buffer request of {} bytes exceeds pool memory cap of {} bytes",
                size,
                inner.config.memory_cap
            );
        }

        let permit = Arc::clone(&inner.sem)
            .acquire_many_owned(pages as u32)
            .await
            .map_err(|_| format_err!("buffer pool closed"))?;

        let storage = match class {
            Some(idx) => {
                let state = &inner.classes[idx];
                let reused = state.free.lock().unwrap().pop();
                match reused {
                    Some(storage) => {
                        state.hits.fetch_add(1, Ordering::Relaxed);
                        inner.hits.fetch_add(1, Ordering::Relaxed);
                        storage
                    }
                    None => {
                        state.misses.fetch_add(1, Ordering::Relaxed);
                        inner.misses.fetch_add(1, Ordering::Relaxed);
                        BufStorage::alloc(capacity, inner.config.direct_allowed)
                    }
                }
            }
            None => {
                inner.misses.fetch_add(1, Ordering::Relaxed);
                BufStorage::alloc(capacity, inner.config.direct_allowed)
            }
        };

        inner.in_use_bytes.fetch_add(capacity, Ordering::Relaxed);
        let count = inner.acquires.fetch_add(1, Ordering::Relaxed) + 1;
        if inner.config.adaptive_sizing && count % ADAPT_INTERVAL == 0 {
            self.adapt();
        }

        Ok(PooledBuffer {
            storage: Some(storage),
            len: 0,
            class,
            pool: Arc::clone(inner),
            _permit: Some(permit),
        })
    }

    /// Return a buffer to the pool. Equivalent to dropping it; release
    /// consumes the value, so the buffer cannot be used afterwards.
    pub fn release(&self, buf: PooledBuffer) {
        drop(buf);
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let pooled_bytes = inner
            .classes
            .iter()
            .map(|c| c.capacity * c.free.lock().unwrap().len())
            .sum();
        PoolStats {
            acquires: inner.acquires.load(Ordering::Relaxed),
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            in_use_bytes: inner.in_use_bytes.load(Ordering::Relaxed),
            pooled_bytes,
            memory_cap: inner.config.memory_cap,
        }
    }

    /// Grow or shrink per-class retention floors from observed hit rates.
    ///
    /// A class that keeps missing gets more preallocated buffers (up to
    /// `max_per_class`), a class that nearly always hits gives idle
    /// buffers back (down to `min_per_class`). Counters reset each run.
    fn adapt(&self) {
        let inner = &self.inner;
        for class in &inner.classes {
            let hits = class.hits.swap(0, Ordering::Relaxed);
            let misses = class.misses.swap(0, Ordering::Relaxed);
            let total = hits + misses;
            if total < 64 {
                continue;
            }

            let floor = class.floor.load(Ordering::Relaxed);
            if misses * 2 > total {
                let new_floor = (floor.max(1) * 2).min(inner.config.max_per_class);
                class.floor.store(new_floor, Ordering::Relaxed);
                let mut free = class.free.lock().unwrap();
                while free.len() < new_floor {
                    free.push(BufStorage::alloc(
                        class.capacity,
                        inner.config.direct_allowed,
                    ));
                }
            } else if misses * 20 < total {
                let new_floor = (floor / 2).max(inner.config.min_per_class);
                class.floor.store(new_floor, Ordering::Relaxed);
                let mut free = class.free.lock().unwrap();
                free.truncate(new_floor.max(inner.config.min_per_class));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn small_pool(memory_cap: usize) -> BufferPool {
        BufferPool::new(BufferPoolConfig {
            size_classes: vec![4 * 1024, 16 * 1024],
            min_per_class: 0,
            max_per_class: 4,
            memory_cap,
            direct_allowed: false,
            adaptive_sizing: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn acquire_rounds_up_to_class() {
        let pool = small_pool(64 * 1024);

        let buf = pool.acquire(5000).await.unwrap();
        assert_eq!(buf.capacity(), 16 * 1024);
        assert_eq!(buf.len(), 0);

        let buf = pool.acquire(1).await.unwrap();
        assert_eq!(buf.capacity(), 4 * 1024);
    }

    #[tokio::test]
    async fn released_buffers_are_reused() {
        let pool = small_pool(64 * 1024);

        let mut buf = pool.acquire(4096).await.unwrap();
        buf.buf_mut()[0] = 0xAB;
        buf.set_filled(1);
        pool.release(buf);

        let buf = pool.acquire(4096).await.unwrap();
        // fresh logical length, recycled storage
        assert_eq!(buf.len(), 0);

        let stats = pool.stats();
        assert_eq!(stats.acquires, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn memory_cap_suspends_acquire() {
        let pool = small_pool(32 * 1024);

        let a = pool.acquire(16 * 1024).await.unwrap();
        let _b = pool.acquire(16 * 1024).await.unwrap();

        // cap reached, next acquire must suspend
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire(16 * 1024)).await;
        assert!(blocked.is_err());

        drop(a);

        let c = tokio::time::timeout(Duration::from_millis(500), pool.acquire(16 * 1024))
            .await
            .expect("acquire should resume after release")
            .unwrap();
        assert_eq!(c.capacity(), 16 * 1024);
    }

    #[tokio::test]
    async fn retention_is_bounded_by_max_per_class() {
        let pool = small_pool(1024 * 1024);

        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.acquire(4096).await.unwrap());
        }
        held.clear();

        // max_per_class is 4, so only 4 stay pooled
        assert_eq!(pool.stats().pooled_bytes, 4 * 4096);
    }

    #[tokio::test]
    async fn oversized_requests_are_unpooled() {
        let pool = small_pool(256 * 1024);

        let buf = pool.acquire(100 * 1024).await.unwrap();
        assert!(buf.capacity() >= 100 * 1024);
        drop(buf);
        assert_eq!(pool.stats().pooled_bytes, 0);

        // larger than the cap itself must fail instead of deadlocking
        assert!(pool.acquire(512 * 1024).await.is_err());
    }

    #[tokio::test]
    async fn direct_buffers_are_page_aligned() {
        let pool = BufferPool::new(BufferPoolConfig {
            size_classes: vec![4 * 1024],
            direct_allowed: true,
            ..Default::default()
        })
        .unwrap();

        let mut buf = pool.acquire(4096).await.unwrap();
        assert_eq!(buf.buf_mut().as_ptr() as usize % 4096, 0);
    }
}
