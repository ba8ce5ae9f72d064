//! Memory pool for read buffers.
//!
//! Avoids a fresh allocation per read: in preallocation mode, buffers are
//! recycled back into a small free list and reused as long as their capacity
//! meets the configured minimum. Recycled buffers below the minimum are
//! dropped so tiny remainders don't pollute the pool.
//!
//! Two variants: [`LocalPool`] is single-owner (`&mut self`, no locking —
//! lives inside one dispatcher thread), [`SharedPool`] wraps the same core
//! behind a mutex for callers on arbitrary threads.

use std::sync::Mutex;

use bytes::{Bytes, BytesMut};

use crate::error::Error;

/// Page granularity used for direct-mode allocations.
const PAGE_SIZE: usize = 4096;

/// Upper bound on pooled buffers. Bounds the idle working set; anything
/// recycled beyond this is dropped for the allocator to reclaim.
const MAX_POOLED: usize = 256;

/// Pool behavior knobs, derived from the engine [`Config`](crate::Config).
#[derive(Clone, Copy, Debug)]
pub struct PoolOptions {
    /// Keep and reuse buffers instead of allocating fresh per read.
    pub preallocation: bool,
    /// Default allocation size for fresh buffers.
    pub chunk_size: usize,
    /// Minimum capacity for a buffer to be worth pooling.
    pub min_reusable: usize,
    /// Round allocations to page multiples (off-heap-style buffers).
    pub direct: bool,
}

impl PoolOptions {
    pub(crate) fn from_config(config: &crate::Config) -> Self {
        PoolOptions {
            preallocation: config.preallocation,
            chunk_size: config.prealloc_chunk_size,
            min_reusable: config.min_reusable_size,
            direct: config.direct_buffers,
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            preallocation: true,
            chunk_size: 16384,
            min_reusable: 64,
            direct: false,
        }
    }
}

struct PoolCore {
    opts: PoolOptions,
    free: Vec<BytesMut>,
}

impl PoolCore {
    fn new(opts: PoolOptions) -> Self {
        PoolCore {
            opts,
            free: Vec::new(),
        }
    }

    fn acquire(&mut self, min_size: usize) -> Result<BytesMut, Error> {
        if self.opts.preallocation {
            // Prefer the most recently recycled buffer that fits (LIFO keeps
            // the hot buffer hot).
            if let Some(pos) = self.free.iter().rposition(|b| b.capacity() >= min_size) {
                let mut buf = self.free.swap_remove(pos);
                buf.clear();
                return Ok(buf);
            }
        }
        self.alloc(min_size.max(self.opts.chunk_size))
    }

    fn alloc(&self, size: usize) -> Result<BytesMut, Error> {
        let size = if self.opts.direct {
            size.next_multiple_of(PAGE_SIZE)
        } else {
            size
        };
        // Go through try_reserve so exhaustion surfaces as an error
        // instead of an allocator abort.
        let mut scratch: Vec<u8> = Vec::new();
        if scratch.try_reserve_exact(size).is_err() {
            return Err(Error::BufferAllocation {
                direct: self.opts.direct,
            });
        }
        drop(scratch);
        crate::metrics::BUFFERS_ALLOCATED.increment();
        Ok(BytesMut::with_capacity(size))
    }

    fn recycle(&mut self, buf: BytesMut) {
        if !self.opts.preallocation
            || buf.capacity() < self.opts.min_reusable
            || self.free.len() >= MAX_POOLED
        {
            crate::metrics::BUFFERS_DISCARDED.increment();
            return;
        }
        crate::metrics::BUFFERS_RECYCLED.increment();
        self.free.push(buf);
    }

    fn extract_consumed(&mut self, mut buf: BytesMut, read: usize) -> Bytes {
        debug_assert!(read <= buf.len(), "read {read} exceeds buffer {}", buf.len());
        let consumed = buf.split_to(read).freeze();
        self.recycle(buf);
        consumed
    }
}

/// Single-owner memory pool. No synchronization; lives on one thread.
pub struct LocalPool {
    core: PoolCore,
}

impl LocalPool {
    /// Create a pool with the given options.
    pub fn new(opts: PoolOptions) -> Self {
        LocalPool {
            core: PoolCore::new(opts),
        }
    }

    /// Return a buffer with at least `min_size` spare capacity, pooled if
    /// preallocation is on and a fitting buffer is available.
    pub fn acquire(&mut self, min_size: usize) -> Result<BytesMut, Error> {
        self.core.acquire(min_size)
    }

    /// Return a buffer to the pool. Dropped unless preallocation is on and
    /// the capacity meets the reusable minimum.
    pub fn recycle(&mut self, buf: BytesMut) {
        self.core.recycle(buf);
    }

    /// Freeze exactly the consumed prefix as an independent fragment and
    /// recycle the unused remainder.
    pub fn extract_consumed(&mut self, buf: BytesMut, read: usize) -> Bytes {
        self.core.extract_consumed(buf, read)
    }

    /// Number of pooled buffers currently held.
    pub fn pooled(&self) -> usize {
        self.core.free.len()
    }

    /// The pool's configured options.
    pub fn options(&self) -> PoolOptions {
        self.core.opts
    }
}

/// Multi-owner memory pool. Internally locked; usable from any thread.
pub struct SharedPool {
    core: Mutex<PoolCore>,
}

impl SharedPool {
    /// Create a pool with the given options.
    pub fn new(opts: PoolOptions) -> Self {
        SharedPool {
            core: Mutex::new(PoolCore::new(opts)),
        }
    }

    /// See [`LocalPool::acquire`].
    pub fn acquire(&self, min_size: usize) -> Result<BytesMut, Error> {
        self.lock().acquire(min_size)
    }

    /// See [`LocalPool::recycle`].
    pub fn recycle(&self, buf: BytesMut) {
        self.lock().recycle(buf);
    }

    /// See [`LocalPool::extract_consumed`].
    pub fn extract_consumed(&self, buf: BytesMut, read: usize) -> Bytes {
        self.lock().extract_consumed(buf, read)
    }

    /// Number of pooled buffers currently held.
    pub fn pooled(&self) -> usize {
        self.lock().free.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolCore> {
        // A poisoned pool only means a panic elsewhere mid-recycle; the
        // free list is still structurally valid.
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> PoolOptions {
        PoolOptions {
            preallocation: true,
            chunk_size: 1024,
            min_reusable: 64,
            direct: false,
        }
    }

    #[test]
    fn acquire_allocates_chunk_size() {
        let mut pool = LocalPool::new(opts());
        let buf = pool.acquire(16).unwrap();
        assert!(buf.capacity() >= 1024);
    }

    #[test]
    fn recycle_and_reuse() {
        let mut pool = LocalPool::new(opts());
        let buf = pool.acquire(16).unwrap();
        let cap = buf.capacity();
        pool.recycle(buf);
        assert_eq!(pool.pooled(), 1);

        // Repeated acquire/recycle never grows the pool past one buffer.
        for _ in 0..100 {
            let buf = pool.acquire(16).unwrap();
            assert_eq!(buf.capacity(), cap);
            pool.recycle(buf);
            assert_eq!(pool.pooled(), 1);
        }
    }

    #[test]
    fn sub_minimum_recycle_dropped() {
        let mut pool = LocalPool::new(opts());
        pool.recycle(BytesMut::with_capacity(16)); // below min_reusable
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn preallocation_off_never_pools() {
        let mut pool = LocalPool::new(PoolOptions {
            preallocation: false,
            ..opts()
        });
        let buf = pool.acquire(16).unwrap();
        pool.recycle(buf);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn extract_consumed_slices_and_recycles() {
        let mut pool = LocalPool::new(opts());
        let mut buf = pool.acquire(64).unwrap();
        buf.extend_from_slice(b"hello world");
        let frag = pool.extract_consumed(buf, 5);
        assert_eq!(&frag[..], b"hello");
        // Remainder capacity is well above min_reusable, so it was pooled.
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn direct_mode_page_rounds() {
        let mut pool = LocalPool::new(PoolOptions {
            direct: true,
            chunk_size: 100,
            ..opts()
        });
        let buf = pool.acquire(1).unwrap();
        assert_eq!(buf.capacity() % PAGE_SIZE, 0);
    }

    #[test]
    fn shared_pool_from_threads() {
        let pool = std::sync::Arc::new(SharedPool::new(opts()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let buf = pool.acquire(128).unwrap();
                    pool.recycle(buf);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.pooled() <= 4);
    }
}
