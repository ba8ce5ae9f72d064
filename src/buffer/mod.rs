//! Buffer management: the memory pool and the fragment queues.
//!
//! A fragment is a [`bytes::Bytes`] — an immutable-length view over a byte
//! region with zero-copy slicing. Ownership transfers when a fragment is
//! enqueued and returns when it is drained or leased. Read buffers come out
//! of a [`pool::LocalPool`] (one per dispatcher thread) or a
//! [`pool::SharedPool`] (internally locked, any thread).

pub mod pool;
pub mod queue;
pub mod write_queue;

pub use pool::{LocalPool, PoolOptions, SharedPool};
pub use queue::BufferQueue;
pub use write_queue::WriteQueue;
