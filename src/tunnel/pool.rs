//! Reusable body buffers for tunneled responses.
//!
//! # Responsibilities
//! - Hand out cleared `Vec<u8>` buffers for response bodies
//! - Take buffers back once the response has been written to the wire
//!
//! # Design Decisions
//! - Lock-free bounded free-list, so `get`/`put` never block
//! - Buffers above [`MAX_POOLED_CAPACITY`] are dropped instead of pooled, so
//!   one huge response cannot pin memory forever

use std::sync::{Arc, LazyLock};

use crossbeam::queue::ArrayQueue;

/// Largest buffer capacity kept in the pool.
pub const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

/// Default number of free buffers retained.
pub const DEFAULT_POOL_SLOTS: usize = 1024;

static DEFAULT_POOL: LazyLock<Arc<BufferPool>> =
    LazyLock::new(|| Arc::new(BufferPool::new(DEFAULT_POOL_SLOTS)));

/// Process-wide pool used when none is injected.
pub fn default_pool() -> Arc<BufferPool> {
    Arc::clone(&DEFAULT_POOL)
}

/// Bounded free-list of byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    free: ArrayQueue<Vec<u8>>,
}

impl BufferPool {
    /// Create a pool retaining at most `slots` free buffers.
    pub fn new(slots: usize) -> Self {
        Self {
            free: ArrayQueue::new(slots.max(1)),
        }
    }

    /// Take a zero-length buffer, reusing a pooled allocation when available.
    pub fn get(&self) -> Vec<u8> {
        self.free.pop().unwrap_or_default()
    }

    /// Return a buffer to the pool.
    ///
    /// Oversized buffers, and buffers arriving while the pool is full, are
    /// dropped.
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();
        let _ = self.free.push(buf);
    }

    /// Number of buffers currently pooled.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SLOTS)
    }
}
