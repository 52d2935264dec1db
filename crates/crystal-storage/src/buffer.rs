//! Pooled byte buffers for the disk and network hot paths.
//!
//! The pool hands out fixed-size buffers that return themselves on drop, so
//! a buffer moved across a worker-queue boundary cannot be forgotten: the
//! last holder's drop puts it back.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Size of each buffer in bytes.
    pub buffer_size: usize,
    /// Number of buffers pre-allocated at construction.
    pub initial_count: usize,
    /// Maximum number of buffers retained by the pool.
    pub max_count: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 32 * 1024,
            initial_count: 8,
            max_count: 256,
        }
    }
}

/// Statistics for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total buffers ever allocated by this pool.
    pub total_allocated: usize,
    /// Buffers currently available in the pool.
    pub available: usize,
    /// Buffers currently checked out.
    pub in_use: usize,
}

/// A thread-safe pool of reusable fixed-size byte buffers.
pub struct BufferPool {
    config: BufferPoolConfig,
    buffers: Mutex<VecDeque<Vec<u8>>>,
    total_allocated: AtomicUsize,
    in_use: AtomicUsize,
}

impl BufferPool {
    /// Creates a new pool and pre-allocates the initial buffers.
    pub fn new(config: BufferPoolConfig) -> Arc<Self> {
        let mut initial = VecDeque::with_capacity(config.initial_count);
        for _ in 0..config.initial_count {
            initial.push_back(vec![0u8; config.buffer_size]);
        }
        let total = initial.len();
        Arc::new(Self {
            config,
            buffers: Mutex::new(initial),
            total_allocated: AtomicUsize::new(total),
            in_use: AtomicUsize::new(0),
        })
    }

    /// Checks out a buffer, allocating a fresh one if the pool is empty.
    pub fn rent(self: &Arc<Self>) -> PooledBuffer {
        let buf = {
            let mut buffers = self.buffers.lock();
            buffers.pop_front()
        };
        let buf = match buf {
            Some(b) => b,
            None => {
                self.total_allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.config.buffer_size]
            }
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            available: self.buffers.lock().len(),
            in_use: self.in_use.load(Ordering::Relaxed),
        }
    }

    /// Size of each buffer handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    fn give_back(&self, buf: Vec<u8>) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.config.max_count {
            buffers.push_back(buf);
        }
    }
}

/// A checked-out buffer. Returns itself to its pool on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}
