//! Leaky pool of fixed-size byte buffers.
//!
//! Relay pumps and frame bridges borrow buffers from a process-wide
//! pool instead of allocating per read. The guard returns its storage
//! when dropped, so a buffer is released on every exit path. Returns
//! beyond the pool capacity are simply discarded.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, OnceLock};

/// Matches the TCP relay buffer size of the wire protocols: one
/// max-size AEAD chunk (16383 bytes) fits with room for framing.
pub const TCP_BUF_SIZE: usize = 16 * 1024;

const POOL_CAPACITY: usize = 64;

pub struct BufferPool {
    buf_size: usize,
    capacity: usize,
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, capacity: usize) -> Self {
        BufferPool {
            buf_size,
            capacity,
            bufs: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Borrow a zeroed-or-reused buffer of `buf_size` bytes.
    pub fn get(&'static self) -> PooledBuf {
        let buf = self
            .bufs
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size]);
        PooledBuf {
            buf: Some(buf),
            pool: self,
        }
    }

    fn put(&self, buf: Vec<u8>) {
        let mut bufs = self.bufs.lock().expect("buffer pool lock poisoned");
        if bufs.len() < self.capacity {
            bufs.push(buf);
        }
        // else: leak it back to the allocator
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.bufs.lock().unwrap().len()
    }
}

/// Scoped buffer handle; returns the storage to its pool on drop.
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: &'static BufferPool,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer already released")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer already released")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// The process-wide relay buffer pool.
pub fn pool() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(|| BufferPool::new(TCP_BUF_SIZE, POOL_CAPACITY))
}
