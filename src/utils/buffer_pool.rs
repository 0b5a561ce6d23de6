//! # Datagram Buffer Pool
//!
//! Reusable fixed-size buffers for the receive loop and the decompression
//! scratch space, so the hot path does not allocate per datagram.
//!
//! Every buffer handed out is exactly `buffer_size` bytes long and zeroed.
//!
//! ## Usage
//! ```rust
//! use map_router::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(8, 4096);
//! let mut buf = pool.acquire();
//! assert_eq!(buf.len(), 4096);
//! buf[0] = 1;
//! drop(buf); // back in the pool
//! assert_eq!(pool.available(), 8);
//! ```

use std::sync::{Arc, Mutex};

use crate::config::MAX_DATAGRAM_SIZE;

/// Free buffers kept at most, to bound memory after a burst.
const MAX_IDLE_BUFFERS: usize = 1024;

type FreeList = Arc<Mutex<Vec<Vec<u8>>>>;

/// A buffer that goes back to its pool when dropped
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: FreeList,
}

impl PooledBuffer {
    /// Detach the buffer from the pool.
    pub fn into_inner(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() < MAX_IDLE_BUFFERS {
                pool.push(std::mem::take(&mut self.buffer));
            }
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

/// Thread-safe pool of equally sized byte buffers
#[derive(Clone)]
pub struct BufferPool {
    pool: FreeList,
    buffer_size: usize,
}

impl BufferPool {
    /// Pool with `pool_size` buffers of `buffer_size` bytes ready to use.
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        let pool = (0..pool_size.min(MAX_IDLE_BUFFERS))
            .map(|_| vec![0u8; buffer_size])
            .collect();

        Self {
            pool: Arc::new(Mutex::new(pool)),
            buffer_size,
        }
    }

    /// Take a zeroed buffer, allocating when the pool is empty.
    pub fn acquire(&self) -> PooledBuffer {
        let reused = self.pool.lock().ok().and_then(|mut pool| pool.pop());
        let buffer = match reused {
            Some(mut buf) => {
                buf.clear();
                buf.resize(self.buffer_size, 0);
                buf
            }
            None => vec![0u8; self.buffer_size],
        };

        PooledBuffer {
            buffer,
            pool: self.pool.clone(),
        }
    }

    /// Number of idle buffers.
    pub fn available(&self) -> usize {
        self.pool.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64, MAX_DATAGRAM_SIZE)
    }
}
