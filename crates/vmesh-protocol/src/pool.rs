//! Fixed-size buffer pool.
//!
//! Receive loops read frames straight into pooled buffers; the buffer goes
//! back to the pool when the packet view holding it is dropped. An empty
//! pool never blocks: `acquire` allocates a fresh buffer instead.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Pool of reusable byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    capacity: usize,
    /// Acquisitions served by a fresh allocation.
    misses: AtomicU64,
}

impl BufferPool {
    /// Create a pool holding `capacity` buffers of `buffer_size` bytes.
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        let free = (0..capacity)
            .map(|_| Vec::with_capacity(buffer_size))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                buffer_size,
                capacity,
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Take an empty buffer.
    pub fn acquire(&self) -> PooledBuffer {
        let reused = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let buf = match reused {
            Some(buf) => buf,
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.inner.buffer_size)
            }
        };
        PooledBuffer {
            buf,
            pool: Some(self.inner.clone()),
        }
    }

    /// Take a buffer holding a copy of `data`.
    pub fn acquire_from(&self, data: &[u8]) -> PooledBuffer {
        let mut buffer = self.acquire();
        buffer.as_mut_vec().extend_from_slice(data);
        buffer
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Buffers currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// How often the pool was empty and a buffer had to be allocated.
    pub fn misses(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Option<Arc<PoolInner>>,
}

impl PooledBuffer {
    /// A buffer that belongs to no pool.
    pub fn detached(buf: Vec<u8>) -> Self {
        Self { buf, pool: None }
    }

    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        let mut buf = std::mem::take(&mut self.buf);
        // Buffers that grew for a jumbo frame are not kept.
        if buf.capacity() > pool.buffer_size * 4 {
            return;
        }
        buf.clear();
        let mut free = pool.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < pool.capacity {
            free.push(buf);
        }
    }
}
