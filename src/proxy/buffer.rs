//! Reusable copy buffers for proxied response bodies.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

/// Buffer size used when a site does not configure `buffer_size_kb`.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Largest per-site buffer, in KiB (64 MiB).
pub const MAX_BUFFER_SIZE_KB: i64 = 64 * 1024;

const MAX_IDLE_BUFFERS: usize = 256;

/// Pool of fixed-capacity byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    size: usize,
    idle: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size: size.max(1024),
            idle: Mutex::new(Vec::new()),
        })
    }

    /// Pool for a site's `buffer_size_kb`, or `None` to use the shared default.
    ///
    /// Sizes above [`MAX_BUFFER_SIZE_KB`] are clamped to it.
    pub fn for_site(buffer_size_kb: i64) -> Option<Arc<Self>> {
        if buffer_size_kb <= 0 {
            return None;
        }
        let kb = usize::try_from(buffer_size_kb.min(MAX_BUFFER_SIZE_KB)).ok()?;
        Some(Self::new(kb.checked_mul(1024)?))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_else(|| BytesMut::with_capacity(self.size));
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        buf.reserve(self.size);
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE_BUFFERS {
                idle.push(buf);
            }
        }
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// A buffer on loan; returns to its pool when dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Target fill level before a chunk is emitted.
    pub fn limit(&self) -> usize {
        self.pool.size
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_pool_only_when_configured() {
        assert!(BufferPool::for_site(0).is_none());
        assert!(BufferPool::for_site(-1).is_none());
        assert_eq!(BufferPool::for_site(64).unwrap().size(), 64 * 1024);
    }

    #[test]
    fn oversized_site_buffer_is_clamped() {
        let max = MAX_BUFFER_SIZE_KB as usize * 1024;
        assert_eq!(BufferPool::for_site(i64::MAX).unwrap().size(), max);
        assert_eq!(BufferPool::for_site(MAX_BUFFER_SIZE_KB + 1).unwrap().size(), max);
    }

    #[test]
    fn buffers_are_recycled_clean() {
        let pool = BufferPool::new(DEFAULT_BUFFER_SIZE);
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"leftover");
        }
        assert_eq!(pool.idle(), 1);
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= DEFAULT_BUFFER_SIZE);
        assert_eq!(pool.idle(), 0);
    }
}
