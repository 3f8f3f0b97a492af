//! Fixed-MTU buffer pool.
//!
//! TUN packets rarely exceed a few KB; rather than allocate per packet we
//! keep a bounded stack of pre-sized buffers and hand them out, the same
//! `sync.Pool`-over-fixed-size-byte-slice idiom the packet path this
//! gateway bridges to used on its own side.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use tracing::trace;

/// The link MTU this gateway operates at. All pooled buffers are this size;
/// anything bigger is handled with a one-off allocation.
pub const MTU: usize = 10_240;

struct Inner {
    free: ArrayQueue<Vec<u8>>,
}

/// A pool of `MTU`-sized buffers.
///
/// Cloning a [`BufferPool`] shares the same underlying free list (it's an
/// `Arc` handle), matching how a single pool is threaded through the
/// reader/writer/janitor tasks.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

/// RAII handle to a pooled buffer. Returns itself to the pool on drop with
/// its length reset and its content zeroed, so no stale packet data
/// survives a pool round-trip.
pub struct PooledBuffer {
    pool: BufferPool,
    buf: Vec<u8>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        let queue = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = queue.push(vec![0u8; MTU]);
        }
        BufferPool {
            inner: Arc::new(Inner { free: queue }),
        }
    }

    /// Takes a buffer from the pool, or allocates a fresh one if the pool is
    /// empty — the gateway never blocks waiting for a buffer.
    pub fn acquire(&self) -> PooledBuffer {
        let mut buf = match self.inner.free.pop() {
            Some(b) => {
                trace!(target: "tun_gateway::buffer", "pool hit");
                b
            }
            None => {
                trace!(target: "tun_gateway::buffer", "pool miss, allocating");
                vec![0u8; MTU]
            }
        };
        buf.clear();
        buf.resize(MTU, 0);
        PooledBuffer {
            pool: self.clone(),
            buf,
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut returned = std::mem::take(&mut self.buf);
        returned.clear();
        returned.resize(MTU, 0);
        let _ = self.pool.inner.free.push(returned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_mtu_sized_buffer() {
        let pool = BufferPool::new(4);
        let buf = pool.acquire();
        assert_eq!(buf.len(), MTU);
    }

    #[test]
    fn buffers_are_reused_after_drop() {
        let pool = BufferPool::new(1);
        {
            let mut buf = pool.acquire();
            buf[0] = 0xFF;
        }
        let buf = pool.acquire();
        assert_eq!(buf[0], 0, "returned buffer must be cleared before reuse");
    }

    #[test]
    fn pool_overflow_falls_back_to_fresh_allocation() {
        let pool = BufferPool::new(1);
        let _a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(b.len(), MTU);
    }
}
