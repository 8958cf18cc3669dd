//! Exchange-buffer free-list pool.
//!
//! Grounded on `fuel-vm::pool`'s buffer free list: a fixed-capacity `Vec` of reusable
//! buffers handed out by [`ExchangeBufferPool::get`] and returned by
//! [`ExchangeBufferPool::release`]. Not thread-safe, per spec §5 — callers sharing a
//! pool across threads must synchronise externally.

use super::ExchangeBuffer;

/// A free-list pool of [`ExchangeBuffer`]s. `get_exbuf`/`release_exbuf` in spec §5 are
/// `get`/`release` here.
pub struct ExchangeBufferPool {
    free: Vec<ExchangeBuffer>,
    capacity: usize,
    allocated: usize,
}

impl ExchangeBufferPool {
    /// Creates a pool that will never hold more than `capacity` buffers at once
    /// (in flight plus idle in the free list).
    pub fn new(capacity: usize) -> Self {
        ExchangeBufferPool { free: Vec::with_capacity(capacity), capacity, allocated: 0 }
    }

    /// Returns a buffer from the free list, or allocates a fresh one if under
    /// capacity and the free list is empty. Returns `None` at capacity.
    pub fn get(&mut self) -> Option<ExchangeBuffer> {
        if let Some(buf) = self.free.pop() {
            return Some(buf);
        }
        if self.allocated < self.capacity {
            self.allocated += 1;
            return Some(ExchangeBuffer::default());
        }
        None
    }

    /// Returns `buf` to the free list, clearing its contents so the next `get` starts
    /// from a clean slate.
    pub fn release(&mut self, mut buf: ExchangeBuffer) {
        buf.packet.clear();
        buf.info.clear();
        buf.user_data = 0;
        self.free.push(buf);
    }

    pub fn in_use(&self) -> usize {
        self.allocated - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_refuses_to_exceed_capacity() {
        let mut pool = ExchangeBufferPool::new(1);
        let buf = pool.get().unwrap();
        assert!(pool.get().is_none());
        pool.release(buf);
        assert!(pool.get().is_some());
    }

    #[test]
    fn released_buffer_is_cleared() {
        let mut pool = ExchangeBufferPool::new(1);
        let mut buf = pool.get().unwrap();
        buf.packet.extend_from_slice(b"hello");
        pool.release(buf);
        let reused = pool.get().unwrap();
        assert!(reused.packet.is_empty());
    }
}
