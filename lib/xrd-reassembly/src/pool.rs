// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small bounded pool of reusable pixel-sample buffers, so a table under
//! steady load doesn't allocate and free a multi-megabyte `Vec` per frame.

/// Recycles backing buffers for [`super::ReassemblySlot`]s. Bounded by
/// `capacity` (normally the table's own slot count `K`): there is never a
/// reason to hold more spare buffers than the table has slots.
pub struct BufferPool {
    free: Vec<Vec<u16>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Takes a buffer with at least `len` capacity, zero-length, from the
    /// pool if one is available, else allocates a fresh one.
    pub fn acquire(&mut self, len: usize) -> Vec<u16> {
        if let Some(pos) = self.free.iter().position(|b| b.capacity() >= len) {
            let mut buf = self.free.swap_remove(pos);
            buf.clear();
            buf
        } else {
            Vec::with_capacity(len)
        }
    }

    /// Returns a buffer to the pool for reuse, dropping it instead if the
    /// pool is already at capacity.
    pub fn release(&mut self, mut buf: Vec<u16>) {
        if self.free.len() < self.capacity {
            buf.clear();
            self.free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffer_is_reused_without_reallocating() {
        let mut pool = BufferPool::new(2);
        let buf = Vec::<u16>::with_capacity(64);
        let cap = buf.capacity();
        pool.release(buf);
        let reused = pool.acquire(32);
        assert_eq!(reused.capacity(), cap);
    }

    #[test]
    fn pool_drops_buffers_past_capacity() {
        let mut pool = BufferPool::new(1);
        pool.release(Vec::<u16>::with_capacity(8));
        pool.release(Vec::<u16>::with_capacity(8));
        assert_eq!(pool.free.len(), 1);
    }
}
