// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reusable byte buffers handed to metrics generators and reclaimed after
//! compression.
//!
//! Buffers are created on demand when the free list is empty. The soft cap
//! bounds only how many idle buffers are retained; surplus returns are
//! dropped. A concurrency spike can therefore allocate more buffers than the
//! cap, they just won't all be kept around afterwards.

use std::sync::Mutex;

pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_pool_size: usize,
}

impl BufferPool {
    /// `max_pool_size == 0` keeps every returned buffer.
    pub fn new(max_pool_size: usize) -> Self {
        BufferPool {
            free: Mutex::new(Vec::new()),
            max_pool_size,
        }
    }

    /// Pull a cleared buffer from the pool, allocating if none is idle.
    pub fn get(&self) -> Vec<u8> {
        #[allow(clippy::expect_used)]
        let mut free = self.free.lock().expect("lock poisoned");
        match free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::new(),
        }
    }

    /// Return a buffer; dropped on the floor when the pool is at capacity.
    pub fn put(&self, buf: Vec<u8>) {
        #[allow(clippy::expect_used)]
        let mut free = self.free.lock().expect("lock poisoned");
        if self.max_pool_size > 0 && free.len() >= self.max_pool_size {
            return;
        }
        free.push(buf);
    }

    pub fn idle_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.free.lock().expect("lock poisoned").len()
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_cleared_buffer() {
        let pool = BufferPool::new(4);
        let mut buf = pool.get();
        buf.extend_from_slice(b"some metrics");
        pool.put(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 12);
    }

    #[test]
    fn test_soft_cap_discards_surplus() {
        let pool = BufferPool::new(2);
        for _ in 0..5 {
            pool.put(Vec::new());
        }
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_unbounded_pool_keeps_everything() {
        let pool = BufferPool::new(0);
        for _ in 0..100 {
            pool.put(Vec::new());
        }
        assert_eq!(pool.idle_count(), 100);
    }

    #[test]
    fn test_reuse_order_is_lifo() {
        let pool = BufferPool::new(8);
        let mut a = pool.get();
        a.reserve(1024);
        let cap = a.capacity();
        pool.put(a);
        assert_eq!(pool.get().capacity(), cap);
    }
}
