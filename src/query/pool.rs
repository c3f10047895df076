//! Coarse-locked object pools
//!
//! Pools here are a latency and footprint optimization, not a
//! correctness mechanism: a pool that always allocates fresh values is
//! valid. Idle entries are capped so one outlier query cannot pin an
//! unbounded amount of buffer memory.

use parking_lot::Mutex;

/// A bag of reusable values guarded by one mutex.
///
/// Callers reset values before returning them; the pool itself only
/// stores and caps.
pub(crate) struct Pool<T> {
    items: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T> Pool<T> {
    /// Create a pool keeping at most `max_idle` idle entries.
    pub(crate) const fn new(max_idle: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Take a pooled value, or build one with `make`.
    pub(crate) fn get_or_else(&self, make: impl FnOnce() -> T) -> T {
        let pooled = self.items.lock().pop();
        pooled.unwrap_or_else(make)
    }

    /// Return a value to the pool. Dropped silently when the pool is at
    /// its idle cap.
    pub(crate) fn put(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() < self.max_idle {
            items.push(item);
        }
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.items.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_reuses() {
        let pool: Pool<Vec<u8>> = Pool::new(4);
        let mut v = pool.get_or_else(Vec::new);
        v.push(7);
        v.clear();
        pool.put(v);
        assert_eq!(pool.idle(), 1);
        let v2 = pool.get_or_else(|| panic!("should reuse"));
        assert!(v2.is_empty());
        assert!(v2.capacity() > 0);
    }

    #[test]
    fn test_idle_cap() {
        let pool: Pool<u32> = Pool::new(2);
        pool.put(1);
        pool.put(2);
        pool.put(3);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_fresh_allocation_when_empty() {
        let pool: Pool<u32> = Pool::new(2);
        assert_eq!(pool.get_or_else(|| 42), 42);
    }
}
