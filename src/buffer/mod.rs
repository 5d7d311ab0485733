//! Buffer Manager — pooled, typed buffers for hot paths (binding rows,
//! scan scratch space, term-byte staging) that would otherwise
//! allocate and free on every call.
//!
//! Buffers are bucketed by `(type, capacity)`. Renting pops a buffer
//! from the matching bucket or allocates a fresh one; dropping the
//! returned [`Lease`] clears and returns it to the bucket. A lease can
//! also be released explicitly with [`Lease::release`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct BufferManagerOptions {
    /// Buffers are never rented smaller than this, rounded up to the
    /// next power of two, to keep the number of distinct buckets small.
    pub min_capacity: usize,
}

impl Default for BufferManagerOptions {
    fn default() -> Self {
        Self { min_capacity: 64 }
    }
}

type Bucket = Vec<Box<dyn Any + Send>>;

/// A pool of reusable `Vec<T>` buffers, bucketed by element type and
/// capacity.
pub struct BufferManager {
    buckets: Mutex<HashMap<(TypeId, usize), Bucket>>,
    options: BufferManagerOptions,
}

impl BufferManager {
    pub fn new(options: BufferManagerOptions) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            options,
        }
    }

    /// Rent a `Vec<T>` with capacity at least `min_len`. The returned
    /// buffer is always empty (`len() == 0`); callers push/extend as
    /// needed.
    pub fn rent<T: Send + 'static>(&self, min_len: usize) -> Lease<'_, T> {
        let capacity = min_len.max(self.options.min_capacity).next_power_of_two();
        let key = (TypeId::of::<T>(), capacity);

        let buf = {
            let mut buckets = self.buckets.lock();
            let bucket = buckets.entry(key).or_default();
            match bucket.pop() {
                Some(boxed) => *boxed
                    .downcast::<Vec<T>>()
                    .expect("buffer pool bucket held the wrong element type"),
                None => Vec::with_capacity(capacity),
            }
        };

        Lease {
            buf: Some(buf),
            capacity,
            manager: self,
            _marker: PhantomData,
        }
    }

    fn reclaim<T: Send + 'static>(&self, capacity: usize, mut buf: Vec<T>) {
        buf.clear();
        let key = (TypeId::of::<T>(), capacity);
        self.buckets.lock().entry(key).or_default().push(Box::new(buf));
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new(BufferManagerOptions::default())
    }
}

/// A rented `Vec<T>`. Not `Clone`, not `Copy` — a lease represents
/// exclusive ownership of one pooled buffer until it is dropped or
/// explicitly [`release`](Lease::release)d.
pub struct Lease<'a, T: Send + 'static> {
    buf: Option<Vec<T>>,
    capacity: usize,
    manager: &'a BufferManager,
    _marker: PhantomData<T>,
}

impl<'a, T: Send + 'static> Lease<'a, T> {
    /// Return the buffer to its pool now, rather than waiting for drop.
    pub fn release(mut self) {
        debug_assert!(self.buf.is_some(), "buffer lease released twice");
        if let Some(buf) = self.buf.take() {
            self.manager.reclaim(self.capacity, buf);
        }
    }
}

impl<'a, T: Send + 'static> std::ops::Deref for Lease<'a, T> {
    type Target = Vec<T>;
    fn deref(&self) -> &Vec<T> {
        self.buf.as_ref().expect("buffer lease used after release")
    }
}

impl<'a, T: Send + 'static> std::ops::DerefMut for Lease<'a, T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        self.buf.as_mut().expect("buffer lease used after release")
    }
}

impl<'a, T: Send + 'static> Drop for Lease<'a, T> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.manager.reclaim(self.capacity, buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_returns_empty_buffer() {
        let mgr = BufferManager::default();
        let lease: Lease<'_, u8> = mgr.rent(128);
        assert_eq!(lease.len(), 0);
    }

    #[test]
    fn test_buffer_reused_after_release() {
        let mgr = BufferManager::default();
        {
            let mut lease: Lease<'_, u64> = mgr.rent(16);
            lease.push(1);
            lease.push(2);
        } // dropped, returned to pool

        let lease: Lease<'_, u64> = mgr.rent(16);
        assert_eq!(lease.capacity(), lease.capacity().max(16));
        assert_eq!(lease.len(), 0);
    }

    #[test]
    fn test_explicit_release() {
        let mgr = BufferManager::default();
        let lease: Lease<'_, u8> = mgr.rent(64);
        lease.release();
    }

    #[test]
    fn test_distinct_types_do_not_share_buckets() {
        let mgr = BufferManager::default();
        let byte_lease: Lease<'_, u8> = mgr.rent(64);
        let wide_lease: Lease<'_, u64> = mgr.rent(64);
        assert_eq!(byte_lease.len(), 0);
        assert_eq!(wide_lease.len(), 0);
    }
}
