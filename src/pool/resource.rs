//! Generic FIFO resource pool
//!
//! A size-bounded queue of opaque items with background maintenance.
//! Items enter at the tail and leave from the head, so under steady load
//! the pool cycles through its contents and idle items age toward expiry.

use crate::error::ConfigError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Lifecycle callbacks for pooled items.
///
/// `init` and `close` are invoked outside the pool lock; `is_expired` runs
/// during the maintenance walk and must not block.
pub trait ResourceHooks<T>: Send + Sync {
    /// Build a fresh item for the pool. `None` aborts the current refill.
    fn init(&self) -> Option<T>;

    /// Expiry predicate consulted by maintenance.
    fn is_expired(&self, item: &T) -> bool;

    /// Dispose of an item leaving the pool.
    fn close(&self, item: T);
}

/// Sizing and cadence options for a [`ResourcePool`].
#[derive(Debug, Clone)]
pub struct ResourcePoolOptions {
    /// Refill target for maintenance
    pub min_size: u64,
    /// Bound on held + checked-out items
    pub max_size: u64,
    /// Cadence of the background maintenance pass
    pub maintain_interval: Duration,
}

struct PoolInner<T> {
    items: VecDeque<T>,
    /// Items held plus items currently checked out
    total_size: u64,
    closed: bool,
}

/// FIFO container of opaque resources with size bounds.
///
/// Invariants: `size <= total_size <= max_size`. The expiry predicate is
/// not evaluated on `get`; stale items are filtered by [`maintain`]
/// (ResourcePool::maintain) and by the caller on checkout.
pub struct ResourcePool<T> {
    options: ResourcePoolOptions,
    hooks: Box<dyn ResourceHooks<T>>,
    inner: Mutex<PoolInner<T>>,
}

impl<T: Send> ResourcePool<T> {
    /// Create an empty pool. Rejects `min_size > max_size`.
    pub fn new(
        options: ResourcePoolOptions,
        hooks: Box<dyn ResourceHooks<T>>,
    ) -> Result<Self, ConfigError> {
        if options.min_size > options.max_size {
            return Err(ConfigError::InvalidPoolSize(
                "min_size cannot be greater than max_size".to_string(),
            ));
        }

        Ok(ResourcePool {
            options,
            hooks,
            inner: Mutex::new(PoolInner {
                items: VecDeque::new(),
                total_size: 0,
                closed: false,
            }),
        })
    }

    /// Items currently held in the queue.
    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().items.len() as u64
    }

    /// Items held plus items checked out.
    pub fn total_size(&self) -> u64 {
        self.inner.lock().unwrap().total_size
    }

    /// Cadence for the caller-driven maintenance loop.
    pub fn maintain_interval(&self) -> Duration {
        self.options.maintain_interval
    }

    /// Enqueue an item at the tail. Returns false if the pool has shut
    /// down, in which case the item is closed. `total_size` is untouched:
    /// callers accounted for the item when they took it out.
    pub fn put(&self, item: T) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.closed {
                inner.items.push_back(item);
                return true;
            }
        }
        self.hooks.close(item);
        false
    }

    /// Dequeue from the head. Returns `None` when empty.
    pub fn get(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    /// Reserve accounting for an item that will live outside the queue.
    /// Fails when the reservation would exceed `max_size` or the pool has
    /// shut down.
    pub fn increment_total(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed || inner.total_size >= self.options.max_size {
            return false;
        }
        inner.total_size += 1;
        true
    }

    /// Release accounting for an item that left the pool for good.
    pub fn decrement_total(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_size = inner.total_size.saturating_sub(1);
    }

    /// One maintenance pass: evict expired items preserving FIFO order for
    /// survivors, then refill up to `min_size`. Close callbacks run after
    /// the lock is released; a failed `init` aborts the refill for this
    /// pass without blocking the pool.
    pub fn maintain(&self) {
        let evicted = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }

            let mut evicted = Vec::new();
            let mut survivors = VecDeque::with_capacity(inner.items.len());
            while let Some(item) = inner.items.pop_front() {
                if self.hooks.is_expired(&item) {
                    evicted.push(item);
                } else {
                    survivors.push_back(item);
                }
            }
            inner.items = survivors;
            inner.total_size = inner.total_size.saturating_sub(evicted.len() as u64);
            evicted
        };

        for item in evicted {
            self.hooks.close(item);
        }

        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed || inner.total_size >= self.options.min_size {
                    return;
                }
                inner.total_size += 1;
            }

            match self.hooks.init() {
                Some(item) => {
                    let leftover = {
                        let mut inner = self.inner.lock().unwrap();
                        if inner.closed {
                            inner.total_size -= 1;
                            Some(item)
                        } else {
                            inner.items.push_back(item);
                            None
                        }
                    };
                    if let Some(item) = leftover {
                        self.hooks.close(item);
                        return;
                    }
                }
                None => {
                    self.inner.lock().unwrap().total_size -= 1;
                    return;
                }
            }
        }
    }

    /// Mark the pool closed, drain the queue, and close every held item.
    /// Further `put` calls are refused.
    pub fn close(&self) {
        let drained: Vec<T> = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            let drained: Vec<T> = inner.items.drain(..).collect();
            inner.total_size = inner.total_size.saturating_sub(drained.len() as u64);
            drained
        };

        for item in drained {
            self.hooks.close(item);
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}
