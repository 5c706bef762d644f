//! Bounded handle pool
//!
//! Every operation against the database file, query traffic and repair work
//! alike, goes through one process-wide pool of handles with a fixed
//! capacity. `acquire` blocks until a slot frees, so concurrency is bounded
//! and handle count never grows without limit.
//!
//! A handle grants access to the store under single-writer /
//! multiple-reader discipline; the slot is released when the guard drops.

use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::engine::TableStore;

/// Capacity-bounded pool over the shared store
pub struct HandlePool {
    store: Arc<RwLock<TableStore>>,
    capacity: usize,
    in_use: Mutex<usize>,
    freed: Condvar,
}

impl HandlePool {
    pub fn new(store: TableStore, capacity: usize) -> HandlePool {
        HandlePool {
            store: Arc::new(RwLock::new(store)),
            capacity: capacity.max(1),
            in_use: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Handles currently checked out
    pub fn in_use(&self) -> usize {
        *lock_clean(&self.in_use)
    }

    /// Acquire a handle, blocking until capacity allows
    pub fn acquire(&self) -> PooledHandle<'_> {
        let mut in_use = lock_clean(&self.in_use);
        while *in_use >= self.capacity {
            in_use = self
                .freed
                .wait(in_use)
                .unwrap_or_else(|e| e.into_inner());
        }
        *in_use += 1;
        PooledHandle { pool: self }
    }
}

fn lock_clean<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A checked-out handle; the slot frees on drop
pub struct PooledHandle<'a> {
    pool: &'a HandlePool,
}

impl PooledHandle<'_> {
    /// Shared read access to the store
    pub fn read(&self) -> RwLockReadGuard<'_, TableStore> {
        self.pool.store.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Exclusive write access to the store
    pub fn write(&self) -> RwLockWriteGuard<'_, TableStore> {
        self.pool.store.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for PooledHandle<'_> {
    fn drop(&mut self) {
        let mut in_use = lock_clean(&self.pool.in_use);
        *in_use -= 1;
        self.pool.freed.notify_one();
    }
}
