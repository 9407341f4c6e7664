//! Reusable allocations for the dispatcher read path.
//!
//! Each dispatcher reads socket bytes into a scratch buffer taken from a shared
//! [`ObjectPool`] before handing them to the connection's framing buffer, so
//! steady-state reads do not allocate.

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use parking_lot::Mutex;

type Recycle<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

/// A thread-safe pool of reusable objects.
///
/// Objects are created lazily when the pool is empty. Returned objects are run
/// through the recycle hook and kept only while the pool holds fewer than
/// `capacity` objects.
pub struct ObjectPool<T> {
    pool: Arc<Mutex<VecDeque<T>>>,
    create_fn: Arc<dyn Fn() -> T + Send + Sync>,
    recycle_fn: Option<Recycle<T>>,
    capacity: usize,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            create_fn: Arc::clone(&self.create_fn),
            recycle_fn: self.recycle_fn.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Send + 'static> ObjectPool<T> {
    pub fn new<F>(initial_size: usize, create_fn: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let pool = (0..initial_size).map(|_| create_fn()).collect();
        Self {
            pool: Arc::new(Mutex::new(pool)),
            create_fn: Arc::new(create_fn),
            recycle_fn: None,
            capacity: initial_size,
        }
    }

    /// Sets a hook that restores an object to its initial shape before it is
    /// handed out again.
    pub fn with_recycle<R>(mut self, recycle_fn: R) -> Self
    where
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        self.recycle_fn = Some(Arc::new(recycle_fn));
        self
    }

    #[inline]
    pub fn acquire(&self) -> PooledObject<T> {
        let object = self
            .pool
            .lock()
            .pop_front()
            .unwrap_or_else(|| (self.create_fn)());

        PooledObject {
            object: Some(object),
            pool: Arc::clone(&self.pool),
            recycle_fn: self.recycle_fn.clone(),
            capacity: self.capacity,
        }
    }

    pub fn available(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Pool of fixed-size receive buffers shared by the dispatchers.
pub(crate) fn receive_buffers(count: usize, size: usize) -> ObjectPool<Vec<u8>> {
    ObjectPool::new(count, move || vec![0u8; size]).with_recycle(move |buf| {
        if buf.len() != size {
            buf.resize(size, 0);
        }
    })
}

/// Guard returning its object to the pool on drop.
pub struct PooledObject<T> {
    // only emptied by Drop
    object: Option<T>,
    pool: Arc<Mutex<VecDeque<T>>>,
    recycle_fn: Option<Recycle<T>>,
    capacity: usize,
}

impl<T> Deref for PooledObject<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.object.as_ref().expect("pooled object accessed after drop")
    }
}

impl<T> DerefMut for PooledObject<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object.as_mut().expect("pooled object accessed after drop")
    }
}

impl<T> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(mut object) = self.object.take() {
            if let Some(recycle) = &self.recycle_fn {
                recycle(&mut object);
            }
            let mut pool = self.pool.lock();
            if pool.len() < self.capacity {
                pool.push_back(object);
            }
        }
    }
}
