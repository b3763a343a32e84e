// Opaque numeric handles for in-process resources, guarded by one mutex.
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::core::error::{Error, ErrorKind};

type ReleaseFn<T, P, R> = dyn Fn(T, Option<&P>) -> R + Send + Sync;

/// Fixed-capacity table mapping `base + index` identifiers to live resources.
pub struct HandleTable<T, P = (), R = ()> {
    base: usize,
    callback: Box<ReleaseFn<T, P, R>>,
    slots: Mutex<Vec<Option<T>>>,
}

impl<T, P, R> HandleTable<T, P, R> {
    pub fn new<F>(base: usize, capacity: usize, callback: F) -> Result<Self, Error>
    where
        F: Fn(T, Option<&P>) -> R + Send + Sync + 'static,
    {
        if capacity == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("handle table needs capacity"));
        }
        if base.checked_add(capacity).is_none() {
            return Err(Error::new(ErrorKind::Usage).with_message("handle range overflows"));
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            base,
            callback: Box::new(callback),
            slots: Mutex::new(slots),
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn lock(&self) -> HandleGuard<'_, T, P, R> {
        HandleGuard {
            table: self,
            slots: self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    pub fn put(&self, item: T) -> Result<usize, Error> {
        self.lock().put_nolock(item)
    }

    pub fn get(&self, id: usize) -> Result<T, Error>
    where
        T: Clone,
    {
        self.lock().get_nolock(id).cloned()
    }

    pub fn release(&self, id: usize, invoke: bool, param: Option<&P>) -> Result<Option<R>, Error> {
        self.lock().release_nolock(id, invoke, param)
    }

    /// Releases every live handle through the callback.
    pub fn deinit(self) {
        drop(self);
    }

    fn index(&self, id: usize, len: usize) -> Result<usize, Error> {
        match id.checked_sub(self.base) {
            Some(index) if index < len => Ok(index),
            _ => Err(Error::new(ErrorKind::NotFound)
                .with_message(format!("handle {id:#x} is outside the table"))),
        }
    }
}

impl<T, P, R> Drop for HandleTable<T, P, R> {
    fn drop(&mut self) {
        let slots = self.slots.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut released = 0usize;
        for item in slots.iter_mut().filter_map(Option::take) {
            (self.callback)(item, None);
            released += 1;
        }
        if released > 0 {
            debug!(released, "handle table torn down with live handles");
        }
    }
}

/// Holds the table mutex; every `_nolock` operation goes through here.
pub struct HandleGuard<'a, T, P, R> {
    table: &'a HandleTable<T, P, R>,
    slots: MutexGuard<'a, Vec<Option<T>>>,
}

impl<T, P, R> HandleGuard<'_, T, P, R> {
    /// Stores `item` in the first empty slot.
    pub fn put_nolock(&mut self, item: T) -> Result<usize, Error> {
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            return Err(Error::new(ErrorKind::InternalLimit).with_message("handle table is full"));
        };
        self.slots[index] = Some(item);
        Ok(self.table.base + index)
    }

    pub fn get_nolock(&self, id: usize) -> Result<&T, Error> {
        let index = self.table.index(id, self.slots.len())?;
        self.slots[index].as_ref().ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("handle {id:#x} is not open"))
        })
    }

    pub fn get_mut_nolock(&mut self, id: usize) -> Result<&mut T, Error> {
        let index = self.table.index(id, self.slots.len())?;
        self.slots[index].as_mut().ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("handle {id:#x} is not open"))
        })
    }

    /// Empties the slot; the callback runs only when `invoke` is set and the slot was live.
    pub fn release_nolock(
        &mut self,
        id: usize,
        invoke: bool,
        param: Option<&P>,
    ) -> Result<Option<R>, Error> {
        let index = self.table.index(id, self.slots.len())?;
        let item = self.slots[index].take();
        Ok(match item {
            Some(item) if invoke => Some((self.table.callback)(item, param)),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
