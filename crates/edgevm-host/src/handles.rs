//! Small-integer handles for host objects.
//!
//! Guests cannot hold host references, so SDK factories hand out `u32`
//! handles instead. Ids increase monotonically from 1 and are never
//! reused, so a stale handle can only miss, never alias a newer object.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::codec::Errno;

/// Map of live objects by handle.
#[derive(Debug)]
pub struct HandleArena<T> {
    inner: RwLock<Arena<T>>,
}

#[derive(Debug)]
struct Arena<T> {
    next: u32,
    items: HashMap<u32, Arc<T>>,
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleArena<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arena {
                next: 1,
                items: HashMap::new(),
            }),
        }
    }

    /// Store `item` under a fresh handle.
    ///
    /// # Errors
    ///
    /// Returns [`Errno::HandlesExhausted`] once every id has been issued.
    pub fn insert(&self, item: T) -> Result<u32, Errno> {
        let mut arena = self.inner.write();
        let id = arena.next;
        arena.next = id.checked_add(1).ok_or(Errno::HandlesExhausted)?;
        arena.items.insert(id, Arc::new(item));
        Ok(id)
    }

    /// # Errors
    ///
    /// Returns [`Errno::HandleNotFound`] for unknown or removed handles.
    pub fn get(&self, id: u32) -> Result<Arc<T>, Errno> {
        self.inner
            .read()
            .items
            .get(&id)
            .cloned()
            .ok_or(Errno::HandleNotFound)
    }

    /// # Errors
    ///
    /// Returns [`Errno::HandleNotFound`] for unknown or removed handles.
    pub fn remove(&self, id: u32) -> Result<Arc<T>, Errno> {
        self.inner
            .write()
            .items
            .remove(&id)
            .ok_or(Errno::HandleNotFound)
    }

    /// Remove and return every live object. Issued ids stay retired.
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.inner
            .write()
            .items
            .drain()
            .map(|(_, item)| item)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().items.is_empty()
    }
}
