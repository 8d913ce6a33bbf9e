//! Owned tileable handles.
//!
//! A session counts the handles it gave out per tileable. Releasing the last
//! one decrefs the tileable on the tracker. A handle dropped without
//! `release` only queues its key; the session flushes the queue at its next
//! `execute`, `fetch` or `destroy`.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

use common::{Tileable, TileableKey};

use crate::error::SessionError;
use crate::session::SessionInner;

#[derive(Debug, Default)]
pub struct HandleRegistry {
    owned: Mutex<HashMap<TileableKey, usize>>,
    pending: Mutex<Vec<TileableKey>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HandleRegistry {
    pub fn acquire(&self, key: &TileableKey) {
        *lock(&self.owned).entry(key.clone()).or_insert(0) += 1;
    }

    /// Returns true when the last handle of `key` went away.
    pub fn drop_one(&self, key: &TileableKey) -> bool {
        let mut owned = lock(&self.owned);
        match owned.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                owned.remove(key);
                true
            }
            None => false,
        }
    }

    pub fn owned_count(&self, key: &TileableKey) -> usize {
        lock(&self.owned).get(key).copied().unwrap_or(0)
    }

    pub fn enqueue(&self, key: TileableKey) {
        lock(&self.pending).push(key);
    }

    pub fn take_pending(&self) -> Vec<TileableKey> {
        std::mem::take(&mut *lock(&self.pending))
    }
}

/// Keeps a tileable's results alive until released.
pub struct TileableHandle {
    tileable: Tileable,
    session: Weak<SessionInner>,
    released: bool,
}

impl TileableHandle {
    pub(crate) fn new(tileable: Tileable, session: Weak<SessionInner>) -> Self {
        Self {
            tileable,
            session,
            released: false,
        }
    }

    pub fn tileable(&self) -> &Tileable {
        &self.tileable
    }

    /// Gives up this handle; decrefs the tileable if it was the last one.
    pub async fn release(mut self) -> Result<(), SessionError> {
        self.released = true;
        match self.session.upgrade() {
            Some(session) => session.release_owned(self.tileable.key()).await,
            None => Ok(()),
        }
    }
}

impl Deref for TileableHandle {
    type Target = Tileable;

    fn deref(&self) -> &Tileable {
        &self.tileable
    }
}

impl Drop for TileableHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(session) = self.session.upgrade()
            && session.handles.drop_one(self.tileable.key())
        {
            session.handles.enqueue(self.tileable.key().clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_drop_is_reported_once() {
        let registry = HandleRegistry::default();
        let key = TileableKey::from("t");
        registry.acquire(&key);
        registry.acquire(&key);
        assert_eq!(registry.owned_count(&key), 2);
        assert!(!registry.drop_one(&key));
        assert!(registry.drop_one(&key));
        assert!(!registry.drop_one(&key));
        assert_eq!(registry.owned_count(&key), 0);
    }

    #[test]
    fn test_pending_queue_drains() {
        let registry = HandleRegistry::default();
        registry.enqueue(TileableKey::from("a"));
        registry.enqueue(TileableKey::from("b"));
        assert_eq!(registry.take_pending().len(), 2);
        assert!(registry.take_pending().is_empty());
    }
}
