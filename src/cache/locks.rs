use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Cache keys currently opened for writing by an in-flight transaction.
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key` for writing. Returns `None` when another transaction
    /// already holds it.
    pub fn try_acquire(&self, key: &str) -> Option<KeyLockGuard> {
        let mut held = self.held.lock();
        if !held.insert(key.to_string()) {
            return None;
        }
        Some(KeyLockGuard {
            locks: self.clone(),
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct KeyLockGuard {
    locks: KeyLocks,
    key: String,
}

impl KeyLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.key);
    }
}
