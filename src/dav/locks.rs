//! Advisory WebDAV lock bookkeeping
//!
//! Tokens are handed out and reported back in PROPFIND, nothing else checks
//! them. Locks never expire.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Path → lock token
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    locks: Arc<Mutex<HashMap<String, String>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token for `path`, replacing any earlier one
    pub fn lock(&self, path: &str) -> String {
        let token = Uuid::new_v4().to_string();
        let previous = self.locks.lock().insert(path.to_string(), token.clone());
        tracing::debug!(path, replaced = previous.is_some(), "Issued lock {}", token);
        token
    }

    /// Forget any lock on `path`; true if one existed
    pub fn unlock(&self, path: &str) -> bool {
        self.locks.lock().remove(path).is_some()
    }

    pub fn token(&self, path: &str) -> Option<String> {
        self.locks.lock().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_overwrites() {
        let table = LockTable::new();
        let first = table.lock("/a.txt");
        let second = table.lock("/a.txt");

        assert_ne!(first, second);
        assert_eq!(table.token("/a.txt"), Some(second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unlock_idempotent() {
        let table = LockTable::new();
        table.lock("/a.txt");

        assert!(table.unlock("/a.txt"));
        assert!(!table.unlock("/a.txt"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let table = LockTable::new();
        let other = table.clone();
        other.lock("/x");
        assert!(table.token("/x").is_some());
    }
}
