//! Side-state capability used for named-message dedup

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// Remembers dedup keys for named messages.
///
/// `exists` must atomically record the key and report whether it had been
/// seen before, so that two concurrent adds of the same name race to a
/// single winner.
pub trait Storage: Send + Sync {
    /// Record `key` and return whether it was already present
    fn exists(&self, key: &str) -> bool;
}

const LOCAL_STORAGE_CAP: usize = 128_000;

/// In-process [`Storage`] bounded to the most recent 128k keys
#[derive(Default)]
pub struct LocalStorage {
    inner: Mutex<LocalStorageInner>,
}

#[derive(Default)]
struct LocalStorageInner {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl LocalStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for LocalStorage {
    fn exists(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.keys.contains(key) {
            return true;
        }

        if inner.order.len() >= LOCAL_STORAGE_CAP {
            if let Some(oldest) = inner.order.pop_front() {
                inner.keys.remove(&oldest);
            }
        }
        inner.keys.insert(key.to_string());
        inner.order.push_back(key.to_string());
        false
    }
}
