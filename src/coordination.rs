//! Shared-lock and pub/sub capabilities backing the worker-slot coordinator
//!
//! The consumer engine only talks to these traits. The in-memory
//! implementations here carry the reference semantics (TTL expiry,
//! fan-out delivery) and let the cross-process slot invariants be
//! exercised by tests without an external service.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::Result;

/// Cross-process mutual exclusion with TTL leases.
///
/// `try_lock` is non-blocking: it either acquires the key for `ttl` or
/// reports that another holder exists. A crashed holder is recovered when
/// its lease expires.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Attempt to acquire `key` for `ttl`. Returns `true` on success.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Release `key`. Releasing an unheld key is not an error.
    async fn unlock(&self, key: &str) -> Result<()>;
}

/// Fan-out pub/sub channel.
///
/// Every subscriber of a topic observes every publish made after its
/// subscription.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Publish `payload` to `topic`
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;

    /// Subscribe to `topic`; the receiver yields payloads in publish order
    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<String>>;
}

/// In-process [`LockService`] with TTL leases.
///
/// Share one instance (via `Arc`) between consumers to emulate a fleet.
#[derive(Default)]
pub struct InMemoryLockService {
    leases: Mutex<HashMap<String, Instant>>,
}

impl InMemoryLockService {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock();
        let now = Instant::now();
        match leases.get(key) {
            Some(expiry) if *expiry > now => Ok(false),
            _ => {
                leases.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.leases.lock().remove(key);
        Ok(())
    }
}

/// In-process fan-out [`SignalBus`]
#[derive(Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl InMemoryBus {
    /// Create a bus with no topics
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
