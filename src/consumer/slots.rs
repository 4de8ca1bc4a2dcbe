//! Cross-process worker-slot coordination
//!
//! Each worker slot `i` maps to the shared-lock key
//! `"<queue>:worker-lock:<i>"`; at most one handler across the fleet holds
//! it at a time. Releases are announced on the `"<queue>:worker-free"`
//! topic so waiters retry immediately instead of polling; a bounded retry
//! timeout covers lost announcements.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::coordination::{LockService, SignalBus};

/// Liveness fallback when a `worker-free` wake-up is lost
const LOCK_RETRY_TIMEOUT: Duration = Duration::from_millis(1234);

pub(crate) struct WorkerSlots {
    queue_name: String,
    ttl: Duration,
    locks: Arc<dyn LockService>,
    bus: Option<Arc<dyn SignalBus>>,
    wakes: Vec<Notify>,
}

impl WorkerSlots {
    pub(crate) fn new(
        queue_name: impl Into<String>,
        slot_count: usize,
        ttl: Duration,
        locks: Arc<dyn LockService>,
        bus: Option<Arc<dyn SignalBus>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue_name: queue_name.into(),
            ttl,
            locks,
            bus,
            wakes: (0..slot_count).map(|_| Notify::new()).collect(),
        })
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.wakes.len()
    }

    fn lock_key(&self, slot: usize) -> String {
        format!("{}:worker-lock:{}", self.queue_name, slot)
    }

    fn free_topic(&self) -> String {
        format!("{}:worker-free", self.queue_name)
    }

    /// Acquire the shared lock for `slot`.
    ///
    /// Retries until acquired, waking early on a `worker-free` token. A
    /// lock-service failure is logged and treated as acquired: skipping
    /// exclusion beats deadlocking the worker on a broken backend.
    pub(crate) async fn lock(&self, slot: usize) {
        let key = self.lock_key(slot);
        loop {
            match self.locks.try_lock(&key, self.ttl).await {
                Ok(true) => return,
                Ok(false) => {
                    let _ =
                        tokio::time::timeout(LOCK_RETRY_TIMEOUT, self.wakes[slot].notified())
                            .await;
                }
                Err(err) => {
                    warn!("slot lock {} failed: {}", key, err);
                    return;
                }
            }
        }
    }

    /// Release the shared lock for `slot` and announce the free slot
    pub(crate) async fn unlock(&self, slot: usize) {
        let key = self.lock_key(slot);
        if let Err(err) = self.locks.unlock(&key).await {
            warn!("slot unlock {} failed: {}", key, err);
        }

        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish(&self.free_topic(), slot.to_string()).await {
                warn!("worker-free publish for slot {} failed: {}", slot, err);
            }
        }
    }

    /// Deliver `worker-free` announcements to the local wake slots.
    ///
    /// One pending wake per slot is enough; `Notify` collapses extras.
    pub(crate) fn spawn_wake_reader(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let bus = self.bus.clone()?;
        let slots = Arc::clone(self);
        Some(tokio::spawn(async move {
            let topic = slots.free_topic();
            let mut rx = match bus.subscribe(&topic).await {
                Ok(rx) => rx,
                Err(err) => {
                    warn!("subscribe to {} failed: {}", topic, err);
                    return;
                }
            };

            while let Some(payload) = rx.recv().await {
                match payload.parse::<usize>() {
                    Ok(slot) if slot < slots.slot_count() => slots.wakes[slot].notify_one(),
                    _ => warn!("invalid worker-free payload {:?}", payload),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{InMemoryBus, InMemoryLockService};
    use tokio::time::Instant;

    fn fleet() -> (Arc<InMemoryLockService>, Arc<InMemoryBus>) {
        (
            Arc::new(InMemoryLockService::new()),
            Arc::new(InMemoryBus::new()),
        )
    }

    #[tokio::test]
    async fn test_lock_key_shape_is_stable() {
        let (locks, bus) = fleet();
        let slots = WorkerSlots::new(
            "orders",
            4,
            Duration::from_secs(30),
            locks.clone(),
            Some(bus),
        );

        slots.lock(2).await;
        // The key format is fleet interop surface; other processes compute
        // the same string.
        assert!(!locks
            .try_lock("orders:worker-lock:2", Duration::from_secs(1))
            .await
            .unwrap());
        slots.unlock(2).await;
        assert!(locks
            .try_lock("orders:worker-lock:2", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_contended_slot_waits_for_unlock() {
        let (locks, bus) = fleet();
        let a = WorkerSlots::new(
            "orders",
            2,
            Duration::from_secs(30),
            locks.clone(),
            Some(bus.clone()),
        );
        let b = WorkerSlots::new(
            "orders",
            2,
            Duration::from_secs(30),
            locks,
            Some(bus),
        );
        let _reader = b.spawn_wake_reader().unwrap();

        a.lock(0).await;

        let waiter = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                b.lock(0).await;
                Instant::now()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let released_at = Instant::now();
        a.unlock(0).await;

        let acquired_at = waiter.await.unwrap();
        assert!(acquired_at >= released_at);
        // The wake should beat the retry-timeout fallback comfortably.
        assert!(acquired_at - released_at < LOCK_RETRY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_unlock_announces_slot_index() {
        let (locks, bus) = fleet();
        let mut rx = bus.subscribe("orders:worker-free").await.unwrap();
        let slots = WorkerSlots::new("orders", 4, Duration::from_secs(30), locks, Some(bus));

        slots.lock(3).await;
        slots.unlock(3).await;

        assert_eq!(rx.recv().await.as_deref(), Some("3"));
    }
}
