//! Message type shared by producers, queue backends, and the consumer

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unit of work flowing through a queue.
///
/// A message is created by a producer, reserved by exactly one consumer for
/// a lease window, and then either released back (with an increased delay)
/// or deleted. `reserved_count` grows by one on every release/redelivery
/// and never decreases.
#[derive(Debug, Clone)]
pub struct Message {
    /// Opaque identifier, unique within the queue
    pub id: String,
    /// Optional dedup key; adds with a name already seen are dropped
    pub name: Option<String>,
    /// Opaque payload bytes; encoding is the handler's business
    pub payload: Vec<u8>,
    /// Time until the message becomes eligible for processing
    pub delay: Duration,
    /// Number of times the message has been released for redelivery
    pub reserved_count: u32,
}

impl Message {
    /// Create a message with the given payload
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: format!("msg-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            name: None,
            payload: payload.into(),
            delay: Duration::ZERO,
            reserved_count: 0,
        }
    }

    /// Set a dedup name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set an initial delivery delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}
