//! In-memory push-mode queue backend
//!
//! Messages added here skip reservation entirely: `add` feeds the embedded
//! processor's internal channel, `reserve` reports
//! [`Error::NotSupported`], releases are redelivered through a scheduled
//! re-add, and deletes are acknowledged by forgetting the message. Useful
//! for local development and as the backend the test suite runs the full
//! retry loop against.

use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::QueueOptions;
use crate::consumer::{Processor, Stats};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::queue::Queue;
use crate::storage::{LocalStorage, Storage};

/// Grace period used by [`MemQueue::close`]
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

struct MemQueueInner {
    name: String,
    storage: Arc<dyn Storage>,
    processor: OnceCell<Processor>,
}

impl MemQueueInner {
    fn processor(&self) -> Result<&Processor> {
        self.processor
            .get()
            .ok_or_else(|| Error::Coordination("queue processor is not wired".to_string()))
    }
}

#[async_trait]
impl Queue for MemQueueInner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reserve(&self, _n: usize) -> Result<Vec<Message>> {
        Err(Error::NotSupported)
    }

    async fn release(&self, msg: &Message, delay: Duration) -> Result<()> {
        let mut msg = msg.clone();
        msg.reserved_count += 1;
        msg.delay = Duration::ZERO;
        self.processor()?.add_delay(msg, delay).await
    }

    async fn delete_batch(&self, _msgs: &[Message]) -> Result<()> {
        Ok(())
    }
}

/// An in-process queue with an embedded, already-started consumer.
///
/// Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct MemQueue {
    inner: Arc<MemQueueInner>,
    processor: Processor,
}

impl MemQueue {
    /// Create the queue and start its consumer.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(mut opt: QueueOptions) -> Result<Self> {
        opt.init();

        let storage = opt
            .storage
            .clone()
            .unwrap_or_else(|| Arc::new(LocalStorage::new()) as Arc<dyn Storage>);

        let inner = Arc::new(MemQueueInner {
            name: opt.name.clone(),
            storage,
            processor: OnceCell::new(),
        });

        let processor = Processor::new(inner.clone() as Arc<dyn Queue>, opt)?;
        let _ = inner.processor.set(processor.clone());
        processor.start()?;

        Ok(Self { inner, processor })
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a message for processing.
    ///
    /// A message with a `name` already seen is rejected with
    /// [`Error::Duplicate`]. The message's own `delay` schedules delivery.
    pub async fn add(&self, msg: Message) -> Result<()> {
        if let Some(name) = &msg.name {
            let key = format!("{}:{}", self.inner.name, name);
            if self.inner.storage.exists(&key) {
                return Err(Error::Duplicate { name: name.clone() });
            }
        }

        let delay = msg.delay;
        let mut msg = msg;
        msg.delay = Duration::ZERO;
        self.processor.add_delay(msg, delay).await
    }

    /// The embedded consumer
    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    /// Counter snapshot of the embedded consumer
    pub fn stats(&self) -> Stats {
        self.processor.stats()
    }

    /// Wait for in-flight messages (including scheduled redeliveries) and
    /// stop the consumer
    pub async fn close(&self) -> Result<()> {
        self.close_timeout(CLOSE_TIMEOUT).await
    }

    /// [`MemQueue::close`] with an explicit grace period
    pub async fn close_timeout(&self, timeout: Duration) -> Result<()> {
        self.processor.stop_timeout(timeout).await
    }
}
