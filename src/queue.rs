//! Queue capability consumed by the processor

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::message::Message;

/// A queue backend.
///
/// The consumer engine drives backends only through this trait. Pull-style
/// backends implement `reserve`; push-style backends (like
/// [`MemQueue`](crate::memqueue::MemQueue)) return
/// [`Error::NotSupported`](crate::Error::NotSupported) from it and feed the
/// processor directly.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Queue name; used for slot-lock keys and log lines
    fn name(&self) -> &str;

    /// Lease up to `n` messages to this consumer.
    ///
    /// Returns [`Error::NotSupported`](crate::Error::NotSupported) when the
    /// backend only supports push delivery.
    async fn reserve(&self, n: usize) -> Result<Vec<Message>>;

    /// Return a reserved message for redelivery after `delay`.
    ///
    /// The backend increments the message's `reserved_count`.
    async fn release(&self, msg: &Message, delay: Duration) -> Result<()>;

    /// Permanently remove a batch of processed messages
    async fn delete_batch(&self, msgs: &[Message]) -> Result<()>;
}
