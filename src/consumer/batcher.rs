//! Coalesces deletions into bounded batches

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::warn;

use crate::message::Message;

/// Callback invoked with each flushed batch
pub(crate) type FlushFn = Arc<dyn Fn(Vec<Message>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A pending batch older than this is flushed even if not full
const FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

enum Op {
    Add(Message),
    Flush(oneshot::Sender<()>),
}

/// Accepts messages one at a time and flushes them in bounded batches.
///
/// A batch is flushed when it reaches `limit` messages, when the idle
/// timeout elapses, or when [`Batcher::wait`] is called. `add` never blocks
/// the caller; `wait` resolves only after every previously added message
/// has been flushed and the callback returned.
pub(crate) struct Batcher {
    tx: mpsc::UnboundedSender<Op>,
}

impl Batcher {
    pub(crate) fn new(limit: usize, flush: FlushFn) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(limit.max(1), rx, flush));
        Self { tx }
    }

    /// Queue a message for batched deletion
    pub(crate) fn add(&self, msg: Message) {
        if self.tx.send(Op::Add(msg)).is_err() {
            warn!("batcher task is gone, dropping delete");
        }
    }

    /// Flush the pending batch and wait for everything added so far
    pub(crate) async fn wait(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Op::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn run(limit: usize, mut rx: mpsc::UnboundedReceiver<Op>, flush: FlushFn) {
    let mut pending: Vec<Message> = Vec::new();
    loop {
        let op = if pending.is_empty() {
            match rx.recv().await {
                Some(op) => op,
                None => break,
            }
        } else {
            match timeout(FLUSH_TIMEOUT, rx.recv()).await {
                Ok(Some(op)) => op,
                Ok(None) => break,
                Err(_) => {
                    flush(std::mem::take(&mut pending)).await;
                    continue;
                }
            }
        };

        match op {
            Op::Add(msg) => {
                pending.push(msg);
                if pending.len() >= limit {
                    flush(std::mem::take(&mut pending)).await;
                }
            }
            Op::Flush(ack) => {
                if !pending.is_empty() {
                    flush(std::mem::take(&mut pending)).await;
                }
                let _ = ack.send(());
            }
        }
    }

    if !pending.is_empty() {
        flush(std::mem::take(&mut pending)).await;
    }
}
