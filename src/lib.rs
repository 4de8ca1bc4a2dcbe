//! Distributed task-queue consumer engine.
//!
//! relayq reserves messages from a queue backend, executes user handlers
//! against them, and releases or deletes them according to success, retry,
//! and rate-limit outcomes. The engine adapts its fetcher and worker
//! counts to observed throughput and can bound concurrent execution per
//! worker slot across a fleet through a shared lock service.
//!
//! # Example
//!
//! ```no_run
//! use relayq::{HandlerFn, MemQueue, Message, QueueOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> relayq::Result<()> {
//! let handler = Arc::new(HandlerFn::new(|msg: &Message| {
//!     let bytes = msg.payload.len();
//!     async move {
//!         tracing::info!("handled {} bytes", bytes);
//!         Ok(())
//!     }
//! }));
//!
//! let queue = MemQueue::new(QueueOptions::new("emails", handler))?;
//! queue.add(Message::new(b"hello".to_vec())).await?;
//! queue.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Pull-style backends implement the [`Queue`] trait; the engine drives
//! them with a [`Processor`] directly:
//!
//! ```no_run
//! # use relayq::{HandlerFn, Message, Processor, Queue, QueueOptions};
//! # use std::sync::Arc;
//! # async fn example(backend: Arc<dyn Queue>) -> relayq::Result<()> {
//! # let handler = Arc::new(HandlerFn::new(|_msg: &Message| async { Ok(()) }));
//! let processor = Processor::new(backend, QueueOptions::new("orders", handler))?;
//! processor.start()?;
//! // ...
//! processor.stop().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

pub use config::QueueOptions;
pub use consumer::{Processor, Stats};
pub use coordination::{InMemoryBus, InMemoryLockService, LockService, SignalBus};
pub use error::{Error, Result};
pub use handler::{Handler, HandlerError, HandlerFn};
pub use memqueue::MemQueue;
pub use message::Message;
pub use queue::Queue;
pub use ratelimit::{RateLimit, RateLimiter};
pub use storage::{LocalStorage, Storage};

/// Consumer configuration
pub mod config;

/// Consumer engine: processor, batcher, tuner, slot coordinator
pub mod consumer;

/// Shared-lock and pub/sub capabilities
pub mod coordination;

/// Error types
pub mod error;

/// Handler trait and closure adapters
pub mod handler;

/// In-memory push-mode queue backend
pub mod memqueue;

/// Message type
pub mod message;

/// Queue backend capability
pub mod queue;

/// Rate-limiter capability
pub mod ratelimit;

/// Dedup storage capability
pub mod storage;
