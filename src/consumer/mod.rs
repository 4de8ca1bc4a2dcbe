//! Consumer engine
//!
//! Composes the fetcher pool, the worker pool, the deletion batcher, the
//! pause controller, the adaptive tuner, and the cross-process slot
//! coordinator into one processor with at-least-once semantics and
//! graceful shutdown.

mod backoff;
mod batcher;
mod processor;
mod slots;
mod tuner;

pub use processor::{Processor, Stats};
