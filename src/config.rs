//! Consumer configuration

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::coordination::{LockService, SignalBus};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::ratelimit::{RateLimit, RateLimiter};
use crate::storage::Storage;

const DEFAULT_MAX_FETCHERS: usize = 8;
const DEFAULT_BUFFER_SIZE: usize = 100;
const DEFAULT_RETRY_LIMIT: u32 = 10;
const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(12 * 60 * 60);
const DEFAULT_TUNER_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for a queue and its consumer.
///
/// Zeroed numeric fields are filled with defaults by [`QueueOptions::init`],
/// which the processor calls on construction.
#[derive(Clone)]
pub struct QueueOptions {
    /// Queue name; part of the slot-lock key space
    pub name: String,

    /// Lower bound for the adaptive worker count
    pub min_workers: usize,
    /// Cross-process worker-slot count and adaptive worker ceiling.
    /// `0` disables slot coordination and leaves the ceiling CPU-derived.
    pub max_workers: usize,
    /// Lower bound for the adaptive fetcher count
    pub min_fetchers: usize,
    /// Upper bound for the adaptive fetcher count
    pub max_fetchers: usize,

    /// Capacity of the fetcher-to-worker channel
    pub buffer_size: usize,

    /// Lease duration requested from the queue; also the slot-lock TTL
    pub reservation_timeout: Duration,

    /// `reserved_count` at which a failing message is deleted instead of
    /// released. `0` deletes on first failure.
    pub retry_limit: u32,

    /// Lower bound for exponential retry backoff
    pub min_backoff: Duration,
    /// Upper clamp for exponential retry backoff
    pub max_backoff: Duration,

    /// Cadence of the adaptive tuner
    pub tuner_interval: Duration,

    /// Rate applied through `rate_limiter`
    pub rate_limit: Option<RateLimit>,
    /// Optional rate-limit capability consulted before each handler run
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,

    /// Message processor
    pub handler: Arc<dyn Handler>,
    /// Invoked on terminal deletes of failed messages
    pub fallback_handler: Option<Arc<dyn Handler>>,

    /// Side state for named-message dedup
    pub storage: Option<Arc<dyn Storage>>,

    /// Shared-lock service for cross-process worker slots
    pub lock_service: Option<Arc<dyn LockService>>,
    /// Pub/sub channel carrying slot-free wake-ups
    pub bus: Option<Arc<dyn SignalBus>>,
}

impl QueueOptions {
    /// Options for `name` processed by `handler`, everything else default
    pub fn new(name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        let mut opt = Self {
            name: name.into(),
            min_workers: 0,
            max_workers: 0,
            min_fetchers: 0,
            max_fetchers: 0,
            buffer_size: 0,
            reservation_timeout: Duration::ZERO,
            retry_limit: DEFAULT_RETRY_LIMIT,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            tuner_interval: Duration::ZERO,
            rate_limit: None,
            rate_limiter: None,
            handler,
            fallback_handler: None,
            storage: None,
            lock_service: None,
            bus: None,
        };
        opt.init();
        opt
    }

    /// Fill zeroed fields with defaults
    pub fn init(&mut self) {
        if self.min_workers == 0 {
            self.min_workers = num_cpus::get();
        }
        if self.min_fetchers == 0 {
            self.min_fetchers = 1;
        }
        if self.max_fetchers == 0 {
            self.max_fetchers = DEFAULT_MAX_FETCHERS.max(self.min_fetchers);
        }
        if self.buffer_size == 0 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.reservation_timeout.is_zero() {
            self.reservation_timeout = DEFAULT_RESERVATION_TIMEOUT;
        }
        if self.min_backoff.is_zero() {
            self.min_backoff = DEFAULT_MIN_BACKOFF;
        }
        if self.max_backoff.is_zero() {
            self.max_backoff = DEFAULT_MAX_BACKOFF;
        }
        if self.tuner_interval.is_zero() {
            self.tuner_interval = DEFAULT_TUNER_INTERVAL;
        }
    }

    /// Reject inconsistent bounds
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("queue name cannot be empty".to_string()));
        }
        if self.max_fetchers < self.min_fetchers {
            return Err(Error::Config(format!(
                "max_fetchers {} is below min_fetchers {}",
                self.max_fetchers, self.min_fetchers
            )));
        }
        if self.max_workers > 0 && self.max_workers < self.min_workers {
            return Err(Error::Config(format!(
                "max_workers {} is below min_workers {}",
                self.max_workers, self.min_workers
            )));
        }
        if self.max_backoff < self.min_backoff {
            return Err(Error::Config(format!(
                "max_backoff {:?} is below min_backoff {:?}",
                self.max_backoff, self.min_backoff
            )));
        }
        if self.rate_limit.is_some() != self.rate_limiter.is_some() {
            return Err(Error::Config(
                "rate_limit and rate_limiter must be configured together".to_string(),
            ));
        }
        Ok(())
    }

    /// Upper bound the tuner applies to the worker count
    pub(crate) fn worker_ceiling(&self) -> usize {
        if self.max_workers > 0 {
            self.max_workers
        } else {
            (32 * num_cpus::get()).max(self.min_workers)
        }
    }

    /// Whether cross-process slot locking is active
    pub(crate) fn slots_enabled(&self) -> bool {
        self.max_workers > 0 && self.lock_service.is_some()
    }
}

impl fmt::Debug for QueueOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueOptions")
            .field("name", &self.name)
            .field("min_workers", &self.min_workers)
            .field("max_workers", &self.max_workers)
            .field("min_fetchers", &self.min_fetchers)
            .field("max_fetchers", &self.max_fetchers)
            .field("buffer_size", &self.buffer_size)
            .field("reservation_timeout", &self.reservation_timeout)
            .field("retry_limit", &self.retry_limit)
            .field("min_backoff", &self.min_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("tuner_interval", &self.tuner_interval)
            .field("rate_limit", &self.rate_limit)
            .field("has_fallback", &self.fallback_handler.is_some())
            .field("has_storage", &self.storage.is_some())
            .field("has_lock_service", &self.lock_service.is_some())
            .field("has_bus", &self.bus.is_some())
            .finish()
    }
}
