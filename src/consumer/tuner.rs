//! Throughput profiling and adaptive sizing of the fetcher/worker pools

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::QueueOptions;

/// Workers added per tuning step when the queue has a backlog
const WORKER_STEP: usize = 5;

/// CPU/memory headroom probe.
///
/// Platform semantics are a deployment concern; the default claims
/// headroom unconditionally.
fn has_free_system_resources() -> bool {
    true
}

/// Measured throughput for one tuning window
#[derive(Debug, Clone)]
pub(crate) struct PerfProfile {
    start: Instant,
    processed: u64,
    retries: u64,
    timing: Duration,

    tps: f64,
    error_rate: f64,
}

impl PerfProfile {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
            processed: 0,
            retries: 0,
            timing: Duration::ZERO,
            tps: 0.0,
            error_rate: 0.0,
        }
    }

    /// Start a new window from the given counter snapshot
    pub(crate) fn reset(&mut self, processed: u64, retries: u64) {
        self.start = Instant::now();
        self.processed = processed;
        self.retries = retries;
    }

    /// Fold the current counter values into the window
    pub(crate) fn update(&mut self, processed: u64, retries: u64, timing: Duration) {
        let processed_diff = processed.saturating_sub(self.processed);
        let retries_diff = retries.saturating_sub(self.retries);
        let total = processed_diff + retries_diff;

        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms > 0.0 {
            self.tps = processed_diff as f64 / elapsed_ms;
        }

        if total > 0 {
            self.error_rate = retries_diff as f64 / total as f64;
        } else {
            self.error_rate = 0.0;
        }

        self.timing = timing;
    }

    pub(crate) fn tps(&self) -> f64 {
        self.tps
    }

    pub(crate) fn error_rate(&self) -> f64 {
        self.error_rate
    }

    #[allow(dead_code)]
    pub(crate) fn timing(&self) -> Duration {
        self.timing
    }
}

/// One `(fetchers, workers)` shape together with its measured performance
#[derive(Debug, Clone)]
pub(crate) struct ConsumerConfig {
    pub(crate) num_fetcher: usize,
    pub(crate) num_worker: usize,

    pub(crate) profile: PerfProfile,

    pub(crate) num_selected: u32,
    pub(crate) score: f64,
}

impl ConsumerConfig {
    pub(crate) fn new(num_fetcher: usize, num_worker: usize) -> Self {
        Self {
            num_fetcher,
            num_worker,
            profile: PerfProfile::new(),
            num_selected: 0,
            score: 0.0,
        }
    }

    /// Fold a new score into the rolling average: the first observation
    /// replaces, later ones average with the previous value
    pub(crate) fn set_score(&mut self, score: f64) {
        if self.score == 0.0 {
            self.score = score;
        } else {
            self.score = (self.score + score) / 2.0;
        }
    }

    /// Same shape, fresh measurements
    pub(crate) fn clone_shape(&self) -> Self {
        Self::new(self.num_fetcher, self.num_worker)
    }
}

impl PartialEq for ConsumerConfig {
    fn eq(&self, other: &Self) -> bool {
        self.num_fetcher == other.num_fetcher && self.num_worker == other.num_worker
    }
}

impl fmt::Display for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetchers={} workers={} tps={:.6} failure={:.6} timing={:?} score={:.6} selected={}",
            self.num_fetcher,
            self.num_worker,
            self.profile.tps(),
            self.profile.error_rate(),
            self.profile.timing,
            self.score,
            self.num_selected
        )
    }
}

/// Proposes the next pool shape from the current one.
///
/// The roulette only grows or stands still; bounds are clamped by the
/// caller before application.
pub(crate) struct ConfigRoulette {
    max_fetchers: usize,
    probe: fn() -> bool,
}

impl ConfigRoulette {
    pub(crate) fn new(opt: &QueueOptions) -> Self {
        Self {
            max_fetchers: opt.max_fetchers,
            probe: has_free_system_resources,
        }
    }

    #[cfg(test)]
    fn with_probe(mut self, probe: fn() -> bool) -> Self {
        self.probe = probe;
        self
    }

    /// Next candidate shape given the current one and queue emptiness
    pub(crate) fn select(&self, current: &ConsumerConfig, queue_empty: bool) -> ConsumerConfig {
        let mut next = current.clone_shape();

        if (self.probe)() && !queue_empty {
            next.num_worker += WORKER_STEP;
        }
        if (self.probe)() && next.num_fetcher < self.max_fetchers {
            next.num_fetcher += 1;
        }

        next
    }
}
