//! Worker pool and lifecycle controller
//!
//! The processor reserves messages from the queue, runs the handler on
//! them, and then either releases or deletes them. It owns the fetcher
//! pool, the worker pool, the deletion batcher, the pause controller, the
//! adaptive tuner, and the cross-process slot coordinator, and drives
//! graceful shutdown across all of them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::QueueOptions;
use crate::consumer::backoff::{exponential_backoff, PauseController};
use crate::consumer::batcher::{Batcher, FlushFn};
use crate::consumer::slots::WorkerSlots;
use crate::consumer::tuner::{ConfigRoulette, ConsumerConfig};
use crate::error::{Error, Result};
use crate::handler::HandlerError;
use crate::message::Message;
use crate::queue::Queue;

/// Sleep after a transient reserve failure
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// Grace period used by [`Processor::stop`]
const STOP_TIMEOUT: Duration = Duration::from_secs(30);
/// EWMA decay for the average handler duration
const DURATION_DECAY: f64 = 1.0 / 100.0;
/// Poll cadence while waiting for in-flight messages to drain
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Snapshot of the processor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Messages reserved or buffered but not yet released/deleted
    pub in_flight: u32,
    /// Messages handed to the deletion batcher but not yet flushed
    pub deleting: u32,
    /// Successfully handled messages
    pub processed: u32,
    /// Failed handler runs that were released for redelivery
    pub retries: u32,
    /// Failed handler runs that exhausted the retry limit
    pub fails: u32,
    /// EWMA of handler duration
    pub avg_duration: Duration,
}

#[derive(Debug, Default)]
struct State {
    started: AtomicBool,

    in_flight: AtomicU32,
    deleting: AtomicU32,
    processed: AtomicU32,
    retries: AtomicU32,
    fails: AtomicU32,
    avg_duration_ms: AtomicU32,

    // Completion count for shutdown: every buffered or directly processed
    // message holds one unit until its release or batched delete finishes.
    pending: AtomicU32,
}

struct Inner {
    q: Arc<dyn Queue>,
    opt: QueueOptions,

    state: State,
    pause: PauseController,

    ch_tx: mpsc::Sender<Message>,
    ch_rx: AsyncMutex<mpsc::Receiver<Message>>,

    stop_tx: Mutex<watch::Sender<bool>>,
    handles: Mutex<Vec<JoinHandle<()>>>,

    batcher: Batcher,

    slots: Option<Arc<WorkerSlots>>,
    wake_reader_started: AtomicBool,

    roulette: ConfigRoulette,
    current_cfg: Mutex<ConsumerConfig>,

    next_worker_id: AtomicUsize,
    next_fetcher_id: AtomicUsize,
}

/// Reserves messages from a queue, runs the handler, and releases or
/// deletes them according to the outcome.
///
/// Cheap to clone; clones share one engine. Must be created inside a Tokio
/// runtime (the deletion batcher runs as a background task).
#[derive(Clone)]
pub struct Processor {
    inner: Arc<Inner>,
}

impl Processor {
    /// Create a processor for `q` with the given options
    pub fn new(q: Arc<dyn Queue>, mut opt: QueueOptions) -> Result<Self> {
        opt.init();
        opt.validate()?;

        let (ch_tx, ch_rx) = mpsc::channel(opt.buffer_size);
        let (stop_tx, _) = watch::channel(false);

        let slots = if opt.slots_enabled() {
            let locks = opt
                .lock_service
                .clone()
                .ok_or_else(|| Error::Config("slot locking requires a lock service".into()))?;
            Some(WorkerSlots::new(
                opt.name.clone(),
                opt.max_workers,
                opt.reservation_timeout,
                locks,
                opt.bus.clone(),
            ))
        } else {
            None
        };

        let roulette = ConfigRoulette::new(&opt);
        let current_cfg = ConsumerConfig::new(opt.min_fetchers, opt.min_workers);

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<Inner>| {
            let flush_target = weak.clone();
            let flush: FlushFn = Arc::new(move |msgs: Vec<Message>| {
                let target = flush_target.clone();
                Box::pin(async move {
                    if let Some(inner) = target.upgrade() {
                        inner.flush_deletes(msgs).await;
                    }
                })
            });

            Inner {
                batcher: Batcher::new(opt.min_workers, flush),
                q,
                state: State::default(),
                pause: PauseController::default(),
                ch_tx,
                ch_rx: AsyncMutex::new(ch_rx),
                stop_tx: Mutex::new(stop_tx),
                handles: Mutex::new(Vec::new()),
                slots,
                wake_reader_started: AtomicBool::new(false),
                roulette,
                current_cfg: Mutex::new(current_cfg),
                next_worker_id: AtomicUsize::new(0),
                next_fetcher_id: AtomicUsize::new(0),
                opt,
            }
        });

        Ok(Self { inner })
    }

    /// Buffer a message on the internal channel for the worker pool.
    ///
    /// Applies back-pressure once the channel holds `buffer_size` messages.
    pub async fn add(&self, msg: Message) -> Result<()> {
        self.inner.buffer(msg).await
    }

    /// Buffer a message after `delay`.
    ///
    /// The message counts as in-flight immediately, so shutdown waits for
    /// it even while the delay is still running.
    pub async fn add_delay(&self, msg: Message, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return self.add(msg).await;
        }

        self.inner.state.pending.fetch_add(1, Ordering::Relaxed);
        self.inner.state.in_flight.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.ch_tx.send(msg).await.is_err() {
                inner.state.pending.fetch_sub(1, Ordering::Relaxed);
                inner.state.in_flight.fetch_sub(1, Ordering::Relaxed);
                warn!("internal channel closed, dropping delayed message");
            }
        });
        Ok(())
    }

    /// Process a message synchronously, bypassing the internal channel and
    /// slot locking
    pub async fn process(&self, msg: Message) -> Result<()> {
        self.inner.state.pending.fetch_add(1, Ordering::Relaxed);
        self.inner.state.in_flight.fetch_add(1, Ordering::Relaxed);
        self.inner.process_message(None, msg).await
    }

    /// Start the worker pool, the fetcher pool, and the adaptive tuner.
    ///
    /// No-op when already started.
    pub fn start(&self) -> Result<()> {
        if !self.inner.start_workers() {
            return Ok(());
        }

        let fetchers = self.inner.current_cfg.lock().num_fetcher;
        for _ in 0..fetchers {
            self.inner.spawn_fetcher();
        }
        self.inner.spawn_tuner();

        Ok(())
    }

    /// [`Processor::stop_timeout`] with a 30 second grace period
    pub async fn stop(&self) -> Result<()> {
        self.stop_workers_timeout(STOP_TIMEOUT).await
    }

    /// Wait up to `timeout` for in-flight messages to finish, then stop
    /// workers and fetchers.
    ///
    /// On expiry returns [`Error::StopTimeout`] and leaves workers
    /// running. No-op when already stopped.
    pub async fn stop_timeout(&self, timeout: Duration) -> Result<()> {
        self.stop_workers_timeout(timeout).await
    }

    /// Process queued messages until the queue stays empty, then stop.
    ///
    /// Exits after two consecutive idle fetch rounds. Backends that only
    /// support push delivery are polled gently to avoid burning CPU.
    pub async fn process_all(&self) -> Result<()> {
        self.inner.start_workers();

        let mut no_work = 0u32;
        loop {
            let is_idle = self.inner.state.in_flight.load(Ordering::Relaxed) == 0;

            let mut not_supported = false;
            let n = match self.inner.fetch_messages().await {
                Ok(n) => n,
                Err(Error::NotSupported) => {
                    not_supported = true;
                    0
                }
                Err(err) => return Err(err),
            };

            if n == 0 && is_idle {
                no_work += 1;
            } else {
                no_work = 0;
            }
            if no_work == 2 {
                break;
            }

            if not_supported {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        self.stop_workers_timeout(STOP_TIMEOUT).await
    }

    /// Process at most one message, preferring the internal channel.
    ///
    /// Returns [`Error::QueueEmpty`] when nothing is available. Waits for
    /// the deletion batcher so a resulting delete is durable on return.
    pub async fn process_one(&self) -> Result<()> {
        let msg = self.reserve_one().await?;
        let result = self.inner.process_message(None, msg).await;
        self.inner.batcher.wait().await;
        result
    }

    /// Discard everything on the internal channel without invoking the
    /// handler.
    ///
    /// Non-blocking: a running worker that currently owns the channel is
    /// already draining it, so there is nothing left to discard.
    pub async fn purge(&self) -> Result<()> {
        if let Ok(mut rx) = self.inner.ch_rx.try_lock() {
            while let Ok(msg) = rx.try_recv() {
                self.inner.delete(msg, None).await;
            }
        }
        Ok(())
    }

    /// Counter snapshot
    pub fn stats(&self) -> Stats {
        let state = &self.inner.state;
        Stats {
            in_flight: state.in_flight.load(Ordering::Relaxed),
            deleting: state.deleting.load(Ordering::Relaxed),
            processed: state.processed.load(Ordering::Relaxed),
            retries: state.retries.load(Ordering::Relaxed),
            fails: state.fails.load(Ordering::Relaxed),
            avg_duration: Duration::from_millis(
                state.avg_duration_ms.load(Ordering::Relaxed) as u64
            ),
        }
    }

    async fn reserve_one(&self) -> Result<Message> {
        // A buffered message was already counted by `add`.
        if let Ok(mut rx) = self.inner.ch_rx.try_lock() {
            if let Ok(msg) = rx.try_recv() {
                return Ok(msg);
            }
        }

        let msgs = match self.inner.q.reserve(1).await {
            Ok(msgs) => msgs,
            Err(Error::NotSupported) => Vec::new(),
            Err(err) => return Err(err),
        };

        match msgs.into_iter().next() {
            Some(msg) => {
                self.inner.state.pending.fetch_add(1, Ordering::Relaxed);
                self.inner.state.in_flight.fetch_add(1, Ordering::Relaxed);
                Ok(msg)
            }
            None => Err(Error::QueueEmpty),
        }
    }

    async fn stop_workers_timeout(&self, timeout: Duration) -> Result<()> {
        let state = &self.inner.state;
        if state
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        while state.pending.load(Ordering::Relaxed) > 0 {
            if Instant::now() >= deadline {
                return Err(Error::StopTimeout { timeout });
            }
            if state.in_flight.load(Ordering::Relaxed) == 0 {
                // Everything left is sitting in the batcher.
                self.inner.batcher.wait().await;
            } else {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        }

        let _ = self.inner.stop_tx.lock().send(true);
        let handles: Vec<_> = self.inner.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("{} task failed to join: {}", self.inner.q.name(), err);
            }
        }

        self.inner.batcher.wait().await;
        Ok(())
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Processor<{} workers={} buffer={}>",
            self.inner.q.name(),
            self.inner.current_cfg.lock().num_worker,
            self.inner.opt.buffer_size
        )
    }
}

impl Inner {
    async fn buffer(&self, msg: Message) -> Result<()> {
        self.state.pending.fetch_add(1, Ordering::Relaxed);
        self.state.in_flight.fetch_add(1, Ordering::Relaxed);
        if self.ch_tx.send(msg).await.is_err() {
            self.state.pending.fetch_sub(1, Ordering::Relaxed);
            self.state.in_flight.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::Coordination("internal channel closed".to_string()));
        }
        Ok(())
    }

    fn start_workers(self: &Arc<Self>) -> bool {
        if self
            .state
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        {
            let (stop_tx, _) = watch::channel(false);
            *self.stop_tx.lock() = stop_tx;
        }

        let workers = self.current_cfg.lock().num_worker;
        for _ in 0..workers {
            self.spawn_worker();
        }

        if let Some(slots) = &self.slots {
            if !self.wake_reader_started.swap(true, Ordering::AcqRel) {
                // Runs for the life of the bus subscription, like the
                // shared lock service it cooperates with.
                let _ = slots.spawn_wake_reader();
            }
        }

        true
    }

    fn spawn_worker(self: &Arc<Self>) {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let stop_rx = self.stop_tx.lock().subscribe();
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            inner.worker_loop(id, stop_rx).await;
        });
        self.handles.lock().push(handle);
    }

    fn spawn_fetcher(self: &Arc<Self>) {
        let id = self.next_fetcher_id.fetch_add(1, Ordering::Relaxed);
        let stop_rx = self.stop_tx.lock().subscribe();
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            inner.fetcher_loop(id, stop_rx).await;
        });
        self.handles.lock().push(handle);
    }

    fn spawn_tuner(self: &Arc<Self>) {
        let stop_rx = self.stop_tx.lock().subscribe();
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            inner.tuner_loop(stop_rx).await;
        });
        self.handles.lock().push(handle);
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut stop_rx: watch::Receiver<bool>) {
        debug!("{} worker {} started", self.q.name(), worker_id);

        loop {
            let Some(msg) = self.dequeue(&mut stop_rx).await else {
                break;
            };

            if let (Some(limiter), Some(limit)) = (&self.opt.rate_limiter, self.opt.rate_limit) {
                loop {
                    let (delay, allow) = limiter.allow_rate(self.q.name(), limit);
                    if allow {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                }
            }

            let _ = self.process_message(Some(worker_id), msg).await;
        }

        debug!("{} worker {} stopped", self.q.name(), worker_id);
    }

    /// Pop a message, draining the channel before honoring the stop signal
    async fn dequeue(&self, stop_rx: &mut watch::Receiver<bool>) -> Option<Message> {
        let mut rx = self.ch_rx.lock().await;
        loop {
            if *stop_rx.borrow() {
                return rx.try_recv().ok();
            }
            tokio::select! {
                msg = rx.recv() => return msg,
                res = stop_rx.changed() => {
                    // A closed stop channel (processor restarted underneath
                    // us) counts as a stop signal.
                    if res.is_err() {
                        return rx.try_recv().ok();
                    }
                }
            }
        }
    }

    async fn fetcher_loop(self: Arc<Self>, id: usize, mut stop_rx: watch::Receiver<bool>) {
        debug!("{} fetcher {} started", self.q.name(), id);

        loop {
            if !self.state.started.load(Ordering::Acquire) {
                break;
            }

            let pause = self.pause.paused();
            if pause > Duration::ZERO {
                self.pause.reset();
                warn!("{} is automatically paused for {:?}", self.q.name(), pause);
                if self.sleep_or_stop(pause, &mut stop_rx).await {
                    break;
                }
                continue;
            }

            match self.fetch_messages().await {
                Ok(_) => {}
                Err(Error::NotSupported) => {
                    debug!(
                        "{} does not support reserving, fetcher exiting",
                        self.q.name()
                    );
                    break;
                }
                Err(err) => {
                    error!(
                        "{} reserve failed: {} (sleeping for {:?})",
                        self.q.name(),
                        err,
                        FETCH_ERROR_BACKOFF
                    );
                    if self.sleep_or_stop(FETCH_ERROR_BACKOFF, &mut stop_rx).await {
                        break;
                    }
                }
            }
        }

        debug!("{} fetcher {} stopped", self.q.name(), id);
    }

    /// Sleep for `dur`, returning early (and `true`) on the stop signal
    async fn sleep_or_stop(&self, dur: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => false,
            res = stop_rx.changed() => res.is_err() || *stop_rx.borrow(),
        }
    }

    async fn fetch_messages(&self) -> Result<usize> {
        let msgs = self.q.reserve(self.opt.buffer_size).await?;
        let n = msgs.len();
        for msg in msgs {
            self.buffer(msg).await?;
        }
        Ok(n)
    }

    async fn process_message(&self, worker_id: Option<usize>, msg: Message) -> Result<()> {
        // Not yet due; hand it back and let the queue redeliver.
        if msg.delay > Duration::ZERO {
            self.release(msg, None).await;
            return Ok(());
        }

        let slot = match (&self.slots, worker_id) {
            (Some(slots), Some(id)) => Some(id % slots.slot_count()),
            _ => None,
        };
        if let (Some(slots), Some(slot)) = (&self.slots, slot) {
            slots.lock(slot).await;
        }

        let start = Instant::now();
        let result = self.opt.handler.handle(&msg).await;
        self.update_avg_duration(start.elapsed());

        if let (Some(slots), Some(slot)) = (&self.slots, slot) {
            slots.unlock(slot).await;
        }

        match result {
            Ok(()) => {
                self.state.processed.fetch_add(1, Ordering::Relaxed);
                self.delete(msg, None).await;
                Ok(())
            }
            Err(err) => {
                if msg.reserved_count < self.opt.retry_limit {
                    self.state.retries.fetch_add(1, Ordering::Relaxed);
                    self.release(msg, Some(&err)).await;
                } else {
                    self.state.fails.fetch_add(1, Ordering::Relaxed);
                    self.delete(msg, Some(&err)).await;
                }
                Err(Error::Handler(err))
            }
        }
    }

    async fn release(&self, msg: Message, reason: Option<&HandlerError>) {
        let delay = self.release_backoff(&msg, reason);

        if let Some(reason) = reason {
            warn!(
                "{} handler failed (retry in {:?}): {}",
                self.q.name(),
                delay,
                reason
            );
            self.pause.note_error();
        }

        if let Err(err) = self.q.release(&msg, delay).await {
            error!("{} release failed: {}", self.q.name(), err);
        }

        self.state.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.state.pending.fetch_sub(1, Ordering::Relaxed);
    }

    /// Redelivery delay: an explicit retry hint wins, then the message's
    /// own delay, then exponential backoff on the post-release count
    fn release_backoff(&self, msg: &Message, reason: Option<&HandlerError>) -> Duration {
        if let Some(delay) = reason.and_then(|r| r.delay()) {
            self.pause.note_delay(delay);
            return delay;
        }

        if msg.delay > Duration::ZERO {
            return msg.delay;
        }

        exponential_backoff(
            self.opt.min_backoff,
            self.opt.max_backoff,
            msg.reserved_count + 1,
        )
    }

    async fn delete(&self, msg: Message, reason: Option<&HandlerError>) {
        match reason {
            None => self.pause.reset(),
            Some(reason) => {
                warn!("{} handler failed: {}", self.q.name(), reason);
                self.pause.note_error();

                if let Some(fallback) = &self.opt.fallback_handler {
                    if let Err(err) = fallback.handle(&msg).await {
                        error!("{} fallback handler failed: {}", self.q.name(), err);
                    }
                }
            }
        }

        self.state.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.state.deleting.fetch_add(1, Ordering::Relaxed);
        self.batcher.add(msg);
    }

    async fn flush_deletes(&self, msgs: Vec<Message>) {
        if let Err(err) = self.q.delete_batch(&msgs).await {
            error!("{} delete_batch failed: {}", self.q.name(), err);
        }
        self.state
            .deleting
            .fetch_sub(msgs.len() as u32, Ordering::Relaxed);
        self.state
            .pending
            .fetch_sub(msgs.len() as u32, Ordering::Relaxed);
    }

    fn update_avg_duration(&self, dur: Duration) {
        let ms = dur.as_millis() as f64;
        loop {
            let avg = self.state.avg_duration_ms.load(Ordering::Relaxed);
            let next = ((1.0 - DURATION_DECAY) * avg as f64 + DURATION_DECAY * ms) as u32;
            if self
                .state
                .avg_duration_ms
                .compare_exchange_weak(avg, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    async fn tuner_loop(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.opt.tuner_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.state.started.load(Ordering::Acquire) {
                        break;
                    }
                    self.retune();
                }
                res = stop_rx.changed() => {
                    if res.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn retune(self: &Arc<Self>) {
        let queue_empty = self.ch_tx.capacity() == self.ch_tx.max_capacity()
            && self.state.in_flight.load(Ordering::Relaxed) == 0;

        let processed = self.state.processed.load(Ordering::Relaxed) as u64;
        let retries = self.state.retries.load(Ordering::Relaxed) as u64;
        let timing =
            Duration::from_millis(self.state.avg_duration_ms.load(Ordering::Relaxed) as u64);

        let (add_workers, add_fetchers) = {
            let mut cfg = self.current_cfg.lock();
            cfg.profile.update(processed, retries, timing);
            let tps = cfg.profile.tps();
            cfg.set_score(tps);
            cfg.num_selected += 1;

            let mut next = self.roulette.select(&cfg, queue_empty);
            next.num_worker = next
                .num_worker
                .clamp(self.opt.min_workers, self.opt.worker_ceiling());
            next.num_fetcher = next
                .num_fetcher
                .clamp(self.opt.min_fetchers, self.opt.max_fetchers);

            if next == *cfg {
                cfg.profile.reset(processed, retries);
                (0, 0)
            } else {
                let add_workers = next.num_worker.saturating_sub(cfg.num_worker);
                let add_fetchers = next.num_fetcher.saturating_sub(cfg.num_fetcher);
                info!("{} scaling to {}", self.q.name(), next);
                *cfg = next;
                cfg.profile.reset(processed, retries);
                (add_workers, add_fetchers)
            }
        };

        for _ in 0..add_workers {
            self.spawn_worker();
        }
        for _ in 0..add_fetchers {
            self.spawn_fetcher();
        }
    }
}
