use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::DropCause;
use crate::config::{BackendConfig, BeforeSend, Config, HookError};
use crate::consent::{ConsentBuffer, ConsentGate};
use crate::delivery::DeliveryEngine;
use crate::event::{Batch, CapturedEvent, RawEvent, EXCEPTION, SESSION_START};
use crate::fingerprint::{fingerprint, FingerprintCache, HARD_CAPACITY, SOFT_CAPACITY};
use crate::limits::{sample, RateCounters, RateVerdict};
use crate::metrics::{report_admitted_events, report_dropped_events};
use crate::queue::{DispatchQueue, PendingBuffer, QueuePush};
use crate::recovery;
use crate::retry::RetryPolicy;
use crate::session::StateSource;
use crate::store::StorageBackend;
use crate::time::TimeSource;
use crate::transport::Transport;

/// Local observability feed, independent of delivery. `Event` fires for
/// every admitted event, even ones still waiting in a buffer; `Queued`
/// additionally fires when an event enters the dispatch queue.
#[derive(Debug, Clone)]
pub enum Signal {
    Event(CapturedEvent),
    Queued(CapturedEvent),
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub admitted: u64,
    pub dropped: HashMap<&'static str, u64>,
    pub session_counts: HashMap<String, u64>,
    pub queue_len: usize,
    pub pending_len: usize,
}

struct Inner {
    queue: DispatchQueue,
    pending: PendingBuffer,
    consent_buffer: ConsentBuffer,
    consent_gate: ConsentGate,
    dedup: FingerprintCache,
    limits: RateCounters,
    session: Option<String>,
    consent_flushing: HashSet<String>,
    admitted: u64,
    dropped: HashMap<DropCause, u64>,
    stopped: bool,
}

/// The capture pipeline. Admission runs synchronously inside `track`;
/// delivery is driven by the async flush paths and the background flusher.
///
/// All buffer state sits behind one mutex that is never held across an
/// await; user hooks run outside it.
pub struct Pipeline {
    config: Config,
    state: Arc<dyn StateSource>,
    clock: Arc<dyn TimeSource>,
    store: Arc<dyn StorageBackend>,
    engines: Vec<Arc<DeliveryEngine>>,
    before_send: Option<Arc<BeforeSend>>,
    inner: Mutex<Inner>,
    signals: broadcast::Sender<Signal>,
    flush_hint: Arc<Notify>,
    flush_in_progress: AtomicBool,
    cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        backends: Vec<BackendConfig>,
        state: Arc<dyn StateSource>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn StorageBackend>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        if backends.is_empty() {
            warn!("pipeline configured without backends; flushes will have nowhere to go");
        }

        let backend_names: Vec<String> = backends.iter().map(|b| b.name.clone()).collect();
        let cancel = CancellationToken::new();
        let retry = RetryPolicy::from(&config.retry_policy);
        let engines = backends
            .into_iter()
            .map(|backend| {
                Arc::new(DeliveryEngine::new(
                    backend,
                    Arc::clone(&transport),
                    Arc::clone(&store),
                    retry,
                    Arc::clone(&clock),
                    config.storage_namespace.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        let (signals, _) = broadcast::channel(128);

        Pipeline {
            inner: Mutex::new(Inner {
                queue: DispatchQueue::new(config.queue_capacity),
                pending: PendingBuffer::new(config.pending_capacity),
                consent_buffer: ConsentBuffer::new(&backend_names, config.consent_capacity),
                consent_gate: ConsentGate::new(&backend_names),
                dedup: FingerprintCache::new(SOFT_CAPACITY, HARD_CAPACITY),
                limits: RateCounters::new(
                    config.max_events_per_second,
                    config.max_per_name_per_minute,
                ),
                session: None,
                consent_flushing: HashSet::new(),
                admitted: 0,
                dropped: HashMap::new(),
                stopped: false,
            }),
            config,
            state,
            clock,
            store,
            engines,
            before_send: None,
            signals,
            flush_hint: Arc::new(Notify::new()),
            flush_in_progress: AtomicBool::new(false),
            cancel,
            flusher: Mutex::new(None),
        }
    }

    /// Install the event transform. Only applied in single-backend setups;
    /// with several backends the per-backend `before_batch` hooks are the
    /// place to reshape data.
    pub fn with_before_send(
        mut self,
        hook: impl Fn(CapturedEvent) -> Result<Option<CapturedEvent>, HookError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.before_send = Some(Arc::new(hook));
        self
    }

    /// Run startup recovery, then spawn the background flusher. Calling it
    /// again is a no-op.
    pub async fn start(self: Arc<Self>) {
        let recovered = self.recover().await;
        if recovered > 0 {
            debug!(batches = recovered, "startup recovery resent persisted batches");
        }

        if self.config.flush_interval.0.is_zero() {
            debug!("flush interval disabled, background flusher not started");
            return;
        }
        let mut flusher = self.lock_flusher();
        if flusher.is_some() {
            warn!("pipeline already started");
            return;
        }

        // the task holds a weak handle so an abandoned pipeline can still
        // drop; stop() is the normal teardown path
        let pipeline = Arc::downgrade(&self);
        let cancel = self.cancel.clone();
        let interval = self.config.flush_interval.0;
        let hint = Arc::clone(&self.flush_hint);
        *flusher = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                    _ = hint.notified() => {}
                }
                let Some(pipeline) = pipeline.upgrade() else {
                    break;
                };
                pipeline.flush_now().await;
            }
        }));
    }

    /// One recovery pass for the current identity. Normally run through
    /// `start`, but callable on its own after an identity change.
    pub async fn recover(&self) -> usize {
        recovery::run(
            &self.engines,
            &self.store,
            &self.clock,
            self.config.persist_ttl.0,
            self.state.user_id().as_deref(),
        )
        .await
    }

    /// Submit one event. Synchronous and infallible from the caller's view:
    /// every refusal is logged and counted instead of surfaced.
    pub fn track(&self, raw: RawEvent) {
        let now = self.clock.now();
        let session = self.state.session_id();
        let mut event =
            CapturedEvent::from_raw(raw, now, self.state.page_url(), self.state.device());
        let critical = event.is_critical();
        let mut signals = Vec::new();

        let admitted = {
            let mut inner = self.lock_inner();
            if inner.stopped {
                debug!(event = event.event, "pipeline stopped, dropping event");
                Self::count_drop(&mut inner, DropCause::Stopped);
                return;
            }
            self.observe_session(&mut inner, session, &mut signals);
            self.admit(&mut inner, &event, critical, now)
        };
        // a pending-buffer release inside observe_session signals even when
        // this event itself was refused
        self.emit(&mut signals);
        if !admitted {
            return;
        }

        // the hook runs outside the lock; a slow transform must not stall
        // other producers
        if self.engines.len() == 1 {
            if let Some(hook) = &self.before_send {
                match hook(event.clone()) {
                    Ok(Some(transformed)) => event = transformed,
                    Ok(None) => {
                        debug!("before_send dropped the event");
                        self.count_drop_unlocked(DropCause::TransformDropped);
                        return;
                    }
                    Err(e) => {
                        warn!("before_send failed, keeping the original event: {e}");
                    }
                }
            }
        }

        {
            let mut inner = self.lock_inner();
            if inner.stopped {
                Self::count_drop(&mut inner, DropCause::Stopped);
                return;
            }
            self.route(&mut inner, event, &mut signals);
        }
        self.emit(&mut signals);
    }

    fn admit(
        &self,
        inner: &mut Inner,
        event: &CapturedEvent,
        critical: bool,
        now: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        if event.event.trim().is_empty() {
            warn!("dropping event with an empty name");
            Self::count_drop(inner, DropCause::MissingEventName);
            return false;
        }
        if event.approximate_size() > self.config.max_event_bytes {
            warn!(
                event = event.event,
                limit = self.config.max_event_bytes,
                "dropping oversized event"
            );
            Self::count_drop(inner, DropCause::Oversized);
            return false;
        }

        // session lifecycle events skip dedup, sampling and rate limits
        if critical {
            inner.limits.note(&event.event);
            return true;
        }

        let now_ms = now.timestamp_millis();
        let key = fingerprint(event);
        let window_ms = self.config.dedup_window.0.as_millis() as i64;
        if inner.dedup.check_and_record(key, now_ms, window_ms) {
            debug!(event = event.event, "suppressing duplicate event");
            Self::count_drop(inner, DropCause::Duplicate);
            return false;
        }

        let rate = if event.event == EXCEPTION {
            self.config.error_sampling
        } else {
            self.config.sampling_rate
        };
        if !sample(rate) {
            debug!(event = event.event, "event sampled out");
            Self::count_drop(inner, DropCause::SampledOut);
            return false;
        }

        match inner.limits.check_and_count(&event.event, now_ms) {
            RateVerdict::Admitted => true,
            RateVerdict::GlobalLimited => {
                warn!(event = event.event, "global event rate exceeded, dropping");
                Self::count_drop(inner, DropCause::RateLimited);
                false
            }
            RateVerdict::NameLimited => {
                warn!(event = event.event, "per-name event rate exceeded, dropping");
                Self::count_drop(inner, DropCause::RateLimited);
                false
            }
        }
    }

    fn route(&self, inner: &mut Inner, event: CapturedEvent, signals: &mut Vec<Signal>) {
        inner.admitted += 1;
        report_admitted_events(1);
        signals.push(Signal::Event(event.clone()));

        if inner.session.is_none() {
            if let Some(dropped) = inner.pending.push(event) {
                debug!(
                    event = dropped.event,
                    "pre-session buffer full, dropping oldest"
                );
                Self::count_drop(inner, DropCause::PendingOverflow);
            }
            return;
        }

        if self.config.require_consent && !inner.consent_gate.any_granted() {
            let dropped = inner.consent_buffer.buffer_all(&event);
            if dropped > 0 {
                debug!(count = dropped, "consent buffer full, dropped oldest entries");
                Self::count_drop_n(inner, DropCause::ConsentOverflow, dropped as u64);
            }
            return;
        }

        self.enqueue(inner, event, signals);

        if inner.queue.len() >= self.config.flush_at {
            self.flush_hint.notify_one();
        }
    }

    fn enqueue(&self, inner: &mut Inner, event: CapturedEvent, signals: &mut Vec<Signal>) {
        let queued = event.clone();
        match inner.queue.push(event) {
            QueuePush::Queued => signals.push(Signal::Queued(queued)),
            QueuePush::Evicted(evicted) => {
                debug!(event = evicted.event, "dispatch queue full, evicted oldest");
                Self::count_drop(inner, DropCause::QueueOverflow);
                signals.push(Signal::Queued(queued));
            }
            QueuePush::Refused(refused) => {
                warn!(
                    event = refused.event,
                    "dispatch queue saturated with critical events, dropping"
                );
                Self::count_drop(inner, DropCause::QueueSaturated);
            }
        }
    }

    fn emit(&self, signals: &mut Vec<Signal>) {
        for signal in signals.drain(..) {
            self.signals.send(signal).ok();
        }
    }

    /// Reconcile our session snapshot with the state source. A fresh
    /// session id releases the pre-session buffer into the dispatch queue;
    /// a changed one resets the session-scoped admission state.
    fn observe_session(
        &self,
        inner: &mut Inner,
        current: Option<String>,
        signals: &mut Vec<Signal>,
    ) {
        match (inner.session.clone(), current) {
            (None, Some(fresh)) => {
                debug!(session = fresh, "session id appeared");
                inner.session = Some(fresh);
                inner.limits.reset();
                inner.dedup.clear();
                let held = inner.pending.drain();
                if !held.is_empty() {
                    debug!(events = held.len(), "releasing pre-session buffer");
                    for event in held {
                        self.enqueue(inner, event, signals);
                    }
                }
            }
            (Some(previous), Some(fresh)) if previous != fresh => {
                debug!(session = fresh, "session id rotated, resetting session state");
                inner.session = Some(fresh);
                inner.limits.reset();
                inner.dedup.clear();
            }
            (Some(_), None) => {
                debug!("session id lost, buffering until a new one appears");
                inner.session = None;
            }
            _ => {}
        }
    }

    /// Re-read identity from the state source, releasing the pre-session
    /// buffer if a session id has appeared since the last `track`.
    pub fn refresh_identity(&self) {
        let session = self.state.session_id();
        let mut signals = Vec::new();
        {
            let mut inner = self.lock_inner();
            if inner.stopped {
                return;
            }
            if session.is_none() && !inner.pending.is_empty() {
                warn!(
                    held = inner.pending.len(),
                    "cannot release pre-session buffer without a session id"
                );
            }
            self.observe_session(&mut inner, session, &mut signals);
        }
        self.emit(&mut signals);
    }

    /// Drain the dispatch queue to every backend. Returns true when at
    /// least one backend took the batch. A second call while one is running
    /// returns false without touching the queue.
    pub async fn flush_now(&self) -> bool {
        if self.flush_in_progress.swap(true, Ordering::SeqCst) {
            debug!("flush already in progress");
            return false;
        }
        let flushed = self.flush_queue().await;
        self.flush_in_progress.store(false, Ordering::SeqCst);
        flushed
    }

    async fn flush_queue(&self) -> bool {
        let (events, session) = {
            let inner = self.lock_inner();
            if inner.stopped {
                return false;
            }
            (inner.queue.snapshot(), inner.session.clone())
        };
        if events.is_empty() {
            return true;
        }
        let Some(session) = session else {
            warn!("cannot flush without a session id");
            return false;
        };

        let batch = Batch::new(session, self.state.user_id(), events, self.clock.now());
        let sent: HashSet<Uuid> = batch.events.iter().map(|event| event.uuid).collect();

        let outcomes = join_all(
            self.engines
                .iter()
                .map(|engine| engine.send_batch(&batch)),
        )
        .await;
        let delivered = outcomes.iter().any(|ok| *ok);

        if delivered {
            let mut inner = self.lock_inner();
            let removed = inner.queue.remove_ids(&sent);
            debug!(events = removed, "cleared delivered events from the queue");
        } else {
            debug!(events = batch.len(), "no backend accepted the batch, queue retained");
        }
        delivered
    }

    /// Teardown flush: drain the queue and hand one batch per backend to
    /// the fire-and-forget transport. Returns whether any handoff was
    /// accepted; the outcome of a detached send is never observed, so the
    /// drained events are gone either way.
    pub fn flush_now_sync(&self) -> bool {
        let (events, session) = {
            let mut inner = self.lock_inner();
            if inner.stopped {
                return false;
            }
            if inner.queue.is_empty() {
                return true;
            }
            let Some(session) = inner.session.clone() else {
                warn!("cannot flush without a session id");
                return false;
            };
            (inner.queue.drain(), session)
        };

        let batch = Batch::new(session, self.state.user_id(), events, self.clock.now());
        let mut accepted = false;
        for engine in &self.engines {
            if engine.send_batch_detached(&batch) {
                accepted = true;
            }
        }
        accepted
    }

    /// Record a consent decision. A grant drains that backend's buffered
    /// events in small, paced batches; a revoke discards them.
    pub async fn set_consent(&self, backend: &str, granted: bool) {
        let to_flush = {
            let mut inner = self.lock_inner();
            if inner.stopped {
                return;
            }
            if !inner.consent_gate.knows(backend) {
                warn!(backend, "consent decision for unknown backend ignored");
                return;
            }
            inner.consent_gate.set(backend, granted);

            if !granted {
                let cleared = inner.consent_buffer.clear(backend);
                if cleared > 0 {
                    debug!(backend, events = cleared, "consent revoked, cleared buffer");
                }
                return;
            }
            if inner.consent_flushing.contains(backend) {
                debug!(backend, "consent flush already running");
                return;
            }
            let events = inner.consent_buffer.take(backend);
            if events.is_empty() {
                return;
            }
            inner.consent_flushing.insert(backend.to_string());
            events
        };

        self.flush_consent(backend, to_flush).await;

        let mut inner = self.lock_inner();
        inner.consent_flushing.remove(backend);
    }

    async fn flush_consent(&self, backend: &str, events: Vec<CapturedEvent>) {
        let Some(engine) = self
            .engines
            .iter()
            .find(|engine| engine.backend_name() == backend)
        else {
            return;
        };

        let session = {
            let inner = self.lock_inner();
            inner.session.clone()
        };
        let Some(session) = session else {
            warn!(backend, "no session id at consent flush time, re-buffering");
            let mut inner = self.lock_inner();
            inner.consent_buffer.restore(backend, events);
            return;
        };

        debug!(backend, events = events.len(), "flushing consent buffer");
        let chunk_size = self.config.consent_flush_batch.max(1);
        let chunks: Vec<Vec<CapturedEvent>> = events
            .chunks(chunk_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let total = chunks.len();

        for (index, mut chunk) in chunks.into_iter().enumerate() {
            // a held session start leads its chunk so the backend sees the
            // session open before anything inside it
            chunk.sort_by_key(|event| event.event != SESSION_START);

            let batch = Batch::new(
                session.clone(),
                self.state.user_id(),
                chunk,
                self.clock.now(),
            );
            engine.send_batch(&batch).await;

            if index + 1 < total {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!(backend, "consent flush cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(self.config.consent_flush_delay.0) => {}
                }
            }
        }
    }

    /// Tear the pipeline down: cancel the flusher and any backoff waits,
    /// clear every in-memory buffer. Nothing is flushed; only batches
    /// already persisted to storage survive.
    pub fn stop(&self) {
        self.cancel.cancel();

        let mut inner = self.lock_inner();
        if inner.stopped {
            return;
        }
        inner.stopped = true;
        inner.queue.clear();
        inner.pending.clear();
        inner.consent_buffer.clear_all();
        inner.dedup.clear();
        inner.limits.reset();
        drop(inner);

        if let Some(flusher) = self.lock_flusher().take() {
            flusher.abort();
        }
        debug!("pipeline stopped");
    }

    /// Subscribe to the local signal feed. Slow subscribers miss signals
    /// rather than blocking admission.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    pub fn queue_len(&self) -> usize {
        self.lock_inner().queue.len()
    }

    pub fn queue_events(&self) -> Vec<CapturedEvent> {
        self.lock_inner().queue.snapshot()
    }

    pub fn pending_len(&self) -> usize {
        self.lock_inner().pending.len()
    }

    pub fn consent_buffered(&self, backend: &str) -> usize {
        self.lock_inner().consent_buffer.len(backend)
    }

    pub fn stats(&self) -> PipelineStats {
        let inner = self.lock_inner();
        PipelineStats {
            admitted: inner.admitted,
            dropped: inner
                .dropped
                .iter()
                .map(|(cause, count)| (cause.as_str(), *count))
                .collect(),
            session_counts: inner.limits.session_counts().clone(),
            queue_len: inner.queue.len(),
            pending_len: inner.pending.len(),
        }
    }

    fn count_drop(inner: &mut Inner, cause: DropCause) {
        Self::count_drop_n(inner, cause, 1);
    }

    fn count_drop_n(inner: &mut Inner, cause: DropCause, quantity: u64) {
        *inner.dropped.entry(cause).or_default() += quantity;
        report_dropped_events(cause.as_str(), quantity);
    }

    fn count_drop_unlocked(&self, cause: DropCause) {
        let mut inner = self.lock_inner();
        Self::count_drop(&mut inner, cause);
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_flusher(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.flusher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
