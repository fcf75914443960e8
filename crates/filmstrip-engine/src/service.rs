//! The filmstrip service and its orchestrator task.
//!
//! [`FilmstripService`] is a cheap, clonable handle. Every operation is a
//! message to a single orchestrator task that owns the cache, the sessions,
//! the admission queue and the worker pool, so all state transitions happen
//! in one place and in message order. Worker responses and store I/O
//! completions flow back into the same loop.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use filmstrip_core::config::Config;
use filmstrip_core::{
    total_frames, AssetId, Error, Filmstrip, FilmstripFrame, PriorityWindow, RequestId, Result,
    SourceRef, WorkerId,
};
use filmstrip_store::{BlobStore, FilmstripMeta};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::admission::{self, AdmissionQueue};
use crate::cache::{CacheStore, FilmstripCallback, SubscriberId};
use crate::fallback::{classify_failure, next_action, DecodePath, FallbackAction};
use crate::handles::HandleArena;
use crate::memory::{MemoryMonitor, MemoryPressure, MemoryPressureProbe};
use crate::metrics::{ExtractionOutcome, MetricsRing, MetricsSnapshot};
use crate::pool::WorkerPool;
use crate::protocol::{DecodeStrategy, ExtractRequest, SavedFrame, WorkerEvent, WorkerResponse};
use crate::sampling::Sampler;
use crate::session::{
    partition, ExtractionSession, ProgressThrottle, SessionPlan, WorkerRangeAssignment,
};
use crate::worker::{Decoders, WorkerContext};

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// One `get_filmstrip` call.
#[derive(Clone)]
pub struct FilmstripRequest {
    pub asset_id: AssetId,
    pub source: SourceRef,
    /// Clip length in seconds.
    pub duration: f64,
    pub priority_window: Option<PriorityWindow>,
    /// Receives every update until the extraction this call triggered settles.
    pub on_progress: Option<FilmstripCallback>,
}

impl FilmstripRequest {
    pub fn new(asset_id: impl Into<AssetId>, source: SourceRef, duration: f64) -> Self {
        Self {
            asset_id: asset_id.into(),
            source,
            duration,
            priority_window: None,
            on_progress: None,
        }
    }

    pub fn with_priority(mut self, window: PriorityWindow) -> Self {
        self.priority_window = Some(window);
        self
    }

    pub fn on_progress(mut self, callback: FilmstripCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }
}

impl fmt::Debug for FilmstripRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilmstripRequest")
            .field("asset_id", &self.asset_id)
            .field("source", &self.source)
            .field("duration", &self.duration)
            .field("priority_window", &self.priority_window)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Point-in-time counters of the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub active_sessions: usize,
    pub queued_sessions: usize,
    pub loading_assets: usize,
    pub live_workers: usize,
    pub idle_workers: usize,
    /// Extract requests sent to workers over the service's lifetime.
    pub dispatched_requests: u64,
    pub cached_assets: usize,
    pub cache_bytes: u64,
    pub outstanding_handles: usize,
    pub pressure: MemoryPressure,
    pub concurrency_cap: usize,
}

/// Registration returned by [`FilmstripService::subscribe`].
///
/// Dropping it unsubscribes.
pub struct Subscription {
    asset_id: AssetId,
    id: SubscriberId,
    tx: mpsc::WeakUnboundedSender<Command>,
}

impl Subscription {
    pub fn asset_id(&self) -> &AssetId {
        &self.asset_id
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(Command::Unsubscribe {
                asset_id: self.asset_id.clone(),
                id: self.id,
            });
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("asset_id", &self.asset_id)
            .field("id", &self.id)
            .finish()
    }
}

/// Handle to a running filmstrip engine.
#[derive(Clone)]
pub struct FilmstripService {
    tx: mpsc::UnboundedSender<Command>,
}

impl FilmstripService {
    /// Spawn the orchestrator on the current tokio runtime.
    pub fn start(
        config: Config,
        store: Arc<dyn BlobStore>,
        decoders: Decoders,
        probe: Arc<dyn MemoryPressureProbe>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(config, store, decoders, probe, tx.downgrade());
        tokio::spawn(orchestrator.run(rx));
        Self { tx }
    }

    /// Current filmstrip of an asset, starting or resuming extraction as
    /// needed. Repeated calls without an intervening change return the same
    /// `Arc`.
    pub async fn get_filmstrip(&self, request: FilmstripRequest) -> Result<Arc<Filmstrip>> {
        self.call(|reply| Command::GetFilmstrip { request, reply })
            .await
    }

    /// Listen to every update of an asset. The current value, if any, is
    /// delivered immediately.
    pub async fn subscribe(
        &self,
        asset_id: impl Into<AssetId>,
        callback: FilmstripCallback,
    ) -> Result<Subscription> {
        let asset_id = asset_id.into();
        let id = self
            .call(|reply| Command::Subscribe {
                asset_id: asset_id.clone(),
                callback,
                reply,
            })
            .await?;
        Ok(Subscription {
            asset_id,
            id,
            tx: self.tx.downgrade(),
        })
    }

    /// Cancel an asset's extraction, returning what had been extracted.
    pub async fn abort(&self, asset_id: impl Into<AssetId>) -> Result<Option<Arc<Filmstrip>>> {
        let asset_id = asset_id.into();
        self.call(|reply| Command::Abort { asset_id, reply }).await
    }

    /// Drop an asset from memory and from the blob store.
    pub async fn clear_asset(&self, asset_id: impl Into<AssetId>) -> Result<()> {
        let asset_id = asset_id.into();
        self.call(|reply| Command::ClearAsset { asset_id, reply })
            .await?
    }

    /// Drop every asset from memory and from the blob store.
    pub async fn clear_all(&self) -> Result<()> {
        self.call(|reply| Command::ClearAll { reply }).await?
    }

    pub async fn metrics_snapshot(&self) -> Result<MetricsSnapshot> {
        self.call(|reply| Command::Metrics { reply }).await
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        self.call(|reply| Command::Stats { reply }).await
    }

    /// Stop all work. Every later call fails with [`Error::ServiceStopped`].
    pub async fn dispose(&self) -> Result<()> {
        self.call(|reply| Command::Dispose { reply }).await
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| Error::ServiceStopped)?;
        rx.await.map_err(|_| Error::ServiceStopped)
    }
}

impl fmt::Debug for FilmstripService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilmstripService")
            .field("running", &!self.tx.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

enum Command {
    GetFilmstrip {
        request: FilmstripRequest,
        reply: oneshot::Sender<Arc<Filmstrip>>,
    },
    Subscribe {
        asset_id: AssetId,
        callback: FilmstripCallback,
        reply: oneshot::Sender<SubscriberId>,
    },
    Unsubscribe {
        asset_id: AssetId,
        id: SubscriberId,
    },
    Abort {
        asset_id: AssetId,
        reply: oneshot::Sender<Option<Arc<Filmstrip>>>,
    },
    ClearAsset {
        asset_id: AssetId,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearAll {
        reply: oneshot::Sender<Result<()>>,
    },
    Metrics {
        reply: oneshot::Sender<MetricsSnapshot>,
    },
    Stats {
        reply: oneshot::Sender<ServiceStats>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
    StoreLoaded {
        asset_id: AssetId,
        generation: u64,
        stored: StoredFilmstrip,
    },
    FramesLoaded {
        asset_id: AssetId,
        generation: u64,
        /// Restart count of the session when the read was issued.
        run: u32,
        frames: Result<Vec<(u32, Bytes)>>,
    },
    IdleExpired {
        asset_id: AssetId,
        token: u64,
    },
}

/// What the blob store held for an asset.
#[derive(Debug, Default)]
struct StoredFilmstrip {
    meta: Option<FilmstripMeta>,
    frames: Vec<(u32, Bytes)>,
}

/// An asset whose stored state is being read.
struct PendingLoad {
    generation: u64,
    source: SourceRef,
    duration: f64,
    window: Option<PriorityWindow>,
    transient: Vec<SubscriberId>,
}

struct IdleTimer {
    token: u64,
    task: JoinHandle<()>,
}

struct Orchestrator {
    config: Config,
    sampler: Sampler,
    store: Arc<dyn BlobStore>,
    cache: CacheStore,
    handles: HandleArena,
    sessions: HashMap<AssetId, ExtractionSession>,
    queue: AdmissionQueue,
    loading: HashMap<AssetId, PendingLoad>,
    pool: WorkerPool,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    worker_owners: HashMap<WorkerId, AssetId>,
    monitor: MemoryMonitor,
    pressure: MemoryPressure,
    metrics: MetricsRing,
    idle_timers: HashMap<AssetId, IdleTimer>,
    /// Last store operation issued per asset; the next one waits for it.
    store_ops: HashMap<AssetId, JoinHandle<()>>,
    /// Flips to `true` once the latest `clear_all` reached the store.
    clear_done: Option<watch::Receiver<bool>>,
    self_tx: mpsc::WeakUnboundedSender<Command>,
    cores: usize,
    dispatched: u64,
    next_generation: u64,
    next_request: u64,
    next_timer: u64,
}

/// Snapshot of a session's parameters needed to start a follow-up session.
struct Refinement {
    source: SourceRef,
    duration: f64,
    window: PriorityWindow,
}

impl Orchestrator {
    fn new(
        config: Config,
        store: Arc<dyn BlobStore>,
        decoders: Decoders,
        probe: Arc<dyn MemoryPressureProbe>,
        self_tx: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            store: Arc::clone(&store),
            decoders,
        };
        let cores = config
            .extraction
            .cpu_count
            .unwrap_or_else(num_cpus::get)
            .max(1);
        tracing::info!(
            cores,
            store = store.name(),
            probe = probe.name(),
            "Filmstrip orchestrator starting"
        );
        Self {
            sampler: Sampler::new(&config.sampling),
            store,
            cache: CacheStore::new(),
            handles: HandleArena::new(),
            sessions: HashMap::new(),
            queue: AdmissionQueue::new(),
            loading: HashMap::new(),
            pool: WorkerPool::new(ctx, events_tx, config.extraction.max_idle_workers),
            events,
            worker_owners: HashMap::new(),
            monitor: MemoryMonitor::new(&config.memory, probe),
            pressure: MemoryPressure::Normal,
            metrics: MetricsRing::new(config.cache.metrics_capacity),
            idle_timers: HashMap::new(),
            store_ops: HashMap::new(),
            clear_done: None,
            self_tx,
            cores,
            dispatched: 0,
            next_generation: 0,
            next_request: 0,
            next_timer: 0,
            config,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Dispose { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.handle_worker_event(event),
            }
        }
        tracing::info!("Filmstrip orchestrator stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::GetFilmstrip { request, reply } => {
                let filmstrip = self.get_filmstrip(request);
                let _ = reply.send(filmstrip);
            }
            Command::Subscribe {
                asset_id,
                callback,
                reply,
            } => {
                self.cancel_idle_timer(&asset_id);
                let id = self.cache.subscribe(&asset_id, callback);
                let _ = reply.send(id);
            }
            Command::Unsubscribe { asset_id, id } => {
                if self.cache.unsubscribe(&asset_id, id) {
                    self.arm_idle_timer(&asset_id);
                }
            }
            Command::Abort { asset_id, reply } => {
                let _ = reply.send(self.abort(&asset_id));
            }
            Command::ClearAsset { asset_id, reply } => self.clear_asset(asset_id, reply),
            Command::ClearAll { reply } => self.clear_all(reply),
            Command::Metrics { reply } => {
                let _ = reply.send(self.metrics.snapshot());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Dispose { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
            Command::StoreLoaded {
                asset_id,
                generation,
                stored,
            } => self.on_store_loaded(asset_id, generation, stored),
            Command::FramesLoaded {
                asset_id,
                generation,
                run,
                frames,
            } => self.on_frames_loaded(&asset_id, generation, run, frames),
            Command::IdleExpired { asset_id, token } => self.on_idle_expired(&asset_id, token),
        }
    }

    // -- get -----------------------------------------------------------------

    fn get_filmstrip(&mut self, request: FilmstripRequest) -> Arc<Filmstrip> {
        let now = Instant::now();
        let FilmstripRequest {
            asset_id,
            source,
            duration,
            priority_window,
            on_progress,
        } = request;
        let total = total_frames(duration, self.config.sampling.frame_rate);
        let window = priority_window.and_then(|w| w.clamp(total));

        self.cancel_idle_timer(&asset_id);

        if let Some(session) = self.sessions.get_mut(&asset_id) {
            if let Some(callback) = on_progress {
                let id = self.cache.subscribe_transient(&asset_id, callback);
                session.transient_subscribers.push(id);
            }
            let priority = self.sampler.priority_indices(session.total_frames, window);
            if priority
                .iter()
                .any(|i| !session.targets.contains(i) && !session.frames.contains_key(i))
            {
                tracing::debug!(asset_id = %asset_id, "Priority window queued behind running session");
                session.pending_window = window;
            }
            let snapshot = session.in_flight_snapshot();
            return self
                .cache
                .get(&asset_id, now)
                .unwrap_or_else(|| Arc::new(snapshot));
        }

        if let Some(load) = self.loading.get_mut(&asset_id) {
            if let Some(callback) = on_progress {
                load.transient
                    .push(self.cache.subscribe_transient(&asset_id, callback));
            }
            if window.is_some() {
                load.window = window;
            }
            return self
                .cache
                .get(&asset_id, now)
                .unwrap_or_else(|| Arc::new(Filmstrip::pending()));
        }

        let Some(current) = self.cache.get(&asset_id, now) else {
            let placeholder = Arc::new(Filmstrip::pending());
            self.cache.insert(&asset_id, Arc::clone(&placeholder), now);
            let transient = on_progress
                .map(|cb| self.cache.subscribe_transient(&asset_id, cb))
                .into_iter()
                .collect();
            self.start_load(asset_id, source, duration, window, transient);
            return placeholder;
        };

        let priority = self.sampler.priority_indices(total, window);
        let missing_priority: Vec<u32> = priority
            .iter()
            .copied()
            .filter(|i| !current.contains_index(*i))
            .collect();

        if current.is_complete && missing_priority.is_empty() {
            if let Some(callback) = on_progress {
                callback(Arc::clone(&current));
            }
            self.arm_idle_timer(&asset_id);
            return current;
        }

        let transient = on_progress
            .map(|cb| self.cache.subscribe_transient(&asset_id, cb))
            .into_iter()
            .collect();
        let known: Vec<FilmstripFrame> = current.frames.clone();
        let (base_complete, targets) = if current.is_complete {
            (true, missing_priority)
        } else {
            let targets = self
                .sampler
                .target_indices(total, window)
                .into_iter()
                .filter(|i| !current.contains_index(*i))
                .collect();
            (false, targets)
        };

        self.next_generation += 1;
        let plan = SessionPlan {
            asset_id: asset_id.clone(),
            generation: self.next_generation,
            source,
            duration,
            total_frames: total,
            base_complete,
            targets,
            priority,
            known_frames: known,
        };
        self.begin_session(plan, transient);
        self.enforce_pressure();

        self.cache.get(&asset_id, now).unwrap_or(current)
    }

    // -- store loading ---------------------------------------------------------

    fn start_load(
        &mut self,
        asset_id: AssetId,
        source: SourceRef,
        duration: f64,
        window: Option<PriorityWindow>,
        transient: Vec<SubscriberId>,
    ) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.loading.insert(
            asset_id.clone(),
            PendingLoad {
                generation,
                source,
                duration,
                window,
                transient,
            },
        );

        let store = Arc::clone(&self.store);
        let tx = self.self_tx.clone();
        let key = asset_id.clone();
        self.sequence_store_op(&key, async move {
            let stored = match load_stored(store.as_ref(), &asset_id).await {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::warn!(asset_id = %asset_id, "Failed to read stored filmstrip: {e}");
                    StoredFilmstrip::default()
                }
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::StoreLoaded {
                    asset_id,
                    generation,
                    stored,
                });
            }
        });
    }

    fn on_store_loaded(&mut self, asset_id: AssetId, generation: u64, stored: StoredFilmstrip) {
        if self
            .loading
            .get(&asset_id)
            .map_or(true, |load| load.generation != generation)
        {
            return;
        }
        let Some(load) = self.loading.remove(&asset_id) else {
            return;
        };

        let rate = self.config.sampling.frame_rate;
        let total = total_frames(load.duration, rate);
        let frames: Vec<FilmstripFrame> = stored
            .frames
            .into_iter()
            .map(|(index, bytes)| {
                FilmstripFrame::new(index, rate, self.handles.issue(&asset_id, index, bytes))
            })
            .collect();
        let known: HashSet<u32> = frames.iter().map(|f| f.index).collect();
        let complete = stored.meta.is_some_and(|m| m.is_complete);
        let priority = self.sampler.priority_indices(total, load.window);
        let missing_priority: Vec<u32> = priority
            .iter()
            .copied()
            .filter(|i| !known.contains(i))
            .collect();

        tracing::debug!(
            asset_id = %asset_id,
            stored_frames = frames.len(),
            complete,
            "Loaded stored filmstrip"
        );

        if complete && missing_priority.is_empty() {
            let filmstrip = Arc::new(Filmstrip::from_frames(frames, true, false, 100));
            self.publish(&asset_id, filmstrip);
            self.release_transients(&asset_id, &load.transient);
            self.arm_idle_timer(&asset_id);
            self.enforce_pressure();
            return;
        }

        let targets = if complete {
            missing_priority
        } else {
            self.sampler
                .target_indices(total, load.window)
                .into_iter()
                .filter(|i| !known.contains(i))
                .collect()
        };
        let plan = SessionPlan {
            asset_id,
            generation,
            source: load.source,
            duration: load.duration,
            total_frames: total,
            base_complete: complete,
            targets,
            priority,
            known_frames: frames,
        };
        self.begin_session(plan, load.transient);
        self.enforce_pressure();
    }

    fn on_frames_loaded(
        &mut self,
        asset_id: &AssetId,
        generation: u64,
        run: u32,
        frames: Result<Vec<(u32, Bytes)>>,
    ) {
        let rate = self.config.sampling.frame_rate;
        let Some(session) = self.sessions.get_mut(asset_id) else {
            return;
        };
        if session.generation != generation {
            return;
        }
        let current_run = session.retries == run;
        if current_run {
            session.pending_reads = session.pending_reads.saturating_sub(1);
        }
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) if current_run => {
                self.on_worker_error(asset_id, e.to_string());
                return;
            }
            Err(e) => {
                tracing::debug!(asset_id = %asset_id, "Ignoring failed read-back of an earlier run: {e}");
                return;
            }
        };
        for (index, bytes) in frames {
            let handle = self.handles.issue(asset_id, index, bytes);
            session.insert_frame(FilmstripFrame::new(index, rate, handle));
        }

        if session.ready_to_finalize() {
            self.finalize_session(asset_id);
            return;
        }
        let now = Instant::now();
        if session.throttle.should_emit(session.frames.len(), now) {
            let snapshot = Arc::new(session.in_flight_snapshot());
            self.publish(asset_id, snapshot);
        }
    }

    // -- session lifecycle ---------------------------------------------------

    fn begin_session(&mut self, plan: SessionPlan, transient: Vec<SubscriberId>) {
        let now = Instant::now();
        let asset_id = plan.asset_id.clone();
        let throttle = ProgressThrottle::new(
            self.config.extraction.progress_frame_delta,
            Duration::from_millis(self.config.extraction.progress_min_interval_ms),
            plan.known_frames.len(),
            now,
        );
        let mut session = ExtractionSession::new(plan, throttle, now);
        session.transient_subscribers = transient;

        tracing::debug!(
            asset_id = %asset_id,
            targets = session.targets.len(),
            remaining = session.remaining_count(),
            refinement = session.base_complete,
            "Created extraction session"
        );

        self.cancel_idle_timer(&asset_id);
        let nothing_to_do = session.remaining_count() == 0;
        self.sessions.insert(asset_id.clone(), session);
        if nothing_to_do {
            self.finalize_session(&asset_id);
        } else {
            self.admit(&asset_id);
        }
    }

    fn admit(&mut self, asset_id: &AssetId) {
        self.refresh_pressure();
        if self.should_defer(asset_id) {
            self.defer_session(asset_id);
            return;
        }
        if self.active_count() < self.concurrency_cap() {
            self.activate(asset_id);
            return;
        }

        let Some(session) = self.sessions.get(asset_id) else {
            return;
        };
        let remaining = session.remaining_count();
        let snapshot = Arc::new(session.in_flight_snapshot());
        self.queue.push(asset_id.clone(), remaining);
        tracing::debug!(
            asset_id = %asset_id,
            remaining,
            queued = self.queue.len(),
            "Session queued for a free slot"
        );
        self.publish(asset_id, snapshot);
    }

    /// Under hard pressure only assets someone subscribed to may start.
    fn should_defer(&self, asset_id: &AssetId) -> bool {
        self.pressure == MemoryPressure::Hard && !self.cache.has_persistent_subscribers(asset_id)
    }

    fn defer_session(&mut self, asset_id: &AssetId) {
        let Some(session) = self.sessions.remove(asset_id) else {
            return;
        };
        self.queue.remove(asset_id);
        tracing::info!(
            asset_id = %asset_id,
            pressure = %self.pressure,
            "Deferring extraction under memory pressure"
        );
        let snapshot = Arc::new(session.snapshot(session.base_complete, false, session.progress()));
        self.publish(asset_id, snapshot);
        self.release_transients(asset_id, &session.transient_subscribers);
        self.arm_idle_timer(asset_id);
    }

    fn activate(&mut self, asset_id: &AssetId) {
        let extraction = &self.config.extraction;
        let Some(session) = self.sessions.get_mut(asset_id) else {
            return;
        };
        let remaining = session.remaining();
        if remaining.is_empty() {
            self.finalize_session(asset_id);
            return;
        }

        let workers = plan_workers(
            extraction.max_workers_per_session,
            extraction.min_cores_for_parallel,
            extraction.min_frames_for_parallel,
            self.cores,
            self.pressure,
            session,
            remaining.len(),
        );
        let path = match (session.strategy, workers) {
            (DecodeStrategy::SeekCapture, _) => DecodePath::Element,
            (DecodeStrategy::Fast, n) if n > 1 => DecodePath::Parallel,
            (DecodeStrategy::Fast, _) => DecodePath::SingleWorker,
        };
        session.begin_run(path, workers);

        let skip: Vec<u32> = session.frames.keys().copied().collect();
        let targets: Vec<u32> = session.targets.iter().copied().collect();
        for (start_index, end_index) in partition(&remaining, workers) {
            let worker_id = self.pool.acquire();
            self.next_request += 1;
            let request_id = RequestId::new(self.next_request);
            let request = ExtractRequest {
                request_id,
                asset_id: asset_id.clone(),
                source: session.source.clone(),
                duration: session.duration,
                frame_size: extraction.frame_size(),
                skip_indices: skip.clone(),
                priority_indices: session.priority.clone(),
                target_indices: targets.clone(),
                start_index,
                end_index,
                total_frames: session.total_frames,
                max_parallel_writes: extraction.max_parallel_writes.max(1),
                frame_rate: self.config.sampling.frame_rate,
                strategy: session.strategy,
                inline_frame_bytes: extraction.inline_frame_bytes,
            };
            session.assignments.push(WorkerRangeAssignment {
                worker_id,
                request_id,
                start_index,
                end_index,
                completed: false,
                frame_count: 0,
            });
            self.worker_owners.insert(worker_id, asset_id.clone());
            self.pool.dispatch(worker_id, request);
            self.dispatched += 1;
        }

        tracing::info!(
            asset_id = %asset_id,
            path = %path,
            workers,
            frames = remaining.len(),
            "Extraction started"
        );
        let snapshot = Arc::new(session.in_flight_snapshot());
        self.publish(asset_id, snapshot);
    }

    /// Fill free slots from the admission queue.
    fn promote_queue(&mut self) {
        self.refresh_pressure();
        while self.active_count() < self.concurrency_cap() {
            let Some(asset_id) = self.queue.pop_front() else {
                break;
            };
            if !self.sessions.contains_key(&asset_id) {
                continue;
            }
            if self.should_defer(&asset_id) {
                self.defer_session(&asset_id);
                continue;
            }
            self.activate(&asset_id);
        }
    }

    fn finalize_session(&mut self, asset_id: &AssetId) {
        let Some(session) = self.sessions.remove(asset_id) else {
            return;
        };
        self.queue.remove(asset_id);
        let now = Instant::now();
        let filmstrip = Arc::new(session.snapshot(true, false, 100));
        let frame_size = self.config.extraction.frame_size();
        self.spawn_meta_write(
            asset_id,
            FilmstripMeta {
                width: frame_size.width,
                height: frame_size.height,
                is_complete: true,
                frame_count: filmstrip.len() as u32,
            },
        );
        self.publish(asset_id, filmstrip);

        let metrics = session.metrics(ExtractionOutcome::Completed, now);
        tracing::info!(
            asset_id = %asset_id,
            frames = metrics.frames_extracted,
            duration_ms = metrics.duration_ms,
            "Extraction complete"
        );
        self.metrics.record(metrics);
        self.release_transients(asset_id, &session.transient_subscribers);

        self.promote_queue();
        if let Some(window) = session.pending_window {
            self.start_refinement(
                asset_id,
                Refinement {
                    source: session.source.clone(),
                    duration: session.duration,
                    window,
                },
            );
        }
        self.arm_idle_timer(asset_id);
        self.enforce_pressure();
    }

    fn fail_session(&mut self, asset_id: &AssetId) {
        let Some(session) = self.sessions.remove(asset_id) else {
            return;
        };
        self.queue.remove(asset_id);
        self.teardown_workers(&session);
        let now = Instant::now();
        let filmstrip = Arc::new(session.snapshot(session.base_complete, false, session.progress()));
        if !session.base_complete && !filmstrip.is_empty() {
            let frame_size = self.config.extraction.frame_size();
            self.spawn_meta_write(
                asset_id,
                FilmstripMeta {
                    width: frame_size.width,
                    height: frame_size.height,
                    is_complete: false,
                    frame_count: filmstrip.len() as u32,
                },
            );
        }
        self.publish(asset_id, filmstrip);

        let metrics = session.metrics(ExtractionOutcome::Failed, now);
        tracing::warn!(
            asset_id = %asset_id,
            paths = ?metrics.decode_paths,
            error = metrics.error.as_deref().unwrap_or("unknown"),
            "Extraction failed"
        );
        self.metrics.record(metrics);
        self.release_transients(asset_id, &session.transient_subscribers);

        self.promote_queue();
        self.arm_idle_timer(asset_id);
        self.enforce_pressure();
    }

    /// Follow-up session covering a priority window that arrived while the
    /// asset was already being extracted.
    fn start_refinement(&mut self, asset_id: &AssetId, refinement: Refinement) {
        let Some(current) = self.cache.peek(asset_id).cloned() else {
            return;
        };
        let total = total_frames(refinement.duration, self.config.sampling.frame_rate);
        let priority = self
            .sampler
            .priority_indices(total, refinement.window.clamp(total));
        let missing: Vec<u32> = priority
            .iter()
            .copied()
            .filter(|i| !current.contains_index(*i))
            .collect();
        if missing.is_empty() {
            return;
        }
        self.next_generation += 1;
        let plan = SessionPlan {
            asset_id: asset_id.clone(),
            generation: self.next_generation,
            source: refinement.source,
            duration: refinement.duration,
            total_frames: total,
            base_complete: current.is_complete,
            targets: missing,
            priority,
            known_frames: current.frames.clone(),
        };
        self.begin_session(plan, Vec::new());
    }

    // -- worker events -------------------------------------------------------

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        let WorkerEvent {
            worker_id,
            response,
        } = event;
        let Some(asset_id) = self.worker_owners.get(&worker_id).cloned() else {
            tracing::trace!(worker = %worker_id, "Dropping event from unowned worker");
            return;
        };
        let request_id = response.request_id();
        let current = self
            .sessions
            .get_mut(&asset_id)
            .and_then(|s| s.assignment_mut(worker_id, request_id))
            .is_some_and(|a| !a.completed);
        if !current {
            tracing::trace!(worker = %worker_id, request = %request_id, "Dropping stale worker event");
            return;
        }

        match response {
            WorkerResponse::Progress {
                frame_count,
                saved_frames,
                saved_indices,
                ..
            } => self.on_worker_progress(
                &asset_id,
                worker_id,
                request_id,
                frame_count,
                saved_frames,
                saved_indices,
            ),
            WorkerResponse::Complete { frame_count, .. } => {
                self.on_worker_complete(&asset_id, worker_id, request_id, frame_count)
            }
            WorkerResponse::Error { error, .. } => self.on_worker_error(&asset_id, error),
        }
    }

    fn on_worker_progress(
        &mut self,
        asset_id: &AssetId,
        worker_id: WorkerId,
        request_id: RequestId,
        frame_count: u32,
        saved_frames: Vec<SavedFrame>,
        saved_indices: Vec<u32>,
    ) {
        let rate = self.config.sampling.frame_rate;
        let Some(session) = self.sessions.get_mut(asset_id) else {
            return;
        };
        if let Some(assignment) = session.assignment_mut(worker_id, request_id) {
            assignment.frame_count = frame_count;
        }

        for SavedFrame { index, bytes } in saved_frames {
            let handle = self.handles.issue(asset_id, index, bytes);
            session.insert_frame(FilmstripFrame::new(index, rate, handle));
        }
        let unread: Vec<u32> = saved_indices
            .into_iter()
            .filter(|i| !session.frames.contains_key(i))
            .collect();
        if !unread.is_empty() {
            session.pending_reads += 1;
            spawn_frame_read(
                Arc::clone(&self.store),
                self.self_tx.clone(),
                asset_id.clone(),
                (session.generation, session.retries),
                unread,
            );
        }

        if session.throttle.should_emit(session.frames.len(), Instant::now()) {
            let snapshot = Arc::new(session.in_flight_snapshot());
            self.publish(asset_id, snapshot);
        }
    }

    fn on_worker_complete(
        &mut self,
        asset_id: &AssetId,
        worker_id: WorkerId,
        request_id: RequestId,
        frame_count: u32,
    ) {
        let Some(session) = self.sessions.get_mut(asset_id) else {
            return;
        };
        if let Some(assignment) = session.assignment_mut(worker_id, request_id) {
            assignment.completed = true;
            assignment.frame_count = frame_count;
        }
        let ready = session.ready_to_finalize();
        self.worker_owners.remove(&worker_id);
        self.pool.release(worker_id);
        tracing::debug!(asset_id = %asset_id, worker = %worker_id, frame_count, "Worker finished range");
        if ready {
            self.finalize_session(asset_id);
        }
    }

    fn on_worker_error(&mut self, asset_id: &AssetId, error: String) {
        let Some(session) = self.sessions.get(asset_id) else {
            return;
        };
        let kind = classify_failure(&error);
        let action = next_action(session.path, kind, session.fallback);
        tracing::warn!(
            asset_id = %asset_id,
            path = %session.path,
            ?kind,
            ?action,
            "Extraction worker failed: {error}"
        );

        let running: Vec<(WorkerId, RequestId)> = session
            .assignments
            .iter()
            .filter(|a| !a.completed)
            .map(|a| (a.worker_id, a.request_id))
            .collect();
        for (worker_id, request_id) in running {
            self.worker_owners.remove(&worker_id);
            self.pool.retire(worker_id, Some(request_id));
        }

        let Some(session) = self.sessions.get_mut(asset_id) else {
            return;
        };
        session.last_error = Some(error);
        match action {
            FallbackAction::RetrySingleWorker => {
                session.fallback.single_worker_tried = true;
                session.force_single_worker = true;
                session.prepare_restart();
                self.activate(asset_id);
            }
            FallbackAction::FallbackElement => {
                session.fallback.element_tried = true;
                session.strategy = DecodeStrategy::SeekCapture;
                session.force_single_worker = true;
                session.prepare_restart();
                self.activate(asset_id);
            }
            FallbackAction::Terminal => self.fail_session(asset_id),
        }
    }

    fn teardown_workers(&mut self, session: &ExtractionSession) {
        for assignment in session.assignments.iter().filter(|a| !a.completed) {
            self.worker_owners.remove(&assignment.worker_id);
            self.pool
                .retire(assignment.worker_id, Some(assignment.request_id));
        }
    }

    // -- abort and clear -----------------------------------------------------

    fn abort(&mut self, asset_id: &AssetId) -> Option<Arc<Filmstrip>> {
        if let Some(load) = self.loading.remove(asset_id) {
            tracing::debug!(asset_id = %asset_id, "Aborted before extraction started");
            let filmstrip = Arc::new(Filmstrip::default());
            self.publish(asset_id, Arc::clone(&filmstrip));
            self.release_transients(asset_id, &load.transient);
            self.arm_idle_timer(asset_id);
            return Some(filmstrip);
        }

        let Some(session) = self.sessions.remove(asset_id) else {
            return self.cache.peek(asset_id).cloned();
        };
        let was_queued = self.queue.remove(asset_id);
        self.teardown_workers(&session);

        let now = Instant::now();
        let filmstrip = Arc::new(session.snapshot(session.base_complete, false, session.progress()));
        self.publish(asset_id, Arc::clone(&filmstrip));

        let metrics = session.metrics(ExtractionOutcome::Aborted, now);
        tracing::info!(
            asset_id = %asset_id,
            frames = metrics.frames_extracted,
            queued = was_queued,
            "Extraction aborted"
        );
        self.metrics.record(metrics);
        self.release_transients(asset_id, &session.transient_subscribers);

        self.promote_queue();
        self.arm_idle_timer(asset_id);
        Some(self.cache.peek(asset_id).cloned().unwrap_or(filmstrip))
    }

    fn clear_asset(&mut self, asset_id: AssetId, reply: oneshot::Sender<Result<()>>) {
        if let Some(session) = self.sessions.remove(&asset_id) {
            self.teardown_workers(&session);
            self.release_transients(&asset_id, &session.transient_subscribers);
        }
        if let Some(load) = self.loading.remove(&asset_id) {
            self.release_transients(&asset_id, &load.transient);
        }
        self.queue.remove(&asset_id);
        self.cancel_idle_timer(&asset_id);
        self.cache.remove(&asset_id);
        let revoked = self.handles.release_asset(&asset_id);
        tracing::info!(asset_id = %asset_id, revoked, "Clearing asset");

        let store = Arc::clone(&self.store);
        let key = asset_id.clone();
        self.sequence_store_op(&key, async move {
            let _ = reply.send(store.delete_asset(&asset_id).await);
        });
        self.promote_queue();
        self.refresh_pressure();
    }

    fn clear_all(&mut self, reply: oneshot::Sender<Result<()>>) {
        let sessions: Vec<ExtractionSession> = self.sessions.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            self.teardown_workers(session);
            self.release_transients(&session.asset_id, &session.transient_subscribers);
        }
        let loads: Vec<(AssetId, PendingLoad)> = self.loading.drain().collect();
        for (asset_id, load) in &loads {
            self.release_transients(asset_id, &load.transient);
        }
        self.queue.clear();
        for (_, timer) in self.idle_timers.drain() {
            timer.task.abort();
        }
        let assets = self.cache.clear();
        let revoked = self.handles.release_all();
        tracing::info!(assets = assets.len(), revoked, "Clearing all filmstrips");

        let pending: Vec<JoinHandle<()>> = self.store_ops.drain().map(|(_, op)| op).collect();
        let previous = self.clear_done.take();
        let (done_tx, done_rx) = watch::channel(false);
        self.clear_done = Some(done_rx);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Some(mut previous) = previous {
                let _ = previous.wait_for(|done| *done).await;
            }
            for op in pending {
                let _ = op.await;
            }
            let _ = reply.send(store.clear().await);
            let _ = done_tx.send(true);
        });
        self.refresh_pressure();
    }

    // -- store sequencing -----------------------------------------------------

    /// Run a store operation for `asset_id` once every operation issued
    /// earlier for that asset, and any pending `clear_all`, has finished.
    fn sequence_store_op<F>(&mut self, asset_id: &AssetId, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.store_ops.retain(|_, task| !task.is_finished());
        if self.clear_done.as_ref().is_some_and(|done| *done.borrow()) {
            self.clear_done = None;
        }
        let previous = self.store_ops.remove(asset_id);
        let clear_done = self.clear_done.clone();
        let task = tokio::spawn(async move {
            if let Some(mut clear_done) = clear_done {
                let _ = clear_done.wait_for(|done| *done).await;
            }
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            op.await;
        });
        self.store_ops.insert(asset_id.clone(), task);
    }

    fn spawn_meta_write(&mut self, asset_id: &AssetId, meta: FilmstripMeta) {
        let store = Arc::clone(&self.store);
        let id = asset_id.clone();
        self.sequence_store_op(asset_id, async move {
            if let Err(e) = store.write_meta(&id, &meta).await {
                tracing::warn!(asset_id = %id, "Failed to persist filmstrip metadata: {e}");
            }
        });
    }

    fn shutdown(&mut self) {
        let sessions = self.sessions.len();
        self.sessions.clear();
        self.loading.clear();
        self.queue.clear();
        self.worker_owners.clear();
        self.pool.shutdown();
        for (_, timer) in self.idle_timers.drain() {
            timer.task.abort();
        }
        self.cache.clear_subscribers();
        tracing::info!(abandoned_sessions = sessions, "Filmstrip orchestrator shutting down");
    }

    // -- cache, pressure, eviction -------------------------------------------

    fn publish(&mut self, asset_id: &AssetId, filmstrip: Arc<Filmstrip>) {
        self.cache.notify_update(asset_id, filmstrip, Instant::now());
    }

    fn release_transients(&mut self, asset_id: &AssetId, ids: &[SubscriberId]) {
        for id in ids {
            self.cache.unsubscribe(asset_id, *id);
        }
    }

    fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    fn concurrency_cap(&self) -> usize {
        admission::concurrency_cap(self.cores, self.pressure)
    }

    fn refresh_pressure(&mut self) -> MemoryPressure {
        let pressure = self.monitor.sample(self.cache.footprint());
        if pressure != self.pressure {
            tracing::info!(
                from = %self.pressure,
                to = %pressure,
                cache_bytes = self.cache.footprint(),
                "Memory pressure changed"
            );
            self.pressure = pressure;
            let idle = match pressure {
                MemoryPressure::Hard => 0,
                _ => self.config.extraction.max_idle_workers,
            };
            self.pool.set_idle_capacity(idle);
        }
        pressure
    }

    /// Evict least recently used, unobserved, idle assets until the cache is
    /// back under the soft limit.
    fn enforce_pressure(&mut self) {
        if self.refresh_pressure() < MemoryPressure::Soft {
            return;
        }
        let victims = self
            .cache
            .eviction_candidates(self.monitor.soft_limit(), |asset| {
                self.cache.subscriber_count(asset) > 0
                    || self.sessions.contains_key(asset)
                    || self.loading.contains_key(asset)
            });
        for asset_id in victims {
            self.evict(&asset_id, "memory pressure");
        }
        self.refresh_pressure();
    }

    fn evict(&mut self, asset_id: &AssetId, reason: &str) {
        self.cancel_idle_timer(asset_id);
        let bytes = self
            .cache
            .remove(asset_id)
            .map_or(0, |f| f.size_bytes());
        let revoked = self.handles.release_asset(asset_id);
        tracing::debug!(asset_id = %asset_id, bytes, revoked, reason, "Evicted filmstrip from memory");
    }

    fn arm_idle_timer(&mut self, asset_id: &AssetId) {
        if !self.cache.contains(asset_id)
            || self.cache.subscriber_count(asset_id) > 0
            || self.sessions.contains_key(asset_id)
            || self.loading.contains_key(asset_id)
        {
            return;
        }
        self.cancel_idle_timer(asset_id);
        self.next_timer += 1;
        let token = self.next_timer;
        let delay = Duration::from_millis(self.config.cache.idle_eviction_ms);
        let tx = self.self_tx.clone();
        let id = asset_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::IdleExpired {
                    asset_id: id,
                    token,
                });
            }
        });
        self.idle_timers
            .insert(asset_id.clone(), IdleTimer { token, task });
    }

    fn cancel_idle_timer(&mut self, asset_id: &AssetId) {
        if let Some(timer) = self.idle_timers.remove(asset_id) {
            timer.task.abort();
        }
    }

    fn on_idle_expired(&mut self, asset_id: &AssetId, token: u64) {
        if self
            .idle_timers
            .get(asset_id)
            .map_or(true, |timer| timer.token != token)
        {
            return;
        }
        self.idle_timers.remove(asset_id);
        if self.cache.subscriber_count(asset_id) > 0
            || self.sessions.contains_key(asset_id)
            || self.loading.contains_key(asset_id)
        {
            return;
        }
        self.evict(asset_id, "idle");
        self.refresh_pressure();
    }

    fn stats(&self) -> ServiceStats {
        ServiceStats {
            active_sessions: self.active_count(),
            queued_sessions: self.queue.len(),
            loading_assets: self.loading.len(),
            live_workers: self.pool.live_count(),
            idle_workers: self.pool.idle_count(),
            dispatched_requests: self.dispatched,
            cached_assets: self.cache.len(),
            cache_bytes: self.cache.footprint(),
            outstanding_handles: self.handles.total_outstanding(),
            pressure: self.pressure,
            concurrency_cap: self.concurrency_cap(),
        }
    }
}

/// Workers for one run of a session.
fn plan_workers(
    max_workers: usize,
    min_cores: usize,
    min_frames: usize,
    cores: usize,
    pressure: MemoryPressure,
    session: &ExtractionSession,
    remaining: usize,
) -> usize {
    let parallel = !session.force_single_worker
        && session.strategy == DecodeStrategy::Fast
        && pressure == MemoryPressure::Normal
        && cores >= min_cores
        && remaining >= min_frames;
    let workers = if parallel { max_workers.max(1) } else { 1 };
    workers.min(remaining).max(1)
}

async fn load_stored(store: &dyn BlobStore, asset_id: &AssetId) -> Result<StoredFilmstrip> {
    let meta = store.read_meta(asset_id).await?;
    let indices = store.list_frames(asset_id).await?;
    let frames = store.read_frames(asset_id, &indices).await?;
    Ok(StoredFilmstrip { meta, frames })
}

/// Read frames a worker saved without inlining them. `run` is the session's
/// `(generation, retries)` at the time of the request.
fn spawn_frame_read(
    store: Arc<dyn BlobStore>,
    tx: mpsc::WeakUnboundedSender<Command>,
    asset_id: AssetId,
    (generation, run): (u64, u32),
    indices: Vec<u32>,
) {
    tokio::spawn(async move {
        let frames = store.read_frames(&asset_id, &indices).await;
        if let Err(e) = &frames {
            tracing::warn!(asset_id = %asset_id, "Failed to read back saved frames: {e}");
        }
        if let Some(tx) = tx.upgrade() {
            let _ = tx.send(Command::FramesLoaded {
                asset_id,
                generation,
                run,
                frames,
            });
        }
    });
}
