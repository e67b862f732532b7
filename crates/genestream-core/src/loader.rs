//! Streaming loader orchestration.
//!
//! Composes the admission controller, buffer estimator, staging buffer,
//! waiter registry and run controller into a prefetching pipeline:
//!
//! ```text
//! keys ─▶ Backlog ─▶ admission ─▶ ItemStore::load (spawned) ─▶ StagingBuffer ─▶ Stream
//!             ▲            ▲                                    │    │
//!             │            └──────── re-run after every change ─┘    └─▶ waiters
//!             └── promote (consumer blocked on a key), requeue (evicted under pressure)
//! ```
//!
//! All run state sits behind one mutex that is only held for short,
//! non-awaiting sections. Loads run as tokio tasks and carry the generation
//! of the run that started them; completions from an older run are discarded
//! and their vectors released.
//!
//! Items are yielded strictly in input order. Failed keys are skipped without
//! surfacing an error, and only call-time precondition violations return one.

use crate::admission::{AdmissionController, Backlog};
use crate::config::{ConfigSource, LoaderConfig};
use crate::error::{Error, LoadError};
use crate::estimator::{BufferSizeEstimator, EstimatorSettings};
use crate::groups::GroupSpec;
use crate::metrics::LoaderMetrics;
use crate::pressure::{PressureLevel, PressureSource};
use crate::run::{Generation, RunController, RunPhase, TeardownReason};
use crate::staging::{StagedItem, StagingBuffer};
use crate::stats::{ItemEvent, LoaderStats, Progress, RunStats};
use crate::store::{ExpressionVector, ItemStore, LoadedVector, ReleaseOptions};
use crate::waiters::{WaitSignal, WaiterId, WaiterRegistry};
use crate::Result;
use async_stream::stream;
use chrono::Utc;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback fired after each consumed item.
pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Callback fired on each load completion of the run.
pub type ItemCallback = Arc<dyn Fn(&ItemEvent) + Send + Sync>;

/// Per-call streaming options.
#[derive(Clone, Default)]
pub struct StreamOptions {
    /// Fired after each consumed item, yielded or skipped
    pub on_progress: Option<ProgressCallback>,
    /// Fired on each load completion
    pub on_item: Option<ItemCallback>,
    /// Bounded wait per item; falls back to the loader default
    pub wait_timeout: Option<Duration>,
}

impl StreamOptions {
    /// Options with no callbacks and the default wait bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the progress callback.
    pub fn with_progress(mut self, f: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Set the per-item callback.
    pub fn with_item_callback(mut self, f: impl Fn(&ItemEvent) + Send + Sync + 'static) -> Self {
        self.on_item = Some(Arc::new(f));
        self
    }

    /// Set the per-item wait bound.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_item", &self.on_item.is_some())
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

/// Group-derived values for one gene.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneValues {
    pub key: String,
    /// Position of the key in the input list
    pub index: usize,
    pub values: Vec<f32>,
}

/// Unprocessed vector for one gene.
///
/// The staged copy is released before this is yielded; the `Arc` keeps the
/// values alive for as long as the caller holds it.
#[derive(Debug, Clone)]
pub struct RawGene {
    pub key: String,
    pub index: usize,
    pub vector: ExpressionVector,
}

/// Several group extractions from one load.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiGroupValues {
    pub key: String,
    pub index: usize,
    /// One entry per requested group, in request order
    pub groups: Vec<Vec<f32>>,
}

/// Per-instance overrides applied on top of every config snapshot.
#[derive(Debug, Clone, Default)]
struct Overrides {
    min_buffer_size: Option<usize>,
    pressure_buffer_reduction_factor: Option<f64>,
    wait_timeout: Option<Duration>,
}

impl Overrides {
    fn apply(&self, mut config: LoaderConfig) -> LoaderConfig {
        if let Some(size) = self.min_buffer_size {
            config.min_buffer_size = size;
        }
        if let Some(factor) = self.pressure_buffer_reduction_factor {
            config.pressure_buffer_reduction_factor = factor;
        }
        if let Some(timeout) = self.wait_timeout {
            config = config.with_wait_timeout(timeout);
        }
        config
    }
}

/// Builder for [`StreamingLoader`].
pub struct LoaderBuilder {
    store: Arc<dyn ItemStore>,
    config_source: Option<Arc<dyn ConfigSource>>,
    pressure: Option<Arc<dyn PressureSource>>,
    overrides: Overrides,
}

impl LoaderBuilder {
    /// Set the source of tuning defaults.
    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = Some(source);
        self
    }

    /// Set the memory pressure source.
    pub fn pressure_source(mut self, source: Arc<dyn PressureSource>) -> Self {
        self.pressure = Some(source);
        self
    }

    /// Override the minimum buffer size.
    pub fn min_buffer_size(mut self, size: usize) -> Self {
        self.overrides.min_buffer_size = Some(size);
        self
    }

    /// Override the warning/cleanup reduction factor.
    pub fn pressure_buffer_reduction_factor(mut self, factor: f64) -> Self {
        self.overrides.pressure_buffer_reduction_factor = Some(factor);
        self
    }

    /// Override the default per-item wait bound.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.overrides.wait_timeout = Some(timeout);
        self
    }

    /// Build the loader.
    pub fn build(self) -> Result<StreamingLoader> {
        let config_source = self
            .config_source
            .unwrap_or_else(|| Arc::new(LoaderConfig::default()));

        let config = self.overrides.apply(config_source.snapshot());
        config.validate()?;

        let metrics = LoaderMetrics::new()?;
        let estimator =
            BufferSizeEstimator::new(EstimatorSettings::from(&config), self.store.population_size());
        metrics.set_effective_capacity(estimator.effective_capacity());

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = LoaderState {
            run: RunController::new(),
            admission: AdmissionController::new(config.network_concurrency),
            backlog: Backlog::new(),
            loading: HashSet::new(),
            staging: StagingBuffer::new(),
            waiters: WaiterRegistry::new(),
            estimator,
            stats: RunStats::default(),
            order: HashMap::new(),
            cursor: 0,
            pinned: None,
            evicted: HashSet::new(),
            on_item: None,
            wait_timeout: config.wait_timeout(),
            yield_every: config.yield_every,
            memory_budget_mb: None,
            monitor: None,
        };

        Ok(StreamingLoader {
            shared: Arc::new(Shared {
                store: self.store,
                config_source,
                pressure: self.pressure,
                overrides: self.overrides,
                metrics,
                shutdown_tx,
                state: Mutex::new(state),
            }),
        })
    }
}

/// Prefetching loader that streams expression vectors in request order.
///
/// Cheap to clone; clones share the same run state. Starting a stream while
/// another is active supersedes the older one.
#[derive(Clone)]
pub struct StreamingLoader {
    shared: Arc<Shared>,
}

impl fmt::Debug for StreamingLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("StreamingLoader")
            .field("generation", &state.run.generation())
            .field("phase", &state.run.phase())
            .field("effective_capacity", &state.estimator.effective_capacity())
            .finish_non_exhaustive()
    }
}

impl StreamingLoader {
    /// Start building a loader over `store`.
    pub fn builder(store: Arc<dyn ItemStore>) -> LoaderBuilder {
        LoaderBuilder {
            store,
            config_source: None,
            pressure: None,
            overrides: Overrides::default(),
        }
    }

    /// Stream group-derived values for `keys`.
    ///
    /// Starts the run and its first loads immediately, so this must be called
    /// inside a Tokio runtime. Dropping the stream tears the run down.
    pub fn stream<I, S>(
        &self,
        keys: I,
        group: GroupSpec,
        options: StreamOptions,
    ) -> Result<impl Stream<Item = GeneValues> + Send + 'static>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stream_group(collect_keys(keys), group, options)
    }

    /// Stream unprocessed vectors for `keys`.
    pub fn stream_raw<I, S>(
        &self,
        keys: I,
        options: StreamOptions,
    ) -> Result<impl Stream<Item = RawGene> + Send + 'static>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_stream(collect_keys(keys), options, |key, index, vector| RawGene {
            key,
            index,
            vector,
        })
    }

    /// Stream several group extractions per key, one load each.
    pub fn stream_multi<I, S>(
        &self,
        keys: I,
        groups: Vec<GroupSpec>,
        options: StreamOptions,
    ) -> Result<impl Stream<Item = MultiGroupValues> + Send + 'static>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stream_groups(collect_keys(keys), groups, options)
    }

    fn stream_group(
        &self,
        keys: Vec<String>,
        group: GroupSpec,
        options: StreamOptions,
    ) -> Result<impl Stream<Item = GeneValues> + Send + 'static> {
        group.validate()?;
        self.run_stream(keys, options, move |key, index, vector| GeneValues {
            key,
            index,
            values: group.extract(&vector),
        })
    }

    fn stream_groups(
        &self,
        keys: Vec<String>,
        groups: Vec<GroupSpec>,
        options: StreamOptions,
    ) -> Result<impl Stream<Item = MultiGroupValues> + Send + 'static> {
        if groups.is_empty() {
            return Err(Error::InvalidRequest("At least one group is required".into()));
        }
        for group in &groups {
            group.validate()?;
        }
        self.run_stream(keys, options, move |key, index, vector| MultiGroupValues {
            key,
            index,
            groups: groups.iter().map(|g| g.extract(&vector)).collect(),
        })
    }

    fn run_stream<T, F>(
        &self,
        keys: Vec<String>,
        options: StreamOptions,
        make: F,
    ) -> Result<impl Stream<Item = T> + Send + 'static>
    where
        T: Send + 'static,
        F: Fn(String, usize, ExpressionVector) -> T + Send + 'static,
    {
        validate_keys(&keys)?;
        let guard = self.shared.start_run(&keys, &options)?;
        let shared = Arc::clone(&self.shared);

        let (wait_timeout, yield_every) = {
            let state = shared.state.lock();
            (
                options.wait_timeout.unwrap_or(state.wait_timeout),
                state.yield_every,
            )
        };
        let on_progress = options.on_progress;

        Ok(stream! {
            let guard = guard;
            let generation = guard.generation;
            let total = keys.len();
            let mut yielded = 0usize;

            for (index, key) in keys.into_iter().enumerate() {
                let next = shared.next_item(generation, index, &key, wait_timeout).await;

                if let Some(callback) = &on_progress {
                    if !matches!(next, Next::End) {
                        callback(&shared.progress(index + 1, total));
                    }
                }

                match next {
                    Next::Item(vector) => {
                        shared.metrics.record_yield();
                        yield make(key, index, vector);
                        yielded += 1;
                        if yielded % yield_every == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                    Next::Skipped(error) => {
                        debug!(key = %key, index, error = %error, "Skipping item");
                    }
                    Next::End => break,
                }
            }

            guard.complete();
        })
    }

    /// Wait until `key` of the current run is staged and return its vector
    /// without consuming it.
    ///
    /// Promotes the key to the front of the backlog. A timeout does not
    /// cancel the load. Returns [`LoadError::NotRequested`] for keys outside
    /// the run or already consumed.
    pub async fn wait_for(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> std::result::Result<ExpressionVector, LoadError> {
        self.shared.wait_for(key, timeout).await
    }

    /// Abort the current run. Returns whether a run was torn down.
    pub fn abort(&self) -> bool {
        let generation = self.shared.state.lock().run.generation();
        self.shared.teardown(generation, TeardownReason::Aborted)
    }

    /// Sender that aborts the current run when signalled.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shared.shutdown_tx.clone()
    }

    /// Replace the memory budget. Returns the new effective capacity.
    pub fn set_memory_budget_mb(&self, memory_budget_mb: f64) -> Result<usize> {
        if memory_budget_mb.is_nan() || memory_budget_mb <= 0.0 {
            return Err(Error::InvalidRequest(format!(
                "memory budget must be positive, got {}",
                memory_budget_mb
            )));
        }

        let capacity = {
            let mut state = self.shared.state.lock();
            state.memory_budget_mb = Some(memory_budget_mb);
            let capacity = state
                .estimator
                .set_memory_budget(memory_budget_mb * 1024.0 * 1024.0);
            self.shared.metrics.set_effective_capacity(capacity);
            capacity
        };
        info!(memory_budget_mb, capacity, "Memory budget changed");

        self.shared.pump();
        Ok(capacity)
    }

    /// Snapshot of the current (or last) run.
    pub fn stats(&self) -> LoaderStats {
        self.shared.state.lock().snapshot()
    }

    /// Cumulative metrics.
    pub fn metrics(&self) -> &LoaderMetrics {
        &self.shared.metrics
    }

    /// Backlog keys, front first.
    pub fn queued_keys(&self) -> Vec<String> {
        self.shared.state.lock().backlog.snapshot()
    }

    /// Current effective capacity.
    pub fn effective_capacity(&self) -> usize {
        self.shared.state.lock().estimator.effective_capacity()
    }

    /// Generation of the current (or last) run.
    pub fn generation(&self) -> Generation {
        self.shared.state.lock().run.generation()
    }

    /// Phase of the current run.
    pub fn phase(&self) -> RunPhase {
        self.shared.state.lock().run.phase()
    }
}

fn collect_keys<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    keys.into_iter().map(Into::into).collect()
}

fn validate_keys(keys: &[String]) -> Result<()> {
    if keys.is_empty() {
        return Err(Error::InvalidRequest("Key list is empty".into()));
    }
    let mut seen = HashSet::with_capacity(keys.len());
    for key in keys {
        if key.is_empty() {
            return Err(Error::InvalidRequest("Keys must not be empty".into()));
        }
        if !seen.insert(key.as_str()) {
            return Err(Error::InvalidRequest(format!("Duplicate key: {}", key)));
        }
    }
    Ok(())
}

/// Outcome of waiting for the sequence's current key.
enum Next {
    Item(ExpressionVector),
    Skipped(LoadError),
    End,
}

/// Owned by the stream; tears the run down when dropped.
struct RunGuard {
    shared: Arc<Shared>,
    generation: Generation,
}

impl RunGuard {
    fn complete(&self) {
        self.shared.teardown(self.generation, TeardownReason::Completed);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // No-op when the run already ended or was superseded
        self.shared.teardown(self.generation, TeardownReason::Aborted);
    }
}

struct Shared {
    store: Arc<dyn ItemStore>,
    config_source: Arc<dyn ConfigSource>,
    pressure: Option<Arc<dyn PressureSource>>,
    overrides: Overrides,
    metrics: LoaderMetrics,
    shutdown_tx: broadcast::Sender<()>,
    state: Mutex<LoaderState>,
}

/// Run state guarded by the loader mutex.
struct LoaderState {
    run: RunController,
    admission: AdmissionController,
    backlog: Backlog,
    loading: HashSet<String>,
    staging: StagingBuffer,
    waiters: WaiterRegistry,
    estimator: BufferSizeEstimator,
    stats: RunStats,
    /// Key → position in the input list
    order: HashMap<String, usize>,
    /// Index of the key the sequence is on; everything below is done
    cursor: usize,
    /// Key the sequence is waiting on or taking, never evicted
    pinned: Option<String>,
    /// Keys evicted this run and not loaded again yet
    evicted: HashSet<String>,
    on_item: Option<ItemCallback>,
    wait_timeout: Duration,
    yield_every: usize,
    memory_budget_mb: Option<f64>,
    monitor: Option<JoinHandle<()>>,
}

impl LoaderState {
    fn index_of(&self, key: &str) -> Option<usize> {
        self.order.get(key).copied()
    }

    /// Check if the key is still ahead of (or at) the sequence.
    fn is_pending(&self, key: &str) -> bool {
        self.index_of(key).is_some_and(|i| i >= self.cursor)
    }

    fn admit(&mut self) -> Vec<String> {
        if self.run.phase() != RunPhase::Active {
            return Vec::new();
        }

        let capacity = self.estimator.effective_capacity();
        let buffered = self.staging.ready_count();
        let aborted = self.run.is_aborted();

        let mut admitted = Vec::new();
        if let Some(pinned) = &self.pinned {
            if self
                .admission
                .admit_pinned(&mut self.backlog, &mut self.loading, pinned, aborted)
            {
                admitted.push(pinned.clone());
            }
        }

        let staging = &self.staging;
        admitted.extend(self.admission.admit(
            &mut self.backlog,
            &mut self.loading,
            buffered,
            capacity,
            aborted,
            |k| staging.contains(k),
        ));

        for key in &admitted {
            if self.evicted.remove(key) {
                self.stats.reloads += 1;
            }
        }
        admitted
    }

    /// Make sure a key the consumer needs is loading, staged or queued.
    fn ensure_scheduled(&mut self, key: &str) {
        if !self.loading.contains(key) && !self.staging.contains(key) && !self.backlog.contains(key)
        {
            self.backlog.requeue_front(vec![key.to_string()]);
        }
        self.backlog.promote(key);
    }

    /// Move the sequence to `index`, dropping everything behind it.
    fn advance_cursor(&mut self, index: usize, key: &str, store: &dyn ItemStore) {
        self.cursor = index;
        self.pinned = Some(key.to_string());

        for (swept, item) in self.staging.remove_before(index) {
            if item.is_ready() {
                store.release(&swept, ReleaseOptions::preserving_active());
            }
            self.waiters
                .resolve(&swept, WaitSignal::Failed(LoadError::NotRequested(swept.clone())));
            debug!(key = %swept, "Swept staged item behind the sequence");
        }

        let order = &self.order;
        let dropped = self
            .backlog
            .retain(|k| order.get(k).map_or(true, |&i| i >= index));
        for swept in dropped {
            self.waiters
                .resolve(&swept, WaitSignal::Failed(LoadError::NotRequested(swept.clone())));
        }
    }

    /// Take the current key if staged and move the sequence past it.
    fn take_current(&mut self, index: usize, key: &str, store: &dyn ItemStore) -> Option<Next> {
        let next = match self.staging.take(key)? {
            StagedItem::Ready(vector) => {
                store.release(key, ReleaseOptions::force());
                self.stats.genes_yielded += 1;
                Next::Item(vector.values)
            }
            StagedItem::Failed(error) => Next::Skipped(error),
        };
        self.pass(index);
        Some(next)
    }

    fn pass(&mut self, index: usize) {
        self.cursor = index + 1;
        self.pinned = None;
    }

    /// Evict staged vectors beyond the effective capacity and requeue them.
    fn prune(&mut self, store: &dyn ItemStore) -> usize {
        let capacity = self.estimator.effective_capacity();
        let waiters = &self.waiters;
        let pinned = self.pinned.as_deref();

        let victims = self.staging.eviction_candidates(capacity, |k| {
            waiters.has_waiters(k) || pinned == Some(k)
        });
        if victims.is_empty() {
            return 0;
        }

        for key in &victims {
            self.staging.take(key);
            store.release(key, ReleaseOptions::preserving_active());
        }

        let mut requeue = victims;
        requeue.sort_by_key(|k| self.order.get(k).copied().unwrap_or(usize::MAX));
        let evicted = requeue.len();
        self.evicted.extend(requeue.iter().cloned());
        self.backlog.requeue_front(requeue);
        if let Some(pinned) = &self.pinned {
            self.backlog.promote(pinned);
        }

        self.stats.evictions += evicted as u64;
        evicted
    }

    fn publish(&self, metrics: &LoaderMetrics) {
        metrics.set_occupancy(self.staging.ready_count(), self.loading.len(), self.backlog.len());
        metrics.set_effective_capacity(self.estimator.effective_capacity());
    }

    fn snapshot(&self) -> LoaderStats {
        LoaderStats {
            genes_loaded: self.stats.genes_loaded,
            genes_failed: self.stats.genes_failed,
            genes_yielded: self.stats.genes_yielded,
            bytes_loaded: self.stats.bytes_loaded,
            duration_ms: self.stats.duration_ms(),
            buffer_size: self.staging.ready_count(),
            buffered_bytes: self.staging.ready_bytes(),
            loading_count: self.loading.len(),
            queued_count: self.backlog.len(),
            effective_capacity: self.estimator.effective_capacity(),
            bytes_per_item: self.estimator.bytes_per_item(),
            evictions: self.stats.evictions,
            reloads: self.stats.reloads,
            wait_timeouts: self.stats.wait_timeouts,
            pressure: self.estimator.pressure(),
            generation: self.run.generation(),
            phase: self.run.phase(),
            started_at: self.stats.started_at,
            ended_at: self.stats.ended_at,
        }
    }
}

impl Shared {
    fn resolved_config(&self, memory_budget_mb: Option<f64>) -> LoaderConfig {
        let mut config = self.overrides.apply(self.config_source.snapshot());
        if let Some(mb) = memory_budget_mb {
            config.memory_budget_mb = mb;
        }
        config
    }

    /// Starting → Active. Supersedes any active run.
    fn start_run(self: &Arc<Self>, keys: &[String], options: &StreamOptions) -> Result<RunGuard> {
        let population = self.store.population_size();
        let pressure_level = self
            .pressure
            .as_ref()
            .map(|p| p.current_level())
            .unwrap_or_default();

        let generation = {
            let mut guard = self.state.lock();
            let config = self.resolved_config(guard.memory_budget_mb);
            config.validate()?;

            let state = &mut *guard;
            if state.run.is_running() {
                let previous = state.run.generation();
                self.teardown_locked(state, previous, TeardownReason::Superseded);
            }

            let generation = state.run.begin();

            let mut estimator =
                BufferSizeEstimator::new(EstimatorSettings::from(&config), population);
            estimator.apply_pressure(pressure_level);

            state.admission = AdmissionController::new(config.network_concurrency);
            state.backlog = Backlog::from_keys(keys.iter().cloned());
            state.loading.clear();
            state.staging = StagingBuffer::new();
            state.waiters = WaiterRegistry::new();
            state.estimator = estimator;
            state.stats = RunStats::started_now();
            state.order = keys
                .iter()
                .enumerate()
                .map(|(i, k)| (k.clone(), i))
                .collect();
            state.cursor = 0;
            state.pinned = None;
            state.evicted.clear();
            state.on_item = options.on_item.clone();
            state.wait_timeout = config.wait_timeout();
            state.yield_every = config.yield_every;
            state.monitor = Some(self.spawn_monitor(generation));
            state.run.activate();

            self.metrics.record_run();
            state.publish(&self.metrics);

            info!(
                generation,
                keys = keys.len(),
                population,
                network_concurrency = config.network_concurrency,
                capacity = state.estimator.effective_capacity(),
                pressure = %pressure_level,
                "Run started"
            );
            generation
        };

        self.pump();

        Ok(RunGuard {
            shared: Arc::clone(self),
            generation,
        })
    }

    /// Admit as many backlog keys as the caps allow and start their loads.
    fn pump(self: &Arc<Self>) {
        let (generation, admitted) = {
            let mut state = self.state.lock();
            let reloads = state.stats.reloads;
            let admitted = state.admit();
            if !admitted.is_empty() {
                self.metrics
                    .record_reloads((state.stats.reloads - reloads) as usize);
                state.publish(&self.metrics);
            }
            (state.run.generation(), admitted)
        };

        for key in admitted {
            self.spawn_load(generation, key);
        }
    }

    fn spawn_load(self: &Arc<Self>, generation: Generation, key: String) {
        debug!(key = %key, generation, "Load admitted");
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let result = shared.store.load(&key).await.map_err(LoadError::from);
            shared.complete(generation, key, result, started.elapsed());
        });
    }

    fn complete(
        self: &Arc<Self>,
        generation: Generation,
        key: String,
        result: std::result::Result<LoadedVector, LoadError>,
        elapsed: Duration,
    ) {
        let (event, on_item) = {
            let mut state = self.state.lock();

            if !state.run.accepts_completions(generation) || !state.loading.remove(&key) {
                if result.is_ok() {
                    self.store.release(&key, ReleaseOptions::preserving_active());
                }
                self.metrics.record_stale_completion();
                debug!(key = %key, generation, current = state.run.generation(), "Discarded stale completion");
                return;
            }

            let pending = state.is_pending(&key);
            let index = state.index_of(&key).unwrap_or(usize::MAX);

            let event = match result {
                Ok(vector) => {
                    state.stats.genes_loaded += 1;
                    state.stats.bytes_loaded += vector.byte_size as u64;
                    self.metrics.record_load(vector.byte_size, elapsed);
                    if state.estimator.observe(vector.byte_size) {
                        debug!(
                            capacity = state.estimator.effective_capacity(),
                            bytes_per_item = state.estimator.bytes_per_item() as u64,
                            "Effective capacity changed"
                        );
                    }

                    if pending {
                        let values = Arc::clone(&vector.values);
                        state.staging.insert_ready(key.clone(), index, vector);
                        state.waiters.resolve(&key, WaitSignal::Ready(values));
                    } else {
                        self.store.release(&key, ReleaseOptions::preserving_active());
                        state
                            .waiters
                            .resolve(&key, WaitSignal::Failed(LoadError::NotRequested(key.clone())));
                    }

                    debug!(key = %key, elapsed_ms = elapsed.as_millis() as u64, "Load completed");
                    ItemEvent::loaded(key)
                }
                Err(error) => {
                    state.stats.genes_failed += 1;
                    self.metrics.record_failure(&error, elapsed);
                    warn!(key = %key, error = %error, "Load failed; item will be skipped");

                    if pending {
                        state.staging.insert_failed(key.clone(), index, error.clone());
                    }
                    state
                        .waiters
                        .resolve(&key, WaitSignal::Failed(error.clone()));
                    ItemEvent::failed(key, error)
                }
            };

            state.publish(&self.metrics);
            (event, state.on_item.clone())
        };

        if let Some(callback) = on_item {
            callback(&event);
        }
        self.pump();
    }

    /// Wait for the sequence's current key, then take it.
    async fn next_item(
        self: &Arc<Self>,
        generation: Generation,
        index: usize,
        key: &str,
        timeout: Duration,
    ) -> Next {
        {
            let mut state = self.state.lock();
            if !state.run.accepts_completions(generation) {
                return Next::End;
            }
            state.advance_cursor(index, key, self.store.as_ref());
            state.publish(&self.metrics);
        }
        self.pump();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut registration: Option<WaiterId> = None;
        let mut timed_out = false;

        loop {
            let receiver = {
                let mut state = self.state.lock();
                if let Some(id) = registration.take() {
                    state.waiters.cancel(key, id);
                }
                if !state.run.accepts_completions(generation) {
                    return Next::End;
                }
                if let Some(next) = state.take_current(index, key, self.store.as_ref()) {
                    state.publish(&self.metrics);
                    return next;
                }
                if timed_out {
                    state.stats.wait_timeouts += 1;
                    state.pass(index);
                    self.metrics.record_wait_timeout();
                    warn!(
                        key = %key,
                        index,
                        timeout_ms = timeout.as_millis() as u64,
                        "Timed out waiting for item; skipping"
                    );
                    return Next::Skipped(LoadError::Timeout(timeout));
                }

                state.ensure_scheduled(key);
                let (id, receiver) = state.waiters.register(key);
                registration = Some(id);
                receiver
            };

            self.pump();

            match tokio::time::timeout_at(deadline, receiver).await {
                Ok(Ok(WaitSignal::Failed(error))) if error.is_terminal() => return Next::End,
                Ok(_) => {}
                Err(_) => timed_out = true,
            }
        }
    }

    async fn wait_for(
        self: &Arc<Self>,
        key: &str,
        timeout: Option<Duration>,
    ) -> std::result::Result<ExpressionVector, LoadError> {
        let (id, receiver, timeout) = {
            let mut state = self.state.lock();
            if !state.run.is_running() || !state.is_pending(key) {
                return Err(LoadError::NotRequested(key.to_string()));
            }
            match state.staging.get(key) {
                Some(StagedItem::Ready(vector)) => return Ok(Arc::clone(&vector.values)),
                Some(StagedItem::Failed(error)) => return Err(error.clone()),
                None => {}
            }

            state.ensure_scheduled(key);
            let (id, receiver) = state.waiters.register(key);
            (id, receiver, timeout.unwrap_or(state.wait_timeout))
        };
        debug!(key = %key, "Waiting for item");

        self.pump();

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(WaitSignal::Ready(values))) => Ok(values),
            Ok(Ok(WaitSignal::Failed(error))) => Err(error),
            Ok(Err(_)) => Err(LoadError::Aborted),
            Err(_) => {
                {
                    let mut state = self.state.lock();
                    state.waiters.cancel(key, id);
                    state.stats.wait_timeouts += 1;
                }
                self.metrics.record_wait_timeout();
                warn!(key = %key, timeout_ms = timeout.as_millis() as u64, "Timed out waiting for item");
                Err(LoadError::Timeout(timeout))
            }
        }
    }

    fn on_pressure(self: &Arc<Self>, generation: Generation, level: PressureLevel) {
        {
            let mut state = self.state.lock();
            if !state.run.is_current(generation) || !state.run.is_running() {
                return;
            }

            let previous = state.estimator.effective_capacity();
            let capacity = state.estimator.apply_pressure(level);
            let evicted = if level.is_elevated() {
                state.prune(self.store.as_ref())
            } else {
                0
            };
            self.metrics.record_evictions(evicted);
            state.publish(&self.metrics);

            info!(
                level = %level,
                previous,
                capacity,
                evicted,
                buffered = state.staging.ready_count(),
                "Memory pressure changed"
            );
        }
        self.pump();
    }

    fn progress(&self, consumed: usize, total: usize) -> Progress {
        let state = self.state.lock();
        Progress {
            loaded: consumed,
            total,
            buffered: state.staging.ready_count(),
            loading: state.loading.len(),
            queued: state.backlog.len(),
        }
    }

    /// Listen for pressure transitions and shutdown signals for one run.
    fn spawn_monitor(self: &Arc<Self>, generation: Generation) -> JoinHandle<()> {
        let mut pressure_rx = self.pressure.as_ref().map(|p| p.subscribe());
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let weak: Weak<Shared> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut pressure_open = pressure_rx.is_some();
            loop {
                tokio::select! {
                    signal = shutdown_rx.recv() => {
                        if !matches!(signal, Err(RecvError::Closed)) {
                            info!(generation, "Shutdown signal received, aborting run");
                            if let Some(shared) = weak.upgrade() {
                                shared.teardown(generation, TeardownReason::Aborted);
                            }
                        }
                        break;
                    }
                    level = next_level(&mut pressure_rx), if pressure_open => {
                        match (level, weak.upgrade()) {
                            (Some(level), Some(shared)) => shared.on_pressure(generation, level),
                            (None, _) => pressure_open = false,
                            (_, None) => break,
                        }
                    }
                }
            }
        })
    }

    fn teardown(&self, generation: Generation, reason: TeardownReason) -> bool {
        let mut state = self.state.lock();
        self.teardown_locked(&mut state, generation, reason)
    }

    /// Active → Draining → Idle. Idempotent per generation.
    fn teardown_locked(
        &self,
        state: &mut LoaderState,
        generation: Generation,
        reason: TeardownReason,
    ) -> bool {
        if !state.run.begin_drain(generation) {
            return false;
        }

        state.backlog.clear();
        let released_waiters = state
            .waiters
            .release_all(WaitSignal::Failed(LoadError::Aborted));

        let mut released_items = 0;
        for (key, item) in state.staging.drain() {
            if item.is_ready() {
                self.store.release(&key, ReleaseOptions::preserving_active());
                released_items += 1;
            }
        }

        // In-flight loads finish on their own and release themselves
        let in_flight = state.loading.len();
        state.loading.clear();
        state.pinned = None;
        state.on_item = None;

        if let Some(monitor) = state.monitor.take() {
            monitor.abort();
        }

        state.stats.ended_at = Some(Utc::now());
        if reason != TeardownReason::Completed {
            self.metrics.record_abort();
        }
        state.publish(&self.metrics);

        info!(
            generation,
            reason = %reason,
            genes_loaded = state.stats.genes_loaded,
            genes_failed = state.stats.genes_failed,
            genes_yielded = state.stats.genes_yielded,
            bytes_loaded = state.stats.bytes_loaded,
            evictions = state.stats.evictions,
            reloads = state.stats.reloads,
            wait_timeouts = state.stats.wait_timeouts,
            duration_ms = state.stats.duration_ms(),
            released_items,
            released_waiters,
            in_flight,
            "Run torn down"
        );

        state.run.finish();
        true
    }
}

/// Next pressure level, skipping ahead to the newest when lagging.
///
/// Returns `None` once the source is closed.
async fn next_level(
    rx: &mut Option<broadcast::Receiver<PressureLevel>>,
) -> Option<PressureLevel> {
    let Some(rx) = rx.as_mut() else {
        return std::future::pending().await;
    };

    let mut level = loop {
        match rx.recv().await {
            Ok(level) => break level,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Pressure subscriber lagged");
            }
            Err(RecvError::Closed) => return None,
        }
    };

    loop {
        match rx.try_recv() {
            Ok(newer) => level = newer,
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    Some(level)
}
