//! Embed lifecycle manager.
//!
//! Owns every [`EmbedRecord`] on the page and drives each one through
//! `unloaded → loading → {loaded | error}`:
//!
//! - placeholders that are visible at init load immediately, the rest are
//!   observed and load 50 ms after they first intersect the viewport
//! - at most `max_embeds` records are `loading|loaded`; making room evicts
//!   the record with the oldest last interaction
//! - a load that completes after its record was evicted is discarded
//! - heap pressure and inactivity sweeps dispose idle, invisible embeds
//!
//! State is behind one async mutex that is never held across a fetch or an
//! analytics flush. Host document operations are synchronous and happen
//! under the lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use upm_embed::{Clock, EmbedStatus, LoadAttr};

use crate::config::HostConfig;
use crate::events::{EmbedEvent, EventBus};
use crate::gesture::GestureTracker;
use crate::host::content::ContentFetcher;
use crate::host::dom::EmbedHost;
use crate::host::memory::{HeapProbe, NoHeapProbe};
use crate::host::workers::{WorkerOutput, WorkerPool, WorkerResult, WorkerTask};
use crate::listeners::{ListenerTable, Subscription};
use crate::schedule::ScheduledTask;
use crate::telemetry::{AnalyticsBatcher, OfflineSink};

pub const LOADING_PLACEHOLDER: &str = r#"<div class="embed-loading">Loading...</div>"#;
pub const ERROR_PLACEHOLDER: &str = r#"<div class="embed-error">Failed to load content</div>"#;

/// Intersection ratios at which a view is reported.
pub const VIEW_THRESHOLDS: [f64; 4] = [0.25, 0.5, 0.75, 1.0];

/// Analytics queue length above which `free_memory` flushes.
pub const DEFAULT_OVERFLOW_FLUSH: usize = 100;

pub const CLICK_EVENT: &str = "click";
pub const VIEW_EVENT: &str = "view";

/// Iframe markup used when the host cannot report visibility.
pub fn fallback_iframe(embed_id: &str) -> String {
    format!(
        r#"<iframe src="/embed/{embed_id}" frameborder="0" width="100%" height="400"></iframe>"#
    )
}

/// An interaction delivered to per-embed listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interaction {
    Click { target: String, x: f64, y: f64 },
    View { ratio: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Container missing, already carrying a load state, or the manager was torn down.
    Skipped,
    Loaded,
    Failed,
    /// The record was evicted or disposed while the fetch was in flight.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InitSummary {
    pub fallback: bool,
    pub loaded: usize,
    pub observed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryReport {
    pub cache_dropped: usize,
    pub disposed: Vec<String>,
    pub analytics_flushed: bool,
}

/// Read-only view of one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedSnapshot {
    pub id: String,
    pub container_id: String,
    pub status: EmbedStatus,
    pub load_time_ms: u64,
    pub last_interaction_ms: u64,
    pub generation: u64,
    pub listeners: usize,
    pub observing_views: bool,
    pub interactions: Vec<String>,
    /// Worker tasks whose results have not been applied yet.
    pub pending_tasks: usize,
    pub stats: Option<BTreeMap<String, usize>>,
    pub compressed_estimate: Option<usize>,
}

struct EmbedRecord {
    id: String,
    container_id: String,
    status: EmbedStatus,
    load_time_ms: u64,
    last_interaction_ms: u64,
    seq: u64,
    generation: u64,
    listeners: Vec<Subscription>,
    observing_views: bool,
    view_bucket: usize,
    interactions: Arc<Mutex<Vec<String>>>,
    pending_tasks: HashSet<u64>,
    stats: Option<BTreeMap<String, usize>>,
    compressed_estimate: Option<usize>,
}

impl EmbedRecord {
    fn snapshot(&self) -> EmbedSnapshot {
        EmbedSnapshot {
            id: self.id.clone(),
            container_id: self.container_id.clone(),
            status: self.status,
            load_time_ms: self.load_time_ms,
            last_interaction_ms: self.last_interaction_ms,
            generation: self.generation,
            listeners: self.listeners.len(),
            observing_views: self.observing_views,
            interactions: self
                .interactions
                .lock()
                .map(|l| l.clone())
                .unwrap_or_default(),
            pending_tasks: self.pending_tasks.len(),
            stats: self.stats.clone(),
            compressed_estimate: self.compressed_estimate,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    records: IndexMap<String, EmbedRecord>,
    observed: HashSet<String>,
    pending_loads: HashMap<String, ScheduledTask>,
    next_seq: u64,
    next_generation: u64,
    offline: bool,
    render_offload: bool,
    fallback: bool,
    torn_down: bool,
    monitor: Option<ScheduledTask>,
}

impl ManagerState {
    fn active_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status.is_active())
            .count()
    }

    /// Active record with the oldest interaction, insertion order breaking ties.
    fn lru_victim(&self) -> Option<String> {
        self.records
            .values()
            .filter(|r| r.status.is_active())
            .min_by_key(|r| (r.last_interaction_ms, r.seq))
            .map(|r| r.id.clone())
    }
}

struct Inner {
    config: HostConfig,
    host: Arc<dyn EmbedHost>,
    fetcher: ContentFetcher,
    heap: Arc<dyn HeapProbe>,
    batcher: AnalyticsBatcher,
    sink: Option<Arc<dyn OfflineSink>>,
    gestures: Option<GestureTracker>,
    workers: Option<WorkerPool>,
    results_loop: Mutex<Option<ScheduledTask>>,
    results_seen: AtomicU64,
    results_applied: AtomicUsize,
    results_notify: Notify,
    listeners: ListenerTable<Interaction>,
    /// Pending click per embed, tagged with the arm sequence number.
    click_timers: Mutex<HashMap<String, (u64, ScheduledTask)>>,
    click_seq: AtomicU64,
    overflow_flush: usize,
    clock: Arc<dyn Clock>,
    events: EventBus,
    state: tokio::sync::Mutex<ManagerState>,
}

pub struct EmbedManagerBuilder {
    config: HostConfig,
    host: Arc<dyn EmbedHost>,
    fetcher: ContentFetcher,
    batcher: AnalyticsBatcher,
    clock: Arc<dyn Clock>,
    events: EventBus,
    heap: Arc<dyn HeapProbe>,
    sink: Option<Arc<dyn OfflineSink>>,
    gestures: Option<GestureTracker>,
    overflow_flush: usize,
}

impl EmbedManagerBuilder {
    pub fn heap_probe(mut self, heap: Arc<dyn HeapProbe>) -> Self {
        self.heap = heap;
        self
    }

    pub fn offline_sink(mut self, sink: Arc<dyn OfflineSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn gestures(mut self, tracker: GestureTracker) -> Self {
        self.gestures = Some(tracker);
        self
    }

    pub fn overflow_flush(mut self, events: usize) -> Self {
        self.overflow_flush = events;
        self
    }

    /// Build the manager. Inside a tokio runtime worker results are applied
    /// by a background loop as they arrive; elsewhere they wait for
    /// [`EmbedManager::apply_worker_results`].
    pub fn build(self) -> EmbedManager {
        let workers = self
            .config
            .use_workers
            .then(|| WorkerPool::start(self.config.worker_count));
        let results = workers
            .as_ref()
            .filter(|_| tokio::runtime::Handle::try_current().is_ok())
            .and_then(WorkerPool::take_results);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let results_loop =
                results.map(|rx| ScheduledTask::spawn(apply_results_loop(weak.clone(), rx)));
            Inner {
                state: tokio::sync::Mutex::new(ManagerState {
                    render_offload: true,
                    ..ManagerState::default()
                }),
                config: self.config,
                host: self.host,
                fetcher: self.fetcher,
                heap: self.heap,
                batcher: self.batcher,
                sink: self.sink,
                gestures: self.gestures,
                workers,
                results_loop: Mutex::new(results_loop),
                results_seen: AtomicU64::new(0),
                results_applied: AtomicUsize::new(0),
                results_notify: Notify::new(),
                listeners: ListenerTable::new(),
                click_timers: Mutex::new(HashMap::new()),
                click_seq: AtomicU64::new(0),
                overflow_flush: self.overflow_flush,
                clock: self.clock,
                events: self.events,
            }
        });
        EmbedManager { inner }
    }
}

async fn apply_results_loop(
    weak: Weak<Inner>,
    mut results: mpsc::UnboundedReceiver<WorkerResult>,
) {
    while let Some(result) = results.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        EmbedManager { inner }.apply_results(vec![result]).await;
    }
}

/// Cheaply cloneable handle to the page's embed manager.
#[derive(Clone)]
pub struct EmbedManager {
    inner: Arc<Inner>,
}

impl EmbedManager {
    pub fn builder(
        config: HostConfig,
        host: Arc<dyn EmbedHost>,
        fetcher: ContentFetcher,
        batcher: AnalyticsBatcher,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> EmbedManagerBuilder {
        EmbedManagerBuilder {
            config,
            host,
            fetcher,
            batcher,
            clock,
            events,
            heap: Arc::new(NoHeapProbe),
            sink: None,
            gestures: None,
            overflow_flush: DEFAULT_OVERFLOW_FLUSH,
        }
    }

    fn weak(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    pub fn listeners(&self) -> &ListenerTable<Interaction> {
        &self.inner.listeners
    }

    pub fn batcher(&self) -> &AnalyticsBatcher {
        &self.inner.batcher
    }

    pub fn fetcher(&self) -> &ContentFetcher {
        &self.inner.fetcher
    }

    pub fn gesture_tracker(&self) -> Option<&GestureTracker> {
        self.inner.gestures.as_ref()
    }

    pub fn workers_offloaded(&self) -> bool {
        self.inner
            .workers
            .as_ref()
            .is_some_and(WorkerPool::is_offloaded)
    }

    /// Whether worker results are applied in the background as they arrive.
    pub fn applies_worker_results(&self) -> bool {
        self.inner
            .results_loop
            .lock()
            .map(|l| l.as_ref().is_some_and(ScheduledTask::is_pending))
            .unwrap_or(false)
    }

    // ── Inspection ────────────────────────────

    pub async fn status(&self, embed_id: &str) -> Option<EmbedStatus> {
        self.inner
            .state
            .lock()
            .await
            .records
            .get(embed_id)
            .map(|r| r.status)
    }

    pub async fn snapshot(&self, embed_id: &str) -> Option<EmbedSnapshot> {
        self.inner
            .state
            .lock()
            .await
            .records
            .get(embed_id)
            .map(EmbedRecord::snapshot)
    }

    /// Ids of every record, in insertion order.
    pub async fn embed_ids(&self) -> Vec<String> {
        self.inner.state.lock().await.records.keys().cloned().collect()
    }

    /// Records currently `loading` or `loaded`.
    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.active_count()
    }

    pub async fn is_observed(&self, embed_id: &str) -> bool {
        self.inner.state.lock().await.observed.contains(embed_id)
    }

    pub async fn has_pending_load(&self, embed_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .await
            .pending_loads
            .get(embed_id)
            .is_some_and(ScheduledTask::is_pending)
    }

    pub async fn render_offload(&self) -> bool {
        self.inner.state.lock().await.render_offload
    }

    // ── Discovery ─────────────────────────────

    /// Discover placeholders, load the visible ones and observe the rest.
    pub async fn init(&self) -> InitSummary {
        let host = &self.inner.host;
        let placeholders: Vec<String> = host
            .placeholders()
            .into_iter()
            .filter(|id| host.load_state(id).is_none())
            .collect();

        if !host.supports_visibility() {
            for id in &placeholders {
                host.set_content(id, &fallback_iframe(id));
            }
            self.inner.state.lock().await.fallback = true;
            tracing::info!(
                "visibility unsupported, {} embeds rendered as iframes",
                placeholders.len()
            );
            return InitSummary {
                fallback: true,
                loaded: placeholders.len(),
                observed: 0,
            };
        }

        let (visible, hidden): (Vec<String>, Vec<String>) =
            placeholders.into_iter().partition(|id| host.is_visible(id));
        for id in &hidden {
            self.observe(id).await;
        }
        let mut loaded = 0;
        for id in &visible {
            if self.load(id).await != LoadOutcome::Skipped {
                loaded += 1;
            }
        }

        self.start_memory_monitor().await;
        tracing::info!(
            "embed manager initialized: {loaded} loaded, {} observed",
            hidden.len()
        );
        InitSummary {
            fallback: false,
            loaded,
            observed: hidden.len(),
        }
    }

    /// Watch `embed_id` for viewport intersection.
    pub async fn observe(&self, embed_id: &str) {
        let mut state = self.inner.state.lock().await;
        if state.torn_down || state.fallback || state.records.contains_key(embed_id) {
            return;
        }
        state.observed.insert(embed_id.to_string());
    }

    /// Stop watching `embed_id` and cancel a debounced load. An in-flight
    /// fetch is not affected.
    pub async fn unobserve(&self, embed_id: &str) {
        let task = {
            let mut state = self.inner.state.lock().await;
            state.observed.remove(embed_id);
            state.pending_loads.remove(embed_id)
        };
        if let Some(mut task) = task {
            task.cancel();
        }
    }

    /// Visibility notification for an observed container.
    pub async fn on_intersection(&self, embed_id: &str, intersecting: bool) -> bool {
        if !intersecting {
            return false;
        }
        let mut state = self.inner.state.lock().await;
        if !state.observed.contains(embed_id) || state.records.contains_key(embed_id) {
            return false;
        }
        state.observed.remove(embed_id);

        let weak = self.weak();
        let id = embed_id.to_string();
        let delay = Duration::from_millis(self.inner.config.observe_debounce_ms);
        let task = ScheduledTask::after(delay, async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = EmbedManager { inner };
            manager.inner.state.lock().await.pending_loads.remove(&id);
            manager.load(&id).await;
        });
        state.pending_loads.insert(embed_id.to_string(), task);
        true
    }

    // ── Loading ───────────────────────────────

    /// Load `embed_id` into its container.
    pub async fn load(&self, embed_id: &str) -> LoadOutcome {
        if !self.loadable(embed_id) {
            return LoadOutcome::Skipped;
        }

        let ratio = self.inner.heap.usage_ratio();
        if ratio > self.inner.config.memory_threshold {
            tracing::debug!("heap usage {ratio:.2} above threshold, freeing memory");
            self.inner.events.emit(EmbedEvent::MemoryPressure { ratio });
            self.free_memory().await;
        }

        let generation = {
            let mut state = self.inner.state.lock().await;
            if state.torn_down || !self.loadable(embed_id) || state.records.contains_key(embed_id)
            {
                return LoadOutcome::Skipped;
            }

            let max = self.inner.config.max_embeds.max(1);
            while state.active_count() >= max {
                let Some(victim) = state.lru_victim() else {
                    break;
                };
                tracing::debug!("embed cap {max} reached, evicting {victim}");
                if self.dispose_locked(&mut state, &victim) {
                    self.inner.events.emit(EmbedEvent::EmbedEvicted { embed_id: victim });
                }
            }

            let now = self.now();
            state.next_seq += 1;
            state.next_generation += 1;
            let generation = state.next_generation;
            let record = EmbedRecord {
                id: embed_id.to_string(),
                container_id: upm_embed::container_id(embed_id),
                status: EmbedStatus::Loading,
                load_time_ms: now,
                last_interaction_ms: now,
                seq: state.next_seq,
                generation,
                listeners: Vec::new(),
                observing_views: false,
                view_bucket: 0,
                interactions: Arc::new(Mutex::new(Vec::new())),
                pending_tasks: HashSet::new(),
                stats: None,
                compressed_estimate: None,
            };
            state.observed.remove(embed_id);
            state.records.insert(embed_id.to_string(), record);
            self.inner.host.set_load_state(embed_id, LoadAttr::Loading);
            self.inner.host.set_content(embed_id, LOADING_PLACEHOLDER);
            generation
        };
        self.inner.events.emit(EmbedEvent::EmbedLoading {
            embed_id: embed_id.to_string(),
        });

        let result = self.inner.fetcher.get(embed_id).await;

        match result {
            Ok(html) => self.finish_load(embed_id, generation, html).await,
            Err(e) => self.fail_load(embed_id, generation, e.to_string()).await,
        }
    }

    /// A container is loadable when it exists and has no load state, or was disposed.
    fn loadable(&self, embed_id: &str) -> bool {
        let host = &self.inner.host;
        host.has_container(embed_id)
            && matches!(host.load_state(embed_id), None | Some(LoadAttr::False))
    }

    async fn finish_load(&self, embed_id: &str, generation: u64, html: String) -> LoadOutcome {
        let elapsed_ms = {
            let mut state = self.inner.state.lock().await;
            let render_offload = state.render_offload;
            let offline = state.offline;
            let now = self.now();
            let Some(record) = state
                .records
                .get_mut(embed_id)
                .filter(|r| r.generation == generation)
            else {
                tracing::debug!("discarding late content for {embed_id}");
                return LoadOutcome::Discarded;
            };

            let host = &self.inner.host;
            host.set_content(embed_id, &html);
            host.set_load_state(embed_id, LoadAttr::True);
            if offline {
                host.set_offline(embed_id, true);
            }
            record.status = EmbedStatus::Loaded;
            record.last_interaction_ms = now;
            self.attach_listeners(record);

            if let Some(pool) = &self.inner.workers {
                if render_offload {
                    record.pending_tasks.insert(pool.submit(WorkerTask::Render {
                        embed_id: embed_id.to_string(),
                        html: html.clone(),
                    }));
                }
                record.pending_tasks.insert(pool.submit(WorkerTask::Compress {
                    embed_id: embed_id.to_string(),
                    bytes: html.len(),
                }));
            }

            if self.inner.config.enable_gestures && host.is_visible(embed_id) {
                if let Some(tracker) = &self.inner.gestures {
                    tracker.attach(embed_id);
                }
            }
            now.saturating_sub(record.load_time_ms)
        };

        self.inner.events.emit(EmbedEvent::EmbedLoaded {
            embed_id: embed_id.to_string(),
            elapsed_ms,
        });
        tracing::debug!("embed {embed_id} loaded in {elapsed_ms} ms");
        self.inner
            .batcher
            .track(embed_id, "load", json!({ "success": true }))
            .await;
        LoadOutcome::Loaded
    }

    async fn fail_load(&self, embed_id: &str, generation: u64, error: String) -> LoadOutcome {
        {
            let mut state = self.inner.state.lock().await;
            let Some(record) = state
                .records
                .get_mut(embed_id)
                .filter(|r| r.generation == generation)
            else {
                return LoadOutcome::Discarded;
            };
            record.status = EmbedStatus::Error;
            self.inner.host.set_content(embed_id, ERROR_PLACEHOLDER);
            self.inner.host.set_load_state(embed_id, LoadAttr::Error);
        }

        tracing::warn!("failed to load embed {embed_id}: {error}");
        self.inner.events.emit(EmbedEvent::EmbedFailed {
            embed_id: embed_id.to_string(),
            error: error.clone(),
        });
        self.inner
            .batcher
            .track(embed_id, "load", json!({ "success": false, "error": error }))
            .await;
        LoadOutcome::Failed
    }

    fn attach_listeners(&self, record: &mut EmbedRecord) {
        let weak = self.weak();
        let id = record.id.clone();
        let click = self
            .inner
            .listeners
            .subscribe(&record.id, CLICK_EVENT, move |interaction| {
                if let Some(inner) = weak.upgrade() {
                    EmbedManager { inner }.arm_click(&id, interaction.clone());
                }
            });

        let log = Arc::clone(&record.interactions);
        let view = self
            .inner
            .listeners
            .subscribe(&record.id, VIEW_EVENT, move |_| {
                if let Ok(mut log) = log.lock() {
                    log.push(VIEW_EVENT.to_string());
                }
            });

        record.listeners = vec![click, view];
        record.observing_views = true;
    }

    // ── Disposal ──────────────────────────────

    /// Detach everything `embed_id` registered and clear its container.
    /// Returns false when there was no record.
    pub async fn dispose(&self, embed_id: &str) -> bool {
        let disposed = {
            let mut state = self.inner.state.lock().await;
            self.dispose_locked(&mut state, embed_id)
        };
        if disposed {
            self.inner.events.emit(EmbedEvent::EmbedDisposed {
                embed_id: embed_id.to_string(),
            });
        }
        disposed
    }

    fn dispose_locked(&self, state: &mut ManagerState, embed_id: &str) -> bool {
        state.observed.remove(embed_id);
        if let Some(mut task) = state.pending_loads.remove(embed_id) {
            task.cancel();
        }
        let timer = self
            .inner
            .click_timers
            .lock()
            .ok()
            .and_then(|mut t| t.remove(embed_id));
        if let Some((_, mut timer)) = timer {
            timer.cancel();
        }

        let Some(record) = state.records.shift_remove(embed_id) else {
            return false;
        };
        // dropping the record drops its subscriptions
        drop(record);
        self.inner.listeners.remove_embed(embed_id);
        if let Some(tracker) = &self.inner.gestures {
            tracker.detach(embed_id);
        }

        let host = &self.inner.host;
        host.set_content(embed_id, "");
        host.set_load_state(embed_id, LoadAttr::False);
        host.set_offline(embed_id, false);
        true
    }

    /// Dispose records idle longer than the inactivity threshold whose
    /// container is not visible.
    pub async fn sweep_inactive(&self) -> Vec<String> {
        let now = self.now();
        let idle_ms = self.inner.config.inactive_after_secs * 1000;
        let disposed: Vec<String> = {
            let mut state = self.inner.state.lock().await;
            let idle: Vec<String> = state
                .records
                .values()
                .filter(|r| now.saturating_sub(r.last_interaction_ms) > idle_ms)
                .filter(|r| !self.inner.host.is_visible(&r.id))
                .map(|r| r.id.clone())
                .collect();
            idle.into_iter()
                .filter(|id| self.dispose_locked(&mut state, id))
                .collect()
        };
        for id in &disposed {
            self.inner.events.emit(EmbedEvent::EmbedDisposed {
                embed_id: id.clone(),
            });
        }
        if !disposed.is_empty() {
            tracing::debug!("disposed {} inactive embeds", disposed.len());
        }
        disposed
    }

    /// Shrink the content cache, sweep inactive embeds and flush an
    /// oversized analytics queue.
    pub async fn free_memory(&self) -> MemoryReport {
        let retain = Duration::from_secs(self.inner.config.memory_retain_secs);
        let cache_dropped = self.inner.fetcher.cache().retain_younger_than(retain);
        let disposed = self.sweep_inactive().await;

        let analytics_flushed = self.inner.batcher.queue_len() > self.inner.overflow_flush;
        if analytics_flushed {
            self.inner.batcher.flush().await;
        }
        MemoryReport {
            cache_dropped,
            disposed,
            analytics_flushed,
        }
    }

    async fn start_memory_monitor(&self) {
        if self.inner.heap.usage().is_none() {
            return;
        }
        let weak = self.weak();
        let period = Duration::from_secs(self.inner.config.memory_check_secs.max(1));
        let task = ScheduledTask::every(period, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let manager = EmbedManager { inner };
                manager.check_memory().await;
            }
        });
        let mut state = self.inner.state.lock().await;
        if let Some(mut old) = state.monitor.replace(task) {
            old.cancel();
        }
    }

    /// Free memory when heap usage exceeds the threshold.
    pub async fn check_memory(&self) -> Option<MemoryReport> {
        let ratio = self.inner.heap.usage_ratio();
        if ratio <= self.inner.config.memory_threshold {
            return None;
        }
        self.inner.events.emit(EmbedEvent::MemoryPressure { ratio });
        Some(self.free_memory().await)
    }

    // ── Interactions ──────────────────────────

    /// A click on the container. Tracked after the debounce settles.
    pub async fn dispatch_click(&self, embed_id: &str, target: &str, x: f64, y: f64) -> bool {
        let interaction = Interaction::Click {
            target: target.to_string(),
            x,
            y,
        };
        self.inner.listeners.emit(embed_id, CLICK_EVENT, &interaction) > 0
    }

    fn arm_click(&self, embed_id: &str, interaction: Interaction) -> u64 {
        let weak = self.weak();
        let id = embed_id.to_string();
        let seq = self.inner.click_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = Duration::from_millis(self.inner.config.click_debounce_ms);
        let task = ScheduledTask::after(delay, async move {
            if let Some(inner) = weak.upgrade() {
                EmbedManager { inner }.fire_click(&id, seq, interaction).await;
            }
        });
        if let Ok(mut timers) = self.inner.click_timers.lock() {
            // replacing the previous timer cancels it
            timers.insert(embed_id.to_string(), (seq, task));
        }
        seq
    }

    async fn fire_click(&self, embed_id: &str, seq: u64, interaction: Interaction) {
        if let Ok(mut timers) = self.inner.click_timers.lock() {
            // a newer click may have been armed while this one was firing
            if timers.get(embed_id).is_some_and(|(armed, _)| *armed == seq) {
                timers.remove(embed_id);
            }
        }
        let Interaction::Click { target, x, y } = interaction else {
            return;
        };
        {
            let now = self.now();
            let mut state = self.inner.state.lock().await;
            let Some(record) = state.records.get_mut(embed_id) else {
                return;
            };
            record.last_interaction_ms = now;
            if let Ok(mut log) = record.interactions.lock() {
                log.push(CLICK_EVENT.to_string());
            };
        }
        self.inner
            .batcher
            .track(embed_id, CLICK_EVENT, json!({ "target": target, "x": x, "y": y }))
            .await;
    }

    /// A change of the container's intersection ratio. Returns true when a
    /// view was tracked.
    pub async fn dispatch_view(&self, embed_id: &str, ratio: f64) -> bool {
        let bucket = VIEW_THRESHOLDS.iter().filter(|t| ratio >= **t).count();
        {
            let mut state = self.inner.state.lock().await;
            let Some(record) = state
                .records
                .get_mut(embed_id)
                .filter(|r| r.observing_views)
            else {
                return false;
            };
            if bucket == record.view_bucket {
                return false;
            }
            record.view_bucket = bucket;
        }
        if bucket == 0 {
            return false;
        }
        if self
            .inner
            .listeners
            .emit(embed_id, VIEW_EVENT, &Interaction::View { ratio })
            == 0
        {
            return false;
        }
        self.inner
            .batcher
            .track(embed_id, VIEW_EVENT, json!({ "viewportPercentage": ratio }))
            .await;
        true
    }

    /// Record an explicit interaction with `embed_id`.
    pub async fn touch(&self, embed_id: &str) -> bool {
        let now = self.now();
        let mut state = self.inner.state.lock().await;
        match state.records.get_mut(embed_id) {
            Some(record) => {
                record.last_interaction_ms = now;
                true
            }
            None => false,
        }
    }

    // ── Page signals ──────────────────────────

    /// Connectivity changed.
    pub async fn set_offline(&self, offline: bool) {
        {
            let mut state = self.inner.state.lock().await;
            state.offline = offline;
            for id in state.records.keys() {
                self.inner.host.set_offline(id, offline);
            }
        }
        if offline {
            tracing::info!("page offline");
            return;
        }
        tracing::info!("page back online");
        self.inner.batcher.on_online().await;
        if let Some(sink) = &self.inner.sink {
            sink.connectivity_restored().await;
        }
    }

    /// Network quality changed. Slow or data-saving connections stop
    /// offloading render post-processing.
    pub async fn on_connection_change(&self, effective_type: &str, save_data: bool) {
        if effective_type == "2g" || save_data {
            let mut state = self.inner.state.lock().await;
            if state.render_offload {
                tracing::info!("constrained connection ({effective_type}), render offload disabled");
            }
            state.render_offload = false;
        }
    }

    /// The page became hidden.
    pub async fn on_visibility_hidden(&self) {
        self.inner.batcher.on_visibility_hidden().await;
    }

    // ── Workers ───────────────────────────────

    /// Submit an aggregation of the recorded interactions for `embed_id`.
    pub async fn request_stats(&self, embed_id: &str) -> Option<u64> {
        let pool = self.inner.workers.as_ref()?;
        let mut state = self.inner.state.lock().await;
        let record = state.records.get_mut(embed_id)?;
        let events = record
            .interactions
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default();
        let id = pool.submit(WorkerTask::Aggregate {
            embed_id: embed_id.to_string(),
            events,
        });
        record.pending_tasks.insert(id);
        Some(id)
    }

    /// Apply worker results still queued in the pool. Only finds anything
    /// when no background loop consumes them. Returns how many were applied.
    pub async fn apply_worker_results(&self) -> usize {
        let Some(pool) = &self.inner.workers else {
            return 0;
        };
        let results = pool.drain();
        if results.is_empty() {
            return 0;
        }
        self.apply_results(results).await
    }

    /// Apply results by correlation id. Results whose record is gone, or
    /// whose task the record no longer expects, are discarded.
    async fn apply_results(&self, results: Vec<WorkerResult>) -> usize {
        let seen = results.len() as u64;
        let mut applied = 0;
        {
            let mut state = self.inner.state.lock().await;
            for result in results {
                let Some(record) = state.records.get_mut(&result.embed_id) else {
                    tracing::trace!("discarding worker result for {}", result.embed_id);
                    continue;
                };
                if !record.pending_tasks.remove(&result.id) {
                    continue;
                }
                match result.output {
                    WorkerOutput::Rendered { html } => {
                        if record.status == EmbedStatus::Loaded {
                            self.inner.host.set_content(&record.id, &html);
                        }
                    }
                    WorkerOutput::Aggregated { counts } => record.stats = Some(counts),
                    WorkerOutput::Compressed { estimated_bytes } => {
                        record.compressed_estimate = Some(estimated_bytes)
                    }
                }
                applied += 1;
            }
            self.inner.results_applied.fetch_add(applied, Ordering::SeqCst);
            self.inner.results_seen.fetch_add(seen, Ordering::SeqCst);
        }
        self.inner.results_notify.notify_waiters();
        applied
    }

    /// Wait until every submitted worker task has posted its result and the
    /// result was applied or discarded. Returns how many results were
    /// applied since the manager was built.
    pub async fn settle_workers(&self) -> usize {
        let Some(pool) = &self.inner.workers else {
            return 0;
        };
        pool.settle().await;
        self.apply_worker_results().await;

        let submitted = pool.submitted();
        loop {
            let notified = self.inner.results_notify.notified();
            if self.inner.results_seen.load(Ordering::SeqCst) >= submitted
                || !self.applies_worker_results()
            {
                break;
            }
            notified.await;
        }
        self.inner.results_applied.load(Ordering::SeqCst)
    }

    // ── Teardown ──────────────────────────────

    /// Flush analytics and release every embed, timer and worker.
    pub async fn teardown(&self) {
        self.inner.batcher.teardown().await;

        let disposed = {
            let mut state = self.inner.state.lock().await;
            state.torn_down = true;
            let ids: Vec<String> = state.records.keys().cloned().collect();
            let disposed = ids
                .iter()
                .filter(|id| self.dispose_locked(&mut state, id))
                .count();
            state.observed.clear();
            for (_, mut task) in state.pending_loads.drain() {
                task.cancel();
            }
            if let Some(mut monitor) = state.monitor.take() {
                monitor.cancel();
            }
            disposed
        };

        if let Ok(mut timers) = self.inner.click_timers.lock() {
            for (_, (_, mut timer)) in timers.drain() {
                timer.cancel();
            }
        }
        let results_loop = self.inner.results_loop.lock().ok().and_then(|mut l| l.take());
        if let Some(mut results_loop) = results_loop {
            results_loop.cancel();
        }
        self.inner.results_notify.notify_waiters();
        if let Some(pool) = &self.inner.workers {
            pool.shutdown();
        }
        self.inner.fetcher.cache().clear();
        tracing::info!("embed manager torn down, {disposed} embeds disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyticsConfig;
    use crate::error::{NetworkError, TelemetryError};
    use crate::host::content::ContentCache;
    use crate::host::dom::HeadlessHost;
    use crate::host::memory::ManualHeapProbe;
    use crate::net::{FetchRequest, FetchResponse, Network};
    use crate::telemetry::TelemetryTransport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use upm_embed::{AnalyticsBatch, ManualClock};
    use url::Url;

    /// Serves `<p>{id}</p>` for every embed except ids starting with "bad".
    struct EmbedServer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Network for EmbedServer {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let id = request.url.rsplit('/').next().unwrap_or_default().to_string();
            if id.starts_with("bad") {
                return Ok(FetchResponse::text(500, "boom"));
            }
            Ok(FetchResponse::text(200, &format!("<p>{id}</p>")))
        }
    }

    #[derive(Default)]
    struct Collector {
        events: Mutex<Vec<upm_embed::AnalyticsEvent>>,
    }

    #[async_trait]
    impl TelemetryTransport for Collector {
        async fn post_keepalive(&self, _url: &str, body: Bytes) -> Result<u16, TelemetryError> {
            let batch: AnalyticsBatch = serde_json::from_slice(&body).unwrap();
            self.events.lock().unwrap().extend(batch.events);
            Ok(200)
        }
    }

    struct Fixture {
        manager: EmbedManager,
        host: Arc<HeadlessHost>,
        clock: ManualClock,
        collector: Arc<Collector>,
    }

    fn fixture(config: HostConfig, heap: Arc<dyn HeapProbe>) -> Fixture {
        let clock = ManualClock::new(0);
        let host = Arc::new(HeadlessHost::new());
        let network = Arc::new(EmbedServer {
            calls: AtomicUsize::new(0),
        });
        let fetcher = ContentFetcher::new(
            Url::parse("https://host.test").unwrap(),
            network,
            ContentCache::with_defaults(Arc::new(clock.clone())),
        );
        let collector = Arc::new(Collector::default());
        let events = EventBus::new(64);
        let batcher = AnalyticsBatcher::new(
            &AnalyticsConfig::default(),
            "https://host.test/api/embeds/analytics/batch".into(),
            collector.clone(),
            None,
            Arc::new(clock.clone()),
            events.clone(),
        );
        let manager = EmbedManager::builder(
            config,
            host.clone(),
            fetcher,
            batcher,
            Arc::new(clock.clone()),
            events,
        )
        .heap_probe(heap)
        .build();
        Fixture {
            manager,
            host,
            clock,
            collector,
        }
    }

    fn default_fixture() -> Fixture {
        fixture(HostConfig::default(), Arc::new(NoHeapProbe))
    }

    #[tokio::test]
    async fn test_load_success_attaches_listeners() {
        let f = default_fixture();
        f.host.add_placeholder("a", true);

        assert_eq!(f.manager.load("a").await, LoadOutcome::Loaded);
        assert_eq!(f.host.load_state("a"), Some(LoadAttr::True));
        assert_eq!(f.host.content("a").as_deref(), Some("<p>a</p>"));

        let snap = f.manager.snapshot("a").await.unwrap();
        assert_eq!(snap.status, EmbedStatus::Loaded);
        assert_eq!(snap.container_id, "upm-embed-a");
        assert_eq!(snap.listeners, 2);
        assert!(f.manager.listeners().has_listeners("a", CLICK_EVENT));

        // already carries a load state
        assert_eq!(f.manager.load("a").await, LoadOutcome::Skipped);
        assert_eq!(f.manager.load("missing").await, LoadOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_load_failure_shows_placeholder() {
        let f = default_fixture();
        f.host.add_placeholder("bad1", true);
        assert_eq!(f.manager.load("bad1").await, LoadOutcome::Failed);
        assert_eq!(f.host.load_state("bad1"), Some(LoadAttr::Error));
        assert_eq!(f.host.content("bad1").as_deref(), Some(ERROR_PLACEHOLDER));
        assert!(!f.manager.listeners().has_listeners("bad1", CLICK_EVENT));

        f.manager.batcher().flush().await;
        let events = f.collector.events.lock().unwrap();
        assert_eq!(events[0].event_type, "load");
        assert_eq!(events[0].payload["success"], false);
        assert_eq!(events[0].payload["error"], "HTTP 500");
    }

    #[tokio::test]
    async fn test_lru_eviction_scenario() {
        let f = fixture(
            HostConfig {
                max_embeds: 2,
                ..HostConfig::default()
            },
            Arc::new(NoHeapProbe),
        );
        for id in ["a", "b", "c"] {
            f.host.add_placeholder(id, true);
        }

        f.clock.set(0);
        f.manager.load("a").await;
        f.clock.set(1);
        f.manager.load("b").await;
        f.clock.set(2);
        f.manager.load("c").await;

        assert_eq!(f.manager.status("a").await, None);
        assert_eq!(f.manager.status("b").await, Some(EmbedStatus::Loaded));
        assert_eq!(f.manager.status("c").await, Some(EmbedStatus::Loaded));
        assert_eq!(f.manager.active_count().await, 2);
        assert_eq!(f.host.load_state("a"), Some(LoadAttr::False));
        assert_eq!(f.host.content("a").as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_touch_changes_eviction_order() {
        let f = fixture(
            HostConfig {
                max_embeds: 2,
                ..HostConfig::default()
            },
            Arc::new(NoHeapProbe),
        );
        for id in ["a", "b", "c"] {
            f.host.add_placeholder(id, true);
        }
        f.manager.load("a").await;
        f.clock.set(1);
        f.manager.load("b").await;
        f.clock.set(5);
        assert!(f.manager.touch("a").await);
        f.manager.load("c").await;
        assert_eq!(f.manager.status("b").await, None);
        assert!(f.manager.status("a").await.is_some());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let f = default_fixture();
        f.host.add_placeholder("a", true);
        f.manager.load("a").await;

        assert!(f.manager.dispose("a").await);
        assert!(!f.manager.listeners().has_listeners("a", CLICK_EVENT));
        assert_eq!(f.host.load_state("a"), Some(LoadAttr::False));
        assert!(!f.manager.dispose("a").await);
        assert_eq!(f.manager.embed_ids().await, Vec::<String>::new());

        // a disposed container can be loaded again
        assert_eq!(f.manager.load("a").await, LoadOutcome::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intersection_debounce_and_unobserve() {
        let f = default_fixture();
        f.host.add_placeholder("a", false);
        f.host.add_placeholder("b", false);
        let summary = f.manager.init().await;
        assert_eq!(summary.observed, 2);
        assert_eq!(summary.loaded, 0);

        assert!(f.manager.on_intersection("a", true).await);
        assert!(f.manager.on_intersection("b", true).await);
        assert!(!f.manager.is_observed("a").await);
        f.manager.unobserve("b").await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.manager.status("a").await, Some(EmbedStatus::Loaded));
        assert_eq!(f.manager.status("b").await, None);
        assert_eq!(f.host.load_state("b"), None);
    }

    #[tokio::test]
    async fn test_fallback_init_renders_iframes() {
        let clock = ManualClock::new(0);
        let host = Arc::new(HeadlessHost::without_visibility());
        host.add_placeholder("x", true);
        let events = EventBus::new(8);
        let network = Arc::new(EmbedServer {
            calls: AtomicUsize::new(0),
        });
        let manager = EmbedManager::builder(
            HostConfig::default(),
            host.clone(),
            ContentFetcher::new(
                Url::parse("https://host.test").unwrap(),
                network.clone(),
                ContentCache::with_defaults(Arc::new(clock.clone())),
            ),
            AnalyticsBatcher::new(
                &AnalyticsConfig::default(),
                "https://host.test/a".into(),
                Arc::new(Collector::default()),
                None,
                Arc::new(clock.clone()),
                events.clone(),
            ),
            Arc::new(clock),
            events,
        )
        .build();

        let summary = manager.init().await;
        assert!(summary.fallback);
        assert_eq!(host.content("x").unwrap(), fallback_iframe("x"));
        assert_eq!(manager.embed_ids().await.len(), 0);
        assert_eq!(network.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_debounce_tracks_once() {
        let f = default_fixture();
        f.host.add_placeholder("a", true);
        f.manager.load("a").await;

        f.clock.set(1_000);
        assert!(f.manager.dispatch_click("a", "BUTTON", 1.0, 2.0).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.manager.dispatch_click("a", "BUTTON", 3.0, 4.0).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let clicks: Vec<_> = f
            .manager
            .batcher()
            .pending()
            .into_iter()
            .filter(|e| e.event_type == CLICK_EVENT)
            .collect();
        assert_eq!(clicks.len(), 1);
        assert_eq!(clicks[0].payload, json!({ "target": "BUTTON", "x": 3.0, "y": 4.0 }));
        assert_eq!(
            f.manager.snapshot("a").await.unwrap().last_interaction_ms,
            1_000
        );
        assert!(!f.manager.dispatch_click("nope", "DIV", 0.0, 0.0).await);
    }

    #[tokio::test]
    async fn test_view_thresholds() {
        let f = default_fixture();
        f.host.add_placeholder("a", true);
        f.manager.load("a").await;

        assert!(!f.manager.dispatch_view("a", 0.1).await);
        assert!(f.manager.dispatch_view("a", 0.3).await);
        assert!(!f.manager.dispatch_view("a", 0.4).await);
        assert!(f.manager.dispatch_view("a", 1.0).await);

        let views: Vec<_> = f
            .manager
            .batcher()
            .pending()
            .into_iter()
            .filter(|e| e.event_type == VIEW_EVENT)
            .collect();
        assert_eq!(views.len(), 2);
        assert_eq!(views[1].payload["viewportPercentage"], 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_click_fire_keeps_newer_timer() {
        let f = default_fixture();
        f.host.add_placeholder("a", true);
        f.manager.load("a").await;

        let first = Interaction::Click {
            target: "A".into(),
            x: 0.0,
            y: 0.0,
        };
        let second = Interaction::Click {
            target: "B".into(),
            x: 1.0,
            y: 1.0,
        };
        let stale = f.manager.arm_click("a", first.clone());
        f.manager.arm_click("a", second);
        // the first timer was already running when the second was armed
        f.manager.fire_click("a", stale, first).await;
        assert!(f
            .manager
            .inner
            .click_timers
            .lock()
            .unwrap()
            .get("a")
            .is_some_and(|(_, timer)| timer.is_pending()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let targets: Vec<_> = f
            .manager
            .batcher()
            .pending()
            .into_iter()
            .filter(|e| e.event_type == CLICK_EVENT)
            .map(|e| e.payload["target"].clone())
            .collect();
        assert_eq!(targets, vec![json!("A"), json!("B")]);
        assert!(f.manager.inner.click_timers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_pressure_sweeps_before_load() {
        let heap = Arc::new(ManualHeapProbe::new(10, 100));
        let f = fixture(HostConfig::default(), heap.clone());
        f.host.add_placeholder("old", false);
        f.host.add_placeholder("seen", true);
        f.host.add_placeholder("new", true);
        f.manager.load("old").await;
        f.manager.load("seen").await;

        f.clock.set(301_000);
        heap.set_used(80);
        f.manager.load("new").await;

        assert_eq!(f.manager.status("old").await, None);
        assert!(f.manager.status("seen").await.is_some());
        assert!(f.manager.status("new").await.is_some());
        assert_eq!(f.manager.fetcher().cache().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_results_apply_by_correlation() {
        let f = default_fixture();
        f.host.add_placeholder("a", true);
        f.host.add_placeholder("b", true);
        f.manager.load("a").await;
        f.manager.load("b").await;
        f.manager.dispatch_view("a", 0.5).await;
        f.manager.request_stats("a").await.unwrap();
        f.manager.dispose("b").await;

        // render and compress for "a" plus the aggregate; "b"'s two only
        // count if they landed before the dispose
        let applied = f.manager.settle_workers().await;
        assert!((3..=5).contains(&applied), "applied {applied}");
        let snap = f.manager.snapshot("a").await.unwrap();
        assert_eq!(snap.pending_tasks, 0);
        assert_eq!(snap.compressed_estimate, Some(6));
        assert_eq!(snap.stats.unwrap()["view"], 1);

        let late = |embed_id: &str, id: u64| WorkerResult {
            id,
            embed_id: embed_id.to_string(),
            output: WorkerOutput::Compressed { estimated_bytes: 1 },
        };
        // disposed embed, then a correlation id "a" never submitted
        let dropped = vec![late("b", 4), late("a", 999)];
        assert_eq!(f.manager.apply_results(dropped).await, 0);
        assert_eq!(
            f.manager.snapshot("a").await.unwrap().compressed_estimate,
            Some(6)
        );
    }

    #[tokio::test]
    async fn test_worker_results_apply_in_background() {
        let f = default_fixture();
        assert!(f.manager.applies_worker_results());
        f.host.add_placeholder("a", true);
        f.manager.load("a").await;

        let mut snap = f.manager.snapshot("a").await.unwrap();
        for _ in 0..50 {
            if snap.pending_tasks == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            snap = f.manager.snapshot("a").await.unwrap();
        }
        assert_eq!(snap.pending_tasks, 0);
        assert_eq!(snap.compressed_estimate, Some(6));
        assert_eq!(f.host.content("a").as_deref(), Some("<p>a</p>"));
        assert_eq!(f.manager.apply_worker_results().await, 0);
    }

    #[tokio::test]
    async fn test_connection_change_disables_render_offload() {
        let f = default_fixture();
        f.manager.on_connection_change("4g", false).await;
        assert!(f.manager.render_offload().await);
        f.manager.on_connection_change("2g", false).await;
        assert!(!f.manager.render_offload().await);

        f.host.add_placeholder("a", true);
        f.manager.load("a").await;
        // only the compression estimate was submitted
        assert_eq!(f.manager.settle_workers().await, 1);
    }

    #[tokio::test]
    async fn test_offline_marks_containers() {
        let f = default_fixture();
        f.host.add_placeholder("a", true);
        f.manager.load("a").await;
        f.manager.set_offline(true).await;
        assert!(f.host.has_class("a", upm_embed::OFFLINE_CLASS));
        f.manager.set_offline(false).await;
        assert!(!f.host.has_class("a", upm_embed::OFFLINE_CLASS));
        // coming back online flushed the load event
        assert_eq!(f.collector.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_releases_everything() {
        let f = default_fixture();
        f.host.add_placeholder("a", true);
        f.host.add_placeholder("b", false);
        f.manager.init().await;
        assert!(f.manager.applies_worker_results());
        f.manager.teardown().await;

        assert!(!f.manager.applies_worker_results());
        // nothing left to wait for once the results loop is gone
        f.manager.settle_workers().await;
        assert_eq!(f.manager.embed_ids().await.len(), 0);
        assert!(f.manager.listeners().is_empty());
        assert!(f.manager.fetcher().cache().is_empty());
        assert!(!f.manager.is_observed("b").await);
        assert_eq!(f.manager.batcher().queue_len(), 0);
        assert_eq!(f.manager.load("b").await, LoadOutcome::Skipped);
    }
}
