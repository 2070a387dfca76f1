//! Bundle assembly engine.
//!
//! Walks the Bundle → Layer → Map tree top-down. Every level instance runs
//! the same state machine:
//!
//! ```text
//! TestPreconditions → Initialize → DecomposeAndDispatch → AwaitChildren → Finalize → Done
//! ```
//!
//! with `Aborted` reachable from any state on cancellation, `Failed` from
//! Initialize/Finalize on output errors, and `PreflightFailed` from
//! TestPreconditions. Each level owns one [`JobDispatcher`] for its children
//! and only finalizes after that dispatcher has terminated.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::budget::ThreadBudget;
use crate::cancel::CancelToken;
use crate::config::{DispatcherConfig, EngineConfig};
use crate::dispatcher::{panic_message, Job, JobContext, JobDispatcher};
use crate::error::{BundleError, BundleResult};
use crate::format::{BundleFormatStrategy, MapArchive, MapSummary};
use crate::model::Bundle;
use crate::pause::PauseResumeHandler;
use crate::progress::{LevelKind, ProgressListener, ProgressSnapshot, RunProgress};
use crate::store::TileStore;
use crate::tile_job::{MapStats, MapStatsSnapshot, TileAcquisitionJob, TileTarget};

/// Lifecycle state of one level instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LevelState {
    TestPreconditions,
    Initialize,
    DecomposeAndDispatch,
    AwaitChildren,
    Finalize,
    Done,
    Aborted,
    Failed,
    PreflightFailed,
}

impl LevelState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LevelState::Done | LevelState::Aborted | LevelState::Failed | LevelState::PreflightFailed
        )
    }

    pub fn can_transition_to(self, next: LevelState) -> bool {
        use LevelState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Aborted)
                | (TestPreconditions, Initialize)
                | (TestPreconditions, PreflightFailed)
                | (Initialize, DecomposeAndDispatch)
                | (Initialize, Failed)
                | (DecomposeAndDispatch, AwaitChildren)
                | (AwaitChildren, Finalize)
                | (Finalize, Done)
                | (Finalize, Failed)
        )
    }
}

/// Current state of one level, logging every transition.
struct LevelTracker<'a> {
    kind: LevelKind,
    name: &'a str,
    state: LevelState,
}

impl<'a> LevelTracker<'a> {
    fn new(kind: LevelKind, name: &'a str) -> Self {
        Self {
            kind,
            name,
            state: LevelState::TestPreconditions,
        }
    }

    fn advance(&mut self, next: LevelState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "{} {}: {:?} -> {:?}",
            self.kind,
            self.name,
            self.state,
            next
        );
        debug!(level = %self.kind, name = self.name, from = ?self.state, to = ?next, "level state");
        self.state = next;
    }
}

/// Outcome of one map.
#[derive(Debug, Clone)]
pub struct MapReport {
    pub layer: String,
    pub map: String,
    pub state: LevelState,
    /// Tiles submitted after filtering.
    pub tiles_planned: u64,
    pub stats: MapStatsSnapshot,
    pub summary: Option<MapSummary>,
    pub error: Option<String>,
    order: (usize, usize),
}

/// Outcome of one layer.
#[derive(Debug, Clone)]
pub struct LayerReport {
    pub layer: String,
    pub state: LevelState,
    pub error: Option<String>,
    index: usize,
}

/// Result of [`BundleAssemblyEngine::assemble`].
#[derive(Debug, Clone)]
pub struct AssemblyReport {
    pub bundle: String,
    pub state: LevelState,
    pub output: Option<PathBuf>,
    /// Layers that started, in bundle order.
    pub layers: Vec<LayerReport>,
    /// Maps that started, in bundle order.
    pub maps: Vec<MapReport>,
    pub progress: ProgressSnapshot,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl AssemblyReport {
    pub fn is_complete(&self) -> bool {
        self.state == LevelState::Done
    }

    pub fn layer(&self, name: &str) -> Option<&LayerReport> {
        self.layers.iter().find(|l| l.layer == name)
    }

    pub fn map(&self, layer: &str, map: &str) -> Option<&MapReport> {
        self.maps.iter().find(|m| m.layer == layer && m.map == map)
    }
}

/// State shared by every level of one run.
struct RunContext {
    config: EngineConfig,
    dispatcher_config: DispatcherConfig,
    strategy: Arc<dyn BundleFormatStrategy>,
    store: Arc<dyn TileStore>,
    progress: Arc<RunProgress>,
    budget: Arc<ThreadBudget>,
    pause: Arc<PauseResumeHandler>,
    bundle: Arc<Bundle>,
    layers: Mutex<Vec<LayerReport>>,
    maps: Mutex<Vec<MapReport>>,
}

impl RunContext {
    fn dispatcher(
        &self,
        name: String,
        children: usize,
        cap: usize,
        cancel: &CancelToken,
    ) -> BundleResult<JobDispatcher> {
        JobDispatcher::new(
            &name,
            children.min(cap),
            Arc::clone(&self.pause),
            self.progress.clone(),
            cancel,
            Some(&self.budget),
            self.dispatcher_config.clone(),
        )
    }

    fn run_layer(
        self: &Arc<Self>,
        index: usize,
        bundle_dir: &Path,
        cancel: &CancelToken,
    ) -> BundleResult<()> {
        let layer = &self.bundle.layers[index];
        let mut tracker = LevelTracker::new(LevelKind::Layer, &layer.name);
        self.progress.level_started(LevelKind::Layer, &layer.name);

        let result = self.layer_levels(index, bundle_dir, cancel, &mut tracker);
        let error = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = &result {
            if tracker.state == LevelState::Failed {
                error!(layer = %layer.name, error = %e, "layer failed");
            }
        }
        self.layers.lock().push(LayerReport {
            layer: layer.name.clone(),
            state: tracker.state,
            error,
            index,
        });
        self.progress
            .level_finished(LevelKind::Layer, &layer.name, tracker.state == LevelState::Done);
        result
    }

    fn layer_levels(
        self: &Arc<Self>,
        index: usize,
        bundle_dir: &Path,
        cancel: &CancelToken,
        tracker: &mut LevelTracker<'_>,
    ) -> BundleResult<()> {
        let layer = &self.bundle.layers[index];
        if cancel.is_cancelled() {
            tracker.advance(LevelState::Aborted);
            return Err(BundleError::Cancelled);
        }

        tracker.advance(LevelState::Initialize);
        let initialized = self
            .strategy
            .begin_layer(bundle_dir, layer)
            .and_then(|dir| {
                let name = format!("layer-{}", layer.name);
                let dispatcher =
                    self.dispatcher(name, layer.maps.len(), self.config.layer_threads, cancel)?;
                Ok((dir, dispatcher))
            });
        let (layer_dir, dispatcher) = match initialized {
            Ok(v) => v,
            Err(e) => {
                tracker.advance(LevelState::Failed);
                return Err(e);
            }
        };

        tracker.advance(LevelState::DecomposeAndDispatch);
        for map_index in 0..layer.maps.len() {
            let job = MapJob {
                run: Arc::clone(self),
                layer_index: index,
                map_index,
                layer_dir: layer_dir.clone(),
            };
            if let Err(e) = dispatcher.submit(Box::new(job)) {
                debug!(layer = %layer.name, error = %e, "stopped dispatching maps");
                break;
            }
        }

        tracker.advance(LevelState::AwaitChildren);
        if !dispatcher.await_termination(self.config.drain_poll(), cancel) {
            tracker.advance(LevelState::Aborted);
            return Err(BundleError::Cancelled);
        }

        tracker.advance(LevelState::Finalize);
        let summaries = self.finished_maps(index);
        match self.strategy.finish_layer(&layer_dir, layer, &summaries) {
            Ok(()) => {
                tracker.advance(LevelState::Done);
                info!(layer = %layer.name, maps = summaries.len(), "layer done");
                Ok(())
            }
            Err(e) => {
                tracker.advance(LevelState::Failed);
                Err(e)
            }
        }
    }

    /// Summaries of the finalized maps of a layer, in layer order.
    fn finished_maps(&self, layer_index: usize) -> Vec<MapSummary> {
        let maps = self.maps.lock();
        let mut done: Vec<&MapReport> = maps
            .iter()
            .filter(|m| m.order.0 == layer_index && m.summary.is_some())
            .collect();
        done.sort_by_key(|m| m.order);
        done.into_iter().filter_map(|m| m.summary.clone()).collect()
    }

    fn run_map(
        &self,
        layer_index: usize,
        map_index: usize,
        layer_dir: &Path,
        cancel: &CancelToken,
    ) -> BundleResult<()> {
        let layer = &self.bundle.layers[layer_index];
        let map = &layer.maps[map_index];
        let mut tracker = LevelTracker::new(LevelKind::Map, &map.name);
        self.progress.level_started(LevelKind::Map, &map.name);

        let stats = Arc::new(MapStats::default());
        let mut planned = 0u64;
        let result = self.map_levels(
            layer_index,
            map_index,
            layer_dir,
            cancel,
            &mut tracker,
            &stats,
            &mut planned,
        );

        let stats = stats.snapshot();
        let (summary, error) = match &result {
            Ok(summary) => {
                info!(
                    layer = %layer.name,
                    map = %map.name,
                    planned,
                    written = stats.written,
                    from_cache = stats.from_cache,
                    failed = stats.failed,
                    "map done"
                );
                (Some(summary.clone()), None)
            }
            Err(e) => {
                match tracker.state {
                    LevelState::PreflightFailed => {
                        warn!(layer = %layer.name, map = %map.name, error = %e, "map skipped")
                    }
                    LevelState::Failed => {
                        error!(layer = %layer.name, map = %map.name, error = %e, "map failed")
                    }
                    _ => debug!(layer = %layer.name, map = %map.name, "map aborted"),
                }
                (None, Some(e.to_string()))
            }
        };

        self.maps.lock().push(MapReport {
            layer: layer.name.clone(),
            map: map.name.clone(),
            state: tracker.state,
            tiles_planned: planned,
            stats,
            summary,
            error,
            order: (layer_index, map_index),
        });
        self.progress
            .level_finished(LevelKind::Map, &map.name, tracker.state == LevelState::Done);
        result.map(|_| ())
    }

    #[allow(clippy::too_many_arguments)]
    fn map_levels(
        &self,
        layer_index: usize,
        map_index: usize,
        layer_dir: &Path,
        cancel: &CancelToken,
        tracker: &mut LevelTracker<'_>,
        stats: &Arc<MapStats>,
        planned: &mut u64,
    ) -> BundleResult<MapSummary> {
        let map = &self.bundle.layers[layer_index].maps[map_index];

        if let Err(e) = map.check() {
            tracker.advance(LevelState::PreflightFailed);
            return Err(e);
        }
        if cancel.is_cancelled() {
            tracker.advance(LevelState::Aborted);
            return Err(BundleError::Cancelled);
        }

        tracker.advance(LevelState::Initialize);
        let initialized = self.strategy.begin_map(layer_dir, map).and_then(|archive| {
            let children = usize::try_from(map.range.tile_count()).unwrap_or(usize::MAX);
            let name = format!("map-{}", map.name);
            let dispatcher = self.dispatcher(name, children, self.config.map_threads, cancel)?;
            Ok((archive, dispatcher))
        });
        let (archive, dispatcher): (Box<dyn MapArchive>, JobDispatcher) = match initialized {
            Ok(v) => v,
            Err(e) => {
                tracker.advance(LevelState::Failed);
                return Err(e);
            }
        };

        let target = Arc::new(TileTarget {
            source: Arc::clone(&map.source),
            store: Arc::clone(&self.store),
            archive: Arc::new(Mutex::new(Some(archive))),
            stats: Arc::clone(stats),
            mode: self.config.fetch_mode,
            max_retries: self.config.max_download_retries,
        });

        tracker.advance(LevelState::DecomposeAndDispatch);
        let range = map.range;
        let source_id = map.source.id();
        'rows: for y in range.min_y..=range.max_y {
            let columns: Vec<u32> = match &map.filter {
                Some(filter) => (range.min_x..=range.max_x)
                    .into_par_iter()
                    .filter(|&x| filter.test(x, y, map.zoom, source_id))
                    .collect(),
                None => (range.min_x..=range.max_x).collect(),
            };
            for x in columns {
                let job = TileAcquisitionJob::new(map.address(x, y), Arc::clone(&target));
                if let Err(e) = dispatcher.submit(Box::new(job)) {
                    debug!(map = %map.name, error = %e, "stopped dispatching tiles");
                    break 'rows;
                }
                *planned += 1;
            }
        }

        tracker.advance(LevelState::AwaitChildren);
        if !dispatcher.await_termination(self.config.drain_poll(), cancel) {
            tracker.advance(LevelState::Aborted);
            return Err(BundleError::Cancelled);
        }

        tracker.advance(LevelState::Finalize);
        let archive = target.archive.lock().take();
        let finished = match archive {
            Some(archive) => archive.finish(),
            None => Err(BundleError::Validation(format!(
                "archive of map {} already closed",
                map.name
            ))),
        };
        match finished {
            Ok(summary) => {
                tracker.advance(LevelState::Done);
                Ok(summary)
            }
            Err(e) => {
                tracker.advance(LevelState::Failed);
                Err(e)
            }
        }
    }
}

/// Runs one layer on a worker of the bundle dispatcher.
struct LayerJob {
    run: Arc<RunContext>,
    index: usize,
    bundle_dir: PathBuf,
}

impl Job for LayerJob {
    fn run(self: Box<Self>, ctx: &mut JobContext<'_>) -> BundleResult<()> {
        self.run.run_layer(self.index, &self.bundle_dir, ctx.cancel_token())
    }

    fn describe(&self) -> String {
        format!("layer {}", self.run.bundle.layers[self.index].name)
    }
}

/// Runs one map on a worker of its layer's dispatcher.
struct MapJob {
    run: Arc<RunContext>,
    layer_index: usize,
    map_index: usize,
    layer_dir: PathBuf,
}

impl Job for MapJob {
    fn run(self: Box<Self>, ctx: &mut JobContext<'_>) -> BundleResult<()> {
        self.run
            .run_map(self.layer_index, self.map_index, &self.layer_dir, ctx.cancel_token())
    }

    fn describe(&self) -> String {
        format!(
            "map {}",
            self.run.bundle.layers[self.layer_index].maps[self.map_index].name
        )
    }
}

impl RunContext {
    /// Bundle-level preconditions: usable config, every source storable.
    fn preflight(&self) -> BundleResult<()> {
        self.config.validate()?;
        for (layer, map) in self.bundle.maps() {
            if !self.strategy.supports_source(map.source.as_ref()) {
                return Err(BundleError::PreflightTestFailure(format!(
                    "{} cannot store {:?} tiles of source {} (layer {}, map {})",
                    self.strategy.name(),
                    map.source.tile_type(),
                    map.source.id(),
                    layer.name,
                    map.name
                )));
            }
        }
        Ok(())
    }

    fn bundle_levels(
        self: &Arc<Self>,
        output_dir: &Path,
        cancel: &CancelToken,
        tracker: &mut LevelTracker<'_>,
        output: &mut Option<PathBuf>,
    ) -> BundleResult<()> {
        let bundle = &self.bundle;
        if let Err(e) = self.preflight() {
            tracker.advance(LevelState::PreflightFailed);
            return Err(e);
        }
        if cancel.is_cancelled() {
            tracker.advance(LevelState::Aborted);
            return Err(BundleError::Cancelled);
        }

        tracker.advance(LevelState::Initialize);
        let initialized = self
            .strategy
            .begin_bundle(output_dir, bundle)
            .and_then(|dir| {
                let name = format!("bundle-{}", bundle.name);
                let dispatcher =
                    self.dispatcher(name, bundle.layers.len(), self.config.bundle_threads, cancel)?;
                Ok((dir, dispatcher))
            });
        let (bundle_dir, dispatcher) = match initialized {
            Ok(v) => v,
            Err(e) => {
                tracker.advance(LevelState::Failed);
                return Err(e);
            }
        };
        *output = Some(bundle_dir.clone());

        tracker.advance(LevelState::DecomposeAndDispatch);
        for index in 0..bundle.layers.len() {
            let job = LayerJob {
                run: Arc::clone(self),
                index,
                bundle_dir: bundle_dir.clone(),
            };
            if let Err(e) = dispatcher.submit(Box::new(job)) {
                debug!(bundle = %bundle.name, error = %e, "stopped dispatching layers");
                break;
            }
        }

        tracker.advance(LevelState::AwaitChildren);
        if !dispatcher.await_termination(self.config.drain_poll(), cancel) {
            tracker.advance(LevelState::Aborted);
            return Err(BundleError::Cancelled);
        }

        tracker.advance(LevelState::Finalize);
        let finished: Vec<String> = {
            let mut layers: Vec<&LayerReport> = Vec::new();
            let reports = self.layers.lock();
            layers.extend(reports.iter().filter(|l| l.state == LevelState::Done));
            layers.sort_by_key(|l| l.index);
            layers.into_iter().map(|l| l.layer.clone()).collect()
        };
        match self.strategy.finish_bundle(&bundle_dir, bundle, &finished) {
            Ok(()) => {
                tracker.advance(LevelState::Done);
                Ok(())
            }
            Err(e) => {
                tracker.advance(LevelState::Failed);
                Err(e)
            }
        }
    }
}

/// Assembles bundles through nested dispatchers.
///
/// `assemble` never returns an error or unwinds: partial failures,
/// cancellation, preflight rejections and panicking format hooks all end up
/// in the [`AssemblyReport`].
pub struct BundleAssemblyEngine {
    config: EngineConfig,
    store: Arc<dyn TileStore>,
    pause: Arc<PauseResumeHandler>,
    listener: Option<Arc<dyn ProgressListener>>,
    strategy: Option<Arc<dyn BundleFormatStrategy>>,
}

impl BundleAssemblyEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn TileStore>) -> Self {
        Self {
            config,
            store,
            pause: Arc::new(PauseResumeHandler::new()),
            listener: None,
            strategy: None,
        }
    }

    /// Forward job and level events to `listener`.
    pub fn with_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Use `strategy` instead of the one registered for the bundle's format.
    pub fn with_strategy(mut self, strategy: Arc<dyn BundleFormatStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Pause gate shared by every dispatcher of every run of this engine.
    pub fn pause_handler(&self) -> Arc<PauseResumeHandler> {
        Arc::clone(&self.pause)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn assemble(&self, bundle: &Bundle, output_dir: &Path, cancel: &CancelToken) -> AssemblyReport {
        let started = Instant::now();
        let cancel = cancel.child();
        let progress = Arc::new(match &self.listener {
            Some(listener) => RunProgress::with_listener(Arc::clone(listener)),
            None => RunProgress::new(),
        });
        let strategy = self
            .strategy
            .clone()
            .unwrap_or_else(|| bundle.format.strategy());

        let run = Arc::new(RunContext {
            dispatcher_config: self.config.dispatcher_config(),
            config: self.config.clone(),
            strategy,
            store: Arc::clone(&self.store),
            progress: Arc::clone(&progress),
            budget: ThreadBudget::new(self.config.thread_budget),
            pause: Arc::clone(&self.pause),
            bundle: Arc::new(bundle.clone()),
            layers: Mutex::new(Vec::new()),
            maps: Mutex::new(Vec::new()),
        });

        info!(
            bundle = %bundle.name,
            format = run.strategy.name(),
            layers = bundle.layers.len(),
            tiles = bundle.tile_count(),
            "assembling bundle"
        );
        progress.level_started(LevelKind::Bundle, &bundle.name);
        let mut tracker = LevelTracker::new(LevelKind::Bundle, &bundle.name);
        let mut output = None;
        let levels = panic::catch_unwind(AssertUnwindSafe(|| {
            run.bundle_levels(output_dir, &cancel, &mut tracker, &mut output)
        }));
        let result = match levels {
            Ok(result) => result,
            Err(payload) => {
                tracker.state = LevelState::Failed;
                Err(BundleError::Panicked(panic_message(payload.as_ref())))
            }
        };
        let state = tracker.state;
        progress.level_finished(LevelKind::Bundle, &bundle.name, state == LevelState::Done);

        let mut layers = std::mem::take(&mut *run.layers.lock());
        layers.sort_by_key(|l| l.index);
        let mut maps = std::mem::take(&mut *run.maps.lock());
        maps.sort_by_key(|m| m.order);

        let report = AssemblyReport {
            bundle: bundle.name.clone(),
            state,
            output,
            layers,
            maps,
            progress: progress.snapshot(),
            elapsed: started.elapsed(),
            error: result.err().map(|e| e.to_string()),
        };

        match state {
            LevelState::Done => info!(
                bundle = %report.bundle,
                elapsed_ms = report.elapsed.as_millis() as u64,
                completed = report.progress.completed,
                from_cache = report.progress.cache_hits,
                failed = report.progress.permanent_errors,
                "bundle done"
            ),
            LevelState::Aborted => warn!(
                bundle = %report.bundle,
                completed = report.progress.completed,
                "bundle assembly cancelled"
            ),
            _ => error!(
                bundle = %report.bundle,
                state = ?state,
                error = report.error.as_deref().unwrap_or(""),
                "bundle assembly failed"
            ),
        }
        report
    }
}
