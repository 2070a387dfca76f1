//! Progress reporting for one assembly run.
//!
//! Listeners are fire-and-forget: they are called from worker threads and must
//! not block. [`RunProgress`] is the per-run counter handle the engine threads
//! through every level; it forwards events to an optional outer listener.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Granularity of a decomposition level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LevelKind {
    Bundle,
    Layer,
    Map,
}

impl fmt::Display for LevelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LevelKind::Bundle => "bundle",
            LevelKind::Layer => "layer",
            LevelKind::Map => "map",
        })
    }
}

/// Receives job and level events.
pub trait ProgressListener: Send + Sync {
    fn job_started(&self);

    fn job_finished_successfully(&self, bytes: usize);

    /// `retry` is true when the job was requeued, false on permanent failure.
    fn job_finished_with_error(&self, retry: bool);

    /// A started job stopped because the run was cancelled.
    ///
    /// Listeners that do not track cancellation see a permanent error.
    fn job_cancelled(&self) {
        self.job_finished_with_error(false);
    }

    /// A successful job was served from the tile store.
    fn tile_from_cache(&self, _bytes: usize) {}

    fn level_started(&self, _kind: LevelKind, _name: &str) {}

    fn level_finished(&self, _kind: LevelKind, _name: &str, _completed: bool) {}
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl ProgressListener for NoopListener {
    fn job_started(&self) {}
    fn job_finished_successfully(&self, _bytes: usize) {}
    fn job_finished_with_error(&self, _retry: bool) {}
}

/// Point-in-time copy of the run counters. May be slightly stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub active: i64,
    pub completed: u64,
    pub retry_errors: u64,
    pub permanent_errors: u64,
    pub cancelled: u64,
    pub bytes: u64,
    pub cache_hits: u64,
    pub maps_done: u64,
    pub layers_done: u64,
}

/// Atomic counters scoped to one assembly run.
pub struct RunProgress {
    active: AtomicI64,
    completed: AtomicU64,
    retry_errors: AtomicU64,
    permanent_errors: AtomicU64,
    cancelled: AtomicU64,
    bytes: AtomicU64,
    cache_hits: AtomicU64,
    maps_done: AtomicU64,
    layers_done: AtomicU64,
    forward: Option<Arc<dyn ProgressListener>>,
}

impl RunProgress {
    pub fn new() -> Self {
        Self {
            active: AtomicI64::new(0),
            completed: AtomicU64::new(0),
            retry_errors: AtomicU64::new(0),
            permanent_errors: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            maps_done: AtomicU64::new(0),
            layers_done: AtomicU64::new(0),
            forward: None,
        }
    }

    /// Count events and forward them to `listener`.
    pub fn with_listener(listener: Arc<dyn ProgressListener>) -> Self {
        Self {
            forward: Some(listener),
            ..Self::new()
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retry_errors: self.retry_errors.load(Ordering::Relaxed),
            permanent_errors: self.permanent_errors.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            maps_done: self.maps_done.load(Ordering::Relaxed),
            layers_done: self.layers_done.load(Ordering::Relaxed),
        }
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressListener for RunProgress {
    fn job_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        if let Some(l) = &self.forward {
            l.job_started();
        }
    }

    fn job_finished_successfully(&self, bytes: usize) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if let Some(l) = &self.forward {
            l.job_finished_successfully(bytes);
        }
    }

    fn job_finished_with_error(&self, retry: bool) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if retry {
            self.retry_errors.fetch_add(1, Ordering::Relaxed);
        } else {
            self.permanent_errors.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(l) = &self.forward {
            l.job_finished_with_error(retry);
        }
    }

    fn job_cancelled(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        if let Some(l) = &self.forward {
            l.job_cancelled();
        }
    }

    fn tile_from_cache(&self, bytes: usize) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        if let Some(l) = &self.forward {
            l.tile_from_cache(bytes);
        }
    }

    fn level_started(&self, kind: LevelKind, name: &str) {
        if let Some(l) = &self.forward {
            l.level_started(kind, name);
        }
    }

    fn level_finished(&self, kind: LevelKind, name: &str, completed: bool) {
        match kind {
            LevelKind::Map => {
                self.maps_done.fetch_add(1, Ordering::Relaxed);
            }
            LevelKind::Layer => {
                self.layers_done.fetch_add(1, Ordering::Relaxed);
            }
            LevelKind::Bundle => {}
        }
        if let Some(l) = &self.forward {
            l.level_finished(kind, name, completed);
        }
    }
}
