//! Engine configuration.
//!
//! Every field has a default so a partial `engine.json` is enough:
//!
//! ```json
//! { "map_threads": 4, "max_download_retries": 2 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BundleError, BundleResult};
use crate::source::FetchMode;

/// Tunables of a single dispatcher (queue capacities and poll intervals).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub capacity_ceiling: usize,
    /// Sleep between backpressure re-checks in `submit`.
    pub submit_poll: Duration,
    /// Pause taken by a worker after a job reported resource exhaustion.
    pub exhaustion_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        EngineConfig::default().dispatcher_config()
    }
}

/// Configuration consumed by the assembly engine.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker cap of the bundle-level dispatcher (one job per layer).
    pub bundle_threads: usize,
    /// Worker cap of each layer-level dispatcher (one job per map).
    pub layer_threads: usize,
    /// Worker cap of each map-level dispatcher (one job per tile).
    pub map_threads: usize,
    /// Extra worker threads shared by every dispatcher of one run.
    /// Each dispatcher always gets one worker outside this budget.
    pub thread_budget: usize,
    pub max_download_retries: u32,
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub capacity_ceiling: usize,
    pub submit_poll_ms: u64,
    pub drain_poll_ms: u64,
    pub exhaustion_backoff_ms: u64,
    pub fetch_mode: FetchMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bundle_threads: 10,
            layer_threads: 10,
            map_threads: 10,
            thread_budget: 64,
            max_download_retries: 3,
            min_capacity: 50,
            max_capacity: 100,
            capacity_ceiling: 2000,
            submit_poll_ms: 200,
            drain_poll_ms: 1000,
            exhaustion_backoff_ms: 500,
            fetch_mode: FetchMode::Default,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> BundleResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json(content: &str) -> BundleResult<Self> {
        let config: EngineConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BundleResult<()> {
        if self.bundle_threads == 0 || self.layer_threads == 0 || self.map_threads == 0 {
            return Err(BundleError::Config(
                "thread caps must be at least 1".into(),
            ));
        }
        if self.min_capacity == 0 {
            return Err(BundleError::Config("min_capacity must be at least 1".into()));
        }
        if self.min_capacity > self.max_capacity {
            return Err(BundleError::Config(format!(
                "min_capacity ({}) exceeds max_capacity ({})",
                self.min_capacity, self.max_capacity
            )));
        }
        if self.max_capacity > self.capacity_ceiling {
            return Err(BundleError::Config(format!(
                "max_capacity ({}) exceeds capacity_ceiling ({})",
                self.max_capacity, self.capacity_ceiling
            )));
        }
        if self.drain_poll_ms == 0 || self.submit_poll_ms == 0 {
            return Err(BundleError::Config("poll intervals must be non-zero".into()));
        }
        Ok(())
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            min_capacity: self.min_capacity,
            max_capacity: self.max_capacity,
            capacity_ceiling: self.capacity_ceiling,
            submit_poll: Duration::from_millis(self.submit_poll_ms),
            exhaustion_backoff: Duration::from_millis(self.exhaustion_backoff_ms),
        }
    }
}
