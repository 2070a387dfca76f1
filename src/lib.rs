//! ChartBundle Core - concurrent tile acquisition and offline chart bundles.
//!
//! A [`Bundle`] is a tree of layers, each holding maps, each map a
//! rectangle of slippy-map tiles at one zoom level from one source. The
//! [`BundleAssemblyEngine`] walks that tree with one bounded
//! [`JobDispatcher`] per level instance:
//! - tiles are read from a [`TileStore`] or downloaded with retries
//! - every tile lands in the map archive of the selected [`BundleFormat`]
//! - pause, resume and cooperative cancellation reach every worker
//! - a [`ProgressListener`] sees job and level events as they happen

pub mod budget;
pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod filter;
pub mod format;
pub mod http_source;
pub mod mercator;
pub mod model;
pub mod pause;
pub mod progress;
pub mod source;
pub mod store;
pub mod tile;
pub mod tile_job;
#[cfg(test)]
pub(crate) mod test_utils;

pub use budget::ThreadBudget;
pub use cancel::CancelToken;
pub use config::{DispatcherConfig, EngineConfig};
pub use dispatcher::{Job, JobContext, JobDispatcher};
pub use engine::{AssemblyReport, BundleAssemblyEngine, LayerReport, LevelState, MapReport};
pub use error::{BundleError, BundleResult, FetchError, FetchErrorKind};
pub use filter::{PolygonFilter, TileFilter};
pub use format::{BundleFormat, BundleFormatStrategy, MapArchive, MapSummary, TilePackReader};
pub use http_source::HttpMapSource;
pub use model::{Bundle, Layer, MapSpec, TileRange};
pub use pause::PauseResumeHandler;
pub use progress::{LevelKind, NoopListener, ProgressListener, ProgressSnapshot, RunProgress};
pub use source::{FetchMode, MapSource};
pub use store::{DiskTileStore, MemoryTileStore, TileStore};
pub use tile::{TileAddress, TileData, TileImageType};
