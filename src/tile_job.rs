//! The leaf job: obtain one tile and write it into its map's archive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::dispatcher::{Job, JobContext};
use crate::error::{BundleError, BundleResult, FetchErrorKind};
use crate::format::MapArchive;
use crate::source::{FetchMode, MapSource};
use crate::store::TileStore;
use crate::tile::{TileAddress, TileData};

/// A map's archive, shared by all of its tile jobs. Taken at Finalize.
pub type SharedArchive = Arc<Mutex<Option<Box<dyn MapArchive>>>>;

/// Per-map counters, for reporting only.
#[derive(Debug, Default)]
pub struct MapStats {
    written: AtomicU64,
    from_cache: AtomicU64,
    fetch_attempts: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStatsSnapshot {
    pub written: u64,
    pub from_cache: u64,
    pub fetch_attempts: u64,
    pub failed: u64,
    pub bytes: u64,
}

impl MapStats {
    pub fn snapshot(&self) -> MapStatsSnapshot {
        MapStatsSnapshot {
            written: self.written.load(Ordering::Relaxed),
            from_cache: self.from_cache.load(Ordering::Relaxed),
            fetch_attempts: self.fetch_attempts.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Everything the tile jobs of one map share.
pub struct TileTarget {
    pub source: Arc<dyn MapSource>,
    pub store: Arc<dyn TileStore>,
    pub archive: SharedArchive,
    pub stats: Arc<MapStats>,
    pub mode: FetchMode,
    pub max_retries: u32,
}

/// Fetches (or loads from the store) one tile and writes it to the archive.
///
/// Transient failures requeue the job on its own dispatcher until its retry
/// counter exceeds `max_retries`.
pub struct TileAcquisitionJob {
    address: TileAddress,
    target: Arc<TileTarget>,
    retries: u32,
}

impl TileAcquisitionJob {
    pub fn new(address: TileAddress, target: Arc<TileTarget>) -> Self {
        Self {
            address,
            target,
            retries: 0,
        }
    }

    pub fn address(&self) -> &TileAddress {
        &self.address
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Returns the payload size and whether it came from the store.
    fn acquire(&self, cancel: &CancelToken) -> BundleResult<(usize, bool)> {
        let target = &self.target;

        if target.mode.reads_store() {
            if let Some(bytes) = target.store.get(&self.address) {
                match TileData::parse(bytes) {
                    Ok(tile) => {
                        self.write(&tile)?;
                        target.stats.from_cache.fetch_add(1, Ordering::Relaxed);
                        return Ok((tile.size_bytes(), true));
                    }
                    Err(e) => {
                        warn!(tile = %self.address, error = %e, "stored tile is invalid, refetching")
                    }
                }
            }
        }

        if !target.mode.reads_source() {
            return Err(BundleError::UnrecoverableDownload {
                tile: self.address.to_string(),
                reason: "not in the tile store and the source is disabled".into(),
            });
        }
        if cancel.is_cancelled() {
            return Err(BundleError::Cancelled);
        }

        target.stats.fetch_attempts.fetch_add(1, Ordering::Relaxed);
        let bytes = target
            .source
            .fetch_tile(
                self.address.zoom,
                self.address.x,
                self.address.y,
                target.mode,
            )
            .map_err(|e| BundleError::from_fetch(&self.address, e))?;

        let tile = TileData::parse(bytes).map_err(|e| BundleError::TransientNetwork {
            tile: self.address.to_string(),
            kind: FetchErrorKind::DownloadFailed,
            reason: e.to_string(),
        })?;

        if let Err(e) = target.store.put(&self.address, tile.bytes.clone()) {
            warn!(tile = %self.address, error = %e, "could not store tile");
        }
        self.write(&tile)?;
        Ok((tile.size_bytes(), false))
    }

    fn write(&self, tile: &TileData) -> BundleResult<()> {
        let mut archive = self.target.archive.lock();
        let archive = archive.as_mut().ok_or_else(|| {
            BundleError::Validation(format!("archive closed before {} was written", self.address))
        })?;
        archive.write_tile(&self.address, tile)?;
        self.target.stats.written.fetch_add(1, Ordering::Relaxed);
        self.target
            .stats
            .bytes
            .fetch_add(tile.size_bytes() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl Job for TileAcquisitionJob {
    fn run(mut self: Box<Self>, ctx: &mut JobContext<'_>) -> BundleResult<()> {
        if ctx.is_cancelled() {
            return Err(BundleError::Cancelled);
        }
        ctx.listener().job_started();

        let err = match self.acquire(ctx.cancel_token()) {
            Ok((bytes, from_cache)) => {
                if from_cache {
                    ctx.listener().tile_from_cache(bytes);
                }
                ctx.listener().job_finished_successfully(bytes);
                return Ok(());
            }
            Err(e) => e,
        };

        if matches!(err, BundleError::TransientNetwork { .. }) {
            self.retries += 1;
            if self.retries <= self.target.max_retries {
                debug!(
                    tile = %self.address,
                    attempt = self.retries,
                    max_retries = self.target.max_retries,
                    error = %err,
                    "transient failure, requeueing"
                );
                let stats = Arc::clone(&self.target.stats);
                return match ctx.submit_retry(self) {
                    Ok(()) => {
                        ctx.listener().job_finished_with_error(true);
                        Ok(())
                    }
                    Err(e) if e.is_cancelled() => {
                        ctx.listener().job_cancelled();
                        Err(e)
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        ctx.listener().job_finished_with_error(false);
                        Err(e)
                    }
                };
            }
        }

        if err.is_cancelled() {
            ctx.listener().job_cancelled();
            return Err(err);
        }
        self.target.stats.failed.fetch_add(1, Ordering::Relaxed);
        debug!(tile = %self.address, retries = self.retries, error = %err, "tile failed");
        ctx.listener().job_finished_with_error(false);
        Err(err)
    }

    fn describe(&self) -> String {
        format!("tile {}", self.address)
    }
}
