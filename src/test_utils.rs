//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::{BundleResult, FetchError, FetchErrorKind};
use crate::format::{MapArchive, MapSummary};
use crate::mercator::MAX_ZOOM;
use crate::source::{FetchMode, MapSource};
use crate::tile::{TileAddress, TileData, TileImageType};

/// A small payload with a PNG signature, unique per coordinate.
pub(crate) fn png_tile(x: u32, y: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(24);
    buf.put_slice(b"\x89PNG\r\n\x1a\n");
    buf.put_u32(x);
    buf.put_u32(y);
    buf.put_slice(b"IEND");
    buf.freeze()
}

/// Route tracing output through the test harness. Safe to call repeatedly.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Scripted outcome of fetching one tile.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Behaviour {
    Succeed,
    /// Fail the first `n` attempts with `kind`, then succeed.
    FailFirst(usize, FetchErrorKind),
    /// Fail every attempt with `kind`.
    Fail(FetchErrorKind),
    /// Return a body that is not an image.
    Garbage,
}

/// In-process map source with per-tile scripted behaviour and call counters.
pub(crate) struct ScriptedSource {
    id: String,
    tile_type: TileImageType,
    min_zoom: u8,
    max_zoom: u8,
    default: Behaviour,
    per_tile: HashMap<(u32, u32), Behaviour>,
    attempts: Mutex<HashMap<(u32, u32), usize>>,
    fetches: AtomicUsize,
    delay: Duration,
}

impl ScriptedSource {
    pub(crate) fn succeeding(id: &str) -> Self {
        Self::with_default(id, Behaviour::Succeed)
    }

    pub(crate) fn failing(id: &str, kind: FetchErrorKind) -> Self {
        Self::with_default(id, Behaviour::Fail(kind))
    }

    pub(crate) fn with_default(id: &str, default: Behaviour) -> Self {
        Self {
            id: id.to_string(),
            tile_type: TileImageType::Png,
            min_zoom: 0,
            max_zoom: MAX_ZOOM,
            default,
            per_tile: HashMap::new(),
            attempts: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn with_zoom_range(mut self, min_zoom: u8, max_zoom: u8) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom;
        self
    }

    /// Declared tile type only; payloads stay PNG.
    pub(crate) fn with_tile_type(mut self, tile_type: TileImageType) -> Self {
        self.tile_type = tile_type;
        self
    }

    pub(crate) fn with_tile(mut self, x: u32, y: u32, behaviour: Behaviour) -> Self {
        self.per_tile.insert((x, y), behaviour);
        self
    }

    /// Sleep this long inside every fetch.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Total fetch calls across all tiles.
    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Fetch calls for one tile.
    pub(crate) fn attempts(&self, x: u32, y: u32) -> usize {
        self.attempts.lock().get(&(x, y)).copied().unwrap_or(0)
    }
}

impl MapSource for ScriptedSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch_tile(&self, zoom: u8, x: u32, y: u32, mode: FetchMode) -> Result<Bytes, FetchError> {
        if !mode.reads_source() {
            return Err(FetchError::unrecoverable("offline"));
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut attempts = self.attempts.lock();
            let n = attempts.entry((x, y)).or_insert(0);
            *n += 1;
            *n
        };
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let behaviour = self.per_tile.get(&(x, y)).copied().unwrap_or(self.default);
        match behaviour {
            Behaviour::Succeed => Ok(png_tile(x, y)),
            Behaviour::FailFirst(n, kind) if attempt <= n => Err(FetchError::new(
                kind,
                format!("scripted failure {} of {} for {}/{}/{}", attempt, n, zoom, x, y),
            )),
            Behaviour::FailFirst(..) => Ok(png_tile(x, y)),
            Behaviour::Fail(kind) => Err(FetchError::new(
                kind,
                format!("scripted failure for {}/{}/{}", zoom, x, y),
            )),
            Behaviour::Garbage => Ok(Bytes::from_static(b"<html>rate limited</html>")),
        }
    }

    fn tile_type(&self) -> TileImageType {
        self.tile_type
    }

    fn min_zoom(&self) -> u8 {
        self.min_zoom
    }

    fn max_zoom(&self) -> u8 {
        self.max_zoom
    }
}

/// Archive that records written tiles in memory, optionally failing every write.
pub(crate) struct RecordingArchive {
    pub(crate) written: Arc<Mutex<Vec<TileAddress>>>,
    fail_writes: bool,
}

impl RecordingArchive {
    pub(crate) fn new() -> Self {
        Self {
            written: Arc::new(Mutex::new(Vec::new())),
            fail_writes: false,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::new()
        }
    }
}

impl MapArchive for RecordingArchive {
    fn write_tile(&mut self, address: &TileAddress, _tile: &TileData) -> BundleResult<()> {
        if self.fail_writes {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
        }
        self.written.lock().push(address.clone());
        Ok(())
    }

    fn finish(self: Box<Self>) -> BundleResult<MapSummary> {
        let tiles = self.written.lock().len() as u64;
        Ok(MapSummary {
            name: "recording".to_string(),
            source: String::new(),
            zoom: 0,
            min_x: 0,
            min_y: 0,
            max_x: 0,
            max_y: 0,
            tiles,
            bytes: 0,
            path: PathBuf::new(),
        })
    }
}
