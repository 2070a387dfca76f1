//! Tile stores: the cache consulted before any download.
//!
//! Both implementations are safe for concurrent use from every worker of
//! every level of a run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use moka::sync::Cache;

use crate::error::{BundleError, BundleResult};
use crate::tile::{TileAddress, TileImageType};

/// Cache/persistent layer for previously fetched tiles.
pub trait TileStore: Send + Sync {
    fn get(&self, address: &TileAddress) -> Option<Bytes>;

    fn put(&self, address: &TileAddress, bytes: Bytes) -> BundleResult<()>;

    fn contains(&self, address: &TileAddress) -> bool {
        self.get(address).is_some()
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub size_bytes: u64,
    pub num_tiles: u64,
}

/// In-memory tile store using moka (TinyLFU eviction, weighted by byte size).
pub struct MemoryTileStore {
    cache: Cache<TileAddress, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryTileStore {
    /// Create a new store with the given size limit in megabytes.
    pub fn new(max_size_mb: u64) -> Self {
        let cache = Cache::builder()
            .weigher(|_key: &TileAddress, value: &Bytes| -> u32 {
                value.len().try_into().unwrap_or(u32::MAX)
            })
            .max_capacity(max_size_mb * 1024 * 1024)
            .build();

        Self {
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get store statistics. Flushes pending moka maintenance first.
    pub fn stats(&self) -> StoreStats {
        self.cache.run_pending_tasks();
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size_bytes: self.cache.weighted_size(),
            num_tiles: self.cache.entry_count(),
        }
    }

    /// Reset hit/miss counters to zero.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl TileStore for MemoryTileStore {
    fn get(&self, address: &TileAddress) -> Option<Bytes> {
        let found = self.cache.get(address);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn put(&self, address: &TileAddress, bytes: Bytes) -> BundleResult<()> {
        self.cache.insert(address.clone(), bytes);
        Ok(())
    }

    fn contains(&self, address: &TileAddress) -> bool {
        self.cache.contains_key(address)
    }
}

const DISK_EXTENSIONS: [TileImageType; 3] =
    [TileImageType::Png, TileImageType::Jpeg, TileImageType::Gif];

/// Tile store on disk: `<root>/<source>/<z>/<x>/<y>.<ext>`.
///
/// Writes go through a temporary file and a rename so concurrent readers
/// never observe a partially written tile.
pub struct DiskTileStore {
    root: PathBuf,
}

impl DiskTileStore {
    pub fn new(root: impl Into<PathBuf>) -> BundleResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tile_dir(&self, address: &TileAddress) -> PathBuf {
        self.root
            .join(sanitize(&address.source))
            .join(address.zoom.to_string())
            .join(address.x.to_string())
    }

    fn tile_path(&self, address: &TileAddress, image_type: TileImageType) -> PathBuf {
        self.tile_dir(address)
            .join(format!("{}.{}", address.y, image_type.extension()))
    }
}

/// Make a source id usable as a single path component.
pub(crate) fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl TileStore for DiskTileStore {
    fn get(&self, address: &TileAddress) -> Option<Bytes> {
        DISK_EXTENSIONS.iter().find_map(|&ty| {
            std::fs::read(self.tile_path(address, ty))
                .ok()
                .map(Bytes::from)
        })
    }

    fn put(&self, address: &TileAddress, bytes: Bytes) -> BundleResult<()> {
        let image_type = TileImageType::detect(&bytes).ok_or_else(|| {
            BundleError::Validation(format!("refusing to store non-image tile {}", address))
        })?;

        let dir = self.tile_dir(address);
        std::fs::create_dir_all(&dir)?;

        let path = self.tile_path(address, image_type);
        let tmp = dir.join(format!(
            ".{}.{:?}.tmp",
            address.y,
            std::thread::current().id()
        ));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn contains(&self, address: &TileAddress) -> bool {
        DISK_EXTENSIONS
            .iter()
            .any(|&ty| self.tile_path(address, ty).is_file())
    }
}
