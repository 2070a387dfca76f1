//! Output formats.
//!
//! The engine never encodes anything itself: every level calls into a
//! [`BundleFormatStrategy`] at Initialize and Finalize, and tile jobs write
//! into the [`MapArchive`] opened for their map. Strategies are selected
//! through the closed [`BundleFormat`] enum.

mod directory;
mod pack;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BundleError, BundleResult};
use crate::model::{Bundle, Layer, MapSpec, TileRange};
use crate::source::MapSource;
use crate::tile::{TileAddress, TileData};

pub use directory::{TileDirectoryFormat, BUNDLE_MANIFEST, LAYER_MANIFEST, MAP_MANIFEST};
pub use pack::{PackTileRef, TilePackFormat, TilePackReader, INDEX_FILE, PACK_FILE};

/// Supported bundle output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleFormat {
    /// One image file per tile plus JSON manifests.
    #[default]
    TileDirectory,
    /// One packed data file and a binary index per map.
    TilePack,
}

impl BundleFormat {
    pub const ALL: [BundleFormat; 2] = [BundleFormat::TileDirectory, BundleFormat::TilePack];

    /// Strategy implementing this format.
    pub fn strategy(self) -> Arc<dyn BundleFormatStrategy> {
        match self {
            BundleFormat::TileDirectory => Arc::new(TileDirectoryFormat),
            BundleFormat::TilePack => Arc::new(TilePackFormat),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BundleFormat::TileDirectory => "tile_directory",
            BundleFormat::TilePack => "tile_pack",
        }
    }

    pub fn from_name(name: &str) -> BundleResult<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| BundleError::Config(format!("unknown bundle format: {}", name)))
    }
}

impl fmt::Display for BundleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a finished map archive contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSummary {
    pub name: String,
    pub source: String,
    pub zoom: u8,
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
    pub tiles: u64,
    pub bytes: u64,
    pub path: PathBuf,
}

impl MapSummary {
    pub(crate) fn new(map: &MapSpec, path: PathBuf) -> Self {
        let TileRange {
            min_x,
            min_y,
            max_x,
            max_y,
        } = map.range;
        Self {
            name: map.name.clone(),
            source: map.source.id().to_string(),
            zoom: map.zoom,
            min_x,
            min_y,
            max_x,
            max_y,
            tiles: 0,
            bytes: 0,
            path,
        }
    }
}

/// Sink for the tiles of one map. Tile jobs share it behind a mutex.
pub trait MapArchive: Send {
    fn write_tile(&mut self, address: &TileAddress, tile: &TileData) -> BundleResult<()>;

    /// Flush and close; called once, after every tile job of the map ended.
    fn finish(self: Box<Self>) -> BundleResult<MapSummary>;
}

/// Output format hooks, called by the assembly engine at each level.
pub trait BundleFormatStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether tiles from `source` can be stored in this format.
    fn supports_source(&self, source: &dyn MapSource) -> bool;

    /// Create the bundle output under `output_dir`; returns the bundle directory.
    fn begin_bundle(&self, output_dir: &Path, bundle: &Bundle) -> BundleResult<PathBuf>;

    fn finish_bundle(&self, bundle_dir: &Path, bundle: &Bundle, layers: &[String])
        -> BundleResult<()>;

    /// Returns the layer directory.
    fn begin_layer(&self, bundle_dir: &Path, layer: &Layer) -> BundleResult<PathBuf>;

    fn finish_layer(&self, layer_dir: &Path, layer: &Layer, maps: &[MapSummary])
        -> BundleResult<()>;

    fn begin_map(&self, layer_dir: &Path, map: &MapSpec) -> BundleResult<Box<dyn MapArchive>>;
}

/// Create `parent/<name>` with the name made path-safe.
pub(crate) fn child_dir(parent: &Path, name: &str) -> BundleResult<PathBuf> {
    let dir = parent.join(crate::store::sanitize(name));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Write pretty JSON through a temporary file and a rename.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> BundleResult<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names() {
        for format in BundleFormat::ALL {
            assert_eq!(format.strategy().name(), format.name());
            assert_eq!(BundleFormat::from_name(format.name()).unwrap(), format);
        }
        assert!(BundleFormat::from_name("kap").is_err());
    }

    #[test]
    fn test_serde_names() {
        let format: BundleFormat = serde_json::from_str("\"tile_pack\"").unwrap();
        assert_eq!(format, BundleFormat::TilePack);
        assert_eq!(
            serde_json::to_string(&BundleFormat::TileDirectory).unwrap(),
            "\"tile_directory\""
        );
    }
}
