//! Map source boundary.

use bytes::Bytes;
use serde::Deserialize;

use crate::error::FetchError;
use crate::tile::TileImageType;

/// Where a tile may be obtained from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Tile store first, map source on miss.
    #[default]
    Default,
    /// Tile store only; a miss is a permanent failure (offline run).
    CacheOnly,
    /// Always download, ignoring stored tiles. Downloads still refresh the store.
    SourceOnly,
}

impl FetchMode {
    pub fn reads_store(self) -> bool {
        !matches!(self, FetchMode::SourceOnly)
    }

    pub fn reads_source(self) -> bool {
        !matches!(self, FetchMode::CacheOnly)
    }
}

/// A tile provider (online tile server, local renderer, ...).
///
/// Implementations are called concurrently from many worker threads.
pub trait MapSource: Send + Sync {
    /// Stable identity, used in tile addresses and store paths.
    fn id(&self) -> &str;

    /// Fetch the encoded tile image.
    fn fetch_tile(&self, zoom: u8, x: u32, y: u32, mode: FetchMode) -> Result<Bytes, FetchError>;

    /// Encoding of the tiles this source serves.
    fn tile_type(&self) -> TileImageType;

    fn min_zoom(&self) -> u8 {
        0
    }

    fn max_zoom(&self) -> u8 {
        crate::mercator::MAX_ZOOM
    }

    fn supports_zoom(&self, zoom: u8) -> bool {
        zoom >= self.min_zoom() && zoom <= self.max_zoom()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedSource;

    #[test]
    fn test_fetch_mode_flags() {
        assert!(FetchMode::Default.reads_store());
        assert!(FetchMode::Default.reads_source());
        assert!(!FetchMode::CacheOnly.reads_source());
        assert!(!FetchMode::SourceOnly.reads_store());
    }

    #[test]
    fn test_default_zoom_range() {
        let source = ScriptedSource::succeeding("osm");
        assert!(source.supports_zoom(0));
        assert!(source.supports_zoom(18));
        assert!(!source.supports_zoom(25));
    }
}
