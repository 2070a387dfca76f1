//! Bundle → Layer → Map model.

use std::fmt;
use std::sync::Arc;

use crate::error::{BundleError, BundleResult};
use crate::filter::TileFilter;
use crate::format::BundleFormat;
use crate::mercator::{tile_for, tiles_per_axis, MAX_ZOOM};
use crate::source::MapSource;
use crate::tile::TileAddress;

/// Inclusive rectangle of tile coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl TileRange {
    pub fn new(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Tiles covering a lat/lon bounding box at `zoom`.
    pub fn from_bounds(north: f64, west: f64, south: f64, east: f64, zoom: u8) -> Self {
        let (min_x, min_y) = tile_for(north, west, zoom);
        let (max_x, max_y) = tile_for(south, east, zoom);
        Self::new(min_x, min_y, max_x.max(min_x), max_y.max(min_y))
    }

    pub fn cols(&self) -> u32 {
        self.max_x.saturating_sub(self.min_x) + 1
    }

    pub fn rows(&self) -> u32 {
        self.max_y.saturating_sub(self.min_y) + 1
    }

    pub fn tile_count(&self) -> u64 {
        self.cols() as u64 * self.rows() as u64
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Check the range is ordered and inside the world at `zoom`.
    pub fn validate(&self, zoom: u8) -> BundleResult<()> {
        if zoom > MAX_ZOOM {
            return Err(BundleError::PreflightTestFailure(format!(
                "zoom {} exceeds maximum {}",
                zoom, MAX_ZOOM
            )));
        }
        if self.min_x > self.max_x || self.min_y > self.max_y {
            return Err(BundleError::PreflightTestFailure(format!(
                "inverted tile range {}",
                self
            )));
        }
        let limit = tiles_per_axis(zoom);
        if self.max_x >= limit || self.max_y >= limit {
            return Err(BundleError::PreflightTestFailure(format!(
                "tile range {} outside the {}x{} world at zoom {}",
                self, limit, limit, zoom
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..={}]x[{}..={}]",
            self.min_x, self.max_x, self.min_y, self.max_y
        )
    }
}

/// A rectangular tile region at one zoom from one map source.
#[derive(Clone)]
pub struct MapSpec {
    pub name: String,
    pub source: Arc<dyn MapSource>,
    pub zoom: u8,
    pub range: TileRange,
    pub filter: Option<Arc<dyn TileFilter>>,
}

impl MapSpec {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn MapSource>,
        zoom: u8,
        range: TileRange,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            zoom,
            range,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn TileFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn address(&self, x: u32, y: u32) -> TileAddress {
        TileAddress::new(self.source.id(), self.zoom, x, y)
    }

    /// Map-level preconditions: well-formed range, zoom served by the source.
    pub fn check(&self) -> BundleResult<()> {
        self.range.validate(self.zoom)?;
        if !self.source.supports_zoom(self.zoom) {
            return Err(BundleError::PreflightTestFailure(format!(
                "map {}: source {} does not serve zoom {} ({}..={})",
                self.name,
                self.source.id(),
                self.zoom,
                self.source.min_zoom(),
                self.source.max_zoom()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for MapSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapSpec")
            .field("name", &self.name)
            .field("source", &self.source.id())
            .field("zoom", &self.zoom)
            .field("range", &self.range)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// A zoom-level grouping of maps.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub maps: Vec<MapSpec>,
}

impl Layer {
    pub fn new(name: impl Into<String>, maps: Vec<MapSpec>) -> Self {
        Self {
            name: name.into(),
            maps,
        }
    }

    pub fn tile_count(&self) -> u64 {
        self.maps.iter().map(|m| m.range.tile_count()).sum()
    }
}

/// Top-level output artifact: layers rendered in one output format.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub name: String,
    pub format: BundleFormat,
    pub layers: Vec<Layer>,
}

impl Bundle {
    pub fn new(name: impl Into<String>, format: BundleFormat, layers: Vec<Layer>) -> Self {
        Self {
            name: name.into(),
            format,
            layers,
        }
    }

    pub fn maps(&self) -> impl Iterator<Item = (&Layer, &MapSpec)> {
        self.layers
            .iter()
            .flat_map(|layer| layer.maps.iter().map(move |map| (layer, map)))
    }

    /// Upper bound on tiles, before filters.
    pub fn tile_count(&self) -> u64 {
        self.layers.iter().map(Layer::tile_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedSource;

    #[test]
    fn test_range_counts() {
        let range = TileRange::new(10, 20, 12, 21);
        assert_eq!(range.cols(), 3);
        assert_eq!(range.rows(), 2);
        assert_eq!(range.tile_count(), 6);
        assert!(range.contains(12, 21));
        assert!(!range.contains(13, 21));
    }

    #[test]
    fn test_range_from_bounds() {
        let range = TileRange::from_bounds(54.0, 9.0, 53.0, 11.0, 8);
        range.validate(8).unwrap();
        assert!(range.cols() >= 2);
        assert!(range.rows() >= 1);
    }

    #[test]
    fn test_range_validation() {
        assert!(TileRange::new(0, 0, 1, 1).validate(1).is_ok());
        assert!(TileRange::new(0, 0, 2, 1).validate(1).is_err());
        assert!(TileRange::new(3, 0, 2, 1).validate(4).is_err());
        assert!(TileRange::new(0, 0, 0, 0).validate(30).is_err());
    }

    #[test]
    fn test_map_check_zoom_range() {
        let source = Arc::new(ScriptedSource::succeeding("osm").with_zoom_range(5, 10));
        let ok = MapSpec::new("m", source.clone(), 6, TileRange::new(0, 0, 1, 1));
        assert!(ok.check().is_ok());

        let bad = MapSpec::new("m", source, 11, TileRange::new(0, 0, 1, 1));
        assert!(matches!(
            bad.check(),
            Err(BundleError::PreflightTestFailure(_))
        ));
    }

    #[test]
    fn test_bundle_iterates_maps_in_order() {
        let source: Arc<dyn MapSource> = Arc::new(ScriptedSource::succeeding("osm"));
        let bundle = Bundle::new(
            "b",
            BundleFormat::TileDirectory,
            vec![
                Layer::new(
                    "l1",
                    vec![
                        MapSpec::new("a", source.clone(), 3, TileRange::new(0, 0, 1, 1)),
                        MapSpec::new("b", source.clone(), 3, TileRange::new(2, 2, 2, 2)),
                    ],
                ),
                Layer::new(
                    "l2",
                    vec![MapSpec::new("c", source, 4, TileRange::new(0, 0, 0, 0))],
                ),
            ],
        );
        let names: Vec<_> = bundle.maps().map(|(l, m)| format!("{}/{}", l.name, m.name)).collect();
        assert_eq!(names, vec!["l1/a", "l1/b", "l2/c"]);
        assert_eq!(bundle.tile_count(), 6);
    }
}
