//! Tile-directory format: `<bundle>/<layer>/<map>/<z>/<x>/<y>.<ext>`.
//!
//! Each map directory gets a `map.json` manifest, each layer a `layer.json`
//! listing its maps and the bundle root a `bundle.json`.

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::{child_dir, write_json, BundleFormatStrategy, MapArchive, MapSummary};
use crate::error::BundleResult;
use crate::model::{Bundle, Layer, MapSpec};
use crate::source::MapSource;
use crate::tile::{TileAddress, TileData};

pub const MAP_MANIFEST: &str = "map.json";
pub const LAYER_MANIFEST: &str = "layer.json";
pub const BUNDLE_MANIFEST: &str = "bundle.json";

#[derive(Debug, Clone, Copy, Default)]
pub struct TileDirectoryFormat;

#[derive(Serialize)]
struct LayerManifest<'a> {
    name: &'a str,
    maps: &'a [MapSummary],
}

#[derive(Serialize)]
struct BundleManifest<'a> {
    name: &'a str,
    format: &'static str,
    layers: &'a [String],
}

impl BundleFormatStrategy for TileDirectoryFormat {
    fn name(&self) -> &'static str {
        "tile_directory"
    }

    fn supports_source(&self, _source: &dyn MapSource) -> bool {
        true
    }

    fn begin_bundle(&self, output_dir: &Path, bundle: &Bundle) -> BundleResult<PathBuf> {
        child_dir(output_dir, &bundle.name)
    }

    fn finish_bundle(
        &self,
        bundle_dir: &Path,
        bundle: &Bundle,
        layers: &[String],
    ) -> BundleResult<()> {
        write_json(
            &bundle_dir.join(BUNDLE_MANIFEST),
            &BundleManifest {
                name: &bundle.name,
                format: self.name(),
                layers,
            },
        )
    }

    fn begin_layer(&self, bundle_dir: &Path, layer: &Layer) -> BundleResult<PathBuf> {
        child_dir(bundle_dir, &layer.name)
    }

    fn finish_layer(
        &self,
        layer_dir: &Path,
        layer: &Layer,
        maps: &[MapSummary],
    ) -> BundleResult<()> {
        write_json(
            &layer_dir.join(LAYER_MANIFEST),
            &LayerManifest {
                name: &layer.name,
                maps,
            },
        )
    }

    fn begin_map(&self, layer_dir: &Path, map: &MapSpec) -> BundleResult<Box<dyn MapArchive>> {
        let dir = child_dir(layer_dir, &map.name)?;
        Ok(Box::new(DirectoryArchive {
            summary: MapSummary::new(map, dir.clone()),
            dir,
        }))
    }
}

struct DirectoryArchive {
    dir: PathBuf,
    summary: MapSummary,
}

impl MapArchive for DirectoryArchive {
    fn write_tile(&mut self, address: &TileAddress, tile: &TileData) -> BundleResult<()> {
        let column = self
            .dir
            .join(address.zoom.to_string())
            .join(address.x.to_string());
        std::fs::create_dir_all(&column)?;
        let path = column.join(format!("{}.{}", address.y, tile.image_type.extension()));
        std::fs::write(path, &tile.bytes)?;

        self.summary.tiles += 1;
        self.summary.bytes += tile.size_bytes() as u64;
        Ok(())
    }

    fn finish(self: Box<Self>) -> BundleResult<MapSummary> {
        write_json(&self.dir.join(MAP_MANIFEST), &self.summary)?;
        Ok(self.summary)
    }
}
