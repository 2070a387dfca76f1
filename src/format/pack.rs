//! Packed tile format: per map, `tiles.pack` holds the tile payloads back to
//! back and `tiles.idx` a fixed-layout little-endian index.
//!
//! Index layout:
//! - header (16 bytes): magic, version `u32`, level count `u32`
//! - level records (28 bytes each): zoom, min x, min y, cols, rows (`u32`),
//!   entry offset `u64` relative to the end of the level table
//! - entries (16 bytes each, row-major): pack offset `u64`, length `u32`,
//!   image type `u32`. A zero length marks a missing tile.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use super::{child_dir, BundleFormatStrategy, MapArchive, MapSummary};
use crate::error::{BundleError, BundleResult};
use crate::model::{Bundle, Layer, MapSpec, TileRange};
use crate::source::MapSource;
use crate::tile::{TileAddress, TileData, TileImageType};

const MAGIC: &[u8; 8] = b"CBTIDX1\0";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 16;
const LEVEL_SIZE: usize = 28;
const ENTRY_SIZE: usize = 16;

pub const PACK_FILE: &str = "tiles.pack";
pub const INDEX_FILE: &str = "tiles.idx";

fn image_type_code(ty: TileImageType) -> u32 {
    match ty {
        TileImageType::Png => 1,
        TileImageType::Jpeg => 2,
        TileImageType::Gif => 3,
    }
}

fn image_type_from_code(code: u32) -> Option<TileImageType> {
    match code {
        1 => Some(TileImageType::Png),
        2 => Some(TileImageType::Jpeg),
        3 => Some(TileImageType::Gif),
        _ => None,
    }
}

/// Packed format. Accepts PNG and JPEG sources only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TilePackFormat;

impl BundleFormatStrategy for TilePackFormat {
    fn name(&self) -> &'static str {
        "tile_pack"
    }

    fn supports_source(&self, source: &dyn MapSource) -> bool {
        matches!(source.tile_type(), TileImageType::Png | TileImageType::Jpeg)
    }

    fn begin_bundle(&self, output_dir: &Path, bundle: &Bundle) -> BundleResult<PathBuf> {
        child_dir(output_dir, &bundle.name)
    }

    fn finish_bundle(
        &self,
        _bundle_dir: &Path,
        _bundle: &Bundle,
        _layers: &[String],
    ) -> BundleResult<()> {
        Ok(())
    }

    fn begin_layer(&self, bundle_dir: &Path, layer: &Layer) -> BundleResult<PathBuf> {
        child_dir(bundle_dir, &layer.name)
    }

    fn finish_layer(
        &self,
        _layer_dir: &Path,
        _layer: &Layer,
        _maps: &[MapSummary],
    ) -> BundleResult<()> {
        Ok(())
    }

    fn begin_map(&self, layer_dir: &Path, map: &MapSpec) -> BundleResult<Box<dyn MapArchive>> {
        let dir = child_dir(layer_dir, &map.name)?;
        let pack = BufWriter::new(File::create(dir.join(PACK_FILE))?);
        Ok(Box::new(PackArchive {
            summary: MapSummary::new(map, dir.clone()),
            dir,
            range: map.range,
            zoom: map.zoom,
            pack,
            pack_len: 0,
            entries: HashMap::new(),
            write_error: None,
        }))
    }
}

struct PackArchive {
    dir: PathBuf,
    range: TileRange,
    zoom: u8,
    pack: BufWriter<File>,
    pack_len: u64,
    /// (col, row) relative to the range origin → (offset, length, type code).
    entries: HashMap<(u32, u32), (u64, u32, u32)>,
    summary: MapSummary,
    /// Set on the first failed pack write; the pack position is unknown after it.
    write_error: Option<String>,
}

impl PackArchive {
    fn encode_index(&self) -> Vec<u8> {
        let cols = self.range.cols();
        let rows = self.range.rows();
        let cells = cols as usize * rows as usize;
        let mut out = Vec::with_capacity(HEADER_SIZE + LEVEL_SIZE + cells * ENTRY_SIZE);

        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());

        out.extend_from_slice(&(self.zoom as u32).to_le_bytes());
        out.extend_from_slice(&self.range.min_x.to_le_bytes());
        out.extend_from_slice(&self.range.min_y.to_le_bytes());
        out.extend_from_slice(&cols.to_le_bytes());
        out.extend_from_slice(&rows.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());

        for row in 0..rows {
            for col in 0..cols {
                let (offset, length, code) =
                    self.entries.get(&(col, row)).copied().unwrap_or((0, 0, 0));
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&length.to_le_bytes());
                out.extend_from_slice(&code.to_le_bytes());
            }
        }
        out
    }
}

impl MapArchive for PackArchive {
    fn write_tile(&mut self, address: &TileAddress, tile: &TileData) -> BundleResult<()> {
        if address.zoom != self.zoom || !self.range.contains(address.x, address.y) {
            return Err(BundleError::Validation(format!(
                "tile {} outside map range {} at zoom {}",
                address, self.range, self.zoom
            )));
        }
        let length = u32::try_from(tile.size_bytes())
            .map_err(|_| BundleError::Validation(format!("tile {} too large", address)))?;
        if let Some(reason) = &self.write_error {
            return Err(BundleError::Validation(format!(
                "{} is unusable after a failed write: {}",
                PACK_FILE, reason
            )));
        }

        if let Err(e) = self.pack.write_all(&tile.bytes) {
            self.write_error = Some(e.to_string());
            return Err(e.into());
        }
        let key = (address.x - self.range.min_x, address.y - self.range.min_y);
        self.entries.insert(
            key,
            (self.pack_len, length, image_type_code(tile.image_type)),
        );
        self.pack_len += length as u64;

        self.summary.tiles = self.entries.len() as u64;
        self.summary.bytes += length as u64;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> BundleResult<MapSummary> {
        if let Some(reason) = self.write_error.take() {
            return Err(BundleError::Validation(format!(
                "{} in {} is incomplete: {}",
                PACK_FILE,
                self.dir.display(),
                reason
            )));
        }
        self.pack.flush()?;
        self.pack.get_ref().sync_all()?;

        let index = self.encode_index();
        let tmp = self.dir.join(format!("{}.tmp", INDEX_FILE));
        std::fs::write(&tmp, index)?;
        std::fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
        Ok(self.summary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackTileRef {
    pub offset: u64,
    pub length: u32,
    pub image_type: TileImageType,
}

#[derive(Debug, Clone, Copy)]
struct PackLevel {
    zoom: u32,
    min_x: u32,
    min_y: u32,
    cols: u32,
    rows: u32,
    entry_offset: u64,
}

/// Random-access reader for a packed map directory.
#[derive(Debug)]
pub struct TilePackReader {
    pack: File,
    levels: Vec<PackLevel>,
    index_bytes: Vec<u8>,
    entries_base: u64,
    pack_len: u64,
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

impl TilePackReader {
    pub fn open(map_dir: &Path) -> BundleResult<Self> {
        let index_bytes = std::fs::read(map_dir.join(INDEX_FILE))?;
        let (levels, entries_base) = Self::parse_index(&index_bytes)?;

        let pack = File::open(map_dir.join(PACK_FILE))?;
        let pack_len = pack.metadata()?.len();

        Ok(Self {
            pack,
            levels,
            index_bytes,
            entries_base,
            pack_len,
        })
    }

    fn parse_index(index_bytes: &[u8]) -> BundleResult<(Vec<PackLevel>, u64)> {
        if index_bytes.len() < HEADER_SIZE {
            return Err(BundleError::Validation("tiles.idx is too small".into()));
        }
        if &index_bytes[0..8] != MAGIC {
            return Err(BundleError::Validation("tiles.idx magic mismatch".into()));
        }
        let version = le_u32(index_bytes, 8);
        if version != VERSION {
            return Err(BundleError::Validation(format!(
                "Unsupported tiles.idx version: {}",
                version
            )));
        }
        let level_count = le_u32(index_bytes, 12) as usize;
        if level_count == 0 {
            return Err(BundleError::Validation("tiles.idx has no levels".into()));
        }

        let levels_len = level_count * LEVEL_SIZE;
        if index_bytes.len() < HEADER_SIZE + levels_len {
            return Err(BundleError::Validation("tiles.idx missing level table".into()));
        }
        let entries_base = (HEADER_SIZE + levels_len) as u64;
        let entries_len = index_bytes.len() as u64 - entries_base;

        let mut levels = Vec::with_capacity(level_count);
        for i in 0..level_count {
            let base = HEADER_SIZE + i * LEVEL_SIZE;
            let level = PackLevel {
                zoom: le_u32(index_bytes, base),
                min_x: le_u32(index_bytes, base + 4),
                min_y: le_u32(index_bytes, base + 8),
                cols: le_u32(index_bytes, base + 12),
                rows: le_u32(index_bytes, base + 16),
                entry_offset: le_u64(index_bytes, base + 20),
            };
            let level_end = (level.cols as u64)
                .checked_mul(level.rows as u64)
                .and_then(|count| count.checked_mul(ENTRY_SIZE as u64))
                .and_then(|len| len.checked_add(level.entry_offset));
            if level_end.map_or(true, |end| end > entries_len) {
                return Err(BundleError::Validation(format!(
                    "tiles.idx entry range out of bounds for zoom {}",
                    level.zoom
                )));
            }
            levels.push(level);
        }

        Ok((levels, entries_base))
    }

    pub fn zooms(&self) -> Vec<u8> {
        self.levels.iter().map(|l| l.zoom as u8).collect()
    }

    /// Locate a tile by absolute coordinates. `None` when not stored.
    pub fn tile_ref(&self, zoom: u8, x: u32, y: u32) -> Option<PackTileRef> {
        let info = self.levels.iter().find(|l| l.zoom == zoom as u32)?;
        if x < info.min_x || y < info.min_y {
            return None;
        }
        let (col, row) = (x - info.min_x, y - info.min_y);
        if col >= info.cols || row >= info.rows {
            return None;
        }

        let idx = (row as u64) * (info.cols as u64) + col as u64;
        let start = (self.entries_base + info.entry_offset + idx * ENTRY_SIZE as u64) as usize;
        if start + ENTRY_SIZE > self.index_bytes.len() {
            return None;
        }

        let offset = le_u64(&self.index_bytes, start);
        let length = le_u32(&self.index_bytes, start + 8);
        let image_type = image_type_from_code(le_u32(&self.index_bytes, start + 12))?;
        if length == 0 {
            return None;
        }
        Some(PackTileRef {
            offset,
            length,
            image_type,
        })
    }

    pub fn read_tile_bytes(&self, tile_ref: PackTileRef) -> BundleResult<Bytes> {
        let end = tile_ref
            .offset
            .checked_add(tile_ref.length as u64)
            .ok_or_else(|| BundleError::Validation("tile offset overflow".into()))?;
        if end > self.pack_len {
            return Err(BundleError::Validation(
                "tile byte range exceeds pack size".into(),
            ));
        }

        let mut buf = vec![0u8; tile_ref.length as usize];
        read_at(&self.pack, tile_ref.offset, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    pub fn read_tile(&self, zoom: u8, x: u32, y: u32) -> BundleResult<Option<Bytes>> {
        match self.tile_ref(zoom, x, y) {
            Some(r) => self.read_tile_bytes(r).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut done = 0;
    while done < buf.len() {
        let n = file.seek_read(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        done += n;
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BundleFormat;
    use crate::test_utils::{png_tile, ScriptedSource};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn map(range: TileRange) -> MapSpec {
        MapSpec::new("m", Arc::new(ScriptedSource::succeeding("osm")), 6, range)
    }

    fn write_pack(dir: &Path, map: &MapSpec, tiles: &[(u32, u32)]) -> MapSummary {
        let mut archive = TilePackFormat.begin_map(dir, map).unwrap();
        for &(x, y) in tiles {
            let tile = TileData::parse(png_tile(x, y)).unwrap();
            archive.write_tile(&map.address(x, y), &tile).unwrap();
        }
        archive.finish().unwrap()
    }

    #[test]
    fn test_pack_round_trip_sparse() {
        let temp = TempDir::new().unwrap();
        let map = map(TileRange::new(10, 20, 13, 22));
        let summary = write_pack(temp.path(), &map, &[(10, 20), (13, 22), (11, 21)]);
        assert_eq!(summary.tiles, 3);

        let reader = TilePackReader::open(&summary.path).unwrap();
        assert_eq!(reader.zooms(), vec![6]);
        assert_eq!(reader.read_tile(6, 13, 22).unwrap(), Some(png_tile(13, 22)));
        assert_eq!(reader.read_tile(6, 11, 21).unwrap(), Some(png_tile(11, 21)));
        assert_eq!(reader.read_tile(6, 12, 21).unwrap(), None);
        assert_eq!(reader.read_tile(6, 14, 22).unwrap(), None);
        assert_eq!(reader.read_tile(7, 10, 20).unwrap(), None);

        let r = reader.tile_ref(6, 10, 20).unwrap();
        assert_eq!(r.image_type, TileImageType::Png);
    }

    #[test]
    fn test_rewrite_keeps_latest() {
        let temp = TempDir::new().unwrap();
        let map = map(TileRange::new(0, 0, 1, 1));
        let summary = write_pack(temp.path(), &map, &[(0, 0), (0, 0)]);
        assert_eq!(summary.tiles, 1);

        let reader = TilePackReader::open(&summary.path).unwrap();
        let r = reader.tile_ref(6, 0, 0).unwrap();
        assert_eq!(r.offset, png_tile(0, 0).len() as u64);
    }

    #[test]
    fn test_rejects_tile_outside_range() {
        let temp = TempDir::new().unwrap();
        let map = map(TileRange::new(0, 0, 1, 1));
        let mut archive = TilePackFormat.begin_map(temp.path(), &map).unwrap();
        let tile = TileData::parse(png_tile(5, 5)).unwrap();
        let result = archive.write_tile(&map.address(5, 5), &tile);
        assert!(matches!(result, Err(BundleError::Validation(_))));
    }

    #[test]
    fn test_corrupt_index() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(INDEX_FILE), b"FPTIDX1\0\x01\0\0\0\x01\0\0\0").unwrap();
        std::fs::write(temp.path().join(PACK_FILE), b"").unwrap();
        assert!(matches!(
            TilePackReader::open(temp.path()),
            Err(BundleError::Validation(_))
        ));

        std::fs::write(temp.path().join(INDEX_FILE), b"short").unwrap();
        assert!(TilePackReader::open(temp.path()).is_err());
    }

    #[test]
    fn test_truncated_level_table() {
        let temp = TempDir::new().unwrap();
        let mut idx = Vec::new();
        idx.extend_from_slice(MAGIC);
        idx.extend_from_slice(&VERSION.to_le_bytes());
        idx.extend_from_slice(&2u32.to_le_bytes());
        idx.extend_from_slice(&[0u8; LEVEL_SIZE]);
        std::fs::write(temp.path().join(INDEX_FILE), idx).unwrap();
        std::fs::write(temp.path().join(PACK_FILE), b"").unwrap();
        assert!(TilePackReader::open(temp.path()).is_err());
    }

    #[test]
    fn test_oversized_level_record() {
        let temp = TempDir::new().unwrap();
        let mut idx = Vec::new();
        idx.extend_from_slice(MAGIC);
        idx.extend_from_slice(&VERSION.to_le_bytes());
        idx.extend_from_slice(&1u32.to_le_bytes());
        for field in [6u32, 0, 0, u32::MAX, u32::MAX] {
            idx.extend_from_slice(&field.to_le_bytes());
        }
        idx.extend_from_slice(&0u64.to_le_bytes());
        std::fs::write(temp.path().join(INDEX_FILE), &idx).unwrap();
        std::fs::write(temp.path().join(PACK_FILE), b"").unwrap();
        assert!(matches!(
            TilePackReader::open(temp.path()),
            Err(BundleError::Validation(_))
        ));

        let len = idx.len();
        idx[len - 8..].copy_from_slice(&u64::MAX.to_le_bytes());
        idx[HEADER_SIZE + 12..HEADER_SIZE + 20].copy_from_slice(&[1, 0, 0, 0, 1, 0, 0, 0]);
        std::fs::write(temp.path().join(INDEX_FILE), &idx).unwrap();
        assert!(matches!(
            TilePackReader::open(temp.path()),
            Err(BundleError::Validation(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_write_poisons_archive() {
        let temp = TempDir::new().unwrap();
        let map = map(TileRange::new(0, 0, 1, 1));
        let full = File::options().write(true).open("/dev/full").unwrap();
        let mut archive = Box::new(PackArchive {
            summary: MapSummary::new(&map, temp.path().to_path_buf()),
            dir: temp.path().to_path_buf(),
            range: map.range,
            zoom: map.zoom,
            pack: BufWriter::with_capacity(4, full),
            pack_len: 0,
            entries: HashMap::new(),
            write_error: None,
        });

        let tile = TileData::parse(png_tile(0, 0)).unwrap();
        assert!(matches!(
            archive.write_tile(&map.address(0, 0), &tile),
            Err(BundleError::Io(_))
        ));
        let tile = TileData::parse(png_tile(1, 1)).unwrap();
        assert!(matches!(
            archive.write_tile(&map.address(1, 1), &tile),
            Err(BundleError::Validation(_))
        ));
        assert!(archive.entries.is_empty());
        assert_eq!(archive.pack_len, 0);
        assert!(matches!(archive.finish(), Err(BundleError::Validation(_))));
        assert!(!temp.path().join(INDEX_FILE).exists());
    }

    #[test]
    fn test_supports_only_png_and_jpeg() {
        let png = ScriptedSource::succeeding("osm");
        let gif = ScriptedSource::succeeding("radar").with_tile_type(TileImageType::Gif);
        let strategy = BundleFormat::TilePack.strategy();
        assert!(strategy.supports_source(&png));
        assert!(!strategy.supports_source(&gif));
    }
}
