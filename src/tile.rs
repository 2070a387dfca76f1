//! Tile addressing and tile payload validation.
//!
//! Payloads are kept compressed (`Bytes`, O(1) clone) from fetch to archive.
//! JPEG tiles get their header parsed with zune-jpeg so truncated or garbage
//! responses are rejected before they reach the store or the bundle.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use zune_jpeg::JpegDecoder;

use crate::error::{BundleError, BundleResult};

/// Address of one tile: map source identity plus slippy-map coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileAddress {
    pub source: Arc<str>,
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileAddress {
    pub fn new(source: impl Into<Arc<str>>, zoom: u8, x: u32, y: u32) -> Self {
        Self {
            source: source.into(),
            zoom,
            x,
            y,
        }
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.source, self.zoom, self.x, self.y)
    }
}

/// Image encoding of a tile payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileImageType {
    Png,
    Jpeg,
    Gif,
}

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const GIF87_MAGIC: &[u8] = b"GIF87a";
const GIF89_MAGIC: &[u8] = b"GIF89a";

impl TileImageType {
    /// Detect the image type from the leading magic bytes.
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(PNG_MAGIC) {
            Some(TileImageType::Png)
        } else if data.starts_with(JPEG_MAGIC) {
            Some(TileImageType::Jpeg)
        } else if data.starts_with(GIF87_MAGIC) || data.starts_with(GIF89_MAGIC) {
            Some(TileImageType::Gif)
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            TileImageType::Png => "png",
            TileImageType::Jpeg => "jpg",
            TileImageType::Gif => "gif",
        }
    }
}

/// Validated tile payload.
#[derive(Debug, Clone)]
pub struct TileData {
    pub bytes: Bytes,
    pub image_type: TileImageType,
}

impl TileData {
    /// Validate raw bytes as a tile image.
    pub fn parse(bytes: Bytes) -> BundleResult<Self> {
        let image_type = TileImageType::detect(&bytes).ok_or_else(|| {
            BundleError::Validation(format!(
                "unrecognised tile payload ({} bytes)",
                bytes.len()
            ))
        })?;

        if image_type == TileImageType::Jpeg {
            jpeg_dimensions(&bytes)?;
        }

        Ok(Self { bytes, image_type })
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }
}

/// Parse a JPEG header for its dimensions without decoding pixels.
pub fn jpeg_dimensions(data: &[u8]) -> BundleResult<(u32, u32)> {
    let mut decoder = JpegDecoder::new(data);
    decoder
        .decode_headers()
        .map_err(|e| BundleError::Validation(format!("Failed to parse JPEG header: {:?}", e)))?;

    let info = decoder
        .info()
        .ok_or_else(|| BundleError::Validation("Failed to get image info from header".into()))?;

    Ok((info.width as u32, info.height as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::png_tile;

    #[test]
    fn test_address_display() {
        let addr = TileAddress::new("osm", 12, 2200, 1343);
        assert_eq!(addr.to_string(), "osm/12/2200/1343");
    }

    #[test]
    fn test_detect_types() {
        assert_eq!(TileImageType::detect(&png_tile(0, 0)), Some(TileImageType::Png));
        assert_eq!(
            TileImageType::detect(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]),
            Some(TileImageType::Jpeg)
        );
        assert_eq!(TileImageType::detect(b"GIF89a...."), Some(TileImageType::Gif));
        assert_eq!(TileImageType::detect(b"<html>404</html>"), None);
        assert_eq!(TileImageType::detect(b""), None);
    }

    #[test]
    fn test_parse_png() {
        let tile = TileData::parse(png_tile(1, 2)).unwrap();
        assert_eq!(tile.image_type, TileImageType::Png);
        assert!(tile.size_bytes() > PNG_MAGIC.len());
    }

    #[test]
    fn test_parse_rejects_html() {
        let result = TileData::parse(Bytes::from_static(b"<html>not found</html>"));
        assert!(matches!(result, Err(BundleError::Validation(_))));
    }

    #[test]
    fn test_parse_rejects_truncated_jpeg() {
        // SOI marker followed by garbage
        let result = TileData::parse(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0x00, 0x01]));
        assert!(result.is_err());
    }

    #[test]
    fn test_extension() {
        assert_eq!(TileImageType::Jpeg.extension(), "jpg");
        assert_eq!(TileImageType::Png.extension(), "png");
    }
}
