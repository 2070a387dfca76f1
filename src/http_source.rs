//! Map source backed by a tile server URL template.
//!
//! Template placeholders: `{z}`, `{x}`, `{y}`, `{-y}` (TMS row order) and
//! `{q}` (quadkey).

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{BundleError, BundleResult, FetchError, FetchErrorKind};
use crate::source::{FetchMode, MapSource};
use crate::tile::TileImageType;

/// Default User-Agent string for tile requests.
/// Several public tile servers reject requests without one.
const DEFAULT_USER_AGENT: &str = concat!("chartbundle/", env!("CARGO_PKG_VERSION"));

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpMapSource {
    id: String,
    url_template: String,
    tile_type: TileImageType,
    min_zoom: u8,
    max_zoom: u8,
    client: reqwest::blocking::Client,
}

impl HttpMapSource {
    pub fn new(
        id: impl Into<String>,
        url_template: impl Into<String>,
        tile_type: TileImageType,
    ) -> BundleResult<Self> {
        Self::with_timeout(id, url_template, tile_type, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        id: impl Into<String>,
        url_template: impl Into<String>,
        tile_type: TileImageType,
        timeout: Duration,
    ) -> BundleResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| BundleError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            id: id.into(),
            url_template: url_template.into(),
            tile_type,
            min_zoom: 0,
            max_zoom: crate::mercator::MAX_ZOOM,
            client,
        })
    }

    pub fn with_zoom_range(mut self, min_zoom: u8, max_zoom: u8) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom;
        self
    }

    /// Expand the URL template for one tile.
    pub fn tile_url(&self, zoom: u8, x: u32, y: u32) -> String {
        let tms_y = 1u64
            .checked_shl(zoom as u32)
            .unwrap_or(0)
            .saturating_sub(1)
            .saturating_sub(y as u64);
        self.url_template
            .replace("{z}", &zoom.to_string())
            .replace("{x}", &x.to_string())
            .replace("{-y}", &tms_y.to_string())
            .replace("{y}", &y.to_string())
            .replace("{q}", &quadkey(zoom, x, y))
    }
}

/// Bing-style quadkey for a tile.
pub fn quadkey(zoom: u8, x: u32, y: u32) -> String {
    (1..=zoom)
        .rev()
        .map(|level| {
            let mask = 1u32 << (level - 1);
            let mut digit = b'0';
            if x & mask != 0 {
                digit += 1;
            }
            if y & mask != 0 {
                digit += 2;
            }
            digit as char
        })
        .collect()
}

/// Map an HTTP status to a fetch error class.
///
/// Client errors mean the tile does not exist or the request is malformed,
/// except for request timeouts and rate limiting which may clear up.
pub fn classify_status(status: u16) -> FetchErrorKind {
    match status {
        408 | 504 => FetchErrorKind::Timeout,
        429 => FetchErrorKind::DownloadFailed,
        400..=499 => FetchErrorKind::Unrecoverable,
        _ => FetchErrorKind::DownloadFailed,
    }
}

fn classify_error(err: &reqwest::Error) -> FetchErrorKind {
    if err.is_timeout() {
        FetchErrorKind::Timeout
    } else if err.is_connect() {
        FetchErrorKind::ConnectFailure
    } else if err.is_builder() {
        FetchErrorKind::Unrecoverable
    } else {
        FetchErrorKind::DownloadFailed
    }
}

impl MapSource for HttpMapSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch_tile(&self, zoom: u8, x: u32, y: u32, mode: FetchMode) -> Result<Bytes, FetchError> {
        if !mode.reads_source() {
            return Err(FetchError::unrecoverable(format!(
                "source {} disabled in {:?} mode",
                self.id, mode
            )));
        }

        let url = self.tile_url(zoom, x, y);
        trace!(source = %self.id, %url, "requesting tile");

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| FetchError::new(classify_error(&e), format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            debug!(source = %self.id, %url, status = status.as_u16(), "tile request rejected");
            return Err(FetchError::new(
                classify_status(status.as_u16()),
                format!("HTTP {} from {}", status, url),
            ));
        }

        let body = response.bytes().map_err(|e| {
            FetchError::new(classify_error(&e), format!("Failed to read response: {}", e))
        })?;
        if body.is_empty() {
            return Err(FetchError::download(format!("empty body from {}", url)));
        }
        Ok(body)
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Serve exactly one HTTP response on a local port.
    fn serve_once(status_line: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf);
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status_line,
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(body);
            }
        });
        format!("http://{}/{{z}}/{{x}}/{{y}}.png", addr)
    }

    #[test]
    fn test_tile_url_expansion() {
        let source = HttpMapSource::new(
            "osm",
            "https://tile.example.org/{z}/{x}/{y}.png?tms={-y}&q={q}",
            TileImageType::Png,
        )
        .unwrap();
        assert_eq!(
            source.tile_url(3, 5, 2),
            "https://tile.example.org/3/5/2.png?tms=5&q=121"
        );
    }

    #[test]
    fn test_quadkey() {
        assert_eq!(quadkey(0, 0, 0), "");
        assert_eq!(quadkey(3, 3, 5), "213");
        assert_eq!(quadkey(1, 1, 1), "3");
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(404), FetchErrorKind::Unrecoverable);
        assert_eq!(classify_status(400), FetchErrorKind::Unrecoverable);
        assert_eq!(classify_status(408), FetchErrorKind::Timeout);
        assert_eq!(classify_status(429), FetchErrorKind::DownloadFailed);
        assert_eq!(classify_status(503), FetchErrorKind::DownloadFailed);
    }

    #[test]
    fn test_zoom_range() {
        let source = HttpMapSource::new("osm", "http://localhost/{z}/{x}/{y}", TileImageType::Png)
            .unwrap()
            .with_zoom_range(2, 17);
        assert!(!source.supports_zoom(1));
        assert!(source.supports_zoom(17));
        assert!(!source.supports_zoom(18));
    }

    #[test]
    fn test_fetch_success() {
        let url = serve_once("200 OK", b"\x89PNG\r\n\x1a\nrest");
        let source = HttpMapSource::new("local", url, TileImageType::Png).unwrap();
        let bytes = source.fetch_tile(1, 0, 0, FetchMode::Default).unwrap();
        assert_eq!(&bytes[..], b"\x89PNG\r\n\x1a\nrest");
    }

    #[test]
    fn test_fetch_not_found_is_unrecoverable() {
        let url = serve_once("404 Not Found", b"");
        let source = HttpMapSource::new("local", url, TileImageType::Png).unwrap();
        let err = source.fetch_tile(1, 0, 0, FetchMode::Default).unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Unrecoverable);
    }

    #[test]
    fn test_fetch_refused_is_connect_failure() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let source = HttpMapSource::new(
            "local",
            format!("http://127.0.0.1:{}/{{z}}/{{x}}/{{y}}.png", port),
            TileImageType::Png,
        )
        .unwrap();
        let err = source.fetch_tile(1, 0, 0, FetchMode::Default).unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::ConnectFailure);
    }

    #[test]
    fn test_cache_only_mode_skips_network() {
        let source =
            HttpMapSource::new("osm", "http://invalid.invalid/{z}/{x}/{y}", TileImageType::Png)
                .unwrap();
        let err = source.fetch_tile(1, 0, 0, FetchMode::CacheOnly).unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Unrecoverable);
    }
}
