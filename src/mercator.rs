//! Web-Mercator (slippy map) tile math.

use std::f64::consts::PI;

/// Latitude limit of the square Web-Mercator projection.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_6;

/// Highest zoom level supported by tile addressing.
pub const MAX_ZOOM: u8 = 24;

/// Number of tiles along one axis at `zoom`.
pub fn tiles_per_axis(zoom: u8) -> u32 {
    1u32 << zoom.min(MAX_ZOOM)
}

/// Fractional tile x for a longitude.
pub fn lon_to_tile_x(lon: f64, zoom: u8) -> f64 {
    let n = tiles_per_axis(zoom) as f64;
    (lon.clamp(-180.0, 180.0) + 180.0) / 360.0 * n
}

/// Fractional tile y for a latitude.
pub fn lat_to_tile_y(lat: f64, zoom: u8) -> f64 {
    let n = tiles_per_axis(zoom) as f64;
    let lat_rad = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n
}

/// Longitude of a (fractional) tile x.
pub fn tile_x_to_lon(x: f64, zoom: u8) -> f64 {
    x / tiles_per_axis(zoom) as f64 * 360.0 - 180.0
}

/// Latitude of a (fractional) tile y.
pub fn tile_y_to_lat(y: f64, zoom: u8) -> f64 {
    let n = tiles_per_axis(zoom) as f64;
    let merc = PI * (1.0 - 2.0 * y / n);
    merc.sinh().atan().to_degrees()
}

/// Integer tile containing a coordinate, clamped to the valid range.
pub fn tile_for(lat: f64, lon: f64, zoom: u8) -> (u32, u32) {
    let max = tiles_per_axis(zoom) - 1;
    let x = (lon_to_tile_x(lon, zoom).floor().max(0.0) as u32).min(max);
    let y = (lat_to_tile_y(lat, zoom).floor().max(0.0) as u32).min(max);
    (x, y)
}
