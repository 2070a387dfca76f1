//! Tile filters restricting a map's rectangle to an arbitrary polygon.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::mercator::{lat_to_tile_y, lon_to_tile_x};

/// Predicate deciding whether a tile of a map is enumerated.
pub trait TileFilter: Send + Sync {
    fn test(&self, x: u32, y: u32, zoom: u8, source: &str) -> bool;
}

impl<F> TileFilter for F
where
    F: Fn(u32, u32, u8, &str) -> bool + Send + Sync,
{
    fn test(&self, x: u32, y: u32, zoom: u8, source: &str) -> bool {
        self(x, y, zoom, source)
    }
}

/// Keeps tiles whose square intersects a lat/lon polygon.
///
/// Vertices are projected into fractional tile space once per zoom level
/// and cached.
pub struct PolygonFilter {
    /// (lat, lon) vertices; the ring is closed implicitly.
    vertices: Vec<(f64, f64)>,
    projected: RwLock<HashMap<u8, Vec<(f64, f64)>>>,
}

impl PolygonFilter {
    pub fn new(vertices: Vec<(f64, f64)>) -> Self {
        Self {
            vertices,
            projected: RwLock::new(HashMap::new()),
        }
    }

    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.vertices
    }

    fn ring(&self, zoom: u8) -> Vec<(f64, f64)> {
        if let Some(ring) = self.projected.read().get(&zoom) {
            return ring.clone();
        }
        let ring: Vec<(f64, f64)> = self
            .vertices
            .iter()
            .map(|&(lat, lon)| (lon_to_tile_x(lon, zoom), lat_to_tile_y(lat, zoom)))
            .collect();
        self.projected.write().insert(zoom, ring.clone());
        ring
    }
}

impl TileFilter for PolygonFilter {
    fn test(&self, x: u32, y: u32, zoom: u8, _source: &str) -> bool {
        if self.vertices.len() < 3 {
            return false;
        }
        let ring = self.ring(zoom);
        let (x0, y0) = (x as f64, y as f64);
        rect_intersects_polygon(x0, y0, x0 + 1.0, y0 + 1.0, &ring)
    }
}

/// Even-odd point-in-polygon test.
fn point_in_polygon(px: f64, py: f64, ring: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn orientation(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn segments_intersect(p1: (f64, f64), p2: (f64, f64), q1: (f64, f64), q2: (f64, f64)) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);
    (d1 > 0.0) != (d2 > 0.0) && (d3 > 0.0) != (d4 > 0.0)
}

fn rect_intersects_polygon(x0: f64, y0: f64, x1: f64, y1: f64, ring: &[(f64, f64)]) -> bool {
    let corners = [(x0, y0), (x1, y0), (x1, y1), (x0, y1)];

    if corners.iter().any(|&(cx, cy)| point_in_polygon(cx, cy, ring)) {
        return true;
    }
    if ring
        .iter()
        .any(|&(vx, vy)| vx >= x0 && vx <= x1 && vy >= y0 && vy <= y1)
    {
        return true;
    }
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        for k in 0..4 {
            if segments_intersect(a, b, corners[k], corners[(k + 1) % 4]) {
                return true;
            }
        }
    }
    false
}
