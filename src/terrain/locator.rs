//! Which 1°x1° terrain tiles an analysis region needs.

use itertools::{Itertools, iproduct};

use super::{TileId, TileResolution, normalize_lon};
use crate::geo::{BoundingBox, EllipsoidParameters, GeoError, LatLon, check_lonlat};

#[derive(Debug, Clone, Copy, Default)]
pub struct TileLocator {
    ellipsoid: EllipsoidParameters,
}

impl TileLocator {
    pub fn new(ellipsoid: EllipsoidParameters) -> Self {
        Self { ellipsoid }
    }

    /// Degree box enclosing a circle of `radius_m` around `center`.
    pub fn radius_bounds(&self, center: LatLon, radius_m: f64) -> Result<BoundingBox, GeoError> {
        check_lonlat(center.longitude, center.latitude)?;
        if !(radius_m.is_finite() && radius_m >= 0.0) {
            return Err(GeoError::InvalidCoordinate(format!("radius {radius_m} m")));
        }
        let phi = center.latitude.to_radians();
        let dlat = (radius_m / self.ellipsoid.meridional_radius(phi)).to_degrees();
        let parallel = self.ellipsoid.prime_vertical_radius(phi) * phi.cos();
        let dlon = if parallel > 1.0 {
            (radius_m / parallel).to_degrees().min(180.0)
        } else {
            180.0
        };

        Ok(BoundingBox::new(
            center.longitude - dlon,
            (center.latitude - dlat).max(-90.0),
            center.longitude + dlon,
            (center.latitude + dlat).min(90.0),
        ))
    }

    /// Tiles whose cells intersect the circle of `radius_m` around `center`,
    /// sorted south to north then west to east.
    pub fn tiles_for_radius(&self, center: LatLon, radius_m: f64) -> Result<Vec<TileId>, GeoError> {
        let bounds = self.radius_bounds(center, radius_m)?;
        let lats = (bounds.south.floor() as i32).max(-90)..=(bounds.north.floor() as i32).min(89);
        let lons = if bounds.width() >= 360.0 {
            -180..=179
        } else {
            bounds.west.floor() as i32..=bounds.east.floor() as i32
        };

        let tiles = iproduct!(lats, lons)
            .map(|(lat, lon)| TileId::new(lat, normalize_lon(lon)))
            .filter(|id| self.local_distance(center, nearest_point(id, center)) <= radius_m)
            .sorted()
            .dedup()
            .collect();
        Ok(tiles)
    }

    /// Distance on the ellipsoid's local tangent plane, using the radii of
    /// curvature at the mean latitude, as [`radius_bounds`](Self::radius_bounds) does.
    fn local_distance(&self, a: LatLon, b: LatLon) -> f64 {
        let phi = ((a.latitude + b.latitude) / 2.0).to_radians();
        let dlat = (b.latitude - a.latitude).to_radians();
        let dlon = ((b.longitude - a.longitude + 180.0).rem_euclid(360.0) - 180.0).to_radians();
        let north = dlat * self.ellipsoid.meridional_radius(phi);
        let east = dlon * self.ellipsoid.prime_vertical_radius(phi) * phi.cos();
        north.hypot(east)
    }

    /// Tiles covering a box. The east and north edges are exclusive, so a
    /// box that ends on a degree line does not pull in the next tile.
    pub fn tiles_for_bounds(&self, bounds: &BoundingBox) -> Vec<TileId> {
        let span = |lo: f64, hi: f64| {
            let first = lo.floor() as i32;
            let last = ((hi.ceil() as i32) - 1).max(first);
            first..=last
        };
        iproduct!(span(bounds.south, bounds.north), span(bounds.west, bounds.east))
            .filter(|(lat, _)| (-90..90).contains(lat))
            .map(|(lat, lon)| TileId::new(lat, normalize_lon(lon)))
            .sorted()
            .dedup()
            .collect()
    }

    /// The candidates whose padded bounds intersect any of `regions`, sorted
    /// and without duplicates.
    pub fn intersecting(
        &self,
        candidates: &[TileId],
        regions: &[BoundingBox],
        resolution: TileResolution,
    ) -> Vec<TileId> {
        candidates
            .iter()
            .filter(|id| {
                let b = id.bounds(resolution);
                regions.iter().any(|r| b.intersects(r))
            })
            .copied()
            .sorted()
            .dedup()
            .collect()
    }
}

/// Closest point of a tile's cell to `p`, handling the antimeridian.
fn nearest_point(id: &TileId, p: LatLon) -> LatLon {
    let west = id.lon as f64;
    let lat = p.latitude.clamp(id.lat as f64, id.lat as f64 + 1.0);
    // offset of p east of the cell's west edge, in [0, 360)
    let offset = (p.longitude - west).rem_euclid(360.0);
    let lon = if offset <= 1.0 {
        p.longitude
    } else if 360.0 - offset < offset - 1.0 {
        west
    } else {
        west + 1.0
    };
    LatLon::new(lat, lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<TileId> {
        names.iter().map(|n| n.parse().unwrap()).collect()
    }

    #[test]
    fn test_small_radius_single_tile() {
        let locator = TileLocator::default();
        let tiles = locator.tiles_for_radius(LatLon::new(38.5, -75.5), 5_000.0).unwrap();
        assert_eq!(tiles, ids(&["N38W076"]));
    }

    #[test]
    fn test_radius_crossing_corner() {
        let locator = TileLocator::default();
        let tiles = locator.tiles_for_radius(LatLon::new(39.02, -75.02), 10_000.0).unwrap();
        assert_eq!(tiles, ids(&["N38W076", "N38W075", "N39W076", "N39W075"]));
    }

    #[test]
    fn test_circle_drops_far_corner() {
        let locator = TileLocator::default();
        let center = LatLon::new(38.8, -75.2);
        // The box reaches into N39W075 but the circle stops short of its corner.
        let bounds = locator.radius_bounds(center, 25_000.0).unwrap();
        assert!(bounds.north > 39.0 && bounds.east > -75.0);
        let tiles = locator.tiles_for_radius(center, 25_000.0).unwrap();
        assert_eq!(tiles, ids(&["N38W076", "N38W075", "N39W076"]));
    }

    #[test]
    fn test_circle_edge_is_exact() {
        let locator = TileLocator::default();
        let center = LatLon::new(38.8, -75.2);
        // The corner of N39W075 is about 28.18 km out on the ellipsoid.
        let tiles = locator.tiles_for_radius(center, 28_000.0).unwrap();
        assert!(!tiles.contains(&TileId::new(39, -75)), "{tiles:?}");
        let tiles = locator.tiles_for_radius(center, 28_300.0).unwrap();
        assert!(tiles.contains(&TileId::new(39, -75)), "{tiles:?}");
    }

    #[test]
    fn test_antimeridian() {
        let locator = TileLocator::default();
        let tiles = locator.tiles_for_radius(LatLon::new(-16.5, 179.9), 20_000.0).unwrap();
        assert_eq!(tiles, ids(&["S17W180", "S17E179"]));
    }

    #[test]
    fn test_deterministic() {
        let locator = TileLocator::default();
        let a = locator.tiles_for_radius(LatLon::new(40.1, -76.4), 80_000.0).unwrap();
        let b = locator.tiles_for_radius(LatLon::new(40.1, -76.4), 80_000.0).unwrap();
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_invalid_center() {
        let locator = TileLocator::default();
        assert!(locator.tiles_for_radius(LatLon::new(95.0, 0.0), 1.0).is_err());
    }

    #[test]
    fn test_tiles_for_bounds() {
        let locator = TileLocator::default();
        let b = BoundingBox::new(-76.0, 38.0, -75.0, 39.0);
        assert_eq!(locator.tiles_for_bounds(&b), ids(&["N38W076"]));
        let b = BoundingBox::new(-77.0, 38.0, -74.5, 40.5);
        assert_eq!(locator.tiles_for_bounds(&b).len(), 9);
    }

    #[test]
    fn test_intersecting() {
        let locator = TileLocator::default();
        let candidates = ids(&["N40W077", "N39W076", "N38W075", "N38W075"]);
        let regions = [
            BoundingBox::new(-75.9, 38.2, -74.8, 38.6),
            // only reaches N39W076 through the half-sample padding
            BoundingBox::new(-75.9, 38.5, -75.5, 38.9999),
        ];
        let hit = locator.intersecting(&candidates, &regions, TileResolution::Srtm3);
        assert_eq!(hit, ids(&["N38W075", "N39W076"]));
    }
}
