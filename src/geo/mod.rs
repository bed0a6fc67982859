use serde::{Deserialize, Serialize};
use thiserror::Error;

/// WGS84 semimajor axis in meters
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Mean radius used for great-circle distances
pub const EARTH_RADIUS: f64 = 6_371_008.8;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),
}

/// Reference ellipsoid. Everything that needs the shape of the Earth takes one
/// of these explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EllipsoidParameters {
    pub semimajor_axis: f64,
    pub flattening: f64,
}

impl Default for EllipsoidParameters {
    fn default() -> Self {
        Self::WGS84
    }
}

impl EllipsoidParameters {
    pub const WGS84: Self = Self {
        semimajor_axis: WGS84_A,
        flattening: WGS84_F,
    };

    /// First eccentricity squared, e² = 2f − f²
    pub fn e2(&self) -> f64 {
        2.0 * self.flattening - self.flattening * self.flattening
    }

    pub fn semiminor_axis(&self) -> f64 {
        self.semimajor_axis * (1.0 - self.flattening)
    }

    /// Prime vertical radius of curvature N at a geodetic latitude (radians).
    pub fn prime_vertical_radius(&self, lat_rad: f64) -> f64 {
        let sin = lat_rad.sin();
        self.semimajor_axis / (1.0 - self.e2() * sin * sin).sqrt()
    }

    /// Meridional radius of curvature M at a geodetic latitude (radians).
    pub fn meridional_radius(&self, lat_rad: f64) -> f64 {
        let sin = lat_rad.sin();
        let e2 = self.e2();
        self.semimajor_axis * (1.0 - e2) / (1.0 - e2 * sin * sin).powf(1.5)
    }

    /// Distance from the center of the ellipsoid to its surface at the given
    /// geodetic latitude (degrees).
    pub fn geocentric_radius(&self, latitude: f64) -> Result<f64, GeoError> {
        check_latitude(latitude)?;
        let a = self.semimajor_axis;
        let b = self.semiminor_axis();
        let phi = latitude.to_radians();
        let (sin, cos) = phi.sin_cos();

        let upper = (a * a * cos).powi(2) + (b * b * sin).powi(2);
        let lower = (a * cos).powi(2) + (b * sin).powi(2);
        Ok((upper / lower).sqrt())
    }

    /// Geodetic (degrees, meters above ellipsoid) to Earth-centred Earth-fixed.
    pub fn to_geocentric(&self, coord: LatLon) -> Result<Geocentric, GeoError> {
        check_lonlat(coord.longitude, coord.latitude)?;
        let phi = coord.latitude.to_radians();
        let lambda = coord.longitude.to_radians();
        let n = self.prime_vertical_radius(phi);
        let h = coord.altitude;

        Ok(Geocentric {
            x: (n + h) * phi.cos() * lambda.cos(),
            y: (n + h) * phi.cos() * lambda.sin(),
            z: (n * (1.0 - self.e2()) + h) * phi.sin(),
        })
    }

    /// Earth-centred Earth-fixed to geodetic. Iterates on latitude until the
    /// update falls below 1e-14 rad.
    pub fn to_geodetic(&self, p: Geocentric) -> LatLon {
        let e2 = self.e2();
        let rho = p.x.hypot(p.y);
        let longitude = p.y.atan2(p.x).to_degrees();

        if rho < 1e-6 {
            let latitude = if p.z >= 0.0 { 90.0 } else { -90.0 };
            return LatLon {
                latitude,
                longitude: 0.0,
                altitude: p.z.abs() - self.semiminor_axis(),
            };
        }

        let mut phi = p.z.atan2(rho * (1.0 - e2));
        for _ in 0..16 {
            let n = self.prime_vertical_radius(phi);
            let h = rho * phi.cos() + p.z * phi.sin() - self.semimajor_axis * (1.0 - e2 * phi.sin().powi(2)).sqrt();
            let next = p.z.atan2(rho * (1.0 - e2 * n / (n + h)));
            let done = (next - phi).abs() < 1e-14;
            phi = next;
            if done {
                break;
            }
        }

        let (sin, cos) = phi.sin_cos();
        let altitude = rho * cos + p.z * sin - self.semimajor_axis * (1.0 - e2 * sin * sin).sqrt();

        LatLon {
            latitude: phi.to_degrees(),
            longitude,
            altitude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatLon {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64, // above the ellipsoid
}

impl LatLon {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: 0.0,
        }
    }
}

/// Earth-centred Earth-fixed cartesian position, meters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Geocentric {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Geocentric {
    pub fn sub(self, other: Geocentric) -> Geocentric {
        Geocentric {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
        }
    }

    pub fn add_scaled(self, dir: Geocentric, t: f64) -> Geocentric {
        Geocentric {
            x: self.x + dir.x * t,
            y: self.y + dir.y * t,
            z: self.z + dir.z * t,
        }
    }

    pub fn dot(self, other: Geocentric) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn norm(self) -> f64 {
        self.dot(self).sqrt()
    }
}

/// Straight-line distance between two geocentric points.
pub fn chord_distance(a: Geocentric, b: Geocentric) -> f64 {
    b.sub(a).norm()
}

pub fn check_latitude(latitude: f64) -> Result<(), GeoError> {
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(GeoError::InvalidCoordinate(format!("latitude {latitude} is out of bounds")));
    }
    Ok(())
}

/// Fails unless `lon`/`lat` form a valid WGS84 longitude-latitude pair.
pub fn check_lonlat(lon: f64, lat: f64) -> Result<(), GeoError> {
    if !(-180.0..=180.0).contains(&lon) {
        return Err(GeoError::InvalidCoordinate(format!("longitude {lon} is out of bounds")));
    }
    check_latitude(lat)
}

/// Great-circle distance (m) and initial bearing (degrees) from `p1` to `p2`.
pub fn calculate_geodesic(p1: LatLon, p2: LatLon) -> (f64, f64) {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let dlat = (p2.latitude - p1.latitude).to_radians();
    let dlon = (p2.longitude - p1.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    let dist = EARTH_RADIUS * c;

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    let bearing = y.atan2(x).to_degrees().rem_euclid(360.0);

    (dist, bearing)
}

/// Longitude-latitude box, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Smallest box containing every point, or `None` for no points.
    pub fn of_points<I: IntoIterator<Item = LatLon>>(points: I) -> Option<Self> {
        points.into_iter().fold(None, |acc, p| {
            Some(match acc {
                None => Self::new(p.longitude, p.latitude, p.longitude, p.latitude),
                Some(b) => Self::new(
                    b.west.min(p.longitude),
                    b.south.min(p.latitude),
                    b.east.max(p.longitude),
                    b.north.max(p.latitude),
                ),
            })
        })
    }

    pub fn center(&self) -> LatLon {
        LatLon::new((self.south + self.north) / 2.0, (self.west + self.east) / 2.0)
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    /// True when the boxes share a region of positive area.
    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        self.west < other.east && other.west < self.east && self.south < other.north && other.south < self.north
    }

    /// True when the boxes overlap or touch.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.west <= other.east && other.west <= self.east && self.south <= other.north && other.south <= self.north
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.west.min(other.west),
            self.south.min(other.south),
            self.east.max(other.east),
            self.north.max(other.north),
        )
    }

    pub fn contains(&self, loc: LatLon) -> bool {
        (self.west..=self.east).contains(&loc.longitude) && (self.south..=self.north).contains(&loc.latitude)
    }

    /// Splits the box into `n * n` congruent sub-boxes, enumerated west to
    /// east then north to south.
    pub fn partition(&self, n: usize) -> Vec<BoundingBox> {
        let n = n.max(1);
        let dx = self.width() / n as f64;
        let dy = self.height() / n as f64;
        let mut parts = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                parts.push(BoundingBox::new(
                    self.west + j as f64 * dx,
                    self.south + (n - i - 1) as f64 * dy,
                    self.west + (j + 1) as f64 * dx,
                    self.south + (n - i) as f64 * dy,
                ));
            }
        }
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_geocentric_radius() {
        let wgs = EllipsoidParameters::WGS84;
        assert!((wgs.geocentric_radius(0.0).unwrap() - WGS84_A).abs() < 1e-6);
        assert!((wgs.geocentric_radius(90.0).unwrap() - wgs.semiminor_axis()).abs() < 1e-6);
        let mid = wgs.geocentric_radius(45.0).unwrap();
        assert!(mid < WGS84_A && mid > wgs.semiminor_axis());
        assert!(matches!(wgs.geocentric_radius(90.5), Err(GeoError::InvalidCoordinate(_))));
    }

    #[test]
    fn test_equator_prime_meridian() {
        let p = EllipsoidParameters::WGS84.to_geocentric(LatLon::new(0.0, 0.0)).unwrap();
        assert!((p.x - WGS84_A).abs() < 1e-6);
        assert!(p.y.abs() < 1e-6 && p.z.abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_latitude() {
        let res = EllipsoidParameters::WGS84.to_geocentric(LatLon::new(91.0, 0.0));
        assert!(matches!(res, Err(GeoError::InvalidCoordinate(_))));
        assert!(check_lonlat(181.0, 0.0).is_err());
    }

    #[test]
    fn test_chord_distance() {
        let wgs = EllipsoidParameters::WGS84;
        let a = wgs.to_geocentric(LatLon::new(0.0, 0.0)).unwrap();
        let b = wgs.to_geocentric(LatLon::new(0.0, 180.0)).unwrap();
        assert!((chord_distance(a, b) - 2.0 * WGS84_A).abs() < 1e-6);
    }

    #[test]
    fn test_geodesic_one_degree() {
        let (dist, bearing) = calculate_geodesic(LatLon::new(0.0, 0.0), LatLon::new(1.0, 0.0));
        assert!((dist - 111_195.0).abs() < 100.0);
        assert!(bearing.abs() < 0.1);
    }

    #[test]
    fn test_bounds_of_points() {
        let pts = [LatLon::new(9.0, -11.0), LatLon::new(11.0, 0.0), LatLon::new(-8.0, 5.0)];
        let b = BoundingBox::of_points(pts).unwrap();
        assert_eq!(b, BoundingBox::new(-11.0, -8.0, 5.0, 11.0));
        assert!(BoundingBox::of_points(Vec::new()).is_none());
    }

    #[test]
    fn test_partition_order() {
        let parts = BoundingBox::new(0.0, 0.0, 3.0, 3.0).partition(3);
        assert_eq!(parts.len(), 9);
        assert_eq!(parts[0], BoundingBox::new(0.0, 2.0, 1.0, 3.0));
        assert_eq!(parts[2], BoundingBox::new(2.0, 2.0, 3.0, 3.0));
        assert_eq!(parts[8], BoundingBox::new(2.0, 0.0, 3.0, 1.0));
    }

    proptest! {
        #[test]
        fn geodetic_round_trip(lat in -89.999f64..89.999, lon in -180.0f64..180.0, h in -500.0f64..9000.0) {
            let wgs = EllipsoidParameters::WGS84;
            let p = wgs.to_geocentric(LatLon { latitude: lat, longitude: lon, altitude: h }).unwrap();
            let back = wgs.to_geodetic(p);
            prop_assert!((back.latitude - lat).abs() < 1e-9);
            let dlon = (back.longitude - lon + 540.0).rem_euclid(360.0) - 180.0;
            prop_assert!(dlon.abs() < 1e-9);
            prop_assert!((back.altitude - h).abs() < 1e-5);
        }
    }
}
