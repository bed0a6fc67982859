use std::ops::ControlFlow;

use itertools::Itertools;

use crate::config::SatellitePosition;
use crate::geo::{EllipsoidParameters, GeoError, Geocentric, LatLon, calculate_geodesic};
use crate::io::Transmitter;
use crate::terrain::{TerrainProvider, TileId};

/// Ray heights above this clear any terrain on Earth.
pub const TERRAIN_CEILING_M: f64 = 8_900.0;

/// Ground-track step when no raster spacing is known (about one SRTM3 cell).
pub const DEFAULT_STEP_M: f64 = 90.0;

/// Finer than any tile's sample spacing, so tile corners are not skipped.
const PATH_STEP_M: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LookAngles {
    pub elevation_deg: f64,
    /// Clockwise from true north
    pub azimuth_deg: f64,
    pub slant_range_m: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Obstruction {
    BelowHorizon,
    Terrain {
        /// Along the ground track from the site
        distance_m: f64,
        location: LatLon,
        terrain_m: f64,
        ray_m: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LosOutcome {
    Visible,
    Obstructed(Obstruction),
}

/// Marks a check that ran without terrain for part of the path; the verdict
/// for those stretches rests on the ellipsoid alone.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    pub missing_tiles: Vec<TileId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LosReport {
    pub look: LookAngles,
    pub horizon_dip_deg: f64,
    pub ground_height_m: f64,
    pub outcome: LosOutcome,
    pub partial: Option<PartialResult>,
}

impl LosReport {
    pub fn is_visible(&self) -> bool {
        self.outcome == LosOutcome::Visible
    }
}

struct RayGeometry {
    origin: Geocentric,
    /// Unit vector towards the satellite
    dir: Geocentric,
    look: LookAngles,
}

struct TrackSample {
    ground: LatLon,
    ray_m: f64,
    distance_m: f64,
}

/// Line of sight from ground points to one geostationary satellite.
#[derive(Debug, Clone, Copy)]
pub struct SatelliteLos {
    pub ellipsoid: EllipsoidParameters,
    pub satellite: SatellitePosition,
    pub max_track_m: f64,
}

impl SatelliteLos {
    pub fn new(ellipsoid: EllipsoidParameters, satellite: SatellitePosition, max_track_m: f64) -> Self {
        Self {
            ellipsoid,
            satellite,
            max_track_m,
        }
    }

    pub fn satellite_geocentric(&self) -> Geocentric {
        let lambda = self.satellite.longitude.to_radians();
        let r = self.satellite.geocentric_distance_m;
        Geocentric {
            x: r * lambda.cos(),
            y: r * lambda.sin(),
            z: 0.0,
        }
    }

    fn geometry(&self, ground: LatLon) -> Result<RayGeometry, GeoError> {
        let origin = self.ellipsoid.to_geocentric(ground)?;
        let d = self.satellite_geocentric().sub(origin);
        let range = d.norm();
        let dir = Geocentric {
            x: d.x / range,
            y: d.y / range,
            z: d.z / range,
        };

        let phi = ground.latitude.to_radians();
        let lambda = ground.longitude.to_radians();
        let (sp, cp) = phi.sin_cos();
        let (sl, cl) = lambda.sin_cos();
        let up = Geocentric {
            x: cp * cl,
            y: cp * sl,
            z: sp,
        };
        let east = Geocentric { x: -sl, y: cl, z: 0.0 };
        let north = Geocentric {
            x: -sp * cl,
            y: -sp * sl,
            z: cp,
        };

        // Angle between the local ellipsoid normal and the line of sight.
        let zenith = up.dot(dir).clamp(-1.0, 1.0).acos();
        let elevation_deg = 90.0 - zenith.to_degrees();
        let azimuth_deg = dir.dot(east).atan2(dir.dot(north)).to_degrees().rem_euclid(360.0);

        Ok(RayGeometry {
            origin,
            dir,
            look: LookAngles {
                elevation_deg,
                azimuth_deg,
                slant_range_m: range,
            },
        })
    }

    /// Elevation, azimuth and range from `ground` to the satellite.
    pub fn look_angles(&self, ground: LatLon) -> Result<LookAngles, GeoError> {
        Ok(self.geometry(ground)?.look)
    }

    /// Walks the ray until it clears the terrain ceiling or the ground track
    /// exceeds the configured length, advancing the track by at most
    /// `step_m` per sample.
    fn walk<F>(&self, site: LatLon, geo: &RayGeometry, step_m: f64, mut visit: F)
    where
        F: FnMut(&TrackSample) -> ControlFlow<()>,
    {
        let cos_el = geo.look.elevation_deg.to_radians().cos().max(1e-3);
        let ray_step = step_m / cos_el;
        let mut i = 1u64;
        loop {
            let q = geo.origin.add_scaled(geo.dir, ray_step * i as f64);
            let g = self.ellipsoid.to_geodetic(q);
            if g.altitude > TERRAIN_CEILING_M {
                break;
            }
            let ground = LatLon::new(g.latitude, g.longitude);
            let (distance_m, _) = calculate_geodesic(site, ground);
            if distance_m > self.max_track_m {
                break;
            }
            let sample = TrackSample {
                ground,
                ray_m: g.altitude,
                distance_m,
            };
            if visit(&sample).is_break() {
                break;
            }
            i += 1;
        }
    }

    /// Tiles the ground track of a site's line of sight can cross, the site's
    /// own tile first. Sites below the horizon only need their own tile.
    pub fn path_tiles(&self, tx: &Transmitter) -> Result<Vec<TileId>, GeoError> {
        let site = tx.location();
        let own = TileId::containing(site.latitude, site.longitude);
        let origin = LatLon {
            altitude: tx.antenna_height_m,
            ..site
        };
        let geo = self.geometry(origin)?;
        let mut tiles = vec![own];
        if geo.look.elevation_deg < 0.0 {
            return Ok(tiles);
        }
        self.walk(site, &geo, PATH_STEP_M, |s| {
            let id = TileId::containing(s.ground.latitude, s.ground.longitude);
            if tiles.last() != Some(&id) {
                tiles.push(id);
            }
            ControlFlow::Continue(())
        });
        Ok(tiles.into_iter().unique().collect())
    }

    /// Checks the line of sight from a transmitter site (antenna height above
    /// terrain) to the satellite.
    pub fn check<T: TerrainProvider>(&self, tx: &Transmitter, terrain: &T) -> Result<LosReport, GeoError> {
        let site = tx.location();
        let mut missing = Vec::new();

        let site_terrain = terrain.get_altitude(site);
        if site_terrain.is_none() {
            missing.push(TileId::containing(site.latitude, site.longitude));
        }
        let ground_height_m = site_terrain.unwrap_or(0.0) + tx.antenna_height_m;

        let geo = self.geometry(LatLon {
            altitude: ground_height_m,
            ..site
        })?;
        let radius = self.ellipsoid.geocentric_radius(site.latitude)?;
        let horizon_dip_deg = (radius / (radius + ground_height_m.max(0.0))).acos().to_degrees();

        if geo.look.elevation_deg < 0.0 {
            // Only the site's own elevation feeds this verdict.
            return Ok(LosReport {
                look: geo.look,
                horizon_dip_deg,
                ground_height_m,
                outcome: LosOutcome::Obstructed(Obstruction::BelowHorizon),
                partial: (!missing.is_empty()).then(|| PartialResult { missing_tiles: missing }),
            });
        }

        let step_m = terrain
            .sample_spacing_deg()
            .map(|deg| {
                let phi = site.latitude.to_radians();
                let ns = deg.to_radians() * self.ellipsoid.meridional_radius(phi);
                let ew = deg.to_radians() * self.ellipsoid.prime_vertical_radius(phi) * phi.cos();
                ns.min(ew).max(1.0)
            })
            .unwrap_or(DEFAULT_STEP_M);

        let mut outcome = LosOutcome::Visible;
        self.walk(site, &geo, step_m, |s| match terrain.get_altitude(s.ground) {
            Some(terrain_m) if terrain_m >= s.ray_m => {
                outcome = LosOutcome::Obstructed(Obstruction::Terrain {
                    distance_m: s.distance_m,
                    location: s.ground,
                    terrain_m,
                    ray_m: s.ray_m,
                });
                ControlFlow::Break(())
            }
            Some(_) => ControlFlow::Continue(()),
            None => {
                let id = TileId::containing(s.ground.latitude, s.ground.longitude);
                if !missing.contains(&id) {
                    missing.push(id);
                }
                ControlFlow::Continue(())
            }
        });

        // An obstruction past the site is definitive; one measured from an
        // assumed site elevation is not.
        let degraded = site_terrain.is_none() || outcome == LosOutcome::Visible;
        let partial = (!missing.is_empty() && degraded).then(|| {
            missing.sort();
            PartialResult { missing_tiles: missing }
        });

        Ok(LosReport {
            look: geo.look,
            horizon_dip_deg,
            ground_height_m,
            outcome,
            partial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{Polarization, TransmitterKey};
    use crate::terrain::{TerrainTile, TileResolution, TileSet};
    use std::sync::Arc;

    fn site(lat: f64, lon: f64, height: f64) -> Transmitter {
        Transmitter {
            key: TransmitterKey::new("net", "site"),
            latitude: lat,
            longitude: lon,
            antenna_height_m: height,
            polarization: Polarization::Vertical,
            frequency_mhz: 600.0,
            power_eirp_w: 1000.0,
        }
    }

    fn los(sat_lon: f64) -> SatelliteLos {
        SatelliteLos::new(EllipsoidParameters::WGS84, SatellitePosition::geostationary(sat_lon), 250_000.0)
    }

    fn flat(tiles: &[(i32, i32)], height: i16) -> TileSet {
        tiles
            .iter()
            .map(|&(lat, lon)| Arc::new(TerrainTile::flat(TileId::new(lat, lon), TileResolution::Srtm3, height)))
            .collect()
    }

    #[test]
    fn test_subsatellite_point_is_zenith() {
        let look = los(-75.0).look_angles(LatLon::new(0.0, -75.0)).unwrap();
        assert!((look.elevation_deg - 90.0).abs() < 1e-6);
        assert!((look.slant_range_m - (42_164_000.0 - 6_378_137.0)).abs() < 1e-3);
    }

    #[test]
    fn test_mid_latitude_elevation() {
        // Due south of the site, roughly 45 degrees up from 39N.
        let look = los(-75.5).look_angles(LatLon::new(39.0, -75.5)).unwrap();
        assert!(look.elevation_deg > 40.0 && look.elevation_deg < 50.0, "{look:?}");
        assert!((look.azimuth_deg - 180.0).abs() < 1e-6);
    }

    #[test]
    fn test_below_horizon() {
        // 100 degrees of longitude away the satellite is behind the Earth.
        let tx = site(39.0, 25.0, 10.0);
        let report = los(-75.0).check(&tx, &flat(&[(39, 25)], 100)).unwrap();
        assert!(report.look.elevation_deg < 0.0);
        assert_eq!(report.outcome, LosOutcome::Obstructed(Obstruction::BelowHorizon));
        assert!(report.partial.is_none());

        let report = los(-75.0).check(&tx, &TileSet::new()).unwrap();
        assert_eq!(report.outcome, LosOutcome::Obstructed(Obstruction::BelowHorizon));
        assert_eq!(report.partial.unwrap().missing_tiles, vec![TileId::new(39, 25)]);
    }

    #[test]
    fn test_visible_over_flat_terrain() {
        let tx = site(38.5, -75.5, 10.0);
        let terrain = flat(&[(38, -76), (37, -76)], 20);
        let report = los(-75.5).check(&tx, &terrain).unwrap();
        assert_eq!(report.outcome, LosOutcome::Visible);
        assert!(report.partial.is_none(), "{:?}", report.partial);
        assert_eq!(report.ground_height_m, 30.0);
    }

    #[test]
    fn test_terrain_blocks() {
        // Site sits at sea level next to a 5 km plateau to the south.
        let tx = site(38.02, -75.5, 2.0);
        let mut terrain = flat(&[(38, -76)], 0);
        terrain.insert(Arc::new(TerrainTile::flat(TileId::new(37, -76), TileResolution::Srtm3, 5000)));
        let report = los(-75.5).check(&tx, &terrain).unwrap();
        match report.outcome {
            LosOutcome::Obstructed(Obstruction::Terrain { terrain_m, ray_m, distance_m, .. }) => {
                assert_eq!(terrain_m, 5000.0);
                assert!(ray_m <= terrain_m);
                assert!(distance_m > 2_000.0 && distance_m < 8_000.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_obstruction_without_site_tile_is_partial() {
        // Same plateau, but the site's own tile is unknown.
        let tx = site(38.02, -75.5, 2.0);
        let terrain = flat(&[(37, -76)], 5000);
        let report = los(-75.5).check(&tx, &terrain).unwrap();
        assert!(matches!(report.outcome, LosOutcome::Obstructed(Obstruction::Terrain { .. })));
        assert_eq!(report.ground_height_m, 2.0);
        assert_eq!(report.partial.unwrap().missing_tiles, vec![TileId::new(38, -76)]);
    }

    #[test]
    fn test_missing_terrain_is_partial() {
        let tx = site(38.5, -75.5, 10.0);
        let report = los(-75.5).check(&tx, &TileSet::new()).unwrap();
        assert_eq!(report.outcome, LosOutcome::Visible);
        let partial = report.partial.unwrap();
        assert!(partial.missing_tiles.contains(&TileId::new(38, -76)));
    }

    #[test]
    fn test_path_tiles_cover_check() {
        let tx = site(38.02, -75.5, 2.0);
        let tiles = los(-75.5).path_tiles(&tx).unwrap();
        assert_eq!(tiles[0], TileId::new(38, -76));
        assert!(tiles.contains(&TileId::new(37, -76)));
    }
}
