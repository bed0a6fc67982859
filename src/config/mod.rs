//! Run configuration: the propagation environment applied to every job, the
//! ellipsoid and satellite constants, engine invocation and pool limits.
//!
//! Loaded once from JSON; every field has a default so a config file only
//! needs to name what differs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::EllipsoidParameters;

/// Distance in meters of a geostationary satellite from the center of the Earth.
pub const GEOSTATIONARY_RADIUS_M: f64 = 42_164_000.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Longley-Rice radio climate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RadioClimate {
    Equatorial,                // 1
    ContinentalSubtropical,    // 2
    MaritimeSubtropical,       // 3
    Desert,                    // 4
    ContinentalTemperate,      // 5
    MaritimeTemperateOverLand, // 6
    MaritimeTemperateOverSea,  // 7
}

impl RadioClimate {
    pub fn code(self) -> u8 {
        self.into()
    }

    pub fn description(self) -> &'static str {
        match self {
            RadioClimate::Equatorial => "Equatorial",
            RadioClimate::ContinentalSubtropical => "Continental Subtropical",
            RadioClimate::MaritimeSubtropical => "Maritime Subtropical",
            RadioClimate::Desert => "Desert",
            RadioClimate::ContinentalTemperate => "Continental Temperate",
            RadioClimate::MaritimeTemperateOverLand => "Maritime Temperate, over land",
            RadioClimate::MaritimeTemperateOverSea => "Maritime Temperate, over sea",
        }
    }
}

impl TryFrom<u8> for RadioClimate {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => RadioClimate::Equatorial,
            2 => RadioClimate::ContinentalSubtropical,
            3 => RadioClimate::MaritimeSubtropical,
            4 => RadioClimate::Desert,
            5 => RadioClimate::ContinentalTemperate,
            6 => RadioClimate::MaritimeTemperateOverLand,
            7 => RadioClimate::MaritimeTemperateOverSea,
            other => return Err(format!("radio climate code must be 1-7, got {other}")),
        })
    }
}

impl From<RadioClimate> for u8 {
    fn from(c: RadioClimate) -> u8 {
        match c {
            RadioClimate::Equatorial => 1,
            RadioClimate::ContinentalSubtropical => 2,
            RadioClimate::MaritimeSubtropical => 3,
            RadioClimate::Desert => 4,
            RadioClimate::ContinentalTemperate => 5,
            RadioClimate::MaritimeTemperateOverLand => 6,
            RadioClimate::MaritimeTemperateOverSea => 7,
        }
    }
}

/// Physical parameters shared by every propagation job of a run.
///
/// Typical dielectric constant / conductivity pairs: salt water 80 / 5.0,
/// fresh water 80 / 0.010, farmland or average ground 15 / 0.005, mountain
/// or sand 13 / 0.002, city 5 / 0.001.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationEnvironment {
    /// Relative permittivity of the ground
    pub dielectric_constant: f64,
    /// Ground conductivity, Siemens per meter
    pub conductivity: f64,
    /// Atmospheric bending constant, N-units
    pub bending_constant: f64,
    pub radio_climate: RadioClimate,
    /// Time variability, in (0, 1)
    pub fraction_of_time: f64,
    /// Location variability, in (0, 1)
    pub fraction_of_situations: f64,
    /// Signals below this are "no coverage", dBm
    pub receiver_sensitivity_dbm: f64,
    /// Receiver antenna height above ground, meters
    pub receiver_height_m: f64,
}

impl Default for PropagationEnvironment {
    fn default() -> Self {
        Self {
            dielectric_constant: 15.0,
            conductivity: 0.005,
            bending_constant: 301.0,
            radio_climate: RadioClimate::ContinentalTemperate,
            fraction_of_time: 0.5,
            fraction_of_situations: 0.5,
            receiver_sensitivity_dbm: -110.0,
            receiver_height_m: 1.5,
        }
    }
}

impl PropagationEnvironment {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("dielectric_constant", self.dielectric_constant),
            ("conductivity", self.conductivity),
            ("bending_constant", self.bending_constant),
        ];
        for (name, v) in positive {
            if !(v.is_finite() && v > 0.0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive, got {v}")));
            }
        }
        for (name, v) in [
            ("fraction_of_time", self.fraction_of_time),
            ("fraction_of_situations", self.fraction_of_situations),
        ] {
            if !(v > 0.0 && v < 1.0) {
                return Err(ConfigError::Invalid(format!("{name} must be in (0, 1), got {v}")));
            }
        }
        if !self.receiver_sensitivity_dbm.is_finite() {
            return Err(ConfigError::Invalid("receiver_sensitivity_dbm must be finite".into()));
        }
        if !(self.receiver_height_m.is_finite() && self.receiver_height_m >= 0.0) {
            return Err(ConfigError::Invalid("receiver_height_m must not be negative".into()));
        }
        Ok(())
    }
}

/// A geostationary satellite: fixed distance from the Earth's center above
/// the equator at `longitude`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SatellitePosition {
    pub geocentric_distance_m: f64,
    /// Sub-satellite longitude, degrees
    pub longitude: f64,
}

impl Default for SatellitePosition {
    fn default() -> Self {
        Self {
            geocentric_distance_m: GEOSTATIONARY_RADIUS_M,
            longitude: -75.0,
        }
    }
}

impl SatellitePosition {
    pub fn geostationary(longitude: f64) -> Self {
        Self {
            geocentric_distance_m: GEOSTATIONARY_RADIUS_M,
            longitude,
        }
    }

    /// Height above the ellipsoid, H_S = R_S - a.
    pub fn altitude(&self, ellipsoid: &EllipsoidParameters) -> f64 {
        self.geocentric_distance_m - ellipsoid.semimajor_axis
    }
}

/// How to run the external propagation program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub program: PathBuf,
    /// Arguments; `{qth}`, `{lrp}`, `{output}`, `{tile_dir}`, `{tiles}`,
    /// `{radius_km}`, `{sensitivity}` and `{rx_height}` are substituted.
    pub args: Vec<String>,
    /// Parent of the per-job work directories; the system temp dir if unset.
    pub work_dir: Option<PathBuf>,
    pub keep_work_files: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let args = [
            "-t", "{qth}", "-d", "{tile_dir}", "-L", "{rx_height}", "-R", "{radius_km}", "-dbm", "-db",
            "{sensitivity}", "-o", "{output}",
        ];
        Self {
            program: PathBuf::from("splat"),
            args: args.iter().map(|s| s.to_string()).collect(),
            work_dir: None,
            keep_work_files: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tile_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Radius around each transmitter to analyse, kilometers
    pub analysis_radius_km: f64,
    /// Jobs in flight at once
    pub concurrency: usize,
    pub engine_timeout_secs: u64,
    /// Tiles kept in memory; unbounded when unset
    pub tile_cache_capacity: Option<usize>,
    /// Longest ground track a line-of-sight check walks, kilometers
    pub max_track_km: f64,
    pub ellipsoid: EllipsoidParameters,
    pub environment: PropagationEnvironment,
    pub satellite: SatellitePosition,
    pub engine: EngineConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tile_dir: PathBuf::from("tiles"),
            output_dir: PathBuf::from("output"),
            analysis_radius_km: 50.0,
            concurrency: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            engine_timeout_secs: 600,
            tile_cache_capacity: None,
            max_track_km: 250.0,
            ellipsoid: EllipsoidParameters::WGS84,
            environment: PropagationEnvironment::default(),
            satellite: SatellitePosition::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.engine_timeout_secs == 0 {
            return Err(ConfigError::Invalid("engine_timeout_secs must be positive".into()));
        }
        if !(self.analysis_radius_km.is_finite() && self.analysis_radius_km > 0.0) {
            return Err(ConfigError::Invalid("analysis_radius_km must be positive".into()));
        }
        if !(self.max_track_km.is_finite() && self.max_track_km > 0.0) {
            return Err(ConfigError::Invalid("max_track_km must be positive".into()));
        }
        if self.tile_cache_capacity == Some(0) {
            return Err(ConfigError::Invalid("tile_cache_capacity must be at least 1".into()));
        }
        if self.satellite.geocentric_distance_m <= self.ellipsoid.semimajor_axis {
            return Err(ConfigError::Invalid("satellite must orbit above the ellipsoid".into()));
        }
        self.environment.validate()
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn analysis_radius_m(&self) -> f64 {
        self.analysis_radius_km * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.environment, PropagationEnvironment::default());
        assert_eq!(config.environment.radio_climate.code(), 5);
        assert_eq!(config.satellite.geocentric_distance_m, GEOSTATIONARY_RADIUS_M);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_override() {
        let json = r#"{
            "concurrency": 3,
            "environment": { "radio_climate": 6, "receiver_sensitivity_dbm": -100 }
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.environment.radio_climate, RadioClimate::MaritimeTemperateOverLand);
        assert_eq!(config.environment.receiver_sensitivity_dbm, -100.0);
        assert_eq!(config.environment.dielectric_constant, 15.0);
    }

    #[test]
    fn test_bad_climate_code() {
        let res: Result<PipelineConfig, _> = serde_json::from_str(r#"{"environment": {"radio_climate": 9}}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = PipelineConfig::default();
        config.concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = PipelineConfig::default();
        config.environment.fraction_of_time = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_satellite_altitude() {
        let sat = SatellitePosition::default();
        assert_eq!(sat.altitude(&EllipsoidParameters::WGS84), 42_164_000.0 - 6_378_137.0);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"analysis_radius_km": 25.0}"#).unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.analysis_radius_m(), 25_000.0);
        assert!(matches!(
            PipelineConfig::load(dir.path().join("nope.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
