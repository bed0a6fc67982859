//! Propagation engine contract and the external-process implementation.
//!
//! An engine turns one transmitter plus the shared environment into a signal
//! raster. [`ProcessEngine`] does this by writing SPLAT!-style site files into
//! a scratch directory and running a configured program that is expected to
//! leave an ESRI ASCII grid at `{output}`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use itertools::Itertools;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{EngineConfig, PropagationEnvironment};
use crate::io::Transmitter;
use crate::terrain::{TileId, TileSet};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("work file {path}: {source}")]
    WorkFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Everything an engine needs for one transmitter.
#[derive(Debug, Clone)]
pub struct EngineJob {
    pub transmitter: Transmitter,
    pub environment: Arc<PropagationEnvironment>,
    /// Terrain covering the analysis radius
    pub tiles: TileSet,
    pub radius_m: f64,
}

impl EngineJob {
    pub fn tile_ids(&self) -> Vec<TileId> {
        self.tiles.ids()
    }

    /// Site file: name, latitude, longitude in degrees west, antenna height.
    pub fn qth(&self) -> String {
        let tx = &self.transmitter;
        let west = (-tx.longitude).rem_euclid(360.0);
        format!(
            "{}\n{:.6}\n{:.6}\n{} meters\n",
            tx.key.file_stem(),
            tx.latitude,
            west,
            tx.antenna_height_m
        )
    }

    /// Irregular terrain model parameters, one `value ; comment` per line.
    pub fn lrp(&self) -> String {
        let env = &self.environment;
        let tx = &self.transmitter;
        [
            format!("{:.3} ; Earth Dielectric Constant (Relative permittivity)", env.dielectric_constant),
            format!("{:.3} ; Earth Conductivity (Siemens per meter)", env.conductivity),
            format!("{:.3} ; Atmospheric Bending Constant (N-units)", env.bending_constant),
            format!("{:.3} ; Frequency in MHz (20 MHz to 20 GHz)", tx.frequency_mhz),
            format!("{} ; Radio Climate ({})", env.radio_climate.code(), env.radio_climate.description()),
            format!("{} ; Polarization (0 = Horizontal, 1 = Vertical)", tx.polarization.code()),
            format!("{:.2} ; Fraction of situations", env.fraction_of_situations),
            format!("{:.2} ; Fraction of time", env.fraction_of_time),
            format!("{:.1} ; ERP in watts", tx.power_eirp_w),
        ]
        .join("\n")
            + "\n"
    }
}

/// What an engine run left behind. A non-zero exit code or an unparseable
/// raster is judged by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOutput {
    /// `None` when the process was ended by a signal
    pub exit_code: Option<i32>,
    pub raster_text: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A terrain-aware propagation calculation, run once per transmitter.
pub trait PropagationEngine: Send + Sync + 'static {
    fn invoke(&self, job: &EngineJob) -> impl Future<Output = Result<RawOutput, EngineError>> + Send;

    /// Returns the engine's name for logging.
    fn name(&self) -> &str;
}

static WORK_DIR_SEQ: AtomicU64 = AtomicU64::new(0);

/// Per-job scratch directory, removed on drop unless kept. Dropping also
/// covers a job abandoned by its timeout.
struct WorkDir {
    path: PathBuf,
    keep: bool,
}

impl WorkDir {
    async fn create(parent: &Path, stem: &str, keep: bool) -> Result<Self, EngineError> {
        let seq = WORK_DIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = parent.join(format!("rf_coverage-{}-{}-{}", std::process::id(), seq, stem));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| EngineError::WorkFile {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, keep })
    }

    async fn write(&self, name: &str, contents: String) -> Result<PathBuf, EngineError> {
        let path = self.path.join(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| EngineError::WorkFile {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove work directory");
        }
    }
}

/// Runs an external program per job.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    config: EngineConfig,
    tile_dir: PathBuf,
}

impl ProcessEngine {
    pub fn new(config: EngineConfig, tile_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            tile_dir: tile_dir.into(),
        }
    }

    fn render_args(&self, job: &EngineJob, qth: &Path, lrp: &Path, output: &Path) -> Vec<String> {
        let tiles = job.tile_ids().iter().join(",");
        let radius_km = format!("{}", job.radius_m / 1000.0);
        let sensitivity = format!("{}", job.environment.receiver_sensitivity_dbm);
        let rx_height = format!("{}", job.environment.receiver_height_m);
        let vars = [
            ("{qth}", qth.display().to_string()),
            ("{lrp}", lrp.display().to_string()),
            ("{output}", output.display().to_string()),
            ("{tile_dir}", self.tile_dir.display().to_string()),
            ("{tiles}", tiles),
            ("{radius_km}", radius_km),
            ("{sensitivity}", sensitivity),
            ("{rx_height}", rx_height),
        ];
        self.config
            .args
            .iter()
            .map(|arg| vars.iter().fold(arg.clone(), |acc, (k, v)| acc.replace(k, v)))
            .collect()
    }
}

impl PropagationEngine for ProcessEngine {
    async fn invoke(&self, job: &EngineJob) -> Result<RawOutput, EngineError> {
        let stem = job.transmitter.key.file_stem();
        let parent = self.config.work_dir.clone().unwrap_or_else(std::env::temp_dir);
        let work = WorkDir::create(&parent, &stem, self.config.keep_work_files).await?;

        let qth = work.write(&format!("{stem}.qth"), job.qth()).await?;
        let lrp = work.write(&format!("{stem}.lrp"), job.lrp()).await?;
        let output = work.path.join(format!("{stem}.asc"));
        let args = self.render_args(job, &qth, &lrp, &output);

        debug!(program = %self.config.program.display(), ?args, work_dir = %work.path.display(), "Launching engine");
        let out = Command::new(&self.config.program)
            .args(&args)
            .current_dir(&work.path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;

        let raster_text = match tokio::fs::read_to_string(&output).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(EngineError::WorkFile { path: output, source }),
        };

        Ok(RawOutput {
            exit_code: out.status.code(),
            raster_text,
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    fn name(&self) -> &str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{Polarization, TransmitterKey};
    use crate::terrain::{TerrainTile, TileResolution};

    fn job() -> EngineJob {
        let tile = TerrainTile::flat(TileId::new(38, -76), TileResolution::Srtm3, 0);
        EngineJob {
            transmitter: Transmitter {
                key: TransmitterKey::new("Tri State", "Mount Airy"),
                latitude: 38.5,
                longitude: -75.25,
                antenna_height_m: 30.0,
                polarization: Polarization::Horizontal,
                frequency_mhz: 600.0,
                power_eirp_w: 1000.0,
            },
            environment: Arc::new(PropagationEnvironment::default()),
            tiles: [Arc::new(tile)].into_iter().collect(),
            radius_m: 25_000.0,
        }
    }

    #[test]
    fn test_qth() {
        assert_eq!(job().qth(), "TriState_MountAiry\n38.500000\n75.250000\n30 meters\n");
        let mut east = job();
        east.transmitter.longitude = 10.0;
        assert!(east.qth().contains("\n350.000000\n"));
    }

    #[test]
    fn test_lrp() {
        let lrp = job().lrp();
        let values: Vec<&str> = lrp.lines().map(|l| l.split(';').next().unwrap().trim()).collect();
        assert_eq!(
            values,
            vec!["15.000", "0.005", "301.000", "600.000", "5", "0", "0.50", "0.50", "1000.0"]
        );
    }

    #[test]
    fn test_render_args() {
        let config = EngineConfig {
            program: "splat".into(),
            args: vec!["-t".into(), "{qth}".into(), "-R".into(), "{radius_km}".into(), "--tiles={tiles}".into()],
            ..EngineConfig::default()
        };
        let engine = ProcessEngine::new(config, "/srtm");
        let args = engine.render_args(&job(), Path::new("a.qth"), Path::new("a.lrp"), Path::new("a.asc"));
        assert_eq!(args, vec!["-t", "a.qth", "-R", "25", "--tiles=N38W076"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_engine_runs_program() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                "test -s \"$1\" && printf 'ncols 1\\nnrows 1\\nxllcorner 0\\nyllcorner 0\\ncellsize 1\\n-50\\n' > \"$0\"".into(),
                "{output}".into(),
                "{lrp}".into(),
            ],
            work_dir: Some(dir.path().to_path_buf()),
            keep_work_files: false,
        };
        let out = ProcessEngine::new(config, "/srtm").invoke(&job()).await.unwrap();
        assert!(out.success(), "{out:?}");
        assert!(out.raster_text.starts_with("ncols 1"));
        // Work directory is cleaned up.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_engine_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            program: "sh".into(),
            args: vec!["-c".into(), "echo boom >&2; exit 3".into()],
            work_dir: Some(dir.path().to_path_buf()),
            keep_work_files: true,
        };
        let out = ProcessEngine::new(config, "/srtm").invoke(&job()).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr.trim(), "boom");
        assert!(out.raster_text.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            program: "/nonexistent/propagation-engine".into(),
            args: Vec::new(),
            work_dir: Some(dir.path().to_path_buf()),
            keep_work_files: false,
        };
        let err = ProcessEngine::new(config, "/srtm").invoke(&job()).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
