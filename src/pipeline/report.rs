//! Run outcomes: per-transmitter status tables and output files.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::Serialize;
use tracing::info;

use super::{JobResults, PipelineError};
use crate::cache::StoreStats;
use crate::coverage::{CoverageResult, MergedCoverage};
use crate::physics::{LosOutcome, LosReport, Obstruction};

pub const STATUS_FILE: &str = "status.csv";

#[derive(Debug)]
pub struct RunReport {
    pub jobs: JobResults<CoverageResult>,
    pub merged: Vec<MergedCoverage>,
    pub store: StoreStats,
}

/// One line of the status table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRow {
    pub network_name: String,
    pub site_name: String,
    pub status: &'static str,
    pub covered_cells: Option<usize>,
    pub tiles: String,
    pub error_kind: Option<&'static str>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.jobs.values().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.jobs.len() - self.succeeded()
    }

    pub fn status_rows(&self) -> Vec<StatusRow> {
        self.jobs
            .iter()
            .map(|(key, result)| {
                let (status, covered_cells, tiles, error_kind, error) = match result {
                    Ok(c) => ("ok", Some(c.raster.covered_cells()), c.tiles.iter().join(" "), None, None),
                    Err(e) => ("failed", None, String::new(), Some(e.kind()), Some(e.to_string())),
                };
                StatusRow {
                    network_name: key.network_name.clone(),
                    site_name: key.site_name.clone(),
                    status,
                    covered_cells,
                    tiles,
                    error_kind,
                    error,
                }
            })
            .collect()
    }

    pub fn write_status_csv<W: Write>(&self, w: W) -> Result<(), PipelineError> {
        let mut wtr = csv::Writer::from_writer(w);
        for row in self.status_rows() {
            wtr.serialize(row)?;
        }
        wtr.flush().map_err(csv::Error::from)?;
        Ok(())
    }

    /// Writes `coverage_<n>.asc` for each merged raster (numbered from 1) and
    /// `status.csv` into `dir`, returning the paths written.
    pub fn write_outputs(&self, dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
        std::fs::create_dir_all(dir).map_err(|source| PipelineError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut written = Vec::new();
        for (i, merged) in self.merged.iter().enumerate() {
            let path = dir.join(format!("coverage_{}.asc", i + 1));
            let file = create(&path)?;
            let mut w = BufWriter::new(file);
            merged.write_ascii(&mut w)?;
            w.flush().map_err(|source| PipelineError::Io {
                path: path.clone(),
                source,
            })?;
            written.push(path);
        }

        let path = dir.join(STATUS_FILE);
        self.write_status_csv(create(&path)?)?;
        written.push(path);

        info!(dir = %dir.display(), files = written.len(), "Outputs written");
        Ok(written)
    }
}

fn create(path: &Path) -> Result<File, PipelineError> {
    File::create(path).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = self.status_rows();
        let width = rows
            .iter()
            .map(|r| r.network_name.len() + r.site_name.len() + 1)
            .max()
            .unwrap_or(0)
            .max("transmitter".len());
        writeln!(f, "{:<width$}  {:<6}  detail", "transmitter", "status")?;
        for r in &rows {
            let name = format!("{}/{}", r.network_name, r.site_name);
            let detail = match (&r.error, r.covered_cells) {
                (Some(e), _) => e.clone(),
                (None, Some(n)) => format!("{n} cells covered"),
                (None, None) => String::new(),
            };
            writeln!(f, "{name:<width$}  {:<6}  {detail}", r.status)?;
        }
        write!(
            f,
            "{} succeeded, {} failed, {} merged raster(s), {} tile load(s)",
            self.succeeded(),
            self.failed(),
            self.merged.len(),
            self.store.loads
        )
    }
}

/// One line of a line-of-sight table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LosRow {
    pub network_name: String,
    pub site_name: String,
    pub status: &'static str,
    pub elevation_deg: Option<f64>,
    pub azimuth_deg: Option<f64>,
    pub slant_range_km: Option<f64>,
    pub obstruction_km: Option<f64>,
    pub partial: bool,
    pub missing_tiles: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LosSummary {
    pub rows: Vec<LosRow>,
}

impl LosSummary {
    pub fn from_results(results: &JobResults<LosReport>) -> Self {
        let rows = results
            .iter()
            .map(|(key, result)| {
                let mut row = LosRow {
                    network_name: key.network_name.clone(),
                    site_name: key.site_name.clone(),
                    status: "failed",
                    elevation_deg: None,
                    azimuth_deg: None,
                    slant_range_km: None,
                    obstruction_km: None,
                    partial: false,
                    missing_tiles: String::new(),
                    error: None,
                };
                match result {
                    Ok(report) => {
                        row.status = match &report.outcome {
                            LosOutcome::Visible => "visible",
                            LosOutcome::Obstructed(Obstruction::BelowHorizon) => "below_horizon",
                            LosOutcome::Obstructed(Obstruction::Terrain { distance_m, .. }) => {
                                row.obstruction_km = Some(distance_m / 1000.0);
                                "terrain"
                            }
                        };
                        row.elevation_deg = Some(report.look.elevation_deg);
                        row.azimuth_deg = Some(report.look.azimuth_deg);
                        row.slant_range_km = Some(report.look.slant_range_m / 1000.0);
                        if let Some(p) = &report.partial {
                            row.partial = true;
                            row.missing_tiles = p.missing_tiles.iter().join(" ");
                        }
                    }
                    Err(e) => row.error = Some(e.to_string()),
                }
                row
            })
            .collect();
        Self { rows }
    }

    pub fn visible(&self) -> usize {
        self.rows.iter().filter(|r| r.status == "visible").count()
    }

    pub fn write_csv<W: Write>(&self, w: W) -> Result<(), PipelineError> {
        let mut wtr = csv::Writer::from_writer(w);
        for row in &self.rows {
            wtr.serialize(row)?;
        }
        wtr.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}

impl fmt::Display for LosSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.rows {
            write!(f, "{}/{}: {}", r.network_name, r.site_name, r.status)?;
            if let (Some(el), Some(az)) = (r.elevation_deg, r.azimuth_deg) {
                write!(f, " (elevation {el:.2}°, azimuth {az:.2}°)")?;
            }
            if let Some(km) = r.obstruction_km {
                write!(f, " blocked at {km:.2} km")?;
            }
            if r.partial {
                write!(f, " [partial, missing {}]", r.missing_tiles)?;
            }
            if let Some(e) = &r.error {
                write!(f, " {e}")?;
            }
            writeln!(f)?;
        }
        write!(f, "{} of {} visible", self.visible(), self.rows.len())
    }
}
