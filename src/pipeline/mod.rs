//! Per-transmitter job orchestration.
//!
//! Every transmitter of a registry becomes one independent job: resolve the
//! tiles around it, fetch them through the run's [`TerrainStore`], hand them
//! to the [`PropagationEngine`] under a timeout and parse what comes back.
//! At most `concurrency` jobs are in flight; a failing or panicking job is
//! recorded against its transmitter and never stops its siblings.

pub mod report;

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::TerrainStore;
use crate::config::{PipelineConfig, PropagationEnvironment};
use crate::coverage::{CoverageMerger, CoverageResult, GridError, parse_ascii_grid};
use crate::engine::{EngineError, EngineJob, PropagationEngine};
use crate::geo::GeoError;
use crate::io::{Transmitter, TransmitterKey, TransmitterRegistry};
use crate::physics::{LosReport, SatelliteLos};
use crate::terrain::{TerrainError, TileId, TileLocator, TileSource};

pub use report::{LosRow, LosSummary, RunReport, StatusRow};

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    InvalidCoordinate(#[from] GeoError),
    #[error("terrain tile {0} is not available")]
    TileNotAvailable(TileId),
    #[error(transparent)]
    Tile(TerrainError),
    #[error("engine timed out after {0:?}")]
    EngineTimeout(Duration),
    #[error("engine exited with {}: {}", exit_status(.code), .stderr.trim())]
    EngineFailed { code: Option<i32>, stderr: String },
    #[error("malformed engine output: {0}")]
    MalformedOutput(#[from] GridError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("job panicked: {0}")]
    Panicked(String),
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "a signal".to_string(),
    }
}

impl From<TerrainError> for JobError {
    fn from(e: TerrainError) -> Self {
        match e {
            TerrainError::TileNotAvailable(id) => JobError::TileNotAvailable(id),
            other => JobError::Tile(other),
        }
    }
}

impl JobError {
    /// Short machine-readable name used in status tables.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::InvalidCoordinate(_) => "invalid_coordinate",
            JobError::TileNotAvailable(_) => "tile_not_available",
            JobError::Tile(_) => "tile_error",
            JobError::EngineTimeout(_) => "engine_timeout",
            JobError::EngineFailed { .. } => "engine_failed",
            JobError::MalformedOutput(_) => "malformed_output",
            JobError::Engine(_) => "engine_error",
            JobError::Panicked(_) => "panicked",
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Carries the report so the per-transmitter status is still available.
    #[error("none of the {} propagation jobs succeeded", .report.jobs.len())]
    NoSuccessfulJobs { report: Box<RunReport> },
    #[error("failed to write {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type JobResults<T> = BTreeMap<TransmitterKey, Result<T, JobError>>;

/// One pipeline invocation. The tile store and environment live as long as
/// this value and are shared by every job it runs.
pub struct Pipeline<S, E> {
    store: Arc<TerrainStore<S>>,
    engine: Arc<E>,
    environment: Arc<PropagationEnvironment>,
    locator: TileLocator,
    los: SatelliteLos,
    radius_m: f64,
    concurrency: usize,
    engine_timeout: Duration,
}

impl<S: TileSource, E: PropagationEngine> Pipeline<S, E> {
    pub fn new(config: &PipelineConfig, source: S, engine: E) -> Self {
        let store = match config.tile_cache_capacity.and_then(NonZeroUsize::new) {
            Some(capacity) => TerrainStore::with_capacity(source, capacity),
            None => TerrainStore::new(source),
        };
        Self {
            store: Arc::new(store),
            engine: Arc::new(engine),
            environment: Arc::new(config.environment.clone()),
            locator: TileLocator::new(config.ellipsoid),
            los: SatelliteLos::new(config.ellipsoid, config.satellite, config.max_track_km * 1000.0),
            radius_m: config.analysis_radius_m(),
            concurrency: config.concurrency.max(1),
            engine_timeout: config.engine_timeout(),
        }
    }

    pub fn store(&self) -> &TerrainStore<S> {
        &self.store
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Runs one propagation job per transmitter. The map holds exactly one
    /// entry for every transmitter in the registry.
    pub async fn run_jobs(&self, registry: &TransmitterRegistry) -> JobResults<CoverageResult> {
        info!(
            transmitters = registry.len(),
            engine = self.engine.name(),
            concurrency = self.concurrency,
            "Starting propagation jobs"
        );
        self.run_bounded(registry, |tx| {
            let store = Arc::clone(&self.store);
            let engine = Arc::clone(&self.engine);
            let environment = Arc::clone(&self.environment);
            let locator = self.locator;
            let radius_m = self.radius_m;
            let timeout = self.engine_timeout;
            async move { propagation_job(&*store, &*engine, environment, locator, tx, radius_m, timeout).await }
        })
        .await
    }

    /// Runs every job, then merges the successful results. Fails only when
    /// no job succeeded.
    pub async fn run(&self, registry: &TransmitterRegistry) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let jobs = self.run_jobs(registry).await;

        // Every job has reached a terminal state here.
        let successes: Vec<CoverageResult> = jobs.values().filter_map(|r| r.as_ref().ok().cloned()).collect();
        let merged = CoverageMerger::new().merge(&successes);
        let report = RunReport {
            jobs,
            merged,
            store: self.store.stats(),
        };
        if successes.is_empty() {
            warn!(total = report.jobs.len(), "No propagation job succeeded");
            return Err(PipelineError::NoSuccessfulJobs {
                report: Box::new(report),
            });
        }

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            rasters = report.merged.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Run complete"
        );
        Ok(report)
    }

    /// Satellite line-of-sight check for every transmitter. Missing tiles do
    /// not fail a check; they mark its report partial.
    pub async fn check_los(&self, registry: &TransmitterRegistry) -> JobResults<LosReport> {
        self.run_bounded(registry, |tx| {
            let store = Arc::clone(&self.store);
            let los = self.los;
            async move {
                let ids = los.path_tiles(&tx)?;
                let (tiles, missing) = store.get_available(&ids).await;
                debug!(transmitter = %tx.key, tiles = tiles.len(), missing = missing.len(), "Path tiles resolved");
                let key = tx.key.clone();
                let report = tokio::task::spawn_blocking(move || los.check(&tx, &tiles))
                    .await
                    .map_err(|e| JobError::Panicked(e.to_string()))??;
                if let Some(partial) = &report.partial {
                    warn!(transmitter = %key, missing = ?partial.missing_tiles, "Line of sight checked without full terrain");
                }
                Ok(report)
            }
        })
        .await
    }

    async fn run_bounded<T, F, Fut>(&self, registry: &TransmitterRegistry, make_job: F) -> JobResults<T>
    where
        T: Send + 'static,
        F: Fn(Transmitter) -> Fut,
        Fut: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        let mut pending: VecDeque<Transmitter> = registry.iter().cloned().collect();
        let keys: Vec<TransmitterKey> = registry.keys().cloned().collect();
        let limiter = Arc::new(Semaphore::new(self.concurrency));
        let mut running: JoinSet<(TransmitterKey, Result<T, JobError>)> = JoinSet::new();
        let mut results = BTreeMap::new();

        while !pending.is_empty() || !running.is_empty() {
            while !pending.is_empty() {
                let Ok(permit) = Arc::clone(&limiter).try_acquire_owned() else {
                    break;
                };
                let Some(tx) = pending.pop_front() else {
                    break;
                };
                let key = tx.key.clone();
                // Inner task so a panic surfaces as a JoinError for this key.
                let job = tokio::spawn(make_job(tx));
                running.spawn(async move {
                    let result = match job.await {
                        Ok(r) => r,
                        Err(e) => Err(JobError::Panicked(e.to_string())),
                    };
                    drop(permit);
                    (key, result)
                });
            }

            match running.join_next().await {
                Some(Ok((key, result))) => {
                    if let Err(e) = &result {
                        warn!(transmitter = %key, kind = e.kind(), error = %e, "Job failed");
                    }
                    results.insert(key, result);
                }
                Some(Err(e)) => warn!(error = %e, "Job wrapper task failed"),
                None => {}
            }
        }

        for key in keys {
            results
                .entry(key)
                .or_insert_with(|| Err(JobError::Panicked("job ended without a result".into())));
        }
        results
    }
}

async fn propagation_job<S: TileSource, E: PropagationEngine>(
    store: &TerrainStore<S>,
    engine: &E,
    environment: Arc<PropagationEnvironment>,
    locator: TileLocator,
    tx: Transmitter,
    radius_m: f64,
    timeout: Duration,
) -> Result<CoverageResult, JobError> {
    let started = Instant::now();
    let key = tx.key.clone();
    debug!(transmitter = %key, "Job started");

    let tile_ids = locator.tiles_for_radius(tx.location(), radius_m)?;
    let tiles = store.get_all(&tile_ids).await?;
    debug!(transmitter = %key, tiles = tiles.len(), "Tiles resolved");

    let sensitivity = environment.receiver_sensitivity_dbm;
    let job = EngineJob {
        transmitter: tx,
        environment,
        tiles,
        radius_m,
    };
    let raw = tokio::time::timeout(timeout, engine.invoke(&job))
        .await
        .map_err(|_| JobError::EngineTimeout(timeout))??;
    if !raw.success() {
        return Err(JobError::EngineFailed {
            code: raw.exit_code,
            stderr: raw.stderr,
        });
    }

    let mut raster = parse_ascii_grid(&raw.raster_text)?;
    raster.apply_threshold(sensitivity);
    info!(
        transmitter = %key,
        covered_cells = raster.covered_cells(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Job finished"
    );
    Ok(CoverageResult {
        transmitter: key,
        tiles: tile_ids,
        raster,
    })
}
