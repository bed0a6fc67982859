use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use rf_coverage::config::PipelineConfig;
use rf_coverage::engine::ProcessEngine;
use rf_coverage::geo::LatLon;
use rf_coverage::io::TransmitterRegistry;
use rf_coverage::logging::init_logging;
use rf_coverage::pipeline::{LosSummary, Pipeline, PipelineError};
use rf_coverage::terrain::{HgtDirectory, TileLocator};

#[derive(Parser)]
#[command(name = "rf_coverage")]
#[command(about = "Terrain-aware RF coverage and satellite line-of-sight checks", long_about = None)]
struct Cli {
    /// More logging (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the propagation engine for every transmitter and merge the results
    Run(RunArgs),
    /// Check line of sight from every transmitter to the satellite
    Los(LosArgs),
    /// List the terrain tiles an analysis radius needs
    Tiles(TilesArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// Transmitter CSV file
    #[arg(long, short)]
    transmitters: PathBuf,

    /// JSON configuration file; defaults are used when omitted
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Directory of SRTM .hgt tiles (overrides the config)
    #[arg(long)]
    tile_dir: Option<PathBuf>,

    /// Jobs in flight at once (overrides the config)
    #[arg(long)]
    concurrency: Option<usize>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Where merged rasters and status.csv go (overrides the config)
    #[arg(long, short)]
    output_dir: Option<PathBuf>,

    /// Engine timeout in seconds (overrides the config)
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Args)]
struct LosArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Sub-satellite longitude in degrees (overrides the config)
    #[arg(long, allow_hyphen_values = true)]
    satellite_lon: Option<f64>,

    /// Also write the results as CSV
    #[arg(long)]
    csv: Option<PathBuf>,
}

#[derive(Args)]
struct TilesArgs {
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,

    #[arg(long, allow_hyphen_values = true)]
    lon: f64,

    #[arg(long, default_value = "50")]
    radius_km: f64,

    /// Report which tiles are missing from this directory
    #[arg(long)]
    tile_dir: Option<PathBuf>,
}

fn load_config(common: &CommonArgs) -> Result<PipelineConfig> {
    let mut config = match &common.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &common.tile_dir {
        config.tile_dir = dir.clone();
    }
    if let Some(n) = common.concurrency {
        config.concurrency = n;
    }
    Ok(config)
}

fn load_registry(common: &CommonArgs) -> Result<TransmitterRegistry> {
    TransmitterRegistry::from_path(&common.transmitters)
        .with_context(|| format!("loading transmitters from {}", common.transmitters.display()))
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.common)?;
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(secs) = args.timeout_secs {
        config.engine_timeout_secs = secs;
    }
    config.validate().context("invalid configuration")?;
    let registry = load_registry(&args.common)?;

    let engine = ProcessEngine::new(config.engine.clone(), config.tile_dir.clone());
    let pipeline = Pipeline::new(&config, HgtDirectory::new(config.tile_dir.clone()), engine);

    let report = match pipeline.run(&registry).await {
        Ok(report) => report,
        Err(PipelineError::NoSuccessfulJobs { report }) => {
            println!("{report}");
            report.write_outputs(&config.output_dir)?;
            bail!("none of the {} propagation jobs succeeded", report.jobs.len());
        }
        Err(e) => return Err(e.into()),
    };

    println!("{report}");
    let written = report
        .write_outputs(&config.output_dir)
        .with_context(|| format!("writing outputs to {}", config.output_dir.display()))?;
    for path in written {
        info!(path = %path.display(), "Wrote");
    }
    Ok(())
}

async fn los(args: LosArgs) -> Result<()> {
    let mut config = load_config(&args.common)?;
    if let Some(lon) = args.satellite_lon {
        config.satellite.longitude = lon;
    }
    config.validate().context("invalid configuration")?;
    let registry = load_registry(&args.common)?;

    // Line-of-sight checks never start the engine.
    let engine = ProcessEngine::new(config.engine.clone(), config.tile_dir.clone());
    let pipeline = Pipeline::new(&config, HgtDirectory::new(config.tile_dir.clone()), engine);
    let results = pipeline.check_los(&registry).await;
    let summary = LosSummary::from_results(&results);
    println!("{summary}");

    if let Some(path) = args.csv {
        let file = std::fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        summary.write_csv(file)?;
    }
    Ok(())
}

fn tiles(args: TilesArgs) -> Result<()> {
    let locator = TileLocator::default();
    let ids = locator.tiles_for_radius(LatLon::new(args.lat, args.lon), args.radius_km * 1000.0)?;
    let store = args.tile_dir.map(HgtDirectory::new);
    for id in ids {
        match &store {
            Some(dir) if dir.tile_path(id).is_none() => println!("{id} missing"),
            _ => println!("{id}"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Los(args) => los(args).await,
        Command::Tiles(args) => tiles(args),
    }
}
