use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use rf_coverage::config::SatellitePosition;
use rf_coverage::coverage::{CoverageMerger, CoverageResult, GridSpec, SignalRaster};
use rf_coverage::geo::EllipsoidParameters;
use rf_coverage::io::{Polarization, Transmitter, TransmitterKey};
use rf_coverage::physics::SatelliteLos;
use rf_coverage::terrain::{TerrainTile, TileId, TileResolution, TileSet};

fn synthetic_result(site: &str, west: f64, north: f64) -> CoverageResult {
    let grid = GridSpec::new(west, north, 0.01, 80, 70);
    let cells = (0..grid.len())
        .map(|i| {
            let v = -60.0 - (i % 97) as f32;
            (v > -140.0).then_some(v)
        })
        .collect();
    CoverageResult {
        transmitter: TransmitterKey::new("bench", site),
        tiles: vec![TileId::new(38, -76)],
        raster: SignalRaster::new(grid, cells),
    }
}

fn merge_benchmark(c: &mut Criterion) {
    let results = vec![
        synthetic_result("a", -75.95, 38.72),
        synthetic_result("b", -75.85, 38.77),
        synthetic_result("c", -75.90, 39.02),
    ];
    let merger = CoverageMerger::new();

    c.bench_function("merge_three_rasters", |b| b.iter(|| merger.merge(black_box(&results))));
}

fn los_benchmark(c: &mut Criterion) {
    let terrain: TileSet = [TileId::new(38, -76), TileId::new(37, -76)]
        .into_iter()
        .map(|id| Arc::new(TerrainTile::flat(id, TileResolution::Srtm3, 120)))
        .collect();
    let tx = Transmitter {
        key: TransmitterKey::new("bench", "site"),
        latitude: 38.4,
        longitude: -75.55,
        antenna_height_m: 30.0,
        polarization: Polarization::Vertical,
        frequency_mhz: 600.0,
        power_eirp_w: 1000.0,
    };
    let los = SatelliteLos::new(EllipsoidParameters::WGS84, SatellitePosition::geostationary(-75.0), 250_000.0);

    c.bench_function("satellite_los_check", |b| b.iter(|| los.check(black_box(&tx), black_box(&terrain))));
}

criterion_group!(benches, merge_benchmark, los_benchmark);
criterion_main!(benches);
