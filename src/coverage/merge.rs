//! Combining per-transmitter rasters into best-server coverage maps.

use std::io::Write;

use itertools::Itertools;
use tracing::{debug, warn};

use super::ascii::{GridError, write_ascii_grid};
use super::{CoverageResult, GridSpec};
use crate::geo::BoundingBox;
use crate::io::TransmitterKey;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedCell {
    pub signal_dbm: f32,
    /// Index into `MergedCoverage::contributors`
    pub transmitter: usize,
}

/// One combined raster over a group of overlapping results.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedCoverage {
    pub grid: GridSpec,
    /// Sorted keys of the results merged into this raster
    pub contributors: Vec<TransmitterKey>,
    pub cells: Vec<Option<MergedCell>>,
}

impl MergedCoverage {
    pub fn get(&self, col: usize, row: usize) -> Option<MergedCell> {
        if col >= self.grid.cols || row >= self.grid.rows {
            return None;
        }
        self.cells[row * self.grid.cols + col]
    }

    pub fn signal_at(&self, latitude: f64, longitude: f64) -> Option<f32> {
        let (col, row) = self.grid.index_of(latitude, longitude)?;
        self.get(col, row).map(|c| c.signal_dbm)
    }

    /// The transmitter providing the strongest signal at the point.
    pub fn best_server(&self, latitude: f64, longitude: f64) -> Option<&TransmitterKey> {
        let (col, row) = self.grid.index_of(latitude, longitude)?;
        self.get(col, row).map(|c| &self.contributors[c.transmitter])
    }

    pub fn covered_cells(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    pub fn write_ascii<W: Write>(&self, w: W) -> Result<(), GridError> {
        write_ascii_grid(w, &self.grid, self.cells.iter().map(|c| c.map(|c| c.signal_dbm)))
    }
}

/// Upper bound on the cells of one merged raster (4096 x 4096).
pub const MAX_MERGED_CELLS: usize = 1 << 24;

#[derive(Debug, Clone, Copy)]
pub struct CoverageMerger {
    max_cells: usize,
}

impl Default for CoverageMerger {
    fn default() -> Self {
        Self {
            max_cells: MAX_MERGED_CELLS,
        }
    }
}

impl CoverageMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the cells of each merged raster. A group whose finest cell size
    /// would exceed the cap is merged on a coarser grid instead.
    pub fn with_max_cells(max_cells: usize) -> Self {
        Self {
            max_cells: max_cells.max(1),
        }
    }

    /// Merges results into one raster per group of transitively overlapping
    /// extents. Groups come back ordered by their lowest transmitter key; the
    /// output does not depend on the order of `results`.
    pub fn merge(&self, results: &[CoverageResult]) -> Vec<MergedCoverage> {
        let sorted: Vec<&CoverageResult> = results.iter().sorted_by(|a, b| a.transmitter.cmp(&b.transmitter)).collect();

        let bounds: Vec<BoundingBox> = sorted.iter().map(|r| r.raster.grid.bounds()).collect();
        let mut parent: Vec<usize> = (0..sorted.len()).collect();
        for (i, j) in (0..sorted.len()).tuple_combinations() {
            if bounds[i].overlaps(&bounds[j]) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                // The lower index stays root so groups keep key order.
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }

        let roots: Vec<usize> = (0..sorted.len()).map(|i| find(&mut parent, i)).collect();
        (0..sorted.len())
            .into_group_map_by(|&i| roots[i])
            .into_iter()
            .sorted_by_key(|(root, _)| *root)
            .map(|(_, members)| merge_group(&members.iter().map(|&i| sorted[i]).collect::<Vec<_>>(), self.max_cells))
            .collect()
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// `group` must be sorted by transmitter key.
fn merge_group(group: &[&CoverageResult], max_cells: usize) -> MergedCoverage {
    let extent = group
        .iter()
        .map(|r| r.raster.grid.bounds())
        .reduce(|a, b| a.union(&b))
        .unwrap_or(BoundingBox::new(0.0, 0.0, 0.0, 0.0));
    let cell_size = group
        .iter()
        .map(|r| r.raster.grid.cell_size)
        .filter(|c| c.is_finite() && *c > 0.0)
        .reduce(f64::min)
        .unwrap_or(1.0);
    let grid = capped_grid(&extent, cell_size, max_cells);

    let mut cells = Vec::with_capacity(grid.len());
    for row in 0..grid.rows {
        for col in 0..grid.cols {
            let center = grid.cell_center(col, row);
            let mut best: Option<MergedCell> = None;
            for (i, result) in group.iter().enumerate() {
                let Some(signal_dbm) = result.raster.value_at(center.latitude, center.longitude) else {
                    continue;
                };
                // Strictly greater, so on a tie the lower key keeps the cell.
                if best.is_none_or(|b| signal_dbm > b.signal_dbm) {
                    best = Some(MergedCell {
                        signal_dbm,
                        transmitter: i,
                    });
                }
            }
            cells.push(best);
        }
    }

    let contributors: Vec<TransmitterKey> = group.iter().map(|r| r.transmitter.clone()).collect();
    debug!(
        contributors = contributors.len(),
        cols = grid.cols,
        rows = grid.rows,
        "Merged coverage group"
    );
    MergedCoverage {
        grid,
        contributors,
        cells,
    }
}

fn capped_grid(extent: &BoundingBox, finest: f64, max_cells: usize) -> GridSpec {
    let mut grid = GridSpec::covering(extent, finest);
    while grid.len() > max_cells {
        let scale = (grid.len() as f64 / max_cells as f64).sqrt().max(1.01);
        grid = GridSpec::covering(extent, grid.cell_size * scale);
    }
    if grid.cell_size != finest {
        warn!(
            finest,
            cell_size = grid.cell_size,
            cols = grid.cols,
            rows = grid.rows,
            "Merged grid coarsened to stay within the cell limit"
        );
    }
    grid
}
