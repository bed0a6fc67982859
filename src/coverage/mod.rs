//! Signal rasters produced per transmitter and the merged coverage surface.

pub mod ascii;
pub mod merge;

use serde::Serialize;

use crate::geo::{BoundingBox, LatLon};
use crate::io::TransmitterKey;
use crate::terrain::TileId;

pub use ascii::{GridError, parse_ascii_grid, write_ascii_grid};
pub use merge::{CoverageMerger, MergedCell, MergedCoverage};

/// Geometry of a north-up raster in geographic degrees. Row 0 is the
/// northernmost row, column 0 the westernmost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridSpec {
    pub west: f64,
    pub north: f64,
    pub cell_size: f64,
    pub cols: usize,
    pub rows: usize,
}

impl GridSpec {
    pub fn new(west: f64, north: f64, cell_size: f64, cols: usize, rows: usize) -> Self {
        Self {
            west,
            north,
            cell_size,
            cols,
            rows,
        }
    }

    /// Smallest grid with cells of `cell_size` covering `bounds`.
    pub fn covering(bounds: &BoundingBox, cell_size: f64) -> Self {
        // Absorb rounding noise so an exact multiple does not grow a column.
        let cols = ((bounds.width() / cell_size) - 1e-6).ceil().max(1.0) as usize;
        let rows = ((bounds.height() / cell_size) - 1e-6).ceil().max(1.0) as usize;
        Self::new(bounds.west, bounds.north, cell_size, cols, rows)
    }

    pub fn len(&self) -> usize {
        self.cols.saturating_mul(self.rows)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn south(&self) -> f64 {
        self.north - self.rows as f64 * self.cell_size
    }

    pub fn east(&self) -> f64 {
        self.west + self.cols as f64 * self.cell_size
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(self.west, self.south(), self.east(), self.north)
    }

    pub fn cell_center(&self, col: usize, row: usize) -> LatLon {
        LatLon::new(
            self.north - (row as f64 + 0.5) * self.cell_size,
            self.west + (col as f64 + 0.5) * self.cell_size,
        )
    }

    /// Column and row of the cell containing the point, if it is on the grid.
    pub fn index_of(&self, latitude: f64, longitude: f64) -> Option<(usize, usize)> {
        let x = (longitude - self.west) / self.cell_size;
        let y = (self.north - latitude) / self.cell_size;
        if !(x >= 0.0 && y >= 0.0) {
            return None;
        }
        let (col, row) = (x.floor() as usize, y.floor() as usize);
        (col < self.cols && row < self.rows).then_some((col, row))
    }
}

/// Received signal strength per cell, dBm. `None` is below the receiver
/// sensitivity or outside the engine's analysis area.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRaster {
    pub grid: GridSpec,
    pub cells: Vec<Option<f32>>,
}

impl SignalRaster {
    pub fn new(grid: GridSpec, cells: Vec<Option<f32>>) -> Self {
        debug_assert_eq!(cells.len(), grid.len());
        Self { grid, cells }
    }

    pub fn filled(grid: GridSpec, value: Option<f32>) -> Self {
        Self::new(grid, vec![value; grid.len()])
    }

    pub fn get(&self, col: usize, row: usize) -> Option<f32> {
        if col >= self.grid.cols || row >= self.grid.rows {
            return None;
        }
        self.cells[row * self.grid.cols + col]
    }

    pub fn set(&mut self, col: usize, row: usize, value: Option<f32>) {
        if col < self.grid.cols && row < self.grid.rows {
            self.cells[row * self.grid.cols + col] = value;
        }
    }

    pub fn value_at(&self, latitude: f64, longitude: f64) -> Option<f32> {
        let (col, row) = self.grid.index_of(latitude, longitude)?;
        self.get(col, row)
    }

    /// Drops every value under `sensitivity_dbm`.
    pub fn apply_threshold(&mut self, sensitivity_dbm: f64) {
        for cell in &mut self.cells {
            if matches!(*cell, Some(v) if (v as f64) < sensitivity_dbm || v.is_nan()) {
                *cell = None;
            }
        }
    }

    pub fn covered_cells(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    pub fn max_signal(&self) -> Option<f32> {
        self.cells.iter().flatten().copied().reduce(f32::max)
    }
}

/// One transmitter's coverage, tagged with the tiles the engine was given.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageResult {
    pub transmitter: TransmitterKey,
    pub tiles: Vec<TileId>,
    pub raster: SignalRaster,
}
