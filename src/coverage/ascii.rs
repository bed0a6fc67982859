//! ESRI ASCII grid reading and writing.

use std::io::Write;

use thiserror::Error;

use super::{GridSpec, SignalRaster};

pub const NODATA: f32 = -9999.0;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("missing header field {0}")]
    MissingHeader(&'static str),
    #[error("invalid header field {key}: {value:?}")]
    InvalidHeader { key: String, value: String },
    #[error("invalid cell value {value:?} at index {index}")]
    InvalidValue { index: usize, value: String },
    #[error("expected {expected} cell values, found {found}")]
    CellCount { expected: usize, found: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
struct Header {
    ncols: Option<usize>,
    nrows: Option<usize>,
    x: Option<(f64, bool)>,
    y: Option<(f64, bool)>,
    cellsize: Option<f64>,
    nodata: Option<f32>,
}

fn header_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, GridError> {
    value.parse().map_err(|_| GridError::InvalidHeader {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parses an ESRI ASCII grid. Cells equal to the file's `NODATA_value` come
/// back as `None`.
pub fn parse_ascii_grid(text: &str) -> Result<SignalRaster, GridError> {
    let mut header = Header::default();
    let mut body = Vec::new();

    let mut lines = text.lines();
    for line in lines.by_ref() {
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else {
            continue;
        };
        if !key.starts_with(|c: char| c.is_ascii_alphabetic()) {
            body.push(line);
            break;
        }
        let value = parts.next().unwrap_or("");
        match key.to_ascii_lowercase().as_str() {
            "ncols" => header.ncols = Some(header_value(key, value)?),
            "nrows" => header.nrows = Some(header_value(key, value)?),
            "xllcorner" => header.x = Some((header_value(key, value)?, false)),
            "xllcenter" => header.x = Some((header_value(key, value)?, true)),
            "yllcorner" => header.y = Some((header_value(key, value)?, false)),
            "yllcenter" => header.y = Some((header_value(key, value)?, true)),
            "cellsize" => header.cellsize = Some(header_value(key, value)?),
            "nodata_value" => header.nodata = Some(header_value(key, value)?),
            _ => {
                return Err(GridError::InvalidHeader {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }
    body.extend(lines);

    let cols = header.ncols.ok_or(GridError::MissingHeader("ncols"))?;
    let rows = header.nrows.ok_or(GridError::MissingHeader("nrows"))?;
    let (x, x_center) = header.x.ok_or(GridError::MissingHeader("xllcorner"))?;
    let (y, y_center) = header.y.ok_or(GridError::MissingHeader("yllcorner"))?;
    let cell_size = header.cellsize.ok_or(GridError::MissingHeader("cellsize"))?;
    if !(cell_size.is_finite() && cell_size > 0.0) {
        return Err(GridError::InvalidHeader {
            key: "cellsize".into(),
            value: cell_size.to_string(),
        });
    }

    for (key, v) in [("xllcorner", x), ("yllcorner", y)] {
        if !v.is_finite() {
            return Err(GridError::InvalidHeader {
                key: key.into(),
                value: v.to_string(),
            });
        }
    }
    let expected = cols.checked_mul(rows).ok_or_else(|| GridError::InvalidHeader {
        key: "nrows".into(),
        value: format!("{rows} (with {cols} columns)"),
    })?;

    let west = if x_center { x - cell_size / 2.0 } else { x };
    let south = if y_center { y - cell_size / 2.0 } else { y };
    let grid = GridSpec::new(west, south + rows as f64 * cell_size, cell_size, cols, rows);

    // Sized by the body, never by the header.
    let mut cells = Vec::new();
    for token in body.iter().flat_map(|l| l.split_whitespace()) {
        let index = cells.len();
        if index == expected {
            return Err(GridError::CellCount {
                expected,
                found: body.iter().flat_map(|l| l.split_whitespace()).count(),
            });
        }
        let v: f32 = token.parse().map_err(|_| GridError::InvalidValue {
            index,
            value: token.to_string(),
        })?;
        cells.push(if Some(v) == header.nodata || v.is_nan() { None } else { Some(v) });
    }
    if cells.len() != expected {
        return Err(GridError::CellCount {
            expected,
            found: cells.len(),
        });
    }

    Ok(SignalRaster::new(grid, cells))
}

/// Writes cells row by row, north first, with `None` as `NODATA`.
pub fn write_ascii_grid<W, I>(mut w: W, grid: &GridSpec, cells: I) -> Result<(), GridError>
where
    W: Write,
    I: IntoIterator<Item = Option<f32>>,
{
    writeln!(w, "ncols {}", grid.cols)?;
    writeln!(w, "nrows {}", grid.rows)?;
    writeln!(w, "xllcorner {}", grid.west)?;
    writeln!(w, "yllcorner {}", grid.south())?;
    writeln!(w, "cellsize {}", grid.cell_size)?;
    writeln!(w, "NODATA_value {}", NODATA)?;

    let mut written = 0;
    let mut line = String::new();
    for cell in cells.into_iter().take(grid.len()) {
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(&format!("{:.2}", cell.unwrap_or(NODATA)));
        written += 1;
        if written % grid.cols.max(1) == 0 {
            writeln!(w, "{line}")?;
            line.clear();
        }
    }
    if written != grid.len() {
        return Err(GridError::CellCount {
            expected: grid.len(),
            found: written,
        });
    }
    Ok(())
}
