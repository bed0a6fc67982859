use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::{BoundingBox, LatLon};

pub mod locator;

pub use locator::TileLocator;

pub const SRTM3_SIZE: usize = 1201;
pub const SRTM1_SIZE: usize = 3601;

/// Marker SRTM uses for samples with no data.
pub const HGT_VOID: i16 = -32768;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerrainError {
    #[error("{0} is not a valid SRTM tile id")]
    InvalidTileId(String),
    #[error("tile {0} is not available")]
    TileNotAvailable(TileId),
    #[error("failed to read tile {tile}: {reason}")]
    Read { tile: TileId, reason: String },
    #[error("tile {tile}: unknown HGT file size {len}")]
    UnknownSize { tile: TileId, len: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileResolution {
    /// 1 arc-second
    Srtm1,
    /// 3 arc-seconds
    Srtm3,
}

impl TileResolution {
    pub fn samples(self) -> usize {
        match self {
            TileResolution::Srtm1 => SRTM1_SIZE,
            TileResolution::Srtm3 => SRTM3_SIZE,
        }
    }

    pub fn from_samples(size: usize) -> Option<Self> {
        match size {
            SRTM1_SIZE => Some(TileResolution::Srtm1),
            SRTM3_SIZE => Some(TileResolution::Srtm3),
            _ => None,
        }
    }

    /// Half a sample spacing in degrees; SRTM cells overlap their neighbours
    /// by this much on every side.
    pub fn padding_deg(self) -> f64 {
        match self {
            TileResolution::Srtm1 => 0.5 / 3600.0,
            TileResolution::Srtm3 => 1.5 / 3600.0,
        }
    }
}

/// A 1°x1° SRTM cell, named after its south-west corner (`N38W075`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    pub lat: i32,
    pub lon: i32,
}

impl TileId {
    pub fn new(lat: i32, lon: i32) -> Self {
        Self { lat, lon }
    }

    /// Tile containing the point. Points on the north or east limit of the
    /// globe land in the last real cell.
    pub fn containing(latitude: f64, longitude: f64) -> Self {
        let lat = (latitude.floor() as i32).clamp(-90, 89);
        let lon = normalize_lon(longitude.floor() as i32);
        Self { lat, lon }
    }

    /// Reads the id off a tile file name, e.g. `S36E174.SRTMGL1.hgt.zip`.
    pub fn from_path(path: &Path) -> Result<Self, TerrainError> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let stem = name.split('.').next().unwrap_or_default();
        stem.parse()
    }

    /// The unpadded 1° cell.
    pub fn cell(&self) -> BoundingBox {
        BoundingBox::new(self.lon as f64, self.lat as f64, self.lon as f64 + 1.0, self.lat as f64 + 1.0)
    }

    /// The cell padded by half a sample on every side.
    pub fn bounds(&self, resolution: TileResolution) -> BoundingBox {
        let d = resolution.padding_deg();
        let c = self.cell();
        BoundingBox::new(c.west - d, c.south - d, c.east + d, c.north + d)
    }
}

pub(crate) fn normalize_lon(lon: i32) -> i32 {
    (lon + 180).rem_euclid(360) - 180
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:02}{}{:03}",
            if self.lat >= 0 { "N" } else { "S" },
            self.lat.abs(),
            if self.lon >= 0 { "E" } else { "W" },
            self.lon.abs()
        )
    }
}

impl FromStr for TileId {
    type Err = TerrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TerrainError::InvalidTileId(s.to_string());
        if s.len() != 7 || !s.is_ascii() {
            return Err(invalid());
        }
        let (lat_part, lon_part) = s.split_at(3);
        let digits = |p: &str| -> Result<i32, TerrainError> {
            if p.bytes().all(|b| b.is_ascii_digit()) {
                p.parse().map_err(|_| invalid())
            } else {
                Err(invalid())
            }
        };
        let lat = digits(&lat_part[1..])?;
        let lon = digits(&lon_part[1..])?;
        if lat > 90 || lon > 180 {
            return Err(invalid());
        }
        let lat = match &lat_part[..1] {
            "N" => lat,
            "S" => -lat,
            _ => return Err(invalid()),
        };
        let lon = match &lon_part[..1] {
            "E" => lon,
            "W" => -lon,
            _ => return Err(invalid()),
        };
        Ok(TileId { lat, lon })
    }
}

#[derive(Debug, Clone)]
pub struct TerrainTile {
    pub id: TileId,
    pub size: usize,
    pub data: Vec<i16>, // Row-major, north to south
}

impl TerrainTile {
    pub fn new(id: TileId, size: usize, data: Vec<i16>) -> Self {
        debug_assert_eq!(data.len(), size * size);
        Self { id, size, data }
    }

    /// Tile of constant height, mostly useful for tests.
    pub fn flat(id: TileId, resolution: TileResolution, height: i16) -> Self {
        let size = resolution.samples();
        Self::new(id, size, vec![height; size * size])
    }

    /// Decodes an HGT byte buffer, detecting SRTM1/SRTM3 from its length.
    pub fn from_hgt_bytes(id: TileId, bytes: &[u8]) -> Result<Self, TerrainError> {
        let size = match bytes.len() {
            2_884_802 => SRTM3_SIZE,
            25_934_402 => SRTM1_SIZE,
            len => return Err(TerrainError::UnknownSize { tile: id, len: len as u64 }),
        };

        let data: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_be_bytes([chunk[0], chunk[1]]))
            .collect();

        Ok(Self::new(id, size, data))
    }

    pub fn resolution(&self) -> Option<TileResolution> {
        TileResolution::from_samples(self.size)
    }

    /// Sample spacing in degrees.
    pub fn spacing_deg(&self) -> f64 {
        1.0 / (self.size - 1) as f64
    }

    #[inline(always)]
    pub fn get_height(&self, x: usize, y: usize) -> i16 {
        self.data[y * self.size + x]
    }

    /// Altitude in meters at local coordinates (0.0 to 1.0), where (0,0) is
    /// the NW corner and (1,1) the SE corner. `None` if a void sample is
    /// involved.
    pub fn sample(&self, u: f64, v: f64) -> Option<f64> {
        let max_idx = (self.size - 1) as f64;
        let x = u.clamp(0.0, 1.0) * max_idx;
        let y = v.clamp(0.0, 1.0) * max_idx;

        // Bilinear interpolation
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.size - 1);
        let y1 = (y0 + 1).min(self.size - 1);

        let tx = x - x0 as f64;
        let ty = y - y0 as f64;

        let corners = [
            self.get_height(x0, y0),
            self.get_height(x1, y0),
            self.get_height(x0, y1),
            self.get_height(x1, y1),
        ];
        if corners.contains(&HGT_VOID) {
            return None;
        }
        let [h00, h10, h01, h11] = corners.map(f64::from);

        let h0 = h00 * (1.0 - tx) + h10 * tx;
        let h1 = h01 * (1.0 - tx) + h11 * tx;

        Some(h0 * (1.0 - ty) + h1 * ty)
    }

    /// Elevation at a geographic point inside this tile.
    pub fn elevation_at(&self, latitude: f64, longitude: f64) -> Option<f64> {
        // SRTM is top-down: row 0 is the northern edge (lat + 1).
        // +180 and -180 are the same meridian, the west edge of W180.
        let u = (longitude - self.id.lon as f64 + 180.0).rem_euclid(360.0) - 180.0;
        let v = (self.id.lat as f64 + 1.0) - latitude;
        self.sample(u, v)
    }
}

/// Where tiles come from. Implementations are called from blocking threads.
pub trait TileSource: Send + Sync + 'static {
    fn load_tile(&self, id: TileId) -> Result<TerrainTile, TerrainError>;
}

/// A directory of `.hgt` files.
pub struct HgtDirectory {
    pub assets_path: PathBuf,
}

impl HgtDirectory {
    pub fn new(assets_path: impl Into<PathBuf>) -> Self {
        Self {
            assets_path: assets_path.into(),
        }
    }

    pub fn tile_path(&self, id: TileId) -> Option<PathBuf> {
        [format!("{id}.hgt"), format!("{id}.SRTMGL1.hgt")]
            .into_iter()
            .map(|name| self.assets_path.join(name))
            .find(|p| p.is_file())
    }

    /// Ids of every tile file present in the directory, sorted.
    pub fn available(&self) -> std::io::Result<Vec<TileId>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.assets_path)? {
            let path = entry?.path();
            let is_hgt = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.to_ascii_lowercase().ends_with(".hgt"));
            if !is_hgt {
                continue;
            }
            if let Ok(id) = TileId::from_path(&path) {
                ids.push(id);
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

impl TileSource for HgtDirectory {
    fn load_tile(&self, id: TileId) -> Result<TerrainTile, TerrainError> {
        let path = self.tile_path(id).ok_or(TerrainError::TileNotAvailable(id))?;
        let read_err = |e: std::io::Error| TerrainError::Read {
            tile: id,
            reason: format!("{}: {e}", path.display()),
        };

        let mut file = File::open(&path).map_err(read_err)?;
        let len = file.metadata().map_err(read_err)?.len();
        let mut buffer = Vec::with_capacity(len as usize);
        file.read_to_end(&mut buffer).map_err(read_err)?;

        TerrainTile::from_hgt_bytes(id, &buffer)
    }
}

/// Tiles held in memory.
#[derive(Default)]
pub struct MemoryTiles {
    tiles: HashMap<TileId, Arc<TerrainTile>>,
}

impl MemoryTiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tile: TerrainTile) {
        self.tiles.insert(tile.id, Arc::new(tile));
    }

    pub fn with(mut self, tile: TerrainTile) -> Self {
        self.insert(tile);
        self
    }
}

impl TileSource for MemoryTiles {
    fn load_tile(&self, id: TileId) -> Result<TerrainTile, TerrainError> {
        self.tiles
            .get(&id)
            .map(|t| TerrainTile::clone(t))
            .ok_or(TerrainError::TileNotAvailable(id))
    }
}

pub trait TerrainProvider {
    /// Terrain height in meters, `None` where no data is loaded.
    fn get_altitude(&self, loc: LatLon) -> Option<f64>;

    /// Spacing of the finest raster behind this provider, degrees.
    fn sample_spacing_deg(&self) -> Option<f64> {
        None
    }
}

/// A fixed set of loaded tiles, as handed to LOS checks and engine jobs.
#[derive(Debug, Clone, Default)]
pub struct TileSet {
    tiles: BTreeMap<TileId, Arc<TerrainTile>>,
}

impl TileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tile: Arc<TerrainTile>) {
        self.tiles.insert(tile.id, tile);
    }

    pub fn get(&self, id: &TileId) -> Option<&Arc<TerrainTile>> {
        self.tiles.get(id)
    }

    pub fn contains(&self, id: &TileId) -> bool {
        self.tiles.contains_key(id)
    }

    pub fn ids(&self) -> Vec<TileId> {
        self.tiles.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TerrainTile>> {
        self.tiles.values()
    }

    /// Finest sample spacing among the loaded tiles, degrees.
    pub fn finest_spacing_deg(&self) -> Option<f64> {
        self.tiles.values().map(|t| t.spacing_deg()).reduce(f64::min)
    }
}

impl FromIterator<Arc<TerrainTile>> for TileSet {
    fn from_iter<I: IntoIterator<Item = Arc<TerrainTile>>>(iter: I) -> Self {
        let mut set = TileSet::new();
        for tile in iter {
            set.insert(tile);
        }
        set
    }
}

impl TerrainProvider for TileSet {
    fn get_altitude(&self, loc: LatLon) -> Option<f64> {
        let id = TileId::containing(loc.latitude, loc.longitude);
        self.tiles.get(&id)?.elevation_at(loc.latitude, loc.longitude)
    }

    fn sample_spacing_deg(&self) -> Option<f64> {
        self.finest_spacing_deg()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_names() {
        assert_eq!(TileId::containing(3.64, 27.5).to_string(), "N03E027");
        assert_eq!(TileId::containing(38.9, -74.2).to_string(), "N38W075");
        assert_eq!(TileId::containing(-36.5, 174.7).to_string(), "S37E174");
        assert_eq!(TileId::containing(-0.5, -0.5).to_string(), "S01W001");
        assert_eq!(TileId::containing(90.0, 180.0), TileId::new(89, -180));
    }

    #[test]
    fn test_parse_tile_id() {
        let id: TileId = "N04W027".parse().unwrap();
        assert_eq!(id, TileId::new(4, -27));
        assert_eq!(id.to_string(), "N04W027");
        for bad in ["N4W027", "X04W027", "N04Q027", "N91W027", "N04W181", "N0aW027", ""] {
            assert!(matches!(bad.parse::<TileId>(), Err(TerrainError::InvalidTileId(_))), "{bad}");
        }
    }

    #[test]
    fn test_tile_bounds() {
        let id: TileId = "N04W027".parse().unwrap();
        assert_eq!(id.cell(), BoundingBox::new(-27.0, 4.0, -26.0, 5.0));
        let padded = id.bounds(TileResolution::Srtm3);
        let d = 1.5 / 3600.0;
        assert!((padded.west - (-27.0 - d)).abs() < 1e-12);
        assert!((padded.north - (5.0 + d)).abs() < 1e-12);
    }

    #[test]
    fn test_from_path() {
        let id = TileId::from_path(Path::new("bingo/S36E174.SRTMGL1.hgt.zip")).unwrap();
        assert_eq!(id, TileId::new(-36, 174));
        assert!(TileId::from_path(Path::new("readme.txt")).is_err());
    }

    #[test]
    fn test_sample_and_void() {
        let id = TileId::new(38, -75);
        let mut tile = TerrainTile::flat(id, TileResolution::Srtm3, 100);
        assert_eq!(tile.elevation_at(38.5, -74.5), Some(100.0));
        let size = tile.size;
        tile.data[size * 600 + 600] = HGT_VOID;
        assert_eq!(tile.sample(0.5, 0.5), None);
    }

    #[test]
    fn test_elevation_at_antimeridian() {
        // West column 10 m, east column 20 m.
        let id = TileId::containing(-16.5, 180.0);
        assert_eq!(id, TileId::new(-17, -180));
        let tile = TerrainTile::new(id, 2, vec![10, 20, 10, 20]);
        assert_eq!(tile.elevation_at(-16.5, 180.0), Some(10.0));
        assert_eq!(tile.elevation_at(-16.5, -180.0), Some(10.0));
        assert_eq!(tile.elevation_at(-16.5, -179.0), Some(20.0));
    }

    #[test]
    fn test_hgt_directory() {
        let dir = tempfile::tempdir().unwrap();
        let id = TileId::new(38, -76);
        let mut bytes = Vec::with_capacity(SRTM3_SIZE * SRTM3_SIZE * 2);
        for _ in 0..SRTM3_SIZE * SRTM3_SIZE {
            bytes.extend_from_slice(&250i16.to_be_bytes());
        }
        std::fs::write(dir.path().join("N38W076.hgt"), &bytes).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let store = HgtDirectory::new(dir.path());
        assert_eq!(store.available().unwrap(), vec![id]);
        let tile = store.load_tile(id).unwrap();
        assert_eq!(tile.size, SRTM3_SIZE);
        assert_eq!(tile.elevation_at(38.25, -75.75), Some(250.0));
        assert_eq!(
            store.load_tile(TileId::new(39, -76)).unwrap_err(),
            TerrainError::TileNotAvailable(TileId::new(39, -76))
        );
    }

    #[test]
    fn test_bad_hgt_size() {
        let id = TileId::new(1, 1);
        assert!(matches!(
            TerrainTile::from_hgt_bytes(id, &[0u8; 10]),
            Err(TerrainError::UnknownSize { len: 10, .. })
        ));
    }

    #[test]
    fn test_tile_set_lookup() {
        let set: TileSet = [Arc::new(TerrainTile::flat(TileId::new(38, -76), TileResolution::Srtm3, 42))]
            .into_iter()
            .collect();
        assert_eq!(set.get_altitude(LatLon::new(38.5, -75.5)), Some(42.0));
        assert_eq!(set.get_altitude(LatLon::new(39.5, -75.5)), None);
        assert_eq!(set.sample_spacing_deg(), Some(1.0 / 1200.0));
    }
}
