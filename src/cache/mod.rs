//! Run-scoped terrain tile store.
//!
//! Each tile id maps to a `OnceCell` holding the outcome of its load. The
//! first caller for an id runs the load on a blocking thread; concurrent
//! callers for the same id wait on the same cell, so a tile is read from the
//! source at most once while its entry stays cached. Failed loads are kept
//! too, so a missing tile is probed once per run.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::terrain::{TerrainError, TerrainTile, TileId, TileSet, TileSource};

type TileSlot = Arc<OnceCell<Result<Arc<TerrainTile>, TerrainError>>>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub requests: u64,
    pub loads: u64,
    pub failures: u64,
}

pub struct TerrainStore<S> {
    source: Arc<S>,
    slots: Mutex<LruCache<TileId, TileSlot>>,
    requests: AtomicU64,
    loads: AtomicU64,
    failures: AtomicU64,
}

impl<S: TileSource> TerrainStore<S> {
    /// Store that keeps every tile for the life of the run.
    pub fn new(source: S) -> Self {
        Self::with_cache(source, LruCache::unbounded())
    }

    /// Store that evicts least recently used tiles past `capacity`. An
    /// evicted tile is loaded again on its next request.
    pub fn with_capacity(source: S, capacity: NonZeroUsize) -> Self {
        Self::with_cache(source, LruCache::new(capacity))
    }

    fn with_cache(source: S, cache: LruCache<TileId, TileSlot>) -> Self {
        Self {
            source: Arc::new(source),
            slots: Mutex::new(cache),
            requests: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn get_tile(&self, id: TileId) -> Result<Arc<TerrainTile>, TerrainError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let slot = {
            let mut slots = self.slots.lock();
            slots.get_or_insert(id, || Arc::new(OnceCell::new())).clone()
        };

        slot.get_or_init(|| self.load(id)).await.clone()
    }

    async fn load(&self, id: TileId) -> Result<Arc<TerrainTile>, TerrainError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let source = Arc::clone(&self.source);
        let result = match tokio::task::spawn_blocking(move || source.load_tile(id)).await {
            Ok(res) => res.map(Arc::new),
            Err(e) => Err(TerrainError::Read {
                tile: id,
                reason: format!("loader task failed: {e}"),
            }),
        };
        match &result {
            Ok(tile) => debug!(tile = %id, size = tile.size, "Loaded terrain tile"),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(tile = %id, error = %e, "Terrain tile unavailable");
            }
        }
        result
    }

    /// Fetches every tile; fails on the first one that cannot be loaded.
    pub async fn get_all(&self, ids: &[TileId]) -> Result<TileSet, TerrainError> {
        let mut set = TileSet::new();
        for &id in ids {
            set.insert(self.get_tile(id).await?);
        }
        Ok(set)
    }

    /// Fetches what it can, returning the loaded tiles and the ids that
    /// could not be loaded.
    pub async fn get_available(&self, ids: &[TileId]) -> (TileSet, Vec<TileId>) {
        let mut set = TileSet::new();
        let mut missing = Vec::new();
        for &id in ids {
            match self.get_tile(id).await {
                Ok(tile) => set.insert(tile),
                Err(_) => missing.push(id),
            }
        }
        (set, missing)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            requests: self.requests.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
