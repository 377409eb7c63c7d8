//! # Tower Shards
//!
//! A channel's towers live in one or more shards. Each shard is a full grid
//! of towers over the same map; shards partition the *residents* of a
//! channel so no single shard grows past the configured capacity, while
//! watcher footprints are registered in every shard.
//!
//! Two backings share one small contract (get-or-create a tower, iterate the
//! non-empty towers):
//!
//! - [`ShardGrid::Dense`]: pre-allocated column-major array, memory follows map
//!   area, capped at [`MAX_DENSE_TOWERS`]
//! - [`ShardGrid::Sparse`]: towers created on first use, memory follows occupancy

use crate::config::GridBacking;
use crate::error::{AoiError, AoiResult};
use crate::tower::Tower;
use crate::types::{CellCoord, ShardId};
use std::collections::{BTreeMap, HashMap};

/// Largest tower count a dense backing pre-allocates (4096 x 4096).
pub const MAX_DENSE_TOWERS: usize = 1 << 24;

/// Storage of one shard's towers.
#[derive(Debug)]
pub enum ShardGrid {
    Dense {
        width: i32,
        height: i32,
        towers: Vec<Tower>,
    },
    Sparse(HashMap<CellCoord, Tower>),
}

impl ShardGrid {
    pub fn new(backing: GridBacking, width: i32, height: i32) -> AoiResult<Self> {
        match backing {
            GridBacking::Dense => Self::dense(width, height),
            GridBacking::Sparse => Ok(Self::sparse()),
        }
    }

    /// Pre-allocates every tower of a `width` x `height` grid.
    ///
    /// Grids above [`MAX_DENSE_TOWERS`] are refused; use the sparse backing
    /// for those maps.
    pub fn dense(width: i32, height: i32) -> AoiResult<Self> {
        let cells = (width.max(0) as usize)
            .checked_mul(height.max(0) as usize)
            .filter(|cells| *cells <= MAX_DENSE_TOWERS)
            .ok_or_else(|| {
                AoiError::InvalidConfiguration(format!(
                    "dense grid of {width}x{height} towers exceeds {MAX_DENSE_TOWERS} towers"
                ))
            })?;
        let mut towers = Vec::new();
        towers.try_reserve_exact(cells).map_err(|e| {
            AoiError::InvalidConfiguration(format!(
                "cannot allocate {width}x{height} dense towers: {e}"
            ))
        })?;
        towers.resize_with(cells, Tower::new);
        Ok(Self::Dense {
            width,
            height,
            towers,
        })
    }

    pub fn sparse() -> Self {
        Self::Sparse(HashMap::new())
    }

    pub fn backing(&self) -> GridBacking {
        match self {
            Self::Dense { .. } => GridBacking::Dense,
            Self::Sparse(_) => GridBacking::Sparse,
        }
    }

    fn dense_index(width: i32, height: i32, cell: CellCoord) -> Option<usize> {
        if cell.x < 0 || cell.y < 0 || cell.x >= width || cell.y >= height {
            return None;
        }
        Some(cell.x as usize * height as usize + cell.y as usize)
    }

    /// Tower at `cell`, if the backing holds one.
    pub fn tower(&self, cell: CellCoord) -> Option<&Tower> {
        match self {
            Self::Dense {
                width,
                height,
                towers,
            } => Self::dense_index(*width, *height, cell).and_then(|index| towers.get(index)),
            Self::Sparse(towers) => towers.get(&cell),
        }
    }

    /// Tower at `cell`, creating it in a sparse backing.
    ///
    /// `None` only for coordinates outside a dense grid; callers map positions
    /// through the channel's `GridMapping`, which never produces those.
    pub fn tower_mut(&mut self, cell: CellCoord) -> Option<&mut Tower> {
        match self {
            Self::Dense {
                width,
                height,
                towers,
            } => Self::dense_index(*width, *height, cell).and_then(|index| towers.get_mut(index)),
            Self::Sparse(towers) => Some(towers.entry(cell).or_default()),
        }
    }

    /// Drops the tower at `cell` from a sparse backing once it holds nothing.
    pub fn release(&mut self, cell: CellCoord) {
        if let Self::Sparse(towers) = self {
            if towers.get(&cell).is_some_and(|tower| tower.is_empty()) {
                towers.remove(&cell);
            }
        }
    }

    /// Number of towers the backing currently stores, empty ones included.
    pub fn stored(&self) -> usize {
        match self {
            Self::Dense { towers, .. } => towers.len(),
            Self::Sparse(towers) => towers.len(),
        }
    }

    /// Every tower holding at least one resident or watcher.
    pub fn occupied(&self) -> Vec<(CellCoord, &Tower)> {
        match self {
            Self::Dense { height, towers, .. } => towers
                .iter()
                .enumerate()
                .filter(|(_, tower)| !tower.is_empty())
                .map(|(index, tower)| {
                    let height = (*height).max(1) as usize;
                    let cell = CellCoord::new((index / height) as i32, (index % height) as i32);
                    (cell, tower)
                })
                .collect(),
            Self::Sparse(towers) => towers
                .iter()
                .filter(|(_, tower)| !tower.is_empty())
                .map(|(cell, tower)| (*cell, tower))
                .collect(),
        }
    }

    /// Drains every non-empty tower, leaving the grid empty.
    pub(crate) fn drain_occupied(&mut self) -> Vec<(CellCoord, Tower)> {
        match self {
            Self::Dense { height, towers, .. } => {
                let height = (*height).max(1) as usize;
                towers
                    .iter_mut()
                    .enumerate()
                    .filter(|(_, tower)| !tower.is_empty())
                    .map(|(index, tower)| {
                        let cell = CellCoord::new((index / height) as i32, (index % height) as i32);
                        (cell, std::mem::take(tower))
                    })
                    .collect()
            }
            Self::Sparse(towers) => towers
                .drain()
                .filter(|(_, tower)| !tower.is_empty())
                .collect(),
        }
    }

    /// Total residents over all towers.
    pub fn population(&self) -> usize {
        self.occupied().iter().map(|(_, tower)| tower.len()).sum()
    }
}

/// Picks the shard that should receive the next resident.
///
/// Given every shard's live resident count, returns the least-loaded shard
/// id and its count. Implementations must return an id present in `loads`;
/// `loads` is never empty.
pub trait LoadBalance: Send + Sync {
    fn least_loaded(&self, loads: &BTreeMap<ShardId, usize>) -> (ShardId, usize);
}

/// Default strategy: minimum count, ties go to the lowest shard id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastLoaded;

impl LoadBalance for LeastLoaded {
    fn least_loaded(&self, loads: &BTreeMap<ShardId, usize>) -> (ShardId, usize) {
        loads
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
            .map(|(id, load)| (*id, *load))
            .unwrap_or((crate::engine::PRIMARY_SHARD, 0))
    }
}
