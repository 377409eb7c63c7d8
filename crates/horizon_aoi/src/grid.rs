//! Grid mapping between continuous positions and tower coordinates.

use crate::config::AoiConfig;
use crate::error::{AoiError, AoiResult};
use crate::types::{CellCoord, CellRange, Position};

/// Maps world positions onto a fixed grid of square towers.
#[derive(Debug, Clone, PartialEq)]
pub struct GridMapping {
    min: Position,
    max: Position,
    cell_size: f64,
    width: i32,
    height: i32,
}

impl GridMapping {
    /// Builds the mapping, rejecting inverted bounds and bad tower sizes.
    pub fn new(min: Position, max: Position, cell_size: f64) -> AoiResult<Self> {
        AoiConfig::new(min, max, cell_size).validate()?;

        let width = Self::cells_along(max.x - min.x, cell_size)?;
        let height = Self::cells_along(max.y - min.y, cell_size)?;

        Ok(Self {
            min,
            max,
            cell_size,
            width,
            height,
        })
    }

    pub fn from_config(config: &AoiConfig) -> AoiResult<Self> {
        Self::new(config.min, config.max, config.cell_size)
    }

    fn cells_along(extent: f64, cell_size: f64) -> AoiResult<i32> {
        let cells = (extent / cell_size).ceil().max(1.0);
        if cells > i32::MAX as f64 {
            return Err(AoiError::InvalidConfiguration(format!(
                "grid of {cells} towers per axis is too large"
            )));
        }
        Ok(cells as i32)
    }

    pub fn min(&self) -> Position {
        self.min
    }

    pub fn max(&self) -> Position {
        self.max
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Number of tower columns.
    pub fn width(&self) -> i32 {
        self.width
    }

    /// Number of tower rows.
    pub fn height(&self) -> i32 {
        self.height
    }

    /// Componentwise `min <= pos <= max`.
    pub fn in_bounds(&self, pos: Position) -> bool {
        pos.x >= self.min.x && pos.x <= self.max.x && pos.y >= self.min.y && pos.y <= self.max.y
    }

    /// Same as [`GridMapping::in_bounds`], as a typed failure.
    pub fn check(&self, pos: Position) -> AoiResult<()> {
        if self.in_bounds(pos) {
            Ok(())
        } else {
            Err(AoiError::InvalidPosition(pos))
        }
    }

    /// `floor((pos - min) / cell_size)` per axis.
    ///
    /// Positions on the max edge land in the last tower instead of one past it.
    pub fn to_cell(&self, pos: Position) -> CellCoord {
        let x = ((pos.x - self.min.x) / self.cell_size).floor() as i32;
        let y = ((pos.y - self.min.y) / self.cell_size).floor() as i32;
        CellCoord::new(x.clamp(0, self.width - 1), y.clamp(0, self.height - 1))
    }

    /// Footprint radius in towers for a visibility radius: `ceil(r / cell_size) - 1`,
    /// at least the watcher's own tower. `None` for non-positive radii.
    pub fn footprint_radius(&self, radius: f64) -> Option<i32> {
        if radius.is_nan() || radius <= 0.0 {
            return None;
        }
        let towers = (radius / self.cell_size).ceil() - 1.0;
        Some(towers.clamp(0.0, i32::MAX as f64) as i32)
    }

    /// Towers within Chebyshev distance `towers` of `center`, clamped to the grid.
    pub fn range_around(&self, center: CellCoord, towers: i32) -> CellRange {
        CellRange {
            min: CellCoord::new(
                center.x.saturating_sub(towers).max(0),
                center.y.saturating_sub(towers).max(0),
            ),
            max: CellCoord::new(
                center.x.saturating_add(towers).min(self.width - 1),
                center.y.saturating_add(towers).min(self.height - 1),
            ),
        }
    }

    /// Footprint a watcher with `radius` standing in `center` registers into.
    pub fn footprint(&self, center: CellCoord, radius: f64) -> Option<CellRange> {
        self.footprint_radius(radius)
            .map(|towers| self.range_around(center, towers))
    }

    /// Whether the cell addresses a tower of this grid.
    pub fn contains_cell(&self, cell: CellCoord) -> bool {
        cell.x >= 0 && cell.x < self.width && cell.y >= 0 && cell.y < self.height
    }
}
