//! # Core Type Definitions
//!
//! Identifiers and geometric primitives shared by every part of the AOI
//! engine.
//!
//! ## Key Types
//!
//! - [`EntityId`] - Stable identifier of a tracked entity
//! - [`GroupId`] - Identifier handed out by group creation
//! - [`Position`] - Continuous 2D world coordinate
//! - [`CellCoord`] / [`CellRange`] - Integer tower coordinates
//! - [`LayerMask`] - Channel membership bitmask

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an entity tracked by an AOI engine.
///
/// Wraps a UUID so entity ids cannot be confused with group or shard ids.
///
/// # Examples
///
/// ```rust
/// use horizon_aoi::EntityId;
///
/// let random = EntityId::new();
/// let fixed = EntityId::from_u128(42);
/// assert_ne!(random, fixed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Creates a new random entity ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic entity ID, handy for fixtures and replays.
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Parses an entity ID from its string representation.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::str::FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a manual visibility group. Generated by the engine, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Identifier of a tower shard inside one channel. Shard `1` is the primary shard.
pub type ShardId = u32;

/// Index of an interest channel (bit position inside a [`LayerMask`]).
pub type LayerIndex = u8;

// ============================================================================
// Geometry
// ============================================================================

/// A continuous 2D position in the game world.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Creates a new position.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Whether both components are finite numbers.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Integer coordinates of a tower inside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
}

impl CellCoord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chebyshev distance between two cells.
    pub fn chebyshev(&self, other: CellCoord) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }
}

/// Inclusive rectangle of tower coordinates, already clamped to the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRange {
    pub min: CellCoord,
    pub max: CellCoord,
}

impl CellRange {
    /// Whether the cell lies inside the range.
    pub fn contains(&self, cell: CellCoord) -> bool {
        cell.x >= self.min.x && cell.x <= self.max.x && cell.y >= self.min.y && cell.y <= self.max.y
    }

    /// Number of cells covered by the range.
    pub fn len(&self) -> usize {
        let width = (self.max.x - self.min.x + 1).max(0) as usize;
        let height = (self.max.y - self.min.y + 1).max(0) as usize;
        width * height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates every cell of the range, column by column.
    pub fn cells(&self) -> impl Iterator<Item = CellCoord> {
        let (min, max) = (self.min, self.max);
        (min.x..=max.x).flat_map(move |x| (min.y..=max.y).map(move |y| CellCoord::new(x, y)))
    }
}

// ============================================================================
// Channels
// ============================================================================

/// Bitmask of interest channels an entity or watcher belongs to.
///
/// Bit `n` selects layer `n`; iteration yields the set bits from lowest to
/// highest by repeatedly extracting and clearing the lowest set bit.
///
/// ```rust
/// use horizon_aoi::LayerMask;
///
/// let mask = LayerMask::from_layers([0, 3, 5]);
/// assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 3, 5]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LayerMask(pub u64);

impl LayerMask {
    pub const NONE: LayerMask = LayerMask(0);

    /// Mask containing a single layer. Indices past 63 select nothing.
    pub const fn single(layer: LayerIndex) -> Self {
        Self(Self::bit(layer))
    }

    /// Mask containing every given layer, skipping indices past 63.
    pub fn from_layers(layers: impl IntoIterator<Item = LayerIndex>) -> Self {
        Self(layers.into_iter().fold(0u64, |bits, layer| bits | Self::bit(layer)))
    }

    const fn bit(layer: LayerIndex) -> u64 {
        if layer < 64 {
            1u64 << layer
        } else {
            0
        }
    }

    pub fn contains(&self, layer: LayerIndex) -> bool {
        self.0 & Self::bit(layer) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn with(self, layer: LayerIndex) -> Self {
        Self(self.0 | Self::bit(layer))
    }

    /// Iterates the selected layer indices in ascending order.
    pub fn iter(&self) -> LayerBits {
        LayerBits(self.0)
    }
}

impl IntoIterator for LayerMask {
    type Item = LayerIndex;
    type IntoIter = LayerBits;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the set bits of a [`LayerMask`].
#[derive(Debug, Clone)]
pub struct LayerBits(u64);

impl Iterator for LayerBits {
    type Item = LayerIndex;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0 == 0 {
            return None;
        }
        let layer = self.0.trailing_zeros() as LayerIndex;
        // clear lowest set bit
        self.0 &= self.0 - 1;
        Some(layer)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_mask_iterates_lowest_bit_first() {
        let mask = LayerMask(0b1010_0101);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 2, 5, 7]);
        assert_eq!(mask.iter().size_hint(), (4, Some(4)));
        assert!(LayerMask::NONE.iter().next().is_none());
    }

    #[test]
    fn test_layer_mask_high_bit() {
        let mask = LayerMask::single(63).with(1);
        assert!(mask.contains(63));
        assert!(mask.contains(1));
        assert!(!mask.contains(2));
        assert!(!mask.contains(64));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![1, 63]);
    }

    #[test]
    fn test_layer_mask_ignores_out_of_range_indices() {
        assert_eq!(LayerMask::single(64), LayerMask::NONE);
        assert_eq!(LayerMask::single(200), LayerMask::NONE);
        assert_eq!(LayerMask::single(2).with(64), LayerMask::single(2));
        assert_eq!(LayerMask::from_layers([0, 64, 255, 5]), LayerMask::from_layers([0, 5]));
    }

    #[test]
    fn test_cell_range_cells() {
        let range = CellRange {
            min: CellCoord::new(0, 0),
            max: CellCoord::new(1, 2),
        };
        assert_eq!(range.len(), 6);
        assert_eq!(range.cells().count(), 6);
        assert!(range.contains(CellCoord::new(1, 2)));
        assert!(!range.contains(CellCoord::new(2, 2)));
    }

    #[test]
    fn test_entity_id_round_trips_through_string() {
        let id = EntityId::from_u128(7);
        let parsed: EntityId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
