//! # Horizon AOI
//!
//! Area-of-interest management for the Horizon game server: given a large,
//! constantly moving population of entities and a smaller population of
//! watchers with individual visibility radii, it answers "who perceives this
//! entity" and delivers deduplicated enter/leave notifications without
//! scanning the whole population on every update.
//!
//! ## Core Features
//!
//! - **Tower grid**: the map is cut into square towers; watchers register into
//!   the towers their radius covers, residents live in exactly one tower
//! - **Net notifications**: each engine operation delivers at most one
//!   batch-enter and one batch-leave per affected watcher, even when an
//!   entity is reachable through several towers at once
//! - **Global markers**: entities visible to every watcher regardless of position
//! - **Groups**: position-independent visibility among a set of members
//! - **Layers**: independent interest channels selected per entity by a bitmask
//! - **Dynamic sharding**: a layer's residents are spread over shards bounded
//!   by a capacity, split on insert and merged back on a throttled cadence
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use horizon_aoi::*;
//!
//! let mut aoi = TowerAoi::new(AoiConfig::new(
//!     Position::new(0.0, 0.0),
//!     Position::new(10.0, 10.0),
//!     1.0,
//! ))?;
//!
//! aoi.add_to_aoi(player.clone())?;          // player is a Watcher with radius 2
//! aoi.add_to_aoi(monster.clone())?;         // player.on_batch_enter([monster])
//!
//! aoi.traversal(monster.as_ref(), |watcher| {
//!     println!("{} sees the monster", watcher.id());
//!     true
//! });
//! ```
//!
//! ## Threading
//!
//! Engines are plain single-owner values: every operation takes `&mut self`
//! and runs its callbacks synchronously before returning. Wrap an engine in a
//! lock to share it; callbacks must not re-enter the engine that invoked them.

pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod grid;
pub mod layer;
pub mod shard;
pub mod tower;
pub mod types;
pub mod watcher;

#[cfg(test)]
mod tests;

pub use config::{AoiConfig, GridBacking, InvariantMode, LayerAoiConfig, LayerSettings};
pub use engine::{AoiStats, TowerAoi, PRIMARY_SHARD};
pub use entity::{Channel, Entity, EntityRef, Watcher};
pub use error::{AoiError, AoiResult, ConfigError, ConfigResult};
pub use grid::GridMapping;
pub use layer::LayerAoi;
pub use shard::{LeastLoaded, LoadBalance, ShardGrid};
pub use tower::Tower;
pub use types::{CellCoord, CellRange, EntityId, GroupId, LayerIndex, LayerMask, Position, ShardId};
pub use watcher::{FlushReport, WatcherDiff, WatcherRegistry};
