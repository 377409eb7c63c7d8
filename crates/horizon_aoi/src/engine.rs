//! # Tower AOI Engine
//!
//! Grid-partitioned interest management for one channel.
//!
//! ## Structure
//!
//! - The map is cut into square towers ([`GridMapping`]); every tracked entity
//!   resides in exactly one tower, or in the global tower once marked global.
//! - A watcher registers into every tower of its footprint: the towers within
//!   Chebyshev distance `ceil(radius / cell_size) - 1` of its own tower.
//! - Groups are position-independent towers; every member is both resident
//!   and, if it is a watcher, observer of the group.
//! - Residents may be spread over several shards (see [`crate::shard`]) when a
//!   shard capacity is configured. Footprints are registered in every shard,
//!   so which shard holds a resident never changes who perceives it.
//!
//! ## Notifications
//!
//! Tower membership changes only adjust reference counts in each watcher's
//! diff. Every public mutation ends with one flush that delivers the net
//! batch-enter and batch-leave to each affected watcher (see
//! [`crate::watcher`]).

use crate::config::{AoiConfig, GridBacking, InvariantMode, LayerSettings};
use crate::entity::{Channel, Entity, EntityRef, Watcher};
use crate::error::{AoiError, AoiResult};
use crate::grid::GridMapping;
use crate::shard::{LoadBalance, ShardGrid};
use crate::tower::Tower;
use crate::types::{CellCoord, CellRange, EntityId, GroupId, ShardId};
use crate::watcher::WatcherRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Id of the shard every channel starts with. It is never merged away.
pub const PRIMARY_SHARD: ShardId = 1;

/// Where an entity's resident entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    Grid { shard: ShardId, cell: CellCoord },
    Global,
}

/// Per-entity bookkeeping, owned by the engine.
struct CacheEntry {
    entity: EntityRef,
    /// Cell of the last accepted position
    cell: CellCoord,
    residency: Residency,
    /// Towers the watcher is registered in, in every shard
    footprint: Option<CellRange>,
    watcher: bool,
    groups: Vec<GroupId>,
}

struct Sharding {
    capacity: usize,
    balancer: Box<dyn LoadBalance>,
    interval: Duration,
    last_rebalance: Instant,
}

/// Snapshot of an engine's bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoiStats {
    /// Tracked entities, watchers included
    pub entities: usize,
    pub watchers: usize,
    pub global_entities: usize,
    pub groups: usize,
    pub shards: usize,
    /// Towers holding a resident or a watcher registration, over all shards
    pub occupied_towers: usize,
    /// Towers held in memory, empty dense towers included
    pub stored_towers: usize,
}

/// Tower-based AOI engine for a single channel.
///
/// # Examples
///
/// ```rust,ignore
/// use horizon_aoi::{AoiConfig, Position, TowerAoi};
///
/// let mut aoi = TowerAoi::new(AoiConfig::new(
///     Position::new(0.0, 0.0),
///     Position::new(10.0, 10.0),
///     1.0,
/// ))?;
/// aoi.add_to_aoi(watcher.clone())?;   // batch-enter of everything in range
/// aoi.add_to_aoi(monster.clone())?;   // watcher gets batch-enter([monster])
/// monster.set_position(Position::new(5.0, 5.0));
/// aoi.move_entity(monster.as_ref())?; // watcher gets batch-leave([monster])
/// ```
pub struct TowerAoi {
    grid: GridMapping,
    backing: GridBacking,
    shards: BTreeMap<ShardId, ShardGrid>,
    loads: BTreeMap<ShardId, usize>,
    last_shard: ShardId,
    sharding: Option<Sharding>,
    entities: HashMap<EntityId, CacheEntry>,
    registry: WatcherRegistry,
    global: Tower,
    groups: HashMap<GroupId, Tower>,
    group_seed: u64,
}

impl TowerAoi {
    /// Creates a standalone single-channel engine.
    pub fn new(config: AoiConfig) -> AoiResult<Self> {
        Self::build(&config, Channel::Single, None)
    }

    /// Creates the engine of one layer of a layered engine.
    ///
    /// Sharding is enabled when the settings carry a shard capacity; the
    /// balancer then decides which shard receives each new resident.
    pub fn for_layer(settings: &LayerSettings, balancer: Box<dyn LoadBalance>) -> AoiResult<Self> {
        settings.validate()?;
        let sharding = settings.shard_capacity.map(|capacity| Sharding {
            capacity,
            balancer,
            interval: settings.rebalance_interval(),
            last_rebalance: Instant::now(),
        });
        Self::build(&settings.grid, Channel::Layer(settings.index), sharding)
    }

    fn build(config: &AoiConfig, channel: Channel, sharding: Option<Sharding>) -> AoiResult<Self> {
        config.validate()?;
        let grid = GridMapping::from_config(config)?;

        let mut shards = BTreeMap::new();
        shards.insert(
            PRIMARY_SHARD,
            ShardGrid::new(config.backing, grid.width(), grid.height())?,
        );

        debug!(
            "Created tower AOI on {} channel: {}x{} towers of size {}",
            channel,
            grid.width(),
            grid.height(),
            grid.cell_size()
        );

        Ok(Self {
            grid,
            backing: config.backing,
            shards,
            loads: BTreeMap::from([(PRIMARY_SHARD, 0)]),
            last_shard: PRIMARY_SHARD,
            sharding,
            entities: HashMap::new(),
            registry: WatcherRegistry::new(channel, config.invariant_mode),
            global: Tower::new(),
            groups: HashMap::new(),
            group_seed: 0,
        })
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Starts tracking an entity at its current position.
    ///
    /// A watcher is registered in the global tower and in every tower of its
    /// footprint, and receives its initial view in this operation's flush.
    pub fn add_to_aoi(&mut self, entity: EntityRef) -> AoiResult<()> {
        let id = entity.id();
        if id.0.is_nil() {
            return Err(AoiError::InvalidEntity("nil entity id".to_string()));
        }
        if self.entities.contains_key(&id) {
            return Err(AoiError::AlreadyTracked(id));
        }
        let position = entity.position();
        self.grid.check(position)?;

        let cell = self.grid.to_cell(position);
        let shard = self.place_resident();
        let channel = self.registry.channel();
        let footprint = entity
            .as_watcher()
            .and_then(|watcher| self.grid.footprint(cell, channel.radius_of(watcher)));
        let is_watcher = entity.as_watcher().is_some();

        if is_watcher && !self.registry.insert(entity.clone()) {
            self.registry
                .anomaly(format!("untracked watcher {id} already had a diff"));
        }

        tower_at(&mut self.shards, shard, cell)?.add(entity.clone(), &mut self.registry)?;
        *self.loads.entry(shard).or_default() += 1;

        if is_watcher {
            if let Some(range) = footprint {
                for grid in self.shards.values_mut() {
                    register_range(grid, &mut self.registry, id, range);
                }
            }
            self.global.add_watcher(id, &mut self.registry)?;
        }

        self.entities.insert(
            id,
            CacheEntry {
                entity,
                cell,
                residency: Residency::Grid { shard, cell },
                footprint,
                watcher: is_watcher,
                groups: Vec::new(),
            },
        );

        debug!(
            "AOI {}: added {} at {:?} (shard {}, watcher: {})",
            channel, id, cell, shard, is_watcher
        );
        self.registry.flush()
    }

    /// Stops tracking an entity.
    ///
    /// The entity leaves every group, tower and footprint it was part of. A
    /// removed watcher receives its final batch-leave in this operation's
    /// flush and nothing afterwards.
    pub fn remove_from_aoi(&mut self, entity: &dyn Entity) -> AoiResult<()> {
        let id = entity.id();
        let entry = self.entities.remove(&id).ok_or(AoiError::NotTracked(id))?;

        for group_id in &entry.groups {
            let emptied = match self.groups.get_mut(group_id) {
                Some(group) => {
                    if let Err(e) = group.remove(id, &mut self.registry) {
                        self.registry
                            .anomaly(format!("{id} missing from its {group_id}: {e}"));
                    }
                    if entry.watcher {
                        if let Err(e) = group.remove_watcher(id, &mut self.registry) {
                            self.registry
                                .anomaly(format!("watcher {id} missing from its {group_id}: {e}"));
                        }
                    }
                    group.is_empty()
                }
                None => {
                    self.registry
                        .anomaly(format!("{id} references vanished {group_id}"));
                    false
                }
            };
            if emptied {
                self.groups.remove(group_id);
            }
        }

        match entry.residency {
            Residency::Global => {
                if let Err(e) = self.global.remove(id, &mut self.registry) {
                    self.registry
                        .anomaly(format!("global entity {id} missing from global tower: {e}"));
                }
            }
            Residency::Grid { shard, cell } => {
                take_resident(&mut self.shards, &mut self.registry, shard, cell, id)?;
                self.release_load(shard);
            }
        }

        if entry.watcher {
            if let Some(range) = entry.footprint {
                for grid in self.shards.values_mut() {
                    unregister_range(grid, &mut self.registry, id, range);
                }
            }
            if let Err(e) = self.global.remove_watcher(id, &mut self.registry) {
                self.registry
                    .anomaly(format!("watcher {id} missing from global tower: {e}"));
            }
        }

        debug!("AOI {}: removed {}", self.registry.channel(), id);

        let flushed = self.registry.flush();
        if entry.watcher {
            self.registry.remove(id);
        }
        flushed
    }

    /// Re-reads an entity's position and updates its tower membership.
    ///
    /// Nothing changes while the entity stays in the same tower. Global
    /// entities only record the new position. A watcher's footprint is
    /// unregistered and registered again in full around its new tower.
    ///
    /// On a sharded channel this is also where the throttled shard merge
    /// pass runs.
    pub fn move_entity(&mut self, entity: &dyn Entity) -> AoiResult<()> {
        let id = entity.id();
        if !self.entities.contains_key(&id) {
            return Err(AoiError::NotTracked(id));
        }
        let position = entity.position();
        self.grid.check(position)?;

        self.maybe_rebalance();

        let new_cell = self.grid.to_cell(position);
        let (residency, footprint, is_watcher, tracked) = match self.entities.get_mut(&id) {
            Some(entry) => {
                if entry.cell == new_cell {
                    return self.registry.flush();
                }
                entry.cell = new_cell;
                (entry.residency, entry.footprint, entry.watcher, entry.entity.clone())
            }
            None => return Err(AoiError::NotTracked(id)),
        };

        let Residency::Grid {
            shard,
            cell: old_cell,
        } = residency
        else {
            trace!("AOI: global entity {} moved to {:?}", id, new_cell);
            return self.registry.flush();
        };

        let target = self.relocation_target(shard);
        let resident = take_resident(&mut self.shards, &mut self.registry, shard, old_cell, id)?;
        tower_at(&mut self.shards, target, new_cell)?.add(resident, &mut self.registry)?;
        if target != shard {
            self.release_load(shard);
            *self.loads.entry(target).or_default() += 1;
        }

        let mut new_footprint = footprint;
        if is_watcher {
            let channel = self.registry.channel();
            new_footprint = tracked
                .as_watcher()
                .and_then(|watcher| self.grid.footprint(new_cell, channel.radius_of(watcher)));
            if let Some(range) = footprint {
                for grid in self.shards.values_mut() {
                    unregister_range(grid, &mut self.registry, id, range);
                }
            }
            if let Some(range) = new_footprint {
                for grid in self.shards.values_mut() {
                    register_range(grid, &mut self.registry, id, range);
                }
            }
        }

        if let Some(entry) = self.entities.get_mut(&id) {
            entry.residency = Residency::Grid {
                shard: target,
                cell: new_cell,
            };
            entry.footprint = new_footprint;
        }

        trace!(
            "AOI: moved {} from {:?} to {:?} (shard {} -> {})",
            id,
            old_cell,
            new_cell,
            shard,
            target
        );
        self.registry.flush()
    }

    // ========================================================================
    // Global markers
    // ========================================================================

    /// Makes a tracked entity visible to every watcher regardless of position.
    ///
    /// A global watcher keeps its footprint where it was registered until the
    /// marker is removed again.
    pub fn add_global_marker(&mut self, entity: &dyn Entity) -> AoiResult<()> {
        let id = entity.id();
        let entry = self.entities.get(&id).ok_or(AoiError::NotTracked(id))?;
        let Residency::Grid { shard, cell } = entry.residency else {
            return Err(AoiError::AlreadyTracked(id));
        };

        let resident = take_resident(&mut self.shards, &mut self.registry, shard, cell, id)?;
        self.global.add(resident, &mut self.registry)?;
        self.release_load(shard);
        if let Some(entry) = self.entities.get_mut(&id) {
            entry.residency = Residency::Global;
        }

        debug!("AOI {}: {} marked global", self.registry.channel(), id);
        self.registry.flush()
    }

    /// Puts a global entity back into the tower of its current position.
    pub fn remove_global_marker(&mut self, entity: &dyn Entity) -> AoiResult<()> {
        let id = entity.id();
        let entry = self.entities.get(&id).ok_or(AoiError::NotTracked(id))?;
        if entry.residency != Residency::Global {
            return Err(AoiError::NotTracked(id));
        }
        let position = entity.position();
        self.grid.check(position)?;

        let (footprint, is_watcher) = (entry.footprint, entry.watcher);
        let cell = self.grid.to_cell(position);
        let shard = self.place_resident();

        let resident = self.global.remove(id, &mut self.registry)?;
        tower_at(&mut self.shards, shard, cell)?.add(resident.clone(), &mut self.registry)?;
        *self.loads.entry(shard).or_default() += 1;

        let mut new_footprint = footprint;
        if is_watcher {
            let channel = self.registry.channel();
            new_footprint = resident
                .as_watcher()
                .and_then(|watcher| self.grid.footprint(cell, channel.radius_of(watcher)));
            if new_footprint != footprint {
                if let Some(range) = footprint {
                    for grid in self.shards.values_mut() {
                        unregister_range(grid, &mut self.registry, id, range);
                    }
                }
                if let Some(range) = new_footprint {
                    for grid in self.shards.values_mut() {
                        register_range(grid, &mut self.registry, id, range);
                    }
                }
            }
        }

        if let Some(entry) = self.entities.get_mut(&id) {
            entry.cell = cell;
            entry.residency = Residency::Grid { shard, cell };
            entry.footprint = new_footprint;
        }

        debug!("AOI {}: {} back on the grid at {:?}", self.registry.channel(), id, cell);
        self.registry.flush()
    }

    // ========================================================================
    // Groups
    // ========================================================================

    /// Creates a group from tracked entities. Members perceive each other
    /// regardless of position.
    pub fn create_group(&mut self, members: &[&dyn Entity]) -> AoiResult<GroupId> {
        if members.is_empty() {
            return Err(AoiError::InvalidEntity(
                "a group needs at least one member".to_string(),
            ));
        }
        for member in members {
            let id = member.id();
            if !self.entities.contains_key(&id) {
                return Err(AoiError::NotTracked(id));
            }
        }

        self.group_seed += 1;
        let group_id = GroupId(self.group_seed);
        let mut group = Tower::new();

        for member in members {
            let id = member.id();
            let Some(entry) = self.entities.get_mut(&id) else {
                continue;
            };
            if group.contains(id) {
                continue;
            }
            group.add(entry.entity.clone(), &mut self.registry)?;
            if entry.watcher {
                group.add_watcher(id, &mut self.registry)?;
            }
            entry.groups.push(group_id);
        }
        self.groups.insert(group_id, group);

        debug!(
            "AOI {}: created {} with {} members",
            self.registry.channel(),
            group_id,
            members.len()
        );
        self.registry.flush()?;
        Ok(group_id)
    }

    /// Dissolves a group; members stop perceiving each other through it.
    pub fn destroy_group(&mut self, group_id: GroupId) -> AoiResult<()> {
        let mut group = self
            .groups
            .remove(&group_id)
            .ok_or(AoiError::GroupNotFound(group_id))?;

        for member in group.entities() {
            if let Some(entry) = self.entities.get_mut(&member.id()) {
                entry.groups.retain(|id| *id != group_id);
            }
        }
        group.clear(&mut self.registry);

        debug!("AOI {}: destroyed {}", self.registry.channel(), group_id);
        self.registry.flush()
    }

    /// Adds a tracked entity to an existing group. Adding a member twice is a no-op.
    pub fn add_to_group(&mut self, entity: &dyn Entity, group_id: GroupId) -> AoiResult<()> {
        let id = entity.id();
        let entry = self.entities.get_mut(&id).ok_or(AoiError::NotTracked(id))?;
        let group = self
            .groups
            .get_mut(&group_id)
            .ok_or(AoiError::GroupNotFound(group_id))?;

        if group.contains(id) {
            return Ok(());
        }
        group.add(entry.entity.clone(), &mut self.registry)?;
        if entry.watcher {
            group.add_watcher(id, &mut self.registry)?;
        }
        entry.groups.push(group_id);

        self.registry.flush()
    }

    /// Removes an entity from a group. The group is dissolved once empty.
    pub fn remove_from_group(&mut self, entity: &dyn Entity, group_id: GroupId) -> AoiResult<()> {
        let id = entity.id();
        let entry = self.entities.get_mut(&id).ok_or(AoiError::NotTracked(id))?;
        let group = self
            .groups
            .get_mut(&group_id)
            .ok_or(AoiError::GroupNotFound(group_id))?;

        if !group.contains(id) {
            return Ok(());
        }
        group.remove(id, &mut self.registry)?;
        if entry.watcher {
            group.remove_watcher(id, &mut self.registry)?;
        }
        entry.groups.retain(|g| *g != group_id);

        if group.is_empty() {
            self.groups.remove(&group_id);
            debug!("AOI {}: {} dissolved", self.registry.channel(), group_id);
        }

        self.registry.flush()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Calls `visit` once for every watcher currently able to perceive the
    /// entity, through its tower or any group it belongs to. Stops as soon as
    /// `visit` returns `false`. Untracked entities visit nothing.
    pub fn traversal<F>(&self, entity: &dyn Entity, mut visit: F)
    where
        F: FnMut(&dyn Watcher) -> bool,
    {
        let id = entity.id();
        let Some(entry) = self.entities.get(&id) else {
            trace!("AOI: traversal of untracked {}", id);
            return;
        };

        let (shard, cell) = match entry.residency {
            Residency::Global => {
                self.visit_watchers(self.global.watchers(), &mut visit);
                return;
            }
            Residency::Grid { shard, cell } => (shard, cell),
        };

        let mut called = HashSet::new();
        for group_id in &entry.groups {
            let Some(group) = self.groups.get(group_id) else {
                continue;
            };
            let fresh = group.watchers().filter(|w| called.insert(*w)).collect::<Vec<_>>();
            if !self.visit_watchers(fresh.into_iter(), &mut visit) {
                return;
            }
        }

        if let Some(tower) = self.shards.get(&shard).and_then(|grid| grid.tower(cell)) {
            self.visit_watchers(tower.watchers().filter(|w| !called.contains(w)), &mut visit);
        }
    }

    /// Calls `visit` for every watcher of a group the entity belongs to.
    pub fn traversal_group<F>(&self, entity: &dyn Entity, group_id: GroupId, mut visit: F)
    where
        F: FnMut(&dyn Watcher) -> bool,
    {
        let id = entity.id();
        if !self.entities.contains_key(&id) {
            return;
        }
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        if !group.contains(id) {
            return;
        }
        self.visit_watchers(group.watchers(), &mut visit);
    }

    /// Returns `false` if the visitor asked to stop.
    fn visit_watchers<I, F>(&self, watchers: I, visit: &mut F) -> bool
    where
        I: Iterator<Item = EntityId>,
        F: FnMut(&dyn Watcher) -> bool,
    {
        for id in watchers {
            if let Some(watcher) = self.registry.watcher(id) {
                if !visit(watcher) {
                    return false;
                }
            }
        }
        true
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Number of tracked entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn is_global(&self, id: EntityId) -> bool {
        self.entities
            .get(&id)
            .is_some_and(|entry| entry.residency == Residency::Global)
    }

    /// Tower of the last accepted position.
    pub fn cell_of(&self, id: EntityId) -> Option<CellCoord> {
        self.entities.get(&id).map(|entry| entry.cell)
    }

    /// Shard holding the entity, `None` for untracked or global entities.
    pub fn shard_of(&self, id: EntityId) -> Option<ShardId> {
        match self.entities.get(&id)?.residency {
            Residency::Grid { shard, .. } => Some(shard),
            Residency::Global => None,
        }
    }

    /// Towers a watcher is registered in.
    pub fn footprint_of(&self, id: EntityId) -> Option<CellRange> {
        self.entities.get(&id).and_then(|entry| entry.footprint)
    }

    pub fn groups_of(&self, id: EntityId) -> &[GroupId] {
        self.entities
            .get(&id)
            .map(|entry| entry.groups.as_slice())
            .unwrap_or_default()
    }

    pub fn group_members(&self, group_id: GroupId) -> Option<Vec<EntityId>> {
        self.groups
            .get(&group_id)
            .map(|group| group.entities().map(|entity| entity.id()).collect())
    }

    /// Whether `watcher` has been told `entity` entered and not yet that it left.
    pub fn perceives(&self, watcher: EntityId, entity: EntityId) -> bool {
        self.registry
            .get(watcher)
            .is_some_and(|diff| diff.perceives(entity))
    }

    /// Everything `watcher` currently perceives.
    pub fn perceived_by(&self, watcher: EntityId) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .registry
            .get(watcher)
            .map(|diff| diff.perceived().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn grid(&self) -> &GridMapping {
        &self.grid
    }

    pub fn channel(&self) -> Channel {
        self.registry.channel()
    }

    pub fn backing(&self) -> GridBacking {
        self.backing
    }

    pub fn stats(&self) -> AoiStats {
        AoiStats {
            entities: self.entities.len(),
            watchers: self.registry.len(),
            global_entities: self.global.len(),
            groups: self.groups.len(),
            shards: self.shards.len(),
            occupied_towers: self.shards.values().map(|grid| grid.occupied().len()).sum(),
            stored_towers: self.shards.values().map(ShardGrid::stored).sum(),
        }
    }

    // ========================================================================
    // Shards
    // ========================================================================

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Live resident count per shard.
    pub fn shard_loads(&self) -> &BTreeMap<ShardId, usize> {
        &self.loads
    }

    pub fn shard_backing(&self, shard: ShardId) -> Option<GridBacking> {
        self.shards.get(&shard).map(|grid| grid.backing())
    }

    /// Runs the shard merge pass immediately, ignoring the throttle.
    /// Returns the number of merged shards.
    pub fn rebalance(&mut self) -> AoiResult<usize> {
        let merged = self.merge_underloaded();
        if let Some(sharding) = self.sharding.as_mut() {
            sharding.last_rebalance = Instant::now();
        }
        self.registry.flush()?;
        Ok(merged)
    }

    fn maybe_rebalance(&mut self) {
        let Some(sharding) = self.sharding.as_mut() else {
            return;
        };
        if sharding.last_rebalance.elapsed() < sharding.interval {
            return;
        }
        sharding.last_rebalance = Instant::now();
        self.merge_underloaded();
    }

    /// Folds the highest shard into its predecessor while their combined
    /// load stays below half the capacity.
    fn merge_underloaded(&mut self) -> usize {
        let Some(capacity) = self.sharding.as_ref().map(|sharding| sharding.capacity) else {
            return 0;
        };

        let mut merged = 0;
        while self.last_shard > PRIMARY_SHARD {
            let high = self.last_shard;
            let low = high - 1;
            let combined = self.load(high) + self.load(low);
            if combined * 2 >= capacity {
                break;
            }
            self.merge_shard(high, low);
            merged += 1;
        }
        merged
    }

    /// Moves every tower of `src` into `dst` cell by cell and drops `src`.
    fn merge_shard(&mut self, src: ShardId, dst: ShardId) {
        let Some(mut source) = self.shards.remove(&src) else {
            self.registry
                .anomaly(format!("merge of missing shard {src}"));
            return;
        };
        let moved = self.loads.remove(&src).unwrap_or(0);

        for (cell, mut tower) in source.drain_occupied() {
            let watchers: Vec<EntityId> = tower.watchers().collect();
            for watcher in &watchers {
                if let Err(e) = tower.remove_watcher(*watcher, &mut self.registry) {
                    self.registry
                        .anomaly(format!("merge of shard {src} at {cell:?}: {e}"));
                }
            }
            let (residents, _) = tower.take();

            let Some(target) = self
                .shards
                .get_mut(&dst)
                .and_then(|grid| grid.tower_mut(cell))
            else {
                self.registry
                    .anomaly(format!("merge target shard {dst} has no tower at {cell:?}"));
                continue;
            };
            for watcher in watchers {
                if !target.contains_watcher(watcher) {
                    if let Err(e) = target.add_watcher(watcher, &mut self.registry) {
                        self.registry
                            .anomaly(format!("merge into shard {dst} at {cell:?}: {e}"));
                    }
                }
            }
            for resident in residents {
                let id = resident.id();
                if let Err(e) = target.add(resident, &mut self.registry) {
                    self.registry
                        .anomaly(format!("merge into shard {dst} at {cell:?}: {e}"));
                    continue;
                }
                if let Some(entry) = self.entities.get_mut(&id) {
                    entry.residency = Residency::Grid { shard: dst, cell };
                }
            }
        }

        *self.loads.entry(dst).or_default() += moved;
        self.last_shard -= 1;
        info!(
            "AOI {}: merged shard {} ({} residents) into shard {}",
            self.registry.channel(),
            src,
            moved,
            dst
        );
    }

    fn load(&self, shard: ShardId) -> usize {
        self.loads.get(&shard).copied().unwrap_or(0)
    }

    fn release_load(&mut self, shard: ShardId) {
        match self.loads.get_mut(&shard) {
            Some(load) if *load > 0 => *load -= 1,
            _ => self
                .registry
                .anomaly(format!("load counter of shard {shard} would drop below zero")),
        }
    }

    /// Shard that receives a new resident, allocating one when even the
    /// least-loaded shard is over capacity.
    fn place_resident(&mut self) -> ShardId {
        let Some(sharding) = self.sharding.as_ref() else {
            return PRIMARY_SHARD;
        };
        let (shard, load) = sharding.balancer.least_loaded(&self.loads);
        let capacity = sharding.capacity;
        if !self.shards.contains_key(&shard) {
            self.registry
                .anomaly(format!("load balancer picked unknown shard {shard}"));
            return PRIMARY_SHARD;
        }
        if load > capacity {
            return self.allocate_shard();
        }
        shard
    }

    /// Shard a moving resident should land in: the least-loaded shard when
    /// it is lighter by more than one, otherwise where it already is.
    fn relocation_target(&self, current: ShardId) -> ShardId {
        let Some(sharding) = self.sharding.as_ref() else {
            return current;
        };
        let (candidate, load) = sharding.balancer.least_loaded(&self.loads);
        if self.shards.contains_key(&candidate) && self.load(current) > load + 1 {
            candidate
        } else {
            current
        }
    }

    /// Opens a new sparse shard and registers every existing footprint in it.
    fn allocate_shard(&mut self) -> ShardId {
        let id = self.last_shard + 1;
        let mut grid = ShardGrid::sparse();
        for (watcher, entry) in &self.entities {
            if let Some(range) = entry.footprint {
                register_range(&mut grid, &mut self.registry, *watcher, range);
            }
        }
        self.shards.insert(id, grid);
        self.loads.insert(id, 0);
        self.last_shard = id;

        info!(
            "AOI {}: shard capacity exceeded, opened shard {}",
            self.registry.channel(),
            id
        );
        id
    }

    pub fn invariant_mode(&self) -> InvariantMode {
        self.registry.mode()
    }
}

impl std::fmt::Debug for TowerAoi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TowerAoi")
            .field("channel", &self.registry.channel())
            .field("grid", &self.grid)
            .field("stats", &self.stats())
            .finish()
    }
}

fn tower_at(
    shards: &mut BTreeMap<ShardId, ShardGrid>,
    shard: ShardId,
    cell: CellCoord,
) -> AoiResult<&mut Tower> {
    shards
        .get_mut(&shard)
        .and_then(|grid| grid.tower_mut(cell))
        .ok_or_else(|| {
            AoiError::InvariantViolation(format!("no tower at {cell:?} in shard {shard}"))
        })
}

/// Removes a resident from its tower, releasing the tower if it is left unused.
fn take_resident(
    shards: &mut BTreeMap<ShardId, ShardGrid>,
    registry: &mut WatcherRegistry,
    shard: ShardId,
    cell: CellCoord,
    id: EntityId,
) -> AoiResult<EntityRef> {
    let resident = tower_at(shards, shard, cell)?.remove(id, registry)?;
    if let Some(grid) = shards.get_mut(&shard) {
        grid.release(cell);
    }
    Ok(resident)
}

fn register_range(
    grid: &mut ShardGrid,
    registry: &mut WatcherRegistry,
    watcher: EntityId,
    range: CellRange,
) {
    for cell in range.cells() {
        match grid.tower_mut(cell) {
            Some(tower) => {
                if let Err(e) = tower.add_watcher(watcher, registry) {
                    registry.anomaly(format!("footprint of {watcher} at {cell:?}: {e}"));
                }
            }
            None => registry.anomaly(format!("footprint of {watcher} leaves the grid at {cell:?}")),
        }
    }
}

fn unregister_range(
    grid: &mut ShardGrid,
    registry: &mut WatcherRegistry,
    watcher: EntityId,
    range: CellRange,
) {
    for cell in range.cells() {
        match grid.tower_mut(cell) {
            Some(tower) => {
                if let Err(e) = tower.remove_watcher(watcher, registry) {
                    registry.anomaly(format!("footprint of {watcher} at {cell:?}: {e}"));
                }
            }
            None => registry.anomaly(format!("footprint of {watcher} leaves the grid at {cell:?}")),
        }
        grid.release(cell);
    }
}
