//! # Layered AOI
//!
//! Independent interest channels selected per entity by a [`LayerMask`].
//!
//! Each registered layer owns a full [`TowerAoi`] with its own grid, watcher
//! diffs, groups and shards. The facade reads an entity's mask on every call,
//! walks the set bits from the lowest one up and forwards the operation to
//! each selected layer. Watchers are asked for their per-layer radius and
//! receive the `on_layer_*` callbacks carrying the layer index.
//!
//! Mutations are all-or-nothing across the selected layers: every layer is
//! validated before any of them changes, and a failure halfway through an
//! insert rolls the already-updated layers back. Strict-mode invariant reports
//! are not failures in that sense; the operation is completed on every layer
//! and the first report is returned.

use crate::config::{LayerAoiConfig, LayerSettings};
use crate::engine::{AoiStats, TowerAoi};
use crate::entity::{Entity, EntityRef, Watcher};
use crate::error::{AoiError, AoiResult};
use crate::shard::{LeastLoaded, LoadBalance};
use crate::types::{EntityId, LayerIndex, LayerMask};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Multi-channel AOI facade.
#[derive(Debug, Default)]
pub struct LayerAoi {
    layers: BTreeMap<LayerIndex, TowerAoi>,
}

impl LayerAoi {
    /// Creates a facade with no layers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds every configured layer with the default [`LeastLoaded`] balancer.
    pub fn from_config(config: &LayerAoiConfig) -> AoiResult<Self> {
        config.validate()?;
        let mut aoi = Self::new();
        for settings in &config.layers {
            aoi.add_layer(settings, Box::new(LeastLoaded))?;
        }
        info!("Layered AOI ready with layers {:?}", aoi.layers.keys().collect::<Vec<_>>());
        Ok(aoi)
    }

    /// Registers a new channel.
    pub fn add_layer(
        &mut self,
        settings: &LayerSettings,
        balancer: Box<dyn LoadBalance>,
    ) -> AoiResult<()> {
        if self.layers.contains_key(&settings.index) {
            return Err(AoiError::InvalidConfiguration(format!(
                "layer {} is already registered",
                settings.index
            )));
        }
        let engine = TowerAoi::for_layer(settings, balancer)?;
        self.layers.insert(settings.index, engine);
        debug!("Registered AOI layer {}", settings.index);
        Ok(())
    }

    /// Bits of every registered layer.
    pub fn layer_mask(&self) -> LayerMask {
        LayerMask::from_layers(self.layers.keys().copied())
    }

    pub fn layer(&self, index: LayerIndex) -> Option<&TowerAoi> {
        self.layers.get(&index)
    }

    /// Direct access to one channel, for global markers and groups.
    pub fn layer_mut(&mut self, index: LayerIndex) -> Option<&mut TowerAoi> {
        self.layers.get_mut(&index)
    }

    pub fn layers(&self) -> impl Iterator<Item = (LayerIndex, &TowerAoi)> {
        self.layers.iter().map(|(index, engine)| (*index, engine))
    }

    /// Mask of the entity, rejecting empty masks and unregistered bits.
    fn selected(&self, entity: &dyn Entity) -> AoiResult<LayerMask> {
        let mask = entity.layer_bits();
        if mask.is_empty() {
            return Err(AoiError::InvalidEntity(format!(
                "entity {} selects no layer",
                entity.id()
            )));
        }
        if let Some(missing) = mask.iter().find(|index| !self.layers.contains_key(index)) {
            return Err(AoiError::UnknownLayer(missing));
        }
        Ok(mask)
    }

    /// Tracks the entity on every layer of its mask.
    pub fn add_to_aoi(&mut self, entity: EntityRef) -> AoiResult<()> {
        let mask = self.selected(entity.as_ref())?;
        let id = entity.id();
        let position = entity.position();

        for index in mask {
            let Some(layer) = self.layers.get(&index) else {
                return Err(AoiError::UnknownLayer(index));
            };
            if layer.contains(id) {
                return Err(AoiError::AlreadyTracked(id));
            }
            layer.grid().check(position)?;
        }

        let mut added = Vec::new();
        let mut violation = None;
        for index in mask {
            let Some(layer) = self.layers.get_mut(&index) else {
                continue;
            };
            match layer.add_to_aoi(entity.clone()) {
                Ok(()) => added.push(index),
                // applied and flushed, only reported
                Err(e @ AoiError::InvariantViolation(_)) => {
                    added.push(index);
                    violation.get_or_insert(e);
                }
                Err(e) => {
                    self.rollback(entity.as_ref(), &added);
                    return Err(e);
                }
            }
        }
        violation.map_or(Ok(()), Err)
    }

    fn rollback(&mut self, entity: &dyn Entity, added: &[LayerIndex]) {
        for index in added {
            if let Some(layer) = self.layers.get_mut(index) {
                if let Err(e) = layer.remove_from_aoi(entity) {
                    warn!("Rollback of {} on layer {} failed: {}", entity.id(), index, e);
                }
            }
        }
    }

    /// Stops tracking the entity on every layer of its mask.
    pub fn remove_from_aoi(&mut self, entity: &dyn Entity) -> AoiResult<()> {
        let mask = self.selected(entity)?;
        let id = entity.id();
        if let Some(index) = mask.iter().find(|index| !self.layer_contains(*index, id)) {
            debug!("Removal of {} rejected, not on layer {}", id, index);
            return Err(AoiError::NotTracked(id));
        }

        self.for_each_selected(mask, |layer| layer.remove_from_aoi(entity))
    }

    /// Re-reads the entity's position on every layer of its mask.
    pub fn move_entity(&mut self, entity: &dyn Entity) -> AoiResult<()> {
        let mask = self.selected(entity)?;
        let id = entity.id();
        let position = entity.position();
        for index in mask {
            let Some(layer) = self.layers.get(&index) else {
                return Err(AoiError::UnknownLayer(index));
            };
            if !layer.contains(id) {
                return Err(AoiError::NotTracked(id));
            }
            layer.grid().check(position)?;
        }

        self.for_each_selected(mask, |layer| layer.move_entity(entity))
    }

    /// Runs `op` on every selected layer and returns the first failure.
    ///
    /// Only invariant reports can fail once validation passed; the remaining
    /// layers are still updated so the channels stay in step.
    fn for_each_selected<F>(&mut self, mask: LayerMask, mut op: F) -> AoiResult<()>
    where
        F: FnMut(&mut TowerAoi) -> AoiResult<()>,
    {
        let mut first_error = None;
        for index in mask {
            if let Some(layer) = self.layers.get_mut(&index) {
                if let Err(e) = op(layer) {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn layer_contains(&self, index: LayerIndex, id: EntityId) -> bool {
        self.layers.get(&index).is_some_and(|layer| layer.contains(id))
    }

    /// Visits the watchers perceiving the entity on each layer of its mask,
    /// lowest layer first. Returning `false` stops the whole walk.
    pub fn traversal<F>(&self, entity: &dyn Entity, mut visit: F)
    where
        F: FnMut(LayerIndex, &dyn Watcher) -> bool,
    {
        let mut keep_going = true;
        for index in entity.layer_bits() {
            let Some(layer) = self.layers.get(&index) else {
                continue;
            };
            layer.traversal(entity, |watcher| {
                keep_going = visit(index, watcher);
                keep_going
            });
            if !keep_going {
                return;
            }
        }
    }

    /// Forces the shard merge pass on every layer. Returns the merged shard count.
    pub fn rebalance(&mut self) -> AoiResult<usize> {
        let mut merged = 0;
        for layer in self.layers.values_mut() {
            merged += layer.rebalance()?;
        }
        Ok(merged)
    }

    pub fn stats(&self) -> BTreeMap<LayerIndex, AoiStats> {
        self.layers
            .iter()
            .map(|(index, layer)| (*index, layer.stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AoiConfig;
    use crate::tests::support::{Marker, RecordingWatcher};
    use crate::types::Position;

    fn settings(index: LayerIndex) -> LayerSettings {
        LayerSettings::new(
            index,
            AoiConfig::new(Position::new(0.0, 0.0), Position::new(10.0, 10.0), 1.0),
        )
    }

    fn facade(layers: &[LayerIndex]) -> LayerAoi {
        let mut aoi = LayerAoi::new();
        for index in layers {
            aoi.add_layer(&settings(*index), Box::new(LeastLoaded)).unwrap();
        }
        aoi
    }

    #[test]
    fn test_layer_registration() {
        let mut aoi = facade(&[0, 3]);
        assert_eq!(aoi.layer_mask(), LayerMask::from_layers([0, 3]));
        assert!(aoi.layer(3).is_some());
        assert!(aoi.layer(1).is_none());
        assert!(matches!(
            aoi.add_layer(&settings(3), Box::new(LeastLoaded)),
            Err(AoiError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_empty_mask_is_rejected() {
        let mut aoi = facade(&[0]);
        let o = Marker::new(1, Position::new(1.0, 1.0));
        assert!(matches!(aoi.add_to_aoi(o), Err(AoiError::InvalidEntity(_))));
    }

    #[test]
    fn test_unknown_layer_leaves_other_layers_untouched() {
        let mut aoi = facade(&[0]);
        let o = Marker::on_layers(1, Position::new(1.0, 1.0), LayerMask::from_layers([0, 5]));
        assert_eq!(aoi.add_to_aoi(o.clone()), Err(AoiError::UnknownLayer(5)));
        assert!(!aoi.layer(0).unwrap().contains(o.id()));
    }

    #[test]
    fn test_partial_presence_is_rejected_before_mutation() {
        let mut aoi = facade(&[0, 1]);
        let o = Marker::on_layers(1, Position::new(1.0, 1.0), LayerMask::single(0));
        aoi.add_to_aoi(o.clone()).unwrap();

        o.set_layers(LayerMask::from_layers([0, 1]));
        assert_eq!(aoi.add_to_aoi(o.clone()), Err(AoiError::AlreadyTracked(o.id())));
        assert!(!aoi.layer(1).unwrap().contains(o.id()));

        // layer 1 never saw it, so removal is refused everywhere
        assert_eq!(aoi.remove_from_aoi(o.as_ref()), Err(AoiError::NotTracked(o.id())));
        assert!(aoi.layer(0).unwrap().contains(o.id()));
    }

    #[test]
    fn test_callbacks_carry_layer_index() {
        let mut aoi = facade(&[0, 2]);
        let (w, log) = RecordingWatcher::on_layers(
            1,
            Position::new(0.0, 0.0),
            2.0,
            LayerMask::from_layers([0, 2]),
        );
        aoi.add_to_aoi(w.clone()).unwrap();
        log.clear();

        let o = Marker::on_layers(10, Position::new(1.0, 1.0), LayerMask::single(2));
        aoi.add_to_aoi(o.clone()).unwrap();

        let events = log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].layer, Some(2));
        assert_eq!(events[0].ids, vec![o.id()]);

        let mut visited = Vec::new();
        aoi.traversal(o.as_ref(), |layer, watcher| {
            visited.push((layer, watcher.id()));
            true
        });
        assert_eq!(visited, vec![(2, w.id())]);
    }

    #[test]
    fn test_from_config_builds_every_layer() {
        let aoi = LayerAoi::from_config(&LayerAoiConfig::default()).unwrap();
        assert_eq!(aoi.layer_mask(), LayerMask::single(0));
        assert_eq!(aoi.stats().len(), 1);
    }
}
