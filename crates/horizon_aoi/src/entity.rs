//! # Entity and Watcher Contracts
//!
//! The engine never owns game objects. Callers hand it shared [`EntityRef`]
//! handles implementing [`Entity`]; an entity that also wants to perceive its
//! surroundings exposes the [`Watcher`] capability through
//! [`Entity::as_watcher`].
//!
//! Channel-aware callers override the `layer_*` methods. Their defaults fall
//! back to the single-channel accessors and callbacks, so a plain watcher can
//! be placed in a layered engine unchanged.
//!
//! Callbacks run synchronously inside the engine operation that produced them
//! and must not call back into the same engine instance.

use crate::types::{EntityId, LayerIndex, LayerMask, Position};
use std::sync::Arc;

/// Shared handle to a tracked entity.
pub type EntityRef = Arc<dyn Entity>;

/// Anything that can be placed into an AOI engine.
pub trait Entity: Send + Sync {
    /// Stable unique identifier.
    fn id(&self) -> EntityId;

    /// Current position; read by the engine on add, move and global unmarking.
    fn position(&self) -> Position;

    /// Watcher capability, if this entity perceives others.
    ///
    /// Implementors that are watchers return `Some(self)`.
    fn as_watcher(&self) -> Option<&dyn Watcher> {
        None
    }

    /// Interest channels this entity participates in (layered engine only).
    fn layer_bits(&self) -> LayerMask {
        LayerMask::NONE
    }
}

/// An entity that perceives other entities within a visibility radius.
pub trait Watcher: Entity {
    /// Visibility radius in world units. Non-positive radii register no
    /// spatial footprint.
    fn visual_radius(&self) -> f64;

    /// Single-entity enter callback. Part of the watcher contract for
    /// implementors that track visibility one entity at a time; the engine
    /// itself only ever delivers batches and never calls it.
    fn on_enter(&self, _entity: &EntityRef) {}

    /// Single-entity leave callback, never called by the engine. See
    /// [`Watcher::on_enter`].
    fn on_leave(&self, _entity: &EntityRef) {}

    /// Net entities that became visible during the last engine operation.
    fn on_batch_enter(&self, entities: &[EntityRef]);

    /// Net entities that stopped being visible during the last engine operation.
    fn on_batch_leave(&self, entities: &[EntityRef]);

    /// Visibility radius on a specific channel.
    fn layer_visual_radius(&self, _layer: LayerIndex) -> f64 {
        self.visual_radius()
    }

    fn on_layer_enter(&self, entity: &EntityRef, _layer: LayerIndex) {
        self.on_enter(entity)
    }

    fn on_layer_leave(&self, entity: &EntityRef, _layer: LayerIndex) {
        self.on_leave(entity)
    }

    fn on_layer_batch_enter(&self, entities: &[EntityRef], _layer: LayerIndex) {
        self.on_batch_enter(entities)
    }

    fn on_layer_batch_leave(&self, entities: &[EntityRef], _layer: LayerIndex) {
        self.on_batch_leave(entities)
    }
}

/// Which callback family an engine instance speaks.
///
/// A standalone engine uses [`Channel::Single`]; every engine owned by a
/// layer facade uses [`Channel::Layer`] with its bit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Single,
    Layer(LayerIndex),
}

impl Channel {
    pub fn layer(&self) -> Option<LayerIndex> {
        match self {
            Channel::Single => None,
            Channel::Layer(layer) => Some(*layer),
        }
    }

    /// Radius the watcher uses on this channel.
    pub(crate) fn radius_of(&self, watcher: &dyn Watcher) -> f64 {
        match self {
            Channel::Single => watcher.visual_radius(),
            Channel::Layer(layer) => watcher.layer_visual_radius(*layer),
        }
    }

    pub(crate) fn deliver_enter(&self, watcher: &dyn Watcher, entities: &[EntityRef]) {
        match self {
            Channel::Single => watcher.on_batch_enter(entities),
            Channel::Layer(layer) => watcher.on_layer_batch_enter(entities, *layer),
        }
    }

    pub(crate) fn deliver_leave(&self, watcher: &dyn Watcher, entities: &[EntityRef]) {
        match self {
            Channel::Single => watcher.on_batch_leave(entities),
            Channel::Layer(layer) => watcher.on_layer_batch_leave(entities, *layer),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Single => write!(f, "single"),
            Channel::Layer(layer) => write!(f, "layer {layer}"),
        }
    }
}
