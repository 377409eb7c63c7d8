//! Test doubles: plain entities and watchers that record every delivery.

use crate::entity::{Entity, EntityRef, Watcher};
use crate::types::{EntityId, LayerIndex, LayerMask, Position};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Installs a test-writer subscriber once per process; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A non-watching entity with a mutable position.
pub struct Marker {
    id: EntityId,
    position: Mutex<Position>,
    layers: Mutex<LayerMask>,
}

impl Marker {
    pub fn new(n: u128, position: Position) -> Arc<Self> {
        Self::on_layers(n, position, LayerMask::NONE)
    }

    pub fn on_layers(n: u128, position: Position, layers: LayerMask) -> Arc<Self> {
        Arc::new(Self {
            id: EntityId::from_u128(n),
            position: Mutex::new(position),
            layers: Mutex::new(layers),
        })
    }

    pub fn set_position(&self, position: Position) {
        *self.position.lock().unwrap() = position;
    }

    pub fn set_layers(&self, layers: LayerMask) {
        *self.layers.lock().unwrap() = layers;
    }
}

impl Entity for Marker {
    fn id(&self) -> EntityId {
        self.id
    }

    fn position(&self) -> Position {
        *self.position.lock().unwrap()
    }

    fn layer_bits(&self) -> LayerMask {
        *self.layers.lock().unwrap()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Enter,
    Leave,
}

/// One batch callback as received by a watcher.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub layer: Option<LayerIndex>,
    pub ids: Vec<EntityId>,
}

/// Shared, cloneable view of a watcher's received callbacks.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    fn push(&self, kind: EventKind, layer: Option<LayerIndex>, entities: &[EntityRef]) {
        let mut ids: Vec<EntityId> = entities.iter().map(|entity| entity.id()).collect();
        ids.sort();
        self.0.lock().unwrap().push(Event { kind, layer, ids });
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn batch_calls(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn ids_of(&self, kind: EventKind) -> Vec<EntityId> {
        self.events()
            .into_iter()
            .filter(|event| event.kind == kind)
            .flat_map(|event| event.ids)
            .collect()
    }

    pub fn entered_ids(&self) -> Vec<EntityId> {
        self.ids_of(EventKind::Enter)
    }

    pub fn left_ids(&self) -> Vec<EntityId> {
        self.ids_of(EventKind::Leave)
    }

    /// Replays every callback, panicking on a duplicate enter or an
    /// unmatched leave. Returns what is visible afterwards.
    pub fn visible(&self) -> BTreeSet<EntityId> {
        self.visible_on(None)
    }

    /// Same as [`EventLog::visible`] for the callbacks of one layer.
    pub fn visible_on(&self, layer: Option<LayerIndex>) -> BTreeSet<EntityId> {
        let mut visible = BTreeSet::new();
        for event in self.events().into_iter().filter(|event| event.layer == layer) {
            for id in event.ids {
                match event.kind {
                    EventKind::Enter => assert!(visible.insert(id), "{id} entered twice"),
                    EventKind::Leave => assert!(visible.remove(&id), "{id} left without entering"),
                }
            }
        }
        visible
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// A watcher that records every batch callback into an [`EventLog`].
pub struct RecordingWatcher {
    marker: Marker,
    radius: Mutex<f64>,
    layer_radii: Mutex<HashMap<LayerIndex, f64>>,
    log: EventLog,
}

impl RecordingWatcher {
    pub fn new(n: u128, position: Position, radius: f64) -> (Arc<Self>, EventLog) {
        Self::on_layers(n, position, radius, LayerMask::NONE)
    }

    pub fn on_layers(
        n: u128,
        position: Position,
        radius: f64,
        layers: LayerMask,
    ) -> (Arc<Self>, EventLog) {
        let log = EventLog::default();
        let watcher = Arc::new(Self {
            marker: Marker {
                id: EntityId::from_u128(n),
                position: Mutex::new(position),
                layers: Mutex::new(layers),
            },
            radius: Mutex::new(radius),
            layer_radii: Mutex::new(HashMap::new()),
            log: log.clone(),
        });
        (watcher, log)
    }

    pub fn set_position(&self, position: Position) {
        self.marker.set_position(position);
    }

    pub fn set_radius(&self, radius: f64) {
        *self.radius.lock().unwrap() = radius;
    }

    /// Overrides the radius on one layer.
    pub fn set_layer_radius(&self, layer: LayerIndex, radius: f64) {
        self.layer_radii.lock().unwrap().insert(layer, radius);
    }
}

impl Entity for RecordingWatcher {
    fn id(&self) -> EntityId {
        self.marker.id()
    }

    fn position(&self) -> Position {
        self.marker.position()
    }

    fn as_watcher(&self) -> Option<&dyn Watcher> {
        Some(self)
    }

    fn layer_bits(&self) -> LayerMask {
        self.marker.layer_bits()
    }
}

impl Watcher for RecordingWatcher {
    fn visual_radius(&self) -> f64 {
        *self.radius.lock().unwrap()
    }

    fn on_batch_enter(&self, entities: &[EntityRef]) {
        self.log.push(EventKind::Enter, None, entities);
    }

    fn on_batch_leave(&self, entities: &[EntityRef]) {
        self.log.push(EventKind::Leave, None, entities);
    }

    fn layer_visual_radius(&self, layer: LayerIndex) -> f64 {
        self.layer_radii
            .lock()
            .unwrap()
            .get(&layer)
            .copied()
            .unwrap_or_else(|| self.visual_radius())
    }

    fn on_layer_batch_enter(&self, entities: &[EntityRef], layer: LayerIndex) {
        self.log.push(EventKind::Enter, Some(layer), entities);
    }

    fn on_layer_batch_leave(&self, entities: &[EntityRef], layer: LayerIndex) {
        self.log.push(EventKind::Leave, Some(layer), entities);
    }
}
