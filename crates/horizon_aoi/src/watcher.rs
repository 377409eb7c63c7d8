//! # Watcher Diff Protocol
//!
//! A watcher's footprint spans many towers, and the same entity can reach it
//! through several of them at once (two straddled towers, a group, the global
//! tower). Delivering tower notifications directly would duplicate enters and
//! fire spurious leaves whenever an entity crosses between two towers that
//! are both inside the footprint.
//!
//! Towers therefore never talk to watchers. They bump a per-entity reference
//! count inside the watcher's [`WatcherDiff`] and mark it dirty in the
//! [`WatcherRegistry`]. When an engine operation finishes, every dirty diff is
//! flushed once and the real watcher receives at most one batch-enter and one
//! batch-leave holding the net changes.

use crate::config::InvariantMode;
use crate::entity::{Channel, EntityRef, Watcher};
use crate::error::{AoiError, AoiResult};
use crate::types::EntityId;
use std::collections::{HashMap, HashSet};
use tracing::{error, trace, warn};

#[derive(Clone)]
struct DiffRecord {
    entity: EntityRef,
    count: i32,
    entered: bool,
}

/// Net enter/leave counts delivered by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub entered: usize,
    pub left: usize,
}

/// Reference-counting wrapper around one watcher.
pub struct WatcherDiff {
    watcher: EntityRef,
    records: HashMap<EntityId, DiffRecord>,
}

impl WatcherDiff {
    pub fn new(watcher: EntityRef) -> Self {
        Self {
            watcher,
            records: HashMap::new(),
        }
    }

    pub fn id(&self) -> EntityId {
        self.watcher.id()
    }

    /// The wrapped entity.
    pub fn entity(&self) -> &EntityRef {
        &self.watcher
    }

    /// The wrapped entity's watcher capability.
    pub fn watcher(&self) -> Option<&dyn Watcher> {
        self.watcher.as_watcher()
    }

    /// Whether `id` has been delivered as entered and not yet as left.
    pub fn perceives(&self, id: EntityId) -> bool {
        self.records.get(&id).is_some_and(|record| record.entered)
    }

    /// Entities delivered as entered and not yet left.
    pub fn perceived(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.records
            .iter()
            .filter(|(_, record)| record.entered)
            .map(|(id, _)| *id)
    }

    pub fn on_enter(&mut self, entity: &EntityRef) {
        self.records
            .entry(entity.id())
            .or_insert_with(|| DiffRecord {
                entity: entity.clone(),
                count: 0,
                entered: false,
            })
            .count += 1;
    }

    /// Returns `false` if the entity was never announced to this watcher.
    pub fn on_leave(&mut self, entity: &EntityRef) -> bool {
        match self.records.get_mut(&entity.id()) {
            Some(record) => {
                record.count -= 1;
                true
            }
            None => false,
        }
    }

    pub fn on_batch_enter(&mut self, entities: &[EntityRef]) {
        for entity in entities {
            self.on_enter(entity);
        }
    }

    /// Returns how many of the entities were never announced to this watcher.
    pub fn on_batch_leave(&mut self, entities: &[EntityRef]) -> usize {
        entities.iter().filter(|entity| !self.on_leave(entity)).count()
    }

    /// Computes the net batches and delivers them on `channel`.
    pub fn flush(&mut self, channel: Channel) -> FlushReport {
        let mut enter_list = Vec::new();
        let mut leave_list = Vec::new();

        self.records.retain(|_, record| {
            if record.count > 0 {
                if !record.entered {
                    record.entered = true;
                    enter_list.push(record.entity.clone());
                }
                true
            } else {
                if record.entered {
                    leave_list.push(record.entity.clone());
                }
                false
            }
        });

        let report = FlushReport {
            entered: enter_list.len(),
            left: leave_list.len(),
        };

        if let Some(watcher) = self.watcher.as_watcher() {
            if !enter_list.is_empty() {
                channel.deliver_enter(watcher, &enter_list);
            }
            if !leave_list.is_empty() {
                channel.deliver_leave(watcher, &leave_list);
            }
        }

        report
    }
}

impl std::fmt::Debug for WatcherDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherDiff")
            .field("watcher", &self.id())
            .field("records", &self.records.len())
            .finish()
    }
}

/// Every watcher diff of one engine plus the set of diffs awaiting a flush.
///
/// Towers address watchers by id through this registry.
#[derive(Debug)]
pub struct WatcherRegistry {
    channel: Channel,
    mode: InvariantMode,
    diffs: HashMap<EntityId, WatcherDiff>,
    dirty: HashSet<EntityId>,
    violations: Vec<String>,
}

impl WatcherRegistry {
    pub fn new(channel: Channel, mode: InvariantMode) -> Self {
        Self {
            channel,
            mode,
            diffs: HashMap::new(),
            dirty: HashSet::new(),
            violations: Vec::new(),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn mode(&self) -> InvariantMode {
        self.mode
    }

    /// Wraps a watcher entity. Returns `false` if one with the same id exists.
    pub fn insert(&mut self, watcher: EntityRef) -> bool {
        let id = watcher.id();
        if self.diffs.contains_key(&id) {
            return false;
        }
        self.diffs.insert(id, WatcherDiff::new(watcher));
        true
    }

    /// Drops a watcher's diff. Pending changes are discarded.
    pub fn remove(&mut self, id: EntityId) -> Option<WatcherDiff> {
        self.dirty.remove(&id);
        self.diffs.remove(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.diffs.contains_key(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&WatcherDiff> {
        self.diffs.get(&id)
    }

    /// The real watcher behind a registered id.
    pub fn watcher(&self, id: EntityId) -> Option<&dyn Watcher> {
        self.diffs.get(&id).and_then(|diff| diff.watcher())
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    /// Number of diffs awaiting a flush.
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    pub(crate) fn notify_enter(&mut self, watcher: EntityId, entity: &EntityRef) {
        match self.diffs.get_mut(&watcher) {
            Some(diff) => {
                diff.on_enter(entity);
                self.dirty.insert(watcher);
            }
            None => self.anomaly(format!(
                "enter of {} routed to unregistered watcher {watcher}",
                entity.id()
            )),
        }
    }

    pub(crate) fn notify_leave(&mut self, watcher: EntityId, entity: &EntityRef) {
        let known = match self.diffs.get_mut(&watcher) {
            Some(diff) => {
                let known = diff.on_leave(entity);
                self.dirty.insert(watcher);
                known
            }
            None => {
                self.anomaly(format!(
                    "leave of {} routed to unregistered watcher {watcher}",
                    entity.id()
                ));
                return;
            }
        };
        if !known {
            self.anomaly(format!(
                "watcher {watcher} told to forget {} which it never saw",
                entity.id()
            ));
        }
    }

    pub(crate) fn notify_batch_enter(&mut self, watcher: EntityId, entities: &[EntityRef]) {
        if entities.is_empty() {
            return;
        }
        match self.diffs.get_mut(&watcher) {
            Some(diff) => {
                diff.on_batch_enter(entities);
                self.dirty.insert(watcher);
            }
            None => self.anomaly(format!(
                "batch enter of {} entities routed to unregistered watcher {watcher}",
                entities.len()
            )),
        }
    }

    pub(crate) fn notify_batch_leave(&mut self, watcher: EntityId, entities: &[EntityRef]) {
        if entities.is_empty() {
            return;
        }
        let unknown = match self.diffs.get_mut(&watcher) {
            Some(diff) => {
                let unknown = diff.on_batch_leave(entities);
                self.dirty.insert(watcher);
                unknown
            }
            None => entities.len(),
        };
        if unknown > 0 {
            self.anomaly(format!(
                "watcher {watcher} told to forget {unknown} entities it never saw"
            ));
        }
    }

    /// Records an internal consistency anomaly according to the invariant mode.
    pub(crate) fn anomaly(&mut self, message: String) {
        match self.mode {
            InvariantMode::Tolerant => {
                warn!("AOI anomaly on {} channel: {}", self.channel, message)
            }
            InvariantMode::Strict => {
                error!("AOI invariant violated on {} channel: {}", self.channel, message);
                self.violations.push(message);
            }
        }
    }

    /// Flushes every dirty watcher exactly once.
    ///
    /// In strict mode, anomalies collected since the previous flush are
    /// reported here, after delivery.
    pub fn flush(&mut self) -> AoiResult<()> {
        let mut dirty: Vec<EntityId> = self.dirty.drain().collect();
        dirty.sort_unstable();

        for id in dirty {
            let Some(diff) = self.diffs.get_mut(&id) else {
                continue;
            };
            if diff.watcher().is_none() {
                let message =
                    format!("entity {id} registered as watcher lost its watcher capability");
                self.anomaly(message);
                continue;
            }
            let report = diff.flush(self.channel);
            if report != FlushReport::default() {
                trace!(
                    "flushed watcher {} on {} channel: +{} -{}",
                    id,
                    self.channel,
                    report.entered,
                    report.left
                );
            }
        }

        if self.violations.is_empty() {
            Ok(())
        } else {
            let violations = std::mem::take(&mut self.violations);
            Err(AoiError::InvariantViolation(violations.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{Marker, RecordingWatcher};
    use crate::types::Position;

    fn marker(n: u128) -> EntityRef {
        Marker::new(n, Position::new(0.0, 0.0))
    }

    #[test]
    fn test_overlapping_towers_enter_once() {
        let (watcher, log) = RecordingWatcher::new(1, Position::new(0.0, 0.0), 2.0);
        let mut diff = WatcherDiff::new(watcher);
        let o = marker(10);

        // seen through two towers at once
        diff.on_enter(&o);
        diff.on_enter(&o);
        let report = diff.flush(Channel::Single);
        assert_eq!(report, FlushReport { entered: 1, left: 0 });
        assert_eq!(log.entered_ids(), vec![o.id()]);

        // dropping one of the two routes is not a leave
        assert!(diff.on_leave(&o));
        assert_eq!(diff.flush(Channel::Single), FlushReport::default());
        assert!(diff.perceives(o.id()));

        assert!(diff.on_leave(&o));
        assert_eq!(diff.flush(Channel::Single), FlushReport { entered: 0, left: 1 });
        assert_eq!(log.left_ids(), vec![o.id()]);
        assert!(!diff.perceives(o.id()));
        assert_eq!(log.batch_calls(), 2);
    }

    #[test]
    fn test_crossing_inside_footprint_is_silent() {
        let (watcher, log) = RecordingWatcher::new(1, Position::new(0.0, 0.0), 2.0);
        let mut diff = WatcherDiff::new(watcher);
        let o = marker(10);

        diff.on_enter(&o);
        diff.flush(Channel::Single);
        log.clear();

        // leave old tower, enter new tower within the same operation
        diff.on_leave(&o);
        diff.on_enter(&o);
        assert_eq!(diff.flush(Channel::Single), FlushReport::default());
        assert_eq!(log.batch_calls(), 0);
    }

    #[test]
    fn test_enter_and_leave_before_flush_is_dropped_silently() {
        let (watcher, log) = RecordingWatcher::new(1, Position::new(0.0, 0.0), 2.0);
        let mut diff = WatcherDiff::new(watcher);
        let o = marker(10);

        diff.on_batch_enter(&[o.clone()]);
        assert_eq!(diff.on_batch_leave(&[o.clone()]), 0);
        assert_eq!(diff.flush(Channel::Single), FlushReport::default());
        assert_eq!(log.batch_calls(), 0);
        assert_eq!(diff.perceived().count(), 0);
    }

    #[test]
    fn test_layer_channel_delivery() {
        let (watcher, log) = RecordingWatcher::new(1, Position::new(0.0, 0.0), 2.0);
        let mut diff = WatcherDiff::new(watcher);
        diff.on_batch_enter(&[marker(10), marker(11)]);
        diff.flush(Channel::Layer(4));

        let events = log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].layer, Some(4));
        assert_eq!(events[0].ids.len(), 2);
    }

    #[test]
    fn test_registry_flushes_each_dirty_watcher_once() {
        let mut registry = WatcherRegistry::new(Channel::Single, InvariantMode::Strict);
        let (w1, log1) = RecordingWatcher::new(1, Position::new(0.0, 0.0), 2.0);
        let (w2, log2) = RecordingWatcher::new(2, Position::new(0.0, 0.0), 2.0);
        assert!(registry.insert(w1.clone()));
        assert!(registry.insert(w2));
        assert!(!registry.insert(w1));

        let o = marker(10);
        let p = marker(11);
        registry.notify_enter(EntityId::from_u128(1), &o);
        registry.notify_enter(EntityId::from_u128(1), &p);
        registry.notify_batch_enter(EntityId::from_u128(2), &[o.clone(), p.clone()]);
        assert_eq!(registry.dirty_len(), 2);

        registry.flush().unwrap();
        assert_eq!(registry.dirty_len(), 0);
        assert_eq!(log1.batch_calls(), 1);
        assert_eq!(log2.batch_calls(), 1);
        assert_eq!(log1.entered_ids().len(), 2);
    }

    #[test]
    fn test_strict_registry_reports_unknown_leave() {
        let mut registry = WatcherRegistry::new(Channel::Single, InvariantMode::Strict);
        let (w1, _log) = RecordingWatcher::new(1, Position::new(0.0, 0.0), 2.0);
        registry.insert(w1);

        registry.notify_leave(EntityId::from_u128(1), &marker(10));
        assert!(matches!(registry.flush(), Err(AoiError::InvariantViolation(_))));
        // violations are reported once
        assert!(registry.flush().is_ok());
    }

    #[test]
    fn test_tolerant_registry_only_logs() {
        let mut registry = WatcherRegistry::new(Channel::Single, InvariantMode::Tolerant);
        registry.notify_leave(EntityId::from_u128(99), &marker(10));
        registry.notify_batch_leave(EntityId::from_u128(99), &[marker(10)]);
        assert!(registry.flush().is_ok());
    }
}
