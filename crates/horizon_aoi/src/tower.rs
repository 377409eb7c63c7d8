//! Towers: spatial buckets of residents and the watchers observing them.
//!
//! The same container backs grid cells, the global tower and groups.

use crate::entity::{Entity, EntityRef};
use crate::error::{AoiError, AoiResult};
use crate::types::EntityId;
use crate::watcher::WatcherRegistry;
use std::collections::{HashMap, HashSet};

/// A set of resident entities plus the ids of watchers registered on them.
///
/// Every membership change is reported synchronously to the affected
/// watchers' diffs through the [`WatcherRegistry`].
#[derive(Default)]
pub struct Tower {
    entities: HashMap<EntityId, EntityRef>,
    watchers: HashSet<EntityId>,
}

impl Tower {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a resident and announces it to every registered watcher.
    pub fn add(&mut self, entity: EntityRef, registry: &mut WatcherRegistry) -> AoiResult<()> {
        let id = entity.id();
        if self.entities.contains_key(&id) {
            return Err(AoiError::AlreadyTracked(id));
        }
        for watcher in &self.watchers {
            registry.notify_enter(*watcher, &entity);
        }
        self.entities.insert(id, entity);
        Ok(())
    }

    /// Removes a resident and withdraws it from every registered watcher.
    pub fn remove(&mut self, id: EntityId, registry: &mut WatcherRegistry) -> AoiResult<EntityRef> {
        let entity = self.entities.remove(&id).ok_or(AoiError::NotTracked(id))?;
        for watcher in &self.watchers {
            registry.notify_leave(*watcher, &entity);
        }
        Ok(entity)
    }

    /// Registers a watcher; it is told about every current resident, one at a time.
    pub fn add_watcher(
        &mut self,
        watcher: EntityId,
        registry: &mut WatcherRegistry,
    ) -> AoiResult<()> {
        if !self.watchers.insert(watcher) {
            return Err(AoiError::AlreadyTracked(watcher));
        }
        for entity in self.entities.values() {
            registry.notify_enter(watcher, entity);
        }
        Ok(())
    }

    /// Unregisters a watcher; every current resident leaves its view.
    pub fn remove_watcher(
        &mut self,
        watcher: EntityId,
        registry: &mut WatcherRegistry,
    ) -> AoiResult<()> {
        if !self.watchers.remove(&watcher) {
            return Err(AoiError::NotTracked(watcher));
        }
        for entity in self.entities.values() {
            registry.notify_leave(watcher, entity);
        }
        Ok(())
    }

    /// Withdraws every (watcher, resident) pair and empties the tower.
    pub fn clear(&mut self, registry: &mut WatcherRegistry) {
        let residents: Vec<EntityRef> = self.entities.drain().map(|(_, entity)| entity).collect();
        for watcher in self.watchers.drain() {
            registry.notify_batch_leave(watcher, &residents);
        }
    }

    /// Empties the tower without notifying anyone, handing back its contents.
    pub(crate) fn take(&mut self) -> (Vec<EntityRef>, Vec<EntityId>) {
        let entities = self.entities.drain().map(|(_, entity)| entity).collect();
        let watchers = self.watchers.drain().collect();
        (entities, watchers)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn contains_watcher(&self, id: EntityId) -> bool {
        self.watchers.contains(&id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityRef> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityRef> {
        self.entities.values()
    }

    pub fn watchers(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.watchers.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// No residents and no watchers.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.watchers.is_empty()
    }
}

impl std::fmt::Debug for Tower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tower")
            .field("entities", &self.entities.len())
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InvariantMode;
    use crate::entity::Channel;
    use crate::tests::support::{Marker, RecordingWatcher};
    use crate::types::Position;

    fn registry() -> WatcherRegistry {
        WatcherRegistry::new(Channel::Single, InvariantMode::Strict)
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut registry = registry();
        let mut tower = Tower::new();
        let o = Marker::new(1, Position::new(0.0, 0.0));

        tower.add(o.clone(), &mut registry).unwrap();
        assert_eq!(
            tower.add(o.clone(), &mut registry),
            Err(AoiError::AlreadyTracked(o.id()))
        );
        assert_eq!(tower.len(), 1);
    }

    #[test]
    fn test_remove_missing() {
        let mut registry = registry();
        let mut tower = Tower::new();
        let id = EntityId::from_u128(5);
        assert!(matches!(tower.remove(id, &mut registry), Err(AoiError::NotTracked(_))));
        assert!(matches!(tower.remove_watcher(id, &mut registry), Err(AoiError::NotTracked(_))));
    }

    #[test]
    fn test_watcher_sees_residents_and_newcomers() {
        let mut registry = registry();
        let mut tower = Tower::new();
        let (w, log) = RecordingWatcher::new(1, Position::new(0.0, 0.0), 1.0);
        registry.insert(w.clone());

        let early = Marker::new(10, Position::new(0.0, 0.0));
        tower.add(early.clone(), &mut registry).unwrap();
        tower.add_watcher(w.id(), &mut registry).unwrap();
        assert!(tower.add_watcher(w.id(), &mut registry).is_err());

        let late = Marker::new(11, Position::new(0.0, 0.0));
        tower.add(late.clone(), &mut registry).unwrap();
        registry.flush().unwrap();

        let mut entered = log.entered_ids();
        entered.sort();
        assert_eq!(entered, vec![early.id(), late.id()]);

        tower.remove(late.id(), &mut registry).unwrap();
        tower.remove_watcher(w.id(), &mut registry).unwrap();
        registry.flush().unwrap();

        let mut left = log.left_ids();
        left.sort();
        assert_eq!(left, vec![early.id(), late.id()]);
    }

    #[test]
    fn test_clear_withdraws_every_pair() {
        let mut registry = registry();
        let mut tower = Tower::new();
        let (w1, log1) = RecordingWatcher::new(1, Position::new(0.0, 0.0), 1.0);
        let (w2, log2) = RecordingWatcher::new(2, Position::new(0.0, 0.0), 1.0);
        registry.insert(w1.clone());
        registry.insert(w2.clone());

        tower.add_watcher(w1.id(), &mut registry).unwrap();
        tower.add_watcher(w2.id(), &mut registry).unwrap();
        tower.add(Marker::new(10, Position::new(0.0, 0.0)), &mut registry).unwrap();
        tower.add(Marker::new(11, Position::new(0.0, 0.0)), &mut registry).unwrap();
        registry.flush().unwrap();

        tower.clear(&mut registry);
        registry.flush().unwrap();

        assert!(tower.is_empty());
        assert_eq!(log1.left_ids().len(), 2);
        assert_eq!(log2.left_ids().len(), 2);
    }
}
