//! Events, observers and the callback view handed to hooks and observers.
//!
//! Observers subscribe to `OnAdd`, `OnRemove` and `OnSet` for an id, which
//! may be a wildcard pattern. Lifecycle hooks and observers both receive an
//! [`EventIter`]: the event, the id, the affected entities and mutable
//! access to the world. Callbacks run with deferral suspended, so structural
//! changes they make apply immediately.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::component::HookFn;
use crate::component_index::ComponentFlags;
use crate::entity::{EntityId, RowFlags};
use crate::id::{builtin, Id};
use crate::table::TableId;
use crate::world::World;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Structural notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    /// An id was added to an entity.
    OnAdd,
    /// An id is about to be removed; its value is still readable.
    OnRemove,
    /// A value was written.
    OnSet,
}

impl Event {
    pub const ALL: [Event; 3] = [Event::OnAdd, Event::OnRemove, Event::OnSet];

    const fn bit(self) -> u8 {
        match self {
            Event::OnAdd => 1,
            Event::OnRemove => 2,
            Event::OnSet => 4,
        }
    }
}

// ---------------------------------------------------------------------------
// EventIter
// ---------------------------------------------------------------------------

/// What a hook or observer sees when it is invoked.
pub struct EventIter<'w> {
    world: &'w mut World,
    event: Event,
    id: Id,
    table: Option<TableId>,
    entities: &'w [EntityId],
    source: Option<EntityId>,
}

impl<'w> EventIter<'w> {
    pub(crate) fn new(
        world: &'w mut World,
        event: Event,
        id: Id,
        table: Option<TableId>,
        entities: &'w [EntityId],
        source: Option<EntityId>,
    ) -> Self {
        Self {
            world,
            event,
            id,
            table,
            entities,
            source,
        }
    }

    #[inline]
    pub fn event(&self) -> Event {
        self.event
    }

    /// The concrete id the event is for.
    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Table the entities were in when the event fired.
    #[inline]
    pub fn table(&self) -> Option<TableId> {
        self.table
    }

    #[inline]
    pub fn entities(&self) -> &[EntityId] {
        self.entities
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.entities.len()
    }

    /// For propagated events, the entity that actually has the id.
    #[inline]
    pub fn source(&self) -> Option<EntityId> {
        self.source
    }

    pub fn world(&self) -> &World {
        self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        self.world
    }

    fn holder(&self, row: usize) -> Option<EntityId> {
        self.source.or_else(|| self.entities.get(row).copied())
    }

    /// Value of the event's id for the entity at `row`.
    pub fn field<T: 'static>(&self, row: usize) -> Option<&T> {
        let holder = self.holder(row)?;
        self.world.get_own::<T>(holder, self.id)
    }

    /// Mutable value of the event's id for the entity at `row`.
    ///
    /// Writing through this does not emit `OnSet`.
    pub fn field_mut<T: 'static>(&mut self, row: usize) -> Option<&mut T> {
        let holder = self.holder(row)?;
        self.world.get_own_mut::<T>(holder, self.id)
    }
}

impl fmt::Debug for EventIter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventIter")
            .field("event", &self.event)
            .field("id", &self.id)
            .field("table", &self.table)
            .field("entities", &self.entities)
            .field("source", &self.source)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Handle returned by [`World::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ObserverId(u32);

/// Registration parameters of an observer.
#[derive(Clone)]
pub struct ObserverDesc {
    pub events: Vec<Event>,
    /// Id or wildcard pattern to observe.
    pub id: Id,
    pub callback: HookFn,
    /// Also deliver events for entities that reach the holder through a
    /// traversable relationship (for example children of a parent).
    pub propagate: bool,
}

impl ObserverDesc {
    pub fn new(
        id: Id,
        events: &[Event],
        callback: impl Fn(&mut EventIter<'_>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            events: events.to_vec(),
            id,
            callback: Arc::new(callback),
            propagate: false,
        }
    }

    pub fn propagate(mut self) -> Self {
        self.propagate = true;
        self
    }
}

impl fmt::Debug for ObserverDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverDesc")
            .field("events", &self.events)
            .field("id", &self.id)
            .field("propagate", &self.propagate)
            .finish()
    }
}

struct Observer {
    handle: ObserverId,
    id: Id,
    events: u8,
    callback: HookFn,
    propagate: bool,
}

impl Observer {
    fn matches(&self, event: Event, id: Id) -> bool {
        self.events & event.bit() != 0 && (self.id == id || id.matches(self.id))
    }
}

/// Registered observers, in registration order.
///
/// Removed observers leave no slot behind; handles are never reused.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    observers: Vec<Observer>,
    next_handle: u32,
    propagating: usize,
}

impl fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("live", &self.observers.len())
            .field("propagating", &self.propagating)
            .finish()
    }
}

impl ObserverRegistry {
    fn insert(&mut self, desc: ObserverDesc) -> ObserverId {
        let events = desc.events.iter().fold(0, |acc, e| acc | e.bit());
        if desc.propagate {
            self.propagating += 1;
        }
        let handle = ObserverId(self.next_handle);
        self.next_handle += 1;
        self.observers.push(Observer {
            handle,
            id: desc.id,
            events,
            callback: desc.callback,
            propagate: desc.propagate,
        });
        handle
    }

    fn remove(&mut self, handle: ObserverId) -> Option<Id> {
        let pos = self.observers.iter().position(|o| o.handle == handle)?;
        let observer = self.observers.remove(pos);
        if observer.propagate {
            self.propagating -= 1;
        }
        Some(observer.id)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn has_observers(&self, event: Event, id: Id) -> bool {
        self.iter().any(|o| o.matches(event, id))
    }

    fn iter(&self) -> impl Iterator<Item = &Observer> {
        self.observers.iter()
    }

    fn matching(&self, event: Event, id: Id) -> Vec<HookFn> {
        self.iter()
            .filter(|o| o.matches(event, id))
            .map(|o| Arc::clone(&o.callback))
            .collect()
    }

    fn propagating(&self, event: Event, id: Id) -> Vec<HookFn> {
        if self.propagating == 0 {
            return Vec::new();
        }
        self.iter()
            .filter(|o| o.propagate && o.matches(event, id))
            .map(|o| Arc::clone(&o.callback))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// World integration
// ---------------------------------------------------------------------------

impl World {
    /// Register an observer. Takes effect for the next event.
    pub fn observe(&mut self, desc: ObserverDesc) -> ObserverId {
        let pattern = desc.id;
        let id = self.observers.insert(desc);
        self.refresh_observer_flags(pattern);
        tracing::debug!(observer = id.0, id = %self.id_str(pattern), "observer registered");
        id
    }

    /// Remove an observer. Returns `false` if it was already gone.
    pub fn unobserve(&mut self, observer: ObserverId) -> bool {
        match self.observers.remove(observer) {
            Some(pattern) => {
                self.refresh_observer_flags(pattern);
                true
            }
            None => false,
        }
    }

    /// Run a callback with deferral suspended.
    pub(crate) fn invoke_callback(
        &mut self,
        callback: &HookFn,
        event: Event,
        id: Id,
        table: Option<TableId>,
        entities: &[EntityId],
        source: Option<EntityId>,
    ) {
        let mut world = self.suspend_defer();
        let mut it = EventIter::new(&mut world, event, id, table, entities, source);
        callback(&mut it);
    }

    /// Whether `id` has any observer for `event`.
    fn is_observed(&self, event: Event, id: Id) -> bool {
        match self.components.get_by_id(id) {
            Some(record) => record.flags().intersects(ComponentFlags::for_observers(event)),
            None => self.observers.has_observers(event, id),
        }
    }

    /// Deliver `event` for each id to matching observers, then propagate to
    /// entities that reach the affected entities through traversable
    /// relationships.
    pub(crate) fn emit(
        &mut self,
        event: Event,
        ids: &[Id],
        table: Option<TableId>,
        entities: &[EntityId],
    ) {
        if entities.is_empty() || self.observers.len() == 0 {
            return;
        }
        for &id in ids {
            if !self.is_observed(event, id) {
                continue;
            }
            for callback in self.observers.matching(event, id) {
                self.invoke_callback(&callback, event, id, table, entities, None);
            }
        }
        if self.observers.propagating > 0 {
            self.propagate(event, ids, entities);
        }
    }

    fn propagate(&mut self, event: Event, ids: &[Id], entities: &[EntityId]) {
        for &source in entities {
            let traversable = self
                .entities
                .get(source)
                .is_some_and(|r| r.flags.contains(RowFlags::IS_TRAVERSABLE));
            if !traversable {
                continue;
            }
            for &id in ids {
                let callbacks = self.observers.propagating(event, id);
                if callbacks.is_empty() {
                    continue;
                }
                for (table, batch) in self.descendants(source) {
                    for callback in &callbacks {
                        self.invoke_callback(callback, event, id, Some(table), &batch, Some(source));
                    }
                }
            }
        }
    }

    /// Entities reaching `root` through traversable relationships, grouped by
    /// table, breadth first. Cycles are visited once.
    pub(crate) fn descendants(&self, root: EntityId) -> Vec<(TableId, Vec<EntityId>)> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(root);
        let mut frontier = vec![root];
        while let Some(target) = frontier.pop() {
            let key = Id::pair_index(builtin::WILDCARD_INDEX, target.index());
            let Some(record) = self.components.get_by_id(key) else {
                continue;
            };
            for member in record.traversable_members() {
                let Some(member_record) = self.components.get_by_id(member) else {
                    continue;
                };
                for table in member_record.cache().tables() {
                    let Some(t) = self.tables.get(*table) else {
                        continue;
                    };
                    let batch: Vec<EntityId> = t
                        .entities()
                        .iter()
                        .copied()
                        .filter(|e| visited.insert(*e))
                        .collect();
                    if batch.is_empty() {
                        continue;
                    }
                    frontier.extend(batch.iter().copied());
                    out.push((*table, batch));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observer_matching_honors_wildcards_and_events() {
        let mut registry = ObserverRegistry::default();
        let rel = EntityId::new(40, 0);
        registry.insert(ObserverDesc::new(
            Id::pair(rel, builtin::WILDCARD),
            &[Event::OnAdd],
            |_| {},
        ));
        let concrete = Id::pair_index(40, 41);
        assert!(registry.has_observers(Event::OnAdd, concrete));
        assert!(!registry.has_observers(Event::OnRemove, concrete));
        assert!(!registry.has_observers(Event::OnAdd, Id::pair_index(42, 41)));
    }

    #[test]
    fn removed_observer_stops_matching() {
        let mut registry = ObserverRegistry::default();
        let id = Id::from_index(40);
        let handle = registry.insert(ObserverDesc::new(id, &Event::ALL, |_| {}).propagate());
        assert_eq!(registry.propagating, 1);
        assert_eq!(registry.remove(handle), Some(id));
        assert_eq!(registry.remove(handle), None);
        assert!(!registry.has_observers(Event::OnSet, id));
        assert_eq!(registry.propagating, 0);
    }

    #[test]
    fn churn_does_not_grow_the_registry() {
        let mut registry = ObserverRegistry::default();
        let keep = registry.insert(ObserverDesc::new(Id::from_index(40), &[Event::OnAdd], |_| {}));
        let mut last = keep;
        for _ in 0..100 {
            last = registry.insert(ObserverDesc::new(Id::from_index(41), &[Event::OnAdd], |_| {}));
            assert!(registry.remove(last).is_some());
        }
        assert_eq!(registry.observers.len(), 1);
        assert_eq!(registry.len(), 1);
        // Stale handles never reach a newer observer.
        let fresh = registry.insert(ObserverDesc::new(Id::from_index(42), &[Event::OnAdd], |_| {}));
        assert_ne!(fresh, last);
        assert_eq!(registry.remove(last), None);
        assert!(registry.has_observers(Event::OnAdd, Id::from_index(42)));
        assert_eq!(registry.remove(keep), Some(Id::from_index(40)));
    }
}
