//! Adding, removing and setting ids.
//!
//! Every structural change goes through [`World::commit`]:
//!
//! 1. the graph edge gives the destination table and the [`TableDiff`];
//! 2. observers and `on_remove` hooks see removed ids while their values are
//!    still readable;
//! 3. the row moves (shared columns are moved, added columns constructed,
//!    removed columns dropped) and both location records are fixed up;
//! 4. auxiliary storage of removed sparse ids is detached, added sparse ids
//!    get an entry;
//! 5. `on_add` hooks run in ascending id order, then `OnAdd` observers;
//! 6. `(IsA, base)` additions copy the base's data and emit `OnSet`.
//!
//! A rejected change never leaves the entity half moved.

use crate::commands::{CommandKind, RawComponentBuf};
use crate::component::HookFn;
use crate::component_index::ComponentFlags;
use crate::entity::{EntityId, RowFlags};
use crate::id::{builtin, Id};
use crate::observer::Event;
use crate::table::{TableFlags, TableId};
use crate::table_graph::{Edge, TableDiff};
use crate::world::World;
use crate::EcsError;

/// Plain trait ids whose presence is cached in component records.
const CACHED_TRAITS: [EntityId; 6] = [
    builtin::EXCLUSIVE,
    builtin::TRAVERSABLE,
    builtin::SPARSE,
    builtin::DONT_FRAGMENT,
    builtin::CAN_TOGGLE,
    builtin::PAIR_IS_TAG,
];

impl World {
    // -- checks -------------------------------------------------------------

    pub(crate) fn check_unlocked(&self, table: TableId) -> Result<(), EcsError> {
        match self.tables.get(table) {
            Some(t) if t.is_locked() => Err(EcsError::LockedStorage { table }),
            _ => Ok(()),
        }
    }

    /// Cached traits cannot change once the entity is used as an id.
    fn check_trait_change(&self, entity: EntityId, id: Id) -> Result<(), EcsError> {
        let is_cached_trait = if id.is_pair() {
            id.first() == builtin::ON_DELETE.index() || id.first() == builtin::ON_DELETE_TARGET.index()
        } else {
            CACHED_TRAITS.iter().any(|t| t.index() == id.first())
        };
        if is_cached_trait && self.is_used_as_id(entity) {
            return Err(EcsError::InvalidOperation {
                reason: format!(
                    "cannot change trait {} of {} while it is in use as an id",
                    self.id_str(id),
                    self.id_str(Id::entity(entity))
                ),
            });
        }
        Ok(())
    }

    fn current_table(&self, entity: EntityId) -> Result<TableId, EcsError> {
        Ok(self.check_alive(entity)?.table.unwrap_or(self.root))
    }

    fn record_flags(&self, id: Id) -> ComponentFlags {
        self.components
            .get_by_id(id)
            .map_or(ComponentFlags::empty(), |r| r.flags())
    }

    fn hook_for(&self, id: Id, event: Event) -> Option<HookFn> {
        let record = self.components.get_by_id(id)?;
        let hooks = record.type_info()?.hooks();
        match event {
            Event::OnAdd => hooks.on_add.clone(),
            Event::OnRemove => hooks.on_remove.clone(),
            Event::OnSet => hooks.on_set.clone(),
        }
    }

    // -- notifications ------------------------------------------------------

    /// Observers, then `on_remove` hooks, for ids about to be removed.
    pub(crate) fn notify_remove(&mut self, table: Option<TableId>, entities: &[EntityId], ids: &[Id]) {
        self.emit(Event::OnRemove, ids, table, entities);
        for &id in ids {
            if !self.record_flags(id).contains(ComponentFlags::HAS_ON_REMOVE) {
                continue;
            }
            if let Some(hook) = self.hook_for(id, Event::OnRemove) {
                self.invoke_callback(&hook, Event::OnRemove, id, table, entities, None);
            }
        }
    }

    /// `on_add` hooks in ascending id order, then observers.
    pub(crate) fn notify_add(&mut self, table: Option<TableId>, entities: &[EntityId], ids: &[Id]) {
        for &id in ids {
            if !self.record_flags(id).contains(ComponentFlags::HAS_ON_ADD) {
                continue;
            }
            if let Some(hook) = self.hook_for(id, Event::OnAdd) {
                self.invoke_callback(&hook, Event::OnAdd, id, table, entities, None);
            }
        }
        self.emit(Event::OnAdd, ids, table, entities);
    }

    /// `on_set` hook, then observers.
    pub(crate) fn notify_set(&mut self, entities: &[EntityId], id: Id) {
        let table = entities
            .first()
            .and_then(|e| self.entities.get(*e))
            .and_then(|r| r.table);
        if self.record_flags(id).contains(ComponentFlags::HAS_ON_SET) {
            if let Some(hook) = self.hook_for(id, Event::OnSet) {
                self.invoke_callback(&hook, Event::OnSet, id, table, entities, None);
            }
        }
        self.emit(Event::OnSet, &[id], table, entities);
    }

    // -- commit -------------------------------------------------------------

    /// Move `entity` along `edge`, running the full notification protocol.
    pub(crate) fn commit(&mut self, entity: EntityId, edge: Edge) -> Result<(), EcsError> {
        let src = self.current_table(entity)?;
        if src == edge.to {
            return Ok(());
        }
        self.check_unlocked(src)?;
        self.check_unlocked(edge.to)?;

        let mut edge = edge;
        if !edge.diff.removed.is_empty() {
            self.notify_remove(Some(src), &[entity], &edge.diff.removed);
            // Callbacks may have moved or deleted the entity.
            let Some(now) = self.entities.get(entity).map(|r| r.table.unwrap_or(self.root)) else {
                return Ok(());
            };
            if now != src {
                let mut type_ids = self.table(now).map(|t| t.type_ids().to_vec()).unwrap_or_default();
                type_ids.retain(|id| edge.diff.removed.binary_search(id).is_err());
                type_ids.extend(edge.diff.added.iter().copied());
                edge = self.transition(now, type_ids)?;
                if edge.to == now {
                    return Ok(());
                }
                self.check_unlocked(now)?;
                self.check_unlocked(edge.to)?;
            }
        }
        self.move_entity(entity, &edge)
    }

    /// Physical move plus the add side of the protocol.
    fn move_entity(&mut self, entity: EntityId, edge: &Edge) -> Result<(), EcsError> {
        let location = *self.check_alive(entity)?;
        let src = location.table.unwrap_or(self.root);
        let dst = edge.to;
        let src_row = location.row as usize;

        let (dst_row, swapped, src_empty, dst_count) = {
            let Some((s, d)) = self.tables.pair_mut(src, dst) else {
                crate::ecs_internal!("cannot borrow {src} and {dst} for a move");
            };
            let (dst_row, swapped) = s.move_row(src_row, d);
            (dst_row, swapped, s.is_empty(), d.count())
        };
        if let Some(record) = self.entities.get_mut(entity) {
            record.table = Some(dst);
            record.row = dst_row as u32;
        }
        if let Some(moved) = swapped {
            if let Some(record) = self.entities.get_mut(moved) {
                record.row = src_row as u32;
            }
        }
        if dst_count == 1 {
            self.set_table_active(dst, true);
        }
        if src_empty {
            self.set_table_active(src, false);
        }
        tracing::trace!(%entity, from = %src, to = %dst, "entity moved");

        self.update_sparse(&[entity], &edge.diff);
        self.notify_add(Some(dst), &[entity], &edge.diff.added);
        if edge.diff.added_flags.contains(TableFlags::HAS_IS_A) {
            self.instantiate_all(entity, &edge.diff.added)?;
        }
        Ok(())
    }

    /// Detach removed and attach added sparse ids for moved entities.
    fn update_sparse(&mut self, entities: &[EntityId], diff: &TableDiff) {
        if !diff.removed_flags.contains(TableFlags::HAS_SPARSE)
            && !diff.added_flags.contains(TableFlags::HAS_SPARSE)
        {
            return;
        }
        for &id in &diff.removed {
            if let Some(store) = self.components.get_by_id_mut(id).and_then(|r| r.sparse.as_mut()) {
                for &e in entities {
                    store.remove(e);
                }
            }
        }
        for &id in &diff.added {
            if let Some(store) = self.components.get_by_id_mut(id).and_then(|r| r.sparse.as_mut()) {
                for &e in entities {
                    store.insert(e);
                }
            }
        }
    }

    /// Move every row of `src` along `edge` at once.
    ///
    /// Used by bulk operations and cleanup. Notifications are batched per
    /// table.
    pub(crate) fn move_all_rows(&mut self, src: TableId, edge: Edge) -> Result<(), EcsError> {
        let dst = edge.to;
        if src == dst {
            return Ok(());
        }
        self.check_unlocked(src)?;
        self.check_unlocked(dst)?;
        let entities = match self.tables.get(src) {
            Some(t) if !t.is_empty() => t.entities().to_vec(),
            _ => return Ok(()),
        };
        if !edge.diff.removed.is_empty() {
            self.notify_remove(Some(src), &entities, &edge.diff.removed);
        }

        let (start, moved, dst_was_empty) = {
            let Some((s, d)) = self.tables.pair_mut(src, dst) else {
                crate::ecs_internal!("cannot borrow {src} and {dst} for a merge");
            };
            let dst_was_empty = d.is_empty();
            let start = s.merge_into(d);
            (start, d.entities()[start..].to_vec(), dst_was_empty)
        };
        if moved.is_empty() {
            return Ok(());
        }
        for (offset, &e) in moved.iter().enumerate() {
            if let Some(record) = self.entities.get_mut(e) {
                record.table = Some(dst);
                record.row = (start + offset) as u32;
            }
        }
        if dst_was_empty {
            self.set_table_active(dst, true);
        }
        self.set_table_active(src, false);
        tracing::trace!(from = %src, to = %dst, count = moved.len(), "table merged");

        self.update_sparse(&moved, &edge.diff);
        self.notify_add(Some(dst), &moved, &edge.diff.added);
        if edge.diff.added_flags.contains(TableFlags::HAS_IS_A) {
            for &e in &moved {
                self.instantiate_all(e, &edge.diff.added)?;
            }
        }
        Ok(())
    }

    // -- prototypes ---------------------------------------------------------

    fn instantiate_all(&mut self, entity: EntityId, added: &[Id]) -> Result<(), EcsError> {
        for &id in added {
            if id.is_pair() && !id.is_toggle() && id.first() == builtin::IS_A.index() {
                if let Some(base) = self.entities.get_alive(id.second()) {
                    self.instantiate(entity, base)?;
                }
            }
        }
        Ok(())
    }

    /// Copy every data value `base` owns that `entity` lacks, sparse and
    /// non-fragmenting values included.
    fn instantiate(&mut self, entity: EntityId, base: EntityId) -> Result<(), EcsError> {
        let Some(table) = self.table_of(base) else {
            return Ok(());
        };
        let mut ids: Vec<Id> = table.column_ids().collect();
        ids.extend(table.type_ids().iter().copied().filter(|&id| {
            self.components
                .get_by_id(id)
                .is_some_and(|r| r.sparse().is_some_and(|s| s.contains(base)))
        }));
        ids.extend(
            self.components
                .non_fragmenting
                .iter()
                .filter_map(|rid| self.components.get(*rid))
                .filter(|r| r.sparse().is_some_and(|s| s.contains(base)))
                .map(|r| r.id()),
        );
        ids.sort_unstable();
        ids.dedup();
        for id in ids {
            if !self.is_alive(entity) {
                break;
            }
            if self.has_id(entity, id) {
                continue;
            }
            let Some(info) = self.type_info_for_id(id) else {
                continue;
            };
            let Some(ptr) = self.value_ptr(base, id) else {
                continue;
            };
            // SAFETY: ptr addresses a live value of the type described by info.
            let value = unsafe { RawComponentBuf::from_clone(&info, ptr)? };
            self.set_raw(entity, id, value)?;
        }
        tracing::trace!(%entity, %base, "instantiated from base");
        Ok(())
    }

    /// Pointer to the value of `id` owned by `entity`.
    pub(crate) fn value_ptr(&self, entity: EntityId, id: Id) -> Option<*const u8> {
        let location = self.entities.get(entity)?;
        if let Some(store) = self.components.get_by_id(id).and_then(|r| r.sparse()) {
            return store.get_ptr(entity);
        }
        let table = self.tables.get(location.table?)?;
        let column = table.column_index(id)?;
        let row = location.row as usize;
        if row >= table.count() {
            return None;
        }
        // SAFETY: row < count == column length.
        Some(unsafe { table.columns[column].data.get_raw(row) })
    }

    // -- non-fragmenting ids ------------------------------------------------

    /// Non-fragmenting ids on `entity` matching `pattern`.
    pub(crate) fn non_fragmenting_matches(&self, entity: EntityId, pattern: Id) -> Vec<Id> {
        let flagged = self
            .entities
            .get(entity)
            .is_some_and(|r| r.flags.contains(RowFlags::HAS_DONT_FRAGMENT));
        if !flagged {
            return Vec::new();
        }
        self.components
            .non_fragmenting
            .iter()
            .filter_map(|rid| self.components.get(*rid))
            .filter(|r| r.id() == pattern || r.id().matches(pattern))
            .filter(|r| r.sparse().is_some_and(|s| s.contains(entity)))
            .map(|r| r.id())
            .collect()
    }

    fn add_non_fragmenting(&mut self, entity: EntityId, id: Id) -> Result<(), EcsError> {
        if id.is_pair() && self.index_has_id(id.first(), Id::entity(builtin::EXCLUSIVE)) {
            let rel = Id::pair_index(id.first(), builtin::WILDCARD_INDEX);
            for other in self.non_fragmenting_matches(entity, rel) {
                if other != id {
                    self.remove_non_fragmenting(entity, other)?;
                }
            }
        }
        let rid = self.ensure_record(id)?;
        let Some(record) = self.components.get_mut(rid) else {
            crate::ecs_internal!("record for {id} vanished");
        };
        let Some(store) = record.sparse.as_mut() else {
            crate::ecs_internal!("non-fragmenting {id} has no store");
        };
        if !store.insert(entity) {
            return Ok(());
        }
        // The first entry keeps the record alive without any table.
        if store.len() == 1 {
            record.refcount += 1;
        }
        if let Some(location) = self.entities.get_mut(entity) {
            location.flags.insert(RowFlags::HAS_DONT_FRAGMENT);
        }
        let table = self.entities.get(entity).and_then(|r| r.table);
        self.notify_add(table, &[entity], &[id]);
        Ok(())
    }

    pub(crate) fn remove_non_fragmenting(&mut self, entity: EntityId, id: Id) -> Result<(), EcsError> {
        let table = self.entities.get(entity).and_then(|r| r.table);
        self.notify_remove(table, &[entity], &[id]);
        let Some(rid) = self.components.lookup(id) else {
            return Ok(());
        };
        let now_empty = match self.components.get_mut(rid).and_then(|r| r.sparse.as_mut()) {
            Some(store) => store.remove(entity) && store.is_empty(),
            None => false,
        };
        if now_empty {
            self.release_record(rid);
        }
        Ok(())
    }

    // -- structural API -----------------------------------------------------

    /// Add `id` to `entity`. Adding an id the entity already has is a no-op.
    pub fn add_id(&mut self, entity: EntityId, id: Id) -> Result<(), EcsError> {
        self.check_alive(entity)?;
        if id.is_wildcard() {
            return Err(EcsError::InvalidId {
                id,
                reason: "cannot add a wildcard id".to_owned(),
            });
        }
        self.validate_id(id)?;
        if self.is_deferred() {
            self.enqueue(entity, CommandKind::Add(id));
            return Ok(());
        }
        self.check_trait_change(entity, id)?;
        if self.is_non_fragmenting(id) {
            return self.add_non_fragmenting(entity, id);
        }
        let src = self.current_table(entity)?;
        let edge = self.traverse_add(src, id)?;
        self.commit(entity, edge)
    }

    /// Remove `id` (or every id matching a wildcard) from `entity`.
    pub fn remove_id(&mut self, entity: EntityId, id: Id) -> Result<(), EcsError> {
        self.check_alive(entity)?;
        self.validate_id(id)?;
        if self.is_deferred() {
            self.enqueue(entity, CommandKind::Remove(id));
            return Ok(());
        }
        self.check_trait_change(entity, id)?;
        for matched in self.non_fragmenting_matches(entity, id) {
            self.remove_non_fragmenting(entity, matched)?;
        }
        let src = self.current_table(entity)?;
        if !self.tables.get(src).is_some_and(|t| t.has_id(id)) {
            return Ok(());
        }
        let edge = self.traverse_remove(src, id)?;
        self.commit(entity, edge)
    }

    pub fn add_pair(&mut self, entity: EntityId, rel: EntityId, target: EntityId) -> Result<(), EcsError> {
        let id = self.pair_id(rel, target)?;
        self.add_id(entity, id)
    }

    pub fn remove_pair(&mut self, entity: EntityId, rel: EntityId, target: EntityId) -> Result<(), EcsError> {
        let id = self.pair_id(rel, target)?;
        self.remove_id(entity, id)
    }

    /// Add the component `T` with its default value.
    pub fn add<T: 'static>(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let id = self.component_id::<T>()?;
        self.add_id(entity, id)
    }

    pub fn remove<T: 'static>(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let id = self.component_id::<T>()?;
        self.remove_id(entity, id)
    }

    /// Write the component `T`, adding it first if needed, then emit `OnSet`.
    pub fn set<T: Send + 'static>(&mut self, entity: EntityId, value: T) -> Result<(), EcsError> {
        let id = self.component_id::<T>()?;
        self.set_id(entity, id, value)
    }

    /// Write the value of a data pair `(rel, target)`.
    pub fn set_pair<T: Send + 'static>(
        &mut self,
        entity: EntityId,
        rel: EntityId,
        target: EntityId,
        value: T,
    ) -> Result<(), EcsError> {
        let id = self.pair_id(rel, target)?;
        self.set_id(entity, id, value)
    }

    /// Write the value of `id`, adding it first if needed, then emit `OnSet`.
    pub fn set_id<T: Send + 'static>(&mut self, entity: EntityId, id: Id, value: T) -> Result<(), EcsError> {
        self.check_alive(entity)?;
        let info = self.type_info_for_id(id).ok_or_else(|| EcsError::UnknownComponent {
            name: self.id_str(id),
        })?;
        if !info.is::<T>() {
            return Err(EcsError::TypeMismatch {
                id: self.id_str(id),
                expected: info.name.clone(),
                found: std::any::type_name::<T>().to_owned(),
            });
        }
        if !self.is_deferred() && self.has_id(entity, id) {
            if let Some(slot) = self.get_own_mut::<T>(entity, id) {
                *slot = value;
                self.notify_set(&[entity], id);
                return Ok(());
            }
        }
        self.set_raw(entity, id, RawComponentBuf::from_value(value))
    }

    /// Write raw bytes into a plain-data component.
    pub fn set_bytes(&mut self, entity: EntityId, id: Id, bytes: &[u8]) -> Result<(), EcsError> {
        self.check_alive(entity)?;
        let info = self.type_info_for_id(id).ok_or_else(|| EcsError::UnknownComponent {
            name: self.id_str(id),
        })?;
        if !info.is_pod() || info.size != bytes.len() {
            return Err(EcsError::TypeMismatch {
                id: self.id_str(id),
                expected: format!("{} ({} plain bytes)", info.name, info.size),
                found: format!("{} bytes", bytes.len()),
            });
        }
        let value = RawComponentBuf::from_bytes(bytes, info.align)?;
        self.set_raw(entity, id, value)
    }

    /// Move an owned value into `id` of `entity`.
    pub(crate) fn set_raw(&mut self, entity: EntityId, id: Id, value: RawComponentBuf) -> Result<(), EcsError> {
        self.check_alive(entity)?;
        if self.is_deferred() {
            self.enqueue(entity, CommandKind::Set { id, value });
            return Ok(());
        }
        let info = self.type_info_for_id(id).ok_or_else(|| EcsError::UnknownComponent {
            name: self.id_str(id),
        })?;
        if info.size != value.size() {
            return Err(EcsError::TypeMismatch {
                id: self.id_str(id),
                expected: info.name.clone(),
                found: format!("{} bytes", value.size()),
            });
        }
        if !self.has_id(entity, id) {
            self.add_id(entity, id)?;
        }
        // on_add hooks may have deleted the entity.
        let location = *self.check_alive(entity)?;

        let sparse = self
            .components
            .get_by_id(id)
            .is_some_and(|r| r.sparse().is_some_and(|s| s.contains(entity)));
        if sparse {
            let Some(store) = self.components.get_by_id_mut(id).and_then(|r| r.sparse.as_mut()) else {
                crate::ecs_internal!("sparse store for {id} vanished");
            };
            // SAFETY: the buffer holds a value of the store's type (size
            // checked above); ownership moves into the store.
            value.take_into(|ptr| unsafe { store.replace_raw(entity, ptr) });
        } else {
            let table_id = location.table.unwrap_or(self.root);
            let Some(table) = self.tables.get_mut(table_id) else {
                crate::ecs_internal!("{entity} points at missing {table_id}");
            };
            let Some(column) = table.column_index(id) else {
                return Err(EcsError::InvalidOperation {
                    reason: format!("{} does not carry data on {entity}", self.id_str(id)),
                });
            };
            let row = location.row as usize;
            // SAFETY: row < count; the buffer holds a value of the column's
            // type (size checked above); ownership moves into the column.
            value.take_into(|ptr| unsafe { table.columns[column].data.replace_raw(row, ptr) });
        }
        self.notify_set(&[entity], id);
        Ok(())
    }

    /// Emit `OnSet` for a value changed in place.
    pub fn modified(&mut self, entity: EntityId, id: Id) -> Result<(), EcsError> {
        self.check_alive(entity)?;
        if self.is_deferred() {
            self.enqueue(entity, CommandKind::Modified(id));
            return Ok(());
        }
        if !self.has_id(entity, id) {
            return Err(EcsError::InvalidParameter {
                reason: format!("{entity} does not have {}", self.id_str(id)),
            });
        }
        self.notify_set(&[entity], id);
        Ok(())
    }

    /// Enable or disable a `CanToggle` id on `entity`.
    ///
    /// The first disable adds a toggle entry (and bit column) to the type.
    pub fn enable_id(&mut self, entity: EntityId, id: Id, enabled: bool) -> Result<(), EcsError> {
        self.check_alive(entity)?;
        if self.is_deferred() {
            self.enqueue(entity, CommandKind::Enable { id, enabled });
            return Ok(());
        }
        if id.is_wildcard() || id.is_toggle() {
            return Err(EcsError::InvalidId {
                id,
                reason: "toggle a concrete id".to_owned(),
            });
        }
        if !self.has_id(entity, id) {
            return Err(EcsError::InvalidParameter {
                reason: format!("{entity} does not have {}", self.id_str(id)),
            });
        }
        if !self.record_flags(id).contains(ComponentFlags::CAN_TOGGLE) {
            return Err(EcsError::InvalidOperation {
                reason: format!("{} is not marked CanToggle", self.id_str(id)),
            });
        }
        let src = self.current_table(entity)?;
        let has_toggle = self.tables.get(src).is_some_and(|t| t.bitset(id).is_some());
        if !has_toggle {
            if enabled {
                return Ok(());
            }
            let edge = self.traverse_add(src, id.toggle())?;
            self.commit(entity, edge)?;
        }
        let location = *self.check_alive(entity)?;
        let table_id = location.table.unwrap_or(self.root);
        if let Some(bits) = self.tables.get_mut(table_id).and_then(|t| t.bitset_mut(id)) {
            bits.set(location.row as usize, enabled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::component::TypeHooks;
    use crate::observer::{EventIter, ObserverDesc};

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Health(u32);

    #[test]
    fn add_and_remove_tags() {
        let mut world = World::new();
        let a = Id::entity(world.new_entity());
        let b = Id::entity(world.new_entity());
        let e = world.new_entity();
        world.add_id(e, b).unwrap();
        world.add_id(e, a).unwrap();
        assert_eq!(world.type_of(e).unwrap(), &[a, b]);
        world.remove_id(e, a).unwrap();
        assert_eq!(world.type_of(e).unwrap(), &[b]);
        // Removing an absent id is a no-op.
        world.remove_id(e, a).unwrap();
        assert_eq!(world.type_of(e).unwrap(), &[b]);
    }

    #[test]
    fn set_adds_and_writes() {
        let mut world = World::new();
        world.register_component::<Position>("Position");
        let e = world.new_entity();
        world.set(e, Position { x: 1.0, y: 2.0 }).unwrap();
        assert_eq!(world.get::<Position>(e), Some(&Position { x: 1.0, y: 2.0 }));
        world.set(e, Position { x: 3.0, y: 4.0 }).unwrap();
        assert_eq!(world.get::<Position>(e).unwrap().x, 3.0);
    }

    #[test]
    fn set_rejects_wrong_type() {
        let mut world = World::new();
        let pos = world.register_component::<Position>("Position");
        let e = world.new_entity();
        let err = world.set_id(e, Id::entity(pos), Health(3)).unwrap_err();
        assert!(matches!(err, EcsError::TypeMismatch { .. }));
        assert!(matches!(world.set(e, 5u64), Err(EcsError::UnknownComponent { .. })));
    }

    #[test]
    fn swap_remove_fixes_moved_entity() {
        let mut world = World::new();
        world.register_component::<Health>("Health");
        let entities: Vec<EntityId> = (0..3).map(|_| world.new_entity()).collect();
        for (i, &e) in entities.iter().enumerate() {
            world.set(e, Health(i as u32)).unwrap();
        }
        world.remove::<Health>(entities[0]).unwrap();
        assert_eq!(world.get::<Health>(entities[2]), Some(&Health(2)));
        assert_eq!(world.get::<Health>(entities[1]), Some(&Health(1)));
        assert_eq!(world.get::<Health>(entities[0]), None);
    }

    #[test]
    fn instantiation_adds_base_components_in_id_order() {
        let mut world = World::new();
        let pos = world.register_component::<Position>("Position");
        let hp = world.register_component::<Health>("Health");
        let log = Arc::new(Mutex::new(Vec::new()));
        for (c, name) in [(hp, "hp"), (pos, "pos")] {
            let log = Arc::clone(&log);
            world
                .set_hooks(c, TypeHooks::new().on_add(move |_| log.lock().unwrap().push(name)))
                .unwrap();
        }
        let observer_log = Arc::clone(&log);
        world.observe(ObserverDesc::new(Id::entity(pos), &[Event::OnAdd], move |_| {
            observer_log.lock().unwrap().push("observer")
        }));

        let base = world.new_entity();
        world.add_id(base, Id::entity(pos)).unwrap();
        world.add_id(base, Id::entity(hp)).unwrap();
        log.lock().unwrap().clear();

        let e = world.new_entity();
        world.add_id(e, Id::pair(builtin::IS_A, base)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["pos", "observer", "hp"]);
    }

    /// Hooks and observers for `ids` that append `<event>:<name>@<where>` to
    /// the returned log, where `<where>` tells whether `marker` was still on
    /// the entity when the callback ran.
    fn record_protocol(
        world: &mut World,
        ids: &[(EntityId, &'static str)],
        marker: Id,
    ) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let at = move |it: &EventIter<'_>| {
            let present = it.entities().first().is_some_and(|e| it.world().has_id(*e, marker));
            if present { "src" } else { "dst" }
        };
        for &(c, name) in ids {
            let (l_add, l_rm, l_set) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));
            world
                .set_hooks(
                    c,
                    TypeHooks::new()
                        .on_add(move |it| l_add.lock().unwrap().push(format!("add:{name}@{}", at(&*it))))
                        .on_remove(move |it| l_rm.lock().unwrap().push(format!("remove:{name}@{}", at(&*it))))
                        .on_set(move |it| l_set.lock().unwrap().push(format!("set:{name}@{}", at(&*it)))),
                )
                .unwrap();
            let l_obs = Arc::clone(&log);
            world.observe(ObserverDesc::new(
                Id::entity(c),
                &[Event::OnAdd, Event::OnRemove, Event::OnSet],
                move |it| {
                    let event = match it.event() {
                        Event::OnAdd => "obs-add",
                        Event::OnRemove => "obs-remove",
                        Event::OnSet => "obs-set",
                    };
                    l_obs.lock().unwrap().push(format!("{event}:{name}@{}", at(&*it)));
                },
            ));
        }
        log
    }

    #[test]
    fn multi_id_commit_follows_notification_order() {
        #[derive(Debug, Default, Clone, PartialEq)]
        struct Mana(u32);

        let mut world = World::new();
        let pos = world.register_component::<Position>("Position");
        let hp = world.register_component::<Health>("Health");
        let mana = world.register_component::<Mana>("Mana");
        let marker = Id::entity(world.new_entity());

        let e = world.new_entity();
        world.add_id(e, Id::entity(pos)).unwrap();
        world.add_id(e, marker).unwrap();
        let log = record_protocol(&mut world, &[(pos, "pos"), (hp, "hp"), (mana, "mana")], marker);

        // {Position, marker} -> {Health, Mana} in a single move.
        let src = world.record(e).unwrap().table.unwrap();
        let mut to_type = vec![Id::entity(hp), Id::entity(mana)];
        to_type.sort();
        let edge = world.transition(src, to_type).unwrap();
        world.commit(e, edge).unwrap();
        world.set(e, Health(3)).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "obs-remove:pos@src",
                "remove:pos@src",
                "add:hp@dst",
                "add:mana@dst",
                "obs-add:hp@dst",
                "obs-add:mana@dst",
                "set:hp@dst",
                "obs-set:hp@dst",
            ]
        );
    }

    #[test]
    fn clear_notifies_every_removed_id_before_the_move() {
        let mut world = World::new();
        let pos = world.register_component::<Position>("Position");
        let hp = world.register_component::<Health>("Health");
        let marker = Id::entity(world.new_entity());

        let e = world.new_entity();
        world.add_id(e, Id::entity(hp)).unwrap();
        world.add_id(e, Id::entity(pos)).unwrap();
        world.add_id(e, marker).unwrap();
        let log = record_protocol(&mut world, &[(pos, "pos"), (hp, "hp")], marker);

        world.clear(e).unwrap();
        assert!(world.type_of(e).unwrap().is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "obs-remove:pos@src",
                "obs-remove:hp@src",
                "remove:pos@src",
                "remove:hp@src",
            ]
        );
    }

    #[test]
    fn on_remove_sees_value() {
        let mut world = World::new();
        let hp = world.register_component::<Health>("Health");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_hook = Arc::clone(&seen);
        world
            .set_hooks(
                hp,
                TypeHooks::new().on_remove(move |it| {
                    let value = it.field::<Health>(0).map_or(0, |h| h.0);
                    seen_hook.store(value as usize, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let e = world.new_entity();
        world.set(e, Health(42)).unwrap();
        world.remove::<Health>(e).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn hook_changes_apply_immediately() {
        let mut world = World::new();
        let hp = world.register_component::<Health>("Health");
        let marker = Id::entity(world.new_entity());
        world
            .set_hooks(
                hp,
                TypeHooks::new().on_add(move |it| {
                    let e = it.entities()[0];
                    it.world_mut().add_id(e, marker).unwrap();
                }),
            )
            .unwrap();
        let e = world.new_entity();
        world.defer_begin();
        world.add::<Health>(e).unwrap();
        assert!(!world.has::<Health>(e));
        world.defer_end();
        assert!(world.has::<Health>(e));
        assert!(world.has_id(e, marker));
    }

    #[test]
    fn on_set_fires_after_set() {
        let mut world = World::new();
        let hp = world.register_component::<Health>("Health");
        let sets = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sets);
        world.observe(ObserverDesc::new(Id::entity(hp), &[Event::OnSet], move |it| {
            assert_eq!(it.field::<Health>(0), Some(&Health(7)));
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let e = world.new_entity();
        world.add::<Health>(e).unwrap();
        assert_eq!(sets.load(Ordering::SeqCst), 0);
        world.set(e, Health(7)).unwrap();
        assert_eq!(sets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn is_a_copies_base_values() {
        let mut world = World::new();
        world.register_component::<Health>("Health");
        let base = world.new_entity();
        world.add_id(base, Id::entity(builtin::PREFAB)).unwrap();
        world.set(base, Health(100)).unwrap();
        let e = world.new_entity();
        world.add_pair(e, builtin::IS_A, base).unwrap();
        assert_eq!(world.get::<Health>(e), Some(&Health(100)));
        world.set(e, Health(5)).unwrap();
        assert_eq!(world.get::<Health>(base), Some(&Health(100)));
    }

    #[test]
    fn is_a_copies_sparse_and_non_fragmenting_values() {
        for storage in [builtin::SPARSE, builtin::DONT_FRAGMENT] {
            let mut world = World::new();
            let hp = world.register_component::<Health>("Health");
            world.add_id(hp, Id::entity(storage)).unwrap();
            let base = world.new_entity();
            world.set(base, Health(100)).unwrap();

            let e = world.new_entity();
            world.add_pair(e, builtin::IS_A, base).unwrap();
            assert!(world.has::<Health>(e), "{storage}");
            assert_eq!(world.get::<Health>(e), Some(&Health(100)));

            // The copy is owned: writing it leaves the base alone.
            world.set(e, Health(1)).unwrap();
            assert_eq!(world.get::<Health>(base), Some(&Health(100)));
            assert_eq!(world.get::<Health>(e), Some(&Health(1)));
        }
    }

    #[test]
    fn exclusive_pair_keeps_single_target() {
        let mut world = World::new();
        let p1 = world.new_entity();
        let p2 = world.new_entity();
        let child = world.new_entity();
        world.add_pair(child, builtin::CHILD_OF, p1).unwrap();
        world.add_pair(child, builtin::CHILD_OF, p2).unwrap();
        assert_eq!(world.parent(child), Some(p2));
        assert!(!world.has_pair(child, builtin::CHILD_OF, p1));
    }

    #[test]
    fn sparse_component_lives_outside_columns() {
        let mut world = World::new();
        let hp = world.register_component::<Health>("Health");
        world.add_id(hp, Id::entity(builtin::SPARSE)).unwrap();
        let e = world.new_entity();
        world.set(e, Health(9)).unwrap();
        assert_eq!(world.get::<Health>(e), Some(&Health(9)));
        assert_eq!(world.type_of(e).unwrap(), &[Id::entity(hp)]);
        assert!(world.table_of(e).unwrap().column_index(Id::entity(hp)).is_none());
        world.remove::<Health>(e).unwrap();
        assert!(!world.has::<Health>(e));
        let store = world.component_record(Id::entity(hp)).and_then(|r| r.sparse());
        assert!(store.map_or(true, |s| s.is_empty()));
    }

    #[test]
    fn dont_fragment_keeps_table() {
        let mut world = World::new();
        let hp = world.register_component::<Health>("Health");
        world.add_id(hp, Id::entity(builtin::DONT_FRAGMENT)).unwrap();
        let e = world.new_entity();
        let before = world.record(e).unwrap().table;
        world.set(e, Health(3)).unwrap();
        assert_eq!(world.record(e).unwrap().table, before);
        assert!(world.has::<Health>(e));
        assert_eq!(world.get::<Health>(e), Some(&Health(3)));
        world.remove::<Health>(e).unwrap();
        assert!(!world.has::<Health>(e));
        assert!(world.component_record(Id::entity(hp)).is_none());
    }

    #[test]
    fn traits_are_frozen_once_in_use() {
        let mut world = World::new();
        let rel = world.new_entity();
        let target = world.new_entity();
        let e = world.new_entity();
        world.add_pair(e, rel, target).unwrap();
        let err = world.add_id(rel, Id::entity(builtin::EXCLUSIVE)).unwrap_err();
        assert!(matches!(err, EcsError::InvalidOperation { .. }));
    }

    #[test]
    fn toggles_flip_bits_without_changing_presence() {
        let mut world = World::new();
        let hp = world.register_component::<Health>("Health");
        world.add_id(hp, Id::entity(builtin::CAN_TOGGLE)).unwrap();
        let e = world.new_entity();
        world.set(e, Health(1)).unwrap();
        let id = Id::entity(hp);
        assert!(world.is_enabled(e, id));
        world.enable_id(e, id, false).unwrap();
        assert!(!world.is_enabled(e, id));
        assert!(world.has_id(e, id));
        assert!(world.type_of(e).unwrap().contains(&id.toggle()));
        world.enable_id(e, id, true).unwrap();
        assert!(world.is_enabled(e, id));
        world.remove_id(e, id).unwrap();
        assert!(world.type_of(e).unwrap().is_empty());
    }

    #[test]
    fn toggle_requires_trait() {
        let mut world = World::new();
        let hp = world.register_component::<Health>("Health");
        let e = world.new_entity();
        world.add::<Health>(e).unwrap();
        assert!(matches!(
            world.enable_id(e, Id::entity(hp), false),
            Err(EcsError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn constraint_violations_are_reported() {
        let mut world = World::new();
        let base = world.new_entity();
        world.add_id(base, Id::entity(builtin::FINAL)).unwrap();
        let e = world.new_entity();
        let err = world.add_pair(e, builtin::IS_A, base).unwrap_err();
        assert!(matches!(err, EcsError::ConstraintViolated { .. }));
        assert_eq!(world.type_of(e).unwrap(), &[] as &[Id]);
    }

    #[test]
    fn soft_asserts_downgrade_violations() {
        let config = crate::config::WorldConfig {
            soft_asserts: true,
            ..Default::default()
        };
        let mut world = World::with_config(config);
        let base = world.new_entity();
        world.add_id(base, Id::entity(builtin::FINAL)).unwrap();
        let e = world.new_entity();
        world.add_pair(e, builtin::IS_A, base).unwrap();
        assert!(world.has_pair(e, builtin::IS_A, base));
    }

    #[test]
    fn adding_wildcard_is_rejected() {
        let mut world = World::new();
        let e = world.new_entity();
        assert!(matches!(
            world.add_id(e, Id::pair(builtin::CHILD_OF, builtin::WILDCARD)),
            Err(EcsError::InvalidId { .. })
        ));
    }

    #[test]
    fn oversized_relationship_is_rejected() {
        let mut world = World::new();
        let parent = world.new_entity();
        let e = world.new_entity();
        // Truncated to 24 bits this index would alias ChildOf.
        let big = EntityId::new((1 << 24) + builtin::CHILD_OF.index(), 0);
        world.make_alive(big).unwrap();

        assert!(matches!(world.add_pair(e, big, parent), Err(EcsError::InvalidId { .. })));
        assert!(matches!(world.set_pair(e, big, parent, 1u32), Err(EcsError::InvalidId { .. })));
        assert!(matches!(world.remove_pair(e, big, parent), Err(EcsError::InvalidId { .. })));
        assert!(!world.has_pair(e, builtin::CHILD_OF, parent));
        assert!(!world.has_pair(e, big, parent));
        assert!(world.targets(e, big).is_empty());

        // Still usable as a target, and deletable.
        world.add_pair(e, builtin::CHILD_OF, big).unwrap();
        assert_eq!(world.targets(e, builtin::CHILD_OF), vec![big]);
        world.delete(big).unwrap();
        assert!(!world.is_alive(e));
    }

    #[test]
    fn stale_entity_is_rejected() {
        let mut world = World::new();
        let tag = Id::entity(world.new_entity());
        let e = world.new_entity();
        world.delete(e).unwrap();
        assert!(matches!(world.add_id(e, tag), Err(EcsError::StaleEntity { .. })));
    }
}
