//! Entity deletion, cleanup policies and bulk operations.
//!
//! Deleting an entity that is used as an id first decides what happens to
//! every entity carrying that id, following the `(OnDelete, policy)` trait
//! of the id (for `e` and `(e, *)`) and the `(OnDeleteTarget, policy)` trait
//! of the relationship (for `(R, e)`):
//!
//! - `Remove` strips the id, moving whole tables at once;
//! - `Delete` deletes the holders too, cascading;
//! - `Panic` refuses the delete before anything changes.
//!
//! The plan is computed up front so a refused delete leaves the world
//! untouched.

use std::collections::HashSet;

use crate::commands::CommandKind;
use crate::component_index::CleanupPolicy;
use crate::entity::EntityId;
use crate::id::{builtin, Id};
use crate::table::{TableFlags, TableId};
use crate::world::World;
use crate::EcsError;

/// What a delete will do.
#[derive(Debug, Default)]
struct DeletePlan {
    /// Entities to delete, in discovery order.
    entities: Vec<EntityId>,
    /// Ids to strip from every holder.
    strip: Vec<Id>,
}

/// Record keys that mention `entity`. Plain and toggle ids come first,
/// then the pair wildcards. An entity past the relationship index range
/// can only appear as a target.
fn own_keys(entity: EntityId) -> Vec<Id> {
    let index = entity.index();
    let mut keys = vec![Id::from_index(index), Id::from_index(index).toggle()];
    keys.extend(Id::try_pair_index(index, builtin::WILDCARD_INDEX));
    keys.push(Id::pair_index(builtin::WILDCARD_INDEX, index));
    keys
}

impl World {
    /// Every id mentioning `entity` that has a record: the plain id, its
    /// toggle, both wildcards and their members.
    fn ids_mentioning(&self, entity: EntityId) -> Vec<Id> {
        let mut ids = Vec::new();
        for key in own_keys(entity) {
            let Some(record) = self.components.get_by_id(key) else {
                continue;
            };
            ids.push(key);
            ids.extend(record.members());
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Whether any entity currently carries `id`.
    fn id_has_holders(&self, id: Id) -> bool {
        self.components.get_by_id(id).is_some_and(|r| {
            !r.cache().tables().is_empty() || r.sparse().is_some_and(|s| !s.is_empty())
        })
    }

    /// Entities carrying exactly `id`.
    fn holders_of(&self, id: Id) -> Vec<EntityId> {
        let Some(record) = self.components.get_by_id(id) else {
            return Vec::new();
        };
        let mut holders: Vec<EntityId> = record
            .cache()
            .tables()
            .iter()
            .filter_map(|t| self.tables.get(*t))
            .flat_map(|t| t.entities().iter().copied())
            .collect();
        if let Some(store) = record.sparse() {
            for &e in store.entities() {
                if !holders.contains(&e) {
                    holders.push(e);
                }
            }
        }
        holders
    }

    fn plan_delete(&self, root: EntityId) -> Result<DeletePlan, EcsError> {
        let mut plan = DeletePlan::default();
        let mut visited = HashSet::new();
        let mut strip = HashSet::new();
        let mut worklist = vec![root];
        visited.insert(root);

        while let Some(entity) = worklist.pop() {
            plan.entities.push(entity);
            for id in self.ids_mentioning(entity) {
                if id.is_wildcard() {
                    continue;
                }
                let Some(record) = self.components.get_by_id(id) else {
                    continue;
                };
                if record.query_refs > 0 {
                    return Err(EcsError::IdInUseByQuery { id: self.id_str(id) });
                }
                if !self.id_has_holders(id) {
                    continue;
                }
                let stripped = id.strip_flags();
                let policy = if stripped.is_pair() && stripped.second() == entity.index() {
                    record.target_cleanup_policy()
                } else {
                    record.cleanup_policy()
                };
                match policy {
                    CleanupPolicy::Panic => {
                        return Err(EcsError::InvalidOperation {
                            reason: format!(
                                "cannot delete {}: {} is still in use",
                                self.id_str(Id::entity(root)),
                                self.id_str(id)
                            ),
                        });
                    }
                    CleanupPolicy::Delete if !id.is_toggle() => {
                        for holder in self.holders_of(id) {
                            if visited.insert(holder) {
                                worklist.push(holder);
                            }
                        }
                    }
                    _ => {
                        if strip.insert(id) {
                            plan.strip.push(id);
                        }
                    }
                }
            }
            // Wildcard records referenced by queries block the delete too.
            for key in own_keys(entity) {
                if self.components.get_by_id(key).is_some_and(|r| r.query_refs > 0) {
                    return Err(EcsError::IdInUseByQuery { id: self.id_str(key) });
                }
            }
        }
        for &entity in &plan.entities {
            if entity.index() < builtin::FIRST_USER_ENTITY {
                return Err(EcsError::InvalidOperation {
                    reason: format!("builtin {} cannot be deleted", self.id_str(Id::entity(entity))),
                });
            }
        }
        Ok(plan)
    }

    /// Delete `entity`, applying the cleanup policies of every id that
    /// refers to it.
    pub fn delete(&mut self, entity: EntityId) -> Result<(), EcsError> {
        self.check_alive(entity)?;
        if entity.index() < builtin::FIRST_USER_ENTITY {
            return Err(EcsError::InvalidOperation {
                reason: format!("builtin {} cannot be deleted", self.id_str(Id::entity(entity))),
            });
        }
        if self.is_deferred() {
            self.enqueue(entity, CommandKind::Delete);
            return Ok(());
        }
        let plan = self.plan_delete(entity)?;
        tracing::debug!(
            %entity,
            cascade = plan.entities.len(),
            stripped = plan.strip.len(),
            "deleting entity"
        );

        let mut doomed_tables: Vec<TableId> = Vec::new();
        for &e in &plan.entities {
            for key in own_keys(e) {
                if let Some(record) = self.components.get_by_id(key) {
                    doomed_tables.extend(record.cache().all_tables());
                }
            }
        }

        for &id in &plan.strip {
            self.strip_id(id)?;
        }
        // Children before parents.
        for &e in plan.entities.iter().rev() {
            if self.is_alive(e) {
                self.delete_now(e)?;
            }
        }

        doomed_tables.sort_unstable();
        doomed_tables.dedup();
        loop {
            let before = doomed_tables.len();
            doomed_tables.retain(|t| !self.delete_table(*t));
            if doomed_tables.len() == before {
                break;
            }
        }
        for &e in &plan.entities {
            self.purge_records(e);
        }
        Ok(())
    }

    /// Remove `id` from every entity carrying it.
    fn strip_id(&mut self, id: Id) -> Result<(), EcsError> {
        for holder in self.sparse_holders(id) {
            self.remove_non_fragmenting(holder, id)?;
        }
        let tables: Vec<TableId> = match self.components.get_by_id(id) {
            Some(record) => record.cache().tables().to_vec(),
            None => return Ok(()),
        };
        for table in tables {
            let edge = self.traverse_remove(table, id)?;
            self.move_all_rows(table, edge)?;
        }
        Ok(())
    }

    fn sparse_holders(&self, id: Id) -> Vec<EntityId> {
        match self.components.get_by_id(id) {
            Some(r) if self.is_non_fragmenting(id) => {
                r.sparse().map(|s| s.entities().to_vec()).unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }

    /// Non-fragmenting ids carried by `entity`.
    fn non_fragmenting_of(&self, entity: EntityId) -> Vec<Id> {
        self.components
            .non_fragmenting
            .iter()
            .filter_map(|rid| self.components.get(*rid))
            .filter(|r| r.sparse().is_some_and(|s| s.contains(entity)))
            .map(|r| r.id())
            .collect()
    }

    /// Delete one entity's row and free its id. Policies are already applied.
    fn delete_now(&mut self, entity: EntityId) -> Result<(), EcsError> {
        for id in self.non_fragmenting_of(entity) {
            self.remove_non_fragmenting(entity, id)?;
        }
        let Some(table) = self.entities.get(entity).map(|r| r.table.unwrap_or(self.root)) else {
            return Ok(());
        };
        self.check_unlocked(table)?;
        let ids: Vec<Id> = self
            .table(table)
            .map(|t| t.type_ids().iter().copied().filter(|id| !id.is_toggle()).collect())
            .unwrap_or_default();
        if !ids.is_empty() {
            self.notify_remove(Some(table), &[entity], &ids);
        }

        // A callback may have moved or deleted the entity.
        let Some(location) = self.entities.get(entity).copied() else {
            return Ok(());
        };
        let table = location.table.unwrap_or(self.root);
        self.check_unlocked(table)?;
        let sparse_ids: Vec<Id> = match self.tables.get(table) {
            Some(t) if t.flags().contains(TableFlags::HAS_SPARSE) => t.type_ids().to_vec(),
            _ => Vec::new(),
        };
        for id in sparse_ids {
            if let Some(store) = self.components.get_by_id_mut(id).and_then(|r| r.sparse.as_mut()) {
                store.remove(entity);
            }
        }

        let row = location.row as usize;
        let (moved, now_empty) = match self.tables.get_mut(table) {
            Some(t) => (t.delete(row), t.is_empty()),
            None => crate::ecs_internal!("{entity} points at missing {table}"),
        };
        if let Some(moved) = moved {
            if let Some(record) = self.entities.get_mut(moved) {
                record.row = row as u32;
            }
        }
        if now_empty {
            self.set_table_active(table, false);
        }

        self.entities.delete(entity);
        self.forget_name(entity);
        self.registry.remove(entity.index());
        tracing::trace!(%entity, "entity deleted");
        Ok(())
    }

    /// Free the records of a deleted entity's ids once no table uses them.
    fn purge_records(&mut self, entity: EntityId) {
        for key in own_keys(entity).into_iter().skip(2) {
            self.release_wildcard_members(key);
        }
        for key in own_keys(entity) {
            while let Some(rid) = self.components.lookup(key) {
                let in_use = self
                    .components
                    .get(rid)
                    .is_some_and(|r| r.cache().len() > 0 || r.query_refs > 0);
                if in_use {
                    break;
                }
                self.release_record(rid);
            }
        }
    }

    /// Remove every id from `entity`, leaving it alive in the root table.
    pub fn clear(&mut self, entity: EntityId) -> Result<(), EcsError> {
        self.check_alive(entity)?;
        if self.is_deferred() {
            self.enqueue(entity, CommandKind::Clear);
            return Ok(());
        }
        for id in self.non_fragmenting_of(entity) {
            self.remove_non_fragmenting(entity, id)?;
        }
        let src = self.check_alive(entity)?.table.unwrap_or(self.root);
        if src == self.root {
            return Ok(());
        }
        let edge = self.transition(src, Vec::new())?;
        self.commit(entity, edge)
    }

    // -- bulk ---------------------------------------------------------------

    /// Non-empty tables whose type contains every id of `filter`.
    ///
    /// `Prefab` and `Disabled` tables are skipped unless the filter names
    /// those tags.
    pub(crate) fn filter_tables(&self, filter: &[Id]) -> Result<Vec<TableId>, EcsError> {
        let Some(&first) = filter.first() else {
            return Err(EcsError::InvalidParameter {
                reason: "bulk filter must contain at least one id".to_owned(),
            });
        };
        for &id in filter {
            if !id.is_valid() {
                return Err(EcsError::InvalidId {
                    id,
                    reason: "malformed filter id".to_owned(),
                });
            }
        }
        let mentions = |tag: EntityId| filter.iter().any(|id| *id == Id::entity(tag));
        let mut hidden = TableFlags::empty();
        if !mentions(builtin::PREFAB) {
            hidden.insert(TableFlags::IS_PREFAB);
        }
        if !mentions(builtin::DISABLED) {
            hidden.insert(TableFlags::IS_DISABLED);
        }
        let Some(record) = self.components.get_by_id(first) else {
            return Ok(Vec::new());
        };
        Ok(record
            .cache()
            .tables()
            .iter()
            .copied()
            .filter(|t| *t != self.root)
            .filter_map(|t| self.tables.get(t))
            .filter(|t| !t.flags().intersects(hidden))
            .filter(|t| filter.iter().all(|id| t.has_id(*id)))
            .map(|t| t.id())
            .collect())
    }

    fn filtered_entities(&self, filter: &[Id]) -> Result<Vec<EntityId>, EcsError> {
        Ok(self
            .filter_tables(filter)?
            .into_iter()
            .filter_map(|t| self.tables.get(t))
            .flat_map(|t| t.entities().iter().copied())
            .collect())
    }

    /// Add `id` to every entity matching `filter`, one table at a time.
    ///
    /// Returns the number of entities that gained the id.
    pub fn bulk_add(&mut self, filter: &[Id], id: Id) -> Result<usize, EcsError> {
        if id.is_wildcard() {
            return Err(EcsError::InvalidId {
                id,
                reason: "cannot add a wildcard id".to_owned(),
            });
        }
        self.validate_id(id)?;
        if self.is_deferred() || self.is_non_fragmenting(id) {
            let entities = self.filtered_entities(filter)?;
            let mut added = 0;
            for e in entities {
                if !self.has_id(e, id) {
                    self.add_id(e, id)?;
                    added += 1;
                }
            }
            return Ok(added);
        }
        let mut added = 0;
        for table in self.filter_tables(filter)? {
            let edge = self.traverse_add(table, id)?;
            if edge.to == table {
                continue;
            }
            added += self.tables.get(table).map_or(0, |t| t.count());
            self.move_all_rows(table, edge)?;
        }
        tracing::debug!(id = %self.id_str(id), added, "bulk add");
        Ok(added)
    }

    /// Remove `id` (or every id matching a wildcard) from every entity
    /// matching `filter`.
    ///
    /// Returns the number of entities that lost an id.
    pub fn bulk_remove(&mut self, filter: &[Id], id: Id) -> Result<usize, EcsError> {
        self.validate_id(id)?;
        if self.is_deferred() || self.is_non_fragmenting(id) {
            let entities = self.filtered_entities(filter)?;
            let mut removed = 0;
            for e in entities {
                if self.has_id(e, id) {
                    self.remove_id(e, id)?;
                    removed += 1;
                }
            }
            return Ok(removed);
        }
        let mut removed = 0;
        for table in self.filter_tables(filter)? {
            let edge = self.traverse_remove(table, id)?;
            if edge.to == table {
                continue;
            }
            removed += self.tables.get(table).map_or(0, |t| t.count());
            self.move_all_rows(table, edge)?;
        }
        tracing::debug!(id = %self.id_str(id), removed, "bulk remove");
        Ok(removed)
    }

    /// Delete every entity matching `filter`.
    ///
    /// Returns the number of entities deleted, cascades excluded.
    pub fn bulk_delete(&mut self, filter: &[Id]) -> Result<usize, EcsError> {
        let entities = self.filtered_entities(filter)?;
        let mut deleted = 0;
        for e in entities {
            if self.is_alive(e) {
                self.delete(e)?;
                deleted += 1;
            }
        }
        tracing::debug!(deleted, "bulk delete");
        Ok(deleted)
    }
}
