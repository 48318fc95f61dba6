//! Table transition graph.
//!
//! Adding or removing one id from a table is memoized as an [`Edge`] on the
//! source table's [`GraphNode`], so moving many entities of the same shape
//! only derives the destination type once. Each edge carries the
//! [`TableDiff`] the mutation protocol needs to run hooks and events.

use std::sync::Arc;

use crate::component_index::ComponentFlags;
use crate::hash::IdMap;
use crate::id::{builtin, Id};
use crate::table::{Table, TableFlags, TableId, TypeEntry};
use crate::world::World;
use crate::EcsError;

/// Ids added and removed by a transition, both sorted ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDiff {
    pub added: Vec<Id>,
    pub removed: Vec<Id>,
    /// Union of the table flags contributed by `added`.
    pub added_flags: TableFlags,
    /// Union of the table flags contributed by `removed`.
    pub removed_flags: TableFlags,
}

impl TableDiff {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Edge {
    pub(crate) to: TableId,
    pub(crate) diff: Arc<TableDiff>,
}

/// Outgoing edges of a table plus back references for invalidation.
#[derive(Debug, Default)]
pub(crate) struct GraphNode {
    pub(crate) add: IdMap<Id, Edge>,
    pub(crate) remove: IdMap<Id, Edge>,
    /// `(source table, id, is_add)` of every edge pointing at this table.
    pub(crate) incoming: Vec<(TableId, Id, bool)>,
}

/// Sorted set difference `a - b`.
fn difference(a: &[Id], b: &[Id]) -> Vec<Id> {
    a.iter().copied().filter(|id| b.binary_search(id).is_err()).collect()
}

impl World {
    /// The table for `type_ids`, creating it on first use.
    ///
    /// The input does not need to be sorted or deduplicated.
    pub(crate) fn find_or_create_table(&mut self, mut type_ids: Vec<Id>) -> Result<TableId, EcsError> {
        type_ids.sort_unstable();
        type_ids.dedup();
        if let Some(table) = self.tables.find(&type_ids) {
            return Ok(table);
        }

        for &id in &type_ids {
            self.validate_id(id)?;
        }
        // Records are created (and constraints checked) before the table
        // exists so a rejected id leaves the store untouched.
        let mut entries = Vec::with_capacity(type_ids.len());
        for &id in &type_ids {
            let rid = self.ensure_record(id)?;
            let sparse = self
                .components
                .get(rid)
                .is_some_and(|r| r.flags().contains(ComponentFlags::SPARSE));
            let type_info = if sparse { None } else { self.type_info_for_id(id) };
            entries.push(TypeEntry {
                id,
                type_info,
                flags: self.table_flags_for_id(id),
            });
        }

        let table_id = self.tables.next_id();
        let has_tags = entries.iter().any(|e| e.type_info.is_none());
        let data_ids: Vec<Id> = entries
            .iter()
            .filter(|e| e.type_info.is_some())
            .map(|e| e.id)
            .collect();
        self.tables.insert(Table::new(table_id, entries));
        self.register_table_records(table_id)?;

        // Tables that also carry tags share the column layout of the canonical
        // table holding only their data ids.
        let storage = if has_tags && !data_ids.is_empty() {
            let storage = self.find_or_create_table(data_ids)?;
            if let Some(t) = self.tables.get_mut(storage) {
                t.storage_refs += 1;
            }
            Some(storage)
        } else if data_ids.is_empty() {
            None
        } else {
            Some(table_id)
        };
        if let Some(t) = self.tables.get_mut(table_id) {
            t.storage_table = storage;
        }

        tracing::debug!(table = %table_id, r#type = %self.type_str(&type_ids), "table created");
        self.notify_queries_table_created(table_id);
        Ok(table_id)
    }

    /// Whether `(R, *)` pairs are exclusive for relationship index `rel`.
    fn is_exclusive(&self, rel: u32) -> bool {
        self.index_has_id(rel, Id::entity(builtin::EXCLUSIVE))
    }

    /// Whether `id` is stored outside tables entirely.
    pub(crate) fn is_non_fragmenting(&self, id: Id) -> bool {
        if let Some(record) = self.components.get_by_id(id) {
            return record.flags().contains(ComponentFlags::DONT_FRAGMENT);
        }
        let rel = id.strip_flags().first();
        !id.is_wildcard() && self.index_has_id(rel, Id::entity(builtin::DONT_FRAGMENT))
    }

    fn type_ids_of(&self, table: TableId) -> Result<Vec<Id>, EcsError> {
        match self.tables.get(table) {
            Some(t) => Ok(t.type_ids.clone()),
            None => crate::ecs_internal!("graph traversal from unknown {table}"),
        }
    }

    fn make_diff(&self, from: &[Id], to: &[Id]) -> TableDiff {
        let added = difference(to, from);
        let removed = difference(from, to);
        let flags = |ids: &[Id]| {
            ids.iter()
                .fold(TableFlags::empty(), |acc, &id| acc.union(self.table_flags_for_id(id)))
        };
        TableDiff {
            added_flags: flags(&added),
            removed_flags: flags(&removed),
            added,
            removed,
        }
    }

    /// Destination and diff of moving from `from` to the table of `to_type`.
    pub(crate) fn transition(
        &mut self,
        from: TableId,
        to_type: Vec<Id>,
    ) -> Result<Edge, EcsError> {
        let from_type = self.type_ids_of(from)?;
        let to = self.find_or_create_table(to_type)?;
        let to_type = self.type_ids_of(to)?;
        Ok(Edge {
            to,
            diff: Arc::new(self.make_diff(&from_type, &to_type)),
        })
    }

    fn cache_edge(&mut self, from: TableId, id: Id, is_add: bool, edge: &Edge) {
        if let Some(t) = self.tables.get_mut(from) {
            let edges = if is_add { &mut t.node.add } else { &mut t.node.remove };
            edges.insert(id, edge.clone());
        }
        if let Some(t) = self.tables.get_mut(edge.to) {
            t.node.incoming.push((from, id, is_add));
        }
    }

    /// Follow (or create) the edge for adding `id` to `from`.
    pub(crate) fn traverse_add(&mut self, from: TableId, id: Id) -> Result<Edge, EcsError> {
        if let Some(edge) = self.tables.get(from).and_then(|t| t.node.add.get(&id)) {
            return Ok(edge.clone());
        }
        let mut type_ids = self.type_ids_of(from)?;
        if type_ids.binary_search(&id).is_err() {
            if id.is_pair() && !id.is_toggle() && self.is_exclusive(id.first()) {
                let rel = id.first();
                type_ids.retain(|t| !(t.is_pair() && !t.is_toggle() && t.first() == rel));
            }
            type_ids.push(id);
        }
        let edge = self.transition(from, type_ids)?;
        self.cache_edge(from, id, true, &edge);
        Ok(edge)
    }

    /// Follow (or create) the edge for removing `id` from `from`.
    ///
    /// A wildcard removes every matching id. Removing an id also drops its
    /// toggle entry.
    pub(crate) fn traverse_remove(&mut self, from: TableId, id: Id) -> Result<Edge, EcsError> {
        if let Some(edge) = self.tables.get(from).and_then(|t| t.node.remove.get(&id)) {
            return Ok(edge.clone());
        }
        let mut type_ids = self.type_ids_of(from)?;
        if id.is_wildcard() {
            type_ids.retain(|t| !t.strip_flags().matches(id));
        } else {
            let toggle = id.toggle();
            type_ids.retain(|t| *t != id && (*t != toggle || id.is_toggle()));
        }
        let edge = self.transition(from, type_ids)?;
        self.cache_edge(from, id, false, &edge);
        Ok(edge)
    }

    /// Drop every edge pointing to or from `table`.
    fn unlink_table_edges(&mut self, table: TableId) {
        let (incoming, outgoing) = match self.tables.get_mut(table) {
            Some(t) => {
                let incoming = std::mem::take(&mut t.node.incoming);
                let outgoing: Vec<(TableId, Id, bool)> = t
                    .node
                    .add
                    .drain()
                    .map(|(id, e)| (e.to, id, true))
                    .chain(t.node.remove.drain().map(|(id, e)| (e.to, id, false)))
                    .collect();
                (incoming, outgoing)
            }
            None => return,
        };
        for (src, id, is_add) in incoming {
            if let Some(t) = self.tables.get_mut(src) {
                let edges = if is_add { &mut t.node.add } else { &mut t.node.remove };
                if edges.get(&id).is_some_and(|e| e.to == table) {
                    edges.remove(&id);
                }
            }
        }
        for (dst, id, is_add) in outgoing {
            if let Some(t) = self.tables.get_mut(dst) {
                t.node
                    .incoming
                    .retain(|&(s, i, a)| !(s == table && i == id && a == is_add));
            }
        }
    }

    /// Destroy an empty table. Returns `false` if it is still in use.
    pub(crate) fn delete_table(&mut self, table: TableId) -> bool {
        let Some(t) = self.tables.get(table) else {
            return false;
        };
        if table == self.root || !t.is_empty() || t.is_locked() || t.storage_refs > 0 {
            return false;
        }
        let storage = t.storage_table.filter(|s| *s != table);

        self.notify_queries_table_deleted(table);
        self.unlink_table_edges(table);
        self.unregister_table_records(table);
        self.tables.remove(table);
        if let Some(s) = storage.and_then(|s| self.tables.get_mut(s)) {
            s.storage_refs = s.storage_refs.saturating_sub(1);
        }
        tracing::debug!(%table, "table deleted");
        true
    }

    /// Destroy every empty table that nothing else depends on.
    ///
    /// Returns the number of tables deleted.
    pub fn delete_empty_tables(&mut self) -> usize {
        let mut deleted = 0;
        loop {
            let candidates: Vec<TableId> = self
                .tables
                .iter()
                .filter(|t| t.is_empty() && t.id != self.root && t.storage_refs == 0)
                .map(|t| t.id)
                .collect();
            let before = deleted;
            for table in candidates {
                if self.delete_table(table) {
                    deleted += 1;
                }
            }
            // Deleting a table can free its storage table.
            if deleted == before {
                break;
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::World;

    #[test]
    fn difference_of_sorted_sets() {
        let a = [Id::from_index(40), Id::from_index(41), Id::from_index(42)];
        let b = [Id::from_index(41)];
        assert_eq!(difference(&a, &b), vec![Id::from_index(40), Id::from_index(42)]);
        assert!(difference(&b, &a).is_empty());
    }

    #[test]
    fn add_edges_are_memoized() {
        let mut world = World::new();
        let a = Id::entity(world.new_entity());
        let root = world.root_table();
        let first = world.traverse_add(root, a).unwrap();
        let second = world.traverse_add(root, a).unwrap();
        assert_eq!(first.to, second.to);
        assert!(Arc::ptr_eq(&first.diff, &second.diff));
        assert_eq!(first.diff.added, vec![a]);
        assert!(first.diff.removed.is_empty());
    }

    #[test]
    fn exclusive_relationship_replaces_target() {
        let mut world = World::new();
        let parent_a = world.new_entity();
        let parent_b = world.new_entity();
        let root = world.root_table();
        let first = world
            .traverse_add(root, Id::pair(builtin::CHILD_OF, parent_a))
            .unwrap();
        let second = world
            .traverse_add(first.to, Id::pair(builtin::CHILD_OF, parent_b))
            .unwrap();
        let table = world.table(second.to).unwrap();
        assert_eq!(table.type_ids(), &[Id::pair(builtin::CHILD_OF, parent_b)]);
        assert_eq!(second.diff.removed, vec![Id::pair(builtin::CHILD_OF, parent_a)]);
    }

    #[test]
    fn wildcard_remove_strips_all_matches() {
        let mut world = World::new();
        let likes = world.new_entity();
        let alice = world.new_entity();
        let bob = world.new_entity();
        let tag = Id::entity(world.new_entity());
        let ty = vec![tag, Id::pair(likes, alice), Id::pair(likes, bob)];
        let from = world.find_or_create_table(ty).unwrap();
        let edge = world
            .traverse_remove(from, Id::pair(likes, builtin::WILDCARD))
            .unwrap();
        assert_eq!(world.table(edge.to).unwrap().type_ids(), &[tag]);
        assert_eq!(edge.diff.removed.len(), 2);
    }

    #[test]
    fn empty_tables_are_collected() {
        let mut world = World::new();
        let a = Id::entity(world.new_entity());
        let b = Id::entity(world.new_entity());
        let table = world.find_or_create_table(vec![a, b]).unwrap();
        assert!(world.table(table).is_some());
        let deleted = world.delete_empty_tables();
        assert!(deleted >= 1);
        assert!(world.table(table).is_none());
        // Root survives.
        assert!(world.table(world.root_table()).is_some());
    }
}
