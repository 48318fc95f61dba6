//! Query handles and world-owned query caches.
//!
//! Creating a [`Query`] compiles it and takes a reference on the component
//! record of every term id. Those references keep the records alive and
//! make deleting an id that a live query mentions fail with
//! [`EcsError::IdInUseByQuery`]. Cached queries additionally get a
//! [`QueryCache`]: the list of tables matching their cacheable terms, kept
//! current as tables are created and deleted.

use std::sync::Arc;

use tracing::debug;

use crate::entity::EntityId;
use crate::id::Id;
use crate::query::compiler::compile;
use crate::query::engine::{QueryCursor, QueryMatch};
use crate::query::program::{QueryOpKind, QueryProgram};
use crate::query::term::{Oper, QueryDesc};
use crate::table::{wildcard_record_key, Table, TableFlags, TableId};
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// QueryCache
// ---------------------------------------------------------------------------

/// A table matching the cached terms, with per-field results.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub table: TableId,
    /// Matched id per field.
    pub ids: Vec<Id>,
    /// Fields that matched, as a bit mask.
    pub set: u64,
    /// Data column per field.
    pub columns: Vec<Option<usize>>,
}

#[derive(Debug)]
pub struct QueryCache {
    program: Arc<QueryProgram>,
    /// Terms evaluated by the cache.
    terms: u64,
    entries: Vec<CacheEntry>,
}

impl QueryCache {
    fn new(program: Arc<QueryProgram>) -> Self {
        let terms = program
            .ops
            .iter()
            .find(|op| {
                matches!(
                    op.kind,
                    QueryOpKind::Cache
                        | QueryOpKind::CacheData
                        | QueryOpKind::IsCache
                        | QueryOpKind::IsCacheData
                )
            })
            .map_or(0, |op| op.terms);
        Self {
            program,
            terms,
            entries: Vec::new(),
        }
    }

    /// Cached tables, in the order they were matched.
    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn hidden_flags(&self) -> TableFlags {
        let mut hidden = TableFlags::empty();
        if !self.program.match_prefab {
            hidden.insert(TableFlags::IS_PREFAB);
        }
        if !self.program.match_disabled {
            hidden.insert(TableFlags::IS_DISABLED);
        }
        hidden
    }

    /// Evaluate the cached terms against a table type.
    fn match_table(&self, table: &Table) -> Option<CacheEntry> {
        if table.flags().intersects(self.hidden_flags()) {
            return None;
        }
        let program = &self.program;
        let mut entry = CacheEntry {
            table: table.id(),
            ids: vec![Id::NULL; program.field_count],
            set: 0,
            columns: vec![None; program.field_count],
        };
        for (i, term) in program.terms.iter().enumerate() {
            if self.terms & (1u64 << i) == 0 {
                continue;
            }
            let field = term.field as usize;
            entry.ids[field] = term.id;
            let record = table.record(term.id);
            match (term.oper, record) {
                (Oper::Not, Some(_)) => return None,
                (Oper::Not, None) | (Oper::Optional, None) => {}
                (_, None) => return None,
                (_, Some(record)) => {
                    entry.ids[field] = table.type_ids()[record.index as usize];
                    entry.set |= 1u64 << field;
                    entry.columns[field] = record.column.map(usize::from);
                }
            }
        }
        Some(entry)
    }

    fn table_created(&mut self, table: &Table) {
        if let Some(entry) = self.match_table(table) {
            self.entries.push(entry);
        }
    }

    fn table_deleted(&mut self, table: TableId) {
        self.entries.retain(|e| e.table != table);
    }
}

// ---------------------------------------------------------------------------
// QueryRegistry
// ---------------------------------------------------------------------------

/// Caches of every live cached query, by slot.
#[derive(Debug, Default)]
pub(crate) struct QueryRegistry {
    caches: Vec<Option<QueryCache>>,
    free: Vec<usize>,
    /// Live queries, cached or not.
    live: usize,
}

impl QueryRegistry {
    fn insert(&mut self, cache: QueryCache) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.caches[slot] = Some(cache);
                slot
            }
            None => {
                self.caches.push(Some(cache));
                self.caches.len() - 1
            }
        }
    }

    fn remove(&mut self, slot: usize) {
        if let Some(cache) = self.caches.get_mut(slot) {
            if cache.take().is_some() {
                self.free.push(slot);
            }
        }
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&QueryCache> {
        self.caches.get(slot).and_then(Option::as_ref)
    }

    /// Number of live queries.
    pub(crate) fn len(&self) -> usize {
        self.live
    }
}

impl World {
    pub(crate) fn notify_queries_table_created(&mut self, table: TableId) {
        let Some(t) = self.tables.get(table) else {
            return;
        };
        for cache in self.queries.caches.iter_mut().flatten() {
            cache.table_created(t);
        }
    }

    pub(crate) fn notify_queries_table_deleted(&mut self, table: TableId) {
        for cache in self.queries.caches.iter_mut().flatten() {
            cache.table_deleted(table);
        }
    }

    /// Compile a query.
    ///
    /// Every term id stays referenced until [`release_query`](Self::release_query):
    /// deleting an entity those ids mention fails while the query lives.
    pub fn query(&mut self, desc: &QueryDesc) -> Result<Query, EcsError> {
        let program = Arc::new(compile(self, desc)?);

        let mut claims: Vec<Id> = Vec::with_capacity(program.terms.len());
        for term in &program.terms {
            let key = wildcard_record_key(term.id);
            match self.claim_record(key) {
                Ok(rid) => {
                    if let Some(record) = self.components.get_mut(rid) {
                        record.query_refs += 1;
                    }
                    claims.push(key);
                }
                Err(err) => {
                    self.release_claims(&claims);
                    return Err(err);
                }
            }
        }

        let cache = if program.cached {
            let mut cache = QueryCache::new(Arc::clone(&program));
            for table in self.tables.iter() {
                cache.table_created(table);
            }
            debug!(tables = cache.len(), "query cache built");
            Some(self.queries.insert(cache))
        } else {
            None
        };
        self.queries.live += 1;
        Ok(Query {
            program,
            cache,
            claims,
        })
    }

    /// Drop a query and the references it holds.
    pub fn release_query(&mut self, query: Query) {
        if let Some(slot) = query.cache {
            self.queries.remove(slot);
        }
        self.release_claims(&query.claims);
        self.queries.live = self.queries.live.saturating_sub(1);
    }

    fn release_claims(&mut self, claims: &[Id]) {
        for &key in claims {
            let Some(rid) = self.components.lookup(key) else {
                continue;
            };
            if let Some(record) = self.components.get_mut(rid) {
                record.query_refs = record.query_refs.saturating_sub(1);
            }
            self.release_record(rid);
        }
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A compiled query. Release it with [`World::release_query`].
#[derive(Debug)]
pub struct Query {
    program: Arc<QueryProgram>,
    cache: Option<usize>,
    claims: Vec<Id>,
}

impl Query {
    pub fn program(&self) -> &QueryProgram {
        &self.program
    }

    pub(crate) fn program_arc(&self) -> Arc<QueryProgram> {
        Arc::clone(&self.program)
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    /// Iterate the results against `world`.
    pub fn iter<'w>(&'w self, world: &'w World) -> QueryCursor<'w> {
        let cache = self.cache.and_then(|slot| world.queries.get(slot));
        QueryCursor::new(world, &self.program, cache)
    }

    /// Number of matched `$this` entities, or of results when the query
    /// does not match on `$this`.
    pub fn count(&self, world: &World) -> usize {
        self.iter(world).map(|m| m.count().max(1)).sum()
    }

    /// Every matched `$this` entity, in result order.
    pub fn entities(&self, world: &World) -> Vec<EntityId> {
        self.iter(world)
            .flat_map(|m: QueryMatch<'_>| m.entities().iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(world: &mut World, n: usize) -> Vec<EntityId> {
        (0..n).map(|_| world.new_entity()).collect()
    }

    #[test]
    fn deleting_queried_id_fails_until_release() {
        let mut world = World::new();
        let a = world.new_named("A").unwrap();
        let e = world.new_entity();
        world.add_id(e, Id::entity(a)).unwrap();

        let query = world.query(&QueryDesc::new().with(a)).unwrap();
        let err = world.delete(a).unwrap_err();
        assert!(matches!(err, EcsError::IdInUseByQuery { .. }));
        assert!(world.is_alive(a));

        world.release_query(query);
        world.delete(a).unwrap();
        assert!(!world.is_alive(a));
        assert!(world.type_of(e).unwrap().is_empty());
    }

    #[test]
    fn cache_tracks_new_and_deleted_tables() {
        let mut world = World::new();
        let ids = tags(&mut world, 3);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        let query = world.query(&QueryDesc::new().with(a).without(c).cached()).unwrap();
        assert!(query.is_cached());
        assert_eq!(query.count(&world), 0);

        let e1 = world.new_entity();
        world.add_id(e1, Id::entity(a)).unwrap();
        let e2 = world.new_entity();
        world.add_id(e2, Id::entity(a)).unwrap();
        world.add_id(e2, Id::entity(b)).unwrap();
        let e3 = world.new_entity();
        world.add_id(e3, Id::entity(a)).unwrap();
        world.add_id(e3, Id::entity(c)).unwrap();

        let mut found = query.entities(&world);
        found.sort();
        let mut expected = vec![e1, e2];
        expected.sort();
        assert_eq!(found, expected);

        world.remove_id(e2, Id::entity(b)).unwrap();
        world.delete_empty_tables();
        assert_eq!(query.count(&world), 2);
        world.release_query(query);
        assert_eq!(world.stats().queries, 0);
    }

    #[test]
    fn cached_optional_reports_set_state() {
        let mut world = World::new();
        let ids = tags(&mut world, 2);
        let (a, b) = (ids[0], ids[1]);
        let with_b = world.new_entity();
        world.add_id(with_b, Id::entity(a)).unwrap();
        world.add_id(with_b, Id::entity(b)).unwrap();
        let without_b = world.new_entity();
        world.add_id(without_b, Id::entity(a)).unwrap();

        let query = world.query(&QueryDesc::new().with(a).optional(b).cached()).unwrap();
        let mut seen = Vec::new();
        for m in query.iter(&world) {
            for &e in m.entities() {
                seen.push((e, m.is_set(1)));
            }
        }
        seen.sort();
        let mut expected = vec![(with_b, true), (without_b, false)];
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn release_frees_unused_records() {
        let mut world = World::new();
        let a = world.new_entity();
        let before = world.stats();
        let query = world.query(&QueryDesc::new().with(a)).unwrap();
        world.release_query(query);
        let after = world.stats();
        assert_eq!(before.queries, after.queries);
        assert!(world.component_record(Id::entity(a)).is_none());
    }
}
