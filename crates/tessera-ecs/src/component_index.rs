//! The component index: one [`ComponentRecord`] per id in use.
//!
//! Records are the reverse index from an id (plain, pair, or wildcard
//! pattern) to the tables that contain it. Every non-wildcard pair `(R, T)`
//! holds a reference on its `(R, *)` and `(*, T)` parents, and is listed in
//! their ordered member sets, so "all targets of R" and "all relationships
//! pointing at T" are answered without scanning tables.
//!
//! Records are owned by a slab and referenced by [`ComponentRecordId`].

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::component::TypeInfo;
use crate::entity::{EntityId, RowFlags};
use crate::hash::IdMap;
use crate::id::{builtin, Id};
use crate::observer::Event;
use crate::sparse::SparseStore;
use crate::table::{wildcard_record_key, TableFlags, TableId, TableRecord};
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentFlags
// ---------------------------------------------------------------------------

/// Cached traits and hook/observer presence of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComponentFlags(u32);

impl ComponentFlags {
    pub const IS_WILDCARD: ComponentFlags = ComponentFlags(1 << 0);
    pub const EXCLUSIVE: ComponentFlags = ComponentFlags(1 << 1);
    pub const TRAVERSABLE: ComponentFlags = ComponentFlags(1 << 2);
    pub const SPARSE: ComponentFlags = ComponentFlags(1 << 3);
    pub const DONT_FRAGMENT: ComponentFlags = ComponentFlags(1 << 4);
    pub const CAN_TOGGLE: ComponentFlags = ComponentFlags(1 << 5);
    pub const HAS_ON_ADD: ComponentFlags = ComponentFlags(1 << 6);
    pub const HAS_ON_REMOVE: ComponentFlags = ComponentFlags(1 << 7);
    pub const HAS_ON_SET: ComponentFlags = ComponentFlags(1 << 8);
    pub const ADD_OBSERVERS: ComponentFlags = ComponentFlags(1 << 9);
    pub const REMOVE_OBSERVERS: ComponentFlags = ComponentFlags(1 << 10);
    pub const SET_OBSERVERS: ComponentFlags = ComponentFlags(1 << 11);
    pub const ON_DELETE_REMOVE: ComponentFlags = ComponentFlags(1 << 12);
    pub const ON_DELETE_DELETE: ComponentFlags = ComponentFlags(1 << 13);
    pub const ON_DELETE_PANIC: ComponentFlags = ComponentFlags(1 << 14);
    pub const ON_DELETE_TARGET_REMOVE: ComponentFlags = ComponentFlags(1 << 15);
    pub const ON_DELETE_TARGET_DELETE: ComponentFlags = ComponentFlags(1 << 16);
    pub const ON_DELETE_TARGET_PANIC: ComponentFlags = ComponentFlags(1 << 17);
    pub const MARKED_FOR_DELETE: ComponentFlags = ComponentFlags(1 << 18);

    pub const OBSERVER_MASK: ComponentFlags = ComponentFlags(
        Self::ADD_OBSERVERS.0 | Self::REMOVE_OBSERVERS.0 | Self::SET_OBSERVERS.0,
    );

    pub const fn empty() -> Self {
        ComponentFlags(0)
    }

    #[inline]
    pub const fn contains(self, other: ComponentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: ComponentFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: ComponentFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: ComponentFlags) {
        self.0 &= !other.0;
    }

    /// Observer-presence flag for an event.
    pub const fn for_observers(event: Event) -> ComponentFlags {
        match event {
            Event::OnAdd => Self::ADD_OBSERVERS,
            Event::OnRemove => Self::REMOVE_OBSERVERS,
            Event::OnSet => Self::SET_OBSERVERS,
        }
    }
}

/// What happens to users of an id when the id's entity is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Remove the id from every entity that has it.
    Remove,
    /// Delete every entity that has the id.
    Delete,
    /// Refuse to delete the id's entity.
    Panic,
}

impl CleanupPolicy {
    pub(crate) fn from_entity(policy: u32) -> Option<Self> {
        match policy {
            i if i == builtin::REMOVE.index() => Some(CleanupPolicy::Remove),
            i if i == builtin::DELETE.index() => Some(CleanupPolicy::Delete),
            i if i == builtin::PANIC.index() => Some(CleanupPolicy::Panic),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// TableCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    active: bool,
    pos: u32,
}

/// Tables containing an id, split into non-empty and empty lists.
#[derive(Debug, Default)]
pub struct TableCache {
    entries: IdMap<TableId, CacheEntry>,
    active: Vec<TableId>,
    inactive: Vec<TableId>,
}

impl TableCache {
    fn list_mut(&mut self, active: bool) -> &mut Vec<TableId> {
        if active {
            &mut self.active
        } else {
            &mut self.inactive
        }
    }

    fn detach(&mut self, entry: CacheEntry) {
        let list = self.list_mut(entry.active);
        let pos = entry.pos as usize;
        list.swap_remove(pos);
        if let Some(&moved) = list.get(pos) {
            if let Some(e) = self.entries.get_mut(&moved) {
                e.pos = pos as u32;
            }
        }
    }

    fn attach(&mut self, table: TableId, active: bool) {
        let list = self.list_mut(active);
        let pos = list.len() as u32;
        list.push(table);
        self.entries.insert(table, CacheEntry { active, pos });
    }

    pub(crate) fn insert(&mut self, table: TableId, active: bool) {
        if let Some(entry) = self.entries.get(&table).copied() {
            self.detach(entry);
        }
        self.attach(table, active);
    }

    pub(crate) fn remove(&mut self, table: TableId) -> bool {
        match self.entries.remove(&table) {
            Some(entry) => {
                self.detach(entry);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_active(&mut self, table: TableId, active: bool) {
        if let Some(entry) = self.entries.get(&table).copied() {
            if entry.active != active {
                self.detach(entry);
                self.attach(table, active);
            }
        }
    }

    /// Non-empty tables.
    #[inline]
    pub fn tables(&self) -> &[TableId] {
        &self.active
    }

    /// Empty tables.
    #[inline]
    pub fn empty_tables(&self) -> &[TableId] {
        &self.inactive
    }

    /// Every table, non-empty first.
    pub fn all_tables(&self) -> impl Iterator<Item = TableId> + '_ {
        self.active.iter().chain(self.inactive.iter()).copied()
    }

    #[inline]
    pub fn contains(&self, table: TableId) -> bool {
        self.entries.contains_key(&table)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ComponentRecord
// ---------------------------------------------------------------------------

/// Handle of a record in the component index slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentRecordId(u32);

/// Reverse index entry for one id.
#[derive(Debug)]
pub struct ComponentRecord {
    pub(crate) id: Id,
    pub(crate) flags: ComponentFlags,
    /// Tables, child pairs and explicit claims holding this record.
    pub(crate) refcount: u32,
    /// Live queries referencing this id.
    pub(crate) query_refs: u32,
    pub(crate) type_info: Option<Arc<TypeInfo>>,
    pub(crate) cache: TableCache,
    pub(crate) sparse: Option<SparseStore>,
    /// `(R, T)` members of a `(R, *)` record.
    pub(crate) first_members: BTreeSet<Id>,
    /// `(R, T)` members of a `(*, T)` record.
    pub(crate) second_members: BTreeSet<Id>,
    /// Members of a `(*, T)` record whose relationship is traversable.
    pub(crate) traversable_members: BTreeSet<Id>,
}

impl ComponentRecord {
    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    #[inline]
    pub fn flags(&self) -> ComponentFlags {
        self.flags
    }

    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    #[inline]
    pub fn cache(&self) -> &TableCache {
        &self.cache
    }

    #[inline]
    pub fn type_info(&self) -> Option<&Arc<TypeInfo>> {
        self.type_info.as_ref()
    }

    #[inline]
    pub fn sparse(&self) -> Option<&SparseStore> {
        self.sparse.as_ref()
    }

    /// All `(R, T)` pairs listed under this wildcard record.
    pub fn members(&self) -> impl Iterator<Item = Id> + '_ {
        self.first_members.iter().chain(self.second_members.iter()).copied()
    }

    pub fn traversable_members(&self) -> impl Iterator<Item = Id> + '_ {
        self.traversable_members.iter().copied()
    }

    /// Whether this is a sparse-stored or non-fragmenting id.
    #[inline]
    pub fn is_sparse(&self) -> bool {
        self.flags
            .intersects(ComponentFlags::SPARSE.union_raw(ComponentFlags::DONT_FRAGMENT))
    }

    pub(crate) fn cleanup_policy(&self) -> CleanupPolicy {
        if self.flags.contains(ComponentFlags::ON_DELETE_PANIC) {
            CleanupPolicy::Panic
        } else if self.flags.contains(ComponentFlags::ON_DELETE_DELETE) {
            CleanupPolicy::Delete
        } else {
            CleanupPolicy::Remove
        }
    }

    pub(crate) fn target_cleanup_policy(&self) -> CleanupPolicy {
        if self.flags.contains(ComponentFlags::ON_DELETE_TARGET_PANIC) {
            CleanupPolicy::Panic
        } else if self.flags.contains(ComponentFlags::ON_DELETE_TARGET_DELETE) {
            CleanupPolicy::Delete
        } else {
            CleanupPolicy::Remove
        }
    }
}

impl ComponentFlags {
    const fn union_raw(self, other: ComponentFlags) -> ComponentFlags {
        ComponentFlags(self.0 | other.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentIndex
// ---------------------------------------------------------------------------

/// Slab of records plus the `Id -> record` map.
#[derive(Debug, Default)]
pub struct ComponentIndex {
    records: Vec<Option<ComponentRecord>>,
    free: Vec<u32>,
    by_id: IdMap<Id, ComponentRecordId>,
    /// Records of non-fragmenting ids, walked when deleting entities.
    pub(crate) non_fragmenting: Vec<ComponentRecordId>,
}

impl ComponentIndex {
    #[inline]
    pub fn lookup(&self, id: Id) -> Option<ComponentRecordId> {
        self.by_id.get(&id).copied()
    }

    #[inline]
    pub fn get(&self, rid: ComponentRecordId) -> Option<&ComponentRecord> {
        self.records.get(rid.0 as usize)?.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, rid: ComponentRecordId) -> Option<&mut ComponentRecord> {
        self.records.get_mut(rid.0 as usize)?.as_mut()
    }

    /// Record for an id, if one exists.
    #[inline]
    pub fn get_by_id(&self, id: Id) -> Option<&ComponentRecord> {
        self.get(self.lookup(id)?)
    }

    #[inline]
    pub(crate) fn get_by_id_mut(&mut self, id: Id) -> Option<&mut ComponentRecord> {
        let rid = self.lookup(id)?;
        self.get_mut(rid)
    }

    /// `table_membership(id, table)`: where `id` occurs in `table`.
    pub fn is_in_table(&self, id: Id, table: TableId) -> bool {
        self.get_by_id(wildcard_record_key(id))
            .is_some_and(|r| r.cache.contains(table))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentRecord> {
        self.records.iter().filter_map(Option::as_ref)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ComponentRecord> {
        self.records.iter_mut().filter_map(Option::as_mut)
    }

    fn insert(&mut self, record: ComponentRecord) -> ComponentRecordId {
        let id = record.id;
        let rid = match self.free.pop() {
            Some(slot) => {
                self.records[slot as usize] = Some(record);
                ComponentRecordId(slot)
            }
            None => {
                self.records.push(Some(record));
                ComponentRecordId(self.records.len() as u32 - 1)
            }
        };
        self.by_id.insert(id, rid);
        rid
    }

    fn take(&mut self, rid: ComponentRecordId) -> Option<ComponentRecord> {
        let record = self.records.get_mut(rid.0 as usize)?.take()?;
        self.by_id.remove(&record.id);
        self.free.push(rid.0);
        self.non_fragmenting.retain(|r| *r != rid);
        Some(record)
    }
}

// ---------------------------------------------------------------------------
// World integration
// ---------------------------------------------------------------------------

impl World {
    /// Whether the entity with index `index` has `id` in its table type.
    pub(crate) fn index_has_id(&self, index: u32, id: Id) -> bool {
        let Some(entity) = self.entities.get_alive(index) else {
            return false;
        };
        self.entities
            .get(entity)
            .and_then(|r| r.table)
            .and_then(|t| self.tables.get(t))
            .is_some_and(|t| t.type_index(id).is_some())
    }

    /// Target index of the first `(rel, X)` pair on entity `index`.
    pub(crate) fn index_target(&self, index: u32, rel: EntityId) -> Option<u32> {
        let entity = self.entities.get_alive(index)?;
        let table = self.tables.get(self.entities.get(entity)?.table?)?;
        let record = table.record(Id::try_pair(rel, builtin::WILDCARD)?)?;
        Some(table.type_ids[record.index as usize].second())
    }

    /// Type info for the data carried by `id`, if any.
    pub(crate) fn type_info_for_id(&self, id: Id) -> Option<Arc<TypeInfo>> {
        if id.is_toggle() || id.is_wildcard() {
            return None;
        }
        if !id.is_pair() {
            return self.registry.get(id.first()).cloned();
        }
        let rel = id.first();
        if self.index_has_id(rel, Id::entity(builtin::PAIR_IS_TAG)) {
            return None;
        }
        if let Some(info) = self.registry.get(rel) {
            return Some(Arc::clone(info));
        }
        self.registry.get(id.second()).cloned()
    }

    fn compute_record_flags(&self, id: Id) -> ComponentFlags {
        let mut flags = ComponentFlags::empty();
        if id.is_wildcard() {
            flags.insert(ComponentFlags::IS_WILDCARD);
        }
        let rel = id.strip_flags().first();
        let rel_is_wildcard = rel == builtin::WILDCARD_INDEX || rel == builtin::ANY_INDEX;
        if !rel_is_wildcard && !id.is_toggle() {
            let has = |trait_: EntityId| self.index_has_id(rel, Id::entity(trait_));
            if id.is_pair() && has(builtin::EXCLUSIVE) {
                flags.insert(ComponentFlags::EXCLUSIVE);
            }
            if id.is_pair() && has(builtin::TRAVERSABLE) {
                flags.insert(ComponentFlags::TRAVERSABLE);
            }
            if has(builtin::DONT_FRAGMENT) {
                flags.insert(ComponentFlags::DONT_FRAGMENT);
            } else if has(builtin::SPARSE) {
                flags.insert(ComponentFlags::SPARSE);
            }
            if has(builtin::CAN_TOGGLE) {
                flags.insert(ComponentFlags::CAN_TOGGLE);
            }
            match self
                .index_target(rel, builtin::ON_DELETE)
                .and_then(CleanupPolicy::from_entity)
            {
                Some(CleanupPolicy::Remove) => flags.insert(ComponentFlags::ON_DELETE_REMOVE),
                Some(CleanupPolicy::Delete) => flags.insert(ComponentFlags::ON_DELETE_DELETE),
                Some(CleanupPolicy::Panic) => flags.insert(ComponentFlags::ON_DELETE_PANIC),
                None => {}
            }
            match self
                .index_target(rel, builtin::ON_DELETE_TARGET)
                .and_then(CleanupPolicy::from_entity)
            {
                Some(CleanupPolicy::Remove) => flags.insert(ComponentFlags::ON_DELETE_TARGET_REMOVE),
                Some(CleanupPolicy::Delete) => flags.insert(ComponentFlags::ON_DELETE_TARGET_DELETE),
                Some(CleanupPolicy::Panic) => flags.insert(ComponentFlags::ON_DELETE_TARGET_PANIC),
                None => {}
            }
        }
        if let Some(info) = self.type_info_for_id(id) {
            let hooks = info.hooks();
            if hooks.on_add.is_some() {
                flags.insert(ComponentFlags::HAS_ON_ADD);
            }
            if hooks.on_remove.is_some() {
                flags.insert(ComponentFlags::HAS_ON_REMOVE);
            }
            if hooks.on_set.is_some() {
                flags.insert(ComponentFlags::HAS_ON_SET);
            }
        }
        for event in Event::ALL {
            if self.observers.has_observers(event, id) {
                flags.insert(ComponentFlags::for_observers(event));
            }
        }
        flags
    }

    /// Report a relationship constraint violation, honoring soft asserts.
    fn constraint_violation(&self, id: Id, reason: String) -> Result<(), EcsError> {
        if self.config.soft_asserts {
            tracing::warn!(id = %self.id_str(id), "constraint violated (soft assert): {reason}");
            return Ok(());
        }
        Err(EcsError::ConstraintViolated {
            id: self.id_str(id),
            reason,
        })
    }

    fn check_constraints(&self, id: Id) -> Result<(), EcsError> {
        if !self.config.check_constraints || id.is_wildcard() || id.is_toggle() {
            return Ok(());
        }
        let has = |index: u32, trait_: EntityId| self.index_has_id(index, Id::entity(trait_));
        if !id.is_pair() {
            if has(id.first(), builtin::RELATIONSHIP) {
                return self.constraint_violation(
                    id,
                    "relationship used as a plain component".to_owned(),
                );
            }
            return Ok(());
        }
        let (rel, tgt) = (id.first(), id.second());
        if has(rel, builtin::TARGET) {
            return self.constraint_violation(id, "target-only id used as relationship".to_owned());
        }
        if has(tgt, builtin::RELATIONSHIP) {
            return self.constraint_violation(id, "relationship-only id used as target".to_owned());
        }
        if rel == builtin::IS_A.index() && has(tgt, builtin::FINAL) {
            return self.constraint_violation(id, "cannot inherit from a final entity".to_owned());
        }
        let one_of = if has(rel, builtin::ONE_OF) {
            Some(rel)
        } else {
            self.index_target(rel, builtin::ONE_OF)
        };
        if let Some(parent) = one_of {
            let tgt_parent = self.index_target(tgt, builtin::CHILD_OF);
            if tgt_parent != Some(parent) {
                return self.constraint_violation(
                    id,
                    format!(
                        "target is not a child of {}",
                        self.id_str(Id::from_index(parent))
                    ),
                );
            }
        }
        Ok(())
    }

    /// Build the pair `(rel, target)`, rejecting relationships whose index
    /// does not fit the pair encoding.
    pub(crate) fn pair_id(&self, rel: EntityId, target: EntityId) -> Result<Id, EcsError> {
        Id::try_pair(rel, target).ok_or_else(|| EcsError::InvalidId {
            id: Id::entity(rel),
            reason: format!("relationship index {} exceeds 24 bits", rel.index()),
        })
    }

    /// Validate an id for use on an entity.
    pub(crate) fn validate_id(&self, id: Id) -> Result<(), EcsError> {
        if !id.is_valid() {
            return Err(EcsError::InvalidId {
                id,
                reason: "malformed id".to_owned(),
            });
        }
        let stripped = id.strip_flags();
        let alive = |index: u32| self.entities.get_alive(index).is_some();
        if !alive(stripped.first()) || (stripped.is_pair() && !alive(stripped.second())) {
            return Err(EcsError::InvalidId {
                id,
                reason: "id refers to a deleted entity".to_owned(),
            });
        }
        Ok(())
    }

    /// Find or create the record for `id`, creating wildcard parents first.
    pub(crate) fn ensure_record(&mut self, id: Id) -> Result<ComponentRecordId, EcsError> {
        if let Some(rid) = self.components.lookup(id) {
            return Ok(rid);
        }
        self.check_constraints(id)?;

        let mut parents = Vec::new();
        if id.is_pair() && !id.is_wildcard() {
            let rel = Id::pair_index(id.first(), builtin::WILDCARD_INDEX);
            let tgt = Id::pair_index(builtin::WILDCARD_INDEX, id.second());
            parents.push(self.ensure_record(rel)?);
            parents.push(self.ensure_record(tgt)?);
        }

        let flags = self.compute_record_flags(id);
        let type_info = self.type_info_for_id(id);
        let sparse = if flags.intersects(ComponentFlags::SPARSE.union_raw(ComponentFlags::DONT_FRAGMENT)) {
            Some(match &type_info {
                Some(info) => SparseStore::with_data(info.vtable),
                None => SparseStore::new(),
            })
        } else {
            None
        };

        let rid = self.components.insert(ComponentRecord {
            id,
            flags,
            refcount: 0,
            query_refs: 0,
            type_info,
            cache: TableCache::default(),
            sparse,
            first_members: BTreeSet::new(),
            second_members: BTreeSet::new(),
            traversable_members: BTreeSet::new(),
        });
        if flags.contains(ComponentFlags::DONT_FRAGMENT) {
            self.components.non_fragmenting.push(rid);
        }

        for (i, parent) in parents.into_iter().enumerate() {
            if let Some(p) = self.components.get_mut(parent) {
                p.refcount += 1;
                if i == 0 {
                    p.first_members.insert(id);
                } else {
                    p.second_members.insert(id);
                    if flags.contains(ComponentFlags::TRAVERSABLE) {
                        p.traversable_members.insert(id);
                    }
                }
            }
        }

        // Entities used in ids are flagged so cleanup knows to look for them.
        let stripped = id.strip_flags();
        for index in [stripped.first(), stripped.second()] {
            if index == 0 {
                continue;
            }
            if let Some(entity) = self.entities.get_alive(index) {
                if let Some(record) = self.entities.get_mut(entity) {
                    record.flags.insert(RowFlags::IS_ID);
                    if index == stripped.second() && flags.contains(ComponentFlags::TRAVERSABLE) {
                        record.flags.insert(RowFlags::IS_TRAVERSABLE);
                    }
                }
            }
        }

        tracing::debug!(id = %self.id_str(id), "component record created");
        Ok(rid)
    }

    /// Take a reference on the record for `id`, creating it if needed.
    pub(crate) fn claim_record(&mut self, id: Id) -> Result<ComponentRecordId, EcsError> {
        let rid = self.ensure_record(id)?;
        if let Some(record) = self.components.get_mut(rid) {
            record.refcount += 1;
        }
        Ok(rid)
    }

    /// Drop a reference; frees the record (and releases its parents) at zero.
    pub(crate) fn release_record(&mut self, rid: ComponentRecordId) {
        let Some(record) = self.components.get_mut(rid) else {
            return;
        };
        record.refcount = record.refcount.saturating_sub(1);
        if record.refcount > 0 {
            return;
        }
        let Some(record) = self.components.take(rid) else {
            return;
        };
        tracing::debug!(id = %self.id_str(record.id), "component record freed");

        let id = record.id;
        if id.is_pair() && !id.is_wildcard() {
            let rel = Id::pair_index(id.first(), builtin::WILDCARD_INDEX);
            let tgt = Id::pair_index(builtin::WILDCARD_INDEX, id.second());
            if let Some(p) = self.components.get_by_id_mut(rel) {
                p.first_members.remove(&id);
            }
            if let Some(p) = self.components.get_by_id_mut(tgt) {
                p.second_members.remove(&id);
                p.traversable_members.remove(&id);
            }
            for parent in [rel, tgt] {
                if let Some(prid) = self.components.lookup(parent) {
                    self.release_record(prid);
                }
            }
        }
    }

    /// Release every non-wildcard member of a wildcard record.
    ///
    /// Members only stay alive through explicit claims once their tables are
    /// gone; this drops those claims.
    pub(crate) fn release_wildcard_members(&mut self, wildcard: Id) {
        let Some(record) = self.components.get_by_id(wildcard) else {
            return;
        };
        let members: Vec<Id> = record.members().collect();
        for member in members {
            while let Some(rid) = self.components.lookup(member) {
                let tables = self.components.get(rid).map_or(0, |r| r.cache.len());
                if tables > 0 {
                    break;
                }
                self.release_record(rid);
            }
        }
    }

    /// Recompute observer-presence flags of every record matching `pattern`.
    pub(crate) fn refresh_observer_flags(&mut self, pattern: Id) {
        let ids: Vec<Id> = self
            .components
            .iter()
            .filter(|r| r.id == pattern || r.id.matches(pattern) || pattern.matches(r.id))
            .map(|r| r.id)
            .collect();
        for id in ids {
            let mut observed = ComponentFlags::empty();
            for event in Event::ALL {
                if self.observers.has_observers(event, id) {
                    observed.insert(ComponentFlags::for_observers(event));
                }
            }
            if let Some(record) = self.components.get_by_id_mut(id) {
                record.flags.remove(ComponentFlags::OBSERVER_MASK);
                record.flags.insert(observed);
            }
        }
    }

    /// Recompute hook-presence flags after hooks changed.
    pub(crate) fn refresh_hook_flags(&mut self, component: u32) {
        let ids: Vec<Id> = self
            .components
            .iter()
            .filter(|r| r.id.first() == component || (r.id.is_pair() && r.id.second() == component))
            .map(|r| r.id)
            .collect();
        for id in ids {
            let info = self.type_info_for_id(id);
            if let Some(record) = self.components.get_by_id_mut(id) {
                record.flags.remove(ComponentFlags::HAS_ON_ADD);
                record.flags.remove(ComponentFlags::HAS_ON_REMOVE);
                record.flags.remove(ComponentFlags::HAS_ON_SET);
                if let Some(info) = &info {
                    if info.hooks.on_add.is_some() {
                        record.flags.insert(ComponentFlags::HAS_ON_ADD);
                    }
                    if info.hooks.on_remove.is_some() {
                        record.flags.insert(ComponentFlags::HAS_ON_REMOVE);
                    }
                    if info.hooks.on_set.is_some() {
                        record.flags.insert(ComponentFlags::HAS_ON_SET);
                    }
                }
                record.type_info = info;
            }
        }
    }

    /// Keys under which a table with this type is registered, with their
    /// table records. Sorted by key.
    pub(crate) fn table_record_keys(&self, type_ids: &[Id], column_map: &[Option<u16>]) -> Vec<TableRecord> {
        let mut records: Vec<TableRecord> = Vec::with_capacity(type_ids.len() * 2);
        let mut push = |key: Id, index: usize| {
            match records.iter_mut().find(|r| r.id == key) {
                Some(r) => r.count += 1,
                None => records.push(TableRecord {
                    id: key,
                    index: index as u16,
                    count: 1,
                    column: column_map[index],
                }),
            }
        };
        for (index, &id) in type_ids.iter().enumerate() {
            push(id, index);
            if id.is_toggle() {
                continue;
            }
            if id.is_pair() {
                push(Id::pair_index(id.first(), builtin::WILDCARD_INDEX), index);
                push(Id::pair_index(builtin::WILDCARD_INDEX, id.second()), index);
                push(Id::pair_index(builtin::WILDCARD_INDEX, builtin::WILDCARD_INDEX), index);
            } else {
                push(Id::entity(builtin::WILDCARD), index);
            }
        }
        records.sort_by_key(|r| r.id);
        records
    }

    /// Register a freshly created table with every record matching its type.
    pub(crate) fn register_table_records(&mut self, table: TableId) -> Result<(), EcsError> {
        let Some(t) = self.tables.get(table) else {
            crate::ecs_internal!("registering unknown {table}");
        };
        let records = self.table_record_keys(&t.type_ids, &t.column_map);
        let active = !t.is_empty();
        for record in &records {
            let rid = self.ensure_record(record.id)?;
            if let Some(r) = self.components.get_mut(rid) {
                r.refcount += 1;
                r.cache.insert(table, active);
            }
        }
        if let Some(t) = self.tables.get_mut(table) {
            t.records = records;
        }
        Ok(())
    }

    /// Remove a table from every record it was registered with.
    pub(crate) fn unregister_table_records(&mut self, table: TableId) {
        let keys: Vec<Id> = match self.tables.get(table) {
            Some(t) => t.records.iter().map(|r| r.id).collect(),
            None => return,
        };
        for key in keys {
            if let Some(rid) = self.components.lookup(key) {
                if let Some(r) = self.components.get_mut(rid) {
                    r.cache.remove(table);
                }
                self.release_record(rid);
            }
        }
    }

    /// Move a table between the non-empty and empty lists of its records.
    pub(crate) fn set_table_active(&mut self, table: TableId, active: bool) {
        let keys: Vec<Id> = match self.tables.get(table) {
            Some(t) => t.records.iter().map(|r| r.id).collect(),
            None => return,
        };
        for key in keys {
            if let Some(r) = self.components.get_by_id_mut(key) {
                r.cache.set_active(table, active);
            }
        }
        tracing::trace!(%table, active, "table activation changed");
    }

    /// Flags a table gets from one of its type entries.
    pub(crate) fn table_flags_for_id(&self, id: Id) -> TableFlags {
        let mut flags = TableFlags::empty();
        if id.is_pair() {
            flags.insert(TableFlags::HAS_PAIRS);
            if id.first() == builtin::IS_A.index() {
                flags.insert(TableFlags::HAS_IS_A);
            }
            if id.first() == builtin::CHILD_OF.index() {
                flags.insert(TableFlags::HAS_CHILD_OF);
            }
            if self
                .components
                .get_by_id(id)
                .is_some_and(|r| r.flags.contains(ComponentFlags::TRAVERSABLE))
            {
                flags.insert(TableFlags::HAS_TRAVERSABLE);
            }
        } else if id == Id::entity(builtin::PREFAB) {
            flags.insert(TableFlags::IS_PREFAB);
        } else if id == Id::entity(builtin::DISABLED) {
            flags.insert(TableFlags::IS_DISABLED);
        }
        if self
            .components
            .get_by_id(id)
            .is_some_and(|r| r.flags.contains(ComponentFlags::SPARSE))
        {
            flags.insert(TableFlags::HAS_SPARSE);
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_cache_activation() {
        let mut cache = TableCache::default();
        cache.insert(TableId(1), false);
        cache.insert(TableId(2), true);
        cache.insert(TableId(3), false);
        assert_eq!(cache.tables(), &[TableId(2)]);
        cache.set_active(TableId(1), true);
        assert_eq!(cache.tables(), &[TableId(2), TableId(1)]);
        assert_eq!(cache.empty_tables(), &[TableId(3)]);
        assert!(cache.remove(TableId(2)));
        assert_eq!(cache.tables(), &[TableId(1)]);
        assert!(!cache.remove(TableId(2)));
        assert_eq!(cache.all_tables().count(), 2);
    }

    #[test]
    fn cleanup_policy_from_builtin() {
        assert_eq!(
            CleanupPolicy::from_entity(builtin::DELETE.index()),
            Some(CleanupPolicy::Delete)
        );
        assert_eq!(CleanupPolicy::from_entity(999), None);
    }
}
