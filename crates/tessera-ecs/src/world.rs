//! The [`World`] is the root store. It owns the entity index, the component
//! registry and index, every table, observers, compiled query state and the
//! deferred command queue.
//!
//! Structural changes live in `mutation`, deletion in `cleanup`, graph
//! traversal in `table_graph`; this module holds construction, entity
//! lifecycle, component registration, names and read access.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::commands::{ApplyReport, CommandQueue};
use crate::component::{ComponentRegistry, TypeHooks, TypeInfo};
use crate::component_index::{ComponentIndex, ComponentRecord};
use crate::config::WorldConfig;
use crate::entity::{EntityId, EntityIndex, Record};
use crate::hash::IdMap;
use crate::id::{builtin, Id};
use crate::observer::ObserverRegistry;
use crate::query::cache::QueryRegistry;
use crate::table::{Table, TableId, TableStore};
use crate::EcsError;

/// Longest `IsA` chain followed when resolving inherited values.
const MAX_INHERIT_DEPTH: usize = 32;

// ---------------------------------------------------------------------------
// WorldStats
// ---------------------------------------------------------------------------

/// Point-in-time counters of a world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorldStats {
    pub entities: usize,
    pub tables: usize,
    pub empty_tables: usize,
    pub component_records: usize,
    pub data_components: usize,
    pub queries: usize,
    pub observers: usize,
    pub pending_commands: usize,
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The root store.
pub struct World {
    pub(crate) entities: EntityIndex,
    pub(crate) registry: ComponentRegistry,
    pub(crate) components: ComponentIndex,
    pub(crate) tables: TableStore,
    /// The table with the empty type. New entities start here.
    pub(crate) root: TableId,
    pub(crate) observers: ObserverRegistry,
    pub(crate) queries: QueryRegistry,
    pub(crate) commands: CommandQueue,
    pub(crate) defer_depth: u32,
    pub(crate) defer_suspended: u32,
    names: HashMap<String, EntityId>,
    names_by_index: IdMap<u32, String>,
    pub(crate) config: WorldConfig,
    pub(crate) last_apply_report: ApplyReport,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.entities.alive_count())
            .field("table_count", &self.tables.len())
            .field("record_count", &self.components.len())
            .field("deferred", &self.is_deferred())
            .finish()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create a world with the default configuration.
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    /// Create a world with builtin entities and their traits in place.
    pub fn with_config(config: WorldConfig) -> Self {
        let mut tables = TableStore::with_capacity(config.table_capacity);
        let root = tables.next_id();
        tables.insert(Table::new(root, Vec::new()));

        let mut world = Self {
            entities: EntityIndex::with_capacity(builtin::FIRST_USER_ENTITY, config.entity_capacity),
            registry: ComponentRegistry::new(),
            components: ComponentIndex::default(),
            tables,
            root,
            observers: ObserverRegistry::default(),
            queries: QueryRegistry::default(),
            commands: CommandQueue::default(),
            defer_depth: 0,
            defer_suspended: 0,
            names: HashMap::new(),
            names_by_index: IdMap::default(),
            config,
            last_apply_report: ApplyReport::default(),
        };
        if let Err(e) = world.bootstrap() {
            crate::ecs_internal!("world bootstrap failed: {e}");
        }
        world
    }

    fn bootstrap(&mut self) -> Result<(), EcsError> {
        for &(entity, name) in builtin::ALL {
            self.entities.ensure(entity)?;
            self.place_in_root(entity);
            self.set_name(entity, name)?;
        }

        let tag = Id::entity;
        for policy_rel in [builtin::ON_DELETE, builtin::ON_DELETE_TARGET] {
            self.add_id(policy_rel, tag(builtin::EXCLUSIVE))?;
            self.add_id(policy_rel, tag(builtin::RELATIONSHIP))?;
        }
        for policy in [builtin::REMOVE, builtin::DELETE, builtin::PANIC] {
            self.add_id(policy, tag(builtin::TARGET))?;
        }
        self.add_id(builtin::CHILD_OF, tag(builtin::EXCLUSIVE))?;
        self.add_id(builtin::CHILD_OF, tag(builtin::TRAVERSABLE))?;
        self.add_id(builtin::CHILD_OF, Id::pair(builtin::ON_DELETE_TARGET, builtin::DELETE))?;
        self.add_id(builtin::IS_A, tag(builtin::TRAVERSABLE))?;
        tracing::debug!(builtins = builtin::ALL.len(), "world bootstrapped");
        Ok(())
    }

    /// The configuration this world was created with.
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    // -- entity lifecycle ---------------------------------------------------

    pub(crate) fn place_in_root(&mut self, entity: EntityId) {
        let root = self.root;
        let Some(table) = self.tables.get_mut(root) else {
            crate::ecs_internal!("root table missing");
        };
        let row = table.append(entity);
        if let Some(record) = self.entities.get_mut(entity) {
            record.table = Some(root);
            record.row = row as u32;
        }
    }

    /// Create an entity with an empty type.
    pub fn new_entity(&mut self) -> EntityId {
        let entity = self.entities.new_id();
        self.place_in_root(entity);
        entity
    }

    /// Create an entity and give it a name.
    pub fn new_named(&mut self, name: &str) -> Result<EntityId, EcsError> {
        if self.names.contains_key(name) {
            return Err(EcsError::InvalidParameter {
                reason: format!("name `{name}` is already taken"),
            });
        }
        let entity = self.new_entity();
        self.set_name(entity, name)?;
        Ok(entity)
    }

    /// Make exactly `entity` alive (same index and generation).
    pub fn make_alive(&mut self, entity: EntityId) -> Result<(), EcsError> {
        if self.entities.is_alive(entity) {
            return Ok(());
        }
        self.entities.ensure(entity)?;
        self.place_in_root(entity);
        Ok(())
    }

    #[inline]
    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.entities.is_alive(entity)
    }

    /// The live id of an entity index, whatever its generation.
    #[inline]
    pub fn get_alive(&self, index: u32) -> Option<EntityId> {
        self.entities.get_alive(index)
    }

    /// Location record of a live entity.
    #[inline]
    pub fn record(&self, entity: EntityId) -> Option<&Record> {
        self.entities.get(entity)
    }

    /// Number of alive entities, builtins included.
    pub fn entity_count(&self) -> usize {
        self.entities.alive_count()
    }

    pub(crate) fn check_alive(&self, entity: EntityId) -> Result<&Record, EcsError> {
        self.entities
            .get(entity)
            .ok_or(EcsError::StaleEntity { entity })
    }

    // -- components ---------------------------------------------------------

    /// Register `T` as a component, returning its component entity.
    ///
    /// Registering the same type again returns the existing entity.
    pub fn register_component<T>(&mut self, name: &str) -> EntityId
    where
        T: Default + Clone + Send + Sync + 'static,
    {
        if let Some(existing) = self.registry.lookup::<T>() {
            return existing;
        }
        let entity = self.new_entity();
        self.registry.insert_typed::<T>(entity, name);
        if let Err(e) = self.set_name(entity, name) {
            tracing::warn!(%entity, error = %e, "component registered without a name");
        }
        tracing::debug!(%entity, name, size = std::mem::size_of::<T>(), "component registered");
        entity
    }

    /// Register a plain-bytes component of the given layout.
    pub fn register_bytes_component(
        &mut self,
        name: &str,
        size: usize,
        align: usize,
    ) -> Result<EntityId, EcsError> {
        if std::alloc::Layout::from_size_align(size, align).is_err() {
            return Err(EcsError::InvalidParameter {
                reason: format!("invalid layout size={size} align={align}"),
            });
        }
        let entity = self.new_named(name)?;
        self.registry.insert_bytes(entity, name, size, align);
        tracing::debug!(%entity, name, size, "bytes component registered");
        Ok(entity)
    }

    /// Attach `T` as the data type of an existing entity, for example a
    /// relationship whose pairs carry a value.
    pub fn set_component_type<T>(&mut self, entity: EntityId, name: &str) -> Result<(), EcsError>
    where
        T: Default + Clone + Send + Sync + 'static,
    {
        self.check_alive(entity)?;
        if self.registry.get(entity.index()).is_some() || self.registry.lookup::<T>().is_some() {
            return Err(EcsError::InvalidOperation {
                reason: format!("{entity} or its type is already registered"),
            });
        }
        if self.is_used_as_id(entity) {
            return Err(EcsError::InvalidOperation {
                reason: format!("cannot change the type of {entity} while it is in use"),
            });
        }
        self.registry.insert_typed::<T>(entity, name);
        Ok(())
    }

    /// Component entity registered for `T`.
    pub fn component<T: 'static>(&self) -> Option<EntityId> {
        self.registry.lookup::<T>()
    }

    /// Component entity for `T`, or [`EcsError::UnknownComponent`].
    pub(crate) fn component_id<T: 'static>(&self) -> Result<Id, EcsError> {
        self.registry
            .lookup::<T>()
            .map(Id::entity)
            .ok_or_else(|| EcsError::UnknownComponent {
                name: std::any::type_name::<T>().to_owned(),
            })
    }

    /// Type info of the data carried by `id`, if it carries data.
    pub fn type_info(&self, id: Id) -> Option<Arc<TypeInfo>> {
        self.type_info_for_id(id)
    }

    /// Install lifecycle hooks for a data component.
    pub fn set_hooks(&mut self, component: EntityId, hooks: TypeHooks) -> Result<(), EcsError> {
        self.check_alive(component)?;
        if self.registry.set_hooks(component.index(), hooks).is_none() {
            return Err(EcsError::UnknownComponent {
                name: self.id_str(Id::entity(component)),
            });
        }
        self.refresh_hook_flags(component.index());
        Ok(())
    }

    /// Record of an id, if the id is in use.
    pub fn component_record(&self, id: Id) -> Option<&ComponentRecord> {
        self.components.get_by_id(id)
    }

    /// Whether `entity` is the first element of an id that has a record.
    pub(crate) fn is_used_as_id(&self, entity: EntityId) -> bool {
        self.components.lookup(Id::entity(entity)).is_some()
            || Id::try_pair_index(entity.index(), builtin::WILDCARD_INDEX)
                .is_some_and(|key| self.components.lookup(key).is_some())
    }

    // -- names --------------------------------------------------------------

    /// Give `entity` a unique name, replacing any previous one.
    pub fn set_name(&mut self, entity: EntityId, name: &str) -> Result<(), EcsError> {
        self.check_alive(entity)?;
        match self.names.get(name) {
            Some(owner) if *owner == entity => return Ok(()),
            Some(owner) => {
                return Err(EcsError::InvalidParameter {
                    reason: format!("name `{name}` is already used by {owner}"),
                })
            }
            None => {}
        }
        if let Some(old) = self.names_by_index.insert(entity.index(), name.to_owned()) {
            self.names.remove(&old);
        }
        self.names.insert(name.to_owned(), entity);
        Ok(())
    }

    pub fn name(&self, entity: EntityId) -> Option<&str> {
        if !self.is_alive(entity) {
            return None;
        }
        self.names_by_index.get(&entity.index()).map(String::as_str)
    }

    /// Entity with the given name.
    pub fn lookup(&self, name: &str) -> Option<EntityId> {
        self.names.get(name).copied().filter(|e| self.is_alive(*e))
    }

    pub(crate) fn forget_name(&mut self, entity: EntityId) {
        if let Some(name) = self.names_by_index.remove(&entity.index()) {
            self.names.remove(&name);
        }
    }

    fn index_str(&self, index: u32) -> String {
        match index {
            builtin::WILDCARD_INDEX => "*".to_owned(),
            builtin::ANY_INDEX => "_".to_owned(),
            _ => self
                .names_by_index
                .get(&index)
                .cloned()
                .unwrap_or_else(|| format!("#{index}")),
        }
    }

    /// Human-readable form of an id, using entity names.
    pub fn id_str(&self, id: Id) -> String {
        let prefix = if id.is_toggle() { "TOGGLE|" } else { "" };
        if id.is_pair() {
            format!(
                "{prefix}({},{})",
                self.index_str(id.first()),
                self.index_str(id.second())
            )
        } else {
            format!("{prefix}{}", self.index_str(id.first()))
        }
    }

    /// Human-readable form of a table type.
    pub fn type_str(&self, ids: &[Id]) -> String {
        let parts: Vec<String> = ids.iter().map(|id| self.id_str(*id)).collect();
        format!("[{}]", parts.join(", "))
    }

    // -- tables -------------------------------------------------------------

    /// The table with the empty type.
    #[inline]
    pub fn root_table(&self) -> TableId {
        self.root
    }

    #[inline]
    pub fn table(&self, table: TableId) -> Option<&Table> {
        self.tables.get(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Table currently holding `entity`.
    pub fn table_of(&self, entity: EntityId) -> Option<&Table> {
        self.tables.get(self.entities.get(entity)?.table?)
    }

    /// Sorted id vector of the table holding `entity`.
    pub fn type_of(&self, entity: EntityId) -> Option<&[Id]> {
        self.table_of(entity).map(Table::type_ids)
    }

    // -- reads --------------------------------------------------------------

    /// Whether `entity` has `id`. Wildcards match any id of the pattern.
    pub fn has_id(&self, entity: EntityId, id: Id) -> bool {
        let Some(record) = self.entities.get(entity) else {
            return false;
        };
        if let Some(store) = self.components.get_by_id(id).and_then(ComponentRecord::sparse) {
            if store.contains(entity) {
                return true;
            }
        }
        record
            .table
            .and_then(|t| self.tables.get(t))
            .is_some_and(|t| t.has_id(id))
    }

    /// Whether `entity` has the component registered for `T`.
    pub fn has<T: 'static>(&self, entity: EntityId) -> bool {
        self.component::<T>()
            .is_some_and(|c| self.has_id(entity, Id::entity(c)))
    }

    /// Pair helper.
    pub fn has_pair(&self, entity: EntityId, rel: EntityId, target: EntityId) -> bool {
        Id::try_pair(rel, target).is_some_and(|id| self.has_id(entity, id))
    }

    /// Value of `id` owned by `entity` itself (not inherited).
    pub fn get_own<T: 'static>(&self, entity: EntityId, id: Id) -> Option<&T> {
        let location = self.entities.get(entity)?;
        if let Some(record) = self.components.get_by_id(id) {
            if let Some(store) = record.sparse() {
                if !record.type_info().is_some_and(|i| i.is::<T>()) {
                    return None;
                }
                // SAFETY: the store was created for the type checked above.
                return unsafe { store.get::<T>(entity) };
            }
        }
        let table = self.tables.get(location.table?)?;
        table.get::<T>(location.row as usize, id)
    }

    /// Mutable value of `id` owned by `entity`. Does not emit `OnSet`.
    pub fn get_own_mut<T: 'static>(&mut self, entity: EntityId, id: Id) -> Option<&mut T> {
        let location = *self.entities.get(entity)?;
        let sparse = self
            .components
            .get_by_id(id)
            .is_some_and(|r| r.sparse().is_some());
        if sparse {
            let record = self.components.get_by_id_mut(id)?;
            if !record.type_info.as_ref().is_some_and(|i| i.is::<T>()) {
                return None;
            }
            let store = record.sparse.as_mut()?;
            // SAFETY: the store was created for the type checked above.
            return unsafe { store.get_mut::<T>(entity) };
        }
        let table = self.tables.get_mut(location.table?)?;
        table.get_mut::<T>(location.row as usize, id)
    }

    /// Value of `id` for `entity`, inherited through `IsA` if not owned.
    pub fn get_id<T: 'static>(&self, entity: EntityId, id: Id) -> Option<&T> {
        self.get_inherited(entity, id, 0)
    }

    fn get_inherited<T: 'static>(&self, entity: EntityId, id: Id, depth: usize) -> Option<&T> {
        if let Some(value) = self.get_own::<T>(entity, id) {
            return Some(value);
        }
        if depth >= MAX_INHERIT_DEPTH {
            return None;
        }
        self.bases(entity)
            .into_iter()
            .find_map(|base| self.get_inherited(base, id, depth + 1))
    }

    /// Value of the component `T`, inherited through `IsA` if not owned.
    pub fn get<T: 'static>(&self, entity: EntityId) -> Option<&T> {
        let component = self.component::<T>()?;
        self.get_id(entity, Id::entity(component))
    }

    /// Mutable value of the component `T` owned by `entity`.
    ///
    /// Does not emit `OnSet`; call [`modified`](Self::modified) afterwards
    /// if observers need to know.
    pub fn get_mut<T: 'static>(&mut self, entity: EntityId) -> Option<&mut T> {
        let component = self.component::<T>()?;
        self.get_own_mut(entity, Id::entity(component))
    }

    /// Raw bytes of the value of `id` owned by `entity`. Only byte-only
    /// components expose their storage; typed components return `None`.
    pub fn get_bytes(&self, entity: EntityId, id: Id) -> Option<&[u8]> {
        let location = self.entities.get(entity)?;
        if let Some(record) = self.components.get_by_id(id) {
            if let Some(store) = record.sparse() {
                let info = record.type_info().filter(|info| info.is_pod())?;
                let size = info.size;
                let ptr = store.get_ptr(entity)?;
                // SAFETY: the pointer addresses one live value of `size` bytes.
                return Some(unsafe { std::slice::from_raw_parts(ptr, size) });
            }
        }
        self.tables
            .get(location.table?)?
            .get_bytes(location.row as usize, id)
    }

    /// Direct `IsA` bases of `entity`.
    pub fn bases(&self, entity: EntityId) -> Vec<EntityId> {
        self.targets(entity, builtin::IS_A)
    }

    /// All targets of `rel` on `entity`, in type order.
    pub fn targets(&self, entity: EntityId, rel: EntityId) -> Vec<EntityId> {
        let Some(table) = self.table_of(entity) else {
            return Vec::new();
        };
        let Some(record) = Id::try_pair(rel, builtin::WILDCARD).and_then(|id| table.record(id)) else {
            return Vec::new();
        };
        let start = record.index as usize;
        table.type_ids()[start..start + record.count as usize]
            .iter()
            .filter_map(|id| self.entities.get_alive(id.second()))
            .collect()
    }

    /// The `nth` target of `rel` on `entity`.
    pub fn target(&self, entity: EntityId, rel: EntityId, nth: usize) -> Option<EntityId> {
        self.targets(entity, rel).get(nth).copied()
    }

    /// `ChildOf` target of `entity`.
    pub fn parent(&self, entity: EntityId) -> Option<EntityId> {
        self.target(entity, builtin::CHILD_OF, 0)
    }

    /// Whether a toggleable id is enabled on `entity`.
    ///
    /// Ids without a toggle entry count as enabled when present.
    pub fn is_enabled(&self, entity: EntityId, id: Id) -> bool {
        let Some(location) = self.entities.get(entity) else {
            return false;
        };
        let Some(table) = location.table.and_then(|t| self.tables.get(t)) else {
            return false;
        };
        if !table.has_id(id) {
            return false;
        }
        table
            .bitset(id)
            .map_or(true, |bits| bits.get(location.row as usize))
    }

    // -- stats --------------------------------------------------------------

    pub fn stats(&self) -> WorldStats {
        WorldStats {
            entities: self.entities.alive_count(),
            tables: self.tables.len(),
            empty_tables: self.tables.iter().filter(|t| t.is_empty()).count(),
            component_records: self.components.len(),
            data_components: self.registry.len(),
            queries: self.queries.len(),
            observers: self.observers.len(),
            pending_commands: self.commands.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[test]
    fn builtins_exist_after_construction() {
        let world = World::new();
        for &(entity, name) in builtin::ALL {
            assert!(world.is_alive(entity), "{name} not alive");
            assert_eq!(world.lookup(name), Some(entity));
        }
        assert!(world.has_id(builtin::CHILD_OF, Id::entity(builtin::EXCLUSIVE)));
        assert!(world.has_id(
            builtin::CHILD_OF,
            Id::pair(builtin::ON_DELETE_TARGET, builtin::DELETE)
        ));
    }

    #[test]
    fn new_entities_start_in_root_table() {
        let mut world = World::new();
        let e = world.new_entity();
        assert!(e.index() >= builtin::FIRST_USER_ENTITY);
        assert_eq!(world.record(e).unwrap().table, Some(world.root_table()));
        assert_eq!(world.type_of(e), Some(&[][..]));
    }

    #[test]
    fn make_alive_claims_exact_id() {
        let mut world = World::new();
        let wanted = EntityId::new(5000, 3);
        world.make_alive(wanted).unwrap();
        assert!(world.is_alive(wanted));
        assert_eq!(world.get_alive(5000), Some(wanted));
        assert!(world.make_alive(EntityId::new(5000, 4)).is_err());
    }

    #[test]
    fn register_component_is_idempotent() {
        let mut world = World::new();
        let a = world.register_component::<Position>("Position");
        let b = world.register_component::<Position>("Position");
        assert_eq!(a, b);
        assert_eq!(world.lookup("Position"), Some(a));
        assert!(world.type_info(Id::entity(a)).unwrap().is::<Position>());
    }

    #[test]
    fn names_are_unique() {
        let mut world = World::new();
        let a = world.new_named("alpha").unwrap();
        assert!(world.new_named("alpha").is_err());
        assert_eq!(world.name(a), Some("alpha"));
        world.set_name(a, "beta").unwrap();
        assert_eq!(world.lookup("alpha"), None);
        assert_eq!(world.lookup("beta"), Some(a));
    }

    #[test]
    fn id_str_uses_names() {
        let mut world = World::new();
        let likes = world.new_named("Likes").unwrap();
        let bob = world.new_named("Bob").unwrap();
        assert_eq!(world.id_str(Id::pair(likes, bob)), "(Likes,Bob)");
        assert_eq!(world.id_str(Id::pair(likes, builtin::WILDCARD)), "(Likes,*)");
    }

    #[test]
    fn bytes_component_rejects_bad_layout() {
        let mut world = World::new();
        assert!(world.register_bytes_component("Odd", 4, 3).is_err());
        let c = world.register_bytes_component("Raw", 8, 8).unwrap();
        assert!(world.type_info(Id::entity(c)).unwrap().is_pod());
    }

    #[test]
    fn raw_bytes_only_for_byte_components() {
        #[derive(Debug, Default, Clone)]
        struct Padded {
            _a: u8,
            _b: u64,
        }
        let mut world = World::new();
        let raw = Id::entity(world.register_bytes_component("Raw", 8, 8).unwrap());
        let padded = Id::entity(world.register_component::<Padded>("Padded"));
        let e = world.new_entity();
        world.add_id(e, raw).unwrap();
        world.add_id(e, padded).unwrap();
        assert_eq!(world.get_bytes(e, raw), Some(&[0u8; 8][..]));
        assert_eq!(world.get_bytes(e, padded), None);
    }

    #[test]
    fn stats_track_entities() {
        let mut world = World::new();
        let before = world.stats();
        world.new_entity();
        let after = world.stats();
        assert_eq!(after.entities, before.entities + 1);
        assert_eq!(after.pending_commands, 0);
    }
}
