//! Table (archetype) storage.
//!
//! A [`Table`] stores all entities that share the exact same sorted id vector
//! (its *type*). Components are laid out SoA-style: one [`Column`] per
//! data-carrying id, one [`BitColumn`] per toggle entry, plus a parallel
//! entity vector that maps row index to entity.
//!
//! Tables do not know about the rest of the world. Creating a table, wiring
//! its records into the component index and moving rows between tables with
//! hooks and events is done by the world (`table_graph`, `mutation`).

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::column::{BitColumn, Column};
use crate::component::TypeInfo;
use crate::entity::EntityId;
use crate::hash::{hash_type, IdMap};
use crate::id::Id;
use crate::table_graph::GraphNode;

// ---------------------------------------------------------------------------
// TableId
// ---------------------------------------------------------------------------

/// Identifies a table within the world. Indices into the table store; never
/// reused for another type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TableId(pub(crate) u32);

impl TableId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TableFlags
// ---------------------------------------------------------------------------

/// Structural properties of a table, computed once from its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableFlags(u32);

impl TableFlags {
    pub const HAS_PAIRS: TableFlags = TableFlags(1 << 0);
    pub const HAS_IS_A: TableFlags = TableFlags(1 << 1);
    pub const HAS_CHILD_OF: TableFlags = TableFlags(1 << 2);
    /// At least one column has lifecycle hooks or drop glue.
    pub const HAS_HOOKS: TableFlags = TableFlags(1 << 3);
    pub const HAS_TOGGLE: TableFlags = TableFlags(1 << 4);
    pub const IS_PREFAB: TableFlags = TableFlags(1 << 5);
    pub const IS_DISABLED: TableFlags = TableFlags(1 << 6);
    pub const HAS_SPARSE: TableFlags = TableFlags(1 << 7);
    /// Contains a pair whose relationship is traversable.
    pub const HAS_TRAVERSABLE: TableFlags = TableFlags(1 << 8);
    pub const HAS_DATA: TableFlags = TableFlags(1 << 9);

    pub const fn empty() -> Self {
        TableFlags(0)
    }

    #[inline]
    pub const fn contains(self, other: TableFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: TableFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: TableFlags) {
        self.0 |= other.0;
    }

    pub const fn union(self, other: TableFlags) -> Self {
        TableFlags(self.0 | other.0)
    }
}

// ---------------------------------------------------------------------------
// TableRecord
// ---------------------------------------------------------------------------

/// Where an id (or wildcard pattern) occurs in a table's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRecord {
    /// The (possibly wildcard) id this record was registered for.
    pub id: Id,
    /// Type index of the first match.
    pub index: u16,
    /// Number of matching type entries.
    pub count: u16,
    /// Data column of the first match, if it carries data.
    pub column: Option<u16>,
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// A data column together with the id and type info it stores.
pub(crate) struct DataColumn {
    pub(crate) id: Id,
    pub(crate) type_info: Arc<TypeInfo>,
    pub(crate) data: Column,
}

impl fmt::Debug for DataColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataColumn")
            .field("id", &self.id)
            .field("type", &self.type_info.name)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Description of one type entry, resolved by the world before creation.
#[derive(Debug, Clone)]
pub(crate) struct TypeEntry {
    pub(crate) id: Id,
    /// `Some` if the entry gets a data column.
    pub(crate) type_info: Option<Arc<TypeInfo>>,
    pub(crate) flags: TableFlags,
}

/// Columnar storage for every entity with one exact type.
#[derive(Debug)]
pub struct Table {
    pub(crate) id: TableId,
    pub(crate) type_ids: Vec<Id>,
    pub(crate) hash: u64,
    pub(crate) flags: TableFlags,
    pub(crate) entities: Vec<EntityId>,
    pub(crate) columns: Vec<DataColumn>,
    /// Type index -> data column.
    pub(crate) column_map: Vec<Option<u16>>,
    /// One bit column per `TOGGLE|id` entry, keyed by the plain id.
    pub(crate) bitsets: Vec<(Id, BitColumn)>,
    /// Concrete and wildcard records, sorted by id.
    pub(crate) records: Vec<TableRecord>,
    /// Canonical table holding only this table's data ids.
    pub(crate) storage_table: Option<TableId>,
    pub(crate) node: GraphNode,
    /// Number of other tables using this one as their storage table.
    pub(crate) storage_refs: u32,
    /// Non-zero while column views are handed out.
    pub(crate) lock: u32,
}

impl Table {
    pub(crate) fn new(id: TableId, entries: Vec<TypeEntry>) -> Self {
        let type_ids: Vec<Id> = entries.iter().map(|e| e.id).collect();
        debug_assert!(type_ids.windows(2).all(|w| w[0] < w[1]), "table type must be sorted");
        let mut flags = TableFlags::empty();
        let mut columns = Vec::new();
        let mut column_map = Vec::with_capacity(entries.len());
        let mut bitsets = Vec::new();

        for entry in entries {
            flags.insert(entry.flags);
            if entry.id.is_toggle() {
                flags.insert(TableFlags::HAS_TOGGLE);
                bitsets.push((entry.id.strip_flags(), BitColumn::new()));
            }
            match entry.type_info {
                Some(info) => {
                    flags.insert(TableFlags::HAS_DATA);
                    if !info.hooks.is_empty() || info.vtable.drop_fn.is_some() {
                        flags.insert(TableFlags::HAS_HOOKS);
                    }
                    column_map.push(Some(columns.len() as u16));
                    columns.push(DataColumn {
                        id: entry.id,
                        data: Column::new(info.vtable),
                        type_info: info,
                    });
                }
                None => column_map.push(None),
            }
        }

        Self {
            id,
            hash: hash_type(&type_ids),
            type_ids,
            flags,
            entities: Vec::new(),
            columns,
            column_map,
            bitsets,
            records: Vec::new(),
            storage_table: None,
            node: GraphNode::default(),
            storage_refs: 0,
            lock: 0,
        }
    }

    /// The table's unique ID.
    #[inline]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// The sorted id vector that defines this table.
    #[inline]
    pub fn type_ids(&self) -> &[Id] {
        &self.type_ids
    }

    #[inline]
    pub fn flags(&self) -> TableFlags {
        self.flags
    }

    /// Number of rows.
    #[inline]
    pub fn count(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entity stored at each row.
    #[inline]
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// The canonical table containing only this table's data ids.
    #[inline]
    pub fn storage_table(&self) -> Option<TableId> {
        self.storage_table
    }

    /// Type index of `id`, exact match only.
    #[inline]
    pub fn type_index(&self, id: Id) -> Option<usize> {
        self.type_ids.binary_search(&id).ok()
    }

    /// Whether the type contains `id` (wildcards allowed).
    pub fn has_id(&self, id: Id) -> bool {
        if id.is_wildcard() {
            self.record(id).is_some()
        } else {
            self.type_index(id).is_some()
        }
    }

    /// Record registered for `id`. Wildcard patterns have their own record.
    pub fn record(&self, id: Id) -> Option<&TableRecord> {
        let key = wildcard_record_key(id);
        self.records
            .binary_search_by_key(&key, |r| r.id)
            .ok()
            .map(|i| &self.records[i])
    }

    /// Data column index for an exact id.
    #[inline]
    pub fn column_index(&self, id: Id) -> Option<usize> {
        let index = self.type_index(id)?;
        self.column_map[index].map(usize::from)
    }

    /// Data column index for a type index.
    #[inline]
    pub fn column_of_type_index(&self, index: usize) -> Option<usize> {
        self.column_map.get(index).copied().flatten().map(usize::from)
    }

    /// Type info of a data column.
    pub fn column_type_info(&self, column: usize) -> Option<&Arc<TypeInfo>> {
        self.columns.get(column).map(|c| &c.type_info)
    }

    /// Ids of the data columns, in column order.
    pub fn column_ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.columns.iter().map(|c| c.id)
    }

    /// Bit column for a toggleable id.
    pub fn bitset(&self, id: Id) -> Option<&BitColumn> {
        self.bitsets.iter().find(|(i, _)| *i == id).map(|(_, b)| b)
    }

    pub(crate) fn bitset_mut(&mut self, id: Id) -> Option<&mut BitColumn> {
        self.bitsets.iter_mut().find(|(i, _)| *i == id).map(|(_, b)| b)
    }

    /// Whether structural changes to this table are currently refused.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock > 0
    }

    // -- typed access -------------------------------------------------------

    /// Typed view of a data column.
    ///
    /// Returns `None` if `column` is out of range or does not store `T`.
    pub fn column<T: 'static>(&self, column: usize) -> Option<&[T]> {
        let col = self.columns.get(column)?;
        if !col.type_info.is::<T>() {
            return None;
        }
        // SAFETY: the TypeId check above guarantees the column stores T.
        Some(unsafe { col.data.as_slice::<T>() })
    }

    /// Mutable typed view of a data column.
    pub fn column_mut<T: 'static>(&mut self, column: usize) -> Option<&mut [T]> {
        let col = self.columns.get_mut(column)?;
        if !col.type_info.is::<T>() {
            return None;
        }
        // SAFETY: the TypeId check above guarantees the column stores T.
        Some(unsafe { col.data.as_slice_mut::<T>() })
    }

    /// Two distinct data columns borrowed mutably at once.
    pub fn column_pair_mut<A: 'static, B: 'static>(
        &mut self,
        a: usize,
        b: usize,
    ) -> Option<(&mut [A], &mut [B])> {
        if a == b || a.max(b) >= self.columns.len() {
            return None;
        }
        let (low, high) = self.columns.split_at_mut(a.max(b));
        let (col_a, col_b) = if a < b {
            (&mut low[a], &mut high[0])
        } else {
            (&mut high[0], &mut low[b])
        };
        if !col_a.type_info.is::<A>() || !col_b.type_info.is::<B>() {
            return None;
        }
        // SAFETY: both TypeIds were checked and the columns are disjoint.
        Some(unsafe { (col_a.data.as_slice_mut::<A>(), col_b.data.as_slice_mut::<B>()) })
    }

    /// Typed reference to the value of `id` at `row`.
    pub fn get<T: 'static>(&self, row: usize, id: Id) -> Option<&T> {
        self.column::<T>(self.column_index(id)?)?.get(row)
    }

    /// Mutable typed reference to the value of `id` at `row`.
    pub fn get_mut<T: 'static>(&mut self, row: usize, id: Id) -> Option<&mut T> {
        let column = self.column_index(id)?;
        self.column_mut::<T>(column)?.get_mut(row)
    }

    /// Raw bytes of the value of `id` at `row`.
    pub fn get_bytes(&self, row: usize, id: Id) -> Option<&[u8]> {
        let col = &self.columns[self.column_index(id)?];
        let size = col.data.item_size();
        col.data.as_bytes()?.get(row * size..(row + 1) * size)
    }

    // -- row operations -----------------------------------------------------

    /// Append a row for `entity`, default-constructing every column.
    pub fn append(&mut self, entity: EntityId) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        for col in &mut self.columns {
            col.data.push_default();
        }
        for (_, bits) in &mut self.bitsets {
            bits.push(true);
        }
        self.check_invariants();
        row
    }

    /// Delete the row, dropping its values, and swap the last row into it.
    ///
    /// Returns the entity that was moved into `row`, if any.
    pub fn delete(&mut self, row: usize) -> Option<EntityId> {
        let last = self.entities.len() - 1;
        self.entities.swap_remove(row);
        for col in &mut self.columns {
            col.data.swap_remove(row);
        }
        for (_, bits) in &mut self.bitsets {
            bits.swap_remove(row);
        }
        self.check_invariants();
        (row < last).then(|| self.entities[row])
    }

    /// Move the row at `src_row` into `dst`.
    ///
    /// Columns shared by both tables are moved, columns only in `dst` are
    /// default-constructed and columns only in `self` are dropped. Returns the
    /// new row in `dst` and the entity swapped into `src_row`, if any.
    pub fn move_row(&mut self, src_row: usize, dst: &mut Table) -> (usize, Option<EntityId>) {
        let entity = self.entities[src_row];
        let dst_row = dst.entities.len();
        dst.entities.push(entity);

        let mut src_cols = self.columns.iter_mut().peekable();
        for dst_col in &mut dst.columns {
            while src_cols.peek().is_some_and(|c| c.id < dst_col.id) {
                if let Some(src_col) = src_cols.next() {
                    src_col.data.swap_remove(src_row);
                }
            }
            match src_cols.peek_mut() {
                Some(src_col) if src_col.id == dst_col.id => {
                    src_col.data.move_to(src_row, &mut dst_col.data);
                    src_cols.next();
                }
                _ => dst_col.data.push_default(),
            }
        }
        for src_col in src_cols {
            src_col.data.swap_remove(src_row);
        }

        for (id, dst_bits) in &mut dst.bitsets {
            let value = self
                .bitsets
                .iter()
                .find(|(i, _)| i == id)
                .map_or(true, |(_, b)| b.get(src_row));
            dst_bits.push(value);
        }
        for (_, src_bits) in &mut self.bitsets {
            src_bits.swap_remove(src_row);
        }

        let last = self.entities.len() - 1;
        self.entities.swap_remove(src_row);
        self.check_invariants();
        dst.check_invariants();
        (dst_row, (src_row < last).then(|| self.entities[src_row]))
    }

    /// Move every row of `self` to the end of `dst`. Returns the first row of
    /// the absorbed range in `dst`.
    pub fn merge_into(&mut self, dst: &mut Table) -> usize {
        let start = dst.entities.len();
        let count = self.entities.len();
        dst.entities.append(&mut self.entities);

        let mut src_cols = self.columns.iter_mut().peekable();
        for dst_col in &mut dst.columns {
            while src_cols.peek().is_some_and(|c| c.id < dst_col.id) {
                if let Some(src_col) = src_cols.next() {
                    src_col.data.clear();
                }
            }
            match src_cols.peek_mut() {
                Some(src_col) if src_col.id == dst_col.id => {
                    dst_col.data.append(&mut src_col.data);
                    src_cols.next();
                }
                _ => dst_col.data.extend_default(count),
            }
        }
        for src_col in src_cols {
            src_col.data.clear();
        }

        for (id, dst_bits) in &mut dst.bitsets {
            match self.bitsets.iter_mut().find(|(i, _)| i == id) {
                Some((_, src_bits)) => dst_bits.append(src_bits),
                None => (0..count).for_each(|_| dst_bits.push(true)),
            }
        }
        for (_, src_bits) in &mut self.bitsets {
            src_bits.clear();
        }
        self.check_invariants();
        dst.check_invariants();
        start
    }

    /// Drop every row.
    pub fn clear(&mut self) {
        self.entities.clear();
        for col in &mut self.columns {
            col.data.clear();
        }
        for (_, bits) in &mut self.bitsets {
            bits.clear();
        }
    }

    #[inline]
    fn check_invariants(&self) {
        debug_assert!(self.columns.iter().all(|c| c.data.len() == self.entities.len()));
        debug_assert!(self.bitsets.iter().all(|(_, b)| b.len() == self.entities.len()));
    }

    /// Column data for the serialization boundary.
    pub fn export(&self) -> TableExport<'_> {
        TableExport {
            type_ids: &self.type_ids,
            count: self.entities.len(),
            entities: &self.entities,
            columns: self
                .columns
                .iter()
                .map(|c| ColumnExport {
                    id: c.id,
                    size: c.data.item_size(),
                    bytes: c.data.as_bytes(),
                })
                .collect(),
        }
    }
}

/// Key under which a table record for `id` is registered. `_` shares the
/// records of `*`.
pub(crate) fn wildcard_record_key(id: Id) -> Id {
    use crate::id::builtin::{ANY_INDEX, WILDCARD_INDEX};
    if !id.is_pair() {
        if id.first() == ANY_INDEX {
            return Id::from_index(WILDCARD_INDEX);
        }
        return id;
    }
    let first = if id.first() == ANY_INDEX { WILDCARD_INDEX } else { id.first() };
    let second = if id.second() == ANY_INDEX { WILDCARD_INDEX } else { id.second() };
    Id::pair_index(first, second)
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// One data column. `bytes` is only present for byte-only components.
#[derive(Debug, Clone, Copy)]
pub struct ColumnExport<'a> {
    pub id: Id,
    pub size: usize,
    pub bytes: Option<&'a [u8]>,
}

/// `{type, row count, column data}` of one table.
#[derive(Debug, Clone)]
pub struct TableExport<'a> {
    pub type_ids: &'a [Id],
    pub count: usize,
    pub entities: &'a [EntityId],
    pub columns: Vec<ColumnExport<'a>>,
}

// ---------------------------------------------------------------------------
// TableStore
// ---------------------------------------------------------------------------

/// Owns every table, indexed by [`TableId`], plus the type hash index.
#[derive(Debug, Default)]
pub(crate) struct TableStore {
    tables: Vec<Option<Table>>,
    by_hash: IdMap<u64, Vec<TableId>>,
    live: usize,
}

impl TableStore {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            tables: Vec::with_capacity(capacity),
            by_hash: IdMap::default(),
            live: 0,
        }
    }

    #[inline]
    pub(crate) fn next_id(&self) -> TableId {
        TableId(self.tables.len() as u32)
    }

    pub(crate) fn insert(&mut self, table: Table) -> TableId {
        let id = table.id;
        debug_assert_eq!(id, self.next_id());
        self.by_hash.entry(table.hash).or_default().push(id);
        self.tables.push(Some(table));
        self.live += 1;
        id
    }

    pub(crate) fn remove(&mut self, id: TableId) -> Option<Table> {
        let table = self.tables.get_mut(id.index())?.take()?;
        if let Some(bucket) = self.by_hash.get_mut(&table.hash) {
            bucket.retain(|t| *t != id);
            if bucket.is_empty() {
                self.by_hash.remove(&table.hash);
            }
        }
        self.live -= 1;
        Some(table)
    }

    /// Table with exactly this (sorted) type.
    pub(crate) fn find(&self, type_ids: &[Id]) -> Option<TableId> {
        let bucket = self.by_hash.get(&hash_type(type_ids))?;
        bucket
            .iter()
            .copied()
            .find(|t| self.get(*t).is_some_and(|table| table.type_ids == type_ids))
    }

    #[inline]
    pub(crate) fn get(&self, id: TableId) -> Option<&Table> {
        self.tables.get(id.index())?.as_ref()
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: TableId) -> Option<&mut Table> {
        self.tables.get_mut(id.index())?.as_mut()
    }

    /// Two distinct tables, mutably.
    pub(crate) fn pair_mut(&mut self, a: TableId, b: TableId) -> Option<(&mut Table, &mut Table)> {
        if a == b {
            return None;
        }
        let (lo, hi, swapped) = if a < b { (a, b, false) } else { (b, a, true) };
        let (left, right) = self.tables.split_at_mut(hi.index());
        let lo_table = left.get_mut(lo.index())?.as_mut()?;
        let hi_table = right.first_mut()?.as_mut()?;
        Some(if swapped { (hi_table, lo_table) } else { (lo_table, hi_table) })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter_map(Option::as_ref)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.live
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
