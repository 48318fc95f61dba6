//! Entity identifiers and the entity index.
//!
//! An [`EntityId`] is a 64-bit handle that packs a *generation* counter in the
//! high 32 bits and an *index* in the low 32 bits. The generation is bumped
//! every time an index is recycled, which allows immediate stale-ID detection.
//!
//! The [`EntityIndex`] maps live ids to their location [`Record`]. Records live
//! in fixed-size pages addressed by the id's index, so a record never moves
//! while its entity is alive, no matter how many entities are created after it.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::table::TableId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A generational entity identifier.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// The null entity. Never alive.
    pub const NULL: EntityId = EntityId(0);

    /// Construct an `EntityId` from an index and generation.
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw `u64` representation.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Whether this is the null entity.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Status bits stored next to an entity's location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowFlags(u32);

impl RowFlags {
    /// Entity carries at least one non-fragmenting id.
    pub const HAS_DONT_FRAGMENT: RowFlags = RowFlags(1 << 0);
    /// Entity is the target of a traversable relationship.
    pub const IS_TRAVERSABLE: RowFlags = RowFlags(1 << 1);
    /// Entity is used as (part of) an id somewhere in the store.
    pub const IS_ID: RowFlags = RowFlags(1 << 2);

    /// No flags.
    pub const fn empty() -> Self {
        RowFlags(0)
    }

    /// Whether all bits of `other` are set.
    #[inline]
    pub const fn contains(self, other: RowFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: RowFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: RowFlags) {
        self.0 &= !other.0;
    }
}

/// Where an entity lives: which table and which row within that table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Record {
    /// Owning table. `None` until the entity is first placed.
    pub table: Option<TableId>,
    /// Row within the table.
    pub row: u32,
    /// Status bits.
    pub flags: RowFlags,
}

// ---------------------------------------------------------------------------
// EntityIndex
// ---------------------------------------------------------------------------

const PAGE_BITS: u32 = 10;
const PAGE_SIZE: usize = 1 << PAGE_BITS;
const PAGE_MASK: u32 = (PAGE_SIZE as u32) - 1;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    record: Record,
    /// Position in `EntityIndex::dense`. Zero if the index was never used.
    dense: u32,
}

type Page = Box<[Slot]>;

/// Sparse map from [`EntityId`] to [`Record`] with id recycling.
///
/// Ids are kept in a dense array partitioned into an alive prefix and a
/// recyclable suffix. Deleting an entity swaps it to the suffix and bumps its
/// generation, so the next [`new_id`](Self::new_id) hands it back out with the
/// new generation.
#[derive(Debug)]
pub struct EntityIndex {
    pages: Vec<Option<Page>>,
    /// `dense[0]` is unused; `dense[1..alive_end]` are alive.
    dense: Vec<EntityId>,
    alive_end: usize,
    max_index: u32,
}

impl EntityIndex {
    /// Create an empty index. Fresh indices start at `first_index`.
    pub fn new(first_index: u32) -> Self {
        Self {
            pages: Vec::new(),
            dense: vec![EntityId::NULL],
            alive_end: 1,
            max_index: first_index.saturating_sub(1),
        }
    }

    /// Create an index with room for `capacity` entities.
    pub fn with_capacity(first_index: u32, capacity: usize) -> Self {
        let mut index = Self::new(first_index);
        index.dense.reserve(capacity);
        index.pages.reserve(capacity / PAGE_SIZE + 1);
        index
    }

    // -- internal helpers ---------------------------------------------------

    #[inline]
    fn slot(&self, index: u32) -> Option<&Slot> {
        let page = self.pages.get((index >> PAGE_BITS) as usize)?.as_ref()?;
        Some(&page[(index & PAGE_MASK) as usize])
    }

    #[inline]
    fn slot_mut(&mut self, index: u32) -> Option<&mut Slot> {
        let page = self.pages.get_mut((index >> PAGE_BITS) as usize)?.as_mut()?;
        Some(&mut page[(index & PAGE_MASK) as usize])
    }

    fn ensure_slot(&mut self, index: u32) -> &mut Slot {
        let page_index = (index >> PAGE_BITS) as usize;
        if page_index >= self.pages.len() {
            self.pages.resize_with(page_index + 1, || None);
        }
        let page = self.pages[page_index]
            .get_or_insert_with(|| vec![Slot::default(); PAGE_SIZE].into_boxed_slice());
        &mut page[(index & PAGE_MASK) as usize]
    }

    /// Swap two dense positions and fix the slots pointing at them.
    fn swap_dense(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.dense.swap(a, b);
        let ia = self.dense[a].index();
        let ib = self.dense[b].index();
        if let Some(slot) = self.slot_mut(ia) {
            slot.dense = a as u32;
        }
        if let Some(slot) = self.slot_mut(ib) {
            slot.dense = b as u32;
        }
    }

    #[inline]
    fn alive_dense(&self, index: u32) -> Option<usize> {
        let slot = self.slot(index)?;
        let dense = slot.dense as usize;
        if dense == 0 || dense >= self.alive_end {
            return None;
        }
        Some(dense)
    }

    // -- public API ---------------------------------------------------------

    /// Allocate a fresh id, recycling a deleted index when one is available.
    pub fn new_id(&mut self) -> EntityId {
        if self.alive_end < self.dense.len() {
            let id = self.dense[self.alive_end];
            self.alive_end += 1;
            if let Some(slot) = self.slot_mut(id.index()) {
                slot.record = Record::default();
            }
            return id;
        }

        // Skip indices that were claimed through `ensure`.
        loop {
            self.max_index += 1;
            if self.slot(self.max_index).map_or(true, |s| s.dense == 0) {
                break;
            }
        }
        let id = EntityId::new(self.max_index, 0);
        let dense = self.dense.len() as u32;
        self.dense.push(id);
        let slot = self.ensure_slot(id.index());
        slot.dense = dense;
        slot.record = Record::default();
        self.swap_dense(dense as usize, self.alive_end);
        self.alive_end += 1;
        id
    }

    /// Make exactly `id` alive, creating its record on first use.
    ///
    /// Fails if a different generation of the same index is alive.
    pub fn ensure(&mut self, id: EntityId) -> Result<&mut Record, EcsError> {
        if id.is_null() {
            return Err(EcsError::InvalidParameter {
                reason: "cannot make the null entity alive".to_owned(),
            });
        }
        let index = id.index();
        if let Some(dense) = self.alive_dense(index) {
            if self.dense[dense] != id {
                return Err(EcsError::InvalidParameter {
                    reason: format!(
                        "cannot make {id} alive: generation {} of index {index} is alive",
                        self.dense[dense].generation()
                    ),
                });
            }
        } else {
            let existing = self.slot(index).map_or(0, |s| s.dense as usize);
            let dense = if existing == 0 {
                let dense = self.dense.len();
                self.dense.push(id);
                self.ensure_slot(index).dense = dense as u32;
                dense
            } else {
                self.dense[existing] = id;
                existing
            };
            self.swap_dense(dense, self.alive_end);
            self.alive_end += 1;
            if let Some(slot) = self.slot_mut(index) {
                slot.record = Record::default();
            }
            self.max_index = self.max_index.max(index);
        }
        match self.slot_mut(index) {
            Some(slot) => Ok(&mut slot.record),
            None => crate::ecs_internal!("entity index slot vanished for {id}"),
        }
    }

    /// Delete an entity. Returns `false` if it was not alive.
    pub fn delete(&mut self, id: EntityId) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        let dense = match self.alive_dense(id.index()) {
            Some(d) => d,
            None => return false,
        };
        let last = self.alive_end - 1;
        self.swap_dense(dense, last);
        self.alive_end -= 1;
        self.dense[last] = EntityId::new(id.index(), id.generation().wrapping_add(1));
        if let Some(slot) = self.slot_mut(id.index()) {
            slot.record = Record::default();
        }
        true
    }

    /// Location record of a live entity.
    #[inline]
    pub fn get(&self, id: EntityId) -> Option<&Record> {
        let dense = self.alive_dense(id.index())?;
        if self.dense[dense] != id {
            return None;
        }
        self.slot(id.index()).map(|s| &s.record)
    }

    /// Mutable location record of a live entity.
    #[inline]
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Record> {
        let dense = self.alive_dense(id.index())?;
        if self.dense[dense] != id {
            return None;
        }
        self.slot_mut(id.index()).map(|s| &mut s.record)
    }

    /// Returns `true` if `id` is alive with a matching generation.
    #[inline]
    pub fn is_alive(&self, id: EntityId) -> bool {
        self.alive_dense(id.index())
            .is_some_and(|dense| self.dense[dense] == id)
    }

    /// The live id for an index, whatever its generation.
    #[inline]
    pub fn get_alive(&self, index: u32) -> Option<EntityId> {
        self.alive_dense(index).map(|dense| self.dense[dense])
    }

    /// Number of alive entities.
    #[inline]
    pub fn alive_count(&self) -> usize {
        self.alive_end - 1
    }

    /// All alive entities, in dense order.
    pub fn iter_alive(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.dense[1..self.alive_end].iter().copied()
    }
}

impl Default for EntityIndex {
    fn default() -> Self {
        Self::new(1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_unique_ids() {
        let mut index = EntityIndex::new(1);
        let ids: Vec<EntityId> = (0..100).map(|_| index.new_id()).collect();
        let mut indices: Vec<u32> = ids.iter().map(|id| id.index()).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 100);
        assert_eq!(index.alive_count(), 100);
    }

    #[test]
    fn fresh_ids_start_at_first_index() {
        let mut index = EntityIndex::new(32);
        assert_eq!(index.new_id().index(), 32);
        assert_eq!(index.new_id().index(), 33);
    }

    #[test]
    fn generation_increments_on_recycle() {
        let mut index = EntityIndex::new(1);
        let e0 = index.new_id();
        assert_eq!(e0.generation(), 0);
        assert!(index.delete(e0));
        let e1 = index.new_id();
        assert_eq!(e1.index(), e0.index());
        assert_eq!(e1.generation(), 1);
    }

    #[test]
    fn stale_id_detection() {
        let mut index = EntityIndex::new(1);
        let e0 = index.new_id();
        assert!(index.is_alive(e0));
        assert!(index.delete(e0));
        assert!(!index.is_alive(e0), "stale ID should not be alive");
        let _e1 = index.new_id();
        assert!(!index.is_alive(e0), "stale ID still not alive after recycle");
        assert!(index.get(e0).is_none());
    }

    #[test]
    fn double_delete_returns_false() {
        let mut index = EntityIndex::new(1);
        let e = index.new_id();
        assert!(index.delete(e));
        assert!(!index.delete(e));
    }

    #[test]
    fn ensure_claims_exact_id_and_new_id_skips_it() {
        let mut index = EntityIndex::new(1);
        let wanted = EntityId::new(3, 7);
        index.ensure(wanted).unwrap();
        assert!(index.is_alive(wanted));
        let ids: Vec<u32> = (0..4).map(|_| index.new_id().index()).collect();
        assert_eq!(ids, vec![4, 5, 6, 7]);
        // Index 1 and 2 were skipped past by max_index but never claimed.
        assert_eq!(index.get_alive(3), Some(wanted));
    }

    #[test]
    fn ensure_rejects_conflicting_generation() {
        let mut index = EntityIndex::new(1);
        let e = index.new_id();
        let other = EntityId::new(e.index(), e.generation() + 1);
        assert!(index.ensure(other).is_err());
        assert!(index.ensure(e).is_ok());
    }

    #[test]
    fn ensure_revives_deleted_index() {
        let mut index = EntityIndex::new(1);
        let e = index.new_id();
        index.delete(e);
        let revived = EntityId::new(e.index(), 5);
        index.ensure(revived).unwrap();
        assert!(index.is_alive(revived));
        assert_eq!(index.alive_count(), 1);
    }

    #[test]
    fn record_address_is_stable_across_growth() {
        let mut index = EntityIndex::new(1);
        let e = index.new_id();
        let before = index.get(e).unwrap() as *const Record;
        for _ in 0..(PAGE_SIZE * 3) {
            index.new_id();
        }
        let after = index.get(e).unwrap() as *const Record;
        assert!(std::ptr::eq(before, after));
    }

    #[test]
    fn alive_count_and_iteration() {
        let mut index = EntityIndex::new(1);
        let e0 = index.new_id();
        let e1 = index.new_id();
        let e2 = index.new_id();
        index.delete(e1);
        assert_eq!(index.alive_count(), 2);
        let mut alive: Vec<EntityId> = index.iter_alive().collect();
        alive.sort();
        assert_eq!(alive, vec![e0, e2]);
    }

    #[test]
    fn entity_id_roundtrip() {
        let id = EntityId::new(42, 7);
        assert_eq!(id.index(), 42);
        assert_eq!(id.generation(), 7);
        assert_eq!(EntityId::from_raw(id.to_raw()), id);
    }
}
