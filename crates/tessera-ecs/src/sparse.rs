//! Keyed auxiliary storage for `Sparse` and `DontFragment` ids.
//!
//! A [`SparseStore`] is a sparse set: entity index -> dense slot, with the
//! payload (if the id carries data) in a [`Column`] parallel to the dense
//! entity array. Removing an entry swaps the last one into its slot.

use crate::column::Column;
use crate::component::ComponentVtable;
use crate::entity::EntityId;
use crate::hash::IdMap;

#[derive(Debug, Default)]
pub struct SparseStore {
    dense: Vec<EntityId>,
    sparse: IdMap<u32, u32>,
    data: Option<Column>,
}

impl SparseStore {
    /// Store for a tag (no payload).
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose entries carry a value of the given layout.
    pub fn with_data(vtable: ComponentVtable) -> Self {
        Self {
            dense: Vec::new(),
            sparse: IdMap::default(),
            data: Some(Column::new(vtable)),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dense.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    #[inline]
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Every entity in the store, in dense order.
    #[inline]
    pub fn entities(&self) -> &[EntityId] {
        &self.dense
    }

    /// Whether `entity` (exact generation) has an entry.
    pub fn contains(&self, entity: EntityId) -> bool {
        self.slot(entity).is_some()
    }

    #[inline]
    fn slot(&self, entity: EntityId) -> Option<usize> {
        let slot = *self.sparse.get(&entity.index())? as usize;
        (self.dense[slot] == entity).then_some(slot)
    }

    /// Insert an entry for `entity`, default-constructing its value.
    ///
    /// Returns `false` if the entity already had one.
    pub fn insert(&mut self, entity: EntityId) -> bool {
        if self.contains(entity) {
            return false;
        }
        let slot = self.dense.len() as u32;
        self.dense.push(entity);
        self.sparse.insert(entity.index(), slot);
        if let Some(data) = &mut self.data {
            data.push_default();
        }
        true
    }

    /// Remove the entry of `entity`, dropping its value.
    pub fn remove(&mut self, entity: EntityId) -> bool {
        let Some(slot) = self.slot(entity) else {
            return false;
        };
        self.sparse.remove(&entity.index());
        self.dense.swap_remove(slot);
        if let Some(moved) = self.dense.get(slot) {
            self.sparse.insert(moved.index(), slot as u32);
        }
        if let Some(data) = &mut self.data {
            data.swap_remove(slot);
        }
        true
    }

    /// Pointer to the value of `entity`.
    pub fn get_ptr(&self, entity: EntityId) -> Option<*const u8> {
        let slot = self.slot(entity)?;
        let data = self.data.as_ref()?;
        // SAFETY: slot < dense.len() == data.len().
        Some(unsafe { data.get_raw(slot) })
    }

    /// Mutable pointer to the value of `entity`.
    pub fn get_ptr_mut(&mut self, entity: EntityId) -> Option<*mut u8> {
        let slot = self.slot(entity)?;
        let data = self.data.as_mut()?;
        // SAFETY: slot < dense.len() == data.len().
        Some(unsafe { data.get_raw_mut(slot) })
    }

    /// Typed view of the value of `entity`.
    ///
    /// # Safety
    ///
    /// `T` must be the type the store was created for.
    pub unsafe fn get<T>(&self, entity: EntityId) -> Option<&T> {
        self.get_ptr(entity).map(|p| &*(p as *const T))
    }

    /// Mutable typed view of the value of `entity`.
    ///
    /// # Safety
    ///
    /// `T` must be the type the store was created for.
    pub unsafe fn get_mut<T>(&mut self, entity: EntityId) -> Option<&mut T> {
        self.get_ptr_mut(entity).map(|p| &mut *(p as *mut T))
    }

    /// Overwrite the value of `entity`, moving `value_ptr` in.
    ///
    /// # Safety
    ///
    /// `value_ptr` must point to a valid value of the stored type.
    pub unsafe fn replace_raw(&mut self, entity: EntityId, value_ptr: *const u8) -> bool {
        let (Some(slot), Some(data)) = (self.slot(entity), self.data.as_mut()) else {
            return false;
        };
        data.replace_raw(slot, value_ptr);
        true
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.dense.clear();
        self.sparse.clear();
        if let Some(data) = &mut self.data {
            data.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(index: u32) -> EntityId {
        EntityId::new(index, 0)
    }

    #[test]
    fn insert_remove_tag_store() {
        let mut store = SparseStore::new();
        assert!(store.insert(e(5)));
        assert!(!store.insert(e(5)));
        assert!(store.insert(e(9)));
        assert!(store.contains(e(5)));
        assert!(!store.contains(EntityId::new(5, 1)));
        assert!(store.remove(e(5)));
        assert!(!store.remove(e(5)));
        assert_eq!(store.entities(), &[e(9)]);
    }

    #[test]
    fn data_survives_swap_remove() {
        let mut store = SparseStore::with_data(ComponentVtable::new::<String>());
        store.insert(e(1));
        store.insert(e(2));
        store.insert(e(3));
        unsafe {
            *store.get_mut::<String>(e(3)).unwrap() = "three".to_owned();
        }
        store.remove(e(1));
        assert_eq!(unsafe { store.get::<String>(e(3)) }.map(String::as_str), Some("three"));
        assert_eq!(unsafe { store.get::<String>(e(2)) }.map(String::as_str), Some(""));
        assert_eq!(store.len(), 2);
    }
}
