//! Type-erased column storage.
//!
//! A [`Column`] is a densely packed array of values of one component type,
//! stored as a manually managed byte buffer whose layout matches the type. A
//! [`BitColumn`] stores one boolean per row for toggleable components.
//!
//! # Safety
//!
//! Columns only know sizes and vtables. The table and world code guarantee
//! that typed access uses the Rust type the column was created for.

use std::alloc::{self, Layout};
use std::ptr;

use crate::component::ComponentVtable;

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// A type-erased, densely packed array of component values of a single type.
pub struct Column {
    /// Pointer to the heap allocation (null when nothing is allocated).
    data: *mut u8,
    /// Number of live elements.
    len: usize,
    /// Number of elements that fit in the current allocation.
    capacity: usize,
    vtable: ComponentVtable,
}

// Column only stores raw bytes; registration requires component types to be
// Send + Sync.
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    /// Create a new, empty column.
    pub fn new(vtable: ComponentVtable) -> Self {
        Self {
            data: ptr::null_mut(),
            len: 0,
            capacity: 0,
            vtable,
        }
    }

    /// Number of stored elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the column is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn item_size(&self) -> usize {
        self.vtable.size
    }

    #[inline]
    pub(crate) fn vtable(&self) -> &ComponentVtable {
        &self.vtable
    }

    // -- internal helpers ---------------------------------------------------

    fn layout_for_capacity(&self, cap: usize) -> Option<Layout> {
        if self.vtable.size == 0 || cap == 0 {
            return None;
        }
        let size = self.vtable.size.checked_mul(cap)?;
        Layout::from_size_align(size, self.vtable.align).ok()
    }

    /// Grow so that at least `additional` more elements fit.
    pub fn reserve(&mut self, additional: usize) {
        let required = self.len + additional;
        if required <= self.capacity {
            return;
        }
        let mut new_cap = if self.capacity == 0 { 4 } else { self.capacity * 2 };
        while new_cap < required {
            new_cap *= 2;
        }
        if self.vtable.size == 0 {
            self.capacity = new_cap;
            return;
        }
        let Some(new_layout) = self.layout_for_capacity(new_cap) else {
            crate::ecs_internal!("column layout overflow for {new_cap} elements");
        };
        unsafe {
            let new_data = match self.layout_for_capacity(self.capacity) {
                Some(old_layout) if !self.data.is_null() => {
                    alloc::realloc(self.data, old_layout, new_layout.size())
                }
                _ => alloc::alloc(new_layout),
            };
            if new_data.is_null() {
                alloc::handle_alloc_error(new_layout);
            }
            self.data = new_data;
        }
        self.capacity = new_cap;
    }

    #[inline]
    fn ptr_at(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.capacity || self.vtable.size == 0);
        if self.vtable.size == 0 {
            // ZST -- dangling but aligned.
            return self.vtable.align as *mut u8;
        }
        unsafe { self.data.add(index * self.vtable.size) }
    }

    // -- element access -----------------------------------------------------

    /// Raw pointer to the element at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be less than `self.len()`.
    #[inline]
    pub unsafe fn get_raw(&self, index: usize) -> *const u8 {
        debug_assert!(index < self.len);
        self.ptr_at(index)
    }

    /// Mutable raw pointer to the element at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be less than `self.len()`.
    #[inline]
    pub unsafe fn get_raw_mut(&mut self, index: usize) -> *mut u8 {
        debug_assert!(index < self.len);
        self.ptr_at(index)
    }

    /// Typed view of the whole column.
    ///
    /// # Safety
    ///
    /// `T` must be the type this column stores.
    pub unsafe fn as_slice<T>(&self) -> &[T] {
        if self.len == 0 || self.vtable.size == 0 {
            return std::slice::from_raw_parts(ptr::NonNull::<T>::dangling().as_ptr(), self.len);
        }
        std::slice::from_raw_parts(self.data as *const T, self.len)
    }

    /// Mutable typed view of the whole column.
    ///
    /// # Safety
    ///
    /// `T` must be the type this column stores.
    pub unsafe fn as_slice_mut<T>(&mut self) -> &mut [T] {
        if self.len == 0 || self.vtable.size == 0 {
            return std::slice::from_raw_parts_mut(ptr::NonNull::<T>::dangling().as_ptr(), self.len);
        }
        std::slice::from_raw_parts_mut(self.data as *mut T, self.len)
    }

    /// The raw bytes of every element, in row order.
    ///
    /// `None` for typed columns: Rust values may hold uninitialized padding.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        if !self.vtable.pod {
            return None;
        }
        if self.len == 0 || self.vtable.size == 0 {
            return Some(&[]);
        }
        // SAFETY: byte-only values are fully initialized by the zero ctor or a copy.
        Some(unsafe { std::slice::from_raw_parts(self.data, self.len * self.vtable.size) })
    }

    // -- growth -------------------------------------------------------------

    /// Append a default-constructed value.
    pub fn push_default(&mut self) {
        self.reserve(1);
        let dst = self.ptr_at(self.len);
        unsafe { (self.vtable.ctor)(dst, self.vtable.size) };
        self.len += 1;
    }

    /// Append `count` default-constructed values.
    pub fn extend_default(&mut self, count: usize) {
        self.reserve(count);
        for _ in 0..count {
            let dst = self.ptr_at(self.len);
            unsafe { (self.vtable.ctor)(dst, self.vtable.size) };
            self.len += 1;
        }
    }

    /// Push a value onto the end of the column, taking ownership of it.
    ///
    /// # Safety
    ///
    /// `value_ptr` must point to a valid, initialised instance of the stored
    /// type. The caller must not drop the source afterwards.
    pub unsafe fn push_raw(&mut self, value_ptr: *const u8) {
        self.reserve(1);
        if self.vtable.size > 0 {
            ptr::copy_nonoverlapping(value_ptr, self.ptr_at(self.len), self.vtable.size);
        }
        self.len += 1;
    }

    /// Push a clone of the value at `src`.
    ///
    /// # Safety
    ///
    /// `src` must point to a valid instance of the stored type.
    pub unsafe fn push_clone(&mut self, src: *const u8) {
        self.reserve(1);
        (self.vtable.clone_fn)(src, self.ptr_at(self.len), self.vtable.size);
        self.len += 1;
    }

    /// Overwrite the value at `index`, dropping the previous one.
    ///
    /// # Safety
    ///
    /// `index < len`, and `value_ptr` must point to a valid instance of the
    /// stored type whose ownership moves into the column.
    pub unsafe fn replace_raw(&mut self, index: usize, value_ptr: *const u8) {
        debug_assert!(index < self.len);
        let dst = self.ptr_at(index);
        if let Some(drop_fn) = self.vtable.drop_fn {
            drop_fn(dst);
        }
        if self.vtable.size > 0 {
            ptr::copy_nonoverlapping(value_ptr, dst, self.vtable.size);
        }
    }

    /// Overwrite the value at `index` with a clone of `src`.
    ///
    /// # Safety
    ///
    /// As for [`replace_raw`](Self::replace_raw), except `src` is borrowed.
    pub unsafe fn replace_clone(&mut self, index: usize, src: *const u8) {
        debug_assert!(index < self.len);
        let dst = self.ptr_at(index);
        if let Some(drop_fn) = self.vtable.drop_fn {
            drop_fn(dst);
        }
        (self.vtable.clone_fn)(src, dst, self.vtable.size);
    }

    // -- removal ------------------------------------------------------------

    /// Move the last element into the gap at `index`. The value at `index`
    /// must already be dropped or moved out.
    unsafe fn fill_gap(&mut self, index: usize) {
        let last = self.len - 1;
        if self.vtable.size > 0 && index != last {
            ptr::copy_nonoverlapping(self.ptr_at(last), self.ptr_at(index), self.vtable.size);
        }
        self.len -= 1;
    }

    /// Swap-remove the element at `index`, dropping it.
    pub fn swap_remove(&mut self, index: usize) {
        assert!(index < self.len, "column index {index} out of bounds ({})", self.len);
        unsafe {
            if let Some(drop_fn) = self.vtable.drop_fn {
                drop_fn(self.ptr_at(index));
            }
            self.fill_gap(index);
        }
    }

    /// Move the element at `index` to the end of `dst` and swap-remove it
    /// from `self` without dropping.
    pub fn move_to(&mut self, index: usize, dst: &mut Column) {
        assert!(index < self.len, "column index {index} out of bounds ({})", self.len);
        debug_assert_eq!(self.vtable.size, dst.vtable.size);
        unsafe {
            dst.push_raw(self.ptr_at(index));
            self.fill_gap(index);
        }
    }

    /// Move every element of `src` to the end of `self`, leaving `src` empty.
    pub fn append(&mut self, src: &mut Column) {
        debug_assert_eq!(self.vtable.size, src.vtable.size);
        if src.len == 0 {
            return;
        }
        self.reserve(src.len);
        if self.vtable.size > 0 {
            unsafe {
                ptr::copy_nonoverlapping(src.data, self.ptr_at(self.len), src.len * self.vtable.size);
            }
        }
        self.len += src.len;
        src.len = 0;
    }

    /// Drop every element, keeping the allocation.
    pub fn clear(&mut self) {
        if let Some(drop_fn) = self.vtable.drop_fn {
            for i in 0..self.len {
                unsafe { drop_fn(self.ptr_at(i)) };
            }
        }
        self.len = 0;
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        self.clear();
        if let Some(layout) = self.layout_for_capacity(self.capacity) {
            if !self.data.is_null() {
                unsafe { alloc::dealloc(self.data, layout) };
            }
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("vtable", &self.vtable)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BitColumn
// ---------------------------------------------------------------------------

/// One bit per row. Used for enable/disable state of toggleable components.
#[derive(Debug, Clone, Default)]
pub struct BitColumn {
    words: Vec<u64>,
    len: usize,
}

impl BitColumn {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        debug_assert!(index < self.len);
        let word = &mut self.words[index / 64];
        if value {
            *word |= 1 << (index % 64);
        } else {
            *word &= !(1 << (index % 64));
        }
    }

    pub fn push(&mut self, value: bool) {
        if self.len % 64 == 0 {
            self.words.push(0);
        }
        self.len += 1;
        self.set(self.len - 1, value);
    }

    /// Swap-remove the bit at `index`, returning its value.
    pub fn swap_remove(&mut self, index: usize) -> bool {
        assert!(index < self.len, "bit index {index} out of bounds ({})", self.len);
        let value = self.get(index);
        let last = self.len - 1;
        if index != last {
            let moved = self.get(last);
            self.set(index, moved);
        }
        self.set(last, false);
        self.len -= 1;
        if self.len % 64 == 0 {
            self.words.pop();
        }
        value
    }

    pub fn append(&mut self, src: &mut BitColumn) {
        for i in 0..src.len {
            self.push(src.get(i));
        }
        src.clear();
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.len = 0;
    }

    /// Length of the run of rows starting at `start` (bounded by `end`) that
    /// all have the same value as `start`.
    pub fn run_len(&self, start: usize, end: usize) -> usize {
        let value = self.get(start);
        let mut i = start + 1;
        while i < end && self.get(i) == value {
            i += 1;
        }
        i - start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Name(String);

    fn string_column() -> Column {
        Column::new(ComponentVtable::new::<Name>())
    }

    fn push(col: &mut Column, s: &str) {
        let value = std::mem::ManuallyDrop::new(Name(s.to_owned()));
        unsafe { col.push_raw(&*value as *const Name as *const u8) };
    }

    fn names(col: &Column) -> Vec<String> {
        unsafe { col.as_slice::<Name>() }.iter().map(|n| n.0.clone()).collect()
    }

    #[test]
    fn push_and_swap_remove() {
        let mut col = string_column();
        push(&mut col, "a");
        push(&mut col, "b");
        push(&mut col, "c");
        col.swap_remove(0);
        assert_eq!(names(&col), vec!["c", "b"]);
        col.swap_remove(1);
        assert_eq!(names(&col), vec!["c"]);
    }

    #[test]
    fn move_between_columns() {
        let mut src = string_column();
        let mut dst = string_column();
        push(&mut src, "a");
        push(&mut src, "b");
        src.move_to(0, &mut dst);
        assert_eq!(names(&src), vec!["b"]);
        assert_eq!(names(&dst), vec!["a"]);
    }

    #[test]
    fn append_empties_source() {
        let mut src = string_column();
        let mut dst = string_column();
        for s in ["a", "b", "c", "d", "e"] {
            push(&mut src, s);
        }
        push(&mut dst, "z");
        dst.append(&mut src);
        assert!(src.is_empty());
        assert_eq!(names(&dst), vec!["z", "a", "b", "c", "d", "e"]);
    }

    #[test]
    fn push_default_and_growth() {
        let mut col = Column::new(ComponentVtable::new::<u64>());
        col.extend_default(100);
        assert_eq!(col.len(), 100);
        assert!(unsafe { col.as_slice::<u64>() }.iter().all(|v| *v == 0));
        assert!(col.as_bytes().is_none());
    }

    #[test]
    fn byte_column_exposes_raw_bytes() {
        let mut col = Column::new(ComponentVtable::bytes(8, 8));
        col.extend_default(100);
        let bytes = col.as_bytes().unwrap();
        assert_eq!(bytes.len(), 800);
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn zero_sized_column() {
        let mut col = Column::new(ComponentVtable::new::<()>());
        col.push_default();
        col.push_default();
        assert_eq!(col.len(), 2);
        col.swap_remove(0);
        assert_eq!(col.len(), 1);
        assert!(col.as_bytes().is_none());
    }

    #[test]
    fn bit_column_swap_remove() {
        let mut bits = BitColumn::new();
        for i in 0..70 {
            bits.push(i % 3 == 0);
        }
        assert!(bits.get(69));
        let removed = bits.swap_remove(1);
        assert!(!removed);
        // Row 69 (true) moved into slot 1.
        assert!(bits.get(1));
        assert_eq!(bits.len(), 69);
    }

    #[test]
    fn bit_column_runs() {
        let mut bits = BitColumn::new();
        for v in [true, true, false, false, false, true] {
            bits.push(v);
        }
        assert_eq!(bits.run_len(0, 6), 2);
        assert_eq!(bits.run_len(2, 6), 3);
        assert_eq!(bits.run_len(2, 4), 2);
        assert_eq!(bits.run_len(5, 6), 1);
    }
}
