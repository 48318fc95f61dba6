//! Component type metadata, lifecycle vtables and hooks.
//!
//! Every component entity that carries data has a [`TypeInfo`]: its layout,
//! a [`ComponentVtable`] for construct/destruct/copy, and the user-facing
//! [`TypeHooks`] (`on_add`, `on_remove`, `on_set`). Tags have no type info.
//!
//! Moving a value between columns is a bitwise copy followed by forgetting the
//! source, which is exactly a Rust move, so the vtable has no move entry.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::ptr;
use std::sync::Arc;

use crate::entity::EntityId;
use crate::hash::IdMap;
use crate::observer::EventIter;

// ---------------------------------------------------------------------------
// ComponentVtable -- type-erased operations for a component type
// ---------------------------------------------------------------------------

/// Function pointers for type-erased construction, drop and clone of
/// component values.
///
/// Each function receives the element size so that byte-only (dynamic)
/// components can share one implementation.
#[derive(Clone, Copy)]
pub struct ComponentVtable {
    /// Construct a default value into uninitialized memory.
    pub(crate) ctor: unsafe fn(*mut u8, usize),
    /// Drop a single value in place. `None` for types without drop glue.
    pub(crate) drop_fn: Option<unsafe fn(*mut u8)>,
    /// Clone a value from `src` into uninitialized `dst`.
    pub(crate) clone_fn: unsafe fn(*const u8, *mut u8, usize),
    /// Size of the component type.
    pub(crate) size: usize,
    /// Alignment of the component type.
    pub(crate) align: usize,
    /// Values are plain bytes with no padding contract, safe to expose raw.
    pub(crate) pod: bool,
}

impl fmt::Debug for ComponentVtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentVtable")
            .field("size", &self.size)
            .field("align", &self.align)
            .field("needs_drop", &self.drop_fn.is_some())
            .finish()
    }
}

impl ComponentVtable {
    /// Create a vtable for a concrete component type `T`.
    pub fn new<T: Default + Clone + 'static>() -> Self {
        unsafe fn ctor_impl<T: Default>(dst: *mut u8, _size: usize) {
            ptr::write(dst as *mut T, T::default());
        }

        unsafe fn drop_fn_impl<T>(ptr: *mut u8) {
            ptr::drop_in_place(ptr as *mut T);
        }

        unsafe fn clone_fn_impl<T: Clone>(src: *const u8, dst: *mut u8, _size: usize) {
            let value = &*(src as *const T);
            ptr::write(dst as *mut T, value.clone());
        }

        Self {
            ctor: ctor_impl::<T>,
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(drop_fn_impl::<T>)
            } else {
                None
            },
            clone_fn: clone_fn_impl::<T>,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            pod: false,
        }
    }

    /// Vtable for plain bytes: zero-initialized, no drop, bitwise copy.
    pub fn bytes(size: usize, align: usize) -> Self {
        unsafe fn zero_ctor(dst: *mut u8, size: usize) {
            ptr::write_bytes(dst, 0, size);
        }

        unsafe fn copy_clone(src: *const u8, dst: *mut u8, size: usize) {
            ptr::copy_nonoverlapping(src, dst, size);
        }

        Self {
            ctor: zero_ctor,
            drop_fn: None,
            clone_fn: copy_clone,
            size,
            align,
            pod: true,
        }
    }
}

// ---------------------------------------------------------------------------
// TypeHooks
// ---------------------------------------------------------------------------

/// Callback invoked for lifecycle hooks and observers.
pub type HookFn = Arc<dyn Fn(&mut EventIter<'_>) + Send + Sync>;

/// Per-component lifecycle callbacks.
///
/// `on_add` runs after the value was constructed in its new table,
/// `on_remove` runs while the value is still readable, and `on_set` runs
/// after a value was written.
#[derive(Clone, Default)]
pub struct TypeHooks {
    pub on_add: Option<HookFn>,
    pub on_remove: Option<HookFn>,
    pub on_set: Option<HookFn>,
}

impl TypeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(mut self, hook: impl Fn(&mut EventIter<'_>) + Send + Sync + 'static) -> Self {
        self.on_add = Some(Arc::new(hook));
        self
    }

    pub fn on_remove(mut self, hook: impl Fn(&mut EventIter<'_>) + Send + Sync + 'static) -> Self {
        self.on_remove = Some(Arc::new(hook));
        self
    }

    pub fn on_set(mut self, hook: impl Fn(&mut EventIter<'_>) + Send + Sync + 'static) -> Self {
        self.on_set = Some(Arc::new(hook));
        self
    }

    /// Whether any hook is set.
    pub fn is_empty(&self) -> bool {
        self.on_add.is_none() && self.on_remove.is_none() && self.on_set.is_none()
    }
}

impl fmt::Debug for TypeHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeHooks")
            .field("on_add", &self.on_add.is_some())
            .field("on_remove", &self.on_remove.is_some())
            .field("on_set", &self.on_set.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TypeInfo
// ---------------------------------------------------------------------------

/// Metadata about a data-carrying component.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    /// The component entity.
    pub component: EntityId,
    /// Human-readable name (supplied by the caller).
    pub name: String,
    /// `std::mem::size_of::<T>()`
    pub size: usize,
    /// `std::mem::align_of::<T>()`
    pub align: usize,
    /// Rust `TypeId`, `None` for byte-only components.
    pub type_id: Option<TypeId>,
    pub(crate) vtable: ComponentVtable,
    pub(crate) hooks: TypeHooks,
}

impl TypeInfo {
    /// Whether values of this type are plain bytes (no drop, bitwise copy).
    pub fn is_pod(&self) -> bool {
        self.type_id.is_none()
    }

    /// Whether `T` is the Rust type stored under this info.
    #[inline]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == Some(TypeId::of::<T>())
    }

    pub fn hooks(&self) -> &TypeHooks {
        &self.hooks
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to component entities and their metadata.
///
/// A type can only be registered once per world; subsequent registrations of
/// the same Rust `TypeId` return the existing component entity.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    /// TypeId -> component entity for dedup.
    by_type: HashMap<TypeId, EntityId>,
    /// Keyed by component entity index.
    infos: IdMap<u32, Arc<TypeInfo>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The component entity registered for `T`.
    pub fn lookup<T: 'static>(&self) -> Option<EntityId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Type info of a component entity index.
    #[inline]
    pub fn get(&self, index: u32) -> Option<&Arc<TypeInfo>> {
        self.infos.get(&index)
    }

    /// Number of registered data components.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub(crate) fn insert_typed<T: Default + Clone + Send + Sync + 'static>(
        &mut self,
        component: EntityId,
        name: &str,
    ) -> Arc<TypeInfo> {
        let info = Arc::new(TypeInfo {
            component,
            name: name.to_owned(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            type_id: Some(TypeId::of::<T>()),
            vtable: ComponentVtable::new::<T>(),
            hooks: TypeHooks::default(),
        });
        self.by_type.insert(TypeId::of::<T>(), component);
        self.infos.insert(component.index(), Arc::clone(&info));
        info
    }

    pub(crate) fn insert_bytes(
        &mut self,
        component: EntityId,
        name: &str,
        size: usize,
        align: usize,
    ) -> Arc<TypeInfo> {
        let info = Arc::new(TypeInfo {
            component,
            name: name.to_owned(),
            size,
            align,
            type_id: None,
            vtable: ComponentVtable::bytes(size, align),
            hooks: TypeHooks::default(),
        });
        self.infos.insert(component.index(), Arc::clone(&info));
        info
    }

    /// Replace the hooks of a registered component.
    pub(crate) fn set_hooks(&mut self, index: u32, hooks: TypeHooks) -> Option<Arc<TypeInfo>> {
        let slot = self.infos.get_mut(&index)?;
        let mut info = TypeInfo::clone(slot);
        info.hooks = hooks;
        *slot = Arc::new(info);
        Some(Arc::clone(slot))
    }

    /// Forget a component entity that is being deleted.
    pub(crate) fn remove(&mut self, index: u32) -> Option<Arc<TypeInfo>> {
        let info = self.infos.remove(&index)?;
        if let Some(type_id) = info.type_id {
            self.by_type.remove(&type_id);
        }
        Some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = ComponentRegistry::new();
        let e = EntityId::new(40, 0);
        let info = reg.insert_typed::<Pos>(e, "Pos");
        assert_eq!(info.size, std::mem::size_of::<Pos>());
        assert!(info.is::<Pos>());
        assert!(!info.is::<u32>());
        assert_eq!(reg.lookup::<Pos>(), Some(e));
        assert!(reg.get(40).is_some());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn vtable_constructs_default() {
        let vt = ComponentVtable::new::<Pos>();
        let mut slot = std::mem::MaybeUninit::<Pos>::uninit();
        let value = unsafe {
            (vt.ctor)(slot.as_mut_ptr() as *mut u8, vt.size);
            slot.assume_init()
        };
        assert_eq!(value, Pos::default());
        assert!(vt.drop_fn.is_none());
        assert!(ComponentVtable::new::<String>().drop_fn.is_some());
    }

    #[test]
    fn set_hooks_replaces_info() {
        let mut reg = ComponentRegistry::new();
        let e = EntityId::new(40, 0);
        reg.insert_typed::<Pos>(e, "Pos");
        let hooks = TypeHooks::new().on_add(|_| {});
        let info = reg.set_hooks(40, hooks).unwrap();
        assert!(info.hooks().on_add.is_some());
        assert!(reg.get(40).unwrap().hooks().on_add.is_some());
        assert!(reg.set_hooks(41, TypeHooks::new()).is_none());
    }

    #[test]
    fn remove_forgets_type() {
        let mut reg = ComponentRegistry::new();
        let e = EntityId::new(40, 0);
        reg.insert_typed::<Pos>(e, "Pos");
        assert!(reg.remove(40).is_some());
        assert_eq!(reg.lookup::<Pos>(), None);
        assert!(reg.is_empty());
    }
}
