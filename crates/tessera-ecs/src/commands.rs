//! Deferred structural changes.
//!
//! While the world is deferred (between [`World::defer_begin`] and the
//! matching [`World::defer_end`], or inside a [`DeferGuard`]), `add_id`,
//! `remove_id`, `set`, `delete`, `clear` and `enable_id` are queued as
//! [`Command`]s instead of applied. They are replayed in strict FIFO order
//! when the outermost deferral ends, which keeps query cursors valid while
//! code iterates and mutates at the same time.
//!
//! Hooks and observers run under a [`SuspendGuard`], which turns deferral off
//! for their duration so the changes they make are applied immediately.
//!
//! # Example
//!
//! ```
//! use tessera_ecs::prelude::*;
//!
//! let mut world = World::new();
//! let tag = Id::entity(world.new_entity());
//! let e = world.new_entity();
//!
//! world.defer_begin();
//! world.add_id(e, tag).unwrap();
//! assert!(!world.has_id(e, tag));
//! let report = world.defer_end();
//! assert_eq!(report.success_count, 1);
//! assert!(world.has_id(e, tag));
//! ```

use std::alloc::Layout;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::ptr;

use serde::Serialize;
use tracing::warn;

use crate::component::TypeInfo;
use crate::entity::EntityId;
use crate::id::Id;
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// RawComponentBuf -- properly aligned component storage
// ---------------------------------------------------------------------------

/// A properly aligned heap buffer owning a single component value.
///
/// The value's destructor runs when the buffer is dropped, unless the value
/// was moved out with [`take_into`](Self::take_into).
pub(crate) struct RawComponentBuf {
    /// Pointer to the heap allocation (dangling for zero-sized values).
    ptr: *mut u8,
    layout: Layout,
    drop_fn: Option<unsafe fn(*mut u8)>,
    /// Whether the buffer still owns an initialized value.
    live: bool,
}

// SAFETY: values put in a buffer are `Send` (registration requires
// `Send + Sync`), and the buffer owns its allocation exclusively.
unsafe impl Send for RawComponentBuf {}

impl RawComponentBuf {
    fn alloc(layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            // Any aligned non-null pointer is valid for zero-sized accesses.
            return layout.align() as *mut u8;
        }
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        ptr
    }

    /// Move a typed value into a new buffer.
    pub(crate) fn from_value<T: Send + 'static>(value: T) -> Self {
        unsafe fn drop_impl<T>(ptr: *mut u8) {
            ptr::drop_in_place(ptr as *mut T);
        }
        let layout = Layout::new::<T>();
        let ptr = Self::alloc(layout);
        // SAFETY: ptr is valid for a write of T; ownership moves into the buffer.
        unsafe { ptr::write(ptr as *mut T, value) };
        Self {
            ptr,
            layout,
            drop_fn: std::mem::needs_drop::<T>().then_some(drop_impl::<T> as unsafe fn(*mut u8)),
            live: true,
        }
    }

    /// Clone the value at `src` using the type's clone function.
    ///
    /// # Safety
    ///
    /// `src` must point to a valid value described by `info`.
    pub(crate) unsafe fn from_clone(info: &TypeInfo, src: *const u8) -> Result<Self, EcsError> {
        let layout = Layout::from_size_align(info.size, info.align).map_err(|e| {
            EcsError::InvalidParameter {
                reason: format!("bad layout for {}: {e}", info.name),
            }
        })?;
        let ptr = Self::alloc(layout);
        (info.vtable.clone_fn)(src, ptr, info.size);
        Ok(Self {
            ptr,
            layout,
            drop_fn: info.vtable.drop_fn,
            live: true,
        })
    }

    /// Copy raw bytes of a plain-data value.
    pub(crate) fn from_bytes(bytes: &[u8], align: usize) -> Result<Self, EcsError> {
        let layout = Layout::from_size_align(bytes.len(), align).map_err(|e| {
            EcsError::InvalidParameter {
                reason: format!("bad layout: {e}"),
            }
        })?;
        let ptr = Self::alloc(layout);
        if !bytes.is_empty() {
            // SAFETY: ptr was allocated for bytes.len() bytes.
            unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        }
        Ok(Self {
            ptr,
            layout,
            drop_fn: None,
            live: true,
        })
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }

    /// Hand the value to `sink`, which takes ownership of the pointee.
    ///
    /// The buffer no longer drops the value afterwards.
    pub(crate) fn take_into<R>(mut self, sink: impl FnOnce(*const u8) -> R) -> R {
        let result = sink(self.ptr);
        self.live = false;
        result
    }
}

impl Drop for RawComponentBuf {
    fn drop(&mut self) {
        if self.live {
            if let Some(drop_fn) = self.drop_fn {
                // SAFETY: the buffer owns an initialized value.
                unsafe { drop_fn(self.ptr) };
            }
        }
        if self.layout.size() > 0 {
            // SAFETY: allocated with this layout in `alloc`.
            unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        }
    }
}

impl std::fmt::Debug for RawComponentBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawComponentBuf")
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .field("live", &self.live)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// What a queued command does.
#[derive(Debug)]
pub(crate) enum CommandKind {
    Add(Id),
    Remove(Id),
    Set { id: Id, value: RawComponentBuf },
    Modified(Id),
    Enable { id: Id, enabled: bool },
    Clear,
    Delete,
}

impl CommandKind {
    fn id(&self) -> Option<Id> {
        match self {
            CommandKind::Add(id)
            | CommandKind::Remove(id)
            | CommandKind::Modified(id)
            | CommandKind::Set { id, .. }
            | CommandKind::Enable { id, .. } => Some(*id),
            CommandKind::Clear | CommandKind::Delete => None,
        }
    }
}

/// A single deferred mutation.
#[derive(Debug)]
pub(crate) struct Command {
    pub(crate) target: EntityId,
    pub(crate) kind: CommandKind,
    /// Sequential index within the queue (set on insertion).
    pub(crate) index: u32,
}

// ---------------------------------------------------------------------------
// ApplyReport
// ---------------------------------------------------------------------------

/// Summary of one flush of the command queue.
///
/// `conflict_count` counts `(entity, id)` pairs targeted by more than one
/// command in the same flush; later commands win.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub conflict_count: usize,
    pub failed_count: usize,
    pub success_count: usize,
}

// ---------------------------------------------------------------------------
// CommandQueue
// ---------------------------------------------------------------------------

/// FIFO of deferred commands.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    commands: Vec<Command>,
    next_index: u32,
}

impl CommandQueue {
    pub(crate) fn push(&mut self, target: EntityId, kind: CommandKind) {
        let index = self.next_index;
        self.next_index += 1;
        self.commands.push(Command {
            target,
            kind,
            index,
        });
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn take(&mut self) -> Vec<Command> {
        self.next_index = 0;
        std::mem::take(&mut self.commands)
    }
}

fn count_conflicts(commands: &[Command]) -> usize {
    let mut seen: HashMap<(EntityId, Id), Vec<u32>> = HashMap::new();
    for cmd in commands {
        if let Some(id) = cmd.kind.id() {
            seen.entry((cmd.target, id)).or_default().push(cmd.index);
        }
    }
    let mut conflict_count = 0;
    for ((entity, id), indices) in &seen {
        if indices.len() > 1 {
            conflict_count += 1;
            tracing::debug!(
                %entity,
                %id,
                command_indices = ?indices,
                "{} commands target the same entity and id (last wins)",
                indices.len()
            );
        }
    }
    conflict_count
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Keeps the world deferred while alive; flushes on drop if it was the
/// outermost deferral.
pub struct DeferGuard<'w> {
    world: &'w mut World,
}

impl Deref for DeferGuard<'_> {
    type Target = World;

    fn deref(&self) -> &World {
        self.world
    }
}

impl DerefMut for DeferGuard<'_> {
    fn deref_mut(&mut self) -> &mut World {
        self.world
    }
}

impl Drop for DeferGuard<'_> {
    fn drop(&mut self) {
        self.world.defer_end();
    }
}

/// Turns deferral off while alive, so changes apply immediately.
pub struct SuspendGuard<'w> {
    world: &'w mut World,
}

impl Deref for SuspendGuard<'_> {
    type Target = World;

    fn deref(&self) -> &World {
        self.world
    }
}

impl DerefMut for SuspendGuard<'_> {
    fn deref_mut(&mut self) -> &mut World {
        self.world
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.world.defer_suspended -= 1;
    }
}

// ---------------------------------------------------------------------------
// World integration
// ---------------------------------------------------------------------------

impl World {
    /// Whether structural changes are currently queued instead of applied.
    #[inline]
    pub fn is_deferred(&self) -> bool {
        self.defer_depth > 0 && self.defer_suspended == 0
    }

    /// Start (or nest) a deferred section.
    pub fn defer_begin(&mut self) {
        self.defer_depth += 1;
    }

    /// End a deferred section. The outermost end replays the queue.
    ///
    /// Returns the report of the flush, or an empty report if the world is
    /// still deferred.
    pub fn defer_end(&mut self) -> ApplyReport {
        if self.defer_depth == 0 {
            warn!("defer_end called without matching defer_begin");
            return ApplyReport::default();
        }
        self.defer_depth -= 1;
        if self.defer_depth > 0 {
            return ApplyReport::default();
        }
        let report = self.flush_commands();
        self.last_apply_report = report;
        report
    }

    /// Scoped deferral.
    pub fn defer(&mut self) -> DeferGuard<'_> {
        self.defer_begin();
        DeferGuard { world: self }
    }

    /// Scoped suspension of deferral.
    pub fn suspend_defer(&mut self) -> SuspendGuard<'_> {
        self.defer_suspended += 1;
        SuspendGuard { world: self }
    }

    /// Report of the most recent flush.
    pub fn last_apply_report(&self) -> ApplyReport {
        self.last_apply_report
    }

    /// Number of commands waiting for the deferral to end.
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    pub(crate) fn enqueue(&mut self, target: EntityId, kind: CommandKind) {
        tracing::trace!(%target, ?kind, "command deferred");
        self.commands.push(target, kind);
    }

    fn flush_commands(&mut self) -> ApplyReport {
        let mut report = ApplyReport::default();
        while !self.commands.is_empty() {
            let commands = self.commands.take();
            report.conflict_count += count_conflicts(&commands);
            for cmd in commands {
                let index = cmd.index;
                let target = cmd.target;
                match self.apply_command(cmd) {
                    Ok(()) => report.success_count += 1,
                    Err(e) => {
                        report.failed_count += 1;
                        warn!(
                            command_index = index,
                            %target,
                            error = %e,
                            "deferred command skipped"
                        );
                    }
                }
            }
        }
        tracing::trace!(?report, "command queue flushed");
        report
    }

    fn apply_command(&mut self, cmd: Command) -> Result<(), EcsError> {
        let target = cmd.target;
        match cmd.kind {
            CommandKind::Add(id) => self.add_id(target, id),
            CommandKind::Remove(id) => self.remove_id(target, id),
            CommandKind::Set { id, value } => self.set_raw(target, id, value),
            CommandKind::Modified(id) => self.modified(target, id),
            CommandKind::Enable { id, enabled } => self.enable_id(target, id, enabled),
            CommandKind::Clear => self.clear(target),
            CommandKind::Delete => self.delete(target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn raw_buf_drops_unconsumed_value() {
        let counter = Arc::new(AtomicUsize::new(0));
        struct Probe(Arc<AtomicUsize>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        drop(RawComponentBuf::from_value(Probe(Arc::clone(&counter))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let buf = RawComponentBuf::from_value(Probe(Arc::clone(&counter)));
        let moved = buf.take_into(|p| unsafe { ptr::read(p as *const Probe) });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        drop(moved);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn raw_buf_from_bytes_checks_layout() {
        assert!(RawComponentBuf::from_bytes(&[1, 2, 3, 4], 4).is_ok());
        assert!(RawComponentBuf::from_bytes(&[1, 2, 3], 3).is_err());
    }

    #[test]
    fn conflicts_count_pairs_not_commands() {
        let e = EntityId::new(40, 0);
        let id = Id::from_index(50);
        let mut queue = CommandQueue::default();
        queue.push(e, CommandKind::Add(id));
        queue.push(e, CommandKind::Remove(id));
        queue.push(e, CommandKind::Add(id));
        queue.push(e, CommandKind::Delete);
        let commands = queue.take();
        assert_eq!(count_conflicts(&commands), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn nested_defer_flushes_once() {
        let mut world = World::new();
        let tag = Id::entity(world.new_entity());
        let e = world.new_entity();
        world.defer_begin();
        world.defer_begin();
        world.add_id(e, tag).unwrap();
        assert_eq!(world.defer_end(), ApplyReport::default());
        assert!(!world.has_id(e, tag));
        assert_eq!(world.pending_commands(), 1);
        let report = world.defer_end();
        assert_eq!(report.success_count, 1);
        assert!(world.has_id(e, tag));
    }

    #[test]
    fn defer_guard_flushes_on_drop() {
        let mut world = World::new();
        let tag = Id::entity(world.new_entity());
        let e = world.new_entity();
        {
            let mut deferred = world.defer();
            deferred.add_id(e, tag).unwrap();
            deferred.delete(e).unwrap();
            assert!(deferred.is_alive(e));
        }
        assert!(!world.is_alive(e));
        assert_eq!(world.last_apply_report().success_count, 2);
    }

    #[test]
    fn failed_commands_are_counted() {
        let mut world = World::new();
        let tag = Id::entity(world.new_entity());
        let e = world.new_entity();
        world.defer_begin();
        world.delete(e).unwrap();
        world.add_id(e, tag).unwrap();
        let report = world.defer_end();
        assert_eq!(report.success_count, 1);
        assert_eq!(report.failed_count, 1);
    }
}
