//! The heap: two spaces, tagged allocation, and the collaborator surface.
//!
//! The heap owns the young and old [`Space`]s, the `needs_gc` byte emitted
//! code polls, the pending-exception slot, and the registries the collector
//! scans. Allocation never blocks on collection: overflowing a space raises
//! the matching needs-gc bit and the allocation proceeds on a fresh page;
//! the collector runs at the next safepoint.

use super::collector::{self, GcScope, GcStats};
use super::page::{Space, SpaceKind};
use super::refs::{RefKind, Reference, RootStack, WeakCallback, WeakRef};
use crate::defaults::{DEFAULT_PAGE_SIZE, OLD_SPACE_GENERATION};
use crate::util::round_up;
use crate::value::{HeapTag, Value};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// The process-wide current heap, set at construction and cleared on drop.
static CURRENT_HEAP: AtomicPtr<Heap> = AtomicPtr::new(ptr::null_mut());

/// Which space an allocation is directed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tenure {
    /// Young space; the default for fresh values.
    New,
    /// Old space; the object starts at the tenured generation and never
    /// returns to young space.
    Old,
}

/// The managed heap.
pub struct Heap {
    pub(super) new_space: Space,
    pub(super) old_space: Space,
    /// Boxed so the address emitted code embeds stays stable even if the
    /// `Heap` value itself moves.
    pub(super) needs_gc: Box<u8>,
    pub(super) pending_exception: Value,
    pub(super) root_stack: RootStack,
    pub(super) references: Vec<Reference>,
    pub(super) weak_refs: Vec<WeakRef>,
    pub(super) stats: GcStats,
}

impl Heap {
    /// No collection requested.
    pub const GC_NONE: u8 = 0;
    /// Young space overflowed its limit.
    pub const GC_NEW_SPACE: u8 = 1;
    /// Old space overflowed its limit.
    pub const GC_OLD_SPACE: u8 = 2;

    /// Create a heap whose spaces use `page_size`-byte pages.
    ///
    /// The new heap becomes the process-wide current heap.
    pub fn new(page_size: u32) -> Box<Heap> {
        let mut heap = Box::new(Heap {
            new_space: Space::new(SpaceKind::Young, page_size),
            old_space: Space::new(SpaceKind::Old, page_size),
            needs_gc: Box::new(Self::GC_NONE),
            pending_exception: Value::nil(),
            root_stack: RootStack::new(),
            references: Vec::new(),
            weak_refs: Vec::new(),
            stats: GcStats::default(),
        });
        CURRENT_HEAP.store(&mut *heap, Ordering::Release);
        heap
    }

    /// Create a heap with the default page size.
    pub fn with_default_page_size() -> Box<Heap> {
        Self::new(DEFAULT_PAGE_SIZE)
    }

    /// The process-wide current heap, or null if none is live.
    ///
    /// Emitted code reaches the heap through this pointer; Rust callers
    /// thread `&mut Heap` explicitly.
    pub fn current() -> *mut Heap {
        CURRENT_HEAP.load(Ordering::Acquire)
    }

    /// Allocate a heap object of `bytes` body bytes plus the header.
    ///
    /// The total is rounded to a word multiple so every object address is
    /// 8-byte aligned. The header is stamped with `tag` and, for old-tenure
    /// allocations, the tenured generation.
    pub fn allocate_tagged(&mut self, tag: HeapTag, tenure: Tenure, bytes: u32) -> *mut u8 {
        let total = round_up(bytes + 8, 8);
        let (space, flag) = match tenure {
            Tenure::New => (&mut self.new_space, Self::GC_NEW_SPACE),
            Tenure::Old => (&mut self.old_space, Self::GC_OLD_SPACE),
        };

        let alloc = space.allocate(total);
        if alloc.limit_hit {
            *self.needs_gc |= flag;
            tracing::trace!(
                space = ?space.kind(),
                size = space.size(),
                limit = space.size_limit(),
                "space over budget, collection requested"
            );
        }

        let generation = match tenure {
            Tenure::New => 0u64,
            Tenure::Old => OLD_SPACE_GENERATION as u64,
        };
        unsafe { (alloc.addr as *mut u64).write(tag as u64 | (generation << 8)) };
        alloc.addr
    }

    /// The needs-gc flags as emitted code sees them.
    pub fn needs_gc(&self) -> u8 {
        *self.needs_gc
    }

    /// Stable address of the needs-gc byte, embedded by the code generator.
    pub fn needs_gc_addr(&self) -> *const u8 {
        &*self.needs_gc
    }

    pub(super) fn set_needs_gc(&mut self, flags: u8) {
        *self.needs_gc = flags;
    }

    /// The parked language-level exception, nil if none.
    pub fn pending_exception(&self) -> Value {
        self.pending_exception
    }

    /// Park a language-level exception for the caller's next safepoint.
    pub fn set_pending_exception(&mut self, value: Value) {
        self.pending_exception = value;
    }

    /// Take and clear the parked exception.
    pub fn take_pending_exception(&mut self) -> Value {
        std::mem::replace(&mut self.pending_exception, Value::nil())
    }

    /// Register a strong reference: the collector keeps `value` alive and
    /// rewrites `*slot` after evacuation.
    ///
    /// # Safety contract
    ///
    /// `slot` must stay valid (non-moving memory) until dereferenced.
    pub fn reference(&mut self, kind: RefKind, slot: *mut Value, value: Value) {
        self.references.push(Reference { kind, slot, value });
    }

    /// Drop the most recently registered reference matching `slot`/`value`.
    pub fn dereference(&mut self, slot: *mut Value, value: Value) {
        if let Some(position) = self
            .references
            .iter()
            .rposition(|r| r.slot == slot && r.value == value)
        {
            self.references.remove(position);
        }
    }

    /// Register a weak reference: `callback` fires exactly once, with the
    /// last known address, when `value` dies during a collection.
    pub fn add_weak(&mut self, value: Value, callback: WeakCallback) {
        self.weak_refs.push(WeakRef { value, callback });
    }

    /// Drop every weak reference tracking `value`.
    pub fn remove_weak(&mut self, value: Value) {
        self.weak_refs.retain(|w| w.value != value);
    }

    /// The registered strong references, in registration order.
    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    /// The registered weak references, in registration order.
    pub fn weak_references(&self) -> &[WeakRef] {
        &self.weak_refs
    }

    /// The frame-structured root stack the collector scans.
    pub fn root_stack(&mut self) -> &mut RootStack {
        &mut self.root_stack
    }

    /// Read-only view of the root stack.
    pub fn root_stack_ref(&self) -> &RootStack {
        &self.root_stack
    }

    /// The young space.
    pub fn new_space(&self) -> &Space {
        &self.new_space
    }

    /// The old space.
    pub fn old_space(&self) -> &Space {
        &self.old_space
    }

    /// Collection statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Safepoint entry: run the collection the needs-gc flags ask for.
    ///
    /// Scavenges the young space unless the old-space bit is set, in which
    /// case both spaces are collected. Clears the flags.
    pub fn collect_garbage(&mut self) {
        let scope = if *self.needs_gc & Self::GC_OLD_SPACE != 0 {
            GcScope::Full
        } else {
            GcScope::Young
        };
        self.collect(scope);
    }

    /// Run a collection of the given scope unconditionally.
    pub fn collect(&mut self, scope: GcScope) {
        collector::collect(self, scope);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let this = self as *mut Heap;
        let _ = CURRENT_HEAP.compare_exchange(this, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed);
    }
}
