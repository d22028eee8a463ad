//! Generational stop-the-world collection.
//!
//! A collection evacuates every reachable object out of the collected
//! space(s): young survivors move into a fresh young space until their
//! generation reaches the old threshold, at which point they are promoted.
//! A full collection additionally evacuates the old space into a fresh one.
//!
//! Reachability starts from the registered references, the root stack, and
//! the pending-exception slot, and spreads through an explicit gray
//! worklist. A from-space object is visited once: its header is stamped
//! with the copy's address, and later visits just follow the forward.
//! Objects in a space the collection does not touch are marked in place
//! (forwarding to themselves) and restored afterwards.
//!
//! The collector cannot recover from a broken heap: unknown tags, pointers
//! outside every space, and to-space OOM all abort.

use super::heap::Heap;
use super::page::{Space, SpaceKind};
use super::refs::Reference;
use crate::defaults::OLD_SPACE_GENERATION;
use crate::object::HValue;
use crate::util::round_up;
use crate::value::{HeapTag, Value};
use std::mem;
use std::time::{Duration, Instant};

/// How much of the heap a collection covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcScope {
    /// Scavenge the young space only.
    Young,
    /// Evacuate both spaces.
    Full,
}

/// Collection statistics.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total collections of any scope.
    pub collections: usize,
    /// Collections that covered the old space.
    pub full_collections: usize,
    /// Bytes evacuated across all collections.
    pub bytes_copied: usize,
    /// Bytes placed in the old space across all collections.
    pub bytes_promoted: usize,
    /// Weak callbacks fired across all collections.
    pub weak_callbacks_fired: usize,
    /// Duration of the last collection.
    pub last_pause: Duration,
    /// Total time spent collecting.
    pub total_pause: Duration,
}

impl GcStats {
    fn update(
        &mut self,
        scope: GcScope,
        pause: Duration,
        bytes_copied: usize,
        bytes_promoted: usize,
        weak_fired: usize,
    ) {
        self.collections += 1;
        if scope == GcScope::Full {
            self.full_collections += 1;
        }
        self.bytes_copied += bytes_copied;
        self.bytes_promoted += bytes_promoted;
        self.weak_callbacks_fired += weak_fired;
        self.last_pause = pause;
        self.total_pause += pause;
    }
}

/// Owns the from- and to-spaces for the duration of one collection.
struct Evacuator {
    young_from: Space,
    young_to: Space,
    /// Old from-space; `Some` only for a full collection.
    old_from: Option<Space>,
    /// Where promotions land: the live old space during a scavenge, a fresh
    /// space during a full collection.
    old_dest: Space,
    worklist: Vec<HValue>,
    marked_in_place: Vec<HValue>,
    bytes_copied: usize,
    bytes_promoted: usize,
    /// Promotion pushed the old space past its limit.
    old_pressure: bool,
}

impl Evacuator {
    fn in_collected_space(&self, addr: *const u8) -> bool {
        self.young_from.contains(addr)
            || self
                .old_from
                .as_ref()
                .is_some_and(|space| space.contains(addr))
    }

    /// Ensure `object` survives, returning its post-collection address.
    fn evacuate(&mut self, object: HValue) -> *mut u8 {
        if object.is_gc_marked() {
            return object.get_gc_mark();
        }

        if self.in_collected_space(object.addr()) {
            let copy = self.copy_object(object);
            object.set_gc_mark(copy.addr());
            self.worklist.push(copy);
            copy.addr()
        } else if self.old_dest.contains(object.addr()) {
            // A space this collection leaves alone: keep the object where it
            // is, but trace through it so young referents survive and its
            // slots are rewritten.
            object.set_gc_mark(object.addr());
            self.marked_in_place.push(object);
            self.worklist.push(object);
            object.addr()
        } else {
            panic!(
                "heap pointer {:#x} outside every space",
                object.addr() as usize
            );
        }
    }

    fn copy_object(&mut self, object: HValue) -> HValue {
        let size = object.copy_size();
        object.increment_generation();

        let promote = object.generation() >= OLD_SPACE_GENERATION;
        let space = if promote {
            &mut self.old_dest
        } else {
            &mut self.young_to
        };
        let alloc = space.allocate(round_up(size, 8));
        if promote {
            self.old_pressure |= alloc.limit_hit;
            self.bytes_promoted += size as usize;
        }
        self.bytes_copied += size as usize;

        unsafe {
            std::ptr::copy_nonoverlapping(object.addr(), alloc.addr, size as usize);
            HValue::from_addr(alloc.addr)
        }
    }

    /// Rewrite one value slot inside a live object or root structure.
    fn process_slot(&mut self, slot: *mut u64) {
        let value = Value::from_raw(unsafe { slot.read() });
        if let Some(object) = HValue::from_value(value) {
            let new_addr = self.evacuate(object);
            unsafe { slot.write(new_addr as u64) };
        }
    }

    /// Evacuate the target of `value`, returning the rewritten value.
    fn process_value(&mut self, value: Value) -> Value {
        match HValue::from_value(value) {
            Some(object) => unsafe { Value::from_ptr(self.evacuate(object)) },
            None => value,
        }
    }

    /// Visit every outgoing pointer of `object`.
    fn trace(&mut self, object: HValue) {
        let addr = object.addr();
        let slot = |offset: u32| unsafe { addr.add(offset as usize) as *mut u64 };

        match object.tag() {
            HeapTag::Context => {
                self.process_slot(slot(8));
                let count = object.as_context().slot_count();
                for index in 0..count {
                    self.process_slot(slot(24 + index * 8));
                }
            }
            HeapTag::Function => {
                // The code address at +16 is not a heap value.
                self.process_slot(slot(8));
                self.process_slot(slot(24));
            }
            HeapTag::Object | HeapTag::Array => {
                self.process_slot(slot(16));
            }
            HeapTag::Map => {
                let capacity = object.as_map().capacity();
                for index in 0..capacity * 2 {
                    self.process_slot(slot(16 + index * 8));
                }
            }
            HeapTag::Number | HeapTag::Boolean | HeapTag::String | HeapTag::CData => {}
            HeapTag::Nil => panic!("nil header reached the collector"),
        }
    }

    fn drain(&mut self) {
        while let Some(object) = self.worklist.pop() {
            self.trace(object);
        }
    }
}

/// Run one collection over `heap`.
pub(super) fn collect(heap: &mut Heap, scope: GcScope) {
    let started = Instant::now();
    let page_size = heap.new_space.page_size();
    tracing::debug!(
        ?scope,
        young_bytes = heap.new_space.size(),
        old_bytes = heap.old_space.size(),
        "collection started"
    );

    // Take both spaces; the heap keeps placeholders until the survivors are
    // published by swap.
    let young_from = mem::replace(&mut heap.new_space, Space::new(SpaceKind::Young, page_size));
    let (old_from, old_dest) = match scope {
        GcScope::Young => (
            None,
            mem::replace(&mut heap.old_space, Space::new(SpaceKind::Old, page_size)),
        ),
        GcScope::Full => (
            Some(mem::replace(
                &mut heap.old_space,
                Space::new(SpaceKind::Old, page_size),
            )),
            Space::new(SpaceKind::Old, page_size),
        ),
    };

    let mut evacuator = Evacuator {
        young_from,
        young_to: Space::new(SpaceKind::Young, page_size),
        old_from,
        old_dest,
        worklist: Vec::new(),
        marked_in_place: Vec::new(),
        bytes_copied: 0,
        bytes_promoted: 0,
        old_pressure: false,
    };

    // Strong roots: registered references (entry and registrant slot are
    // both rewritten), the root stack, and the pending exception.
    let mut references = mem::take(&mut heap.references);
    for reference in &mut references {
        let forwarded = evacuator.process_value(reference.value);
        update_reference(reference, forwarded);
    }

    let mut root_stack = mem::take(&mut heap.root_stack);
    for slot in root_stack.slots_mut() {
        *slot = evacuator.process_value(*slot);
    }

    heap.pending_exception = evacuator.process_value(heap.pending_exception);

    evacuator.drain();

    // Weak references are not roots: a target that was never forwarded and
    // lived in a collected space is dead. Callbacks fire in registration
    // order, once per entry, with the pre-collection address.
    let mut weak_refs = mem::take(&mut heap.weak_refs);
    let mut weak_fired = 0usize;
    weak_refs.retain_mut(|weak| {
        let Some(object) = HValue::from_value(weak.value) else {
            return true;
        };
        if object.is_gc_marked() {
            weak.value = unsafe { Value::from_ptr(object.get_gc_mark()) };
            true
        } else if evacuator.in_collected_space(object.addr()) {
            weak_fired += 1;
            (weak.callback)(weak.value);
            false
        } else {
            true
        }
    });

    for object in mem::take(&mut evacuator.marked_in_place) {
        object.reset_gc_mark();
    }

    heap.references = references;
    heap.root_stack = root_stack;
    heap.weak_refs = weak_refs;

    // Publish the survivors; swap recomputes each space's size limit.
    heap.new_space.swap(&mut evacuator.young_to);
    heap.old_space.swap(&mut evacuator.old_dest);

    heap.set_needs_gc(Heap::GC_NONE);
    if scope == GcScope::Young && evacuator.old_pressure {
        // Promotion overflowed the old space; escalate at the next safepoint.
        heap.set_needs_gc(Heap::GC_OLD_SPACE);
    }

    let pause = started.elapsed();
    heap.stats.update(
        scope,
        pause,
        evacuator.bytes_copied,
        evacuator.bytes_promoted,
        weak_fired,
    );
    tracing::debug!(
        ?scope,
        pause_us = pause.as_micros() as u64,
        bytes_copied = evacuator.bytes_copied,
        bytes_promoted = evacuator.bytes_promoted,
        weak_fired,
        young_bytes = heap.new_space.size(),
        old_bytes = heap.old_space.size(),
        "collection finished"
    );
}

fn update_reference(reference: &mut Reference, forwarded: Value) {
    reference.value = forwarded;
    unsafe { reference.slot.write(forwarded) };
}
