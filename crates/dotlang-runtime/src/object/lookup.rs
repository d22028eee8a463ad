//! Open-addressed property lookup over object and array maps.
//!
//! The probe table lives in the holder's [`HMap`](super::HMap): capacity
//! keys followed by capacity values. A lookup normalizes the key to a 32-bit
//! hash, starts at `(hash & mask) / 8`, and walks linearly with wraparound
//! until it finds an equal key or a vacant (nil) slot. A full traversal with
//! no hit grows the table, so probing always terminates.

use super::{read_word, write_word, HMap, HObject, HValue};
use crate::heap::Heap;
use crate::util::hash_int;
use crate::value::{HeapTag, Value};

/// A resolved value slot inside a holder's map.
///
/// Stays valid until the next safepoint; after any potential collection the
/// slot must be looked up again.
#[derive(Debug, Clone, Copy)]
pub struct PropertySlot {
    map: HMap,
    index: u32,
}

impl PropertySlot {
    /// Read the slot.
    pub fn value(&self) -> Value {
        self.map.value(self.index)
    }

    /// Write the slot.
    pub fn set_value(&self, value: Value) {
        self.map.set_value(self.index, value);
    }

    /// Raw slot address, for emitted code and registered references.
    pub fn address(&self) -> *mut Value {
        self.map.value_slot_address(self.index)
    }
}

enum Probe {
    Found(u32),
    Vacant(u32),
    Full,
}

/// Find `key` in `holder`'s map without inserting.
///
/// Returns `None` when the key is absent. `holder` must be an object or an
/// array.
pub fn find_property(holder: HValue, key: Value) -> Option<PropertySlot> {
    let map = holder_map(holder);
    match probe(map, holder_mask(holder), key) {
        Probe::Found(index) => Some(PropertySlot { map, index }),
        Probe::Vacant(_) | Probe::Full => None,
    }
}

/// Find `key` in `holder`'s map, claiming a slot for it if absent.
///
/// Grows the map (doubling, full rehash, holder mask update) whenever a
/// probe traverses the entire table, then retries.
pub fn insert_property(heap: &mut Heap, holder: HValue, key: Value) -> PropertySlot {
    loop {
        let map = holder_map(holder);
        match probe(map, holder_mask(holder), key) {
            Probe::Found(index) => return PropertySlot { map, index },
            Probe::Vacant(index) => {
                map.set_key(index, key);
                return PropertySlot { map, index };
            }
            Probe::Full => grow(heap, holder),
        }
    }
}

fn probe(map: HMap, mask: u64, key: Value) -> Probe {
    let capacity = map.capacity();
    debug_assert_eq!(mask, ((capacity - 1) * 8) as u64);

    let start = ((key_hash(key) as u64 & mask) / 8) as u32;
    for step in 0..capacity {
        let index = (start + step) & (capacity - 1);
        let slot_key = map.key(index);
        if slot_key.is_nil() {
            return Probe::Vacant(index);
        }
        if keys_equal(slot_key, key) {
            return Probe::Found(index);
        }
    }
    Probe::Full
}

fn grow(heap: &mut Heap, holder: HValue) {
    let old_map = holder_map(holder);
    let new_map = HMap::new(heap, old_map.capacity() * 2);
    let new_mask = ((new_map.capacity() - 1) * 8) as u64;

    for index in 0..old_map.capacity() {
        let key = old_map.key(index);
        if key.is_nil() {
            continue;
        }
        // Keys are distinct and the doubled table is at most half full, so
        // rehashing always lands on a vacant slot.
        match probe(new_map, new_mask, key) {
            Probe::Vacant(slot) => {
                new_map.set_key(slot, key);
                new_map.set_value(slot, old_map.value(index));
            }
            Probe::Found(_) | Probe::Full => {
                panic!("rehash must find a vacant slot for every key")
            }
        }
    }

    publish_map(holder, new_map);
}

/// Normalize a key to its 32-bit hash.
fn key_hash(key: Value) -> u32 {
    assert!(!key.is_nil(), "nil cannot be a property key");
    if key.is_unboxed() {
        return hash_int(key.untag_int());
    }
    let object = HValue::from_value(key).expect("property key must be a tagged value");
    if object.tag() == HeapTag::String {
        object.as_string().hash()
    } else {
        hash_int(object.addr() as i64)
    }
}

/// Tag-aware key equality: unboxed by value, strings by length then bytes,
/// everything else by identity.
fn keys_equal(a: Value, b: Value) -> bool {
    if a.raw() == b.raw() {
        return true;
    }
    match (HValue::from_value(a), HValue::from_value(b)) {
        (Some(x), Some(y)) if x.tag() == HeapTag::String && y.tag() == HeapTag::String => {
            let (x, y) = (x.as_string(), y.as_string());
            x.length() == y.length() && x.bytes() == y.bytes()
        }
        _ => false,
    }
}

fn assert_holder(holder: HValue) {
    assert!(
        matches!(holder.tag(), HeapTag::Object | HeapTag::Array),
        "property lookup on a non-object"
    );
}

fn holder_map(holder: HValue) -> HMap {
    assert_holder(holder);
    Value::from_raw(unsafe { read_word(holder.addr(), HObject::MAP_OFFSET) })
        .as_ptr()
        .map(|addr| unsafe { HValue::from_addr(addr) }.as_map())
        .expect("holder must carry a map pointer")
}

fn holder_mask(holder: HValue) -> u64 {
    assert_holder(holder);
    unsafe { read_word(holder.addr(), HObject::MASK_OFFSET) }
}

fn publish_map(holder: HValue, map: HMap) {
    assert_holder(holder);
    unsafe {
        write_word(
            holder.addr(),
            HObject::MASK_OFFSET,
            ((map.capacity() - 1) * 8) as u64,
        );
        write_word(
            holder.addr(),
            HObject::MAP_OFFSET,
            map.as_hvalue().to_value().raw(),
        );
    }
}
