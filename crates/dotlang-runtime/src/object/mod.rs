//! Heap object shapes and their byte-exact layouts.
//!
//! Every heap object starts with an 8-byte header: byte 0 is the
//! [`HeapTag`], byte 1 the generation counter, and the remaining bytes are
//! zero until the collector repurposes them for the forwarding address. The
//! offsets of every field after the header are part of the contract with
//! emitted machine code and must not change (see the per-kind `*_OFFSET`
//! constants).
//!
//! [`HValue`] wraps a raw object address; the typed views ([`HContext`],
//! [`HString`], ...) add kind-checked constructors and accessors that are
//! pure offset arithmetic.
//!
//! # Safety
//!
//! A view is only as valid as the address behind it: the wrapped object must
//! be alive in the current heap, and any allocation may move it. Views held
//! across allocation points must be re-derived from a registered reference
//! or a scanned root slot.

mod lookup;

pub use lookup::{find_property, insert_property, PropertySlot};

use crate::heap::{Heap, Tenure};
use crate::util::hash_bytes;
use crate::value::{HeapTag, Value, BINDING_CONTEXT_MARKER};
use std::fmt;
use std::ptr::NonNull;

const TAG_MASK: u64 = 0x7f;
const MARK_BIT: u64 = 0x80;
const GENERATION_SHIFT: u32 = 8;
const FORWARD_SHIFT: u32 = 16;

#[inline]
unsafe fn read_word(addr: *mut u8, offset: u32) -> u64 {
    (addr.add(offset as usize) as *const u64).read()
}

#[inline]
unsafe fn write_word(addr: *mut u8, offset: u32, word: u64) {
    (addr.add(offset as usize) as *mut u64).write(word);
}

/// A view over an arbitrary heap object.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HValue {
    addr: NonNull<u8>,
}

impl HValue {
    /// Wrap a raw object address.
    ///
    /// # Safety
    ///
    /// `addr` must point at the header of a live heap object.
    #[inline]
    pub unsafe fn from_addr(addr: *mut u8) -> HValue {
        debug_assert_eq!(addr as usize % 8, 0);
        HValue {
            addr: NonNull::new_unchecked(addr),
        }
    }

    /// View the heap object behind `value`, if it is a heap pointer.
    #[inline]
    pub fn from_value(value: Value) -> Option<HValue> {
        value.as_ptr().map(|addr| unsafe { HValue::from_addr(addr) })
    }

    /// The object's address.
    #[inline]
    pub fn addr(self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// The object's address as a tagged value.
    #[inline]
    pub fn to_value(self) -> Value {
        unsafe { Value::from_ptr(self.addr()) }
    }

    #[inline]
    fn header(self) -> u64 {
        unsafe { read_word(self.addr(), 0) }
    }

    #[inline]
    fn set_header(self, word: u64) {
        unsafe { write_word(self.addr(), 0, word) };
    }

    /// The kind tag in header byte 0 (mark bit excluded).
    #[inline]
    pub fn tag(self) -> HeapTag {
        HeapTag::from_u8((self.header() & TAG_MASK) as u8)
    }

    /// Generation counter in header byte 1.
    #[inline]
    pub fn generation(self) -> u8 {
        (self.header() >> GENERATION_SHIFT) as u8
    }

    /// Bump the generation counter, saturating at 255.
    pub fn increment_generation(self) {
        let generation = self.generation();
        if generation < u8::MAX {
            let header = self.header() & !(0xff << GENERATION_SHIFT);
            self.set_header(header | ((generation as u64 + 1) << GENERATION_SHIFT));
        }
    }

    /// Was this object forwarded during the current collection?
    #[inline]
    pub fn is_gc_marked(self) -> bool {
        self.header() & MARK_BIT != 0
    }

    /// Stamp the forwarding address into the header.
    ///
    /// Keeps the tag and generation bytes; the upper 48 bits hold the copy's
    /// address. Only legal during a collection cycle.
    pub fn set_gc_mark(self, new_addr: *mut u8) {
        debug_assert!(
            (new_addr as u64) < 1 << (64 - FORWARD_SHIFT),
            "forwarding address does not fit the header"
        );
        let low = self.header() & (TAG_MASK | (0xff << GENERATION_SHIFT));
        self.set_header(low | MARK_BIT | ((new_addr as u64) << FORWARD_SHIFT));
    }

    /// The forwarding address stamped by [`set_gc_mark`](Self::set_gc_mark).
    #[inline]
    pub fn get_gc_mark(self) -> *mut u8 {
        debug_assert!(self.is_gc_marked());
        (self.header() >> FORWARD_SHIFT) as *mut u8
    }

    /// Restore the header of an object that was marked in place.
    pub fn reset_gc_mark(self) {
        self.set_header(self.header() & (TAG_MASK | (0xff << GENERATION_SHIFT)));
    }

    /// Total byte size of this object, header included.
    ///
    /// Computed from the kind tag and kind-specific fields; this is the
    /// amount the collector copies.
    pub fn copy_size(self) -> u32 {
        8 + match self.tag() {
            HeapTag::Context => 16 + self.as_context().slot_count() * 8,
            HeapTag::Function => 24,
            HeapTag::Number | HeapTag::Boolean => 8,
            HeapTag::String => 16 + self.as_string().length(),
            HeapTag::Object => 16,
            HeapTag::Array => 24,
            HeapTag::Map => 8 + self.as_map().capacity() * 16,
            HeapTag::CData => 8 + self.as_cdata().size(),
            HeapTag::Nil => panic!("nil has no heap representation"),
        }
    }

    /// Kind-checked view as a context.
    pub fn as_context(self) -> HContext {
        assert_eq!(self.tag(), HeapTag::Context);
        HContext(self)
    }

    /// Kind-checked view as a function.
    pub fn as_function(self) -> HFunction {
        assert_eq!(self.tag(), HeapTag::Function);
        HFunction(self)
    }

    /// Kind-checked view as a boxed number.
    pub fn as_number(self) -> HNumber {
        assert_eq!(self.tag(), HeapTag::Number);
        HNumber(self)
    }

    /// Kind-checked view as a boolean.
    pub fn as_boolean(self) -> HBoolean {
        assert_eq!(self.tag(), HeapTag::Boolean);
        HBoolean(self)
    }

    /// Kind-checked view as a string.
    pub fn as_string(self) -> HString {
        assert_eq!(self.tag(), HeapTag::String);
        HString(self)
    }

    /// Kind-checked view as an object.
    pub fn as_object(self) -> HObject {
        assert_eq!(self.tag(), HeapTag::Object);
        HObject(self)
    }

    /// Kind-checked view as an array.
    pub fn as_array(self) -> HArray {
        assert_eq!(self.tag(), HeapTag::Array);
        HArray(self)
    }

    /// Kind-checked view as a map.
    pub fn as_map(self) -> HMap {
        assert_eq!(self.tag(), HeapTag::Map);
        HMap(self)
    }

    /// Kind-checked view as foreign data.
    pub fn as_cdata(self) -> HCData {
        assert_eq!(self.tag(), HeapTag::CData);
        HCData(self)
    }
}

impl fmt::Debug for HValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{:#x}", self.tag(), self.addr() as usize)
    }
}

/// Scope context: `+8` parent pointer, `+16` slot count, `+24` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HContext(HValue);

impl HContext {
    /// Offset of the parent-context pointer.
    pub const PARENT_OFFSET: u32 = 8;
    /// Offset of the slot count.
    pub const SLOT_COUNT_OFFSET: u32 = 16;
    /// Offset of the first value slot.
    pub const SLOTS_OFFSET: u32 = 24;

    /// Allocate a context holding `values`, with a nil parent.
    ///
    /// Contexts are tenured immediately: they anchor closures and almost
    /// always outlive a young collection.
    pub fn new(heap: &mut Heap, values: &[Value]) -> HContext {
        let count = values.len() as u32;
        let addr = heap.allocate_tagged(HeapTag::Context, Tenure::Old, 16 + count * 8);
        unsafe {
            write_word(addr, Self::PARENT_OFFSET, Value::nil().raw());
            write_word(addr, Self::SLOT_COUNT_OFFSET, count as u64);
            for (index, value) in values.iter().enumerate() {
                write_word(addr, Self::SLOTS_OFFSET + index as u32 * 8, value.raw());
            }
            HContext(HValue::from_addr(addr))
        }
    }

    /// The underlying object view.
    #[inline]
    pub fn as_hvalue(self) -> HValue {
        self.0
    }

    fn addr(self) -> *mut u8 {
        self.0.addr()
    }

    /// The parent context pointer (nil, binding marker, or context).
    pub fn parent(self) -> Value {
        Value::from_raw(unsafe { read_word(self.addr(), Self::PARENT_OFFSET) })
    }

    /// Does this context have a non-nil parent?
    pub fn has_parent(self) -> bool {
        !self.parent().is_nil()
    }

    /// Rewire the parent pointer.
    pub fn set_parent(self, parent: Value) {
        unsafe { write_word(self.addr(), Self::PARENT_OFFSET, parent.raw()) };
    }

    /// Number of value slots.
    pub fn slot_count(self) -> u32 {
        unsafe { read_word(self.addr(), Self::SLOT_COUNT_OFFSET) as u32 }
    }

    /// Is `index` a valid slot?
    pub fn has_slot(self, index: u32) -> bool {
        index < self.slot_count()
    }

    /// Read slot `index`.
    pub fn slot(self, index: u32) -> Value {
        assert!(self.has_slot(index));
        Value::from_raw(unsafe { read_word(self.addr(), Self::SLOTS_OFFSET + index * 8) })
    }

    /// Write slot `index`.
    pub fn set_slot(self, index: u32, value: Value) {
        assert!(self.has_slot(index));
        unsafe { write_word(self.addr(), Self::SLOTS_OFFSET + index * 8, value.raw()) };
    }

    /// Raw address of slot `index`, for registered context-slot references.
    pub fn slot_address(self, index: u32) -> *mut Value {
        assert!(self.has_slot(index));
        unsafe {
            self.addr()
                .add((Self::SLOTS_OFFSET + index * 8) as usize) as *mut Value
        }
    }
}

/// Compiled function: `+8` parent context, `+16` code address, `+24` root
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HFunction(HValue);

impl HFunction {
    /// Offset of the parent-context pointer.
    pub const PARENT_OFFSET: u32 = 8;
    /// Offset of the machine-code entry address.
    pub const CODE_OFFSET: u32 = 16;
    /// Offset of the root-context pointer.
    pub const ROOT_OFFSET: u32 = 24;

    /// Allocate a function object. Tenured like contexts.
    pub fn new(heap: &mut Heap, parent: Value, code: u64, root: Value) -> HFunction {
        let addr = heap.allocate_tagged(HeapTag::Function, Tenure::Old, 24);
        unsafe {
            write_word(addr, Self::PARENT_OFFSET, parent.raw());
            write_word(addr, Self::CODE_OFFSET, code);
            write_word(addr, Self::ROOT_OFFSET, root.raw());
            HFunction(HValue::from_addr(addr))
        }
    }

    /// Allocate a function whose parent is the foreign binding.
    pub fn new_binding(heap: &mut Heap, code: u64, root: Value) -> HFunction {
        Self::new(heap, Value::from_raw(BINDING_CONTEXT_MARKER), code, root)
    }

    /// The underlying object view.
    #[inline]
    pub fn as_hvalue(self) -> HValue {
        self.0
    }

    fn addr(self) -> *mut u8 {
        self.0.addr()
    }

    /// The captured parent context (or the binding marker).
    pub fn parent(self) -> Value {
        Value::from_raw(unsafe { read_word(self.addr(), Self::PARENT_OFFSET) })
    }

    /// Rewire the parent context.
    pub fn set_parent(self, parent: Value) {
        unsafe { write_word(self.addr(), Self::PARENT_OFFSET, parent.raw()) };
    }

    /// The machine-code entry address.
    pub fn code(self) -> u64 {
        unsafe { read_word(self.addr(), Self::CODE_OFFSET) }
    }

    /// The root context of the unit this function was compiled in.
    pub fn root(self) -> Value {
        Value::from_raw(unsafe { read_word(self.addr(), Self::ROOT_OFFSET) })
    }
}

/// Boxed IEEE-754 double at `+8`.
///
/// Integral numbers prefer the unboxed encoding ([`Value::tag_int`]); the
/// boxed form exists for doubles and for emitted code that needs an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HNumber(HValue);

impl HNumber {
    /// Offset of the double payload.
    pub const VALUE_OFFSET: u32 = 8;

    /// Box a double.
    pub fn new(heap: &mut Heap, tenure: Tenure, value: f64) -> HNumber {
        let addr = heap.allocate_tagged(HeapTag::Number, tenure, 8);
        unsafe {
            write_word(addr, Self::VALUE_OFFSET, value.to_bits());
            HNumber(HValue::from_addr(addr))
        }
    }

    /// The underlying object view.
    #[inline]
    pub fn as_hvalue(self) -> HValue {
        self.0
    }

    fn addr(self) -> *mut u8 {
        self.0.addr()
    }

    /// The boxed double.
    pub fn value(self) -> f64 {
        f64::from_bits(unsafe { read_word(self.addr(), Self::VALUE_OFFSET) })
    }

    /// Read a number value as an integer, whichever representation it uses.
    pub fn integral_value(value: Value) -> i64 {
        if value.is_unboxed() {
            value.untag_int()
        } else {
            HValue::from_value(value)
                .expect("number value must be unboxed or boxed")
                .as_number()
                .value() as i64
        }
    }

    /// Read a number value as a double, whichever representation it uses.
    pub fn double_value(value: Value) -> f64 {
        if value.is_unboxed() {
            value.untag_int() as f64
        } else {
            HValue::from_value(value)
                .expect("number value must be unboxed or boxed")
                .as_number()
                .value()
        }
    }
}

/// Boxed boolean: one byte at `+8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HBoolean(HValue);

impl HBoolean {
    /// Offset of the 0/1 byte.
    pub const VALUE_OFFSET: u32 = 8;

    /// Box a boolean.
    pub fn new(heap: &mut Heap, tenure: Tenure, value: bool) -> HBoolean {
        let addr = heap.allocate_tagged(HeapTag::Boolean, tenure, 8);
        unsafe {
            write_word(addr, Self::VALUE_OFFSET, value as u64);
            HBoolean(HValue::from_addr(addr))
        }
    }

    /// The underlying object view.
    #[inline]
    pub fn as_hvalue(self) -> HValue {
        self.0
    }

    fn addr(self) -> *mut u8 {
        self.0.addr()
    }

    /// The boxed truth value.
    pub fn value(self) -> bool {
        unsafe { self.addr().add(Self::VALUE_OFFSET as usize).read() != 0 }
    }

    /// Is this the true boolean?
    pub fn is_true(self) -> bool {
        self.value()
    }

    /// Is this the false boolean?
    pub fn is_false(self) -> bool {
        !self.value()
    }
}

/// Byte string: `+8` cached hash, `+16` length, `+24` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HString(HValue);

impl HString {
    /// Offset of the cached 32-bit hash (0 = uncomputed).
    pub const HASH_OFFSET: u32 = 8;
    /// Offset of the length word.
    pub const LENGTH_OFFSET: u32 = 16;
    /// Offset of the character bytes.
    pub const VALUE_OFFSET: u32 = 24;

    /// Allocate a string of `length` uninitialized bytes.
    ///
    /// The caller fills the bytes before the string is read or hashed.
    pub fn new(heap: &mut Heap, tenure: Tenure, length: u32) -> HString {
        let addr = heap.allocate_tagged(HeapTag::String, tenure, 16 + length);
        unsafe {
            write_word(addr, Self::HASH_OFFSET, 0);
            write_word(addr, Self::LENGTH_OFFSET, length as u64);
            HString(HValue::from_addr(addr))
        }
    }

    /// Allocate a string initialized from `bytes`.
    pub fn new_from(heap: &mut Heap, tenure: Tenure, bytes: &[u8]) -> HString {
        let string = Self::new(heap, tenure, bytes.len() as u32);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                string.addr().add(Self::VALUE_OFFSET as usize),
                bytes.len(),
            );
        }
        string
    }

    /// The underlying object view.
    #[inline]
    pub fn as_hvalue(self) -> HValue {
        self.0
    }

    fn addr(self) -> *mut u8 {
        self.0.addr()
    }

    /// Length in bytes.
    pub fn length(self) -> u32 {
        unsafe { read_word(self.addr(), Self::LENGTH_OFFSET) as u32 }
    }

    /// The character bytes.
    pub fn bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.addr().add(Self::VALUE_OFFSET as usize),
                self.length() as usize,
            )
        }
    }

    /// The string's 32-bit hash, computed on first use and cached.
    ///
    /// The cache slot uses 0 for "uncomputed", so a computed hash of 0 is
    /// stored as 1; every nonempty string therefore hashes nonzero.
    pub fn hash(self) -> u32 {
        let cached = unsafe { read_word(self.addr(), Self::HASH_OFFSET) as u32 };
        if cached != 0 {
            return cached;
        }
        let mut hash = hash_bytes(self.bytes());
        if hash == 0 {
            hash = 1;
        }
        unsafe { write_word(self.addr(), Self::HASH_OFFSET, hash as u64) };
        hash
    }
}

/// Object: `+8` mask, `+16` map pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HObject(HValue);

impl HObject {
    /// Offset of the mask (`(capacity - 1) * 8`).
    pub const MASK_OFFSET: u32 = 8;
    /// Offset of the map pointer.
    pub const MAP_OFFSET: u32 = 16;

    /// Allocate an empty object with the default map capacity.
    pub fn new_empty(heap: &mut Heap) -> HObject {
        Self::new_with_capacity(heap, crate::defaults::INITIAL_MAP_CAPACITY)
    }

    /// Allocate an empty object with a map of `capacity` slots.
    ///
    /// Literal sites overprovision with `next_power_of_two(2 * n)` so the
    /// table starts at most half full.
    pub fn new_with_capacity(heap: &mut Heap, capacity: u32) -> HObject {
        assert!(capacity.is_power_of_two());
        let addr = heap.allocate_tagged(HeapTag::Object, Tenure::New, 16);
        let map = HMap::new(heap, capacity);
        unsafe {
            write_word(addr, Self::MASK_OFFSET, ((capacity - 1) * 8) as u64);
            write_word(addr, Self::MAP_OFFSET, map.as_hvalue().to_value().raw());
            HObject(HValue::from_addr(addr))
        }
    }

    /// The underlying object view.
    #[inline]
    pub fn as_hvalue(self) -> HValue {
        self.0
    }

    fn addr(self) -> *mut u8 {
        self.0.addr()
    }

    /// The probe mask, kept equal to `(map capacity - 1) * 8`.
    pub fn mask(self) -> u64 {
        unsafe { read_word(self.addr(), Self::MASK_OFFSET) }
    }

    /// The backing map.
    pub fn map(self) -> HMap {
        Value::from_raw(unsafe { read_word(self.addr(), Self::MAP_OFFSET) })
            .as_ptr()
            .map(|addr| unsafe { HValue::from_addr(addr) }.as_map())
            .expect("object must hold a map pointer")
    }
}

/// Array: object layout plus a raw length word at `+24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HArray(HValue);

impl HArray {
    /// Offset of the mask.
    pub const MASK_OFFSET: u32 = 8;
    /// Offset of the map pointer.
    pub const MAP_OFFSET: u32 = 16;
    /// Offset of the length.
    pub const LENGTH_OFFSET: u32 = 24;

    /// Allocate an empty array with the default map capacity.
    pub fn new_empty(heap: &mut Heap) -> HArray {
        Self::new_with_capacity(heap, crate::defaults::INITIAL_MAP_CAPACITY)
    }

    /// Allocate an empty array with a map of `capacity` slots.
    pub fn new_with_capacity(heap: &mut Heap, capacity: u32) -> HArray {
        assert!(capacity.is_power_of_two());
        let addr = heap.allocate_tagged(HeapTag::Array, Tenure::New, 24);
        let map = HMap::new(heap, capacity);
        unsafe {
            write_word(addr, Self::MASK_OFFSET, ((capacity - 1) * 8) as u64);
            write_word(addr, Self::MAP_OFFSET, map.as_hvalue().to_value().raw());
            write_word(addr, Self::LENGTH_OFFSET, 0);
            HArray(HValue::from_addr(addr))
        }
    }

    /// The underlying object view.
    #[inline]
    pub fn as_hvalue(self) -> HValue {
        self.0
    }

    fn addr(self) -> *mut u8 {
        self.0.addr()
    }

    /// The probe mask.
    pub fn mask(self) -> u64 {
        unsafe { read_word(self.addr(), Self::MASK_OFFSET) }
    }

    /// The backing map.
    pub fn map(self) -> HMap {
        Value::from_raw(unsafe { read_word(self.addr(), Self::MAP_OFFSET) })
            .as_ptr()
            .map(|addr| unsafe { HValue::from_addr(addr) }.as_map())
            .expect("array must hold a map pointer")
    }

    /// The array length.
    ///
    /// With `shrink` set, walks backward from the stored length across nil
    /// tail entries and rewrites the length field. This is the only accessor
    /// that mutates.
    pub fn length(self, shrink: bool) -> i64 {
        let stored = unsafe { read_word(self.addr(), Self::LENGTH_OFFSET) as i64 };
        if !shrink {
            return stored;
        }

        let mut last = stored;
        loop {
            if last < 0 {
                break;
            }
            last -= 1;
            if last < 0 {
                break;
            }
            let entry = find_property(self.0, Value::tag_int(last))
                .map(|slot| slot.value())
                .unwrap_or(Value::nil());
            if !entry.is_nil() {
                break;
            }
        }

        let shrunk = last + 1;
        if shrunk != stored {
            self.set_length(shrunk);
        }
        shrunk
    }

    /// Overwrite the stored length.
    pub fn set_length(self, length: i64) {
        unsafe { write_word(self.addr(), Self::LENGTH_OFFSET, length as u64) };
    }
}

/// Open-addressed probe table: `+8` capacity, `+16` key words followed by
/// value words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HMap(HValue);

impl HMap {
    /// Offset of the capacity word.
    pub const CAPACITY_OFFSET: u32 = 8;
    /// Offset of the slot area (keys first, then values).
    pub const SPACE_OFFSET: u32 = 16;

    /// Allocate a map of `capacity` key/value slot pairs, all vacant.
    pub fn new(heap: &mut Heap, capacity: u32) -> HMap {
        assert!(capacity.is_power_of_two());
        let addr = heap.allocate_tagged(HeapTag::Map, Tenure::New, 8 + capacity * 16);
        unsafe {
            write_word(addr, Self::CAPACITY_OFFSET, capacity as u64);
            for index in 0..capacity * 2 {
                write_word(addr, Self::SPACE_OFFSET + index * 8, Value::nil().raw());
            }
            HMap(HValue::from_addr(addr))
        }
    }

    /// The underlying object view.
    #[inline]
    pub fn as_hvalue(self) -> HValue {
        self.0
    }

    fn addr(self) -> *mut u8 {
        self.0.addr()
    }

    /// Number of key/value slot pairs.
    pub fn capacity(self) -> u32 {
        unsafe { read_word(self.addr(), Self::CAPACITY_OFFSET) as u32 }
    }

    /// Read key slot `index`.
    pub fn key(self, index: u32) -> Value {
        debug_assert!(index < self.capacity());
        Value::from_raw(unsafe { read_word(self.addr(), Self::SPACE_OFFSET + index * 8) })
    }

    /// Write key slot `index`.
    pub fn set_key(self, index: u32, key: Value) {
        debug_assert!(index < self.capacity());
        unsafe { write_word(self.addr(), Self::SPACE_OFFSET + index * 8, key.raw()) };
    }

    /// Read value slot `index`.
    pub fn value(self, index: u32) -> Value {
        debug_assert!(index < self.capacity());
        Value::from_raw(unsafe {
            read_word(self.addr(), Self::SPACE_OFFSET + (self.capacity() + index) * 8)
        })
    }

    /// Write value slot `index`.
    pub fn set_value(self, index: u32, value: Value) {
        debug_assert!(index < self.capacity());
        unsafe {
            write_word(
                self.addr(),
                Self::SPACE_OFFSET + (self.capacity() + index) * 8,
                value.raw(),
            )
        };
    }

    /// Is key slot `index` vacant?
    pub fn is_empty_slot(self, index: u32) -> bool {
        self.key(index).is_nil()
    }

    /// Raw address of value slot `index`.
    pub fn value_slot_address(self, index: u32) -> *mut Value {
        debug_assert!(index < self.capacity());
        unsafe {
            self.addr()
                .add((Self::SPACE_OFFSET + (self.capacity() + index) * 8) as usize)
                as *mut Value
        }
    }
}

/// Opaque foreign data: `+8` payload size, `+16` payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HCData(HValue);

impl HCData {
    /// Offset of the payload size.
    pub const SIZE_OFFSET: u32 = 8;
    /// Offset of the payload bytes.
    pub const DATA_OFFSET: u32 = 16;

    /// Allocate `size` bytes of zeroed foreign payload.
    pub fn new(heap: &mut Heap, size: u32) -> HCData {
        let addr = heap.allocate_tagged(HeapTag::CData, Tenure::New, 8 + size);
        unsafe {
            write_word(addr, Self::SIZE_OFFSET, size as u64);
            std::ptr::write_bytes(addr.add(Self::DATA_OFFSET as usize), 0, size as usize);
            HCData(HValue::from_addr(addr))
        }
    }

    /// The underlying object view.
    #[inline]
    pub fn as_hvalue(self) -> HValue {
        self.0
    }

    fn addr(self) -> *mut u8 {
        self.0.addr()
    }

    /// Payload size in bytes.
    pub fn size(self) -> u32 {
        unsafe { read_word(self.addr(), Self::SIZE_OFFSET) as u32 }
    }

    /// The payload bytes.
    pub fn data(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.addr().add(Self::DATA_OFFSET as usize),
                self.size() as usize,
            )
        }
    }

    /// The payload bytes, writable.
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.addr().add(Self::DATA_OFFSET as usize),
                self.size() as usize,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::OLD_SPACE_GENERATION;

    fn test_heap() -> Box<Heap> {
        Heap::new(4096)
    }

    #[test]
    fn test_context_layout() {
        let mut heap = test_heap();
        let values = [Value::tag_int(10), Value::tag_int(20), Value::nil()];
        let context = HContext::new(&mut heap, &values);

        assert_eq!(context.as_hvalue().tag(), HeapTag::Context);
        assert!(!context.has_parent());
        assert_eq!(context.slot_count(), 3);
        assert_eq!(context.slot(0), Value::tag_int(10));
        assert_eq!(context.slot(1), Value::tag_int(20));
        assert!(context.slot(2).is_nil());
        assert!(context.has_slot(2));
        assert!(!context.has_slot(3));
    }

    #[test]
    fn test_context_is_tenured() {
        let mut heap = test_heap();
        let context = HContext::new(&mut heap, &[]);
        assert!(heap.old_space().contains(context.as_hvalue().addr()));
        assert_eq!(context.as_hvalue().generation(), OLD_SPACE_GENERATION);
    }

    #[test]
    fn test_context_parent_chain() {
        let mut heap = test_heap();
        let root = HContext::new(&mut heap, &[]);
        let leaf = HContext::new(&mut heap, &[Value::nil()]);
        leaf.set_parent(root.as_hvalue().to_value());

        assert!(leaf.has_parent());
        let parent = HValue::from_value(leaf.parent()).unwrap().as_context();
        assert_eq!(parent, root);
        assert!(!parent.has_parent());
    }

    #[test]
    fn test_context_slot_address_writes_through() {
        let mut heap = test_heap();
        let context = HContext::new(&mut heap, &[Value::nil()]);
        unsafe { context.slot_address(0).write(Value::tag_int(5)) };
        assert_eq!(context.slot(0), Value::tag_int(5));
    }

    #[test]
    fn test_function_layout() {
        let mut heap = test_heap();
        let root = HContext::new(&mut heap, &[]).as_hvalue().to_value();
        let function = HFunction::new(&mut heap, Value::nil(), 0xdead_beef, root);

        assert_eq!(function.as_hvalue().tag(), HeapTag::Function);
        assert!(function.parent().is_nil());
        assert_eq!(function.code(), 0xdead_beef);
        assert_eq!(function.root(), root);
        assert_eq!(function.as_hvalue().copy_size(), 32);
    }

    #[test]
    fn test_binding_function_parent_marker() {
        let mut heap = test_heap();
        let function = HFunction::new_binding(&mut heap, 0x1000, Value::nil());
        assert!(function.parent().is_binding_marker());

        // Rewiring replaces the marker like any other parent.
        let context = HContext::new(&mut heap, &[]);
        function.set_parent(context.as_hvalue().to_value());
        let rewired = HValue::from_value(function.as_hvalue().to_value())
            .unwrap()
            .as_function();
        assert_eq!(rewired.parent(), context.as_hvalue().to_value());
    }

    #[test]
    fn test_number_boxing() {
        let mut heap = test_heap();
        let number = HNumber::new(&mut heap, Tenure::New, 2.5);
        assert_eq!(number.value(), 2.5);
        assert_eq!(number.as_hvalue().copy_size(), 16);

        let boxed = number.as_hvalue().to_value();
        assert_eq!(HNumber::double_value(boxed), 2.5);
        assert_eq!(HNumber::integral_value(boxed), 2);
    }

    #[test]
    fn test_number_unboxed_conversions() {
        assert_eq!(HNumber::integral_value(Value::tag_int(-7)), -7);
        assert_eq!(HNumber::double_value(Value::tag_int(-7)), -7.0);
    }

    #[test]
    fn test_boolean_values() {
        let mut heap = test_heap();
        let yes = HBoolean::new(&mut heap, Tenure::New, true);
        let no = HBoolean::new(&mut heap, Tenure::New, false);
        assert!(yes.is_true());
        assert!(no.is_false());
        assert_eq!(yes.as_hvalue().tag(), HeapTag::Boolean);
        assert!(HValue::from_value(yes.as_hvalue().to_value())
            .unwrap()
            .as_boolean()
            .value());
    }

    #[test]
    fn test_string_bytes_and_length() {
        let mut heap = test_heap();
        let string = HString::new_from(&mut heap, Tenure::New, b"hello");
        assert_eq!(string.length(), 5);
        assert_eq!(string.bytes(), b"hello");
        assert_eq!(string.as_hvalue().copy_size(), 29);
    }

    #[test]
    fn test_string_hash_is_lazy_and_cached() {
        let mut heap = test_heap();
        let string = HString::new_from(&mut heap, Tenure::New, b"key");
        let cached_before =
            unsafe { read_word(string.as_hvalue().addr(), HString::HASH_OFFSET) as u32 };
        assert_eq!(cached_before, 0);

        let hash = string.hash();
        assert_ne!(hash, 0);
        let cached_after =
            unsafe { read_word(string.as_hvalue().addr(), HString::HASH_OFFSET) as u32 };
        assert_eq!(cached_after, hash);
        assert_eq!(string.hash(), hash);
    }

    #[test]
    fn test_string_hash_matches_content() {
        let mut heap = test_heap();
        let a = HString::new_from(&mut heap, Tenure::New, b"same");
        let b = HString::new_from(&mut heap, Tenure::New, b"same");
        assert_eq!(a.hash(), b.hash());

        let c = HString::new_from(&mut heap, Tenure::New, b"other");
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_empty_object_shape() {
        let mut heap = test_heap();
        let object = HObject::new_empty(&mut heap);
        let map = object.map();

        assert_eq!(map.capacity(), crate::defaults::INITIAL_MAP_CAPACITY);
        assert_eq!(object.mask(), ((map.capacity() - 1) * 8) as u64);
        for index in 0..map.capacity() {
            assert!(map.is_empty_slot(index));
            assert!(map.value(index).is_nil());
        }
    }

    #[test]
    fn test_empty_array_shape() {
        let mut heap = test_heap();
        let array = HArray::new_empty(&mut heap);
        assert_eq!(array.length(false), 0);
        assert_eq!(array.as_hvalue().copy_size(), 32);
        assert!(array.map().capacity().is_power_of_two());
        assert_eq!(
            HValue::from_value(array.as_hvalue().to_value())
                .unwrap()
                .as_array(),
            array
        );
    }

    #[test]
    fn test_array_length_shrinks_over_nil_tail() {
        let mut heap = test_heap();
        let array = HArray::new_empty(&mut heap);
        let holder = array.as_hvalue();

        insert_property(&mut heap, holder, Value::tag_int(0)).set_value(Value::tag_int(1));
        insert_property(&mut heap, holder, Value::tag_int(1)).set_value(Value::nil());
        insert_property(&mut heap, holder, Value::tag_int(2)).set_value(Value::nil());
        array.set_length(3);

        assert_eq!(array.length(false), 3);
        assert_eq!(array.length(true), 1);
        // The shrink is persisted.
        assert_eq!(array.length(false), 1);
    }

    #[test]
    fn test_array_of_only_nils_shrinks_to_zero() {
        let mut heap = test_heap();
        let array = HArray::new_empty(&mut heap);
        array.set_length(3);
        assert_eq!(array.length(true), 0);
    }

    #[test]
    fn test_negative_indices_do_not_affect_length() {
        let mut heap = test_heap();
        let array = HArray::new_empty(&mut heap);
        let holder = array.as_hvalue();

        insert_property(&mut heap, holder, Value::tag_int(-1)).set_value(Value::tag_int(9));
        insert_property(&mut heap, holder, Value::tag_int(0)).set_value(Value::tag_int(1));
        array.set_length(1);

        assert_eq!(array.length(true), 1);
        assert_eq!(
            find_property(holder, Value::tag_int(-1)).unwrap().value(),
            Value::tag_int(9)
        );
    }

    #[test]
    fn test_map_slot_accessors() {
        let mut heap = test_heap();
        let map = HMap::new(&mut heap, 8);
        assert_eq!(map.capacity(), 8);

        map.set_key(3, Value::tag_int(7));
        map.set_value(3, Value::tag_int(70));
        assert!(!map.is_empty_slot(3));
        assert_eq!(map.key(3), Value::tag_int(7));
        assert_eq!(map.value(3), Value::tag_int(70));
        assert_eq!(map.as_hvalue().copy_size(), 16 + 8 * 16);
    }

    #[test]
    fn test_cdata_payload() {
        let mut heap = test_heap();
        let mut cdata = HCData::new(&mut heap, 12);
        assert_eq!(cdata.size(), 12);
        assert!(cdata.data().iter().all(|&b| b == 0));

        cdata.data_mut().copy_from_slice(b"foreign data");
        assert_eq!(cdata.data(), b"foreign data");
        assert_eq!(cdata.as_hvalue().copy_size(), 28);
    }

    #[test]
    fn test_generation_increments_and_saturates() {
        let mut heap = test_heap();
        let object = HBoolean::new(&mut heap, Tenure::New, true).as_hvalue();
        assert_eq!(object.generation(), 0);

        object.increment_generation();
        assert_eq!(object.generation(), 1);

        for _ in 0..300 {
            object.increment_generation();
        }
        assert_eq!(object.generation(), u8::MAX);
        assert_eq!(object.tag(), HeapTag::Boolean);
    }

    #[test]
    fn test_gc_mark_round_trip() {
        let mut heap = test_heap();
        let object = HString::new_from(&mut heap, Tenure::New, b"move me").as_hvalue();
        let target = HString::new_from(&mut heap, Tenure::New, b"target").as_hvalue();

        assert!(!object.is_gc_marked());
        object.set_gc_mark(target.addr());
        assert!(object.is_gc_marked());
        assert_eq!(object.get_gc_mark(), target.addr());
        // Tag and generation survive the mark.
        assert_eq!(object.tag(), HeapTag::String);
        assert_eq!(object.generation(), 0);

        object.reset_gc_mark();
        assert!(!object.is_gc_marked());
        assert_eq!(object.tag(), HeapTag::String);
        assert_eq!(object.as_string().bytes(), b"move me");
    }

    #[test]
    fn test_copy_size_for_context_counts_slots() {
        let mut heap = test_heap();
        let context = HContext::new(&mut heap, &[Value::nil(); 4]);
        assert_eq!(context.as_hvalue().copy_size(), 24 + 4 * 8);
    }

    #[test]
    #[should_panic]
    fn test_kind_dispatch_is_checked() {
        let mut heap = test_heap();
        let number = HNumber::new(&mut heap, Tenure::New, 1.0);
        number.as_hvalue().as_string();
    }
}
