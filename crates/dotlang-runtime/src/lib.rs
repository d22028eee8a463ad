//! dotlang runtime core
//!
//! This crate provides the managed heap backing compiled dotlang code:
//! - Tagged machine-word values (nil, unboxed integers, heap pointers)
//! - A two-space paged allocator with generational promotion
//! - Byte-exact heap object layouts shared with the code generator
//! - Open-addressed property tables for objects and arrays
//! - A stop-the-world generational collector with weak-reference callbacks
//!
//! The field offsets in [`object`] and the address returned by
//! [`Heap::needs_gc_addr`](heap::Heap::needs_gc_addr) are contracts with
//! emitted machine code; everything else is ordinary Rust API.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod defaults;
pub mod error;
pub mod heap;
pub mod object;
pub mod util;
pub mod value;

pub use error::{source_position, Error, SourceError};
pub use heap::{GcScope, GcStats, Heap, RefKind, RootStack, Tenure, WeakCallback};
pub use object::{
    find_property, insert_property, HArray, HBoolean, HCData, HContext, HFunction, HMap, HNumber,
    HObject, HString, HValue, PropertySlot,
};
pub use value::{HeapTag, Value, BINDING_CONTEXT_MARKER};
