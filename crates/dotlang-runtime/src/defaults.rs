//! Default constants for heap configuration.
//!
//! Centralizes the tunables shared by the allocator, the object
//! constructors, and the collector.

/// Default page size for both spaces when none is given (64 KB).
pub const DEFAULT_PAGE_SIZE: u32 = 64 * 1024;

/// Generation at which an object is tenured into old space.
///
/// Objects allocated with [`Tenure::Old`](crate::heap::Tenure) start at this
/// generation so later copies never demote them.
pub const OLD_SPACE_GENERATION: u8 = 5;

/// Initial capacity of the probe table backing empty objects and arrays.
///
/// Must be a power of two.
pub const INITIAL_MAP_CAPACITY: u32 = 16;
