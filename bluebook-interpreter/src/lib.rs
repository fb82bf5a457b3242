//!
//! A Blue Book style Smalltalk virtual machine: a byte-code interpreter running over a
//! mark-compact object heap.
//!

/// Objects the interpreter knows the layout of.
pub mod vm_objects;

/// Assembling compiled methods.
pub mod builder;
/// Used for debugging.
pub mod debug;
/// Small programs exercising the virtual machine.
pub mod demos;
/// The interpreter's main data structure.
pub mod interpreter;
/// The cache of method lookups.
pub mod method_cache;
/// Definitions for all supported primitives.
pub mod primitives;
/// The heap and the well-known objects of a virtual machine instance.
pub mod universe;

mod bootstrap;

pub use bootstrap::selector_arg_count;
