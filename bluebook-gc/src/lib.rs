//!
//! The object heap of the bluebook object machine: object layout, a bump allocator over a
//! growable arena, and a mark-compact collector that slides live objects down and remaps every
//! reference to them.
//!

/// Bit vectors used by the compactor.
pub mod bitmap;
/// The mark-compact-remap collector.
pub mod collector;
/// Object formats and their size and traversal rules.
pub mod format;
/// The object header word.
pub mod header;
/// The arena, the allocator and object accessors.
pub mod heap;
/// Side table holding the values of large integers.
pub mod large_integers;
/// How the heap learns about references it does not own.
pub mod roots;

pub use collector::GcStats;
pub use format::ObjectFormat;
pub use header::Header;
pub use heap::{Heap, HeapConfig};
pub use roots::RootProvider;
