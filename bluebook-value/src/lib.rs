//!
//! The universal reference type of the bluebook object machine.
//!
//! Every slot of every heap object, every operand stack entry and every interpreter register
//! holds an [`Oop`]: either an immediate value or the offset of a heap object.
//!

/// Tagged object references (NaN boxing's smaller cousin: low-bit tagging).
pub mod oop;

pub use oop::{Oop, Tag};
