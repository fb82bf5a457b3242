//!
//! This crate contains the definitions shared by everything that produces or consumes compiled
//! methods: the bytecode set and the packed method header.
//!

/// The bytecode set, its encoding and the special selectors.
pub mod bytecode;
/// The packed header word of compiled methods.
pub mod method_header;

pub use bytecode::Bytecode;
pub use method_header::{MethodFlag, MethodHeader};
