//! Debugging facilities.

/// Facilities for disassembling bytecode.
pub mod disassembler;
