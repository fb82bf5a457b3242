use bluebook_core::MethodHeader;
use bluebook_gc::Heap;
use bluebook_value::Oop;

use crate::vm_objects::association;

pub const HEADER: usize = 0;
pub const LITERALS: usize = 1;
pub const BYTECODES: usize = 2;
pub const FIXED_FIELDS: usize = 3;

pub fn header(heap: &Heap, method: Oop) -> MethodHeader {
    MethodHeader::from_oop(heap.fetch_pointer(method, HEADER))
}

pub fn literals(heap: &Heap, method: Oop) -> Oop {
    heap.fetch_pointer(method, LITERALS)
}

pub fn literal_count(heap: &Heap, method: Oop) -> usize {
    heap.indexable_len(literals(heap, method))
}

pub fn literal(heap: &Heap, method: Oop, index: usize) -> Oop {
    heap.fetch_element(literals(heap, method), index)
}

pub fn bytecodes(heap: &Heap, method: Oop) -> Oop {
    heap.fetch_pointer(method, BYTECODES)
}

/// A copy of the method's bytecode.
pub fn bytecode_bytes(heap: &Heap, method: Oop) -> Vec<u8> {
    heap.bytes(bytecodes(heap, method))
}

/// The class the method was compiled in, taken from the association in its last literal.
/// Only methods performing super sends carry one.
pub fn method_class(heap: &Heap, method: Oop) -> Option<Oop> {
    let count = literal_count(heap, method);
    let last = literal(heap, method, count.checked_sub(1)?);
    if !last.is_pointer() || heap.fixed_fields(last) != association::FIXED_FIELDS {
        return None;
    }
    let class = heap.fetch_pointer(last, association::VALUE);
    class.is_pointer().then_some(class)
}
