mod block;

/// Primitives for indexable objects: **Array**, **ByteArray**, **String**, **WordArray** and
/// **FloatArray**.
pub mod array;
/// Primitives for the **Float** class.
pub mod float;
/// Primitives for the **SmallInteger** class.
pub mod integer;
/// Arbitrary-precision primitives shared by every **Integer**.
pub mod large_integer;
/// Primitives for the **Object**, **Behavior** and **Character** classes.
pub mod object;
/// Primitives for the **System** class.
pub mod system;

use bluebook_value::Oop;
use once_cell::sync::Lazy;

use crate::interpreter::Interpreter;
use crate::universe::Universe;

/// Why a primitive did not answer normally.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PrimitiveError {
    /// The operands were not what the primitive handles. The method's byte-code runs instead.
    Failed,
    /// Leave the interpreter at once, answering this value.
    Exit(Oop),
}

/// A primitive gets the number of arguments of the send; the receiver sits below them on the
/// stack. On success it pops them all and pushes its result. On failure it leaves the stack
/// untouched.
pub type PrimitiveFn = fn(&mut Interpreter, &mut Universe, usize) -> Result<(), PrimitiveError>;

#[derive(Debug, Copy, Clone)]
pub struct PrimitiveInfo {
    /// The index compiled methods refer to it by.
    pub index: usize,
    pub name: &'static str,
    pub function: PrimitiveFn,
}

const TABLE_SIZE: usize = 256;

/// Every primitive, indexed by primitive index.
static PRIMITIVES: Lazy<Box<[Option<&'static PrimitiveInfo>; TABLE_SIZE]>> = Lazy::new(|| {
    let mut table = Box::new([None; TABLE_SIZE]);
    let groups = [
        integer::PRIMITIVES,
        large_integer::PRIMITIVES,
        float::PRIMITIVES,
        array::PRIMITIVES,
        object::PRIMITIVES,
        block::PRIMITIVES,
        system::PRIMITIVES,
    ];
    for info in groups.into_iter().flatten() {
        debug_assert!(table[info.index].is_none(), "primitive {} registered twice", info.index);
        table[info.index] = Some(info);
    }
    table
});

pub fn get(index: usize) -> Option<&'static PrimitiveInfo> {
    PRIMITIVES.get(index).copied().flatten()
}

/// Runs a primitive. An index with nothing behind it fails like a primitive would.
pub fn invoke(index: usize, interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    match get(index) {
        Some(info) => (info.function)(interpreter, universe, arg_count),
        None => Err(PrimitiveError::Failed),
    }
}

fn expect_args(arg_count: usize, expected: usize) -> Result<(), PrimitiveError> {
    if arg_count != expected {
        return Err(PrimitiveError::Failed);
    }
    Ok(())
}

fn small_integer(oop: Oop) -> Result<i64, PrimitiveError> {
    if !oop.is_small_integer() {
        return Err(PrimitiveError::Failed);
    }
    Ok(oop.as_small_integer())
}

/// A one-based index into `len` elements, as a zero-based one.
fn index_into(oop: Oop, len: usize) -> Result<usize, PrimitiveError> {
    let index = small_integer(oop)?;
    if index < 1 || index as u64 > len as u64 {
        return Err(PrimitiveError::Failed);
    }
    Ok(index as usize - 1)
}

/// Replaces the receiver and arguments with the result.
fn answer(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize, value: Oop) -> Result<(), PrimitiveError> {
    interpreter.pop_n(arg_count + 1);
    interpreter.push(&mut universe.heap, value);
    Ok(())
}
