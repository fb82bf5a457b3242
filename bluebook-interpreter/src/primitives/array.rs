use bluebook_gc::ObjectFormat;
use bluebook_value::Oop;

use crate::interpreter::Interpreter;
use crate::primitives::{answer, expect_args, index_into, small_integer, PrimitiveError, PrimitiveInfo};
use crate::universe::Universe;

pub const PRIMITIVES: &[PrimitiveInfo] = &[
    PrimitiveInfo { index: 60, name: "Object>>#at:", function: at },
    PrimitiveInfo { index: 61, name: "Object>>#at:put:", function: at_put },
    PrimitiveInfo { index: 62, name: "Object>>#size", function: size },
];

/// The format of an object whose elements the indexing primitives may touch. Contexts are
/// excluded: their tails are only meaningful up to the stack pointer.
fn indexable_format(universe: &Universe, oop: Oop) -> Result<ObjectFormat, PrimitiveError> {
    if !oop.is_pointer() {
        return Err(PrimitiveError::Failed);
    }
    match universe.heap.format(oop) {
        ObjectFormat::Plain | ObjectFormat::Context | ObjectFormat::Float | ObjectFormat::LargeInteger => Err(PrimitiveError::Failed),
        format => Ok(format),
    }
}

fn is_text(universe: &Universe, oop: Oop) -> bool {
    let class = universe.heap.class_of(oop);
    class == universe.core.string_class || class == universe.core.symbol_class
}

fn at(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 1)?;
    let heap = &universe.heap;
    let receiver = interpreter.stack_value(heap, 1);
    let format = indexable_format(universe, receiver)?;
    let index = index_into(interpreter.stack_value(heap, 0), heap.indexable_len(receiver))?;

    let value = match format {
        ObjectFormat::Array => heap.fetch_element(receiver, index),
        ObjectFormat::ByteArray => {
            let byte = heap.fetch_byte(receiver, index);
            if is_text(universe, receiver) {
                Oop::from_char(char::from(byte))
            } else {
                Oop::from_small_integer(byte as i64)
            }
        }
        ObjectFormat::WordArray => Oop::from_small_integer(heap.fetch_word_element(receiver, index) as i64),
        ObjectFormat::FloatArray => {
            let value = heap.fetch_float_element(receiver, index);
            universe.new_float(interpreter, value)
        }
        _ => return Err(PrimitiveError::Failed),
    };
    answer(interpreter, universe, arg_count, value)
}

fn at_put(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 2)?;
    let heap = &universe.heap;
    let receiver = interpreter.stack_value(heap, 2);
    let format = indexable_format(universe, receiver)?;
    let index = index_into(interpreter.stack_value(heap, 1), heap.indexable_len(receiver))?;
    let value = interpreter.stack_value(heap, 0);

    match format {
        ObjectFormat::Array => universe.heap.store_element(receiver, index, value),
        ObjectFormat::ByteArray => {
            if heap.class_of(receiver) == universe.core.symbol_class {
                return Err(PrimitiveError::Failed);
            }
            let code = if is_text(universe, receiver) {
                if !value.is_character() {
                    return Err(PrimitiveError::Failed);
                }
                value.as_char_code() as i64
            } else {
                small_integer(value)?
            };
            let byte = u8::try_from(code).map_err(|_| PrimitiveError::Failed)?;
            universe.heap.store_byte(receiver, index, byte);
        }
        ObjectFormat::WordArray => {
            let word = u32::try_from(small_integer(value)?).map_err(|_| PrimitiveError::Failed)?;
            universe.heap.store_word_element(receiver, index, word);
        }
        ObjectFormat::FloatArray => {
            let float = if universe.is_float(value) {
                heap.float_value(value)
            } else {
                small_integer(value)? as f64
            };
            universe.heap.store_float_element(receiver, index, float);
        }
        _ => return Err(PrimitiveError::Failed),
    }
    answer(interpreter, universe, arg_count, value)
}

fn size(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 0)?;
    let receiver = interpreter.stack_top(&universe.heap);
    indexable_format(universe, receiver)?;
    let len = universe.heap.indexable_len(receiver);
    answer(interpreter, universe, arg_count, Oop::from_small_integer(len as i64))
}
