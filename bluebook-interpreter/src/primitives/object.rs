use bluebook_value::Oop;

use crate::interpreter::Interpreter;
use crate::primitives::{answer, expect_args, index_into, small_integer, PrimitiveError, PrimitiveInfo};
use crate::universe::Universe;

pub const PRIMITIVES: &[PrimitiveInfo] = &[
    PrimitiveInfo { index: 70, name: "Behavior>>#basicNew", function: basic_new },
    PrimitiveInfo { index: 71, name: "Behavior>>#basicNew:", function: basic_new_with_size },
    PrimitiveInfo { index: 73, name: "Object>>#instVarAt:", function: inst_var_at },
    PrimitiveInfo { index: 74, name: "Object>>#instVarAt:put:", function: inst_var_at_put },
    PrimitiveInfo { index: 75, name: "Object>>#identityHash", function: identity_hash },
    PrimitiveInfo { index: 90, name: "Character>>#value", function: character_value },
    PrimitiveInfo { index: 109, name: "Object>>#~=", function: not_identical },
    PrimitiveInfo { index: 110, name: "Object>>#==", function: identical },
    PrimitiveInfo { index: 111, name: "Object>>#class", function: class },
];

fn basic_new(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 0)?;
    let class = interpreter.stack_top(&universe.heap);
    let instance = universe.instantiate(interpreter, class, 0).ok_or(PrimitiveError::Failed)?;
    answer(interpreter, universe, arg_count, instance)
}

fn basic_new_with_size(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 1)?;
    let heap = &universe.heap;
    let class = interpreter.stack_value(heap, 1);
    let len = usize::try_from(small_integer(interpreter.stack_value(heap, 0))?).map_err(|_| PrimitiveError::Failed)?;
    let instance = universe.instantiate(interpreter, class, len).ok_or(PrimitiveError::Failed)?;
    answer(interpreter, universe, arg_count, instance)
}

fn inst_var_at(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 1)?;
    let heap = &universe.heap;
    let receiver = interpreter.stack_value(heap, 1);
    if !receiver.is_pointer() {
        return Err(PrimitiveError::Failed);
    }
    let index = index_into(interpreter.stack_value(heap, 0), heap.fixed_fields(receiver))?;
    let value = heap.fetch_pointer(receiver, index);
    answer(interpreter, universe, arg_count, value)
}

fn inst_var_at_put(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 2)?;
    let heap = &universe.heap;
    let receiver = interpreter.stack_value(heap, 2);
    if !receiver.is_pointer() {
        return Err(PrimitiveError::Failed);
    }
    let index = index_into(interpreter.stack_value(heap, 1), heap.fixed_fields(receiver))?;
    let value = interpreter.stack_value(heap, 0);
    universe.heap.store_pointer(receiver, index, value);
    answer(interpreter, universe, arg_count, value)
}

fn identity_hash(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 0)?;
    let receiver = interpreter.stack_top(&universe.heap);
    let hash = if receiver.is_pointer() {
        universe.heap.identity_hash(receiver) as i64
    } else if receiver.is_character() {
        receiver.as_char_code() as i64
    } else {
        small_integer(receiver)?
    };
    answer(interpreter, universe, arg_count, Oop::from_small_integer(hash))
}

fn character_value(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 0)?;
    let receiver = interpreter.stack_top(&universe.heap);
    if !receiver.is_character() {
        return Err(PrimitiveError::Failed);
    }
    answer(interpreter, universe, arg_count, Oop::from_small_integer(receiver.as_char_code() as i64))
}

fn identical(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 1)?;
    let heap = &universe.heap;
    let result = universe.boolean(interpreter.stack_value(heap, 1) == interpreter.stack_value(heap, 0));
    answer(interpreter, universe, arg_count, result)
}

fn not_identical(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 1)?;
    let heap = &universe.heap;
    let result = universe.boolean(interpreter.stack_value(heap, 1) != interpreter.stack_value(heap, 0));
    answer(interpreter, universe, arg_count, result)
}

fn class(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 0)?;
    let class = universe.class_of(interpreter.stack_top(&universe.heap));
    answer(interpreter, universe, arg_count, class)
}
