use bluebook_value::Oop;

use crate::interpreter::Interpreter;
use crate::primitives::{expect_args, PrimitiveError, PrimitiveInfo};
use crate::universe::Universe;
use crate::vm_objects::context;

pub const PRIMITIVES: &[PrimitiveInfo] = &[
    PrimitiveInfo { index: 81, name: "BlockContext>>#value", function: value },
    PrimitiveInfo { index: 82, name: "BlockContext>>#valueWithArguments:", function: value_with_arguments },
];

/// The block's argument count, if `oop` is a block.
fn block_arity(universe: &Universe, oop: Oop) -> Result<usize, PrimitiveError> {
    if !oop.is_pointer() || universe.heap.class_of(oop) != universe.core.block_context_class {
        return Err(PrimitiveError::Failed);
    }
    Ok(context::block_arg_count(&universe.heap, oop))
}

/// Backs `value`, `value:`, `value:value:` and `value:value:value:`.
fn value(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    let block = interpreter.stack_value(&universe.heap, arg_count);
    expect_args(arg_count, block_arity(universe, block)?)?;
    interpreter.activate_block(universe, arg_count);
    Ok(())
}

fn value_with_arguments(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 1)?;
    let heap = &universe.heap;
    let block = interpreter.stack_value(heap, 1);
    let arity = block_arity(universe, block)?;
    let arguments = interpreter.stack_value(heap, 0);
    if !arguments.is_pointer() || heap.class_of(arguments) != universe.core.array_class || heap.indexable_len(arguments) != arity {
        return Err(PrimitiveError::Failed);
    }
    // The array's slot is reused by the first argument.
    if arity > interpreter.stack_room() + 1 {
        return Err(PrimitiveError::Failed);
    }

    interpreter.pop(heap);
    let heap = &mut universe.heap;
    for index in 0..arity {
        let argument = heap.fetch_element(arguments, index);
        interpreter.push(heap, argument);
    }
    interpreter.activate_block(universe, arity);
    Ok(())
}
