use bluebook_value::Oop;
use log::debug;
use rand::distributions::Uniform;
use rand::Rng;

use crate::interpreter::Interpreter;
use crate::primitives::{answer, expect_args, small_integer, PrimitiveError, PrimitiveInfo};
use crate::universe::Universe;

pub const PRIMITIVES: &[PrimitiveInfo] = &[
    PrimitiveInfo { index: 113, name: "System class>>#exit:", function: exit },
    PrimitiveInfo { index: 114, name: "System class>>#fullGC", function: full_gc },
    PrimitiveInfo { index: 115, name: "SmallInteger>>#atRandom", function: at_random },
];

/// Ends the run, answering the argument.
fn exit(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 1)?;
    let result = interpreter.stack_top(&universe.heap);
    debug!("exiting with {}", universe.describe(result));
    Err(PrimitiveError::Exit(result))
}

/// Answers the number of bytes reclaimed.
fn full_gc(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 0)?;
    let reclaimed = universe.collect_garbage(interpreter);
    let reclaimed = Oop::try_from_small_integer(reclaimed as i64).unwrap_or(Oop::from_small_integer(Oop::SMALL_INTEGER_MAX));
    answer(interpreter, universe, arg_count, reclaimed)
}

/// A random integer between 1 and the receiver.
fn at_random(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 0)?;
    let bound = small_integer(interpreter.stack_top(&universe.heap))?;
    if bound < 1 {
        return Err(PrimitiveError::Failed);
    }
    let value = rand::thread_rng().sample(Uniform::new_inclusive(1, bound));
    answer(interpreter, universe, arg_count, Oop::from_small_integer(value))
}
