use bluebook_value::Oop;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive};

use crate::interpreter::Interpreter;
use crate::primitives::{answer, expect_args, PrimitiveError, PrimitiveInfo};
use crate::universe::Universe;

pub const PRIMITIVES: &[PrimitiveInfo] = &[
    PrimitiveInfo { index: 41, name: "Float>>#+", function: add },
    PrimitiveInfo { index: 42, name: "Float>>#-", function: subtract },
    PrimitiveInfo { index: 43, name: "Float>>#<", function: less_than },
    PrimitiveInfo { index: 44, name: "Float>>#>", function: greater_than },
    PrimitiveInfo { index: 45, name: "Float>>#<=", function: less_or_equal },
    PrimitiveInfo { index: 46, name: "Float>>#>=", function: greater_or_equal },
    PrimitiveInfo { index: 47, name: "Float>>#=", function: equal },
    PrimitiveInfo { index: 48, name: "Float>>#~=", function: not_equal },
    PrimitiveInfo { index: 49, name: "Float>>#*", function: multiply },
    PrimitiveInfo { index: 50, name: "Float>>#/", function: divide },
    PrimitiveInfo { index: 51, name: "Float>>#truncated", function: truncated },
    PrimitiveInfo { index: 52, name: "Float>>#printString", function: print_string },
];

/// The value of a float, or of an integer coerced to one.
fn coerce(universe: &Universe, oop: Oop) -> Result<f64, PrimitiveError> {
    if universe.is_float(oop) {
        return Ok(universe.heap.float_value(oop));
    }
    universe
        .integer_value(oop)
        .and_then(|value| value.to_f64())
        .ok_or(PrimitiveError::Failed)
}

fn receiver(interpreter: &Interpreter, universe: &Universe, depth: usize) -> Result<f64, PrimitiveError> {
    let receiver = interpreter.stack_value(&universe.heap, depth);
    if !universe.is_float(receiver) {
        return Err(PrimitiveError::Failed);
    }
    Ok(universe.heap.float_value(receiver))
}

fn operands(interpreter: &Interpreter, universe: &Universe, arg_count: usize) -> Result<(f64, f64), PrimitiveError> {
    expect_args(arg_count, 1)?;
    let receiver = receiver(interpreter, universe, 1)?;
    let argument = coerce(universe, interpreter.stack_value(&universe.heap, 0))?;
    Ok((receiver, argument))
}

macro_rules! arithmetic {
    ($name:ident, $op:tt) => {
        fn $name(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
            let (a, b) = operands(interpreter, universe, arg_count)?;
            let result = universe.new_float(interpreter, a $op b);
            answer(interpreter, universe, arg_count, result)
        }
    };
}

macro_rules! comparison {
    ($name:ident, $op:tt) => {
        fn $name(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
            let (a, b) = operands(interpreter, universe, arg_count)?;
            let result = universe.boolean(a $op b);
            answer(interpreter, universe, arg_count, result)
        }
    };
}

arithmetic!(add, +);
arithmetic!(subtract, -);
arithmetic!(multiply, *);

comparison!(less_than, <);
comparison!(greater_than, >);
comparison!(less_or_equal, <=);
comparison!(greater_or_equal, >=);
comparison!(equal, ==);
comparison!(not_equal, !=);

fn divide(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    let (a, b) = operands(interpreter, universe, arg_count)?;
    if b == 0.0 {
        return Err(PrimitiveError::Failed);
    }
    let result = universe.new_float(interpreter, a / b);
    answer(interpreter, universe, arg_count, result)
}

fn truncated(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 0)?;
    let value = receiver(interpreter, universe, 0)?;
    let integer = BigInt::from_f64(value.trunc()).ok_or(PrimitiveError::Failed)?;
    let result = universe.new_integer(interpreter, integer);
    answer(interpreter, universe, arg_count, result)
}

fn print_string(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 0)?;
    let value = receiver(interpreter, universe, 0)?;
    let string = universe.new_string(interpreter, &format!("{value:?}"));
    answer(interpreter, universe, arg_count, string)
}
