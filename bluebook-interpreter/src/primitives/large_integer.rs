use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::interpreter::Interpreter;
use crate::primitives::{answer, expect_args, PrimitiveError, PrimitiveInfo};
use crate::universe::Universe;

pub const PRIMITIVES: &[PrimitiveInfo] = &[
    PrimitiveInfo { index: 21, name: "Integer>>#+", function: add },
    PrimitiveInfo { index: 22, name: "Integer>>#-", function: subtract },
    PrimitiveInfo { index: 23, name: "Integer>>#<", function: less_than },
    PrimitiveInfo { index: 24, name: "Integer>>#>", function: greater_than },
    PrimitiveInfo { index: 25, name: "Integer>>#<=", function: less_or_equal },
    PrimitiveInfo { index: 26, name: "Integer>>#>=", function: greater_or_equal },
    PrimitiveInfo { index: 27, name: "Integer>>#=", function: equal },
    PrimitiveInfo { index: 28, name: "Integer>>#~=", function: not_equal },
    PrimitiveInfo { index: 29, name: "Integer>>#*", function: multiply },
    PrimitiveInfo { index: 30, name: "Integer>>#//", function: integer_divide },
    PrimitiveInfo { index: 31, name: "Integer>>#\\\\", function: modulo },
    PrimitiveInfo { index: 32, name: "Integer>>#/", function: divide },
    PrimitiveInfo { index: 33, name: "Integer>>#printString", function: print_string },
];

/// The operands of a binary integer primitive. A float argument turns the operation into a
/// float operation.
enum Operands {
    Integers(BigInt, BigInt),
    Floats(f64, f64),
}

fn operands(interpreter: &Interpreter, universe: &Universe, arg_count: usize) -> Result<Operands, PrimitiveError> {
    expect_args(arg_count, 1)?;
    let heap = &universe.heap;
    let receiver = universe
        .integer_value(interpreter.stack_value(heap, 1))
        .ok_or(PrimitiveError::Failed)?;
    let argument = interpreter.stack_value(heap, 0);
    if let Some(argument) = universe.integer_value(argument) {
        return Ok(Operands::Integers(receiver, argument));
    }
    if universe.is_float(argument) {
        let receiver = receiver.to_f64().ok_or(PrimitiveError::Failed)?;
        return Ok(Operands::Floats(receiver, heap.float_value(argument)));
    }
    Err(PrimitiveError::Failed)
}

/// Integer results shrink back to small integers whenever they fit.
fn answer_number(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize, result: Result<BigInt, f64>) -> Result<(), PrimitiveError> {
    let value = match result {
        Ok(integer) => universe.new_integer(interpreter, integer),
        Err(float) => universe.new_float(interpreter, float),
    };
    answer(interpreter, universe, arg_count, value)
}

macro_rules! arithmetic {
    ($name:ident, $integers:expr, $floats:expr) => {
        fn $name(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
            let integers: fn(&BigInt, &BigInt) -> Option<BigInt> = $integers;
            let floats: fn(f64, f64) -> Option<f64> = $floats;
            let result = match operands(interpreter, universe, arg_count)? {
                Operands::Integers(a, b) => Ok(integers(&a, &b).ok_or(PrimitiveError::Failed)?),
                Operands::Floats(a, b) => Err(floats(a, b).ok_or(PrimitiveError::Failed)?),
            };
            answer_number(interpreter, universe, arg_count, result)
        }
    };
}

macro_rules! comparison {
    ($name:ident, $op:tt) => {
        fn $name(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
            let result = match operands(interpreter, universe, arg_count)? {
                Operands::Integers(a, b) => a $op b,
                Operands::Floats(a, b) => a $op b,
            };
            let result = universe.boolean(result);
            answer(interpreter, universe, arg_count, result)
        }
    };
}

/// Quotient rounded towards negative infinity.
pub(crate) fn floored_quotient(a: &BigInt, b: &BigInt) -> Option<BigInt> {
    if b.is_zero() {
        return None;
    }
    let quotient = a / b;
    let remainder = a % b;
    if !remainder.is_zero() && remainder.is_negative() != b.is_negative() {
        Some(quotient - 1)
    } else {
        Some(quotient)
    }
}

/// Remainder with the sign of the divisor.
pub(crate) fn floored_modulo(a: &BigInt, b: &BigInt) -> Option<BigInt> {
    if b.is_zero() {
        return None;
    }
    let remainder = a % b;
    if !remainder.is_zero() && remainder.is_negative() != b.is_negative() {
        Some(remainder + b)
    } else {
        Some(remainder)
    }
}

arithmetic!(add, |a, b| Some(a + b), |a, b| Some(a + b));
arithmetic!(subtract, |a, b| Some(a - b), |a, b| Some(a - b));
arithmetic!(multiply, |a, b| Some(a * b), |a, b| Some(a * b));
arithmetic!(integer_divide, floored_quotient, |a, b| (b != 0.0).then(|| (a / b).floor()));
arithmetic!(modulo, floored_modulo, |a, b| (b != 0.0).then(|| a - b * (a / b).floor()));
arithmetic!(
    divide,
    |a, b| (!b.is_zero() && (a % b).is_zero()).then(|| a / b),
    |a, b| (b != 0.0).then(|| a / b)
);

comparison!(less_than, <);
comparison!(greater_than, >);
comparison!(less_or_equal, <=);
comparison!(greater_or_equal, >=);
comparison!(equal, ==);
comparison!(not_equal, !=);

fn print_string(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 0)?;
    let value = universe
        .integer_value(interpreter.stack_top(&universe.heap))
        .ok_or(PrimitiveError::Failed)?;
    let string = universe.new_string(interpreter, &value.to_string());
    answer(interpreter, universe, arg_count, string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(7, 2, 3, 1)]
    #[case(-7, 2, -4, 1)]
    #[case(7, -2, -4, -1)]
    #[case(-7, -2, 3, -1)]
    fn floored_division_matches_the_small_integer_rules(#[case] a: i64, #[case] b: i64, #[case] quotient: i64, #[case] modulo: i64) {
        let (a, b) = (BigInt::from(a), BigInt::from(b));
        assert_eq!(floored_quotient(&a, &b), Some(BigInt::from(quotient)));
        assert_eq!(floored_modulo(&a, &b), Some(BigInt::from(modulo)));
    }

    #[test]
    fn floored_division_by_zero_fails() {
        assert_eq!(floored_quotient(&BigInt::from(5), &BigInt::zero()), None);
        assert_eq!(floored_modulo(&BigInt::from(5), &BigInt::zero()), None);
    }
}
