use bluebook_value::Oop;

use crate::interpreter::Interpreter;
use crate::primitives::{answer, expect_args, small_integer, PrimitiveError, PrimitiveInfo};
use crate::universe::Universe;

pub const PRIMITIVES: &[PrimitiveInfo] = &[
    PrimitiveInfo { index: 1, name: "SmallInteger>>#+", function: add },
    PrimitiveInfo { index: 2, name: "SmallInteger>>#-", function: subtract },
    PrimitiveInfo { index: 3, name: "SmallInteger>>#<", function: less_than },
    PrimitiveInfo { index: 4, name: "SmallInteger>>#>", function: greater_than },
    PrimitiveInfo { index: 5, name: "SmallInteger>>#<=", function: less_or_equal },
    PrimitiveInfo { index: 6, name: "SmallInteger>>#>=", function: greater_or_equal },
    PrimitiveInfo { index: 7, name: "SmallInteger>>#=", function: equal },
    PrimitiveInfo { index: 8, name: "SmallInteger>>#~=", function: not_equal },
    PrimitiveInfo { index: 9, name: "SmallInteger>>#*", function: multiply },
    PrimitiveInfo { index: 10, name: "SmallInteger>>#/", function: divide },
    PrimitiveInfo { index: 11, name: "SmallInteger>>#\\\\", function: modulo },
    PrimitiveInfo { index: 12, name: "SmallInteger>>#//", function: integer_divide },
    PrimitiveInfo { index: 13, name: "SmallInteger>>#quo:", function: quotient },
    PrimitiveInfo { index: 14, name: "SmallInteger>>#bitAnd:", function: bit_and },
    PrimitiveInfo { index: 15, name: "SmallInteger>>#bitOr:", function: bit_or },
    PrimitiveInfo { index: 16, name: "SmallInteger>>#bitXor:", function: bit_xor },
    PrimitiveInfo { index: 17, name: "SmallInteger>>#bitShift:", function: bit_shift },
    PrimitiveInfo { index: 18, name: "SmallInteger>>#asFloat", function: as_float },
    PrimitiveInfo { index: 19, name: "SmallInteger>>#asCharacter", function: as_character },
];

/// `a / b` when it divides evenly.
pub(crate) fn exact_quotient(a: i64, b: i64) -> Option<i64> {
    (b != 0 && a % b == 0).then(|| a / b)
}

/// Quotient rounded towards negative infinity.
pub(crate) fn floored_quotient(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let quotient = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Some(quotient - 1)
    } else {
        Some(quotient)
    }
}

/// Remainder with the sign of the divisor.
pub(crate) fn floored_modulo(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let remainder = a % b;
    if remainder != 0 && ((remainder < 0) != (b < 0)) {
        Some(remainder + b)
    } else {
        Some(remainder)
    }
}

/// Shifts left for a positive count, right otherwise. `None` if bits would be lost.
pub(crate) fn shifted(value: i64, count: i64) -> Option<i64> {
    if count >= 0 {
        if count >= i64::BITS as i64 - 1 {
            return (value == 0).then_some(0);
        }
        let result = value << count;
        (result >> count == value).then_some(result)
    } else {
        Some(value >> count.unsigned_abs().min(i64::BITS as u64 - 1))
    }
}

fn operands(interpreter: &Interpreter, universe: &Universe, arg_count: usize) -> Result<(i64, i64), PrimitiveError> {
    expect_args(arg_count, 1)?;
    let heap = &universe.heap;
    let receiver = small_integer(interpreter.stack_value(heap, 1))?;
    let argument = small_integer(interpreter.stack_value(heap, 0))?;
    Ok((receiver, argument))
}

macro_rules! arithmetic {
    ($name:ident, $operation:expr) => {
        fn $name(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
            let (a, b) = operands(interpreter, universe, arg_count)?;
            let operation: fn(i64, i64) -> Option<i64> = $operation;
            let result = operation(a, b)
                .and_then(Oop::try_from_small_integer)
                .ok_or(PrimitiveError::Failed)?;
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

arithmetic!(add, i64::checked_add);
arithmetic!(subtract, i64::checked_sub);
arithmetic!(multiply, i64::checked_mul);
arithmetic!(divide, exact_quotient);
arithmetic!(modulo, floored_modulo);
arithmetic!(integer_divide, floored_quotient);
arithmetic!(quotient, |a, b| if b == 0 { None } else { Some(a / b) });
arithmetic!(bit_and, |a, b| Some(a & b));
arithmetic!(bit_or, |a, b| Some(a | b));
arithmetic!(bit_xor, |a, b| Some(a ^ b));
arithmetic!(bit_shift, shifted);

comparison!(less_than, <);
comparison!(greater_than, >);
comparison!(less_or_equal, <=);
comparison!(greater_or_equal, >=);
comparison!(equal, ==);
comparison!(not_equal, !=);

fn as_float(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 0)?;
    let value = small_integer(interpreter.stack_top(&universe.heap))?;
    let float = universe.new_float(interpreter, value as f64);
    answer(interpreter, universe, arg_count, float)
}

fn as_character(interpreter: &mut Interpreter, universe: &mut Universe, arg_count: usize) -> Result<(), PrimitiveError> {
    expect_args(arg_count, 0)?;
    let value = small_integer(interpreter.stack_top(&universe.heap))?;
    let character = u32::try_from(value)
        .ok()
        .and_then(char::from_u32)
        .ok_or(PrimitiveError::Failed)?;
    answer(interpreter, universe, arg_count, Oop::from_char(character))
}
