use std::fmt;

/// Raw opcode values.
///
/// Every instruction is one opcode byte followed by zero, one or two operand bytes. Jump
/// offsets are relative to the end of the jump instruction; long offsets are big-endian.
pub mod opcodes {
    pub const PUSH_RECEIVER_VARIABLE: u8 = 0x00;
    pub const PUSH_TEMPORARY: u8 = 0x01;
    pub const PUSH_LITERAL_CONSTANT: u8 = 0x02;
    pub const PUSH_LITERAL_VARIABLE: u8 = 0x03;
    pub const STORE_RECEIVER_VARIABLE: u8 = 0x04;
    pub const STORE_TEMPORARY: u8 = 0x05;
    pub const STORE_LITERAL_VARIABLE: u8 = 0x06;
    pub const POP_INTO_RECEIVER_VARIABLE: u8 = 0x07;
    pub const POP_INTO_TEMPORARY: u8 = 0x08;
    pub const POP_INTO_LITERAL_VARIABLE: u8 = 0x09;

    pub const PUSH_SELF: u8 = 0x10;
    pub const PUSH_NIL: u8 = 0x11;
    pub const PUSH_TRUE: u8 = 0x12;
    pub const PUSH_FALSE: u8 = 0x13;
    pub const PUSH_THIS_CONTEXT: u8 = 0x14;
    pub const PUSH_MINUS_ONE: u8 = 0x15;
    pub const PUSH_ZERO: u8 = 0x16;
    pub const PUSH_ONE: u8 = 0x17;
    pub const PUSH_TWO: u8 = 0x18;
    pub const DUP: u8 = 0x19;
    pub const POP: u8 = 0x1A;

    pub const RETURN_TOP: u8 = 0x20;
    pub const RETURN_SELF: u8 = 0x21;
    pub const RETURN_NIL: u8 = 0x22;
    pub const RETURN_TRUE: u8 = 0x23;
    pub const RETURN_FALSE: u8 = 0x24;
    pub const BLOCK_RETURN: u8 = 0x25;

    pub const JUMP: u8 = 0x30;
    pub const JUMP_IF_TRUE: u8 = 0x31;
    pub const JUMP_IF_FALSE: u8 = 0x32;
    pub const LONG_JUMP: u8 = 0x33;
    pub const LONG_JUMP_IF_TRUE: u8 = 0x34;
    pub const LONG_JUMP_IF_FALSE: u8 = 0x35;

    pub const SEND: u8 = 0x40;
    pub const SUPER_SEND: u8 = 0x41;
    pub const CREATE_BLOCK: u8 = 0x48;

    /// First of the 32 single-byte special selector sends.
    pub const SEND_SPECIAL: u8 = 0x60;
    pub const SEND_SPECIAL_LAST: u8 = SEND_SPECIAL + super::SPECIAL_SELECTORS.len() as u8 - 1;
}

/// A message sent by a single-byte opcode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SpecialSelector {
    pub selector: &'static str,
    pub arg_count: u8,
}

const fn special(selector: &'static str, arg_count: u8) -> SpecialSelector {
    SpecialSelector { selector, arg_count }
}

/// The messages with their own opcode, in opcode order.
pub const SPECIAL_SELECTORS: [SpecialSelector; 32] = [
    special("+", 1),
    special("-", 1),
    special("<", 1),
    special(">", 1),
    special("<=", 1),
    special(">=", 1),
    special("=", 1),
    special("~=", 1),
    special("*", 1),
    special("/", 1),
    special("\\\\", 1),
    special("@", 1),
    special("bitShift:", 1),
    special("//", 1),
    special("bitAnd:", 1),
    special("bitOr:", 1),
    special("at:", 1),
    special("at:put:", 2),
    special("size", 0),
    special("value", 0),
    special("value:", 1),
    special("==", 1),
    special("class", 0),
    special("new", 0),
    special("new:", 1),
    special("isNil", 0),
    special("notNil", 0),
    special("value:value:", 2),
    special("bitXor:", 1),
    special("max:", 1),
    special("min:", 1),
    special("printString", 0),
];

/// Indices into [`SPECIAL_SELECTORS`].
pub mod special {
    pub const ADD: u8 = 0;
    pub const SUBTRACT: u8 = 1;
    pub const LESS_THAN: u8 = 2;
    pub const GREATER_THAN: u8 = 3;
    pub const LESS_OR_EQUAL: u8 = 4;
    pub const GREATER_OR_EQUAL: u8 = 5;
    pub const EQUAL: u8 = 6;
    pub const NOT_EQUAL: u8 = 7;
    pub const MULTIPLY: u8 = 8;
    pub const DIVIDE: u8 = 9;
    pub const MODULO: u8 = 10;
    pub const MAKE_POINT: u8 = 11;
    pub const BIT_SHIFT: u8 = 12;
    pub const INTEGER_DIVIDE: u8 = 13;
    pub const BIT_AND: u8 = 14;
    pub const BIT_OR: u8 = 15;
    pub const AT: u8 = 16;
    pub const AT_PUT: u8 = 17;
    pub const SIZE: u8 = 18;
    pub const VALUE: u8 = 19;
    pub const VALUE_1: u8 = 20;
    pub const IDENTICAL: u8 = 21;
    pub const CLASS: u8 = 22;
    pub const NEW: u8 = 23;
    pub const NEW_1: u8 = 24;
    pub const IS_NIL: u8 = 25;
    pub const NOT_NIL: u8 = 26;
    pub const VALUE_2: u8 = 27;
    pub const BIT_XOR: u8 = 28;
    pub const MAX: u8 = 29;
    pub const MIN: u8 = 30;
    pub const PRINT_STRING: u8 = 31;
}

/// Encoded width of an opcode, or `None` if the byte is not an opcode.
pub const fn opcode_width(opcode: u8) -> Option<usize> {
    use opcodes::*;
    match opcode {
        PUSH_RECEIVER_VARIABLE..=POP_INTO_LITERAL_VARIABLE => Some(2),
        PUSH_SELF..=POP | RETURN_TOP..=BLOCK_RETURN => Some(1),
        JUMP..=JUMP_IF_FALSE => Some(2),
        LONG_JUMP..=LONG_JUMP_IF_FALSE => Some(3),
        SEND | SUPER_SEND => Some(3),
        CREATE_BLOCK => Some(2),
        SEND_SPECIAL..=SEND_SPECIAL_LAST => Some(1),
        _ => None,
    }
}

/// A decoded instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Bytecode {
    PushReceiverVariable(u8),
    PushTemporary(u8),
    PushLiteralConstant(u8),
    PushLiteralVariable(u8),
    StoreReceiverVariable(u8),
    StoreTemporary(u8),
    StoreLiteralVariable(u8),
    PopIntoReceiverVariable(u8),
    PopIntoTemporary(u8),
    PopIntoLiteralVariable(u8),
    PushSelf,
    PushNil,
    PushTrue,
    PushFalse,
    PushThisContext,
    PushMinusOne,
    PushZero,
    PushOne,
    PushTwo,
    Dup,
    Pop,
    ReturnTop,
    ReturnSelf,
    ReturnNil,
    ReturnTrue,
    ReturnFalse,
    BlockReturn,
    Jump(i8),
    JumpIfTrue(i8),
    JumpIfFalse(i8),
    LongJump(i16),
    LongJumpIfTrue(i16),
    LongJumpIfFalse(i16),
    /// Send the selector at a literal index with a number of arguments.
    Send(u8, u8),
    SuperSend(u8, u8),
    /// Create a block taking a number of arguments. Must be followed by a jump over its body.
    CreateBlock(u8),
    SendSpecial(u8),
}

impl Bytecode {
    /// Decodes the instruction at `pc`. Returns `None` for unknown opcodes or truncated operands.
    pub fn decode(bytes: &[u8], pc: usize) -> Option<Self> {
        use opcodes::*;
        let opcode = *bytes.get(pc)?;
        let width = opcode_width(opcode)?;
        let operands = bytes.get(pc + 1..pc + width)?;
        let byte = || operands[0];
        let long = || i16::from_be_bytes([operands[0], operands[1]]);

        Some(match opcode {
            PUSH_RECEIVER_VARIABLE => Self::PushReceiverVariable(byte()),
            PUSH_TEMPORARY => Self::PushTemporary(byte()),
            PUSH_LITERAL_CONSTANT => Self::PushLiteralConstant(byte()),
            PUSH_LITERAL_VARIABLE => Self::PushLiteralVariable(byte()),
            STORE_RECEIVER_VARIABLE => Self::StoreReceiverVariable(byte()),
            STORE_TEMPORARY => Self::StoreTemporary(byte()),
            STORE_LITERAL_VARIABLE => Self::StoreLiteralVariable(byte()),
            POP_INTO_RECEIVER_VARIABLE => Self::PopIntoReceiverVariable(byte()),
            POP_INTO_TEMPORARY => Self::PopIntoTemporary(byte()),
            POP_INTO_LITERAL_VARIABLE => Self::PopIntoLiteralVariable(byte()),
            PUSH_SELF => Self::PushSelf,
            PUSH_NIL => Self::PushNil,
            PUSH_TRUE => Self::PushTrue,
            PUSH_FALSE => Self::PushFalse,
            PUSH_THIS_CONTEXT => Self::PushThisContext,
            PUSH_MINUS_ONE => Self::PushMinusOne,
            PUSH_ZERO => Self::PushZero,
            PUSH_ONE => Self::PushOne,
            PUSH_TWO => Self::PushTwo,
            DUP => Self::Dup,
            POP => Self::Pop,
            RETURN_TOP => Self::ReturnTop,
            RETURN_SELF => Self::ReturnSelf,
            RETURN_NIL => Self::ReturnNil,
            RETURN_TRUE => Self::ReturnTrue,
            RETURN_FALSE => Self::ReturnFalse,
            BLOCK_RETURN => Self::BlockReturn,
            JUMP => Self::Jump(byte() as i8),
            JUMP_IF_TRUE => Self::JumpIfTrue(byte() as i8),
            JUMP_IF_FALSE => Self::JumpIfFalse(byte() as i8),
            LONG_JUMP => Self::LongJump(long()),
            LONG_JUMP_IF_TRUE => Self::LongJumpIfTrue(long()),
            LONG_JUMP_IF_FALSE => Self::LongJumpIfFalse(long()),
            SEND => Self::Send(operands[0], operands[1]),
            SUPER_SEND => Self::SuperSend(operands[0], operands[1]),
            CREATE_BLOCK => Self::CreateBlock(byte()),
            _ => Self::SendSpecial(opcode - SEND_SPECIAL),
        })
    }

    pub fn opcode(self) -> u8 {
        use opcodes::*;
        match self {
            Self::PushReceiverVariable(_) => PUSH_RECEIVER_VARIABLE,
            Self::PushTemporary(_) => PUSH_TEMPORARY,
            Self::PushLiteralConstant(_) => PUSH_LITERAL_CONSTANT,
            Self::PushLiteralVariable(_) => PUSH_LITERAL_VARIABLE,
            Self::StoreReceiverVariable(_) => STORE_RECEIVER_VARIABLE,
            Self::StoreTemporary(_) => STORE_TEMPORARY,
            Self::StoreLiteralVariable(_) => STORE_LITERAL_VARIABLE,
            Self::PopIntoReceiverVariable(_) => POP_INTO_RECEIVER_VARIABLE,
            Self::PopIntoTemporary(_) => POP_INTO_TEMPORARY,
            Self::PopIntoLiteralVariable(_) => POP_INTO_LITERAL_VARIABLE,
            Self::PushSelf => PUSH_SELF,
            Self::PushNil => PUSH_NIL,
            Self::PushTrue => PUSH_TRUE,
            Self::PushFalse => PUSH_FALSE,
            Self::PushThisContext => PUSH_THIS_CONTEXT,
            Self::PushMinusOne => PUSH_MINUS_ONE,
            Self::PushZero => PUSH_ZERO,
            Self::PushOne => PUSH_ONE,
            Self::PushTwo => PUSH_TWO,
            Self::Dup => DUP,
            Self::Pop => POP,
            Self::ReturnTop => RETURN_TOP,
            Self::ReturnSelf => RETURN_SELF,
            Self::ReturnNil => RETURN_NIL,
            Self::ReturnTrue => RETURN_TRUE,
            Self::ReturnFalse => RETURN_FALSE,
            Self::BlockReturn => BLOCK_RETURN,
            Self::Jump(_) => JUMP,
            Self::JumpIfTrue(_) => JUMP_IF_TRUE,
            Self::JumpIfFalse(_) => JUMP_IF_FALSE,
            Self::LongJump(_) => LONG_JUMP,
            Self::LongJumpIfTrue(_) => LONG_JUMP_IF_TRUE,
            Self::LongJumpIfFalse(_) => LONG_JUMP_IF_FALSE,
            Self::Send(..) => SEND,
            Self::SuperSend(..) => SUPER_SEND,
            Self::CreateBlock(_) => CREATE_BLOCK,
            Self::SendSpecial(index) => SEND_SPECIAL + index,
        }
    }

    /// Appends the encoding of this instruction.
    pub fn encode(self, out: &mut Vec<u8>) {
        out.push(self.opcode());
        match self {
            Self::PushReceiverVariable(operand)
            | Self::PushTemporary(operand)
            | Self::PushLiteralConstant(operand)
            | Self::PushLiteralVariable(operand)
            | Self::StoreReceiverVariable(operand)
            | Self::StoreTemporary(operand)
            | Self::StoreLiteralVariable(operand)
            | Self::PopIntoReceiverVariable(operand)
            | Self::PopIntoTemporary(operand)
            | Self::PopIntoLiteralVariable(operand)
            | Self::CreateBlock(operand) => out.push(operand),
            Self::Jump(offset) | Self::JumpIfTrue(offset) | Self::JumpIfFalse(offset) => out.push(offset as u8),
            Self::LongJump(offset) | Self::LongJumpIfTrue(offset) | Self::LongJumpIfFalse(offset) => {
                out.extend_from_slice(&offset.to_be_bytes())
            }
            Self::Send(selector, arg_count) | Self::SuperSend(selector, arg_count) => {
                out.push(selector);
                out.push(arg_count);
            }
            _ => {}
        }
    }

    pub fn width(self) -> usize {
        match opcode_width(self.opcode()) {
            Some(width) => width,
            None => unreachable!("every decoded bytecode has a valid opcode"),
        }
    }

    /// The jump offset, if this is a jump.
    pub fn jump_offset(self) -> Option<isize> {
        match self {
            Self::Jump(offset) | Self::JumpIfTrue(offset) | Self::JumpIfFalse(offset) => Some(offset as isize),
            Self::LongJump(offset) | Self::LongJumpIfTrue(offset) | Self::LongJumpIfFalse(offset) => Some(offset as isize),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PushReceiverVariable(_) => "PUSH_RECEIVER_VARIABLE",
            Self::PushTemporary(_) => "PUSH_TEMPORARY",
            Self::PushLiteralConstant(_) => "PUSH_LITERAL_CONSTANT",
            Self::PushLiteralVariable(_) => "PUSH_LITERAL_VARIABLE",
            Self::StoreReceiverVariable(_) => "STORE_RECEIVER_VARIABLE",
            Self::StoreTemporary(_) => "STORE_TEMPORARY",
            Self::StoreLiteralVariable(_) => "STORE_LITERAL_VARIABLE",
            Self::PopIntoReceiverVariable(_) => "POP_INTO_RECEIVER_VARIABLE",
            Self::PopIntoTemporary(_) => "POP_INTO_TEMPORARY",
            Self::PopIntoLiteralVariable(_) => "POP_INTO_LITERAL_VARIABLE",
            Self::PushSelf => "PUSH_SELF",
            Self::PushNil => "PUSH_NIL",
            Self::PushTrue => "PUSH_TRUE",
            Self::PushFalse => "PUSH_FALSE",
            Self::PushThisContext => "PUSH_THIS_CONTEXT",
            Self::PushMinusOne => "PUSH_MINUS_ONE",
            Self::PushZero => "PUSH_ZERO",
            Self::PushOne => "PUSH_ONE",
            Self::PushTwo => "PUSH_TWO",
            Self::Dup => "DUP",
            Self::Pop => "POP",
            Self::ReturnTop => "RETURN_TOP",
            Self::ReturnSelf => "RETURN_SELF",
            Self::ReturnNil => "RETURN_NIL",
            Self::ReturnTrue => "RETURN_TRUE",
            Self::ReturnFalse => "RETURN_FALSE",
            Self::BlockReturn => "BLOCK_RETURN",
            Self::Jump(_) => "JUMP",
            Self::JumpIfTrue(_) => "JUMP_IF_TRUE",
            Self::JumpIfFalse(_) => "JUMP_IF_FALSE",
            Self::LongJump(_) => "LONG_JUMP",
            Self::LongJumpIfTrue(_) => "LONG_JUMP_IF_TRUE",
            Self::LongJumpIfFalse(_) => "LONG_JUMP_IF_FALSE",
            Self::Send(..) => "SEND",
            Self::SuperSend(..) => "SUPER_SEND",
            Self::CreateBlock(_) => "CREATE_BLOCK",
            Self::SendSpecial(_) => "SEND_SPECIAL",
        }
    }

    /// The name padded to the width of the longest one, for aligned listings.
    pub fn padded_name(self) -> String {
        format!("{:<26}", self.name())
    }
}

impl fmt::Display for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Send(selector, arg_count) | Self::SuperSend(selector, arg_count) => {
                write!(f, "{} {selector} {arg_count}", self.name())
            }
            Self::SendSpecial(index) => match SPECIAL_SELECTORS.get(usize::from(index)) {
                Some(special) => write!(f, "{} #{}", self.name(), special.selector),
                None => write!(f, "{} {index}", self.name()),
            },
            _ => match self.jump_offset() {
                Some(offset) => write!(f, "{} {offset:+}", self.name()),
                None => f.write_str(self.name()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_byte_decodes_to_itself() {
        for opcode in 0..=u8::MAX {
            let Some(width) = opcode_width(opcode) else {
                continue;
            };
            let mut bytes = vec![opcode];
            bytes.resize(width, 0x81);
            let bytecode = Bytecode::decode(&bytes, 0).unwrap();
            assert_eq!(bytecode.opcode(), opcode);
            assert_eq!(bytecode.width(), width);
            let mut encoded = Vec::new();
            bytecode.encode(&mut encoded);
            assert_eq!(encoded, bytes);
        }
    }

    #[test]
    fn jump_offsets_are_signed() {
        assert_eq!(Bytecode::decode(&[opcodes::JUMP, 0xFE], 0), Some(Bytecode::Jump(-2)));
        assert_eq!(Bytecode::decode(&[opcodes::LONG_JUMP_IF_FALSE, 0x80, 0x01], 0), Some(Bytecode::LongJumpIfFalse(-32767)));
        assert_eq!(Bytecode::decode(&[opcodes::LONG_JUMP, 0x7F, 0xFF], 0), Some(Bytecode::LongJump(32767)));
    }

    #[test]
    fn truncated_and_unknown_instructions_are_rejected() {
        assert_eq!(Bytecode::decode(&[opcodes::SEND, 0], 0), None);
        assert_eq!(Bytecode::decode(&[0xFF], 0), None);
        assert_eq!(Bytecode::decode(&[], 0), None);
    }

    #[test]
    fn special_selectors_have_consistent_arity() {
        for special in SPECIAL_SELECTORS {
            let colons = special.selector.matches(':').count() as u8;
            let binary = !special.selector.starts_with(char::is_alphabetic);
            let expected = if binary { 1 } else { colons };
            assert_eq!(special.arg_count, expected, "{}", special.selector);
        }
    }
}
