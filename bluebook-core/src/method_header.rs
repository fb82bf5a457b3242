use anyhow::{bail, Error};
use bluebook_value::Oop;

static_assertions::const_assert_eq!(MethodHeader::FLAG_SHIFT + 3, 32);

/// How a compiled method is executed.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MethodFlag {
    /// Run the primitive, if any, then the bytecode.
    Normal = 0,
    /// Answer the receiver without activating anything.
    ReturnSelf = 1,
    /// Answer one of the receiver's instance variables, whose index is stored in the primitive
    /// index bits.
    ReturnInstanceVariable = 2,
    /// Answer the first literal.
    ReturnLiteral = 3,
}

impl MethodFlag {
    pub const fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => Self::Normal,
            1 => Self::ReturnSelf,
            2 => Self::ReturnInstanceVariable,
            3 => Self::ReturnLiteral,
            _ => return None,
        })
    }

    /// Whether methods with this flag are answered without activation.
    pub const fn is_trivial(self) -> bool {
        !matches!(self, Self::Normal)
    }
}

/// The packed header of a compiled method.
///
/// ```text
///  31  29 28     24 23      18 17         10 9               2 1  0
/// | flag | args    | temps    | stack depth  | primitive index  | 01 |
/// ```
///
/// The low tag bits make the whole header a valid small integer, so it is stored as-is in the
/// method's first field and the collector never mistakes it for a reference.
/// The temporary count includes the arguments.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct MethodHeader(u32);

impl MethodHeader {
    const PRIMITIVE_SHIFT: u32 = 2;
    const DEPTH_SHIFT: u32 = 10;
    const TEMPS_SHIFT: u32 = 18;
    const ARGS_SHIFT: u32 = 24;
    const FLAG_SHIFT: u32 = 29;

    pub const MAX_ARGS: usize = 31;
    pub const MAX_TEMPS: usize = 63;
    pub const MAX_STACK_DEPTH: usize = 255;
    pub const MAX_PRIMITIVE: usize = 255;

    pub fn new(flag: MethodFlag, arg_count: usize, temp_count: usize, stack_depth: usize, primitive_index: usize) -> Result<Self, Error> {
        if arg_count > Self::MAX_ARGS {
            bail!("too many arguments: {arg_count} (at most {})", Self::MAX_ARGS);
        }
        if temp_count > Self::MAX_TEMPS {
            bail!("too many temporaries: {temp_count} (at most {})", Self::MAX_TEMPS);
        }
        if temp_count < arg_count {
            bail!("temporary count {temp_count} does not cover the {arg_count} arguments");
        }
        if stack_depth > Self::MAX_STACK_DEPTH {
            bail!("stack too deep: {stack_depth} (at most {})", Self::MAX_STACK_DEPTH);
        }
        if primitive_index > Self::MAX_PRIMITIVE {
            bail!("primitive index out of range: {primitive_index}");
        }
        Ok(Self(
            (flag as u32) << Self::FLAG_SHIFT
                | (arg_count as u32) << Self::ARGS_SHIFT
                | (temp_count as u32) << Self::TEMPS_SHIFT
                | (stack_depth as u32) << Self::DEPTH_SHIFT
                | (primitive_index as u32) << Self::PRIMITIVE_SHIFT
                | 0b01,
        ))
    }

    /// Reads a header back from a method's header field.
    #[inline]
    pub const fn from_oop(oop: Oop) -> Self {
        Self(oop.to_bits() as u32)
    }

    #[inline]
    pub const fn to_oop(self) -> Oop {
        Oop::from_bits(self.0 as u64)
    }

    /// The flag, or `None` for the reserved values.
    #[inline]
    pub const fn flag(self) -> Option<MethodFlag> {
        MethodFlag::from_bits((self.0 >> Self::FLAG_SHIFT) as u8)
    }

    #[inline]
    pub const fn arg_count(self) -> usize {
        ((self.0 >> Self::ARGS_SHIFT) & 0x1F) as usize
    }

    #[inline]
    pub const fn temp_count(self) -> usize {
        ((self.0 >> Self::TEMPS_SHIFT) & 0x3F) as usize
    }

    #[inline]
    pub const fn stack_depth(self) -> usize {
        ((self.0 >> Self::DEPTH_SHIFT) & 0xFF) as usize
    }

    #[inline]
    pub const fn primitive_index(self) -> usize {
        ((self.0 >> Self::PRIMITIVE_SHIFT) & 0xFF) as usize
    }

    /// Slots a context activating this method needs: temporaries, then the operand stack.
    #[inline]
    pub const fn frame_size(self) -> usize {
        self.temp_count() + self.stack_depth()
    }
}

impl std::fmt::Debug for MethodHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodHeader")
            .field("flag", &self.flag())
            .field("args", &self.arg_count())
            .field("temps", &self.temp_count())
            .field("depth", &self.stack_depth())
            .field("primitive", &self.primitive_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(MethodFlag::Normal, 0, 0, 0, 0)]
    #[case(MethodFlag::Normal, 2, 5, 12, 1)]
    #[case(MethodFlag::ReturnSelf, 31, 63, 255, 255)]
    #[case(MethodFlag::ReturnInstanceVariable, 0, 0, 0, 3)]
    #[case(MethodFlag::ReturnLiteral, 1, 1, 1, 0)]
    fn fields_survive_packing(#[case] flag: MethodFlag, #[case] args: usize, #[case] temps: usize, #[case] depth: usize, #[case] primitive: usize) {
        let header = MethodHeader::new(flag, args, temps, depth, primitive).unwrap();
        let header = MethodHeader::from_oop(header.to_oop());
        assert_eq!(header.flag(), Some(flag));
        assert_eq!(header.arg_count(), args);
        assert_eq!(header.temp_count(), temps);
        assert_eq!(header.stack_depth(), depth);
        assert_eq!(header.primitive_index(), primitive);
        assert!(header.to_oop().is_small_integer());
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        assert!(MethodHeader::new(MethodFlag::Normal, 32, 40, 0, 0).is_err());
        assert!(MethodHeader::new(MethodFlag::Normal, 0, 64, 0, 0).is_err());
        assert!(MethodHeader::new(MethodFlag::Normal, 0, 0, 256, 0).is_err());
        assert!(MethodHeader::new(MethodFlag::Normal, 3, 2, 0, 0).is_err());
    }

    #[test]
    fn reserved_flags_decode_to_none() {
        let header = MethodHeader::from_oop(Oop::from_bits(0b111 << 29 | 0b01));
        assert_eq!(header.flag(), None);
    }
}
