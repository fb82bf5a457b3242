use std::ops::Range;

/// Words taken by the header and the class reference.
pub const HEADER_WORDS: usize = 2;

/// Bytes per heap word.
pub const WORD_BYTES: usize = 8;

/// Number of fixed fields of a context.
pub const CONTEXT_FIXED_FIELDS: usize = 6;
/// Index of the fixed field holding a context's stack pointer, as a small integer.
///
/// Only the first `sp` slots of a context's tail are live: the rest is scratch space that is
/// neither traced nor remapped.
pub const CONTEXT_SP_INDEX: usize = 2;

/// How an object's payload is laid out.
///
/// Indexable formats store their element count in the word following the fixed fields, then the
/// elements themselves. Fixed fields are references in every format that has them.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectFormat {
    /// Fixed reference fields only.
    Plain = 0,
    /// Indexable references.
    Array = 1,
    /// Indexable bytes, plus one trailing NUL byte. Also used for strings and symbols.
    ByteArray = 2,
    /// Indexable 32-bit words.
    WordArray = 3,
    /// Indexable `f64`.
    FloatArray = 4,
    /// One boxed `f64`.
    Float = 5,
    /// One slot of the large integer side table.
    LargeInteger = 6,
    /// A method or block activation. The tail is an operand stack.
    Context = 7,
}

impl ObjectFormat {
    pub const fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => Self::Plain,
            1 => Self::Array,
            2 => Self::ByteArray,
            3 => Self::WordArray,
            4 => Self::FloatArray,
            5 => Self::Float,
            6 => Self::LargeInteger,
            7 => Self::Context,
            _ => return None,
        })
    }

    /// Whether objects of this format carry an element count and a variable tail.
    #[inline]
    pub const fn is_indexable(self) -> bool {
        matches!(self, Self::Array | Self::ByteArray | Self::WordArray | Self::FloatArray | Self::Context)
    }

    /// Whether the indexable tail holds references.
    #[inline]
    pub const fn has_reference_tail(self) -> bool {
        matches!(self, Self::Array | Self::Context)
    }

    /// Words used by `len` tail elements.
    #[inline]
    pub const fn tail_words(self, len: usize) -> usize {
        match self {
            Self::Plain | Self::Float | Self::LargeInteger => 0,
            Self::Array | Self::Context | Self::FloatArray => len,
            Self::ByteArray => (len + 1).div_ceil(WORD_BYTES),
            Self::WordArray => len.div_ceil(2),
        }
    }

    /// Total footprint of an object, header included.
    #[inline]
    pub const fn size_in_words(self, fixed_fields: usize, len: usize) -> usize {
        let payload = match self {
            Self::Plain => fixed_fields,
            Self::Float | Self::LargeInteger => 1,
            _ => fixed_fields + 1 + self.tail_words(len),
        };
        HEADER_WORDS + payload
    }
}

/// Word indices of the reference fields of an object, the class reference excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSlots {
    pub fixed: Range<usize>,
    pub tail: Range<usize>,
}

impl ReferenceSlots {
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        self.fixed.clone().chain(self.tail.clone())
    }

    pub fn len(&self) -> usize {
        self.fixed.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ObjectFormat::Plain, 3, 0, 5)]
    #[case(ObjectFormat::Array, 0, 4, 7)]
    #[case(ObjectFormat::Array, 2, 0, 5)]
    #[case(ObjectFormat::ByteArray, 0, 0, 4)]
    #[case(ObjectFormat::ByteArray, 0, 7, 4)]
    #[case(ObjectFormat::ByteArray, 0, 8, 5)]
    #[case(ObjectFormat::WordArray, 0, 3, 5)]
    #[case(ObjectFormat::FloatArray, 0, 3, 6)]
    #[case(ObjectFormat::Float, 0, 0, 3)]
    #[case(ObjectFormat::LargeInteger, 0, 0, 3)]
    #[case(ObjectFormat::Context, CONTEXT_FIXED_FIELDS, 10, 19)]
    fn footprints(#[case] format: ObjectFormat, #[case] fixed: usize, #[case] len: usize, #[case] words: usize) {
        assert_eq!(format.size_in_words(fixed, len), words);
    }

    #[test]
    fn format_bits_roundtrip() {
        for bits in 0..8 {
            let format = ObjectFormat::from_bits(bits).unwrap();
            assert_eq!(format as u8, bits);
        }
        assert_eq!(ObjectFormat::from_bits(8), None);
    }
}
