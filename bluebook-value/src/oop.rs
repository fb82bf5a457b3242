use std::fmt;

static_assertions::assert_eq_size!(Oop, u64);
static_assertions::const_assert_eq!(Oop::SMALL_INTEGER_MIN, -(1 << 61));

/// Number of low bits used for tagging.
pub const TAG_BITS: u32 = 2;

/// Bit pattern used to extract the tag bits from a reference.
pub const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// The four kinds of words a reference can be.
///
/// ```text
///   payload (62 bits)                                          tag
/// xxxxxxxx.......................................................00 -> heap object (byte offset)
/// xxxxxxxx.......................................................01 -> small integer
/// xxxxxxxx.......................................................10 -> character
/// xxxxxxxx.......................................................11 -> marker (headers, never a field value)
/// ```
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tag {
    Pointer = 0b00,
    SmallInteger = 0b01,
    Character = 0b10,
    Marker = 0b11,
}

/// An ordinary object pointer.
///
/// Heap references are byte offsets into the object arena, so they are only meaningful until the
/// next collection: the collector rewrites every one of them it can reach. Offset `0` is never
/// handed out by the allocator and serves as [`Oop::NULL`].
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Oop(u64);

impl Oop {
    /// The reference stored in slots that have not been initialised yet.
    pub const NULL: Oop = Oop(0);

    /// Smallest integer representable as an immediate.
    pub const SMALL_INTEGER_MIN: i64 = i64::MIN >> TAG_BITS;
    /// Largest integer representable as an immediate.
    pub const SMALL_INTEGER_MAX: i64 = i64::MAX >> TAG_BITS;

    /// The small integer `0`.
    pub const ZERO: Oop = Oop::from_small_integer(0);
    /// The small integer `1`.
    pub const ONE: Oop = Oop::from_small_integer(1);

    #[inline(always)]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline(always)]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn tag(self) -> Tag {
        match self.0 & TAG_MASK {
            0b00 => Tag::Pointer,
            0b01 => Tag::SmallInteger,
            0b10 => Tag::Character,
            _ => Tag::Marker,
        }
    }

    /// Returns whether this reference designates a heap object.
    #[inline(always)]
    pub const fn is_pointer(self) -> bool {
        self.0 & TAG_MASK == Tag::Pointer as u64 && self.0 != 0
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn is_small_integer(self) -> bool {
        self.0 & TAG_MASK == Tag::SmallInteger as u64
    }

    #[inline(always)]
    pub const fn is_character(self) -> bool {
        self.0 & TAG_MASK == Tag::Character as u64
    }

    /// Returns whether this is a marker word.
    ///
    /// Marker words are the reserved fourth tag: they never appear in reference fields, object
    /// headers carry them so the collector can tell an object start from a field.
    #[inline(always)]
    pub const fn is_marker(self) -> bool {
        self.0 & TAG_MASK == Tag::Marker as u64
    }

    /// Small integers and characters.
    #[inline(always)]
    pub const fn is_immediate(self) -> bool {
        self.is_small_integer() || self.is_character()
    }

    /// Encodes a small integer. The value is assumed to be within range.
    #[inline(always)]
    pub const fn from_small_integer(value: i64) -> Self {
        Self(((value << TAG_BITS) as u64) | Tag::SmallInteger as u64)
    }

    /// Encodes a small integer, or returns `None` if it does not fit in an immediate.
    #[inline]
    pub const fn try_from_small_integer(value: i64) -> Option<Self> {
        if Self::is_small_integer_value(value) {
            Some(Self::from_small_integer(value))
        } else {
            None
        }
    }

    #[inline(always)]
    pub const fn is_small_integer_value(value: i64) -> bool {
        value >= Self::SMALL_INTEGER_MIN && value <= Self::SMALL_INTEGER_MAX
    }

    /// Decodes a small integer (arithmetic shift, no tag check).
    #[inline(always)]
    pub const fn as_small_integer(self) -> i64 {
        (self.0 as i64) >> TAG_BITS
    }

    #[inline(always)]
    pub const fn from_char(value: char) -> Self {
        Self(((value as u64) << TAG_BITS) | Tag::Character as u64)
    }

    /// The code point stored in a character immediate.
    #[inline(always)]
    pub const fn as_char_code(self) -> u32 {
        (self.0 >> TAG_BITS) as u32
    }

    #[inline]
    pub fn as_char(self) -> char {
        char::from_u32(self.as_char_code()).unwrap_or(char::REPLACEMENT_CHARACTER)
    }

    /// Creates a heap reference from a byte offset into the arena.
    #[inline(always)]
    pub const fn from_offset(offset: usize) -> Self {
        debug_assert!(offset % 8 == 0, "heap references are word aligned");
        Self(offset as u64)
    }

    /// The byte offset of the referenced object.
    #[inline(always)]
    pub const fn offset(self) -> usize {
        self.0 as usize
    }

    /// The index of the referenced object's first word.
    #[inline(always)]
    pub const fn word_index(self) -> usize {
        (self.0 >> 3) as usize
    }

    #[inline(always)]
    pub const fn from_word_index(index: usize) -> Self {
        Self((index as u64) << 3)
    }

    /// Builds a marker word carrying a payload.
    #[inline(always)]
    pub const fn marker(payload: u64) -> Self {
        Self((payload << TAG_BITS) | Tag::Marker as u64)
    }

    #[inline(always)]
    pub const fn marker_payload(self) -> u64 {
        self.0 >> TAG_BITS
    }
}

impl fmt::Debug for Oop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Tag::Pointer if self.is_null() => f.write_str("Oop(null)"),
            Tag::Pointer => write!(f, "Oop(@{:#x})", self.offset()),
            Tag::SmallInteger => write!(f, "Oop({})", self.as_small_integer()),
            Tag::Character => write!(f, "Oop(${:?})", self.as_char()),
            Tag::Marker => write!(f, "Oop(marker {:#x})", self.marker_payload()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_disjoint() {
        let int = Oop::from_small_integer(-5);
        let chr = Oop::from_char('x');
        let ptr = Oop::from_offset(64);
        let mrk = Oop::marker(7);

        assert!(int.is_small_integer() && !int.is_pointer() && !int.is_character() && !int.is_marker());
        assert!(chr.is_character() && !chr.is_pointer() && !chr.is_small_integer());
        assert!(ptr.is_pointer() && !ptr.is_immediate() && !ptr.is_marker());
        assert!(mrk.is_marker() && !mrk.is_pointer() && !mrk.is_immediate());
        assert!(!Oop::NULL.is_pointer());
        assert_eq!(mrk.marker_payload(), 7);
    }

    #[test]
    fn word_index_and_offset_agree() {
        let oop = Oop::from_word_index(12);
        assert_eq!(oop.offset(), 96);
        assert_eq!(oop.word_index(), 12);
        assert_eq!(Oop::from_offset(96), oop);
    }

    #[test]
    fn range_check() {
        assert!(Oop::try_from_small_integer(Oop::SMALL_INTEGER_MAX).is_some());
        assert!(Oop::try_from_small_integer(Oop::SMALL_INTEGER_MAX + 1).is_none());
        assert!(Oop::try_from_small_integer(Oop::SMALL_INTEGER_MIN - 1).is_none());
    }
}
