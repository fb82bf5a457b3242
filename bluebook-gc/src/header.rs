use bluebook_value::oop::{Tag, TAG_MASK};

use crate::format::ObjectFormat;

static_assertions::const_assert!(Header::FIXED_SHIFT + 16 <= 64);
static_assertions::const_assert!(Header::HASH_SHIFT + Header::HASH_BITS <= Header::FIXED_SHIFT);

/// The first word of every heap object.
///
/// ```text
///  63        48 47           32 31 30                 9 8      4  3   2   1  0
/// | reserved   | fixed fields  | - |  identity hash     | format | C | M | 11 |
/// ```
///
/// `M` is the mark bit, only set between the mark and compact phases of a collection.
/// `C` flags a context that escaped its activation (reified as `thisContext` or used as the
/// home of a block): such contexts are never handed back to the context free-list.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Header(u64);

impl Header {
    const MARK_BIT: u64 = 1 << 2;
    const CAPTURED_BIT: u64 = 1 << 3;
    const FORMAT_SHIFT: u32 = 4;
    const FORMAT_MASK: u64 = 0b1_1111;
    const HASH_SHIFT: u32 = 9;
    pub const HASH_BITS: u32 = 22;
    const HASH_MASK: u64 = (1 << Self::HASH_BITS) - 1;
    const FIXED_SHIFT: u32 = 32;
    const FIXED_MASK: u64 = 0xFFFF;

    /// Largest number of fixed fields an object can declare.
    pub const MAX_FIXED_FIELDS: usize = Self::FIXED_MASK as usize;

    pub fn new(format: ObjectFormat, fixed_fields: usize, identity_hash: u32) -> Self {
        debug_assert!(fixed_fields <= Self::MAX_FIXED_FIELDS);
        Self(
            Tag::Marker as u64
                | ((format as u64) << Self::FORMAT_SHIFT)
                | ((u64::from(identity_hash) & Self::HASH_MASK) << Self::HASH_SHIFT)
                | ((fixed_fields as u64 & Self::FIXED_MASK) << Self::FIXED_SHIFT),
        )
    }

    #[inline(always)]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline(always)]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Whether the word carries the header tag. Anything else at an object start is heap corruption.
    #[inline(always)]
    pub const fn is_valid(self) -> bool {
        self.0 & TAG_MASK == Tag::Marker as u64
    }

    #[inline]
    pub fn format(self) -> ObjectFormat {
        let bits = ((self.0 >> Self::FORMAT_SHIFT) & Self::FORMAT_MASK) as u8;
        match ObjectFormat::from_bits(bits) {
            Some(format) => format,
            None => panic!("corrupt object header {:#x}: unknown format {bits}", self.0),
        }
    }

    #[inline(always)]
    pub const fn fixed_fields(self) -> usize {
        ((self.0 >> Self::FIXED_SHIFT) & Self::FIXED_MASK) as usize
    }

    #[inline(always)]
    pub const fn identity_hash(self) -> u32 {
        ((self.0 >> Self::HASH_SHIFT) & Self::HASH_MASK) as u32
    }

    #[inline(always)]
    pub const fn is_marked(self) -> bool {
        self.0 & Self::MARK_BIT != 0
    }

    #[inline(always)]
    pub const fn marked(self) -> Self {
        Self(self.0 | Self::MARK_BIT)
    }

    #[inline(always)]
    pub const fn unmarked(self) -> Self {
        Self(self.0 & !Self::MARK_BIT)
    }

    #[inline(always)]
    pub const fn is_captured(self) -> bool {
        self.0 & Self::CAPTURED_BIT != 0
    }

    #[inline(always)]
    pub const fn captured(self) -> Self {
        Self(self.0 | Self::CAPTURED_BIT)
    }

    #[inline(always)]
    pub const fn uncaptured(self) -> Self {
        Self(self.0 & !Self::CAPTURED_BIT)
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("format", &self.format())
            .field("fixed_fields", &self.fixed_fields())
            .field("hash", &self.identity_hash())
            .field("marked", &self.is_marked())
            .field("captured", &self.is_captured())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_do_not_bleed_into_each_other() {
        let header = Header::new(ObjectFormat::Context, 6, 0x3F_FFFF);
        assert!(header.is_valid());
        assert_eq!(header.format(), ObjectFormat::Context);
        assert_eq!(header.fixed_fields(), 6);
        assert_eq!(header.identity_hash(), 0x3F_FFFF);
        assert!(!header.is_marked());

        let marked = header.marked().captured();
        assert!(marked.is_marked() && marked.is_captured());
        assert_eq!(marked.identity_hash(), header.identity_hash());
        assert_eq!(marked.unmarked().uncaptured(), header);
    }

    #[test]
    fn hash_is_truncated_to_its_width() {
        let header = Header::new(ObjectFormat::Plain, 0, u32::MAX);
        assert_eq!(header.identity_hash(), (1 << Header::HASH_BITS) - 1);
        assert_eq!(header.fixed_fields(), 0);
    }
}
