use std::mem::size_of;

use anyhow::{bail, Error};
use bluebook_value::Oop;
use log::info;
use num_bigint::BigInt;

use crate::bitmap::BitVector;
use crate::collector::GcStats;
use crate::format::{ObjectFormat, ReferenceSlots, CONTEXT_SP_INDEX, HEADER_WORDS, WORD_BYTES};
use crate::header::Header;
use crate::large_integers::LargeIntegerTable;
use crate::roots::{RootProvider, WithRoot};

/// Granularity at which the arena is committed.
pub const PAGE_WORDS: usize = 4096 / WORD_BYTES;

/// Word 0 is never allocated, so that [`Oop::NULL`] never designates an object.
pub const FIRST_OBJECT_WORD: usize = 1;

/// Payload of a large integer object that has no value yet.
const NO_SLOT: u64 = u64::MAX;

/// Heap sizing and collection policy.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Bytes committed up front.
    pub initial_bytes: usize,
    /// Bytes the arena may grow to. Running out of these is fatal.
    pub max_bytes: usize,
    /// Bytes allocated between two collections.
    pub collection_threshold: usize,
    /// Entries the mark work list may hold. Overflowing it is fatal.
    pub mark_stack_limit: usize,
    /// Collect before every single allocation.
    pub stress: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_bytes: 1024 * 1024,
            max_bytes: 512 * 1024 * 1024,
            collection_threshold: 64 * 1024 * size_of::<usize>(),
            mark_stack_limit: 1 << 20,
            stress: false,
        }
    }
}

impl HeapConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_bytes < PAGE_WORDS * WORD_BYTES {
            bail!("maximum heap size must be at least one page ({} bytes)", PAGE_WORDS * WORD_BYTES);
        }
        if self.initial_bytes > self.max_bytes {
            bail!("initial heap size ({}) exceeds the maximum heap size ({})", self.initial_bytes, self.max_bytes);
        }
        if self.collection_threshold == 0 {
            bail!("collection threshold must be non-zero");
        }
        if self.mark_stack_limit == 0 {
            bail!("mark stack limit must be non-zero");
        }
        Ok(())
    }
}

/// The object arena.
///
/// Objects are bump-allocated from the bottom of a single growable vector of words and addressed
/// by their byte offset in it. The vector may be reallocated when it grows, which is fine since
/// nothing outside the heap ever holds a native pointer into it.
pub struct Heap {
    pub(crate) memory: Vec<u64>,
    /// First free word.
    pub(crate) top: usize,
    reserved_words: usize,
    pub(crate) allocated_since_collection: usize,
    pub(crate) config: HeapConfig,
    hash_state: u32,
    /// Initial value of every reference slot. Remapped like any other root.
    pub(crate) nil: Oop,
    pub(crate) large_integers: LargeIntegerTable,
    pub(crate) stats: GcStats,
}

impl Heap {
    pub fn new(config: HeapConfig) -> Result<Self, Error> {
        config.validate()?;
        let initial_words = (config.initial_bytes / WORD_BYTES).next_multiple_of(PAGE_WORDS).max(PAGE_WORDS);
        Ok(Self {
            memory: vec![0; initial_words],
            top: FIRST_OBJECT_WORD,
            reserved_words: config.max_bytes / WORD_BYTES,
            allocated_since_collection: 0,
            config,
            hash_state: 0x2545_F491,
            nil: Oop::NULL,
            large_integers: LargeIntegerTable::default(),
            stats: GcStats::default(),
        })
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Sets the object every fresh reference slot starts out pointing at.
    pub fn set_nil(&mut self, nil: Oop) {
        self.nil = nil;
    }

    pub fn nil(&self) -> Oop {
        self.nil
    }

    pub fn used_bytes(&self) -> usize {
        self.top * WORD_BYTES
    }

    /// Whether an object of `words` words fits in what is left of the reservation.
    pub fn has_room_for(&self, words: usize) -> bool {
        self.top.checked_add(words).is_some_and(|end| end <= self.reserved_words)
    }

    pub fn committed_bytes(&self) -> usize {
        self.memory.len() * WORD_BYTES
    }

    pub fn live_large_integers(&self) -> usize {
        self.large_integers.live()
    }

    /// Whether allocating `words` more words crosses the collection threshold.
    pub fn should_collect(&self, words: usize) -> bool {
        self.config.stress || self.allocated_since_collection + words * WORD_BYTES > self.config.collection_threshold
    }

    /// Allocates an object, collecting first if the threshold is crossed or the reservation is
    /// exhausted.
    pub fn allocate(&mut self, class: Oop, format: ObjectFormat, fixed_fields: usize, len: usize, roots: &mut dyn RootProvider) -> Oop {
        let mut class = class;
        let words = format.size_in_words(fixed_fields, len);
        if self.should_collect(words) {
            self.collect(&mut WithRoot { roots: &mut *roots, extra: &mut class });
        }
        if let Some(oop) = self.try_allocate(class, format, fixed_fields, len) {
            return oop;
        }
        self.collect(&mut WithRoot { roots, extra: &mut class });
        match self.try_allocate(class, format, fixed_fields, len) {
            Some(oop) => oop,
            None => self.reservation_exhausted(words),
        }
    }

    /// Bump-allocates an object without ever collecting. Returns `None` only when the maximum
    /// reservation cannot hold it.
    ///
    /// Reference slots are set to nil, everything else to zero. The class may only be null while
    /// bootstrapping objects whose class does not exist yet, see [`Heap::set_class_of`].
    pub fn try_allocate(&mut self, class: Oop, format: ObjectFormat, fixed_fields: usize, len: usize) -> Option<Oop> {
        debug_assert!(!class.is_immediate(), "class references are heap objects");
        debug_assert!(
            fixed_fields == 0 || matches!(format, ObjectFormat::Plain | ObjectFormat::Array | ObjectFormat::Context),
            "{format:?} objects cannot have fixed fields"
        );
        let words = format.size_in_words(fixed_fields, len);
        let index = self.top;
        if !self.ensure_committed(index + words) {
            return None;
        }
        self.top += words;
        self.allocated_since_collection += words * WORD_BYTES;
        self.stats.allocations += 1;
        self.stats.allocated_bytes += words * WORD_BYTES;

        let hash = self.next_hash();
        self.memory[index] = Header::new(format, fixed_fields, hash).to_bits();
        self.memory[index + 1] = class.to_bits();

        let nil = self.nil.to_bits();
        let payload = index + HEADER_WORDS;
        self.memory[payload..payload + fixed_fields].fill(nil);
        match format {
            ObjectFormat::Plain => {}
            ObjectFormat::Float => self.memory[payload] = 0,
            ObjectFormat::LargeInteger => self.memory[payload] = NO_SLOT,
            _ => {
                let count = payload + fixed_fields;
                self.memory[count] = len as u64;
                let fill = if format.has_reference_tail() { nil } else { 0 };
                self.memory[count + 1..index + words].fill(fill);
            }
        }
        Some(Oop::from_word_index(index))
    }

    fn ensure_committed(&mut self, end: usize) -> bool {
        if end <= self.memory.len() {
            return true;
        }
        if end > self.reserved_words {
            return false;
        }
        let target = end.max(self.memory.len() * 2).next_multiple_of(PAGE_WORDS).min(self.reserved_words);
        info!("growing heap from {} KiB to {} KiB", self.committed_bytes() / 1024, target * WORD_BYTES / 1024);
        self.memory.resize(target, 0);
        true
    }

    pub fn reservation_exhausted(&self, words: usize) -> ! {
        panic!(
            "heap reservation exhausted: {} bytes requested with {} of {} bytes in use",
            words * WORD_BYTES,
            self.used_bytes(),
            self.reserved_words * WORD_BYTES
        )
    }

    fn next_hash(&mut self) -> u32 {
        // xorshift32
        let mut x = self.hash_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.hash_state = x;
        x >> (u32::BITS - Header::HASH_BITS)
    }

    /// Reads the header at a word index, checking it really is one.
    #[inline]
    pub(crate) fn header_at(&self, index: usize) -> Header {
        if index < FIRST_OBJECT_WORD || index >= self.top {
            panic!("reference to word {index} is outside the allocated heap (top: {})", self.top);
        }
        let header = Header::from_bits(self.memory[index]);
        if !header.is_valid() {
            panic!("word {index} should be an object header but holds {:#x}", self.memory[index]);
        }
        header
    }

    /// Footprint of the object starting at `index`, computed from its header alone.
    pub(crate) fn size_at(&self, index: usize, header: Header) -> usize {
        let format = header.format();
        let fixed = header.fixed_fields();
        let len = if format.is_indexable() {
            self.memory[index + HEADER_WORDS + fixed] as usize
        } else {
            0
        };
        format.size_in_words(fixed, len)
    }

    pub(crate) fn reference_slots_at(&self, index: usize, header: Header) -> ReferenceSlots {
        let fixed = header.fixed_fields();
        let fields = index + HEADER_WORDS;
        let format = header.format();
        if !format.has_reference_tail() {
            let fixed = if format == ObjectFormat::Plain { fields..fields + fixed } else { fields..fields };
            return ReferenceSlots { fixed, tail: 0..0 };
        }
        let len = self.memory[fields + fixed] as usize;
        let start = fields + fixed + 1;
        let live = match format {
            ObjectFormat::Context => {
                let sp = Oop::from_bits(self.memory[fields + CONTEXT_SP_INDEX]);
                if sp.is_small_integer() {
                    (sp.as_small_integer().max(0) as usize).min(len)
                } else {
                    0
                }
            }
            _ => len,
        };
        ReferenceSlots {
            fixed: fields..fields + fixed,
            tail: start..start + live,
        }
    }

    /// Number of words taken by an object.
    pub fn size_in_words(&self, oop: Oop) -> usize {
        let index = oop.word_index();
        self.size_at(index, self.header_at(index))
    }

    /// The slots of an object that the collector treats as references (the class excluded).
    pub fn reference_slots(&self, oop: Oop) -> ReferenceSlots {
        let index = oop.word_index();
        self.reference_slots_at(index, self.header_at(index))
    }

    /// Iterates over every object in the heap, in address order.
    pub fn objects(&self) -> Objects<'_> {
        Objects {
            heap: self,
            index: FIRST_OBJECT_WORD,
        }
    }

    // ----- object accessors -----

    #[inline]
    pub fn header(&self, oop: Oop) -> Header {
        Header::from_bits(self.memory[oop.word_index()])
    }

    #[inline]
    pub fn format(&self, oop: Oop) -> ObjectFormat {
        self.header(oop).format()
    }

    #[inline]
    pub fn identity_hash(&self, oop: Oop) -> u32 {
        self.header(oop).identity_hash()
    }

    #[inline]
    pub fn fixed_fields(&self, oop: Oop) -> usize {
        self.header(oop).fixed_fields()
    }

    /// The class reference of a heap object.
    #[inline]
    pub fn class_of(&self, oop: Oop) -> Oop {
        Oop::from_bits(self.memory[oop.word_index() + 1])
    }

    pub fn set_class_of(&mut self, oop: Oop, class: Oop) {
        self.memory[oop.word_index() + 1] = class.to_bits();
    }

    pub fn is_captured(&self, oop: Oop) -> bool {
        self.header(oop).is_captured()
    }

    pub fn set_captured(&mut self, oop: Oop, captured: bool) {
        let header = self.header(oop);
        let header = if captured { header.captured() } else { header.uncaptured() };
        self.memory[oop.word_index()] = header.to_bits();
    }

    /// Word index of fixed field `index`.
    #[inline]
    pub fn field_index(&self, oop: Oop, index: usize) -> usize {
        debug_assert!(index < self.fixed_fields(oop), "field {index} out of bounds for {oop:?}");
        oop.word_index() + HEADER_WORDS + index
    }

    #[inline]
    pub fn fetch_pointer(&self, oop: Oop, index: usize) -> Oop {
        Oop::from_bits(self.memory[self.field_index(oop, index)])
    }

    #[inline]
    pub fn store_pointer(&mut self, oop: Oop, index: usize, value: Oop) {
        let slot = self.field_index(oop, index);
        self.memory[slot] = value.to_bits();
    }

    /// Number of indexable elements, 0 for non-indexable formats.
    pub fn indexable_len(&self, oop: Oop) -> usize {
        let header = self.header(oop);
        if header.format().is_indexable() {
            self.memory[oop.word_index() + HEADER_WORDS + header.fixed_fields()] as usize
        } else {
            0
        }
    }

    /// Word index of the first indexable element.
    #[inline]
    pub fn elements_index(&self, oop: Oop) -> usize {
        oop.word_index() + HEADER_WORDS + self.fixed_fields(oop) + 1
    }

    #[inline]
    pub fn fetch_element(&self, oop: Oop, index: usize) -> Oop {
        debug_assert!(index < self.indexable_len(oop));
        Oop::from_bits(self.memory[self.elements_index(oop) + index])
    }

    #[inline]
    pub fn store_element(&mut self, oop: Oop, index: usize, value: Oop) {
        debug_assert!(index < self.indexable_len(oop));
        let slot = self.elements_index(oop) + index;
        self.memory[slot] = value.to_bits();
    }

    /// Byte offset of the first byte of a byte-array-like object.
    #[inline]
    pub fn bytes_offset(&self, oop: Oop) -> usize {
        self.elements_index(oop) * WORD_BYTES
    }

    /// Reads a byte at an absolute byte offset in the arena.
    #[inline(always)]
    pub fn byte_at_offset(&self, offset: usize) -> u8 {
        (self.memory[offset / WORD_BYTES] >> ((offset % WORD_BYTES) * 8)) as u8
    }

    #[inline]
    fn set_byte_at_offset(&mut self, offset: usize, value: u8) {
        let word = &mut self.memory[offset / WORD_BYTES];
        let shift = (offset % WORD_BYTES) * 8;
        *word = (*word & !(0xFF << shift)) | (u64::from(value) << shift);
    }

    pub fn fetch_byte(&self, oop: Oop, index: usize) -> u8 {
        debug_assert!(index < self.indexable_len(oop));
        self.byte_at_offset(self.bytes_offset(oop) + index)
    }

    pub fn store_byte(&mut self, oop: Oop, index: usize, value: u8) {
        debug_assert!(index < self.indexable_len(oop));
        let offset = self.bytes_offset(oop) + index;
        self.set_byte_at_offset(offset, value);
    }

    pub fn bytes(&self, oop: Oop) -> Vec<u8> {
        let start = self.bytes_offset(oop);
        (0..self.indexable_len(oop)).map(|i| self.byte_at_offset(start + i)).collect()
    }

    pub fn store_bytes(&mut self, oop: Oop, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.indexable_len(oop));
        let start = self.bytes_offset(oop);
        for (i, byte) in bytes.iter().enumerate() {
            self.set_byte_at_offset(start + i, *byte);
        }
    }

    pub fn fetch_word_element(&self, oop: Oop, index: usize) -> u32 {
        debug_assert!(index < self.indexable_len(oop));
        let word = self.memory[self.elements_index(oop) + index / 2];
        (word >> ((index % 2) * 32)) as u32
    }

    pub fn store_word_element(&mut self, oop: Oop, index: usize, value: u32) {
        debug_assert!(index < self.indexable_len(oop));
        let slot = self.elements_index(oop) + index / 2;
        let shift = (index % 2) * 32;
        self.memory[slot] = (self.memory[slot] & !(0xFFFF_FFFF << shift)) | (u64::from(value) << shift);
    }

    pub fn fetch_float_element(&self, oop: Oop, index: usize) -> f64 {
        debug_assert!(index < self.indexable_len(oop));
        f64::from_bits(self.memory[self.elements_index(oop) + index])
    }

    pub fn store_float_element(&mut self, oop: Oop, index: usize, value: f64) {
        debug_assert!(index < self.indexable_len(oop));
        let slot = self.elements_index(oop) + index;
        self.memory[slot] = value.to_bits();
    }

    pub fn float_value(&self, oop: Oop) -> f64 {
        debug_assert_eq!(self.format(oop), ObjectFormat::Float);
        f64::from_bits(self.memory[oop.word_index() + HEADER_WORDS])
    }

    pub fn set_float_value(&mut self, oop: Oop, value: f64) {
        debug_assert_eq!(self.format(oop), ObjectFormat::Float);
        self.memory[oop.word_index() + HEADER_WORDS] = value.to_bits();
    }

    /// The value of a large integer object, if one was ever stored in it.
    pub fn large_integer(&self, oop: Oop) -> Option<&BigInt> {
        debug_assert_eq!(self.format(oop), ObjectFormat::LargeInteger);
        match self.memory[oop.word_index() + HEADER_WORDS] {
            NO_SLOT => None,
            slot => self.large_integers.get(slot as usize),
        }
    }

    pub fn set_large_integer(&mut self, oop: Oop, value: BigInt) {
        debug_assert_eq!(self.format(oop), ObjectFormat::LargeInteger);
        let payload = oop.word_index() + HEADER_WORDS;
        match self.memory[payload] {
            NO_SLOT => self.memory[payload] = self.large_integers.insert(value) as u64,
            slot => self.large_integers.replace(slot as usize, value),
        }
    }

    /// Releases the out-of-line storage of a dead object.
    pub(crate) fn finalize(&mut self, index: usize, header: Header) {
        if header.format() == ObjectFormat::LargeInteger {
            let slot = self.memory[index + HEADER_WORDS];
            if slot != NO_SLOT {
                self.large_integers.release(slot as usize);
            }
        }
    }

    /// Raw access to a reference slot by word index, for callers caching slot positions
    /// between two collections.
    #[inline(always)]
    pub fn slot(&self, index: usize) -> Oop {
        Oop::from_bits(self.memory[index])
    }

    #[inline(always)]
    pub fn set_slot(&mut self, index: usize, value: Oop) {
        self.memory[index] = value.to_bits();
    }

    /// Checks the heap is well formed: every object has a valid unmarked header, and every
    /// reference (class included) points at the start of an object.
    pub fn verify(&self) -> Result<(), Error> {
        let mut starts = BitVector::new(self.top);
        let mut index = FIRST_OBJECT_WORD;
        while index < self.top {
            let header = Header::from_bits(self.memory[index]);
            if !header.is_valid() {
                bail!("word {index} should hold a header but holds {:#x}", self.memory[index]);
            }
            if header.is_marked() {
                bail!("object at word {index} is still marked");
            }
            starts.set(index);
            index += self.size_at(index, header);
        }
        if index != self.top {
            bail!("last object overruns the allocation pointer ({index} > {})", self.top);
        }

        let points_at_object = |oop: Oop| !oop.is_pointer() || (oop.word_index() < self.top && starts.get(oop.word_index()));
        for object in self.objects() {
            let class = self.class_of(object);
            if !class.is_pointer() || !points_at_object(class) {
                bail!("object {object:?} has an invalid class reference {class:?}");
            }
            for slot in self.reference_slots(object).iter() {
                let value = self.slot(slot);
                if value.is_marker() || !points_at_object(value) {
                    bail!("object {object:?} holds a dangling reference {value:?} at word {slot}");
                }
            }
        }
        Ok(())
    }
}

/// Iterator over the objects of a heap, in address order.
pub struct Objects<'a> {
    heap: &'a Heap,
    index: usize,
}

impl Iterator for Objects<'_> {
    type Item = Oop;

    fn next(&mut self) -> Option<Oop> {
        if self.index >= self.heap.top {
            return None;
        }
        let oop = Oop::from_word_index(self.index);
        self.index += self.heap.size_at(self.index, self.heap.header_at(self.index));
        Some(oop)
    }
}
