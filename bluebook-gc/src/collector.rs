use bluebook_value::Oop;
use log::{debug, trace};

use crate::bitmap::{BitVector, BLOCK_WORDS};
use crate::format::WORD_BYTES;
use crate::heap::{Heap, FIRST_OBJECT_WORD};
use crate::roots::RootProvider;

/// Running totals kept by the heap.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcStats {
    /// Completed collections.
    pub collections: usize,
    /// Objects allocated since the heap was created.
    pub allocations: usize,
    /// Bytes allocated since the heap was created.
    pub allocated_bytes: usize,
    /// Bytes reclaimed by all collections.
    pub reclaimed_bytes: usize,
    /// Bytes reclaimed by the last collection.
    pub last_reclaimed_bytes: usize,
    /// Bytes surviving the last collection.
    pub last_live_bytes: usize,
    /// Objects that changed address during the last collection.
    pub last_moved_objects: usize,
}

/// Where every survivor of a compaction went.
///
/// `old` has a bit set at the pre-compaction start of every survivor, `new` at its
/// post-compaction start, and `blocks[b]` is the new start of the first survivor whose old
/// start lies in block `b`. Since compaction preserves order, the `k`th survivor of a block is
/// the `k`th set bit of `new` from there on.
struct Relocation {
    old: BitVector,
    new: BitVector,
    blocks: Vec<usize>,
}

impl Relocation {
    const NO_SURVIVOR: usize = usize::MAX;

    fn forward(&self, oop: Oop) -> Oop {
        let index = oop.word_index();
        if !self.old.get(index) {
            panic!("remap found a reference to {oop:?}, which is not a surviving object");
        }
        let ordinal = self.old.ordinal_in_block(index);
        let start = self.blocks[index / BLOCK_WORDS];
        match self.new.nth_set_from(start, ordinal) {
            Some(new_index) => Oop::from_word_index(new_index),
            None => panic!("relocation tables are inconsistent for {oop:?}"),
        }
    }
}

/// Entries of the mark phase's work list.
struct MarkStack {
    items: Vec<Oop>,
    limit: usize,
}

impl MarkStack {
    #[inline]
    fn push(&mut self, oop: Oop) {
        if !oop.is_pointer() {
            return;
        }
        if self.items.len() >= self.limit {
            panic!("mark stack overflow ({} entries)", self.limit);
        }
        self.items.push(oop);
    }
}

impl Heap {
    /// Runs a full collection: mark everything reachable from `roots`, slide survivors down, then
    /// rewrite every reference (in the heap and in `roots`) to the new addresses.
    ///
    /// Returns the number of bytes reclaimed.
    pub fn collect(&mut self, roots: &mut dyn RootProvider) -> usize {
        let used_before = self.used_bytes();
        debug!("collection #{} started with {} bytes in use", self.stats.collections + 1, used_before);

        let marked = self.mark(roots);
        trace!("mark: {marked} objects reachable");

        let relocation = self.compact();
        trace!("compact: {} bytes live, {} objects moved", self.stats.last_live_bytes, self.stats.last_moved_objects);

        self.remap(&relocation, roots);
        trace!("remap: done");

        self.allocated_since_collection = 0;
        self.stats.collections += 1;
        let reclaimed = self.stats.last_reclaimed_bytes;
        self.stats.reclaimed_bytes += reclaimed;
        debug!("collection #{} reclaimed {reclaimed} of {used_before} bytes", self.stats.collections);

        #[cfg(feature = "verify-heap")]
        if let Err(err) = self.verify() {
            panic!("heap verification failed after collection: {err}");
        }

        reclaimed
    }

    fn mark(&mut self, roots: &mut dyn RootProvider) -> usize {
        let mut stack = MarkStack {
            items: Vec::with_capacity(1024.min(self.config.mark_stack_limit)),
            limit: self.config.mark_stack_limit,
        };
        roots.visit_roots(&mut |root| stack.push(*root));
        stack.push(self.nil);

        let mut marked = 0;
        while let Some(oop) = stack.items.pop() {
            let index = oop.word_index();
            let header = self.header_at(index);
            if header.is_marked() {
                continue;
            }
            self.memory[index] = header.marked().to_bits();
            marked += 1;

            stack.push(Oop::from_bits(self.memory[index + 1]));
            for slot in self.reference_slots_at(index, header).iter() {
                stack.push(Oop::from_bits(self.memory[slot]));
            }
        }
        marked
    }

    fn compact(&mut self) -> Relocation {
        let top = self.top;
        let mut relocation = Relocation {
            old: BitVector::new(top),
            new: BitVector::new(top),
            blocks: vec![Relocation::NO_SURVIVOR; top.div_ceil(BLOCK_WORDS)],
        };

        let mut scan = FIRST_OBJECT_WORD;
        let mut free = FIRST_OBJECT_WORD;
        let mut moved = 0;
        let mut reclaimed = 0;
        while scan < top {
            let header = self.header_at(scan);
            let size = self.size_at(scan, header);
            if header.is_marked() {
                if free != scan {
                    self.memory.copy_within(scan..scan + size, free);
                    moved += 1;
                }
                self.memory[free] = header.unmarked().to_bits();
                relocation.old.set(scan);
                relocation.new.set(free);
                let block = &mut relocation.blocks[scan / BLOCK_WORDS];
                if *block == Relocation::NO_SURVIVOR {
                    *block = free;
                }
                free += size;
            } else {
                self.finalize(scan, header);
                reclaimed += size * WORD_BYTES;
            }
            scan += size;
        }

        self.memory[free..top].fill(0);
        self.top = free;
        self.stats.last_reclaimed_bytes = reclaimed;
        self.stats.last_live_bytes = (free - FIRST_OBJECT_WORD) * WORD_BYTES;
        self.stats.last_moved_objects = moved;
        relocation
    }

    fn remap(&mut self, relocation: &Relocation, roots: &mut dyn RootProvider) {
        let mut index = FIRST_OBJECT_WORD;
        while index < self.top {
            let header = self.header_at(index);
            let class = Oop::from_bits(self.memory[index + 1]);
            if class.is_pointer() {
                self.memory[index + 1] = relocation.forward(class).to_bits();
            }
            for slot in self.reference_slots_at(index, header).iter() {
                let value = Oop::from_bits(self.memory[slot]);
                if value.is_pointer() {
                    self.memory[slot] = relocation.forward(value).to_bits();
                }
            }
            index += self.size_at(index, header);
        }

        roots.visit_roots(&mut |root| {
            if root.is_pointer() {
                *root = relocation.forward(*root);
            }
        });
        if self.nil.is_pointer() {
            self.nil = relocation.forward(self.nil);
        }
    }
}
