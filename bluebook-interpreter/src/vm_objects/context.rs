use bluebook_gc::format::{CONTEXT_FIXED_FIELDS, CONTEXT_SP_INDEX};
use bluebook_gc::Heap;
use bluebook_value::Oop;
use log::trace;

// Both kinds of contexts share the first three fields.
pub const SENDER: usize = 0;
/// The sender of a block context is whoever sent it `value`.
pub const CALLER: usize = 0;
pub const PC: usize = 1;
pub const SP: usize = CONTEXT_SP_INDEX;

// Method contexts.
pub const METHOD: usize = 3;
pub const RECEIVER: usize = 5;

// Block contexts.
pub const BLOCK_ARG_COUNT: usize = 3;
pub const INITIAL_PC: usize = 4;
pub const HOME: usize = 5;

pub const FIXED_FIELDS: usize = 6;

static_assertions::const_assert_eq!(FIXED_FIELDS, CONTEXT_FIXED_FIELDS);

/// Block contexts keep a small integer where method contexts keep their method.
#[inline]
pub fn is_block_context(heap: &Heap, context: Oop) -> bool {
    heap.fetch_pointer(context, BLOCK_ARG_COUNT).is_small_integer()
}

/// The method context whose temporaries the context works on.
#[inline]
pub fn home(heap: &Heap, context: Oop) -> Oop {
    if is_block_context(heap, context) {
        heap.fetch_pointer(context, HOME)
    } else {
        context
    }
}

#[inline]
pub fn sender(heap: &Heap, context: Oop) -> Oop {
    heap.fetch_pointer(context, SENDER)
}

pub fn method(heap: &Heap, context: Oop) -> Oop {
    heap.fetch_pointer(home(heap, context), METHOD)
}

pub fn receiver(heap: &Heap, context: Oop) -> Oop {
    heap.fetch_pointer(home(heap, context), RECEIVER)
}

pub fn block_arg_count(heap: &Heap, block: Oop) -> usize {
    heap.fetch_pointer(block, BLOCK_ARG_COUNT).as_small_integer() as usize
}

pub fn initial_pc(heap: &Heap, block: Oop) -> usize {
    heap.fetch_pointer(block, INITIAL_PC).as_small_integer() as usize
}

/// Reads a small-integer register field, `None` once the context has returned.
fn register(heap: &Heap, context: Oop, index: usize) -> Option<usize> {
    let value = heap.fetch_pointer(context, index);
    value.is_small_integer().then(|| value.as_small_integer() as usize)
}

pub fn pc(heap: &Heap, context: Oop) -> Option<usize> {
    register(heap, context, PC)
}

pub fn sp(heap: &Heap, context: Oop) -> Option<usize> {
    register(heap, context, SP)
}

/// A context that has returned has a nil pc.
pub fn is_dead(heap: &Heap, context: Oop) -> bool {
    pc(heap, context).is_none()
}

/// Marks a context as returned: it has no sender and no pc any more.
pub fn kill(heap: &mut Heap, context: Oop) {
    let nil = heap.nil();
    heap.store_pointer(context, SENDER, nil);
    heap.store_pointer(context, PC, nil);
}

/// Slots available for temporaries and the operand stack.
pub fn frame_size(heap: &Heap, context: Oop) -> usize {
    heap.indexable_len(context)
}

/// The operand stack of a context, bottom first.
pub fn stack(heap: &Heap, context: Oop) -> Vec<Oop> {
    let depth = sp(heap, context).unwrap_or(0);
    (0..depth).map(|index| heap.fetch_element(context, index)).collect()
}

/// Whether `target` is on the sender chain of `context`, `context` itself excluded.
pub fn has_sender(heap: &Heap, context: Oop, target: Oop) -> bool {
    let nil = heap.nil();
    let mut current = sender(heap, context);
    while current.is_pointer() && current != nil {
        if current == target {
            return true;
        }
        current = sender(heap, current);
    }
    false
}

/// Free-list of contexts that returned without being captured.
///
/// Contexts come in two pooled frame sizes, anything larger is allocated exactly and never
/// pooled. The pool holds raw references, so it must be emptied before every collection.
#[derive(Debug, Default)]
pub struct ContextPool {
    small: Vec<Oop>,
    large: Vec<Oop>,
    reused: usize,
}

impl ContextPool {
    pub const SMALL_FRAME: usize = 16;
    pub const LARGE_FRAME: usize = 64;
    const LIMIT: usize = 32;

    /// The frame size actually allocated for a context needing `needed` slots.
    pub const fn frame_size_for(needed: usize) -> usize {
        if needed <= Self::SMALL_FRAME {
            Self::SMALL_FRAME
        } else if needed <= Self::LARGE_FRAME {
            Self::LARGE_FRAME
        } else {
            needed
        }
    }

    pub fn take(&mut self, frame_size: usize) -> Option<Oop> {
        let context = match frame_size {
            Self::SMALL_FRAME => self.small.pop(),
            Self::LARGE_FRAME => self.large.pop(),
            _ => None,
        }?;
        self.reused += 1;
        Some(context)
    }

    /// Returns a context to the pool, unless something may still refer to it.
    pub fn recycle(&mut self, heap: &Heap, context: Oop) {
        if heap.is_captured(context) {
            return;
        }
        let list = match frame_size(heap, context) {
            Self::SMALL_FRAME => &mut self.small,
            Self::LARGE_FRAME => &mut self.large,
            _ => return,
        };
        if list.len() < Self::LIMIT {
            list.push(context);
        }
    }

    pub fn clear(&mut self) {
        if !self.is_empty() {
            trace!("dropping {} pooled contexts", self.len());
        }
        self.small.clear();
        self.large.clear();
    }

    pub fn len(&self) -> usize {
        self.small.len() + self.large.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Activations served from the pool instead of the allocator.
    pub fn reused(&self) -> usize {
        self.reused
    }
}
