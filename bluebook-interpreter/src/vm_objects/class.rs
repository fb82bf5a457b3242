use bluebook_gc::{Heap, ObjectFormat};
use bluebook_value::Oop;

pub const SUPERCLASS: usize = 0;
pub const METHOD_DICTIONARY: usize = 1;
/// A small integer packing the format and fixed-field count of the instances.
pub const INSTANCE_SPEC: usize = 2;
pub const NAME: usize = 3;
/// For a metaclass, its sole instance. Nil for ordinary classes.
pub const THIS_CLASS: usize = 4;
pub const FIXED_FIELDS: usize = 5;

/// What instances of a class look like.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub format: ObjectFormat,
    pub fixed_fields: usize,
}

impl InstanceSpec {
    const FORMAT_SHIFT: u32 = 16;

    pub const fn new(format: ObjectFormat, fixed_fields: usize) -> Self {
        Self { format, fixed_fields }
    }

    pub const fn to_oop(self) -> Oop {
        Oop::from_small_integer(((self.format as i64) << Self::FORMAT_SHIFT) | self.fixed_fields as i64)
    }

    /// Decodes an instance specification, or `None` if the field does not hold one.
    pub fn from_oop(oop: Oop) -> Option<Self> {
        if !oop.is_small_integer() {
            return None;
        }
        let bits = oop.as_small_integer();
        let format = ObjectFormat::from_bits((bits >> Self::FORMAT_SHIFT) as u8)?;
        Some(Self::new(format, (bits & 0xFFFF) as usize))
    }
}

pub fn superclass(heap: &Heap, class: Oop) -> Oop {
    heap.fetch_pointer(class, SUPERCLASS)
}

pub fn method_dictionary(heap: &Heap, class: Oop) -> Oop {
    heap.fetch_pointer(class, METHOD_DICTIONARY)
}

pub fn instance_spec(heap: &Heap, class: Oop) -> Option<InstanceSpec> {
    InstanceSpec::from_oop(heap.fetch_pointer(class, INSTANCE_SPEC))
}

/// Walks the superclass chain starting at `class` looking for `selector`.
pub fn lookup_method(heap: &Heap, class: Oop, selector: Oop) -> Option<Oop> {
    let nil = heap.nil();
    let mut current = class;
    while current.is_pointer() && current != nil {
        let dictionary = method_dictionary(heap, current);
        if dictionary.is_pointer() && dictionary != nil {
            if let Some(method) = method_dictionary::lookup(heap, dictionary, selector) {
                return Some(method);
            }
        }
        current = superclass(heap, current);
    }
    None
}

/// Whether `class` is `ancestor` or inherits from it.
pub fn inherits_from(heap: &Heap, class: Oop, ancestor: Oop) -> bool {
    let nil = heap.nil();
    let mut current = class;
    while current.is_pointer() && current != nil {
        if current == ancestor {
            return true;
        }
        current = superclass(heap, current);
    }
    false
}

/// Open-addressed selector tables.
///
/// A method dictionary is an `Array`-format object whose indexable part holds the selector keys,
/// with two fixed fields: the tally and a parallel `Array` of methods. Keys are probed linearly
/// starting at the selector's identity hash, nil marks a free slot, and the capacity is always a
/// power of two.
pub mod method_dictionary {
    use super::*;

    pub const TALLY: usize = 0;
    pub const VALUES: usize = 1;
    pub const FIXED_FIELDS: usize = 2;

    pub const MIN_CAPACITY: usize = 8;

    pub fn capacity(heap: &Heap, dictionary: Oop) -> usize {
        heap.indexable_len(dictionary)
    }

    pub fn tally(heap: &Heap, dictionary: Oop) -> usize {
        heap.fetch_pointer(dictionary, TALLY).as_small_integer() as usize
    }

    /// Whether one more entry would push the load factor past three quarters.
    pub fn is_full(heap: &Heap, dictionary: Oop) -> bool {
        (tally(heap, dictionary) + 1) * 4 > capacity(heap, dictionary) * 3
    }

    /// Index of the slot holding `selector`, or of the free slot where it would go.
    fn probe(heap: &Heap, dictionary: Oop, selector: Oop) -> Option<usize> {
        let nil = heap.nil();
        let capacity = capacity(heap, dictionary);
        let mask = capacity - 1;
        let mut index = heap.identity_hash(selector) as usize & mask;
        for _ in 0..capacity {
            let key = heap.fetch_element(dictionary, index);
            if key == selector || key == nil {
                return Some(index);
            }
            index = (index + 1) & mask;
        }
        None
    }

    pub fn lookup(heap: &Heap, dictionary: Oop, selector: Oop) -> Option<Oop> {
        let index = probe(heap, dictionary, selector)?;
        if heap.fetch_element(dictionary, index) != selector {
            return None;
        }
        let values = heap.fetch_pointer(dictionary, VALUES);
        Some(heap.fetch_element(values, index))
    }

    /// Adds or replaces an entry. The caller grows the dictionary first when [`is_full`].
    pub fn insert(heap: &mut Heap, dictionary: Oop, selector: Oop, method: Oop) {
        let Some(index) = probe(heap, dictionary, selector) else {
            panic!("method dictionary {dictionary:?} has no free slot left");
        };
        if heap.fetch_element(dictionary, index) != selector {
            heap.store_element(dictionary, index, selector);
            let tally = tally(heap, dictionary);
            heap.store_pointer(dictionary, TALLY, Oop::from_small_integer(tally as i64 + 1));
        }
        let values = heap.fetch_pointer(dictionary, VALUES);
        heap.store_element(values, index, method);
    }

    /// Every `(selector, method)` pair, in slot order.
    pub fn entries(heap: &Heap, dictionary: Oop) -> Vec<(Oop, Oop)> {
        let nil = heap.nil();
        let values = heap.fetch_pointer(dictionary, VALUES);
        (0..capacity(heap, dictionary))
            .filter_map(|index| {
                let key = heap.fetch_element(dictionary, index);
                (key != nil).then(|| (key, heap.fetch_element(values, index)))
            })
            .collect()
    }
}
