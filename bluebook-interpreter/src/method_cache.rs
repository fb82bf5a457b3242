use anyhow::{bail, Error};
use bluebook_value::Oop;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Entry {
    class: Oop,
    selector: Oop,
    method: Oop,
}

impl Entry {
    const EMPTY: Entry = Entry {
        class: Oop::NULL,
        selector: Oop::NULL,
        method: Oop::NULL,
    };
}

/// Direct-mapped cache of `(class, selector) -> method` lookups.
///
/// Entries are raw references that the collector does not know about: the cache is flushed after
/// every collection, and whenever a method dictionary changes.
pub struct MethodCache {
    entries: Box<[Entry]>,
    mask: usize,
    hits: usize,
    misses: usize,
}

impl MethodCache {
    pub const DEFAULT_SIZE: usize = 1024;

    pub fn new(size: usize) -> Result<Self, Error> {
        if !size.is_power_of_two() {
            bail!("method cache size must be a power of two, got {size}");
        }
        Ok(Self {
            entries: vec![Entry::EMPTY; size].into_boxed_slice(),
            mask: size - 1,
            hits: 0,
            misses: 0,
        })
    }

    #[inline]
    fn index(&self, class: Oop, selector: Oop) -> usize {
        (((class.to_bits() ^ selector.to_bits()) >> 3) as usize) & self.mask
    }

    #[inline]
    pub fn probe(&mut self, class: Oop, selector: Oop) -> Option<Oop> {
        let entry = self.entries[self.index(class, selector)];
        if entry.class == class && entry.selector == selector && !entry.method.is_null() {
            self.hits += 1;
            Some(entry.method)
        } else {
            self.misses += 1;
            None
        }
    }

    pub fn insert(&mut self, class: Oop, selector: Oop, method: Oop) {
        let index = self.index(class, selector);
        self.entries[index] = Entry { class, selector, method };
    }

    pub fn flush(&mut self) {
        self.entries.fill(Entry::EMPTY);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(3)]
    #[case(1000)]
    fn sizes_must_be_powers_of_two(#[case] size: usize) {
        assert!(MethodCache::new(size).is_err());
    }

    #[test]
    fn entries_are_found_until_flushed() {
        let mut cache = MethodCache::new(16).unwrap();
        let class = Oop::from_offset(64);
        let selector = Oop::from_offset(128);
        let method = Oop::from_offset(256);
        assert_eq!(cache.probe(class, selector), None);
        cache.insert(class, selector, method);
        assert_eq!(cache.probe(class, selector), Some(method));
        assert_eq!(cache.probe(selector, class), None);
        cache.flush();
        assert_eq!(cache.probe(class, selector), None);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 3);
    }

    #[test]
    fn colliding_entries_replace_each_other() {
        let mut cache = MethodCache::new(1).unwrap();
        let first = (Oop::from_offset(8), Oop::from_offset(16));
        let second = (Oop::from_offset(24), Oop::from_offset(32));
        cache.insert(first.0, first.1, Oop::from_offset(40));
        cache.insert(second.0, second.1, Oop::from_offset(48));
        assert_eq!(cache.probe(first.0, first.1), None);
        assert_eq!(cache.probe(second.0, second.1), Some(Oop::from_offset(48)));
    }
}
