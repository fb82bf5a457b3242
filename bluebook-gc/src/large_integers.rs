use num_bigint::BigInt;

/// Storage for the values of large integer objects.
///
/// A large integer object only holds a slot index; the arbitrary-precision value lives here so
/// the arena stays a flat array of words. Slots of dead objects are released by the compactor,
/// exactly once per object.
#[derive(Debug, Default)]
pub struct LargeIntegerTable {
    slots: Vec<Option<BigInt>>,
    free: Vec<usize>,
}

impl LargeIntegerTable {
    pub fn insert(&mut self, value: BigInt) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(value);
                slot
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        }
    }

    pub fn get(&self, slot: usize) -> Option<&BigInt> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn replace(&mut self, slot: usize, value: BigInt) {
        self.slots[slot] = Some(value);
    }

    /// Releases a slot. Releasing an empty slot means an object was finalized twice.
    pub fn release(&mut self, slot: usize) {
        match self.slots.get_mut(slot).and_then(Option::take) {
            Some(_) => self.free.push(slot),
            None => panic!("large integer slot {slot} released twice"),
        }
    }

    /// Number of values currently held.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
