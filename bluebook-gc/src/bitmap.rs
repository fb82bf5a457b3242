/// Number of heap words covered by one entry of the compactor's block table.
///
/// Equal to the width of a bitmap word, so the ordinal of an object within its block is a
/// single masked popcount.
pub const BLOCK_WORDS: usize = u64::BITS as usize;

/// One bit per heap word.
#[derive(Debug, Clone, Default)]
pub struct BitVector {
    bits: Vec<u64>,
}

impl BitVector {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(BLOCK_WORDS)],
        }
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        self.bits[index / BLOCK_WORDS] |= 1 << (index % BLOCK_WORDS);
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        self.bits
            .get(index / BLOCK_WORDS)
            .is_some_and(|word| word & (1 << (index % BLOCK_WORDS)) != 0)
    }

    /// Number of set bits before `index` within its block.
    #[inline]
    pub fn ordinal_in_block(&self, index: usize) -> usize {
        let below = (1u64 << (index % BLOCK_WORDS)) - 1;
        (self.bits[index / BLOCK_WORDS] & below).count_ones() as usize
    }

    /// Finds the `n`th set bit at or after `start` (`n == 0` is the first one).
    pub fn nth_set_from(&self, start: usize, mut n: usize) -> Option<usize> {
        let mut block = start / BLOCK_WORDS;
        let mut word = *self.bits.get(block)? & (!0u64 << (start % BLOCK_WORDS));
        loop {
            let ones = word.count_ones() as usize;
            if n < ones {
                for _ in 0..n {
                    word &= word - 1;
                }
                return Some(block * BLOCK_WORDS + word.trailing_zeros() as usize);
            }
            n -= ones;
            block += 1;
            word = *self.bits.get(block)?;
        }
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_count_within_the_block_only() {
        let mut bits = BitVector::new(200);
        for index in [3, 10, 63, 64, 70, 130] {
            bits.set(index);
        }
        assert_eq!(bits.ordinal_in_block(3), 0);
        assert_eq!(bits.ordinal_in_block(10), 1);
        assert_eq!(bits.ordinal_in_block(63), 2);
        assert_eq!(bits.ordinal_in_block(64), 0);
        assert_eq!(bits.ordinal_in_block(70), 1);
        assert_eq!(bits.count_ones(), 6);
        assert!(bits.get(130) && !bits.get(131) && !bits.get(10_000));
    }

    #[test]
    fn nth_set_crosses_block_boundaries() {
        let mut bits = BitVector::new(300);
        for index in [5, 60, 64, 190, 256] {
            bits.set(index);
        }
        assert_eq!(bits.nth_set_from(0, 0), Some(5));
        assert_eq!(bits.nth_set_from(5, 2), Some(64));
        assert_eq!(bits.nth_set_from(61, 1), Some(190));
        assert_eq!(bits.nth_set_from(60, 3), Some(256));
        assert_eq!(bits.nth_set_from(60, 4), None);
    }
}
