//! Fixed-width set of NUMA node IDs.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitMaskError {
    #[error("bit number must be less than {max}, got {bit}", max = BitMask::MAX_BITS)]
    OutOfRange { bit: usize },
}

/// A set of NUMA node IDs in the range `0..64`.
///
/// Values are immutable; `and`/`or` return new masks. Serialized as the list
/// of set bits so checkpoints and API payloads stay readable.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<usize>", try_from = "Vec<usize>")]
pub struct BitMask(u64);

impl BitMask {
    pub const MAX_BITS: usize = 64;

    /// Builds a mask with the given bits set. Fails if any bit is `>= 64`.
    pub fn new(bits: &[usize]) -> Result<Self, BitMaskError> {
        let mut mask = 0u64;
        for &bit in bits {
            if bit >= Self::MAX_BITS {
                return Err(BitMaskError::OutOfRange { bit });
            }
            mask |= 1 << bit;
        }
        Ok(Self(mask))
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn and(&self, other: &BitMask) -> Self {
        Self(self.0 & other.0)
    }

    pub fn or(&self, other: &BitMask) -> Self {
        Self(self.0 | other.0)
    }

    /// Intersection of `self` with every mask in `others`.
    pub fn and_all<'a>(&self, others: impl IntoIterator<Item = &'a BitMask>) -> Self {
        others.into_iter().fold(*self, |acc, m| acc.and(m))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_set(&self, bit: usize) -> bool {
        bit < Self::MAX_BITS && self.0 & (1 << bit) != 0
    }

    /// True if at least one of `bits` is set.
    pub fn any_set(&self, bits: &[usize]) -> bool {
        bits.iter().any(|&bit| self.is_set(bit))
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Set bits in ascending order.
    pub fn get_bits(&self) -> Vec<usize> {
        (0..Self::MAX_BITS).filter(|&bit| self.is_set(bit)).collect()
    }

    /// True if this mask has strictly fewer bits set than `other`.
    pub fn is_narrower_than(&self, other: &BitMask) -> bool {
        self.count() < other.count()
    }
}

impl fmt::Display for BitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits: Vec<String> = self.get_bits().iter().map(ToString::to_string).collect();
        write!(f, "{{{}}}", bits.join(","))
    }
}

impl fmt::Debug for BitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitMask{self}")
    }
}

impl From<BitMask> for Vec<usize> {
    fn from(mask: BitMask) -> Self {
        mask.get_bits()
    }
}

impl TryFrom<Vec<usize>> for BitMask {
    type Error = BitMaskError;

    fn try_from(bits: Vec<usize>) -> Result<Self, Self::Error> {
        BitMask::new(&bits)
    }
}

/// Calls `callback` once for every non-empty subset of `bits`, in order of
/// increasing subset size and, within a size, lexicographically by position.
///
/// For `[0, 1, 2]` the order is `{0} {1} {2} {0,1} {0,2} {1,2} {0,1,2}`.
pub fn iterate_bit_masks(bits: &[usize], mut callback: impl FnMut(BitMask)) {
    fn combine(
        bits: &[usize],
        accum: &mut Vec<usize>,
        size: usize,
        callback: &mut dyn FnMut(BitMask),
    ) {
        if accum.len() == size {
            if let Ok(mask) = BitMask::new(accum) {
                callback(mask);
            }
            return;
        }
        for (i, &bit) in bits.iter().enumerate() {
            accum.push(bit);
            combine(&bits[i + 1..], accum, size, callback);
            accum.pop();
        }
    }

    let mut accum = Vec::with_capacity(bits.len());
    for size in 1..=bits.len() {
        combine(bits, &mut accum, size, &mut callback);
    }
}
