// CLASSIFICATION: COMMUNITY
// Filename: regset.rs v0.2
// Author: Lukas Bower
// Date Modified: 2026-11-08

//! Fixed 256-bit register index set.
//!
//! Wraps the raw `[u64; 4]` bitmask convention used for PMC/PMD usage
//! tracking in a named type so index arithmetic stays out of call
//! sites.

/// Maximum register index representable by a [`RegisterSet`].
pub const REGSET_BITS: usize = 256;

/// Set of hardware register indices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterSet {
    words: [u64; 4],
}

impl RegisterSet {
    /// Empty set.
    pub const fn new() -> Self {
        RegisterSet { words: [0; 4] }
    }

    /// Set with indices `lo..hi` present.
    pub fn range(lo: usize, hi: usize) -> Self {
        let mut s = RegisterSet::new();
        for i in lo..hi {
            s.set(i);
        }
        s
    }

    /// Set built from the low 64 indices given as a plain mask.
    pub const fn from_low_mask(mask: u64) -> Self {
        RegisterSet {
            words: [mask, 0, 0, 0],
        }
    }

    pub fn set(&mut self, idx: usize) {
        debug_assert!(idx < REGSET_BITS);
        self.words[idx / 64] |= 1 << (idx % 64);
    }

    pub fn clear(&mut self, idx: usize) {
        debug_assert!(idx < REGSET_BITS);
        self.words[idx / 64] &= !(1 << (idx % 64));
    }

    pub fn test(&self, idx: usize) -> bool {
        idx < REGSET_BITS && self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    pub fn clear_all(&mut self) {
        self.words = [0; 4];
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of indices present.
    pub fn weight(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Union with another set.
    pub fn merge(&mut self, other: &RegisterSet) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= o;
        }
    }

    /// Intersection test.
    pub fn intersects(&self, other: &RegisterSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Low 64 indices as a plain mask, for compact wire formats.
    pub fn low_mask(&self) -> u64 {
        self.words[0]
    }

    /// Iterate set indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..REGSET_BITS).filter(move |i| self.test(*i))
    }
}
