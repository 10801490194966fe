//! Randomized-sampling page digest.
//!
//! A full-page hash costs a cache-busting pass over 4 KiB per candidate per
//! scan. The digest here folds only a prefix of a per-process random
//! permutation of the page's word offsets, making the average cost sublinear
//! in page size while keeping strong distinguishing power against real
//! workloads. A permutation rather than a contiguous prefix means pages that
//! differ only past a common header still separate.
//!
//! The canonical all-zero checksum is precomputed against the same
//! permutation so the zero fast path is a single compare.

use crate::mm::PAGE_WORDS;
use crate::rng::XorShift64;

/// Number of sampled words when digesting a page: 1/16 of the page.
pub const SAMPLE_STRENGTH: usize = PAGE_WORDS / 16;

const HASH_SEED: u32 = 0xdead_beef;

/// Sampled-page hasher sharing one shuffled offset table engine-wide.
#[derive(Clone, Debug)]
pub struct PageHasher {
    /// Fisher-Yates shuffle of `0..PAGE_WORDS`, fixed at construction.
    perm: Vec<u32>,
    strength: usize,
    zero_checksum: u32,
}

impl PageHasher {
    /// Build the permutation table from `seed` and precompute the zero-page
    /// checksum. Same seed, same table, same digests.
    pub fn new(seed: u64) -> Self {
        Self::with_strength(seed, SAMPLE_STRENGTH)
    }

    /// As [`new`](Self::new) with an explicit sample strength (tests use
    /// small strengths to force collisions).
    pub fn with_strength(seed: u64, strength: usize) -> Self {
        assert!(strength > 0 && strength <= PAGE_WORDS);

        let mut perm: Vec<u32> = (0..PAGE_WORDS as u32).collect();
        let mut rng = XorShift64::new(seed);
        for i in 0..PAGE_WORDS {
            let remaining = (PAGE_WORDS - i) as u64;
            let j = i + rng.next_below(remaining) as usize;
            perm.swap(i, j);
        }

        let mut hasher = Self {
            perm,
            strength,
            zero_checksum: 0,
        };
        hasher.zero_checksum = hasher.digest(&[0u32; PAGE_WORDS]);
        hasher
    }

    /// Digest a page's words through the sampled fold.
    pub fn digest(&self, words: &[u32]) -> u32 {
        assert_eq!(words.len(), PAGE_WORDS, "digest input must be one page");

        let mut hash = HASH_SEED;
        for &pos in &self.perm[..self.strength] {
            hash = hash.wrapping_add(words[pos as usize]);
            hash = hash.wrapping_add(hash << 8);
            hash ^= hash >> 12;
        }
        hash
    }

    /// Checksum every all-zero page digests to.
    #[inline]
    pub fn zero_checksum(&self) -> u32 {
        self.zero_checksum
    }
}
