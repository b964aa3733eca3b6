//! Packing functions: bijections from child pairs to dense integer keys.
//!
//! A packed key names the children of a production. Binary productions pack an
//! ordered (left, right) pair of non-terminals; unary and lexical productions
//! pack a single child with a sentinel standing in for the right child. Keys of
//! binary pairs fall in `0..packed_array_size()` so callers can index dense
//! arrays (the cartesian-product vector) directly by key.
//!
//! Two schemes share one contract:
//!
//! - [`LeftShiftPacking`]: `left << shift | right`, unpacked with a shift and a
//!   mask. Pairs that never occur in the grammar are filtered by a bit vector.
//! - [`PerfectHashPacking`]: a minimal perfect map over the observed pairs.
//!   Smaller key space, one binary search per pack.

use crate::error::{ParseError, Result};
use bit_set::BitSet;

/// A packed child-pair key.
pub type PackedKey = u32;

/// Returned by every `pack*` call whose arguments fall outside the key space.
pub const INVALID_KEY: PackedKey = u32::MAX;

/// Right child reported by [`PackingFunction::unpack_right_child`] for unary keys.
pub const UNARY_PRODUCTION: u32 = u32::MAX - 1;

/// Right child reported by [`PackingFunction::unpack_right_child`] for lexical keys.
pub const LEXICAL_PRODUCTION: u32 = u32::MAX - 2;

/// Largest key any scheme may hand out; everything above is reserved.
const MAX_KEY: u64 = (u32::MAX - 3) as u64;

/// Contract shared by all packing schemes.
///
/// Packing never fails loudly: pairs outside the key space, or filtered as
/// impossible under the grammar, come back as [`INVALID_KEY`] and callers must
/// treat that as "no such entry".
pub trait PackingFunction {
    fn pack(&self, left: u32, right: u32) -> PackedKey;

    fn pack_unary(&self, child: u32) -> PackedKey;

    fn pack_lexical(&self, terminal: u32) -> PackedKey;

    fn unpack_left_child(&self, key: PackedKey) -> u32;

    /// The right child, or [`UNARY_PRODUCTION`] / [`LEXICAL_PRODUCTION`].
    fn unpack_right_child(&self, key: PackedKey) -> u32;

    /// Size of a dense array indexed by any valid binary key.
    fn packed_array_size(&self) -> usize;

    fn unpack(&self, key: PackedKey) -> (u32, u32) {
        (self.unpack_left_child(key), self.unpack_right_child(key))
    }
}

/// Selects the packing scheme a grammar is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackingScheme {
    #[default]
    LeftShift,
    PerfectHash,
}

/// Fixed left-shift packing with a bit-vector validity filter.
#[derive(Debug, Clone)]
pub struct LeftShiftPacking {
    num_nonterminals: u32,
    shift: u32,
    mask: u32,
    valid: BitSet,
}

impl LeftShiftPacking {
    /// Build for `num_nonterminals` non-terminals and `lexicon_size` terminals,
    /// accepting only the `observed` binary pairs.
    pub fn new(
        num_nonterminals: usize,
        lexicon_size: usize,
        observed: impl IntoIterator<Item = (u32, u32)>,
    ) -> Result<Self> {
        let nt = num_nonterminals as u32;
        // Right-child codes: 0..nt, then the unary and lexical codes.
        let max_code = nt + 1;
        let shift = 32 - max_code.leading_zeros();
        let mask = (1u32 << shift) - 1;

        let max_left = num_nonterminals.max(lexicon_size).saturating_sub(1) as u64;
        if (max_left << shift) | mask as u64 > MAX_KEY {
            return Err(ParseError::PackingOverflow {
                left: max_left as u32,
                right: max_code,
                bits: 32,
            });
        }

        let mut packing = LeftShiftPacking {
            num_nonterminals: nt,
            shift,
            mask,
            valid: BitSet::with_capacity((nt as usize) << shift),
        };
        for (left, right) in observed {
            if left >= nt || right >= nt {
                return Err(ParseError::NonTerminalOutOfRange {
                    index: left.max(right),
                    count: num_nonterminals,
                });
            }
            let key = packing.raw_key(left, right);
            packing.valid.insert(key as usize);
        }
        Ok(packing)
    }

    #[inline(always)]
    fn raw_key(&self, left: u32, code: u32) -> PackedKey {
        (left << self.shift) | code
    }

    /// Number of bits reserved for the right child.
    pub fn shift(&self) -> u32 {
        self.shift
    }
}

impl PackingFunction for LeftShiftPacking {
    #[inline]
    fn pack(&self, left: u32, right: u32) -> PackedKey {
        if left >= self.num_nonterminals || right >= self.num_nonterminals {
            return INVALID_KEY;
        }
        let key = self.raw_key(left, right);
        if self.valid.contains(key as usize) {
            key
        } else {
            INVALID_KEY
        }
    }

    fn pack_unary(&self, child: u32) -> PackedKey {
        if child >= self.num_nonterminals {
            return INVALID_KEY;
        }
        self.raw_key(child, self.num_nonterminals)
    }

    fn pack_lexical(&self, terminal: u32) -> PackedKey {
        if (terminal as u64) << self.shift > MAX_KEY {
            return INVALID_KEY;
        }
        self.raw_key(terminal, self.num_nonterminals + 1)
    }

    #[inline]
    fn unpack_left_child(&self, key: PackedKey) -> u32 {
        key >> self.shift
    }

    #[inline]
    fn unpack_right_child(&self, key: PackedKey) -> u32 {
        let code = key & self.mask;
        if code == self.num_nonterminals {
            UNARY_PRODUCTION
        } else if code == self.num_nonterminals + 1 {
            LEXICAL_PRODUCTION
        } else {
            code
        }
    }

    fn packed_array_size(&self) -> usize {
        (self.num_nonterminals as usize) << self.shift
    }
}

/// Minimal perfect map over the binary pairs the grammar actually uses.
///
/// A pair's key is `offsets[left]` plus the rank of `right` among the sorted
/// right siblings observed with `left`. Unary and lexical keys follow the
/// binary range, interleaved (`2c` unary, `2c + 1` lexical).
#[derive(Debug, Clone)]
pub struct PerfectHashPacking {
    num_nonterminals: u32,
    offsets: Vec<u32>,
    rights: Vec<u32>,
    lefts: Vec<u32>,
}

impl PerfectHashPacking {
    pub fn new(
        num_nonterminals: usize,
        lexicon_size: usize,
        observed: impl IntoIterator<Item = (u32, u32)>,
    ) -> Result<Self> {
        let nt = num_nonterminals as u32;
        let mut siblings: Vec<Vec<u32>> = vec![Vec::new(); num_nonterminals];
        for (left, right) in observed {
            if left >= nt || right >= nt {
                return Err(ParseError::NonTerminalOutOfRange {
                    index: left.max(right),
                    count: num_nonterminals,
                });
            }
            siblings[left as usize].push(right);
        }

        let mut offsets = Vec::with_capacity(num_nonterminals + 1);
        let mut rights = Vec::new();
        let mut lefts = Vec::new();
        offsets.push(0);
        for (left, rs) in siblings.iter_mut().enumerate() {
            rs.sort_unstable();
            rs.dedup();
            rights.extend_from_slice(rs);
            lefts.extend(std::iter::repeat(left as u32).take(rs.len()));
            offsets.push(rights.len() as u32);
        }

        let max_child = num_nonterminals.max(lexicon_size).saturating_sub(1) as u64;
        if rights.len() as u64 + 2 * max_child + 1 > MAX_KEY {
            return Err(ParseError::PackingOverflow {
                left: max_child as u32,
                right: LEXICAL_PRODUCTION,
                bits: 32,
            });
        }

        Ok(PerfectHashPacking {
            num_nonterminals: nt,
            offsets,
            rights,
            lefts,
        })
    }

    #[inline(always)]
    fn binary_pairs(&self) -> u32 {
        self.rights.len() as u32
    }
}

impl PackingFunction for PerfectHashPacking {
    #[inline]
    fn pack(&self, left: u32, right: u32) -> PackedKey {
        if left >= self.num_nonterminals {
            return INVALID_KEY;
        }
        let lo = self.offsets[left as usize] as usize;
        let hi = self.offsets[left as usize + 1] as usize;
        match self.rights[lo..hi].binary_search(&right) {
            Ok(rank) => (lo + rank) as PackedKey,
            Err(_) => INVALID_KEY,
        }
    }

    fn pack_unary(&self, child: u32) -> PackedKey {
        if child >= self.num_nonterminals {
            return INVALID_KEY;
        }
        self.binary_pairs() + 2 * child
    }

    fn pack_lexical(&self, terminal: u32) -> PackedKey {
        let key = self.binary_pairs() as u64 + 2 * terminal as u64 + 1;
        if key > MAX_KEY {
            return INVALID_KEY;
        }
        key as PackedKey
    }

    #[inline]
    fn unpack_left_child(&self, key: PackedKey) -> u32 {
        if key < self.binary_pairs() {
            self.lefts[key as usize]
        } else {
            (key - self.binary_pairs()) / 2
        }
    }

    #[inline]
    fn unpack_right_child(&self, key: PackedKey) -> u32 {
        if key < self.binary_pairs() {
            self.rights[key as usize]
        } else if (key - self.binary_pairs()) % 2 == 0 {
            UNARY_PRODUCTION
        } else {
            LEXICAL_PRODUCTION
        }
    }

    fn packed_array_size(&self) -> usize {
        self.rights.len()
    }
}

/// A packing function chosen at grammar construction.
#[derive(Debug, Clone)]
pub enum Packing {
    LeftShift(LeftShiftPacking),
    PerfectHash(PerfectHashPacking),
}

impl Packing {
    pub fn build(
        scheme: PackingScheme,
        num_nonterminals: usize,
        lexicon_size: usize,
        observed: impl IntoIterator<Item = (u32, u32)>,
    ) -> Result<Self> {
        Ok(match scheme {
            PackingScheme::LeftShift => Packing::LeftShift(LeftShiftPacking::new(
                num_nonterminals,
                lexicon_size,
                observed,
            )?),
            PackingScheme::PerfectHash => Packing::PerfectHash(PerfectHashPacking::new(
                num_nonterminals,
                lexicon_size,
                observed,
            )?),
        })
    }

    pub fn scheme(&self) -> PackingScheme {
        match self {
            Packing::LeftShift(_) => PackingScheme::LeftShift,
            Packing::PerfectHash(_) => PackingScheme::PerfectHash,
        }
    }
}

impl PackingFunction for Packing {
    #[inline]
    fn pack(&self, left: u32, right: u32) -> PackedKey {
        match self {
            Packing::LeftShift(p) => p.pack(left, right),
            Packing::PerfectHash(p) => p.pack(left, right),
        }
    }

    fn pack_unary(&self, child: u32) -> PackedKey {
        match self {
            Packing::LeftShift(p) => p.pack_unary(child),
            Packing::PerfectHash(p) => p.pack_unary(child),
        }
    }

    fn pack_lexical(&self, terminal: u32) -> PackedKey {
        match self {
            Packing::LeftShift(p) => p.pack_lexical(terminal),
            Packing::PerfectHash(p) => p.pack_lexical(terminal),
        }
    }

    #[inline]
    fn unpack_left_child(&self, key: PackedKey) -> u32 {
        match self {
            Packing::LeftShift(p) => p.unpack_left_child(key),
            Packing::PerfectHash(p) => p.unpack_left_child(key),
        }
    }

    #[inline]
    fn unpack_right_child(&self, key: PackedKey) -> u32 {
        match self {
            Packing::LeftShift(p) => p.unpack_right_child(key),
            Packing::PerfectHash(p) => p.unpack_right_child(key),
        }
    }

    fn packed_array_size(&self) -> usize {
        match self {
            Packing::LeftShift(p) => p.packed_array_size(),
            Packing::PerfectHash(p) => p.packed_array_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_pairs(n: u32) -> Vec<(u32, u32)> {
        (0..n).flat_map(|l| (0..n).map(move |r| (l, r))).collect()
    }

    fn check_round_trip(packing: &impl PackingFunction, pairs: &[(u32, u32)]) {
        for &(left, right) in pairs {
            let key = packing.pack(left, right);
            assert_ne!(key, INVALID_KEY, "({}, {}) should pack", left, right);
            assert!((key as usize) < packing.packed_array_size());
            assert_eq!(packing.unpack_left_child(key), left);
            assert_eq!(packing.unpack_right_child(key), right);
        }
    }

    #[test]
    fn test_left_shift_round_trip() {
        let pairs = all_pairs(7);
        let packing = LeftShiftPacking::new(7, 20, pairs.iter().copied()).unwrap();
        check_round_trip(&packing, &pairs);
    }

    #[test]
    fn test_perfect_hash_round_trip() {
        let pairs = vec![(0, 3), (0, 1), (2, 2), (4, 0), (4, 4)];
        let packing = PerfectHashPacking::new(5, 3, pairs.iter().copied()).unwrap();
        assert_eq!(packing.packed_array_size(), 5);
        check_round_trip(&packing, &pairs);
    }

    #[test]
    fn test_unobserved_pairs_are_invalid() {
        let pairs = vec![(0, 1), (1, 2)];
        let shift = LeftShiftPacking::new(3, 3, pairs.iter().copied()).unwrap();
        let hash = PerfectHashPacking::new(3, 3, pairs.iter().copied()).unwrap();

        assert_eq!(shift.pack(1, 0), INVALID_KEY);
        assert_eq!(hash.pack(1, 0), INVALID_KEY);
        // Outside the non-terminal space entirely.
        assert_eq!(shift.pack(3, 0), INVALID_KEY);
        assert_eq!(hash.pack(0, 9), INVALID_KEY);
    }

    #[test]
    fn test_unary_and_lexical_sentinels() {
        let pairs = vec![(0, 1), (1, 1)];
        let schemes = [
            Packing::build(PackingScheme::LeftShift, 2, 10, pairs.iter().copied()).unwrap(),
            Packing::build(PackingScheme::PerfectHash, 2, 10, pairs.iter().copied()).unwrap(),
        ];
        for packing in &schemes {
            let unary = packing.pack_unary(1);
            assert_eq!(packing.unpack(unary), (1, UNARY_PRODUCTION));

            // Terminals may exceed the non-terminal count.
            let lexical = packing.pack_lexical(9);
            assert_eq!(packing.unpack(lexical), (9, LEXICAL_PRODUCTION));

            assert_eq!(packing.pack_unary(2), INVALID_KEY);
        }
    }

    #[test]
    fn test_left_shift_overflow_is_reported() {
        let result = LeftShiftPacking::new(1 << 16, 1 << 17, std::iter::empty());
        assert!(matches!(result, Err(ParseError::PackingOverflow { .. })));
    }

    #[test]
    fn test_out_of_range_pair_is_rejected_at_build() {
        let result = PerfectHashPacking::new(2, 2, vec![(0, 5)]);
        assert!(matches!(
            result,
            Err(ParseError::NonTerminalOutOfRange { index: 5, .. })
        ));
    }
}
