//! Cartesian product ("grammar intersection") of child cells.
//!
//! For a target span, every populated left child in `(start, m)` is paired
//! with every compatible right child in `(m, end)`. Pairs are packed into a
//! dense vector indexed by packed key that keeps, per key, the best joint
//! inside score and the midpoint that achieved it (max-plus union).

use crate::chart::{Chart, NO_MIDPOINT};
use crate::grammar::Grammar;
use crate::packing::{PackedKey, PackingFunction, INVALID_KEY};
use crate::semiring::{improves, LogProb, UNPOPULATED};
use bit_set::BitSet;

/// How midpoints are combined before binary SpMV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CartesianProductStrategy {
    /// Union every midpoint into one vector, then multiply once.
    #[default]
    Unioned,
    /// Multiply after each midpoint; the temporary cell takes the max.
    PerMidpoint,
}

/// Dense vector over the packed key space.
///
/// Only keys written since the last [`clear`](Self::clear) are reset, so
/// reusing the vector costs time proportional to what the last cell wrote.
#[derive(Debug, Clone)]
pub struct CartesianProductVector {
    inside: Vec<LogProb>,
    midpoints: Vec<u32>,
    touched: Vec<PackedKey>,
}

impl CartesianProductVector {
    pub fn new(size: usize) -> Self {
        CartesianProductVector {
            inside: vec![UNPOPULATED; size],
            midpoints: vec![NO_MIDPOINT; size],
            touched: Vec::new(),
        }
    }

    pub fn for_grammar(grammar: &Grammar) -> Self {
        Self::new(grammar.packing().packed_array_size())
    }

    pub fn size(&self) -> usize {
        self.inside.len()
    }

    /// Reset exactly the slots written since the last clear.
    pub fn clear(&mut self) {
        for &key in &self.touched {
            self.inside[key as usize] = UNPOPULATED;
            self.midpoints[key as usize] = NO_MIDPOINT;
        }
        self.touched.clear();
    }

    /// Reset every slot.
    pub fn reset_all(&mut self) {
        self.inside.fill(UNPOPULATED);
        self.midpoints.fill(NO_MIDPOINT);
        self.touched.clear();
    }

    /// Keep the max per key; ties go to the lower midpoint.
    #[inline(always)]
    pub fn offer(&mut self, key: PackedKey, inside: LogProb, midpoint: u32) -> bool {
        let i = key as usize;
        let current = self.inside[i];
        let wins = improves(inside, current)
            || (inside == current && current != UNPOPULATED && midpoint < self.midpoints[i]);
        if !wins {
            return false;
        }
        if self.midpoints[i] == NO_MIDPOINT {
            self.touched.push(key);
        }
        self.inside[i] = inside;
        self.midpoints[i] = midpoint;
        true
    }

    #[inline(always)]
    pub fn inside(&self, key: PackedKey) -> LogProb {
        self.inside[key as usize]
    }

    /// Winning midpoint, or [`NO_MIDPOINT`] if the key is absent.
    #[inline(always)]
    pub fn midpoint(&self, key: PackedKey) -> u32 {
        self.midpoints[key as usize]
    }

    #[inline(always)]
    pub fn is_populated(&self, key: PackedKey) -> bool {
        self.midpoints[key as usize] != NO_MIDPOINT
    }

    /// Keys written since the last clear, in first-write order.
    pub fn touched(&self) -> &[PackedKey] {
        &self.touched
    }

    pub fn len(&self) -> usize {
        self.touched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }

    /// (key, inside, midpoint) for every populated key, ascending by key.
    pub fn entries(&self) -> Vec<(PackedKey, LogProb, u32)> {
        let mut keys = self.touched.clone();
        keys.sort_unstable();
        keys.into_iter()
            .map(|k| (k, self.inside(k), self.midpoint(k)))
            .collect()
    }
}

/// Restricts which non-terminals may take part as left / right children.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildFilter<'a> {
    pub left: Option<&'a BitSet>,
    pub right: Option<&'a BitSet>,
}

impl<'a> ChildFilter<'a> {
    pub fn none() -> Self {
        ChildFilter::default()
    }

    #[inline(always)]
    fn allows_left(&self, nt: u32) -> bool {
        self.left.map_or(true, |s| s.contains(nt as usize))
    }

    #[inline(always)]
    fn allows_right(&self, nt: u32) -> bool {
        self.right.map_or(true, |s| s.contains(nt as usize))
    }
}

/// Union the child pairs of `(start, end)` over `midpoints` into `cpv`.
///
/// Child cells must be finalized. Returns the number of pairs offered.
pub fn cartesian_product(
    grammar: &Grammar,
    chart: &Chart,
    start: usize,
    end: usize,
    midpoints: impl IntoIterator<Item = usize>,
    filter: ChildFilter<'_>,
    cpv: &mut CartesianProductVector,
) -> usize {
    let packing = grammar.packing();
    let mut offered = 0;

    for mid in midpoints {
        debug_assert!(start < mid && mid < end);
        let left = chart.cell(start, mid);
        let right = chart.cell(mid, end);
        debug_assert!(left.is_finalized() && right.is_finalized());

        let (Some((left_lo, left_hi)), Some((right_lo, right_hi))) =
            (left.left_child_bounds(), right.right_child_bounds())
        else {
            continue;
        };

        let left_nts = left.nonterminals();
        let left_inside = left.inside_probabilities();
        let right_nts = right.nonterminals();
        let right_inside = right.inside_probabilities();

        for i in left.range_of(left_lo, left_hi) {
            let l = left_nts[i];
            if !filter.allows_left(l) {
                continue;
            }
            let Some((sibling_lo, sibling_hi)) = grammar.right_sibling_bounds(l) else {
                continue;
            };
            let lo = sibling_lo.max(right_lo);
            let hi = sibling_hi.min(right_hi);
            if lo > hi {
                continue;
            }

            let l_inside = left_inside[i];
            for j in right.range_of(lo, hi) {
                let r = right_nts[j];
                if !filter.allows_right(r) {
                    continue;
                }
                let key = packing.pack(l, r);
                if key == INVALID_KEY {
                    continue;
                }
                cpv.offer(key, l_inside + right_inside[j], mid as u32);
                offered += 1;
            }
        }
    }
    offered
}
