//! Sparse matrix × vector kernels over the max-plus semiring.
//!
//! Binary SpMV multiplies the grammar's binary rule matrix by a
//! [`CartesianProductVector`] into a [`TemporaryCell`]; unary SpMV applies
//! the unary matrix exactly once to the entries already in the cell. Both
//! orientations produce the same per-parent arg-max: rows scan their keys in
//! ascending order and columns are visited in ascending key order, so ties
//! resolve identically.

use crate::cartesian::CartesianProductVector;
use crate::chart::{TemporaryCell, NO_MIDPOINT};
use crate::grammar::Grammar;
use crate::packing::{PackingFunction, UNARY_PRODUCTION};
use crate::semiring::{improves, LogProb, UNPOPULATED};
use bit_set::BitSet;
use std::ops::Range;

/// Traversal order of the binary rule matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpmvLayout {
    /// One parent per row; scan its child keys.
    #[default]
    RowMajor,
    /// One child key per column; scatter to its parents.
    ColumnMajor,
}

#[inline(always)]
fn allows(filter: Option<&BitSet>, nt: u32) -> bool {
    filter.map_or(true, |s| s.contains(nt as usize))
}

/// Row-major binary SpMV over parent rows `rows`.
///
/// Returns the number of rule × child products evaluated.
pub fn binary_spmv_rows(
    grammar: &Grammar,
    cpv: &CartesianProductVector,
    rows: Range<usize>,
    parents: Option<&BitSet>,
    temp: &mut TemporaryCell,
) -> usize {
    let csr = grammar.binary_csr();
    let mut evaluated = 0;
    for parent in rows {
        if !allows(parents, parent as u32) {
            continue;
        }
        let (keys, probs) = csr.row(parent);
        let mut best = UNPOPULATED;
        let mut best_key = 0;
        let mut best_mid = NO_MIDPOINT;
        for (&key, &prob) in keys.iter().zip(probs) {
            let mid = cpv.midpoint(key);
            if mid == NO_MIDPOINT {
                continue;
            }
            evaluated += 1;
            let score = prob + cpv.inside(key);
            if improves(score, best) {
                best = score;
                best_key = key;
                best_mid = mid;
            }
        }
        if best_mid != NO_MIDPOINT {
            temp.update(parent as u32, best, best_key, best_mid);
        }
    }
    evaluated
}

/// Column-major binary SpMV over stored column positions `columns`.
pub fn binary_spmv_columns(
    grammar: &Grammar,
    cpv: &CartesianProductVector,
    columns: Range<usize>,
    parents: Option<&BitSet>,
    temp: &mut TemporaryCell,
) -> usize {
    let csc = grammar.binary_csc();
    let mut evaluated = 0;
    for i in columns {
        let (key, column_parents, probs) = csc.column_at(i);
        let mid = cpv.midpoint(key);
        if mid == NO_MIDPOINT {
            continue;
        }
        let child = cpv.inside(key);
        for (&parent, &prob) in column_parents.iter().zip(probs) {
            if !allows(parents, parent) {
                continue;
            }
            evaluated += 1;
            temp.update(parent, prob + child, key, mid);
        }
    }
    evaluated
}

/// Binary SpMV over the whole matrix in the given layout.
pub fn binary_spmv(
    grammar: &Grammar,
    layout: SpmvLayout,
    cpv: &CartesianProductVector,
    parents: Option<&BitSet>,
    temp: &mut TemporaryCell,
) -> usize {
    match layout {
        SpmvLayout::RowMajor => {
            binary_spmv_rows(grammar, cpv, 0..grammar.num_nonterminals(), parents, temp)
        }
        SpmvLayout::ColumnMajor => {
            let columns = grammar.binary_csc().num_columns();
            binary_spmv_columns(grammar, cpv, 0..columns, parents, temp)
        }
    }
}

/// Apply the unary matrix once to the entries present in `temp`.
///
/// Children are expanded best first, each from its final entry: a child
/// whose slot was taken over by a unary edge is not expanded, and a parent
/// only changes on a strict improvement. Log probabilities are at most zero,
/// so an expanded child is never overwritten and every unary edge scores
/// exactly its child plus the rule. `snapshot` is reusable scratch.
pub fn unary_spmv(
    grammar: &Grammar,
    temp: &mut TemporaryCell,
    parents: Option<&BitSet>,
    snapshot: &mut Vec<(u32, LogProb)>,
) -> usize {
    let packing = grammar.packing();
    let end = temp.end() as u32;
    snapshot.clear();
    snapshot.extend(temp.populated().iter().map(|&nt| (nt, temp.inside(nt))));
    snapshot.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut evaluated = 0;
    for &(child, _) in snapshot.iter() {
        if packing.unpack_right_child(temp.packed_children(child)) == UNARY_PRODUCTION {
            continue;
        }
        let inside = temp.inside(child);
        let (unary_parents, probs) = grammar.unary_parents(child);
        let key = packing.pack_unary(child);
        for (&parent, &prob) in unary_parents.iter().zip(probs) {
            if !allows(parents, parent) {
                continue;
            }
            evaluated += 1;
            let candidate = prob + inside;
            if improves(candidate, temp.inside(parent)) {
                temp.update(parent, candidate, key, end);
            }
        }
    }
    evaluated
}

/// Populate a lexical cell from the grammar's lexical column for `terminal`.
pub fn lexical_spmv(
    grammar: &Grammar,
    terminal: u32,
    parents: Option<&BitSet>,
    temp: &mut TemporaryCell,
) -> usize {
    let key = grammar.packing().pack_lexical(terminal);
    let end = temp.end() as u32;
    let (lexical_parents, probs) = grammar.lexical_parents(terminal);
    let mut evaluated = 0;
    for (&parent, &prob) in lexical_parents.iter().zip(probs) {
        if allows(parents, parent) {
            evaluated += 1;
            temp.update(parent, prob, key, end);
        }
    }
    evaluated
}

/// Split `0..offsets.len() - 1` into at most `segments` contiguous ranges of
/// roughly equal non-zero count.
pub fn partition_by_nnz(offsets: &[usize], segments: usize) -> Vec<Range<usize>> {
    let len = offsets.len().saturating_sub(1);
    let segments = segments.max(1);
    if len == 0 {
        return vec![0..0];
    }
    let nnz = offsets[len];
    let mut ranges = Vec::with_capacity(segments);
    let mut from = 0;
    for s in 1..segments {
        let target = nnz * s / segments;
        let to = offsets[..=len]
            .partition_point(|&o| o <= target)
            .saturating_sub(1)
            .clamp(from, len);
        if to > from {
            ranges.push(from..to);
            from = to;
        }
    }
    ranges.push(from..len);
    ranges
}

/// Row ranges for segment-parallel row-major SpMV.
pub fn row_segments(grammar: &Grammar, segments: usize) -> Vec<Range<usize>> {
    partition_by_nnz(grammar.binary_csr().offsets(), segments)
}

/// Column-position ranges for segment-parallel column-major SpMV.
pub fn column_segments(grammar: &Grammar, segments: usize) -> Vec<Range<usize>> {
    partition_by_nnz(grammar.binary_csc().offsets(), segments)
}

/// Fold per-segment results into `target`, in segment order.
pub fn merge_segments<'a>(target: &mut TemporaryCell, parts: impl IntoIterator<Item = &'a TemporaryCell>) {
    for part in parts {
        target.merge(part);
    }
}
