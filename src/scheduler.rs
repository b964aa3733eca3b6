//! Cell visiting order.
//!
//! A schedule is a sequence of [`SpanBatch`]es in increasing span order.
//! Cells within a batch only read cells of smaller spans, so they may be
//! processed concurrently; a batch must be fully committed before the next
//! one starts.

use crate::constrained::ConstrainingChart;
use crate::grammar::Grammar;
use bit_set::BitSet;
use std::ops::Range;

/// What a reference chart allows at a visited cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitConstraint {
    /// The single legal midpoint; `None` for a word.
    pub midpoint: Option<usize>,
    /// Licensed base categories, top of the unary chain first.
    pub chain: Vec<u32>,
    /// Top categories of the left and right child cells.
    pub children: Option<(u32, u32)>,
}

impl VisitConstraint {
    pub fn unary_depth(&self) -> usize {
        self.chain.len() - 1
    }

    /// Non-terminals licensed at chain `level` (0 is the top).
    pub fn licensed(&self, grammar: &Grammar, level: usize) -> BitSet {
        splits(grammar, self.chain[level])
    }

    /// Non-terminals licensed as (left, right) children.
    pub fn licensed_children(&self, grammar: &Grammar) -> Option<(BitSet, BitSet)> {
        self.children
            .map(|(left, right)| (splits(grammar, left), splits(grammar, right)))
    }
}

fn splits(grammar: &Grammar, base: u32) -> BitSet {
    grammar.splits_of(base).iter().map(|&nt| nt as usize).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellVisit {
    pub start: usize,
    pub end: usize,
    pub constraint: Option<VisitConstraint>,
}

impl CellVisit {
    pub fn new(start: usize, end: usize) -> Self {
        CellVisit {
            start,
            end,
            constraint: None,
        }
    }

    pub fn span(&self) -> usize {
        self.end - self.start
    }

    pub fn is_lexical(&self) -> bool {
        self.span() == 1
    }

    /// Midpoints the cartesian product ranges over.
    pub fn midpoints(&self) -> Range<usize> {
        match self.constraint.as_ref().and_then(|c| c.midpoint) {
            Some(mid) => mid..mid + 1,
            None => self.start + 1..self.end,
        }
    }
}

/// All cells of one span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanBatch {
    pub span: usize,
    pub visits: Vec<CellVisit>,
}

pub trait CellSelector {
    fn schedule(&self) -> Vec<SpanBatch>;
}

/// Every cell, shortest spans first, left to right.
#[derive(Debug, Clone, Copy)]
pub struct BottomUpSelector {
    size: usize,
}

impl BottomUpSelector {
    pub fn new(size: usize) -> Self {
        BottomUpSelector { size }
    }
}

impl CellSelector for BottomUpSelector {
    fn schedule(&self) -> Vec<SpanBatch> {
        (1..=self.size)
            .map(|span| SpanBatch {
                span,
                visits: (0..=self.size - span)
                    .map(|start| CellVisit::new(start, start + span))
                    .collect(),
            })
            .collect()
    }
}

/// Only the constituents of a reference tree.
#[derive(Debug, Clone, Copy)]
pub struct ConstrainedSelector<'a> {
    chart: &'a ConstrainingChart,
}

impl<'a> ConstrainedSelector<'a> {
    pub fn new(chart: &'a ConstrainingChart) -> Self {
        ConstrainedSelector { chart }
    }
}

impl CellSelector for ConstrainedSelector<'_> {
    fn schedule(&self) -> Vec<SpanBatch> {
        let mut batches: Vec<SpanBatch> = Vec::new();
        for cell in self.chart.cells() {
            let children = cell.midpoint.and_then(|mid| {
                let left = self.chart.cell(cell.start, mid)?;
                let right = self.chart.cell(mid, cell.end)?;
                Some((left.top(), right.top()))
            });
            let visit = CellVisit {
                start: cell.start,
                end: cell.end,
                constraint: Some(VisitConstraint {
                    midpoint: cell.midpoint,
                    chain: cell.chain.clone(),
                    children,
                }),
            };
            match batches.last_mut() {
                Some(batch) if batch.span == cell.span() => batch.visits.push(visit),
                _ => batches.push(SpanBatch {
                    span: cell.span(),
                    visits: vec![visit],
                }),
            }
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::GrammarBuilder;
    use crate::tree::ParseTree;
    use std::sync::Arc;

    #[test]
    fn test_bottom_up_order() {
        let batches = BottomUpSelector::new(3).schedule();
        let order: Vec<(usize, usize)> = batches
            .iter()
            .flat_map(|b| b.visits.iter().map(|v| (v.start, v.end)))
            .collect();
        assert_eq!(order, vec![(0, 1), (1, 2), (2, 3), (0, 2), (1, 3), (0, 3)]);
        assert_eq!(batches[2].visits[0].midpoints(), 1..3);
        assert!(batches.iter().all(|b| b.visits.iter().all(|v| v.span() == b.span)));
    }

    #[test]
    fn test_constrained_visits() {
        let g = Arc::new(
            GrammarBuilder::new()
                .start("S")
                .unary("S", "A", 0.0)
                .binary("A", "A", "B", -1.0)
                .lexical("A", "c", 0.0)
                .lexical("B", "d", 0.0)
                .split("A_0", "A")
                .split("A_1", "A")
                .build()
                .unwrap(),
        );
        let tree = ParseTree::from_bracketed("(S (A (A c) (B d)))", &g).unwrap();
        let chart = ConstrainingChart::from_tree(g.clone(), &tree).unwrap();
        let batches = ConstrainedSelector::new(&chart).schedule();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].visits.len(), 2);
        let top = &batches[1].visits[0];
        assert_eq!((top.start, top.end), (0, 2));
        assert_eq!(top.midpoints(), 1..2);

        let constraint = top.constraint.as_ref().unwrap();
        assert_eq!(constraint.unary_depth(), 1);
        let a = g.nonterminal("A").unwrap();
        let b = g.nonterminal("B").unwrap();
        assert_eq!(constraint.children, Some((a, b)));

        let (left, right) = constraint.licensed_children(&g).unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.contains(g.nonterminal("A_1").unwrap() as usize));
        assert!(right.contains(b as usize));
        assert!(constraint.licensed(&g, 0).contains(g.start_symbol() as usize));
    }
}
