//! Packed triangular parse chart.
//!
//! Cells are addressed by `(start, end)` with `0 <= start < end <= n`, and
//! laid out span-major: every span-1 cell, then every span-2 cell, and so on.
//! Each cell owns a contiguous slice of four parallel arrays (non-terminal,
//! inside score, packed children, midpoint), sized by the cell's beam width.
//!
//! A cell is [`CellState::Open`] until [`Chart::finalize_cell`] compacts the
//! surviving entries into its slice, sorted by non-terminal, and records the
//! child-capability bounds the cartesian-product engine reads. Scratch work
//! for a cell under construction happens in a [`TemporaryCell`].

use crate::error::{ParseError, Result};
use crate::grammar::Grammar;
use crate::packing::{
    Packing, PackedKey, PackingFunction, INVALID_KEY, LEXICAL_PRODUCTION, UNARY_PRODUCTION,
};
use crate::semiring::{improves, LogProb, UNPOPULATED};
use crate::tree::ParseTree;
use std::sync::Arc;

/// Midpoint of a slot nothing has been written to.
pub const NO_MIDPOINT: u32 = u32::MAX;

/// One populated non-terminal of a cell and the production that won it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellEntry {
    pub nonterminal: u32,
    pub inside: LogProb,
    pub packed_children: PackedKey,
    /// Split point of a binary edge; `end` for unary and lexical edges.
    pub midpoint: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Open,
    Finalized,
}

/// The production behind a chart entry, decoded from its packed children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Binary { left: u32, right: u32, midpoint: u32 },
    Unary { child: u32 },
    Lexical { terminal: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestEdge {
    pub parent: u32,
    pub inside: LogProb,
    pub edge: Edge,
}

fn decode_edge(packing: &Packing, key: PackedKey, midpoint: u32) -> Option<Edge> {
    if key == INVALID_KEY {
        return None;
    }
    let left = packing.unpack_left_child(key);
    Some(match packing.unpack_right_child(key) {
        UNARY_PRODUCTION => Edge::Unary { child: left },
        LEXICAL_PRODUCTION => Edge::Lexical { terminal: left },
        right => Edge::Binary {
            left,
            right,
            midpoint,
        },
    })
}

const EMPTY_BOUNDS: (u32, u32) = (u32::MAX, 0);

#[derive(Debug, Clone, Copy)]
struct CellMeta {
    state: CellState,
    len: usize,
    left_bounds: (u32, u32),
    right_bounds: (u32, u32),
}

impl CellMeta {
    fn open() -> Self {
        CellMeta {
            state: CellState::Open,
            len: 0,
            left_bounds: EMPTY_BOUNDS,
            right_bounds: EMPTY_BOUNDS,
        }
    }
}

/// Number of cells covering spans shorter than `span` in a sentence of `n`.
#[inline(always)]
fn span_offset(n: usize, span: usize) -> usize {
    (span - 1) * (n + 1) - span * (span - 1) / 2
}

/// A triangular chart over one sentence.
#[derive(Debug, Clone)]
pub struct Chart {
    grammar: Arc<Grammar>,
    tokens: Vec<u32>,
    cells: Vec<CellMeta>,
    cell_offsets: Vec<usize>,

    nonterminals: Vec<u32>,
    inside: Vec<LogProb>,
    packed_children: Vec<PackedKey>,
    midpoints: Vec<u32>,
}

impl Chart {
    /// Allocate a chart whose lexical cells hold `lexical_beam_width` entries
    /// and whose other cells hold `beam_width`. Zero means unbounded.
    pub fn new(
        grammar: Arc<Grammar>,
        tokens: &[u32],
        beam_width: usize,
        lexical_beam_width: usize,
    ) -> Result<Chart> {
        let nt = grammar.num_nonterminals();
        let clip = |w: usize| if w == 0 { nt } else { w.min(nt) };
        let (beam, lexical) = (clip(beam_width), clip(lexical_beam_width));
        Chart::with_capacity(grammar, tokens, |start, end| {
            if end - start == 1 {
                lexical
            } else {
                beam
            }
        })
    }

    /// Allocate with a per-cell capacity chosen by `capacity(start, end)`.
    pub fn with_capacity(
        grammar: Arc<Grammar>,
        tokens: &[u32],
        capacity: impl Fn(usize, usize) -> usize,
    ) -> Result<Chart> {
        if tokens.is_empty() {
            return Err(ParseError::EmptySentence);
        }
        let lexicon = grammar.lexicon_size();
        if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= lexicon) {
            return Err(ParseError::TerminalOutOfRange {
                index: bad,
                count: lexicon,
            });
        }

        let n = tokens.len();
        let num_cells = n * (n + 1) / 2;
        let mut cell_offsets = Vec::with_capacity(num_cells + 1);
        cell_offsets.push(0);
        for span in 1..=n {
            for start in 0..=(n - span) {
                let last = cell_offsets[cell_offsets.len() - 1];
                cell_offsets.push(last + capacity(start, start + span));
            }
        }
        let total = cell_offsets[num_cells];

        Ok(Chart {
            grammar,
            tokens: tokens.to_vec(),
            cells: vec![CellMeta::open(); num_cells],
            cell_offsets,
            nonterminals: vec![0; total],
            inside: vec![UNPOPULATED; total],
            packed_children: vec![INVALID_KEY; total],
            midpoints: vec![NO_MIDPOINT; total],
        })
    }

    /// Sentence length.
    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    #[inline(always)]
    pub fn cell_index(&self, start: usize, end: usize) -> usize {
        debug_assert!(start < end && end <= self.size());
        span_offset(self.size(), end - start) + start
    }

    /// Capacity of a cell, in entries.
    pub fn cell_capacity(&self, start: usize, end: usize) -> usize {
        let i = self.cell_index(start, end);
        self.cell_offsets[i + 1] - self.cell_offsets[i]
    }

    pub fn cell(&self, start: usize, end: usize) -> Cell<'_> {
        let index = self.cell_index(start, end);
        let meta = &self.cells[index];
        let range = self.cell_offsets[index]..self.cell_offsets[index] + meta.len;
        Cell {
            start,
            end,
            meta,
            packing: self.grammar.packing(),
            nonterminals: &self.nonterminals[range.clone()],
            inside: &self.inside[range.clone()],
            packed_children: &self.packed_children[range.clone()],
            midpoints: &self.midpoints[range],
        }
    }

    /// Compact `entries` (sorted by non-terminal) into the cell and mark it
    /// finalized. The only writer of the packed arrays.
    pub fn finalize_cell(&mut self, start: usize, end: usize, entries: &[CellEntry]) {
        let index = self.cell_index(start, end);
        let offset = self.cell_offsets[index];
        let capacity = self.cell_offsets[index + 1] - offset;
        assert!(
            entries.len() <= capacity,
            "cell ({}, {}) holds {} entries, {} offered",
            start,
            end,
            capacity,
            entries.len()
        );
        debug_assert!(entries
            .windows(2)
            .all(|w| w[0].nonterminal < w[1].nonterminal));

        let mut left_bounds = EMPTY_BOUNDS;
        let mut right_bounds = EMPTY_BOUNDS;
        for (i, e) in entries.iter().enumerate() {
            self.nonterminals[offset + i] = e.nonterminal;
            self.inside[offset + i] = e.inside;
            self.packed_children[offset + i] = e.packed_children;
            self.midpoints[offset + i] = e.midpoint;
            if self.grammar.is_left_child(e.nonterminal) {
                left_bounds.0 = left_bounds.0.min(e.nonterminal);
                left_bounds.1 = left_bounds.1.max(e.nonterminal);
            }
            if self.grammar.is_right_child(e.nonterminal) {
                right_bounds.0 = right_bounds.0.min(e.nonterminal);
                right_bounds.1 = right_bounds.1.max(e.nonterminal);
            }
        }

        self.cells[index] = CellMeta {
            state: CellState::Finalized,
            len: entries.len(),
            left_bounds,
            right_bounds,
        };
    }

    pub fn get_inside(&self, start: usize, end: usize, nt: u32) -> LogProb {
        self.cell(start, end).inside(nt)
    }

    pub fn get_best_edge(&self, start: usize, end: usize, nt: u32) -> Option<BestEdge> {
        self.cell(start, end).best_edge(nt)
    }

    /// Total entries across finalized cells.
    pub fn populated_entries(&self) -> usize {
        self.cells.iter().map(|c| c.len).sum()
    }

    /// Inside score of `root` over the whole sentence.
    pub fn root_inside(&self, root: u32) -> LogProb {
        self.get_inside(0, self.size(), root)
    }

    /// Reconstruct the Viterbi derivation rooted at `root` over the whole
    /// sentence, or `None` if `root` was never populated there.
    pub fn extract_best_parse(&self, root: u32) -> Option<ParseTree> {
        // Each level of a unary chain is a distinct non-terminal.
        let max_unary_depth = self.grammar.num_nonterminals();
        self.extract(0, self.size(), root, max_unary_depth)
    }

    fn extract(&self, start: usize, end: usize, nt: u32, unary_budget: usize) -> Option<ParseTree> {
        let best = self.get_best_edge(start, end, nt)?;
        let children = match best.edge {
            Edge::Lexical { terminal } => vec![ParseTree::leaf(terminal, start)],
            Edge::Unary { child } => {
                if unary_budget == 0 {
                    log::warn!("unary cycle at ({}, {}) under {}", start, end, nt);
                    return None;
                }
                vec![self.extract(start, end, child, unary_budget - 1)?]
            }
            Edge::Binary {
                left,
                right,
                midpoint,
            } => {
                let mid = midpoint as usize;
                let budget = self.grammar.num_nonterminals();
                vec![
                    self.extract(start, mid, left, budget)?,
                    self.extract(mid, end, right, budget)?,
                ]
            }
        };
        Some(ParseTree::branch(nt, (start, end), children))
    }
}

/// Read-only view of one cell.
#[derive(Debug, Clone, Copy)]
pub struct Cell<'a> {
    start: usize,
    end: usize,
    meta: &'a CellMeta,
    packing: &'a Packing,
    nonterminals: &'a [u32],
    inside: &'a [LogProb],
    packed_children: &'a [PackedKey],
    midpoints: &'a [u32],
}

impl<'a> Cell<'a> {
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn span(&self) -> usize {
        self.end - self.start
    }

    pub fn state(&self) -> CellState {
        self.meta.state
    }

    pub fn is_finalized(&self) -> bool {
        self.meta.state == CellState::Finalized
    }

    pub fn len(&self) -> usize {
        self.nonterminals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nonterminals.is_empty()
    }

    /// Populated non-terminals, ascending.
    pub fn nonterminals(&self) -> &'a [u32] {
        self.nonterminals
    }

    /// Inside scores aligned with [`Cell::nonterminals`].
    pub fn inside_probabilities(&self) -> &'a [LogProb] {
        self.inside
    }

    pub fn entry(&self, i: usize) -> CellEntry {
        CellEntry {
            nonterminal: self.nonterminals[i],
            inside: self.inside[i],
            packed_children: self.packed_children[i],
            midpoint: self.midpoints[i],
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = CellEntry> + 'a {
        let cell = *self;
        (0..cell.len()).map(move |i| cell.entry(i))
    }

    /// Position of `nt` within the cell.
    #[inline]
    pub fn find(&self, nt: u32) -> Option<usize> {
        self.nonterminals.binary_search(&nt).ok()
    }

    /// Inside score of `nt`, or [`UNPOPULATED`].
    pub fn inside(&self, nt: u32) -> LogProb {
        self.find(nt).map_or(UNPOPULATED, |i| self.inside[i])
    }

    pub fn best_edge(&self, nt: u32) -> Option<BestEdge> {
        let i = self.find(nt)?;
        let edge = decode_edge(self.packing, self.packed_children[i], self.midpoints[i])?;
        Some(BestEdge {
            parent: nt,
            inside: self.inside[i],
            edge,
        })
    }

    /// Min/max populated non-terminal that can act as a left child.
    pub fn left_child_bounds(&self) -> Option<(u32, u32)> {
        Some(self.meta.left_bounds).filter(|b| *b != EMPTY_BOUNDS)
    }

    /// Min/max populated non-terminal that can act as a right child.
    pub fn right_child_bounds(&self) -> Option<(u32, u32)> {
        Some(self.meta.right_bounds).filter(|b| *b != EMPTY_BOUNDS)
    }

    /// Index range of the entries whose non-terminal lies in `lo..=hi`.
    #[inline]
    pub fn range_of(&self, lo: u32, hi: u32) -> std::ops::Range<usize> {
        let from = self.nonterminals.partition_point(|&nt| nt < lo);
        let to = self.nonterminals.partition_point(|&nt| nt <= hi);
        from..to.max(from)
    }
}

/// Dense scratch storage for a cell under construction.
///
/// One slot per non-terminal. Slots written since the last [`clear`] are
/// tracked so clearing touches only them.
///
/// [`clear`]: TemporaryCell::clear
#[derive(Debug, Clone)]
pub struct TemporaryCell {
    start: usize,
    end: usize,
    inside: Vec<LogProb>,
    packed_children: Vec<PackedKey>,
    midpoints: Vec<u32>,
    populated: Vec<u32>,
}

impl TemporaryCell {
    pub fn new(num_nonterminals: usize) -> Self {
        TemporaryCell {
            start: 0,
            end: 0,
            inside: vec![UNPOPULATED; num_nonterminals],
            packed_children: vec![INVALID_KEY; num_nonterminals],
            midpoints: vec![NO_MIDPOINT; num_nonterminals],
            populated: Vec::new(),
        }
    }

    /// Clear and retarget at `(start, end)`.
    pub fn open(&mut self, start: usize, end: usize) {
        self.clear();
        self.start = start;
        self.end = end;
    }

    pub fn clear(&mut self) {
        for &nt in &self.populated {
            let i = nt as usize;
            self.inside[i] = UNPOPULATED;
            self.packed_children[i] = INVALID_KEY;
            self.midpoints[i] = NO_MIDPOINT;
        }
        self.populated.clear();
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Keep the max per non-terminal. Equal scores go to the lower packed
    /// key, then the lower midpoint, so the winner does not depend on the
    /// order edges arrive in.
    #[inline]
    pub fn update(&mut self, nt: u32, inside: LogProb, packed_children: PackedKey, midpoint: u32) -> bool {
        let i = nt as usize;
        let current = self.inside[i];
        let wins = improves(inside, current)
            || (inside == current
                && current != UNPOPULATED
                && (packed_children, midpoint) < (self.packed_children[i], self.midpoints[i]));
        if !wins {
            return false;
        }
        if current == UNPOPULATED {
            self.populated.push(nt);
        }
        self.inside[i] = inside;
        self.packed_children[i] = packed_children;
        self.midpoints[i] = midpoint;
        true
    }

    #[inline(always)]
    pub fn inside(&self, nt: u32) -> LogProb {
        self.inside[nt as usize]
    }

    pub fn is_populated(&self, nt: u32) -> bool {
        self.inside[nt as usize] != UNPOPULATED
    }

    pub fn packed_children(&self, nt: u32) -> PackedKey {
        self.packed_children[nt as usize]
    }

    /// Non-terminals written since the last clear, in first-write order.
    pub fn populated(&self) -> &[u32] {
        &self.populated
    }

    pub fn len(&self) -> usize {
        self.populated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.populated.is_empty()
    }

    pub fn entry(&self, nt: u32) -> CellEntry {
        let i = nt as usize;
        CellEntry {
            nonterminal: nt,
            inside: self.inside[i],
            packed_children: self.packed_children[i],
            midpoint: self.midpoints[i],
        }
    }

    /// Every populated entry, sorted by non-terminal.
    pub fn entries(&self) -> Vec<CellEntry> {
        let mut nts = self.populated.clone();
        nts.sort_unstable();
        nts.into_iter().map(|nt| self.entry(nt)).collect()
    }

    /// Per-slot max of `other` into `self`, with the tie order of [`update`](Self::update).
    pub fn merge(&mut self, other: &TemporaryCell) {
        for &nt in &other.populated {
            let i = nt as usize;
            self.update(nt, other.inside[i], other.packed_children[i], other.midpoints[i]);
        }
    }
}
