//! Beam-width pruning.
//!
//! Populated entries of a cell under construction are ranked by a
//! [`FigureOfMerit`] in a bounded double-ended priority queue. Popping in
//! descending order commits an entry, then expands unary rules with it as
//! child so that unary-discovered parents can still compete for the slots
//! that remain.

use crate::chart::{CellEntry, TemporaryCell};
use crate::grammar::Grammar;
use crate::packing::{PackingFunction, UNARY_PRODUCTION};
use crate::semiring::{LogProb, MaxPlus};
use crate::tree::{Production, RuleCounts};
use priority_queue::DoublePriorityQueue;
use std::cmp::Reverse;
use std::fmt::Debug;

/// Scores an entry for retention under pruning.
pub trait FigureOfMerit: Send + Sync + Debug {
    fn score(&self, nonterminal: u32, inside: LogProb, start: usize, end: usize) -> LogProb;
}

/// Rank by inside score alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsideFom;

impl FigureOfMerit for InsideFom {
    #[inline]
    fn score(&self, _nonterminal: u32, inside: LogProb, _start: usize, _end: usize) -> LogProb {
        inside
    }
}

/// Inside score plus a per-category log prior.
#[derive(Debug, Clone)]
pub struct PriorFom {
    log_priors: Vec<LogProb>,
}

impl PriorFom {
    pub fn new(log_priors: Vec<LogProb>) -> Self {
        PriorFom { log_priors }
    }

    /// Relative frequency of each non-terminal as a parent in `counts`.
    /// Unseen categories get a prior of zero probability.
    pub fn from_counts(counts: &RuleCounts, num_nonterminals: usize) -> Self {
        let mut totals = vec![0.0f64; num_nonterminals];
        for (production, count) in counts.iter() {
            let parent = match *production {
                Production::Binary { parent, .. }
                | Production::Unary { parent, .. }
                | Production::Lexical { parent, .. } => parent as usize,
            };
            if let Some(t) = totals.get_mut(parent) {
                *t += count;
            }
        }
        let sum: f64 = totals.iter().sum();
        let log_priors = totals
            .into_iter()
            .map(|t| if sum > 0.0 { (t / sum).ln() as LogProb } else { 0.0 })
            .collect();
        PriorFom { log_priors }
    }

    pub fn log_prior(&self, nonterminal: u32) -> LogProb {
        self.log_priors
            .get(nonterminal as usize)
            .copied()
            .unwrap_or(LogProb::NEG_INFINITY)
    }
}

impl FigureOfMerit for PriorFom {
    #[inline]
    fn score(&self, nonterminal: u32, inside: LogProb, _start: usize, _end: usize) -> LogProb {
        inside + self.log_prior(nonterminal)
    }
}

/// Queue priority: FOM, then the lower non-terminal index on ties.
type Priority = (MaxPlus, Reverse<u32>);

/// A priority queue holding at most `capacity` non-terminals.
#[derive(Debug, Clone)]
pub struct BeamQueue {
    queue: DoublePriorityQueue<u32, Priority>,
    capacity: usize,
    committed: Vec<bool>,
}

impl BeamQueue {
    pub fn new(num_nonterminals: usize) -> Self {
        BeamQueue {
            queue: DoublePriorityQueue::new(),
            capacity: 0,
            committed: vec![false; num_nonterminals],
        }
    }

    /// Empty the queue and bound it to `capacity` entries.
    pub fn reset(&mut self, capacity: usize) {
        self.queue.clear();
        self.capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Insert `nt`, or raise its priority if already queued. When full, the
    /// lowest entry is evicted if `fom` beats it; otherwise `nt` is refused.
    pub fn offer(&mut self, nt: u32, fom: LogProb) -> bool {
        let priority = (MaxPlus::new(fom), Reverse(nt));
        if let Some(current) = self.queue.get_priority(&nt) {
            if priority <= *current {
                return false;
            }
            self.queue.change_priority(&nt, priority);
            return true;
        }
        if self.capacity == 0 {
            return false;
        }
        if self.queue.len() >= self.capacity {
            match self.queue.peek_min() {
                Some((_, lowest)) if priority > *lowest => {
                    self.queue.pop_min();
                }
                _ => return false,
            }
        }
        self.queue.push(nt, priority);
        true
    }

    /// Current FOM of `nt`, if queued.
    pub fn priority(&self, nt: u32) -> Option<LogProb> {
        self.queue.get_priority(&nt).map(|(p, _)| p.value())
    }

    pub fn pop_best(&mut self) -> Option<(u32, LogProb)> {
        self.queue.pop_max().map(|(nt, (p, _))| (nt, p.value()))
    }
}

/// How many entries a cell keeps, and how many of those may be non-unary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamLimits {
    pub width: usize,
    pub non_unary: usize,
}

impl BeamLimits {
    /// Lexical cells hold back `unary_reserve` slots for unary promotions.
    pub fn for_cell(span: usize, width: usize, lexical_width: usize, unary_reserve: usize) -> Self {
        if span == 1 {
            let width = lexical_width;
            BeamLimits {
                width,
                non_unary: width.saturating_sub(unary_reserve).max(1).min(width),
            }
        } else {
            BeamLimits {
                width,
                non_unary: width,
            }
        }
    }
}

/// Select at most `limits.width` entries from `temp`, expanding unary rules
/// from each committed non-unary entry. Returns the committed entries sorted
/// by non-terminal. `temp` keeps every candidate it saw.
pub fn prune(
    grammar: &Grammar,
    temp: &mut TemporaryCell,
    limits: BeamLimits,
    fom: &dyn FigureOfMerit,
    queue: &mut BeamQueue,
) -> Vec<CellEntry> {
    let (start, end) = (temp.start(), temp.end());
    let packing = grammar.packing();

    queue.reset(limits.width);
    for &nt in temp.populated() {
        queue.offer(nt, fom.score(nt, temp.inside(nt), start, end));
    }

    let mut committed: Vec<CellEntry> = Vec::with_capacity(limits.width);
    let mut non_unary = 0;
    while committed.len() < limits.width {
        let Some((nt, _)) = queue.pop_best() else {
            break;
        };
        let entry = temp.entry(nt);
        let is_unary = packing.unpack_right_child(entry.packed_children) == UNARY_PRODUCTION;
        if !is_unary {
            if non_unary >= limits.non_unary {
                continue;
            }
            non_unary += 1;
        }
        queue.committed[nt as usize] = true;
        committed.push(entry);
        if is_unary {
            continue;
        }

        let key = packing.pack_unary(nt);
        let (parents, probs) = grammar.unary_parents(nt);
        for (&parent, &prob) in parents.iter().zip(probs) {
            if queue.committed[parent as usize] {
                continue;
            }
            let candidate = prob + entry.inside;
            let candidate_fom = fom.score(parent, candidate, start, end);
            if temp.is_populated(parent)
                && candidate_fom <= fom.score(parent, temp.inside(parent), start, end)
            {
                continue;
            }
            if queue.priority(parent).is_some_and(|p| candidate_fom <= p) {
                continue;
            }
            if temp.update(parent, candidate, key, end as u32) {
                queue.offer(parent, candidate_fom);
            }
        }
    }

    for e in &committed {
        queue.committed[e.nonterminal as usize] = false;
    }
    committed.sort_unstable_by_key(|e| e.nonterminal);
    committed
}
