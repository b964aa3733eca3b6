//! Chart parser driver.
//!
//! A [`Parser`] walks a schedule of span batches and fills each cell with the
//! cartesian-product, SpMV and beam stages. Strategies are chosen by
//! [`ParserConfig`] rather than by parser type:
//!
//! - cartesian product unioned over midpoints, or multiplied per midpoint;
//! - binary matrix traversed by row (CSR) or by column (CSC);
//! - cells of a span processed concurrently on a worker pool;
//! - the binary matrix split into segments of equal non-zero weight, each
//!   scored into a private temporary cell and merged by per-slot max;
//! - the whole pipeline dispatched through a [`KernelBackend`].
//!
//! None of these change the numeric result.

use crate::beam::{prune, BeamLimits, BeamQueue, FigureOfMerit, InsideFom};
use crate::cartesian::{
    cartesian_product, CartesianProductStrategy, CartesianProductVector, ChildFilter,
};
use crate::chart::{CellEntry, Chart, TemporaryCell};
use crate::constrained::ConstrainingChart;
use crate::error::{ParseError, Result};
use crate::grammar::Grammar;
use crate::kernel::{run_batches, HostKernels, KernelBackend};
use crate::packing::PackingFunction;
use crate::scheduler::{
    BottomUpSelector, CellSelector, CellVisit, ConstrainedSelector, SpanBatch, VisitConstraint,
};
use crate::semiring::LogProb;
use crate::spmv::{
    binary_spmv, binary_spmv_columns, binary_spmv_rows, column_segments, lexical_spmv,
    merge_segments, row_segments, unary_spmv, SpmvLayout,
};
use crate::tree::ParseTree;
use bit_set::BitSet;
use rayon::prelude::*;
use std::any::Any;
use std::cell::RefCell;
use std::ops::{AddAssign, Range};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use thread_local::ThreadLocal;

/// Where cells are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// In-process, per cell.
    #[default]
    Host,
    /// Per span batch, through a [`KernelBackend`]. Honors the beam settings,
    /// `layout` and `threads`; cartesian strategy, grammar segments and cell
    /// parallelism are host options and do not apply.
    Kernel,
}

/// Configuration for the parser.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Entries kept per cell (0 = all non-terminals, no pruning).
    pub beam_width: usize,
    /// Entries kept per lexical cell (0 = all non-terminals).
    pub lexical_beam_width: usize,
    /// Lexical-cell slots held back for unary promotions.
    pub lexical_unary_reserve: usize,
    pub cartesian: CartesianProductStrategy,
    pub layout: SpmvLayout,
    /// Process the cells of a span concurrently.
    pub cell_parallel: bool,
    /// Number of binary-matrix segments scored concurrently (1 = off).
    pub grammar_segments: usize,
    /// Worker threads (0 = rayon's global pool).
    pub threads: usize,
    pub backend: Backend,
    pub fom: Arc<dyn FigureOfMerit>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            beam_width: 0,
            lexical_beam_width: 0,
            lexical_unary_reserve: 0,
            cartesian: CartesianProductStrategy::default(),
            layout: SpmvLayout::default(),
            cell_parallel: false,
            grammar_segments: 1,
            threads: 0,
            backend: Backend::default(),
            fom: Arc::new(InsideFom),
        }
    }
}

/// Statistics about parser execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub sentences: usize,
    pub cells_visited: usize,
    /// Child pairs offered to cartesian-product vectors.
    pub cartesian_entries: usize,
    pub lexical_evaluations: usize,
    pub binary_evaluations: usize,
    pub unary_evaluations: usize,
    /// Populated entries dropped by beam pruning.
    pub entries_pruned: usize,
    /// Entries in finalized cells.
    pub populated_entries: usize,
}

impl AddAssign for ParseStats {
    fn add_assign(&mut self, other: ParseStats) {
        self.sentences += other.sentences;
        self.cells_visited += other.cells_visited;
        self.cartesian_entries += other.cartesian_entries;
        self.lexical_evaluations += other.lexical_evaluations;
        self.binary_evaluations += other.binary_evaluations;
        self.unary_evaluations += other.unary_evaluations;
        self.entries_pruned += other.entries_pruned;
        self.populated_entries += other.populated_entries;
    }
}

/// Per-worker buffers, sized once from the grammar and reused across cells.
#[derive(Debug)]
pub(crate) struct Scratch {
    pub(crate) cpv: CartesianProductVector,
    pub(crate) temp: TemporaryCell,
    pub(crate) segments: Vec<TemporaryCell>,
    pub(crate) queue: BeamQueue,
    pub(crate) snapshot: Vec<(u32, LogProb)>,
}

impl Scratch {
    pub(crate) fn new(grammar: &Grammar, segments: usize) -> Self {
        let nt = grammar.num_nonterminals();
        Scratch {
            cpv: CartesianProductVector::for_grammar(grammar),
            temp: TemporaryCell::new(nt),
            segments: (0..segments).map(|_| TemporaryCell::new(nt)).collect(),
            queue: BeamQueue::new(nt),
            snapshot: Vec::new(),
        }
    }
}

/// Whether a cell of `capacity` entries keeps every non-terminal.
pub(crate) fn is_exhaustive(grammar: &Grammar, capacity: usize) -> bool {
    capacity >= grammar.num_nonterminals()
}

/// Host-side cell computation, shared by every worker.
struct Engine {
    grammar: Arc<Grammar>,
    config: ParserConfig,
    segments: Vec<Range<usize>>,
    pool: Option<rayon::ThreadPool>,
    scratch: ThreadLocal<RefCell<Scratch>>,
}

type CellResult = (Vec<CellEntry>, ParseStats);

impl Engine {
    fn new(grammar: Arc<Grammar>, config: ParserConfig) -> Result<Self> {
        let segments = match config.layout {
            SpmvLayout::RowMajor => row_segments(&grammar, config.grammar_segments),
            SpmvLayout::ColumnMajor => column_segments(&grammar, config.grammar_segments),
        };
        let pool = if config.threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.threads)
                .thread_name(|i| format!("spmv-parse-{}", i))
                .build()
                .map_err(|e| ParseError::ThreadPool(e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        Ok(Engine {
            grammar,
            config,
            segments,
            pool,
            scratch: ThreadLocal::new(),
        })
    }

    fn new_scratch(&self) -> Scratch {
        Scratch::new(&self.grammar, self.segments.len())
    }

    fn with_scratch<R>(&self, f: impl FnOnce(&mut Scratch) -> R) -> R {
        let slot = self.scratch.get_or(|| RefCell::new(self.new_scratch()));
        match slot.try_borrow_mut() {
            Ok(mut scratch) => f(&mut scratch),
            // A task stolen while this thread's arena is in use.
            Err(_) => f(&mut self.new_scratch()),
        }
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Fill every cell of every batch. A batch is committed to the chart only
    /// after all of its cells have been computed.
    fn run(&self, chart: &mut Chart, batches: &[SpanBatch]) -> Result<ParseStats> {
        let mut stats = ParseStats::default();
        for batch in batches {
            let results = self.compute(chart, &batch.visits)?;
            for (visit, (entries, cell_stats)) in batch.visits.iter().zip(results) {
                chart.finalize_cell(visit.start, visit.end, &entries);
                stats += cell_stats;
            }
        }
        Ok(stats)
    }

    fn compute(&self, chart: &Chart, visits: &[CellVisit]) -> Result<Vec<CellResult>> {
        let parallel = self.config.cell_parallel && visits.len() > 1;
        let outcome: std::thread::Result<Vec<CellResult>> = panic::catch_unwind(AssertUnwindSafe(|| {
            if parallel {
                self.install(|| visits.par_iter().map(|v| self.visit(chart, v)).collect())
            } else {
                visits.iter().map(|v| self.visit(chart, v)).collect()
            }
        }));
        outcome.map_err(|payload| ParseError::WorkerFailed(panic_message(payload.as_ref())))
    }

    fn visit(&self, chart: &Chart, visit: &CellVisit) -> CellResult {
        self.with_scratch(|scratch| {
            let mut stats = ParseStats {
                cells_visited: 1,
                ..ParseStats::default()
            };
            scratch.temp.open(visit.start, visit.end);
            let entries = match &visit.constraint {
                Some(constraint) => {
                    self.visit_constrained(chart, visit, constraint, scratch, &mut stats)
                }
                None => self.visit_unconstrained(chart, visit, scratch, &mut stats),
            };
            stats.populated_entries = entries.len();
            log::trace!(
                "cell ({}, {}): {} entries",
                visit.start,
                visit.end,
                entries.len()
            );
            (entries, stats)
        })
    }

    fn visit_unconstrained(
        &self,
        chart: &Chart,
        visit: &CellVisit,
        scratch: &mut Scratch,
        stats: &mut ParseStats,
    ) -> Vec<CellEntry> {
        let grammar = &*self.grammar;
        let (start, end) = (visit.start, visit.end);
        if visit.is_lexical() {
            let token = chart.tokens()[start];
            stats.lexical_evaluations += lexical_spmv(grammar, token, None, &mut scratch.temp);
        } else {
            match self.config.cartesian {
                CartesianProductStrategy::Unioned => {
                    self.product(chart, visit, visit.midpoints(), ChildFilter::none(), scratch, stats);
                    stats.binary_evaluations += self.multiply(scratch, None);
                }
                CartesianProductStrategy::PerMidpoint => {
                    for mid in visit.midpoints() {
                        self.product(chart, visit, mid..mid + 1, ChildFilter::none(), scratch, stats);
                        stats.binary_evaluations += self.multiply(scratch, None);
                    }
                }
            }
        }

        let capacity = chart.cell_capacity(start, end);
        if is_exhaustive(grammar, capacity) {
            stats.unary_evaluations +=
                unary_spmv(grammar, &mut scratch.temp, None, &mut scratch.snapshot);
            scratch.temp.entries()
        } else {
            let limits = BeamLimits::for_cell(
                visit.span(),
                capacity,
                capacity,
                self.config.lexical_unary_reserve,
            );
            let kept = prune(
                grammar,
                &mut scratch.temp,
                limits,
                self.config.fom.as_ref(),
                &mut scratch.queue,
            );
            stats.entries_pruned += scratch.temp.len() - kept.len();
            kept
        }
    }

    /// Licensed categories only, one unary application per chain level.
    fn visit_constrained(
        &self,
        chart: &Chart,
        visit: &CellVisit,
        constraint: &VisitConstraint,
        scratch: &mut Scratch,
        stats: &mut ParseStats,
    ) -> Vec<CellEntry> {
        let grammar = &*self.grammar;
        let depth = constraint.unary_depth();
        let bottom = constraint.licensed(grammar, depth);

        if visit.is_lexical() {
            let token = chart.tokens()[visit.start];
            stats.lexical_evaluations +=
                lexical_spmv(grammar, token, Some(&bottom), &mut scratch.temp);
        } else if let Some((left, right)) = constraint.licensed_children(grammar) {
            let filter = ChildFilter {
                left: Some(&left),
                right: Some(&right),
            };
            self.product(chart, visit, visit.midpoints(), filter, scratch, stats);
            stats.binary_evaluations += self.multiply(scratch, Some(&bottom));
        }

        let packing = grammar.packing();
        let end = visit.end as u32;
        let mut children: Vec<u32> = scratch.temp.entries().iter().map(|e| e.nonterminal).collect();
        for level in (0..depth).rev() {
            let licensed = constraint.licensed(grammar, level);
            for &child in &children {
                let inside = scratch.temp.inside(child);
                let key = packing.pack_unary(child);
                let (parents, probs) = grammar.unary_parents(child);
                for (&parent, &prob) in parents.iter().zip(probs) {
                    if licensed.contains(parent as usize) {
                        stats.unary_evaluations += 1;
                        scratch.temp.update(parent, prob + inside, key, end);
                    }
                }
            }
            children = licensed
                .iter()
                .map(|nt| nt as u32)
                .filter(|&nt| scratch.temp.is_populated(nt))
                .collect();
        }
        scratch.temp.entries()
    }

    fn product(
        &self,
        chart: &Chart,
        visit: &CellVisit,
        midpoints: Range<usize>,
        filter: ChildFilter<'_>,
        scratch: &mut Scratch,
        stats: &mut ParseStats,
    ) {
        scratch.cpv.clear();
        stats.cartesian_entries += cartesian_product(
            &self.grammar,
            chart,
            visit.start,
            visit.end,
            midpoints,
            filter,
            &mut scratch.cpv,
        );
    }

    /// Binary SpMV of the scratch vector into the scratch cell, by segment
    /// when configured.
    fn multiply(&self, scratch: &mut Scratch, parents: Option<&BitSet>) -> usize {
        let grammar = &*self.grammar;
        let layout = self.config.layout;
        let Scratch {
            cpv,
            temp,
            segments,
            ..
        } = scratch;
        if self.segments.len() <= 1 {
            return binary_spmv(grammar, layout, cpv, parents, temp);
        }

        let (start, end) = (temp.start(), temp.end());
        let cpv = &*cpv;
        let evaluated = self.install(|| {
            segments
                .par_iter_mut()
                .zip(self.segments.par_iter())
                .map(|(part, range)| {
                    part.open(start, end);
                    match layout {
                        SpmvLayout::RowMajor => {
                            binary_spmv_rows(grammar, cpv, range.clone(), parents, part)
                        }
                        SpmvLayout::ColumnMajor => {
                            binary_spmv_columns(grammar, cpv, range.clone(), parents, part)
                        }
                    }
                })
                .sum::<usize>()
        });
        merge_segments(temp, segments.iter());
        evaluated
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// A chart parser over one grammar.
pub struct Parser {
    engine: Engine,
    kernels: Option<Box<dyn KernelBackend>>,
    stats: ParseStats,
}

impl Parser {
    /// Create a parser with the default configuration.
    pub fn new(grammar: Arc<Grammar>) -> Result<Self> {
        Self::with_config(grammar, ParserConfig::default())
    }

    /// Create a parser with custom configuration. The kernel backend defaults
    /// to [`HostKernels`].
    pub fn with_config(grammar: Arc<Grammar>, config: ParserConfig) -> Result<Self> {
        let kernels: Option<Box<dyn KernelBackend>> = match config.backend {
            Backend::Host => None,
            Backend::Kernel => Some(Box::new(HostKernels::new(grammar.clone(), config.clone())?)),
        };
        Ok(Parser {
            engine: Engine::new(grammar, config)?,
            kernels,
            stats: ParseStats::default(),
        })
    }

    /// Create a parser that dispatches through `kernels`.
    pub fn with_kernels(
        grammar: Arc<Grammar>,
        mut config: ParserConfig,
        kernels: Box<dyn KernelBackend>,
    ) -> Result<Self> {
        config.backend = Backend::Kernel;
        Ok(Parser {
            engine: Engine::new(grammar, config)?,
            kernels: Some(kernels),
            stats: ParseStats::default(),
        })
    }

    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.engine.grammar
    }

    pub fn config(&self) -> &ParserConfig {
        &self.engine.config
    }

    /// Cumulative statistics since creation or the last reset.
    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ParseStats::default();
    }

    /// Fill a chart for `tokens`.
    pub fn parse(&mut self, tokens: &[u32]) -> Result<Chart> {
        let started = Instant::now();
        let config = &self.engine.config;
        let mut chart = Chart::new(
            self.engine.grammar.clone(),
            tokens,
            config.beam_width,
            config.lexical_beam_width,
        )?;
        let batches = BottomUpSelector::new(tokens.len()).schedule();
        let outcome = match self.kernels.as_mut() {
            Some(kernels) => run_batches(kernels.as_mut(), &mut chart, &batches),
            None => self.engine.run(&mut chart, &batches),
        };
        self.finish(outcome, &chart, started)?;
        Ok(chart)
    }

    /// Parse and extract the best tree under the start symbol, with its
    /// log probability. `Ok(None)` means no parse.
    pub fn parse_best(&mut self, tokens: &[u32]) -> Result<Option<(ParseTree, LogProb)>> {
        let chart = self.parse(tokens)?;
        let root = self.grammar().start_symbol();
        match chart.extract_best_parse(root) {
            Some(tree) => Ok(Some((tree, chart.root_inside(root)))),
            None => {
                log::warn!("no parse for a sentence of {} words", tokens.len());
                Ok(None)
            }
        }
    }

    /// Tokenize with the grammar's lexicon and parse.
    pub fn parse_sentence(&mut self, sentence: &str) -> Result<Option<(ParseTree, LogProb)>> {
        let tokens = self.grammar().tokenize(sentence)?;
        self.parse_best(&tokens)
    }

    /// Fill a chart restricted to the cells, midpoints and categories of a
    /// reference tree. Never pruned.
    pub fn parse_constrained(&mut self, constraining: &ConstrainingChart) -> Result<Chart> {
        if self.kernels.is_some() {
            return Err(ParseError::UnsupportedStrategy(
                "constrained parsing on the kernel backend".to_string(),
            ));
        }
        let grammar = self.engine.grammar.clone();
        if constraining.grammar().num_nonterminals() != grammar.num_nonterminals() {
            return Err(ParseError::UnsupportedStrategy(
                "reference chart built over a different grammar".to_string(),
            ));
        }

        let started = Instant::now();
        let mut chart = Chart::with_capacity(grammar.clone(), constraining.tokens(), |start, end| {
            constraining
                .cell(start, end)
                .map_or(0, |cell| cell.capacity(&grammar))
        })?;
        let batches = ConstrainedSelector::new(constraining).schedule();
        let outcome = self.engine.run(&mut chart, &batches);
        self.finish(outcome, &chart, started)?;
        Ok(chart)
    }

    fn finish(&mut self, outcome: Result<ParseStats>, chart: &Chart, started: Instant) -> Result<()> {
        match outcome {
            Ok(mut stats) => {
                stats.sentences = 1;
                log::debug!(
                    "parsed {} words: {} cells, {} entries, {} pruned in {:?}",
                    chart.size(),
                    stats.cells_visited,
                    chart.populated_entries(),
                    stats.entries_pruned,
                    started.elapsed()
                );
                self.stats += stats;
                Ok(())
            }
            Err(e) => {
                // Arenas of a failed worker may hold partial state.
                self.engine.scratch.clear();
                Err(e)
            }
        }
    }
}

/// Builder for creating parsers.
pub struct ParserBuilder {
    grammar: Arc<Grammar>,
    config: ParserConfig,
    kernels: Option<Box<dyn KernelBackend>>,
}

impl ParserBuilder {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        ParserBuilder {
            grammar,
            config: ParserConfig::default(),
            kernels: None,
        }
    }

    pub fn config(mut self, config: ParserConfig) -> Self {
        self.config = config;
        self
    }

    pub fn beam_width(mut self, width: usize) -> Self {
        self.config.beam_width = width;
        self
    }

    pub fn lexical_beam_width(mut self, width: usize) -> Self {
        self.config.lexical_beam_width = width;
        self
    }

    pub fn lexical_unary_reserve(mut self, slots: usize) -> Self {
        self.config.lexical_unary_reserve = slots;
        self
    }

    pub fn cartesian(mut self, strategy: CartesianProductStrategy) -> Self {
        self.config.cartesian = strategy;
        self
    }

    pub fn layout(mut self, layout: SpmvLayout) -> Self {
        self.config.layout = layout;
        self
    }

    pub fn cell_parallel(mut self, enabled: bool) -> Self {
        self.config.cell_parallel = enabled;
        self
    }

    pub fn grammar_segments(mut self, segments: usize) -> Self {
        self.config.grammar_segments = segments;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.config.threads = threads;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn fom(mut self, fom: Arc<dyn FigureOfMerit>) -> Self {
        self.config.fom = fom;
        self
    }

    pub fn kernels(mut self, kernels: Box<dyn KernelBackend>) -> Self {
        self.kernels = Some(kernels);
        self
    }

    pub fn build(self) -> Result<Parser> {
        match self.kernels {
            Some(kernels) => Parser::with_kernels(self.grammar, self.config, kernels),
            None => Parser::with_config(self.grammar, self.config),
        }
    }
}
