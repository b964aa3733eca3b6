//! Kernel dispatch boundary.
//!
//! A [`KernelBackend`] processes one span batch at a time as a sequence of
//! data-parallel kernels. Host and device exchange chart state only at the
//! two synchronization points: [`upload`](KernelBackend::upload) before the
//! batch and [`synchronize`](KernelBackend::synchronize) after it. No kernel
//! sees chart writes made during its own batch.
//!
//! [`HostKernels`] implements the boundary on the host, running each kernel
//! over the batch's cells on the rayon pool.

use crate::beam::{prune, BeamLimits, BeamQueue};
use crate::cartesian::{cartesian_product, CartesianProductVector, ChildFilter};
use crate::chart::{CellEntry, Chart, TemporaryCell, NO_MIDPOINT};
use crate::error::{ParseError, Result};
use crate::grammar::Grammar;
use crate::packing::INVALID_KEY;
use crate::parser::{is_exhaustive, panic_message, ParseStats, ParserConfig};
use crate::scheduler::SpanBatch;
use crate::semiring::{LogProb, UNPOPULATED};
use crate::spmv::{binary_spmv, lexical_spmv, unary_spmv};
use rayon::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// Populate word cells from the lexical matrix.
    Lexical,
    /// Union child pairs over every midpoint.
    CartesianProduct,
    BinarySpmv,
    /// One unary application; a no-op in pruned cells.
    UnarySpmv,
    /// Beam selection with unary expansion; a no-op in exhaustive cells.
    Prune,
    /// Prefix-sum compaction of populated slots.
    Pack,
}

pub trait KernelBackend: Send {
    fn name(&self) -> &str;

    /// Copy the chart to the device and bind the batch's cells.
    fn upload(&mut self, chart: &Chart, cells: &[(usize, usize)]) -> Result<()>;

    /// Enqueue `kernel` over every bound cell.
    fn launch(&mut self, kernel: Kernel) -> Result<()>;

    /// Wait for every queued kernel and finalize the bound cells in `chart`.
    fn synchronize(&mut self, chart: &mut Chart) -> Result<ParseStats>;
}

/// Exclusive prefix sum: `out[i] = values[0] + .. + values[i - 1]`.
/// Returns the sums and the grand total.
pub fn exclusive_scan(values: &[u32]) -> (Vec<u32>, u32) {
    let mut total = 0;
    let sums = values
        .iter()
        .map(|&v| {
            let before = total;
            total += v;
            before
        })
        .collect();
    (sums, total)
}

/// Drive `backend` over a bottom-up schedule.
pub fn run_batches(
    backend: &mut dyn KernelBackend,
    chart: &mut Chart,
    batches: &[SpanBatch],
) -> Result<ParseStats> {
    let mut stats = ParseStats::default();
    for batch in batches {
        if batch.visits.iter().any(|v| v.constraint.is_some()) {
            return Err(ParseError::UnsupportedStrategy(format!(
                "constrained visits on the {} backend",
                backend.name()
            )));
        }
        let cells: Vec<(usize, usize)> = batch.visits.iter().map(|v| (v.start, v.end)).collect();

        backend.upload(chart, &cells)?;
        if batch.span == 1 {
            backend.launch(Kernel::Lexical)?;
        } else {
            backend.launch(Kernel::CartesianProduct)?;
            backend.launch(Kernel::BinarySpmv)?;
        }
        backend.launch(Kernel::UnarySpmv)?;
        backend.launch(Kernel::Prune)?;
        backend.launch(Kernel::Pack)?;
        let batch_stats = backend.synchronize(chart)?;
        log::trace!(
            "{}: span {} batch of {} cells, {} entries",
            backend.name(),
            batch.span,
            cells.len(),
            batch_stats.populated_entries
        );
        stats += batch_stats;
    }
    Ok(stats)
}

/// Buffers bound to one cell of the current batch.
#[derive(Debug)]
struct DeviceCell {
    start: usize,
    end: usize,
    cpv: CartesianProductVector,
    temp: TemporaryCell,
    queue: BeamQueue,
    snapshot: Vec<(u32, LogProb)>,
    flags: Vec<u32>,
    packed: Vec<CellEntry>,
    stats: ParseStats,
}

impl DeviceCell {
    fn new(grammar: &Grammar) -> Self {
        let nt = grammar.num_nonterminals();
        DeviceCell {
            start: 0,
            end: 0,
            cpv: CartesianProductVector::for_grammar(grammar),
            temp: TemporaryCell::new(nt),
            queue: BeamQueue::new(nt),
            snapshot: Vec::new(),
            flags: Vec::with_capacity(nt),
            packed: Vec::new(),
            stats: ParseStats::default(),
        }
    }

    fn bind(&mut self, start: usize, end: usize) {
        self.start = start;
        self.end = end;
        self.temp.open(start, end);
        self.cpv.clear();
        self.packed.clear();
        self.stats = ParseStats {
            cells_visited: 1,
            ..ParseStats::default()
        };
    }
}

const EMPTY_ENTRY: CellEntry = CellEntry {
    nonterminal: 0,
    inside: UNPOPULATED,
    packed_children: INVALID_KEY,
    midpoint: NO_MIDPOINT,
};

fn execute(kernel: Kernel, grammar: &Grammar, config: &ParserConfig, device: &Chart, cell: &mut DeviceCell) {
    let (start, end) = (cell.start, cell.end);
    match kernel {
        Kernel::Lexical => {
            let token = device.tokens()[start];
            cell.stats.lexical_evaluations += lexical_spmv(grammar, token, None, &mut cell.temp);
        }
        Kernel::CartesianProduct => {
            cell.stats.cartesian_entries += cartesian_product(
                grammar,
                device,
                start,
                end,
                start + 1..end,
                ChildFilter::none(),
                &mut cell.cpv,
            );
        }
        Kernel::BinarySpmv => {
            cell.stats.binary_evaluations +=
                binary_spmv(grammar, config.layout, &cell.cpv, None, &mut cell.temp);
        }
        Kernel::UnarySpmv => {
            if is_exhaustive(grammar, device.cell_capacity(start, end)) {
                cell.stats.unary_evaluations +=
                    unary_spmv(grammar, &mut cell.temp, None, &mut cell.snapshot);
            }
        }
        Kernel::Prune => {
            let capacity = device.cell_capacity(start, end);
            if !is_exhaustive(grammar, capacity) {
                let limits =
                    BeamLimits::for_cell(end - start, capacity, capacity, config.lexical_unary_reserve);
                let kept = prune(
                    grammar,
                    &mut cell.temp,
                    limits,
                    config.fom.as_ref(),
                    &mut cell.queue,
                );
                cell.stats.entries_pruned += cell.temp.len() - kept.len();
                cell.temp.clear();
                for e in &kept {
                    cell.temp
                        .update(e.nonterminal, e.inside, e.packed_children, e.midpoint);
                }
            }
        }
        Kernel::Pack => {
            let nt = grammar.num_nonterminals() as u32;
            cell.flags.clear();
            cell.flags
                .extend((0..nt).map(|n| cell.temp.is_populated(n) as u32));
            let (offsets, total) = exclusive_scan(&cell.flags);
            cell.packed.clear();
            cell.packed.resize(total as usize, EMPTY_ENTRY);
            for n in 0..nt {
                if cell.flags[n as usize] == 1 {
                    cell.packed[offsets[n as usize] as usize] = cell.temp.entry(n);
                }
            }
            cell.stats.populated_entries = total as usize;
        }
    }
}

/// Host implementation of the kernel boundary.
///
/// Each kernel runs over the bound cells on a pool of `config.threads`
/// workers (rayon's global pool when zero). The cartesian product always
/// unions every midpoint and the binary matrix is never segmented, so
/// `config.cartesian`, `config.grammar_segments` and `config.cell_parallel`
/// have no effect here.
pub struct HostKernels {
    grammar: Arc<Grammar>,
    config: ParserConfig,
    pool: Option<rayon::ThreadPool>,
    /// Device copy of the chart as of the last upload.
    device: Option<Chart>,
    cells: Vec<DeviceCell>,
    bound: usize,
    pending: Vec<Kernel>,
    launches: usize,
}

impl HostKernels {
    pub fn new(grammar: Arc<Grammar>, config: ParserConfig) -> Result<Self> {
        let pool = if config.threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.threads)
                .thread_name(|i| format!("spmv-kernel-{}", i))
                .build()
                .map_err(|e| ParseError::ThreadPool(e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        Ok(HostKernels {
            grammar,
            config,
            pool,
            device: None,
            cells: Vec::new(),
            bound: 0,
            pending: Vec::new(),
            launches: 0,
        })
    }

    /// Kernels launched so far.
    pub fn launches(&self) -> usize {
        self.launches
    }

    /// Workers each kernel is spread over.
    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, |p| p.current_num_threads())
    }
}

impl KernelBackend for HostKernels {
    fn name(&self) -> &str {
        "host"
    }

    fn upload(&mut self, chart: &Chart, cells: &[(usize, usize)]) -> Result<()> {
        if !self.pending.is_empty() {
            return Err(ParseError::UnsupportedStrategy(format!(
                "upload with {} kernels pending",
                self.pending.len()
            )));
        }
        match &mut self.device {
            Some(device) => device.clone_from(chart),
            None => self.device = Some(chart.clone()),
        }
        while self.cells.len() < cells.len() {
            self.cells.push(DeviceCell::new(&self.grammar));
        }
        for (cell, &(start, end)) in self.cells.iter_mut().zip(cells) {
            cell.bind(start, end);
        }
        self.bound = cells.len();
        Ok(())
    }

    fn launch(&mut self, kernel: Kernel) -> Result<()> {
        if self.device.is_none() {
            return Err(ParseError::UnsupportedStrategy(format!(
                "{:?} launched before upload",
                kernel
            )));
        }
        self.pending.push(kernel);
        self.launches += 1;
        Ok(())
    }

    fn synchronize(&mut self, chart: &mut Chart) -> Result<ParseStats> {
        let Some(device) = self.device.as_ref() else {
            return Err(ParseError::UnsupportedStrategy(
                "synchronize before upload".to_string(),
            ));
        };
        let grammar = &*self.grammar;
        let config = &self.config;
        let pending = std::mem::take(&mut self.pending);
        let pool = self.pool.as_ref();
        let cells = &mut self.cells[..self.bound];

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut run = || {
                for &kernel in &pending {
                    cells
                        .par_iter_mut()
                        .for_each(|cell| execute(kernel, grammar, config, device, cell));
                }
            };
            match pool {
                Some(pool) => pool.install(run),
                None => run(),
            }
        }));
        if let Err(payload) = outcome {
            self.bound = 0;
            return Err(ParseError::WorkerFailed(panic_message(payload.as_ref())));
        }

        let mut stats = ParseStats::default();
        for cell in &self.cells[..self.bound] {
            chart.finalize_cell(cell.start, cell.end, &cell.packed);
            stats += cell.stats;
        }
        self.bound = 0;
        Ok(stats)
    }
}
