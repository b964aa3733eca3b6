//! spmv-parse: a Viterbi chart parser built on sparse matrix × vector products.
//!
//! This crate provides:
//! - Packing functions mapping child pairs to dense keys
//! - Grammars stored as CSR/CSC rule matrices
//! - A packed triangular chart with explicit open/finalized cells
//! - Cartesian-product, binary and unary SpMV stages over the max-plus semiring
//! - Beam pruning with pluggable figures of merit
//! - Cell-parallel, segment-parallel and kernel-dispatch execution
//! - Gold-tree constrained parsing and rule counting for training

pub mod beam;
pub mod cartesian;
pub mod chart;
pub mod constrained;
pub mod error;
pub mod grammar;
pub mod kernel;
pub mod matrix;
pub mod packing;
pub mod parser;
pub mod scheduler;
pub mod semiring;
pub mod spmv;
pub mod training;
pub mod tree;
pub mod vocab;

// Re-exports for convenience
pub use beam::{FigureOfMerit, InsideFom, PriorFom};
pub use cartesian::CartesianProductStrategy;
pub use chart::{BestEdge, Cell, CellEntry, CellState, Chart, Edge, TemporaryCell};
pub use constrained::{ConstrainingChart, MAX_UNARY_CHAIN};
pub use error::{ParseError, Result};
pub use grammar::{Grammar, GrammarBuilder};
pub use kernel::{exclusive_scan, HostKernels, Kernel, KernelBackend};
pub use packing::{Packing, PackingFunction, PackingScheme};
pub use parser::{Backend, ParseStats, Parser, ParserBuilder, ParserConfig};
pub use scheduler::{BottomUpSelector, CellSelector, ConstrainedSelector};
pub use semiring::{LogProb, MaxPlus, Semiring};
pub use spmv::SpmvLayout;
pub use training::{count_corpus, TrainingReport};
pub use tree::{ParseTree, Production, RuleCounts};
pub use vocab::SymbolTable;
