//! Rule counting over a corpus of reference trees.
//!
//! Each tree is turned into a [`ConstrainingChart`], parsed under its
//! constraints, and the winning derivation (over latent splits) is counted.
//! Malformed trees are logged and skipped; they never abort the corpus.

use crate::constrained::ConstrainingChart;
use crate::error::{ParseError, Result};
use crate::parser::Parser;
use crate::semiring::{LogProb, UNPOPULATED};
use crate::tree::{ParseTree, RuleCounts};

/// Outcome of counting one corpus.
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub counts: RuleCounts,
    /// Trees whose constrained parse reached the root.
    pub parsed: usize,
    /// Well-formed trees the grammar cannot derive.
    pub unparsed: usize,
    /// Corpus index and error of each malformed tree.
    pub skipped: Vec<(usize, ParseError)>,
    /// Sum of the root log probabilities of parsed trees.
    pub log_likelihood: f64,
}

/// Best derivation consistent with `gold`, over the grammar's splits.
/// `Ok(None)` if the grammar cannot derive it.
pub fn constrained_best(parser: &mut Parser, gold: &ParseTree) -> Result<Option<(ParseTree, LogProb)>> {
    let grammar = parser.grammar().clone();
    let constraining = ConstrainingChart::from_tree(grammar.clone(), gold)?;
    let chart = parser.parse_constrained(&constraining)?;

    let Some(top) = constraining.cell(0, constraining.size()).map(|c| c.top()) else {
        return Ok(None);
    };
    let mut best: Option<(u32, LogProb)> = None;
    for &root in grammar.splits_of(top) {
        let inside = chart.root_inside(root);
        if inside > best.map_or(UNPOPULATED, |b| b.1) {
            best = Some((root, inside));
        }
    }
    Ok(best.and_then(|(root, inside)| chart.extract_best_parse(root).map(|t| (t, inside))))
}

/// Count the productions of the best constrained derivation of every tree.
pub fn count_corpus(parser: &mut Parser, corpus: &[ParseTree]) -> Result<TrainingReport> {
    let mut report = TrainingReport::default();
    for (i, gold) in corpus.iter().enumerate() {
        match constrained_best(parser, gold) {
            Ok(Some((tree, inside))) => {
                report.counts.add_tree(&tree);
                report.parsed += 1;
                report.log_likelihood += inside as f64;
            }
            Ok(None) => {
                log::warn!("tree {}: no derivation under the grammar", i);
                report.unparsed += 1;
            }
            Err(e @ ParseError::MalformedTree { .. }) => {
                log::warn!("tree {}: skipping: {}", i, e);
                report.skipped.push((i, e));
            }
            Err(e) => return Err(e),
        }
    }
    log::debug!(
        "counted {} trees ({} unparsed, {} skipped), log likelihood {:.4}",
        report.parsed,
        report.unparsed,
        report.skipped.len(),
        report.log_likelihood
    );
    Ok(report)
}
