//! Immutable PCFG in sparse-matrix form.
//!
//! Binary rules are stored twice: row-major by parent (columns are packed
//! child-pair keys) for parent-driven SpMV, and column-major by packed key for
//! child-driven SpMV. Unary rules are likewise stored by parent and by child;
//! lexical rules are stored by terminal. Everything is built in one pass by
//! [`GrammarBuilder`] / [`Grammar::from_rules`] and never mutated afterwards,
//! so a `Grammar` can be shared across threads behind an `Arc`.

use crate::error::{ParseError, Result};
use crate::matrix::{CscMatrix, CsrMatrix, Triplet};
use crate::packing::{Packing, PackingFunction, PackingScheme, INVALID_KEY};
use crate::semiring::LogProb;
use crate::vocab::SymbolTable;
use std::fmt;

/// parent -> left right
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinaryRule {
    pub parent: u32,
    pub left: u32,
    pub right: u32,
    pub log_prob: LogProb,
}

/// parent -> child
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnaryRule {
    pub parent: u32,
    pub child: u32,
    pub log_prob: LogProb,
}

/// parent -> terminal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalRule {
    pub parent: u32,
    pub terminal: u32,
    pub log_prob: LogProb,
}

/// Rule lists handed over by grammar induction.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub binary: Vec<BinaryRule>,
    pub unary: Vec<UnaryRule>,
    pub lexical: Vec<LexicalRule>,
}

/// Sentinel bound for non-terminals that never appear as a left child.
const NO_SIBLING: (u32, u32) = (u32::MAX, 0);

const NO_RULES: (&[u32], &[LogProb]) = (&[], &[]);

/// An immutable grammar.
#[derive(Debug, Clone)]
pub struct Grammar {
    nonterminals: SymbolTable,
    lexicon: SymbolTable,
    start_symbol: u32,
    packing: Packing,

    binary_csr: CsrMatrix,
    binary_csc: CscMatrix,
    unary_csr: CsrMatrix,
    unary_csc: CscMatrix,
    lexical: CscMatrix,

    /// Per left child: min/max right sibling seen in any binary rule.
    right_sibling_bounds: Vec<(u32, u32)>,
    left_child: Vec<bool>,
    right_child: Vec<bool>,

    base_categories: Vec<u32>,
    splits: Vec<Vec<u32>>,
}

fn check_log_prob(value: LogProb, rule: impl FnOnce() -> String) -> Result<()> {
    if value.is_nan() || value > 1e-6 {
        return Err(ParseError::InvalidProbability {
            rule: rule(),
            value,
        });
    }
    Ok(())
}

impl Grammar {
    /// Build from rule lists over already-interned symbol tables.
    ///
    /// `base_categories[nt]` maps a latent split to its unsplit category; pass
    /// `None` for an unsplit grammar.
    pub fn from_rules(
        nonterminals: SymbolTable,
        lexicon: SymbolTable,
        start_symbol: u32,
        rules: &RuleSet,
        base_categories: Option<Vec<u32>>,
        scheme: PackingScheme,
    ) -> Result<Grammar> {
        let nt_count = nonterminals.len();
        let lex_count = lexicon.len();
        let check_nt = |index: u32| -> Result<()> {
            if (index as usize) < nt_count {
                Ok(())
            } else {
                Err(ParseError::NonTerminalOutOfRange {
                    index,
                    count: nt_count,
                })
            }
        };
        check_nt(start_symbol)?;

        for r in &rules.binary {
            check_nt(r.parent)?;
            check_nt(r.left)?;
            check_nt(r.right)?;
            check_log_prob(r.log_prob, || {
                format!(
                    "{} -> {} {}",
                    nonterminals.display(r.parent),
                    nonterminals.display(r.left),
                    nonterminals.display(r.right)
                )
            })?;
        }
        for r in &rules.unary {
            check_nt(r.parent)?;
            check_nt(r.child)?;
            check_log_prob(r.log_prob, || {
                format!(
                    "{} -> {}",
                    nonterminals.display(r.parent),
                    nonterminals.display(r.child)
                )
            })?;
        }
        for r in &rules.lexical {
            check_nt(r.parent)?;
            if r.terminal as usize >= lex_count {
                return Err(ParseError::TerminalOutOfRange {
                    index: r.terminal,
                    count: lex_count,
                });
            }
            check_log_prob(r.log_prob, || {
                format!(
                    "{} -> {}",
                    nonterminals.display(r.parent),
                    lexicon.display(r.terminal)
                )
            })?;
        }

        let packing = Packing::build(
            scheme,
            nt_count,
            lex_count,
            rules.binary.iter().map(|r| (r.left, r.right)),
        )?;

        let mut binary: Vec<Triplet> = Vec::with_capacity(rules.binary.len());
        let mut right_sibling_bounds = vec![NO_SIBLING; nt_count];
        let mut left_child = vec![false; nt_count];
        let mut right_child = vec![false; nt_count];
        for r in &rules.binary {
            let key = packing.pack(r.left, r.right);
            if key == INVALID_KEY {
                return Err(ParseError::PackingOverflow {
                    left: r.left,
                    right: r.right,
                    bits: 32,
                });
            }
            binary.push((r.parent, key, r.log_prob));
            let bounds = &mut right_sibling_bounds[r.left as usize];
            bounds.0 = bounds.0.min(r.right);
            bounds.1 = bounds.1.max(r.right);
            left_child[r.left as usize] = true;
            right_child[r.right as usize] = true;
        }
        let unary: Vec<Triplet> = rules
            .unary
            .iter()
            .map(|r| (r.parent, r.child, r.log_prob))
            .collect();
        let lexical: Vec<Triplet> = rules
            .lexical
            .iter()
            .map(|r| (r.parent, r.terminal, r.log_prob))
            .collect();

        let base_categories = match base_categories {
            Some(bases) => {
                if bases.len() != nt_count {
                    return Err(ParseError::NonTerminalOutOfRange {
                        index: bases.len() as u32,
                        count: nt_count,
                    });
                }
                for &b in &bases {
                    check_nt(b)?;
                }
                bases
            }
            None => (0..nt_count as u32).collect(),
        };
        // A declared base lists only its splits, not itself.
        let mut has_splits = vec![false; nt_count];
        for (nt, &base) in base_categories.iter().enumerate() {
            if base as usize != nt {
                has_splits[base as usize] = true;
            }
        }
        let mut splits = vec![Vec::new(); nt_count];
        for (nt, &base) in base_categories.iter().enumerate() {
            if base as usize == nt && has_splits[nt] {
                continue;
            }
            splits[base as usize].push(nt as u32);
        }

        let grammar = Grammar {
            binary_csr: CsrMatrix::from_triplets(nt_count, binary.clone()),
            binary_csc: CscMatrix::from_triplets(binary),
            unary_csr: CsrMatrix::from_triplets(nt_count, unary.clone()),
            unary_csc: CscMatrix::from_triplets(unary),
            lexical: CscMatrix::from_triplets(lexical),
            nonterminals,
            lexicon,
            start_symbol,
            packing,
            right_sibling_bounds,
            left_child,
            right_child,
            base_categories,
            splits,
        };
        log::debug!("built grammar: {}", grammar);
        Ok(grammar)
    }

    pub fn num_nonterminals(&self) -> usize {
        self.nonterminals.len()
    }

    pub fn lexicon_size(&self) -> usize {
        self.lexicon.len()
    }

    pub fn start_symbol(&self) -> u32 {
        self.start_symbol
    }

    pub fn nonterminals(&self) -> &SymbolTable {
        &self.nonterminals
    }

    pub fn lexicon(&self) -> &SymbolTable {
        &self.lexicon
    }

    pub fn packing(&self) -> &Packing {
        &self.packing
    }

    /// Binary rules by parent; columns are packed child-pair keys.
    pub fn binary_csr(&self) -> &CsrMatrix {
        &self.binary_csr
    }

    /// Binary rules by packed child-pair key; rows are parents.
    pub fn binary_csc(&self) -> &CscMatrix {
        &self.binary_csc
    }

    /// Unary rules by parent; columns are children.
    pub fn unary_csr(&self) -> &CsrMatrix {
        &self.unary_csr
    }

    /// Unary rules by child; rows are parents.
    pub fn unary_csc(&self) -> &CscMatrix {
        &self.unary_csc
    }

    /// Parents (and scores) of unary rules rewriting to `child`.
    #[inline]
    pub fn unary_parents(&self, child: u32) -> (&[u32], &[LogProb]) {
        self.unary_csc.column(child).unwrap_or(NO_RULES)
    }

    /// Parents (and scores) of lexical rules producing `terminal`.
    #[inline]
    pub fn lexical_parents(&self, terminal: u32) -> (&[u32], &[LogProb]) {
        self.lexical.column(terminal).unwrap_or(NO_RULES)
    }

    /// Min/max right sibling of `left`, or `None` if it is never a left child.
    #[inline(always)]
    pub fn right_sibling_bounds(&self, left: u32) -> Option<(u32, u32)> {
        let bounds = self.right_sibling_bounds[left as usize];
        if bounds == NO_SIBLING {
            None
        } else {
            Some(bounds)
        }
    }

    #[inline(always)]
    pub fn is_left_child(&self, nt: u32) -> bool {
        self.left_child[nt as usize]
    }

    #[inline(always)]
    pub fn is_right_child(&self, nt: u32) -> bool {
        self.right_child[nt as usize]
    }

    /// The unsplit category a latent split belongs to.
    pub fn base_category(&self, nt: u32) -> u32 {
        self.base_categories[nt as usize]
    }

    /// All splits of a base category (empty for non-base indices).
    pub fn splits_of(&self, base: u32) -> &[u32] {
        self.splits
            .get(base as usize)
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    pub fn binary_log_prob(&self, parent: u32, left: u32, right: u32) -> Option<LogProb> {
        let key = self.packing.pack(left, right);
        if key == INVALID_KEY {
            return None;
        }
        self.binary_csr.get(parent, key)
    }

    pub fn unary_log_prob(&self, parent: u32, child: u32) -> Option<LogProb> {
        self.unary_csr.get(parent, child)
    }

    pub fn lexical_log_prob(&self, parent: u32, terminal: u32) -> Option<LogProb> {
        self.lexical.get(parent, terminal)
    }

    /// Resolve a non-terminal name to its index.
    pub fn nonterminal(&self, name: &str) -> Result<u32> {
        self.nonterminals
            .get(name)
            .ok_or_else(|| ParseError::UnknownSymbol(name.to_string()))
    }

    /// Resolve a terminal to its lexicon index.
    pub fn terminal(&self, word: &str) -> Result<u32> {
        self.lexicon
            .get(word)
            .ok_or_else(|| ParseError::UnknownSymbol(word.to_string()))
    }

    /// Resolve a whitespace-separated sentence to terminal indices.
    pub fn tokenize(&self, sentence: &str) -> Result<Vec<u32>> {
        sentence.split_whitespace().map(|w| self.terminal(w)).collect()
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} non-terminals, {} terminals, {} binary / {} unary / {} lexical rules, {:?} packing ({} keys)",
            self.num_nonterminals(),
            self.lexicon_size(),
            self.binary_csr.nnz(),
            self.unary_csr.nnz(),
            self.lexical.nnz(),
            self.packing.scheme(),
            self.packing.packed_array_size()
        )
    }
}

/// Builds a [`Grammar`] from symbol names, interning as it goes.
#[derive(Debug, Clone, Default)]
pub struct GrammarBuilder {
    nonterminals: SymbolTable,
    lexicon: SymbolTable,
    start: Option<u32>,
    rules: RuleSet,
    bases: Vec<(u32, u32)>,
    scheme: PackingScheme,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the start symbol. Interning it first gives it index 0.
    pub fn start(mut self, symbol: &str) -> Self {
        self.start = Some(self.nonterminals.intern(symbol));
        self
    }

    pub fn packing(mut self, scheme: PackingScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn binary(mut self, parent: &str, left: &str, right: &str, log_prob: LogProb) -> Self {
        let rule = BinaryRule {
            parent: self.nonterminals.intern(parent),
            left: self.nonterminals.intern(left),
            right: self.nonterminals.intern(right),
            log_prob,
        };
        self.rules.binary.push(rule);
        self
    }

    pub fn unary(mut self, parent: &str, child: &str, log_prob: LogProb) -> Self {
        let rule = UnaryRule {
            parent: self.nonterminals.intern(parent),
            child: self.nonterminals.intern(child),
            log_prob,
        };
        self.rules.unary.push(rule);
        self
    }

    pub fn lexical(mut self, parent: &str, word: &str, log_prob: LogProb) -> Self {
        let rule = LexicalRule {
            parent: self.nonterminals.intern(parent),
            terminal: self.lexicon.intern(word),
            log_prob,
        };
        self.rules.lexical.push(rule);
        self
    }

    /// Declare `split` to be a latent sub-category of `base`.
    pub fn split(mut self, split: &str, base: &str) -> Self {
        let s = self.nonterminals.intern(split);
        let b = self.nonterminals.intern(base);
        self.bases.push((s, b));
        self
    }

    pub fn build(self) -> Result<Grammar> {
        let start = match self.start {
            Some(s) => s,
            None => return Err(ParseError::UnknownSymbol("<start symbol>".to_string())),
        };
        let base_categories = if self.bases.is_empty() {
            None
        } else {
            let mut bases: Vec<u32> = (0..self.nonterminals.len() as u32).collect();
            for (split, base) in self.bases {
                bases[split as usize] = base;
            }
            Some(bases)
        };
        Grammar::from_rules(
            self.nonterminals,
            self.lexicon,
            start,
            &self.rules,
            base_categories,
            self.scheme,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ln(p: f64) -> LogProb {
        p.ln() as LogProb
    }

    fn toy(scheme: PackingScheme) -> Grammar {
        GrammarBuilder::new()
            .start("S")
            .packing(scheme)
            .binary("S", "NP", "VP", ln(1.0))
            .binary("NP", "DT", "NN", ln(0.6))
            .binary("VP", "VB", "NP", ln(0.7))
            .unary("VP", "VB", ln(0.3))
            .unary("NP", "NN", ln(0.4))
            .lexical("DT", "the", ln(1.0))
            .lexical("NN", "dog", ln(0.5))
            .lexical("NN", "cat", ln(0.5))
            .lexical("VB", "saw", ln(1.0))
            .build()
            .unwrap()
    }

    #[test]
    fn test_counts() {
        let g = toy(PackingScheme::LeftShift);
        assert_eq!(g.num_nonterminals(), 6);
        assert_eq!(g.lexicon_size(), 4);
        assert_eq!(g.start_symbol(), 0);
        assert_eq!(g.binary_csr().nnz(), 3);
        assert_eq!(g.unary_csr().nnz(), 2);
    }

    #[test]
    fn test_csr_and_csc_agree() {
        for scheme in [PackingScheme::LeftShift, PackingScheme::PerfectHash] {
            let g = toy(scheme);
            for (parent, key, prob) in g.binary_csr().iter() {
                assert_eq!(g.binary_csc().get(parent, key), Some(prob));
            }
            for (parent, key, prob) in g.binary_csc().iter() {
                assert_eq!(g.binary_csr().get(parent, key), Some(prob));
            }
            for (parent, child, prob) in g.unary_csr().iter() {
                assert_eq!(g.unary_csc().get(parent, child), Some(prob));
            }
        }
    }

    #[test]
    fn test_rule_lookup() {
        let g = toy(PackingScheme::PerfectHash);
        let np = g.nonterminal("NP").unwrap();
        let dt = g.nonterminal("DT").unwrap();
        let nn = g.nonterminal("NN").unwrap();
        let p = g.binary_log_prob(np, dt, nn).unwrap();
        assert!((p - ln(0.6)).abs() < 1e-6);
        assert!(g.binary_log_prob(np, nn, dt).is_none());
        assert!((g.unary_log_prob(np, nn).unwrap() - ln(0.4)).abs() < 1e-6);

        let dog = g.terminal("dog").unwrap();
        let (parents, _) = g.lexical_parents(dog);
        assert_eq!(parents, &[nn]);
    }

    #[test]
    fn test_right_sibling_bounds() {
        let g = toy(PackingScheme::LeftShift);
        let vb = g.nonterminal("VB").unwrap();
        let np = g.nonterminal("NP").unwrap();
        let s = g.nonterminal("S").unwrap();
        assert_eq!(g.right_sibling_bounds(vb), Some((np, np)));
        assert_eq!(g.right_sibling_bounds(s), None);
        assert!(g.is_left_child(vb));
        assert!(g.is_right_child(np));
        assert!(!g.is_left_child(s));
    }

    #[test]
    fn test_splits() {
        let g = GrammarBuilder::new()
            .start("S")
            .split("NP_0", "NP")
            .split("NP_1", "NP")
            .unary("S", "NP_0", ln(0.5))
            .unary("S", "NP_1", ln(0.5))
            .lexical("NP_0", "it", ln(1.0))
            .lexical("NP_1", "it", ln(1.0))
            .build()
            .unwrap();
        let np = g.nonterminal("NP").unwrap();
        let np0 = g.nonterminal("NP_0").unwrap();
        assert_eq!(g.base_category(np0), np);
        assert_eq!(g.splits_of(np).len(), 2);
        assert_eq!(g.base_category(np), np);
    }

    #[test]
    fn test_invalid_probability_rejected() {
        let result = GrammarBuilder::new()
            .start("S")
            .unary("S", "A", 0.5)
            .build();
        assert!(matches!(
            result,
            Err(ParseError::InvalidProbability { .. })
        ));
    }

    #[test]
    fn test_tokenize_unknown_word() {
        let g = toy(PackingScheme::LeftShift);
        assert_eq!(g.tokenize("the dog").unwrap().len(), 2);
        assert_eq!(
            g.tokenize("the unicorn"),
            Err(ParseError::UnknownSymbol("unicorn".to_string()))
        );
    }
}
