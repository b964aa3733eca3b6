//! Charts pre-populated from a reference tree.
//!
//! A [`ConstrainingChart`] records, for every constituent span of a gold
//! tree, the binary split point and the unary chain of base categories above
//! it. The constrained parse visits only those cells, at only those
//! midpoints, and licenses only the splits of the recorded categories.

use crate::error::{ParseError, Result};
use crate::grammar::Grammar;
use crate::tree::ParseTree;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Longest unary chain (in rule applications) a reference tree may contain.
pub const MAX_UNARY_CHAIN: usize = 4;

/// One constituent span of the reference tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstrainedCell {
    pub start: usize,
    pub end: usize,
    /// Split point of the gold binary production; `None` for a word.
    pub midpoint: Option<usize>,
    /// Base categories from the top of the unary chain down. Each level
    /// below the first is reached by one unary rule.
    pub chain: Vec<u32>,
}

impl ConstrainedCell {
    pub fn span(&self) -> usize {
        self.end - self.start
    }

    pub fn top(&self) -> u32 {
        self.chain[0]
    }

    pub fn bottom(&self) -> u32 {
        self.chain[self.chain.len() - 1]
    }

    /// Number of unary applications above the bottom category.
    pub fn unary_depth(&self) -> usize {
        self.chain.len() - 1
    }

    /// Entries the cell may hold: every split of every chain level.
    pub fn capacity(&self, grammar: &Grammar) -> usize {
        self.chain.iter().map(|&b| grammar.splits_of(b).len()).sum()
    }
}

/// The cells of one reference tree, span-major.
#[derive(Debug, Clone)]
pub struct ConstrainingChart {
    grammar: Arc<Grammar>,
    tokens: Vec<u32>,
    cells: Vec<ConstrainedCell>,
    index: FxHashMap<(usize, usize), usize>,
}

impl ConstrainingChart {
    /// Read the bracketing of `tree`.
    ///
    /// Fails with [`ParseError::MalformedTree`] if the tree is not binary,
    /// puts two words (or a word and a constituent) under one node, uses an
    /// out-of-range category, repeats a category within a unary chain, has a
    /// chain longer than [`MAX_UNARY_CHAIN`], or has spans that do not tile
    /// the sentence.
    pub fn from_tree(grammar: Arc<Grammar>, tree: &ParseTree) -> Result<ConstrainingChart> {
        let mut walker = TreeWalker {
            grammar: &grammar,
            root: tree,
            tokens: Vec::new(),
            cells: Vec::new(),
        };
        walker.walk(tree)?;
        let (root_start, root_end) = tree.span();
        if root_start != 0 || root_end != walker.tokens.len() {
            return Err(walker.malformed(format!(
                "root spans ({}, {}) over {} words",
                root_start,
                root_end,
                walker.tokens.len()
            )));
        }

        let TreeWalker {
            tokens, mut cells, ..
        } = walker;
        cells.sort_by_key(|c| (c.span(), c.start));
        let index = cells
            .iter()
            .enumerate()
            .map(|(i, c)| ((c.start, c.end), i))
            .collect();
        Ok(ConstrainingChart {
            grammar,
            tokens,
            cells,
            index,
        })
    }

    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Sentence length.
    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    /// Constituent cells in visiting order: by span, then start.
    pub fn cells(&self) -> &[ConstrainedCell] {
        &self.cells
    }

    pub fn cell(&self, start: usize, end: usize) -> Option<&ConstrainedCell> {
        self.index.get(&(start, end)).map(|&i| &self.cells[i])
    }

    /// Rebuild the reference bracketing (over base categories) if `root`
    /// belongs to the category at the top of the whole-sentence cell.
    pub fn extract_best_parse(&self, root: u32) -> Option<ParseTree> {
        let top = self.cell(0, self.size())?.top();
        if self.grammar.base_category(root) != top {
            return None;
        }
        self.build(0, self.size())
    }

    fn build(&self, start: usize, end: usize) -> Option<ParseTree> {
        let cell = self.cell(start, end)?;
        let mut node = match cell.midpoint {
            None => ParseTree::leaf(self.tokens[start], start),
            Some(mid) => {
                let left = self.build(start, mid)?;
                let right = self.build(mid, end)?;
                ParseTree::branch(cell.bottom(), (start, end), vec![left, right])
            }
        };
        let mut levels = cell.chain.iter().rev();
        if cell.midpoint.is_some() {
            levels.next();
        }
        for &label in levels {
            node = ParseTree::branch(label, (start, end), vec![node]);
        }
        Some(node)
    }
}

struct TreeWalker<'a> {
    grammar: &'a Grammar,
    root: &'a ParseTree,
    tokens: Vec<u32>,
    cells: Vec<ConstrainedCell>,
}

impl TreeWalker<'_> {
    fn malformed(&self, reason: String) -> ParseError {
        ParseError::MalformedTree {
            sentence: self.root.display(self.grammar).to_string(),
            reason,
        }
    }

    fn walk(&mut self, tree: &ParseTree) -> Result<()> {
        let span = tree.span();
        let mut chain = Vec::new();
        let mut node = tree;
        loop {
            let ParseTree::Branch(constituent, children) = node else {
                return Err(self.malformed("word where a constituent is expected".to_string()));
            };
            let count = self.grammar.num_nonterminals();
            if constituent.label as usize >= count {
                return Err(self.malformed(format!(
                    "category index {} out of range ({} non-terminals)",
                    constituent.label, count
                )));
            }
            if constituent.span != span {
                return Err(self.malformed(format!(
                    "unary child spans {:?}, parent spans {:?}",
                    constituent.span, span
                )));
            }
            let base = self.grammar.base_category(constituent.label);
            if chain.contains(&base) {
                return Err(self.malformed(format!(
                    "unary chain over {:?} repeats {}",
                    span,
                    self.grammar.nonterminals().display(base)
                )));
            }
            chain.push(base);
            if chain.len() > MAX_UNARY_CHAIN + 1 {
                return Err(self.malformed(format!(
                    "unary chain over {:?} exceeds {} rules",
                    span, MAX_UNARY_CHAIN
                )));
            }

            match children.as_slice() {
                [ParseTree::Leaf(word)] => {
                    if word.position != self.tokens.len() || span != (word.position, word.position + 1) {
                        return Err(self.malformed(format!(
                            "word at position {} does not follow the {} before it",
                            word.position,
                            self.tokens.len()
                        )));
                    }
                    self.tokens.push(word.terminal);
                    self.cells.push(ConstrainedCell {
                        start: span.0,
                        end: span.1,
                        midpoint: None,
                        chain,
                    });
                    return Ok(());
                }
                [child @ ParseTree::Branch(..)] => {
                    node = child;
                }
                [left @ ParseTree::Branch(..), right @ ParseTree::Branch(..)] => {
                    let (l, r) = (left.span(), right.span());
                    if l.0 != span.0 || l.1 != r.0 || r.1 != span.1 || l.0 >= l.1 || r.0 >= r.1 {
                        return Err(self.malformed(format!(
                            "children {:?} and {:?} do not tile {:?}",
                            l, r, span
                        )));
                    }
                    self.cells.push(ConstrainedCell {
                        start: span.0,
                        end: span.1,
                        midpoint: Some(l.1),
                        chain,
                    });
                    self.walk(left)?;
                    return self.walk(right);
                }
                [] => return Err(self.malformed("constituent without children".to_string())),
                [ParseTree::Leaf(_), ParseTree::Leaf(_)] => {
                    return Err(self.malformed(format!(
                        "constituent over {:?} has two words; each word needs its own pre-terminal",
                        span
                    )))
                }
                [_, _] => {
                    return Err(self.malformed(format!(
                        "constituent over {:?} mixes words and constituents",
                        span
                    )))
                }
                _ => {
                    return Err(self.malformed(format!(
                        "{}-ary constituent over {:?}; binarize first",
                        children.len(),
                        span
                    )))
                }
            }
        }
    }
}
