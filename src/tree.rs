//! Derivation trees: rendering, a bracketed reader, and rule counting.
//!
//! Labels are grammar indices. Rendering and reading go through a
//! [`Grammar`]'s symbol tables, in the usual bracketed form:
//!
//! ```text
//! (S (A (A c) (B d)))
//! ```

use crate::error::{ParseError, Result};
use crate::grammar::Grammar;
use rustc_hash::FxHashMap;
use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Constituent {
    pub label: u32,
    pub span: (usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Word {
    pub terminal: u32,
    pub position: usize,
}

/// A derivation tree over grammar indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParseTree {
    Branch(Constituent, Vec<ParseTree>),
    Leaf(Word),
}

impl ParseTree {
    pub fn branch(label: u32, span: (usize, usize), children: Vec<ParseTree>) -> Self {
        ParseTree::Branch(Constituent { label, span }, children)
    }

    pub fn leaf(terminal: u32, position: usize) -> Self {
        ParseTree::Leaf(Word { terminal, position })
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, ParseTree::Leaf(_))
    }

    pub fn span(&self) -> (usize, usize) {
        match self {
            ParseTree::Branch(c, _) => c.span,
            ParseTree::Leaf(w) => (w.position, w.position + 1),
        }
    }

    pub fn label(&self) -> Option<u32> {
        match self {
            ParseTree::Branch(c, _) => Some(c.label),
            ParseTree::Leaf(_) => None,
        }
    }

    pub fn children(&self) -> &[ParseTree] {
        match self {
            ParseTree::Branch(_, children) => children,
            ParseTree::Leaf(_) => &[],
        }
    }

    /// Terminals in left-to-right order.
    pub fn terminals(&self) -> Vec<u32> {
        let mut out = Vec::new();
        self.collect_terminals(&mut out);
        out
    }

    fn collect_terminals(&self, out: &mut Vec<u32>) {
        match self {
            ParseTree::Leaf(w) => out.push(w.terminal),
            ParseTree::Branch(_, children) => {
                for c in children {
                    c.collect_terminals(out);
                }
            }
        }
    }

    /// Set of labelled spans, the unit bracketing comparisons work on.
    pub fn brackets(&self) -> Vec<Constituent> {
        let mut out = Vec::new();
        self.collect_brackets(&mut out);
        out
    }

    fn collect_brackets(&self, out: &mut Vec<Constituent>) {
        if let ParseTree::Branch(c, children) = self {
            out.push(*c);
            for child in children {
                child.collect_brackets(out);
            }
        }
    }

    /// Render through the grammar's symbol tables.
    pub fn display<'a>(&'a self, grammar: &'a Grammar) -> TreeDisplay<'a> {
        TreeDisplay {
            tree: self,
            grammar,
            base_labels: false,
        }
    }

    /// Render with every label replaced by its base category.
    pub fn display_unsplit<'a>(&'a self, grammar: &'a Grammar) -> TreeDisplay<'a> {
        TreeDisplay {
            tree: self,
            grammar,
            base_labels: true,
        }
    }

    /// Replace every label by its base category.
    pub fn unsplit(&self, grammar: &Grammar) -> ParseTree {
        match self {
            ParseTree::Leaf(w) => ParseTree::Leaf(*w),
            ParseTree::Branch(c, children) => ParseTree::branch(
                grammar.base_category(c.label),
                c.span,
                children.iter().map(|t| t.unsplit(grammar)).collect(),
            ),
        }
    }

    /// Read a bracketed tree, resolving labels and words through `grammar`.
    pub fn from_bracketed(text: &str, grammar: &Grammar) -> Result<ParseTree> {
        let mut reader = TreeReader {
            chars: text.char_indices().peekable(),
            grammar,
            position: 0,
        };
        let tree = reader.read_tree()?;
        reader.skip_whitespace();
        if let Some(&(i, c)) = reader.chars.peek() {
            return Err(ParseError::TreeSyntax {
                position: i,
                message: format!("trailing input starting with {:?}", c),
            });
        }
        Ok(tree)
    }
}

pub struct TreeDisplay<'a> {
    tree: &'a ParseTree,
    grammar: &'a Grammar,
    base_labels: bool,
}

impl fmt::Display for TreeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tree {
            ParseTree::Leaf(w) => write!(f, "{}", self.grammar.lexicon().display(w.terminal)),
            ParseTree::Branch(c, children) => {
                let label = if self.base_labels {
                    self.grammar.base_category(c.label)
                } else {
                    c.label
                };
                write!(f, "({}", self.grammar.nonterminals().display(label))?;
                for child in children {
                    let d = TreeDisplay {
                        tree: child,
                        grammar: self.grammar,
                        base_labels: self.base_labels,
                    };
                    write!(f, " {}", d)?;
                }
                write!(f, ")")
            }
        }
    }
}

struct TreeReader<'a> {
    chars: Peekable<CharIndices<'a>>,
    grammar: &'a Grammar,
    /// Index of the next leaf.
    position: usize,
}

impl TreeReader<'_> {
    fn skip_whitespace(&mut self) {
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }
    }

    fn offset(&mut self) -> usize {
        self.chars.peek().map(|&(i, _)| i).unwrap_or(usize::MAX)
    }

    fn read_symbol(&mut self) -> Result<String> {
        self.skip_whitespace();
        let mut s = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_whitespace() || c == '(' || c == ')' {
                break;
            }
            s.push(c);
            self.chars.next();
        }
        if s.is_empty() {
            let position = self.offset();
            return Err(ParseError::TreeSyntax {
                position,
                message: "expected a symbol".to_string(),
            });
        }
        Ok(s)
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        self.skip_whitespace();
        match self.chars.next() {
            Some((_, c)) if c == expected => Ok(()),
            Some((i, c)) => Err(ParseError::TreeSyntax {
                position: i,
                message: format!("expected {:?}, found {:?}", expected, c),
            }),
            None => Err(ParseError::TreeSyntax {
                position: usize::MAX,
                message: format!("expected {:?}, found end of input", expected),
            }),
        }
    }

    fn read_tree(&mut self) -> Result<ParseTree> {
        self.expect('(')?;
        let label = self.read_symbol()?;
        let label = self.grammar.nonterminal(&label)?;
        let start = self.position;
        let mut children = Vec::new();
        loop {
            self.skip_whitespace();
            match self.chars.peek() {
                Some(&(_, ')')) => {
                    self.chars.next();
                    break;
                }
                Some(&(_, '(')) => children.push(self.read_tree()?),
                Some(_) => {
                    let word = self.read_symbol()?;
                    let terminal = self.grammar.terminal(&word)?;
                    children.push(ParseTree::leaf(terminal, self.position));
                    self.position += 1;
                }
                None => {
                    return Err(ParseError::TreeSyntax {
                        position: usize::MAX,
                        message: "unbalanced parentheses".to_string(),
                    })
                }
            }
        }
        if children.is_empty() {
            return Err(ParseError::TreeSyntax {
                position: self.offset(),
                message: "constituent without children".to_string(),
            });
        }
        Ok(ParseTree::branch(label, (start, self.position), children))
    }
}

/// A production as counted from a derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Production {
    Binary { parent: u32, left: u32, right: u32 },
    Unary { parent: u32, child: u32 },
    Lexical { parent: u32, terminal: u32 },
}

/// Rule-occurrence counts, the input to grammar re-estimation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleCounts {
    counts: FxHashMap<Production, f64>,
    trees: usize,
}

impl RuleCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count every production used by `tree`.
    pub fn add_tree(&mut self, tree: &ParseTree) {
        self.trees += 1;
        self.add_subtree(tree);
    }

    fn add_subtree(&mut self, tree: &ParseTree) {
        let ParseTree::Branch(c, children) = tree else {
            return;
        };
        let production = match children.as_slice() {
            [ParseTree::Leaf(w)] => Production::Lexical {
                parent: c.label,
                terminal: w.terminal,
            },
            [child] => Production::Unary {
                parent: c.label,
                child: child.label().unwrap_or(u32::MAX),
            },
            [left, right] => Production::Binary {
                parent: c.label,
                left: left.label().unwrap_or(u32::MAX),
                right: right.label().unwrap_or(u32::MAX),
            },
            _ => return,
        };
        *self.counts.entry(production).or_insert(0.0) += 1.0;
        for child in children {
            self.add_subtree(child);
        }
    }

    /// Fold another set of counts into this one.
    pub fn merge(&mut self, other: &RuleCounts) {
        self.trees += other.trees;
        for (p, c) in &other.counts {
            *self.counts.entry(*p).or_insert(0.0) += c;
        }
    }

    pub fn get(&self, production: &Production) -> f64 {
        self.counts.get(production).copied().unwrap_or(0.0)
    }

    /// Number of trees counted.
    pub fn trees(&self) -> usize {
        self.trees
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Production, &f64)> {
        self.counts.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::GrammarBuilder;

    fn grammar() -> Grammar {
        GrammarBuilder::new()
            .start("S")
            .unary("S", "A", 0.0)
            .binary("A", "A", "B", -1.0)
            .lexical("A", "c", -1.0)
            .lexical("B", "d", -1.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_read_and_render() {
        let g = grammar();
        let text = "(S (A (A c) (B d)))";
        let tree = ParseTree::from_bracketed(text, &g).unwrap();
        assert_eq!(tree.span(), (0, 2));
        assert_eq!(tree.terminals().len(), 2);
        assert_eq!(tree.display(&g).to_string(), text);
    }

    #[test]
    fn test_brackets() {
        let g = grammar();
        let tree = ParseTree::from_bracketed("(S (A (A c) (B d)))", &g).unwrap();
        let spans: Vec<_> = tree.brackets().iter().map(|c| c.span).collect();
        assert_eq!(spans, vec![(0, 2), (0, 2), (0, 1), (1, 2)]);
    }

    #[test]
    fn test_syntax_errors() {
        let g = grammar();
        assert!(matches!(
            ParseTree::from_bracketed("(S (A c)", &g),
            Err(ParseError::TreeSyntax { .. })
        ));
        assert!(matches!(
            ParseTree::from_bracketed("(S (A c)) extra", &g),
            Err(ParseError::TreeSyntax { .. })
        ));
        assert_eq!(
            ParseTree::from_bracketed("(X c)", &g),
            Err(ParseError::UnknownSymbol("X".to_string()))
        );
    }

    #[test]
    fn test_rule_counts() {
        let g = grammar();
        let tree = ParseTree::from_bracketed("(S (A (A (A c) (B d)) (B d)))", &g).unwrap();
        let mut counts = RuleCounts::new();
        counts.add_tree(&tree);

        let a = g.nonterminal("A").unwrap();
        let b = g.nonterminal("B").unwrap();
        let d = g.terminal("d").unwrap();
        assert_eq!(
            counts.get(&Production::Binary {
                parent: a,
                left: a,
                right: b
            }),
            2.0
        );
        assert_eq!(counts.get(&Production::Lexical { parent: b, terminal: d }), 2.0);

        let mut total = RuleCounts::new();
        total.merge(&counts);
        total.merge(&counts);
        assert_eq!(total.trees(), 2);
        assert_eq!(total.get(&Production::Lexical { parent: b, terminal: d }), 4.0);
    }
}
