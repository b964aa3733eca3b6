//! End-to-end parsing across every execution strategy.

use spmv_parse::training::constrained_best;
use spmv_parse::{
    count_corpus, Backend, CartesianProductStrategy, CellEntry, Chart, ConstrainingChart, Grammar,
    GrammarBuilder, LogProb, PackingScheme, ParseError, ParseTree, Parser, ParserBuilder,
    PriorFom, Production, SpmvLayout,
};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ln(p: f64) -> LogProb {
    p.ln() as LogProb
}

/// S -> A; A -> A B | A A | c | d; B -> B A | B | d
fn cd_grammar(scheme: PackingScheme) -> Arc<Grammar> {
    Arc::new(
        GrammarBuilder::new()
            .start("S")
            .packing(scheme)
            .unary("S", "A", ln(1.0))
            .binary("A", "A", "B", ln(2.0 / 6.0))
            .binary("A", "A", "A", ln(1.0 / 6.0))
            .lexical("A", "c", ln(2.0 / 6.0))
            .lexical("A", "d", ln(1.0 / 6.0))
            .binary("B", "B", "A", ln(1.0 / 4.0))
            .unary("B", "B", ln(1.0 / 4.0))
            .lexical("B", "d", ln(2.0 / 4.0))
            .build()
            .unwrap(),
    )
}

fn np_grammar(scheme: PackingScheme) -> Arc<Grammar> {
    Arc::new(
        GrammarBuilder::new()
            .start("S")
            .packing(scheme)
            .binary("S", "NP", "VP", ln(1.0))
            .binary("NP", "DT", "NN", ln(0.5))
            .binary("NP", "NP", "PP", ln(0.3))
            .unary("NP", "NN", ln(0.2))
            .binary("VP", "VB", "NP", ln(0.6))
            .binary("VP", "VP", "PP", ln(0.1))
            .unary("VP", "VB", ln(0.3))
            .binary("PP", "IN", "NP", ln(1.0))
            .lexical("DT", "the", ln(1.0))
            .lexical("NN", "dog", ln(0.4))
            .lexical("NN", "cat", ln(0.4))
            .lexical("NN", "park", ln(0.2))
            .lexical("VB", "saw", ln(1.0))
            .lexical("IN", "in", ln(1.0))
            .build()
            .unwrap(),
    )
}

/// Same entries, back-pointers included, in every cell.
fn assert_charts_agree(expected: &Chart, actual: &Chart) {
    assert_eq!(expected.size(), actual.size());
    let n = expected.size();
    for span in 1..=n {
        for start in 0..=n - span {
            let end = start + span;
            let a: Vec<CellEntry> = expected.cell(start, end).entries().collect();
            let b: Vec<CellEntry> = actual.cell(start, end).entries().collect();
            assert_eq!(a, b, "cell ({}, {})", start, end);
        }
    }
}

/// Every binary derivation of "a b c" scores -5.
fn tied_grammar(scheme: PackingScheme) -> Arc<Grammar> {
    Arc::new(
        GrammarBuilder::new()
            .start("P")
            .packing(scheme)
            .binary("P", "L", "R", -1.0)
            .binary("P", "R", "L", -1.0)
            .binary("L", "R", "L", -1.0)
            .binary("L", "L", "R", -1.0)
            .lexical("L", "b", -1.0)
            .lexical("R", "a", -1.0)
            .lexical("R", "c", -1.0)
            .build()
            .unwrap(),
    )
}

fn strategies(grammar: &Arc<Grammar>) -> Vec<(&'static str, Parser)> {
    let builders = vec![
        ("per_midpoint", ParserBuilder::new(grammar.clone()).cartesian(CartesianProductStrategy::PerMidpoint)),
        ("column_major", ParserBuilder::new(grammar.clone()).layout(SpmvLayout::ColumnMajor)),
        ("cell_parallel", ParserBuilder::new(grammar.clone()).cell_parallel(true).threads(2)),
        ("segments", ParserBuilder::new(grammar.clone()).grammar_segments(4).threads(3)),
        (
            "everything",
            ParserBuilder::new(grammar.clone())
                .cartesian(CartesianProductStrategy::PerMidpoint)
                .layout(SpmvLayout::ColumnMajor)
                .cell_parallel(true)
                .grammar_segments(3),
        ),
        ("kernel", ParserBuilder::new(grammar.clone()).backend(Backend::Kernel)),
        (
            "kernel_column_major",
            ParserBuilder::new(grammar.clone())
                .backend(Backend::Kernel)
                .layout(SpmvLayout::ColumnMajor)
                .threads(2),
        ),
    ];
    builders
        .into_iter()
        .map(|(name, b)| (name, b.build().unwrap()))
        .collect()
}

#[test]
fn test_cd_grammar_best_parses() {
    init_logging();
    let g = cd_grammar(PackingScheme::LeftShift);
    let mut parser = Parser::new(g.clone()).unwrap();

    let (tree, score) = parser.parse_sentence("c d").unwrap().unwrap();
    assert_eq!(tree.display(&g).to_string(), "(S (A (A c) (B d)))");
    assert!((score - ln(1.0 / 18.0)).abs() < 1e-5);

    let (tree, score) = parser.parse_sentence("c d d").unwrap().unwrap();
    assert_eq!(tree.display(&g).to_string(), "(S (A (A (A c) (B d)) (B d)))");
    assert!((score - ln(1.0 / 108.0)).abs() < 1e-5);

    // (A A) at midpoint 1 and (A B) at midpoint 3 tie exactly; the lower
    // packed key wins.
    let (tree, score) = parser.parse_sentence("c c d d").unwrap().unwrap();
    assert!((score - ln(1.0 / 1944.0)).abs() < 1e-4);
    assert_eq!(
        tree.display(&g).to_string(),
        "(S (A (A c) (A (A (A c) (B d)) (B d))))"
    );

    assert_eq!(parser.stats().sentences, 3);
}

#[test]
fn test_unparsable_and_invalid_input() {
    init_logging();
    let g = np_grammar(PackingScheme::LeftShift);
    let mut parser = Parser::new(g.clone()).unwrap();
    assert_eq!(parser.parse_sentence("the the").unwrap(), None);
    assert_eq!(
        parser.parse_sentence("the unicorn"),
        Err(ParseError::UnknownSymbol("unicorn".to_string()))
    );
    assert!(matches!(parser.parse(&[]), Err(ParseError::EmptySentence)));
    assert!(matches!(
        parser.parse(&[99]),
        Err(ParseError::TerminalOutOfRange { index: 99, .. })
    ));
}

#[test]
fn test_strategies_agree_on_scores() {
    init_logging();
    for scheme in [PackingScheme::LeftShift, PackingScheme::PerfectHash] {
        let g = cd_grammar(scheme);
        let mut reference = Parser::new(g.clone()).unwrap();
        for sentence in ["c", "c d", "c d d", "c c d d", "d c d c d"] {
            let tokens = g.tokenize(sentence).unwrap();
            let expected = reference.parse(&tokens).unwrap();
            for (name, mut parser) in strategies(&g) {
                let chart = parser.parse(&tokens).unwrap();
                assert_eq!(
                    chart.root_inside(0).is_finite(),
                    expected.root_inside(0).is_finite(),
                    "{} on {:?}",
                    name,
                    sentence
                );
                assert_charts_agree(&expected, &chart);
            }
        }
    }
}

#[test]
fn test_exact_ties_resolve_alike_in_every_strategy() {
    init_logging();
    for scheme in [PackingScheme::LeftShift, PackingScheme::PerfectHash] {
        let g = tied_grammar(scheme);
        let tokens = g.tokenize("a b c").unwrap();
        let expected = Parser::new(g.clone()).unwrap().parse(&tokens).unwrap();
        for (name, mut parser) in strategies(&g) {
            let chart = parser.parse(&tokens).unwrap();
            assert_charts_agree(&expected, &chart);
            assert_eq!(
                chart.extract_best_parse(0),
                expected.extract_best_parse(0),
                "{} with {:?}",
                name,
                scheme
            );
        }
    }

    // Under left-shift packing (L, R) has the lower key.
    let g = tied_grammar(PackingScheme::LeftShift);
    let mut parser = ParserBuilder::new(g.clone())
        .cartesian(CartesianProductStrategy::PerMidpoint)
        .build()
        .unwrap();
    let (tree, score) = parser.parse_sentence("a b c").unwrap().unwrap();
    assert_eq!(score, -5.0);
    assert_eq!(tree.display(&g).to_string(), "(P (L (R a) (L b)) (R c))");
}

#[test]
fn test_strategies_agree_on_trees() {
    init_logging();
    for scheme in [PackingScheme::LeftShift, PackingScheme::PerfectHash] {
        let g = np_grammar(scheme);
        let mut reference = Parser::new(g.clone()).unwrap();
        let sentence = "the dog saw the cat in the park";
        let (expected, score) = reference.parse_sentence(sentence).unwrap().unwrap();
        assert_eq!(
            expected.display(&g).to_string(),
            "(S (NP (DT the) (NN dog)) (VP (VB saw) (NP (NP (DT the) (NN cat)) (PP (IN in) (NP (DT the) (NN park))))))"
        );
        for (name, mut parser) in strategies(&g) {
            let (tree, s) = parser.parse_sentence(sentence).unwrap().unwrap();
            assert_eq!(tree, expected, "{} with {:?}", name, scheme);
            assert!((s - score).abs() < 1e-5);
        }
    }
}

#[test]
fn test_beam_never_inflates_scores() {
    init_logging();
    let g = np_grammar(PackingScheme::PerfectHash);
    let tokens = g.tokenize("the dog saw the cat in the park").unwrap();
    let exhaustive = Parser::new(g.clone()).unwrap().parse(&tokens).unwrap();

    for width in 1..=g.num_nonterminals() {
        for backend in [Backend::Host, Backend::Kernel] {
            let mut parser = ParserBuilder::new(g.clone())
                .beam_width(width)
                .lexical_beam_width(width)
                .backend(backend)
                .build()
                .unwrap();
            let chart = parser.parse(&tokens).unwrap();
            let n = chart.size();
            for span in 1..=n {
                for start in 0..=n - span {
                    let cell = chart.cell(start, start + span);
                    assert!(cell.len() <= width);
                    for entry in cell.entries() {
                        let full = exhaustive.get_inside(start, start + span, entry.nonterminal);
                        assert!(entry.inside <= full + 1e-6);
                    }
                }
            }
        }
    }

    // A wide beam keeps everything.
    let mut wide = ParserBuilder::new(g.clone())
        .beam_width(g.num_nonterminals())
        .lexical_beam_width(g.num_nonterminals())
        .build()
        .unwrap();
    assert_charts_agree(&exhaustive, &wide.parse(&tokens).unwrap());
}

#[test]
fn test_beam_host_and_kernel_agree() {
    init_logging();
    let g = np_grammar(PackingScheme::LeftShift);
    let tokens = g.tokenize("the dog saw the cat in the park").unwrap();
    let build = |backend| {
        ParserBuilder::new(g.clone())
            .beam_width(3)
            .lexical_beam_width(2)
            .lexical_unary_reserve(1)
            .backend(backend)
            .build()
            .unwrap()
    };
    let host = build(Backend::Host).parse(&tokens).unwrap();
    let kernel = build(Backend::Kernel).parse(&tokens).unwrap();
    assert_charts_agree(&host, &kernel);
}

#[test]
fn test_prior_fom_parses() {
    init_logging();
    let g = np_grammar(PackingScheme::LeftShift);
    let mut exhaustive = Parser::new(g.clone()).unwrap();
    let (gold, _) = exhaustive
        .parse_sentence("the dog saw the cat")
        .unwrap()
        .unwrap();
    let mut counts = spmv_parse::RuleCounts::new();
    counts.add_tree(&gold);

    let fom = PriorFom::from_counts(&counts, g.num_nonterminals());
    let mut parser = ParserBuilder::new(g.clone())
        .beam_width(2)
        .fom(Arc::new(fom))
        .build()
        .unwrap();
    let (tree, _) = parser.parse_sentence("the dog saw the cat").unwrap().unwrap();
    assert_eq!(tree.terminals(), gold.terminals());
    assert_eq!(tree.label(), Some(g.start_symbol()));
}

#[test]
fn test_constrained_follows_gold_tree() {
    init_logging();
    let g = cd_grammar(PackingScheme::PerfectHash);
    let mut parser = Parser::new(g.clone()).unwrap();

    // Not the unconstrained best for "c c d d".
    let text = "(S (A (A (A c) (A c)) (A (A d) (B d))))";
    let gold = ParseTree::from_bracketed(text, &g).unwrap();
    let constraining = ConstrainingChart::from_tree(g.clone(), &gold).unwrap();
    let chart = parser.parse_constrained(&constraining).unwrap();
    assert!((chart.root_inside(0) - ln(1.0 / 11664.0)).abs() < 1e-4);
    assert_eq!(
        chart.extract_best_parse(0).unwrap().display(&g).to_string(),
        text
    );

    // Cells outside the bracketing stay empty.
    assert!(chart.cell(1, 3).is_empty());
    assert!(chart.cell(0, 3).is_empty());
}

#[test]
fn test_constrained_matches_unconstrained_best() {
    init_logging();
    for scheme in [PackingScheme::LeftShift, PackingScheme::PerfectHash] {
        let g = np_grammar(scheme);
        let mut parser = Parser::new(g.clone()).unwrap();
        for sentence in ["the dog saw the cat in the park", "the cat saw the dog", "dog saw park"] {
            let tokens = g.tokenize(sentence).unwrap();
            let chart = parser.parse(&tokens).unwrap();
            let best = chart.extract_best_parse(0).unwrap();

            let constraining = ConstrainingChart::from_tree(g.clone(), &best).unwrap();
            let constrained = parser.parse_constrained(&constraining).unwrap();
            assert_eq!(
                constrained.root_inside(0).to_bits(),
                chart.root_inside(0).to_bits(),
                "{:?}",
                sentence
            );
            assert_eq!(constrained.extract_best_parse(0).unwrap(), best);
        }
    }
}

#[test]
fn test_constrained_rejected_on_kernel_backend() {
    let g = cd_grammar(PackingScheme::LeftShift);
    let gold = ParseTree::from_bracketed("(S (A (A c) (B d)))", &g).unwrap();
    let constraining = ConstrainingChart::from_tree(g.clone(), &gold).unwrap();
    let mut parser = ParserBuilder::new(g)
        .backend(Backend::Kernel)
        .build()
        .unwrap();
    assert!(matches!(
        parser.parse_constrained(&constraining),
        Err(ParseError::UnsupportedStrategy(_))
    ));
}

#[test]
fn test_constrained_over_latent_splits() {
    init_logging();
    let g = Arc::new(
        GrammarBuilder::new()
            .start("S")
            .split("NP_0", "NP")
            .split("NP_1", "NP")
            .split("VP_0", "VP")
            .binary("S", "NP_0", "VP_0", ln(0.3))
            .binary("S", "NP_1", "VP_0", ln(0.7))
            .lexical("NP_0", "it", ln(0.9))
            .lexical("NP_1", "it", ln(0.1))
            .lexical("VP_0", "runs", ln(1.0))
            .build()
            .unwrap(),
    );
    let gold = ParseTree::from_bracketed("(S (NP it) (VP runs))", &g).unwrap();
    let mut parser = Parser::new(g.clone()).unwrap();
    let (tree, score) = constrained_best(&mut parser, &gold).unwrap().unwrap();
    assert_eq!(tree.display(&g).to_string(), "(S (NP_0 it) (VP_0 runs))");
    assert_eq!(tree.unsplit(&g), gold);
    assert!((score - ln(0.27)).abs() < 1e-5);
}

#[test]
fn test_training_over_corpus() {
    init_logging();
    let g = cd_grammar(PackingScheme::LeftShift);
    let mut parser = ParserBuilder::new(g.clone())
        .cell_parallel(true)
        .threads(2)
        .build()
        .unwrap();
    let corpus: Vec<ParseTree> = [
        "(S (A (A c) (B d)))",
        "(S (A (A (A c) (B d)) (B d)))",
        "(S (A (A c) (A c) (A c)))",
    ]
    .iter()
    .map(|t| ParseTree::from_bracketed(t, &g).unwrap())
    .collect();

    let report = count_corpus(&mut parser, &corpus).unwrap();
    assert_eq!(report.parsed, 2);
    assert_eq!(report.unparsed, 0);
    assert_eq!(report.skipped.len(), 1);
    assert!(matches!(report.skipped[0].1, ParseError::MalformedTree { .. }));

    let a = g.nonterminal("A").unwrap();
    let b = g.nonterminal("B").unwrap();
    assert_eq!(
        report.counts.get(&Production::Binary {
            parent: a,
            left: a,
            right: b
        }),
        3.0
    );
    let d = g.terminal("d").unwrap();
    assert_eq!(
        report.counts.get(&Production::Lexical {
            parent: b,
            terminal: d
        }),
        3.0
    );
    let expected = (1.0f64 / 18.0).ln() + (1.0f64 / 108.0).ln();
    assert!((report.log_likelihood - expected).abs() < 1e-3);
}
