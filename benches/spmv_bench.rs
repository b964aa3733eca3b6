//! Benchmarks for chart parsing strategies.
//!
//! Run with: cargo bench --bench spmv_bench
//!
//! Grammar with PP attachment ambiguity:
//!   S -> NP VP
//!   NP -> Det N | NP PP
//!   VP -> V NP | VP PP
//!   PP -> P NP

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use spmv_parse::{
    CartesianProductStrategy, Grammar, GrammarBuilder, PackingScheme, Parser, ParserBuilder,
    SpmvLayout,
};
use std::sync::Arc;

fn build_grammar(scheme: PackingScheme) -> Arc<Grammar> {
    let ln = |p: f32| p.ln();
    Arc::new(
        GrammarBuilder::new()
            .start("S")
            .packing(scheme)
            .binary("S", "NP", "VP", ln(1.0))
            .binary("NP", "Det", "N", ln(0.6))
            .binary("NP", "NP", "PP", ln(0.4))
            .binary("VP", "V", "NP", ln(0.7))
            .binary("VP", "VP", "PP", ln(0.3))
            .binary("PP", "P", "NP", ln(1.0))
            .lexical("Det", "the", ln(0.6))
            .lexical("Det", "a", ln(0.4))
            .lexical("N", "man", ln(0.25))
            .lexical("N", "dog", ln(0.25))
            .lexical("N", "telescope", ln(0.25))
            .lexical("N", "park", ln(0.25))
            .lexical("V", "saw", ln(1.0))
            .lexical("P", "with", ln(0.5))
            .lexical("P", "in", ln(0.5))
            .build()
            .expect("benchmark grammar"),
    )
}

/// "the man saw a dog" followed by `pps` prepositional phrases.
fn sentence(grammar: &Grammar, pps: usize) -> Vec<u32> {
    let mut words = vec!["the", "man", "saw", "a", "dog"];
    for i in 0..pps {
        words.extend(if i % 2 == 0 {
            ["with", "a", "telescope"]
        } else {
            ["in", "the", "park"]
        });
    }
    grammar.tokenize(&words.join(" ")).expect("known words")
}

fn bench_sentence_length(c: &mut Criterion) {
    let grammar = build_grammar(PackingScheme::LeftShift);
    let mut group = c.benchmark_group("parse_length");
    for pps in [2, 4, 8] {
        let tokens = sentence(&grammar, pps);
        let mut parser = Parser::new(grammar.clone()).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(tokens.len()), &tokens, |b, t| {
            b.iter(|| parser.parse(black_box(t)).unwrap())
        });
    }
    group.finish();
}

fn bench_strategies(c: &mut Criterion) {
    let grammar = build_grammar(PackingScheme::PerfectHash);
    let tokens = sentence(&grammar, 6);
    let configs: Vec<(&str, ParserBuilder)> = vec![
        ("unioned_csr", ParserBuilder::new(grammar.clone())),
        (
            "per_midpoint",
            ParserBuilder::new(grammar.clone()).cartesian(CartesianProductStrategy::PerMidpoint),
        ),
        (
            "csc",
            ParserBuilder::new(grammar.clone()).layout(SpmvLayout::ColumnMajor),
        ),
        (
            "cell_parallel",
            ParserBuilder::new(grammar.clone()).cell_parallel(true),
        ),
        (
            "segments_4",
            ParserBuilder::new(grammar.clone()).grammar_segments(4),
        ),
        (
            "kernel_host",
            ParserBuilder::new(grammar.clone()).backend(spmv_parse::Backend::Kernel),
        ),
        ("beam_3", ParserBuilder::new(grammar.clone()).beam_width(3)),
    ];

    let mut group = c.benchmark_group("strategy");
    for (name, builder) in configs {
        let mut parser = builder.build().unwrap();
        group.bench_function(name, |b| b.iter(|| parser.parse(black_box(&tokens)).unwrap()));
    }
    group.finish();
}

criterion_group!(benches, bench_sentence_length, bench_strategies);
criterion_main!(benches);
