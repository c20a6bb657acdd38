use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use lodestone::{
    Cardinality, DataKind, Document, Engine, EngineConfig, ManualClock, PropertyConfig, ResultSpec,
    Schema, SchemaType, ScoringSpec, SearchSpec, StringIndexing, TermMatch, TokenizerKind,
};

const WORDS: [&str; 8] = [
    "the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog",
];

fn message_schema() -> Schema {
    Schema::new(vec![SchemaType {
        name: "Message".to_string(),
        properties: vec![PropertyConfig {
            name: "body".to_string(),
            kind: DataKind::Str,
            cardinality: Cardinality::Optional,
            string_indexing: Some(StringIndexing {
                term_match: TermMatch::Prefix,
                tokenizer: TokenizerKind::Plain,
            }),
        }],
    }])
}

fn test_document(id: u64, num_words: usize) -> Document {
    let body: String = (0..num_words)
        .map(|i| WORDS[(id as usize + i) % WORDS.len()])
        .collect::<Vec<_>>()
        .join(" ");
    Document::new("bench", format!("uri/{}", id), "Message")
        .add_string_property("body", &body)
        .with_creation_timestamp(1)
}

fn bench_put(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::with_clock(
        EngineConfig::new(dir.path()),
        Arc::new(ManualClock::new(1_000_000)),
    );
    engine.initialize().unwrap();
    engine.set_schema(message_schema(), false).unwrap();

    c.bench_function("put_document", |b| {
        let mut id = 0u64;
        b.iter(|| {
            engine.put(black_box(test_document(id, 32))).unwrap();
            id += 1;
        });
    });
}

fn bench_search(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::with_clock(
        EngineConfig::new(dir.path()),
        Arc::new(ManualClock::new(1_000_000)),
    );
    engine.initialize().unwrap();
    engine.set_schema(message_schema(), false).unwrap();
    for id in 0..5_000 {
        engine.put(test_document(id, 32)).unwrap();
    }

    let spec = SearchSpec {
        query: "quick brown".to_string(),
        term_match: TermMatch::Prefix,
        ..Default::default()
    };
    c.bench_function("search_two_terms_5k_docs", |b| {
        b.iter(|| {
            let results = engine
                .search(
                    black_box(&spec),
                    &ScoringSpec::default(),
                    &ResultSpec::default(),
                )
                .unwrap();
            black_box(results);
        });
    });
}

criterion_group!(benches, bench_put, bench_search);
criterion_main!(benches);
