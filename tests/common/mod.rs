#![allow(dead_code)] // each test binary uses its own subset of these helpers

use std::path::Path;
use std::sync::Arc;

use lodestone::{
    Cardinality, DataKind, Document, Engine, EngineConfig, ManualClock, PropertyConfig, ResultSpec,
    Schema, SchemaType, ScoringSpec, SearchSpec, StringIndexing, TermMatch, TokenizerKind,
};

pub const START_MS: i64 = 1_000_000;

pub fn config_at(dir: &Path) -> EngineConfig {
    EngineConfig::new(dir)
}

pub fn engine_at(dir: &Path, clock: Arc<ManualClock>) -> Engine {
    let engine = Engine::with_clock(config_at(dir), clock);
    engine.initialize().expect("initialize");
    engine
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(START_MS))
}

/// One type ("Message") with a single prefix-indexed string property
/// ("body").
pub fn message_schema() -> Schema {
    Schema::new(vec![SchemaType {
        name: "Message".to_string(),
        properties: vec![indexed_property("body", TermMatch::Prefix)],
    }])
}

pub fn indexed_property(name: &str, term_match: TermMatch) -> PropertyConfig {
    PropertyConfig {
        name: name.to_string(),
        kind: DataKind::Str,
        cardinality: Cardinality::Optional,
        string_indexing: Some(StringIndexing {
            term_match,
            tokenizer: TokenizerKind::Plain,
        }),
    }
}

pub fn unindexed_property(name: &str) -> PropertyConfig {
    PropertyConfig {
        name: name.to_string(),
        kind: DataKind::Str,
        cardinality: Cardinality::Optional,
        string_indexing: None,
    }
}

pub fn message(uri: &str, body: &str) -> Document {
    Document::new("namespace", uri, "Message")
        .add_string_property("body", body)
        .with_creation_timestamp(START_MS)
}

pub fn search(query: &str, term_match: TermMatch) -> SearchSpec {
    SearchSpec {
        query: query.to_string(),
        term_match,
        ..Default::default()
    }
}

pub fn default_scoring() -> ScoringSpec {
    ScoringSpec::default()
}

pub fn default_results() -> ResultSpec {
    ResultSpec::default()
}

/// Uris of the returned documents, in rank order.
pub fn result_uris(results: &lodestone::SearchResults) -> Vec<String> {
    results
        .results
        .iter()
        .map(|entry| entry.document.uri.clone())
        .collect()
}
