use lru::LruCache;
use std::num::NonZeroUsize;

use crate::core::types::Document;
use crate::query::parser::TermClause;
use crate::schema::schema::TermMatch;
use crate::scoring::scorer::ScoredHit;
use crate::search::snippet::{SnippetEntry, SnippetSpec};

/// What to search for.
#[derive(Debug, Clone, Default)]
pub struct SearchSpec {
    pub query: String,
    pub term_match: TermMatch,
    /// Empty means no namespace filtering.
    pub namespace_filters: Vec<String>,
    /// Empty means no schema-type filtering.
    pub schema_type_filters: Vec<String>,
}

/// How to shape the result pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultSpec {
    /// None picks the engine default. Some(0) returns an empty OK page;
    /// negative values are rejected.
    pub num_per_page: Option<i32>,
    pub snippet_spec: Option<SnippetSpec>,
}

/// One returned document.
#[derive(Debug, Clone)]
pub struct SearchResultEntry {
    pub document: Document,
    pub score: i64,
    pub snippets: Vec<SnippetEntry>,
}

/// A page of results. `next_page_token` is present while more pages remain.
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub results: Vec<SearchResultEntry>,
    pub next_page_token: Option<u64>,
}

/// Context a cached stream keeps so later pages can still be snippeted.
#[derive(Debug, Clone)]
pub struct SnippetContext {
    pub clauses: Vec<TermClause>,
    pub term_match: TermMatch,
    pub spec: Option<SnippetSpec>,
}

/// The tail of a result stream that did not fit the first page.
struct CachedStream {
    remaining: Vec<ScoredHit>,
    cursor: usize,
    page_size: usize,
    snippet: SnippetContext,
    /// How many more documents may still be snippeted, across pages.
    num_to_snippet_left: usize,
}

/// One chunk handed back for page assembly.
pub struct PageChunk {
    pub hits: Vec<ScoredHit>,
    pub snippet: SnippetContext,
    /// How many of `hits` should receive snippets.
    pub num_to_snippet: usize,
    /// Token to hand out again, if the stream still has more.
    pub next_page_token: Option<u64>,
}

/// Holds unfetched result streams behind opaque, random, non-zero tokens.
/// LRU-bounded so abandoned streams age out; every ground-truth change
/// purges the lot wholesale.
pub struct ResultCache {
    streams: LruCache<u64, CachedStream>,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        ResultCache {
            streams: LruCache::new(capacity),
        }
    }

    /// Caches the tail of a stream and returns its token.
    pub fn store(
        &mut self,
        remaining: Vec<ScoredHit>,
        page_size: usize,
        snippet: SnippetContext,
        num_to_snippet_left: usize,
    ) -> u64 {
        let token = self.fresh_token();
        self.streams.put(
            token,
            CachedStream {
                remaining,
                cursor: 0,
                page_size,
                snippet,
                num_to_snippet_left,
            },
        );
        token
    }

    /// Pops the next page of a stream. An unknown (expired, invalidated or
    /// simply wrong) token yields None, which surfaces as an empty OK page
    /// rather than an error.
    pub fn next_chunk(&mut self, token: u64) -> Option<PageChunk> {
        let stream = self.streams.get_mut(&token)?;

        let start = stream.cursor;
        let end = (start + stream.page_size).min(stream.remaining.len());
        let hits: Vec<ScoredHit> = stream.remaining[start..end].to_vec();
        stream.cursor = end;

        let num_to_snippet = stream.num_to_snippet_left.min(hits.len());
        stream.num_to_snippet_left -= num_to_snippet;

        let snippet = stream.snippet.clone();
        let exhausted = stream.cursor >= stream.remaining.len();
        if exhausted {
            self.streams.pop(&token);
        }

        Some(PageChunk {
            hits,
            snippet,
            num_to_snippet,
            next_page_token: if exhausted { None } else { Some(token) },
        })
    }

    pub fn invalidate(&mut self, token: u64) {
        self.streams.pop(&token);
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }

    fn fresh_token(&self) -> u64 {
        loop {
            let token = uuid::Uuid::new_v4().as_u128() as u64;
            if token != 0 && !self.streams.contains(&token) {
                return token;
            }
        }
    }
}
