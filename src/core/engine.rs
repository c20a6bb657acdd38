use std::fs;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::analysis::tokenizer::create_tokenizer;
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::EngineConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{
    DataStatus, InitializeStats, OptimizeInfo, OptimizeResult, PutStats, RecoveryCause,
    SetSchemaResult,
};
use crate::core::types::{
    Document, DocumentId, SectionIdMask, UsageReport, SECTION_ID_MASK_ALL,
};
use crate::document::store::DocumentStore;
use crate::index::hit::DocHitInfo;
use crate::index::iterator::AndIterator;
use crate::index::term_index::TermIndex;
use crate::query::parser::{ParsedQuery, QueryParser};
use crate::schema::schema::{Schema, SchemaType};
use crate::schema::store::{validate_document_against, SchemaStore};
use crate::scoring::scorer::{score_document, sort_hits, ScoredHit, ScoringSpec};
use crate::search::results::{
    PageChunk, ResultCache, ResultSpec, SearchResultEntry, SearchResults, SearchSpec,
    SnippetContext,
};
use crate::search::snippet::snippet_document;
use crate::storage::header::EngineHeader;
use crate::storage::layout::StorageLayout;

/// Coordinator lifecycle. Data and query operations are only served in
/// `Ready`; a destructive maintenance failure parks the engine in
/// `Quarantined` until `reset` succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Ready,
    Quarantined,
}

struct Stores {
    layout: StorageLayout,
    schema: SchemaStore,
    documents: DocumentStore,
    index: TermIndex,
    cache: ResultCache,
}

struct EngineInner {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    state: Lifecycle,
    stores: Option<Stores>,
}

/// The search engine coordinator. Owns the schema store, document store,
/// term index and result cache, and enforces the cross-store invariants:
/// id agreement between index and document store, recovery from partial
/// writes, and serialisation of every public operation behind one mutex.
pub struct Engine {
    inner: Mutex<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine::with_clock(config, Arc::new(SystemClock))
    }

    /// Injectable clock variant, used by tests to drive ttl expiry.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Engine {
            inner: Mutex::new(EngineInner {
                config,
                clock,
                state: Lifecycle::Uninitialized,
                stores: None,
            }),
        }
    }

    /// Brings the engine to `Ready`, creating or recovering every store.
    /// Idempotent: initializing an already-ready engine re-reports counts.
    pub fn initialize(&self) -> Result<InitializeStats> {
        let mut inner = self.inner.lock();
        inner.initialize()
    }

    /// Installs a new schema. Backward-incompatible changes are rejected
    /// unless `force` is set, in which case documents of the affected types
    /// are deleted. Index-affecting changes trigger an index rebuild.
    pub fn set_schema(&self, schema: Schema, force: bool) -> Result<SetSchemaResult> {
        let mut inner = self.inner.lock();
        inner.set_schema(schema, force)
    }

    pub fn get_schema(&self) -> Result<Schema> {
        let mut inner = self.inner.lock();
        let stores = inner.stores_ready()?;
        stores
            .schema
            .schema()
            .cloned()
            .ok_or_else(|| Error::not_found("schema not set"))
    }

    pub fn get_schema_type(&self, name: &str) -> Result<SchemaType> {
        let mut inner = self.inner.lock();
        let stores = inner.stores_ready()?;
        if stores.schema.schema().is_none() {
            return Err(Error::failed_precondition("schema not set"));
        }
        stores
            .schema
            .get_type(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown schema type '{}'", name)))
    }

    /// Validates, stores and indexes one document, superseding any earlier
    /// document with the same (namespace, uri).
    pub fn put(&self, document: Document) -> Result<PutStats> {
        let mut inner = self.inner.lock();
        inner.put(document)
    }

    pub fn get(&self, namespace: &str, uri: &str) -> Result<Document> {
        let mut inner = self.inner.lock();
        let now = inner.clock.now_ms();
        let stores = inner.stores_ready()?;
        stores.documents.get(namespace, uri, now)
    }

    pub fn delete(&self, namespace: &str, uri: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let now = inner.clock.now_ms();
        let stores = inner.stores_ready()?;
        stores.documents.delete(namespace, uri, now)
    }

    pub fn delete_by_namespace(&self, namespace: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let now = inner.clock.now_ms();
        let stores = inner.stores_ready()?;
        let deleted = stores.documents.delete_by_namespace(namespace, now)?;
        debug!(namespace, deleted, "deleted documents by namespace");
        Ok(())
    }

    pub fn delete_by_schema_type(&self, schema_type: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let now = inner.clock.now_ms();
        let stores = inner.stores_ready()?;
        let deleted = stores.documents.delete_by_schema_type(schema_type, now)?;
        debug!(schema_type, deleted, "deleted documents by schema type");
        Ok(())
    }

    /// Deletes every document matching a search spec. `NotFound` when the
    /// query matches nothing.
    pub fn delete_by_query(&self, search_spec: &SearchSpec) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.delete_by_query(search_spec)
    }

    /// Term search over live documents, returning the first page and a token
    /// for the rest.
    pub fn search(
        &self,
        search_spec: &SearchSpec,
        scoring_spec: &ScoringSpec,
        result_spec: &ResultSpec,
    ) -> Result<SearchResults> {
        let mut inner = self.inner.lock();
        inner.search(search_spec, scoring_spec, result_spec)
    }

    /// Fetches the next page of an earlier search. Unknown tokens yield an
    /// empty OK page, matching the behavior callers rely on for exhausted
    /// streams.
    pub fn get_next_page(&self, token: u64) -> Result<SearchResults> {
        let mut inner = self.inner.lock();
        inner.get_next_page(token)
    }

    pub fn invalidate_next_page_token(&self, token: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let stores = inner.stores_ready()?;
        stores.cache.invalidate(token);
        Ok(())
    }

    pub fn report_usage(&self, report: &UsageReport) -> Result<()> {
        let mut inner = self.inner.lock();
        let now = inner.clock.now_ms();
        let stores = inner.stores_ready()?;
        stores.documents.report_usage(report, now)
    }

    /// Namespaces owning at least one live, unexpired document.
    pub fn get_all_namespaces(&self) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let now = inner.clock.now_ms();
        let stores = inner.stores_ready()?;
        Ok(stores.documents.active_namespaces(now))
    }

    pub fn get_optimize_info(&self) -> Result<OptimizeInfo> {
        let mut inner = self.inner.lock();
        let now = inner.clock.now_ms();
        let stores = inner.stores_ready()?;
        let (optimizable_docs, estimated_bytes) = stores.documents.optimizable_stats(now);
        Ok(OptimizeInfo {
            optimizable_docs,
            estimated_bytes,
        })
    }

    /// Compacts the document log (dropping tombstoned and expired entries),
    /// rebuilds the index against the new ids, and invalidates all page
    /// tokens.
    pub fn optimize(&self) -> Result<OptimizeResult> {
        let mut inner = self.inner.lock();
        inner.optimize()
    }

    /// Flushes every store and refreshes the combined header.
    pub fn persist_to_disk(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.persist_to_disk()
    }

    /// Deletes the base directory and reinitializes empty. The only way out
    /// of `Quarantined`.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.reset()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.state == Lifecycle::Ready {
            if let Err(err) = inner.persist_to_disk() {
                warn!(context = %err.context, "final persist on drop failed");
            }
        }
    }
}

impl EngineInner {
    fn stores_ready(&mut self) -> Result<&mut Stores> {
        match self.state {
            Lifecycle::Ready => self
                .stores
                .as_mut()
                .ok_or_else(|| Error::internal("ready without stores")),
            Lifecycle::Uninitialized => {
                Err(Error::failed_precondition("engine not initialized"))
            }
            Lifecycle::Quarantined => Err(Error::failed_precondition(
                "engine quarantined after failed maintenance; reset required",
            )),
        }
    }

    fn initialize(&mut self) -> Result<InitializeStats> {
        match self.state {
            Lifecycle::Ready => {
                let now = self.clock.now_ms();
                let stores = self.stores_ready()?;
                let mut stats = InitializeStats::default();
                stats.num_documents = stores.documents.num_alive(now);
                stats.num_schema_types = stores.schema.num_types();
                return Ok(stats);
            }
            Lifecycle::Quarantined => {
                return Err(Error::failed_precondition(
                    "engine quarantined after failed maintenance; reset required",
                ));
            }
            Lifecycle::Uninitialized => {}
        }

        self.config.validate()?;
        let overall = Instant::now();
        let mut stats = InitializeStats::default();

        let layout = StorageLayout::create(&self.config.base_dir)?;
        // A leftover retired directory means a crash landed between the two
        // optimize renames. If the live documents directory has no log, the
        // retired copy is still the ground truth; put it back.
        let retired = layout.optimize_tmp_dir("documents_old");
        if retired.exists() {
            if layout.document_log_path().exists() {
                fs::remove_dir_all(&retired)?;
            } else {
                warn!("restoring document directory from interrupted optimize");
                fs::remove_dir_all(&layout.documents_dir)?;
                fs::rename(&retired, &layout.documents_dir)?;
            }
        }
        // A leftover optimize scratch directory means a previous run died
        // mid-maintenance; it is never authoritative.
        let tmp = layout.optimize_tmp_dir("documents");
        if tmp.exists() {
            warn!(path = %tmp.display(), "removing stale optimize directory");
            fs::remove_dir_all(&tmp)?;
        }

        let header_path = layout.header_path();
        let mut header_invalid = false;
        let header = if header_path.exists() {
            match EngineHeader::read(&header_path) {
                Ok(header) => Some(header),
                Err(err) => {
                    warn!(context = %err.context, "engine header invalid");
                    header_invalid = true;
                    None
                }
            }
        } else {
            None
        };

        let started = Instant::now();
        let schema = SchemaStore::open(&layout)?;
        stats.schema_store.latency_ms = started.elapsed().as_millis() as u64;

        let started = Instant::now();
        let (documents, doc_recovery) = DocumentStore::open(&layout)?;
        stats.document_store.latency_ms = started.elapsed().as_millis() as u64;
        stats.document_store.cause = doc_recovery.cause;
        stats.document_store_data_status = Some(doc_recovery.data_status);
        if doc_recovery.usage_lost && stats.document_store.cause == RecoveryCause::None {
            stats.document_store.cause = RecoveryCause::DataLoss;
        }

        let started = Instant::now();
        let index = TermIndex::open(
            &layout,
            self.config.index_merge_size,
            self.config.max_token_length,
        )?;
        stats.index.latency_ms = started.elapsed().as_millis() as u64;

        let mut stores = Stores {
            layout,
            schema,
            documents,
            index,
            cache: ResultCache::new(self.config.result_cache_capacity),
        };
        let now = self.clock.now_ms();

        // Restore index/document agreement.
        let started = Instant::now();
        if stores.index.recovered_empty() {
            stats.index.cause = RecoveryCause::DataLoss;
            self.rebuild_index(&mut stores, now)?;
        } else {
            let index_last = stores.index.last_added_document_id();
            let doc_last = stores.documents.last_document_id();
            if index_last > doc_last {
                // The index saw documents the log no longer has: the log
                // rolled back, so the index is rebuilt from what survived.
                if stats.index.cause == RecoveryCause::None {
                    stats.index.cause = RecoveryCause::InconsistentWithGroundTruth;
                }
                self.rebuild_index(&mut stores, now)?;
            } else if index_last < doc_last {
                if stats.index.cause == RecoveryCause::None {
                    stats.index.cause = RecoveryCause::InconsistentWithGroundTruth;
                }
                self.replay_documents(&mut stores, index_last, now)?;
            }
        }

        // Cross-store checksum: catches a store swapped, rolled back or
        // tampered with behind our back even when each store is internally
        // consistent.
        let combined = Self::combined_checksum(&stores)?;
        let recovered = stats.document_store.cause != RecoveryCause::None
            || stats.index.cause != RecoveryCause::None;
        let checksum_broken = match &header {
            Some(header) => header.combined_checksum != combined,
            // A missing or unreadable header over existing data means the
            // base directory was disturbed.
            None => header_invalid || stores.documents.last_document_id().is_some(),
        };
        if checksum_broken && !recovered {
            warn!("combined header checksum mismatch, rebuilding index");
            stats.index.cause = RecoveryCause::TotalChecksumMismatch;
            self.rebuild_index(&mut stores, now)?;
        }
        if stats.index.cause != RecoveryCause::None {
            stats.index.latency_ms += started.elapsed().as_millis() as u64;
        }

        // Stabilise everything we just recovered and stamp the header.
        stores.documents.persist()?;
        stores.index.persist()?;
        let combined = Self::combined_checksum(&stores)?;
        EngineHeader::new(combined).write(&stores.layout.header_path())?;

        stats.num_documents = stores.documents.num_alive(now);
        stats.num_schema_types = stores.schema.num_types();
        stats.latency_ms = overall.elapsed().as_millis() as u64;

        info!(
            documents = stats.num_documents,
            schema_types = stats.num_schema_types,
            latency_ms = stats.latency_ms,
            "engine initialized"
        );
        self.stores = Some(stores);
        self.state = Lifecycle::Ready;
        Ok(stats)
    }

    fn set_schema(&mut self, schema: Schema, force: bool) -> Result<SetSchemaResult> {
        let now = self.clock.now_ms();
        let stores = self.stores_ready()?;

        let delta = stores.schema.compute_delta(&schema)?;

        // Join the shape-level delta against the document store: a change is
        // only backward-incompatible when live documents are affected.
        // Removing a type nobody uses is fine; tightening a cardinality only
        // bites when some live document fails the new rule.
        let mut deleted_types = Vec::new();
        for name in &delta.types_removed {
            if stores.documents.has_live_documents(name, now) {
                deleted_types.push(name.clone());
            }
        }
        let mut incompatible_types = Vec::new();
        for (name, change) in &delta.types_changed {
            if !stores.documents.has_live_documents(name, now) {
                continue;
            }
            if change.property_removed_or_retyped
                || (change.cardinality_tightened
                    && Self::any_live_document_invalid(stores, name, &schema, now)?)
            {
                incompatible_types.push(name.clone());
            }
        }

        if (!deleted_types.is_empty() || !incompatible_types.is_empty()) && !force {
            let mut offending: Vec<String> = deleted_types
                .iter()
                .chain(incompatible_types.iter())
                .cloned()
                .collect();
            offending.sort();
            offending.dedup();
            return Err(Error::failed_precondition(format!(
                "incompatible schema change for types: {}",
                offending.join(", ")
            )));
        }

        stores.schema.apply_schema(schema)?;

        let mut result = SetSchemaResult {
            deleted_types,
            incompatible_types,
            index_incompatible_types: delta.types_index_incompatible.clone(),
        };
        result.deleted_types.sort();
        result.incompatible_types.sort();
        result.index_incompatible_types.sort();

        if force {
            // Revalidate document by document: only what the new schema
            // actually invalidates goes away. Documents of removed types
            // fail wholesale (their type no longer resolves); a tightened
            // type keeps every document that already satisfies the rule.
            let mut affected = result.deleted_types.clone();
            affected.extend(result.incompatible_types.iter().cloned());
            let deleted = Self::delete_invalid_documents(stores, &affected, now)?;
            if deleted > 0 {
                info!(deleted, "deleted documents invalidated by schema change");
                stores.cache.clear();
            }
        }

        if delta.requires_index_rebuild() {
            debug!("schema change affects the index, rebuilding");
            let stores = self
                .stores
                .as_mut()
                .ok_or_else(|| Error::internal("ready without stores"))?;
            Self::rebuild_index_inner(stores, &self.config, now)?;
        }

        let stores = self
            .stores
            .as_mut()
            .ok_or_else(|| Error::internal("ready without stores"))?;
        stores.documents.persist()?;
        let combined = Self::combined_checksum(stores)?;
        EngineHeader::new(combined).write(&stores.layout.header_path())?;
        Ok(result)
    }

    fn put(&mut self, mut document: Document) -> Result<PutStats> {
        let now = self.clock.now_ms();
        let max_tokens_per_doc = self.config.max_tokens_per_doc;
        let max_token_length = self.config.max_token_length;
        let stores = self.stores_ready()?;

        let overall = Instant::now();
        let mut stats = PutStats::default();

        if document.creation_timestamp_ms == 0 {
            document.creation_timestamp_ms = now;
        }
        stores.schema.validate_document(&document)?;
        stats.document_size_bytes = bincode::serialized_size(&document)? as usize;

        let started = Instant::now();
        let document_id = stores.documents.put(document.clone())?;
        stats.document_store_latency_ms = started.elapsed().as_millis() as u64;

        let started = Instant::now();
        let (num_tokens, exceeded) = Self::index_document(
            stores,
            &document,
            document_id,
            max_tokens_per_doc,
            max_token_length,
        )?;
        stores.index.note_document(document_id);
        stats.index_latency_ms = started.elapsed().as_millis() as u64;
        stats.num_tokens_indexed = num_tokens;
        stats.exceeded_max_tokens = exceeded;
        stats.index_merge_latency_ms = stores.index.take_merge_latency().unwrap_or(0);

        stats.latency_ms = overall.elapsed().as_millis() as u64;
        Ok(stats)
    }

    fn delete_by_query(&mut self, search_spec: &SearchSpec) -> Result<()> {
        let now = self.clock.now_ms();
        let max_token_length = self.config.max_token_length;
        let stores = self.stores_ready()?;

        let parsed = QueryParser::new(max_token_length).parse(&search_spec.query)?;
        let matches = Self::match_documents(stores, search_spec, &parsed, now)?;
        if matches.is_empty() {
            return Err(Error::not_found("no documents matched the query"));
        }
        for (document_id, _) in &matches {
            let meta = stores
                .documents
                .meta(*document_id)
                .ok_or_else(|| Error::internal("matched document without metadata"))?;
            let (namespace, uri) = (meta.namespace.clone(), meta.uri.clone());
            stores.documents.delete(&namespace, &uri, now)?;
        }
        debug!(deleted = matches.len(), "deleted documents by query");
        Ok(())
    }

    fn search(
        &mut self,
        search_spec: &SearchSpec,
        scoring_spec: &ScoringSpec,
        result_spec: &ResultSpec,
    ) -> Result<SearchResults> {
        let now = self.clock.now_ms();
        let max_token_length = self.config.max_token_length;
        let default_page_size = self.config.default_page_size;
        let stores = self.stores_ready()?;

        let page_size = match result_spec.num_per_page {
            Some(n) if n < 0 => {
                return Err(Error::invalid_argument("num_per_page cannot be negative"));
            }
            Some(0) => return Ok(SearchResults::default()),
            Some(n) => n as usize,
            None => default_page_size,
        };

        let parsed = QueryParser::new(max_token_length).parse(&search_spec.query)?;
        if parsed.is_empty() {
            return Ok(SearchResults::default());
        }

        let matches = Self::match_documents(stores, search_spec, &parsed, now)?;
        let mut hits = Vec::with_capacity(matches.len());
        for (document_id, _) in &matches {
            let meta = stores
                .documents
                .meta(*document_id)
                .ok_or_else(|| Error::internal("matched document without metadata"))?;
            hits.push(ScoredHit {
                document_id: *document_id,
                score: score_document(
                    scoring_spec.rank_by,
                    *document_id,
                    meta,
                    stores.documents.usage_scores(*document_id),
                ),
            });
        }
        sort_hits(&mut hits, scoring_spec.order);

        let snippet_ctx = SnippetContext {
            clauses: parsed.clauses.clone(),
            term_match: search_spec.term_match,
            spec: result_spec.snippet_spec,
        };
        let total_to_snippet = result_spec
            .snippet_spec
            .map(|s| s.num_to_snippet)
            .unwrap_or(0);

        let page: Vec<ScoredHit> = hits.iter().take(page_size).copied().collect();
        let page_to_snippet = total_to_snippet.min(page.len());
        let remaining: Vec<ScoredHit> = hits.into_iter().skip(page_size).collect();

        let next_page_token = if remaining.is_empty() {
            None
        } else {
            Some(stores.cache.store(
                remaining,
                page_size,
                snippet_ctx.clone(),
                total_to_snippet.saturating_sub(page_to_snippet),
            ))
        };

        let chunk = PageChunk {
            hits: page,
            snippet: snippet_ctx,
            num_to_snippet: page_to_snippet,
            next_page_token,
        };
        Self::assemble_page(stores, chunk, max_token_length, now)
    }

    fn get_next_page(&mut self, token: u64) -> Result<SearchResults> {
        let now = self.clock.now_ms();
        let max_token_length = self.config.max_token_length;
        let stores = self.stores_ready()?;

        match stores.cache.next_chunk(token) {
            None => Ok(SearchResults::default()),
            Some(chunk) => Self::assemble_page(stores, chunk, max_token_length, now),
        }
    }

    fn optimize(&mut self) -> Result<OptimizeResult> {
        let now = self.clock.now_ms();
        let stores = self.stores_ready()?;

        let overall = Instant::now();
        let (docs_removed, _) = stores.documents.optimizable_stats(now);

        let tmp = stores.layout.optimize_tmp_dir("documents");
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }

        // Build the compacted replacement off to the side. Nothing
        // destructive has happened yet, so any failure here aborts cleanly.
        let rewrite = stores.documents.rewrite_live(&tmp, now);
        if let Err(err) = rewrite {
            let _ = fs::remove_dir_all(&tmp);
            return Err(Error::aborted(format!(
                "optimize aborted before any change: {}",
                err.context
            )));
        }

        // Swap directories: retire the old store, move the rewrite in.
        let documents_dir = stores.layout.documents_dir.clone();
        let retired = stores.layout.optimize_tmp_dir("documents_old");
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        if let Err(err) = fs::rename(&documents_dir, &retired) {
            let _ = fs::remove_dir_all(&tmp);
            return Err(Error::aborted(format!(
                "optimize aborted before any change: {}",
                err
            )));
        }
        if let Err(err) = fs::rename(&tmp, &documents_dir) {
            // Try to put the original back; failing that, the ground truth
            // is in neither place and the engine must not serve anything.
            if fs::rename(&retired, &documents_dir).is_ok() {
                let _ = fs::remove_dir_all(&tmp);
                return Err(Error::aborted(format!("optimize directory swap failed: {}", err)));
            }
            self.quarantine("document directory lost during optimize swap");
            return Err(Error::internal(
                "optimize failed after destructive step; engine quarantined",
            ));
        }
        let _ = fs::remove_dir_all(&retired);

        // Reopen the compacted store and rebuild the index under new ids.
        let mut data_loss = false;
        let layout = stores.layout.clone();
        let reopened = match DocumentStore::open(&layout) {
            Ok((documents, recovery)) => {
                if recovery.data_status != DataStatus::NoDataLoss {
                    data_loss = true;
                }
                documents
            }
            Err(err) => {
                self.quarantine(&format!("document store unusable after optimize: {}", err.context));
                return Err(Error::internal(
                    "optimize failed after destructive step; engine quarantined",
                ));
            }
        };
        let stores = self
            .stores
            .as_mut()
            .ok_or_else(|| Error::internal("ready without stores"))?;
        stores.documents = reopened;
        stores.cache.clear();

        if let Err(err) = Self::rebuild_index_inner(stores, &self.config, now) {
            self.quarantine(&format!("index rebuild failed after optimize: {}", err.context));
            return Err(Error::internal(
                "optimize failed after destructive step; engine quarantined",
            ));
        }

        let stores = self
            .stores
            .as_mut()
            .ok_or_else(|| Error::internal("ready without stores"))?;
        stores.index.persist()?;
        let combined = Self::combined_checksum(stores)?;
        EngineHeader::new(combined).write(&stores.layout.header_path())?;

        let result = OptimizeResult {
            latency_ms: overall.elapsed().as_millis() as u64,
            docs_removed,
            data_loss,
        };
        info!(
            docs_removed = result.docs_removed,
            latency_ms = result.latency_ms,
            "optimize completed"
        );
        Ok(result)
    }

    fn persist_to_disk(&mut self) -> Result<()> {
        let stores = self.stores_ready()?;
        stores.documents.persist()?;
        stores.index.persist()?;
        let combined = Self::combined_checksum(stores)?;
        EngineHeader::new(combined).write(&stores.layout.header_path())?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let base_dir = self.config.base_dir.clone();

        if base_dir.exists() {
            if let Err(err) = fs::remove_dir_all(&base_dir) {
                if base_dir.exists() {
                    // Nothing destroyed; whatever state we were in still
                    // holds and the caller may retry.
                    return Err(Error::aborted(format!(
                        "reset could not delete base dir: {}",
                        err
                    )));
                }
            }
        }

        self.stores = None;
        self.state = Lifecycle::Uninitialized;
        match self.initialize() {
            Ok(_) => {
                info!("engine reset to empty");
                Ok(())
            }
            Err(err) => Err(Error::internal(format!(
                "reset could not reinitialize: {}",
                err.context
            ))),
        }
    }

    fn quarantine(&mut self, reason: &str) {
        warn!(reason, "engine quarantined");
        self.state = Lifecycle::Quarantined;
    }

    // ---- internal helpers -------------------------------------------------

    fn combined_checksum(stores: &Stores) -> Result<u32> {
        Ok(EngineHeader::combine_checksums(
            stores.schema.compute_checksum()?,
            stores.documents.compute_checksum(),
            stores.index.compute_checksum(),
        ))
    }

    /// Whether any live document of `schema_type` would fail validation
    /// under the proposed schema.
    fn any_live_document_invalid(
        stores: &mut Stores,
        schema_type: &str,
        proposed: &Schema,
        now_ms: i64,
    ) -> Result<bool> {
        for document_id in stores.documents.alive_ids_of_type(schema_type, now_ms) {
            let document = stores.documents.get_by_id(document_id, now_ms)?;
            if validate_document_against(proposed, &document).is_err() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Tombstones the live documents of the affected types that no longer
    /// validate against the (already applied) schema. Returns how many went.
    fn delete_invalid_documents(
        stores: &mut Stores,
        types: &[String],
        now_ms: i64,
    ) -> Result<usize> {
        let mut deleted = 0usize;
        for schema_type in types {
            for document_id in stores.documents.alive_ids_of_type(schema_type, now_ms) {
                let document = stores.documents.get_by_id(document_id, now_ms)?;
                if stores.schema.validate_document(&document).is_err() {
                    stores.documents.tombstone(document_id)?;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    fn rebuild_index(&self, stores: &mut Stores, now_ms: i64) -> Result<()> {
        Self::rebuild_index_inner(stores, &self.config, now_ms)
    }

    /// Drops the whole index and replays every live document.
    fn rebuild_index_inner(stores: &mut Stores, config: &EngineConfig, now_ms: i64) -> Result<()> {
        stores.index.reset()?;
        let ids = stores.documents.alive_ids(now_ms);
        info!(documents = ids.len(), "rebuilding index");
        for document_id in ids {
            let document = stores.documents.get_by_id(document_id, now_ms)?;
            Self::index_document(
                stores,
                &document,
                document_id,
                config.max_tokens_per_doc,
                config.max_token_length,
            )?;
            stores.index.note_document(document_id);
        }
        stores.index.force_merge()?;
        stores.index.persist()?;
        Ok(())
    }

    /// Replays documents the index has not seen yet (watermark drift after
    /// a crash that lost in-memory lite hits).
    fn replay_documents(
        &self,
        stores: &mut Stores,
        index_last: Option<DocumentId>,
        now_ms: i64,
    ) -> Result<()> {
        let ids: Vec<DocumentId> = stores
            .documents
            .alive_ids(now_ms)
            .into_iter()
            .filter(|id| index_last.map_or(true, |last| *id > last))
            .collect();
        info!(documents = ids.len(), "replaying documents into index");
        for document_id in ids {
            let document = stores.documents.get_by_id(document_id, now_ms)?;
            Self::index_document(
                stores,
                &document,
                document_id,
                self.config.max_tokens_per_doc,
                self.config.max_token_length,
            )?;
            stores.index.note_document(document_id);
        }
        // Documents at the tail may be tombstoned or expired; the watermark
        // still has to cover them so the drift check converges.
        if let Some(doc_last) = stores.documents.last_document_id() {
            stores.index.note_document(doc_last);
        }
        Ok(())
    }

    /// Tokenizes every indexed section of a document and feeds the hits to
    /// the index, honouring the per-document token budget.
    fn index_document(
        stores: &mut Stores,
        document: &Document,
        document_id: DocumentId,
        max_tokens_per_doc: usize,
        max_token_length: usize,
    ) -> Result<(usize, bool)> {
        let sections = stores.schema.sections_of(&document.schema_type).to_vec();
        let mut budget = max_tokens_per_doc;
        let mut num_tokens = 0usize;
        let mut exceeded = false;

        'sections: for section in &sections {
            let tokenizer = create_tokenizer(section.indexing.tokenizer, max_token_length);
            let values: Vec<String> =
                crate::search::snippet::resolve_string_values(document, &section.path)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
            for value in values {
                let tokens = tokenizer.tokenize(&value);
                let mut editor = stores.index.edit(document_id, section.id);
                for token in tokens {
                    if budget == 0 {
                        exceeded = true;
                        break 'sections;
                    }
                    editor.add_hit(&token.text, 1)?;
                    budget -= 1;
                    num_tokens += 1;
                }
            }
        }
        Ok((num_tokens, exceeded))
    }

    /// Runs the match pipeline: per-clause iterators over both tiers,
    /// intersection across clauses, then the liveness/filter/section join
    /// against the document store. Returns matches in DocumentId-descending
    /// order.
    fn match_documents(
        stores: &mut Stores,
        search_spec: &SearchSpec,
        parsed: &ParsedQuery,
        now_ms: i64,
    ) -> Result<Vec<(DocumentId, Vec<DocHitInfo>)>> {
        if parsed.is_empty() {
            return Ok(Vec::new());
        }

        let mut iterators = Vec::with_capacity(parsed.clauses.len());
        for clause in &parsed.clauses {
            let mask = match &clause.property {
                None => SECTION_ID_MASK_ALL,
                Some(property) => {
                    // Coarse pre-filter: any type's section for this
                    // property may pass; the exact per-type check runs in
                    // the join below.
                    let mask = Self::property_mask_across_types(&stores.schema, property);
                    if mask == 0 {
                        return Ok(Vec::new()); // no type indexes this property
                    }
                    mask
                }
            };
            iterators.push(
                stores
                    .index
                    .get_iterator(&clause.term, mask, search_spec.term_match),
            );
        }

        let mut and = AndIterator::new(iterators);
        let mut matches = Vec::new();
        while let Some(row) = and.advance() {
            let document_id = row[0].document_id;
            if !stores.documents.is_alive(document_id, now_ms) {
                continue;
            }
            let meta = match stores.documents.meta(document_id) {
                Some(meta) => meta,
                None => continue,
            };
            if !search_spec.namespace_filters.is_empty()
                && !search_spec.namespace_filters.contains(&meta.namespace)
            {
                continue;
            }
            if !search_spec.schema_type_filters.is_empty()
                && !search_spec.schema_type_filters.contains(&meta.schema_type)
            {
                continue;
            }

            let schema_type = meta.schema_type.clone();
            let prefix_mask = stores.schema.prefix_section_mask(&schema_type);
            let mut all_clauses_match = true;
            for (clause, info) in parsed.clauses.iter().zip(row.iter()) {
                // Prefix-expanded hits only count in prefix-enabled
                // sections of this document's type.
                let effective = info.exact_sections | (info.prefix_sections & prefix_mask);
                let required = match &clause.property {
                    None => effective != 0,
                    Some(property) => {
                        match stores.schema.section_of_property(&schema_type, property) {
                            None => false,
                            Some(section) => effective & section.id.mask_bit() != 0,
                        }
                    }
                };
                if !required {
                    all_clauses_match = false;
                    break;
                }
            }
            if all_clauses_match {
                matches.push((document_id, row));
            }
        }
        Ok(matches)
    }

    fn property_mask_across_types(schema: &SchemaStore, property: &str) -> SectionIdMask {
        let mut mask = 0u64;
        if let Some(active) = schema.schema() {
            for schema_type in &active.types {
                if let Some(section) = schema.section_of_property(&schema_type.name, property) {
                    mask |= section.id.mask_bit();
                }
            }
        }
        mask
    }

    /// Materialises one page: fetches documents (skipping any that died
    /// since the search snapshot) and computes snippets for the first
    /// `num_to_snippet` of them.
    fn assemble_page(
        stores: &mut Stores,
        chunk: PageChunk,
        max_token_length: usize,
        now_ms: i64,
    ) -> Result<SearchResults> {
        let mut results = Vec::with_capacity(chunk.hits.len());
        let mut snippeted = 0usize;

        for hit in &chunk.hits {
            let document = match stores.documents.get_by_id(hit.document_id, now_ms) {
                Ok(document) => document,
                Err(err) if err.kind == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };

            let snippets = match chunk.snippet.spec {
                Some(spec) if snippeted < chunk.num_to_snippet => {
                    let sections = stores.schema.sections_of(&document.schema_type).to_vec();
                    snippeted += 1;
                    snippet_document(
                        &document,
                        &sections,
                        &chunk.snippet.clauses,
                        chunk.snippet.term_match,
                        spec,
                        max_token_length,
                    )
                }
                _ => Vec::new(),
            };

            results.push(SearchResultEntry {
                document,
                score: hit.score,
                snippets,
            });
        }

        Ok(SearchResults {
            results,
            next_page_token: chunk.next_page_token,
        })
    }
}
