use std::borrow::Cow;
use std::time::Instant;

use tracing::debug;

use crate::analysis::tokenizer::truncate_term;
use crate::core::error::Result;
use crate::core::types::{DocumentId, SectionId, SectionIdMask};
use crate::index::editor::IndexEditor;
use crate::index::hit::Hit;
use crate::index::iterator::HitIterator;
use crate::index::lite::LiteIndex;
use crate::index::main::MainIndex;
use crate::schema::schema::TermMatch;
use crate::storage::layout::StorageLayout;

/// The two-tier inverted index: a write-optimised lite tier that spills into
/// the read-optimised main tier once it outgrows the merge budget.
pub struct TermIndex {
    lite: LiteIndex,
    main: MainIndex,
    merge_size: usize,
    max_token_length: usize,
    last_merge_latency_ms: Option<u64>,
}

impl TermIndex {
    pub fn open(layout: &StorageLayout, merge_size: usize, max_token_length: usize) -> Result<Self> {
        let lite = LiteIndex::open(layout);
        let main = MainIndex::open(layout)?;
        Ok(TermIndex {
            lite,
            main,
            merge_size,
            max_token_length,
            last_merge_latency_ms: None,
        })
    }

    /// Whether the persisted image was unusable at open, forcing a rebuild.
    pub fn recovered_empty(&self) -> bool {
        self.main.recovered_empty
    }

    /// Starts an editing session for one (document, section) pair.
    pub fn edit(&mut self, document_id: DocumentId, section_id: SectionId) -> IndexEditor<'_> {
        IndexEditor::new(self, document_id, section_id)
    }

    /// Marks a document as covered by the index even if it produced no hits,
    /// keeping the watermark aligned with the document store.
    pub fn note_document(&mut self, document_id: DocumentId) {
        self.lite.note_document(document_id);
    }

    /// Highest document id the index has seen. The coordinator compares this
    /// against the document store to detect drift after a crash.
    pub fn last_added_document_id(&self) -> Option<DocumentId> {
        match (
            self.lite.last_added_document_id(),
            self.main.last_added_document_id(),
        ) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Union iterator over both tiers for one query term, filtered by the
    /// section mask. The query term is truncated exactly like indexed terms,
    /// so overlong queries still line up with their indexed form.
    pub fn get_iterator(
        &self,
        term: &str,
        section_mask: SectionIdMask,
        term_match: TermMatch,
    ) -> HitIterator {
        let term = truncate_term(term, self.max_token_length);
        let prefix = term_match == TermMatch::Prefix;
        let lite = HitIterator::source(self.lite.doc_hits(term, prefix));
        let main = HitIterator::source(self.main.doc_hits(term, prefix));
        HitIterator::restrict(HitIterator::union(lite, main), section_mask)
    }

    /// Milliseconds spent in the merge triggered by the most recent insert,
    /// if one ran. Reading clears the value.
    pub fn take_merge_latency(&mut self) -> Option<u64> {
        self.last_merge_latency_ms.take()
    }

    pub fn reset(&mut self) -> Result<()> {
        self.lite.reset()?;
        self.main.reset()
    }

    /// Forces the lite tier into main regardless of the budget. Used by
    /// rebuilds that want the result fully on disk.
    pub fn force_merge(&mut self) -> Result<()> {
        self.run_merge()
    }

    pub fn persist(&self) -> Result<()> {
        self.lite.persist()?;
        self.main.persist()
    }

    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.lite.compute_checksum().to_le_bytes());
        hasher.update(&self.main.compute_checksum().to_le_bytes());
        hasher.finalize()
    }

    pub(crate) fn bounded_term<'t>(&self, term: &'t str) -> Cow<'t, str> {
        Cow::Borrowed(truncate_term(term, self.max_token_length))
    }

    pub(crate) fn insert_hit(
        &mut self,
        term: &str,
        document_id: DocumentId,
        section_id: SectionId,
        score: u32,
    ) -> Result<()> {
        self.lite.add_hit(
            term,
            Hit {
                document_id,
                section_id,
                term_score: score,
            },
        )?;
        if self.lite.approx_bytes() >= self.merge_size {
            self.run_merge()?;
        }
        Ok(())
    }

    /// Moves the lite buffer into main. The lite tier is only cleared after
    /// the main tier has durably committed, so a failed merge leaves
    /// everything queryable and is simply retried by a later insert.
    fn run_merge(&mut self) -> Result<()> {
        if self.lite.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let batch = self.lite.aggregated_for_merge();
        self.main.merge(batch)?;
        self.lite.clear();
        self.lite.persist()?;
        let elapsed = started.elapsed().as_millis() as u64;
        self.last_merge_latency_ms = Some(elapsed);
        debug!(elapsed_ms = elapsed, "index merge completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(dir: &tempfile::TempDir, merge_size: usize) -> TermIndex {
        let layout = StorageLayout::create(dir.path()).unwrap();
        TermIndex::open(&layout, merge_size, 30).unwrap()
    }

    fn collect_ids(mut iter: HitIterator) -> Vec<u32> {
        let mut ids = Vec::new();
        while let Some(info) = iter.advance() {
            ids.push(info.document_id.value());
        }
        ids
    }

    #[test]
    fn hits_surface_across_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index(&dir, 64); // tiny budget so merges fire

        for doc in 0..8u32 {
            let mut editor = index.edit(DocumentId(doc), SectionId(0));
            editor.add_hit("message", 1).unwrap();
            editor.add_hit("body", 1).unwrap();
        }

        let ids = collect_ids(index.get_iterator(
            "message",
            crate::core::types::SECTION_ID_MASK_ALL,
            TermMatch::Exact,
        ));
        assert_eq!(ids, vec![7, 6, 5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn editor_dedupes_terms_within_section() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = index(&dir, 1 << 20);

        {
            let mut editor = index.edit(DocumentId(0), SectionId(0));
            editor.add_hit("dup", 1).unwrap();
            editor.add_hit("dup", 1).unwrap();
        }

        let mut iter = index.get_iterator(
            "dup",
            crate::core::types::SECTION_ID_MASK_ALL,
            TermMatch::Exact,
        );
        assert!(iter.advance().is_some());
        assert!(iter.advance().is_none());
    }

    #[test]
    fn query_terms_truncate_symmetrically() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::create(dir.path()).unwrap();
        let mut index = TermIndex::open(&layout, 1 << 20, 5).unwrap();

        {
            let mut editor = index.edit(DocumentId(0), SectionId(0));
            editor.add_hit("abcdefghij", 1).unwrap(); // indexed as "abcde"
        }

        let mut iter = index.get_iterator(
            "abcdefxyz", // truncates to the same "abcde"
            crate::core::types::SECTION_ID_MASK_ALL,
            TermMatch::Exact,
        );
        assert!(iter.advance().is_some());
    }
}
