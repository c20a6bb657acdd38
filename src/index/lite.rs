use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::path::PathBuf;

use serde::{Serialize, Deserialize};
use tracing::warn;

use crate::core::error::{Error, Result};
use crate::core::types::DocumentId;
use crate::index::hit::{DocHit, DocHitInfo, Hit};
use crate::storage::file::{read_checksummed, write_checksummed};
use crate::storage::layout::StorageLayout;

/// One buffered hit, with its term interned through the lexicon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LiteHit {
    term: u32,
    hit: Hit,
}

/// Persisted image of the lite tier.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LiteSnapshot {
    terms: Vec<String>,
    hits: Vec<LiteHit>,
    last_added_document_id: Option<DocumentId>,
}

/// Write-optimised in-memory tier. Inserts append to a flat hit buffer and a
/// growable lexicon; reads scan. Bounded by the merge budget, after which
/// the contents move to the main tier.
pub struct LiteIndex {
    lexicon: HashMap<String, u32>,
    terms: Vec<String>,
    hits: Vec<LiteHit>,
    approx_bytes: usize,
    last_added_document_id: Option<DocumentId>,
    path: PathBuf,
}

impl LiteIndex {
    /// Terms the lexicon can hold before inserts fail with `OutOfSpace`.
    pub const MAX_TERMS: usize = 1 << 20;

    /// Opens the lite tier, restoring the last persisted snapshot when it is
    /// intact. A corrupt snapshot starts empty; the coordinator detects the
    /// resulting watermark drift and replays the missing documents.
    pub fn open(layout: &StorageLayout) -> Self {
        let path = layout.lite_index_path();
        let mut lite = LiteIndex {
            lexicon: HashMap::new(),
            terms: Vec::new(),
            hits: Vec::new(),
            approx_bytes: 0,
            last_added_document_id: None,
            path,
        };
        if lite.path.exists() {
            match read_checksummed::<LiteSnapshot>(&lite.path) {
                Ok(snapshot) => lite.install(snapshot),
                Err(err) => {
                    warn!(context = %err.context, "lite index snapshot unreadable, starting empty");
                }
            }
        }
        lite
    }

    pub fn add_hit(&mut self, term: &str, hit: Hit) -> Result<()> {
        let ordinal = match self.lexicon.get(term) {
            Some(ordinal) => *ordinal,
            None => {
                if self.terms.len() >= Self::MAX_TERMS {
                    return Err(Error::out_of_space("lite index lexicon is full"));
                }
                let ordinal = self.terms.len() as u32;
                self.lexicon.insert(term.to_string(), ordinal);
                self.terms.push(term.to_string());
                self.approx_bytes += term.len() + mem::size_of::<u32>() * 2;
                ordinal
            }
        };
        self.hits.push(LiteHit { term: ordinal, hit });
        self.approx_bytes += mem::size_of::<LiteHit>();
        self.note_document(hit.document_id);
        Ok(())
    }

    pub fn note_document(&mut self, document_id: DocumentId) {
        if self.last_added_document_id.map_or(true, |last| document_id > last) {
            self.last_added_document_id = Some(document_id);
        }
    }

    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn last_added_document_id(&self) -> Option<DocumentId> {
        self.last_added_document_id
    }

    /// Scans the buffer for one query term and aggregates hits per document,
    /// DocumentId descending. With `prefix` set, terms that merely extend
    /// the query term contribute to the prefix mask.
    pub fn doc_hits(&self, term: &str, prefix: bool) -> Vec<DocHitInfo> {
        let mut per_doc: BTreeMap<u32, DocHitInfo> = BTreeMap::new();
        for lite_hit in &self.hits {
            let candidate = &self.terms[lite_hit.term as usize];
            let exact = candidate == term;
            let expanded = !exact && prefix && candidate.starts_with(term);
            if !exact && !expanded {
                continue;
            }
            let entry = per_doc
                .entry(lite_hit.hit.document_id.value())
                .or_insert_with(|| DocHitInfo::new(lite_hit.hit.document_id));
            if exact {
                entry.exact_sections |= lite_hit.hit.section_id.mask_bit();
            } else {
                entry.prefix_sections |= lite_hit.hit.section_id.mask_bit();
            }
        }
        per_doc.into_values().rev().collect()
    }

    /// Hands the buffered contents to a merge, aggregated per term with each
    /// posting list in DocumentId-descending order. The buffer is left
    /// intact; the caller clears it only after the merge commits.
    pub fn aggregated_for_merge(&self) -> BTreeMap<String, Vec<DocHit>> {
        let mut aggregated: BTreeMap<String, BTreeMap<u32, DocHit>> = BTreeMap::new();
        for lite_hit in &self.hits {
            let term = self.terms[lite_hit.term as usize].clone();
            let doc_hit = DocHit::from_hit(lite_hit.hit);
            aggregated
                .entry(term)
                .or_default()
                .entry(lite_hit.hit.document_id.value())
                .and_modify(|existing| existing.absorb(&doc_hit))
                .or_insert(doc_hit);
        }
        aggregated
            .into_iter()
            .map(|(term, per_doc)| (term, per_doc.into_values().rev().collect()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.lexicon.clear();
        self.terms.clear();
        self.hits.clear();
        self.approx_bytes = 0;
        // The watermark survives a clear: merged hits still cover those
        // documents, just from the main tier.
    }

    pub fn reset(&mut self) -> Result<()> {
        self.clear();
        self.last_added_document_id = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn persist(&self) -> Result<()> {
        write_checksummed(&self.path, &self.snapshot())
    }

    /// Content checksum, computed without materialising a snapshot.
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for term in &self.terms {
            hasher.update(&(term.len() as u32).to_le_bytes());
            hasher.update(term.as_bytes());
        }
        for lite_hit in &self.hits {
            hasher.update(&lite_hit.term.to_le_bytes());
            hasher.update(&lite_hit.hit.document_id.value().to_le_bytes());
            hasher.update(&[lite_hit.hit.section_id.0]);
            hasher.update(&lite_hit.hit.term_score.to_le_bytes());
        }
        if let Some(last) = self.last_added_document_id {
            hasher.update(&last.value().to_le_bytes());
        }
        hasher.finalize()
    }

    fn snapshot(&self) -> LiteSnapshot {
        LiteSnapshot {
            terms: self.terms.clone(),
            hits: self.hits.clone(),
            last_added_document_id: self.last_added_document_id,
        }
    }

    fn install(&mut self, snapshot: LiteSnapshot) {
        self.lexicon = snapshot
            .terms
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        self.approx_bytes = snapshot
            .terms
            .iter()
            .map(|t| t.len() + mem::size_of::<u32>() * 2)
            .sum::<usize>()
            + snapshot.hits.len() * mem::size_of::<LiteHit>();
        self.terms = snapshot.terms;
        self.hits = snapshot.hits;
        self.last_added_document_id = snapshot.last_added_document_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SectionId;

    fn hit(doc: u32, section: u8) -> Hit {
        Hit {
            document_id: DocumentId(doc),
            section_id: SectionId(section),
            term_score: 1,
        }
    }

    #[test]
    fn doc_hits_aggregate_sections_descending() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::create(dir.path()).unwrap();
        let mut lite = LiteIndex::open(&layout);

        lite.add_hit("foo", hit(1, 0)).unwrap();
        lite.add_hit("foo", hit(1, 2)).unwrap();
        lite.add_hit("foo", hit(3, 1)).unwrap();
        lite.add_hit("other", hit(2, 0)).unwrap();

        let hits = lite.doc_hits("foo", false);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document_id, DocumentId(3));
        assert_eq!(hits[1].document_id, DocumentId(1));
        assert_eq!(hits[1].exact_sections, 0b101);
    }

    #[test]
    fn prefix_expansion_lands_in_prefix_mask() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::create(dir.path()).unwrap();
        let mut lite = LiteIndex::open(&layout);

        lite.add_hit("message", hit(5, 0)).unwrap();

        let hits = lite.doc_hits("mess", true);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].exact_sections, 0);
        assert_eq!(hits[0].prefix_sections, 0b1);

        // Exact-only lookup of the same query term finds nothing.
        assert!(lite.doc_hits("mess", false).is_empty());
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::create(dir.path()).unwrap();
        {
            let mut lite = LiteIndex::open(&layout);
            lite.add_hit("foo", hit(1, 0)).unwrap();
            lite.persist().unwrap();
        }
        let lite = LiteIndex::open(&layout);
        assert_eq!(lite.last_added_document_id(), Some(DocumentId(1)));
        assert_eq!(lite.doc_hits("foo", false).len(), 1);
    }
}
