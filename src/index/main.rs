use std::collections::BTreeMap;
use std::path::PathBuf;

use fst::{IntoStreamer, Map, MapBuilder, Streamer};
use serde::{Serialize, Deserialize};
use tracing::{info, warn};

use crate::core::error::Result;
use crate::core::types::DocumentId;
use crate::index::hit::{DocHit, DocHitInfo};
use crate::storage::file::{read_checksummed, write_checksummed};
use crate::storage::layout::StorageLayout;

/// Persisted image of the main tier. Terms are sorted, so the fst lexicon
/// can be rebuilt directly at load.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MainSnapshot {
    terms: Vec<String>,
    postings: Vec<Vec<DocHit>>,
    last_added_document_id: Option<DocumentId>,
}

/// Read-optimised on-disk tier. Terms live in an fst keyed to posting-list
/// ordinals; posting lists are DocumentId-descending. Mutation happens only
/// through merges from the lite tier.
pub struct MainIndex {
    fst: Map<Vec<u8>>,
    terms: Vec<String>,
    postings: Vec<Vec<DocHit>>,
    last_added_document_id: Option<DocumentId>,
    path: PathBuf,
    /// Set when the on-disk image failed its checksum and the tier started
    /// empty. The coordinator must rebuild the whole index in that case.
    pub recovered_empty: bool,
}

impl MainIndex {
    pub fn open(layout: &StorageLayout) -> Result<Self> {
        let path = layout.main_index_path();
        let mut main = MainIndex {
            fst: Map::default(),
            terms: Vec::new(),
            postings: Vec::new(),
            last_added_document_id: None,
            path,
            recovered_empty: false,
        };
        if main.path.exists() {
            match read_checksummed::<MainSnapshot>(&main.path) {
                Ok(snapshot) => main.install(snapshot)?,
                Err(err) => {
                    warn!(context = %err.context, "main index unreadable, starting empty");
                    main.recovered_empty = true;
                }
            }
        }
        Ok(main)
    }

    pub fn last_added_document_id(&self) -> Option<DocumentId> {
        self.last_added_document_id
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    /// Looks up one query term, expanding across the fst range when `prefix`
    /// is set. Results aggregate per document, DocumentId descending.
    pub fn doc_hits(&self, term: &str, prefix: bool) -> Vec<DocHitInfo> {
        let mut per_doc: BTreeMap<u32, DocHitInfo> = BTreeMap::new();

        let mut add = |ordinal: u64, exact: bool| {
            for doc_hit in &self.postings[ordinal as usize] {
                let entry = per_doc
                    .entry(doc_hit.document_id.value())
                    .or_insert_with(|| DocHitInfo::new(doc_hit.document_id));
                if exact {
                    entry.exact_sections |= doc_hit.sections;
                } else {
                    entry.prefix_sections |= doc_hit.sections;
                }
            }
        };

        if prefix {
            let mut stream = self.fst.range().ge(term.as_bytes()).into_stream();
            while let Some((candidate, ordinal)) = stream.next() {
                if !candidate.starts_with(term.as_bytes()) {
                    break;
                }
                add(ordinal, candidate == term.as_bytes());
            }
        } else if let Some(ordinal) = self.fst.get(term.as_bytes()) {
            add(ordinal, true);
        }

        per_doc.into_values().rev().collect()
    }

    /// Folds a lite-tier batch into the posting lists and commits the result
    /// to disk. The in-memory state only changes after the new image is
    /// durably written, so a failed merge leaves both tiers as they were.
    pub fn merge(&mut self, batch: BTreeMap<String, Vec<DocHit>>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut new_terms = Vec::with_capacity(self.terms.len() + batch.len());
        let mut new_postings = Vec::with_capacity(self.postings.len() + batch.len());

        let mut old_iter = self
            .terms
            .iter()
            .cloned()
            .zip(self.postings.iter().cloned())
            .peekable();
        let mut batch_iter = batch.into_iter().peekable();

        loop {
            let take_old = match (old_iter.peek(), batch_iter.peek()) {
                (None, None) => break,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some((old_term, _)), Some((new_term, _))) => {
                    if old_term == new_term {
                        let (term, old_list) = old_iter.next().unwrap();
                        let (_, new_list) = batch_iter.next().unwrap();
                        new_terms.push(term);
                        new_postings.push(merge_posting_lists(old_list, new_list));
                        continue;
                    }
                    old_term < new_term
                }
            };
            if take_old {
                let (term, list) = old_iter.next().unwrap();
                new_terms.push(term);
                new_postings.push(list);
            } else {
                let (term, list) = batch_iter.next().unwrap();
                new_terms.push(term);
                new_postings.push(list);
            }
        }

        let mut last = self.last_added_document_id;
        for list in &new_postings {
            if let Some(first) = list.first() {
                last = Some(last.map_or(first.document_id, |l| l.max(first.document_id)));
            }
        }

        let snapshot = MainSnapshot {
            terms: new_terms,
            postings: new_postings,
            last_added_document_id: last,
        };
        write_checksummed(&self.path, &snapshot)?;
        info!(terms = snapshot.terms.len(), "lite tier merged into main index");
        self.install(snapshot)?;
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.fst = Map::default();
        self.terms.clear();
        self.postings.clear();
        self.last_added_document_id = None;
        self.recovered_empty = false;
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
        for (term, postings) in self.terms.iter().zip(&self.postings) {
            hasher.update(&(term.len() as u32).to_le_bytes());
            hasher.update(term.as_bytes());
            for doc_hit in postings {
                hasher.update(&doc_hit.document_id.value().to_le_bytes());
                hasher.update(&doc_hit.sections.to_le_bytes());
                hasher.update(&doc_hit.term_score.to_le_bytes());
            }
        }
        if let Some(last) = self.last_added_document_id {
            hasher.update(&last.value().to_le_bytes());
        }
        hasher.finalize()
    }

    fn snapshot(&self) -> MainSnapshot {
        MainSnapshot {
            terms: self.terms.clone(),
            postings: self.postings.clone(),
            last_added_document_id: self.last_added_document_id,
        }
    }

    fn install(&mut self, snapshot: MainSnapshot) -> Result<()> {
        let mut builder = MapBuilder::memory();
        for (ordinal, term) in snapshot.terms.iter().enumerate() {
            builder.insert(term.as_bytes(), ordinal as u64)?;
        }
        self.fst = builder.into_map();
        self.terms = snapshot.terms;
        self.postings = snapshot.postings;
        self.last_added_document_id = snapshot.last_added_document_id;
        Ok(())
    }
}

/// Merges two DocumentId-descending posting lists, absorbing duplicate
/// documents.
fn merge_posting_lists(old: Vec<DocHit>, new: Vec<DocHit>) -> Vec<DocHit> {
    let mut merged = Vec::with_capacity(old.len() + new.len());
    let mut old_iter = old.into_iter().peekable();
    let mut new_iter = new.into_iter().peekable();

    loop {
        match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => merged.push(old_iter.next().unwrap()),
            (None, Some(_)) => merged.push(new_iter.next().unwrap()),
            (Some(a), Some(b)) => {
                if a.document_id == b.document_id {
                    let mut hit = old_iter.next().unwrap();
                    hit.absorb(&new_iter.next().unwrap());
                    merged.push(hit);
                } else if a.document_id > b.document_id {
                    merged.push(old_iter.next().unwrap());
                } else {
                    merged.push(new_iter.next().unwrap());
                }
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DocumentId, SectionId};
    use crate::index::hit::Hit;

    fn doc_hit(doc: u32, section: u8) -> DocHit {
        DocHit::from_hit(Hit {
            document_id: DocumentId(doc),
            section_id: SectionId(section),
            term_score: 1,
        })
    }

    fn batch(entries: &[(&str, &[DocHit])]) -> BTreeMap<String, Vec<DocHit>> {
        entries
            .iter()
            .map(|(term, hits)| (term.to_string(), hits.to_vec()))
            .collect()
    }

    #[test]
    fn merge_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::create(dir.path()).unwrap();
        let mut main = MainIndex::open(&layout).unwrap();

        main.merge(batch(&[
            ("foo", &[doc_hit(2, 0), doc_hit(0, 1)]),
            ("foobar", &[doc_hit(1, 0)]),
        ]))
        .unwrap();

        let exact = main.doc_hits("foo", false);
        assert_eq!(exact.len(), 2);
        assert_eq!(exact[0].document_id, DocumentId(2));

        let prefixed = main.doc_hits("foo", true);
        assert_eq!(prefixed.len(), 3);
        assert_eq!(prefixed[1].document_id, DocumentId(1));
        assert_eq!(prefixed[1].exact_sections, 0);
        assert_ne!(prefixed[1].prefix_sections, 0);
    }

    #[test]
    fn second_merge_combines_posting_lists() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::create(dir.path()).unwrap();
        let mut main = MainIndex::open(&layout).unwrap();

        main.merge(batch(&[("foo", &[doc_hit(1, 0)])])).unwrap();
        main.merge(batch(&[("foo", &[doc_hit(3, 1)])])).unwrap();

        let hits = main.doc_hits("foo", false);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document_id, DocumentId(3));
        assert_eq!(main.last_added_document_id(), Some(DocumentId(3)));
    }

    #[test]
    fn reopen_restores_contents() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::create(dir.path()).unwrap();
        {
            let mut main = MainIndex::open(&layout).unwrap();
            main.merge(batch(&[("foo", &[doc_hit(1, 0)])])).unwrap();
        }
        let main = MainIndex::open(&layout).unwrap();
        assert!(!main.recovered_empty);
        assert_eq!(main.doc_hits("foo", false).len(), 1);
    }

    #[test]
    fn corrupt_image_starts_empty_and_flags_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::create(dir.path()).unwrap();
        {
            let mut main = MainIndex::open(&layout).unwrap();
            main.merge(batch(&[("foo", &[doc_hit(1, 0)])])).unwrap();
        }
        std::fs::write(layout.main_index_path(), b"garbage").unwrap();

        let main = MainIndex::open(&layout).unwrap();
        assert!(main.recovered_empty);
        assert!(main.doc_hits("foo", false).is_empty());
    }
}
