use std::collections::HashSet;

use crate::core::error::Result;
use crate::core::types::{DocumentId, SectionId};
use crate::index::term_index::TermIndex;

/// Groups the hits of one (document, section) pair and dedupes terms before
/// they reach the lite tier, so repeated words in a property value cost one
/// hit each.
pub struct IndexEditor<'a> {
    index: &'a mut TermIndex,
    document_id: DocumentId,
    section_id: SectionId,
    seen_terms: HashSet<String>,
}

impl<'a> IndexEditor<'a> {
    pub(crate) fn new(
        index: &'a mut TermIndex,
        document_id: DocumentId,
        section_id: SectionId,
    ) -> Self {
        IndexEditor {
            index,
            document_id,
            section_id,
            seen_terms: HashSet::new(),
        }
    }

    /// Adds one term occurrence. The term is truncated to the index's token
    /// length bound first; duplicates within this section are dropped.
    pub fn add_hit(&mut self, term: &str, score: u32) -> Result<()> {
        let term = self.index.bounded_term(term).into_owned();
        if !self.seen_terms.insert(term.clone()) {
            return Ok(());
        }
        self.index
            .insert_hit(&term, self.document_id, self.section_id, score)
    }
}
