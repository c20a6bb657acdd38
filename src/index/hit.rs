use serde::{Serialize, Deserialize};

use crate::core::types::{DocumentId, SectionId, SectionIdMask};

/// A single term occurrence as recorded by the lite tier: one document, one
/// section, one score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit {
    pub document_id: DocumentId,
    pub section_id: SectionId,
    pub term_score: u32,
}

/// Aggregated posting entry: all sections of one document that contain the
/// term, as a bitmask. Posting lists hold these in DocumentId-descending
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocHit {
    pub document_id: DocumentId,
    pub sections: SectionIdMask,
    pub term_score: u32,
}

impl DocHit {
    pub fn from_hit(hit: Hit) -> Self {
        DocHit {
            document_id: hit.document_id,
            sections: hit.section_id.mask_bit(),
            term_score: hit.term_score,
        }
    }

    /// Folds another occurrence of the same document into this entry.
    pub fn absorb(&mut self, other: &DocHit) {
        debug_assert_eq!(self.document_id, other.document_id);
        self.sections |= other.sections;
        self.term_score = self.term_score.max(other.term_score);
    }
}

/// What a per-term iterator yields for one candidate document. Exact and
/// prefix-expanded occurrences are tracked separately because prefix
/// expansion only applies to prefix-enabled sections; the search layer joins
/// this against the document's type to decide which sections count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocHitInfo {
    pub document_id: DocumentId,
    /// Sections where the term itself occurred.
    pub exact_sections: SectionIdMask,
    /// Sections where only a prefix-expanded term occurred.
    pub prefix_sections: SectionIdMask,
}

impl DocHitInfo {
    pub fn new(document_id: DocumentId) -> Self {
        DocHitInfo {
            document_id,
            exact_sections: 0,
            prefix_sections: 0,
        }
    }

    pub fn merge(&mut self, other: &DocHitInfo) {
        debug_assert_eq!(self.document_id, other.document_id);
        self.exact_sections |= other.exact_sections;
        self.prefix_sections |= other.prefix_sections;
    }

    pub fn any_sections(&self) -> SectionIdMask {
        self.exact_sections | self.prefix_sections
    }
}
