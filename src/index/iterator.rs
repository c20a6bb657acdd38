use crate::core::types::SectionIdMask;
use crate::index::hit::DocHitInfo;

/// Posting-stream combinators over the two tiers. A closed set of variants:
/// queries only ever need source streams, unions across tiers, and section
/// restricts, so this is a tagged enum rather than an open trait.
///
/// Every stream yields documents in strictly descending DocumentId order.
pub enum HitIterator {
    Source(SourceIterator),
    Union(UnionIterator),
    Restrict {
        inner: Box<HitIterator>,
        mask: SectionIdMask,
    },
}

impl HitIterator {
    /// Wraps the precomputed hits of one tier (already DocumentId
    /// descending).
    pub fn source(hits: Vec<DocHitInfo>) -> Self {
        HitIterator::Source(SourceIterator { hits, cursor: 0 })
    }

    pub fn union(left: HitIterator, right: HitIterator) -> Self {
        HitIterator::Union(UnionIterator {
            left: Box::new(left),
            right: Box::new(right),
            left_pending: None,
            right_pending: None,
        })
    }

    pub fn restrict(inner: HitIterator, mask: SectionIdMask) -> Self {
        HitIterator::Restrict {
            inner: Box::new(inner),
            mask,
        }
    }

    pub fn advance(&mut self) -> Option<DocHitInfo> {
        match self {
            HitIterator::Source(source) => source.advance(),
            HitIterator::Union(union) => union.advance(),
            HitIterator::Restrict { inner, mask } => loop {
                let mut info = inner.advance()?;
                info.exact_sections &= *mask;
                info.prefix_sections &= *mask;
                if info.any_sections() != 0 {
                    return Some(info);
                }
            },
        }
    }
}

pub struct SourceIterator {
    hits: Vec<DocHitInfo>,
    cursor: usize,
}

impl SourceIterator {
    fn advance(&mut self) -> Option<DocHitInfo> {
        let info = self.hits.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(info)
    }
}

/// Merges two descending streams, OR-ing section masks when both sides hold
/// the same document.
pub struct UnionIterator {
    left: Box<HitIterator>,
    right: Box<HitIterator>,
    left_pending: Option<DocHitInfo>,
    right_pending: Option<DocHitInfo>,
}

impl UnionIterator {
    fn advance(&mut self) -> Option<DocHitInfo> {
        if self.left_pending.is_none() {
            self.left_pending = self.left.advance();
        }
        if self.right_pending.is_none() {
            self.right_pending = self.right.advance();
        }

        match (self.left_pending, self.right_pending) {
            (None, None) => None,
            (Some(_), None) => self.left_pending.take(),
            (None, Some(_)) => self.right_pending.take(),
            (Some(left), Some(right)) => {
                if left.document_id > right.document_id {
                    self.left_pending.take()
                } else if right.document_id > left.document_id {
                    self.right_pending.take()
                } else {
                    let mut merged = left;
                    merged.merge(&right);
                    self.left_pending = None;
                    self.right_pending = None;
                    Some(merged)
                }
            }
        }
    }
}

/// Intersection across the per-term streams of a multi-term query. Yields
/// one row per document present in every stream, with each term's own
/// section info preserved so per-term property restricts can be checked
/// afterwards.
pub struct AndIterator {
    children: Vec<HitIterator>,
    current: Vec<Option<DocHitInfo>>,
}

impl AndIterator {
    pub fn new(children: Vec<HitIterator>) -> Self {
        let current = (0..children.len()).map(|_| None).collect();
        AndIterator { children, current }
    }

    pub fn advance(&mut self) -> Option<Vec<DocHitInfo>> {
        if self.children.is_empty() {
            return None;
        }
        loop {
            for (child, slot) in self.children.iter_mut().zip(self.current.iter_mut()) {
                if slot.is_none() {
                    *slot = child.advance();
                }
                slot.as_ref()?;
            }

            // Streams are descending, so everyone must come down to the
            // smallest current id.
            let target = self
                .current
                .iter()
                .map(|info| info.unwrap().document_id)
                .min()
                .unwrap();

            let mut aligned = true;
            for (child, slot) in self.children.iter_mut().zip(self.current.iter_mut()) {
                while let Some(info) = slot {
                    if info.document_id > target {
                        *slot = child.advance();
                    } else {
                        break;
                    }
                }
                match slot {
                    None => return None,
                    Some(info) if info.document_id != target => aligned = false,
                    _ => {}
                }
            }

            if aligned {
                let row = self
                    .current
                    .iter_mut()
                    .map(|slot| slot.take().unwrap())
                    .collect();
                return Some(row);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DocumentId;

    fn info(doc: u32, exact: SectionIdMask) -> DocHitInfo {
        DocHitInfo {
            document_id: DocumentId(doc),
            exact_sections: exact,
            prefix_sections: 0,
        }
    }

    #[test]
    fn union_merges_descending_streams() {
        let left = HitIterator::source(vec![info(5, 0b1), info(2, 0b1)]);
        let right = HitIterator::source(vec![info(4, 0b10), info(2, 0b100)]);
        let mut union = HitIterator::union(left, right);

        assert_eq!(union.advance().unwrap().document_id, DocumentId(5));
        assert_eq!(union.advance().unwrap().document_id, DocumentId(4));
        let merged = union.advance().unwrap();
        assert_eq!(merged.document_id, DocumentId(2));
        assert_eq!(merged.exact_sections, 0b101);
        assert!(union.advance().is_none());
    }

    #[test]
    fn restrict_drops_masked_out_docs() {
        let source = HitIterator::source(vec![info(3, 0b10), info(1, 0b1)]);
        let mut restricted = HitIterator::restrict(source, 0b1);

        let only = restricted.advance().unwrap();
        assert_eq!(only.document_id, DocumentId(1));
        assert!(restricted.advance().is_none());
    }

    #[test]
    fn and_aligns_all_streams() {
        let a = HitIterator::source(vec![info(9, 1), info(7, 1), info(3, 1)]);
        let b = HitIterator::source(vec![info(8, 1), info(7, 1), info(3, 1), info(1, 1)]);
        let mut and = AndIterator::new(vec![a, b]);

        let row = and.advance().unwrap();
        assert_eq!(row[0].document_id, DocumentId(7));
        let row = and.advance().unwrap();
        assert_eq!(row[0].document_id, DocumentId(3));
        assert!(and.advance().is_none());
    }
}
