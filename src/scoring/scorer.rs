use crate::core::types::DocumentId;
use crate::document::store::DocMeta;
use crate::document::usage::UsageScores;

/// What to rank results by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankingStrategy {
    /// Reverse insertion order: DocumentId descending, no score computed.
    #[default]
    None,
    DocumentScore,
    CreationTimestamp,
    UsageType1Count,
    UsageType2Count,
    UsageType3Count,
    UsageType1LastUsedTimestamp,
    UsageType2LastUsedTimestamp,
    UsageType3LastUsedTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Desc,
    Asc,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringSpec {
    pub rank_by: RankingStrategy,
    pub order: Order,
}

/// A matched document with its computed rank score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoredHit {
    pub document_id: DocumentId,
    pub score: i64,
}

/// Computes the rank score of one document under a strategy. Documents with
/// no usage record score 0 on every usage strategy, which leaves them in
/// reverse insertion order relative to each other.
pub fn score_document(
    strategy: RankingStrategy,
    document_id: DocumentId,
    meta: &DocMeta,
    usage: Option<&UsageScores>,
) -> i64 {
    match strategy {
        RankingStrategy::None => document_id.value() as i64,
        RankingStrategy::DocumentScore => meta.score as i64,
        RankingStrategy::CreationTimestamp => meta.creation_timestamp_ms,
        RankingStrategy::UsageType1Count => usage_count(usage, 0),
        RankingStrategy::UsageType2Count => usage_count(usage, 1),
        RankingStrategy::UsageType3Count => usage_count(usage, 2),
        RankingStrategy::UsageType1LastUsedTimestamp => usage_timestamp(usage, 0),
        RankingStrategy::UsageType2LastUsedTimestamp => usage_timestamp(usage, 1),
        RankingStrategy::UsageType3LastUsedTimestamp => usage_timestamp(usage, 2),
    }
}

/// Orders scored hits for result assembly. Descending by score with
/// DocumentId-descending tie-break; `Order::Asc` flips the whole comparison.
pub fn sort_hits(hits: &mut [ScoredHit], order: Order) {
    hits.sort_by(|a, b| {
        let cmp = b
            .score
            .cmp(&a.score)
            .then_with(|| b.document_id.cmp(&a.document_id));
        match order {
            Order::Desc => cmp,
            Order::Asc => cmp.reverse(),
        }
    });
}

fn usage_count(usage: Option<&UsageScores>, slot: usize) -> i64 {
    usage.map(|u| u.counts[slot] as i64).unwrap_or(0)
}

fn usage_timestamp(usage: Option<&UsageScores>, slot: usize) -> i64 {
    usage.map(|u| u.last_used_ms[slot]).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(doc: u32, score: i64) -> ScoredHit {
        ScoredHit {
            document_id: DocumentId(doc),
            score,
        }
    }

    #[test]
    fn desc_sorts_by_score_then_recency() {
        let mut hits = vec![hit(1, 5), hit(3, 5), hit(2, 9)];
        sort_hits(&mut hits, Order::Desc);
        let ids: Vec<u32> = hits.iter().map(|h| h.document_id.value()).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn asc_flips_the_order() {
        let mut hits = vec![hit(1, 5), hit(2, 9), hit(3, 1)];
        sort_hits(&mut hits, Order::Asc);
        let ids: Vec<u32> = hits.iter().map(|h| h.document_id.value()).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }
}
