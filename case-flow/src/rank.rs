//! Reranking of raw similarity hits into article candidates.
//!
//! Similarity alone over-rewards marginal embedding gains from low-impact venues, so the
//! ordering key is a weighted sum of similarity and journal rank.

use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::debug;

use crate::config::RankingWeights;
use crate::model::{ArticleCandidate, SearchHit};

pub fn composite_score(similarity: f64, journal_rank: f64, weights: &RankingWeights) -> f64 {
    weights.similarity_weight * similarity + weights.journal_weight * journal_rank.clamp(0.0, 1.0)
}

/// Descending score, then descending journal rank, then ascending id.
pub fn candidate_order(a: &ArticleCandidate, b: &ArticleCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.journal_rank.total_cmp(&a.journal_rank))
        .then_with(|| a.id.cmp(&b.id))
}

/// Deduplicates hits by id, scores them, and keeps the best `limit` in rank order.
pub fn rank_candidates(
    hits: Vec<SearchHit>,
    weights: &RankingWeights,
    limit: usize,
) -> Vec<ArticleCandidate> {
    let mut unique: HashMap<String, SearchHit> = HashMap::with_capacity(hits.len());
    for hit in hits {
        if !hit.similarity.is_finite() || !hit.journal_rank.is_finite() {
            debug!(article_id = %hit.id, "Skipping hit with non-finite score");
            continue;
        }
        match unique.get(&hit.id) {
            Some(existing) if existing.similarity >= hit.similarity => {}
            _ => {
                unique.insert(hit.id.clone(), hit);
            }
        }
    }

    let mut candidates: Vec<ArticleCandidate> = unique
        .into_values()
        .map(|hit| ArticleCandidate {
            score: composite_score(hit.similarity, hit.journal_rank, weights),
            id: hit.id,
            title: hit.title,
            abstract_text: hit.abstract_text,
            similarity: hit.similarity,
            journal_rank: hit.journal_rank,
            full_text_available: hit.full_text_available,
        })
        .collect();

    candidates.sort_by(candidate_order);
    candidates.truncate(limit);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::hit;

    fn weights() -> RankingWeights {
        RankingWeights::default()
    }

    #[test]
    fn journal_rank_breaks_close_similarity() {
        let hits = vec![hit("low-venue", 0.82, 0.1), hit("high-venue", 0.80, 0.9)];
        let ranked = rank_candidates(hits, &weights(), 2);
        assert_eq!(ranked[0].id, "high-venue");
        assert_eq!(ranked[1].id, "low-venue");
    }

    #[test]
    fn large_similarity_gap_still_wins() {
        let hits = vec![hit("relevant", 0.95, 0.1), hit("famous", 0.40, 1.0)];
        let ranked = rank_candidates(hits, &weights(), 2);
        assert_eq!(ranked[0].id, "relevant");
    }

    #[test]
    fn ties_fall_back_to_journal_rank_then_id() {
        let weights = RankingWeights {
            similarity_weight: 1.0,
            journal_weight: 0.0,
        };
        let hits = vec![hit("b", 0.5, 0.2), hit("a", 0.5, 0.2), hit("c", 0.5, 0.7)];
        let ranked = rank_candidates(hits, &weights, 3);
        let ids: Vec<&str> = ranked.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn truncates_and_dedups() {
        let mut hits: Vec<SearchHit> = (0..15)
            .map(|i| hit(&format!("pmid-{i:02}"), 1.0 - i as f64 * 0.01, 0.5))
            .collect();
        hits.push(hit("pmid-03", 0.2, 0.5));
        let ranked = rank_candidates(hits, &weights(), 5);
        assert_eq!(ranked.len(), 5);
        let mut ids: Vec<&str> = ranked.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["pmid-00", "pmid-01", "pmid-02", "pmid-03", "pmid-04"]);
        ids.dedup();
        assert_eq!(ids.len(), 5);
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn non_finite_hits_are_dropped() {
        let hits = vec![hit("nan", f64::NAN, 0.5), hit("ok", 0.3, 0.5)];
        let ranked = rank_candidates(hits, &weights(), 5);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, "ok");
    }
}
