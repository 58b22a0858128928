use chrono::{DateTime, Utc};

use super::text_signals::{extract_keywords, DEFAULT_MAX_KEYWORDS};
use super::{
    best_scored, is_fresh, is_stale, RoutingStrategy, ScoredCandidate, ScoringStrategy,
    StrategySet,
};
use crate::routing_contract::{NormalizedMessage, RoutingResult, Thread};
use crate::routing_error::RoutingEngineResult;

pub const DEFAULT_CONTEXT_MIN_SCORE: u32 = 3;
const CONFIDENCE_FLOOR: f64 = 0.4;
const CONFIDENCE_CEILING: f64 = 0.85;

pub(super) async fn evaluate(
    strategies: &StrategySet,
    message: &NormalizedMessage,
    organization_id: &str,
) -> RoutingEngineResult<Option<RoutingResult>> {
    if message.text.trim().is_empty() {
        return Ok(None);
    }
    strategies
        .score_recent_threads(
            strategies.context_scorer.as_ref(),
            RoutingStrategy::Context,
            message,
            organization_id,
        )
        .await
}

/// Keyword-overlap scorer over recent thread activity.
#[derive(Debug, Clone, Copy)]
pub struct KeywordScorer {
    pub min_score: u32,
    pub max_keywords: usize,
}

impl Default for KeywordScorer {
    fn default() -> Self {
        Self {
            min_score: DEFAULT_CONTEXT_MIN_SCORE,
            max_keywords: DEFAULT_MAX_KEYWORDS,
        }
    }
}

impl KeywordScorer {
    pub fn score_thread(keywords: &[String], thread: &Thread, now: DateTime<Utc>) -> u32 {
        let last_message = thread.last_message_text().to_lowercase();
        let group_name = thread.group_name.as_deref().unwrap_or_default().to_lowercase();
        let mut score = 0_u32;
        for keyword in keywords {
            if last_message.contains(keyword.as_str()) {
                score += 2;
            }
            if group_name.contains(keyword.as_str()) {
                score += 1;
            }
        }
        if is_fresh(thread, now) {
            score += 1;
        }
        score
    }

    /// Maps the overlap ratio and winner recency into a confidence.
    pub fn confidence(
        best_score: u32,
        keyword_count: usize,
        thread: &Thread,
        now: DateTime<Utc>,
    ) -> f64 {
        let ceiling = (keyword_count * 2 + 1) as f64;
        let ratio = f64::from(best_score) / ceiling;
        let mut confidence: f64 = if ratio > 0.8 {
            0.75
        } else if ratio > 0.4 {
            0.6
        } else {
            0.5
        };
        if is_fresh(thread, now) {
            confidence += 0.05;
        } else if is_stale(thread, now) {
            confidence -= 0.1;
        }
        confidence.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING)
    }
}

impl ScoringStrategy for KeywordScorer {
    fn name(&self) -> &'static str {
        "keyword"
    }

    fn has_signal(&self, message: &NormalizedMessage) -> bool {
        !extract_keywords(&message.text, self.max_keywords).is_empty()
    }

    fn score(
        &self,
        message: &NormalizedMessage,
        candidates: &[Thread],
        now: DateTime<Utc>,
    ) -> Option<ScoredCandidate> {
        let keywords = extract_keywords(&message.text, self.max_keywords);
        if keywords.is_empty() {
            return None;
        }
        let (thread, score) = best_scored(
            candidates
                .iter()
                .map(|thread| (thread, Self::score_thread(&keywords, thread, now))),
            self.min_score,
        )?;
        Some(ScoredCandidate {
            thread_id: thread.id.clone(),
            score,
            confidence: Self::confidence(score, keywords.len(), thread, now),
            reason: format!("keyword overlap on [{}]", keywords.join(", ")),
        })
    }
}
