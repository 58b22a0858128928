//! Routing strategies evaluated in fixed priority order.
//!
//! Strategies are read-only with respect to thread state. The text-driven
//! strategies delegate candidate scoring to a [`ScoringStrategy`] so the
//! heuristics can be swapped without touching the orchestrator.

mod context_strategy;
mod identity_strategy;
mod metadata_strategy;
pub mod text_signals;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::clock::RoutingClock;
use crate::identity_resolver::IdentityResolver;
use crate::routing_contract::{NormalizedMessage, RoutingMethod, RoutingResult, Thread};
use crate::routing_error::RoutingEngineResult;
use crate::routing_store::ThreadStore;

pub use context_strategy::{KeywordScorer, DEFAULT_CONTEXT_MIN_SCORE};
pub use metadata_strategy::{AddressScorer, DEFAULT_METADATA_MIN_SCORE};

pub const DEFAULT_CANDIDATE_THREAD_LIMIT: usize = 100;
pub const FRESH_THREAD_DAYS: i64 = 7;
pub const STALE_THREAD_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingStrategy {
    Identity,
    Metadata,
    Context,
}

/// Evaluation order; the first strategy to produce a result wins.
pub const ROUTING_STRATEGY_PRIORITY: [RoutingStrategy; 3] = [
    RoutingStrategy::Identity,
    RoutingStrategy::Metadata,
    RoutingStrategy::Context,
];

impl RoutingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Metadata => "metadata",
            Self::Context => "context",
        }
    }

    pub fn method(self) -> RoutingMethod {
        match self {
            Self::Identity => RoutingMethod::Identity,
            Self::Metadata => RoutingMethod::Metadata,
            Self::Context => RoutingMethod::Context,
        }
    }
}

/// Best candidate picked by a [`ScoringStrategy`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub thread_id: String,
    pub score: u32,
    pub confidence: f64,
    pub reason: String,
}

/// Trait contract for pluggable thread-scoring heuristics.
pub trait ScoringStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// False when the message carries nothing to score on; candidates are
    /// not fetched in that case.
    fn has_signal(&self, message: &NormalizedMessage) -> bool;

    fn score(
        &self,
        message: &NormalizedMessage,
        candidates: &[Thread],
        now: DateTime<Utc>,
    ) -> Option<ScoredCandidate>;
}

/// Collaborators and tuning shared by every strategy.
#[derive(Clone)]
pub struct StrategySet {
    resolver: Arc<IdentityResolver>,
    threads: Arc<dyn ThreadStore>,
    clock: Arc<dyn RoutingClock>,
    candidate_limit: usize,
    metadata_scorer: Arc<dyn ScoringStrategy>,
    context_scorer: Arc<dyn ScoringStrategy>,
}

impl StrategySet {
    pub fn new(
        resolver: Arc<IdentityResolver>,
        threads: Arc<dyn ThreadStore>,
        clock: Arc<dyn RoutingClock>,
    ) -> Self {
        Self {
            resolver,
            threads,
            clock,
            candidate_limit: DEFAULT_CANDIDATE_THREAD_LIMIT,
            metadata_scorer: Arc::new(AddressScorer::default()),
            context_scorer: Arc::new(KeywordScorer::default()),
        }
    }

    pub fn with_candidate_limit(mut self, candidate_limit: usize) -> Self {
        self.candidate_limit = candidate_limit.max(1);
        self
    }

    pub fn with_metadata_scorer(mut self, scorer: Arc<dyn ScoringStrategy>) -> Self {
        self.metadata_scorer = scorer;
        self
    }

    pub fn with_context_scorer(mut self, scorer: Arc<dyn ScoringStrategy>) -> Self {
        self.context_scorer = scorer;
        self
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    pub async fn evaluate(
        &self,
        strategy: RoutingStrategy,
        message: &NormalizedMessage,
        organization_id: &str,
    ) -> RoutingEngineResult<Option<RoutingResult>> {
        let outcome = match strategy {
            RoutingStrategy::Identity => {
                identity_strategy::evaluate(self, message, organization_id).await?
            }
            RoutingStrategy::Metadata => {
                metadata_strategy::evaluate(self, message, organization_id).await?
            }
            RoutingStrategy::Context => {
                context_strategy::evaluate(self, message, organization_id).await?
            }
        };
        tracing::debug!(
            strategy = strategy.as_str(),
            message_id = %message.id,
            thread_id = outcome.as_ref().map(|result| result.thread_id.as_str()),
            confidence = outcome.as_ref().map(|result| result.confidence),
            "routing strategy evaluated"
        );
        Ok(outcome)
    }

    async fn score_recent_threads(
        &self,
        scorer: &dyn ScoringStrategy,
        strategy: RoutingStrategy,
        message: &NormalizedMessage,
        organization_id: &str,
    ) -> RoutingEngineResult<Option<RoutingResult>> {
        if !scorer.has_signal(message) {
            return Ok(None);
        }
        let candidates = self
            .threads
            .recent_threads(organization_id, self.candidate_limit)
            .await?;
        let now = self.clock.now();
        Ok(scorer
            .score(message, &candidates, now)
            .map(|candidate| {
                RoutingResult::new(
                    candidate.thread_id,
                    candidate.confidence,
                    strategy.method(),
                    format!("{} (score {})", candidate.reason, candidate.score),
                )
            }))
    }
}

pub(crate) fn thread_age(thread: &Thread, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(thread.updated_at)
        .max(Duration::zero())
}

pub(crate) fn is_fresh(thread: &Thread, now: DateTime<Utc>) -> bool {
    thread_age(thread, now) <= Duration::days(FRESH_THREAD_DAYS)
}

pub(crate) fn is_stale(thread: &Thread, now: DateTime<Utc>) -> bool {
    thread_age(thread, now) > Duration::days(STALE_THREAD_DAYS)
}

/// Applies the shared staleness decay: x0.9 past a week, x0.8 past a month.
pub(crate) fn decay_for_staleness(confidence: f64, thread: &Thread, now: DateTime<Utc>) -> f64 {
    if is_stale(thread, now) {
        confidence * 0.8
    } else if !is_fresh(thread, now) {
        confidence * 0.9
    } else {
        confidence
    }
}

/// Picks the best-scoring qualifier; equal scores go to the most recently
/// updated thread.
pub(crate) fn best_scored<'a>(
    scored: impl IntoIterator<Item = (&'a Thread, u32)>,
    min_score: u32,
) -> Option<(&'a Thread, u32)> {
    scored
        .into_iter()
        .filter(|(_, score)| *score >= min_score)
        .fold(None, |best: Option<(&'a Thread, u32)>, (thread, score)| match best {
            Some((current, current_score))
                if current_score > score
                    || (current_score == score && current.updated_at >= thread.updated_at) =>
            {
                Some((current, current_score))
            }
            _ => Some((thread, score)),
        })
}
