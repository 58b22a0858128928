use chrono::{DateTime, Utc};

use super::text_signals::AddressSignals;
use super::{
    best_scored, decay_for_staleness, RoutingStrategy, ScoredCandidate, ScoringStrategy,
    StrategySet,
};
use crate::routing_contract::{
    NormalizedMessage, RoutingMethod, RoutingResult, Thread, ThreadReference,
    PROJECT_ID_METADATA_KEY, PROPERTY_ID_METADATA_KEY,
};
use crate::routing_error::RoutingEngineResult;

pub const DEFAULT_METADATA_MIN_SCORE: u32 = 2;
const REFERENCE_MATCH_CONFIDENCE: f64 = 0.85;
const ADDRESS_MATCH_CONFIDENCE: f64 = 0.6;
const CONFIDENCE_FLOOR: f64 = 0.5;
const CONFIDENCE_CEILING: f64 = 0.95;

pub(super) async fn evaluate(
    strategies: &StrategySet,
    message: &NormalizedMessage,
    organization_id: &str,
) -> RoutingEngineResult<Option<RoutingResult>> {
    for reference in message_references(message) {
        let matched = strategies
            .threads
            .threads_by_reference(organization_id, &reference, 1)
            .await?;
        if let Some(thread) = matched.into_iter().next() {
            let now = strategies.clock.now();
            let confidence = decay_for_staleness(REFERENCE_MATCH_CONFIDENCE, &thread, now)
                .max(CONFIDENCE_FLOOR);
            return Ok(Some(RoutingResult::new(
                thread.id,
                confidence,
                RoutingMethod::Metadata,
                format!(
                    "{} '{}' matched thread metadata",
                    reference.field_name(),
                    reference.value()
                ),
            )));
        }
        tracing::debug!(
            message_id = %message.id,
            field = reference.field_name(),
            value = reference.value(),
            "thread reference matched no thread"
        );
    }

    strategies
        .score_recent_threads(
            strategies.metadata_scorer.as_ref(),
            RoutingStrategy::Metadata,
            message,
            organization_id,
        )
        .await
}

fn message_references(message: &NormalizedMessage) -> Vec<ThreadReference> {
    let mut references = Vec::new();
    if let Some(property_id) = message.metadata_text(PROPERTY_ID_METADATA_KEY) {
        references.push(ThreadReference::Property(property_id));
    }
    if let Some(project_id) = message.metadata_text(PROJECT_ID_METADATA_KEY) {
        references.push(ThreadReference::Project(project_id));
    }
    references
}

/// Scores threads against street, city, and state tokens in the message text.
#[derive(Debug, Clone, Copy)]
pub struct AddressScorer {
    pub min_score: u32,
}

impl Default for AddressScorer {
    fn default() -> Self {
        Self {
            min_score: DEFAULT_METADATA_MIN_SCORE,
        }
    }
}

impl AddressScorer {
    pub fn score_thread(signals: &AddressSignals, thread: &Thread) -> u32 {
        let mut score = 0;
        if thread
            .metadata
            .address
            .as_deref()
            .is_some_and(|address| signals.mentioned_in(address))
        {
            score += 3;
        }
        if thread
            .metadata
            .city
            .as_deref()
            .is_some_and(|city| signals.matches_city(city))
        {
            score += 2;
        }
        if thread
            .metadata
            .state
            .as_deref()
            .is_some_and(|state| signals.matches_state(state))
        {
            score += 1;
        }
        if thread
            .group_name
            .as_deref()
            .is_some_and(|group_name| signals.mentioned_in(group_name))
        {
            score += 1;
        }
        if signals.mentioned_in(thread.last_message_text()) {
            score += 1;
        }
        score
    }
}

impl ScoringStrategy for AddressScorer {
    fn name(&self) -> &'static str {
        "address"
    }

    fn has_signal(&self, message: &NormalizedMessage) -> bool {
        !AddressSignals::extract(&message.text).is_empty()
    }

    fn score(
        &self,
        message: &NormalizedMessage,
        candidates: &[Thread],
        now: DateTime<Utc>,
    ) -> Option<ScoredCandidate> {
        let signals = AddressSignals::extract(&message.text);
        if signals.is_empty() {
            return None;
        }
        let (thread, score) = best_scored(
            candidates
                .iter()
                .map(|thread| (thread, Self::score_thread(&signals, thread))),
            self.min_score,
        )?;
        let confidence = decay_for_staleness(ADDRESS_MATCH_CONFIDENCE, thread, now)
            .clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING);
        Some(ScoredCandidate {
            thread_id: thread.id.clone(),
            score,
            confidence,
            reason: format!(
                "address signals matched thread metadata ({} keyword(s))",
                signals.keyword_count()
            ),
        })
    }
}
