use chrono::Duration;

use super::{thread_age, StrategySet};
use crate::clock::age_in_days;
use crate::routing_contract::{NormalizedMessage, RoutingMethod, RoutingResult};
use crate::routing_error::RoutingEngineResult;

/// Sender's most recent thread, with confidence stepping down by recency.
pub(super) async fn evaluate(
    strategies: &StrategySet,
    message: &NormalizedMessage,
    organization_id: &str,
) -> RoutingEngineResult<Option<RoutingResult>> {
    let Some(user_id) = strategies
        .resolver
        .lookup(&message.sender_identifier, organization_id)
        .await?
    else {
        return Ok(None);
    };
    let threads = strategies
        .threads
        .threads_for_participant(organization_id, &user_id, 1)
        .await?;
    let Some(thread) = threads.into_iter().next() else {
        return Ok(None);
    };

    let now = strategies.clock.now();
    let confidence = identity_confidence(thread_age(&thread, now));
    let days = age_in_days(thread.updated_at, now);
    Ok(Some(RoutingResult::new(
        thread.id,
        confidence,
        RoutingMethod::Identity,
        format!(
            "sender resolved to user '{user_id}'; most recent thread updated {days} day(s) ago"
        ),
    )))
}

pub(super) fn identity_confidence(age: Duration) -> f64 {
    if age <= Duration::days(7) {
        0.9
    } else if age <= Duration::days(30) {
        0.7
    } else {
        0.5
    }
}
