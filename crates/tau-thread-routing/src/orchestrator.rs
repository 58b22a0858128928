//! Multi-strategy routing of inbound messages to threads.
//!
//! Strategies run in [`ROUTING_STRATEGY_PRIORITY`] order and the first result
//! wins. Every call to [`RoutingOrchestrator::route_message`],
//! [`RoutingOrchestrator::create_thread_for_message`] or
//! [`RoutingOrchestrator::process_inbound_message`] writes exactly one
//! decision to the [`DecisionLog`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::clock::{mint_routing_id, RoutingClock};
use crate::decision_log::DecisionLog;
use crate::identity_resolver::SenderIdentity;
use crate::retry_sweeper::{PendingRetryRecord, RetryPolicy};
use crate::routing_contract::{
    validate_normalized_message, NormalizedMessage, RoutingDecision, RoutingMethod, RoutingResult,
    Thread, ThreadLastMessage, ThreadMetadata, PROJECT_ID_METADATA_KEY, PROPERTY_ID_METADATA_KEY,
};
use crate::routing_error::{RoutingEngineResult, ThreadRoutingError};
use crate::routing_store::{PendingRetryStore, ThreadStore};
use crate::strategies::{RoutingStrategy, StrategySet, ROUTING_STRATEGY_PRIORITY};

pub const THREAD_ID_PREFIX: &str = "thread";
const CREATED_THREAD_CONFIDENCE: f64 = 1.0;
const NO_MATCH_REASON: &str = "no routing strategy matched";

/// Progress of one routing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingPhase {
    NotStarted,
    IdentityAttempted,
    MetadataAttempted,
    ContextAttempted,
    Resolved,
    Unresolved,
}

impl RoutingPhase {
    pub fn attempted(strategy: RoutingStrategy) -> Self {
        match strategy {
            RoutingStrategy::Identity => Self::IdentityAttempted,
            RoutingStrategy::Metadata => Self::MetadataAttempted,
            RoutingStrategy::Context => Self::ContextAttempted,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::IdentityAttempted)
                | (Self::IdentityAttempted, Self::MetadataAttempted)
                | (Self::IdentityAttempted, Self::Resolved)
                | (Self::MetadataAttempted, Self::ContextAttempted)
                | (Self::MetadataAttempted, Self::Resolved)
                | (Self::ContextAttempted, Self::Resolved)
                | (Self::ContextAttempted, Self::Unresolved)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Unresolved)
    }

    fn advance(self, next: Self) -> Self {
        debug_assert!(
            self.can_transition_to(next),
            "invalid routing phase transition {self:?} -> {next:?}"
        );
        next
    }
}

/// What the adapter-facing pipeline did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    Routed(RoutingResult),
    Created(RoutingResult),
    Pending { record_id: String, reason: String },
}

pub struct RoutingOrchestrator {
    strategies: StrategySet,
    threads: Arc<dyn ThreadStore>,
    pending: Arc<dyn PendingRetryStore>,
    decisions: DecisionLog,
    clock: Arc<dyn RoutingClock>,
    retry_policy: RetryPolicy,
    create_thread_on_miss: bool,
    creation_guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RoutingOrchestrator {
    pub fn new(
        strategies: StrategySet,
        threads: Arc<dyn ThreadStore>,
        pending: Arc<dyn PendingRetryStore>,
        decisions: DecisionLog,
        clock: Arc<dyn RoutingClock>,
    ) -> Self {
        Self {
            strategies,
            threads,
            pending,
            decisions,
            clock,
            retry_policy: RetryPolicy::default(),
            create_thread_on_miss: true,
            creation_guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_create_thread_on_miss(mut self, create_thread_on_miss: bool) -> Self {
        self.create_thread_on_miss = create_thread_on_miss;
        self
    }

    /// Places `message` in an existing thread. A miss is `Ok(None)`.
    ///
    /// Strategy failures are logged and treated as a miss for that strategy
    /// only. Failing to attach the message to the chosen thread is systemic
    /// and propagates.
    #[tracing::instrument(
        name = "tau_thread_routing.route",
        skip(self, message),
        fields(message_id = %message.id, channel = message.channel.as_str())
    )]
    pub async fn route_message(
        &self,
        message: &NormalizedMessage,
        organization_id: &str,
    ) -> RoutingEngineResult<Option<RoutingResult>> {
        validate_normalized_message(message)?;
        let organization_id = require_organization(organization_id)?;

        match self.run_strategies(message, organization_id).await {
            Ok(Some(result)) => {
                self.record_resolved(message, organization_id, &result)
                    .await;
                Ok(Some(result))
            }
            Ok(None) => {
                self.record_unresolved(message, organization_id, NO_MATCH_REASON)
                    .await;
                Ok(None)
            }
            Err(error) => {
                self.record_unresolved(
                    message,
                    organization_id,
                    format!("routing failed: {error}"),
                )
                .await;
                Err(error)
            }
        }
    }

    /// Creates a single-participant thread for the sender, minting a user id
    /// when the sender is unknown.
    ///
    /// Creation is serialized per (organization, sender) within the process.
    /// A caller that waited on another creator for the same sender reuses the
    /// thread that creator made.
    #[tracing::instrument(
        name = "tau_thread_routing.create_thread",
        skip(self, message),
        fields(message_id = %message.id)
    )]
    pub async fn create_thread_for_message(
        &self,
        message: &NormalizedMessage,
        organization_id: &str,
    ) -> RoutingEngineResult<RoutingResult> {
        validate_normalized_message(message)?;
        let organization_id = require_organization(organization_id)?;

        match self
            .create_thread_serialized(message, organization_id)
            .await
        {
            Ok(result) => {
                self.record_resolved(message, organization_id, &result)
                    .await;
                Ok(result)
            }
            Err(error) => {
                self.record_unresolved(
                    message,
                    organization_id,
                    format!("thread creation failed: {error}"),
                )
                .await;
                Err(error)
            }
        }
    }

    /// Adapter-facing pipeline: route, then create on miss when enabled, and
    /// queue for retry otherwise. Routing and creation failures are queued;
    /// only caller-input errors and a failed queue write are returned.
    ///
    /// Writes one decision for the final outcome: routed, created or queued.
    pub async fn process_inbound_message(
        &self,
        message: &NormalizedMessage,
        organization_id: &str,
    ) -> RoutingEngineResult<InboundOutcome> {
        validate_normalized_message(message)?;
        let organization_id = require_organization(organization_id)?;

        let failure = match self.run_strategies(message, organization_id).await {
            Ok(Some(result)) => {
                self.record_resolved(message, organization_id, &result)
                    .await;
                return Ok(InboundOutcome::Routed(result));
            }
            Ok(None) if self.create_thread_on_miss => {
                match self
                    .create_thread_serialized(message, organization_id)
                    .await
                {
                    Ok(result) => {
                        self.record_resolved(message, organization_id, &result)
                            .await;
                        return Ok(InboundOutcome::Created(result));
                    }
                    Err(error) => format!("thread creation failed: {error}"),
                }
            }
            Ok(None) => NO_MATCH_REASON.to_string(),
            Err(error) => format!("routing failed: {error}"),
        };
        self.enqueue_pending(message, organization_id, failure)
            .await
    }

    async fn run_strategies(
        &self,
        message: &NormalizedMessage,
        organization_id: &str,
    ) -> RoutingEngineResult<Option<RoutingResult>> {
        let mut phase = RoutingPhase::NotStarted;
        for strategy in ROUTING_STRATEGY_PRIORITY {
            phase = phase.advance(RoutingPhase::attempted(strategy));
            let outcome = match self
                .strategies
                .evaluate(strategy, message, organization_id)
                .await
            {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::warn!(
                        strategy = strategy.as_str(),
                        error = %error,
                        "routing strategy failed; treating as no match"
                    );
                    None
                }
            };
            let Some(result) = outcome else {
                continue;
            };

            let now = self.clock.now();
            if let Err(error) =
                attach_message_to_thread(self.threads.as_ref(), &result.thread_id, message, now)
                    .await
            {
                tracing::warn!(
                    strategy = strategy.as_str(),
                    thread_id = %result.thread_id,
                    error = %error,
                    "matched thread but attach failed"
                );
                return Err(error);
            }
            phase = phase.advance(RoutingPhase::Resolved);
            tracing::debug!(
                ?phase,
                thread_id = %result.thread_id,
                method = result.method.as_str(),
                confidence = result.confidence,
                "message routed"
            );
            return Ok(Some(result));
        }

        phase = phase.advance(RoutingPhase::Unresolved);
        tracing::debug!(?phase, "message unresolved");
        Ok(None)
    }

    async fn create_thread_serialized(
        &self,
        message: &NormalizedMessage,
        organization_id: &str,
    ) -> RoutingEngineResult<RoutingResult> {
        let requested_at = self.clock.now();
        let guard_key = format!("{organization_id}\u{1f}{}", message.sender_identifier.trim());
        let guard = self.creation_guard(&guard_key);
        let outcome = {
            let _held = guard.lock().await;
            self.create_thread_guarded(message, organization_id, requested_at)
                .await
        };
        self.release_creation_guard(&guard_key, guard);
        outcome
    }

    async fn create_thread_guarded(
        &self,
        message: &NormalizedMessage,
        organization_id: &str,
        requested_at: DateTime<Utc>,
    ) -> RoutingEngineResult<RoutingResult> {
        let sender = self
            .strategies
            .resolver()
            .resolve_or_mint_sender(message, organization_id)
            .await?;
        if let Some(thread) = self
            .concurrently_created_thread(&sender, organization_id, requested_at)
            .await?
        {
            let now = self.clock.now();
            attach_message_to_thread(self.threads.as_ref(), &thread.id, message, now).await?;
            return Ok(RoutingResult::new(
                thread.id,
                CREATED_THREAD_CONFIDENCE,
                RoutingMethod::Created,
                format!(
                    "reused thread created concurrently for user '{}'",
                    sender.user_id
                ),
            ));
        }

        let now = self.clock.now();
        let thread = Thread {
            id: mint_routing_id(THREAD_ID_PREFIX, now),
            organization_id: organization_id.to_string(),
            participants: vec![sender.user_id.clone()],
            channel_sources: vec![message.channel],
            created_at: now,
            updated_at: now,
            last_message: Some(ThreadLastMessage::from_message(message)),
            group_name: None,
            property_id: message.metadata_text(PROPERTY_ID_METADATA_KEY),
            project_id: message.metadata_text(PROJECT_ID_METADATA_KEY),
            metadata: ThreadMetadata::default(),
        };
        let thread_id = thread.id.clone();
        self.threads.create_thread(thread).await?;
        self.threads
            .append_message(&thread_id, message.clone(), now)
            .await?;

        let reason = if sender.minted {
            format!("created thread for new sender; minted user '{}'", sender.user_id)
        } else {
            format!("created thread for known user '{}'", sender.user_id)
        };
        tracing::info!(
            thread_id = %thread_id,
            user_id = %sender.user_id,
            minted = sender.minted,
            channel = message.channel.as_str(),
            "thread created for message"
        );
        Ok(RoutingResult::new(
            thread_id,
            CREATED_THREAD_CONFIDENCE,
            RoutingMethod::Created,
            reason,
        ))
    }

    async fn record_resolved(
        &self,
        message: &NormalizedMessage,
        organization_id: &str,
        result: &RoutingResult,
    ) {
        self.decisions
            .record(RoutingDecision::resolved(
                message,
                organization_id,
                result,
                self.clock.now(),
            ))
            .await;
    }

    async fn record_unresolved(
        &self,
        message: &NormalizedMessage,
        organization_id: &str,
        reason: impl Into<String>,
    ) {
        self.decisions
            .record(RoutingDecision::unresolved(
                message,
                organization_id,
                reason,
                self.clock.now(),
            ))
            .await;
    }

    async fn concurrently_created_thread(
        &self,
        sender: &SenderIdentity,
        organization_id: &str,
        requested_at: DateTime<Utc>,
    ) -> RoutingEngineResult<Option<Thread>> {
        if sender.minted {
            return Ok(None);
        }
        let threads = self
            .threads
            .threads_for_participant(organization_id, &sender.user_id, 1)
            .await?;
        Ok(threads
            .into_iter()
            .next()
            .filter(|thread| thread.created_at >= requested_at))
    }

    async fn enqueue_pending(
        &self,
        message: &NormalizedMessage,
        organization_id: &str,
        failure: String,
    ) -> RoutingEngineResult<InboundOutcome> {
        let record = PendingRetryRecord::first_failure(
            message,
            organization_id,
            failure.clone(),
            &self.retry_policy,
            self.clock.now(),
        );
        let record_id = record.id.clone();
        let inserted = match self.pending.insert_pending(record).await {
            Ok(inserted) => inserted,
            Err(error) => {
                let reason = format!("{failure}; retry queue write failed: {error}");
                self.record_unresolved(message, organization_id, reason)
                    .await;
                return Err(error);
            }
        };
        let reason = format!("{failure}; queued for retry");
        self.record_unresolved(message, organization_id, reason)
            .await;
        tracing::info!(
            record_id = %record_id,
            organization_id,
            already_queued = !inserted,
            reason = %failure,
            "message queued for routing retry"
        );
        Ok(InboundOutcome::Pending {
            record_id,
            reason: failure,
        })
    }

    fn creation_guard(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.creation_guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn release_creation_guard(&self, key: &str, guard: Arc<tokio::sync::Mutex<()>>) {
        let mut guards = self
            .creation_guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);
        if guards
            .get(key)
            .is_some_and(|existing| Arc::strong_count(existing) == 1)
        {
            guards.remove(key);
        }
    }
}

/// Tags the thread with the message channel and persists the message under it.
pub(crate) async fn attach_message_to_thread(
    threads: &dyn ThreadStore,
    thread_id: &str,
    message: &NormalizedMessage,
    now: DateTime<Utc>,
) -> RoutingEngineResult<()> {
    threads.add_channel_source(thread_id, message.channel).await?;
    threads
        .append_message(thread_id, message.clone(), now)
        .await
}

fn require_organization(organization_id: &str) -> RoutingEngineResult<&str> {
    let trimmed = organization_id.trim();
    if trimmed.is_empty() {
        return Err(ThreadRoutingError::InvalidOrganization(
            organization_id.to_string(),
        ));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::clock::ManualClock;
    use crate::decision_log::DecisionFilter;
    use crate::identity_cache::TtlIdentityCache;
    use crate::identity_link::{ExternalIdentity, ExternalIdentityType, IdentityLink};
    use crate::identity_resolver::IdentityResolver;
    use crate::routing_contract::{DecisionMethod, DeliveryStatus, MessageChannel, MessageDirection};
    use crate::routing_store::{IdentityLinkStore, InMemoryRoutingStore};

    struct OfflineLinkStore;

    #[async_trait]
    impl IdentityLinkStore for OfflineLinkStore {
        async fn list_identity_links(
            &self,
            _organization_id: &str,
        ) -> RoutingEngineResult<Vec<IdentityLink>> {
            Err(ThreadRoutingError::StoreUnavailable("links offline".to_string()))
        }

        async fn list_all_identity_links(&self) -> RoutingEngineResult<Vec<IdentityLink>> {
            Err(ThreadRoutingError::StoreUnavailable("links offline".to_string()))
        }

        async fn get_identity_link(
            &self,
            _link_id: &str,
        ) -> RoutingEngineResult<Option<IdentityLink>> {
            Err(ThreadRoutingError::StoreUnavailable("links offline".to_string()))
        }

        async fn put_identity_link(&self, _link: IdentityLink) -> RoutingEngineResult<()> {
            Err(ThreadRoutingError::StoreUnavailable("links offline".to_string()))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, 9, 30, 0).unwrap()
    }

    fn message(id: &str, sender: &str, text: &str) -> NormalizedMessage {
        NormalizedMessage {
            id: id.to_string(),
            thread_id: String::new(),
            channel: MessageChannel::Sms,
            direction: MessageDirection::Incoming,
            sender_identifier: sender.to_string(),
            recipient_identifier: String::new(),
            text: text.to_string(),
            timestamp: now(),
            delivery_status: DeliveryStatus::Delivered,
            channel_metadata: BTreeMap::new(),
        }
    }

    fn thread(id: &str, participant: &str, age: Duration, last_message: Option<&str>) -> Thread {
        let updated_at = now() - age;
        Thread {
            id: id.to_string(),
            organization_id: "org-1".to_string(),
            participants: vec![participant.to_string()],
            channel_sources: vec![MessageChannel::Email],
            created_at: updated_at,
            updated_at,
            last_message: last_message.map(|text| ThreadLastMessage {
                text: text.to_string(),
                sender_identifier: "staff".to_string(),
                channel: MessageChannel::Email,
                timestamp: updated_at,
            }),
            group_name: None,
            property_id: None,
            project_id: None,
            metadata: ThreadMetadata::default(),
        }
    }

    struct Fixture {
        store: Arc<InMemoryRoutingStore>,
        resolver: Arc<IdentityResolver>,
        orchestrator: RoutingOrchestrator,
    }

    fn fixture_with_links(links: Option<Arc<dyn IdentityLinkStore>>) -> Fixture {
        let store = Arc::new(InMemoryRoutingStore::new());
        let clock = Arc::new(ManualClock::new(now()));
        let links = links.unwrap_or_else(|| store.clone() as Arc<dyn IdentityLinkStore>);
        let resolver = Arc::new(IdentityResolver::new(
            links,
            Arc::new(TtlIdentityCache::new(clock.clone())),
            clock.clone(),
        ));
        let strategies = StrategySet::new(resolver.clone(), store.clone(), clock.clone());
        let orchestrator = RoutingOrchestrator::new(
            strategies,
            store.clone(),
            store.clone(),
            DecisionLog::new(store.clone()),
            clock,
        );
        Fixture {
            store,
            resolver,
            orchestrator,
        }
    }

    async fn link_phone(fixture: &Fixture, user_id: &str, phone: &str) {
        fixture
            .resolver
            .add_external_identity(
                user_id,
                ExternalIdentity::unverified(ExternalIdentityType::Phone, phone),
                "org-1",
            )
            .await
            .expect("link");
    }

    async fn decisions_for(fixture: &Fixture, message_id: &str) -> Vec<RoutingDecision> {
        DecisionLog::new(fixture.store.clone())
            .query(DecisionFilter::Organization("org-1".to_string()), Some(500), None)
            .await
            .expect("decisions")
            .decisions
            .into_iter()
            .filter(|decision| decision.message_id == message_id)
            .collect()
    }

    #[test]
    fn unit_phase_transitions_follow_priority_order() {
        assert!(RoutingPhase::NotStarted.can_transition_to(RoutingPhase::IdentityAttempted));
        assert!(RoutingPhase::IdentityAttempted.can_transition_to(RoutingPhase::Resolved));
        assert!(RoutingPhase::ContextAttempted.can_transition_to(RoutingPhase::Unresolved));
        assert!(!RoutingPhase::NotStarted.can_transition_to(RoutingPhase::ContextAttempted));
        assert!(!RoutingPhase::IdentityAttempted.can_transition_to(RoutingPhase::Unresolved));
        assert!(!RoutingPhase::Resolved.can_transition_to(RoutingPhase::IdentityAttempted));
        assert!(RoutingPhase::Unresolved.is_terminal());
    }

    #[tokio::test]
    async fn functional_known_sender_routes_by_identity_and_tags_channel() {
        let fixture = fixture_with_links(None);
        link_phone(&fixture, "u1", "+15551234567").await;
        fixture
            .store
            .create_thread(thread("t1", "u1", Duration::hours(2), None))
            .await
            .expect("thread");

        let result = fixture
            .orchestrator
            .route_message(&message("m1", "+15551234567", "ok"), "org-1")
            .await
            .expect("route")
            .expect("routed");
        assert_eq!(result.thread_id, "t1");
        assert_eq!(result.confidence, 0.9);
        assert_eq!(result.method, RoutingMethod::Identity);

        let stored = fixture.store.get_thread("t1").await.expect("get").expect("thread");
        assert_eq!(
            stored.channel_sources,
            vec![MessageChannel::Email, MessageChannel::Sms]
        );
        assert_eq!(stored.last_message_text(), "ok");
        assert_eq!(decisions_for(&fixture, "m1").await.len(), 1);

        fixture
            .orchestrator
            .route_message(&message("m2", "+15551234567", "again"), "org-1")
            .await
            .expect("route")
            .expect("routed");
        let stored = fixture.store.get_thread("t1").await.expect("get").expect("thread");
        assert_eq!(stored.channel_sources.len(), 2);
    }

    #[tokio::test]
    async fn functional_identity_beats_context_on_different_threads() {
        let fixture = fixture_with_links(None);
        link_phone(&fixture, "u1", "+15551234567").await;
        fixture
            .store
            .create_thread(thread("t-identity", "u1", Duration::days(20), None))
            .await
            .expect("identity thread");
        fixture
            .store
            .create_thread(thread(
                "t-context",
                "u2",
                Duration::hours(1),
                Some("garage door opener repair"),
            ))
            .await
            .expect("context thread");

        let result = fixture
            .orchestrator
            .route_message(
                &message("m1", "+15551234567", "garage door opener still broken"),
                "org-1",
            )
            .await
            .expect("route")
            .expect("routed");
        assert_eq!(result.thread_id, "t-identity");
        assert_eq!(result.method, RoutingMethod::Identity);
        assert_eq!(result.confidence, 0.7);
    }

    #[tokio::test]
    async fn regression_strategy_failure_falls_through_to_next_strategy() {
        let fixture = fixture_with_links(Some(Arc::new(OfflineLinkStore)));
        fixture
            .store
            .create_thread(thread(
                "t-context",
                "u2",
                Duration::hours(1),
                Some("garage door opener repair"),
            ))
            .await
            .expect("context thread");
        let result = fixture
            .orchestrator
            .route_message(
                &message("m1", "+15551234567", "garage door opener still broken"),
                "org-1",
            )
            .await
            .expect("route")
            .expect("routed");
        assert_eq!(result.thread_id, "t-context");
        assert_eq!(result.method, RoutingMethod::Context);
    }

    #[tokio::test]
    async fn functional_miss_logs_one_manual_decision_and_creates_nothing() {
        let fixture = fixture_with_links(None);
        let outcome = fixture
            .orchestrator
            .route_message(&message("m1", "+15559999999", "hello"), "org-1")
            .await
            .expect("route");
        assert!(outcome.is_none());
        let decisions = decisions_for(&fixture, "m1").await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].method, DecisionMethod::Manual);
        assert_eq!(decisions[0].thread_id, None);
        assert!(fixture
            .store
            .recent_threads("org-1", 10)
            .await
            .expect("threads")
            .is_empty());
    }

    #[tokio::test]
    async fn functional_create_thread_mints_and_links_sender() {
        let fixture = fixture_with_links(None);
        let inbound = message("m1", "+15559999999", "hello");
        let result = fixture
            .orchestrator
            .create_thread_for_message(&inbound, "org-1")
            .await
            .expect("create");
        assert_eq!(result.method, RoutingMethod::Created);
        assert_eq!(result.confidence, 1.0);

        let created = fixture
            .store
            .get_thread(&result.thread_id)
            .await
            .expect("get")
            .expect("thread");
        assert_eq!(created.channel_sources, vec![MessageChannel::Sms]);
        assert_eq!(created.participants.len(), 1);
        assert!(created.participants[0].starts_with("external-user-"));

        let next = fixture
            .orchestrator
            .route_message(&message("m2", "+15559999999", "follow up"), "org-1")
            .await
            .expect("route")
            .expect("routed");
        assert_eq!(next.thread_id, result.thread_id);
        assert_eq!(next.method, RoutingMethod::Identity);
    }

    #[tokio::test]
    async fn regression_concurrent_creation_for_one_sender_yields_one_thread() {
        let fixture = fixture_with_links(None);
        let first = message("m1", "+15559999999", "hello");
        let second = message("m2", "+15559999999", "hello again");
        let (left, right) = tokio::join!(
            fixture.orchestrator.create_thread_for_message(&first, "org-1"),
            fixture.orchestrator.create_thread_for_message(&second, "org-1"),
        );
        let left = left.expect("left");
        let right = right.expect("right");
        assert_eq!(left.thread_id, right.thread_id);
        assert_eq!(
            fixture
                .store
                .recent_threads("org-1", 10)
                .await
                .expect("threads")
                .len(),
            1
        );
        assert!(fixture
            .orchestrator
            .creation_guards
            .lock()
            .expect("guards")
            .is_empty());
    }

    #[tokio::test]
    async fn functional_process_inbound_creates_or_queues_on_miss() {
        let fixture = fixture_with_links(None);
        let outcome = fixture
            .orchestrator
            .process_inbound_message(&message("m1", "+15559999999", "hello"), "org-1")
            .await
            .expect("process");
        assert!(matches!(outcome, InboundOutcome::Created(_)));

        let queueing = fixture_with_links(None);
        let orchestrator = queueing.orchestrator.with_create_thread_on_miss(false);
        let outcome = orchestrator
            .process_inbound_message(&message("m2", "+15558888888", "hello"), "org-1")
            .await
            .expect("process");
        assert_eq!(
            outcome,
            InboundOutcome::Pending {
                record_id: "m2".to_string(),
                reason: NO_MATCH_REASON.to_string(),
            }
        );
        let record = queueing
            .store
            .get_pending("m2")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.next_eligible_at, now() + Duration::seconds(60));
    }

    #[tokio::test]
    async fn regression_pipeline_writes_one_decision_per_message() {
        let fixture = fixture_with_links(None);
        let created = fixture
            .orchestrator
            .process_inbound_message(&message("m1", "+15559999999", "hello"), "org-1")
            .await
            .expect("process");
        let InboundOutcome::Created(result) = created else {
            panic!("expected a created thread, got {created:?}");
        };
        let decisions = decisions_for(&fixture, "m1").await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].method, DecisionMethod::Manual);
        assert_eq!(decisions[0].thread_id.as_deref(), Some(result.thread_id.as_str()));
        assert_eq!(decisions[0].confidence, 1.0);

        fixture
            .orchestrator
            .process_inbound_message(&message("m2", "+15559999999", "again"), "org-1")
            .await
            .expect("process");
        let decisions = decisions_for(&fixture, "m2").await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].method, DecisionMethod::Identity);

        let queueing = fixture_with_links(None);
        let orchestrator = queueing.orchestrator.with_create_thread_on_miss(false);
        orchestrator
            .process_inbound_message(&message("m3", "+15558888888", "hello"), "org-1")
            .await
            .expect("process");
        let decisions = DecisionLog::new(queueing.store.clone())
            .query(DecisionFilter::Organization("org-1".to_string()), None, None)
            .await
            .expect("decisions")
            .decisions;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].message_id, "m3");
        assert_eq!(decisions[0].thread_id, None);
        assert!(decisions[0].reason.contains("queued for retry"));
    }

    #[tokio::test]
    async fn regression_invalid_message_is_rejected_before_routing() {
        let fixture = fixture_with_links(None);
        let error = fixture
            .orchestrator
            .process_inbound_message(&message("m1", "  ", "hello"), "org-1")
            .await
            .expect_err("invalid");
        assert!(error.is_validation());
        assert!(decisions_for(&fixture, "m1").await.is_empty());
    }
}
