//! Wiring of resolver, strategies, orchestrator, sweeper, and manual desk over
//! one store backend.

use std::sync::Arc;

use crate::clock::RoutingClock;
use crate::decision_log::DecisionLog;
use crate::identity_cache::{IdentityCache, TtlIdentityCache};
use crate::identity_resolver::IdentityResolver;
use crate::manual_assignment::ManualAssignmentDesk;
use crate::orchestrator::RoutingOrchestrator;
use crate::retry_sweeper::RetrySweeper;
use crate::routing_config::RoutingEngineConfig;
use crate::routing_store::{
    DecisionLogStore, IdentityLinkStore, PendingRetryStore, ThreadStore, UnassignedMessageStore,
};
use crate::strategies::{AddressScorer, KeywordScorer, StrategySet};

/// A backend serving every store contract the engine needs.
pub trait RoutingStore:
    IdentityLinkStore + ThreadStore + DecisionLogStore + PendingRetryStore + UnassignedMessageStore
{
}

impl<T> RoutingStore for T where
    T: IdentityLinkStore
        + ThreadStore
        + DecisionLogStore
        + PendingRetryStore
        + UnassignedMessageStore
{
}

pub struct RoutingEngine {
    config: RoutingEngineConfig,
    resolver: Arc<IdentityResolver>,
    orchestrator: Arc<RoutingOrchestrator>,
    sweeper: Arc<RetrySweeper>,
    manual: ManualAssignmentDesk,
    decisions: DecisionLog,
}

impl RoutingEngine {
    pub fn new<S>(store: Arc<S>, clock: Arc<dyn RoutingClock>, config: RoutingEngineConfig) -> Self
    where
        S: RoutingStore + 'static,
    {
        let cache: Arc<dyn IdentityCache> = Arc::new(
            TtlIdentityCache::new(clock.clone())
                .with_max_entries(config.identity_cache_max_entries),
        );
        Self::with_cache(store, cache, clock, config)
    }

    pub fn with_cache<S>(
        store: Arc<S>,
        cache: Arc<dyn IdentityCache>,
        clock: Arc<dyn RoutingClock>,
        config: RoutingEngineConfig,
    ) -> Self
    where
        S: RoutingStore + 'static,
    {
        let resolver = Arc::new(
            IdentityResolver::new(store.clone(), cache, clock.clone())
                .with_cache_ttl(config.identity_cache_ttl()),
        );
        let decisions = DecisionLog::with_limits(
            store.clone(),
            config.decision_query_default_limit,
            config.decision_query_max_limit,
        );
        let strategies = StrategySet::new(resolver.clone(), store.clone(), clock.clone())
            .with_candidate_limit(config.candidate_thread_limit)
            .with_metadata_scorer(Arc::new(AddressScorer {
                min_score: config.metadata_min_score,
            }))
            .with_context_scorer(Arc::new(KeywordScorer {
                min_score: config.context_min_score,
                max_keywords: config.max_keywords,
            }));
        let orchestrator = Arc::new(
            RoutingOrchestrator::new(
                strategies,
                store.clone(),
                store.clone(),
                decisions.clone(),
                clock.clone(),
            )
            .with_retry_policy(config.retry_policy())
            .with_create_thread_on_miss(config.create_thread_on_miss),
        );
        let manual = ManualAssignmentDesk::new(
            store.clone(),
            store.clone(),
            decisions.clone(),
            clock.clone(),
        );
        let sweeper = Arc::new(RetrySweeper::new(
            orchestrator.clone(),
            store,
            manual.clone(),
            clock,
            config.retry_policy(),
        ));
        Self {
            config,
            resolver,
            orchestrator,
            sweeper,
            manual,
            decisions,
        }
    }

    pub fn config(&self) -> &RoutingEngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    pub fn orchestrator(&self) -> &Arc<RoutingOrchestrator> {
        &self.orchestrator
    }

    pub fn sweeper(&self) -> &Arc<RetrySweeper> {
        &self.sweeper
    }

    pub fn manual_assignment(&self) -> &ManualAssignmentDesk {
        &self.manual
    }

    pub fn decisions(&self) -> &DecisionLog {
        &self.decisions
    }
}
