//! Append-only routing decision log and its query surface.
//!
//! Writes are fire-and-forget: a store failure is logged and the decision is
//! dropped, so the log may lose entries during a store outage. Routing never
//! fails because of it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::routing_contract::RoutingDecision;
use crate::routing_error::{RoutingEngineResult, ThreadRoutingError};
use crate::routing_store::DecisionLogStore;

pub const DEFAULT_DECISION_QUERY_LIMIT: usize = 50;
pub const MAX_DECISION_QUERY_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Which decisions a query selects.
pub enum DecisionFilter {
    Organization(String),
    Sender {
        sender_identifier: String,
        organization_id: Option<String>,
    },
    Thread(String),
}

impl DecisionFilter {
    pub fn matches(&self, decision: &RoutingDecision) -> bool {
        match self {
            Self::Organization(organization_id) => decision.organization_id == *organization_id,
            Self::Sender {
                sender_identifier,
                organization_id,
            } => {
                decision.sender_identifier == *sender_identifier
                    && organization_id
                        .as_deref()
                        .map_or(true, |org| decision.organization_id == org)
            }
            Self::Thread(thread_id) => decision.thread_id.as_deref() == Some(thread_id.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionQuery {
    pub filter: DecisionFilter,
    pub limit: usize,
    /// Opaque continuation token from a previous [`DecisionPage`].
    pub cursor: Option<String>,
}

impl DecisionQuery {
    pub fn new(filter: DecisionFilter, limit: usize) -> Self {
        Self {
            filter,
            limit,
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Decodes the cursor into the store's entry sequence.
    pub fn cursor_sequence(&self) -> RoutingEngineResult<Option<u64>> {
        let Some(raw) = self.cursor.as_deref().map(str::trim) else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<u64>().map(Some).map_err(|_| {
            ThreadRoutingError::InvalidMessage(format!("invalid decision cursor '{raw}'"))
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionPage {
    pub decisions: Vec<RoutingDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Writer and reader over a [`DecisionLogStore`].
#[derive(Clone)]
pub struct DecisionLog {
    store: Arc<dyn DecisionLogStore>,
    default_limit: usize,
    max_limit: usize,
}

impl DecisionLog {
    pub fn new(store: Arc<dyn DecisionLogStore>) -> Self {
        Self::with_limits(
            store,
            DEFAULT_DECISION_QUERY_LIMIT,
            MAX_DECISION_QUERY_LIMIT,
        )
    }

    pub fn with_limits(
        store: Arc<dyn DecisionLogStore>,
        default_limit: usize,
        max_limit: usize,
    ) -> Self {
        let max_limit = max_limit.max(1);
        Self {
            store,
            default_limit: default_limit.clamp(1, max_limit),
            max_limit,
        }
    }

    /// Best-effort append; returns whether the store accepted the entry.
    pub async fn record(&self, decision: RoutingDecision) -> bool {
        let message_id = decision.message_id.clone();
        let method = decision.method;
        match self.store.append_decision(decision).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    message_id = %message_id,
                    method = method.as_str(),
                    error = %error,
                    "routing decision dropped: decision log write failed"
                );
                false
            }
        }
    }

    pub async fn by_organization(
        &self,
        organization_id: &str,
        limit: Option<usize>,
        cursor: Option<String>,
    ) -> RoutingEngineResult<DecisionPage> {
        self.query(
            DecisionFilter::Organization(organization_id.to_string()),
            limit,
            cursor,
        )
        .await
    }

    pub async fn by_sender(
        &self,
        sender_identifier: &str,
        organization_id: Option<&str>,
        limit: Option<usize>,
        cursor: Option<String>,
    ) -> RoutingEngineResult<DecisionPage> {
        self.query(
            DecisionFilter::Sender {
                sender_identifier: sender_identifier.trim().to_string(),
                organization_id: organization_id.map(str::to_string),
            },
            limit,
            cursor,
        )
        .await
    }

    pub async fn by_thread(
        &self,
        thread_id: &str,
        limit: Option<usize>,
        cursor: Option<String>,
    ) -> RoutingEngineResult<DecisionPage> {
        self.query(DecisionFilter::Thread(thread_id.to_string()), limit, cursor)
            .await
    }

    pub async fn query(
        &self,
        filter: DecisionFilter,
        limit: Option<usize>,
        cursor: Option<String>,
    ) -> RoutingEngineResult<DecisionPage> {
        let limit = self.effective_limit(limit);
        let query = DecisionQuery::new(filter, limit).with_cursor(cursor);
        self.store.query_decisions(&query).await
    }

    fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested
            .filter(|limit| *limit > 0)
            .unwrap_or(self.default_limit)
            .min(self.max_limit)
    }
}
