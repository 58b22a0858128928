//! Operator-facing records for messages no strategy could place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{mint_routing_id, RoutingClock};
use crate::decision_log::DecisionLog;
use crate::orchestrator::attach_message_to_thread;
use crate::routing_contract::{
    validate_normalized_message, NormalizedMessage, RoutingDecision, RoutingMethod, RoutingResult,
};
use crate::routing_error::{RoutingEngineResult, ThreadRoutingError};
use crate::routing_store::{ThreadStore, UnassignedMessageStore};

pub const UNASSIGNED_MESSAGE_ID_PREFIX: &str = "unassigned";
const MANUAL_ASSIGNMENT_CONFIDENCE: f64 = 1.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedStatus {
    Pending,
    Assigned,
}

impl UnassignedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnassignedMessage {
    pub id: String,
    pub message: NormalizedMessage,
    pub organization_id: String,
    pub reason: String,
    pub status: UnassignedStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
}

/// Creates, lists, and resolves [`UnassignedMessage`] records.
#[derive(Clone)]
pub struct ManualAssignmentDesk {
    unassigned: Arc<dyn UnassignedMessageStore>,
    threads: Arc<dyn ThreadStore>,
    decisions: DecisionLog,
    clock: Arc<dyn RoutingClock>,
}

impl ManualAssignmentDesk {
    pub fn new(
        unassigned: Arc<dyn UnassignedMessageStore>,
        threads: Arc<dyn ThreadStore>,
        decisions: DecisionLog,
        clock: Arc<dyn RoutingClock>,
    ) -> Self {
        Self {
            unassigned,
            threads,
            decisions,
            clock,
        }
    }

    /// Parks `message` for an operator and returns the record id.
    pub async fn create_unassigned_message(
        &self,
        message: &NormalizedMessage,
        organization_id: &str,
        reason: &str,
    ) -> RoutingEngineResult<String> {
        validate_normalized_message(message)?;
        if organization_id.trim().is_empty() {
            return Err(ThreadRoutingError::InvalidOrganization(
                organization_id.to_string(),
            ));
        }
        let now = self.clock.now();
        let record = UnassignedMessage {
            id: mint_routing_id(UNASSIGNED_MESSAGE_ID_PREFIX, now),
            message: message.clone(),
            organization_id: organization_id.trim().to_string(),
            reason: reason.to_string(),
            status: UnassignedStatus::Pending,
            created_at: now,
            assigned_thread_id: None,
            assigned_by: None,
            assigned_at: None,
        };
        let id = record.id.clone();
        self.unassigned.insert_unassigned(record).await?;
        tracing::info!(
            unassigned_id = %id,
            message_id = %message.id,
            organization_id,
            reason,
            "message parked for manual assignment"
        );
        Ok(id)
    }

    /// Attaches a parked message to `thread_id` and records a manual decision.
    #[tracing::instrument(name = "tau_thread_routing.manual.assign", skip(self))]
    pub async fn assign_unassigned_message(
        &self,
        pending_id: &str,
        thread_id: &str,
        assigned_by: Option<&str>,
    ) -> RoutingEngineResult<UnassignedMessage> {
        let mut record = self
            .unassigned
            .get_unassigned(pending_id)
            .await?
            .ok_or_else(|| ThreadRoutingError::UnassignedMessageNotFound(pending_id.to_string()))?;
        if record.status != UnassignedStatus::Pending {
            return Err(ThreadRoutingError::AlreadyAssigned {
                id: record.id,
                thread_id: record.assigned_thread_id.unwrap_or_default(),
            });
        }
        let thread = self
            .threads
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| ThreadRoutingError::ThreadNotFound(thread_id.to_string()))?;
        if thread.organization_id != record.organization_id {
            return Err(ThreadRoutingError::ThreadNotFound(thread_id.to_string()));
        }

        let now = self.clock.now();
        attach_message_to_thread(self.threads.as_ref(), &thread.id, &record.message, now).await?;
        record.status = UnassignedStatus::Assigned;
        record.assigned_thread_id = Some(thread.id.clone());
        record.assigned_by = assigned_by.map(str::to_string);
        record.assigned_at = Some(now);
        self.unassigned.update_unassigned(record.clone()).await?;

        let reason = match assigned_by {
            Some(operator) => format!("manually assigned by {operator}"),
            None => "manually assigned".to_string(),
        };
        let result = RoutingResult::new(
            thread.id.clone(),
            MANUAL_ASSIGNMENT_CONFIDENCE,
            RoutingMethod::Manual,
            reason,
        );
        self.decisions
            .record(RoutingDecision::resolved(
                &record.message,
                &record.organization_id,
                &result,
                now,
            ))
            .await;
        tracing::info!(
            unassigned_id = %record.id,
            thread_id = %thread.id,
            "unassigned message assigned"
        );
        Ok(record)
    }

    /// Pending records of the organization, oldest first.
    pub async fn list_unassigned_messages(
        &self,
        organization_id: &str,
    ) -> RoutingEngineResult<Vec<UnassignedMessage>> {
        Ok(self
            .unassigned
            .list_unassigned(organization_id)
            .await?
            .into_iter()
            .filter(|record| record.status == UnassignedStatus::Pending)
            .collect())
    }
}
