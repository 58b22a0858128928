//! Periodic re-routing of messages that failed their first routing attempt.
//!
//! Records wait `base_delay * 2^retry_count` after creation before each retry.
//! After `max_retries` failed attempts a record is flagged permanently failed,
//! copied to the dead-letter store, parked for manual assignment, and removed
//! from the pending queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::clock::RoutingClock;
use crate::manual_assignment::ManualAssignmentDesk;
use crate::orchestrator::RoutingOrchestrator;
use crate::routing_contract::NormalizedMessage;
use crate::routing_error::RoutingEngineResult;
use crate::routing_store::PendingRetryStore;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_SECONDS: i64 = 60;
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 300;
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::seconds(DEFAULT_RETRY_BASE_DELAY_SECONDS),
        }
    }
}

impl RetryPolicy {
    /// `created_at + base_delay * 2^retry_count`, saturating at the latest
    /// representable instant.
    pub fn next_eligible_at(&self, created_at: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let multiplier = 1_i32 << retry_count.min(MAX_BACKOFF_EXPONENT);
        self.base_delay
            .checked_mul(multiplier)
            .and_then(|delay| created_at.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingRetryRecord {
    pub id: String,
    pub message: NormalizedMessage,
    pub organization_id: String,
    pub retry_count: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    #[serde(default)]
    pub permanently_failed: bool,
}

impl PendingRetryRecord {
    /// Record for a message's first failed routing attempt. The id is the
    /// message id, so a message is queued at most once.
    pub fn first_failure(
        message: &NormalizedMessage,
        organization_id: &str,
        last_error: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: message.id.clone(),
            message: message.clone(),
            organization_id: organization_id.to_string(),
            retry_count: 0,
            last_error: last_error.into(),
            created_at: now,
            next_eligible_at: policy.next_eligible_at(now, 0),
            permanently_failed: false,
        }
    }

    pub fn is_eligible(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
        !self.permanently_failed
            && self.retry_count < policy.max_retries
            && now >= self.next_eligible_at
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Outcome counters for one sweep.
pub struct RetrySweepReport {
    pub scanned: usize,
    pub skipped: usize,
    pub resolved: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub errors: usize,
    pub skipped_overlapping: bool,
}

enum RetryOutcome {
    Rescheduled,
    DeadLettered,
}

pub struct RetrySweeper {
    orchestrator: Arc<RoutingOrchestrator>,
    pending: Arc<dyn PendingRetryStore>,
    manual: ManualAssignmentDesk,
    clock: Arc<dyn RoutingClock>,
    policy: RetryPolicy,
    in_flight: tokio::sync::Mutex<()>,
}

impl RetrySweeper {
    pub fn new(
        orchestrator: Arc<RoutingOrchestrator>,
        pending: Arc<dyn PendingRetryStore>,
        manual: ManualAssignmentDesk,
        clock: Arc<dyn RoutingClock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            orchestrator,
            pending,
            manual,
            clock,
            policy,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs one pass over the pending queue. Returns immediately with
    /// `skipped_overlapping` set when another pass is still running.
    #[tracing::instrument(name = "tau_thread_routing.retry.sweep", skip(self))]
    pub async fn sweep_once(&self) -> RoutingEngineResult<RetrySweepReport> {
        let mut report = RetrySweepReport::default();
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::warn!("retry sweep skipped: previous sweep still running");
            report.skipped_overlapping = true;
            return Ok(report);
        };

        let now = self.clock.now();
        for record in self.pending.list_pending().await? {
            report.scanned += 1;
            if !record.is_eligible(&self.policy, now) {
                report.skipped += 1;
                continue;
            }
            let record_id = record.id.clone();
            match self.retry_record(record).await {
                Ok(Some(RetryOutcome::Rescheduled)) => report.rescheduled += 1,
                Ok(Some(RetryOutcome::DeadLettered)) => report.dead_lettered += 1,
                Ok(None) => report.resolved += 1,
                Err(error) => {
                    report.errors += 1;
                    tracing::warn!(
                        record_id = %record_id,
                        error = %error,
                        "retry record update failed"
                    );
                }
            }
        }

        tracing::info!(
            scanned = report.scanned,
            skipped = report.skipped,
            resolved = report.resolved,
            rescheduled = report.rescheduled,
            dead_lettered = report.dead_lettered,
            errors = report.errors,
            "retry sweep complete"
        );
        Ok(report)
    }

    /// `None` when the message was routed and the record deleted.
    async fn retry_record(
        &self,
        record: PendingRetryRecord,
    ) -> RoutingEngineResult<Option<RetryOutcome>> {
        let failure = match self
            .orchestrator
            .route_message(&record.message, &record.organization_id)
            .await
        {
            Ok(Some(result)) => {
                self.pending.delete_pending(&record.id).await?;
                tracing::debug!(
                    record_id = %record.id,
                    thread_id = %result.thread_id,
                    method = result.method.as_str(),
                    "pending message routed on retry"
                );
                return Ok(None);
            }
            Ok(None) => "no routing strategy matched".to_string(),
            Err(error) => error.to_string(),
        };
        self.record_failure(record, failure).await.map(Some)
    }

    async fn record_failure(
        &self,
        mut record: PendingRetryRecord,
        failure: String,
    ) -> RoutingEngineResult<RetryOutcome> {
        record.retry_count = record.retry_count.saturating_add(1);
        record.last_error = failure;
        if record.retry_count < self.policy.max_retries {
            record.next_eligible_at = self
                .policy
                .next_eligible_at(record.created_at, record.retry_count);
            self.pending.update_pending(record).await?;
            return Ok(RetryOutcome::Rescheduled);
        }

        record.permanently_failed = true;
        self.pending.insert_dead_letter(record.clone()).await?;
        let reason = format!(
            "routing failed after {} retries: {}",
            record.retry_count, record.last_error
        );
        if let Err(error) = self
            .manual
            .create_unassigned_message(&record.message, &record.organization_id, &reason)
            .await
        {
            tracing::warn!(
                record_id = %record.id,
                error = %error,
                "dead-lettered message could not be parked for manual assignment"
            );
        }
        self.pending.delete_pending(&record.id).await?;
        tracing::warn!(
            record_id = %record.id,
            organization_id = %record.organization_id,
            retries = record.retry_count,
            last_error = %record.last_error,
            "pending message dead-lettered"
        );
        Ok(RetryOutcome::DeadLettered)
    }
}

pub struct RetrySweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RetrySweeperHandle {
    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Spawns the periodic sweep loop on the current Tokio runtime.
pub fn start_retry_sweeper_scheduler(
    sweeper: Arc<RetrySweeper>,
    interval: std::time::Duration,
) -> Result<RetrySweeperHandle> {
    if interval.is_zero() {
        anyhow::bail!("retry sweep interval must be greater than zero");
    }
    let handle = tokio::runtime::Handle::try_current()
        .context("retry sweeper scheduler requires an active Tokio runtime")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = handle.spawn(async move {
        run_retry_sweeper_loop(sweeper, interval, shutdown_rx).await;
    });
    tracing::info!(interval_ms = interval.as_millis() as u64, "retry sweeper started");
    Ok(RetrySweeperHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn run_retry_sweeper_loop(
    sweeper: Arc<RetrySweeper>,
    interval: std::time::Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(error) = sweeper.sweep_once().await {
                    tracing::warn!(error = %error, "retry sweep failed");
                }
            }
            _ = &mut shutdown_rx => {
                tracing::info!("retry sweeper stopped");
                break;
            }
        }
    }
}
