//! Store contracts consumed by the routing engine and an in-memory backend.
//!
//! Production deployments back these traits with their document store. The
//! in-memory backend serves tests and the operator CLI; it can be opened over a
//! JSON snapshot file that is rewritten atomically after every mutation and
//! shared between processes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::decision_log::{DecisionPage, DecisionQuery};
use crate::identity_link::IdentityLink;
use crate::manual_assignment::UnassignedMessage;
use crate::retry_sweeper::PendingRetryRecord;
use crate::routing_contract::{
    MessageChannel, NormalizedMessage, RoutingDecision, Thread, ThreadLastMessage, ThreadReference,
};
use crate::routing_error::{RoutingEngineResult, ThreadRoutingError};
use crate::snapshot_locking::{
    acquire_snapshot_lock, snapshot_lock_path, SNAPSHOT_LOCK_STALE_AFTER, SNAPSHOT_LOCK_WAIT,
};

const ROUTING_STORE_SNAPSHOT_SCHEMA_VERSION: u32 = 1;

fn routing_store_snapshot_schema_version() -> u32 {
    ROUTING_STORE_SNAPSHOT_SCHEMA_VERSION
}

/// Identity-link persistence. Listing preserves store iteration order.
#[async_trait]
pub trait IdentityLinkStore: Send + Sync {
    async fn list_identity_links(
        &self,
        organization_id: &str,
    ) -> RoutingEngineResult<Vec<IdentityLink>>;
    async fn list_all_identity_links(&self) -> RoutingEngineResult<Vec<IdentityLink>>;
    async fn get_identity_link(&self, link_id: &str) -> RoutingEngineResult<Option<IdentityLink>>;
    async fn put_identity_link(&self, link: IdentityLink) -> RoutingEngineResult<()>;
}

/// Thread lookups and updates. Multi-thread reads return the most recently
/// updated threads first.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn get_thread(&self, thread_id: &str) -> RoutingEngineResult<Option<Thread>>;
    async fn threads_for_participant(
        &self,
        organization_id: &str,
        user_id: &str,
        limit: usize,
    ) -> RoutingEngineResult<Vec<Thread>>;
    async fn recent_threads(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> RoutingEngineResult<Vec<Thread>>;
    async fn threads_by_reference(
        &self,
        organization_id: &str,
        reference: &ThreadReference,
        limit: usize,
    ) -> RoutingEngineResult<Vec<Thread>>;
    /// Conditional create: fails with `ThreadAlreadyExists` when the id is taken.
    async fn create_thread(&self, thread: Thread) -> RoutingEngineResult<()>;
    /// Returns false when the channel was already recorded.
    async fn add_channel_source(
        &self,
        thread_id: &str,
        channel: MessageChannel,
    ) -> RoutingEngineResult<bool>;
    async fn append_message(
        &self,
        thread_id: &str,
        message: NormalizedMessage,
        updated_at: DateTime<Utc>,
    ) -> RoutingEngineResult<()>;
    async fn thread_messages(&self, thread_id: &str)
        -> RoutingEngineResult<Vec<NormalizedMessage>>;
}

#[async_trait]
pub trait DecisionLogStore: Send + Sync {
    async fn append_decision(&self, decision: RoutingDecision) -> RoutingEngineResult<()>;
    async fn query_decisions(&self, query: &DecisionQuery) -> RoutingEngineResult<DecisionPage>;
}

#[async_trait]
pub trait PendingRetryStore: Send + Sync {
    /// Returns false when a record with the same id is already queued.
    async fn insert_pending(&self, record: PendingRetryRecord) -> RoutingEngineResult<bool>;
    async fn get_pending(&self, record_id: &str)
        -> RoutingEngineResult<Option<PendingRetryRecord>>;
    /// Oldest first.
    async fn list_pending(&self) -> RoutingEngineResult<Vec<PendingRetryRecord>>;
    async fn update_pending(&self, record: PendingRetryRecord) -> RoutingEngineResult<()>;
    async fn delete_pending(&self, record_id: &str) -> RoutingEngineResult<bool>;
    async fn insert_dead_letter(&self, record: PendingRetryRecord) -> RoutingEngineResult<()>;
    async fn list_dead_letters(
        &self,
        organization_id: Option<&str>,
    ) -> RoutingEngineResult<Vec<PendingRetryRecord>>;
}

#[async_trait]
pub trait UnassignedMessageStore: Send + Sync {
    async fn insert_unassigned(&self, record: UnassignedMessage) -> RoutingEngineResult<()>;
    async fn get_unassigned(&self, record_id: &str)
        -> RoutingEngineResult<Option<UnassignedMessage>>;
    async fn update_unassigned(&self, record: UnassignedMessage) -> RoutingEngineResult<()>;
    /// Oldest first.
    async fn list_unassigned(
        &self,
        organization_id: &str,
    ) -> RoutingEngineResult<Vec<UnassignedMessage>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct StoredDecision {
    sequence: u64,
    decision: RoutingDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutingStoreState {
    #[serde(default = "routing_store_snapshot_schema_version")]
    schema_version: u32,
    #[serde(default)]
    identity_links: Vec<IdentityLink>,
    #[serde(default)]
    threads: BTreeMap<String, Thread>,
    #[serde(default)]
    thread_messages: BTreeMap<String, Vec<NormalizedMessage>>,
    #[serde(default)]
    decisions: Vec<StoredDecision>,
    #[serde(default)]
    next_decision_sequence: u64,
    #[serde(default)]
    pending_retries: BTreeMap<String, PendingRetryRecord>,
    #[serde(default)]
    dead_letters: Vec<PendingRetryRecord>,
    #[serde(default)]
    unassigned_messages: BTreeMap<String, UnassignedMessage>,
}

impl Default for RoutingStoreState {
    fn default() -> Self {
        Self {
            schema_version: ROUTING_STORE_SNAPSHOT_SCHEMA_VERSION,
            identity_links: Vec::new(),
            threads: BTreeMap::new(),
            thread_messages: BTreeMap::new(),
            decisions: Vec::new(),
            next_decision_sequence: 1,
            pending_retries: BTreeMap::new(),
            dead_letters: Vec::new(),
            unassigned_messages: BTreeMap::new(),
        }
    }
}

/// In-memory implementation of every routing store contract.
///
/// When opened over a snapshot file, every read reloads the file and every
/// mutation runs read-modify-write under a sidecar lock, so several handles
/// (or processes) can share one snapshot. Memory is only updated after the
/// snapshot write succeeds.
#[derive(Debug, Default)]
pub struct InMemoryRoutingStore {
    inner: RwLock<RoutingStoreState>,
    snapshot_path: Option<PathBuf>,
}

impl InMemoryRoutingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a store persisted at `path`; a missing file starts empty.
    pub fn open_snapshot(path: &Path) -> anyhow::Result<Self> {
        let state = read_snapshot(path)
            .with_context(|| format!("failed to load routing snapshot {}", path.display()))?
            .unwrap_or_default();
        Ok(Self {
            inner: RwLock::new(state),
            snapshot_path: Some(path.to_path_buf()),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    async fn read_state(&self) -> RoutingEngineResult<RwLockReadGuard<'_, RoutingStoreState>> {
        let Some(path) = self.snapshot_path.as_deref() else {
            return Ok(self.inner.read().await);
        };
        let current = read_snapshot(path)?.unwrap_or_default();
        let mut inner = self.inner.write().await;
        *inner = current;
        Ok(inner.downgrade())
    }

    /// Applies `apply` and persists the result. `apply` returns its value and
    /// whether it changed the state, and must fail before changing anything.
    async fn mutate<T, F>(&self, apply: F) -> RoutingEngineResult<T>
    where
        F: FnOnce(&mut RoutingStoreState) -> RoutingEngineResult<(T, bool)> + Send,
        T: Send,
    {
        let mut inner = self.inner.write().await;
        let Some(path) = self.snapshot_path.as_deref() else {
            let (value, _changed) = apply(&mut *inner)?;
            return Ok(value);
        };

        let _lock = acquire_snapshot_lock(
            &snapshot_lock_path(path),
            SNAPSHOT_LOCK_WAIT,
            SNAPSHOT_LOCK_STALE_AFTER,
        )
        .await?;
        let mut next = read_snapshot(path)?.unwrap_or_default();
        let (value, changed) = apply(&mut next)?;
        if changed {
            let payload = serde_json::to_string_pretty(&next)?;
            write_snapshot_atomic(path, &payload)?;
        }
        *inner = next;
        Ok(value)
    }
}

/// `None` when the file does not exist yet.
fn read_snapshot(path: &Path) -> RoutingEngineResult<Option<RoutingStoreState>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    let state = serde_json::from_str::<RoutingStoreState>(&raw)?;
    if state.schema_version != ROUTING_STORE_SNAPSHOT_SCHEMA_VERSION {
        return Err(ThreadRoutingError::StoreUnavailable(format!(
            "unsupported routing snapshot schema_version {} in {} (expected {})",
            state.schema_version,
            path.display(),
            ROUTING_STORE_SNAPSHOT_SCHEMA_VERSION
        )));
    }
    Ok(Some(state))
}

/// Writes via temp file + rename so readers never observe a partial snapshot.
fn write_snapshot_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)?;
    let temp_name = format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("routing-store"),
        std::process::id()
    );
    let temp_path = parent_dir.join(temp_name);
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)
}

fn sort_by_recency(threads: &mut [Thread]) {
    threads.sort_by(|left, right| {
        right
            .updated_at
            .cmp(&left.updated_at)
            .then_with(|| left.id.cmp(&right.id))
    });
}

fn collect_recent<'a>(
    threads: impl Iterator<Item = &'a Thread>,
    limit: usize,
) -> Vec<Thread> {
    let mut selected = threads.cloned().collect::<Vec<_>>();
    sort_by_recency(&mut selected);
    selected.truncate(limit);
    selected
}

#[async_trait]
impl IdentityLinkStore for InMemoryRoutingStore {
    async fn list_identity_links(
        &self,
        organization_id: &str,
    ) -> RoutingEngineResult<Vec<IdentityLink>> {
        let state = self.read_state().await?;
        Ok(state
            .identity_links
            .iter()
            .filter(|link| link.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn list_all_identity_links(&self) -> RoutingEngineResult<Vec<IdentityLink>> {
        Ok(self.read_state().await?.identity_links.clone())
    }

    async fn get_identity_link(&self, link_id: &str) -> RoutingEngineResult<Option<IdentityLink>> {
        let state = self.read_state().await?;
        Ok(state
            .identity_links
            .iter()
            .find(|link| link.id == link_id)
            .cloned())
    }

    async fn put_identity_link(&self, link: IdentityLink) -> RoutingEngineResult<()> {
        self.mutate(move |state| {
            match state
                .identity_links
                .iter()
                .position(|existing| existing.id == link.id)
            {
                Some(index) => state.identity_links[index] = link,
                None => state.identity_links.push(link),
            }
            Ok(((), true))
        })
        .await
    }
}

#[async_trait]
impl ThreadStore for InMemoryRoutingStore {
    async fn get_thread(&self, thread_id: &str) -> RoutingEngineResult<Option<Thread>> {
        Ok(self.read_state().await?.threads.get(thread_id).cloned())
    }

    async fn threads_for_participant(
        &self,
        organization_id: &str,
        user_id: &str,
        limit: usize,
    ) -> RoutingEngineResult<Vec<Thread>> {
        let state = self.read_state().await?;
        Ok(collect_recent(
            state.threads.values().filter(|thread| {
                thread.organization_id == organization_id
                    && thread.participants.iter().any(|participant| participant == user_id)
            }),
            limit,
        ))
    }

    async fn recent_threads(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> RoutingEngineResult<Vec<Thread>> {
        let state = self.read_state().await?;
        Ok(collect_recent(
            state
                .threads
                .values()
                .filter(|thread| thread.organization_id == organization_id),
            limit,
        ))
    }

    async fn threads_by_reference(
        &self,
        organization_id: &str,
        reference: &ThreadReference,
        limit: usize,
    ) -> RoutingEngineResult<Vec<Thread>> {
        let state = self.read_state().await?;
        Ok(collect_recent(
            state.threads.values().filter(|thread| {
                thread.organization_id == organization_id && reference.matches(thread)
            }),
            limit,
        ))
    }

    async fn create_thread(&self, thread: Thread) -> RoutingEngineResult<()> {
        self.mutate(move |state| {
            if state.threads.contains_key(&thread.id) {
                return Err(ThreadRoutingError::ThreadAlreadyExists(thread.id));
            }
            state.threads.insert(thread.id.clone(), thread);
            Ok(((), true))
        })
        .await
    }

    async fn add_channel_source(
        &self,
        thread_id: &str,
        channel: MessageChannel,
    ) -> RoutingEngineResult<bool> {
        self.mutate(|state| {
            let thread = state
                .threads
                .get_mut(thread_id)
                .ok_or_else(|| ThreadRoutingError::ThreadNotFound(thread_id.to_string()))?;
            let added = thread.add_channel_source(channel);
            Ok((added, added))
        })
        .await
    }

    async fn append_message(
        &self,
        thread_id: &str,
        message: NormalizedMessage,
        updated_at: DateTime<Utc>,
    ) -> RoutingEngineResult<()> {
        self.mutate(move |state| {
            let thread = state
                .threads
                .get_mut(thread_id)
                .ok_or_else(|| ThreadRoutingError::ThreadNotFound(thread_id.to_string()))?;
            thread.last_message = Some(ThreadLastMessage::from_message(&message));
            thread.updated_at = updated_at;
            state
                .thread_messages
                .entry(thread_id.to_string())
                .or_default()
                .push(message.routed_to(thread_id));
            Ok(((), true))
        })
        .await
    }

    async fn thread_messages(
        &self,
        thread_id: &str,
    ) -> RoutingEngineResult<Vec<NormalizedMessage>> {
        let state = self.read_state().await?;
        Ok(state
            .thread_messages
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl DecisionLogStore for InMemoryRoutingStore {
    async fn append_decision(&self, decision: RoutingDecision) -> RoutingEngineResult<()> {
        self.mutate(move |state| {
            let sequence = state.next_decision_sequence.max(1);
            state.next_decision_sequence = sequence.saturating_add(1);
            state.decisions.push(StoredDecision { sequence, decision });
            Ok(((), true))
        })
        .await
    }

    async fn query_decisions(&self, query: &DecisionQuery) -> RoutingEngineResult<DecisionPage> {
        let cursor = query.cursor_sequence()?;
        let state = self.read_state().await?;
        let mut matched = state
            .decisions
            .iter()
            .rev()
            .filter(|stored| cursor.map_or(true, |cursor| stored.sequence < cursor))
            .filter(|stored| query.filter.matches(&stored.decision));
        let mut decisions = Vec::new();
        let mut last_sequence = None;
        for stored in matched.by_ref().take(query.limit) {
            last_sequence = Some(stored.sequence);
            decisions.push(stored.decision.clone());
        }
        let next_cursor = if matched.next().is_some() {
            last_sequence.map(|sequence| sequence.to_string())
        } else {
            None
        };
        Ok(DecisionPage {
            decisions,
            next_cursor,
        })
    }
}

#[async_trait]
impl PendingRetryStore for InMemoryRoutingStore {
    async fn insert_pending(&self, record: PendingRetryRecord) -> RoutingEngineResult<bool> {
        self.mutate(move |state| {
            if state.pending_retries.contains_key(&record.id) {
                return Ok((false, false));
            }
            state.pending_retries.insert(record.id.clone(), record);
            Ok((true, true))
        })
        .await
    }

    async fn get_pending(
        &self,
        record_id: &str,
    ) -> RoutingEngineResult<Option<PendingRetryRecord>> {
        Ok(self
            .read_state()
            .await?
            .pending_retries
            .get(record_id)
            .cloned())
    }

    async fn list_pending(&self) -> RoutingEngineResult<Vec<PendingRetryRecord>> {
        let state = self.read_state().await?;
        let mut records = state.pending_retries.values().cloned().collect::<Vec<_>>();
        records.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(records)
    }

    async fn update_pending(&self, record: PendingRetryRecord) -> RoutingEngineResult<()> {
        self.mutate(move |state| {
            let existing = state
                .pending_retries
                .get_mut(&record.id)
                .ok_or_else(|| ThreadRoutingError::PendingRecordNotFound(record.id.clone()))?;
            *existing = record;
            Ok(((), true))
        })
        .await
    }

    async fn delete_pending(&self, record_id: &str) -> RoutingEngineResult<bool> {
        self.mutate(|state| {
            let removed = state.pending_retries.remove(record_id).is_some();
            Ok((removed, removed))
        })
        .await
    }

    async fn insert_dead_letter(&self, record: PendingRetryRecord) -> RoutingEngineResult<()> {
        self.mutate(move |state| {
            state.dead_letters.push(record);
            Ok(((), true))
        })
        .await
    }

    async fn list_dead_letters(
        &self,
        organization_id: Option<&str>,
    ) -> RoutingEngineResult<Vec<PendingRetryRecord>> {
        let state = self.read_state().await?;
        Ok(state
            .dead_letters
            .iter()
            .filter(|record| organization_id.map_or(true, |org| record.organization_id == org))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UnassignedMessageStore for InMemoryRoutingStore {
    async fn insert_unassigned(&self, record: UnassignedMessage) -> RoutingEngineResult<()> {
        self.mutate(move |state| {
            state.unassigned_messages.insert(record.id.clone(), record);
            Ok(((), true))
        })
        .await
    }

    async fn get_unassigned(
        &self,
        record_id: &str,
    ) -> RoutingEngineResult<Option<UnassignedMessage>> {
        Ok(self
            .read_state()
            .await?
            .unassigned_messages
            .get(record_id)
            .cloned())
    }

    async fn update_unassigned(&self, record: UnassignedMessage) -> RoutingEngineResult<()> {
        self.mutate(move |state| {
            let existing = state
                .unassigned_messages
                .get_mut(&record.id)
                .ok_or_else(|| ThreadRoutingError::UnassignedMessageNotFound(record.id.clone()))?;
            *existing = record;
            Ok(((), true))
        })
        .await
    }

    async fn list_unassigned(
        &self,
        organization_id: &str,
    ) -> RoutingEngineResult<Vec<UnassignedMessage>> {
        let state = self.read_state().await?;
        let mut records = state
            .unassigned_messages
            .values()
            .filter(|record| record.organization_id == organization_id)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(records)
    }
}
