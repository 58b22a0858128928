//! Normalized message, thread, and routing decision contract types.
//!
//! Channel adapters hand the engine a [`NormalizedMessage`]; everything the
//! engine persists (threads, decisions) is defined here with the camelCase key
//! names existing documents already use.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::routing_error::{RoutingEngineResult, ThreadRoutingError};

pub const PROPERTY_ID_METADATA_KEY: &str = "propertyId";
pub const PROJECT_ID_METADATA_KEY: &str = "projectId";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
/// External channel a message arrived on.
pub enum MessageChannel {
    Sms,
    ChatPlatform,
    Email,
    InApp,
}

impl MessageChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::ChatPlatform => "chat-platform",
            Self::Email => "email",
            Self::InApp => "in-app",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sms" => Some(Self::Sms),
            "chat-platform" | "chat_platform" => Some(Self::ChatPlatform),
            "email" => Some(Self::Email),
            "in-app" | "in_app" => Some(Self::InApp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    #[default]
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Channel-agnostic message produced by a channel adapter.
pub struct NormalizedMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    pub channel: MessageChannel,
    #[serde(default)]
    pub direction: MessageDirection,
    pub sender_identifier: String,
    #[serde(default)]
    pub recipient_identifier: String,
    #[serde(default)]
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub delivery_status: DeliveryStatus,
    #[serde(default)]
    pub channel_metadata: BTreeMap<String, Value>,
}

impl NormalizedMessage {
    /// Returns a trimmed, non-empty string value from `channelMetadata`.
    pub fn metadata_text(&self, key: &str) -> Option<String> {
        let value = self.channel_metadata.get(key)?;
        let text = match value {
            Value::String(text) => text.trim().to_string(),
            Value::Number(number) => number.to_string(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    }

    /// Copy of this message bound to `thread_id`.
    pub fn routed_to(&self, thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            ..self.clone()
        }
    }
}

pub fn validate_normalized_message(message: &NormalizedMessage) -> RoutingEngineResult<()> {
    if message.id.trim().is_empty() {
        return Err(ThreadRoutingError::InvalidMessage(
            "message has empty id".to_string(),
        ));
    }
    if message.sender_identifier.trim().is_empty() {
        return Err(ThreadRoutingError::InvalidMessage(format!(
            "message '{}' has empty senderIdentifier",
            message.id
        )));
    }
    if message.channel_metadata.keys().any(|key| key.trim().is_empty()) {
        return Err(ThreadRoutingError::InvalidMessage(format!(
            "message '{}' includes empty channelMetadata key",
            message.id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadLastMessage {
    pub text: String,
    pub sender_identifier: String,
    pub channel: MessageChannel,
    pub timestamp: DateTime<Utc>,
}

impl ThreadLastMessage {
    pub fn from_message(message: &NormalizedMessage) -> Self {
        Self {
            text: message.text.clone(),
            sender_identifier: message.sender_identifier.clone(),
            channel: message.channel,
            timestamp: message.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Conversation container owned by an organization.
pub struct Thread {
    pub id: String,
    pub organization_id: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub channel_sources: Vec<MessageChannel>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<ThreadLastMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub metadata: ThreadMetadata,
}

impl Thread {
    /// Adds `channel` to `channelSources`; returns false when already present.
    pub fn add_channel_source(&mut self, channel: MessageChannel) -> bool {
        if self.channel_sources.contains(&channel) {
            return false;
        }
        self.channel_sources.push(channel);
        true
    }

    pub fn last_message_text(&self) -> &str {
        self.last_message
            .as_ref()
            .map(|last| last.text.as_str())
            .unwrap_or_default()
    }
}

/// Exact-match reference a thread can carry in its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadReference {
    Property(String),
    Project(String),
}

impl ThreadReference {
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Property(_) => PROPERTY_ID_METADATA_KEY,
            Self::Project(_) => PROJECT_ID_METADATA_KEY,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Property(value) | Self::Project(value) => value,
        }
    }

    pub fn matches(&self, thread: &Thread) -> bool {
        match self {
            Self::Property(value) => thread.property_id.as_deref() == Some(value.as_str()),
            Self::Project(value) => thread.project_id.as_deref() == Some(value.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// How a routing outcome was reached.
pub enum RoutingMethod {
    Identity,
    Metadata,
    Context,
    Created,
    Manual,
}

impl RoutingMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Metadata => "metadata",
            Self::Context => "context",
            Self::Created => "created",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// Method recorded on a persisted [`RoutingDecision`].
///
/// Thread creation has no decision method of its own: a created thread is
/// logged as `manual` with the new thread id and full confidence, while a
/// failure is `manual` with no thread id.
pub enum DecisionMethod {
    Identity,
    Metadata,
    Context,
    Manual,
}

impl DecisionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Metadata => "metadata",
            Self::Context => "context",
            Self::Manual => "manual",
        }
    }
}

impl From<RoutingMethod> for DecisionMethod {
    fn from(method: RoutingMethod) -> Self {
        match method {
            RoutingMethod::Identity => Self::Identity,
            RoutingMethod::Metadata => Self::Metadata,
            RoutingMethod::Context => Self::Context,
            RoutingMethod::Created | RoutingMethod::Manual => Self::Manual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Ephemeral outcome of a successful routing attempt.
pub struct RoutingResult {
    pub thread_id: String,
    pub confidence: f64,
    pub method: RoutingMethod,
    pub reason: String,
}

impl RoutingResult {
    pub fn new(
        thread_id: impl Into<String>,
        confidence: f64,
        method: RoutingMethod,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            confidence: confidence.clamp(0.0, 1.0),
            method,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Persisted audit entry; one per routing attempt.
pub struct RoutingDecision {
    pub message_id: String,
    pub sender_identifier: String,
    pub channel: MessageChannel,
    pub timestamp: DateTime<Utc>,
    pub method: DecisionMethod,
    pub confidence: f64,
    pub reason: String,
    pub thread_id: Option<String>,
    pub organization_id: String,
}

impl RoutingDecision {
    pub fn resolved(
        message: &NormalizedMessage,
        organization_id: &str,
        result: &RoutingResult,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message.id.clone(),
            sender_identifier: message.sender_identifier.clone(),
            channel: message.channel,
            timestamp,
            method: result.method.into(),
            confidence: result.confidence,
            reason: result.reason.clone(),
            thread_id: Some(result.thread_id.clone()),
            organization_id: organization_id.to_string(),
        }
    }

    pub fn unresolved(
        message: &NormalizedMessage,
        organization_id: &str,
        reason: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message.id.clone(),
            sender_identifier: message.sender_identifier.clone(),
            channel: message.channel,
            timestamp,
            method: DecisionMethod::Manual,
            confidence: 0.0,
            reason: reason.into(),
            thread_id: None,
            organization_id: organization_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_message() -> NormalizedMessage {
        NormalizedMessage {
            id: "msg-1".to_string(),
            thread_id: String::new(),
            channel: MessageChannel::Sms,
            direction: MessageDirection::Incoming,
            sender_identifier: "+15551234567".to_string(),
            recipient_identifier: "+15550000000".to_string(),
            text: "ok".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            delivery_status: DeliveryStatus::Delivered,
            channel_metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn unit_message_serializes_with_camel_case_keys() {
        let payload = serde_json::to_value(sample_message()).expect("serialize");
        assert_eq!(payload["senderIdentifier"], "+15551234567");
        assert_eq!(payload["channel"], "sms");
        assert_eq!(payload["deliveryStatus"], "delivered");
        assert!(payload.get("channelMetadata").is_some());
        assert!(payload.get("sender_identifier").is_none());
    }

    #[test]
    fn unit_channel_serializes_kebab_case_values() {
        let raw = serde_json::to_string(&[MessageChannel::ChatPlatform, MessageChannel::InApp])
            .expect("serialize");
        assert_eq!(raw, r#"["chat-platform","in-app"]"#);
        assert_eq!(MessageChannel::parse("in_app"), Some(MessageChannel::InApp));
        assert_eq!(MessageChannel::parse("fax"), None);
    }

    #[test]
    fn unit_validate_message_rejects_blank_sender() {
        let mut message = sample_message();
        message.sender_identifier = "  ".to_string();
        let error = validate_normalized_message(&message).expect_err("blank sender");
        assert!(error.to_string().contains("empty senderIdentifier"));
    }

    #[test]
    fn unit_metadata_text_accepts_numbers_and_skips_blank_strings() {
        let mut message = sample_message();
        message
            .channel_metadata
            .insert(PROPERTY_ID_METADATA_KEY.to_string(), Value::from(42_u64));
        message.channel_metadata.insert(
            PROJECT_ID_METADATA_KEY.to_string(),
            Value::String("  ".to_string()),
        );
        assert_eq!(
            message.metadata_text(PROPERTY_ID_METADATA_KEY).as_deref(),
            Some("42")
        );
        assert_eq!(message.metadata_text(PROJECT_ID_METADATA_KEY), None);
    }

    #[test]
    fn regression_thread_channel_sources_keep_set_semantics() {
        let now = Utc::now();
        let mut thread = Thread {
            id: "t1".to_string(),
            organization_id: "org-1".to_string(),
            participants: vec!["u1".to_string()],
            channel_sources: vec![MessageChannel::Sms],
            created_at: now,
            updated_at: now,
            last_message: None,
            group_name: None,
            property_id: None,
            project_id: None,
            metadata: ThreadMetadata::default(),
        };
        assert!(!thread.add_channel_source(MessageChannel::Sms));
        assert!(thread.add_channel_source(MessageChannel::Email));
        assert!(!thread.add_channel_source(MessageChannel::Email));
        assert_eq!(
            thread.channel_sources,
            vec![MessageChannel::Sms, MessageChannel::Email]
        );
    }

    #[test]
    fn unit_unresolved_decision_uses_manual_method_and_null_thread() {
        let message = sample_message();
        let decision =
            RoutingDecision::unresolved(&message, "org-1", "no strategy matched", Utc::now());
        assert_eq!(decision.method, DecisionMethod::Manual);
        assert_eq!(decision.thread_id, None);
        let payload = serde_json::to_value(&decision).expect("serialize");
        assert!(payload["threadId"].is_null());
        assert_eq!(payload["organizationId"], "org-1");
    }

    #[test]
    fn regression_created_thread_decision_serializes_as_manual() {
        let message = sample_message();
        let result = RoutingResult::new(
            "thread-1",
            1.0,
            RoutingMethod::Created,
            "created thread for new sender",
        );
        let decision = RoutingDecision::resolved(&message, "org-1", &result, Utc::now());
        assert_eq!(decision.method, DecisionMethod::Manual);
        let payload = serde_json::to_value(&decision).expect("serialize");
        assert_eq!(payload["method"], "manual");
        assert_eq!(payload["threadId"], "thread-1");
        assert_eq!(payload["confidence"], 1.0);
        assert_eq!(
            DecisionMethod::from(RoutingMethod::Metadata).as_str(),
            "metadata"
        );
    }
}
