//! Identity-link records binding one internal user to external identifiers.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clock::is_expired_at;
use crate::routing_contract::MessageChannel;
use crate::routing_error::{RoutingEngineResult, ThreadRoutingError};

const E164_PATTERN: &str = r"^\+[1-9]\d{1,14}$";
const EMAIL_PATTERN: &str = r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$";

fn e164_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(E164_PATTERN).expect("E.164 pattern compiles"))
}

fn email_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(EMAIL_PATTERN).expect("email pattern compiles"))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ExternalIdentityType {
    Phone,
    Email,
    PlatformId,
}

impl ExternalIdentityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Phone => "phone",
            Self::Email => "email",
            Self::PlatformId => "platform-id",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "phone" => Some(Self::Phone),
            "email" => Some(Self::Email),
            "platform-id" | "platform_id" => Some(Self::PlatformId),
            _ => None,
        }
    }

    /// Identity type a sender identifier on `channel` is expected to carry.
    pub fn for_channel(channel: MessageChannel) -> Self {
        match channel {
            MessageChannel::Sms => Self::Phone,
            MessageChannel::Email => Self::Email,
            MessageChannel::ChatPlatform | MessageChannel::InApp => Self::PlatformId,
        }
    }

    /// Trims `raw`, lowercases emails, and rejects malformed values.
    pub fn normalize_value(self, raw: &str) -> RoutingEngineResult<String> {
        let trimmed = raw.trim();
        let valid = match self {
            Self::Phone => e164_regex().is_match(trimmed),
            Self::Email => email_regex().is_match(trimmed),
            Self::PlatformId => !trimmed.is_empty(),
        };
        if !valid {
            return Err(ThreadRoutingError::InvalidIdentifier {
                kind: self.as_str(),
                value: raw.to_string(),
            });
        }
        Ok(match self {
            Self::Email => trimmed.to_ascii_lowercase(),
            Self::Phone | Self::PlatformId => trimmed.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalIdentity {
    #[serde(rename = "type")]
    pub identity_type: ExternalIdentityType,
    pub value: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_expires_at: Option<DateTime<Utc>>,
}

impl ExternalIdentity {
    pub fn unverified(identity_type: ExternalIdentityType, value: impl Into<String>) -> Self {
        Self {
            identity_type,
            value: value.into(),
            verified: false,
            verified_at: None,
            verified_expires_at: None,
        }
    }

    /// Verification as a reader must see it: expired verification counts as none.
    pub fn is_verified_at(&self, now: DateTime<Utc>) -> bool {
        self.verified && !is_expired_at(self.verified_expires_at, now)
    }

    pub fn same_key(&self, identity_type: ExternalIdentityType, value: &str) -> bool {
        self.identity_type == identity_type && self.matches_value(value)
    }

    /// Compares against a raw identifier; emails ignore case.
    pub fn matches_value(&self, raw: &str) -> bool {
        let candidate = raw.trim();
        match self.identity_type {
            ExternalIdentityType::Email => self.value.eq_ignore_ascii_case(candidate),
            ExternalIdentityType::Phone | ExternalIdentityType::PlatformId => {
                self.value == candidate
            }
        }
    }

    pub(crate) fn clear_verification(&mut self) {
        self.verified = false;
        self.verified_at = None;
        self.verified_expires_at = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// All external identities of one user within one organization.
pub struct IdentityLink {
    pub id: String,
    pub user_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub external_identities: Vec<ExternalIdentity>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl IdentityLink {
    pub fn new(user_id: &str, organization_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: identity_link_id(organization_id, user_id),
            user_id: user_id.to_string(),
            organization_id: organization_id.to_string(),
            external_identities: Vec::new(),
            created_at: now,
            updated_at: None,
        }
    }

    pub fn find_identity(
        &self,
        identity_type: ExternalIdentityType,
        value: &str,
    ) -> Option<&ExternalIdentity> {
        self.external_identities
            .iter()
            .find(|identity| identity.same_key(identity_type, value))
    }

    pub fn find_identity_mut(
        &mut self,
        identity_type: ExternalIdentityType,
        value: &str,
    ) -> Option<&mut ExternalIdentity> {
        self.external_identities
            .iter_mut()
            .find(|identity| identity.same_key(identity_type, value))
    }

    /// True when any identity of any type carries `raw`.
    pub fn contains_identifier(&self, raw: &str) -> bool {
        self.external_identities
            .iter()
            .any(|identity| identity.matches_value(raw))
    }
}

/// Composite document id for the (organization, user) link.
pub fn identity_link_id(organization_id: &str, user_id: &str) -> String {
    format!("{}_{}", organization_id.trim(), user_id.trim())
}
