use thiserror::Error;

/// Result type for routing engine operations.
pub type RoutingEngineResult<T> = Result<T, ThreadRoutingError>;

/// Errors returned by the routing engine and its stores.
#[derive(Debug, Error)]
pub enum ThreadRoutingError {
    #[error("invalid {kind} identifier '{value}'")]
    InvalidIdentifier { kind: &'static str, value: String },
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid organization id '{0}'")]
    InvalidOrganization(String),
    #[error(
        "external identity {kind}:{value} is already linked to user '{existing_user_id}' in organization '{organization_id}'"
    )]
    IdentityConflict {
        kind: &'static str,
        value: String,
        existing_user_id: String,
        organization_id: String,
    },
    #[error("identity link for user '{user_id}' in organization '{organization_id}' not found")]
    IdentityLinkNotFound {
        user_id: String,
        organization_id: String,
    },
    #[error("external identity {kind}:{value} not found on user '{user_id}'")]
    ExternalIdentityNotFound {
        kind: &'static str,
        value: String,
        user_id: String,
    },
    #[error("thread '{0}' not found")]
    ThreadNotFound(String),
    #[error("thread '{0}' already exists")]
    ThreadAlreadyExists(String),
    #[error("unassigned message '{0}' not found")]
    UnassignedMessageNotFound(String),
    #[error("unassigned message '{id}' was already assigned to thread '{thread_id}'")]
    AlreadyAssigned { id: String, thread_id: String },
    #[error("pending retry record '{0}' not found")]
    PendingRecordNotFound(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ThreadRoutingError {
    /// True for errors that describe bad caller input rather than engine state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidIdentifier { .. } | Self::InvalidMessage(_) | Self::InvalidOrganization(_)
        )
    }
}
