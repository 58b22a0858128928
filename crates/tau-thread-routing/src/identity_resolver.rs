//! Resolution of external identifiers to internal user ids.
//!
//! The resolver exclusively owns identity-link lifecycle. Reads go through an
//! injected [`IdentityCache`]; every mutation invalidates the whole
//! organization in that cache.

use std::sync::Arc;

use chrono::Duration;

use crate::clock::{mint_routing_id, RoutingClock};
use crate::identity_cache::{IdentityCache, IdentityCacheKey, DEFAULT_IDENTITY_CACHE_TTL_SECONDS};
use crate::identity_link::{identity_link_id, ExternalIdentity, ExternalIdentityType, IdentityLink};
use crate::routing_contract::NormalizedMessage;
use crate::routing_error::{RoutingEngineResult, ThreadRoutingError};
use crate::routing_store::IdentityLinkStore;

pub const EXTERNAL_USER_ID_PREFIX: &str = "external-user";

/// User id resolved (or minted) for a message sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIdentity {
    pub user_id: String,
    pub minted: bool,
}

pub struct IdentityResolver {
    store: Arc<dyn IdentityLinkStore>,
    cache: Arc<dyn IdentityCache>,
    clock: Arc<dyn RoutingClock>,
    cache_ttl: Duration,
}

impl IdentityResolver {
    pub fn new(
        store: Arc<dyn IdentityLinkStore>,
        cache: Arc<dyn IdentityCache>,
        clock: Arc<dyn RoutingClock>,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            cache_ttl: Duration::seconds(DEFAULT_IDENTITY_CACHE_TTL_SECONDS),
        }
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    /// Maps an external identifier to a user id within `organization_id`.
    ///
    /// More than one matching link is a data-integrity fault; it is logged and
    /// the first link in store order wins.
    #[tracing::instrument(name = "tau_thread_routing.identity.lookup", skip(self))]
    pub async fn lookup(
        &self,
        external_identifier: &str,
        organization_id: &str,
    ) -> RoutingEngineResult<Option<String>> {
        let identifier = external_identifier.trim();
        if identifier.is_empty() {
            return Err(ThreadRoutingError::InvalidIdentifier {
                kind: "external",
                value: external_identifier.to_string(),
            });
        }
        let organization_id = require_organization(organization_id)?;

        let key = IdentityCacheKey::new(organization_id, identifier);
        if let Some(user_id) = self.cache.get(&key) {
            tracing::debug!(user_id = %user_id, "identity cache hit");
            return Ok(Some(user_id));
        }

        let links = self.store.list_identity_links(organization_id).await?;
        let matches = links
            .iter()
            .filter(|link| link.contains_identifier(identifier))
            .collect::<Vec<_>>();
        let Some(first) = matches.first() else {
            return Ok(None);
        };
        if matches.len() > 1 {
            tracing::warn!(
                organization_id,
                external_identifier = identifier,
                matched_users = ?matches.iter().map(|link| link.user_id.as_str()).collect::<Vec<_>>(),
                chosen_user = %first.user_id,
                "identity integrity anomaly: identifier linked to multiple users"
            );
        }
        let user_id = first.user_id.clone();
        self.cache.set(key, user_id.clone(), self.cache_ttl);
        Ok(Some(user_id))
    }

    /// Adds or refreshes one external identity on the user's link.
    ///
    /// Re-adding an identity that is already present updates it in place, so
    /// the call is idempotent.
    pub async fn add_external_identity(
        &self,
        user_id: &str,
        identity: ExternalIdentity,
        organization_id: &str,
    ) -> RoutingEngineResult<IdentityLink> {
        let user_id = require_user(user_id)?;
        let organization_id = require_organization(organization_id)?;
        let value = identity.identity_type.normalize_value(&identity.value)?;
        let identity = ExternalIdentity { value, ..identity };

        self.ensure_unclaimed(user_id, organization_id, &identity)
            .await?;

        let now = self.clock.now();
        let link_id = identity_link_id(organization_id, user_id);
        let mut link = match self.store.get_identity_link(&link_id).await? {
            Some(link) => link,
            None => IdentityLink::new(user_id, organization_id, now),
        };
        match link.find_identity_mut(identity.identity_type, &identity.value) {
            Some(existing) => {
                existing.value = identity.value.clone();
                if identity.verified {
                    existing.verified = true;
                    existing.verified_at = identity.verified_at.or(Some(now));
                    existing.verified_expires_at = identity.verified_expires_at;
                }
            }
            None => link.external_identities.push(identity),
        }
        link.updated_at = Some(now);
        self.save_link(link).await
    }

    /// Marks an identity verified, refreshing timestamp and expiry when it
    /// already was.
    pub async fn verify_identity(
        &self,
        user_id: &str,
        organization_id: &str,
        identity_type: ExternalIdentityType,
        value: &str,
        expires_in: Option<Duration>,
    ) -> RoutingEngineResult<IdentityLink> {
        let now = self.clock.now();
        self.update_identity(user_id, organization_id, identity_type, value, |identity| {
            identity.verified = true;
            identity.verified_at = Some(now);
            identity.verified_expires_at = expires_in.map(|ttl| now + ttl);
        })
        .await
    }

    pub async fn unverify_identity(
        &self,
        user_id: &str,
        organization_id: &str,
        identity_type: ExternalIdentityType,
        value: &str,
    ) -> RoutingEngineResult<IdentityLink> {
        self.update_identity(
            user_id,
            organization_id,
            identity_type,
            value,
            ExternalIdentity::clear_verification,
        )
        .await
    }

    /// Identities linked to `user_id`, with expired verification shown as unverified.
    pub async fn linked_identities(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> RoutingEngineResult<Vec<ExternalIdentity>> {
        let link_id = identity_link_id(organization_id, user_id);
        let now = self.clock.now();
        let Some(link) = self.store.get_identity_link(&link_id).await? else {
            return Ok(Vec::new());
        };
        Ok(link
            .external_identities
            .into_iter()
            .map(|mut identity| {
                if identity.verified && !identity.is_verified_at(now) {
                    identity.clear_verification();
                }
                identity
            })
            .collect())
    }

    /// Physically clears verification fields whose expiry has passed.
    pub async fn sweep_expired_verifications(&self) -> RoutingEngineResult<usize> {
        let now = self.clock.now();
        let mut cleared = 0_usize;
        for mut link in self.store.list_all_identity_links().await? {
            let mut changed = false;
            for identity in &mut link.external_identities {
                if identity.verified_expires_at.is_some() && !identity.is_verified_at(now) {
                    identity.clear_verification();
                    cleared = cleared.saturating_add(1);
                    changed = true;
                }
            }
            if changed {
                link.updated_at = Some(now);
                self.save_link(link).await?;
            }
        }
        if cleared > 0 {
            tracing::info!(cleared, "expired identity verifications cleared");
        }
        Ok(cleared)
    }

    /// Resolves the sender's user id, minting and linking a synthetic one for
    /// unknown senders.
    pub async fn resolve_or_mint_sender(
        &self,
        message: &NormalizedMessage,
        organization_id: &str,
    ) -> RoutingEngineResult<SenderIdentity> {
        if let Some(user_id) = self
            .lookup(&message.sender_identifier, organization_id)
            .await?
        {
            return Ok(SenderIdentity {
                user_id,
                minted: false,
            });
        }

        let user_id = mint_routing_id(EXTERNAL_USER_ID_PREFIX, self.clock.now());
        let preferred_type = ExternalIdentityType::for_channel(message.channel);
        let identity_type = if preferred_type
            .normalize_value(&message.sender_identifier)
            .is_ok()
        {
            preferred_type
        } else {
            tracing::debug!(
                sender = %message.sender_identifier,
                channel = message.channel.as_str(),
                "sender does not match channel identity format; linking as platform id"
            );
            ExternalIdentityType::PlatformId
        };
        let identity = ExternalIdentity::unverified(identity_type, &message.sender_identifier);
        if let Err(error) = self
            .add_external_identity(&user_id, identity, organization_id)
            .await
        {
            tracing::warn!(
                user_id = %user_id,
                sender = %message.sender_identifier,
                error = %error,
                "minted user could not be linked to sender"
            );
        }
        Ok(SenderIdentity {
            user_id,
            minted: true,
        })
    }

    async fn update_identity<F>(
        &self,
        user_id: &str,
        organization_id: &str,
        identity_type: ExternalIdentityType,
        value: &str,
        apply: F,
    ) -> RoutingEngineResult<IdentityLink>
    where
        F: FnOnce(&mut ExternalIdentity) + Send,
    {
        let user_id = require_user(user_id)?;
        let organization_id = require_organization(organization_id)?;
        let value = identity_type.normalize_value(value)?;
        let link_id = identity_link_id(organization_id, user_id);
        let mut link = self.store.get_identity_link(&link_id).await?.ok_or_else(|| {
            ThreadRoutingError::IdentityLinkNotFound {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
            }
        })?;
        let identity = link
            .find_identity_mut(identity_type, &value)
            .ok_or_else(|| ThreadRoutingError::ExternalIdentityNotFound {
                kind: identity_type.as_str(),
                value: value.clone(),
                user_id: user_id.to_string(),
            })?;
        apply(identity);
        link.updated_at = Some(self.clock.now());
        self.save_link(link).await
    }

    async fn ensure_unclaimed(
        &self,
        user_id: &str,
        organization_id: &str,
        identity: &ExternalIdentity,
    ) -> RoutingEngineResult<()> {
        let links = self.store.list_identity_links(organization_id).await?;
        let claimed = links.iter().find(|link| {
            link.user_id != user_id
                && link
                    .find_identity(identity.identity_type, &identity.value)
                    .is_some()
        });
        match claimed {
            Some(link) => Err(ThreadRoutingError::IdentityConflict {
                kind: identity.identity_type.as_str(),
                value: identity.value.clone(),
                existing_user_id: link.user_id.clone(),
                organization_id: organization_id.to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn save_link(&self, link: IdentityLink) -> RoutingEngineResult<IdentityLink> {
        let organization_id = link.organization_id.clone();
        self.store.put_identity_link(link.clone()).await?;
        self.cache.invalidate_prefix(&organization_id);
        Ok(link)
    }
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

fn require_user(user_id: &str) -> RoutingEngineResult<&str> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err(ThreadRoutingError::InvalidIdentifier {
            kind: "user",
            value: user_id.to_string(),
        });
    }
    Ok(trimmed)
}
