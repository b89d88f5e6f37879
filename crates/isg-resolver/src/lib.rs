use chrono::Utc;
use isg_core::{derive_scope, GateConfig, ResolvedIdentity, ScopeBlock, VerifiedIdentity};
use isg_storage::{IdentityStore, StorageError, StoreHandle, UserRecord};
use isg_verifier::TokenVerifier;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("identity conflict for external id {external_id}: owner row disappeared during re-link")]
    Conflict { external_id: String },
}

/// How a successful `/verify` changed (or did not change) identity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyDisposition {
    /// Peer was already linked to the owner of this external id; no-op.
    AlreadyVerified,
    /// Peer re-linked to an existing user owning this external id
    /// (cross-channel merge).
    Merged,
    /// Peer's existing channel-only user upgraded in place by binding the
    /// external id.
    Upgraded,
    /// No prior state; a new user was created with the external id set.
    Created,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Verified {
        identity: ResolvedIdentity,
        disposition: VerifyDisposition,
    },
    /// Credential rejected (or no verifier configured). No state change.
    NotVerified,
}

/// Orchestrates the identity store and token verifier to answer "who is
/// this peer" and drive register/verify/merge transitions.
pub struct Resolver {
    store: StoreHandle,
    verifier: Option<TokenVerifier>,
    config: GateConfig,
}

impl Resolver {
    pub fn new(store: StoreHandle, verifier: Option<TokenVerifier>, config: GateConfig) -> Self {
        Self {
            store,
            verifier,
            config,
        }
    }

    /// The underlying store handle, for callers that also talk to the
    /// persistence ledger.
    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Read-only resolution of (channel, peer). Never creates state.
    pub async fn lookup(
        &self,
        channel: &str,
        peer_id: &str,
    ) -> Result<Option<ResolvedIdentity>, ResolveError> {
        let store = self.store.acquire().await?;
        let store = store.lock().await;
        let linked = store.linked_user(channel, peer_id)?;
        Ok(linked.map(|linked| resolved(&linked.user, channel, peer_id)))
    }

    /// Register (or re-register) a peer. First call creates a channel-only
    /// user plus its link; repeat calls are an idempotent name update on
    /// the existing user.
    pub async fn register(
        &self,
        channel: &str,
        peer_id: &str,
        first_name: &str,
        last_name: Option<&str>,
    ) -> Result<ResolvedIdentity, ResolveError> {
        let store = self.store.acquire().await?;
        let store = store.lock().await;
        let now = Utc::now();

        if let Some(linked) = store.linked_user(channel, peer_id)? {
            // An absent last name on re-register keeps the stored one
            // rather than erasing it.
            let last_name = last_name.or(linked.user.last_name.as_deref());
            store.update_user_names(&linked.user.id, Some(first_name), last_name, now)?;
            debug!(channel, peer_id, user_id = %linked.user.id, "re-register updated names");
            let mut identity = resolved(&linked.user, channel, peer_id);
            identity.first_name = Some(first_name.to_string());
            identity.last_name = last_name.map(str::to_string);
            return Ok(identity);
        }

        let user = store.create_user(Some(first_name), last_name, None, now)?;
        store.upsert_link(&user.id, channel, peer_id, now)?;
        info!(channel, peer_id, user_id = %user.id, "registered new user");
        Ok(resolved(&user, channel, peer_id))
    }

    /// Verify a credential for a peer and apply the resulting state
    /// transition. A rejected credential changes nothing.
    pub async fn verify(
        &self,
        channel: &str,
        peer_id: &str,
        credential: &str,
    ) -> Result<VerifyOutcome, ResolveError> {
        let verified = match &self.verifier {
            Some(verifier) => verifier.verify(credential).await,
            None => {
                warn!(channel, peer_id, "verify requested but no verifier is configured");
                None
            }
        };
        let Some(verified) = verified else {
            return Ok(VerifyOutcome::NotVerified);
        };

        let store = self.store.acquire().await?;
        let store = store.lock().await;
        self.apply_verified(&store, channel, peer_id, &verified)
    }

    fn apply_verified(
        &self,
        store: &IdentityStore,
        channel: &str,
        peer_id: &str,
        verified: &VerifiedIdentity,
    ) -> Result<VerifyOutcome, ResolveError> {
        let now = Utc::now();
        let existing_link = store.linked_user(channel, peer_id)?;

        if let Some(linked) = &existing_link {
            if linked.user.external_id.as_deref() == Some(verified.external_id.as_str()) {
                debug!(channel, peer_id, user_id = %linked.user.id, "already verified");
                return Ok(VerifyOutcome::Verified {
                    identity: resolved(&linked.user, channel, peer_id),
                    disposition: VerifyDisposition::AlreadyVerified,
                });
            }
        }

        // An existing owner of this external id absorbs the peer, including
        // the case where the peer was previously linked to a different
        // channel-only user (re-link, last-writer-wins).
        if let Some(owner) = store.user_by_external_id(&verified.external_id)? {
            store.upsert_link(&owner.id, channel, peer_id, now)?;
            info!(channel, peer_id, user_id = %owner.id, "merged peer into existing identity");
            return Ok(VerifyOutcome::Verified {
                identity: resolved(&owner, channel, peer_id),
                disposition: VerifyDisposition::Merged,
            });
        }

        if let Some(linked) = existing_link {
            match store.set_external_id(&linked.user.id, &verified.external_id, now) {
                Ok(()) => {
                    if linked.user.first_name.is_none() && verified.first_name.is_some() {
                        store.update_user_names(
                            &linked.user.id,
                            verified.first_name.as_deref(),
                            verified.last_name.as_deref(),
                            now,
                        )?;
                    }
                    info!(channel, peer_id, user_id = %linked.user.id, "upgraded user with external id");
                    let user = store.user_by_id(&linked.user.id)?.unwrap_or_else(|| {
                        let mut user = linked.user.clone();
                        user.external_id = Some(verified.external_id.clone());
                        user
                    });
                    return Ok(VerifyOutcome::Verified {
                        identity: resolved(&user, channel, peer_id),
                        disposition: VerifyDisposition::Upgraded,
                    });
                }
                // Lost a race for the external id: fall through to re-link.
                Err(StorageError::ExternalIdTaken(_)) => {
                    return self.relink_to_owner(store, channel, peer_id, verified, now)
                }
                Err(err) => return Err(err.into()),
            }
        }

        match store.create_user(
            verified.first_name.as_deref(),
            verified.last_name.as_deref(),
            Some(&verified.external_id),
            now,
        ) {
            Ok(user) => {
                store.upsert_link(&user.id, channel, peer_id, now)?;
                info!(channel, peer_id, user_id = %user.id, "created verified user");
                Ok(VerifyOutcome::Verified {
                    identity: resolved(&user, channel, peer_id),
                    disposition: VerifyDisposition::Created,
                })
            }
            Err(StorageError::ExternalIdTaken(_)) => {
                self.relink_to_owner(store, channel, peer_id, verified, now)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn relink_to_owner(
        &self,
        store: &IdentityStore,
        channel: &str,
        peer_id: &str,
        verified: &VerifiedIdentity,
        now: chrono::DateTime<Utc>,
    ) -> Result<VerifyOutcome, ResolveError> {
        let owner = store
            .user_by_external_id(&verified.external_id)?
            .ok_or_else(|| ResolveError::Conflict {
                external_id: verified.external_id.clone(),
            })?;
        store.upsert_link(&owner.id, channel, peer_id, now)?;
        info!(channel, peer_id, user_id = %owner.id, "merged peer after external id race");
        Ok(VerifyOutcome::Verified {
            identity: resolved(&owner, channel, peer_id),
            disposition: VerifyDisposition::Merged,
        })
    }

    /// Resolve and derive the scope block for a peer. `None` means the peer
    /// is unregistered.
    pub async fn scope(
        &self,
        channel: &str,
        peer_id: &str,
    ) -> Result<Option<ScopeBlock>, ResolveError> {
        let identity = self.lookup(channel, peer_id).await?;
        Ok(identity.map(|identity| self.scope_block(&identity)))
    }

    pub fn scope_block(&self, identity: &ResolvedIdentity) -> ScopeBlock {
        derive_scope(
            identity,
            self.config.require_verified,
            self.config.gating_notice.as_deref(),
        )
    }
}

fn resolved(user: &UserRecord, channel: &str, peer_id: &str) -> ResolvedIdentity {
    ResolvedIdentity {
        user_id: user.id.clone(),
        external_id: user.external_id.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        channel: channel.to_string(),
        peer_id: peer_id.to_string(),
        verified: user.external_id.is_some(),
    }
}
