use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use shared::{
    domain::{EventId, UserId},
    error::{AuthError, StoreError},
    record::{EventDraft, EventPatch},
};
use storage::Storage;

use crate::{DocumentStore, IdentityProvider, StorePush, Subscription};

const PUSH_BUFFER: usize = 16;

/// Identity provider backed by the local SQLite storage. Persists the active
/// session so a later cold start restores it without re-authenticating.
pub struct DurableIdentityProvider {
    storage: Storage,
}

impl DurableIdentityProvider {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl IdentityProvider for DurableIdentityProvider {
    async fn sign_in(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        let user = self
            .storage
            .verify_credentials(email, password)
            .await
            .map_err(|err| AuthError::Provider(err.to_string()))?
            .ok_or(AuthError::InvalidCredentials)?;
        self.storage
            .set_active_session(&user)
            .await
            .map_err(|err| AuthError::Provider(err.to_string()))?;
        Ok(user)
    }

    async fn create_account(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        let user = self
            .storage
            .create_account(email, password)
            .await
            .map_err(|err| {
                if err.to_string().contains("already registered") {
                    AuthError::EmailTaken
                } else {
                    AuthError::Provider(err.to_string())
                }
            })?;
        self.storage
            .set_active_session(&user)
            .await
            .map_err(|err| AuthError::Provider(err.to_string()))?;
        Ok(user)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.storage
            .clear_active_session()
            .await
            .map_err(|err| AuthError::Provider(err.to_string()))
    }

    async fn current_identity(&self) -> Option<UserId> {
        match self.storage.active_session().await {
            Ok(session) => session,
            Err(err) => {
                warn!("auth: failed to read persisted session: {err}");
                None
            }
        }
    }
}

/// Document store backed by the local SQLite storage. Subscriptions deliver
/// an initial snapshot and then re-query on every change-feed notice, so each
/// push is a complete owner-scoped, date-descending snapshot.
pub struct DurableDocumentStore {
    storage: Storage,
}

impl DurableDocumentStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DocumentStore for DurableDocumentStore {
    async fn subscribe(&self, owner: &UserId) -> Result<Subscription, StoreError> {
        let initial = self
            .storage
            .documents_for_owner(owner)
            .await
            .map_err(|err| StoreError::internal(err.to_string()))?;

        let mut changes = self.storage.subscribe_changes();
        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        let storage = self.storage.clone();
        let owner = owner.clone();
        tokio::spawn(async move {
            if tx.send(StorePush::Snapshot(initial)).await.is_err() {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(()) => {}
                    // Lagging only means notices were coalesced; the
                    // re-query below yields the latest snapshot anyway.
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let push = match storage.documents_for_owner(&owner).await {
                    Ok(documents) => StorePush::Snapshot(documents),
                    Err(err) => StorePush::Error(StoreError::internal(err.to_string())),
                };
                if tx.send(push).await.is_err() {
                    // Subscriber hung up; stop pushing.
                    break;
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    async fn add(&self, draft: &EventDraft) -> Result<EventId, StoreError> {
        self.storage
            .insert_event(draft)
            .await
            .map_err(|err| StoreError::internal(err.to_string()))
    }

    async fn update(&self, id: &EventId, patch: &EventPatch) -> Result<(), StoreError> {
        let updated = self
            .storage
            .update_event(id, patch)
            .await
            .map_err(|err| StoreError::internal(err.to_string()))?;
        if !updated {
            return Err(StoreError::not_found(format!("no event with id {id}")));
        }
        Ok(())
    }

    async fn delete(&self, id: &EventId) -> Result<(), StoreError> {
        // Deleting an absent record is not an error, matching the remote
        // store's own delete semantics.
        self.storage
            .delete_event(id)
            .await
            .map(|_| ())
            .map_err(|err| StoreError::internal(err.to_string()))
    }
}
