use async_trait::async_trait;
use tokio::sync::mpsc;

use shared::{
    domain::{EventId, UserId},
    error::{AuthError, StoreError},
    record::{EventDraft, EventPatch, RawDocument},
};

pub mod durable_backend;
pub mod session;
pub mod sync;

pub use durable_backend::{DurableDocumentStore, DurableIdentityProvider};
pub use session::{AuthState, SessionManager};
pub use sync::{EventSynchronizer, OperationOutcome};

/// Remote identity provider seam. Injected into [`SessionManager`] so tests
/// can substitute doubles; never reached through ambient globals.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<UserId, AuthError>;
    async fn create_account(&self, email: &str, password: &str) -> Result<UserId, AuthError>;
    async fn sign_out(&self) -> Result<(), AuthError>;
    /// An already-valid persisted session, if the provider has one.
    async fn current_identity(&self) -> Option<UserId>;
}

/// One delivery from an open live query.
#[derive(Debug, Clone)]
pub enum StorePush {
    /// Complete snapshot of the subscribed collection, already filtered to
    /// the owner and sorted date-descending by the store.
    Snapshot(Vec<RawDocument>),
    /// Transport or permission failure. Does not terminate the stream.
    Error(StoreError),
}

/// Handle to an open live query. Dropping it closes the subscription; the
/// store sees the closed channel and stops pushing.
pub struct Subscription {
    receiver: mpsc::Receiver<StorePush>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<StorePush>) -> Self {
        Self { receiver }
    }

    /// Next delivery, or `None` once the store side has hung up.
    pub async fn recv(&mut self) -> Option<StorePush> {
        self.receiver.recv().await
    }
}

/// Remote document store seam for the event collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Opens a live query over `owner`'s events, date descending. The first
    /// delivery is the current snapshot; every later mutation to the
    /// collection pushes a fresh one.
    async fn subscribe(&self, owner: &UserId) -> Result<Subscription, StoreError>;
    async fn add(&self, draft: &EventDraft) -> Result<EventId, StoreError>;
    async fn update(&self, id: &EventId, patch: &EventPatch) -> Result<(), StoreError>;
    async fn delete(&self, id: &EventId) -> Result<(), StoreError>;
}

/// Placeholder provider for a client constructed without an identity backend.
pub struct MissingIdentityProvider;

#[async_trait]
impl IdentityProvider for MissingIdentityProvider {
    async fn sign_in(&self, _email: &str, _password: &str) -> Result<UserId, AuthError> {
        Err(AuthError::Provider("identity provider is unavailable".into()))
    }

    async fn create_account(&self, _email: &str, _password: &str) -> Result<UserId, AuthError> {
        Err(AuthError::Provider("identity provider is unavailable".into()))
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        Err(AuthError::Provider("identity provider is unavailable".into()))
    }

    async fn current_identity(&self) -> Option<UserId> {
        None
    }
}

/// Placeholder store for a client constructed without a document backend.
pub struct MissingDocumentStore;

#[async_trait]
impl DocumentStore for MissingDocumentStore {
    async fn subscribe(&self, owner: &UserId) -> Result<Subscription, StoreError> {
        Err(StoreError::unavailable(format!(
            "document store is unavailable for owner {owner}"
        )))
    }

    async fn add(&self, _draft: &EventDraft) -> Result<EventId, StoreError> {
        Err(StoreError::unavailable("document store is unavailable"))
    }

    async fn update(&self, _id: &EventId, _patch: &EventPatch) -> Result<(), StoreError> {
        Err(StoreError::unavailable("document store is unavailable"))
    }

    async fn delete(&self, _id: &EventId) -> Result<(), StoreError> {
        Err(StoreError::unavailable("document store is unavailable"))
    }
}
