use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use shared::{
    domain::{Event, EventId, UserId},
    error::StoreError,
    record::{parse_event, EventDraft, EventPatch},
};

use crate::{DocumentStore, StorePush, Subscription};

const ERR_TITLE_REQUIRED: &str = "a title is required";
const ERR_NOT_SIGNED_IN: &str = "not signed in";
const FALLBACK_LOAD: &str = "could not load events";
const FALLBACK_CREATE: &str = "could not create event";
const FALLBACK_UPDATE: &str = "could not update event";
const FALLBACK_DELETE: &str = "could not delete event";

const MSG_CREATED: &str = "event created";
const MSG_UPDATED: &str = "event updated";
const MSG_DELETED: &str = "event deleted";

/// Result of the most recently issued mutating command. Exactly one variant
/// is current at any time; `Succeeded`/`Failed` stay current until
/// [`EventSynchronizer::reset_operation_state`] or the next mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Idle,
    InProgress,
    Succeeded(String),
    Failed(String),
}

struct ActiveListener {
    owner: UserId,
    task: JoinHandle<()>,
}

/// Maintains a live, push-updated view of the current session's events and
/// serializes create/update/delete requests against the store.
///
/// The published collection is always a materialized snapshot of the remote
/// one: each push fully replaces it, and local mutations never touch it
/// directly (the view changes only when the resulting push lands).
pub struct EventSynchronizer {
    store: Arc<dyn DocumentStore>,
    identity: watch::Receiver<Option<UserId>>,
    events: watch::Sender<Vec<Event>>,
    outcome: watch::Sender<OperationOutcome>,
    is_loading: watch::Sender<bool>,
    listener: Mutex<Option<ActiveListener>>,
}

impl EventSynchronizer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: watch::Receiver<Option<UserId>>,
    ) -> Arc<Self> {
        let (events, _) = watch::channel(Vec::new());
        let (outcome, _) = watch::channel(OperationOutcome::Idle);
        let (is_loading, _) = watch::channel(false);
        Arc::new(Self {
            store,
            identity,
            events,
            outcome,
            is_loading,
            listener: Mutex::new(None),
        })
    }

    pub fn events(&self) -> watch::Receiver<Vec<Event>> {
        self.events.subscribe()
    }

    pub fn operation_state(&self) -> watch::Receiver<OperationOutcome> {
        self.outcome.subscribe()
    }

    pub fn is_loading(&self) -> watch::Receiver<bool> {
        self.is_loading.subscribe()
    }

    /// Opens the live subscription for the current session identity. Without
    /// a session this is a no-op and the collection stays empty.
    pub async fn start(self: &Arc<Self>) {
        self.open_listener().await;
    }

    /// Closes any open subscription, clears the collection, and re-opens for
    /// the current identity. Must run whenever the active session changes so
    /// one user's events never leak into another's view.
    pub async fn reinitialize_listener(self: &Arc<Self>) {
        info!("sync: reinitializing listener");
        self.events.send_replace(Vec::new());
        self.open_listener().await;
    }

    /// Manual refresh: flags the view as loading and re-subscribes.
    pub async fn reload_events(self: &Arc<Self>) {
        self.is_loading.send_replace(true);
        self.reinitialize_listener().await;
    }

    /// Closes the subscription for good. Also runs implicitly on drop.
    pub async fn shutdown(&self) {
        let previous = self.listener.lock().await.take();
        if let Some(active) = previous {
            stop_listener(active).await;
        }
    }

    async fn open_listener(self: &Arc<Self>) {
        // At most one live subscription per instance: the previous one is
        // fully stopped before a replacement opens.
        let mut guard = self.listener.lock().await;
        if let Some(previous) = guard.take() {
            stop_listener(previous).await;
        }

        let Some(owner) = self.session_owner() else {
            warn!("sync: no active session, listener not started");
            self.is_loading.send_replace(false);
            return;
        };

        let subscription = match self.store.subscribe(&owner).await {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(owner = %owner, "sync: failed to open subscription: {err}");
                self.is_loading.send_replace(false);
                self.outcome
                    .send_replace(OperationOutcome::Failed(store_message(err, FALLBACK_LOAD)));
                return;
            }
        };

        info!(owner = %owner, "sync: listening for events");
        let task = self.spawn_delivery_task(owner.clone(), subscription);
        *guard = Some(ActiveListener { owner, task });
    }

    fn spawn_delivery_task(
        self: &Arc<Self>,
        owner: UserId,
        mut subscription: Subscription,
    ) -> JoinHandle<()> {
        // The task holds only a weak handle, so it never keeps its
        // synchronizer alive: once the last outside handle is gone the
        // drop impl aborts the task, and any push racing that abort finds
        // the upgrade failing and ends the loop.
        let sync = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(push) = subscription.recv().await {
                let Some(sync) = sync.upgrade() else {
                    break;
                };
                match push {
                    StorePush::Snapshot(documents) => {
                        let mut parsed = Vec::with_capacity(documents.len());
                        for document in &documents {
                            match parse_event(document) {
                                Ok(event) => parsed.push(event),
                                Err(err) => {
                                    // One bad record never aborts the snapshot.
                                    warn!(
                                        document_id = %document.id,
                                        "sync: dropping malformed record: {err}"
                                    );
                                }
                            }
                        }
                        // Replace, never merge.
                        sync.events.send_replace(parsed);
                        sync.is_loading.send_replace(false);
                    }
                    StorePush::Error(err) => {
                        error!(owner = %owner, "sync: push delivery failed: {err}");
                        sync.outcome
                            .send_replace(OperationOutcome::Failed(store_message(
                                err,
                                FALLBACK_LOAD,
                            )));
                    }
                }
            }
        })
    }

    pub async fn create_event(&self, title: &str, date: DateTime<Utc>, description: &str) {
        if title.trim().is_empty() {
            self.outcome
                .send_replace(OperationOutcome::Failed(ERR_TITLE_REQUIRED.into()));
            return;
        }
        let Some(owner) = self.session_owner() else {
            self.outcome
                .send_replace(OperationOutcome::Failed(ERR_NOT_SIGNED_IN.into()));
            return;
        };

        self.outcome.send_replace(OperationOutcome::InProgress);
        let draft = EventDraft {
            title: title.to_string(),
            date,
            description: description.to_string(),
            owner_id: owner,
        };
        match self.store.add(&draft).await {
            Ok(id) => {
                info!(event_id = %id, "sync: event created");
                self.outcome
                    .send_replace(OperationOutcome::Succeeded(MSG_CREATED.into()));
            }
            Err(err) => {
                error!("sync: create failed: {err}");
                self.outcome
                    .send_replace(OperationOutcome::Failed(store_message(err, FALLBACK_CREATE)));
            }
        }
    }

    /// Ownership is not re-checked here; the store's access rule is the
    /// authority, and the patch never carries `ownerId`.
    pub async fn update_event(
        &self,
        id: &EventId,
        title: &str,
        date: DateTime<Utc>,
        description: &str,
    ) {
        if title.trim().is_empty() {
            self.outcome
                .send_replace(OperationOutcome::Failed(ERR_TITLE_REQUIRED.into()));
            return;
        }
        if self.session_owner().is_none() {
            self.outcome
                .send_replace(OperationOutcome::Failed(ERR_NOT_SIGNED_IN.into()));
            return;
        }

        self.outcome.send_replace(OperationOutcome::InProgress);
        let patch = EventPatch {
            title: title.to_string(),
            date,
            description: description.to_string(),
        };
        match self.store.update(id, &patch).await {
            Ok(()) => {
                info!(event_id = %id, "sync: event updated");
                self.outcome
                    .send_replace(OperationOutcome::Succeeded(MSG_UPDATED.into()));
            }
            Err(err) => {
                error!(event_id = %id, "sync: update failed: {err}");
                self.outcome
                    .send_replace(OperationOutcome::Failed(store_message(err, FALLBACK_UPDATE)));
            }
        }
    }

    pub async fn delete_event(&self, id: &EventId) {
        if self.session_owner().is_none() {
            self.outcome
                .send_replace(OperationOutcome::Failed(ERR_NOT_SIGNED_IN.into()));
            return;
        }

        self.outcome.send_replace(OperationOutcome::InProgress);
        match self.store.delete(id).await {
            Ok(()) => {
                info!(event_id = %id, "sync: event deleted");
                self.outcome
                    .send_replace(OperationOutcome::Succeeded(MSG_DELETED.into()));
            }
            Err(err) => {
                error!(event_id = %id, "sync: delete failed: {err}");
                self.outcome
                    .send_replace(OperationOutcome::Failed(store_message(err, FALLBACK_DELETE)));
            }
        }
    }

    /// Forces the outcome back to `Idle` once a transient success or error
    /// has been displayed and dismissed.
    pub fn reset_operation_state(&self) {
        self.outcome.send_replace(OperationOutcome::Idle);
    }

    fn session_owner(&self) -> Option<UserId> {
        self.identity.borrow().clone()
    }
}

impl Drop for EventSynchronizer {
    fn drop(&mut self) {
        // The delivery task only holds a weak handle, so the last strong
        // reference really does land here; nobody can hold the lock.
        if let Ok(mut guard) = self.listener.try_lock() {
            if let Some(active) = guard.take() {
                active.task.abort();
            }
        }
    }
}

/// Aborts the delivery task and waits for the cancellation to land, so no
/// push from the old subscription can reach the published state afterwards.
async fn stop_listener(active: ActiveListener) {
    active.task.abort();
    let _ = active.task.await;
    info!(owner = %active.owner, "sync: listener closed");
}

fn store_message(err: StoreError, fallback: &str) -> String {
    if err.message.is_empty() {
        fallback.to_string()
    } else {
        err.message
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
