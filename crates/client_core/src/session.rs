use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use shared::{domain::UserId, error::AuthError};

use crate::IdentityProvider;

const ERR_LOGIN_FIELDS_REQUIRED: &str = "email and password are required";
const ERR_REGISTER_FIELDS_REQUIRED: &str = "all fields are required";
const ERR_PASSWORDS_DIFFER: &str = "passwords do not match";
const ERR_PASSWORD_TOO_SHORT: &str = "password must be at least 6 characters";
const FALLBACK_SIGN_IN: &str = "could not sign in";
const FALLBACK_REGISTER: &str = "could not create account";

const MIN_PASSWORD_LEN: usize = 6;

/// Authentication status as the presentation layer observes it. `Error` is
/// transient: it stays current until [`SessionManager::reset_auth_state`] or
/// the next operation replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    Loading,
    Authenticated,
    Error(String),
}

/// Mediates authentication against the injected identity provider and
/// publishes the current state plus the resolved identity.
///
/// Validation failures resolve synchronously and never reach the provider;
/// only validated requests transition through `Loading`.
pub struct SessionManager {
    provider: Arc<dyn IdentityProvider>,
    auth_state: watch::Sender<AuthState>,
    identity: watch::Sender<Option<UserId>>,
}

impl SessionManager {
    /// Builds the manager, restoring an already-valid provider session when
    /// one exists. A restored session starts the state machine in
    /// `Authenticated`, which is what decides the app's initial route.
    pub async fn initialize(provider: Arc<dyn IdentityProvider>) -> Self {
        let restored = provider.current_identity().await;
        let initial_state = if restored.is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Idle
        };
        if let Some(user) = &restored {
            info!(user_id = %user, "auth: restored persisted session");
        }
        let (auth_state, _) = watch::channel(initial_state);
        let (identity, _) = watch::channel(restored);
        Self {
            provider,
            auth_state,
            identity,
        }
    }

    pub fn auth_state(&self) -> watch::Receiver<AuthState> {
        self.auth_state.subscribe()
    }

    pub fn identity(&self) -> watch::Receiver<Option<UserId>> {
        self.identity.subscribe()
    }

    pub fn current_identity(&self) -> Option<UserId> {
        self.identity.borrow().clone()
    }

    pub async fn login(&self, email: &str, password: &str) {
        if email.trim().is_empty() || password.trim().is_empty() {
            self.auth_state
                .send_replace(AuthState::Error(ERR_LOGIN_FIELDS_REQUIRED.into()));
            return;
        }

        self.auth_state.send_replace(AuthState::Loading);
        match self.provider.sign_in(email, password).await {
            Ok(user) => {
                info!(user_id = %user, "auth: signed in");
                self.identity.send_replace(Some(user));
                self.auth_state.send_replace(AuthState::Authenticated);
            }
            Err(err) => {
                warn!("auth: sign-in failed: {err}");
                self.auth_state
                    .send_replace(AuthState::Error(provider_message(err, FALLBACK_SIGN_IN)));
            }
        }
    }

    pub async fn register(&self, email: &str, password: &str, confirm_password: &str) {
        // Ordered checks; the first failure wins and nothing reaches the
        // provider.
        let validation_error = if email.trim().is_empty()
            || password.trim().is_empty()
            || confirm_password.trim().is_empty()
        {
            Some(ERR_REGISTER_FIELDS_REQUIRED)
        } else if password != confirm_password {
            Some(ERR_PASSWORDS_DIFFER)
        } else if password.chars().count() < MIN_PASSWORD_LEN {
            Some(ERR_PASSWORD_TOO_SHORT)
        } else {
            None
        };
        if let Some(message) = validation_error {
            self.auth_state
                .send_replace(AuthState::Error(message.into()));
            return;
        }

        self.auth_state.send_replace(AuthState::Loading);
        match self.provider.create_account(email, password).await {
            Ok(user) => {
                info!(user_id = %user, "auth: account created");
                self.identity.send_replace(Some(user));
                self.auth_state.send_replace(AuthState::Authenticated);
            }
            Err(err) => {
                warn!("auth: registration failed: {err}");
                self.auth_state
                    .send_replace(AuthState::Error(provider_message(err, FALLBACK_REGISTER)));
            }
        }
    }

    /// Clears the remote session and local identity. Idempotent: signing out
    /// while signed out still leaves the machine in `Idle`.
    pub async fn logout(&self) {
        if let Err(err) = self.provider.sign_out().await {
            warn!("auth: provider sign-out failed: {err}");
        }
        self.identity.send_replace(None);
        self.auth_state.send_replace(AuthState::Idle);
        info!("auth: signed out");
    }

    /// Forces the state back to `Idle` so a stale error does not reappear
    /// after navigating away.
    pub fn reset_auth_state(&self) {
        self.auth_state.send_replace(AuthState::Idle);
    }
}

fn provider_message(err: AuthError, fallback: &str) -> String {
    let text = err.to_string();
    if text.is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
