use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::auth;
use crate::storage;
use crate::supabase::TokenProvider;

const ONBOARDING_KEY: &str = "onboarding_completed";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not signed in")]
    NoActiveSession,
    #[error("session not found")]
    NotFound,
}

/// The signed-in viewer. Passed explicitly into every operation that acts
/// on behalf of a user.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub username: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// True when the access token expires within `skew`.
    pub fn expires_within(&self, skew: chrono::Duration) -> bool {
        self.expires_at - skew <= Utc::now()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("username", &self.username)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Owns the active session and keeps the local store in sync with it.
pub struct Manager {
    store: Arc<storage::Store>,
    active: RwLock<Option<Session>>,
}

impl Manager {
    pub fn new(store: Arc<storage::Store>) -> Self {
        Self {
            store,
            active: RwLock::new(None),
        }
    }

    /// Restores the most recently stored session, if there is one.
    pub fn load_existing(&self) -> Result<Option<Session>> {
        let restored = self.store.latest_session()?;
        if let Some(session) = &restored {
            log::debug!("session: restored session for {}", session.user_id);
        }
        *self.active.write() = restored.clone();
        Ok(restored)
    }

    pub fn active(&self) -> Option<Session> {
        self.active.read().clone()
    }

    pub fn require(&self) -> Result<Session, SessionError> {
        self.active().ok_or(SessionError::NoActiveSession)
    }

    /// Makes `session` active and persists it.
    pub fn activate(&self, session: Session) -> Result<Session> {
        self.store.upsert_session(&session)?;
        *self.active.write() = Some(session.clone());
        Ok(session)
    }

    /// Switches to a session stored earlier for `user_id`.
    pub fn switch(&self, user_id: &str) -> Result<Session> {
        let session = self
            .store
            .get_session(user_id)?
            .ok_or(SessionError::NotFound)?;
        *self.active.write() = Some(session.clone());
        Ok(session)
    }

    pub fn sign_in(&self, client: &auth::Client, email: &str, password: &str) -> Result<Session> {
        let session = client.sign_in(email, password)?;
        self.activate(session)
    }

    /// Refreshes the active session when it is about to expire.
    pub fn refresh_if_expiring(
        &self,
        client: &auth::Client,
        skew: chrono::Duration,
    ) -> Result<Option<Session>> {
        let Some(current) = self.active() else {
            return Ok(None);
        };
        if !current.expires_within(skew) {
            return Ok(Some(current));
        }
        let refreshed = client.refresh(&current)?;
        self.activate(refreshed).map(Some)
    }

    /// Signs out remotely when a client is given, then forgets the session
    /// and the onboarding flag locally. A failed remote sign-out is logged
    /// and does not keep the local session alive.
    pub fn sign_out(&self, client: Option<&auth::Client>) -> Result<()> {
        let current = self.active.write().take().ok_or(SessionError::NoActiveSession)?;
        if let Some(client) = client {
            if let Err(err) = client.sign_out(&current) {
                log::warn!("session: remote sign out failed: {:#}", err);
            }
        }
        self.store.delete_session(&current.user_id)?;
        self.store.delete_preference(ONBOARDING_KEY)?;
        Ok(())
    }

    pub fn onboarding_completed(&self) -> Result<bool> {
        Ok(self
            .store
            .get_preference(ONBOARDING_KEY)?
            .map_or(false, |value| value == "true"))
    }

    pub fn complete_onboarding(&self) -> Result<()> {
        self.store.set_preference(ONBOARDING_KEY, "true")
    }
}

impl TokenProvider for Manager {
    fn access_token(&self) -> Option<String> {
        self.active.read().as_ref().map(|s| s.access_token.clone())
    }
}
