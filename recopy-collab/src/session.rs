//! Edit-session validation.
//!
//! Nothing is relayed or persisted on behalf of a caller until its token
//! resolves to an unexpired session for the target site.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use uuid::Uuid;

/// An authorization to edit one site.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct EditSession {
    pub token: String,
    pub site_id: Uuid,
    pub user_id: Uuid,
    pub user_email: String,
    pub user_name: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// When set, only requests from this address are accepted.
    pub ip_address: Option<String>,
}

impl EditSession {
    pub fn new(site_id: Uuid, user_id: Uuid, user_email: impl Into<String>, ttl: Duration) -> Self {
        Self {
            token: random_token(),
            site_id,
            user_id,
            user_email: user_email.into(),
            user_name: None,
            expires_at: Utc::now() + ttl,
            ip_address: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn bound_to(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Token, site, expiry and (if bound) address all match.
    pub fn permits(&self, request: &SessionRequest, now: DateTime<Utc>) -> bool {
        if self.token != request.token || self.site_id != request.site_id {
            return false;
        }
        if self.is_expired(now) {
            return false;
        }
        match (&self.ip_address, &request.ip_address) {
            (Some(bound), Some(actual)) => bound == actual,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

impl fmt::Debug for EditSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditSession")
            .field("token", &"<redacted>")
            .field("site_id", &self.site_id)
            .field("user_id", &self.user_id)
            .field("user_email", &self.user_email)
            .field("expires_at", &self.expires_at)
            .field("ip_address", &self.ip_address)
            .finish_non_exhaustive()
    }
}

/// What a caller presents when asking to edit a site.
#[derive(Clone, PartialEq)]
pub struct SessionRequest {
    pub token: String,
    pub site_id: Uuid,
    pub ip_address: Option<String>,
}

impl SessionRequest {
    pub fn new(token: impl Into<String>, site_id: Uuid) -> Self {
        Self {
            token: token.into(),
            site_id,
            ip_address: None,
        }
    }

    pub fn from_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }
}

impl fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRequest")
            .field("token", &"<redacted>")
            .field("site_id", &self.site_id)
            .field("ip_address", &self.ip_address)
            .finish()
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The session backend could not be reached.
    #[error("Session backend unavailable: {0}")]
    Unavailable(String),
    #[error("Corrupt session record: {0}")]
    Corrupt(String),
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Unavailable(_))
    }
}

/// Resolves session tokens to edit sessions.
///
/// `Ok(None)` means the request is not authorized: unknown token, wrong
/// site, expired, or a bound address mismatch.
pub trait EditSessionValidator: Send + Sync {
    fn validate_edit_session(
        &self,
        request: &SessionRequest,
    ) -> Result<Option<EditSession>, SessionError>;
}

/// Process-local session table.
#[derive(Default)]
pub struct InMemorySessions {
    sessions: RwLock<HashMap<String, EditSession>>,
}

impl InMemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh session with a random token.
    pub fn issue(
        &self,
        site_id: Uuid,
        user_id: Uuid,
        user_email: impl Into<String>,
        ttl: Duration,
    ) -> Result<EditSession, SessionError> {
        let session = EditSession::new(site_id, user_id, user_email, ttl);
        self.insert(session.clone())?;
        Ok(session)
    }

    pub fn insert(&self, session: EditSession) -> Result<(), SessionError> {
        self.write()?.insert(session.token.clone(), session);
        Ok(())
    }

    pub fn revoke(&self, token: &str) -> Result<bool, SessionError> {
        Ok(self.write()?.remove(token).is_some())
    }

    /// Drop expired sessions; returns how many were removed.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, SessionError> {
        let mut sessions = self.write()?;
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));
        Ok(before - sessions.len())
    }

    pub fn len(&self) -> Result<usize, SessionError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, SessionError> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, EditSession>>, SessionError> {
        self.sessions
            .read()
            .map_err(|e| SessionError::Unavailable(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, EditSession>>, SessionError> {
        self.sessions
            .write()
            .map_err(|e| SessionError::Unavailable(e.to_string()))
    }
}

impl EditSessionValidator for InMemorySessions {
    fn validate_edit_session(
        &self,
        request: &SessionRequest,
    ) -> Result<Option<EditSession>, SessionError> {
        Ok(self
            .read()?
            .get(&request.token)
            .filter(|session| session.permits(request, Utc::now()))
            .cloned())
    }
}

/// 32 random bytes, hex-encoded.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
