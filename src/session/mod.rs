//! Admin session issuance, validation, and revocation.
//!
//! Tokens are random, returned to the caller exactly once, and stored only as
//! SHA-256 hashes. TTL is fixed at creation: validation never extends a
//! session, which bounds the blast radius of a stolen admin token. Revocation
//! is permanent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::events::{SecurityEvent, SecurityEventKind, SecurityEventLog};

const TOKEN_CREATE_ATTEMPTS: usize = 3;

/// One admin session row. Mutated only to set `revoked`.
#[derive(Clone, Debug)]
pub struct AdminSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: Vec<u8>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl AdminSession {
    /// Validity as a pure predicate, so expiry semantics are testable
    /// without a live clock: valid iff not revoked and not yet expired.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

/// Insert outcome; `Conflict` signals a token-hash collision.
#[derive(Debug)]
pub enum SessionInsert {
    Inserted,
    Conflict,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &AdminSession) -> Result<SessionInsert>;
    async fn get(&self, token_hash: &[u8]) -> Result<Option<AdminSession>>;

    /// Set `revoked = true`. Idempotent; revocation is never undone.
    async fn revoke(&self, token_hash: &[u8]) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session store unavailable")]
    Unavailable(#[from] anyhow::Error),
    #[error("failed to generate a unique session token")]
    TokenCollision,
}

/// Create a new session token.
/// The raw value is only returned to the caller; storage sees a hash.
pub(crate) fn generate_session_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a session token so raw values never touch the store.
#[must_use]
pub(crate) fn hash_session_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// A freshly issued session plus the one-time raw token.
pub struct NewAdminSession {
    pub session: AdminSession,
    pub token: String,
}

pub struct AdminSessionManager {
    store: Arc<dyn SessionStore>,
    events: SecurityEventLog,
    ttl: Duration,
}

impl AdminSessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, events: SecurityEventLog, ttl: Duration) -> Self {
        Self { store, events, ttl }
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX)
    }

    /// Issue a session for `user_id` with the fixed TTL.
    ///
    /// Retries on token-hash collision rather than overwriting a live row.
    ///
    /// # Errors
    /// [`SessionError::Unavailable`] when the store is unreachable;
    /// [`SessionError::TokenCollision`] when generation keeps colliding.
    pub async fn create(
        &self,
        user_id: Uuid,
        client_ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<NewAdminSession, SessionError> {
        let ttl =
            ChronoDuration::from_std(self.ttl).context("session TTL out of range")?;
        for _ in 0..TOKEN_CREATE_ATTEMPTS {
            let token = generate_session_token()?;
            let created_at = Utc::now();
            let session = AdminSession {
                id: Uuid::new_v4(),
                user_id,
                token_hash: hash_session_token(&token),
                client_ip: client_ip.map(str::to_string),
                user_agent: user_agent.map(str::to_string),
                created_at,
                expires_at: created_at + ttl,
                revoked: false,
            };
            match self.store.insert(&session).await? {
                SessionInsert::Inserted => return Ok(NewAdminSession { session, token }),
                SessionInsert::Conflict => {}
            }
        }
        Err(SessionError::TokenCollision)
    }

    /// Resolve a raw token into its session, if still valid.
    ///
    /// Returns `Ok(None)` for unknown, revoked, and expired tokens alike.
    /// A successful validation is recorded as an `admin_access` event.
    ///
    /// # Errors
    /// [`SessionError::Unavailable`] when the store or event log is
    /// unreachable — validation then fails closed.
    pub async fn validate(&self, token: &str) -> Result<Option<AdminSession>, SessionError> {
        let token_hash = hash_session_token(token);
        let Some(session) = self.store.get(&token_hash).await? else {
            return Ok(None);
        };
        if !session.is_valid_at(Utc::now()) {
            return Ok(None);
        }

        self.events
            .record(
                SecurityEvent::new(SecurityEventKind::AdminAccess)
                    .with_user(session.user_id)
                    .with_client_ip(session.client_ip.as_deref())
                    .with_user_agent(session.user_agent.as_deref())
                    .with_detail("action", "session_validated")
                    .with_detail("session_id", session.id.to_string()),
            )
            .await?;
        Ok(Some(session))
    }

    /// Revoke the session behind `token`. Idempotent and irreversible;
    /// unknown tokens are a no-op.
    ///
    /// # Errors
    /// [`SessionError::Unavailable`] when the store is unreachable.
    pub async fn terminate(&self, token: &str) -> Result<(), SessionError> {
        let token_hash = hash_session_token(token);
        self.store.revoke(&token_hash).await?;
        Ok(())
    }
}
