//! MFA enrollment, verification, disablement, and backup-code issuance.
//!
//! Per-user state machine: `NotEnrolled` → `PendingVerification` → `Enrolled`.
//! The secret and backup codes are generated when enrollment starts and shown
//! exactly once; enrollment only becomes active after the first successful
//! time-based verification. Every verification attempt, either way, lands in
//! the security event log with a `success` flag.

pub mod codes;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use crate::events::{SecurityEvent, SecurityEventKind, SecurityEventLog};
use self::codes::BackupCodeBatch;

pub(crate) const TOTP_CODE_LEN: usize = 6;
const TOTP_STEP_SECONDS: u64 = 30;
// One step of clock skew in either direction.
const TOTP_SKEW: u8 = 1;

/// Logical MFA state for a user, derived from the stored enrollment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MfaState {
    NotEnrolled,
    PendingVerification,
    Enrolled,
}

/// Stored enrollment record. `enabled = false` is the pending state.
#[derive(Clone)]
pub struct MfaEnrollment {
    pub user_id: Uuid,
    pub secret: String,
    pub backup_code_hashes: Vec<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for MfaEnrollment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MfaEnrollment")
            .field("user_id", &self.user_id)
            .field("secret", &"[REDACTED]")
            .field("backup_codes", &self.backup_code_hashes.len())
            .field("enabled", &self.enabled)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl MfaEnrollment {
    #[must_use]
    pub fn state(&self) -> MfaState {
        if self.enabled {
            MfaState::Enrolled
        } else {
            MfaState::PendingVerification
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MfaError {
    #[error("MFA is already enabled")]
    AlreadyEnrolled,
    #[error("no MFA enrollment")]
    NotEnrolled,
    #[error("invalid MFA code")]
    InvalidCode,
    #[error("MFA backend unavailable")]
    Unavailable(#[from] anyhow::Error),
}

/// Storage for MFA enrollments, keyed by user id.
#[async_trait]
pub trait MfaStore: Send + Sync {
    async fn load(&self, user_id: Uuid) -> Result<Option<MfaEnrollment>>;
    async fn upsert(&self, enrollment: &MfaEnrollment) -> Result<()>;

    /// Remove one backup-code hash. Returns `true` only for the call that
    /// actually removed it, so a code cannot be spent twice under races.
    async fn consume_backup_code(&self, user_id: Uuid, code_hash: &str) -> Result<bool>;

    async fn delete(&self, user_id: Uuid) -> Result<()>;
}

/// Opaque "code against secret" capability, tolerating one step of skew.
pub trait CodeVerifier: Send + Sync {
    fn verify(&self, secret_base32: &str, code: &str) -> Result<bool>;
}

/// Time-based implementation backed by the system clock.
pub struct TotpVerifier;

impl CodeVerifier for TotpVerifier {
    fn verify(&self, secret_base32: &str, code: &str) -> Result<bool> {
        let secret_bytes = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|err| anyhow::anyhow!("invalid TOTP secret: {err:?}"))?;
        let totp = TOTP::new(
            Algorithm::SHA1,
            TOTP_CODE_LEN,
            TOTP_SKEW,
            TOTP_STEP_SECONDS,
            secret_bytes,
            None,
            "account".to_string(),
        )
        .map_err(|err| anyhow::anyhow!("failed to initialize TOTP: {err}"))?;
        totp.check_current(code)
            .map_err(|err| anyhow::anyhow!("system clock unavailable: {err}"))
    }
}

/// Client context carried into event details.
#[derive(Clone, Copy, Debug, Default)]
pub struct AttemptContext<'a> {
    pub client_ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Returned once when enrollment starts; the secret is never re-displayed.
pub struct EnrollmentStart {
    pub secret: String,
    pub otpauth_url: String,
    pub backup_codes: Vec<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerifiedMethod {
    Totp,
    BackupCode,
}

impl VerifiedMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::BackupCode => "backup_code",
        }
    }
}

/// Outcome of a successful verification.
#[derive(Clone, Copy, Debug)]
pub struct MfaVerification {
    pub method: VerifiedMethod,
    /// True when this verification completed enrollment.
    pub enrollment_completed: bool,
}

pub struct MfaEngine {
    store: Arc<dyn MfaStore>,
    events: SecurityEventLog,
    verifier: Arc<dyn CodeVerifier>,
    pepper: Arc<[u8]>,
    issuer: String,
}

impl MfaEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn MfaStore>,
        events: SecurityEventLog,
        verifier: Arc<dyn CodeVerifier>,
        pepper: Arc<[u8]>,
        issuer: String,
    ) -> Self {
        Self {
            store,
            events,
            verifier,
            pepper,
            issuer,
        }
    }

    /// # Errors
    /// Returns [`MfaError::Unavailable`] when the store cannot be read.
    pub async fn state(&self, user_id: Uuid) -> Result<MfaState, MfaError> {
        Ok(self
            .store
            .load(user_id)
            .await?
            .map_or(MfaState::NotEnrolled, |enrollment| enrollment.state()))
    }

    /// # Errors
    /// Returns [`MfaError::Unavailable`] when the store cannot be read.
    pub async fn is_enabled(&self, user_id: Uuid) -> Result<bool, MfaError> {
        Ok(self.state(user_id).await? == MfaState::Enrolled)
    }

    /// Start enrollment: generate a secret and backup codes, persist them
    /// disabled, and return the only copy of the plaintext material.
    ///
    /// Restarting a pending enrollment regenerates both; an active enrollment
    /// is rejected.
    ///
    /// # Errors
    /// [`MfaError::AlreadyEnrolled`] when MFA is active for the user;
    /// [`MfaError::Unavailable`] on store or event-log failure.
    pub async fn enable(
        &self,
        user_id: Uuid,
        account_name: &str,
        ctx: AttemptContext<'_>,
    ) -> Result<EnrollmentStart, MfaError> {
        if let Some(existing) = self.store.load(user_id).await? {
            if existing.enabled {
                return Err(MfaError::AlreadyEnrolled);
            }
        }

        let secret_bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|err| anyhow::anyhow!("failed to generate TOTP secret: {err:?}"))?;
        let totp = TOTP::new(
            Algorithm::SHA1,
            TOTP_CODE_LEN,
            TOTP_SKEW,
            TOTP_STEP_SECONDS,
            secret_bytes,
            Some(self.issuer.clone()),
            account_name.to_string(),
        )
        .map_err(|err| anyhow::anyhow!("failed to initialize TOTP: {err}"))?;
        let secret = totp.get_secret_base32();
        let otpauth_url = totp.get_url();

        let batch = BackupCodeBatch::generate(&self.pepper)?;
        let enrollment = MfaEnrollment {
            user_id,
            secret: secret.clone(),
            backup_code_hashes: batch.code_hashes,
            enabled: false,
            created_at: Utc::now(),
        };
        self.store.upsert(&enrollment).await?;

        self.events
            .record(
                SecurityEvent::new(SecurityEventKind::AdminAccess)
                    .with_user(user_id)
                    .with_client_ip(ctx.client_ip)
                    .with_user_agent(ctx.user_agent)
                    .with_detail("action", "mfa_enrollment_started"),
            )
            .await?;

        Ok(EnrollmentStart {
            secret,
            otpauth_url,
            backup_codes: batch.codes,
        })
    }

    /// Verify a submitted code: 6 digits dispatch to the time-based
    /// verifier, 8 normalized characters to the backup-code set, anything
    /// else is rejected before verification. A success against a pending
    /// enrollment activates it.
    ///
    /// # Errors
    /// [`MfaError::NotEnrolled`] without an enrollment;
    /// [`MfaError::InvalidCode`] for any rejected code (the error does not
    /// reveal which part of the submission was wrong);
    /// [`MfaError::Unavailable`] on store or event-log failure.
    pub async fn verify(
        &self,
        user_id: Uuid,
        code: &str,
        ctx: AttemptContext<'_>,
    ) -> Result<MfaVerification, MfaError> {
        let Some(enrollment) = self.store.load(user_id).await? else {
            self.log_failure(Some(user_id), ctx, "mfa_not_enrolled").await?;
            return Err(MfaError::NotEnrolled);
        };

        let trimmed = code.trim();
        let is_totp = trimmed.len() == TOTP_CODE_LEN && trimmed.bytes().all(|b| b.is_ascii_digit());
        let backup_normalized = codes::normalize_backup_code(trimmed).ok();

        if is_totp {
            self.verify_totp(&enrollment, trimmed, ctx).await
        } else if let Some(normalized) = backup_normalized {
            self.verify_backup(&enrollment, &normalized, ctx).await
        } else {
            // Malformed length: rejected before any verification work.
            self.log_failure(Some(user_id), ctx, "malformed_mfa_code")
                .await?;
            Err(MfaError::InvalidCode)
        }
    }

    /// Disable MFA after a fresh successful verification.
    ///
    /// # Errors
    /// [`MfaError::NotEnrolled`] unless MFA is active;
    /// [`MfaError::InvalidCode`] when the fresh verification fails;
    /// [`MfaError::Unavailable`] on store or event-log failure.
    pub async fn disable(
        &self,
        user_id: Uuid,
        code: &str,
        ctx: AttemptContext<'_>,
    ) -> Result<(), MfaError> {
        let enabled = self.is_enabled(user_id).await?;
        if !enabled {
            return Err(MfaError::NotEnrolled);
        }

        self.verify(user_id, code, ctx).await?;
        self.store.delete(user_id).await?;

        self.events
            .record(
                SecurityEvent::new(SecurityEventKind::AdminAccess)
                    .with_user(user_id)
                    .with_client_ip(ctx.client_ip)
                    .with_user_agent(ctx.user_agent)
                    .with_detail("action", "mfa_disabled"),
            )
            .await?;
        Ok(())
    }

    /// Replace the backup-code set; the previous set stops working.
    ///
    /// # Errors
    /// [`MfaError::NotEnrolled`] unless MFA is active;
    /// [`MfaError::Unavailable`] on store or event-log failure.
    pub async fn regenerate_backup_codes(
        &self,
        user_id: Uuid,
        ctx: AttemptContext<'_>,
    ) -> Result<Vec<String>, MfaError> {
        let Some(mut enrollment) = self.store.load(user_id).await? else {
            return Err(MfaError::NotEnrolled);
        };
        if !enrollment.enabled {
            return Err(MfaError::NotEnrolled);
        }

        let batch = BackupCodeBatch::generate(&self.pepper)?;
        enrollment.backup_code_hashes = batch.code_hashes;
        self.store.upsert(&enrollment).await?;

        self.events
            .record(
                SecurityEvent::new(SecurityEventKind::AdminAccess)
                    .with_user(user_id)
                    .with_client_ip(ctx.client_ip)
                    .with_user_agent(ctx.user_agent)
                    .with_detail("action", "backup_codes_regenerated"),
            )
            .await?;
        Ok(batch.codes)
    }

    async fn verify_totp(
        &self,
        enrollment: &MfaEnrollment,
        code: &str,
        ctx: AttemptContext<'_>,
    ) -> Result<MfaVerification, MfaError> {
        let valid = self.verifier.verify(&enrollment.secret, code)?;
        if !valid {
            self.log_failure(Some(enrollment.user_id), ctx, "invalid_mfa_code")
                .await?;
            return Err(MfaError::InvalidCode);
        }

        if enrollment.enabled {
            self.log_verified(enrollment.user_id, ctx, VerifiedMethod::Totp)
                .await?;
            return Ok(MfaVerification {
                method: VerifiedMethod::Totp,
                enrollment_completed: false,
            });
        }

        // First successful time-based code activates the enrollment.
        let mut activated = enrollment.clone();
        activated.enabled = true;
        self.store.upsert(&activated).await?;
        self.events
            .record(
                SecurityEvent::new(SecurityEventKind::MfaEnabled)
                    .with_user(enrollment.user_id)
                    .with_client_ip(ctx.client_ip)
                    .with_user_agent(ctx.user_agent)
                    .with_detail("success", true)
                    .with_detail("method", VerifiedMethod::Totp.as_str()),
            )
            .await?;
        Ok(MfaVerification {
            method: VerifiedMethod::Totp,
            enrollment_completed: true,
        })
    }

    async fn verify_backup(
        &self,
        enrollment: &MfaEnrollment,
        normalized: &str,
        ctx: AttemptContext<'_>,
    ) -> Result<MfaVerification, MfaError> {
        // Backup codes only work once the enrollment is active: completing
        // enrollment must prove the authenticator itself was provisioned.
        if !enrollment.enabled {
            self.log_failure(Some(enrollment.user_id), ctx, "invalid_mfa_code")
                .await?;
            return Err(MfaError::InvalidCode);
        }

        let mut matched = None;
        for hash in &enrollment.backup_code_hashes {
            if codes::verify_backup_code(normalized, hash, &self.pepper)? {
                matched = Some(hash.clone());
                break;
            }
        }
        let Some(hash) = matched else {
            self.log_failure(Some(enrollment.user_id), ctx, "invalid_mfa_code")
                .await?;
            return Err(MfaError::InvalidCode);
        };

        // Single use: only the call that removes the hash wins.
        let consumed = self
            .store
            .consume_backup_code(enrollment.user_id, &hash)
            .await?;
        if !consumed {
            self.log_failure(Some(enrollment.user_id), ctx, "invalid_mfa_code")
                .await?;
            return Err(MfaError::InvalidCode);
        }

        self.log_verified(enrollment.user_id, ctx, VerifiedMethod::BackupCode)
            .await?;
        Ok(MfaVerification {
            method: VerifiedMethod::BackupCode,
            enrollment_completed: false,
        })
    }

    async fn log_failure(
        &self,
        user_id: Option<Uuid>,
        ctx: AttemptContext<'_>,
        reason: &str,
    ) -> Result<(), MfaError> {
        let mut event = SecurityEvent::new(SecurityEventKind::FailedLogin)
            .with_client_ip(ctx.client_ip)
            .with_user_agent(ctx.user_agent)
            .with_detail("stage", "mfa_verify")
            .with_detail("reason", reason)
            .with_detail("success", false);
        if let Some(user_id) = user_id {
            event = event.with_user(user_id);
        }
        self.events.record(event).await?;
        Ok(())
    }

    async fn log_verified(
        &self,
        user_id: Uuid,
        ctx: AttemptContext<'_>,
        method: VerifiedMethod,
    ) -> Result<(), MfaError> {
        self.events
            .record(
                SecurityEvent::new(SecurityEventKind::AdminAccess)
                    .with_user(user_id)
                    .with_client_ip(ctx.client_ip)
                    .with_user_agent(ctx.user_agent)
                    .with_detail("action", "mfa_verify")
                    .with_detail("success", true)
                    .with_detail("method", method.as_str()),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{AttemptContext, CodeVerifier, MfaEngine, MfaError, MfaState};
    use crate::events::{EventFilter, SecurityEventKind, SecurityEventLog};
    use crate::store::memory::{MemoryEventStore, MemoryMfaStore};
    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct FixedCodeVerifier {
        accept: &'static str,
        calls: AtomicUsize,
    }

    impl FixedCodeVerifier {
        fn new(accept: &'static str) -> Arc<Self> {
            Arc::new(Self {
                accept,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl CodeVerifier for FixedCodeVerifier {
        fn verify(&self, _secret: &str, code: &str) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(code == self.accept)
        }
    }

    fn engine(
        verifier: Arc<FixedCodeVerifier>,
    ) -> (MfaEngine, Arc<MemoryEventStore>) {
        let event_store = Arc::new(MemoryEventStore::new());
        let events = SecurityEventLog::new(event_store.clone());
        let engine = MfaEngine::new(
            Arc::new(MemoryMfaStore::new()),
            events,
            verifier,
            Arc::from(b"test-pepper".as_slice()),
            "Vetrina Admin".to_string(),
        );
        (engine, event_store)
    }

    async fn events_of_kind(store: &MemoryEventStore, kind: SecurityEventKind) -> usize {
        let since = Utc.timestamp_opt(0, 0).single().unwrap();
        store
            .recent_events(&EventFilter::kind(kind), since)
            .await
            .len()
    }

    #[tokio::test]
    async fn enrollment_completes_with_totp_code() {
        let verifier = FixedCodeVerifier::new("123456");
        let (engine, event_store) = engine(verifier);
        let user = Uuid::new_v4();

        let start = engine
            .enable(user, "admin@example.com", AttemptContext::default())
            .await
            .unwrap();
        assert!(!start.secret.is_empty());
        assert!(start.otpauth_url.starts_with("otpauth://totp/"));
        assert_eq!(start.backup_codes.len(), 10);
        assert_eq!(engine.state(user).await.unwrap(), MfaState::PendingVerification);

        let verification = engine
            .verify(user, "123456", AttemptContext::default())
            .await
            .unwrap();
        assert!(verification.enrollment_completed);
        assert_eq!(engine.state(user).await.unwrap(), MfaState::Enrolled);
        assert_eq!(
            events_of_kind(&event_store, SecurityEventKind::MfaEnabled).await,
            1
        );
    }

    #[tokio::test]
    async fn enable_on_active_enrollment_is_rejected() {
        let verifier = FixedCodeVerifier::new("123456");
        let (engine, _events) = engine(verifier);
        let user = Uuid::new_v4();

        engine
            .enable(user, "admin@example.com", AttemptContext::default())
            .await
            .unwrap();
        engine
            .verify(user, "123456", AttemptContext::default())
            .await
            .unwrap();

        let result = engine
            .enable(user, "admin@example.com", AttemptContext::default())
            .await;
        assert!(matches!(result, Err(MfaError::AlreadyEnrolled)));
    }

    #[tokio::test]
    async fn verify_without_enrollment_is_rejected() {
        let verifier = FixedCodeVerifier::new("123456");
        let (engine, _events) = engine(verifier);
        let result = engine
            .verify(Uuid::new_v4(), "123456", AttemptContext::default())
            .await;
        assert!(matches!(result, Err(MfaError::NotEnrolled)));
    }

    #[tokio::test]
    async fn malformed_length_is_rejected_before_dispatch() {
        let verifier = FixedCodeVerifier::new("123456");
        let (engine, event_store) = engine(verifier.clone());
        let user = Uuid::new_v4();
        engine
            .enable(user, "admin@example.com", AttemptContext::default())
            .await
            .unwrap();

        let result = engine
            .verify(user, "12345", AttemptContext::default())
            .await;
        assert!(matches!(result, Err(MfaError::InvalidCode)));
        // Neither the time-based verifier nor the backup set was consulted.
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            events_of_kind(&event_store, SecurityEventKind::FailedLogin).await,
            1
        );
    }

    #[tokio::test]
    async fn six_digit_codes_dispatch_to_the_time_based_verifier() {
        let verifier = FixedCodeVerifier::new("654321");
        let (engine, _events) = engine(verifier.clone());
        let user = Uuid::new_v4();
        engine
            .enable(user, "admin@example.com", AttemptContext::default())
            .await
            .unwrap();

        let _ = engine.verify(user, "000000", AttemptContext::default()).await;
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backup_codes_are_single_use() {
        let verifier = FixedCodeVerifier::new("123456");
        let (engine, _events) = engine(verifier.clone());
        let user = Uuid::new_v4();
        let start = engine
            .enable(user, "admin@example.com", AttemptContext::default())
            .await
            .unwrap();
        engine
            .verify(user, "123456", AttemptContext::default())
            .await
            .unwrap();

        let backup = start.backup_codes[0].clone();
        let verification = engine
            .verify(user, &backup, AttemptContext::default())
            .await
            .unwrap();
        assert!(!verification.enrollment_completed);
        // The time-based verifier is not consulted for 8-character codes.
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);

        let result = engine.verify(user, &backup, AttemptContext::default()).await;
        assert!(matches!(result, Err(MfaError::InvalidCode)));
    }

    #[tokio::test]
    async fn backup_codes_do_not_complete_enrollment() {
        let verifier = FixedCodeVerifier::new("123456");
        let (engine, _events) = engine(verifier);
        let user = Uuid::new_v4();
        let start = engine
            .enable(user, "admin@example.com", AttemptContext::default())
            .await
            .unwrap();

        let result = engine
            .verify(user, &start.backup_codes[0], AttemptContext::default())
            .await;
        assert!(matches!(result, Err(MfaError::InvalidCode)));
        assert_eq!(
            engine.state(user).await.unwrap(),
            MfaState::PendingVerification
        );
    }

    #[tokio::test]
    async fn regeneration_invalidates_previous_codes() {
        let verifier = FixedCodeVerifier::new("123456");
        let (engine, _events) = engine(verifier);
        let user = Uuid::new_v4();
        let start = engine
            .enable(user, "admin@example.com", AttemptContext::default())
            .await
            .unwrap();
        engine
            .verify(user, "123456", AttemptContext::default())
            .await
            .unwrap();

        let fresh = engine
            .regenerate_backup_codes(user, AttemptContext::default())
            .await
            .unwrap();
        assert_eq!(fresh.len(), 10);

        let stale = engine
            .verify(user, &start.backup_codes[0], AttemptContext::default())
            .await;
        assert!(matches!(stale, Err(MfaError::InvalidCode)));

        engine
            .verify(user, &fresh[0], AttemptContext::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disable_requires_fresh_verification_and_clears_state() {
        let verifier = FixedCodeVerifier::new("123456");
        let (engine, _events) = engine(verifier);
        let user = Uuid::new_v4();
        engine
            .enable(user, "admin@example.com", AttemptContext::default())
            .await
            .unwrap();
        engine
            .verify(user, "123456", AttemptContext::default())
            .await
            .unwrap();

        let result = engine
            .disable(user, "999999", AttemptContext::default())
            .await;
        assert!(matches!(result, Err(MfaError::InvalidCode)));
        assert_eq!(engine.state(user).await.unwrap(), MfaState::Enrolled);

        engine
            .disable(user, "123456", AttemptContext::default())
            .await
            .unwrap();
        assert_eq!(engine.state(user).await.unwrap(), MfaState::NotEnrolled);
    }
}
