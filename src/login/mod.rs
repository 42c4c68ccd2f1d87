//! Top-level admin login state machine.
//!
//! One pass per attempt: rate limit → address gate → delegated credential
//! check → role check → MFA → suspicious-activity review → session issue.
//! Each stage failure is terminal for the attempt and recorded as exactly one
//! security event before a deliberately generic error goes back to the
//! caller. Nothing is persisted between the password pass and the MFA pass:
//! a client asked for a code re-submits the full credentials, so no
//! half-authenticated state exists anywhere.

use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::allowlist::IpAllowlist;
use crate::events::detector::{Severity, SuspiciousActivityDetector};
use crate::events::{SecurityEvent, SecurityEventKind, SecurityEventLog};
use crate::identity::{Identity, IdentityError, IdentityProvider, Role};
use crate::mfa::{AttemptContext, MfaEngine, MfaError};
use crate::ratelimit::{FixedWindowLimiter, RateLimitAction, RateLimitStatus};
use crate::session::{AdminSession, AdminSessionManager};

/// Terminal failure taxonomy for one attempt. `requiresMFA` is a normal flow
/// branch and lives in [`LoginOutcome`] instead.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("rate limited")]
    RateLimited { reset_at: DateTime<Utc> },
    #[error("address not allowed")]
    IpBlocked,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("insufficient privilege")]
    InsufficientPrivilege,
    #[error("invalid MFA code")]
    InvalidMfaCode,
    #[error("session creation failed")]
    SessionCreationFailed,
    #[error("invalid or expired session")]
    InvalidOrExpiredSession,
}

/// One login attempt as submitted by the boundary layer.
pub struct LoginRequest {
    pub email: String,
    pub password: SecretString,
    pub mfa_code: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

pub enum LoginOutcome {
    /// MFA is enabled and no code was submitted; re-submit with a code.
    MfaRequired,
    Success {
        identity: Identity,
        session: AdminSession,
        token: String,
    },
}

pub struct AdminLoginOrchestrator {
    limiter: FixedWindowLimiter,
    allowlist: IpAllowlist,
    identity: Arc<dyn IdentityProvider>,
    mfa: Arc<MfaEngine>,
    sessions: Arc<AdminSessionManager>,
    detector: SuspiciousActivityDetector,
    events: SecurityEventLog,
}

impl AdminLoginOrchestrator {
    #[must_use]
    pub fn new(
        limiter: FixedWindowLimiter,
        allowlist: IpAllowlist,
        identity: Arc<dyn IdentityProvider>,
        mfa: Arc<MfaEngine>,
        sessions: Arc<AdminSessionManager>,
        detector: SuspiciousActivityDetector,
        events: SecurityEventLog,
    ) -> Self {
        Self {
            limiter,
            allowlist,
            identity,
            mfa,
            sessions,
            detector,
            events,
        }
    }

    /// Run one attempt through the state machine.
    ///
    /// # Errors
    /// Returns the [`LoginError`] for the first failing stage; by then the
    /// failure has already been recorded in the security event log.
    pub async fn login(&self, request: LoginRequest) -> Result<LoginOutcome, LoginError> {
        let email = normalize_email(&request.email);
        let client_ip = request.client_ip.as_deref();
        let user_agent = request.user_agent.as_deref();
        let ctx = AttemptContext {
            client_ip,
            user_agent,
        };

        // Every attempt consumes a slot up front; the increment and the
        // comparison are one atomic store operation, so concurrent attempts
        // cannot overshoot the limit.
        let ip_subject = format!("ip:{}", client_ip.unwrap_or("unknown"));
        self.acquire_slot(&ip_subject, ctx).await?;
        self.acquire_slot(&format!("email:{email}"), ctx).await?;

        // Address gate runs before any credential work so an IP rejection
        // carries no signal about whether the account exists.
        if !self.allowlist.permits(client_ip) {
            self.log(
                SecurityEvent::new(SecurityEventKind::IpBlocked)
                    .with_client_ip(client_ip)
                    .with_user_agent(user_agent)
                    .with_detail("country", "unknown"),
            )
            .await?;
            return Err(LoginError::IpBlocked);
        }

        if !valid_email(&email) {
            self.log_failure(None, ctx, "invalid_credentials").await?;
            return Err(LoginError::InvalidCredentials);
        }

        // Delegated credential check; the provider call is bounded by its
        // own timeout and a timeout fails the stage closed.
        let identity = match self.identity.verify_credentials(&email, &request.password).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                self.log_failure(None, ctx, "invalid_credentials").await?;
                return Err(LoginError::InvalidCredentials);
            }
            Err(IdentityError::Unavailable(err)) => {
                error!("identity provider unavailable: {err}");
                self.log_failure(None, ctx, "identity_provider_unavailable")
                    .await?;
                return Err(LoginError::SessionCreationFailed);
            }
        };

        // Authenticated but not an admin: logged distinctly, surfaced
        // generically.
        if !identity.role.has_privilege(Role::Admin) {
            self.log(
                SecurityEvent::new(SecurityEventKind::FailedLogin)
                    .with_user(identity.user_id)
                    .with_client_ip(client_ip)
                    .with_user_agent(user_agent)
                    .with_detail("reason", "insufficient_privileges")
                    .with_detail("role", identity.role.as_str()),
            )
            .await?;
            return Err(LoginError::InsufficientPrivilege);
        }

        let mfa_verified = self.run_mfa_stage(&identity, &request, ctx).await?;
        let mfa_verified = match mfa_verified {
            MfaStage::NotRequired => false,
            MfaStage::Verified => true,
            MfaStage::CodeNeeded => return Ok(LoginOutcome::MfaRequired),
        };

        // Suspicious-activity review. Low and medium alert without blocking;
        // critical only passes when this attempt carried a fresh MFA proof.
        match self.detector.detect(Some(identity.user_id), client_ip).await {
            Ok(Some(alert)) => {
                self.detector.trigger(&alert);
                if alert.severity == Severity::Critical && !mfa_verified {
                    self.log_failure(Some(identity.user_id), ctx, "suspicious_activity")
                        .await?;
                    return Err(LoginError::InvalidCredentials);
                }
            }
            Ok(None) => {}
            Err(err) => {
                error!("suspicious activity check failed: {err}");
                self.log_failure(Some(identity.user_id), ctx, "event_store_unavailable")
                    .await?;
                return Err(LoginError::SessionCreationFailed);
            }
        }

        let issued = match self.sessions.create(identity.user_id, client_ip, user_agent).await {
            Ok(issued) => issued,
            Err(err) => {
                error!("failed to create admin session: {err}");
                self.log_failure(Some(identity.user_id), ctx, "session_unavailable")
                    .await?;
                return Err(LoginError::SessionCreationFailed);
            }
        };

        // The one `login` event for this pass. If even that cannot be
        // recorded, the session is withdrawn and the attempt fails closed.
        let success_event = SecurityEvent::new(SecurityEventKind::Login)
            .with_user(identity.user_id)
            .with_client_ip(client_ip)
            .with_user_agent(user_agent)
            .with_detail("role", identity.role.as_str())
            .with_detail("mfa", mfa_verified)
            .with_detail("country", "unknown")
            .with_detail("session_id", issued.session.id.to_string());
        if let Err(err) = self.events.record(success_event).await {
            error!("failed to record login event: {err}");
            if let Err(revoke_err) = self.sessions.terminate(&issued.token).await {
                error!("failed to withdraw session after log failure: {revoke_err}");
            }
            return Err(LoginError::SessionCreationFailed);
        }

        Ok(LoginOutcome::Success {
            identity,
            session: issued.session,
            token: issued.token,
        })
    }

    async fn run_mfa_stage(
        &self,
        identity: &Identity,
        request: &LoginRequest,
        ctx: AttemptContext<'_>,
    ) -> Result<MfaStage, LoginError> {
        let enabled = match self.mfa.is_enabled(identity.user_id).await {
            Ok(enabled) => enabled,
            Err(err) => {
                error!("failed to load MFA state: {err}");
                self.log_failure(Some(identity.user_id), ctx, "mfa_unavailable")
                    .await?;
                return Err(LoginError::SessionCreationFailed);
            }
        };
        if !enabled {
            // A stray code submitted while MFA is disabled is ignored.
            return Ok(MfaStage::NotRequired);
        }

        let Some(code) = request.mfa_code.as_deref() else {
            // Normal flow branch, but still terminal for this pass: record
            // it so the attempt leaves a trace.
            self.log_failure(Some(identity.user_id), ctx, "mfa_required")
                .await?;
            return Ok(MfaStage::CodeNeeded);
        };

        match self.mfa.verify(identity.user_id, code, ctx).await {
            // The engine records the verification attempt either way.
            Ok(_) => Ok(MfaStage::Verified),
            Err(MfaError::InvalidCode | MfaError::NotEnrolled) => Err(LoginError::InvalidMfaCode),
            Err(MfaError::AlreadyEnrolled) => Err(LoginError::InvalidMfaCode),
            Err(MfaError::Unavailable(err)) => {
                error!("MFA verification unavailable: {err}");
                self.log_failure(Some(identity.user_id), ctx, "mfa_unavailable")
                    .await?;
                Err(LoginError::SessionCreationFailed)
            }
        }
    }

    async fn acquire_slot(
        &self,
        subject: &str,
        ctx: AttemptContext<'_>,
    ) -> Result<(), LoginError> {
        let status: RateLimitStatus = match self
            .limiter
            .acquire(subject, RateLimitAction::AdminLogin)
            .await
        {
            Ok(status) => status,
            Err(err) => {
                // Limiter failure denies admin logins, never allows them.
                error!("rate limiter unavailable: {err}");
                self.log_failure(None, ctx, "rate_limiter_unavailable")
                    .await?;
                return Err(LoginError::SessionCreationFailed);
            }
        };
        if status.allowed {
            return Ok(());
        }
        // Logged before any credential work happens (causal order).
        self.log(
            SecurityEvent::new(SecurityEventKind::FailedLogin)
                .with_client_ip(ctx.client_ip)
                .with_user_agent(ctx.user_agent)
                .with_detail("reason", "rate_limited")
                .with_detail("reset_at", status.reset_at.to_rfc3339()),
        )
        .await?;
        Err(LoginError::RateLimited {
            reset_at: status.reset_at,
        })
    }

    async fn log_failure(
        &self,
        user_id: Option<Uuid>,
        ctx: AttemptContext<'_>,
        reason: &str,
    ) -> Result<(), LoginError> {
        let mut event = SecurityEvent::new(SecurityEventKind::FailedLogin)
            .with_client_ip(ctx.client_ip)
            .with_user_agent(ctx.user_agent)
            .with_detail("reason", reason);
        if let Some(user_id) = user_id {
            event = event.with_user(user_id);
        }
        self.log(event).await
    }

    async fn log(&self, event: SecurityEvent) -> Result<(), LoginError> {
        // An unwritable audit trail denies the attempt; no silent losses.
        self.events.record(event).await.map_err(|err| {
            error!("failed to record security event: {err}");
            LoginError::SessionCreationFailed
        })
    }
}

enum MfaStage {
    NotRequired,
    CodeNeeded,
    Verified,
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{
        AdminLoginOrchestrator, LoginError, LoginOutcome, LoginRequest, normalize_email,
        valid_email,
    };
    use crate::allowlist::IpAllowlist;
    use crate::events::detector::{DetectorConfig, LogAlertSink, SuspiciousActivityDetector};
    use crate::events::{EventFilter, SecurityEventKind, SecurityEventLog};
    use crate::identity::{Identity, IdentityError, IdentityProvider, Role};
    use crate::mfa::{AttemptContext, CodeVerifier, MfaEngine};
    use crate::ratelimit::{FixedWindowLimiter, RateLimitConfig};
    use crate::session::AdminSessionManager;
    use crate::store::memory::{
        MemoryCounterStore, MemoryEventStore, MemoryMfaStore, MemorySessionStore,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use secrecy::{ExposeSecret, SecretString};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    const PASSWORD: &str = "correct horse battery staple";
    const TOTP_CODE: &str = "123456";

    struct ScriptedIdentityProvider {
        identity: Identity,
        calls: AtomicUsize,
    }

    impl ScriptedIdentityProvider {
        fn new(role: Role) -> Arc<Self> {
            Arc::new(Self {
                identity: Identity {
                    user_id: Uuid::new_v4(),
                    email: "admin@example.com".to_string(),
                    role,
                },
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IdentityProvider for ScriptedIdentityProvider {
        async fn verify_credentials(
            &self,
            email: &str,
            password: &SecretString,
        ) -> Result<Option<Identity>, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if email == self.identity.email && password.expose_secret() == PASSWORD {
                Ok(Some(self.identity.clone()))
            } else {
                Ok(None)
            }
        }
    }

    struct FixedCodeVerifier;

    impl CodeVerifier for FixedCodeVerifier {
        fn verify(&self, _secret: &str, code: &str) -> Result<bool> {
            Ok(code == TOTP_CODE)
        }
    }

    struct Harness {
        orchestrator: AdminLoginOrchestrator,
        provider: Arc<ScriptedIdentityProvider>,
        mfa: Arc<MfaEngine>,
        event_store: Arc<MemoryEventStore>,
        user_id: Uuid,
    }

    fn harness(role: Role, allow: &[&str], limit: u32) -> Harness {
        let event_store = Arc::new(MemoryEventStore::new());
        let events = SecurityEventLog::new(event_store.clone());
        let limiter = FixedWindowLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            RateLimitConfig::new()
                .with_limit(limit)
                .with_window(Duration::from_secs(60)),
        );
        let allowlist = IpAllowlist::parse(
            &allow.iter().map(|p| (*p).to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        let provider = ScriptedIdentityProvider::new(role);
        let mfa = Arc::new(MfaEngine::new(
            Arc::new(MemoryMfaStore::new()),
            events.clone(),
            Arc::new(FixedCodeVerifier),
            Arc::from(b"pepper".as_slice()),
            "Vetrina Admin".to_string(),
        ));
        let sessions = Arc::new(AdminSessionManager::new(
            Arc::new(MemorySessionStore::new()),
            events.clone(),
            Duration::from_secs(1800),
        ));
        let detector = SuspiciousActivityDetector::new(
            events.clone(),
            Arc::new(LogAlertSink),
            DetectorConfig::new().with_failed_thresholds(50, 100),
        );
        let user_id = provider.identity.user_id;
        let orchestrator = AdminLoginOrchestrator::new(
            limiter,
            allowlist,
            provider.clone(),
            mfa.clone(),
            sessions,
            detector,
            events,
        );
        Harness {
            orchestrator,
            provider,
            mfa,
            event_store,
            user_id,
        }
    }

    fn request(password: &str, mfa_code: Option<&str>) -> LoginRequest {
        LoginRequest {
            email: "admin@example.com".to_string(),
            password: SecretString::from(password.to_string()),
            mfa_code: mfa_code.map(str::to_string),
            client_ip: Some("203.0.113.10".to_string()),
            user_agent: Some("vetrina-admin/1.0".to_string()),
        }
    }

    async fn count_kind(store: &MemoryEventStore, kind: SecurityEventKind) -> usize {
        let since = Utc.timestamp_opt(0, 0).single().unwrap();
        store.recent_events(&EventFilter::kind(kind), since).await.len()
    }

    async fn enroll(harness: &Harness) {
        harness
            .mfa
            .enable(harness.user_id, "admin@example.com", AttemptContext::default())
            .await
            .unwrap();
        harness
            .mfa
            .verify(harness.user_id, TOTP_CODE, AttemptContext::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn login_without_mfa_issues_a_session_and_one_login_event() {
        let harness = harness(Role::Admin, &[], 5);
        let outcome = harness
            .orchestrator
            .login(request(PASSWORD, None))
            .await
            .unwrap();

        let LoginOutcome::Success { session, token, identity } = outcome else {
            panic!("expected success");
        };
        assert!(!token.is_empty());
        assert_eq!(identity.user_id, harness.user_id);
        assert_eq!(
            session.expires_at - session.created_at,
            ChronoDuration::seconds(1800)
        );
        assert_eq!(count_kind(&harness.event_store, SecurityEventKind::Login).await, 1);
        assert_eq!(
            count_kind(&harness.event_store, SecurityEventKind::MfaEnabled).await,
            0
        );
    }

    #[tokio::test]
    async fn mfa_enabled_without_code_requires_mfa_and_creates_nothing() {
        let harness = harness(Role::Admin, &[], 5);
        enroll(&harness).await;

        let outcome = harness
            .orchestrator
            .login(request(PASSWORD, None))
            .await
            .unwrap();
        assert!(matches!(outcome, LoginOutcome::MfaRequired));
        assert_eq!(count_kind(&harness.event_store, SecurityEventKind::Login).await, 0);
    }

    #[tokio::test]
    async fn mfa_enabled_with_code_completes_the_login() {
        let harness = harness(Role::Admin, &[], 5);
        enroll(&harness).await;

        let outcome = harness
            .orchestrator
            .login(request(PASSWORD, Some(TOTP_CODE)))
            .await
            .unwrap();
        assert!(matches!(outcome, LoginOutcome::Success { .. }));
        assert_eq!(count_kind(&harness.event_store, SecurityEventKind::Login).await, 1);
    }

    #[tokio::test]
    async fn wrong_mfa_code_fails_generically() {
        let harness = harness(Role::Admin, &[], 10);
        enroll(&harness).await;

        let result = harness
            .orchestrator
            .login(request(PASSWORD, Some("000000")))
            .await;
        assert!(matches!(result, Err(LoginError::InvalidMfaCode)));
        assert_eq!(count_kind(&harness.event_store, SecurityEventKind::Login).await, 0);
    }

    #[tokio::test]
    async fn rate_limit_blocks_before_the_credential_check() {
        let harness = harness(Role::Admin, &[], 5);

        for _ in 0..5 {
            let result = harness.orchestrator.login(request("wrong", None)).await;
            assert!(matches!(result, Err(LoginError::InvalidCredentials)));
        }
        assert_eq!(harness.provider.calls.load(Ordering::SeqCst), 5);

        for _ in 0..5 {
            let result = harness.orchestrator.login(request("wrong", None)).await;
            assert!(matches!(result, Err(LoginError::RateLimited { .. })));
        }
        // Blocked attempts never reached the identity provider.
        assert_eq!(harness.provider.calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            count_kind(&harness.event_store, SecurityEventKind::FailedLogin).await,
            10
        );
    }

    #[tokio::test]
    async fn non_admin_identity_is_a_privilege_failure() {
        let harness = harness(Role::Staff, &[], 5);
        let result = harness.orchestrator.login(request(PASSWORD, None)).await;
        assert!(matches!(result, Err(LoginError::InsufficientPrivilege)));

        let since = Utc.timestamp_opt(0, 0).single().unwrap();
        let failed = harness
            .event_store
            .recent_events(&EventFilter::kind(SecurityEventKind::FailedLogin), since)
            .await;
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].details.get("reason").and_then(|v| v.as_str()),
            Some("insufficient_privileges")
        );
        assert_eq!(count_kind(&harness.event_store, SecurityEventKind::Login).await, 0);
    }

    #[tokio::test]
    async fn blocked_address_never_reaches_the_credential_check() {
        let harness = harness(Role::Admin, &["10.0.0.0/8"], 5);
        let result = harness.orchestrator.login(request(PASSWORD, None)).await;
        assert!(matches!(result, Err(LoginError::IpBlocked)));
        assert_eq!(harness.provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            count_kind(&harness.event_store, SecurityEventKind::IpBlocked).await,
            1
        );
    }

    #[tokio::test]
    async fn critical_suspicion_without_mfa_denies_the_attempt() {
        let harness = harness(Role::Admin, &[], 20);
        // Rebuild the detector thresholds by seeding failures: three bad
        // passwords, then a correct one from the same address.
        let detector_harness = {
            let event_store = harness.event_store.clone();
            let events = SecurityEventLog::new(event_store);
            SuspiciousActivityDetector::new(
                events,
                Arc::new(LogAlertSink),
                DetectorConfig::new().with_failed_thresholds(2, 3),
            )
        };
        let orchestrator = AdminLoginOrchestrator::new(
            FixedWindowLimiter::new(
                Arc::new(MemoryCounterStore::new()),
                RateLimitConfig::new()
                    .with_limit(20)
                    .with_window(Duration::from_secs(60)),
            ),
            IpAllowlist::parse(&[]).unwrap(),
            harness.provider.clone(),
            harness.mfa.clone(),
            Arc::new(AdminSessionManager::new(
                Arc::new(MemorySessionStore::new()),
                SecurityEventLog::new(harness.event_store.clone()),
                Duration::from_secs(1800),
            )),
            detector_harness,
            SecurityEventLog::new(harness.event_store.clone()),
        );

        for _ in 0..3 {
            let result = orchestrator.login(request("wrong", None)).await;
            assert!(matches!(result, Err(LoginError::InvalidCredentials)));
        }

        let result = orchestrator.login(request(PASSWORD, None)).await;
        assert!(matches!(result, Err(LoginError::InvalidCredentials)));
        assert_eq!(count_kind(&harness.event_store, SecurityEventKind::Login).await, 0);
    }

    #[test]
    fn email_normalization_and_validation() {
        assert_eq!(normalize_email(" Admin@Example.COM "), "admin@example.com");
        assert!(valid_email("admin@example.com"));
        assert!(!valid_email("not-an-email"));
        assert!(!valid_email("missing-domain@"));
    }
}
