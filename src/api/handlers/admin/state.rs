//! Admin auth state and configuration.

use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;

use crate::allowlist::IpAllowlist;
use crate::events::SecurityEventLog;
use crate::events::detector::{DetectorConfig, LogAlertSink, SuspiciousActivityDetector};
use crate::identity::{HttpIdentityProvider, IdentityProvider};
use crate::login::AdminLoginOrchestrator;
use crate::mfa::{MfaEngine, TotpVerifier};
use crate::ratelimit::{FixedWindowLimiter, RateLimitConfig};
use crate::session::AdminSessionManager;
use crate::store::Stores;

const DEFAULT_SESSION_TTL_SECONDS: i64 = 30 * 60;
const DEFAULT_RATE_LIMIT_ATTEMPTS: u32 = 5;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 10 * 60;
const DEFAULT_IDENTITY_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_MFA_ISSUER: &str = "Vetrina Admin";

pub struct AuthConfig {
    frontend_base_url: String,
    identity_base_url: String,
    identity_timeout_seconds: u64,
    session_ttl_seconds: i64,
    rate_limit_attempts: u32,
    rate_limit_window_seconds: u64,
    allowlist_patterns: Vec<String>,
    mfa_issuer: String,
    mfa_pepper: SecretString,
}

impl AuthConfig {
    #[must_use]
    pub fn new(
        frontend_base_url: String,
        identity_base_url: String,
        mfa_pepper: SecretString,
    ) -> Self {
        Self {
            frontend_base_url,
            identity_base_url,
            identity_timeout_seconds: DEFAULT_IDENTITY_TIMEOUT_SECONDS,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            rate_limit_attempts: DEFAULT_RATE_LIMIT_ATTEMPTS,
            rate_limit_window_seconds: DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
            allowlist_patterns: Vec::new(),
            mfa_issuer: DEFAULT_MFA_ISSUER.to_string(),
            mfa_pepper,
        }
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, attempts: u32, window_seconds: u64) -> Self {
        self.rate_limit_attempts = attempts;
        self.rate_limit_window_seconds = window_seconds;
        self
    }

    #[must_use]
    pub fn with_allowlist_patterns(mut self, patterns: Vec<String>) -> Self {
        self.allowlist_patterns = patterns;
        self
    }

    #[must_use]
    pub fn with_identity_timeout_seconds(mut self, seconds: u64) -> Self {
        self.identity_timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_mfa_issuer(mut self, issuer: String) -> Self {
        self.mfa_issuer = issuer;
        self
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    /// Only mark cookies secure when the console is served over HTTPS.
    #[must_use]
    pub fn session_cookie_secure(&self) -> bool {
        self.frontend_base_url.starts_with("https://")
    }
}

pub struct AdminState {
    config: AuthConfig,
    orchestrator: AdminLoginOrchestrator,
    sessions: Arc<AdminSessionManager>,
    mfa: Arc<MfaEngine>,
    limiter: FixedWindowLimiter,
}

impl AdminState {
    /// Wire the full auth stack from configuration and stores.
    ///
    /// # Errors
    /// Returns an error for malformed allowlist patterns or an identity
    /// client that cannot be constructed.
    pub fn new(config: AuthConfig, stores: &Stores) -> Result<Self> {
        let identity: Arc<dyn IdentityProvider> = Arc::new(HttpIdentityProvider::new(
            &config.identity_base_url,
            Duration::from_secs(config.identity_timeout_seconds),
        )?);
        Self::with_identity_provider(config, stores, identity)
    }

    /// Same wiring with an injected identity provider (used by tests).
    ///
    /// # Errors
    /// Returns an error for malformed allowlist patterns.
    pub fn with_identity_provider(
        config: AuthConfig,
        stores: &Stores,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        let events = SecurityEventLog::new(stores.events.clone());
        let limiter = FixedWindowLimiter::new(
            stores.counters.clone(),
            RateLimitConfig::new()
                .with_limit(config.rate_limit_attempts)
                .with_window(Duration::from_secs(config.rate_limit_window_seconds)),
        );
        // Malformed patterns abort startup; a half-configured gate must not
        // come up permissive.
        let allowlist = IpAllowlist::parse(&config.allowlist_patterns)
            .context("invalid IP allowlist configuration")?;

        let pepper: Arc<[u8]> = Arc::from(config.mfa_pepper.expose_secret().as_bytes());
        let mfa = Arc::new(MfaEngine::new(
            stores.mfa.clone(),
            events.clone(),
            Arc::new(TotpVerifier),
            pepper,
            config.mfa_issuer.clone(),
        ));
        let ttl_seconds = u64::try_from(config.session_ttl_seconds).unwrap_or(0);
        let sessions = Arc::new(AdminSessionManager::new(
            stores.sessions.clone(),
            events.clone(),
            Duration::from_secs(ttl_seconds),
        ));
        let detector = SuspiciousActivityDetector::new(
            events.clone(),
            Arc::new(LogAlertSink),
            DetectorConfig::new(),
        );
        let orchestrator = AdminLoginOrchestrator::new(
            limiter.clone(),
            allowlist,
            identity,
            mfa.clone(),
            sessions.clone(),
            detector,
            events,
        );

        Ok(Self {
            config,
            orchestrator,
            sessions,
            mfa,
            limiter,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn orchestrator(&self) -> &AdminLoginOrchestrator {
        &self.orchestrator
    }

    #[must_use]
    pub fn sessions(&self) -> &AdminSessionManager {
        &self.sessions
    }

    #[must_use]
    pub fn mfa(&self) -> &MfaEngine {
        &self.mfa
    }

    pub(super) fn limiter(&self) -> &FixedWindowLimiter {
        &self.limiter
    }
}
