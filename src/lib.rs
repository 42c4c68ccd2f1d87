//! # Vetrina Admin Security Core
//!
//! `vetrina` is the admin authentication and session-security service for
//! the Vetrina storefront: rate limiting, IP allow-listing, MFA
//! enrollment/verification, admin session issuance/validation, and
//! security-event logging with suspicious-activity detection.
//!
//! ## Boundaries
//!
//! Primary email/password verification is delegated to an external identity
//! provider; this service enforces everything after it. Rate-limit counters,
//! sessions, MFA enrollments, and the event log live behind narrow store
//! traits with in-memory and `PostgreSQL` implementations.
//!
//! ## Security invariants
//!
//! - Every login/MFA state transition records exactly one security event,
//!   failures included; an unwritable event log denies the operation.
//! - Session tokens and the rate-limit decision are never subject to
//!   read-then-write races: counters use an atomic increment-and-compare,
//!   tokens are stored only as hashes.
//! - Infrastructure failures (store down, identity provider timeout) always
//!   fail closed.
//! - Failure responses are generically worded; internal reason codes appear
//!   only in the event log.

pub mod allowlist;
pub mod api;
pub mod cli;
pub mod events;
pub mod identity;
pub mod login;
pub mod mfa;
pub mod ratelimit;
pub mod session;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        // Should be a hex string (full SHA-1 is 40 chars, but could be short)
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
