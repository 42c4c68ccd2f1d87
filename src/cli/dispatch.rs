//! Map validated CLI arguments to an action.

use anyhow::{Context, Result};
use secrecy::SecretString;

use crate::api::AuthConfig;
use crate::cli::actions::{Action, ServerArgs};
use crate::cli::commands::{
    ARG_ALLOW_IP, ARG_DSN, ARG_FRONTEND_URL, ARG_IDENTITY_TIMEOUT, ARG_IDENTITY_URL,
    ARG_MFA_ISSUER, ARG_MFA_PEPPER, ARG_PORT, ARG_RATE_LIMIT_ATTEMPTS, ARG_RATE_LIMIT_WINDOW,
    ARG_SESSION_TTL,
};

/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches.get_one::<String>(ARG_DSN).cloned();
    let frontend_url = matches
        .get_one::<String>(ARG_FRONTEND_URL)
        .cloned()
        .context("missing required argument: --frontend-url")?;
    let identity_url = matches
        .get_one::<String>(ARG_IDENTITY_URL)
        .cloned()
        .context("missing required argument: --identity-url")?;
    let mfa_pepper = matches
        .get_one::<String>(ARG_MFA_PEPPER)
        .cloned()
        .context("missing required argument: --mfa-pepper")?;

    let mut auth = AuthConfig::new(
        frontend_url,
        identity_url,
        SecretString::from(mfa_pepper),
    );
    if let Some(seconds) = matches.get_one::<i64>(ARG_SESSION_TTL).copied() {
        auth = auth.with_session_ttl_seconds(seconds);
    }
    if let (Some(attempts), Some(window)) = (
        matches.get_one::<u32>(ARG_RATE_LIMIT_ATTEMPTS).copied(),
        matches.get_one::<u64>(ARG_RATE_LIMIT_WINDOW).copied(),
    ) {
        auth = auth.with_rate_limit(attempts, window);
    }
    if let Some(seconds) = matches.get_one::<u64>(ARG_IDENTITY_TIMEOUT).copied() {
        auth = auth.with_identity_timeout_seconds(seconds);
    }
    if let Some(issuer) = matches.get_one::<String>(ARG_MFA_ISSUER).cloned() {
        auth = auth.with_mfa_issuer(issuer);
    }
    if let Some(patterns) = matches.get_many::<String>(ARG_ALLOW_IP) {
        auth = auth.with_allowlist_patterns(patterns.cloned().collect());
    }

    Ok(Action::Server(Box::new(ServerArgs { port, dsn, auth })))
}

#[cfg(test)]
mod tests {
    use super::handler;
    use crate::cli::actions::Action;
    use crate::cli::commands;

    #[test]
    fn handler_builds_a_server_action() {
        let matches = commands::new()
            .try_get_matches_from([
                "vetrina",
                "--mfa-pepper",
                "pepper",
                "--port",
                "9090",
                "--allow-ip",
                "10.0.0.0/8",
            ])
            .unwrap();
        let Action::Server(args) = handler(&matches).unwrap();
        assert_eq!(args.port, 9090);
        assert!(args.dsn.is_none());
        assert_eq!(args.auth.session_ttl_seconds(), 1800);
    }
}
