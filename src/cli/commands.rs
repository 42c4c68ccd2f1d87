//! Command-line argument definitions.

use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_PORT: &str = "port";
pub const ARG_DSN: &str = "dsn";
pub const ARG_FRONTEND_URL: &str = "frontend-url";
pub const ARG_IDENTITY_URL: &str = "identity-url";
pub const ARG_IDENTITY_TIMEOUT: &str = "identity-timeout-seconds";
pub const ARG_ALLOW_IP: &str = "allow-ip";
pub const ARG_RATE_LIMIT_ATTEMPTS: &str = "rate-limit-attempts";
pub const ARG_RATE_LIMIT_WINDOW: &str = "rate-limit-window-seconds";
pub const ARG_SESSION_TTL: &str = "session-ttl-seconds";
pub const ARG_MFA_ISSUER: &str = "mfa-issuer";
pub const ARG_MFA_PEPPER: &str = "mfa-pepper";
pub const ARG_VERBOSITY: &str = "verbosity";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    Command::new("vetrina")
        .about("Admin authentication and session security for the Vetrina storefront")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("VETRINA_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string; omit for in-memory stores")
                .env("VETRINA_DSN"),
        )
        .arg(
            Arg::new(ARG_FRONTEND_URL)
                .long(ARG_FRONTEND_URL)
                .help("Base URL of the admin console frontend")
                .default_value("http://localhost:3000")
                .env("VETRINA_FRONTEND_URL"),
        )
        .arg(
            Arg::new(ARG_IDENTITY_URL)
                .long(ARG_IDENTITY_URL)
                .help("Base URL of the identity provider")
                .default_value("http://localhost:9100")
                .env("VETRINA_IDENTITY_URL"),
        )
        .arg(
            Arg::new(ARG_IDENTITY_TIMEOUT)
                .long(ARG_IDENTITY_TIMEOUT)
                .help("Timeout for identity provider calls, in seconds")
                .default_value("5")
                .env("VETRINA_IDENTITY_TIMEOUT_SECONDS")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_ALLOW_IP)
                .long(ARG_ALLOW_IP)
                .help("Allowed admin address or CIDR range; repeatable. Empty disables the gate")
                .env("VETRINA_ALLOW_IP")
                .action(ArgAction::Append)
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_ATTEMPTS)
                .long(ARG_RATE_LIMIT_ATTEMPTS)
                .help("Login attempts allowed per subject per window")
                .default_value("5")
                .env("VETRINA_RATE_LIMIT_ATTEMPTS")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_WINDOW)
                .long(ARG_RATE_LIMIT_WINDOW)
                .help("Fixed rate-limit window, in seconds")
                .default_value("600")
                .env("VETRINA_RATE_LIMIT_WINDOW_SECONDS")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL)
                .long(ARG_SESSION_TTL)
                .help("Admin session lifetime, in seconds; never extended by activity")
                .default_value("1800")
                .env("VETRINA_SESSION_TTL_SECONDS")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_MFA_ISSUER)
                .long(ARG_MFA_ISSUER)
                .help("Issuer shown in authenticator apps")
                .default_value("Vetrina Admin")
                .env("VETRINA_MFA_ISSUER"),
        )
        .arg(
            Arg::new(ARG_MFA_PEPPER)
                .long(ARG_MFA_PEPPER)
                .help("Server-side pepper for backup-code hashing")
                .env("VETRINA_MFA_PEPPER")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .long("verbose")
                .help("Increase log verbosity (repeatable)")
                .action(ArgAction::Count),
        )
}

#[cfg(test)]
mod tests {
    use super::{
        ARG_ALLOW_IP, ARG_MFA_PEPPER, ARG_PORT, ARG_SESSION_TTL, ARG_VERBOSITY, new,
    };

    #[test]
    fn defaults_apply_without_arguments() {
        let matches = new()
            .try_get_matches_from(["vetrina", "--mfa-pepper", "pepper"])
            .unwrap();
        assert_eq!(matches.get_one::<u16>(ARG_PORT).copied(), Some(8080));
        assert_eq!(matches.get_one::<i64>(ARG_SESSION_TTL).copied(), Some(1800));
        assert_eq!(matches.get_count(ARG_VERBOSITY), 0);
    }

    #[test]
    fn pepper_is_required() {
        temp_env::with_var_unset("VETRINA_MFA_PEPPER", || {
            assert!(new().try_get_matches_from(["vetrina"]).is_err());
        });
    }

    #[test]
    fn allow_ip_accepts_repeats_and_delimiters() {
        let matches = new()
            .try_get_matches_from([
                "vetrina",
                "--mfa-pepper",
                "pepper",
                "--allow-ip",
                "10.0.0.0/8,192.0.2.1",
                "--allow-ip",
                "203.0.113.0/24",
            ])
            .unwrap();
        let patterns: Vec<&String> = matches.get_many::<String>(ARG_ALLOW_IP).unwrap().collect();
        assert_eq!(patterns.len(), 3);
    }

    #[test]
    fn verbosity_counts_repeats() {
        let matches = new()
            .try_get_matches_from(["vetrina", "--mfa-pepper", "pepper", "-vvv"])
            .unwrap();
        assert_eq!(matches.get_count(ARG_VERBOSITY), 3);
    }

    #[test]
    fn pepper_env_fallback_applies() {
        temp_env::with_var("VETRINA_MFA_PEPPER", Some("env-pepper"), || {
            let matches = new().try_get_matches_from(["vetrina"]).unwrap();
            assert_eq!(
                matches.get_one::<String>(ARG_MFA_PEPPER).map(String::as_str),
                Some("env-pepper")
            );
        });
    }
}
