use crate::{auth::DEFAULT_MAX_ACTIVE, token::TokenConfig};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use std::{path::PathBuf, time::Duration};

pub const ARG_SIGNING_SECRET: &str = "signing-secret";
pub const ARG_ACCESS_TOKEN_TTL: &str = "access-token-ttl";
pub const ARG_TEMP_TOKEN_TTL: &str = "temp-token-ttl";
pub const ARG_REFRESH_TOKEN_TTL: &str = "refresh-token-ttl";
pub const ARG_MAX_REFRESH_TOKENS: &str = "max-refresh-tokens";
pub const ARG_USERS_FILE: &str = "users-file";

pub struct Options {
    pub signing_secret: SecretString,
    pub config: TokenConfig,
    pub max_refresh_tokens: usize,
    pub users_file: PathBuf,
}

impl Options {
    /// Parse token and credential arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the signing secret or the users file is missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let signing_secret = matches
            .get_one::<String>(ARG_SIGNING_SECRET)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .map(SecretString::from)
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_SIGNING_SECRET}"))?;

        let users_file = matches
            .get_one::<String>(ARG_USERS_FILE)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_USERS_FILE}"))?;

        let seconds = |id: &str, default: u64| {
            Duration::from_secs(matches.get_one::<u64>(id).copied().unwrap_or(default))
        };

        let config = TokenConfig::default()
            .with_access_ttl(seconds(ARG_ACCESS_TOKEN_TTL, 3600))
            .with_temp_ttl(seconds(ARG_TEMP_TOKEN_TTL, 300))
            .with_refresh_ttl(seconds(ARG_REFRESH_TOKEN_TTL, 604_800));

        Ok(Self {
            signing_secret,
            config,
            max_refresh_tokens: matches
                .get_one::<usize>(ARG_MAX_REFRESH_TOKENS)
                .copied()
                .unwrap_or(DEFAULT_MAX_ACTIVE),
            users_file,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SIGNING_SECRET)
                .long(ARG_SIGNING_SECRET)
                .help("Secret used to sign and verify tokens (at least 32 bytes)")
                .env("TURNSTILE_SIGNING_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL)
                .long(ARG_ACCESS_TOKEN_TTL)
                .help("Access token lifetime in seconds")
                .env("TURNSTILE_ACCESS_TOKEN_TTL")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_TEMP_TOKEN_TTL)
                .long(ARG_TEMP_TOKEN_TTL)
                .help("Temporary (pending MFA) token lifetime in seconds")
                .env("TURNSTILE_TEMP_TOKEN_TTL")
                .default_value("300")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL)
                .long(ARG_REFRESH_TOKEN_TTL)
                .help("Refresh token lifetime in seconds")
                .env("TURNSTILE_REFRESH_TOKEN_TTL")
                .default_value("604800")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_MAX_REFRESH_TOKENS)
                .long(ARG_MAX_REFRESH_TOKENS)
                .help("Active refresh tokens kept per identity, oldest are revoked first")
                .env("TURNSTILE_MAX_REFRESH_TOKENS")
                .default_value("5")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_USERS_FILE)
                .long(ARG_USERS_FILE)
                .help("JSON file with the user records to authenticate against")
                .env("TURNSTILE_USERS_FILE"),
        )
}
