//! Maps validated CLI matches to the action to run.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{rate_limit, tokens};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let token_opts = tokens::Options::parse(matches)?;
    let rate_limits = rate_limit::parse(matches);

    Ok(Action::Server(Args {
        port,
        signing_secret: token_opts.signing_secret,
        token_config: token_opts.config,
        max_refresh_tokens: token_opts.max_refresh_tokens,
        users_file: token_opts.users_file,
        rate_limits,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn users_file_required() {
        temp_env::with_vars(
            [
                (
                    "TURNSTILE_SIGNING_SECRET",
                    Some("0123456789abcdef0123456789abcdef"),
                ),
                ("TURNSTILE_USERS_FILE", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["turnstile"]);
                let result = handler(&matches);
                assert!(result.is_err());
                if let Err(err) = result {
                    assert!(err
                        .to_string()
                        .contains("missing required argument: --users-file"));
                }
            },
        );
    }

    #[test]
    fn builds_server_action() {
        temp_env::with_vars(
            [
                (
                    "TURNSTILE_SIGNING_SECRET",
                    Some("0123456789abcdef0123456789abcdef"),
                ),
                ("TURNSTILE_USERS_FILE", Some("/tmp/users.json")),
                ("TURNSTILE_PORT", Some("3000")),
                ("TURNSTILE_RATE_LIMIT_DISABLED", Some("true")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["turnstile"]);
                let action = handler(&matches);
                assert!(matches!(
                    action,
                    Ok(Action::Server(Args { port: 3000, .. }))
                ));
                if let Ok(Action::Server(args)) = action {
                    assert!(!args.rate_limits.enabled());
                    assert_eq!(args.users_file.to_str(), Some("/tmp/users.json"));
                }
            },
        );
    }
}
