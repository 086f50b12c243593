use crate::rate_limit::{EndpointClass, RateLimitConfig, RateLimitPolicy};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::time::Duration;

pub const ARG_RATE_LIMIT_DISABLED: &str = "rate-limit-disabled";
pub const ARG_RATE_LIMIT_GENERAL: &str = "rate-limit-general";
pub const ARG_RATE_LIMIT_AUTH: &str = "rate-limit-auth";
pub const ARG_RATE_LIMIT_API: &str = "rate-limit-api";
pub const ARG_RATE_LIMIT_MFA: &str = "rate-limit-mfa";
pub const ARG_RATE_LIMIT_WINDOW: &str = "rate-limit-window";
pub const ARG_RATE_LIMIT_MFA_WINDOW: &str = "rate-limit-mfa-window";

/// Build the limiter configuration from matches.
///
/// General, auth and api share one window; the MFA class has its own.
#[must_use]
pub fn parse(matches: &ArgMatches) -> RateLimitConfig {
    let limit = |id: &str, default: u32| matches.get_one::<u32>(id).copied().unwrap_or(default);
    let window = |id: &str, default: u64| {
        Duration::from_secs(matches.get_one::<u64>(id).copied().unwrap_or(default))
    };

    let shared = window(ARG_RATE_LIMIT_WINDOW, 60);
    let mfa = window(ARG_RATE_LIMIT_MFA_WINDOW, 300);

    RateLimitConfig::default()
        .with_enabled(!matches.get_flag(ARG_RATE_LIMIT_DISABLED))
        .with_policy(
            EndpointClass::General,
            RateLimitPolicy::new(limit(ARG_RATE_LIMIT_GENERAL, 100), shared),
        )
        .with_policy(
            EndpointClass::Auth,
            RateLimitPolicy::new(limit(ARG_RATE_LIMIT_AUTH, 5), shared),
        )
        .with_policy(
            EndpointClass::Api,
            RateLimitPolicy::new(limit(ARG_RATE_LIMIT_API, 1000), shared),
        )
        .with_policy(
            EndpointClass::Mfa,
            RateLimitPolicy::new(limit(ARG_RATE_LIMIT_MFA, 5), mfa),
        )
}

fn limit_arg(
    id: &'static str,
    env: &'static str,
    help: &'static str,
    default: &'static str,
) -> Arg {
    Arg::new(id)
        .long(id)
        .help(help)
        .env(env)
        .default_value(default)
        .value_parser(clap::value_parser!(u32).range(1..))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RATE_LIMIT_DISABLED)
                .long(ARG_RATE_LIMIT_DISABLED)
                .help("Admit every request without counting it")
                .env("TURNSTILE_RATE_LIMIT_DISABLED")
                .action(ArgAction::SetTrue),
        )
        .arg(limit_arg(
            ARG_RATE_LIMIT_GENERAL,
            "TURNSTILE_RATE_LIMIT_GENERAL",
            "Requests per window for unclassified endpoints",
            "100",
        ))
        .arg(limit_arg(
            ARG_RATE_LIMIT_AUTH,
            "TURNSTILE_RATE_LIMIT_AUTH",
            "Requests per window for login and register endpoints",
            "5",
        ))
        .arg(limit_arg(
            ARG_RATE_LIMIT_API,
            "TURNSTILE_RATE_LIMIT_API",
            "Requests per window for /v1 API endpoints",
            "1000",
        ))
        .arg(limit_arg(
            ARG_RATE_LIMIT_MFA,
            "TURNSTILE_RATE_LIMIT_MFA",
            "Requests per MFA window for second-factor endpoints",
            "5",
        ))
        .arg(
            Arg::new(ARG_RATE_LIMIT_WINDOW)
                .long(ARG_RATE_LIMIT_WINDOW)
                .help("Window in seconds for the general, auth and api limits")
                .env("TURNSTILE_RATE_LIMIT_WINDOW")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_MFA_WINDOW)
                .long(ARG_RATE_LIMIT_MFA_WINDOW)
                .help("Window in seconds for the MFA limit")
                .env("TURNSTILE_RATE_LIMIT_MFA_WINDOW")
                .default_value("300")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
