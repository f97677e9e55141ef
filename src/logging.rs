//! Logging setup and redaction helpers for profiles.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Inline blocks whose body must never reach a log.
const SENSITIVE_BLOCKS: &[&str] = &[
    "auth-user-pass",
    "key",
    "pkcs12",
    "tls-auth",
    "tls-crypt",
    "tls-crypt-v2",
    "secret",
    "http-proxy-user-pass",
];

/// Directives whose arguments are masked.
const SENSITIVE_DIRECTIVES: &[&str] = &["auth-token", "auth-token-user", "static-challenge"];

/// Install the global subscriber.
///
/// Priority: RUST_LOG, then RUST_LOG_LEVEL (e.g. "debug"), then `verbose`.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let default_level = std::env::var("RUST_LOG_LEVEL").unwrap_or_else(|_| fallback.to_string());
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();
}

/// Copy of `profile` with secret blocks and tokens replaced by `<redacted>`.
pub fn redact_profile(profile: &str) -> String {
    let mut out = Vec::new();
    let mut in_secret: Option<&str> = None;

    for line in profile.lines() {
        let trimmed = line.trim();
        if let Some(tag) = in_secret {
            if trimmed.strip_prefix("</").and_then(|t| t.strip_suffix('>')) == Some(tag) {
                out.push(trimmed.to_string());
                in_secret = None;
            }
            continue;
        }
        if let Some(tag) = trimmed.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
            if let Some(s) = SENSITIVE_BLOCKS.iter().find(|s| **s == tag) {
                out.push(trimmed.to_string());
                out.push("<redacted>".to_string());
                in_secret = Some(*s);
                continue;
            }
        }
        let mut words = trimmed.split_whitespace();
        match words.next() {
            Some(d) if SENSITIVE_DIRECTIVES.contains(&d) && words.next().is_some() => {
                out.push(format!("{d} <redacted>"));
            }
            _ => out.push(line.to_string()),
        }
    }
    out.join("\n")
}
