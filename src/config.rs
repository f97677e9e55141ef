//! Session configuration and profile normalization.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::channel::BlockingMode;
use crate::engine::EngineConfig;

/// Directives the engine rejects or that break headless operation.
pub const DEFAULT_UNSUPPORTED_DIRECTIVES: &[&str] = &["ping-timer-rem", "remote-random", "fast-io"];

/// Per-session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Engine connect timeout in seconds
    #[serde(default = "default_conn_timeout")]
    pub conn_timeout_secs: u32,

    /// Compression mode handed to the engine ("yes", "no", "asym")
    #[serde(default = "default_compression_mode")]
    pub compression_mode: String,

    /// Keep the TUN across reconnects
    #[serde(default)]
    pub tun_persist: bool,

    /// Allow autologin profiles
    #[serde(default)]
    pub autologin_sessions: bool,

    /// How long disconnect waits for the worker before detaching it
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,

    /// Blocking application end (a plain read waits for the next packet)
    #[serde(default = "default_true")]
    pub app_end_blocking: bool,

    /// Rewrite or add `verb N`; `None` leaves the profile alone
    #[serde(default = "default_force_verb")]
    pub force_verb: Option<u8>,

    /// Directives stripped from the profile before evaluation
    #[serde(default = "default_unsupported_directives")]
    pub unsupported_directives: Vec<String>,

    /// Number of engine events kept per session
    #[serde(default = "default_event_history")]
    pub event_history: usize,
}

fn default_conn_timeout() -> u32 {
    30
}
fn default_compression_mode() -> String {
    "asym".to_string()
}
fn default_disconnect_grace_ms() -> u64 {
    100
}
fn default_true() -> bool {
    true
}
fn default_force_verb() -> Option<u8> {
    Some(5)
}
fn default_unsupported_directives() -> Vec<String> {
    DEFAULT_UNSUPPORTED_DIRECTIVES
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_event_history() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            conn_timeout_secs: default_conn_timeout(),
            compression_mode: default_compression_mode(),
            tun_persist: false,
            autologin_sessions: false,
            disconnect_grace_ms: default_disconnect_grace_ms(),
            app_end_blocking: true,
            force_verb: default_force_verb(),
            unsupported_directives: default_unsupported_directives(),
            event_history: default_event_history(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a JSON file
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.conn_timeout_secs == 0 {
            anyhow::bail!("conn_timeout_secs cannot be zero");
        }
        if !matches!(self.compression_mode.as_str(), "yes" | "no" | "asym") {
            anyhow::bail!("compression_mode must be one of yes, no, asym");
        }
        Ok(())
    }

    pub fn app_mode(&self) -> BlockingMode {
        BlockingMode::from_blocking(self.app_end_blocking)
    }

    /// Engine settings for an already normalized profile.
    pub fn engine_config(&self, content: String) -> EngineConfig {
        EngineConfig {
            content,
            conn_timeout_secs: self.conn_timeout_secs,
            compression_mode: self.compression_mode.clone(),
            tun_persist: self.tun_persist,
            autologin_sessions: self.autologin_sessions,
        }
    }
}

/// Rewrite a profile so the engine asks for credentials instead of
/// reading them from a file.
///
/// * drops directives listed in `unsupported_directives`
/// * drops inline `<auth-user-pass>` blocks and collapses every
///   `auth-user-pass <file>` into one bare `auth-user-pass`
/// * ensures `client-cert-not-required`, placed before the first `auth` line
/// * applies `force_verb`
pub fn normalize_profile(profile: &str, config: &SessionConfig) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut block: Option<String> = None;
    let mut have_auth_user_pass = false;
    let mut have_cert_not_required = false;
    let mut have_verb = false;
    let mut first_auth_line: Option<usize> = None;

    for raw in profile.lines() {
        let line = raw.trim();

        if let Some(tag) = &block {
            if line == format!("</{tag}>") {
                if tag != "auth-user-pass" {
                    out.push(line.to_string());
                }
                block = None;
            } else if tag != "auth-user-pass" {
                out.push(raw.to_string());
            }
            continue;
        }

        if let Some(tag) = line.strip_prefix('<').and_then(|l| l.strip_suffix('>')) {
            if !tag.starts_with('/') {
                block = Some(tag.to_string());
                if tag == "auth-user-pass" {
                    continue;
                }
            }
            out.push(line.to_string());
            continue;
        }

        let directive = line.split_whitespace().next().unwrap_or("");
        if config.unsupported_directives.iter().any(|d| d == directive) {
            continue;
        }
        match directive {
            "auth-user-pass" => {
                if !have_auth_user_pass {
                    out.push("auth-user-pass".to_string());
                    have_auth_user_pass = true;
                }
            }
            "client-cert-not-required" => {
                have_cert_not_required = true;
                out.push(line.to_string());
            }
            "verb" if config.force_verb.is_some() => {
                if let (false, Some(v)) = (have_verb, config.force_verb) {
                    out.push(format!("verb {v}"));
                    have_verb = true;
                }
            }
            "auth" => {
                first_auth_line.get_or_insert(out.len());
                out.push(line.to_string());
            }
            _ => out.push(raw.trim_end().to_string()),
        }
    }

    if !have_auth_user_pass {
        out.push("auth-user-pass".to_string());
    }
    if !have_cert_not_required {
        match first_auth_line {
            Some(i) => out.insert(i, "client-cert-not-required".to_string()),
            None => out.push("client-cert-not-required".to_string()),
        }
    }
    if let (false, Some(v)) = (have_verb, config.force_verb) {
        out.push(format!("verb {v}"));
    }

    let mut text = out.join("\n");
    text.push('\n');
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PROFILE: &str = "client\n\
        dev tun\n\
        remote vpn.example.net 1194 udp\n\
        remote-random\n\
        ping-timer-rem\n\
        auth SHA512\n\
        auth-user-pass /sdcard/creds.txt\n\
        verb 3\n\
        <ca>\n\
        -----BEGIN CERTIFICATE-----\n\
        MIIB\n\
        -----END CERTIFICATE-----\n\
        </ca>\n";

    #[test]
    fn test_normalize_profile() {
        let out = normalize_profile(PROFILE, &SessionConfig::default());
        let lines: Vec<&str> = out.lines().collect();

        assert!(!out.contains("remote-random"));
        assert!(!out.contains("ping-timer-rem"));
        assert!(!out.contains("/sdcard/creds.txt"));
        assert_eq!(lines.iter().filter(|l| **l == "auth-user-pass").count(), 1);
        assert!(lines.contains(&"verb 5"));
        assert!(!lines.contains(&"verb 3"));

        let cert = lines.iter().position(|l| *l == "client-cert-not-required").unwrap();
        let auth = lines.iter().position(|l| *l == "auth SHA512").unwrap();
        assert_eq!(cert + 1, auth);
        assert!(lines.contains(&"-----BEGIN CERTIFICATE-----"));
        assert!(lines.contains(&"</ca>"));
    }

    #[test]
    fn test_normalize_adds_missing_directives() {
        let config = SessionConfig {
            force_verb: None,
            ..SessionConfig::default()
        };
        let out = normalize_profile("client\nremote 10.0.0.1\nverb 4", &config);
        assert_eq!(
            out,
            "client\nremote 10.0.0.1\nverb 4\nauth-user-pass\nclient-cert-not-required\n"
        );
    }

    #[test]
    fn test_inline_credentials_removed() {
        let profile = "client\n<auth-user-pass>\nalice\nsecret\n</auth-user-pass>\nremote a.b\n";
        let out = normalize_profile(profile, &SessionConfig::default());
        assert!(!out.contains("alice"));
        assert!(!out.contains("secret"));
        assert!(!out.contains("<auth-user-pass>"));
        assert!(out.contains("\nauth-user-pass\n"));
    }

    #[test]
    fn test_directive_match_is_by_name() {
        // "fast-io" as an argument of another directive must survive
        let out = normalize_profile("setenv NOTE fast-io\nfast-io\n", &SessionConfig::default());
        assert!(out.contains("setenv NOTE fast-io"));
        assert_eq!(out.matches("fast-io").count(), 1);
    }

    #[test]
    fn test_load_json_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"conn_timeout_secs": 15, "app_end_blocking": false}}"#).unwrap();

        let config = SessionConfig::load_json(file.path()).unwrap();
        assert_eq!(config.conn_timeout_secs, 15);
        assert_eq!(config.compression_mode, "asym");
        assert_eq!(config.disconnect_grace_ms, 100);
        assert_eq!(config.app_mode(), BlockingMode::NonBlocking);
        assert_eq!(config.unsupported_directives.len(), 3);

        let engine = config.engine_config("client".into());
        assert_eq!(engine.conn_timeout_secs, 15);
        assert!(!engine.tun_persist);
        assert!(!engine.autologin_sessions);
    }

    #[test]
    fn test_invalid_json_config() {
        assert!(SessionConfig::from_json(r#"{"compression_mode": "lz4"}"#).is_err());
        assert!(SessionConfig::from_json(r#"{"conn_timeout_secs": 0}"#).is_err());
        assert!(SessionConfig::load_json("/nonexistent/ovpn.json").is_err());
    }
}
