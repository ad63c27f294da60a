//! Engine-wide configuration.
//!
//! Extends [`crate::cloudllm::config::CloudLLMConfig`]'s "construct manually,
//! no file-format parser" philosophy with an environment-variable loader:
//! the engine's process-wide settings (provider token, trace directory, auth
//! secret) are still plain fields a caller can set by hand, but
//! [`Config::from_env`] gives the common case a one-line entry point instead
//! of forcing every embedder to hand-roll `std::env::var` calls.

use std::env;
use std::path::PathBuf;

/// Process-wide settings, initialized once at startup and never mutated
/// thereafter (tool handlers and the gateway read it behind a shared
/// reference).
#[derive(Debug, Clone)]
pub struct Config {
    /// API token for the primary model provider.
    pub provider_token: Option<String>,
    /// Optional per-tool API tokens, keyed by tool name (e.g. a search API
    /// key for a web-search tool).
    pub tool_tokens: std::collections::HashMap<String, String>,
    /// Directory where run traces and blackboard logs are written.
    pub reports_dir: PathBuf,
    /// Shared secret compared against the `X-API-Key` header.
    pub auth_secret: Option<String>,
    /// When true, the auth check is bypassed entirely (development mode).
    pub dev_bypass_auth: bool,
    /// Enables the tracing client wrapper regardless of `COORD_TRACE`.
    pub trace_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider_token: None,
            tool_tokens: std::collections::HashMap::new(),
            reports_dir: PathBuf::from("reports"),
            auth_secret: None,
            dev_bypass_auth: true,
            trace_enabled: false,
        }
    }
}

impl Config {
    /// Load settings from environment variables, falling back to
    /// [`Config::default`] for anything unset.
    ///
    /// Recognized variables: `COORD_PROVIDER_TOKEN`, `COORD_REPORTS_DIR`,
    /// `COORD_AUTH_SECRET`, `COORD_DEV_BYPASS_AUTH` (`"1"`/`"true"` enables),
    /// `COORD_TRACE` (`"1"` enables tracing).
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(token) = env::var("COORD_PROVIDER_TOKEN") {
            config.provider_token = Some(token);
        }
        if let Ok(dir) = env::var("COORD_REPORTS_DIR") {
            config.reports_dir = PathBuf::from(dir);
        }
        if let Ok(secret) = env::var("COORD_AUTH_SECRET") {
            config.auth_secret = Some(secret);
        }
        if let Ok(flag) = env::var("COORD_DEV_BYPASS_AUTH") {
            config.dev_bypass_auth = is_truthy(&flag);
        } else if config.auth_secret.is_some() {
            // An explicit secret with no explicit bypass flag means the
            // caller intends auth to be enforced.
            config.dev_bypass_auth = false;
        }
        if let Ok(flag) = env::var("COORD_TRACE") {
            config.trace_enabled = is_truthy(&flag);
        }

        config
    }

    /// Check a presented `X-API-Key` value against the configured secret.
    ///
    /// Always constant-time via [`subtle::ConstantTimeEq`] so a timing
    /// oracle can't leak how many leading bytes matched, matching the
    /// comparison already used for MCP server auth. Returns `true`
    /// unconditionally when `dev_bypass_auth` is set or no secret is
    /// configured.
    pub fn check_api_key(&self, presented: &str) -> bool {
        use subtle::ConstantTimeEq;

        if self.dev_bypass_auth {
            return true;
        }
        match &self.auth_secret {
            None => true,
            Some(secret) => {
                let a = secret.as_bytes();
                let b = presented.as_bytes();
                a.len() == b.len() && a.ct_eq(b).into()
            }
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_bypass_accepts_anything() {
        let config = Config::default();
        assert!(config.check_api_key("anything"));
    }

    #[test]
    fn mismatched_secret_rejected() {
        let config = Config {
            auth_secret: Some("s3cr3t".to_string()),
            dev_bypass_auth: false,
            ..Config::default()
        };
        assert!(config.check_api_key("s3cr3t"));
        assert!(!config.check_api_key("wrong"));
        assert!(!config.check_api_key("s3cr3"));
    }
}
