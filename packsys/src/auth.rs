//! Registry credential pass-through.
//!
//! The engine never resolves credentials itself: `CNB_REGISTRY_AUTH` maps
//! registry hosts to ready-made HTTP Authorization headers, and the engine
//! hands the map to whatever image store needs it. Building and parsing of
//! the header values is provided for platforms that assemble the variable.

use anyhow::{bail, Context, Result};
use base64::Engine;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

pub const ENV_REGISTRY_AUTH: &str = "CNB_REGISTRY_AUTH";

/// Credential parts for one registry, mirroring the docker config shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    /// Pre-encoded `user:pass`, used verbatim in a Basic header.
    pub auth: String,
    pub username: String,
    pub password: String,
    pub registry_token: String,
    pub identity_token: String,
}

/// Parse an environment variable holding a JSON object that maps registry
/// hosts to Authorization headers. An unset or empty variable is an empty
/// map.
pub fn read_env_var(var: &str) -> Result<HashMap<String, String>> {
    match std::env::var(var) {
        Ok(raw) if !raw.is_empty() => {
            serde_json::from_str(&raw).context(format!("failed to parse {var} value"))
        }
        _ => Ok(HashMap::new()),
    }
}

/// Render credential parts as an Authorization header, preferring the most
/// direct form available. The `Access` scheme carries an identity token;
/// it round-trips through [`header_to_config`].
pub fn config_to_header(config: &AuthConfig) -> Option<String> {
    if !config.auth.is_empty() {
        return Some(format!("Basic {}", config.auth));
    }
    if !config.registry_token.is_empty() {
        return Some(format!("Bearer {}", config.registry_token));
    }
    if !config.username.is_empty() && !config.password.is_empty() {
        let delimited = format!("{}:{}", config.username, config.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(delimited);
        return Some(format!("Basic {encoded}"));
    }
    if !config.identity_token.is_empty() {
        return Some(format!("Access {}", config.identity_token));
    }
    None
}

fn header_regexes() -> &'static [(Regex, fn(String) -> AuthConfig); 3] {
    static REGEXES: OnceLock<[(Regex, fn(String) -> AuthConfig); 3]> = OnceLock::new();
    REGEXES.get_or_init(|| {
        [
            (Regex::new("(?i)^basic (.*)$").unwrap(), |value| AuthConfig {
                auth: value,
                ..Default::default()
            }),
            (Regex::new("(?i)^bearer (.*)$").unwrap(), |value| AuthConfig {
                registry_token: value,
                ..Default::default()
            }),
            (Regex::new("(?i)^access (.*)$").unwrap(), |value| AuthConfig {
                identity_token: value,
                ..Default::default()
            }),
        ]
    })
}

/// Parse an Authorization header back into credential parts. Scheme names
/// are matched case-insensitively.
pub fn header_to_config(header: &str) -> Result<AuthConfig> {
    for (regex, build) in header_regexes() {
        if let Some(captures) = regex.captures(header) {
            return Ok(build(captures[1].to_string()));
        }
    }
    bail!("unknown auth type from header: {header}")
}
