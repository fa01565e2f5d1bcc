// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// Session Configuration
//
// Explicit, immutable configuration handed to a session at construction.
// Nothing here is read from ambient scope; the CLI is the only place that
// merges files, flags and environment.

use crate::error::{Result, WhipError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// STUN server used by publish sessions when no explicit list is configured.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Bulk-ICE fallback wait for publish sessions.
pub const DEFAULT_WHIP_GATHER_TIMEOUT_MS: u64 = 2000;

/// Gathering wait for playback sessions.
pub const DEFAULT_WHEP_GATHER_TIMEOUT_MS: u64 = 1000;

/// Fixed delay between playback negotiation attempts.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10000;

// ============================================================================
// ICE SERVER
// ============================================================================

/// STUN/TURN entry handed to the media transport.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

// ============================================================================
// WHIP CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhipConfig {
    pub endpoint_url: String,
    /// Optional Bearer token for authentication.
    /// Set to None for endpoints that don't require authentication (e.g., Cloudflare Stream).
    pub auth_token: Option<String>,
    pub ice_servers: Vec<IceServer>,
    /// Disables trickle ICE: the offer is sent once gathering completes.
    pub no_trickle_ice: bool,
    pub ice_gathering_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub debug: bool,
}

impl Default for WhipConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            auth_token: None,
            ice_servers: vec![IceServer::new(DEFAULT_STUN_SERVER)],
            no_trickle_ice: false,
            ice_gathering_timeout_ms: DEFAULT_WHIP_GATHER_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            debug: false,
        }
    }
}

impl WhipConfig {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            ..Default::default()
        }
    }

    /// Parses and checks the endpoint URL.
    pub fn validate(&self) -> Result<Url> {
        parse_endpoint(&self.endpoint_url)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        load_toml(path.as_ref())
    }
}

// ============================================================================
// WHEP CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhepConfig {
    pub endpoint_url: String,
    /// Optional Bearer token for authentication.
    pub auth_token: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub ice_gathering_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub debug: bool,
}

impl Default for WhepConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            auth_token: None,
            ice_servers: Vec::new(),
            ice_gathering_timeout_ms: DEFAULT_WHEP_GATHER_TIMEOUT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            debug: false,
        }
    }
}

impl WhepConfig {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<Url> {
        parse_endpoint(&self.endpoint_url)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        load_toml(path.as_ref())
    }
}

fn parse_endpoint(endpoint_url: &str) -> Result<Url> {
    let url = Url::parse(endpoint_url).map_err(|e| {
        WhipError::Configuration(format!("Invalid endpoint URL '{}': {}", endpoint_url, e))
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(WhipError::Configuration(format!(
            "Endpoint URL must be http(s), got '{}'",
            other
        ))),
    }
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|e| {
        WhipError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whip_defaults() {
        let config = WhipConfig::default();
        assert_eq!(config.ice_gathering_timeout(), Duration::from_millis(2000));
        assert!(!config.no_trickle_ice);
        assert_eq!(config.ice_servers, vec![IceServer::new(DEFAULT_STUN_SERVER)]);
    }

    #[test]
    fn test_whep_defaults() {
        let config = WhepConfig::default();
        assert_eq!(config.ice_gathering_timeout(), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay(), Duration::from_millis(5000));
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_endpoints() {
        assert!(WhipConfig::new("not a url").validate().is_err());
        assert!(WhipConfig::new("ftp://example.com/whip").validate().is_err());

        let url = WhipConfig::new("https://example.com/whip/abc")
            .validate()
            .unwrap();
        assert_eq!(url.path(), "/whip/abc");
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whip.toml");
        std::fs::write(
            &path,
            r#"
endpoint_url = "http://localhost:8080/whip/live"
no_trickle_ice = true

[[ice_servers]]
urls = ["turn:turn.example.com:3478"]
username = "user"
credential = "secret"
"#,
        )
        .unwrap();

        let config = WhipConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.endpoint_url, "http://localhost:8080/whip/live");
        assert!(config.no_trickle_ice);
        assert_eq!(config.ice_gathering_timeout_ms, 2000);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("user"));
    }

    #[test]
    fn test_load_invalid_toml_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whep.toml");
        std::fs::write(&path, "endpoint_url = [").unwrap();

        let err = WhepConfig::from_toml_file(&path).unwrap_err();
        assert!(matches!(err, WhipError::Configuration(_)));
    }
}
