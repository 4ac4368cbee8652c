//! Agent configuration
//!
//! Loaded once at startup from a TOML file, then overridden by environment
//! variables. The only fatal condition is a missing secret key: everything
//! else falls back to a usable default.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_silence_limit_secs")]
    pub silence_limit_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_backend_url() -> String {
    "http://localhost:3001".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_reconnect_delay_secs() -> u64 {
    3
}

fn default_silence_limit_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            secret_key: String::new(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            silence_limit_secs: default_silence_limit_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl AgentConfig {
    /// Load the config file, apply env overrides, validate.
    ///
    /// File resolution: `RELAYWATCH_CONFIG` if set, else
    /// `<config_dir>/relaywatch-agent/config.toml`. A missing file is fine;
    /// a malformed one is not.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let mut config = match path {
            Some(ref p) if p.exists() => {
                let txt = std::fs::read_to_string(p)
                    .with_context(|| format!("lecture config {}", p.display()))?;
                toml::from_str(&txt).with_context(|| format!("config invalide {}", p.display()))?
            }
            _ => AgentConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(p) = std::env::var("RELAYWATCH_CONFIG") {
            return Some(PathBuf::from(p));
        }
        dirs::config_dir().map(|d| d.join("relaywatch-agent").join("config.toml"))
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("RELAYWATCH_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Ok(key) = std::env::var("RELAYWATCH_SECRET_KEY") {
            self.secret_key = key;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.secret_key.trim().is_empty() {
            bail!("clé secrète manquante (config.toml ou RELAYWATCH_SECRET_KEY)");
        }
        Ok(())
    }

    /// Base URL without trailing slash, ready for path concatenation.
    pub fn base_url(&self) -> String {
        self.backend_url.trim_end_matches('/').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = AgentConfig::default();
        assert_eq!(config.backend_url, "http://localhost:3001");
        assert_eq!(config.heartbeat_secs, 30);
        assert_eq!(config.reconnect_delay_secs, 3);
        assert_eq!(config.silence_limit_secs, 60);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            backend_url = "https://relaywatch.example.com"
            secret_key = "agt_abc123"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend_url, "https://relaywatch.example.com");
        assert_eq!(config.secret_key, "agt_abc123");
        assert_eq!(config.heartbeat_secs, 30);
    }

    #[test]
    fn missing_secret_is_fatal() {
        let config = AgentConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn base_url_strips_trailing_slash() {
        let config = AgentConfig {
            backend_url: "http://localhost:3001/".into(),
            ..AgentConfig::default()
        };
        assert_eq!(config.base_url(), "http://localhost:3001");
    }
}
