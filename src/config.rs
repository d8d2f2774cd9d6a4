//! Client configuration
//!
//! Defaults are embedded from `config.toml`; `BACKEND_URL` and
//! `BACKEND_AUTH_TOKEN` in the environment override them.

use serde::Deserialize;
use thiserror::Error;

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub backend: BackendConfig,
    pub audio: AudioConfig,
}

/// Backend connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the session API, e.g. "http://127.0.0.1:8000/api"
    pub base_url: String,
    /// Optional bearer token attached to every request
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Audio capture settings
#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    /// Sample rate negotiated with the backend STT pipeline
    pub sample_rate: u32,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config.toml: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    /// Load the embedded configuration and apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        const CONFIG_TOML: &str = include_str!("../config.toml");
        let mut config: Config = toml::from_str(CONFIG_TOML)?;

        if let Ok(url) = std::env::var("BACKEND_URL") {
            if !url.is_empty() {
                config.backend.base_url = url;
            }
        }
        if let Ok(token) = std::env::var("BACKEND_AUTH_TOKEN") {
            if !token.is_empty() {
                config.backend.auth_token = Some(token);
            }
        }

        // A trailing slash would produce double slashes in joined URLs
        config.backend.base_url = config.backend.base_url.trim_end_matches('/').to_string();

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_config_parses() {
        let config: Config =
            toml::from_str(include_str!("../config.toml")).expect("embedded config must parse");
        assert!(!config.backend.base_url.is_empty());
        assert!(config.audio.sample_rate > 0);
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let toml_str = r#"
            [backend]
            base_url = "http://example.com/api/"
            [audio]
            sample_rate = 16000
        "#;
        let mut config: Config = toml::from_str(toml_str).unwrap();
        config.backend.base_url = config.backend.base_url.trim_end_matches('/').to_string();
        assert_eq!(config.backend.base_url, "http://example.com/api");
    }
}
