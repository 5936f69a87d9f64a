use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use base64::Engine;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

/// Decoded length both API keys must have.
pub const API_KEY_LENGTH: usize = 56;

/// How often the reload watcher polls the file's modification time.
const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration problems are the only fatal errors in the server.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not open configuration file {0}: {1}")]
    Unreadable(PathBuf, std::io::Error),
    #[error("invalid JSON formatted configuration file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid {0} API key")]
    InvalidApiKey(&'static str),
    #[error("invalid {0} API key length")]
    InvalidApiKeyLength(&'static str),
    #[error("invalid database server URL")]
    InvalidDatabaseServer,
    #[error("invalid inbound port")]
    InvalidInboundPort,
    #[error("invalid server identifier")]
    InvalidServerIdentifier,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    inbound_api_key: String,
    outbound_api_key: String,
    database_server: String,
    inbound_port: i64,
    server_identifier: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default = "default_pinger")]
    pinger: String,
}

fn default_pinger() -> String {
    "Pinger".to_string()
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Shared secret for the inbound control API; consumed by the
    /// authenticating transport collaborator.
    pub inbound_api_key: Vec<u8>,
    /// Shared secret for controller POSTs; consumed by the outbound
    /// transport collaborator.
    pub outbound_api_key: Vec<u8>,
    pub database_server: Url,
    pub inbound_port: u16,
    pub server_identifier: String,
    /// Headers attached to every probe request.
    pub headers: HashMap<String, String>,
    /// Path of the pinger's local stream socket.
    pub pinger: String,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|error| ConfigError::Unreadable(path.to_path_buf(), error))?;
        let raw: RawConfig = serde_json::from_str(&content)?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let inbound_api_key = decode_api_key(&raw.inbound_api_key, "inbound")?;
        let outbound_api_key = decode_api_key(&raw.outbound_api_key, "outbound")?;

        let database_server =
            Url::parse(&raw.database_server).map_err(|_| ConfigError::InvalidDatabaseServer)?;

        if raw.inbound_port < 1 || raw.inbound_port > 65535 {
            return Err(ConfigError::InvalidInboundPort);
        }

        if raw.server_identifier.is_empty() {
            return Err(ConfigError::InvalidServerIdentifier);
        }

        Ok(Self {
            inbound_api_key,
            outbound_api_key,
            database_server,
            inbound_port: raw.inbound_port as u16,
            server_identifier: raw.server_identifier,
            headers: raw.headers,
            pinger: raw.pinger,
        })
    }
}

fn decode_api_key(encoded: &str, which: &'static str) -> Result<Vec<u8>, ConfigError> {
    let key = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| ConfigError::InvalidApiKey(which))?;
    if key.len() != API_KEY_LENGTH {
        return Err(ConfigError::InvalidApiKeyLength(which));
    }
    Ok(key)
}

/// Watch the configuration file and re-apply it when it changes. An invalid
/// reload is fatal: the process exits with code 1.
pub fn spawn_reload_watcher(
    path: PathBuf,
    on_reload: impl Fn(ServerConfig) + Send + Sync + 'static,
) {
    tokio::spawn(async move {
        let mut last_modified = modification_time(&path);
        let mut interval = tokio::time::interval(RELOAD_POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let modified = modification_time(&path);
            if modified.is_some() && modified != last_modified {
                last_modified = modified;
                match ServerConfig::load(&path) {
                    Ok(config) => {
                        info!("Configuration file reloaded");
                        on_reload(config);
                    }
                    Err(config_error) => {
                        error!("Configuration reload failed: {}", config_error);
                        std::process::exit(1);
                    }
                }
            }
        }
    });
}

fn modification_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|metadata| metadata.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_key() -> String {
        base64::engine::general_purpose::STANDARD.encode([7u8; API_KEY_LENGTH])
    }

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let mut file = fs::File::create(&path).expect("create config");
        file.write_all(content.as_bytes()).expect("write config");
        (dir, path)
    }

    fn valid_config_json() -> String {
        format!(
            r#"{{
                "inbound_api_key": "{key}",
                "outbound_api_key": "{key}",
                "database_server": "https://db.example.com",
                "inbound_port": 8080,
                "server_identifier": "test-region-1",
                "headers": {{"x-forwarded-for": "1.2.3.4"}},
                "pinger": "/run/pinger.sock"
            }}"#,
            key = sample_key()
        )
    }

    #[test]
    fn valid_configuration_loads() {
        let (_dir, path) = write_config(&valid_config_json());
        let config = ServerConfig::load(&path).expect("valid configuration");

        assert_eq!(config.inbound_api_key.len(), API_KEY_LENGTH);
        assert_eq!(config.outbound_api_key.len(), API_KEY_LENGTH);
        assert_eq!(config.database_server.as_str(), "https://db.example.com/");
        assert_eq!(config.inbound_port, 8080);
        assert_eq!(config.server_identifier, "test-region-1");
        assert_eq!(config.headers.get("x-forwarded-for").map(String::as_str), Some("1.2.3.4"));
        assert_eq!(config.pinger, "/run/pinger.sock");
    }

    #[test]
    fn pinger_defaults_when_missing() {
        let json = valid_config_json().replace("\"pinger\": \"/run/pinger.sock\"", "\"pinger_unused\": \"\"");
        let (_dir, path) = write_config(&json);
        let config = ServerConfig::load(&path).expect("valid configuration");
        assert_eq!(config.pinger, "Pinger");
    }

    #[test]
    fn short_api_keys_are_rejected() {
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        let json = valid_config_json().replace(&sample_key(), &short);
        let (_dir, path) = write_config(&json);
        assert!(matches!(
            ServerConfig::load(&path),
            Err(ConfigError::InvalidApiKeyLength("inbound"))
        ));
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let json = valid_config_json().replace("8080", "70000");
        let (_dir, path) = write_config(&json);
        assert!(matches!(ServerConfig::load(&path), Err(ConfigError::InvalidInboundPort)));
    }

    #[test]
    fn empty_identifier_is_rejected() {
        let json = valid_config_json().replace("test-region-1", "");
        let (_dir, path) = write_config(&json);
        assert!(matches!(ServerConfig::load(&path), Err(ConfigError::InvalidServerIdentifier)));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let (_dir, path) = write_config("{ not json");
        assert!(matches!(ServerConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nope.json");
        assert!(matches!(ServerConfig::load(&path), Err(ConfigError::Unreadable(_, _))));
    }
}
