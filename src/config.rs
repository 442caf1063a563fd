use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config error: {0}")]
    Io(String),
    #[error("Invalid signaling url: {0}")]
    InvalidUrl(String),
}

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/ws";

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_owned(),
        "stun:stun.cloudflare.com:3478".to_owned(),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub username: String,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_owned(),
            username: "anonymous".to_owned(),
            ice_servers: default_ice_servers(),
        }
    }
}

impl ClientConfig {
    /// Build the connection address for a room, with `room` and `name` as query parameters.
    pub fn signaling_endpoint(&self, room_id: &str, name: &str) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.signaling_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.signaling_url, e)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ConfigError::InvalidUrl(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        }
        url.query_pairs_mut()
            .append_pair("room", room_id)
            .append_pair("name", name);
        Ok(url)
    }
}

/// Location of the client config file
pub fn config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("duocall");
    fs::create_dir_all(&config_dir).ok();
    config_dir.join("client.json")
}

/// Load the config from disk, or the defaults when missing or unreadable
pub fn load_config() -> ClientConfig {
    let path = config_path();
    if !path.exists() {
        return ClientConfig::default();
    }
    match fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()))
    {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Ignoring unreadable config {}: {}", path.display(), e);
            ClientConfig::default()
        }
    }
}

pub fn save_config(config: &ClientConfig) -> Result<(), ConfigError> {
    let path = config_path();
    let content =
        serde_json::to_string_pretty(config).map_err(|e| ConfigError::Io(e.to_string()))?;
    fs::write(&path, content).map_err(|e| ConfigError::Io(e.to_string()))?;
    Ok(())
}
