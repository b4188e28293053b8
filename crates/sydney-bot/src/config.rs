//! TOML configuration for the bot layer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sydney_client::exchange::ExchangeConfig;
use sydney_client::{ClientConfig, ToneStyle};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),
}

/// Deployment configuration, deserialized with serde defaults so a partial
/// file stays valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// `_U` cookie value from bing.com; empty means anonymous.
    pub token: String,
    pub host: String,
    /// Reverse proxy host for the socket, if any.
    pub websocket_host: Option<String>,
    pub proxy: Option<String>,
    pub bot_name: String,
    /// Persona preamble; `[name]` is substituted with `bot_name`.
    pub persona: String,
    pub tone: ToneStyle,
    /// Fixed context string injected into every turn.
    pub context: Option<String>,
    pub max_user_turns: u32,
    pub timeout_ms: u64,
    pub first_frame_timeout_ms: u64,
    /// Drop apology turns from the persisted record.
    pub apology_ignored: bool,
    /// Whole-turn retries before reporting failure.
    pub retries: u32,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            host: "https://edgeservices.bing.com/edgesvc".to_string(),
            websocket_host: None,
            proxy: None,
            bot_name: "Sydney".to_string(),
            persona: "You are [name], a helpful AI assistant. Answer in the language the user writes in.".to_string(),
            tone: ToneStyle::Creative,
            context: None,
            max_user_turns: 10,
            timeout_ms: 120_000,
            first_frame_timeout_ms: 40_000,
            apology_ignored: false,
            retries: 5,
        }
    }
}

impl BotConfig {
    /// Translate into the client's configuration.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.host.clone(),
            auth_cookie: (!self.token.is_empty()).then(|| format!("_U={}", self.token)),
            websocket_host: self.websocket_host.clone(),
            proxy: self.proxy.clone(),
            persona: self.persona.clone(),
            bot_name: self.bot_name.clone(),
            tone: self.tone,
            max_user_turns: self.max_user_turns,
            exchange: ExchangeConfig {
                timeout: Duration::from_millis(self.timeout_ms),
                first_frame_timeout: Duration::from_millis(self.first_frame_timeout_ms),
            },
            apology_ignored: self.apology_ignored,
            ..ClientConfig::default()
        }
    }
}

/// Load config from a specific TOML file path.
pub fn load_from_path(path: &Path) -> Result<BotConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ParseError(format!("failed to read {}: {e}", path.display())))?;
    let config: BotConfig =
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(format!("failed to parse TOML: {e}")))?;
    info!("loaded config from {}", path.display());
    Ok(config)
}

/// Load config from the platform config directory, creating a default file
/// on first run.
pub fn load_default() -> Result<BotConfig, ConfigError> {
    let path = default_config_path()?;
    if !path.exists() {
        info!("no config found at {}, creating default", path.display());
        let config = BotConfig::default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        }
        let rendered =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(&path, rendered).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        return Ok(config);
    }
    load_from_path(&path)
}

fn default_config_path() -> Result<PathBuf, ConfigError> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::ParseError("could not determine config directory".into()))?;
    Ok(config_dir.join("sydney").join("config.toml"))
}
