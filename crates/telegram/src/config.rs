use std::path::Path;

use {
    parley_flows::FlowEngineConfig,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::error::{Context, Error, Result};

/// A slash command advertised to Telegram clients for autocomplete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotCommandConfig {
    pub command: String,
    pub description: String,
}

impl BotCommandConfig {
    pub fn new(command: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            description: description.into(),
        }
    }
}

/// Configuration for one Telegram bot.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramAccountConfig {
    /// Bot token from @BotFather.
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,

    /// Long-poll timeout passed to `getUpdates` (seconds).
    pub poll_timeout_secs: u32,

    /// Pause after a failed `getUpdates` call (seconds).
    pub retry_delay_secs: u64,

    /// Commands registered with `setMyCommands`. Empty leaves the bot's
    /// current command list alone.
    pub commands: Vec<BotCommandConfig>,

    /// Flow engine settings for this bot.
    pub flows: FlowEngineConfig,
}

impl std::fmt::Debug for TelegramAccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramAccountConfig")
            .field("token", &"[REDACTED]")
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("flows", &self.flows)
            .finish_non_exhaustive()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Default for TelegramAccountConfig {
    fn default() -> Self {
        Self {
            token: Secret::new(String::new()),
            poll_timeout_secs: 30,
            retry_delay_secs: 5,
            commands: vec![
                BotCommandConfig::new("cancel", "Cancel the current conversation"),
                BotCommandConfig::new("help", "Show available commands"),
            ],
            flows: FlowEngineConfig::default(),
        }
    }
}

impl TelegramAccountConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parse telegram config")
    }

    /// Load from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read telegram config {}", path.display()))?;
        let parsing = || format!("parse telegram config {}", path.display());
        match path.extension().and_then(|e| e.to_str()).unwrap_or("toml") {
            "toml" => toml::from_str(&raw).with_context(parsing),
            "json" => serde_json::from_str(&raw).with_context(parsing),
            ext => Err(Error::message(format!("unsupported config format: .{ext}"))),
        }
    }

    pub fn has_token(&self) -> bool {
        !self.token.expose_secret().trim().is_empty()
    }
}
