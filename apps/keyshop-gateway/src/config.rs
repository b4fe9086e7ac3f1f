use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub database_url: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Telegram token for outcome notifications; optional so the webhook
    /// surface can run (and log outcomes) without a bot.
    pub bot_token: Option<String>,
    #[serde(default = "default_panel_timeout_secs")]
    pub panel_timeout_secs: u64,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_panel_timeout_secs() -> u64 {
    15
}

impl GatewayConfig {
    pub fn load() -> Result<Self> {
        let config_paths = ["/etc/keyshop/gateway.toml", "./gateway.toml"];

        for path in config_paths {
            if let Ok(contents) = fs::read_to_string(path) {
                tracing::info!("Loading config from {}", path);
                return Ok(toml::from_str(&contents)?);
            }
        }

        // Fallback to environment variables
        tracing::info!("Loading config from environment");
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")?,
            listen_port: std::env::var("LISTEN_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(default_listen_port),
            bot_token: std::env::var("BOT_TOKEN").ok().filter(|t| !t.is_empty()),
            panel_timeout_secs: std::env::var("PANEL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_panel_timeout_secs),
        })
    }
}
