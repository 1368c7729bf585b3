use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::chat::time::DisplayClock;
use crate::chat::RealtimeSettings;

/// Chatport realtime messaging server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "chatport-server", version, about = "Chatport realtime messaging server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "CHATPORT_PORT", default_value = "8000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "CHATPORT_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./chatport.toml")]
    pub config: String,

    /// Enable structured JSON logging
    #[arg(long, env = "CHATPORT_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, JWT secret)
    #[arg(long, env = "CHATPORT_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Realtime delivery tuning (loaded from [realtime] section in TOML).
    /// Not serialized, so the CLI layer cannot mask file or env values.
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub realtime: RealtimeConfig,

    /// Timestamp rendering (loaded from [display] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub display: DisplayConfig,
}

/// Per-connection buffering, heartbeat, and validation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Outbound frames buffered per connection before deliveries are dropped
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Milliseconds fanout waits for room in a full outbound buffer
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,

    /// Maximum message length in characters
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: default_outbound_buffer(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            max_content_length: default_max_content_length(),
        }
    }
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_delivery_timeout_ms() -> u64 {
    250
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_pong_timeout_secs() -> u64 {
    10
}

fn default_max_content_length() -> usize {
    4000
}

/// Fixed offset and label used to render `created_at` for clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,

    #[serde(default = "default_zone_label")]
    pub zone_label: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset_minutes(),
            zone_label: default_zone_label(),
        }
    }
}

fn default_utc_offset_minutes() -> i32 {
    300
}

fn default_zone_label() -> String {
    "PKT".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_address: "0.0.0.0".to_string(),
            config: "./chatport.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            realtime: RealtimeConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (CHATPORT_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("CHATPORT_").split("__"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    /// Resolve the realtime settings, rejecting values the runtime cannot use.
    pub fn realtime_settings(&self) -> Result<RealtimeSettings, String> {
        let realtime = &self.realtime;
        if realtime.outbound_buffer == 0 {
            return Err("realtime.outbound_buffer must be at least 1".to_string());
        }
        if realtime.max_content_length == 0 {
            return Err("realtime.max_content_length must be at least 1".to_string());
        }
        let clock = DisplayClock::new(self.display.utc_offset_minutes, self.display.zone_label.clone())
            .ok_or_else(|| {
                format!(
                    "display.utc_offset_minutes out of range: {}",
                    self.display.utc_offset_minutes
                )
            })?;

        Ok(RealtimeSettings {
            outbound_buffer: realtime.outbound_buffer,
            delivery_timeout: Duration::from_millis(realtime.delivery_timeout_ms),
            ping_interval: Duration::from_secs(realtime.ping_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(realtime.pong_timeout_secs.max(1)),
            max_content_length: realtime.max_content_length,
            clock,
        })
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Chatport Server Configuration
# Place this file at ./chatport.toml or specify with --config <path>
# All settings can be overridden via environment variables (CHATPORT_PORT,
# CHATPORT_REALTIME__OUTBOUND_BUFFER, etc.) or CLI flags (--port, etc.)

# Server port (default: 8000)
# port = 8000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging
# json_logs = false

# Data directory for the SQLite database and JWT secret
# data_dir = "./data"

# ---- Realtime delivery ----
# [realtime]

# Frames buffered per connection; deliveries beyond this wait, then drop
# outbound_buffer = 64

# How long (ms) a delivery may wait for room in a full buffer
# delivery_timeout_ms = 250

# Heartbeat: ping every N seconds, close if no pong within M seconds
# ping_interval_secs = 30
# pong_timeout_secs = 10

# Maximum message length in characters
# max_content_length = 4000

# ---- Timestamp rendering ----
# [display]

# created_at is rendered as "YYYY-MM-DD hh:mm:ss AM (LABEL)" in this offset
# utc_offset_minutes = 300
# zone_label = "PKT"
"#
    .to_string()
}
