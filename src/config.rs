// Relay configuration: relay_config.toml plus .env overrides

use digit_stats::TrackerOptions;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

pub const CONFIG_FILE: &str = "relay_config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub deriv: DerivSection,
    #[serde(default)]
    pub digits: DigitsSection,
    #[serde(default)]
    pub cache: CacheSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivSection {
    #[serde(default = "default_app_id")]
    pub app_id: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Ticks requested per symbol when seeding from history
    #[serde(default = "default_history_count")]
    pub history_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DigitsSection {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_window")]
    pub default_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_interval")]
    pub interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for DerivSection {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            ws_url: default_ws_url(),
            symbols: default_symbols(),
            history_count: default_history_count(),
        }
    }
}

impl Default for DigitsSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            default_window: default_window(),
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_cache_interval(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            deriv: DerivSection::default(),
            digits: DigitsSection::default(),
            cache: CacheSection::default(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_app_id() -> String {
    "66726".to_string()
}
fn default_ws_url() -> String {
    "wss://ws.derivws.com/websockets/v3".to_string()
}
fn default_symbols() -> Vec<String> {
    ["R_10", "R_25", "R_50", "R_75", "R_100"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_history_count() -> usize {
    500
}
fn default_capacity() -> usize {
    500
}
fn default_window() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_cache_interval() -> u64 {
    30
}

impl RelayConfig {
    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            capacity: self.digits.capacity,
            default_window: self.digits.default_window,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.tracker_options().validate().map_err(|e| e.to_string())?;
        if self.deriv.symbols.is_empty() {
            return Err("deriv.symbols must list at least one symbol".to_string());
        }
        if self.deriv.history_count > 5000 {
            return Err("deriv.history_count cannot exceed 5000".to_string());
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<RelayConfig>(content)
    }

    /// `.env` values win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(app_id) = env::var("DERIV_APP_ID") {
            self.deriv.app_id = app_id;
        }
        if let Ok(bind) = env::var("RELAY_BIND") {
            self.server.bind = bind;
        }
    }
}

pub fn load_relay_config() -> RelayConfig {
    let mut config = match fs::read_to_string(CONFIG_FILE) {
        Ok(content) => match RelayConfig::from_toml_str(&content) {
            Ok(config) => {
                info!(
                    "📊 Loaded config: {} symbols, capacity {}, default window {}",
                    config.deriv.symbols.len(),
                    config.digits.capacity,
                    config.digits.default_window
                );
                config
            }
            Err(e) => {
                warn!("⚠️ Config parse error, using defaults: {}", e);
                RelayConfig::default()
            }
        },
        Err(_) => {
            warn!("⚠️ {} not found, using defaults", CONFIG_FILE);
            RelayConfig::default()
        }
    };
    config.apply_env_overrides();
    config
}

pub fn save_relay_config(config: &RelayConfig) -> Result<(), String> {
    let toml_str =
        toml::to_string_pretty(config).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(CONFIG_FILE, toml_str).map_err(|e| format!("Failed to save config: {}", e))?;
    info!("💾 Config saved to {}", CONFIG_FILE);
    Ok(())
}
