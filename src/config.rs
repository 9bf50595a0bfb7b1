//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `gateway.toml`.
//!     loads configuration from file or falls back to defaults, then lets
//!     environment variables override the deployment-specific bits.
//!
//! structure:
//!     - ServerConfig: where the http api listens, where the frontend lives.
//!     - StorageConfig: path of the sqlite history file.
//!     - DeviceConfig: serial path (or auto-detect), baud rate, retry timing.
//!     - ArbitrationConfig: freshness window for remote pushes.
//!     - IngestConfig: what to do with a push carrying a bad timestamp.
//!     - LiveConfig: per-subscriber queue depth.
//!     - LoggingConfig: log level and whether to echo every sample.
//!
//! ==============================================================================

use anyhow::Context;
use serde::Deserialize;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub device: DeviceConfig,
    pub arbitration: ArbitrationConfig,
    pub ingest: IngestConfig,
    pub live: LiveConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub static_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub database: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    pub enabled: bool,
    /// explicit device path; empty means auto-detect
    pub path: Option<String>,
    pub baud_rate: u32,
    pub reconnect_delay_ms: u64,
    pub rescan_delay_ms: u64,
    pub idle_poll_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ArbitrationConfig {
    pub freshness_seconds: u64,
}

/// what a push with an unparsable `ts` gets
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TimestampPolicy {
    /// use the moment the push arrived
    #[default]
    ReceiptTime,
    /// refuse the push with `invalid-timestamp`
    Reject,
}

impl FromStr for TimestampPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "receipt-time" | "now" => Ok(Self::ReceiptTime),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown timestamp policy {other:?}")),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct IngestConfig {
    pub invalid_timestamp: TimestampPolicy,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LiveConfig {
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".to_string(), static_dir: PathBuf::from("static") }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { database: PathBuf::from("readings.db") }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            baud_rate: 9600,
            reconnect_delay_ms: 2_000,
            rescan_delay_ms: 5_000,
            idle_poll_ms: 50,
        }
    }
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self { freshness_seconds: 60 }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

impl ArbitrationConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_seconds)
    }
}

impl DeviceConfig {
    /// configured path, treating "" and "auto" as unset
    pub fn explicit_path(&self) -> Option<String> {
        self.path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty() && !p.eq_ignore_ascii_case("auto"))
            .map(str::to_string)
    }
}

impl GatewayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    /// Load with default fallback, then apply environment overrides.
    /// runs before logging is set up, so it reports with println
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("gateway.toml"),
            PathBuf::from("..").join("config").join("gateway.toml"),
        ];

        let mut config = None;
        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(loaded) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        config = Some(loaded);
                        break;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        let mut config = config.unwrap_or_else(|| {
            println!("[CONFIG] Warning: No config file found - using defaults");
            Self::default()
        });
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// overrides from `GATEWAY_*` variables; `lookup` is `std::env::var` outside tests
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_with(&lookup, "GATEWAY_BIND", &mut self.server.bind);
        override_with(&lookup, "GATEWAY_STATIC_DIR", &mut self.server.static_dir);
        override_with(&lookup, "GATEWAY_DATABASE", &mut self.storage.database);
        override_with(&lookup, "GATEWAY_DEVICE_ENABLED", &mut self.device.enabled);
        override_with(&lookup, "GATEWAY_BAUD_RATE", &mut self.device.baud_rate);
        override_with(&lookup, "GATEWAY_FRESHNESS_SECONDS", &mut self.arbitration.freshness_seconds);
        override_with(&lookup, "GATEWAY_INVALID_TIMESTAMP", &mut self.ingest.invalid_timestamp);

        if let Some(path) = lookup("GATEWAY_DEVICE_PATH") {
            self.device.path = Some(path);
        }
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let device = if !self.device.enabled {
            "disabled".to_string()
        } else {
            self.device.explicit_path().unwrap_or_else(|| "auto-detect".to_string())
        };

        println!("┌─────────────────────────────────────────┐");
        println!("│          GATEWAY CONFIGURATION          │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Bind: {}", self.server.bind);
        println!("│ Database: {}", self.storage.database.display());
        println!("│ Device: {} @ {} baud", device, self.device.baud_rate);
        println!("│ Freshness window: {}s", self.arbitration.freshness_seconds);
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}

fn override_with<T, F>(lookup: &F, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else { return };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(e) => println!("[CONFIG] Warning: ignoring {key}={raw:?}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let config = GatewayConfig::from_toml("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.device.baud_rate, 9600);
        assert_eq!(config.arbitration.freshness(), Duration::from_secs(60));
        assert_eq!(config.ingest.invalid_timestamp, TimestampPolicy::ReceiptTime);
        assert!(config.device.enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = GatewayConfig::from_toml(
            r#"
            [device]
            path = "/dev/ttyACM0"
            baud_rate = 115200

            [ingest]
            invalid_timestamp = "reject"
            "#,
        )
        .unwrap();

        assert_eq!(config.device.explicit_path().as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.device.baud_rate, 115200);
        assert_eq!(config.device.reconnect_delay_ms, 2_000);
        assert_eq!(config.ingest.invalid_timestamp, TimestampPolicy::Reject);
    }

    #[test]
    fn blank_or_auto_path_means_discovery() {
        let mut device = DeviceConfig::default();
        assert_eq!(device.explicit_path(), None);
        device.path = Some("  ".into());
        assert_eq!(device.explicit_path(), None);
        device.path = Some("AUTO".into());
        assert_eq!(device.explicit_path(), None);
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("GATEWAY_DEVICE_PATH", "COM4"),
            ("GATEWAY_BAUD_RATE", "115200"),
            ("GATEWAY_DEVICE_ENABLED", "false"),
            ("GATEWAY_FRESHNESS_SECONDS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.device.explicit_path().as_deref(), Some("COM4"));
        assert_eq!(config.device.baud_rate, 115200);
        assert!(!config.device.enabled);
        assert_eq!(config.arbitration.freshness_seconds, 60);
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(GatewayConfig::from_toml("[device\nbaud_rate = 1").is_err());
    }
}
