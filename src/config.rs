//! Configuration module for retroterm.

use serde::Deserialize;
use std::path::Path;

use crate::transfer::SpeedProfile;
use crate::{Result, RetroTermError};

/// Connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Host name or address of the BBS.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number to connect to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6400
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Terminal display configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// Screen width in columns (40 or 80).
    #[serde(default = "default_width")]
    pub width: usize,
    /// Screen height in rows.
    #[serde(default = "default_height")]
    pub height: usize,
}

fn default_width() -> usize {
    40
}

fn default_height() -> usize {
    25
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
        }
    }
}

/// File transfer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Directory received files are written to.
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    /// Speed profile name: turbo, fast, normal, slow, local.
    #[serde(default = "default_speed_profile")]
    pub speed_profile: String,
    /// Write a hex wire log for each transfer.
    #[serde(default)]
    pub wire_log: bool,
    /// Directory wire logs are written to (defaults to download_dir).
    #[serde(default)]
    pub wire_log_dir: Option<String>,
}

fn default_download_dir() -> String {
    "downloads".to_string()
}

fn default_speed_profile() -> String {
    "normal".to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            speed_profile: default_speed_profile(),
            wire_log: false,
            wire_log_dir: None,
        }
    }
}

impl TransferConfig {
    /// Resolve the configured speed profile name.
    pub fn profile(&self) -> SpeedProfile {
        SpeedProfile::from_name(&self.speed_profile).unwrap_or(SpeedProfile::Normal)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file path; console-only when absent.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Config =
            toml::from_str(&text).map_err(|e| RetroTermError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.connection.host.is_empty() {
            return Err(RetroTermError::Config("connection.host is empty".into()));
        }
        if self.terminal.width != 40 && self.terminal.width != 80 {
            return Err(RetroTermError::Config(format!(
                "terminal.width must be 40 or 80, got {}",
                self.terminal.width
            )));
        }
        if self.terminal.height == 0 {
            return Err(RetroTermError::Config("terminal.height must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.port, 6400);
        assert_eq!(config.terminal.width, 40);
        assert_eq!(config.terminal.height, 25);
        assert_eq!(config.transfer.speed_profile, "normal");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let text = r#"
            [connection]
            host = "bbs.example.org"
            port = 6502

            [transfer]
            speed_profile = "turbo"
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.connection.host, "bbs.example.org");
        assert_eq!(config.connection.port, 6502);
        assert_eq!(config.transfer.profile(), SpeedProfile::Turbo);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.terminal.width, 40);
    }

    #[test]
    fn test_validate_rejects_bad_width() {
        let mut config = Config::default();
        config.terminal.width = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_profile_falls_back_to_normal() {
        let mut config = Config::default();
        config.transfer.speed_profile = "warp".to_string();
        assert_eq!(config.transfer.profile(), SpeedProfile::Normal);
    }
}
