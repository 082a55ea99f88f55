use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::error::{Result, TftpError};

/// Write-side gating for the server.
///
/// Writes are disabled by default; when enabled, incoming filenames must
/// match one of the configured glob patterns. An empty pattern list admits
/// nothing, so enabling writes always means naming what may be written.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WriteConfig {
    /// Accept WRQ at all.
    pub enabled: bool,

    /// Glob patterns, relative to the root directory, that may be written.
    /// Examples: ["*.cfg", "uploads/*.bin"]
    pub allowed_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory served and written under; requests cannot escape it.
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Receive deadline per lock-step exchange, in milliseconds.
    pub timeout_ms: u64,
    /// Bound on timeout and duplicate retransmission counters.
    pub max_attempts: u32,
    /// Put failure detail into outgoing ERROR packets. Off by default so
    /// local paths and IO detail stay off the wire.
    pub error_message_delivery: bool,
    /// Emit a log line per DATA/ACK exchanged.
    pub block_messages: bool,
    pub write: WriteConfig,
    pub logging: LoggingConfig,
    pub socket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/kestrel/tftp"),
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), crate::DEFAULT_PORT),
            timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            error_message_delivery: false,
            block_messages: true,
            write: WriteConfig::default(),
            logging: LoggingConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

/// Welcome-socket tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// SO_REUSEADDR for faster restarts.
    pub reuse_address: bool,
    pub recv_buffer_kb: usize,
    pub send_buffer_kb: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            reuse_address: true,
            recv_buffer_kb: 256,
            send_buffer_kb: 256,
        }
    }
}

pub fn load_config(path: &Path) -> Result<ServerConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| TftpError::Tftp(format!("cannot read config {}: {}", path.display(), e)))?;
    toml::from_str(&raw)
        .map_err(|e| TftpError::Tftp(format!("cannot parse config {}: {}", path.display(), e)))
}

pub fn write_config(path: &Path, config: &ServerConfig) -> Result<()> {
    let raw = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Tftp(format!("cannot serialize config: {e}")))?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, raw)?;
    Ok(())
}

/// Sanity-check a config before the server binds anything. With
/// `require_root` the root directory must already exist and be a directory.
pub fn validate_config(config: &ServerConfig, require_root: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Tftp(
            "root_dir must be an absolute path".to_string(),
        ));
    }
    if require_root {
        let meta = std::fs::metadata(&config.root_dir)
            .map_err(|_| TftpError::Tftp("root_dir does not exist".to_string()))?;
        if !meta.is_dir() {
            return Err(TftpError::Tftp("root_dir is not a directory".to_string()));
        }
    }
    if config.bind_addr.port() == 0 {
        return Err(TftpError::Tftp(
            "bind_addr port must be non-zero".to_string(),
        ));
    }
    if config.max_attempts == 0 {
        return Err(TftpError::Tftp(
            "max_attempts must be at least 1".to_string(),
        ));
    }
    if config.timeout_ms == 0 {
        return Err(TftpError::Tftp("timeout_ms must be non-zero".to_string()));
    }
    for pattern in &config.write.allowed_patterns {
        glob::Pattern::new(pattern)
            .map_err(|e| TftpError::Tftp(format!("invalid write pattern '{pattern}': {e}")))?;
    }
    Ok(())
}

impl ServerConfig {
    /// The per-session knobs derived from this config.
    pub fn session_config(&self) -> crate::session::SessionConfig {
        crate::session::SessionConfig {
            timeout: std::time::Duration::from_millis(self.timeout_ms),
            max_attempts: self.max_attempts,
            error_message_delivery: self.error_message_delivery,
            block_messages: self.block_messages,
            line_ending: crate::HOST_LINE_ENDING.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let toml = r#"
root_dir = "/srv/tftp"
bind_addr = "127.0.0.1:6969"

[write]
enabled = true
allowed_patterns = ["*.cfg"]
"#;
        let config: ServerConfig = toml::from_str(toml)?;
        assert_eq!(config.root_dir, PathBuf::from("/srv/tftp"));
        assert_eq!(config.bind_addr.port(), 6969);
        assert!(config.write.enabled);
        assert_eq!(config.timeout_ms, crate::DEFAULT_TIMEOUT_MS);
        validate_config(&config, false)?;
        Ok(())
    }

    #[test]
    fn defaults_round_trip_through_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = ServerConfig::default();
        let raw = toml::to_string_pretty(&config)?;
        let back: ServerConfig = toml::from_str(&raw)?;
        assert_eq!(back.bind_addr, config.bind_addr);
        assert_eq!(back.max_attempts, config.max_attempts);
        assert_eq!(back.logging.level, config.logging.level);
        Ok(())
    }

    #[test]
    fn rejects_non_absolute_root_dir() {
        let config = ServerConfig {
            root_dir: PathBuf::from("relative/path"),
            ..Default::default()
        };
        match validate_config(&config, false) {
            Ok(()) => panic!("expected error for relative root_dir"),
            Err(err) => assert!(format!("{err}").contains("root_dir must be an absolute path")),
        }
    }

    #[test]
    fn rejects_zero_bind_port() {
        let mut config = ServerConfig::default();
        config.bind_addr = "127.0.0.1:0".parse().unwrap();
        match validate_config(&config, false) {
            Ok(()) => panic!("expected error for zero bind port"),
            Err(err) => assert!(format!("{err}").contains("bind_addr port must be non-zero")),
        }
    }

    #[test]
    fn rejects_zero_attempts_and_timeout() {
        let mut config = ServerConfig::default();
        config.max_attempts = 0;
        assert!(validate_config(&config, false).is_err());

        let mut config = ServerConfig::default();
        config.timeout_ms = 0;
        assert!(validate_config(&config, false).is_err());
    }

    #[test]
    fn rejects_bad_write_pattern() {
        let mut config = ServerConfig::default();
        config.write.allowed_patterns = vec!["[".to_string()];
        assert!(validate_config(&config, false).is_err());
    }
}
