//! Configuration system for the WISP relay.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use wisp_discovery::relay::{ProtocolConfig, ServerConfig};

/// Upper bound on the frame size the relay accepts
const MAX_FRAME_LIMIT: usize = 64 * 1024 * 1024;

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub relay: RelayConfig,
    /// Wire protocol configuration
    #[serde(default)]
    pub protocol: ProtocolSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address to bind
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS certificate chain (PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    /// TLS private key (PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    /// Concurrent endpoint connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bound on connect attempts without their own timeout, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Bound on a TLS handshake, in seconds
    #[serde(default = "default_tls_handshake_timeout")]
    pub tls_handshake_timeout_secs: u64,
}

/// Wire protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSection {
    /// Seconds between pings
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Largest frame accepted or sent
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    49737
}

fn default_max_connections() -> usize {
    10_000
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_tls_handshake_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_max_frame_size() -> usize {
    wisp_core::DEFAULT_MAX_FRAME_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cert: None,
            key: None,
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
            tls_handshake_timeout_secs: default_tls_handshake_timeout(),
        }
    }
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("wisp/relay.toml")
    }

    /// Load config from the default path, or defaults if there is none
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Address to listen on
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not an IP address.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let host: IpAddr = self
            .relay
            .host
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid host: {}", self.relay.host))?;
        Ok(SocketAddr::new(host, self.relay.port))
    }

    /// TLS files, when both are configured
    #[must_use]
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.relay.cert, &self.relay.key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    /// Relay server settings
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            protocol: ProtocolConfig {
                heartbeat_interval: Duration::from_secs(self.protocol.heartbeat_interval_secs),
                max_frame_size: self.protocol.max_frame_size,
                ..ProtocolConfig::default()
            },
            connect_timeout: Duration::from_secs(self.relay.connect_timeout_secs),
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;

        if self.relay.cert.is_some() != self.relay.key.is_some() {
            anyhow::bail!("TLS needs both a certificate and a key");
        }

        if self.relay.max_connections == 0 {
            anyhow::bail!("Max connections must be at least 1");
        }

        if self.relay.connect_timeout_secs == 0 {
            anyhow::bail!("Connect timeout must be at least 1 second");
        }

        if self.protocol.heartbeat_interval_secs == 0 {
            anyhow::bail!("Heartbeat interval must be at least 1 second");
        }

        // Room for the largest fixed-size frame (NoiseReply with every field)
        if self.protocol.max_frame_size < 1024 || self.protocol.max_frame_size > MAX_FRAME_LIMIT {
            anyhow::bail!("Max frame size must be between 1KB and 64MB");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.host, "0.0.0.0");
        assert_eq!(config.relay.port, 49737);
        assert_eq!(config.protocol.heartbeat_interval_secs, 15);
        assert_eq!(config.logging.level, "info");
        assert!(config.tls_files().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.relay.host = "relay.example.com".to_string();
        assert!(config.validate().is_err());

        config.relay.host = "::1".to_string();
        config.relay.cert = Some(PathBuf::from("cert.pem"));
        assert!(config.validate().is_err());
        config.relay.key = Some(PathBuf::from("key.pem"));
        assert!(config.validate().is_ok());

        config.protocol.max_frame_size = 10;
        assert!(config.validate().is_err());

        config.protocol.max_frame_size = default_max_frame_size();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nport = 9000\n\n[logging]\nlevel = \"debug\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.relay.host, "0.0.0.0");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.protocol.max_frame_size, wisp_core::DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_server_config() {
        let mut config = Config::default();
        config.protocol.heartbeat_interval_secs = 5;
        config.relay.connect_timeout_secs = 7;
        let server = config.server_config();
        assert_eq!(server.protocol.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(server.protocol.failsafe_timeout(), Duration::from_secs(15));
        assert_eq!(server.connect_timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_toml_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.relay.port, deserialized.relay.port);
        assert_eq!(config.protocol.max_frame_size, deserialized.protocol.max_frame_size);
    }
}
