//! CLI configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/indibus/config.toml` by default:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0"
//! port = 7624
//! allowed_hosts = ["localhost", "192.168.1.20"]
//!
//! [[drivers]]
//! kind = "builtin"
//! target = "demo_camera"
//!
//! [[drivers]]
//! kind = "process"
//! target = "/usr/bin/indi_simulator_telescope"
//!
//! [logging]
//! format = "compact"
//! level = "info"
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use indibus_core::{TracingConfig, TracingOutputFormat, parse_level};
use indibus_protocol::{DEFAULT_PORT, DriverKind, DriverSpec, MAX_FRAME_SIZE};
use indibus_server::{ServerConfig, default_socket_path};

/// Configuration for the indibus binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Broker settings.
    pub server: ServerSettings,

    /// Drivers loaded when the broker starts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub drivers: Vec<DriverEntry>,

    /// Log output settings.
    pub logging: LoggingSettings,
}

/// Broker and control socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the broker listens on.
    pub listen: IpAddr,

    /// Wire protocol port.
    pub port: u16,

    /// Maximum concurrent clients.
    pub max_clients: usize,

    /// Path to the control socket.
    pub socket_path: Option<PathBuf>,

    /// Control request timeout in seconds.
    pub timeout: u64,

    /// Largest accepted frame in bytes.
    pub max_frame_size: usize,

    /// Hosts allowed to connect; empty accepts everyone.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_hosts: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: ServerConfig::default().listen_address,
            port: DEFAULT_PORT,
            max_clients: 100,
            socket_path: None,
            timeout: 5,
            max_frame_size: MAX_FRAME_SIZE,
            allowed_hosts: Vec::new(),
        }
    }
}

/// One `[[drivers]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverEntry {
    pub kind: DriverKind,
    pub target: String,
}

impl From<&DriverEntry> for DriverSpec {
    fn from(entry: &DriverEntry) -> Self {
        DriverSpec {
            kind: entry.kind,
            target: entry.target.clone(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `pretty`, `compact` or `json`.
    pub format: String,

    /// Default level when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: "compact".to_string(),
            level: "info".to_string(),
        }
    }
}

impl LoggingSettings {
    /// Builds the daemon tracing configuration from these settings.
    pub fn tracing_config(&self) -> Result<TracingConfig, String> {
        let format: TracingOutputFormat = self.format.parse().map_err(|e| format!("{}", e))?;
        let level = parse_level(&self.level).map_err(|e| format!("{}", e))?;
        Ok(TracingConfig::daemon().with_format(format).with_level(level))
    }
}

impl CliConfig {
    /// Loads configuration from the default path.
    pub fn load() -> Result<Self, String> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse config: {}", e))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("indibus")
    }

    /// Control socket path: explicit override, then config, then default.
    pub fn socket_path(&self, cli_override: Option<&Path>) -> PathBuf {
        cli_override
            .map(Path::to_path_buf)
            .or_else(|| self.server.socket_path.clone())
            .unwrap_or_else(default_socket_path)
    }

    /// Builds the broker configuration.
    pub fn server_config(&self, socket_path: PathBuf) -> ServerConfig {
        ServerConfig::new(socket_path)
            .with_listen_address(self.server.listen)
            .with_port(self.server.port)
            .with_max_clients(self.server.max_clients)
            .with_control_timeout(Duration::from_secs(self.server.timeout))
            .with_max_frame_size(self.server.max_frame_size)
            .with_allowed_hosts(self.server.allowed_hosts.clone())
    }

    /// Checks values serde cannot check.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.max_clients == 0 {
            return Err("server.max_clients must be at least 1".into());
        }
        if self.server.timeout == 0 {
            return Err("server.timeout must be at least 1 second".into());
        }
        for entry in &self.drivers {
            if entry.target.trim().is_empty() {
                return Err(format!("{} driver entry has an empty target", entry.kind));
            }
        }
        indibus_server::HostAllowList::new(&self.server.allowed_hosts).map_err(|e| e.to_string())?;
        self.logging.tracing_config()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: CliConfig = toml::from_str(
            r#"
[server]
listen = "127.0.0.1"
port = 7625
allowed_hosts = ["localhost"]

[[drivers]]
kind = "builtin"
target = "demo_camera"

[[drivers]]
kind = "network"
target = "observatory:7624"

[logging]
format = "json"
level = "debug"
"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 7625);
        assert_eq!(config.server.max_clients, 100);
        assert_eq!(config.drivers.len(), 2);
        assert_eq!(
            DriverSpec::from(&config.drivers[1]),
            DriverSpec::network("observatory:7624")
        );
        assert!(config.validate().is_ok());

        let server = config.server_config(PathBuf::from("/tmp/test.sock"));
        assert_eq!(server.listen_addr().to_string(), "127.0.0.1:7625");
        assert_eq!(server.allowed_hosts, vec!["localhost".to_string()]);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: CliConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 7624);
        assert!(config.drivers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_driver_kind() {
        let parsed: Result<CliConfig, _> = toml::from_str(
            r#"
[[drivers]]
kind = "java"
target = "com.example.Driver"
"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn validate_catches_bad_values() {
        let mut config = CliConfig::default();
        config.server.allowed_hosts = vec!["not-an-ip".into()];
        assert!(config.validate().is_err());

        let mut config = CliConfig::default();
        config.logging.format = "xml".into();
        assert!(config.validate().is_err());

        let mut config = CliConfig::default();
        config.drivers.push(DriverEntry {
            kind: DriverKind::Process,
            target: " ".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn socket_path_precedence() {
        let mut config = CliConfig::default();
        assert_eq!(config.socket_path(None), default_socket_path());

        config.server.socket_path = Some(PathBuf::from("/run/indibus.sock"));
        assert_eq!(config.socket_path(None), PathBuf::from("/run/indibus.sock"));
        assert_eq!(
            config.socket_path(Some(Path::new("/tmp/override.sock"))),
            PathBuf::from("/tmp/override.sock")
        );
    }

    #[test]
    fn roundtrips_through_toml() {
        let mut config = CliConfig::default();
        config.drivers.push(DriverEntry {
            kind: DriverKind::Builtin,
            target: "demo_camera".into(),
        });
        let text = toml::to_string_pretty(&config).unwrap();
        let back: CliConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.drivers, config.drivers);
    }
}
