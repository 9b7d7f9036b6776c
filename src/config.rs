//! Configuration module for the append-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "append-echo")]
#[command(author = "append-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "Appends newline-delimited packets to a shared log and echoes it back", long_about = None)]
pub struct CliArgs {
    /// Detach from the terminal and run in the background
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// TCP port to listen on (all IPv4 interfaces)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Path of the shared packet log
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
        }
    }
}

/// Where log output goes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// The system log (`syslog(3)`, facility LOG_USER)
    #[default]
    Syslog,
    /// Standard error
    Stderr,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log destination
    #[serde(default)]
    pub target: LogTarget,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            target: LogTarget::default(),
        }
    }
}

fn default_port() -> u16 {
    9000
}

fn default_backlog() -> i32 {
    32
}

fn default_data_file() -> PathBuf {
    PathBuf::from("/var/tmp/aesdsocketdata")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backlog: i32,
    pub data_file: PathBuf,
    pub daemon: bool,
    pub log_level: String,
    pub log_target: LogTarget,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            port: toml_config.server.port,
            backlog: toml_config.server.backlog,
            data_file: toml_config.storage.data_file,
            daemon: cli.daemon,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            log_target: toml_config.logging.target,
        }
    }
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        let defaults = TomlConfig::default();
        Config {
            port: defaults.server.port,
            backlog: defaults.server.backlog,
            data_file: defaults.storage.data_file,
            daemon: false,
            log_level: defaults.logging.level,
            log_target: defaults.logging.target,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.backlog, 32);
        assert_eq!(
            config.storage.data_file,
            PathBuf::from("/var/tmp/aesdsocketdata")
        );
        assert_eq!(config.logging.target, LogTarget::Syslog);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            port = 9100
            backlog = 64

            [storage]
            data_file = "/tmp/packets.log"

            [logging]
            level = "debug"
            target = "stderr"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.storage.data_file, PathBuf::from("/tmp/packets.log"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.target, LogTarget::Stderr);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: TomlConfig = toml::from_str("[server]\nport = 9001\n").unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.backlog, 32);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_cli_flags() {
        let cli = CliArgs::try_parse_from(["append-echo"]).unwrap();
        assert!(!cli.daemon);
        assert!(cli.config.is_none());

        let cli = CliArgs::try_parse_from(["append-echo", "-d"]).unwrap();
        assert!(cli.daemon);

        assert!(CliArgs::try_parse_from(["append-echo", "-x"]).is_err());
    }

    #[test]
    fn test_cli_log_level_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"warn\"\n[server]\nport = 9200").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = CliArgs::try_parse_from(["append-echo", "-c", &path]).unwrap();
        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.port, 9200);

        let cli =
            CliArgs::try_parse_from(["append-echo", "-c", &path, "--log-level", "trace", "-d"])
                .unwrap();
        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.log_level, "trace");
        assert!(config.daemon);
    }

    #[test]
    fn test_missing_config_file() {
        let cli =
            CliArgs::try_parse_from(["append-echo", "-c", "/nonexistent/append-echo.toml"])
                .unwrap();
        match Config::from_args(cli) {
            Err(ConfigError::FileRead(path, _)) => {
                assert_eq!(path, PathBuf::from("/nonexistent/append-echo.toml"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
