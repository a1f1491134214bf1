//! Configuration loading and types for s3cask.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, the storage backend, and logging.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Service FQDN used to tell virtual-host requests
    /// (`<bucket>.<fqdn>`) from path-style requests.
    #[serde(default = "default_service_host")]
    pub service_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            service_host: default_service_host(),
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `dir` or `cask`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Directory backend configuration.
    #[serde(default)]
    pub dir: DirStorageConfig,

    /// Cask (volume cluster) backend configuration.
    #[serde(default)]
    pub cask: Option<CaskStorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            dir: DirStorageConfig::default(),
            cask: None,
        }
    }
}

/// Directory-hierarchy backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DirStorageConfig {
    /// Root directory: first level owners, second buckets.
    #[serde(default = "default_dir_root")]
    pub root: String,
}

impl Default for DirStorageConfig {
    fn default() -> Self {
        Self {
            root: default_dir_root(),
        }
    }
}

/// Volume-cluster backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaskStorageConfig {
    /// URL of the cluster master node (e.g. `http://localhost:9333`).
    pub master_url: String,

    /// Directory holding the per-owner bucket databases.
    pub db_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_service_host() -> String {
    "localhost:8080".to_string()
}

fn default_storage_backend() -> String {
    "dir".to_string()
}

fn default_dir_root() -> String {
    "./data/objects".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.backend, "dir");
        assert!(config.storage.cask.is_none());
    }

    #[test]
    fn test_cask_section() {
        let yaml = r#"
server:
  service_host: s3.example.com
storage:
  backend: cask
  cask:
    master_url: http://localhost:9333
    db_dir: /var/lib/s3cask
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.service_host, "s3.example.com");
        let cask = config.storage.cask.unwrap();
        assert_eq!(cask.master_url, "http://localhost:9333");
        assert_eq!(cask.db_dir, "/var/lib/s3cask");
    }
}
