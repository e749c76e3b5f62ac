use anyhow::{Context, Result};
use meshradio_network::{OrchestratorConfig, TcpTransportConfig};
use meshradio_routing::MeshConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
    #[serde(default)]
    pub transport: TcpTransportConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
    #[serde(skip)]
    pub data_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human readable label; the node ID itself is generated at startup
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// WebSocket URL of the rendezvous server, e.g. `ws://host:8765/signaling`
    pub url: Option<String>,
}

/// Backend of the local discovery directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryBackend {
    /// No fallback discovery
    None,
    /// Process-local; only useful for demos
    Memory,
    /// JSON file shared by nodes on one machine
    #[default]
    File,
    /// SQLite database shared by nodes on one machine
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub backend: DirectoryBackend,
    /// Defaults to a file in the data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// Delivered messages kept for `GET /api/v1/messages`
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_history_size() -> usize {
    100
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 8080,
            history_size: default_history_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Load configuration from file or use defaults
    pub fn load(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read configuration file")?;

        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;

        config.config_file_path = config_path;
        config.data_directory = data_dir;

        Ok(config)
    }

    /// Create a new default configuration and write it to disk
    pub fn create_default(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&data_dir)?;

        let config = Config {
            config_file_path: config_path.clone(),
            data_directory: data_dir,
            ..Config::defaults()
        };

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(&config_path, yaml)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        Ok(config)
    }

    /// In-memory defaults, not tied to any file
    pub fn defaults() -> Self {
        Config {
            node: NodeConfig {
                name: "radionode".to_string(),
            },
            rendezvous: RendezvousConfig::default(),
            transport: TcpTransportConfig::default(),
            directory: DirectoryConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            mesh: MeshConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            config_file_path: PathBuf::new(),
            data_directory: Self::default_data_dir(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Where the local discovery directory lives for the configured backend
    pub fn directory_path(&self) -> PathBuf {
        if let Some(path) = &self.directory.path {
            return path.clone();
        }
        match self.directory.backend {
            DirectoryBackend::Sqlite => self.data_directory.join("radionode.db"),
            _ => self.data_directory.join("peers.json"),
        }
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("radionode")
            .join("config.yaml")
    }

    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("radionode")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_default_then_load() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.yaml");
        let data_dir = dir.path().join("data");

        let created =
            Config::create_default(Some(config_path.clone()), Some(data_dir.clone())).unwrap();
        assert!(config_path.exists());
        assert!(data_dir.exists());

        let loaded = Config::load(Some(config_path.clone()), Some(data_dir.clone())).unwrap();
        assert_eq!(loaded.node.name, created.node.name);
        assert_eq!(loaded.config_path(), config_path.as_path());
        assert_eq!(loaded.directory.backend, DirectoryBackend::File);
        assert_eq!(loaded.directory_path(), data_dir.join("peers.json"));
        assert_eq!(loaded.orchestrator, OrchestratorConfig::default());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = Config::load(Some(dir.path().join("absent.yaml")), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_minimal_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.yaml");
        fs::write(
            &config_path,
            "node:\n  name: hilltop\nrendezvous:\n  url: ws://10.0.0.1:8765/signaling\ndirectory:\n  backend: sqlite\nmesh:\n  max_hops: 4\n",
        )
        .unwrap();

        let config = Config::load(Some(config_path), Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.node.name, "hilltop");
        assert_eq!(
            config.rendezvous.url.as_deref(),
            Some("ws://10.0.0.1:8765/signaling")
        );
        assert_eq!(config.directory_path(), dir.path().join("radionode.db"));
        assert_eq!(config.mesh.max_hops, 4);
        assert_eq!(config.mesh.dedup_capacity, MeshConfig::default().dedup_capacity);
        assert!(config.api.enabled);
        assert_eq!(config.logging.format, LogFormat::Text);
    }
}
