use foreman_orchestrator::CoordinatorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Contents of `foreman.toml`.
#[derive(Debug, Deserialize)]
pub struct ForemanConfig {
    /// Where the file store keeps its tables.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl ForemanConfig {
    /// Read `path`, or fall back to defaults when it does not exist.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                ))
            }
        };
        let config: ForemanConfig = toml::from_str(&raw)?;
        config.coordinator.validate()?;
        Ok(config)
    }
}
