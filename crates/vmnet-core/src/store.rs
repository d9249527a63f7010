use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::NetworkConfig;
use crate::error::ConfigError;

/// Environment override for the configuration directory.
pub const CONFIG_DIR_ENV: &str = "VMNET_CONFIG_DIR";
/// Environment override for the temporary-state directory.
pub const STATE_DIR_ENV: &str = "VMNET_STATE_DIR";

const DEFAULT_CONFIG_DIR: &str = "/etc/vmnet";
const DEFAULT_STATE_DIR: &str = "/var/tmp/vmnet";
const CONFIG_FILE: &str = "config.json";
const SNAPSHOT_FILE: &str = "last-activated.json";

/// On-disk configuration store.
///
/// Owns two files: the primary `config.json` and the last-activated snapshot,
/// a byte-for-byte copy of the primary taken at activation time so that
/// deactivation undoes exactly the configuration that was activated.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_dir: PathBuf,
    state_dir: PathBuf,
}

impl ConfigStore {
    /// Store at the default locations, honoring the env overrides.
    pub fn from_env() -> Self {
        let config_dir = std::env::var(CONFIG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR));
        let state_dir = std::env::var(STATE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_DIR));
        Self::at(config_dir, state_dir)
    }

    /// Store at explicit locations (tests, tooling).
    pub fn at(config_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join(SNAPSHOT_FILE)
    }

    /// Load the primary config, creating a default one if the file is absent.
    /// A present but unparseable file is a fatal error.
    pub fn load(&self) -> Result<NetworkConfig, ConfigError> {
        self.ensure_dirs()?;
        let path = self.config_path();
        if !path.exists() {
            let config = NetworkConfig::default();
            self.write(&path, &config)?;
            info!(path = %path.display(), "Created default config file");
            return Ok(config);
        }
        Self::read(&path)
    }

    /// Persist a config to the primary file.
    pub fn save(&self, config: &NetworkConfig) -> Result<(), ConfigError> {
        self.ensure_dirs()?;
        self.write(&self.config_path(), config)
    }

    /// Copy the primary config byte-for-byte to the last-activated snapshot.
    pub fn snapshot(&self) -> Result<(), ConfigError> {
        self.ensure_dirs()?;
        let to = self.snapshot_path();
        fs::copy(self.config_path(), &to).map_err(|source| ConfigError::Io {
            path: to.clone(),
            source,
        })?;
        Ok(())
    }

    /// Load the configuration in effect at the most recent activation,
    /// falling back to the primary config when no snapshot exists.
    pub fn load_last_activated(&self) -> Result<NetworkConfig, ConfigError> {
        let snap = self.snapshot_path();
        if snap.exists() {
            Self::read(&snap)
        } else {
            self.load()
        }
    }

    fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [&self.config_dir, &self.state_dir] {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn read(path: &Path) -> Result<NetworkConfig, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write(&self, path: &Path, config: &NetworkConfig) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, data).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
