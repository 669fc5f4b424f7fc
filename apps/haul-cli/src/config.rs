//! CLI configuration.
//!
//! Reads/writes TOML at `~/.config/haul/haul.toml`. A missing file is
//! created with defaults; an unreadable one is reported and replaced by
//! defaults for this run only.

use std::path::{Path, PathBuf};

use haul_engine::EngineConfig;
use serde::{Deserialize, Serialize};

/// On-disk config format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    engine: EngineConfig,
    store: StoreSection,
    state: StateSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreSection {
    /// Root directory of the filesystem object store.
    root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StateSection {
    /// Directory holding one manifest per job.
    dir: Option<PathBuf>,
}

/// Resolved CLI configuration.
#[derive(Debug, Clone)]
pub struct HaulConfig {
    pub engine: EngineConfig,
    pub store_root: PathBuf,
    pub state_dir: PathBuf,
    file_path: PathBuf,
}

impl HaulConfig {
    /// Loads `path`, or the default location when `None`.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let file_path = match path {
            Some(p) => p,
            None => config_file_path()?,
        };

        if !file_path.exists() {
            let config = Self::from_file(ConfigFile::default(), file_path);
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&file_path)?;
        let file = match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(
                    path = %file_path.display(),
                    error = %e,
                    "failed to parse haul config, using defaults"
                );
                ConfigFile::default()
            }
        };
        Ok(Self::from_file(file, file_path))
    }

    /// Writes the configuration back to its file.
    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = ConfigFile {
            engine: self.engine.clone(),
            store: StoreSection {
                root: Some(self.store_root.clone()),
            },
            state: StateSection {
                dir: Some(self.state_dir.clone()),
            },
        };
        std::fs::write(&self.file_path, toml::to_string_pretty(&file)?)?;

        tracing::debug!(path = %self.file_path.display(), "haul configuration saved");
        Ok(())
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn from_file(file: ConfigFile, file_path: PathBuf) -> Self {
        let data = data_dir();
        Self {
            engine: file.engine,
            store_root: file.store.root.unwrap_or_else(|| data.join("objects")),
            state_dir: file.state.dir.unwrap_or_else(|| data.join("state")),
            file_path,
        }
    }
}

fn config_file_path() -> anyhow::Result<PathBuf> {
    Ok(config_base_dir()?.join("haul").join("haul.toml"))
}

fn config_base_dir() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME")
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME")
        .map_err(|_| anyhow::anyhow!("HOME is not set; pass --config explicitly"))?;
    Ok(PathBuf::from(home).join(".config"))
}

fn data_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".local").join("share"))
        })
        .unwrap_or_else(std::env::temp_dir);
    base.join("haul")
}
