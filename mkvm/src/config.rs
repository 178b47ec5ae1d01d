use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::read_to_string;

pub const DEFAULT_ZVOL_PREFIX: &str = "rpool/mkvm-test";
pub const DEFAULT_MEMORY_MB: u64 = 512;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found at: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Settings from `mkvm.toml`. Anything unset falls back to flags or
/// built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub zvol_prefix: Option<String>,
    /// MB of guest memory.
    pub memory: Option<u64>,
    pub cache_dir: Option<PathBuf>,
    /// Replaces the built-in list of distros.
    pub catalog: Option<PathBuf>,
    pub libvirt_socket: Option<PathBuf>,
    pub connect_uri: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    /// Wrap storage commands in `sudo -n`. Defaults to on unless already root.
    pub sudo: Option<bool>,
    pub verify_checksum: Option<bool>,
    pub network: Option<String>,
    pub vcpus: Option<u32>,
}

impl Config {
    /// Load from `path`. When `required` is unset a missing file means
    /// defaults.
    pub async fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let string = match read_to_string(path).await {
            Ok(string) => string,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return if required {
                    Err(ConfigError::NotFound(path.to_owned()))
                } else {
                    Ok(Self::default())
                };
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    source,
                });
            }
        };
        toml::from_str(&string).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}
