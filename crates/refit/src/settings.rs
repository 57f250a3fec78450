use std::path::{Path, PathBuf};
use std::time::Duration;

use refit_core::RetryPolicy;
use refit_platform::AppPaths;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("settings {path} are not valid JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpdaterSettings {
    #[serde(default)]
    pub install_root: Option<PathBuf>,

    #[serde(default)]
    pub manifest_url: Option<String>,

    /// Archive URL with `{version}` and `{platform}` placeholders.
    #[serde(default)]
    pub release_url_template: Option<String>,

    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_extract_attempts")]
    pub extract_attempts: u32,

    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,

    /// Snapshots to keep after each update; all are kept when unset.
    #[serde(default)]
    pub backup_retention: Option<usize>,

    #[serde(default = "default_manifest_cache_ttl")]
    pub manifest_cache_ttl_secs: u64,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

fn default_download_timeout() -> u64 {
    300
}

fn default_download_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_extract_attempts() -> u32 {
    5
}

fn default_restart_delay() -> u64 {
    3
}

fn default_manifest_cache_ttl() -> u64 {
    3600
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            install_root: None,
            manifest_url: None,
            release_url_template: None,
            download_timeout_secs: default_download_timeout(),
            download_attempts: default_download_attempts(),
            retry_delay_secs: default_retry_delay(),
            extract_attempts: default_extract_attempts(),
            restart_delay_secs: default_restart_delay(),
            backup_retention: None,
            manifest_cache_ttl_secs: default_manifest_cache_ttl(),
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl UpdaterSettings {
    /// Read settings from disk. A missing file yields the defaults.
    pub fn load(paths: &AppPaths) -> Result<Self, SettingsError> {
        Self::load_from(&paths.settings_file())
    }

    fn load_from(settings_path: &Path) -> Result<Self, SettingsError> {
        let content = match std::fs::read_to_string(settings_path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: settings_path.display().to_string(),
                    source,
                });
            }
        };
        serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: settings_path.display().to_string(),
            source,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            download_attempts: self.download_attempts.max(1),
            download_delay: Duration::from_secs(self.retry_delay_secs),
            extract_attempts: self.extract_attempts.max(1),
            ..RetryPolicy::default()
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn manifest_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.manifest_cache_ttl_secs)
    }
}
