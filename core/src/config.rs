//! Process-wide configuration for the workflow execution core.
//!
//! Mirrors the teacher's `config.rs`/`config_loader.rs` idiom (TOML file,
//! `dirs`-based discovery, serde defaults, never fails on a missing file)
//! but scoped to what this subsystem actually needs: the brand-prefixed
//! temp-dir namespace (§6.3), the executable-path override env var name,
//! the default `max-concurrent` for parallel steps, and DAG-level
//! SMTP/SSH/container defaults merged beneath step overrides.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{ContainerDefaults, SmtpDefaults, SshDefaults};

/// Brand namespace used for temp-dir and cache-dir paths (§6.3).
pub const BRAND: &str = "descartes";

/// Environment variable that overrides `std::env::current_exe()` when
/// resolving the binary to spawn for a local child-DAG sub-invocation.
pub const EXECUTABLE_ENV_VAR: &str = "DESCARTES_EXECUTABLE";

fn default_max_concurrent() -> usize {
    1
}

fn default_tail_bytes() -> usize {
    1024
}

/// Top-level on-disk configuration. Every field has a hard-coded default;
/// the loader never fails on a missing file, only on a malformed one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "max-concurrent", default = "default_max_concurrent")]
    pub default_max_concurrent: usize,
    #[serde(rename = "tail-bytes", default = "default_tail_bytes")]
    pub default_tail_bytes: usize,
    #[serde(default)]
    pub smtp: SmtpDefaults,
    #[serde(default)]
    pub ssh: SshDefaults,
    #[serde(default)]
    pub container: ContainerDefaults,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: default_max_concurrent(),
            default_tail_bytes: default_tail_bytes(),
            smtp: SmtpDefaults::default(),
            ssh: SshDefaults::default(),
            container: ContainerDefaults::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
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

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Default on-disk location: `~/.config/descartes/config.toml`, following
/// the XDG layout the `dirs` crate resolves per-platform.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(BRAND).join("config.toml"))
}

/// Load configuration from `path` if given, else the default discovery
/// path, else hard-coded defaults. A missing file is not an error; a
/// malformed one is.
pub fn load_config(path: Option<&Path>) -> ConfigResult<RuntimeConfig> {
    let candidate = path.map(Path::to_path_buf).or_else(default_config_path);
    let Some(candidate) = candidate else {
        debug!("no config path resolved, using hard-coded defaults");
        return Ok(RuntimeConfig::default());
    };
    if !candidate.exists() {
        debug!(path = %candidate.display(), "config file not found, using defaults");
        return Ok(RuntimeConfig::default());
    }
    let body = std::fs::read_to_string(&candidate).map_err(|source| ConfigError::Read {
        path: candidate.clone(),
        source,
    })?;
    toml::from_str(&body).map_err(|source| ConfigError::Parse {
        path: candidate,
        source,
    })
}

/// Temp-dir namespace for materialized inline local DAGs (§6.3):
/// `<tempdir>/descartes/local-dags/`.
pub fn local_dags_temp_dir() -> PathBuf {
    std::env::temp_dir().join(BRAND).join("local-dags")
}

/// Cache directory for the git-checkout executor (§4.10, §6.3):
/// `<home>/.cache/descartes/git/`.
pub fn git_cache_dir() -> ConfigResult<PathBuf> {
    let base = dirs::home_dir().unwrap_or_else(|| {
        warn!("no home directory resolved, falling back to temp dir for git cache");
        std::env::temp_dir()
    });
    Ok(base.join(".cache").join(BRAND).join("git"))
}
