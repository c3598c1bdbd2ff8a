use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "tickd";
pub const DEFAULT_SELF_WRITE_WINDOW_MS: u64 = 50;

/// Top-level config (tickd.toml + TICKD_* env overrides).
///
/// Every section is defaulted so an empty or missing file yields a working
/// daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickdConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Where tickd keeps its job file, database, run output and event log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Single directory used for both config and data. Takes precedence over
    /// `config_dir` / `data_dir`; handy for tests and sandboxes.
    pub root: Option<String>,
    pub config_dir: Option<String>,
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Run commands through `$SHELL -lc` so profile PATH changes apply (POSIX only).
    #[serde(default = "bool_true")]
    pub login_shell: bool,
    /// Shell binary used in login mode. Defaults to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            login_shell: true,
            shell: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Keep jobs.toml and the database in sync (default: true).
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// File events arriving within this window after our own write are ignored.
    #[serde(default = "default_self_write_window_ms")]
    pub self_write_window_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            self_write_window_ms: DEFAULT_SELF_WRITE_WINDOW_MS,
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_self_write_window_ms() -> u64 {
    DEFAULT_SELF_WRITE_WINDOW_MS
}

impl TickdConfig {
    /// Load config from a TOML file with TICKD_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `TICKD_PATHS__ROOT=/tmp/tickd`
    /// or `TICKD_SYNC__SELF_WRITE_WINDOW_MS=100`. A missing file is not an
    /// error; defaults apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: TickdConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TICKD_").split("__"))
            .extract()
            .map_err(|e| crate::error::TickdError::Config(e.to_string()))?;

        Ok(config)
    }
}

pub(crate) fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}

/// `$XDG_CONFIG_HOME/tickd`, falling back to `~/.config/tickd`.
pub fn default_config_dir() -> String {
    match std::env::var("XDG_CONFIG_HOME") {
        Ok(dir) if !dir.is_empty() => format!("{dir}/{APP_NAME}"),
        _ => format!("{}/.config/{APP_NAME}", home_dir()),
    }
}

/// `$XDG_DATA_HOME/tickd`, falling back to `~/.local/share/tickd`.
pub fn default_data_dir() -> String {
    match std::env::var("XDG_DATA_HOME") {
        Ok(dir) if !dir.is_empty() => format!("{dir}/{APP_NAME}"),
        _ => format!("{}/.local/share/{APP_NAME}", home_dir()),
    }
}

fn default_config_path() -> String {
    format!("{}/{APP_NAME}.toml", default_config_dir())
}
