use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Service Config
pub const NAME: &str = "clamguard";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_PID_LOCK_PATH: &str = "/var/run/clamguard.pid";
pub const SERVICE_DETAIL_ENV: &str = "CLAMGUARD_DETAIL";

// Database Config
pub const DB_DEFAULT: &str = "/var/lib/clamav";
pub const UPDATE_TOOL_DEFAULT: &str = "/usr/bin/freshclam";
pub const UPDATE_INTERVAL_DEFAULT: u64 = 4 * 3600; // freshclam checks 12 times a day at most
pub const UPDATE_TIMEOUT_DEFAULT: u64 = 600;

// Scanner Config
pub const SCAN_QUEUE_SIZE: usize = 8192;

// Log Config
pub const LOG_PATH_DEFAULT: &str = "./clamguard.log";
pub const LOG_LEVEL_DEFAULT: &str = "info";
pub const LOG_MAX_SIZE: u64 = 1024 * 1024 * 5;
pub const LOG_MAX_BACKUPS: usize = 10;

fn default_database_path() -> PathBuf {
    PathBuf::from(DB_DEFAULT)
}
fn default_update_interval() -> u64 {
    UPDATE_INTERVAL_DEFAULT
}
fn default_update_tool() -> Option<PathBuf> {
    Some(PathBuf::from(UPDATE_TOOL_DEFAULT))
}
fn default_update_timeout() -> u64 {
    UPDATE_TIMEOUT_DEFAULT
}
fn default_true() -> bool {
    true
}
fn default_queue_size() -> usize {
    SCAN_QUEUE_SIZE
}
fn default_log_path() -> PathBuf {
    PathBuf::from(LOG_PATH_DEFAULT)
}
fn default_log_level() -> String {
    LOG_LEVEL_DEFAULT.to_string()
}
fn default_log_max_size() -> u64 {
    LOG_MAX_SIZE
}
fn default_log_max_backups() -> usize {
    LOG_MAX_BACKUPS
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Settings {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    /// `None` disables the definition updater.
    #[serde(default = "default_update_tool")]
    pub update_tool: Option<PathBuf>,
    #[serde(default)]
    pub update_config_file: Option<PathBuf>,
    #[serde(default)]
    pub update_on_start: bool,
    #[serde(default = "default_update_timeout")]
    pub update_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub auto_reload: bool,
    #[serde(default)]
    pub scan_options: u32,
    #[serde(default = "default_queue_size")]
    pub scan_queue_size: usize,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_max_size")]
    pub log_max_size: u64,
    #[serde(default = "default_log_max_backups")]
    pub log_max_backups: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            update_interval_secs: default_update_interval(),
            update_tool: default_update_tool(),
            update_config_file: None,
            update_on_start: false,
            update_timeout_secs: default_update_timeout(),
            auto_reload: default_true(),
            scan_options: 0,
            scan_queue_size: default_queue_size(),
            log_path: default_log_path(),
            log_level: default_log_level(),
            log_max_size: default_log_max_size(),
            log_max_backups: default_log_max_backups(),
        }
    }
}

impl Settings {
    /// defaults, then the JSON config file, then the `CLAMGUARD_DETAIL` env.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let file = match config_file {
            Some(p) => Some(
                std::fs::read_to_string(p)
                    .with_context(|| format!("read config file {}", p.display()))?,
            ),
            None => None,
        };
        let detail = std::env::var(SERVICE_DETAIL_ENV).ok();
        Self::from_sources(file.as_deref(), detail.as_deref())
    }

    pub fn from_sources(file: Option<&str>, detail: Option<&str>) -> Result<Self> {
        let mut merged = Value::Object(Default::default());
        if let Some(text) = file {
            let v: Value = serde_json::from_str(text).context("config file is not valid json")?;
            merge(&mut merged, v);
        }
        if let Some(text) = detail {
            let v: Value = serde_json::from_str(text)
                .with_context(|| format!("{} is not valid json", SERVICE_DETAIL_ENV))?;
            merge(&mut merged, v);
        }
        let settings: Settings = serde_json::from_value(merged).context("invalid settings")?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.update_interval_secs == 0 {
            return Err(anyhow!("update_interval_secs must be > 0"));
        }
        if self.update_timeout_secs == 0 {
            return Err(anyhow!("update_timeout_secs must be > 0"));
        }
        if self.scan_queue_size == 0 {
            return Err(anyhow!("scan_queue_size must be > 0"));
        }
        if !self.database_path.is_dir() {
            return Err(anyhow!(
                "database directory {} does not exist",
                self.database_path.display()
            ));
        }
        self.level()?;
        Ok(())
    }

    pub fn level(&self) -> Result<LevelFilter> {
        self.log_level
            .parse()
            .map_err(|_| anyhow!("invalid log level {:?}", self.log_level))
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (k, v) in overlay {
                merge(base.entry(k).or_insert(Value::Null), v);
            }
        }
        (base, overlay) => *base = overlay,
    }
}
