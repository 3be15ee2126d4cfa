use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::updater::fingerprint::Fingerprint;

// Hot-reload events, broadcast by the definition updater.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    Updated {
        database_path: PathBuf,
        fingerprint: Fingerprint,
        previous_fingerprint: Fingerprint,
        timestamp: u64,
    },
    UpdateFailed {
        database_path: PathBuf,
        reason: String,
        timestamp: u64,
    },
}

impl UpdateEvent {
    pub fn database_path(&self) -> &PathBuf {
        match self {
            UpdateEvent::Updated { database_path, .. } => database_path,
            UpdateEvent::UpdateFailed { database_path, .. } => database_path,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum UpdateResult {
    Updated,
    UpToDate,
    Error(String),
}

// Snapshot served by `DefinitionUpdateCoordinator::status`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatus {
    pub database_path: PathBuf,
    pub interval_secs: u64,
    pub subscriber_count: usize,
    pub updating: bool,
    pub last_update_at: Option<u64>, // unix seconds
    pub last_result: Option<UpdateResult>,
    pub fingerprint: Fingerprint,
}

impl UpdateStatus {
    /// "version" string for health reporting.
    pub fn version(&self) -> String {
        self.fingerprint.version()
    }
}

// One line of the daemon's verdict stream.
#[derive(Serialize, Debug)]
pub struct ScanReport<'a> {
    pub path: &'a str,
    pub verdict: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
