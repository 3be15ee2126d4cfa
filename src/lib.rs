pub mod config;
pub mod data_type;
pub mod detector;
pub mod logger;
pub mod model;

use coarsetime::Clock;

pub use data_type::{UpdateEvent, UpdateResult, UpdateStatus};
pub use detector::{CoordinatorConfig, ReloadCounters, ScanCoordinator, ScanTicket};
#[cfg(feature = "clamav")]
pub use model::engine::clamav::ClamavLibrary;
pub use model::engine::{EngineError, EngineHandle, NativeLibrary, ScanOptions, ScanVerdict};
pub use model::updater::{
    compute_fingerprint, subscription, DefinitionUpdateCoordinator, Fingerprint, Mailbox,
    Subscriber, SubscriberId, UpdateRunner, UpdateToolError, UpdaterConfig, UpdaterStopped,
};

/// Unix seconds, as stamped on events and status.
pub fn now_secs() -> u64 {
    Clock::now_since_epoch().as_secs()
}
