//! Core of the shared chore chart.
//!
//! One JSON document, shared by every device, holds task sets, children and
//! reset bookkeeping. This crate normalizes that document, talks to the
//! store that holds it, keeps a live view in sync and clears completions
//! once per day.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod schema;
pub mod service;
pub mod store;
pub mod view;

pub use config::{AppConfig, ConfigError, StoreBackend};
pub use logging::{default_log_level, init_logging, logging_status, LogTarget};
pub use model::child::{Child, ChildId};
pub use model::defaults::{default_app_state, DEFAULT_FALLBACK_TASK_SET_ID};
pub use model::state::AppState;
pub use model::task::{Task, TaskSet};
pub use repo::device_prefs::DevicePrefs;
pub use schema::{Schema, ValidationError};
pub use service::clock::{Clock, SystemClock};
pub use service::reset_scheduler::{
    apply_reset, ResetHandle, ResetOutcome, ResetPolicy, ResetScheduler,
};
pub use service::sync_service::{
    ChildPatch, SyncError, SyncPhase, SyncResult, SyncService, SyncSnapshot,
};
pub use store::{
    FirebaseConfig, FirebaseStore, MemoryStore, SqliteDocumentStore, StoreAdapter, StoreError,
    StoreResult,
};
pub use view::{ChildRotation, ChildView};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
