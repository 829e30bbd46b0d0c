//! Launcher Updater Library
//!
//! Client-side update engine for desktop launchers: version planning,
//! resumable and parallel transfers, mirror selection, binary deltas,
//! signature verification, safe extraction and rollback.

pub mod backup;
pub mod cache;
pub mod config;
pub mod delta;
pub mod events;
pub mod fs;
pub mod installer;
pub mod integrity;
pub mod manifest;
pub mod orchestrator;
pub mod sources;
pub mod transfer;
pub mod utils;
pub mod version;

// Re-export commonly used types
pub use config::Config;
pub use events::{EventBus, UpdateEvent};
pub use orchestrator::{UpdateOrchestrator, UpdateOutcome, UpdateServices};
pub use utils::errors::{Result, UpdateError};
