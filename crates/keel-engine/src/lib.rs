//! The incremental-build state engine facade.
//!
//! [`StateEngine`] wires the snapshotter, the caching file hashers, the
//! fingerprinter and the task history over one persistent store, configured
//! by an [`EngineConfig`] loaded from TOML.

mod changes;
mod config;
mod engine;
mod error;
mod logging;

pub use changes::ChangeReason;
pub use config::{ClasspathConfig, ConfigError, EngineConfig, LoggingConfig};
pub use engine::{EngineStatistics, StateEngine};
pub use error::{EngineError, Result};
pub use logging::init_tracing;
