//! Bounded, persisted execution history per task.
//!
//! A [`TaskHistoryRepository`] keeps the last few [`TaskExecutionRecord`]s of
//! every task and picks the one that best matches the outputs a task declares
//! now. Shareable directory trees referenced by recorded fingerprints are
//! stored once by the [`TreeSnapshotRepository`] and reference counted, so
//! an unchanged output directory is not copied into every record.

mod error;
mod history;
mod output;
mod record;
mod trees;
mod value;

pub use error::{HistoryError, Result};
pub use history::{HistoricalExecution, TaskHistory, TaskHistoryRepository, DEFAULT_MAX_HISTORY};
pub use output::{filter_output_fingerprint, OverlappingOutputs};
pub use record::{TaskExecution, TaskExecutionRecord};
pub use trees::TreeSnapshotRepository;
pub use value::{ImplementationSnapshot, ValueSnapshot};
