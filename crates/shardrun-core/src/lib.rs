//! shardrun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/SSH
//! - Cloud APIs
//! - Runtime specifics
//!
//! Everything needed to describe a run and its outcome lives here; the
//! dispatch engine in `shardrun-dispatch` consumes these types.

pub mod command;
pub mod error;
pub mod event;
pub mod host;
pub mod ids;
pub mod plan;
pub mod run_spec;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use command::{shell_quote, CommandBuilder, CommandTemplate, DEFAULT_BASE_PORT};
pub use error::{ConfigError, ErrorKind, TaskError};
pub use event::{DispatchEvent, DispatchEventType};
pub use host::{Credentials, Host, HostDirectory};
pub use ids::{HostId, RunId};
pub use plan::plan_tasks;
pub use run_spec::{RunMode, RunSpec};
pub use status::TaskStatus;
pub use task::{Attempt, RunReport, RunSummary, Task, TaskResult};
