//! shardrun dispatch engine.
//!
//! Resolves targets, runs one SSH session per task, and fans tasks out under
//! a [`DispatchPolicy`]. All per-task failures are captured into the
//! [`RunReport`](shardrun_core::RunReport); nothing here aborts a run.

pub mod compute;
pub mod dispatcher;
pub mod resolver;
pub mod session;

pub use compute::{ComputeApiResolver, DEFAULT_COMPUTE_ENDPOINT};
pub use dispatcher::{DispatchPolicy, Dispatcher};
pub use resolver::{resolve_target, CachedResolver, StaticResolver, TargetResolver};
pub use session::{
    SessionFailure, SessionOutput, SessionResult, SessionRunner, SshOptions, SshSessionRunner,
};

// Re-exported so callers need not depend on tokio-util directly.
pub use tokio_util::sync::CancellationToken;
