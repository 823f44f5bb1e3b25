// ABOUTME: Desired-state reconciliation core: diff, apply, status cache and log fan-out
// ABOUTME: Everything above the runtime adapter and below the HTTP surface lives here

pub mod cache;
pub mod calls;
pub mod error;
pub mod locks;
pub mod logs;
pub mod plan;
pub mod reconciler;
pub mod supervisor;

pub use cache::{CacheEntry, Stamp, StatusCache};
pub use calls::{CallTimeouts, RetryPolicy};
pub use error::{ActionFailure, ApplySummary, ReconcileError, Result};
pub use logs::{LogLines, LogSnapshot, LogStreamer, LogStreamerConfig};
pub use plan::{plan, ActionKind, Plan, ReconciliationAction, RemoveReason};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use supervisor::{Supervisor, SupervisorConfig};
