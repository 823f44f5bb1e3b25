// ABOUTME: Reconciler error taxonomy and the per-apply outcome summary
// ABOUTME: Runtime failures are wrapped with the container name and action that caused them

use crate::plan::ActionKind;
use dockformer_manifest::{Generation, ParseError};
use dockformer_runtime::RuntimeError;
use dockformer_storage::StorageError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Failed to {action} container '{name}': {cause}")]
    Runtime {
        name: String,
        action: ActionKind,
        cause: RuntimeError,
    },

    #[error("Reconciliation of generation {} partially failed: {} action(s) failed", .0.generation, .0.failed.len())]
    PartialApply(ApplySummary),

    #[error("No manifest has been accepted yet")]
    NoManifest,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ReconcileError {
    /// Classify a runtime failure for one container and action
    pub fn runtime(name: impl Into<String>, action: ActionKind, cause: RuntimeError) -> Self {
        let name = name.into();
        match cause {
            RuntimeError::NotFound(_) => Self::NotFound(name),
            RuntimeError::Unavailable(msg) => Self::RuntimeUnavailable(msg),
            cause => Self::Runtime {
                name,
                action,
                cause,
            },
        }
    }

    /// Container name this error is about, when known
    pub fn container(&self) -> Option<&str> {
        match self {
            Self::NotFound(name) | Self::Runtime { name, .. } => Some(name),
            Self::Parse(e) => e.container(),
            _ => None,
        }
    }

    pub fn action(&self) -> Option<ActionKind> {
        match self {
            Self::Runtime { action, .. } => Some(*action),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionFailure {
    pub name: String,
    pub action: ActionKind,
    pub cause: String,
}

impl ActionFailure {
    pub fn new(name: impl Into<String>, action: ActionKind, cause: impl ToString) -> Self {
        Self {
            name: name.into(),
            action,
            cause: cause.to_string(),
        }
    }
}

/// Per-name outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplySummary {
    pub generation: Generation,
    pub created: Vec<String>,
    pub started: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<ActionFailure>,
    /// The pass ran against a manifest newer than the one that triggered it
    pub superseded: bool,
}

impl ApplySummary {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// True when the pass changed anything at the runtime
    pub fn changed(&self) -> bool {
        !(self.created.is_empty() && self.started.is_empty() && self.removed.is_empty())
    }

    /// Turn a summary with failures into `PartialApply`
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ReconcileError::PartialApply(self))
        }
    }
}
