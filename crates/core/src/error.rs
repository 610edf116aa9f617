use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by an `ActionEmitter` for one create/delete call.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionError {
    /// resourceVersion precondition failed: the target changed since it was observed.
    #[error("conflict: {target} no longer at resourceVersion {expected}")]
    Conflict { target: String, expected: String },
    /// Target already gone. Counts as success for deletes.
    #[error("not found: {0}")]
    NotFound(String),
    /// Transient transport or server failure.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// The store refused the request (validation, authorization, missing template).
    #[error("rejected by store: {0}")]
    Rejected(String),
}

impl ActionError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::Conflict { .. } => "conflict",
            ActionError::NotFound(_) => "not_found",
            ActionError::StoreUnavailable(_) => "unavailable",
            ActionError::Rejected(_) => "rejected",
        }
    }
}

/// Last reconciliation error recorded against a controller.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileError {
    #[error("selector is empty; controller matches nothing")]
    InvalidSelector,
    #[error("{verb} {target} failed: {source}")]
    Action {
        verb: String,
        target: String,
        #[source]
        source: ActionError,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LabelParseError {
    #[error("label `{0}` is not of the form key=value")]
    Malformed(String),
    #[error("label key is empty in `{0}`")]
    EmptyKey(String),
}
