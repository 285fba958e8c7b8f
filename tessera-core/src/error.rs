//! Engine Errors

use thiserror::Error;

use crate::schema::SchemaError;
use crate::store::StoreError;

/// Boxed error returned by user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors raised by the computation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A computation definition lacks something its handle needs. Raised when
    /// the handle is built, never while computing.
    #[error("{computation}: {detail}")]
    MissingConfiguration { computation: String, detail: String },

    #[error("no handle registered for {kind} in {context} context")]
    UnregisteredHandle { kind: String, context: String },

    #[error("data dependency `{0}` was not declared")]
    UndeclaredDep(String),

    #[error("propagation exceeded {limit} events")]
    CascadeLimit { limit: usize },

    /// `compute()` itself asked for a full recompute.
    #[error("computation {0} cannot compute from scratch")]
    RecomputeLoop(String),

    #[error("computation {computation} produced an unusable result: {detail}")]
    InvalidResult { computation: String, detail: String },

    #[error("computation {0} does not accept async returns")]
    AsyncUnsupported(String),

    #[error("no pending async task #{0}")]
    UnknownTask(u64),

    #[error("bound state cell `{cell}` holds an unexpected value")]
    State {
        cell: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("bound state snapshot: {0}")]
    Snapshot(String),

    #[error("callback of {computation} failed: {message}")]
    Callback { computation: String, message: String },
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        EngineError::Snapshot(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        EngineError::Snapshot(err.to_string())
    }
}

impl EngineError {
    pub(crate) fn missing(computation: impl Into<String>, detail: impl Into<String>) -> Self {
        EngineError::MissingConfiguration {
            computation: computation.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn callback(computation: impl Into<String>, err: BoxError) -> Self {
        EngineError::Callback {
            computation: computation.into(),
            message: err.to_string(),
        }
    }
}
