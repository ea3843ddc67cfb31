//! Error types for the hyperparameter search engine

use thiserror::Error;

/// Errors raised by the schema, pipeline and search driver.
#[derive(Error, Debug)]
pub enum HyperError {
    /// No catalogue entry for the requested agent/net pair
    #[error("no hyper schema for agent `{agent}` with net `{net}`")]
    SchemaNotFound { agent: String, net: String },

    /// A proposed action names a key the active schema does not define
    #[error("unknown hyper `{0}`: actions and schema are out of sync")]
    UnknownHyper(String),

    /// A `pre` hook could not coerce the proposed value
    #[error("cannot coerce `{key}`: {reason}")]
    Coercion { key: String, reason: String },

    /// The network builder rejected the hydrated custom tree
    #[error("network build failed: {0}")]
    Network(String),

    /// Guess group index outside the override catalogue
    #[error("guess group {index} out of range (have {available})")]
    GuessGroupOutOfRange { index: usize, available: usize },

    /// The training collaborator failed or returned an unusable score
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// Run history read/write failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the run ledger.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("run ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("run serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run not found: {id}")]
    NotFound { id: String },

    #[error("csv export failed: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, HyperError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
