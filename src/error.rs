use std::time::Duration;

use thiserror::Error;

/// Failure of a single probe invocation.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    /// The invocation was terminated because its host lost every subscriber.
    #[error("probe cancelled")]
    Cancelled,

    #[error("malformed probe output: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejections surfaced to policy and command callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("cron expression {expr:?} fires every {interval_secs}s, below the {floor_secs}s floor")]
    CronTooFrequent {
        expr: String,
        interval_secs: i64,
        floor_secs: u64,
    },

    #[error("unknown {kind} target: {target}")]
    UnknownTarget { kind: String, target: String },
}

/// Persisted store failures. Callers log these and carry on with in-memory state.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum DictionaryError {
    #[error("failed to fetch dictionary: {0}")]
    Fetch(String),

    #[error("malformed dictionary bundle: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<reqwest::Error> for DictionaryError {
    fn from(e: reqwest::Error) -> Self {
        DictionaryError::Fetch(e.to_string())
    }
}
