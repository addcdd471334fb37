use std::io;

use thiserror::Error;

/// Top level error for the pipeline binaries.
#[derive(Debug, Error)]
pub enum CdcError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("mysql protocol error: {0}")]
    Net(String),
    #[error("malformed binlog event: {0}")]
    Event(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Staging cache and position store failures.
///
/// `SaveIgnore` and `BackendFull` are the two conditions the producer
/// recovers from; everything else ends the process so a supervisor can
/// restart from the last durable position.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("table[{table}]: {skipped} row(s) without a usable key, ignored")]
    SaveIgnore { table: String, skipped: usize },
    #[error("cache backend is full: {0}")]
    BackendFull(String),
    #[error("lease lost during dump")]
    LeaseLost,
    #[error("stored log_pos '{0}' is not a valid offset")]
    BadPosition(String),
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, CdcError>;

impl CdcError {
    /// Exit code for the binaries: 1 for configuration faults, 2 for
    /// everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            CdcError::Config(_) => 1,
            _ => 2,
        }
    }
}
