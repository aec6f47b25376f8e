//! Error types for the telemetry engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Type clash: {0}")]
    TypeClash(String),

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid format: {0}")]
    Format(String),

    #[error("Missing component: {0}")]
    MissingComponent(&'static str),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("ID space overflow: {0}")]
    Overflow(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Get the process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::Parse(_) => 2,
            _ => 1,
        }
    }
}
