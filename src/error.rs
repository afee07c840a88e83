use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to connect to {server}:{port}: {source}")]
    Connection {
        server: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Stream size exceeded the configured maximum of {limit} bytes")]
    MaxStreamSizeExceeded { limit: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
