//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV syntax or field error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Unexpected digi file layout.
    #[error("line {line}: {message}")]
    Parse { line: u64, message: String },

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] tofhit_core::Error),
}
