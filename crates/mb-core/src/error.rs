//! Error types and result aliases shared across motherbrain crates.
//!
//! Errors are structured for programmatic handling and include context for
//! debugging.

/// The result type used throughout motherbrain.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shared motherbrain primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
