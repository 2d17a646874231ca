//! Fatal engine faults.
//!
//! User-visible ECMAScript exceptions are never Rust errors: they travel as
//! `throw` completion values through the interpreter until caught or until
//! they reach the top level. The variants here are the conditions that
//! terminate a run instead.

use thiserror::Error;

/// Unrecoverable engine faults.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Allocation failed even after the full recovery cascade
    /// (cache drop, minor collection, major collection).
    #[error("out of memory")]
    OutOfMemory,

    /// A throw completion reached the top of the program.
    #[error("unhandled exception: {0}")]
    UnhandledException(String),

    /// The bytecode image violates the compiler/runtime contract.
    #[error("invalid bytecode image: {0}")]
    InvalidImage(String),
}

impl EngineError {
    pub fn invalid_image(message: impl Into<String>) -> Self {
        EngineError::InvalidImage(message.into())
    }
}
