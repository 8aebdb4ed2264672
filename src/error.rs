//! Error types for Hablar
//!
//! This module defines all error types used throughout the library.
//!
//! Load-time failures (container parsing, tensor validation, vocabulary
//! assembly) surface through these variants and leave the engine
//! uninitialized. Runtime operations never produce new errors; see the
//! `shared` module for the non-throwing boundary contract.

use thiserror::Error;

/// Result type alias for Hablar operations
pub type Result<T> = std::result::Result<T, HablarError>;

/// Error type for all Hablar operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HablarError {
    /// File unreadable or truncated
    #[error("I/O error on '{path}': {reason}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying cause
        reason: String,
    },

    /// Magic mismatch, unknown version, or malformed metadata
    #[error("Invalid GGUF container: {reason}")]
    InvalidContainer {
        /// What was malformed
        reason: String,
    },

    /// `general.architecture` is not in the supported set
    #[error("Unsupported architecture '{arch}', expected llama family")]
    UnsupportedArchitecture {
        /// Architecture string from metadata
        arch: String,
    },

    /// Required weight tensor absent from the file
    #[error("Missing tensor '{name}'")]
    MissingTensor {
        /// Tensor name that was expected
        name: String,
    },

    /// Tensor present but with the wrong shape
    #[error("Shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Tensor name
        name: String,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape from the tensor directory
        actual: Vec<usize>,
    },

    /// Tensor data malformed (row length not a block multiple, unsupported dtype)
    #[error("Invalid tensor data: {reason}")]
    InvalidTensor {
        /// What was malformed
        reason: String,
    },

    /// Tokenizer metadata incomplete for the declared model
    #[error("Invalid vocabulary: {reason}")]
    InvalidVocabulary {
        /// What was missing
        reason: String,
    },

    /// Buffer provisioning failed
    #[error("Allocation failure: {reason}")]
    AllocationFailure {
        /// What could not be allocated
        reason: String,
    },
}
