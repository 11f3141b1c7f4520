//! Error types for the filter runner
//!
//! Every failure in the runner is fatal: errors propagate with `?` up to the
//! CLI entry point, which prints them and exits with status 1.

use thiserror::Error;

use crate::types::TypeTag;

#[derive(Debug, Error)]
pub enum RunGenError {
    /// Bad, missing or unknown command-line argument.
    #[error("{0}")]
    Usage(String),

    /// Text that does not match its declared scalar type.
    #[error("Unable to parse '{text}' as type {expected}")]
    Parse { text: String, expected: TypeTag },

    /// A filter argument whose value does not match its declared type.
    #[error("Argument value for: {name} could not be parsed as type {expected}: {text}")]
    ArgumentParse {
        name: String,
        text: String,
        expected: TypeTag,
    },

    /// Type tag outside the closed set of supported scalar types.
    #[error("Unsupported type: {0}")]
    UnsupportedType(TypeTag),

    /// Malformed extent list, bad dimensions, or allocation overflow.
    #[error("Shape error: {0}")]
    Shape(String),

    /// The filter returned a nonzero status.
    #[error("{phase} failed with result code: {code}")]
    ModuleInvocation { phase: &'static str, code: i32 },

    /// Error message reported by the filter through its runtime.
    #[error("Filter error: {0}")]
    ModuleError(String),

    /// Load/save failure from the image I/O capability.
    #[error("Error in I/O: {0}")]
    Io(String),

    /// Untracked free, duplicate allocation, or double install.
    #[error("Tracking error: {0}")]
    TrackingInvariant(String),

    /// The filter's argument descriptor is unusable.
    #[error("Invalid filter metadata: {0}")]
    InvalidMetadata(String),

    /// A dynamic filter library could not be opened.
    #[error("Failed to load filter module: {0}")]
    ModuleLoad(String),
}

pub type Result<T> = std::result::Result<T, RunGenError>;
