//! `deckutils::error` is a module containing error utilities for the deckcore project.

use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a deckutils-related operation.
pub type DeckutilsResult<T> = Result<T, DeckutilsError>;

/// An error that occurred during an archive, ELF or process utility operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum DeckutilsError {
    /// An error that occurred when validating paths
    #[error("path validation error: {0}")]
    PathValidation(String),

    /// An error that occurred when resolving a binary
    #[error("binary not found at: {0}\nSource: {1}")]
    BinaryNotFound(String, String),

    /// The archive could not be decompressed or unpacked.
    #[error("failed to extract archive {archive}: {reason}")]
    Extraction {
        /// The archive that failed.
        archive: String,

        /// What went wrong.
        reason: String,
    },

    /// The archive format could not be determined from its name.
    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),

    /// An ELF file did not have the structure the patcher expects.
    #[error("failed to patch {path}: {reason}")]
    Patch {
        /// The binary being patched.
        path: PathBuf,

        /// What went wrong.
        reason: String,
    },

    /// The replacement interpreter path does not fit the on-disk field.
    #[error("interpreter path {replacement:?} needs {needed} bytes but the field in {path} holds {available}")]
    InterpreterTooLong {
        /// The binary being patched.
        path: PathBuf,

        /// The requested interpreter path.
        replacement: String,

        /// Bytes needed including the terminating NUL.
        needed: usize,

        /// Bytes available in the PT_INTERP segment.
        available: usize,
    },

    /// An error that occurred when performing an IO operation
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Custom error.
    #[error("Custom error: {0}")]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DeckutilsError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> DeckutilsError {
        DeckutilsError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Creates a patch error for the given binary.
    pub fn patch(path: impl Into<PathBuf>, reason: impl Into<String>) -> DeckutilsError {
        DeckutilsError::Patch {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `DeckutilsResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> DeckutilsResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
