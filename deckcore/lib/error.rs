use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
    time::Duration,
};

use deckutils::DeckutilsError;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a deckcore-related operation.
pub type DeckcoreResult<T> = Result<T, DeckcoreError>;

/// An error that occurred while preparing containers or supervising guest processes.
#[derive(pretty_error_debug::Debug, Error)]
pub enum DeckcoreError {
    /// A container or process id is unknown.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up.
        kind: ResourceKind,

        /// The id that was not found.
        id: String,
    },

    /// A container with the same id already exists on disk.
    #[error("container already exists: {0}")]
    ContainerExists(String),

    /// A required translator, compatibility-layer or sandbox executable is absent.
    #[error("required binary is missing: {0}")]
    BinaryMissing(PathBuf),

    /// The runtime image has not been installed yet.
    #[error("runtime is not installed, run initialize first")]
    NotInitialized,

    /// Another runtime installation is already running.
    #[error("runtime installation is already in progress")]
    InitializationInProgress,

    /// An archive was corrupt, incomplete or could not be read.
    #[error("extraction failed: {0}")]
    ExtractionFailure(DeckutilsError),

    /// An ELF binary had an unexpected structure or could not take the replacement interpreter.
    #[error("binary patch failed: {0}")]
    PatchFailure(DeckutilsError),

    /// Every bootstrap attempt for a container failed.
    #[error(
        "bootstrap of container {container_id} failed after {attempts} attempt(s) (last exit code: {}):\n{output_tail}",
        .last_exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
    )]
    BootstrapFailure {
        /// The container that could not be bootstrapped.
        container_id: String,

        /// How many attempts ran.
        attempts: u32,

        /// The exit code of the last attempt, if it exited rather than timing out.
        last_exit_code: Option<i32>,

        /// The last lines of output captured from the last attempt.
        output_tail: String,
    },

    /// A guest process could not be spawned.
    #[error("failed to launch {executable}: {reason}")]
    LaunchFailure {
        /// The guest executable.
        executable: PathBuf,

        /// What went wrong.
        reason: String,
    },

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,

        /// The deadline that elapsed.
        after: Duration,
    },

    /// A download could not be completed.
    #[error("download of {url} failed: {reason}")]
    Download {
        /// The url being downloaded.
        url: String,

        /// What went wrong.
        reason: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A YAML (de)serialization error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An HTTP request error.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An HTTP middleware error.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error from the utility layer that is not an extraction or patch failure.
    #[error("utils error: {0}")]
    Utils(DeckutilsError),

    /// A join handle returned an error.
    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// The kind of resource a [`DeckcoreError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A container.
    Container,

    /// A guest process.
    Process,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DeckcoreError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> DeckcoreError {
        DeckcoreError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Creates a not-found error for a container.
    pub fn container_not_found(id: impl Into<String>) -> DeckcoreError {
        DeckcoreError::NotFound {
            kind: ResourceKind::Container,
            id: id.into(),
        }
    }

    /// Creates a not-found error for a guest process.
    pub fn process_not_found(id: impl Into<String>) -> DeckcoreError {
        DeckcoreError::NotFound {
            kind: ResourceKind::Process,
            id: id.into(),
        }
    }

    /// Creates a launch failure for the given executable.
    pub fn launch(executable: impl Into<PathBuf>, reason: impl Into<String>) -> DeckcoreError {
        DeckcoreError::LaunchFailure {
            executable: executable.into(),
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

/// Creates an `Ok` `DeckcoreResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> DeckcoreResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<DeckutilsError> for DeckcoreError {
    fn from(error: DeckutilsError) -> Self {
        match error {
            DeckutilsError::Extraction { .. } | DeckutilsError::UnsupportedArchive(_) => {
                DeckcoreError::ExtractionFailure(error)
            }
            DeckutilsError::Patch { .. } | DeckutilsError::InterpreterTooLong { .. } => {
                DeckcoreError::PatchFailure(error)
            }
            DeckutilsError::BinaryNotFound(path, _) => DeckcoreError::BinaryMissing(path.into()),
            DeckutilsError::IoError(e) => DeckcoreError::Io(e),
            other => DeckcoreError::Utils(other),
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Container => write!(f, "container"),
            ResourceKind::Process => write!(f, "process"),
        }
    }
}

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
