/// Build orchestrator error types
use polyemit_config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

pub type BuildResult<T> = Result<T, BuildError>;

/// Broad classification of a [`BuildError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Contradictory or invalid options, detected before compiling
    Configuration,
    /// A capability the loaded compiler does not have
    UnsupportedFeature,
    /// A broken internal contract
    InvariantViolation,
    /// The transpile worker crashed or answered with an error
    Worker,
    /// The compiler host failed outside of ordinary diagnostics
    Compiler,
    Io,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Transpiler worker failed: {0}")]
    Worker(String),

    #[error("Compiler failure: {0}")]
    Compiler(String),

    #[error("Circular project reference detected: {0}")]
    CircularReference(String),

    #[error("I/O error at {path}: {error}")]
    IoError {
        path: PathBuf,
        error: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create an invariant violation
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    /// Create a worker failure
    pub fn worker(message: impl ToString) -> Self {
        Self::Worker(message.to_string())
    }

    /// Create a compiler failure
    pub fn compiler(message: impl ToString) -> Self {
        Self::Compiler(message.to_string())
    }

    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            error,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Config(_) | Self::CircularReference(_) => {
                ErrorKind::Configuration
            }
            Self::UnsupportedFeature(_) => ErrorKind::UnsupportedFeature,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::Worker(_) => ErrorKind::Worker,
            Self::Compiler(_) => ErrorKind::Compiler,
            Self::IoError { .. } | Self::Io(_) => ErrorKind::Io,
        }
    }
}
