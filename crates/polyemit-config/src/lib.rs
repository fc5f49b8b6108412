//! Polyemit Configuration System
//!
//! Provides configuration handling for the build orchestrator:
//! - Orchestrator settings (polyemit.toml)
//! - Project configuration files (tsconfig-style JSON with `extends`)
//! - Compiler option types shared with the build crate
//! - The incremental cache key derived from the extra output flavors
//!
//! # Example
//!
//! ```no_run
//! use polyemit_config::{BuildSettings, ConfigLoader};
//! use std::path::Path;
//!
//! let settings = BuildSettings::discover(Path::new(".")).unwrap();
//! let mut loader = ConfigLoader::new();
//! let parsed = loader.load(&settings.project_path()).unwrap();
//! println!("{} root files", parsed.files.len());
//! ```

pub mod cache_key;
pub mod loader;
pub mod options;
pub mod settings;

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid JSON in {file}: {error}")]
    JsonParseError { file: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Missing required field '{field}' in {file}")]
    MissingField { field: String, file: PathBuf },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Lexically normalize a path, dropping `.` and folding `..`
///
/// Does not touch the filesystem, so it works for outputs that do not
/// exist yet.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(normalized.components().next_back(), Some(Component::Normal(_)))
                    && normalized.pop();
                if !popped && !normalized.has_root() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }
    normalized
}

// Re-export main types
pub use cache_key::IncrementalCacheKey;
pub use loader::{ConfigLoader, ParsedConfig, DEFAULT_CONFIG_NAME};
pub use options::{CompilerOptions, JsExtension, ModuleKind, ProjectReference, ScriptTarget};
pub use settings::{AdditionalModuleKind, BuildSettings, DEFAULT_MAX_WRITE_PARALLELISM, SETTINGS_FILE_NAME};
