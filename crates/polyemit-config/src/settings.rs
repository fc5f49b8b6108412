//! Build settings (polyemit.toml)
//!
//! Handles the orchestrator's own settings stored in `polyemit.toml` at the
//! project root. Settings are merged in the following order (later
//! overrides earlier):
//! 1. Built-in defaults
//! 2. Project settings (./polyemit.toml)
//! 3. Environment variables (POLYEMIT_*)

use crate::options::{JsExtension, ModuleKind};
use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Settings file name searched for by [`BuildSettings::discover`]
pub const SETTINGS_FILE_NAME: &str = "polyemit.toml";

/// Default number of files written concurrently
pub const DEFAULT_MAX_WRITE_PARALLELISM: usize = 50;

/// An extra output flavor requested by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdditionalModuleKind {
    /// Module format of the extra output
    pub module_kind: ModuleKind,

    /// Output folder, relative to the build folder unless absolute
    pub out_folder_name: PathBuf,

    /// Extension for emitted files; `.js` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_override: Option<JsExtension>,

    /// Write a `package.json` with a matching `type` field into the folder
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub emit_package_marker: bool,
}

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuildSettings {
    /// Root folder of the build; the folder containing polyemit.toml
    #[serde(skip)]
    pub build_folder: PathBuf,

    /// Folder for build metadata such as the incremental cache
    pub build_metadata_folder: PathBuf,

    /// Folder of the compiler package (contains its package.json)
    pub tool_path: PathBuf,

    /// Project configuration file to build
    pub project: PathBuf,

    /// Extra module formats to emit next to the project's own
    pub additional_module_kinds_to_emit: Vec<AdditionalModuleKind>,

    /// Build the project reference graph instead of a single project
    pub build_project_references: bool,

    /// Emit an extra CommonJS flavor with the `.cjs` extension
    pub emit_cjs_extension_for_commonjs: bool,

    /// Emit an extra ESNext flavor with the `.mjs` extension
    pub emit_mjs_extension_for_esmodule: bool,

    /// Transpile changed files on a background worker
    pub use_transpiler_worker: bool,

    /// Maximum number of files written concurrently
    pub max_write_parallelism: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            build_folder: PathBuf::from("."),
            build_metadata_folder: PathBuf::from("temp/build"),
            tool_path: PathBuf::from("node_modules/typescript"),
            project: PathBuf::from("tsconfig.json"),
            additional_module_kinds_to_emit: Vec::new(),
            build_project_references: false,
            emit_cjs_extension_for_commonjs: false,
            emit_mjs_extension_for_esmodule: false,
            use_transpiler_worker: false,
            max_write_parallelism: DEFAULT_MAX_WRITE_PARALLELISM,
        }
    }
}

impl BuildSettings {
    /// Default settings rooted at `build_folder`
    pub fn for_folder(build_folder: impl Into<PathBuf>) -> Self {
        Self {
            build_folder: build_folder.into(),
            ..Default::default()
        }
    }

    /// Load settings from a specific file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let mut settings: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        settings.build_folder = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        settings.validate()?;
        Ok(settings)
    }

    /// Walk up from `start_dir` looking for polyemit.toml
    ///
    /// Falls back to defaults rooted at `start_dir` when no file exists.
    /// Environment overrides are applied in both cases.
    pub fn discover(start_dir: &Path) -> ConfigResult<Self> {
        let mut current = start_dir.to_path_buf();

        let settings = loop {
            let candidate = current.join(SETTINGS_FILE_NAME);
            if candidate.exists() {
                break Self::load_from_file(&candidate)?;
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break Self::for_folder(start_dir),
            }
        };

        settings.apply_env_overrides()
    }

    /// Apply `POLYEMIT_*` environment overrides
    pub fn apply_env_overrides(mut self) -> ConfigResult<Self> {
        if let Ok(value) = env::var("POLYEMIT_MAX_WRITE_PARALLELISM") {
            self.max_write_parallelism =
                value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    field: "POLYEMIT_MAX_WRITE_PARALLELISM".to_string(),
                    reason: format!("'{}' is not a positive integer", value),
                })?;
        }

        if let Ok(value) = env::var("POLYEMIT_USE_TRANSPILER_WORKER") {
            self.use_transpiler_worker =
                matches!(value.to_lowercase().as_str(), "true" | "1" | "yes");
        }

        self.validate()?;
        Ok(self)
    }

    /// Validate settings that serde cannot check
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_write_parallelism == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_write_parallelism".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        for kind in &self.additional_module_kinds_to_emit {
            if kind.out_folder_name.as_os_str().is_empty() {
                return Err(ConfigError::MissingField {
                    field: "additional_module_kinds_to_emit.out_folder_name".to_string(),
                    file: self.build_folder.join(SETTINGS_FILE_NAME),
                });
            }
        }

        Ok(())
    }

    /// Resolve a settings path against the build folder
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.build_folder.join(path)
        }
    }

    pub fn project_path(&self) -> PathBuf {
        self.resolve(&self.project)
    }

    pub fn tool_folder(&self) -> PathBuf {
        self.resolve(&self.tool_path)
    }

    pub fn metadata_folder(&self) -> PathBuf {
        self.resolve(&self.build_metadata_folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn write_settings(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join(SETTINGS_FILE_NAME);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let settings = BuildSettings::default();
        assert_eq!(settings.max_write_parallelism, DEFAULT_MAX_WRITE_PARALLELISM);
        assert_eq!(settings.project, PathBuf::from("tsconfig.json"));
        assert!(settings.additional_module_kinds_to_emit.is_empty());
    }

    #[test]
    fn test_load_additional_kinds() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_settings(
            temp_dir.path(),
            r#"
emit_cjs_extension_for_commonjs = true

[[additional_module_kinds_to_emit]]
module_kind = "esnext"
out_folder_name = "lib-esm"
emit_package_marker = true
"#,
        );

        let settings = BuildSettings::load_from_file(&path).unwrap();
        assert!(settings.emit_cjs_extension_for_commonjs);
        assert_eq!(settings.build_folder, temp_dir.path());
        assert_eq!(settings.additional_module_kinds_to_emit.len(), 1);
        let kind = &settings.additional_module_kinds_to_emit[0];
        assert_eq!(kind.module_kind, ModuleKind::EsNext);
        assert!(kind.emit_package_marker);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_settings(temp_dir.path(), "emit_everything = true\n");
        let err = BuildSettings::load_from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TomlParseError { .. }));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_settings(temp_dir.path(), "max_write_parallelism = 0\n");
        assert!(BuildSettings::load_from_file(&path).is_err());
    }

    #[test]
    #[serial]
    fn test_discover_walks_up() {
        let temp_dir = TempDir::new().unwrap();
        write_settings(temp_dir.path(), "use_transpiler_worker = true\n");
        let nested = temp_dir.path().join("src").join("deep");
        fs::create_dir_all(&nested).unwrap();

        let settings = BuildSettings::discover(&nested).unwrap();
        assert!(settings.use_transpiler_worker);
        assert_eq!(settings.build_folder, temp_dir.path());
    }

    #[test]
    #[serial]
    fn test_env_override_parallelism() {
        let temp_dir = TempDir::new().unwrap();
        write_settings(temp_dir.path(), "max_write_parallelism = 8\n");

        env::set_var("POLYEMIT_MAX_WRITE_PARALLELISM", "3");
        let settings = BuildSettings::discover(temp_dir.path());
        env::remove_var("POLYEMIT_MAX_WRITE_PARALLELISM");

        assert_eq!(settings.unwrap().max_write_parallelism, 3);
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_parallelism() {
        let temp_dir = TempDir::new().unwrap();

        env::set_var("POLYEMIT_MAX_WRITE_PARALLELISM", "many");
        let settings = BuildSettings::discover(temp_dir.path());
        env::remove_var("POLYEMIT_MAX_WRITE_PARALLELISM");

        assert!(settings.is_err());
    }
}
