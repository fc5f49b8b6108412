//! Compiler tool loading and the per-orchestrator tool handle

use crate::compiler::{Compiler, Program};
use crate::diagnostic::Diagnostic;
use crate::error::{BuildError, BuildResult};
use crate::host::{CachedFileSystem, SourceFileCache};
use crate::logger::ScopedLogger;
use crate::worker::TranspileWorkerPool;
use semver::Version;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Oldest compiler version known to work, as (major, minor)
pub const MIN_TESTED_VERSION: (u64, u64) = (2, 9);

/// Newest compiler version known to work, as (major, minor)
pub const MAX_TESTED_VERSION: (u64, u64) = (5, 8);

/// Manifest file read from the tool folder
pub const TOOL_MANIFEST_NAME: &str = "package.json";

#[derive(Debug, Deserialize)]
struct ToolManifest {
    version: Option<String>,
}

/// Features that depend on the compiler version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Programs can be reused across passes
    pub incremental_program: bool,
    /// Project reference graphs can be built
    pub solution_builder: bool,
}

impl Capabilities {
    pub fn for_version(version: &Version) -> Self {
        let major_minor = (version.major, version.minor);
        Self {
            incremental_program: major_minor >= (3, 6),
            solution_builder: version.major >= 3,
        }
    }
}

/// A compiler bound to the version found in its tool folder
#[derive(Clone)]
pub struct LoadedTool {
    pub compiler: Arc<dyn Compiler>,
    pub tool_path: PathBuf,
    pub version: Version,
    pub capabilities: Capabilities,
}

impl LoadedTool {
    /// Same compiler instance loaded from the same folder
    pub fn is_same_tool(&self, other: &LoadedTool) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.compiler) as *const (),
            Arc::as_ptr(&other.compiler) as *const (),
        ) && self.tool_path == other.tool_path
            && self.version == other.version
    }
}

impl fmt::Debug for LoadedTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedTool")
            .field("tool_path", &self.tool_path)
            .field("version", &self.version)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Notice for a compiler version outside the tested range
#[derive(Debug, Error)]
#[error("The compiler version {version} is {relation} than the {bound} tested version ({major}.{minor}); it may not work as expected")]
pub struct UntestedVersion {
    version: Version,
    relation: &'static str,
    bound: &'static str,
    major: u64,
    minor: u64,
}

/// Resolves the compiler version and its capabilities
pub struct CompilerToolLoader;

impl CompilerToolLoader {
    /// Load the compiler found at `tool_path`
    ///
    /// Untested versions are reported through `logger` and still load.
    pub fn load(
        tool_path: &Path,
        compiler: Arc<dyn Compiler>,
        wants_solution: bool,
        logger: &dyn ScopedLogger,
    ) -> BuildResult<LoadedTool> {
        let version = Self::read_version(tool_path)?;
        let capabilities = Capabilities::for_version(&version);

        if wants_solution && !capabilities.solution_builder {
            return Err(BuildError::UnsupportedFeature(format!(
                "Building project references requires compiler version 3.0 or newer; found {}",
                version
            )));
        }

        let major_minor = (version.major, version.minor);
        let notice = if major_minor < MIN_TESTED_VERSION {
            Some(("older", "oldest", MIN_TESTED_VERSION))
        } else if major_minor > MAX_TESTED_VERSION {
            Some(("newer", "newest", MAX_TESTED_VERSION))
        } else {
            None
        };
        if let Some((relation, bound, (major, minor))) = notice {
            logger.emit_warning(&UntestedVersion {
                version: version.clone(),
                relation,
                bound,
                major,
                minor,
            });
        }

        logger.write_verbose_line(&format!("Using compiler version {}", version));
        Ok(LoadedTool {
            compiler,
            tool_path: tool_path.to_path_buf(),
            version,
            capabilities,
        })
    }

    fn read_version(tool_path: &Path) -> BuildResult<Version> {
        let manifest_path = tool_path.join(TOOL_MANIFEST_NAME);
        let content = std::fs::read_to_string(&manifest_path).map_err(|e| {
            BuildError::configuration(format!(
                "Unable to read the compiler manifest at {}: {}",
                manifest_path.display(),
                e
            ))
        })?;

        let manifest: ToolManifest = serde_json::from_str(&content).map_err(|e| {
            BuildError::configuration(format!(
                "Invalid compiler manifest at {}: {}",
                manifest_path.display(),
                e
            ))
        })?;

        let raw = manifest.version.ok_or_else(|| {
            BuildError::configuration(format!(
                "The compiler manifest at {} has no version field",
                manifest_path.display()
            ))
        })?;

        Version::parse(raw.trim()).map_err(|e| {
            BuildError::configuration(format!("Unable to parse compiler version \"{}\": {}", raw, e))
        })
    }
}

/// State owned by one orchestrator for the lifetime of its compiler
///
/// Created on the first invocation and kept for every later pass.
pub struct BuildToolHandle {
    installed: Option<LoadedTool>,
    pub fs: Arc<CachedFileSystem>,
    pub sources: Arc<SourceFileCache>,

    /// Diagnostics of the current pass
    pub diagnostics: Vec<Diagnostic>,
    pub worker: Option<TranspileWorkerPool>,

    /// Program of the previous pass, for incremental reuse
    pub program: Option<Box<dyn Program>>,
}

impl BuildToolHandle {
    pub fn new() -> Self {
        Self {
            installed: None,
            fs: Arc::new(CachedFileSystem::new()),
            sources: Arc::new(SourceFileCache::new()),
            diagnostics: Vec::new(),
            worker: None,
            program: None,
        }
    }

    /// Install a loaded tool
    ///
    /// Installing the same tool again is a no-op; installing a different
    /// tool requires [`BuildToolHandle::uninstall`] first.
    pub fn install(&mut self, tool: LoadedTool) -> BuildResult<()> {
        match &self.installed {
            Some(existing) if existing.is_same_tool(&tool) => Ok(()),
            Some(existing) => Err(BuildError::invariant(format!(
                "A compiler from {} is already installed on this handle; uninstall it before installing {}",
                existing.tool_path.display(),
                tool.tool_path.display()
            ))),
            None => {
                self.worker = Some(TranspileWorkerPool::new(tool.compiler.transpiler()));
                self.installed = Some(tool);
                Ok(())
            }
        }
    }

    /// Remove the installed tool and everything derived from it
    pub fn uninstall(&mut self) -> Option<LoadedTool> {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        self.program = None;
        self.sources.clear();
        self.installed.take()
    }

    pub fn tool(&self) -> BuildResult<&LoadedTool> {
        self.installed
            .as_ref()
            .ok_or_else(|| BuildError::invariant("no compiler is installed on the build tool handle"))
    }

    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    /// Forget cached state for files changed since the last pass
    pub fn evict_changed(&self, changed: &[PathBuf]) {
        for path in changed {
            self.sources.evict(path);
            self.fs.invalidate(path);
        }
    }
}

impl Default for BuildToolHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::CapturingLogger;
    use crate::testing::MockCompiler;
    use rstest::rstest;
    use std::fs;
    use tempfile::TempDir;

    fn tool_folder(version: &str) -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(TOOL_MANIFEST_NAME),
            format!(r#"{{ "name": "typescript", "version": "{}" }}"#, version),
        )
        .unwrap();
        temp_dir
    }

    #[rstest]
    #[case("3.5.3", false, true)]
    #[case("3.6.0", true, true)]
    #[case("2.9.2", false, false)]
    #[case("5.4.5", true, true)]
    #[case("4.0.0-beta", true, true)]
    fn test_capabilities(#[case] version: &str, #[case] incremental: bool, #[case] solution: bool) {
        let capabilities = Capabilities::for_version(&Version::parse(version).unwrap());
        assert_eq!(capabilities.incremental_program, incremental);
        assert_eq!(capabilities.solution_builder, solution);
    }

    #[test]
    fn test_load_reads_version() {
        let folder = tool_folder("5.4.5");
        let logger = CapturingLogger::new();
        let tool = CompilerToolLoader::load(folder.path(), Arc::new(MockCompiler::new()), false, &logger).unwrap();

        assert_eq!(tool.version, Version::new(5, 4, 5));
        assert!(logger.warnings().is_empty());
    }

    #[test]
    fn test_untested_version_is_a_notice() {
        let folder = tool_folder("6.1.0");
        let logger = CapturingLogger::new();
        let tool = CompilerToolLoader::load(folder.path(), Arc::new(MockCompiler::new()), false, &logger);

        assert!(tool.is_ok());
        assert_eq!(logger.warnings().len(), 1);
        assert!(logger.warnings()[0].contains("newer"));
    }

    #[test]
    fn test_solution_requires_capability() {
        let folder = tool_folder("2.9.2");
        let logger = CapturingLogger::new();
        let err = CompilerToolLoader::load(folder.path(), Arc::new(MockCompiler::new()), true, &logger).unwrap_err();
        assert!(matches!(err, BuildError::UnsupportedFeature(_)));
    }

    #[rstest]
    #[case(r#"{ "name": "typescript" }"#)]
    #[case(r#"{ "version": "five" }"#)]
    #[case("not json")]
    fn test_bad_manifest(#[case] manifest: &str) {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(TOOL_MANIFEST_NAME), manifest).unwrap();
        let err = CompilerToolLoader::load(
            temp_dir.path(),
            Arc::new(MockCompiler::new()),
            false,
            &CapturingLogger::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)));
    }

    #[test]
    fn test_install_is_idempotent_for_same_tool() {
        let folder = tool_folder("5.0.2");
        let logger = CapturingLogger::new();
        let compiler: Arc<dyn Compiler> = Arc::new(MockCompiler::new());
        let tool = CompilerToolLoader::load(folder.path(), compiler, false, &logger).unwrap();

        let mut handle = BuildToolHandle::new();
        handle.install(tool.clone()).unwrap();
        handle.install(tool).unwrap();
        assert!(handle.is_installed());
    }

    #[test]
    fn test_install_different_tool_is_invariant_violation() {
        let folder = tool_folder("5.0.2");
        let logger = CapturingLogger::new();
        let first = CompilerToolLoader::load(folder.path(), Arc::new(MockCompiler::new()), false, &logger).unwrap();
        let second = CompilerToolLoader::load(folder.path(), Arc::new(MockCompiler::new()), false, &logger).unwrap();

        let mut handle = BuildToolHandle::new();
        handle.install(first).unwrap();
        let err = handle.install(second.clone()).unwrap_err();
        assert!(matches!(err, BuildError::InvariantViolation(_)));

        assert!(handle.uninstall().is_some());
        handle.install(second).unwrap();
    }
}
