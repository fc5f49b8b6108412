//! Compiler abstraction
//!
//! The type checker itself is opaque to the orchestrator. A compiler is
//! reached through three traits:
//! - [`Compiler`] builds checked programs and hands out a transpiler
//! - [`Program`] is one checked program that can be emitted repeatedly
//! - [`Transpiler`] converts a single file without checking it
//!
//! A program's options and its module kind are separate fields because the
//! emitter reads the module kind directly. The multi-emit coordinator swaps
//! both per flavor and restores them afterward.

use crate::diagnostic::Diagnostic;
use crate::error::BuildResult;
use polyemit_config::{CompilerOptions, ModuleKind, ProjectReference};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A parsed source file
#[derive(Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub text: String,
    line_starts: Vec<usize>,
}

impl SourceFile {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        let text = text.into();
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            path: path.into(),
            text,
            line_starts,
        }
    }

    /// 1-based line and column of a byte offset
    pub fn line_and_column(&self, offset: usize) -> (u32, u32) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next.saturating_sub(1),
        };
        let column = offset.saturating_sub(self.line_starts[line]);
        (line as u32 + 1, column as u32 + 1)
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }
}

/// A file produced by emit, not yet written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    pub text: String,
}

impl OutputFile {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }
}

/// Result of one emit call on a program
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramEmit {
    pub emit_skipped: bool,
    pub diagnostics: Vec<Diagnostic>,

    /// Sources whose outputs were produced by this emit
    pub emitted_sources: BTreeSet<PathBuf>,
}

/// File access for program construction
pub trait CompilerHost: Send + Sync {
    /// Parsed source file, shared across passes while unchanged
    fn get_source_file(&self, path: &Path) -> Option<Arc<SourceFile>>;

    fn file_exists(&self, path: &Path) -> bool;

    fn read_file(&self, path: &Path) -> Option<String>;

    fn current_directory(&self) -> &Path;
}

/// Everything needed to create a program
#[derive(Clone)]
pub struct ProgramRequest {
    pub config_path: PathBuf,
    pub root_files: Vec<PathBuf>,
    pub options: CompilerOptions,
    pub project_references: Vec<ProjectReference>,
    pub host: Arc<dyn CompilerHost>,
}

/// A checked program
pub trait Program: Send {
    fn options(&self) -> &CompilerOptions;

    fn set_options(&mut self, options: CompilerOptions);

    /// Module kind read by the emitter
    fn module_kind(&self) -> Option<ModuleKind>;

    fn set_module_kind(&mut self, module_kind: Option<ModuleKind>);

    fn source_files(&self) -> Vec<Arc<SourceFile>>;

    /// Config, option, syntactic, global and semantic diagnostics
    fn diagnostics(&self) -> Vec<Diagnostic>;

    /// Sources whose outputs are out of date
    fn affected_files(&self) -> Vec<PathBuf>;

    /// Emit every affected file through `write_file`
    ///
    /// Emit does not clear the affected set; see [`Program::commit_emit`].
    fn emit(&mut self, write_file: &mut dyn FnMut(OutputFile)) -> BuildResult<ProgramEmit>;

    /// Mark every affected file as emitted
    fn commit_emit(&mut self);

    /// Mark `files` as out of date again
    ///
    /// Paths that are not part of the program are ignored.
    fn mark_pending(&mut self, files: &[PathBuf]);
}

/// Output of a check-free single file transpile
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranspileModuleOutput {
    pub output_text: String,
    pub source_map_text: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Check-free per file transpilation
pub trait Transpiler: Send + Sync {
    fn transpile_module(
        &self,
        file: &Path,
        text: &str,
        options: &CompilerOptions,
    ) -> BuildResult<TranspileModuleOutput>;
}

/// Deepest folder containing every non-declaration source in `files`
pub fn common_source_directory(files: &[PathBuf]) -> Option<PathBuf> {
    let mut sources = files
        .iter()
        .filter(|f| !f.to_string_lossy().ends_with(".d.ts"))
        .filter_map(|f| f.parent());

    let mut common = sources.next()?.to_path_buf();
    for dir in sources {
        while !dir.starts_with(&common) {
            if !common.pop() {
                return None;
            }
        }
    }
    Some(common)
}

/// A loaded compiler
pub trait Compiler: Send + Sync {
    /// Create a checked program
    ///
    /// `previous` is the program of the last pass, when incremental reuse
    /// is possible. Without one, an incremental compiler may restore state
    /// from `options.ts_build_info_file`.
    fn create_program(
        &self,
        request: ProgramRequest,
        previous: Option<Box<dyn Program>>,
    ) -> BuildResult<Box<dyn Program>>;

    fn transpiler(&self) -> Arc<dyn Transpiler>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_and_column() {
        let file = SourceFile::new("a.ts", "let a = 1;\nlet b = 2;\n\nlet c;");
        assert_eq!(file.line_and_column(0), (1, 1));
        assert_eq!(file.line_and_column(4), (1, 5));
        assert_eq!(file.line_and_column(11), (2, 1));
        assert_eq!(file.line_and_column(22), (3, 1));
        assert_eq!(file.line_and_column(27), (4, 5));
        assert_eq!(file.line_count(), 4);
    }

    #[test]
    fn test_common_source_directory() {
        let files = vec![
            PathBuf::from("/repo/src/a/x.ts"),
            PathBuf::from("/repo/src/b/y.ts"),
            PathBuf::from("/repo/types/global.d.ts"),
        ];
        assert_eq!(common_source_directory(&files), Some(PathBuf::from("/repo/src")));
        assert_eq!(
            common_source_directory(&[PathBuf::from("/repo/src/index.ts")]),
            Some(PathBuf::from("/repo/src"))
        );
        assert_eq!(common_source_directory(&[]), None);
    }
}
