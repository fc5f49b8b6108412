//! A line-oriented toy compiler implementing the compiler traits
//!
//! Understands three statement forms:
//! - `import { a, b as c } from './x';`
//! - `export * from './x';`
//! - `export const name: Type = value;`
//!
//! Other lines are copied through. Diagnostics come from directives:
//! - `// @error TS<code> <message>` reports an error on that line
//! - `// @warning TS<code> <message>` reports a warning
//! - `// @unused <name>` reports TS6133 flagged as unnecessary
//!
//! Relative imports that do not resolve report TS2307. Source text
//! containing `__crash__` makes the transpiler panic.

use crate::compiler::{
    common_source_directory, Compiler, CompilerHost, OutputFile, Program, ProgramEmit, ProgramRequest,
    SourceFile, TranspileModuleOutput, Transpiler,
};
use crate::diagnostic::{Diagnostic, Severity};
use crate::error::{BuildError, BuildResult};
use crate::worker::output_path_for;
use polyemit_config::{CompilerOptions, ModuleKind};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Marker that makes [`MockTranspiler`] panic
pub const CRASH_MARKER: &str = "__crash__";

/// Failure injected into emit or transpile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitFault {
    Panic,
    Error,
}

struct Patterns {
    import: Regex,
    export_star: Regex,
    export_const: Regex,
    directive: Regex,
    unused: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |pattern: &str| {
            Regex::new(pattern).unwrap_or_else(|e| panic!("invalid mock pattern {}: {}", pattern, e))
        };
        Patterns {
            import: compile(r#"^\s*import\s*\{([^}]*)\}\s*from\s*(['"])([^'"]+)['"]\s*;?\s*$"#),
            export_star: compile(r#"^\s*export\s*\*\s*from\s*(['"])([^'"]+)['"]\s*;?\s*$"#),
            export_const: compile(r"^\s*export\s+const\s+([A-Za-z_$][\w$]*)\s*(?::\s*([^=]+?))?\s*=\s*(.+?)\s*;?\s*$"),
            directive: compile(r"^\s*//\s*@(error|warning)\s+TS(\d+)\s+(.*)$"),
            unused: compile(r"^\s*//\s*@unused\s+(\S+)"),
        }
    })
}

/// `./x` and `./x.ts` become `./x.js`; bare specifiers are left alone
fn normalize_specifier(specifier: &str) -> String {
    if !(specifier.starts_with("./") || specifier.starts_with("../")) {
        return specifier.to_string();
    }
    if specifier.ends_with(".js") {
        specifier.to_string()
    } else if let Some(stem) = specifier.strip_suffix(".ts") {
        format!("{}.js", stem)
    } else {
        format!("{}.js", specifier)
    }
}

/// JavaScript for `text` in the given module format
pub fn transpile_text(text: &str, module_kind: Option<ModuleKind>) -> String {
    let patterns = patterns();
    let es_module = module_kind.is_some_and(|kind| kind.is_es_module());
    let mut out = String::new();

    if !es_module {
        if let Some(kind) = module_kind.filter(|kind| *kind != ModuleKind::CommonJs) {
            out.push_str(&format!("// {} module\n", kind));
        }
        out.push_str("\"use strict\";\n");
        out.push_str("Object.defineProperty(exports, \"__esModule\", { value: true });\n");
    }

    for line in text.lines() {
        if line.trim_start().starts_with("// @") {
            continue;
        }

        if let Some(caps) = patterns.import.captures(line) {
            let quote = &caps[2];
            let specifier = normalize_specifier(&caps[3]);
            if es_module {
                out.push_str(&format!(
                    "import {{{}}} from {}{}{};\n",
                    &caps[1], quote, specifier, quote
                ));
            } else {
                let bindings = caps[1].replace(" as ", ": ");
                out.push_str(&format!(
                    "const {{{}}} = require({}{}{});\n",
                    bindings, quote, specifier, quote
                ));
            }
        } else if let Some(caps) = patterns.export_star.captures(line) {
            let quote = &caps[1];
            let specifier = normalize_specifier(&caps[2]);
            if es_module {
                out.push_str(&format!("export * from {}{}{};\n", quote, specifier, quote));
            } else {
                out.push_str(&format!(
                    "Object.assign(exports, require({}{}{}));\n",
                    quote, specifier, quote
                ));
            }
        } else if let Some(caps) = patterns.export_const.captures(line) {
            let (name, value) = (&caps[1], &caps[3]);
            if es_module {
                out.push_str(&format!("export const {} = {};\n", name, value));
            } else {
                out.push_str(&format!("const {} = {};\nexports.{} = {};\n", name, value, name, name));
            }
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }

    out
}

/// Declaration file text for `text`
pub fn declaration_text(text: &str) -> String {
    let patterns = patterns();
    let mut out = String::new();

    for line in text.lines() {
        if let Some(caps) = patterns.export_const.captures(line) {
            let value = &caps[3];
            let ty = caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_else(|| {
                if value.parse::<f64>().is_ok() {
                    "number".to_string()
                } else if value.starts_with('"') || value.starts_with('\'') {
                    "string".to_string()
                } else {
                    "any".to_string()
                }
            });
            out.push_str(&format!("export declare const {}: {};\n", &caps[1], ty));
        } else if patterns.export_star.is_match(line) || patterns.import.is_match(line) {
            out.push_str(line.trim());
            out.push('\n');
        }
    }

    if out.is_empty() {
        out.push_str("export {};\n");
    }
    out
}

fn source_map(js_path: &Path, source: &Path) -> String {
    let file = js_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let source = js_path
        .parent()
        .and_then(|dir| pathdiff::diff_paths(source, dir))
        .unwrap_or_else(|| source.to_path_buf());
    serde_json::json!({
        "version": 3,
        "file": file,
        "sourceRoot": "",
        "sources": [source.to_string_lossy().replace('\\', "/")],
        "names": [],
        "mappings": ""
    })
    .to_string()
}

fn source_map_comment(js_path: &Path) -> String {
    let name = js_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("//# sourceMappingURL={}.map\n", name)
}

/// Diagnostics that need no other file
fn syntactic_diagnostics(file: &SourceFile) -> Vec<Diagnostic> {
    let patterns = patterns();
    let mut diagnostics = Vec::new();
    let mut offset = 0;

    for line in file.text.split_inclusive('\n') {
        let (line_number, _) = file.line_and_column(offset);
        let column = line.len() - line.trim_start().len() + 1;

        if let Some(caps) = patterns.directive.captures(line.trim_end()) {
            let severity = if &caps[1] == "error" {
                Severity::Error
            } else {
                Severity::Warning
            };
            let code = caps[2].parse().unwrap_or(0);
            diagnostics.push(
                Diagnostic::new(severity, code, caps[3].trim())
                    .at(&file.path, line_number, column as u32),
            );
        } else if let Some(caps) = patterns.unused.captures(line) {
            diagnostics.push(
                Diagnostic::error(6133, format!("'{}' is declared but its value is never read.", &caps[1]))
                    .at(&file.path, line_number, column as u32)
                    .unnecessary(),
            );
        }
        offset += line.len();
    }

    diagnostics
}

fn resolves(host: &dyn CompilerHost, importer: &Path, specifier: &str) -> bool {
    if !(specifier.starts_with("./") || specifier.starts_with("../")) {
        return true;
    }
    let dir = importer.parent().unwrap_or_else(|| Path::new("."));
    let stem = specifier
        .strip_suffix(".js")
        .or_else(|| specifier.strip_suffix(".ts"))
        .unwrap_or(specifier);
    let base = polyemit_config::normalize_path(&dir.join(stem));

    ["ts", "tsx", "d.ts"]
        .iter()
        .map(|ext| PathBuf::from(format!("{}.{}", base.display(), ext)))
        .chain(std::iter::once(base.join("index.ts")))
        .any(|candidate| host.file_exists(&candidate))
}

/// Compiler double with fault injection and call counters
#[derive(Default)]
pub struct MockCompiler {
    programs_created: AtomicUsize,
    incremental_reuses: AtomicUsize,
    emit_fault: SharedFault,
    transpile_fault: Arc<Mutex<Option<EmitFault>>>,
}

type SharedFault = Arc<Mutex<Option<(ModuleKind, EmitFault)>>>;

impl MockCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every emit of `module_kind` from now on
    pub fn fail_emit(&self, module_kind: ModuleKind, fault: EmitFault) {
        *self.emit_fault.lock().unwrap_or_else(PoisonError::into_inner) = Some((module_kind, fault));
    }

    /// Fail every isolated transpile from now on
    pub fn fail_transpile(&self, fault: EmitFault) {
        *self.transpile_fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(fault);
    }

    pub fn clear_faults(&self) {
        *self.emit_fault.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.transpile_fault.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn programs_created(&self) -> usize {
        self.programs_created.load(Ordering::SeqCst)
    }

    /// Programs created from a previous program
    pub fn incremental_reuses(&self) -> usize {
        self.incremental_reuses.load(Ordering::SeqCst)
    }
}

impl Compiler for MockCompiler {
    fn create_program(
        &self,
        request: ProgramRequest,
        previous: Option<Box<dyn Program>>,
    ) -> BuildResult<Box<dyn Program>> {
        self.programs_created.fetch_add(1, Ordering::SeqCst);
        let host = request.host.as_ref();

        let mut files = Vec::new();
        let mut diagnostics = Vec::new();
        for path in &request.root_files {
            match host.get_source_file(path) {
                Some(file) => files.push(file),
                None => diagnostics.push(Diagnostic::error(
                    6053,
                    format!("File '{}' not found.", path.display()),
                )),
            }
        }

        let patterns = patterns();
        for file in &files {
            diagnostics.extend(syntactic_diagnostics(file));
            for (index, line) in file.text.lines().enumerate() {
                let specifier = patterns
                    .import
                    .captures(line)
                    .map(|caps| caps[3].to_string())
                    .or_else(|| patterns.export_star.captures(line).map(|caps| caps[2].to_string()));
                if let Some(specifier) = specifier {
                    if !resolves(host, &file.path, &specifier) {
                        diagnostics.push(
                            Diagnostic::error(
                                2307,
                                format!(
                                    "Cannot find module '{}' or its corresponding type declarations.",
                                    specifier
                                ),
                            )
                            .at(&file.path, index as u32 + 1, 1),
                        );
                    }
                }
            }
        }

        let affected = match &previous {
            Some(previous) if previous.options() == &request.options => {
                self.incremental_reuses.fetch_add(1, Ordering::SeqCst);
                let old_files = previous.source_files();
                let pending: BTreeSet<PathBuf> = previous.affected_files().into_iter().collect();
                files
                    .iter()
                    .filter(|file| {
                        pending.contains(&file.path)
                            || !old_files.iter().any(|old| Arc::ptr_eq(old, file))
                    })
                    .map(|file| file.path.clone())
                    .collect()
            }
            _ => files.iter().map(|file| file.path.clone()).collect(),
        };

        let root_dir = request
            .options
            .root_dir
            .clone()
            .or_else(|| common_source_directory(&request.root_files))
            .unwrap_or_else(|| {
                request
                    .config_path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default()
            });

        Ok(Box::new(MockProgram {
            module_kind: request.options.module,
            options: request.options,
            root_dir,
            files,
            affected,
            diagnostics,
            fault: Arc::clone(&self.emit_fault),
        }))
    }

    fn transpiler(&self) -> Arc<dyn Transpiler> {
        Arc::new(MockTranspiler {
            fault: Arc::clone(&self.transpile_fault),
        })
    }
}

/// Program produced by [`MockCompiler`]
pub struct MockProgram {
    options: CompilerOptions,
    module_kind: Option<ModuleKind>,
    root_dir: PathBuf,
    files: Vec<Arc<SourceFile>>,
    affected: BTreeSet<PathBuf>,
    diagnostics: Vec<Diagnostic>,
    fault: SharedFault,
}

impl Program for MockProgram {
    fn options(&self) -> &CompilerOptions {
        &self.options
    }

    fn set_options(&mut self, options: CompilerOptions) {
        self.options = options;
    }

    fn module_kind(&self) -> Option<ModuleKind> {
        self.module_kind
    }

    fn set_module_kind(&mut self, module_kind: Option<ModuleKind>) {
        self.module_kind = module_kind;
    }

    fn source_files(&self) -> Vec<Arc<SourceFile>> {
        self.files.clone()
    }

    fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.clone()
    }

    fn affected_files(&self) -> Vec<PathBuf> {
        self.affected.iter().cloned().collect()
    }

    fn emit(&mut self, write_file: &mut dyn FnMut(OutputFile)) -> BuildResult<ProgramEmit> {
        let fault = *self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        match (fault, self.module_kind) {
            (Some((kind, EmitFault::Panic)), Some(current)) if kind == current => {
                panic!("emit failed for module kind {}", kind)
            }
            (Some((kind, EmitFault::Error)), Some(current)) if kind == current => {
                return Err(BuildError::compiler(format!("emit failed for module kind {}", kind)));
            }
            _ => {}
        }

        if self.options.no_emit {
            return Ok(ProgramEmit {
                emit_skipped: true,
                ..Default::default()
            });
        }

        let out_dir = self.options.out_dir.clone().unwrap_or_else(|| self.root_dir.clone());
        let declaration_dir = self.options.declaration_dir.clone().unwrap_or_else(|| out_dir.clone());
        let mut result = ProgramEmit::default();

        for file in &self.files {
            if !self.affected.contains(&file.path) {
                continue;
            }
            let Some(js_path) = output_path_for(&file.path, &self.root_dir, &out_dir) else {
                continue;
            };

            if !self.options.emit_declaration_only {
                let mut text = transpile_text(&file.text, self.module_kind);
                if self.options.source_map {
                    text.push_str(&source_map_comment(&js_path));
                    let map_path = PathBuf::from(format!("{}.map", js_path.display()));
                    write_file(OutputFile::new(map_path, source_map(&js_path, &file.path)));
                }
                write_file(OutputFile::new(js_path.clone(), text));
            }

            if self.options.declaration || self.options.emit_declaration_only {
                if let Some(dts_path) = output_path_for(&file.path, &self.root_dir, &declaration_dir) {
                    write_file(OutputFile::new(dts_path.with_extension("d.ts"), declaration_text(&file.text)));
                }
            }

            result.emitted_sources.insert(file.path.clone());
        }

        Ok(result)
    }

    fn commit_emit(&mut self) {
        self.affected.clear();
    }

    fn mark_pending(&mut self, files: &[PathBuf]) {
        for path in files {
            if self.files.iter().any(|file| &file.path == path) {
                self.affected.insert(path.clone());
            }
        }
    }
}

/// Transpiler produced by [`MockCompiler`]
pub struct MockTranspiler {
    fault: Arc<Mutex<Option<EmitFault>>>,
}

impl Transpiler for MockTranspiler {
    fn transpile_module(
        &self,
        file: &Path,
        text: &str,
        options: &CompilerOptions,
    ) -> BuildResult<TranspileModuleOutput> {
        if text.contains(CRASH_MARKER) {
            panic!("transpiler crashed on {}", file.display());
        }
        let fault = *self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        match fault {
            Some(EmitFault::Panic) => panic!("transpile failed for {}", file.display()),
            Some(EmitFault::Error) => {
                return Err(BuildError::compiler(format!("transpile failed for {}", file.display())))
            }
            None => {}
        }

        let source = SourceFile::new(file, text);
        let diagnostics = syntactic_diagnostics(&source)
            .into_iter()
            .filter(|d| d.code < 2000)
            .collect();

        let mut output_text = transpile_text(text, options.module);
        let mut source_map_text = None;
        if options.source_map {
            let js_path = file.with_extension("js");
            output_text.push_str(&source_map_comment(&js_path));
            source_map_text = Some(source_map(&js_path, file));
        }

        Ok(TranspileModuleOutput {
            output_text,
            source_map_text,
            diagnostics,
        })
    }
}
