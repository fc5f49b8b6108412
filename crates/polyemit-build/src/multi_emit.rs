//! Emit one checked program once per flavor
//!
//! Type checking happens once. For each flavor the program's options and
//! module kind are swapped to the flavor's values, the program is emitted,
//! and the originals are put back. Outputs of flavors with an extension
//! override are renamed and their relative specifiers rewritten, because
//! the emitter always writes `.js`.

use crate::compiler::{OutputFile, Program};
use crate::diagnostic::{sort_and_dedupe, Diagnostic};
use crate::error::BuildResult;
use crate::plan::ModuleKindFlavor;
use polyemit_config::{CompilerOptions, JsExtension, ModuleKind};
use regex::{Captures, Regex};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// What a pass emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitMode {
    /// JavaScript and declarations
    #[default]
    Full,
    /// JavaScript only
    TranspileOnly,
    /// Declarations only; JavaScript comes from the transpile worker
    DeclarationOnly,
}

/// Flavors to emit and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitPlan {
    pub flavors: Vec<ModuleKindFlavor>,
    pub mode: EmitMode,
}

impl EmitPlan {
    pub fn new(flavors: Vec<ModuleKindFlavor>, mode: EmitMode) -> Self {
        Self { flavors, mode }
    }
}

/// Combined result of every flavor's emit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedEmitResult {
    pub emit_skipped: bool,
    pub diagnostics: Vec<Diagnostic>,

    /// Sources re-emitted by the primary flavor
    pub changed_sources: BTreeSet<PathBuf>,

    /// Outputs in flavor order
    pub files_to_write: Vec<OutputFile>,
}

/// Options for one flavor, or `None` when it would emit nothing
pub fn flavor_options(
    base: &CompilerOptions,
    flavor: &ModuleKindFlavor,
    mode: EmitMode,
) -> Option<CompilerOptions> {
    let mut options = base.clone();
    options.module = Some(flavor.module_kind);
    options.out_dir = Some(flavor.output_folder.clone());

    if !flavor.is_primary {
        options.declaration = false;
        options.declaration_map = false;
    }

    match mode {
        EmitMode::Full => {}
        EmitMode::TranspileOnly => {
            options.declaration = false;
            options.declaration_map = false;
            options.emit_declaration_only = false;
        }
        EmitMode::DeclarationOnly => {
            if !options.declaration {
                return None;
            }
            options.emit_declaration_only = true;
        }
    }

    Some(options)
}

/// Swaps a program to a flavor's options and restores the originals on
/// drop, including while unwinding
struct FlavorOverride<'p> {
    program: &'p mut dyn Program,
    saved: Option<(CompilerOptions, Option<ModuleKind>)>,
}

impl<'p> FlavorOverride<'p> {
    fn apply(program: &'p mut dyn Program, options: CompilerOptions, module_kind: ModuleKind) -> Self {
        let saved = (program.options().clone(), program.module_kind());
        program.set_options(options);
        program.set_module_kind(Some(module_kind));
        Self {
            program,
            saved: Some(saved),
        }
    }
}

impl Drop for FlavorOverride<'_> {
    fn drop(&mut self) {
        if let Some((options, module_kind)) = self.saved.take() {
            self.program.set_options(options);
            self.program.set_module_kind(module_kind);
        }
    }
}

/// Emit `program` once per flavor of `plan`
///
/// Flavors run one after another. Files pending emit are committed only
/// after every flavor succeeded.
pub fn multi_emit(program: &mut dyn Program, plan: &EmitPlan) -> BuildResult<MergedEmitResult> {
    let base_options = program.options().clone();
    let mut merged = MergedEmitResult::default();
    let mut diagnostics = Vec::new();

    for flavor in &plan.flavors {
        let Some(options) = flavor_options(&base_options, flavor, plan.mode) else {
            tracing::trace!(module_kind = %flavor.module_kind, "flavor has nothing to emit");
            continue;
        };

        let mut files = Vec::new();
        let emit = {
            let guard = FlavorOverride::apply(program, options, flavor.module_kind);
            let mut write_file =
                |file: OutputFile| files.push(rewrite_output(file, flavor.extension_override));
            guard.program.emit(&mut write_file)?
        };

        merged.emit_skipped |= emit.emit_skipped;
        diagnostics.extend(emit.diagnostics);
        if flavor.is_primary {
            merged.changed_sources = emit.emitted_sources;
        }
        merged.files_to_write.extend(files);
    }

    program.commit_emit();
    merged.diagnostics = sort_and_dedupe(diagnostics);
    Ok(merged)
}

fn specifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?P<prefix>(?:\brequire\s*\(|\bimport\s*\(|\bimport|\bfrom)\s*)(?P<quote>['"])(?P<spec>\.{1,2}/[^'"\n]*?)\.js(?P<end>['"])"#,
        )
        .expect("specifier pattern is valid")
    })
}

fn source_map_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?P<prefix>//# sourceMappingURL=)(?P<name>\S+?)\.js\.map")
            .expect("source map comment pattern is valid")
    })
}

fn source_map_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?P<prefix>"file"\s*:\s*")(?P<name>[^"]*)\.js""#)
            .expect("source map file pattern is valid")
    })
}

/// `x.js` becomes `x<ext>` and `x.js.map` becomes `x<ext>.map`
pub fn rewrite_output_path(path: &Path, extension: JsExtension) -> PathBuf {
    let text = path.to_string_lossy();
    if let Some(stem) = text.strip_suffix(".js.map") {
        PathBuf::from(format!("{}{}.map", stem, extension))
    } else if let Some(stem) = text.strip_suffix(".js") {
        PathBuf::from(format!("{}{}", stem, extension))
    } else {
        path.to_path_buf()
    }
}

/// Point relative `.js` specifiers and the source map comment at `extension`
pub fn rewrite_specifiers(text: &str, extension: JsExtension) -> String {
    let text = specifier_pattern().replace_all(text, |caps: &Captures| {
        format!(
            "{}{}{}{}{}",
            &caps["prefix"], &caps["quote"], &caps["spec"], extension, &caps["end"]
        )
    });
    source_map_url_pattern()
        .replace_all(&text, |caps: &Captures| {
            format!("{}{}{}.map", &caps["prefix"], &caps["name"], extension)
        })
        .into_owned()
}

/// Apply a flavor's extension override to one emitted file
pub fn rewrite_output(file: OutputFile, extension: Option<JsExtension>) -> OutputFile {
    let Some(extension) = extension.filter(|e| *e != JsExtension::Js) else {
        return file;
    };

    let name = file.path.to_string_lossy();
    if name.ends_with(".js.map") {
        let text = source_map_file_pattern()
            .replace_all(&file.text, |caps: &Captures| {
                format!("{}{}{}\"", &caps["prefix"], &caps["name"], extension)
            })
            .into_owned();
        OutputFile::new(rewrite_output_path(&file.path, extension), text)
    } else if name.ends_with(".js") {
        OutputFile::new(
            rewrite_output_path(&file.path, extension),
            rewrite_specifiers(&file.text, extension),
        )
    } else {
        file
    }
}
