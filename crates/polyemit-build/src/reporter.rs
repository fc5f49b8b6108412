//! Diagnostic classification and formatting

use crate::diagnostic::{sort_and_dedupe, Diagnostic, Severity};
use crate::logger::ScopedLogger;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Codes reported by the compiler as errors that are cosmetic in practice:
/// unused declarations, parameters, imports and type parameters, a property
/// without initializer, and an implicit `any` index access
pub const DOWNGRADED_CODES: &[u32] = &[6133, 6138, 6192, 6196, 6198, 6199, 6205, 2564, 7053];

/// A formatted diagnostic handed to the logger
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ReportedDiagnostic(pub String);

/// Number of diagnostics reported per category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticCounts {
    pub errors: usize,
    pub warnings: usize,
}

impl DiagnosticCounts {
    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }
}

/// Reports diagnostics with paths relative to the build folder
#[derive(Debug, Clone)]
pub struct DiagnosticReporter {
    build_folder: PathBuf,
}

impl DiagnosticReporter {
    pub fn new(build_folder: impl Into<PathBuf>) -> Self {
        Self {
            build_folder: build_folder.into(),
        }
    }

    /// Severity after downgrading cosmetic errors
    pub fn adjusted_severity(diagnostic: &Diagnostic) -> Severity {
        if diagnostic.severity != Severity::Error {
            return diagnostic.severity;
        }
        if diagnostic.reports_unnecessary || DOWNGRADED_CODES.contains(&diagnostic.code) {
            Severity::Warning
        } else {
            Severity::Error
        }
    }

    /// Sort, dedupe and downgrade a raw diagnostic list
    pub fn classify(diagnostics: &[Diagnostic]) -> Vec<Diagnostic> {
        sort_and_dedupe(diagnostics.to_vec())
            .into_iter()
            .map(|mut diagnostic| {
                diagnostic.severity = Self::adjusted_severity(&diagnostic);
                diagnostic
            })
            .collect()
    }

    /// `<path>:<line>:<column> - (TS<code>) <message>` when located
    pub fn format(&self, diagnostic: &Diagnostic) -> String {
        match (&diagnostic.file, diagnostic.line, diagnostic.column) {
            (Some(file), Some(line), Some(column)) => format!(
                "{}:{}:{} - (TS{}) {}",
                self.relative(file),
                line,
                column,
                diagnostic.code,
                diagnostic.message
            ),
            _ => diagnostic.message.clone(),
        }
    }

    /// Print every diagnostic through `logger` and count them
    pub fn report(&self, diagnostics: &[Diagnostic], logger: &dyn ScopedLogger) -> DiagnosticCounts {
        let diagnostics = Self::classify(diagnostics);
        let mut counts = DiagnosticCounts::default();

        if diagnostics.is_empty() {
            return counts;
        }

        logger.write_line(&format!(
            "Encountered {} issue{}:",
            diagnostics.len(),
            if diagnostics.len() > 1 { "s" } else { "" }
        ));

        for diagnostic in &diagnostics {
            let text = self.format(diagnostic);
            match diagnostic.severity {
                Severity::Error => {
                    counts.errors += 1;
                    logger.emit_error(&ReportedDiagnostic(text));
                }
                Severity::Warning => {
                    counts.warnings += 1;
                    logger.emit_warning(&ReportedDiagnostic(text));
                }
                Severity::Suggestion | Severity::Message => logger.write_line(&text),
            }
        }

        counts
    }

    fn relative(&self, file: &Path) -> String {
        let relative = if file.is_absolute() {
            pathdiff::diff_paths(file, &self.build_folder).unwrap_or_else(|| file.to_path_buf())
        } else {
            file.to_path_buf()
        };
        relative.to_string_lossy().replace('\\', "/")
    }
}
