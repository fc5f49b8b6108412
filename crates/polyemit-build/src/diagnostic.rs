//! Compiler diagnostics
//!
//! Diagnostics are data, not errors: a pass collects them from analysis,
//! emit and the transpile worker, then merges and reports them at the end.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

/// Diagnostic category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Suggestion,
    Message,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Suggestion => write!(f, "suggestion"),
            Self::Message => write!(f, "message"),
        }
    }
}

/// A compiler diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: u32,
    pub message: String,

    /// Source file the diagnostic points into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// 1-based line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,

    /// 1-based column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,

    /// The diagnostic flags code that is never used
    #[serde(default)]
    pub reports_unnecessary: bool,
}

impl Diagnostic {
    pub fn new(severity: Severity, code: u32, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
            file: None,
            line: None,
            column: None,
            reports_unnecessary: false,
        }
    }

    pub fn error(code: u32, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message)
    }

    pub fn warning(code: u32, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, message)
    }

    /// Attach a source location
    pub fn at(mut self, file: impl Into<PathBuf>, line: u32, column: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    /// Mark the diagnostic as reporting unused code
    pub fn unnecessary(mut self) -> Self {
        self.reports_unnecessary = true;
        self
    }

    /// Convert a failure into an unlocated error diagnostic
    pub fn from_failure(error: &dyn std::error::Error) -> Self {
        Self::error(0, error.to_string())
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    fn sort_key(&self) -> (Option<&Path>, Option<u32>, Option<u32>, u32, Severity, &str) {
        (
            self.file.as_deref(),
            self.line,
            self.column,
            self.code,
            self.severity,
            &self.message,
        )
    }
}

impl Ord for Diagnostic {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then(self.reports_unnecessary.cmp(&other.reports_unnecessary))
    }
}

impl PartialOrd for Diagnostic {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort by location and drop exact duplicates
///
/// Unlocated diagnostics sort first.
pub fn sort_and_dedupe(mut diagnostics: Vec<Diagnostic>) -> Vec<Diagnostic> {
    diagnostics.sort();
    diagnostics.dedup();
    diagnostics
}
