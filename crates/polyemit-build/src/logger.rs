//! Reporting interface to the surrounding task runner

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Sink for everything a build pass reports
pub trait ScopedLogger: Send + Sync {
    /// A fatal condition for the pass
    fn emit_error(&self, error: &dyn std::error::Error);

    /// A recoverable condition
    fn emit_warning(&self, warning: &dyn std::error::Error);

    fn write_line(&self, line: &str);

    /// Timings and other details shown only in verbose mode
    fn write_verbose_line(&self, line: &str);
}

/// Logger that forwards to `tracing`
#[derive(Debug, Clone)]
pub struct TracingLogger {
    scope: String,
}

impl TracingLogger {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new("polyemit")
    }
}

impl ScopedLogger for TracingLogger {
    fn emit_error(&self, error: &dyn std::error::Error) {
        tracing::error!(scope = %self.scope, "{}", error);
    }

    fn emit_warning(&self, warning: &dyn std::error::Error) {
        tracing::warn!(scope = %self.scope, "{}", warning);
    }

    fn write_line(&self, line: &str) {
        tracing::info!(scope = %self.scope, "{}", line);
    }

    fn write_verbose_line(&self, line: &str) {
        tracing::debug!(scope = %self.scope, "{}", line);
    }
}

/// Run `f` and write `<label>: <n>ms` as a verbose line
pub fn measure<T>(logger: &dyn ScopedLogger, label: &str, f: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let result = f();
    logger.write_verbose_line(&format!("{}: {}ms", label, started.elapsed().as_millis()));
    result
}

/// One recorded logger call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Error(String),
    Warning(String),
    Line(String),
    Verbose(String),
}

/// Logger that records every call
#[derive(Debug, Default)]
pub struct CapturingLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl CapturingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.collect(|entry| match entry {
            LogEntry::Error(text) => Some(text),
            _ => None,
        })
    }

    pub fn warnings(&self) -> Vec<String> {
        self.collect(|entry| match entry {
            LogEntry::Warning(text) => Some(text),
            _ => None,
        })
    }

    pub fn lines(&self) -> Vec<String> {
        self.collect(|entry| match entry {
            LogEntry::Line(text) => Some(text),
            _ => None,
        })
    }

    pub fn verbose_lines(&self) -> Vec<String> {
        self.collect(|entry| match entry {
            LogEntry::Verbose(text) => Some(text),
            _ => None,
        })
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn collect(&self, select: impl Fn(LogEntry) -> Option<String>) -> Vec<String> {
        self.entries().into_iter().filter_map(select).collect()
    }

    fn push(&self, entry: LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

impl ScopedLogger for CapturingLogger {
    fn emit_error(&self, error: &dyn std::error::Error) {
        self.push(LogEntry::Error(error.to_string()));
    }

    fn emit_warning(&self, warning: &dyn std::error::Error) {
        self.push(LogEntry::Warning(warning.to_string()));
    }

    fn write_line(&self, line: &str) {
        self.push(LogEntry::Line(line.to_string()));
    }

    fn write_verbose_line(&self, line: &str) {
        self.push(LogEntry::Verbose(line.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capturing_logger_records_in_order() {
        let logger = CapturingLogger::new();
        logger.write_line("first");
        logger.emit_error(&std::io::Error::other("boom"));
        logger.write_verbose_line("Emit: 3ms");

        assert_eq!(
            logger.entries(),
            vec![
                LogEntry::Line("first".into()),
                LogEntry::Error("boom".into()),
                LogEntry::Verbose("Emit: 3ms".into()),
            ]
        );
        assert_eq!(logger.errors(), vec!["boom".to_string()]);
        assert!(logger.warnings().is_empty());

        logger.clear();
        assert!(logger.entries().is_empty());
    }

    #[test]
    fn test_measure_writes_verbose_line() {
        let logger = CapturingLogger::new();
        let value = measure(&logger, "Configure", || 7);

        assert_eq!(value, 7);
        let lines = logger.verbose_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Configure: "));
        assert!(lines[0].ends_with("ms"));
    }
}
