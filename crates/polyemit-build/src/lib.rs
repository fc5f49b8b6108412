//! Incremental multi-target build orchestration
//!
//! Drives a type-checking compiler through one check per pass, then emits
//! the checked program once per output flavor (module format, output
//! folder, file extension). Provides:
//! - Compiler tool loading and capability detection
//! - Flavor planning with conflict detection
//! - Multi-emit with per-flavor option overrides
//! - A background transpile worker for changed files
//! - Diagnostic classification and reporting
//! - Build, watch and solution (project reference) modes

pub mod build_order;
pub mod compiler;
pub mod diagnostic;
pub mod error;
pub mod host;
pub mod logger;
pub mod multi_emit;
pub mod orchestrator;
pub mod output;
pub mod plan;
pub mod reporter;
pub mod solution;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tool;
pub mod watch;
pub mod worker;

use std::sync::Once;

// Re-export main types
pub use build_order::{ProjectGraph, ProjectNode};
pub use compiler::{
    Compiler, CompilerHost, OutputFile, Program, ProgramEmit, ProgramRequest, SourceFile,
    TranspileModuleOutput, Transpiler,
};
pub use diagnostic::{Diagnostic, Severity};
pub use error::{BuildError, BuildResult, ErrorKind};
pub use host::{CachedFileSystem, CachingHost, SourceFileCache};
pub use logger::{CapturingLogger, LogEntry, ScopedLogger, TracingLogger};
pub use multi_emit::{multi_emit, EmitMode, EmitPlan, MergedEmitResult};
pub use orchestrator::{BuildMode, BuildOrchestrator, ChangedFiles, OrchestratorState, PassSummary};
pub use plan::{plan_flavors, FlavorPlan, ModuleKindFlavor, RejectedFlavor};
pub use reporter::{DiagnosticCounts, DiagnosticReporter};
pub use solution::{ProjectStatus, SolutionBuilder, SolutionOutput};
pub use tool::{BuildToolHandle, Capabilities, CompilerToolLoader, LoadedTool};
pub use watch::{WatchSession, WatchStats};
pub use worker::{PendingTranspile, TranspileOutput, TranspileWorkerPool};

// Re-export polyemit-config types for convenience
pub use polyemit_config::{BuildSettings, CompilerOptions, ModuleKind};

static TRACING_INIT: Once = Once::new();

/// Install a `tracing` subscriber filtered by `RUST_LOG`
///
/// Does nothing when `RUST_LOG` is unset. Safe to call more than once.
/// Enable with `RUST_LOG=polyemit_build=debug`.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        if std::env::var("RUST_LOG").is_ok() {
            let filter = EnvFilter::from_default_env();
            let _ = tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(filter)
                .try_init();
        }
    });
}
