//! Writing emitted files
use crate::compiler::OutputFile;
use crate::error::{BuildError, BuildResult};
use crate::host::CachedFileSystem;
use crate::plan::ModuleKindFlavor;
use rayon::prelude::*;
use std::time::{Duration, Instant};

/// File name of the package type marker
pub const PACKAGE_MARKER_NAME: &str = "package.json";

/// Outcome of a write phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub files: usize,
    pub duration: Duration,
}

/// `package.json` files declaring the module type of each flavor folder
/// that asked for one
pub fn package_markers(flavors: &[ModuleKindFlavor]) -> BuildResult<Vec<OutputFile>> {
    flavors
        .iter()
        .filter(|flavor| flavor.emit_package_marker)
        .map(|flavor| {
            let marker = serde_json::json!({ "type": flavor.module_kind.package_type() });
            let text = serde_json::to_string_pretty(&marker)
                .map_err(|e| BuildError::compiler(format!("failed to serialize package marker: {}", e)))?;
            Ok(OutputFile::new(
                flavor.output_folder.join(PACKAGE_MARKER_NAME),
                format!("{}\n", text),
            ))
        })
        .collect()
}

/// Write `files` with at most `max_parallelism` concurrent writes
pub fn write_outputs(
    files: &[OutputFile],
    fs: &CachedFileSystem,
    max_parallelism: usize,
) -> BuildResult<WriteSummary> {
    let started = Instant::now();
    if files.is_empty() {
        return Ok(WriteSummary::default());
    }

    let threads = max_parallelism.clamp(1, files.len());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("polyemit-write-{}", i))
        .build()
        .map_err(|e| BuildError::Io(std::io::Error::other(e)))?;

    pool.install(|| {
        files
            .par_iter()
            .try_for_each(|file| fs.write_file(&file.path, &file.text))
    })?;

    Ok(WriteSummary {
        files: files.len(),
        duration: started.elapsed(),
    })
}
