//! Build orchestration across the three build modes
//!
//! A [`BuildOrchestrator`] owns one [`BuildToolHandle`] for its whole life.
//! Every call to [`BuildOrchestrator::invoke`] runs one pass:
//!
//! 1. Load the project configuration and plan the output flavors
//! 2. Create the checked program, reusing the previous one when possible
//! 3. Optionally hand changed files to the transpile worker
//! 4. Emit every flavor, then wait for the worker
//! 5. Write outputs, report diagnostics and notify the caller
//!
//! Compiler diagnostics never fail a pass; they are reported and counted.
//! Configuration, capability and invariant failures abort the pass with an
//! error and leave the orchestrator usable for the next one.

use crate::compiler::{common_source_directory, Compiler, CompilerHost, OutputFile, Program, ProgramRequest};
use crate::diagnostic::Diagnostic;
use crate::error::{BuildError, BuildResult};
use crate::host::CachingHost;
use crate::logger::{measure, ScopedLogger};
use crate::multi_emit::{multi_emit, EmitMode, EmitPlan};
use crate::output::{package_markers, write_outputs};
use crate::plan::{plan_flavors, RejectedFlavor};
use crate::reporter::{DiagnosticCounts, DiagnosticReporter};
use crate::solution::{NoFilesEmitted, SolutionBuilder, SolutionContext, SolutionOutput};
use crate::tool::{BuildToolHandle, CompilerToolLoader, LoadedTool};
use crate::worker::{output_path_for, TranspileWorkerPool};
use polyemit_config::{BuildSettings, ConfigLoader, IncrementalCacheKey, ParsedConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// How the orchestrator is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// One pass per invocation
    Build,
    /// Passes driven by file system changes
    Watch,
    /// The project and everything it references
    Solution,
}

/// Where the orchestrator is in its life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Uninitialized,
    Building,
    SolutionBuilding,
    WatchIdle,
    WatchReacting,
}

/// Files changed since the previous pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedFiles {
    paths: BTreeSet<PathBuf>,
}

impl ChangedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>) -> bool {
        self.paths.insert(path.into())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.paths.iter()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for ChangedFiles {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Self {
            paths: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub counts: DiagnosticCounts,
    pub files_written: usize,

    /// Sources re-emitted by this pass
    pub changed_sources: BTreeSet<PathBuf>,
    pub emit_skipped: bool,
}

impl PassSummary {
    pub fn succeeded(&self) -> bool {
        !self.counts.has_errors()
    }
}

/// Notice for a worker request that cannot be honored
#[derive(Debug, Error)]
#[error("use_transpiler_worker requires the isolatedModules compiler option; falling back to a full emit")]
pub struct WorkerNeedsIsolatedModules;

/// Called once per emitted program with the sources it re-emitted
pub type ChangedFilesCallback = Box<dyn FnMut(&dyn Program, &BTreeSet<PathBuf>) + Send>;

/// Top-level build state machine
pub struct BuildOrchestrator {
    settings: BuildSettings,
    mode: BuildMode,
    compiler: Arc<dyn Compiler>,
    logger: Arc<dyn ScopedLogger>,
    state: OrchestratorState,
    handle: Option<BuildToolHandle>,
    config_loader: ConfigLoader,
    reporter: DiagnosticReporter,
    solution: Option<SolutionBuilder>,
    on_changed_files: Option<ChangedFilesCallback>,

    /// Output folders of the last planned pass
    output_folders: Vec<PathBuf>,
}

impl BuildOrchestrator {
    pub fn new(
        settings: BuildSettings,
        mode: BuildMode,
        compiler: Arc<dyn Compiler>,
        logger: Arc<dyn ScopedLogger>,
    ) -> Self {
        let cache_key = IncrementalCacheKey::from_additional_kinds(&settings.additional_module_kinds_to_emit);
        let config_loader = ConfigLoader::new().with_incremental_cache(settings.metadata_folder(), cache_key);
        let reporter = DiagnosticReporter::new(&settings.build_folder);

        Self {
            settings,
            mode,
            compiler,
            logger,
            state: OrchestratorState::Uninitialized,
            handle: None,
            config_loader,
            reporter,
            solution: None,
            on_changed_files: None,
            output_folders: Vec::new(),
        }
    }

    /// Register the changed-files callback
    pub fn on_changed_files(
        mut self,
        callback: impl FnMut(&dyn Program, &BTreeSet<PathBuf>) + Send + 'static,
    ) -> Self {
        self.on_changed_files = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub fn logger(&self) -> &Arc<dyn ScopedLogger> {
        &self.logger
    }

    /// Folders written by the last pass
    pub fn output_folders(&self) -> &[PathBuf] {
        &self.output_folders
    }

    /// The tool handle, once the first invocation created it
    pub fn handle(&self) -> Option<&BuildToolHandle> {
        self.handle.as_ref()
    }

    /// Run one pass
    ///
    /// `changed` lists the files modified since the previous pass; their
    /// cached text and parsed form are dropped first.
    pub async fn invoke(&mut self, changed: Option<&ChangedFiles>) -> BuildResult<PassSummary> {
        let mut handle = match self.handle.take() {
            Some(handle) => handle,
            None => self.create_handle()?,
        };

        if let Some(changed) = changed {
            let paths: Vec<PathBuf> = changed.paths().cloned().collect();
            handle.evict_changed(&paths);
            for path in &paths {
                self.config_loader.invalidate_path(path);
            }
        }
        handle.diagnostics.clear();

        let result = match self.mode {
            BuildMode::Build => {
                self.state = OrchestratorState::Building;
                self.build_pass(&mut handle).await
            }
            BuildMode::Watch => {
                self.state = OrchestratorState::WatchReacting;
                let result = self.build_pass(&mut handle).await;
                self.state = OrchestratorState::WatchIdle;
                result
            }
            BuildMode::Solution => {
                self.state = OrchestratorState::SolutionBuilding;
                self.solution_pass(&mut handle)
            }
        };

        self.handle = Some(handle);
        result
    }

    /// Stop the transpile worker; a later pass starts a new one
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.handle.as_mut().and_then(|handle| handle.worker.as_mut()) {
            worker.shutdown();
        }
    }

    fn create_handle(&self) -> BuildResult<BuildToolHandle> {
        let tool = CompilerToolLoader::load(
            &self.settings.tool_folder(),
            Arc::clone(&self.compiler),
            self.mode == BuildMode::Solution,
            self.logger.as_ref(),
        )?;
        if !tool.capabilities.incremental_program {
            self.logger.write_verbose_line(&format!(
                "Compiler version {} cannot reuse programs; every pass builds from scratch",
                tool.version
            ));
        }

        let mut handle = BuildToolHandle::new();
        handle.install(tool)?;
        Ok(handle)
    }

    fn host(&self, handle: &BuildToolHandle) -> Arc<dyn CompilerHost> {
        Arc::new(CachingHost::new(
            Arc::clone(&handle.fs),
            Arc::clone(&handle.sources),
            self.settings.build_folder.clone(),
        ))
    }

    async fn build_pass(&mut self, handle: &mut BuildToolHandle) -> BuildResult<PassSummary> {
        let tool = handle.tool()?.clone();
        let logger = Arc::clone(&self.logger);

        let project_path = self.settings.project_path();
        let (config, plan) = measure(logger.as_ref(), "Configure", || -> BuildResult<_> {
            let config = self.config_loader.load(&project_path)?;
            let plan = plan_flavors(
                &config,
                &self.settings.build_folder,
                &self.settings.additional_module_kinds_to_emit,
                self.settings.emit_cjs_extension_for_commonjs,
                self.settings.emit_mjs_extension_for_esmodule,
            )?;
            Ok((config, plan))
        })?;
        handle
            .diagnostics
            .extend(plan.rejected.iter().map(RejectedFlavor::to_diagnostic));
        self.output_folders = plan.flavors.iter().map(|f| f.output_folder.clone()).collect();
        self.output_folders.extend(config.options.declaration_dir.clone());

        let previous = if tool.capabilities.incremental_program {
            handle.program.take()
        } else {
            handle.program = None;
            None
        };
        let request = ProgramRequest {
            config_path: config.config_path.clone(),
            root_files: config.files.clone(),
            options: config.options.clone(),
            project_references: config.project_references.clone(),
            host: self.host(handle),
        };
        let mut program = measure(logger.as_ref(), "Program", || tool.compiler.create_program(request, previous))?;

        let analysis = measure(logger.as_ref(), "Analyze", || program.diagnostics());
        handle.diagnostics.extend(analysis);

        let use_worker = if self.settings.use_transpiler_worker && !config.options.isolated_modules {
            logger.emit_warning(&WorkerNeedsIsolatedModules);
            false
        } else {
            self.settings.use_transpiler_worker
        };

        let mut dispatched = BTreeSet::new();
        let pending = if use_worker {
            let root_dir = effective_root_dir(&config);
            let changed_files = self.changed_sources(handle, program.as_ref(), &root_dir);
            dispatched = changed_files.keys().cloned().collect();

            let mut options = program.options().clone();
            options.root_dir = Some(root_dir);
            let worker = handle
                .worker
                .get_or_insert_with(|| TranspileWorkerPool::new(tool.compiler.transpiler()));
            Some(worker.queue_transpile(options, changed_files, plan.flavors.clone()))
        } else {
            None
        };

        let mode = if pending.is_some() {
            EmitMode::DeclarationOnly
        } else {
            EmitMode::Full
        };
        let emitted = measure(logger.as_ref(), "Emit", || {
            multi_emit(program.as_mut(), &EmitPlan::new(plan.flavors.clone(), mode))
        });
        let mut merged = match emitted {
            Ok(merged) => merged,
            Err(error) => {
                handle.program = Some(program);
                return Err(error);
            }
        };
        handle.diagnostics.append(&mut merged.diagnostics);
        let mut files: Vec<OutputFile> = std::mem::take(&mut merged.files_to_write);

        if let Some(pending) = pending {
            match pending.await {
                Ok(output) => {
                    for line in output.timing_report() {
                        logger.write_verbose_line(&line);
                    }
                    files.extend(output.files);
                    handle.diagnostics.extend(output.diagnostics);
                }
                Err(error) => {
                    // Declarations were committed; the JavaScript was not
                    let retry: Vec<PathBuf> = std::mem::take(&mut dispatched).into_iter().collect();
                    program.mark_pending(&retry);
                    handle.diagnostics.push(Diagnostic::from_failure(&error));
                }
            }
        }
        if !config.options.no_emit && !merged.emit_skipped {
            files.extend(package_markers(&plan.flavors)?);
        }

        let written = write_outputs(&files, &handle.fs, self.settings.max_write_parallelism)?;
        logger.write_verbose_line(&format!(
            "I/O Write: {}ms ({} files)",
            written.duration.as_millis(),
            written.files
        ));

        let counts = self.reporter.report(&handle.diagnostics, logger.as_ref());

        let mut changed_sources = merged.changed_sources;
        changed_sources.extend(dispatched);
        if let Some(callback) = self.on_changed_files.as_mut() {
            callback(program.as_ref(), &changed_sources);
        }
        handle.program = Some(program);

        Ok(PassSummary {
            counts,
            files_written: written.files,
            changed_sources,
            emit_skipped: merged.emit_skipped,
        })
    }

    fn solution_pass(&mut self, handle: &mut BuildToolHandle) -> BuildResult<PassSummary> {
        let tool = handle.tool()?.clone();
        let logger = Arc::clone(&self.logger);
        logger.write_verbose_line("Using solution mode");

        match self.solution.as_mut() {
            Some(solution) => {
                handle.fs.invalidate_all();
                handle.sources.clear();
                solution.invalidate_all(&mut self.config_loader)?;
            }
            None => {
                let root = self.settings.project_path();
                let solution = measure(logger.as_ref(), "Configure", || {
                    SolutionBuilder::new(&root, &mut self.config_loader)
                })?;
                self.solution = Some(solution);
            }
        }

        let host = self.host(handle);
        let output = self.run_solution(&tool, host)?;
        handle.diagnostics.extend(output.diagnostics);

        let written = write_outputs(&output.files_to_write, &handle.fs, self.settings.max_write_parallelism)?;
        logger.write_verbose_line(&format!(
            "I/O Write: {}ms ({} files)",
            written.duration.as_millis(),
            written.files
        ));

        let mut counts = self.reporter.report(&handle.diagnostics, logger.as_ref());
        if counts.warnings > 0 && counts.errors == 0 && self.settings.build_project_references {
            logger.emit_error(&NoFilesEmitted);
            counts.errors += 1;
        }

        Ok(PassSummary {
            counts,
            files_written: written.files,
            changed_sources: output
                .projects
                .into_iter()
                .flat_map(|project| project.changed_sources)
                .collect(),
            emit_skipped: false,
        })
    }

    fn run_solution(
        &mut self,
        tool: &LoadedTool,
        host: Arc<dyn CompilerHost>,
    ) -> BuildResult<SolutionOutput> {
        let Self {
            settings,
            logger,
            solution,
            on_changed_files,
            ..
        } = self;
        let Some(solution) = solution.as_mut() else {
            return Err(BuildError::invariant("solution builder was not created"));
        };

        let context = SolutionContext {
            tool,
            host,
            settings: &*settings,
            logger: logger.as_ref(),
        };
        let mut notify = |program: &dyn Program, changed: &BTreeSet<PathBuf>| {
            if let Some(callback) = on_changed_files.as_mut() {
                callback(program, changed);
            }
        };
        measure(logger.as_ref(), "Emit", || solution.build(&context, &mut notify))
    }

    /// Text of every affected source that produces JavaScript
    fn changed_sources(
        &self,
        handle: &BuildToolHandle,
        program: &dyn Program,
        root_dir: &Path,
    ) -> BTreeMap<PathBuf, String> {
        program
            .affected_files()
            .into_iter()
            .filter(|path| output_path_for(path, root_dir, root_dir).is_some())
            .filter_map(|path| {
                let text = handle.fs.read_file(&path)?;
                Some((path, text.to_string()))
            })
            .collect()
    }
}

/// `rootDir`, else the common folder of the sources, else the config folder
pub fn effective_root_dir(config: &ParsedConfig) -> PathBuf {
    config
        .options
        .root_dir
        .clone()
        .or_else(|| common_source_directory(&config.files))
        .unwrap_or_else(|| config.config_dir().to_path_buf())
}
