//! Multi-project builds over the project reference graph
//!
//! Projects are built in dependency order. A project whose checked
//! program reports an error fails, and every project depending on it,
//! directly or not, is skipped. Composite projects do not emit at all when
//! their raw diagnostics contain an error, even one the reporter later
//! downgrades to a warning.

use crate::build_order::ProjectGraph;
use crate::compiler::{CompilerHost, OutputFile, Program, ProgramRequest};
use crate::diagnostic::Diagnostic;
use crate::error::BuildResult;
use crate::logger::ScopedLogger;
use crate::multi_emit::{multi_emit, EmitMode, EmitPlan};
use crate::output::package_markers;
use crate::plan::{plan_flavors, RejectedFlavor};
use crate::tool::LoadedTool;
use polyemit_config::{BuildSettings, ConfigLoader};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Synthesized when a solution build reports warnings but no error
#[derive(Debug, Error)]
#[error("No files were emitted: warnings in a project reference build skip the emit of composite projects")]
pub struct NoFilesEmitted;

/// What happened to one project
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectStatus {
    Built,
    /// Checked, but emit was skipped because of errors
    EmitSkipped,
    /// Not checked because the given dependency failed
    UpstreamFailed(PathBuf),
}

/// Result of one project of a solution build
#[derive(Debug, Clone)]
pub struct ProjectOutcome {
    pub config_path: PathBuf,
    pub status: ProjectStatus,
    pub changed_sources: BTreeSet<PathBuf>,
}

/// Result of a whole solution build
#[derive(Debug, Clone, Default)]
pub struct SolutionOutput {
    pub projects: Vec<ProjectOutcome>,
    pub diagnostics: Vec<Diagnostic>,
    pub files_to_write: Vec<OutputFile>,
}

impl SolutionOutput {
    pub fn outcome(&self, config_path: &Path) -> Option<&ProjectOutcome> {
        self.projects.iter().find(|p| p.config_path == config_path)
    }
}

/// Everything a solution build borrows from its orchestrator
pub struct SolutionContext<'a> {
    pub tool: &'a LoadedTool,
    pub host: Arc<dyn CompilerHost>,
    pub settings: &'a BuildSettings,
    pub logger: &'a dyn ScopedLogger,
}

/// Builds a root project and everything it references
pub struct SolutionBuilder {
    root: PathBuf,
    graph: ProjectGraph,
    order: Vec<PathBuf>,
    programs: BTreeMap<PathBuf, Box<dyn Program>>,
}

impl SolutionBuilder {
    pub fn new(root: &Path, loader: &mut ConfigLoader) -> BuildResult<Self> {
        let graph = ProjectGraph::load(root, loader)?;
        let order = graph.build_order()?;
        Ok(Self {
            root: root.to_path_buf(),
            graph,
            order,
            programs: BTreeMap::new(),
        })
    }

    /// Configuration paths in build order
    pub fn build_order(&self) -> &[PathBuf] {
        &self.order
    }

    pub fn graph(&self) -> &ProjectGraph {
        &self.graph
    }

    /// Reload every project configuration from storage
    pub fn invalidate_all(&mut self, loader: &mut ConfigLoader) -> BuildResult<()> {
        loader.invalidate();
        self.graph = ProjectGraph::load(&self.root, loader)?;
        self.order = self.graph.build_order()?;
        self.programs
            .retain(|path, _| self.graph.get(path).is_some());
        Ok(())
    }

    /// Check and emit every project in order
    ///
    /// `on_emit` runs once per project that emitted.
    pub fn build(
        &mut self,
        context: &SolutionContext<'_>,
        on_emit: &mut dyn FnMut(&dyn Program, &BTreeSet<PathBuf>),
    ) -> BuildResult<SolutionOutput> {
        let mut output = SolutionOutput::default();
        let mut failed: BTreeSet<PathBuf> = BTreeSet::new();

        for config_path in self.order.clone() {
            let Some(project) = self.graph.get(&config_path) else {
                continue;
            };
            let display = pathdiff::diff_paths(&config_path, &context.settings.build_folder)
                .unwrap_or_else(|| config_path.clone());

            if let Some(upstream) = project.dependencies.iter().find(|d| failed.contains(*d)) {
                context.logger.write_verbose_line(&format!(
                    "Skipping project {} because its dependency {} has errors",
                    display.display(),
                    upstream.display()
                ));
                failed.insert(config_path.clone());
                output.projects.push(ProjectOutcome {
                    config_path,
                    status: ProjectStatus::UpstreamFailed(upstream.clone()),
                    changed_sources: BTreeSet::new(),
                });
                continue;
            }

            context
                .logger
                .write_verbose_line(&format!("Building project {}", display.display()));

            let config = project.config.clone();
            let plan = plan_flavors(
                &config,
                config.config_dir(),
                &context.settings.additional_module_kinds_to_emit,
                context.settings.emit_cjs_extension_for_commonjs,
                context.settings.emit_mjs_extension_for_esmodule,
            )?;
            output
                .diagnostics
                .extend(plan.rejected.iter().map(RejectedFlavor::to_diagnostic));

            let previous = if context.tool.capabilities.incremental_program {
                self.programs.remove(&config_path)
            } else {
                None
            };
            let mut program = context.tool.compiler.create_program(
                ProgramRequest {
                    config_path: config_path.clone(),
                    root_files: config.files.clone(),
                    options: config.options.clone(),
                    project_references: config.project_references.clone(),
                    host: Arc::clone(&context.host),
                },
                previous,
            )?;

            let diagnostics = program.diagnostics();
            let has_errors = diagnostics.iter().any(Diagnostic::is_error);
            output.diagnostics.extend(diagnostics);

            let status = if has_errors {
                failed.insert(config_path.clone());
                if config.options.composite {
                    ProjectStatus::EmitSkipped
                } else {
                    ProjectStatus::Built
                }
            } else {
                ProjectStatus::Built
            };

            let mut changed_sources = BTreeSet::new();
            if status == ProjectStatus::Built {
                let merged = multi_emit(program.as_mut(), &EmitPlan::new(plan.flavors.clone(), EmitMode::Full))?;
                output.diagnostics.extend(merged.diagnostics);
                output.files_to_write.extend(merged.files_to_write);
                if !config.options.no_emit {
                    output.files_to_write.extend(package_markers(&plan.flavors)?);
                }
                on_emit(program.as_ref(), &merged.changed_sources);
                changed_sources = merged.changed_sources;
            }

            self.programs.insert(config_path.clone(), program);
            output.projects.push(ProjectOutcome {
                config_path,
                status,
                changed_sources,
            });
        }

        Ok(output)
    }
}
