//! Output flavor planning
//!
//! A flavor is one (module kind, output folder, extension) emit target.
//! The plan is computed once per loaded configuration and never changes
//! afterward.

use crate::diagnostic::Diagnostic;
use crate::error::{BuildError, BuildResult};
use polyemit_config::{normalize_path, AdditionalModuleKind, JsExtension, ModuleKind, ParsedConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One emit target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKindFlavor {
    pub module_kind: ModuleKind,
    pub output_folder: PathBuf,
    pub extension_override: Option<JsExtension>,

    /// Declarations and the changed-source set come from the primary flavor
    pub is_primary: bool,
    pub emit_package_marker: bool,
}

impl ModuleKindFlavor {
    pub fn effective_extension(&self) -> JsExtension {
        self.extension_override.unwrap_or(JsExtension::Js)
    }
}

/// A flavor left out of the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedFlavor {
    pub module_kind: ModuleKind,
    pub output_folder: PathBuf,
    pub reason: String,
}

impl RejectedFlavor {
    /// The rejection as a reportable error
    pub fn to_error(&self) -> BuildError {
        BuildError::configuration(self.reason.clone())
    }

    /// The rejection as an error diagnostic of the pass
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::from_failure(&self.to_error())
    }
}

/// Accepted flavors in emit order, plus the ones that were rejected
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlavorPlan {
    pub flavors: Vec<ModuleKindFlavor>,
    pub rejected: Vec<RejectedFlavor>,
}

impl FlavorPlan {
    pub fn primary(&self) -> Option<&ModuleKindFlavor> {
        self.flavors.iter().find(|f| f.is_primary)
    }
}

/// Which option put a module kind or folder into the plan
#[derive(Debug, Clone)]
struct Claim {
    module_kind: ModuleKind,
    output_folder: PathBuf,
    extension: JsExtension,
    option: &'static str,
}

struct Planner<'a> {
    build_folder: &'a Path,
    plan: FlavorPlan,
    kinds: HashMap<ModuleKind, Claim>,
}

impl<'a> Planner<'a> {
    fn resolve_folder(&self, folder: &Path) -> PathBuf {
        if folder.is_absolute() {
            normalize_path(folder)
        } else {
            normalize_path(&self.build_folder.join(folder))
        }
    }

    /// Check the folder invariants against every accepted flavor
    fn folder_conflict(&self, candidate: &ModuleKindFlavor) -> Option<String> {
        let extension = candidate.effective_extension();
        for existing in &self.plan.flavors {
            if existing.effective_extension() != extension {
                continue;
            }

            if existing.output_folder == candidate.output_folder {
                return Some(format!(
                    "Unable to output two different module kinds with the same module extension ({}) to the same folder (\"{}\").",
                    extension,
                    candidate.output_folder.display()
                ));
            }

            let nested = if candidate.output_folder.starts_with(&existing.output_folder) {
                Some((&existing.output_folder, &candidate.output_folder))
            } else if existing.output_folder.starts_with(&candidate.output_folder) {
                Some((&candidate.output_folder, &existing.output_folder))
            } else {
                None
            };

            if let Some((parent, child)) = nested {
                return Some(format!(
                    "Unable to output two different module kinds to nested folders (\"{}\" and \"{}\").",
                    parent.display(),
                    child.display()
                ));
            }
        }
        None
    }

    fn reject(&mut self, flavor: &ModuleKindFlavor, reason: String) {
        tracing::error!(module_kind = %flavor.module_kind, "{}", reason);
        self.plan.rejected.push(RejectedFlavor {
            module_kind: flavor.module_kind,
            output_folder: flavor.output_folder.clone(),
            reason,
        });
    }

    fn add(&mut self, flavor: ModuleKindFlavor, option: &'static str) -> BuildResult<bool> {
        if flavor.is_primary && self.plan.primary().is_some() {
            return Err(BuildError::invariant(format!(
                "module kind {} was planned as a second primary flavor",
                flavor.module_kind
            )));
        }

        if let Some(reason) = self.folder_conflict(&flavor) {
            self.reject(&flavor, reason);
            return Ok(false);
        }

        self.kinds.insert(
            flavor.module_kind,
            Claim {
                module_kind: flavor.module_kind,
                output_folder: flavor.output_folder.clone(),
                extension: flavor.effective_extension(),
                option,
            },
        );
        self.plan.flavors.push(flavor);
        Ok(true)
    }
}

/// Compute the flavors to emit for `config`
///
/// In order: a `.cjs` CommonJS flavor, a `.mjs` ESNext flavor, the
/// configuration's own module kind unless already covered, then each
/// additional kind. An additional kind that conflicts with an accepted
/// flavor is rejected on its own; the rest of the plan stands.
pub fn plan_flavors(
    config: &ParsedConfig,
    build_folder: &Path,
    extra_kinds: &[AdditionalModuleKind],
    cjs_extension: bool,
    esm_extension: bool,
) -> BuildResult<FlavorPlan> {
    let (Some(module_kind), Some(out_dir)) = (config.options.module, config.options.out_dir.as_deref())
    else {
        return Err(BuildError::configuration(
            "If the module compiler option is not provided, the build must be provided with additional_module_kinds_to_emit and the project configuration must set both module and outDir",
        ));
    };

    let mut planner = Planner {
        build_folder,
        plan: FlavorPlan::default(),
        kinds: HashMap::new(),
    };
    let out_dir = planner.resolve_folder(out_dir);

    if cjs_extension {
        planner.add(
            ModuleKindFlavor {
                module_kind: ModuleKind::CommonJs,
                output_folder: out_dir.clone(),
                extension_override: Some(JsExtension::Cjs),
                is_primary: module_kind == ModuleKind::CommonJs,
                emit_package_marker: false,
            },
            "emit_cjs_extension_for_commonjs",
        )?;
    }

    if esm_extension {
        planner.add(
            ModuleKindFlavor {
                module_kind: ModuleKind::EsNext,
                output_folder: out_dir.clone(),
                extension_override: Some(JsExtension::Mjs),
                is_primary: module_kind == ModuleKind::EsNext,
                emit_package_marker: false,
            },
            "emit_mjs_extension_for_esmodule",
        )?;
    }

    if !planner.kinds.contains_key(&module_kind) {
        planner.add(
            ModuleKindFlavor {
                module_kind,
                output_folder: out_dir,
                extension_override: None,
                is_primary: true,
                emit_package_marker: false,
            },
            "the project configuration",
        )?;
    }

    for extra in extra_kinds {
        let flavor = ModuleKindFlavor {
            module_kind: extra.module_kind,
            output_folder: planner.resolve_folder(&extra.out_folder_name),
            extension_override: extra.extension_override,
            is_primary: false,
            emit_package_marker: extra.emit_package_marker,
        };

        if let Some(existing) = planner.kinds.get(&extra.module_kind) {
            let reason = format!(
                "Module kind \"{}\" is already emitted at {} with extension '{}' by option {}.",
                existing.module_kind,
                existing.output_folder.display(),
                existing.extension,
                existing.option
            );
            planner.reject(&flavor, reason);
            continue;
        }

        planner.add(flavor, "additional_module_kinds_to_emit")?;
    }

    if planner.plan.primary().is_none() {
        return Err(BuildError::invariant("no primary flavor was planned"));
    }

    Ok(planner.plan)
}
