//! Build orchestrator integration tests
//!
//! End-to-end passes over on-disk projects using the mock compiler

use polyemit_build::testing::{EmitFault, MockCompiler, ProjectFixture, CRASH_MARKER};
use polyemit_build::{
    BuildMode, BuildOrchestrator, BuildSettings, CapturingLogger, ChangedFiles, Compiler, ErrorKind,
    ModuleKind, Program,
};
use polyemit_config::{AdditionalModuleKind, JsExtension};
use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct TestProject {
    _temp_dir: TempDir,
    fixture: ProjectFixture,
    compiler: Arc<MockCompiler>,
    logger: Arc<CapturingLogger>,
}

impl TestProject {
    fn new(compiler_options: serde_json::Value) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let fixture = ProjectFixture::new(temp_dir.path());
        fixture.tool("5.4.5").unwrap();
        fixture
            .config("", json!({ "compilerOptions": compiler_options }))
            .unwrap();
        Self {
            _temp_dir: temp_dir,
            fixture,
            compiler: Arc::new(MockCompiler::new()),
            logger: Arc::new(CapturingLogger::new()),
        }
    }

    fn orchestrator(&self, settings: BuildSettings, mode: BuildMode) -> BuildOrchestrator {
        let compiler: Arc<dyn Compiler> = self.compiler.clone();
        BuildOrchestrator::new(settings, mode, compiler, self.logger.clone())
    }

    fn build(&self) -> BuildOrchestrator {
        self.orchestrator(self.fixture.settings(), BuildMode::Build)
    }
}

fn commonjs() -> serde_json::Value {
    json!({ "module": "commonjs", "outDir": "lib", "rootDir": "src" })
}

#[tokio::test]
async fn test_cjs_and_mjs_extensions() {
    let project = TestProject::new(commonjs());
    let fixture = &project.fixture;
    fixture.write("src/index.ts", "export * from './util';\n").unwrap();
    fixture.write("src/util.ts", "export const answer = 42;\n").unwrap();

    let mut settings = fixture.settings();
    settings.emit_cjs_extension_for_commonjs = true;
    settings.emit_mjs_extension_for_esmodule = true;
    let summary = project
        .orchestrator(settings, BuildMode::Build)
        .invoke(None)
        .await
        .unwrap();

    assert!(summary.succeeded());
    assert_eq!(
        fixture.list("lib"),
        vec![
            PathBuf::from("index.cjs"),
            PathBuf::from("index.mjs"),
            PathBuf::from("util.cjs"),
            PathBuf::from("util.mjs"),
        ]
    );
    assert!(fixture.read("lib/index.cjs").unwrap().contains("require('./util.cjs')"));
    assert_eq!(fixture.read("lib/index.mjs").unwrap(), "export * from './util.mjs';\n");
}

#[tokio::test]
async fn test_additional_kind_with_package_marker() {
    let project = TestProject::new(commonjs());
    let fixture = &project.fixture;
    fixture.write("src/index.ts", "export const a = 1;\n").unwrap();

    let mut settings = fixture.settings();
    settings.additional_module_kinds_to_emit = vec![AdditionalModuleKind {
        module_kind: ModuleKind::EsNext,
        out_folder_name: PathBuf::from("lib-esm"),
        extension_override: None,
        emit_package_marker: true,
    }];
    project.orchestrator(settings, BuildMode::Build).invoke(None).await.unwrap();

    assert_eq!(fixture.list("lib"), vec![PathBuf::from("index.js")]);
    assert_eq!(
        fixture.list("lib-esm"),
        vec![PathBuf::from("index.js"), PathBuf::from("package.json")]
    );
    let marker: serde_json::Value = serde_json::from_str(&fixture.read("lib-esm/package.json").unwrap()).unwrap();
    assert_eq!(marker, json!({ "type": "module" }));
    assert_eq!(fixture.read("lib-esm/index.js").unwrap(), "export const a = 1;\n");
}

#[tokio::test]
async fn test_conflicting_additional_kind_is_rejected_alone() {
    let project = TestProject::new(commonjs());
    let fixture = &project.fixture;
    fixture.write("src/index.ts", "export const a = 1;\n").unwrap();

    let mut settings = fixture.settings();
    settings.additional_module_kinds_to_emit = vec![
        AdditionalModuleKind {
            module_kind: ModuleKind::Amd,
            out_folder_name: PathBuf::from("dist/cjs"),
            extension_override: None,
            emit_package_marker: false,
        },
        AdditionalModuleKind {
            module_kind: ModuleKind::Umd,
            out_folder_name: PathBuf::from("dist/cjs"),
            extension_override: None,
            emit_package_marker: false,
        },
    ];
    let summary = project
        .orchestrator(settings, BuildMode::Build)
        .invoke(None)
        .await
        .unwrap();

    assert_eq!(summary.counts.errors, 1);
    assert!(!summary.succeeded());
    let errors = project.logger.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("same module extension"));
    assert!(fixture.read("dist/cjs/index.js").unwrap().starts_with("// AMD module"));
    assert!(fixture.exists("lib/index.js"));
}

#[rstest]
#[case(EmitFault::Error)]
#[case(EmitFault::Panic)]
#[tokio::test]
async fn test_failed_transpile_is_retried_on_next_pass(#[case] fault: EmitFault) {
    let project = TestProject::new(json!({
        "module": "commonjs", "outDir": "lib", "rootDir": "src",
        "declaration": true, "isolatedModules": true
    }));
    let fixture = &project.fixture;
    fixture.write("src/index.ts", "export const a = 1;\n").unwrap();

    let mut settings = fixture.settings();
    settings.use_transpiler_worker = true;
    let mut orchestrator = project.orchestrator(settings, BuildMode::Build);
    project.compiler.fail_transpile(fault);

    let failed = orchestrator.invoke(None).await.unwrap();
    assert_eq!(failed.counts.errors, 1);
    assert!(fixture.exists("lib/index.d.ts"));
    assert!(!fixture.exists("lib/index.js"));
    let first_errors = project.logger.errors();
    assert!(first_errors[0].contains("transpile failed for"));

    let repeated = orchestrator.invoke(None).await.unwrap();
    assert_eq!(repeated.counts, failed.counts);
    assert_eq!(repeated.changed_sources, failed.changed_sources);
    assert!(!fixture.exists("lib/index.js"));
    let errors = project.logger.errors();
    assert_eq!(errors.len(), 2 * first_errors.len());
    assert_eq!(errors[first_errors.len()..], first_errors[..]);

    project.compiler.clear_faults();
    let recovered = orchestrator.invoke(None).await.unwrap();
    assert!(recovered.succeeded());
    assert!(fixture.read("lib/index.js").unwrap().contains("const a = 1;"));
    assert!(recovered.changed_sources.contains(&fixture.path("src/index.ts")));
}

#[tokio::test]
async fn test_diagnostics_are_reported_not_returned() {
    let project = TestProject::new(commonjs());
    let fixture = &project.fixture;
    fixture
        .write(
            "src/index.ts",
            "import { missing } from './nowhere';\n// @unused missing\nexport const a = 1;\n",
        )
        .unwrap();

    let summary = project.build().invoke(None).await.unwrap();

    assert_eq!(summary.counts.errors, 1);
    assert_eq!(summary.counts.warnings, 1);
    assert!(!summary.succeeded());
    assert!(fixture.exists("lib/index.js"));

    assert_eq!(project.logger.lines(), vec!["Encountered 2 issues:".to_string()]);
    assert_eq!(
        project.logger.errors(),
        vec!["src/index.ts:1:1 - (TS2307) Cannot find module './nowhere' or its corresponding type declarations.".to_string()]
    );
    assert_eq!(
        project.logger.warnings(),
        vec!["src/index.ts:2:1 - (TS6133) 'missing' is declared but its value is never read.".to_string()]
    );
}

#[tokio::test]
async fn test_unchanged_inputs_are_idempotent() {
    let project = TestProject::new(json!({
        "module": "commonjs", "outDir": "lib", "rootDir": "src", "declaration": true
    }));
    let fixture = &project.fixture;
    fixture
        .write("src/index.ts", "// @warning TS6385 'legacy' is deprecated.\nexport const a = 1;\n")
        .unwrap();
    fixture.write("src/b.ts", "export * from './index';\n").unwrap();

    let mut orchestrator = project.build();
    let first = orchestrator.invoke(None).await.unwrap();
    let first_log = (project.logger.errors(), project.logger.warnings());
    let first_outputs: Vec<(PathBuf, String)> = fixture
        .list("lib")
        .into_iter()
        .map(|p| (p.clone(), fixture.read(PathBuf::from("lib").join(p)).unwrap()))
        .collect();

    project.logger.clear();
    let second = orchestrator.invoke(None).await.unwrap();
    let second_outputs: Vec<(PathBuf, String)> = fixture
        .list("lib")
        .into_iter()
        .map(|p| (p.clone(), fixture.read(PathBuf::from("lib").join(p)).unwrap()))
        .collect();

    assert_eq!(first.counts, second.counts);
    assert_eq!(first_log, (project.logger.errors(), project.logger.warnings()));
    assert_eq!(first_outputs, second_outputs);
    assert_eq!(first_outputs.len(), 4);
    assert_eq!(second.files_written, 0);
    assert_eq!(project.compiler.incremental_reuses(), 1);
}

#[tokio::test]
async fn test_watch_pass_reemits_only_changed_files() {
    let project = TestProject::new(commonjs());
    let fixture = &project.fixture;
    let index = fixture.write("src/index.ts", "export const a = 1;\n").unwrap();
    fixture.write("src/other.ts", "export const b = 2;\n").unwrap();

    let seen: Arc<Mutex<Vec<BTreeSet<PathBuf>>>> = Arc::default();
    let recorder = Arc::clone(&seen);
    let mut orchestrator = project
        .orchestrator(fixture.settings(), BuildMode::Watch)
        .on_changed_files(move |_: &dyn Program, changed: &BTreeSet<PathBuf>| {
            recorder.lock().unwrap().push(changed.clone());
        });

    orchestrator.invoke(None).await.unwrap();
    fixture.write("src/index.ts", "export const a = 3;\n").unwrap();
    let changes: ChangedFiles = [index.clone()].into_iter().collect();
    let summary = orchestrator.invoke(Some(&changes)).await.unwrap();

    assert_eq!(summary.files_written, 1);
    assert!(fixture.read("lib/index.js").unwrap().contains("const a = 3;"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].len(), 2);
    assert_eq!(seen[1], BTreeSet::from([index]));
}

#[tokio::test]
async fn test_worker_transpiles_changed_files() {
    let project = TestProject::new(json!({
        "module": "commonjs", "outDir": "lib", "rootDir": "src",
        "declaration": true, "isolatedModules": true
    }));
    let fixture = &project.fixture;
    fixture.write("src/index.ts", "export const a = 1;\n").unwrap();

    let mut settings = fixture.settings();
    settings.use_transpiler_worker = true;
    settings.emit_mjs_extension_for_esmodule = true;
    let summary = project
        .orchestrator(settings, BuildMode::Build)
        .invoke(None)
        .await
        .unwrap();

    assert!(summary.succeeded());
    assert_eq!(
        fixture.list("lib"),
        vec![
            PathBuf::from("index.d.ts"),
            PathBuf::from("index.js"),
            PathBuf::from("index.mjs"),
        ]
    );
    assert!(project
        .logger
        .verbose_lines()
        .iter()
        .any(|line| line.starts_with("Transpile: ") && line.ends_with("(1 files)")));
}

#[tokio::test]
async fn test_worker_crash_becomes_a_diagnostic() {
    let project = TestProject::new(json!({
        "module": "commonjs", "outDir": "lib", "rootDir": "src", "isolatedModules": true
    }));
    let fixture = &project.fixture;
    let index = fixture
        .write("src/index.ts", &format!("export const a = '{}';\n", CRASH_MARKER))
        .unwrap();

    let mut settings = fixture.settings();
    settings.use_transpiler_worker = true;
    let mut orchestrator = project.orchestrator(settings, BuildMode::Watch);

    let crashed = orchestrator.invoke(None).await.unwrap();
    assert_eq!(crashed.counts.errors, 1);
    assert!(project.logger.errors()[0].contains("transpile worker crashed"));

    fixture.write("src/index.ts", "export const a = 'fixed';\n").unwrap();
    let changes: ChangedFiles = [index].into_iter().collect();
    let recovered = orchestrator.invoke(Some(&changes)).await.unwrap();

    assert!(recovered.succeeded());
    assert!(fixture.read("lib/index.js").unwrap().contains("'fixed'"));
}

#[tokio::test]
async fn test_emit_failure_aborts_only_that_pass() {
    let project = TestProject::new(commonjs());
    let fixture = &project.fixture;
    fixture.write("src/index.ts", "export const a = 1;\n").unwrap();

    let mut settings = fixture.settings();
    settings.emit_mjs_extension_for_esmodule = true;
    let mut orchestrator = project.orchestrator(settings, BuildMode::Watch);

    project.compiler.fail_emit(ModuleKind::EsNext, EmitFault::Error);
    let err = orchestrator.invoke(None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compiler);
    assert!(!fixture.exists("lib"));

    project.compiler.clear_faults();
    let summary = orchestrator.invoke(None).await.unwrap();
    assert!(summary.succeeded());
    assert_eq!(
        fixture.list("lib"),
        vec![PathBuf::from("index.js"), PathBuf::from("index.mjs")]
    );
}

#[tokio::test]
async fn test_incremental_build_info_is_keyed_by_flavors() {
    let project = TestProject::new(json!({
        "module": "commonjs", "outDir": "lib", "incremental": true
    }));
    let fixture = &project.fixture;
    fixture.write("src/index.ts", "export const a = 1;\n").unwrap();

    let build_info: Arc<Mutex<Option<PathBuf>>> = Arc::default();
    let recorder = Arc::clone(&build_info);
    let mut orchestrator = project
        .build()
        .on_changed_files(move |program: &dyn Program, _: &BTreeSet<PathBuf>| {
            *recorder.lock().unwrap() = program.options().ts_build_info_file.clone();
        });
    orchestrator.invoke(None).await.unwrap();

    let path = build_info.lock().unwrap().clone().unwrap();
    assert!(path.starts_with(fixture.path("temp/build")));
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("ts_") && name.ends_with(".json"));
}

#[tokio::test]
async fn test_old_compiler_builds_from_scratch() {
    let project = TestProject::new(commonjs());
    let fixture = &project.fixture;
    fixture.tool("3.4.1").unwrap();
    fixture.write("src/index.ts", "export const a = 1;\n").unwrap();

    let mut orchestrator = project.build();
    orchestrator.invoke(None).await.unwrap();
    orchestrator.invoke(None).await.unwrap();

    assert_eq!(project.compiler.programs_created(), 2);
    assert_eq!(project.compiler.incremental_reuses(), 0);
    assert!(project
        .logger
        .verbose_lines()
        .iter()
        .any(|line| line.contains("cannot reuse programs")));
}

#[tokio::test]
async fn test_extension_override_rewrites_source_maps() {
    let project = TestProject::new(json!({
        "module": "commonjs", "outDir": "lib", "rootDir": "src", "sourceMap": true
    }));
    let fixture = &project.fixture;
    fixture.write("src/index.ts", "export const a = 1;\n").unwrap();

    let mut settings = fixture.settings();
    settings.additional_module_kinds_to_emit = vec![AdditionalModuleKind {
        module_kind: ModuleKind::EsNext,
        out_folder_name: PathBuf::from("lib"),
        extension_override: Some(JsExtension::Mjs),
        emit_package_marker: false,
    }];
    project.orchestrator(settings, BuildMode::Build).invoke(None).await.unwrap();

    assert!(fixture
        .read("lib/index.mjs")
        .unwrap()
        .ends_with("//# sourceMappingURL=index.mjs.map\n"));
    let map: serde_json::Value = serde_json::from_str(&fixture.read("lib/index.mjs.map").unwrap()).unwrap();
    assert_eq!(map["file"], "index.mjs");
    assert_eq!(map["sources"][0], "../src/index.ts");
}
