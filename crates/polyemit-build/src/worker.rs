//! Background transpile worker
//!
//! A single worker thread transpiles changed files without type checking
//! while the build thread checks and emits declarations. Requests carry an
//! increasing id; a listener thread routes each response to the oneshot
//! handle registered under that id.
//!
//! When the worker thread exits or panics, every request still pending for
//! it is rejected and the pool spawns a fresh worker on the next request.

use crate::compiler::{OutputFile, Transpiler};
use crate::diagnostic::{sort_and_dedupe, Diagnostic};
use crate::error::{BuildError, BuildResult};
use crate::multi_emit::{flavor_options, rewrite_output, EmitMode};
use crate::plan::ModuleKindFlavor;
use polyemit_config::CompilerOptions;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Work item sent to the worker
#[derive(Debug, Clone)]
pub struct TranspileRequest {
    pub id: u64,

    /// Options of the program; `root_dir` maps sources to outputs
    pub options: CompilerOptions,
    pub changed_files: BTreeMap<PathBuf, String>,
    pub flavors: Vec<ModuleKindFlavor>,
}

/// Files and diagnostics produced for one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranspileOutput {
    pub files: Vec<OutputFile>,

    /// Sorted by file path
    pub diagnostics: Vec<Diagnostic>,

    /// Time spent per source file, across all flavors
    pub timings: Vec<(PathBuf, Duration)>,
}

impl TranspileOutput {
    /// Verbose summary: the slowest files and the median
    pub fn timing_report(&self) -> Vec<String> {
        if self.timings.is_empty() {
            return Vec::new();
        }

        let mut timings = self.timings.clone();
        timings.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let total: Duration = timings.iter().map(|(_, d)| *d).sum();
        let median = timings[timings.len() / 2].1;

        let mut lines = vec![format!(
            "Transpile: {}ms ({} files)",
            total.as_millis(),
            timings.len()
        )];
        lines.push("Slowest files:".to_string());
        for (path, duration) in timings.iter().take(10) {
            lines.push(format!("  {}: {}ms", path.display(), duration.as_millis()));
        }
        lines.push(format!("Median: {}ms", median.as_millis()));
        lines
    }
}

enum WorkerMessage {
    Transpile(TranspileRequest),
    Shutdown,
}

enum WorkerResponse {
    Success { id: u64, output: TranspileOutput },
    Error { id: u64, message: String },
}

type Completion = oneshot::Sender<BuildResult<TranspileOutput>>;

/// Bookkeeping shared with the listener thread
#[derive(Default)]
struct PendingState {
    /// id -> (worker generation, completion handle)
    requests: HashMap<u64, (u64, Completion)>,
    generation: u64,
    worker_alive: bool,
}

type SharedState = Arc<Mutex<PendingState>>;

fn lock(state: &SharedState) -> std::sync::MutexGuard<'_, PendingState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Future resolved when the worker answers a request
pub struct PendingTranspile {
    id: u64,
    receiver: oneshot::Receiver<BuildResult<TranspileOutput>>,
}

impl PendingTranspile {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn rejected(id: u64, error: BuildError) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Err(error));
        Self { id, receiver }
    }
}

impl Future for PendingTranspile {
    type Output = BuildResult<TranspileOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BuildError::worker(format!(
                "transpile request {} was dropped without an answer",
                id
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Owner of the transpile worker and its pending requests
pub struct TranspileWorkerPool {
    transpiler: Arc<dyn Transpiler>,
    state: SharedState,
    sender: Option<mpsc::UnboundedSender<WorkerMessage>>,
    next_id: u64,
}

impl TranspileWorkerPool {
    pub fn new(transpiler: Arc<dyn Transpiler>) -> Self {
        Self {
            transpiler,
            state: Arc::new(Mutex::new(PendingState::default())),
            sender: None,
            next_id: 1,
        }
    }

    /// Queue changed files for transpilation; does not block
    pub fn queue_transpile(
        &mut self,
        options: CompilerOptions,
        changed_files: BTreeMap<PathBuf, String>,
        flavors: Vec<ModuleKindFlavor>,
    ) -> PendingTranspile {
        let id = self.next_id;
        self.next_id += 1;

        let (sender, generation) = match self.live_sender() {
            Ok(live) => live,
            Err(error) => return PendingTranspile::rejected(id, error),
        };

        let (completion, receiver) = oneshot::channel();
        lock(&self.state).requests.insert(id, (generation, completion));

        let request = TranspileRequest {
            id,
            options,
            changed_files,
            flavors,
        };
        if sender.send(WorkerMessage::Transpile(request)).is_err() {
            // The worker is gone and its listener may already have run
            if let Some((_, completion)) = lock(&self.state).requests.remove(&id) {
                let _ = completion.send(Err(BuildError::worker(
                    "transpile worker exited before the request was sent",
                )));
            }
        }

        tracing::trace!(id, "queued transpile request");
        PendingTranspile { id, receiver }
    }

    /// Ask the worker to stop after the queued requests
    pub fn shutdown(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(WorkerMessage::Shutdown);
            tracing::debug!("transpile worker shutdown requested");
        }
    }

    /// Requests that have not been answered yet
    pub fn pending_count(&self) -> usize {
        lock(&self.state).requests.len()
    }

    pub fn is_worker_alive(&self) -> bool {
        self.sender.is_some() && lock(&self.state).worker_alive
    }

    fn live_sender(&mut self) -> BuildResult<(mpsc::UnboundedSender<WorkerMessage>, u64)> {
        let generation = {
            let state = lock(&self.state);
            state.worker_alive.then_some(state.generation)
        };

        match (&self.sender, generation) {
            (Some(sender), Some(generation)) => Ok((sender.clone(), generation)),
            _ => self.spawn_worker(),
        }
    }

    fn spawn_worker(&mut self) -> BuildResult<(mpsc::UnboundedSender<WorkerMessage>, u64)> {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<WorkerResponse>();

        let generation = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.worker_alive = true;
            state.generation
        };

        let transpiler = Arc::clone(&self.transpiler);
        let worker = thread::Builder::new()
            .name(format!("polyemit-transpile-{}", generation))
            .spawn(move || {
                while let Some(message) = request_rx.blocking_recv() {
                    let request = match message {
                        WorkerMessage::Transpile(request) => request,
                        WorkerMessage::Shutdown => break,
                    };

                    let id = request.id;
                    let response = match transpile_request(transpiler.as_ref(), &request) {
                        Ok(output) => WorkerResponse::Success { id, output },
                        Err(error) => WorkerResponse::Error {
                            id,
                            message: error.to_string(),
                        },
                    };
                    if response_tx.send(response).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| {
                lock(&self.state).worker_alive = false;
                BuildError::worker(format!("failed to start transpile worker: {}", e))
            })?;

        let state = Arc::clone(&self.state);
        thread::Builder::new()
            .name(format!("polyemit-transpile-listener-{}", generation))
            .spawn(move || {
                while let Some(response) = response_rx.blocking_recv() {
                    resolve(&state, response);
                }

                let reason = match worker.join() {
                    Ok(()) => "transpile worker exited".to_string(),
                    Err(panic) => format!("transpile worker crashed: {}", panic_message(panic.as_ref())),
                };
                reject_generation(&state, generation, &reason);
            })
            .map_err(|e| BuildError::worker(format!("failed to start transpile listener: {}", e)))?;

        tracing::debug!(generation, "transpile worker started");
        self.sender = Some(request_tx.clone());
        Ok((request_tx, generation))
    }
}

impl Drop for TranspileWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve(state: &SharedState, response: WorkerResponse) {
    let (id, result) = match response {
        WorkerResponse::Success { id, output } => (id, Ok(output)),
        WorkerResponse::Error { id, message } => (id, Err(BuildError::Worker(message))),
    };

    let completion = lock(state).requests.remove(&id);
    match completion {
        Some((_, completion)) => {
            let _ = completion.send(result);
        }
        None => tracing::warn!(id, "discarding transpile response with unknown id"),
    }
}

/// Reject everything still pending for a dead worker
fn reject_generation(state: &SharedState, generation: u64, reason: &str) {
    let orphaned: Vec<Completion> = {
        let mut state = lock(state);
        if state.generation == generation {
            state.worker_alive = false;
        }
        let ids: Vec<u64> = state
            .requests
            .iter()
            .filter(|(_, (owner, _))| *owner == generation)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| state.requests.remove(&id))
            .map(|(_, completion)| completion)
            .collect()
    };

    if !orphaned.is_empty() {
        tracing::error!(count = orphaned.len(), "{}", reason);
    }
    for completion in orphaned {
        let _ = completion.send(Err(BuildError::worker(reason)));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Output path of a source file under `out_dir`
pub fn output_path_for(source: &Path, root_dir: &Path, out_dir: &Path) -> Option<PathBuf> {
    let name = source.to_string_lossy();
    if name.ends_with(".d.ts") || name.ends_with(".d.mts") || name.ends_with(".d.cts") {
        return None;
    }

    let extension = match source.extension().and_then(|e| e.to_str()) {
        Some("ts") | Some("tsx") => "js",
        Some("mts") => "mjs",
        Some("cts") => "cjs",
        _ => return None,
    };

    let relative = match source.strip_prefix(root_dir) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => PathBuf::from(source.file_name()?),
    };
    Some(out_dir.join(relative).with_extension(extension))
}

/// Transpile every changed file once per flavor
fn transpile_request(transpiler: &dyn Transpiler, request: &TranspileRequest) -> BuildResult<TranspileOutput> {
    let root_dir = request
        .options
        .root_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    let mut output = TranspileOutput::default();
    for (path, text) in &request.changed_files {
        let started = Instant::now();
        for flavor in &request.flavors {
            let Some(options) = flavor_options(&request.options, flavor, EmitMode::TranspileOnly) else {
                continue;
            };
            let Some(js_path) = output_path_for(path, &root_dir, &flavor.output_folder) else {
                continue;
            };

            let result = transpiler.transpile_module(path, text, &options)?;
            output.diagnostics.extend(result.diagnostics);

            if let Some(map) = result.source_map_text {
                let map_path = PathBuf::from(format!("{}.map", js_path.display()));
                output
                    .files
                    .push(rewrite_output(OutputFile::new(map_path, map), flavor.extension_override));
            }
            output.files.push(rewrite_output(
                OutputFile::new(js_path, result.output_text),
                flavor.extension_override,
            ));
        }
        output.timings.push((path.clone(), started.elapsed()));
    }

    output.diagnostics = sort_and_dedupe(output.diagnostics);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::TranspileModuleOutput;
    use polyemit_config::{JsExtension, ModuleKind};
    use std::sync::mpsc as std_mpsc;

    struct EchoTranspiler;

    impl Transpiler for EchoTranspiler {
        fn transpile_module(
            &self,
            file: &Path,
            text: &str,
            options: &CompilerOptions,
        ) -> BuildResult<TranspileModuleOutput> {
            if text.contains("syntax error") {
                return Err(BuildError::compiler(format!("{}: unexpected token", file.display())));
            }
            Ok(TranspileModuleOutput {
                output_text: format!(
                    "// {}\n{}",
                    options.module.map(|m| m.as_str()).unwrap_or("none"),
                    text.replace("./dep", "./dep.js")
                ),
                source_map_text: None,
                diagnostics: Vec::new(),
            })
        }
    }

    /// Blocks on the first file until released, then panics
    struct GatedTranspiler {
        gate: Mutex<std_mpsc::Receiver<()>>,
    }

    impl Transpiler for GatedTranspiler {
        fn transpile_module(&self, _: &Path, _: &str, _: &CompilerOptions) -> BuildResult<TranspileModuleOutput> {
            let _ = self.gate.lock().unwrap().recv();
            panic!("transpiler crashed");
        }
    }

    fn flavors() -> Vec<ModuleKindFlavor> {
        vec![
            ModuleKindFlavor {
                module_kind: ModuleKind::CommonJs,
                output_folder: PathBuf::from("/repo/lib"),
                extension_override: None,
                is_primary: true,
                emit_package_marker: false,
            },
            ModuleKindFlavor {
                module_kind: ModuleKind::EsNext,
                output_folder: PathBuf::from("/repo/lib"),
                extension_override: Some(JsExtension::Mjs),
                is_primary: false,
                emit_package_marker: false,
            },
        ]
    }

    fn options() -> CompilerOptions {
        CompilerOptions {
            root_dir: Some(PathBuf::from("/repo/src")),
            ..Default::default()
        }
    }

    fn files(entries: &[(&str, &str)]) -> BTreeMap<PathBuf, String> {
        entries
            .iter()
            .map(|(path, text)| (PathBuf::from(path), text.to_string()))
            .collect()
    }

    #[test]
    fn test_output_path_for() {
        let root = Path::new("/repo/src");
        let out = Path::new("/repo/lib");
        assert_eq!(
            output_path_for(Path::new("/repo/src/a/b.ts"), root, out),
            Some(PathBuf::from("/repo/lib/a/b.js"))
        );
        assert_eq!(
            output_path_for(Path::new("/repo/src/c.mts"), root, out),
            Some(PathBuf::from("/repo/lib/c.mjs"))
        );
        assert_eq!(output_path_for(Path::new("/repo/src/d.d.ts"), root, out), None);
        assert_eq!(output_path_for(Path::new("/repo/src/e.json"), root, out), None);
    }

    #[tokio::test]
    async fn test_transpile_each_flavor() {
        let mut pool = TranspileWorkerPool::new(Arc::new(EchoTranspiler));
        let pending = pool.queue_transpile(
            options(),
            files(&[("/repo/src/index.ts", "export * from './dep';")]),
            flavors(),
        );

        let output = pending.await.unwrap();
        let paths: Vec<_> = output.files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("/repo/lib/index.js"), PathBuf::from("/repo/lib/index.mjs")]
        );
        assert!(output.files[0].text.contains("CommonJS"));
        assert!(output.files[1].text.contains("from './dep.mjs'"));
        assert_eq!(output.timings.len(), 1);
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_increase_and_worker_is_reused() {
        let mut pool = TranspileWorkerPool::new(Arc::new(EchoTranspiler));
        let first = pool.queue_transpile(options(), BTreeMap::new(), flavors());
        let second = pool.queue_transpile(options(), BTreeMap::new(), flavors());
        assert!(second.id() > first.id());

        first.await.unwrap();
        second.await.unwrap();
        assert!(pool.is_worker_alive());
    }

    #[tokio::test]
    async fn test_tagged_error_rejects_only_that_request() {
        let mut pool = TranspileWorkerPool::new(Arc::new(EchoTranspiler));
        let bad = pool.queue_transpile(
            options(),
            files(&[("/repo/src/bad.ts", "syntax error")]),
            flavors(),
        );
        let good = pool.queue_transpile(options(), files(&[("/repo/src/ok.ts", "ok")]), flavors());

        let err = bad.await.unwrap_err();
        assert!(matches!(err, BuildError::Worker(ref message) if message.contains("unexpected token")));
        assert!(good.await.is_ok());
        assert!(pool.is_worker_alive());
    }

    #[tokio::test]
    async fn test_worker_death_rejects_every_pending_request() {
        let (release, gate) = std_mpsc::channel();
        let mut pool = TranspileWorkerPool::new(Arc::new(GatedTranspiler {
            gate: Mutex::new(gate),
        }));

        let pending: Vec<_> = (0..3)
            .map(|i| {
                pool.queue_transpile(
                    options(),
                    files(&[(&format!("/repo/src/{}.ts", i), "x")]),
                    flavors(),
                )
            })
            .collect();
        assert_eq!(pool.pending_count(), 3);

        release.send(()).unwrap();
        for request in pending {
            let err = request.await.unwrap_err();
            assert!(err.to_string().contains("transpiler crashed"));
        }
        assert_eq!(pool.pending_count(), 0);
        assert!(!pool.is_worker_alive());
    }

    #[tokio::test]
    async fn test_dead_worker_is_replaced() {
        let (release, gate) = std_mpsc::channel();
        let mut pool = TranspileWorkerPool::new(Arc::new(GatedTranspiler {
            gate: Mutex::new(gate),
        }));

        let doomed = pool.queue_transpile(options(), files(&[("/repo/src/a.ts", "x")]), flavors());
        release.send(()).unwrap();
        assert!(doomed.await.is_err());

        // The next request goes to a new worker, which reaches the gate again
        release.send(()).unwrap();
        let retry = pool.queue_transpile(options(), files(&[("/repo/src/a.ts", "x")]), flavors());
        assert!(pool.is_worker_alive());
        assert!(retry.await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_then_restart() {
        let mut pool = TranspileWorkerPool::new(Arc::new(EchoTranspiler));
        pool.queue_transpile(options(), BTreeMap::new(), flavors()).await.unwrap();

        pool.shutdown();
        assert!(!pool.is_worker_alive());

        let output = pool
            .queue_transpile(options(), files(&[("/repo/src/a.ts", "a")]), flavors())
            .await
            .unwrap();
        assert_eq!(output.files.len(), 2);
    }

    #[tokio::test]
    async fn test_response_with_unknown_id_is_discarded() {
        let state: SharedState = Arc::default();
        let (completion, receiver) = oneshot::channel();
        lock(&state).requests.insert(1, (1, completion));

        resolve(
            &state,
            WorkerResponse::Success {
                id: 999,
                output: TranspileOutput::default(),
            },
        );
        assert!(lock(&state).requests.contains_key(&1));
        assert_eq!(lock(&state).requests.len(), 1);

        resolve(
            &state,
            WorkerResponse::Error {
                id: 1,
                message: "unexpected token".to_string(),
            },
        );
        assert!(lock(&state).requests.is_empty());

        let err = PendingTranspile { id: 1, receiver }.await.unwrap_err();
        assert!(matches!(err, BuildError::Worker(ref message) if message == "unexpected token"));

        resolve(
            &state,
            WorkerResponse::Success {
                id: 1,
                output: TranspileOutput::default(),
            },
        );
        assert!(lock(&state).requests.is_empty());
    }

    #[test]
    fn test_timing_report() {
        let output = TranspileOutput {
            timings: (1..=12)
                .map(|i| (PathBuf::from(format!("f{}.ts", i)), Duration::from_millis(i)))
                .collect(),
            ..Default::default()
        };

        let report = output.timing_report();
        assert_eq!(report[0], "Transpile: 78ms (12 files)");
        assert_eq!(report[2], "  f12.ts: 12ms");
        assert_eq!(report.len(), 1 + 1 + 10 + 1);
        assert_eq!(report.last().unwrap(), "Median: 6ms");
    }
}
