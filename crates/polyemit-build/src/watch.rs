//! Watch mode: rebuild on file system changes
//!
//! Notifications are filtered, collected until no new one arrives for the
//! debounce delay, then handed to [`BuildOrchestrator::invoke`] as one
//! batch. A failing pass is logged and watching continues.

use crate::error::{BuildError, BuildResult};
use crate::orchestrator::{BuildMode, BuildOrchestrator, ChangedFiles, PassSummary};
use notify::{Event, RecursiveMode, Watcher};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Quiet period before a batch of changes is built
pub const DEBOUNCE: Duration = Duration::from_millis(300);

/// Extensions whose changes can affect a build
const RELEVANT_EXTENSIONS: &[&str] = &["ts", "tsx", "mts", "cts", "json"];

/// Decides which changed paths trigger a pass
#[derive(Debug, Clone, Default)]
pub struct RelevanceFilter {
    ignored: Vec<PathBuf>,
}

impl RelevanceFilter {
    /// Ignore `folders` and everything under them
    pub fn new(folders: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            ignored: folders.into_iter().collect(),
        }
    }

    pub fn set_ignored(&mut self, folders: impl IntoIterator<Item = PathBuf>) {
        self.ignored = folders.into_iter().collect();
    }

    pub fn is_relevant(&self, path: &Path) -> bool {
        if self.ignored.iter().any(|folder| path.starts_with(folder)) {
            return false;
        }
        if path.components().any(|c| c.as_os_str() == "node_modules") {
            return false;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| RELEVANT_EXTENSIONS.contains(&ext))
    }
}

/// Changed paths waiting for the debounce delay
#[derive(Debug, Default)]
pub struct PendingChanges {
    changes: ChangedFiles,
    last_event: Option<Instant>,
}

impl PendingChanges {
    pub fn record(&mut self, path: impl Into<PathBuf>, now: Instant) {
        self.changes.insert(path);
        self.last_event = Some(now);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Time left until the batch is ready, `None` when nothing is pending
    pub fn time_until_ready(&self, now: Instant, debounce: Duration) -> Option<Duration> {
        if self.changes.is_empty() {
            return None;
        }
        let last = self.last_event?;
        Some(debounce.saturating_sub(now.saturating_duration_since(last)))
    }

    pub fn drain(&mut self) -> ChangedFiles {
        self.last_event = None;
        std::mem::take(&mut self.changes)
    }
}

/// Counters of a finished watch session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub passes: usize,
    pub failed_passes: usize,
}

/// Drives a watch-mode orchestrator from file system notifications
pub struct WatchSession {
    orchestrator: BuildOrchestrator,
    filter: RelevanceFilter,
    debounce: Duration,
    stats: WatchStats,
}

impl WatchSession {
    pub fn new(orchestrator: BuildOrchestrator) -> BuildResult<Self> {
        if orchestrator.mode() != BuildMode::Watch {
            return Err(BuildError::invariant(format!(
                "a watch session needs an orchestrator in watch mode, not {:?}",
                orchestrator.mode()
            )));
        }

        let settings = orchestrator.settings();
        let filter = RelevanceFilter::new([settings.metadata_folder(), settings.tool_folder()]);
        Ok(Self {
            orchestrator,
            filter,
            debounce: DEBOUNCE,
            stats: WatchStats::default(),
        })
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn orchestrator(&self) -> &BuildOrchestrator {
        &self.orchestrator
    }

    pub fn into_orchestrator(self) -> BuildOrchestrator {
        self.orchestrator
    }

    /// Watch the build folder until `shutdown` completes
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> BuildResult<WatchStats> {
        let (sender, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = sender.send(event);
        })
        .map_err(|e| BuildError::Io(std::io::Error::other(e)))?;

        let folder = self.orchestrator.settings().build_folder.clone();
        watcher
            .watch(&folder, RecursiveMode::Recursive)
            .map_err(|e| BuildError::Io(std::io::Error::other(e)))?;
        tracing::info!(folder = %folder.display(), "watching for changes");

        self.run_with_events(events, shutdown).await
    }

    /// Build once, then once per debounced batch of `events`
    ///
    /// Stops when `shutdown` completes or the event stream ends; changes
    /// still pending when the stream ends are built first.
    pub async fn run_with_events(
        &mut self,
        mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
        shutdown: impl Future<Output = ()>,
    ) -> BuildResult<WatchStats> {
        tokio::pin!(shutdown);
        self.react(None).await;

        let mut pending = PendingChanges::default();
        loop {
            let wait = pending.time_until_ready(Instant::now(), self.debounce);
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(Ok(event)) => self.record(&mut pending, event),
                    Some(Err(error)) => {
                        self.orchestrator.logger().emit_warning(&error);
                    }
                    None => {
                        if !pending.is_empty() {
                            let changes = pending.drain();
                            self.react(Some(&changes)).await;
                        }
                        break;
                    }
                },
                _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {
                    let changes = pending.drain();
                    self.react(Some(&changes)).await;
                }
            }
        }

        Ok(self.stats)
    }

    fn record(&self, pending: &mut PendingChanges, event: Event) {
        if event.kind.is_access() {
            return;
        }
        let now = Instant::now();
        for path in event.paths {
            if self.filter.is_relevant(&path) {
                tracing::trace!(path = %path.display(), "change queued");
                pending.record(path, now);
            }
        }
    }

    async fn react(&mut self, changes: Option<&ChangedFiles>) -> Option<PassSummary> {
        if let Some(changes) = changes {
            tracing::debug!(count = changes.len(), "rebuilding after changes");
        }

        self.stats.passes += 1;
        let result = self.orchestrator.invoke(changes).await;

        let settings = self.orchestrator.settings();
        let ignored: Vec<PathBuf> = [settings.metadata_folder(), settings.tool_folder()]
            .into_iter()
            .chain(self.orchestrator.output_folders().iter().cloned())
            .collect();
        self.filter.set_ignored(ignored);

        match result {
            Ok(summary) => Some(summary),
            Err(error) => {
                self.stats.failed_passes += 1;
                self.orchestrator.logger().emit_error(&error);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::CapturingLogger;
    use crate::testing::{MockCompiler, ProjectFixture};
    use notify::event::{AccessKind, CreateKind, EventKind, ModifyKind};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn event(kind: EventKind, path: PathBuf) -> notify::Result<Event> {
        Ok(Event::new(kind).add_path(path))
    }

    #[test]
    fn test_relevance_filter() {
        let filter = RelevanceFilter::new([PathBuf::from("/repo/lib"), PathBuf::from("/repo/temp")]);
        assert!(filter.is_relevant(Path::new("/repo/src/a.ts")));
        assert!(filter.is_relevant(Path::new("/repo/tsconfig.json")));
        assert!(!filter.is_relevant(Path::new("/repo/lib/a.js")));
        assert!(!filter.is_relevant(Path::new("/repo/lib/a.d.ts")));
        assert!(!filter.is_relevant(Path::new("/repo/temp/build/ts_abc.json")));
        assert!(!filter.is_relevant(Path::new("/repo/README.md")));
        assert!(!filter.is_relevant(Path::new("/repo/node_modules/x/index.ts")));
    }

    #[test]
    fn test_pending_changes_debounce() {
        let start = Instant::now();
        let mut pending = PendingChanges::default();
        assert_eq!(pending.time_until_ready(start, DEBOUNCE), None);

        pending.record("/repo/src/a.ts", start);
        pending.record("/repo/src/a.ts", start + Duration::from_millis(100));
        assert_eq!(
            pending.time_until_ready(start + Duration::from_millis(150), DEBOUNCE),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            pending.time_until_ready(start + Duration::from_millis(500), DEBOUNCE),
            Some(Duration::ZERO)
        );

        let changes = pending.drain();
        assert_eq!(changes.len(), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_session_requires_watch_mode() {
        let orchestrator = BuildOrchestrator::new(
            Default::default(),
            BuildMode::Build,
            Arc::new(MockCompiler::new()),
            Arc::new(CapturingLogger::new()),
        );
        assert!(matches!(
            WatchSession::new(orchestrator),
            Err(BuildError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_reacts_to_changes_and_survives_errors() {
        let temp_dir = TempDir::new().unwrap();
        let fixture = ProjectFixture::new(temp_dir.path());
        fixture.tool("5.4.5").unwrap();
        fixture
            .config("", json!({ "compilerOptions": { "module": "commonjs", "outDir": "lib" } }))
            .unwrap();
        let source = fixture.write("src/index.ts", "export const a = 1;\n").unwrap();

        let logger = Arc::new(CapturingLogger::new());
        let orchestrator = BuildOrchestrator::new(
            fixture.settings(),
            BuildMode::Watch,
            Arc::new(MockCompiler::new()),
            logger.clone(),
        );
        let mut session = WatchSession::new(orchestrator).unwrap().with_debounce(Duration::from_millis(10));

        let (sender, events) = mpsc::unbounded_channel();
        fixture.write("src/index.ts", "export const a = 2;\n").unwrap();
        sender
            .send(event(EventKind::Modify(ModifyKind::Any), source.clone()))
            .unwrap();
        sender
            .send(event(EventKind::Access(AccessKind::Any), fixture.path("src/other.ts")))
            .unwrap();
        sender
            .send(Err(notify::Error::generic("watch backend hiccup")))
            .unwrap();
        sender
            .send(event(EventKind::Create(CreateKind::File), fixture.path("lib/index.js")))
            .unwrap();
        drop(sender);

        let stats = session
            .run_with_events(events, std::future::pending())
            .await
            .unwrap();

        assert_eq!(stats.passes, 2);
        assert_eq!(stats.failed_passes, 0);
        assert!(fixture.read("lib/index.js").unwrap().contains("const a = 2;"));
        assert_eq!(logger.warnings().len(), 1);
        assert_eq!(
            session.orchestrator().state(),
            crate::orchestrator::OrchestratorState::WatchIdle
        );
    }
}
