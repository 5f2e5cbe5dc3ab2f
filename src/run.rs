use crate::config::DRAIN_GRACE_SECS;
use crate::dispatch::Dispatcher;
use crate::error::IngestError;
use crate::markup::MarkupParser;
use crate::models::RawPage;
use crate::parser::WikiReader;
use crate::queue::JobQueue;
use crate::stats::{CountSnapshot, RunCounters};
use crate::store::RecordStore;
use crate::transform::PageTransformer;
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of one ingest run.
///
/// `Starting -> Streaming -> Draining -> Done`, or `Starting -> Failed` when the
/// store or the input cannot be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Streaming,
    Draining,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Wait after end of stream in queued mode, for in-flight jobs
    pub drain_grace: Duration,
    /// Stop after this many article pages
    pub limit: Option<u64>,
    /// Draw the per-page spinner
    pub show_progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(DRAIN_GRACE_SECS),
            limit: None,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub state: RunState,
    pub counts: CountSnapshot,
    /// Main-namespace pages pulled from the stream
    pub pages_seen: u64,
    /// Store-wide total at the end; `None` if the count query failed
    pub stored_total: Option<u64>,
    /// Set when the source turned out malformed and the stream ended early
    pub stream_error: Option<String>,
    /// Queue backlog after the drain period (queued mode only)
    pub pending_jobs: Option<u64>,
    pub elapsed: Duration,
}

pub struct RunController {
    state: RunState,
    config: RunConfig,
    counters: RunCounters,
}

impl RunController {
    pub fn new(config: RunConfig) -> Self {
        Self {
            state: RunState::Starting,
            config,
            counters: RunCounters::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "Run state change");
        self.state = next;
    }

    /// Full run: connect the sinks, open the dump, then stream it.
    ///
    /// Sinks are connected before the input is opened. A failure in either step is
    /// fatal and leaves the controller in `Failed`.
    pub async fn run<P, S, Q, F>(
        mut self,
        input: &Path,
        transformer: &PageTransformer<P>,
        connect: F,
    ) -> Result<RunSummary>
    where
        P: MarkupParser,
        S: RecordStore,
        Q: JobQueue,
        F: Future<Output = Result<Dispatcher<S, Q>>>,
    {
        let dispatcher = match connect.await {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                self.transition(RunState::Failed);
                error!(error = %format!("{e:#}"), "Cannot connect to the store");
                return Err(e);
            }
        };

        let reader = match WikiReader::open(input) {
            Ok(reader) => reader,
            Err(e) => {
                self.transition(RunState::Failed);
                error!(error = %e, "Cannot open input");
                close_sinks(dispatcher).await;
                return Err(e.into());
            }
        };

        info!(input = %input.display(), queued = dispatcher.is_queued(), "Streaming dump");
        Ok(self.stream(reader, transformer, dispatcher).await)
    }

    /// Drives pages through the dispatcher, then drains and reports.
    ///
    /// A parse error in the source ends the stream but not the run; pages already
    /// dispatched stay dispatched.
    pub async fn stream<I, P, S, Q>(
        mut self,
        pages: I,
        transformer: &PageTransformer<P>,
        dispatcher: Dispatcher<S, Q>,
    ) -> RunSummary
    where
        I: IntoIterator<Item = Result<RawPage, IngestError>>,
        P: MarkupParser,
        S: RecordStore,
        Q: JobQueue,
    {
        let start = Instant::now();
        self.transition(RunState::Streaming);

        let pb = if self.config.show_progress {
            make_spinner()
        } else {
            ProgressBar::hidden()
        };

        let mut pages_seen = 0u64;
        let mut stream_error = None;

        for item in pages {
            let page = match item {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, pages_seen, "Parsing failed, ending stream");
                    stream_error = Some(e.to_string());
                    break;
                }
            };
            if !page.is_article() {
                continue;
            }

            pages_seen += 1;
            pb.set_message(format!("{pages_seen:>9}  {}", page.title));
            debug!(index = pages_seen, title = %page.title, "Processing page");

            dispatcher.dispatch(&page, transformer, &self.counters).await;

            if self.config.limit.is_some_and(|limit| pages_seen >= limit) {
                info!(limit = pages_seen, "Page limit reached");
                break;
            }
        }
        pb.finish_and_clear();

        self.transition(RunState::Draining);
        let mut pending_jobs = None;
        if let Some(queue) = dispatcher.queue() {
            info!(
                grace_secs = self.config.drain_grace.as_secs_f64(),
                "Letting the queue finish up"
            );
            tokio::time::sleep(self.config.drain_grace).await;
            match queue.pending().await {
                Ok(0) => pending_jobs = Some(0),
                Ok(pending) => {
                    warn!(pending, "Jobs still queued after the drain period");
                    pending_jobs = Some(pending);
                }
                Err(e) => warn!(error = %format!("{e:#}"), "Failed to read queue backlog"),
            }
        }

        self.transition(RunState::Done);
        let stored_total = match dispatcher.store().count().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Failed to count stored articles");
                None
            }
        };

        close_sinks(dispatcher).await;

        RunSummary {
            state: self.state,
            counts: self.counters.snapshot(),
            pages_seen,
            stored_total,
            stream_error,
            pending_jobs,
            elapsed: start.elapsed(),
        }
    }
}

/// Closes the store and, in queued mode, the queue. Close errors are only logged.
async fn close_sinks<S: RecordStore, Q: JobQueue>(dispatcher: Dispatcher<S, Q>) {
    let (store, queue) = dispatcher.into_parts();
    if let Err(e) = store.close().await {
        warn!(error = %format!("{e:#}"), "Failed to close store");
    }
    if let Some(queue) = queue {
        if let Err(e) = queue.close().await {
            warn!(error = %format!("{e:#}"), "Failed to close queue");
        }
    }
}

fn make_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::WikitextParser;
    use crate::queue::{RetryPolicy, SqliteQueue};
    use crate::store::MemoryStore;
    use crate::transform::TransformOptions;
    use tempfile::TempDir;

    fn page(title: &str, ns: &str, text: &str) -> RawPage {
        RawPage {
            title: title.to_string(),
            namespace: ns.to_string(),
            page_id: None,
            wiki_text: text.to_string(),
            redirect: false,
        }
    }

    fn transformer() -> PageTransformer<WikitextParser> {
        PageTransformer::new(WikitextParser::new(), TransformOptions::default())
    }

    fn quick_config() -> RunConfig {
        RunConfig {
            drain_grace: Duration::ZERO,
            ..RunConfig::default()
        }
    }

    #[test]
    fn starts_in_starting_state() {
        assert_eq!(RunController::new(RunConfig::default()).state(), RunState::Starting);
        assert_eq!(RunConfig::default().drain_grace, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn parse_error_ends_stream_but_run_completes() {
        let pages = vec![
            Ok(page("A", "0", "a")),
            Ok(page("B", "0", "b")),
            Err(IngestError::MalformedSource("bad tag".to_string())),
            Ok(page("C", "0", "never reached")),
        ];
        let dispatcher: Dispatcher<_, SqliteQueue> = Dispatcher::direct(MemoryStore::new());
        let summary = RunController::new(quick_config())
            .stream(pages, &transformer(), dispatcher)
            .await;

        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.counts.processed, 2);
        assert_eq!(summary.stored_total, Some(2));
        assert!(summary.stream_error.unwrap().contains("bad tag"));
        assert_eq!(summary.pending_jobs, None);
    }

    #[tokio::test]
    async fn non_article_pages_are_ignored() {
        let pages = vec![Ok(page("Talk:A", "1", "x")), Ok(page("A", "0", "a"))];
        let dispatcher: Dispatcher<_, SqliteQueue> = Dispatcher::direct(MemoryStore::new());
        let summary = RunController::new(quick_config())
            .stream(pages, &transformer(), dispatcher)
            .await;
        assert_eq!(summary.pages_seen, 1);
        assert_eq!(summary.counts.processed, 1);
    }

    #[tokio::test]
    async fn limit_stops_streaming() {
        let pages = (0..10).map(|i| Ok(page(&format!("P{i}"), "0", "x")));
        let dispatcher: Dispatcher<_, SqliteQueue> = Dispatcher::direct(MemoryStore::new());
        let config = RunConfig {
            limit: Some(3),
            ..quick_config()
        };
        let summary = RunController::new(config)
            .stream(pages, &transformer(), dispatcher)
            .await;
        assert_eq!(summary.pages_seen, 3);
        assert_eq!(summary.stored_total, Some(3));
    }

    #[tokio::test]
    async fn queued_run_reports_backlog() {
        let dir = TempDir::new().unwrap();
        let queue = SqliteQueue::open(&dir.path().join("q.db")).await.unwrap();
        let dispatcher = Dispatcher::queued(MemoryStore::new(), queue, RetryPolicy::default());
        let pages = vec![Ok(page("A", "0", "a")), Ok(page("B", "0", "b"))];

        let summary = RunController::new(quick_config())
            .stream(pages, &transformer(), dispatcher)
            .await;
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.counts.processed, 2);
        assert_eq!(summary.pending_jobs, Some(2));
        assert_eq!(summary.stored_total, Some(0));
    }

    #[tokio::test]
    async fn queued_run_closes_queue_with_jobs_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("q.db");
        let queue = SqliteQueue::open(&path).await.unwrap();
        let dispatcher = Dispatcher::queued(MemoryStore::new(), queue, RetryPolicy::default());
        let pages = vec![Ok(page("A", "0", "a")), Ok(page("B", "0", "b"))];

        RunController::new(quick_config())
            .stream(pages, &transformer(), dispatcher)
            .await;

        // Closing the last connection checkpoints and removes the WAL file
        assert!(!dir.path().join("q.db-wal").exists());
        let reopened = SqliteQueue::open(&path).await.unwrap();
        assert_eq!(reopened.pending().await.unwrap(), 2);
        assert_eq!(reopened.scheduled().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn missing_input_is_fatal() {
        let result = RunController::new(quick_config())
            .run(
                Path::new("/no/such/dump.xml.bz2"),
                &transformer(),
                async { Ok::<_, anyhow::Error>(Dispatcher::<_, SqliteQueue>::direct(MemoryStore::new())) },
            )
            .await;
        let err = result.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<IngestError>(),
            Some(IngestError::SourceUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn store_connect_failure_is_fatal() {
        let connect = async {
            Err::<Dispatcher<MemoryStore, SqliteQueue>, _>(anyhow::Error::from(
                IngestError::StoreUnavailable("refused".to_string()),
            ))
        };
        let result = RunController::new(quick_config())
            .run(Path::new("/unused"), &transformer(), connect)
            .await;
        assert!(result.is_err());
    }
}
