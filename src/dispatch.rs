use crate::config::JOB_TYPE_ARTICLE;
use crate::markup::MarkupParser;
use crate::models::{RawPage, Record};
use crate::queue::{ArticleJob, JobQueue, RetryPolicy};
use crate::stats::RunCounters;
use crate::store::RecordStore;
use crate::transform::{Outcome, PageTransformer, SkipReason, TransformOptions};
use tracing::{debug, warn};

/// Chosen once per run.
pub enum DispatchMode<Q> {
    /// Transform in-process and write straight to the store
    Direct,
    /// Hand the raw page to the queue; a worker transforms and writes it
    Queued { queue: Q, policy: RetryPolicy },
}

/// What happened to one page after it reached the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchAck {
    Stored { id: Option<String> },
    StoreFailed,
    Enqueued { job_id: i64 },
    EnqueueFailed,
    Skipped(SkipReason),
}

impl DispatchAck {
    pub fn is_failure(&self) -> bool {
        matches!(self, DispatchAck::StoreFailed | DispatchAck::EnqueueFailed)
    }
}

pub struct Dispatcher<S, Q> {
    store: S,
    mode: DispatchMode<Q>,
}

impl<S: RecordStore, Q: JobQueue> Dispatcher<S, Q> {
    pub fn direct(store: S) -> Self {
        Self {
            store,
            mode: DispatchMode::Direct,
        }
    }

    pub fn queued(store: S, queue: Q, policy: RetryPolicy) -> Self {
        Self {
            store,
            mode: DispatchMode::Queued { queue, policy },
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self.mode, DispatchMode::Queued { .. })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn queue(&self) -> Option<&Q> {
        match &self.mode {
            DispatchMode::Direct => None,
            DispatchMode::Queued { queue, .. } => Some(queue),
        }
    }

    pub fn into_parts(self) -> (S, Option<Q>) {
        match self.mode {
            DispatchMode::Direct => (self.store, None),
            DispatchMode::Queued { queue, .. } => (self.store, Some(queue)),
        }
    }

    /// Routes one page: transform and upsert in direct mode, enqueue in queued mode.
    /// Failures are logged and reported in the ack; they never stop the run.
    pub async fn dispatch<P: MarkupParser>(
        &self,
        page: &RawPage,
        transformer: &PageTransformer<P>,
        counters: &RunCounters,
    ) -> DispatchAck {
        match &self.mode {
            DispatchMode::Direct => match transformer.transform(page, counters) {
                Outcome::Transformed(record) => self.write(&record, counters).await,
                Outcome::Skipped(reason) => DispatchAck::Skipped(reason),
            },
            DispatchMode::Queued { queue, policy } => {
                let job = job_for(page, transformer.options());
                counters.inc_processed();
                match queue.enqueue(JOB_TYPE_ARTICLE, &job, policy).await {
                    Ok(job_id) => {
                        debug!(title = %page.title, job_id, "Enqueued article");
                        DispatchAck::Enqueued { job_id }
                    }
                    Err(e) => {
                        counters.inc_dispatch_failures();
                        warn!(title = %page.title, error = %format!("{e:#}"), "Failed to enqueue article");
                        DispatchAck::EnqueueFailed
                    }
                }
            }
        }
    }

    async fn write(&self, record: &Record, counters: &RunCounters) -> DispatchAck {
        counters.inc_processed();
        match self.store.upsert(record).await {
            Ok(()) => DispatchAck::Stored {
                id: record.id.clone(),
            },
            Err(e) => {
                counters.inc_dispatch_failures();
                warn!(title = %record.title, error = %format!("{e:#}"), "Failed to store article");
                DispatchAck::StoreFailed
            }
        }
    }
}

/// Payload carrying the raw page plus the run's filter flags.
pub fn job_for(page: &RawPage, options: &TransformOptions) -> ArticleJob {
    let media = options.media_filter.as_ref().map(|set| {
        let mut media: Vec<String> = set.iter().cloned().collect();
        media.sort();
        media
    });
    ArticleJob {
        title: page.title.clone(),
        wiki: page.wiki_text.clone(),
        skip_redirects: options.skip_redirects,
        skip_disambig: options.skip_disambiguation,
        page_id: page.page_id.clone(),
        plaintext: options.plain_text_mode,
        media,
        redirect: page.redirect,
    }
}
