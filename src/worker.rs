//! Queue consumer: claims article jobs, transforms them and writes the records.
//!
//! Each job is retried by the queue with backoff when the store write fails. Skipped
//! pages count as done, since a rerun would make the same decision.

use crate::config::{JOB_TYPE_ARTICLE, MAIN_NAMESPACE, WORKER_CONCURRENCY, WORKER_POLL_INTERVAL_MS};
use crate::markup::MarkupParser;
use crate::models::RawPage;
use crate::queue::{ArticleJob, ClaimedJob, JobFate, JobQueue};
use crate::stats::RunCounters;
use crate::store::RecordStore;
use crate::transform::{Outcome, PageTransformer, SkipReason, TransformOptions};
use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs processed at once
    pub concurrency: usize,
    /// Return once nothing is in flight and no job is left waiting, backed-off
    /// retries included
    pub exit_when_empty: bool,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: WORKER_CONCURRENCY,
            exit_when_empty: false,
            poll_interval: Duration::from_millis(WORKER_POLL_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub stored: u64,
    pub skipped: u64,
    pub retried: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobResult {
    Stored,
    Skipped(SkipReason),
    Retrying,
    Exhausted,
}

/// Rebuilds the transform options the producer recorded in the job. The custom
/// transform and logging flags come from the worker's own options.
pub fn options_for(job: &ArticleJob, base: &TransformOptions) -> TransformOptions {
    TransformOptions {
        skip_redirects: job.skip_redirects,
        skip_disambiguation: job.skip_disambig,
        media_filter: job.media.as_ref().map(|media| media.iter().cloned().collect()),
        plain_text_mode: job.plaintext,
        custom_transform: base.custom_transform.clone(),
        verbose_skip: base.verbose_skip,
    }
}

fn page_for(job: &ArticleJob) -> RawPage {
    RawPage {
        title: job.title.clone(),
        namespace: MAIN_NAMESPACE.to_string(),
        page_id: job.page_id.clone(),
        wiki_text: job.wiki.clone(),
        redirect: job.redirect,
    }
}

/// Removes a finished job, trying twice. A job that still cannot be removed stays
/// `active` until the next `recover_active`; the record itself is already written.
async fn finish_job<Q: JobQueue>(queue: &Q, job_id: i64) {
    if let Err(first) = queue.complete(job_id).await {
        debug!(job_id, error = %format!("{first:#}"), "Completing job failed, retrying");
        if let Err(e) = queue.complete(job_id).await {
            warn!(job_id, error = %format!("{e:#}"), "Failed to mark job complete");
        }
    }
}

async fn fail_job<Q: JobQueue>(queue: &Q, job: &ClaimedJob, message: &str) -> Result<JobResult> {
    match queue.fail(job, message).await? {
        JobFate::Retrying { attempts, delay } => {
            warn!(
                job_id = job.id,
                title = %job.payload.title,
                attempts,
                retry_in_secs = delay.as_secs_f64(),
                error = %message,
                "Job failed, will retry"
            );
            Ok(JobResult::Retrying)
        }
        JobFate::Exhausted { attempts } => {
            warn!(
                job_id = job.id,
                title = %job.payload.title,
                attempts,
                error = %message,
                "Job failed, giving up"
            );
            Ok(JobResult::Exhausted)
        }
    }
}

async fn process_job<P, S, Q>(
    job: ClaimedJob,
    queue: Arc<Q>,
    store: Arc<S>,
    transformer: Arc<PageTransformer<P>>,
    counters: Arc<RunCounters>,
) -> Result<JobResult>
where
    P: MarkupParser,
    S: RecordStore,
    Q: JobQueue,
{
    let options = options_for(&job.payload, transformer.options());
    let page = page_for(&job.payload);

    let record = match transformer.transform_with(&page, &options, &counters) {
        Outcome::Transformed(record) => record,
        Outcome::Skipped(reason) => {
            finish_job(queue.as_ref(), job.id).await;
            return Ok(JobResult::Skipped(reason));
        }
    };

    counters.inc_processed();
    match store.upsert(&record).await {
        Ok(()) => {
            finish_job(queue.as_ref(), job.id).await;
            debug!(job_id = job.id, title = %record.title, "Job done");
            Ok(JobResult::Stored)
        }
        Err(e) => {
            counters.inc_dispatch_failures();
            fail_job(queue.as_ref(), &job, &format!("{e:#}")).await
        }
    }
}

/// True once no job is left waiting for a claim.
async fn nothing_scheduled<Q: JobQueue>(queue: &Q) -> bool {
    match queue.scheduled().await {
        Ok(0) => true,
        Ok(scheduled) => {
            debug!(scheduled, "Waiting for backed-off jobs");
            false
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "Failed to count scheduled jobs");
            false
        }
    }
}

/// Claims and processes article jobs with up to `config.concurrency` in flight.
///
/// With `exit_when_empty` it returns once nothing is in flight and no job is
/// scheduled, waiting out backoff delays first; otherwise it polls forever. Queue
/// errors and failed job tasks are logged and do not stop the worker.
pub async fn run_worker<P, S, Q>(
    queue: Arc<Q>,
    store: Arc<S>,
    transformer: Arc<PageTransformer<P>>,
    counters: Arc<RunCounters>,
    config: WorkerConfig,
) -> Result<WorkerReport>
where
    P: MarkupParser + 'static,
    S: RecordStore + 'static,
    Q: JobQueue + 'static,
{
    let concurrency = config.concurrency.max(1);
    let mut in_flight = FuturesUnordered::new();
    let mut report = WorkerReport::default();

    info!(concurrency, "Worker started");

    loop {
        let mut claim_failed = false;
        while in_flight.len() < concurrency {
            match queue.claim(JOB_TYPE_ARTICLE).await {
                Ok(Some(job)) => {
                    debug!(job_id = job.id, title = %job.payload.title, attempt = job.attempts, "Claimed job");
                    let claimed = job.clone();
                    let handle = tokio::spawn(process_job(
                        job,
                        Arc::clone(&queue),
                        Arc::clone(&store),
                        Arc::clone(&transformer),
                        Arc::clone(&counters),
                    ));
                    in_flight.push(async move { (claimed, handle.await) });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Failed to claim job");
                    claim_failed = true;
                    break;
                }
            }
        }

        let Some((claimed, join_result)) = in_flight.next().await else {
            if config.exit_when_empty && !claim_failed && nothing_scheduled(queue.as_ref()).await {
                break;
            }
            tokio::time::sleep(config.poll_interval).await;
            continue;
        };

        let result = match join_result {
            Ok(result) => result,
            Err(e) => {
                counters.inc_dispatch_failures();
                fail_job(queue.as_ref(), &claimed, &format!("worker task failed: {e}")).await
            }
        };

        match result {
            Ok(JobResult::Stored) => report.stored += 1,
            Ok(JobResult::Skipped(reason)) => {
                debug!(%reason, "Job skipped");
                report.skipped += 1;
            }
            Ok(JobResult::Retrying) => report.retried += 1,
            Ok(JobResult::Exhausted) => report.failed += 1,
            Err(e) => warn!(job_id = claimed.id, error = %format!("{e:#}"), "Job bookkeeping failed"),
        }
    }

    info!(
        stored = report.stored,
        skipped = report.skipped,
        retried = report.retried,
        failed = report.failed,
        "Queue drained"
    );
    Ok(report)
}
