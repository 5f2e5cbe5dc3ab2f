//! Durable job queue for deferred article writes.
//!
//! Jobs live in a SQLite file so they survive a restart of either the producer or the
//! workers. A job is removed once it completes; failures are rescheduled with backoff
//! until the policy's attempt budget is spent, after which the job stays in the
//! `failed` state for inspection.

use crate::config::{QUEUE_BACKOFF_INITIAL_SECS, QUEUE_MAX_ATTEMPTS};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl BackoffKind {
    fn as_str(&self) -> &'static str {
        match self {
            BackoffKind::Fixed => "fixed",
            BackoffKind::Exponential => "exponential",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "fixed" => BackoffKind::Fixed,
            _ => BackoffKind::Exponential,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub kind: BackoffKind,
}

impl Backoff {
    /// Wait before the next attempt after `failed_attempts` failures (1-based).
    /// Exponential doubles from `initial`: 10s, 20s, 40s, ...
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.initial,
            BackoffKind::Exponential => {
                let exponent = failed_attempts.saturating_sub(1).min(16);
                self.initial.saturating_mul(1 << exponent)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: QUEUE_MAX_ATTEMPTS,
            backoff: Backoff {
                initial: Duration::from_secs(QUEUE_BACKOFF_INITIAL_SECS),
                kind: BackoffKind::Exponential,
            },
        }
    }
}

/// Everything a worker needs to redo transform and write for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleJob {
    pub title: String,
    pub wiki: String,
    pub skip_redirects: bool,
    pub skip_disambig: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub plaintext: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<String>>,
    /// The dump flagged the page with `<redirect/>`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub redirect: bool,
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub job_type: String,
    pub payload: ArticleJob,
    /// Attempts so far, this one included
    pub attempts: u32,
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFate {
    Retrying { attempts: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

pub trait JobQueue: Send + Sync {
    /// Persists a job and returns its id.
    fn enqueue(
        &self,
        job_type: &str,
        payload: &ArticleJob,
        policy: &RetryPolicy,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Takes the oldest due job of `job_type`, counting the attempt.
    fn claim(&self, job_type: &str) -> impl Future<Output = Result<Option<ClaimedJob>>> + Send;

    /// Removes a finished job.
    fn complete(&self, job_id: i64) -> impl Future<Output = Result<()>> + Send;

    /// Reschedules with backoff, or parks the job as failed once attempts run out.
    fn fail(&self, job: &ClaimedJob, error: &str) -> impl Future<Output = Result<JobFate>> + Send;

    /// Jobs not yet completed or failed for good.
    fn pending(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Jobs waiting to be claimed, due now or later. Excludes jobs held by a worker.
    fn scheduled(&self) -> impl Future<Output = Result<u64>> + Send;

    fn close(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized;
}

const SQL_CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'queued',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    backoff_ms INTEGER NOT NULL,
    backoff_kind TEXT NOT NULL,
    run_at INTEGER NOT NULL,
    last_error TEXT,
    created_at INTEGER NOT NULL
)";

const SQL_CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS jobs_ready ON jobs (state, job_type, run_at)";

const SQL_CLAIM: &str = "UPDATE jobs SET state = 'active', attempts = attempts + 1
WHERE id = (
    SELECT id FROM jobs
    WHERE state = 'queued' AND job_type = ?1 AND run_at <= ?2 AND attempts < max_attempts
    ORDER BY run_at, id
    LIMIT 1
)
RETURNING id, job_type, payload, attempts, max_attempts, backoff_ms, backoff_kind";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    job_type: String,
    payload: String,
    attempts: i64,
    max_attempts: i64,
    backoff_ms: i64,
    backoff_kind: String,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open job queue at {:?}", path))?;

        sqlx::query(SQL_CREATE_TABLE)
            .execute(&pool)
            .await
            .context("Failed to create jobs table")?;
        sqlx::query(SQL_CREATE_INDEX)
            .execute(&pool)
            .await
            .context("Failed to create jobs index")?;

        debug!(path = %path.display(), "Job queue opened");
        Ok(Self { pool })
    }

    /// Puts jobs left `active` by a crashed worker back in line, or parks them as
    /// failed when the interrupted attempt was their last. Only safe while no other
    /// worker is running against the same file.
    pub async fn recover_active(&self) -> Result<u64> {
        let exhausted = sqlx::query(
            "UPDATE jobs SET state = 'failed', last_error = 'interrupted on final attempt'
             WHERE state = 'active' AND attempts >= max_attempts",
        )
        .execute(&self.pool)
        .await
        .context("Failed to park exhausted jobs")?
        .rows_affected();
        if exhausted > 0 {
            warn!(exhausted, "Interrupted jobs had no attempts left");
        }

        let recovered = sqlx::query("UPDATE jobs SET state = 'queued' WHERE state = 'active'")
            .execute(&self.pool)
            .await
            .context("Failed to recover active jobs")?
            .rows_affected();
        if recovered > 0 {
            info!(recovered, "Requeued jobs interrupted by a previous worker");
        }
        Ok(recovered)
    }

    pub async fn failed(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = 'failed'")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count failed jobs")?;
        Ok(count.max(0) as u64)
    }

    async fn park_undecodable(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = 'failed', last_error = ?1 WHERE id = ?2")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to park undecodable job")?;
        Ok(())
    }
}

impl JobQueue for SqliteQueue {
    async fn enqueue(&self, job_type: &str, payload: &ArticleJob, policy: &RetryPolicy) -> Result<i64> {
        let payload = serde_json::to_string(payload).context("Failed to serialize job payload")?;
        let now = now_millis();
        let result = sqlx::query(
            "INSERT INTO jobs (job_type, payload, max_attempts, backoff_ms, backoff_kind, run_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )
        .bind(job_type)
        .bind(payload)
        .bind(i64::from(policy.max_attempts))
        .bind(policy.backoff.initial.as_millis() as i64)
        .bind(policy.backoff.kind.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to enqueue job")?;
        Ok(result.last_insert_rowid())
    }

    async fn claim(&self, job_type: &str) -> Result<Option<ClaimedJob>> {
        loop {
            let row: Option<JobRow> = sqlx::query_as(SQL_CLAIM)
                .bind(job_type)
                .bind(now_millis())
                .fetch_optional(&self.pool)
                .await
                .context("Failed to claim job")?;

            let Some(row) = row else {
                return Ok(None);
            };

            match serde_json::from_str::<ArticleJob>(&row.payload) {
                Ok(payload) => {
                    return Ok(Some(ClaimedJob {
                        id: row.id,
                        job_type: row.job_type,
                        payload,
                        attempts: row.attempts.max(0) as u32,
                        policy: RetryPolicy {
                            max_attempts: row.max_attempts.max(1) as u32,
                            backoff: Backoff {
                                initial: Duration::from_millis(row.backoff_ms.max(0) as u64),
                                kind: BackoffKind::parse(&row.backoff_kind),
                            },
                        },
                    }));
                }
                Err(e) => {
                    warn!(job_id = row.id, error = %e, "Dropping job with undecodable payload");
                    self.park_undecodable(row.id, &e.to_string()).await?;
                }
            }
        }
    }

    async fn complete(&self, job_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("Failed to remove completed job")?;
        Ok(())
    }

    async fn fail(&self, job: &ClaimedJob, error: &str) -> Result<JobFate> {
        if job.attempts >= job.policy.max_attempts {
            sqlx::query("UPDATE jobs SET state = 'failed', last_error = ?1 WHERE id = ?2")
                .bind(error)
                .bind(job.id)
                .execute(&self.pool)
                .await
                .context("Failed to mark job failed")?;
            return Ok(JobFate::Exhausted {
                attempts: job.attempts,
            });
        }

        let delay = job.policy.backoff.delay_for(job.attempts);
        sqlx::query("UPDATE jobs SET state = 'queued', run_at = ?1, last_error = ?2 WHERE id = ?3")
            .bind(now_millis() + delay.as_millis() as i64)
            .bind(error)
            .bind(job.id)
            .execute(&self.pool)
            .await
            .context("Failed to reschedule job")?;
        Ok(JobFate::Retrying {
            attempts: job.attempts,
            delay,
        })
    }

    async fn pending(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state IN ('queued', 'active')")
                .fetch_one(&self.pool)
                .await
                .context("Failed to count pending jobs")?;
        Ok(count.max(0) as u64)
    }

    async fn scheduled(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = 'queued'")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count scheduled jobs")?;
        Ok(count.max(0) as u64)
    }

    async fn close(self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job(title: &str) -> ArticleJob {
        ArticleJob {
            title: title.to_string(),
            wiki: "body".to_string(),
            skip_redirects: true,
            skip_disambig: false,
            page_id: None,
            plaintext: false,
            media: None,
            redirect: false,
        }
    }

    async fn open_queue(dir: &TempDir) -> SqliteQueue {
        SqliteQueue::open(&dir.path().join("queue.db")).await.unwrap()
    }

    /// Retries immediately so tests can reclaim without waiting.
    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff {
                initial: Duration::ZERO,
                kind: BackoffKind::Exponential,
            },
        }
    }

    #[test]
    fn default_policy_is_three_attempts_from_ten_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.backoff.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.backoff.delay_for(3), Duration::from_secs(40));
    }

    #[test]
    fn fixed_backoff_does_not_grow() {
        let backoff = Backoff {
            initial: Duration::from_secs(5),
            kind: BackoffKind::Fixed,
        };
        assert_eq!(backoff.delay_for(4), Duration::from_secs(5));
    }

    #[test]
    fn payload_wire_shape() {
        let value = serde_json::to_value(job("Alien")).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "title": "Alien",
                "wiki": "body",
                "skipRedirects": true,
                "skipDisambig": false,
            })
        );
    }

    #[tokio::test]
    async fn claim_then_complete_removes_job() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;
        let id = queue
            .enqueue("article", &job("A"), &RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(queue.pending().await.unwrap(), 1);

        let claimed = queue.claim("article").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.payload, job("A"));
        assert!(queue.claim("article").await.unwrap().is_none());

        queue.complete(claimed.id).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 0);
        assert_eq!(queue.failed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claim_respects_job_type_and_order() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;
        queue.enqueue("other", &job("X"), &RetryPolicy::default()).await.unwrap();
        queue.enqueue("article", &job("First"), &RetryPolicy::default()).await.unwrap();
        queue.enqueue("article", &job("Second"), &RetryPolicy::default()).await.unwrap();

        let a = queue.claim("article").await.unwrap().unwrap();
        let b = queue.claim("article").await.unwrap().unwrap();
        assert_eq!(a.payload.title, "First");
        assert_eq!(b.payload.title, "Second");
        assert!(queue.claim("article").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_backs_off_before_retry() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;
        queue.enqueue("article", &job("A"), &RetryPolicy::default()).await.unwrap();

        let claimed = queue.claim("article").await.unwrap().unwrap();
        let fate = queue.fail(&claimed, "store down").await.unwrap();
        assert_eq!(
            fate,
            JobFate::Retrying {
                attempts: 1,
                delay: Duration::from_secs(10)
            }
        );
        // Not due for another ten seconds
        assert!(queue.claim("article").await.unwrap().is_none());
        assert_eq!(queue.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;
        queue.enqueue("article", &job("A"), &instant_policy(3)).await.unwrap();

        let mut fates = Vec::new();
        while let Some(claimed) = queue.claim("article").await.unwrap() {
            fates.push(queue.fail(&claimed, "boom").await.unwrap());
        }

        assert_eq!(fates.len(), 3);
        assert_eq!(fates[2], JobFate::Exhausted { attempts: 3 });
        assert_eq!(queue.pending().await.unwrap(), 0);
        assert_eq!(queue.failed().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn jobs_survive_reopen_and_active_jobs_recover() {
        let dir = TempDir::new().unwrap();
        {
            let queue = open_queue(&dir).await;
            queue.enqueue("article", &job("A"), &RetryPolicy::default()).await.unwrap();
            queue.claim("article").await.unwrap().unwrap();
            queue.close().await.unwrap();
        }

        let queue = open_queue(&dir).await;
        assert!(queue.claim("article").await.unwrap().is_none());
        assert_eq!(queue.recover_active().await.unwrap(), 1);
        let claimed = queue.claim("article").await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 2);
    }

    #[tokio::test]
    async fn interrupted_final_attempt_is_not_claimed_again() {
        let dir = TempDir::new().unwrap();
        {
            let queue = open_queue(&dir).await;
            queue.enqueue("article", &job("A"), &instant_policy(1)).await.unwrap();
            let claimed = queue.claim("article").await.unwrap().unwrap();
            assert_eq!(claimed.attempts, 1);
            queue.close().await.unwrap();
        }

        let queue = open_queue(&dir).await;
        assert_eq!(queue.recover_active().await.unwrap(), 0);
        assert!(queue.claim("article").await.unwrap().is_none());
        assert_eq!(queue.pending().await.unwrap(), 0);
        assert_eq!(queue.failed().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scheduled_counts_only_unclaimed_jobs() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;
        queue.enqueue("article", &job("A"), &RetryPolicy::default()).await.unwrap();
        queue.enqueue("article", &job("B"), &RetryPolicy::default()).await.unwrap();

        let claimed = queue.claim("article").await.unwrap().unwrap();
        assert_eq!(queue.scheduled().await.unwrap(), 1);
        assert_eq!(queue.pending().await.unwrap(), 2);

        // Backed-off jobs are still scheduled even though they are not due
        queue.fail(&claimed, "store down").await.unwrap();
        assert_eq!(queue.scheduled().await.unwrap(), 2);
    }

    #[test]
    fn redirect_marker_travels_with_payload() {
        let mut j = job("Old name");
        j.redirect = true;
        let value = serde_json::to_value(&j).unwrap();
        assert_eq!(value["redirect"], true);
        let back: ArticleJob = serde_json::from_value(value).unwrap();
        assert!(back.redirect);
    }
}
