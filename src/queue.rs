use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, Notify, broadcast};

use crate::config::{Limits, QueueConfig};
use crate::database as db;
use crate::database::QueueCounts;

/// One unit of judging work handed to a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedJob {
    pub job_id: i64,
    pub submission_id: i64,
    pub limits: Limits,
}

/// Payload attached to a completed job.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JobSummary {
    pub verdict: String,
    pub duration_ms: u64,
}

/// Lifecycle events out-of-scope logic subscribes to for progress tracking.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueEvent {
    Waiting {
        job_id: i64,
        submission_id: i64,
    },
    Active {
        job_id: i64,
        submission_id: i64,
    },
    Completed {
        job_id: i64,
        submission_id: i64,
        verdict: String,
        duration_ms: u64,
    },
    Failed {
        job_id: i64,
        submission_id: i64,
        error: String,
    },
}

/// Durable judging queue.
///
/// The `judge_jobs` table is the source of truth — jobs survive a process
/// restart and are re-dispatched by `recover` — while an in-memory deque
/// drives dispatch to workers. At most one worker ever holds a job.
///
/// Failures reaching `fail` are infrastructure faults by contract: judged
/// outcomes are written by the worker as final results and complete the job
/// instead, so they are never retried.
pub struct JobQueue {
    db_pool: Arc<SqlitePool>,
    config: QueueConfig,
    ready: Arc<Mutex<VecDeque<QueuedJob>>>,
    notify: Arc<Notify>,
    events: broadcast::Sender<QueueEvent>,
}

impl JobQueue {
    pub fn new(db_pool: Arc<SqlitePool>, config: QueueConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            db_pool,
            config,
            ready: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Re-dispatches jobs left over from a previous process: still-waiting
    /// rows plus jobs that were active when the process died.
    pub async fn recover(&self) -> Result<usize> {
        let rows = db::fetch_resumable_jobs(self.db_pool.clone()).await?;
        let count = rows.len();

        for row in rows {
            db::mark_job_waiting(row.id, self.db_pool.clone()).await?;
            let job = QueuedJob {
                job_id: row.id,
                submission_id: row.submission_id,
                limits: row.limits,
            };
            self.push(job).await;
        }

        if count > 0 {
            log::info!("Recovered {count} unfinished job(s) from the database");
        }
        Ok(count)
    }

    /// Persists a new job and queues it for dispatch.
    pub async fn enqueue(&self, submission_id: i64, limits: Limits) -> Result<i64> {
        let job_id = db::insert_job(submission_id, limits, self.db_pool.clone()).await?;
        let job = QueuedJob {
            job_id,
            submission_id,
            limits,
        };

        self.emit(QueueEvent::Waiting {
            job_id,
            submission_id,
        });
        self.push(job).await;

        log::info!("Job {job_id} enqueued for submission {submission_id}");
        Ok(job_id)
    }

    /// Takes the next job, waiting until one is available.
    ///
    /// `notify_one` stores at most a single permit, so a burst of pushes can
    /// wake fewer workers than there are jobs; whoever wakes passes the
    /// baton on while the deque is non-empty.
    pub async fn pop(&self) -> QueuedJob {
        loop {
            {
                let mut ready = self.ready.lock().await;
                if let Some(job) = ready.pop_front() {
                    if !ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return job;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks a popped job as held by a worker.
    pub async fn mark_active(&self, job: &QueuedJob) -> Result<()> {
        db::mark_job_active(job.job_id, self.db_pool.clone()).await?;
        self.emit(QueueEvent::Active {
            job_id: job.job_id,
            submission_id: job.submission_id,
        });
        Ok(())
    }

    /// Records a judged outcome and retires the job.
    pub async fn complete(&self, job: &QueuedJob, summary: JobSummary) -> Result<()> {
        let payload = serde_json::to_string(&summary)?;
        db::complete_job(job.job_id, &payload, self.db_pool.clone()).await?;

        self.emit(QueueEvent::Completed {
            job_id: job.job_id,
            submission_id: job.submission_id,
            verdict: summary.verdict,
            duration_ms: summary.duration_ms,
        });

        let pruned =
            db::prune_jobs("completed", self.config.keep_completed, self.db_pool.clone()).await?;
        if pruned > 0 {
            log::debug!("Pruned {pruned} old completed job(s)");
        }
        Ok(())
    }

    /// Handles an infrastructure fault: retries with exponential backoff
    /// until the attempt budget runs out, then marks the job failed.
    pub async fn fail(&self, job: &QueuedJob, error: &str) -> Result<()> {
        let attempts = db::record_job_attempt(job.job_id, self.db_pool.clone()).await?;

        if attempts <= self.config.max_attempts {
            let delay = self.backoff_delay(attempts);
            log::warn!(
                "Job {} attempt {attempts} failed ({error}), retrying in {}ms",
                job.job_id,
                delay.as_millis()
            );
            db::mark_job_waiting(job.job_id, self.db_pool.clone()).await?;

            let ready = Arc::clone(&self.ready);
            let notify = Arc::clone(&self.notify);
            let events = self.events.clone();
            let job = job.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(QueueEvent::Waiting {
                    job_id: job.job_id,
                    submission_id: job.submission_id,
                });
                ready.lock().await.push_back(job);
                notify.notify_one();
            });
            return Ok(());
        }

        log::error!(
            "Job {} failed after {attempts} attempt(s): {error}",
            job.job_id
        );
        db::fail_job(job.job_id, error, self.db_pool.clone()).await?;
        self.emit(QueueEvent::Failed {
            job_id: job.job_id,
            submission_id: job.submission_id,
            error: error.to_string(),
        });

        let pruned = db::prune_jobs("failed", self.config.keep_failed, self.db_pool.clone()).await?;
        if pruned > 0 {
            log::debug!("Pruned {pruned} old failed job(s)");
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<QueueCounts> {
        Ok(db::count_jobs(self.db_pool.clone()).await?)
    }

    /// Exponential backoff: base delay doubled per prior failed attempt.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempts.saturating_sub(1));
        Duration::from_millis(self.config.backoff_base_ms.saturating_mul(factor))
    }

    async fn push(&self, job: QueuedJob) {
        self.ready.lock().await.push_back(job);
        self.notify.notify_one();
    }

    fn emit(&self, event: QueueEvent) {
        // Nobody may be listening, which is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with_backoff(base_ms: u64) -> Arc<JobQueue> {
        // The pool is lazy; backoff math never touches the database
        let db_pool = Arc::new(
            sqlx::sqlite::SqlitePoolOptions::new().connect_lazy("sqlite::memory:").unwrap(),
        );
        JobQueue::new(
            db_pool,
            QueueConfig {
                backoff_base_ms: base_ms,
                ..QueueConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn backoff_doubles_per_attempt() {
        let queue = queue_with_backoff(2_000);
        assert_eq!(queue.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(queue.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(queue.backoff_delay(3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn backoff_does_not_overflow() {
        let queue = queue_with_backoff(u64::MAX);
        assert_eq!(queue.backoff_delay(64), Duration::from_millis(u64::MAX));
    }
}
