use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, bail};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::database as db;
use crate::judge::Judge;
use crate::queue::{JobQueue, JobSummary, QueuedJob};

/// A judge worker: pulls jobs off the queue and runs the full
/// compile → execute → verdict pipeline for each.
///
/// Judged outcomes complete the job; only infrastructure faults reach the
/// queue's retry machinery.
pub async fn worker(
    id: u8,
    judge: Arc<Judge>,
    db_pool: Arc<SqlitePool>,
    queue: Arc<JobQueue>,
    token: CancellationToken,
) -> Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            job = queue.pop() => {
                log::info!("Worker {id} got job {} from queue", job.job_id);

                if let Err(e) = queue.mark_active(&job).await {
                    log::error!("Failed to mark job {} active: {e}", job.job_id);
                }

                let started = Instant::now();
                match run_job(&judge, &db_pool, &job).await {
                    Ok(summary) => {
                        log::info!(
                            "Job {} finished on worker {id}: {} in {}ms",
                            job.job_id,
                            summary.verdict,
                            summary.duration_ms
                        );
                        if let Err(e) = queue.complete(&job, summary).await {
                            log::error!("Failed to complete job {}: {e}", job.job_id);
                        }
                    }
                    Err(e) => {
                        let message = format!("{e:#}");
                        log::error!("Job {} faulted on worker {id}: {message}", job.job_id);

                        let duration_ms = started.elapsed().as_millis() as u64;
                        db::save_error(job.submission_id, db_pool.clone(), &message, duration_ms)
                            .await
                            .unwrap_or_else(|e| {
                                log::error!(
                                    "Failed to record error for submission {}: {e}",
                                    job.submission_id
                                )
                            });

                        if let Err(e) = queue.fail(&job, &message).await {
                            log::error!("Failed to fail job {}: {e}", job.job_id);
                        }
                    }
                }
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

/// One judging attempt. Every `Err` from here is an infrastructure fault
/// and subject to the queue's retry policy.
async fn run_job(judge: &Judge, db_pool: &Arc<SqlitePool>, job: &QueuedJob) -> Result<JobSummary> {
    let started = Instant::now();

    let Some(submission) = db::fetch_submission(job.submission_id, db_pool.clone()).await? else {
        bail!("submission {} not found", job.submission_id);
    };

    let samples = db::fetch_samples(submission.problem_id, db_pool.clone()).await?;
    if samples.is_empty() {
        bail!("problem {} has no test samples", submission.problem_id);
    }

    db::mark_judging(job.submission_id, db_pool.clone()).await?;

    let tests = samples.into_iter().map(Into::into).collect();
    let outcome = judge.judge(&submission.code, tests, job.limits).await?;

    let duration_ms = started.elapsed().as_millis() as u64;
    db::save_outcome(job.submission_id, db_pool.clone(), &outcome, duration_ms).await?;

    Ok(JobSummary {
        verdict: outcome.verdict.to_string(),
        duration_ms,
    })
}
