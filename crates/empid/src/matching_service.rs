//! Scheduler loop: pick the oldest pending import job, hand it to the job
//! runner, record the outcome, clean up staging.
//!
//! `MATCHING_SERVICE` is held on the iteration transaction from before the
//! job pick until the iteration's bookkeeping is written, so only one
//! scheduler instance drives jobs at any moment; a second instance fails the
//! try-lock and terminates.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use empi_core::{DbLockId, JobStatus, JobType};
use empi_db::try_advisory_lock;
use empi_matcher::JobRunner;
use sqlx::{PgConnection, PgPool};
use tokio::sync::watch;
use tracing::{error, info};

use crate::metrics::MatcherMetrics;

/// Postgres error code for `FOR UPDATE NOWAIT` hitting a held row lock.
const LOCK_NOT_AVAILABLE: &str = "55P03";

enum NextJob {
    Found(i64),
    Empty,
    /// Another process holds the next job's row lock.
    Busy,
}

pub struct MatchingService {
    pool: PgPool,
    runner: Arc<dyn JobRunner>,
    metrics: MatcherMetrics,
    poll_interval: Duration,
    cancel_rx: watch::Receiver<bool>,
}

impl MatchingService {
    pub fn new(
        pool: PgPool,
        runner: Arc<dyn JobRunner>,
        metrics: MatcherMetrics,
        poll_interval: Duration,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        MatchingService {
            pool,
            runner,
            metrics,
            poll_interval,
            cancel_rx,
        }
    }

    /// Run until cancelled or until another worker instance is detected.
    pub async fn run(mut self) -> Result<()> {
        info!("Starting match worker");

        loop {
            if *self.cancel_rx.borrow() {
                break;
            }

            match self.run_next_job().await {
                Ok(true) => {}
                // Another instance owns the service lock or the next job row.
                Ok(false) => break,
                Err(err) => {
                    error!("Unexpected error processing match job: {:#}", err);
                    return Err(err);
                }
            }
        }

        info!("Match worker stopped");
        Ok(())
    }

    /// One scheduler iteration. Returns false when the worker should stop
    /// because a sibling instance holds the coordination locks.
    async fn run_next_job(&mut self) -> Result<bool> {
        info!("Retrieving next job");

        // Iteration transaction. The service lock taken here stays held
        // across the runner invocation and the outcome bookkeeping below;
        // it is released only by the commit at the end of the iteration.
        let mut tx = self.pool.begin().await?;

        if !try_advisory_lock(&mut tx, DbLockId::MatchingService).await? {
            error!("Another match worker is already running");
            return Ok(false);
        }

        let job_id = match self.probe_next_job().await? {
            NextJob::Found(job_id) => job_id,
            NextJob::Empty => {
                tx.commit().await?;
                info!("No new jobs found");
                self.sleep().await;
                return Ok(true);
            }
            NextJob::Busy => {
                error!("Another match worker is already running");
                return Ok(false);
            }
        };

        info!("Found job {}", job_id);

        let started = Instant::now();
        self.metrics.active_job.set(1);
        let outcome = self.runner.run_job(job_id).await;
        self.metrics.active_job.set(0);

        match outcome {
            Ok((0, _)) => {
                info!("Job {} succeeded", job_id);
                self.metrics.jobs_succeeded.inc();
            }
            Ok((return_code, error_message)) => {
                error!(
                    "Job {} failed with exit code {}: {}",
                    job_id,
                    return_code,
                    error_message.as_deref().unwrap_or("unknown error")
                );
                self.metrics.jobs_failed.inc();
            }
            Err(err) => {
                // The runner died without recording anything; make sure the
                // job does not stay pending forever.
                error!("Failed to run job {}: {:#}", job_id, err);
                record_runner_failure(&mut tx, job_id, &err).await?;
                self.metrics.jobs_failed.inc();
            }
        }

        self.metrics
            .job_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        info!(
            "Processed job {} in {:.3} seconds",
            job_id,
            started.elapsed().as_secs_f64()
        );

        // Bookkeeping is durable; release the service lock before sleeping.
        tx.commit().await?;
        self.sleep().await;
        Ok(true)
    }

    /// Probe the oldest pending import job on a second connection.
    ///
    /// The probe's row lock is released at its commit: the matcher takes its
    /// own `FOR UPDATE` on the job row with a `status = new` guard, and
    /// would deadlock against this process if the scheduler kept the row
    /// locked across the runner invocation.
    async fn probe_next_job(&self) -> Result<NextJob> {
        let mut tx = self.pool.begin().await?;

        let picked: std::result::Result<Option<(i64,)>, sqlx::Error> = sqlx::query_as(
            "select id from job
             where status = $1 and job_type = $2
             order by id
             limit 1
             for update nowait",
        )
        .bind(JobStatus::New)
        .bind(JobType::ImportPersonRecords)
        .fetch_optional(&mut *tx)
        .await;

        let picked = match picked {
            Ok(picked) => picked,
            Err(err) if is_lock_not_available(&err) => return Ok(NextJob::Busy),
            Err(err) => return Err(err.into()),
        };

        tx.commit().await?;
        Ok(match picked {
            Some((job_id,)) => NextJob::Found(job_id),
            None => NextJob::Empty,
        })
    }

    /// Poll sleep that wakes immediately on cancellation.
    async fn sleep(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.cancel_rx.changed() => {}
        }
    }
}

/// Mark a job failed after a runner crash, unless the matcher already
/// recorded a terminal status. Runs on the iteration transaction, under the
/// service lock.
async fn record_runner_failure(
    conn: &mut PgConnection,
    job_id: i64,
    err: &anyhow::Error,
) -> Result<()> {
    let updated = sqlx::query(
        "update job
         set status = $2, updated = statement_timestamp(), reason = $3
         where id = $1 and status = $4",
    )
    .bind(job_id)
    .bind(JobStatus::Failed)
    .bind(format!("Failed to run job process: {:#}", err))
    .bind(JobStatus::New)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 1 {
        info!("Recorded runner failure for job {}", job_id);
    }

    let deleted = sqlx::query("delete from person_record_staging where job_id = $1")
        .bind(job_id)
        .execute(&mut *conn)
        .await?;
    info!(
        "Deleted {} staging records with job id {}",
        deleted.rows_affected(),
        job_id
    );

    Ok(())
}

fn is_lock_not_available(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE),
        _ => false,
    }
}
