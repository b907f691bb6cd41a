//! Job orchestrator: one durable transaction from staging load to the
//! result writer, safe to retry after a crash at any point.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use empi_core::{
    Config, DbLockId, Job, JobStatus, MatchEventType, DEMOGRAPHIC_COLUMNS, TIMESTAMP_FORMAT,
};
use empi_db::{copy_in_csv, copy_out_csv, create_temp_table, drop_table, obtain_advisory_lock};
use empi_graph::{CrosswalkRow, MatchGraph, ResultRow};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use tracing::{error, info};

use crate::events::create_match_event;
use crate::linker::{job_scoped_settings, Linker, PersonRecordFrameRow, ScoredPair};
use crate::staging;
use crate::writer::{self, ResultFrameRow};

const JOB_COLUMNS: &str = "id, created, updated, config_id, source_uri, status, reason, job_type";

/// Terminal outcome of one `process_job` call. `Failed` means the pipeline
/// rolled back and the job has been marked failed with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Serialize)]
struct RecordIdTempRow {
    person_record_id: i64,
}

/// Runs the matching pipeline for one job at a time.
pub struct Matcher {
    pool: PgPool,
    linker: Arc<dyn Linker>,
}

impl Matcher {
    pub fn new(pool: PgPool, linker: Arc<dyn Linker>) -> Self {
        Matcher { pool, linker }
    }

    /// Process a job end to end.
    ///
    /// The pipeline runs in a single transaction under the `MATCHING_JOB`
    /// lock. On failure the transaction is rolled back and a compensating
    /// transaction records the failure; the error never escapes as long as
    /// the failure could be persisted.
    pub async fn process_job(&self, job_id: i64) -> Result<JobOutcome> {
        let mut tx = self.pool.begin().await?;

        // Jobs are processed sequentially even if several workers race.
        obtain_advisory_lock(&mut tx, DbLockId::MatchingJob).await?;

        let stmt = format!(
            "select {JOB_COLUMNS} from job where id = $1 and status = $2 for update"
        );
        let job: Option<Job> = sqlx::query_as(&stmt)
            .bind(job_id)
            .bind(JobStatus::New)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(job) = job else {
            bail!("job {} does not exist in status 'new'", job_id);
        };

        info!("Processing job {} (source: {})", job.id, job.source_uri);

        match self.run_pipeline(&mut tx, &job).await {
            Ok(()) => {
                mark_job_succeeded(&mut tx, job.id).await?;
                staging::delete_staging_records(&mut tx, job.id).await?;
                tx.commit().await?;
                info!("Job {} succeeded", job.id);
                Ok(JobOutcome::Succeeded)
            }
            Err(err) => {
                tx.rollback().await?;
                let reason = format!("{:#}", err);
                error!("Job {} failed: {}", job.id, reason);
                self.mark_job_failed(job.id, &reason).await?;
                Ok(JobOutcome::Failed(reason))
            }
        }
    }

    async fn run_pipeline(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job: &Job,
    ) -> Result<()> {
        let conn: &mut PgConnection = tx;

        let loaded = staging::load_person_records(conn, job.id).await?;
        if loaded == 0 {
            info!("Job finished");
            return Ok(());
        }

        let config: Config = sqlx::query_as(
            "select id, created, potential_match_threshold, auto_match_threshold, splink_settings
             from config where id = $1",
        )
        .bind(job.config_id)
        .fetch_one(&mut *conn)
        .await
        .context("loading job config")?;

        let frame = extract_person_records(conn).await?;

        let new_results = self.run_prediction(job, &config, &frame)?;
        if new_results.is_empty() {
            info!("No new prediction results above potential-match threshold");
            info!("Job finished");
            return Ok(());
        }

        // From here on person assignment changes; interactive manual matches
        // must fail fast instead of queueing behind this transaction.
        obtain_advisory_lock(conn, DbLockId::MatchUpdate).await?;

        let current_results = extract_current_results_with_lock(conn, job.id).await?;
        let all_results = combine_results(job.id, &current_results, &new_results);

        let crosswalk = extract_person_crosswalk_with_lock(conn, &all_results).await?;

        let result_rows: Vec<ResultRow> = all_results
            .iter()
            .map(|row| ResultRow {
                row_number: row.row_number,
                match_probability: row.match_probability,
                person_record_l_id: row.person_record_l_id,
                person_record_r_id: row.person_record_r_id,
            })
            .collect();

        let analysis = MatchGraph::new(&result_rows, &crosswalk)?
            .analyze(config.auto_match_threshold);

        let event = create_match_event(conn, Some(job.id), MatchEventType::AutoMatches).await?;

        writer::load_results_groups_and_actions(conn, job.id, &event, &all_results, &analysis)
            .await?;
        writer::update_persons_and_load_actions(conn, &event, &analysis.person_actions).await?;

        info!("Job finished");
        Ok(())
    }

    /// Score candidate pairs and keep those above the potential threshold.
    fn run_prediction(
        &self,
        job: &Job,
        config: &Config,
        frame: &[PersonRecordFrameRow],
    ) -> Result<Vec<ScoredPair>> {
        info!("Running linker prediction with config {}", config.id);

        let settings = job_scoped_settings(&config.splink_settings, job.id)?;
        let pairs = self
            .linker
            .predict(frame, &settings)
            .context("linker prediction failed")?;

        info!("Linker returned {} prediction results", pairs.len());

        let potential: Vec<ScoredPair> = pairs
            .into_iter()
            .filter(|pair| pair.match_probability > config.potential_match_threshold)
            .collect();
        info!(
            "Linker returned {} prediction results above potential-match threshold {}",
            potential.len(),
            config.potential_match_threshold
        );

        let auto_count = potential
            .iter()
            .filter(|pair| pair.match_probability > config.auto_match_threshold)
            .count();
        info!(
            "Linker returned {} prediction results above auto-match threshold {}",
            auto_count, config.auto_match_threshold
        );

        Ok(potential)
    }

    /// Record the failure in a fresh short transaction.
    ///
    /// The main transaction already ended, so the job could have been
    /// re-processed meanwhile; the status guard prevents overwriting a
    /// terminal state.
    async fn mark_job_failed(&self, job_id: i64, reason: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let stmt = format!("select {JOB_COLUMNS} from job where id = $1 for update");
        let job: Option<Job> = sqlx::query_as(&stmt)
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(job) = job else {
            bail!(
                "Failed to update job failure status and clean up staging records. \
                 Job {} does not exist.",
                job_id
            );
        };

        if job.status != JobStatus::New {
            bail!(
                "Failed to update job failure status and clean up staging records. \
                 Job {} status is {}, expected new.",
                job.id,
                job.status
            );
        }

        let result = sqlx::query(
            "update job
             set status = $2, updated = statement_timestamp(), reason = $3
             where id = $1",
        )
        .bind(job.id)
        .bind(JobStatus::Failed)
        .bind(format!("Error: {}", reason))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            bail!(
                "Failed to update job status for job {}. Expected to update 1 row, but updated {}",
                job.id,
                result.rows_affected()
            );
        }

        staging::delete_staging_records(&mut tx, job.id).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn mark_job_succeeded(conn: &mut PgConnection, job_id: i64) -> Result<()> {
    let result = sqlx::query(
        "update job
         set status = $2, updated = statement_timestamp(), reason = null
         where id = $1",
    )
    .bind(job_id)
    .bind(JobStatus::Succeeded)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != 1 {
        bail!(
            "Failed to update job status for job {}. Expected to update 1 row, but updated {}",
            job_id,
            result.rows_affected()
        );
    }
    Ok(())
}

/// Bulk-extract every live person record as the linker input frame.
async fn extract_person_records(conn: &mut PgConnection) -> Result<Vec<PersonRecordFrameRow>> {
    info!("Extracting all person record rows for matching");

    let query = format!(
        "select id, to_char(created, '{TIMESTAMP_FORMAT}') as created, job_id, {}
         from person_record",
        DEMOGRAPHIC_COLUMNS.join(", ")
    );
    let frame: Vec<PersonRecordFrameRow> = copy_out_csv(conn, &query).await?;

    info!("Extracted {} person record rows", frame.len());
    Ok(frame)
}

/// Lock active groups owned by earlier jobs with their results, read the
/// results out, then soft-delete the groups: this job's analysis replaces
/// them wholesale.
async fn extract_current_results_with_lock(
    conn: &mut PgConnection,
    job_id: i64,
) -> Result<Vec<(i64, i64, f64, f64, i64, i64)>> {
    info!("Locking active, unmatched match groups and locking/extracting related results");

    let current: Vec<(i64, i64, f64, f64, i64, i64)> = sqlx::query_as(
        "select
             r.id,
             r.job_id,
             r.match_weight,
             r.match_probability,
             r.person_record_l_id,
             r.person_record_r_id
         from splink_result r
         inner join match_group mg on
             mg.job_id != $1
             and mg.matched is null
             and mg.deleted is null
             and r.match_group_id = mg.id
         for update of mg, r",
    )
    .bind(job_id)
    .fetch_all(&mut *conn)
    .await?;

    info!(
        "Locked active, unmatched match groups and locked/extracted {} related results",
        current.len()
    );
    info!("Soft-deleting active, unmatched match groups");

    let deleted = sqlx::query(
        "update match_group
         set
             updated = statement_timestamp(),
             version = version + 1,
             deleted = statement_timestamp()
         where
             job_id != $1
             and matched is null
             and deleted is null",
    )
    .bind(job_id)
    .execute(&mut *conn)
    .await?;

    info!(
        "Soft-deleted {} existing, unmatched match groups",
        deleted.rows_affected()
    );

    Ok(current)
}

/// Concatenate current and new results into one frame with stable row
/// numbers.
fn combine_results(
    job_id: i64,
    current: &[(i64, i64, f64, f64, i64, i64)],
    new: &[ScoredPair],
) -> Vec<ResultFrameRow> {
    let mut combined: Vec<ResultFrameRow> = Vec::with_capacity(current.len() + new.len());

    for &(id, owner_job_id, match_weight, match_probability, left, right) in current {
        combined.push(ResultFrameRow {
            row_number: combined.len() as i64,
            id: Some(id),
            job_id: owner_job_id,
            match_weight,
            match_probability,
            person_record_l_id: left,
            person_record_r_id: right,
            data: None,
        });
    }

    for pair in new {
        combined.push(ResultFrameRow {
            row_number: combined.len() as i64,
            id: None,
            job_id,
            match_weight: pair.match_weight,
            match_probability: pair.match_probability,
            person_record_l_id: pair.person_record_l_id,
            person_record_r_id: pair.person_record_r_id,
            data: Some(pair.data.clone()),
        });
    }

    combined
}

/// Lock and read the person crosswalk for every record referenced by the
/// combined results. Rows lock in `(person_id, record_id)` order; the lock
/// set is a superset of what auto-matching strictly needs, which keeps the
/// ordering contract simple.
async fn extract_person_crosswalk_with_lock(
    conn: &mut PgConnection,
    all_results: &[ResultFrameRow],
) -> Result<Vec<CrosswalkRow>> {
    info!("Extracting person crosswalk and locking persons and person records");

    let temp_table = "person_record_id_temp";
    create_temp_table(conn, temp_table, &[("person_record_id", "bigint", "primary key")])
        .await?;

    let unique_ids: BTreeSet<i64> = all_results
        .iter()
        .flat_map(|row| [row.person_record_l_id, row.person_record_r_id])
        .collect();
    let rows: Vec<RecordIdTempRow> = unique_ids
        .into_iter()
        .map(|id| RecordIdTempRow { person_record_id: id })
        .collect();
    copy_in_csv(conn, temp_table, &["person_record_id"], &rows).await?;

    let crosswalk: Vec<(i64, DateTime<Utc>, i64, i64, i64)> = sqlx::query_as(
        "select p.id, p.created, p.version, p.record_count, pare.id as person_record_id
         from person_record_id_temp pareid
         inner join person_record pare on
             pareid.person_record_id = pare.id
         inner join person p on
             pare.person_id = p.id
         order by p.id, pare.id
         for update of pare, p",
    )
    .fetch_all(&mut *conn)
    .await?;

    drop_table(conn, temp_table).await?;

    info!("Extracted {} person crosswalk rows", crosswalk.len());

    Ok(crosswalk
        .into_iter()
        .map(
            |(person_id, person_created, person_version, record_count, person_record_id)| {
                CrosswalkRow {
                    person_id,
                    person_created,
                    person_version,
                    record_count,
                    person_record_id,
                }
            },
        )
        .collect())
}
