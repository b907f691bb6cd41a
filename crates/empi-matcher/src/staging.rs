//! Staging loader: dedup + hash + row-number pass over freshly imported
//! records, then one Person per surviving record and a `new-ids` event.
//!
//! Every step is idempotent with respect to retries: rows whose content hash
//! already exists as a live person record are simply dropped.

use anyhow::{bail, Result};
use empi_core::{MatchEvent, MatchEventType, PersonActionType, DEMOGRAPHIC_COLUMNS};
use empi_db::{create_index, create_temp_table};
use sqlx::PgConnection;
use tracing::info;

use crate::events::create_match_event;

const PERSON_ID_TEMP_TABLE: &str = "person_id_temp";

/// Delete staging rows missing their identity keys.
///
/// A record without `data_source` or `source_person_id` cannot be addressed
/// by any downstream system and would corrupt the content hash space.
async fn purge_blank_identity_rows(conn: &mut PgConnection, job_id: i64) -> Result<u64> {
    let result = sqlx::query(
        "delete from person_record_staging
         where job_id = $1 and (data_source = '' or source_person_id = '')",
    )
    .bind(job_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() > 0 {
        info!(
            "Deleted {} staging records with blank identity keys for job {}",
            result.rows_affected(),
            job_id
        );
    }
    Ok(result.rows_affected())
}

/// Stamp each staging row with the sha256 of its `|`-joined demographic
/// columns. Blank fields participate as empty strings.
async fn add_staging_sha256(conn: &mut PgConnection, job_id: i64) -> Result<()> {
    info!("Adding sha256 sum to staging records with job id {}", job_id);

    let stmt = format!(
        "update person_record_staging
         set sha256 = digest(concat_ws('|', {}), 'sha256')
         where job_id = $1",
        DEMOGRAPHIC_COLUMNS.join(", ")
    );
    let result = sqlx::query(&stmt).bind(job_id).execute(&mut *conn).await?;

    info!(
        "Added sha256 sum to {} staging records with job id {}",
        result.rows_affected(),
        job_id
    );
    Ok(())
}

/// Drop staging rows whose hash collides with a live person record or with an
/// earlier staging row of the same job. Returns the surviving row count.
async fn dedupe_staging(conn: &mut PgConnection, job_id: i64) -> Result<i64> {
    info!("Deleting duplicate staging records with job id {}", job_id);

    let result = sqlx::query(
        "delete from person_record_staging
         where
             job_id = $1
             and (
                 id not in (
                     select min(id)
                     from person_record_staging
                     group by sha256
                 )
                 or sha256 in (
                     select sha256
                     from person_record
                 )
             )",
    )
    .bind(job_id)
    .execute(&mut *conn)
    .await?;

    info!(
        "Deleted {} duplicate staging records with job id {}",
        result.rows_affected(),
        job_id
    );

    let remaining: i64 =
        sqlx::query_scalar("select count(*) from person_record_staging where job_id = $1")
            .bind(job_id)
            .fetch_one(&mut *conn)
            .await?;

    info!(
        "Staging records with job id {} left after deduplication: {}",
        job_id, remaining
    );
    Ok(remaining)
}

/// Assign dense row numbers 1..N over surviving rows ordered by id.
async fn add_staging_row_number(conn: &mut PgConnection, job_id: i64) -> Result<()> {
    let result = sqlx::query(
        "update person_record_staging stg
         set row_number = rn.row_number
         from (
             select id, row_number() over (order by id) as row_number
             from person_record_staging
             where job_id = $1
         ) rn
         where stg.id = rn.id",
    )
    .bind(job_id)
    .execute(&mut *conn)
    .await?;

    info!(
        "Added row_number to {} staging records with job id {}",
        result.rows_affected(),
        job_id
    );
    Ok(())
}

/// Create one Person per surviving staging row and remember the new ids keyed
/// by row number in a temp table, for the bulk record insert to join on.
async fn create_persons(conn: &mut PgConnection, job_id: i64, event: &MatchEvent) -> Result<()> {
    info!("Creating persons for staging records with job id {}", job_id);

    create_temp_table(
        conn,
        PERSON_ID_TEMP_TABLE,
        &[("id", "bigint", "primary key"), ("row_number", "bigint", "")],
    )
    .await?;
    create_index(
        conn,
        PERSON_ID_TEMP_TABLE,
        "row_number",
        "person_id_temp_row_number",
    )
    .await?;

    let result = sqlx::query(
        "with person_id as (
             insert into person (uuid, created, updated, job_id, record_count)
             select gen_random_uuid(), $2, $2, $1, 1
             from person_record_staging
             where job_id = $1
             returning id
         )
         insert into person_id_temp (id, row_number)
         select id, row_number() over (order by id)
         from person_id",
    )
    .bind(job_id)
    .bind(event.created)
    .execute(&mut *conn)
    .await?;

    info!(
        "Created {} persons for staging records with job id {}",
        result.rows_affected(),
        job_id
    );
    Ok(())
}

/// Bulk-insert person records joined to their new persons by row number.
async fn load_person_records_with_persons(
    conn: &mut PgConnection,
    job_id: i64,
    event: &MatchEvent,
) -> Result<u64> {
    info!(
        "Loading staging records with job id {} into person_record table",
        job_id
    );

    let columns = DEMOGRAPHIC_COLUMNS.join(", ");
    let staged_columns = DEMOGRAPHIC_COLUMNS
        .iter()
        .map(|col| format!("stg.{}", col))
        .collect::<Vec<_>>()
        .join(", ");

    let stmt = format!(
        "insert into person_record (
             created, job_id, person_id, person_updated, sha256, {columns}
         )
         select $2, stg.job_id, pid.id, $2, stg.sha256, {staged_columns}
         from person_record_staging stg
         inner join person_id_temp pid on
             stg.job_id = $1
             and stg.row_number = pid.row_number",
    );
    let result = sqlx::query(&stmt)
        .bind(job_id)
        .bind(event.created)
        .execute(&mut *conn)
        .await?;

    info!(
        "Loaded {} staging records with job id {} into person_record table",
        result.rows_affected(),
        job_id
    );
    Ok(result.rows_affected())
}

/// Record one `add-record` action per newly loaded person record.
async fn create_new_id_person_actions(
    conn: &mut PgConnection,
    job_id: i64,
    event: &MatchEvent,
) -> Result<()> {
    let result = sqlx::query(
        "insert into person_action (match_event_id, person_id, person_record_id, type)
         select $2, person_id, id, $3
         from person_record
         where job_id = $1",
    )
    .bind(job_id)
    .bind(event.id)
    .bind(PersonActionType::AddRecord)
    .execute(&mut *conn)
    .await?;

    info!(
        "Loaded {} person actions for '{}' event with id {} (job {})",
        result.rows_affected(),
        event.event_type,
        event.id,
        job_id
    );
    Ok(())
}

/// Run the full staging pass for a job. Returns the number of person records
/// loaded; zero means nothing new arrived and no event was emitted.
pub async fn load_person_records(conn: &mut PgConnection, job_id: i64) -> Result<u64> {
    purge_blank_identity_rows(conn, job_id).await?;
    add_staging_sha256(conn, job_id).await?;

    let remaining = dedupe_staging(conn, job_id).await?;
    if remaining == 0 {
        info!("No new staging records to load");
        return Ok(0);
    }

    add_staging_row_number(conn, job_id).await?;

    let event = create_match_event(conn, Some(job_id), MatchEventType::NewIds).await?;

    create_persons(conn, job_id, &event).await?;
    let loaded = load_person_records_with_persons(conn, job_id, &event).await?;

    if loaded != remaining as u64 {
        bail!(
            "Loaded fewer person records than staged. Expected: {} Actual: {}",
            remaining,
            loaded
        );
    }

    create_new_id_person_actions(conn, job_id, &event).await?;

    Ok(loaded)
}

/// Delete a job's staging rows after the job terminates.
pub async fn delete_staging_records(conn: &mut PgConnection, job_id: i64) -> Result<u64> {
    info!("Deleting staging records with job id {}", job_id);

    let result = sqlx::query("delete from person_record_staging where job_id = $1")
        .bind(job_id)
        .execute(&mut *conn)
        .await?;

    info!(
        "Deleted {} staging records with job id {}",
        result.rows_affected(),
        job_id
    );
    Ok(result.rows_affected())
}
