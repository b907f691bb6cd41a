//! Result/group/action writer.
//!
//! Side-effect order is fixed: match groups, new results (with `add-result`
//! actions), re-parented current results (`remove-result` before
//! `add-result`), `match` actions, then person updates and their
//! remove-before-add person actions. Every bulk statement compares expected
//! vs actual row counts; a delta forces rollback.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use empi_core::{MatchEvent, MatchGroupActionType, PersonActionType};
use empi_db::{
    add_column, copy_in_csv, create_index, create_temp_table, create_temp_table_like, drop_column,
    drop_table,
};
use empi_graph::{MatchAnalysis, MatchGroupOut, PersonReassignment};
use serde::Serialize;
use sqlx::PgConnection;
use tracing::info;
use uuid::Uuid;

/// One row of the combined result frame (current results from earlier jobs
/// plus new results from this job), with a stable row number.
#[derive(Debug, Clone)]
pub(crate) struct ResultFrameRow {
    pub row_number: i64,
    /// Present for current results that already live in the result table.
    pub id: Option<i64>,
    pub job_id: i64,
    pub match_weight: f64,
    pub match_probability: f64,
    pub person_record_l_id: i64,
    pub person_record_r_id: i64,
    /// Present for new results only.
    pub data: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct MatchGroupTempRow {
    uuid: Uuid,
    job_id: i64,
    matched: bool,
}

#[derive(Serialize)]
struct NewResultTempRow {
    job_id: i64,
    match_weight: f64,
    match_probability: f64,
    person_record_l_id: i64,
    person_record_r_id: i64,
    data: String,
    match_group_uuid: Uuid,
}

#[derive(Serialize)]
struct CurrentResultTempRow {
    id: i64,
    match_group_uuid: Uuid,
}

#[derive(Serialize)]
struct PersonActionTempRow {
    from_person_id: i64,
    from_person_version: i64,
    to_person_id: i64,
    to_person_version: i64,
    person_record_id: i64,
    match_group_uuid: Uuid,
}

async fn load_match_groups(
    conn: &mut PgConnection,
    job_id: i64,
    event: &MatchEvent,
    match_groups: &[MatchGroupOut],
) -> Result<()> {
    info!("Loading {} match groups to temporary table", match_groups.len());

    let temp_table = "match_group_temp";
    create_temp_table_like(conn, temp_table, "match_group").await?;
    drop_column(conn, temp_table, "id").await?;
    drop_column(conn, temp_table, "created").await?;
    drop_column(conn, temp_table, "updated").await?;
    drop_column(conn, temp_table, "version").await?;
    drop_column(conn, temp_table, "matched").await?;
    add_column(conn, temp_table, "matched", "boolean", &["not null"]).await?;

    let rows: Vec<MatchGroupTempRow> = match_groups
        .iter()
        .map(|group| MatchGroupTempRow {
            uuid: group.uuid,
            job_id,
            matched: group.matched,
        })
        .collect();
    let loaded = copy_in_csv(conn, temp_table, &["uuid", "job_id", "matched"], &rows).await?;
    info!("Loaded {} match groups to temporary table", loaded);

    let result = sqlx::query(
        "insert into match_group (uuid, created, updated, job_id, matched)
         select
             uuid,
             $1,
             $1,
             job_id,
             case when matched then $1 else null end
         from match_group_temp",
    )
    .bind(event.created)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != match_groups.len() as u64 {
        bail!(
            "Failed to load match groups. Expected: {} Actual: {}",
            match_groups.len(),
            result.rows_affected()
        );
    }
    info!("Loaded {} match groups", result.rows_affected());

    drop_table(conn, temp_table).await
}

async fn load_new_results(
    conn: &mut PgConnection,
    job_id: i64,
    event: &MatchEvent,
    new_results: &[(&ResultFrameRow, Uuid)],
) -> Result<()> {
    info!("Loading {} new results to temporary table", new_results.len());

    let temp_table = "splink_result_new_temp";
    create_temp_table_like(conn, temp_table, "splink_result").await?;
    drop_column(conn, temp_table, "id").await?;
    drop_column(conn, temp_table, "created").await?;
    drop_column(conn, temp_table, "match_group_id").await?;
    drop_column(conn, temp_table, "match_group_updated").await?;
    add_column(conn, temp_table, "match_group_uuid", "uuid", &[]).await?;
    create_index(conn, temp_table, "match_group_uuid", "splink_result_new_temp_uuid").await?;

    let rows: Vec<NewResultTempRow> = new_results
        .iter()
        .map(|(row, group_uuid)| {
            let data = row.data.clone().unwrap_or(serde_json::Value::Null);
            Ok(NewResultTempRow {
                job_id: row.job_id,
                match_weight: row.match_weight,
                match_probability: row.match_probability,
                person_record_l_id: row.person_record_l_id,
                person_record_r_id: row.person_record_r_id,
                data: serde_json::to_string(&data).context("serializing result data")?,
                match_group_uuid: *group_uuid,
            })
        })
        .collect::<Result<_>>()?;
    copy_in_csv(
        conn,
        temp_table,
        &[
            "job_id",
            "match_weight",
            "match_probability",
            "person_record_l_id",
            "person_record_r_id",
            "data",
            "match_group_uuid",
        ],
        &rows,
    )
    .await?;

    info!("Loading new results");

    let result = sqlx::query(
        "insert into splink_result (
             created, job_id, match_group_id, match_group_updated, match_weight,
             match_probability, person_record_l_id, person_record_r_id, data
         )
         select
             mg.created, nr.job_id, mg.id, mg.created, nr.match_weight,
             nr.match_probability, nr.person_record_l_id, nr.person_record_r_id, nr.data
         from splink_result_new_temp nr
         inner join match_group mg
             on mg.job_id = $1
             and nr.match_group_uuid = mg.uuid",
    )
    .bind(job_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != new_results.len() as u64 {
        bail!(
            "Failed to load new results. Expected: {} Actual: {}",
            new_results.len(),
            result.rows_affected()
        );
    }
    info!("Loaded {} new results", result.rows_affected());

    let actions = sqlx::query(
        "insert into match_group_action (match_event_id, match_group_id, splink_result_id, type)
         select $1, sr.match_group_id, sr.id, $2
         from splink_result sr
         where sr.job_id = $3",
    )
    .bind(event.id)
    .bind(MatchGroupActionType::AddResult)
    .bind(job_id)
    .execute(&mut *conn)
    .await?;

    info!(
        "Created {} 'add-result' match group actions for new results (event {})",
        actions.rows_affected(),
        event.id
    );

    drop_table(conn, temp_table).await
}

async fn update_current_results(
    conn: &mut PgConnection,
    job_id: i64,
    event: &MatchEvent,
    current_results: &[(&ResultFrameRow, Uuid)],
) -> Result<()> {
    info!(
        "Loading {} current result updates to temporary table",
        current_results.len()
    );

    let temp_table = "splink_result_current_temp";
    create_temp_table(
        conn,
        temp_table,
        &[("id", "bigint", "unique"), ("match_group_uuid", "uuid", "")],
    )
    .await?;
    create_index(
        conn,
        temp_table,
        "match_group_uuid",
        "splink_result_current_temp_uuid",
    )
    .await?;

    let rows: Vec<CurrentResultTempRow> = current_results
        .iter()
        .map(|(row, group_uuid)| {
            let id = row
                .id
                .context("current result row is missing its result id")?;
            Ok(CurrentResultTempRow {
                id,
                match_group_uuid: *group_uuid,
            })
        })
        .collect::<Result<_>>()?;
    copy_in_csv(conn, temp_table, &["id", "match_group_uuid"], &rows).await?;

    // Record removal from the old (now soft-deleted) groups before the
    // re-parenting update erases the linkage.
    let removes = sqlx::query(
        "insert into match_group_action (match_event_id, match_group_id, splink_result_id, type)
         select $1, mg.id, cr.id, $2
         from splink_result_current_temp cr
         inner join splink_result sr on cr.id = sr.id
         inner join match_group mg on sr.match_group_id = mg.id",
    )
    .bind(event.id)
    .bind(MatchGroupActionType::RemoveResult)
    .execute(&mut *conn)
    .await?;
    info!(
        "Created {} 'remove-result' match group actions for current results (event {})",
        removes.rows_affected(),
        event.id
    );

    info!("Updating current results");

    let result = sqlx::query(
        "update splink_result sr
         set
             match_group_id = mg.id,
             match_group_updated = mg.created
         from splink_result_current_temp cr
         inner join match_group mg
             on mg.job_id = $1
             and cr.match_group_uuid = mg.uuid
         where sr.id = cr.id",
    )
    .bind(job_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != current_results.len() as u64 {
        bail!(
            "Failed to update current results. Expected: {} Actual: {}",
            current_results.len(),
            result.rows_affected()
        );
    }
    info!("Updated {} current results", result.rows_affected());

    let adds = sqlx::query(
        "insert into match_group_action (match_event_id, match_group_id, splink_result_id, type)
         select $1, mg.id, cr.id, $2
         from splink_result_current_temp cr
         inner join match_group mg
             on mg.job_id = $3
             and cr.match_group_uuid = mg.uuid",
    )
    .bind(event.id)
    .bind(MatchGroupActionType::AddResult)
    .bind(job_id)
    .execute(&mut *conn)
    .await?;
    info!(
        "Created {} 'add-result' match group actions for current results (event {})",
        adds.rows_affected(),
        event.id
    );

    drop_table(conn, temp_table).await
}

async fn create_match_group_match_actions(
    conn: &mut PgConnection,
    job_id: i64,
    event: &MatchEvent,
) -> Result<()> {
    let result = sqlx::query(
        "insert into match_group_action (match_event_id, match_group_id, type)
         select $1, mg.id, $2
         from match_group mg
         where mg.job_id = $3 and mg.matched is not null",
    )
    .bind(event.id)
    .bind(MatchGroupActionType::Match)
    .bind(job_id)
    .execute(&mut *conn)
    .await?;

    info!(
        "Created {} 'match' match group actions (event {})",
        result.rows_affected(),
        event.id
    );
    Ok(())
}

/// Persist match groups, insert new results and re-parent current results.
pub(crate) async fn load_results_groups_and_actions(
    conn: &mut PgConnection,
    job_id: i64,
    event: &MatchEvent,
    all_results: &[ResultFrameRow],
    analysis: &MatchAnalysis,
) -> Result<()> {
    info!("Loading new results and match groups, updating current results");

    let group_by_row: HashMap<i64, Uuid> = analysis
        .results
        .iter()
        .map(|result| (result.result_row_number, result.match_group_uuid))
        .collect();

    let mut current_results: Vec<(&ResultFrameRow, Uuid)> = Vec::new();
    let mut new_results: Vec<(&ResultFrameRow, Uuid)> = Vec::new();

    for row in all_results {
        let group_uuid = *group_by_row.get(&row.row_number).with_context(|| {
            format!("analysis did not assign result row {} to a group", row.row_number)
        })?;
        if row.id.is_some() {
            current_results.push((row, group_uuid));
        } else {
            new_results.push((row, group_uuid));
        }
    }

    load_match_groups(conn, job_id, event, &analysis.match_groups).await?;
    load_new_results(conn, job_id, event, &new_results).await?;
    update_current_results(conn, job_id, event, &current_results).await?;
    create_match_group_match_actions(conn, job_id, event).await?;
    Ok(())
}

/// Apply person reassignments: record counts and versions, record re-pointing,
/// and the remove-before-add person actions.
pub(crate) async fn update_persons_and_load_actions(
    conn: &mut PgConnection,
    event: &MatchEvent,
    reassignments: &[PersonReassignment],
) -> Result<()> {
    if reassignments.is_empty() {
        info!("Loaded 0 person actions - no person actions to load");
        return Ok(());
    }

    info!("Loading person actions and updating persons");

    let temp_table = "person_action_temp";
    create_temp_table(
        conn,
        temp_table,
        &[
            ("from_person_id", "bigint", ""),
            ("from_person_version", "bigint", ""),
            ("to_person_id", "bigint", ""),
            ("to_person_version", "bigint", ""),
            ("person_record_id", "bigint", ""),
            ("match_group_uuid", "uuid", ""),
        ],
    )
    .await?;

    let rows: Vec<PersonActionTempRow> = reassignments
        .iter()
        .map(|action| PersonActionTempRow {
            from_person_id: action.from_person_id,
            from_person_version: action.from_person_version,
            to_person_id: action.to_person_id,
            to_person_version: action.to_person_version,
            person_record_id: action.person_record_id,
            match_group_uuid: action.match_group_uuid,
        })
        .collect();
    copy_in_csv(
        conn,
        temp_table,
        &[
            "from_person_id",
            "from_person_version",
            "to_person_id",
            "to_person_version",
            "person_record_id",
            "match_group_uuid",
        ],
        &rows,
    )
    .await?;

    update_persons(conn).await?;
    update_person_record_persons(conn, event, reassignments.len()).await?;
    create_auto_match_person_actions(conn, event, reassignments.len()).await?;
    Ok(())
}

/// Version-guarded person update: sum record-count deltas per person, bump
/// versions, soft-delete persons whose count reaches zero.
async fn update_persons(conn: &mut PgConnection) -> Result<()> {
    info!("Updating versions and record counts for persons");

    let (expected, actual): (i64, i64) = sqlx::query_as(
        "with person_updates as (
             select person_id, max(person_version) as person_version, sum(count_diff) as count_diff
             from (
                 select
                     from_person_id as person_id,
                     from_person_version as person_version,
                     -1 as count_diff
                 from person_action_temp
                 union all
                 select
                     to_person_id as person_id,
                     to_person_version as person_version,
                     1 as count_diff
                 from person_action_temp
             ) deltas
             group by person_id
         ),
         updated_persons as (
             update person p
             set
                 updated = statement_timestamp(),
                 version = version + 1,
                 record_count = record_count + person_updates.count_diff,
                 deleted = (
                     case
                         when record_count + person_updates.count_diff = 0
                         then statement_timestamp()
                         else null
                     end
                 )
             from person_updates
             where
                 p.id = person_updates.person_id
                 and p.version = person_updates.person_version
             returning 1
         )
         select
             (select count(*) from person_updates) as expected_person_updates_count,
             (select count(*) from updated_persons) as actual_person_updates_count",
    )
    .fetch_one(&mut *conn)
    .await?;

    if expected != actual {
        bail!(
            "Failed to update persons due to missing person or version mismatch. \
             Expected: {} Actual: {}",
            expected,
            actual
        );
    }

    info!("Updated versions and record counts for {} persons", actual);
    Ok(())
}

async fn update_person_record_persons(
    conn: &mut PgConnection,
    event: &MatchEvent,
    expected: usize,
) -> Result<()> {
    info!("Updating person ids for person records");

    let result = sqlx::query(
        "update person_record pare
         set
             person_id = ma.to_person_id,
             person_updated = $1
         from person_action_temp ma
         where
             pare.id = ma.person_record_id
             and pare.person_id = ma.from_person_id",
    )
    .bind(event.created)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != expected as u64 {
        bail!(
            "Failed to update person records due to missing record or person mismatch. \
             Expected: {} Actual: {}",
            expected,
            result.rows_affected()
        );
    }
    info!("Updated person ids for {} person records", result.rows_affected());

    // Every record of a receiving person has been looked at by this event,
    // moved or not.
    let touched = sqlx::query(
        "update person_record pare
         set matched_or_reviewed = $1
         from person_action_temp ma
         where pare.person_id = ma.to_person_id",
    )
    .bind(event.created)
    .execute(&mut *conn)
    .await?;

    info!(
        "Set matched_or_reviewed for {} person records",
        touched.rows_affected()
    );
    Ok(())
}

/// Expand the compact reassignment rows into remove/add action pairs.
/// Every remove sorts before every add, so within the event remove-action
/// ids are strictly smaller than add-action ids.
async fn create_auto_match_person_actions(
    conn: &mut PgConnection,
    event: &MatchEvent,
    reassignment_count: usize,
) -> Result<()> {
    let stmt = format!(
        "with actions as (
             select mg.id as match_group_id, from_person_id, to_person_id, person_record_id
             from person_action_temp ma
             inner join match_group mg on ma.match_group_uuid = mg.uuid
         )
         insert into person_action (match_event_id, match_group_id, person_id, person_record_id, type)
         select $1, match_group_id, person_id, person_record_id, type
         from (
             select
                 match_group_id,
                 from_person_id as person_id,
                 person_record_id,
                 '{remove}' as type,
                 0 as type_order
             from actions
             union
             select
                 match_group_id,
                 to_person_id as person_id,
                 person_record_id,
                 '{add}' as type,
                 1 as type_order
             from actions
         ) expanded
         order by type_order, person_record_id",
        remove = PersonActionType::RemoveRecord.as_str(),
        add = PersonActionType::AddRecord.as_str(),
    );
    let result = sqlx::query(&stmt).bind(event.id).execute(&mut *conn).await?;

    let expected = reassignment_count as u64 * 2;
    if result.rows_affected() != expected {
        bail!(
            "Failed to create person actions. Expected: {} Actual: {}",
            expected,
            result.rows_affected()
        );
    }

    info!(
        "Created {} person actions for '{}' event with id {}",
        result.rows_affected(),
        event.event_type,
        event.id
    );
    Ok(())
}
