//! Manual match and the operator read surface.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use empi_core::{
    Config, DbLockId, Job, JobStatus, JobType, MatchEvent, MatchEventType, MatchGroup,
    MatchGroupActionType, PersonActionType,
};
use empi_db::try_advisory_lock_shared;
use sqlx::{PgConnection, PgPool};
use tracing::info;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::types::{
    MatchGroupRecord, PartialConfig, PersonDetail, PersonRecordComment, PersonRecordDetail,
    PersonSummary, PersonUpdate, PotentialMatch, PotentialMatchSummary, PredictionResult,
    SearchParams,
};
use crate::validate::{
    validate_person_update, validate_person_updates, validate_update_records,
};

type Result<T> = std::result::Result<T, ServiceError>;

/// Operator-facing EMPI operations over one connection pool.
#[derive(Clone)]
pub struct EmpiService {
    pool: PgPool,
}

/// Flat (person, record) row used to assemble [`PersonDetail`] groups.
#[derive(sqlx::FromRow)]
struct PersonRecordFlatRow {
    person_uuid: Uuid,
    person_created: DateTime<Utc>,
    person_version: i64,
    id: i64,
    created: DateTime<Utc>,
    person_updated: DateTime<Utc>,
    matched_or_reviewed: Option<DateTime<Utc>>,
    data_source: String,
    source_person_id: String,
    first_name: String,
    last_name: String,
    sex: String,
    race: String,
    birth_date: String,
    death_date: String,
    social_security_number: String,
    address: String,
    city: String,
    state: String,
    zip_code: String,
    county: String,
    phone: String,
}

/// Search filter fragment: `and ...` clauses with their bind values, starting
/// at `$1`.
fn search_conditions(params: &SearchParams) -> (String, Vec<String>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    let mut push = |clause: &str, value: String, binds: &mut Vec<String>| {
        binds.push(value);
        clauses.push(clause.replace("$n", &format!("${}", binds.len())));
    };

    if let Some(first_name) = params.first_name.as_deref().filter(|v| !v.is_empty()) {
        push(
            "and pr_all.first_name ilike $n",
            format!("%{}%", first_name),
            &mut binds,
        );
    }
    if let Some(last_name) = params.last_name.as_deref().filter(|v| !v.is_empty()) {
        push(
            "and pr_all.last_name ilike $n",
            format!("%{}%", last_name),
            &mut binds,
        );
    }
    if let Some(birth_date) = params.birth_date.as_deref().filter(|v| !v.is_empty()) {
        push(
            "and pr_all.birth_date ilike $n",
            format!("%{}%", birth_date),
            &mut binds,
        );
    }
    if let Some(person_id) = params.person_id.as_deref().filter(|v| !v.is_empty()) {
        push(
            "and p.uuid::text like $n",
            format!("{}%", person_id.trim_start_matches('%')),
            &mut binds,
        );
    }
    if let Some(source_person_id) = params.source_person_id.as_deref().filter(|v| !v.is_empty()) {
        push(
            "and pr_all.source_person_id like $n",
            format!("{}%", source_person_id.trim_start_matches('%')),
            &mut binds,
        );
    }
    if let Some(data_source) = params.data_source.as_deref().filter(|v| !v.is_empty()) {
        push(
            "and pr_all.data_source = $n",
            data_source.to_string(),
            &mut binds,
        );
    }

    (clauses.join(" "), binds)
}

impl EmpiService {
    pub fn new(pool: PgPool) -> Self {
        EmpiService { pool }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create an immutable linkage config snapshot.
    pub async fn create_config(&self, config: PartialConfig) -> Result<Config> {
        for (name, value) in [
            ("potential_match_threshold", config.potential_match_threshold),
            ("auto_match_threshold", config.auto_match_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ServiceError::InvalidConfig(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if config.auto_match_threshold <= config.potential_match_threshold {
            return Err(ServiceError::InvalidConfig(
                "auto_match_threshold must be greater than potential_match_threshold".to_string(),
            ));
        }

        let created: Config = sqlx::query_as(
            "insert into config (potential_match_threshold, auto_match_threshold, splink_settings)
             values ($1, $2, $3)
             returning id, created, potential_match_threshold, auto_match_threshold, splink_settings",
        )
        .bind(config.potential_match_threshold)
        .bind(config.auto_match_threshold)
        .bind(&config.splink_settings)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    /// Create a pending import job for already-staged records.
    pub async fn create_job(&self, source_uri: &str, config_id: i64) -> Result<Job> {
        let mut conn = self.pool.acquire().await?;
        self.create_job_in(&mut conn, source_uri, config_id).await
    }

    pub(crate) async fn create_job_in(
        &self,
        conn: &mut PgConnection,
        source_uri: &str,
        config_id: i64,
    ) -> Result<Job> {
        let job: Job = sqlx::query_as(
            "insert into job (config_id, source_uri, status, job_type)
             values ($1, $2, $3, $4)
             returning id, created, updated, config_id, source_uri, status, reason, job_type",
        )
        .bind(config_id)
        .bind(source_uri)
        .bind(JobStatus::New)
        .bind(JobType::ImportPersonRecords)
        .fetch_one(&mut *conn)
        .await?;

        Ok(job)
    }

    /// Distinct data sources over live person records.
    pub async fn get_data_sources(&self) -> Result<Vec<String>> {
        let sources: Vec<String> = sqlx::query_scalar(
            "select distinct data_source from person_record order by data_source",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    /// Summaries of active match groups matching the filters.
    ///
    /// Groups are filtered on any of their records, then re-expanded to all
    /// of their records: a group's membership includes records connected
    /// through shared persons even when no result references them directly.
    pub async fn get_potential_matches(
        &self,
        params: &SearchParams,
    ) -> Result<Vec<PotentialMatchSummary>> {
        info!("Retrieving potential matches");

        let (conditions, binds) = search_conditions(params);
        let stmt = format!(
            "with mgs as (
                 select distinct mg.id
                 from match_group mg
                 inner join splink_result sr
                     on mg.matched is null
                     and mg.deleted is null
                     and mg.id = sr.match_group_id
                 inner join person_record pr
                     on sr.person_record_l_id = pr.id
                     or sr.person_record_r_id = pr.id
                 inner join person p
                     on pr.person_id = p.id
                 inner join person_record pr_all
                     on p.id = pr_all.person_id
                     {conditions}
             ),
             mg_records as (
                 select distinct on (pr_all.id)
                     mg.id, pr_all.id as record_id, pr_all.first_name, pr_all.last_name,
                     pr_all.data_source, sr.match_probability
                 from match_group mg
                 inner join mgs on mg.id = mgs.id
                 inner join splink_result sr on mg.id = sr.match_group_id
                 inner join person_record pr
                     on sr.person_record_l_id = pr.id
                     or sr.person_record_r_id = pr.id
                 inner join person p on pr.person_id = p.id
                 inner join person_record pr_all on p.id = pr_all.person_id
                 order by pr_all.id, sr.match_probability desc
             )
             select
                 id,
                 (array_agg(first_name order by record_id))[1] as first_name,
                 (array_agg(last_name order by record_id))[1] as last_name,
                 array_agg(distinct data_source order by data_source) as data_sources,
                 (array_agg(match_probability order by match_probability desc))[1]
                     as max_match_probability
             from mg_records
             group by id
             order by id",
        );

        let mut query = sqlx::query_as::<_, PotentialMatchSummary>(&stmt);
        for bind in binds {
            query = query.bind(bind);
        }
        let summaries = query.fetch_all(&self.pool).await?;

        info!("Retrieved {} potential matches", summaries.len());
        Ok(summaries)
    }

    /// Full detail of one active match group, read under repeatable-read so
    /// the joins see one snapshot.
    pub async fn get_potential_match(&self, id: i64) -> Result<PotentialMatch> {
        info!("Retrieving potential match with id {}", id);

        let mut tx = self.pool.begin().await?;
        sqlx::query("set transaction isolation level repeatable read")
            .execute(&mut *tx)
            .await?;

        let group: Option<MatchGroup> = sqlx::query_as(
            "select id, uuid, created, updated, deleted, job_id, version, matched
             from match_group
             where id = $1 and matched is null and deleted is null",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(group) = group else {
            return Err(ServiceError::PotentialMatchNotFound(
                "Potential match does not exist".to_string(),
            ));
        };

        let results: Vec<PredictionResult> = sqlx::query_as(
            "select id, created, match_probability, person_record_l_id, person_record_r_id
             from splink_result
             where match_group_id = $1
             order by id",
        )
        .bind(group.id)
        .fetch_all(&mut *tx)
        .await?;

        info!("Retrieved {} results", results.len());

        let persons = potential_match_persons(&mut tx, group.id).await?;

        tx.commit().await?;

        Ok(PotentialMatch {
            id: group.id,
            created: group.created,
            version: group.version,
            persons,
            results,
        })
    }

    /// Person summaries matching the filters.
    pub async fn get_persons(&self, params: &SearchParams) -> Result<Vec<PersonSummary>> {
        info!("Retrieving persons");

        let (conditions, binds) = search_conditions(params);
        let stmt = format!(
            "with pids as (
                 select p.id
                 from person p
                 inner join person_record pr_all
                     on p.id = pr_all.person_id
                     and p.deleted is null
                     {conditions}
             ),
             p_records as (
                 select p.uuid, pr_all.first_name, pr_all.last_name, pr_all.data_source
                 from person p
                 inner join pids on p.id = pids.id
                 inner join person_record pr_all on p.id = pr_all.person_id
                 order by pr_all.id
             )
             select
                 uuid,
                 (array_agg(first_name))[1] as first_name,
                 (array_agg(last_name))[1] as last_name,
                 array_agg(distinct data_source) as data_sources
             from p_records
             group by uuid
             order by last_name, first_name",
        );

        let mut query = sqlx::query_as::<_, PersonSummary>(&stmt);
        for bind in binds {
            query = query.bind(bind);
        }
        let persons = query.fetch_all(&self.pool).await?;

        info!("Retrieved {} persons", persons.len());
        Ok(persons)
    }

    /// One live person with all of its records.
    pub async fn get_person(&self, uuid: Uuid) -> Result<PersonDetail> {
        info!("Retrieving person with uuid {}", uuid);

        let rows: Vec<PersonRecordFlatRow> = sqlx::query_as(
            "select
                 p.uuid as person_uuid,
                 p.created as person_created,
                 p.version as person_version,
                 pr_all.id, pr_all.created, pr_all.person_updated, pr_all.matched_or_reviewed,
                 pr_all.data_source, pr_all.source_person_id, pr_all.first_name,
                 pr_all.last_name, pr_all.sex, pr_all.race, pr_all.birth_date,
                 pr_all.death_date, pr_all.social_security_number, pr_all.address,
                 pr_all.city, pr_all.state, pr_all.zip_code, pr_all.county, pr_all.phone
             from person p
             inner join person_record pr_all
                 on p.uuid = $1
                 and p.deleted is null
                 and p.id = pr_all.person_id
             order by pr_all.id",
        )
        .bind(uuid)
        .fetch_all(&self.pool)
        .await?;

        let mut persons = group_person_rows(rows);
        match persons.len() {
            0 => Err(ServiceError::PersonNotFound),
            1 => Ok(persons.remove(0)),
            n => Err(ServiceError::Internal(anyhow!(
                "expected a single person for uuid {}, found {}",
                uuid,
                n
            ))),
        }
    }

    /// Split/merge persons inside one match group.
    ///
    /// Lock order is the global contract: the shared `MATCH_UPDATE` advisory
    /// lock, then the MatchGroup row, then Persons and PersonRecords by
    /// ascending id. Fails fast with [`ServiceError::ConcurrentMatchUpdates`]
    /// while a matching job holds the exclusive lock; an operator must not
    /// block behind a long batch.
    pub async fn match_person_records(
        &self,
        potential_match_id: i64,
        potential_match_version: i64,
        person_updates: &[PersonUpdate],
        performed_by: Option<i64>,
        comments: &[PersonRecordComment],
    ) -> Result<MatchEvent> {
        for update in person_updates {
            validate_person_update(update)?;
        }
        validate_person_updates(person_updates)?;

        info!(
            "Matching person records for potential match {} v{} ({} person updates)",
            potential_match_id,
            potential_match_version,
            person_updates.len()
        );

        let mut tx = self.pool.begin().await?;

        if !try_advisory_lock_shared(&mut tx, DbLockId::MatchUpdate).await? {
            return Err(ServiceError::ConcurrentMatchUpdates);
        }

        let group: Option<MatchGroup> = sqlx::query_as(
            "select id, uuid, created, updated, deleted, job_id, version, matched
             from match_group
             where id = $1
             for update",
        )
        .bind(potential_match_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(group) = group else {
            return Err(ServiceError::PotentialMatchNotFound(
                "Potential match does not exist".to_string(),
            ));
        };
        if group.deleted.is_some() {
            return Err(ServiceError::PotentialMatchNotFound(
                "Potential match has been replaced".to_string(),
            ));
        }
        if group.matched.is_some() {
            return Err(ServiceError::InvalidPotentialMatch(
                "Potential match has already been matched".to_string(),
            ));
        }
        if group.version != potential_match_version {
            return Err(ServiceError::InvalidPotentialMatch(
                "Potential match version is outdated".to_string(),
            ));
        }

        let match_group_records = match_group_records_for_update(&mut tx, group.id).await?;

        validate_update_records(person_updates, &match_group_records)?;

        let event: MatchEvent = sqlx::query_as(
            "insert into match_event (created, job_id, type)
             values (statement_timestamp(), null, $1)
             returning id, created, job_id, type",
        )
        .bind(MatchEventType::ManualMatch)
        .fetch_one(&mut *tx)
        .await?;

        info!("Created '{}' match event with id {}", event.event_type, event.id);

        let partitions =
            apply_person_updates(&mut tx, &event, &match_group_records, person_updates).await?;

        // Records that changed hands or stayed under review get their
        // ownership timestamps refreshed.
        update_person_records(&mut tx, &event, &partitions.add).await?;
        update_person_records(&mut tx, &event, &partitions.review).await?;

        // Insert order review, remove, add keeps remove-action ids below
        // add-action ids within the event.
        insert_person_actions(
            &mut tx,
            &event,
            group.id,
            performed_by,
            &partitions.review,
            PersonActionType::Review,
        )
        .await?;
        insert_person_actions(
            &mut tx,
            &event,
            group.id,
            performed_by,
            &partitions.remove,
            PersonActionType::RemoveRecord,
        )
        .await?;
        insert_person_actions(
            &mut tx,
            &event,
            group.id,
            performed_by,
            &partitions.add,
            PersonActionType::AddRecord,
        )
        .await?;

        sqlx::query(
            "insert into match_group_action (match_event_id, match_group_id, type, performed_by)
             values ($1, $2, $3, $4)",
        )
        .bind(event.id)
        .bind(group.id)
        .bind(MatchGroupActionType::Match)
        .bind(performed_by)
        .execute(&mut *tx)
        .await?;

        let marked = sqlx::query(
            "update match_group
             set updated = $2, matched = $2, version = version + 1
             where id = $1",
        )
        .bind(group.id)
        .bind(event.created)
        .execute(&mut *tx)
        .await?;
        if marked.rows_affected() != 1 {
            return Err(ServiceError::Internal(anyhow!(
                "failed to mark match group {} as matched",
                group.id
            )));
        }
        info!("Marked match group {} as matched", group.id);

        insert_comments(&mut tx, &event, &match_group_records, comments, performed_by).await?;

        tx.commit().await?;
        Ok(event)
    }
}

/// Read the group's (person, record) crosswalk, locking persons and records
/// in id order.
async fn match_group_records_for_update(
    conn: &mut PgConnection,
    match_group_id: i64,
) -> Result<Vec<MatchGroupRecord>> {
    let records: Vec<MatchGroupRecord> = sqlx::query_as(
        "with records as (
             select
                 p.id as person_id,
                 p.uuid as person_uuid,
                 pr_all.id as person_record_id
             from match_group mg
             inner join splink_result sr
                 on mg.id = $1
                 and mg.id = sr.match_group_id
             inner join person_record pr
                 on sr.person_record_l_id = pr.id
                 or sr.person_record_r_id = pr.id
             inner join person p
                 on pr.person_id = p.id
             inner join person_record pr_all
                 on p.id = pr_all.person_id
             order by p.id, pr_all.id
             for update of p, pr_all
         )
         select distinct on (records.person_record_id)
             person_id, person_uuid, person_record_id
         from records",
    )
    .bind(match_group_id)
    .fetch_all(&mut *conn)
    .await?;

    info!("Retrieved {} match group person records", records.len());

    if records.is_empty() {
        return Err(ServiceError::Internal(anyhow!(
            "Potential match records do not exist"
        )));
    }
    Ok(records)
}

struct ActionPartitions {
    /// (person_id, person_record_id) pairs per action type.
    add: Vec<(i64, i64)>,
    remove: Vec<(i64, i64)>,
    review: Vec<(i64, i64)>,
}

/// Apply each person update (version-guarded) and derive the add/remove/review
/// partition against the group's current assignment. Persons of the group not
/// named by any update contribute review actions only.
async fn apply_person_updates(
    conn: &mut PgConnection,
    event: &MatchEvent,
    match_group_records: &[MatchGroupRecord],
    person_updates: &[PersonUpdate],
) -> Result<ActionPartitions> {
    let mut current_record_ids_by_person_id: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    for record in match_group_records {
        current_record_ids_by_person_id
            .entry(record.person_id)
            .or_default()
            .insert(record.person_record_id);
    }

    let mut partitions = ActionPartitions {
        add: Vec::new(),
        remove: Vec::new(),
        review: Vec::new(),
    };
    let mut updated_person_ids: BTreeSet<i64> = BTreeSet::new();

    for update in person_updates {
        let person_id = update_or_create_person(conn, event, update).await?;

        let current: BTreeSet<i64> = current_record_ids_by_person_id
            .get(&person_id)
            .cloned()
            .unwrap_or_default();
        let new: BTreeSet<i64> = update.new_person_record_ids.iter().copied().collect();

        let added: Vec<i64> = new.difference(&current).copied().collect();
        let removed: Vec<i64> = current.difference(&new).copied().collect();
        let reviewed: Vec<i64> = new.intersection(&current).copied().collect();

        info!(
            "Person {}: adding {}, removing {}, keeping {}",
            person_id,
            added.len(),
            removed.len(),
            reviewed.len()
        );

        partitions.add.extend(added.into_iter().map(|id| (person_id, id)));
        partitions
            .remove
            .extend(removed.into_iter().map(|id| (person_id, id)));
        partitions
            .review
            .extend(reviewed.into_iter().map(|id| (person_id, id)));
        updated_person_ids.insert(person_id);
    }

    // Persons in the group that no update named: every record of theirs has
    // been reviewed by the operator, but nothing moved.
    for (person_id, record_ids) in &current_record_ids_by_person_id {
        if updated_person_ids.contains(person_id) {
            continue;
        }
        partitions
            .review
            .extend(record_ids.iter().map(|&id| (*person_id, id)));
    }

    Ok(partitions)
}

/// Version-guarded update of an existing person, or creation of a new one.
/// Returns the person id.
async fn update_or_create_person(
    conn: &mut PgConnection,
    event: &MatchEvent,
    update: &PersonUpdate,
) -> Result<i64> {
    let record_count = update.new_person_record_ids.len() as i64;

    match update.uuid {
        Some(uuid) => {
            info!("Updating person with uuid {}", uuid);

            let deleted = if record_count == 0 {
                Some(event.created)
            } else {
                None
            };
            let result = sqlx::query(
                "update person
                 set version = version + 1, record_count = $3, updated = $4, deleted = $5
                 where uuid = $1 and version = $2",
            )
            .bind(uuid)
            .bind(update.version)
            .bind(record_count)
            .bind(event.created)
            .bind(deleted)
            .execute(&mut *conn)
            .await?;

            if result.rows_affected() != 1 {
                return Err(ServiceError::InvalidPersonUpdate(
                    "Invalid Person UUID or version outdated".to_string(),
                ));
            }

            let (person_id,): (i64,) = sqlx::query_as("select id from person where uuid = $1")
                .bind(uuid)
                .fetch_one(&mut *conn)
                .await?;

            info!("Updated person with uuid {} (id {})", uuid, person_id);
            Ok(person_id)
        }
        None => {
            info!(
                "Creating new person for record ids {:?}",
                update.new_person_record_ids
            );

            let (person_id,): (i64,) = sqlx::query_as(
                "insert into person (uuid, created, updated, record_count)
                 values (gen_random_uuid(), $1, $1, $2)
                 returning id",
            )
            .bind(event.created)
            .bind(record_count)
            .fetch_one(&mut *conn)
            .await?;

            info!("Created new person with id {}", person_id);
            Ok(person_id)
        }
    }
}

/// Point each record at its (possibly unchanged) person and refresh the
/// event timestamps.
async fn update_person_records(
    conn: &mut PgConnection,
    event: &MatchEvent,
    actions: &[(i64, i64)],
) -> Result<()> {
    info!("Updating {} person records", actions.len());

    let mut updated = 0u64;
    for &(person_id, person_record_id) in actions {
        let result = sqlx::query(
            "update person_record
             set person_id = $2, person_updated = $3, matched_or_reviewed = $3
             where id = $1",
        )
        .bind(person_record_id)
        .bind(person_id)
        .bind(event.created)
        .execute(&mut *conn)
        .await?;
        updated += result.rows_affected();
    }

    if updated != actions.len() as u64 {
        return Err(ServiceError::Internal(anyhow!(
            "Failed to update person records. Only updated {} out of {}",
            updated,
            actions.len()
        )));
    }

    info!("Updated {} person records", updated);
    Ok(())
}

/// Bulk-insert one action per (person, record) pair, preserving pair order.
async fn insert_person_actions(
    conn: &mut PgConnection,
    event: &MatchEvent,
    match_group_id: i64,
    performed_by: Option<i64>,
    actions: &[(i64, i64)],
    action_type: PersonActionType,
) -> Result<()> {
    if actions.is_empty() {
        return Ok(());
    }

    let person_ids: Vec<i64> = actions.iter().map(|(person_id, _)| *person_id).collect();
    let record_ids: Vec<i64> = actions.iter().map(|(_, record_id)| *record_id).collect();

    let result = sqlx::query(
        "insert into person_action
             (match_event_id, match_group_id, person_id, person_record_id, type, performed_by)
         select $1, $2, t.person_id, t.person_record_id, $3, $4
         from unnest($5::bigint[], $6::bigint[]) with ordinality
             as t(person_id, person_record_id, ord)
         order by t.ord",
    )
    .bind(event.id)
    .bind(match_group_id)
    .bind(action_type)
    .bind(performed_by)
    .bind(&person_ids)
    .bind(&record_ids)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != actions.len() as u64 {
        return Err(ServiceError::Internal(anyhow!(
            "Failed to create '{}' person actions. Created {} out of {}",
            action_type,
            result.rows_affected(),
            actions.len()
        )));
    }

    info!(
        "Created {} '{}' person actions",
        result.rows_affected(),
        action_type
    );
    Ok(())
}

/// Attach operator comments as notes on the records they reference.
async fn insert_comments(
    conn: &mut PgConnection,
    event: &MatchEvent,
    match_group_records: &[MatchGroupRecord],
    comments: &[PersonRecordComment],
    performed_by: Option<i64>,
) -> Result<()> {
    if comments.is_empty() {
        return Ok(());
    }

    let known_records: BTreeSet<i64> = match_group_records
        .iter()
        .map(|record| record.person_record_id)
        .collect();
    let author = performed_by.map(|id| id.to_string()).unwrap_or_default();

    for comment in comments {
        if !known_records.contains(&comment.person_record_id) {
            return Err(ServiceError::InvalidPersonUpdate(format!(
                "Comment references PersonRecord {} which is not related to PotentialMatch",
                comment.person_record_id
            )));
        }

        sqlx::query(
            "insert into person_record_note (created, updated, person_record_id, note, author)
             values ($1, $1, $2, $3, $4)",
        )
        .bind(event.created)
        .bind(comment.person_record_id)
        .bind(&comment.comment)
        .bind(&author)
        .execute(&mut *conn)
        .await?;
    }

    info!("Created {} person record notes", comments.len());
    Ok(())
}

/// Read the persons of a match group with all of their records, including
/// records no result references (they join through person ownership).
async fn potential_match_persons(
    conn: &mut PgConnection,
    match_group_id: i64,
) -> Result<Vec<PersonDetail>> {
    let rows: Vec<PersonRecordFlatRow> = sqlx::query_as(
        "with persons as (
             select distinct on (pr_all.id)
                 p.uuid as person_uuid,
                 p.created as person_created,
                 p.version as person_version,
                 pr_all.id, pr_all.created, pr_all.person_updated, pr_all.matched_or_reviewed,
                 pr_all.data_source, pr_all.source_person_id, pr_all.first_name,
                 pr_all.last_name, pr_all.sex, pr_all.race, pr_all.birth_date,
                 pr_all.death_date, pr_all.social_security_number, pr_all.address,
                 pr_all.city, pr_all.state, pr_all.zip_code, pr_all.county, pr_all.phone
             from match_group mg
             inner join splink_result sr
                 on mg.id = $1
                 and mg.id = sr.match_group_id
             inner join person_record pr
                 on sr.person_record_l_id = pr.id
                 or sr.person_record_r_id = pr.id
             inner join person p
                 on pr.person_id = p.id
             inner join person_record pr_all
                 on p.id = pr_all.person_id
         )
         select * from persons
         order by person_uuid, id",
    )
    .bind(match_group_id)
    .fetch_all(&mut *conn)
    .await?;

    info!("Retrieved {} potential match person records", rows.len());

    Ok(group_person_rows(rows))
}

/// Group flat (person, record) rows into person details. Rows must arrive
/// sorted by person uuid.
fn group_person_rows(rows: Vec<PersonRecordFlatRow>) -> Vec<PersonDetail> {
    let mut persons: Vec<PersonDetail> = Vec::new();

    for row in rows {
        let record = PersonRecordDetail {
            id: row.id,
            created: row.created,
            person_uuid: row.person_uuid,
            person_updated: row.person_updated,
            matched_or_reviewed: row.matched_or_reviewed,
            data_source: row.data_source,
            source_person_id: row.source_person_id,
            first_name: row.first_name,
            last_name: row.last_name,
            sex: row.sex,
            race: row.race,
            birth_date: row.birth_date,
            death_date: row.death_date,
            social_security_number: row.social_security_number,
            address: row.address,
            city: row.city,
            state: row.state,
            zip_code: row.zip_code,
            county: row.county,
            phone: row.phone,
        };

        match persons.last_mut() {
            Some(person) if person.uuid == row.person_uuid => person.records.push(record),
            _ => persons.push(PersonDetail {
                uuid: row.person_uuid,
                created: row.person_created,
                version: row.person_version,
                records: vec![record],
            }),
        }
    }

    persons
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_conditions_number_binds_in_order() {
        let params = SearchParams {
            first_name: Some("ann".to_string()),
            data_source: Some("clinic-a".to_string()),
            ..Default::default()
        };
        let (sql, binds) = search_conditions(&params);

        assert_eq!(
            sql,
            "and pr_all.first_name ilike $1 and pr_all.data_source = $2"
        );
        assert_eq!(binds, vec!["%ann%".to_string(), "clinic-a".to_string()]);
    }

    #[test]
    fn search_conditions_empty_params_yield_nothing() {
        let (sql, binds) = search_conditions(&SearchParams::default());
        assert!(sql.is_empty());
        assert!(binds.is_empty());
    }

    #[test]
    fn person_id_prefix_search_strips_leading_wildcard() {
        let params = SearchParams {
            person_id: Some("%abc".to_string()),
            ..Default::default()
        };
        let (_, binds) = search_conditions(&params);
        assert_eq!(binds, vec!["abc%".to_string()]);
    }
}
