//! Manual match scenarios against a live database.
//!
//! These tests require a running PostgreSQL database; set DATABASE_URL and
//! run with `cargo test -- --ignored --test-threads=1`. Potential matches are
//! produced by running the matcher with the deterministic exact-match linker
//! below the auto threshold, so groups stay open for the operator.

use std::sync::Arc;

use empi_core::DbLockId;
use empi_matcher::{ExactMatchLinker, JobOutcome, Matcher};
use empi_service::{
    EmpiService, PartialConfig, PersonUpdate, SearchParams, ServiceError,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect to test database");
    empi_db::run_migrations(&pool).await.expect("run migrations");
    pool
}

fn unique_source() -> String {
    format!("svc-{}", Uuid::new_v4())
}

fn import_csv(source: &str, rows: &[(&str, &str, &str, &str)]) -> Vec<u8> {
    let mut csv = String::from(
        "data_source,source_person_id,first_name,last_name,sex,race,birth_date,death_date,\
         social_security_number,address,city,state,zip_code,county,phone\n",
    );
    for (source_person_id, first_name, last_name, birth_date) in rows {
        csv.push_str(&format!(
            "{source},{source_person_id},{first_name},{last_name},F,,{birth_date},,,,,,,,\n"
        ));
    }
    csv.into_bytes()
}

/// Import four records sharing one name so the matcher links them into a
/// single open potential match of four persons.
async fn seed_open_group(service: &EmpiService, pool: &PgPool, source: &str) -> i64 {
    let config = service
        .create_config(PartialConfig {
            splink_settings: json!({
                "blocking_rules_to_generate_predictions": [
                    {"blocking_rule": "l.last_name = r.last_name"},
                ],
            }),
            potential_match_threshold: 0.5,
            // The exact-match linker tops out below this, so nothing
            // auto-matches and the group stays open.
            auto_match_threshold: 0.99,
        })
        .await
        .unwrap();

    // The last name doubles as the source tag so the exact-match linker
    // cannot pair these records with another test's data.
    let csv = import_csv(
        source,
        &[
            ("r1", "Lou", source, "1965-04-04"),
            ("r2", "Lou", source, "1965-04-04"),
            ("r3", "Lou", source, "1965-04-04"),
            ("r4", "Lou", source, "1965-04-04"),
        ],
    );
    let job_id = service
        .import_person_records(&csv, "test://import", config.id)
        .await
        .unwrap();

    let matcher = Matcher::new(pool.clone(), Arc::new(ExactMatchLinker));
    assert_eq!(
        matcher.process_job(job_id).await.unwrap(),
        JobOutcome::Succeeded
    );

    let matches = service
        .get_potential_matches(&SearchParams {
            data_source: Some(source.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(matches.len(), 1, "the four records form one open group");
    matches[0].id
}

/// Map source_person_id -> (person uuid, person version, record id).
async fn group_membership(
    service: &EmpiService,
    potential_match_id: i64,
) -> std::collections::HashMap<String, (Uuid, i64, i64)> {
    let detail = service.get_potential_match(potential_match_id).await.unwrap();

    let mut membership = std::collections::HashMap::new();
    for person in &detail.persons {
        for record in &person.records {
            membership.insert(
                record.source_person_id.clone(),
                (person.uuid, person.version, record.id),
            );
        }
    }
    membership
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn s3_operator_split() {
    let pool = pool().await;
    let service = EmpiService::new(pool.clone());
    let source = unique_source();

    let match_id = seed_open_group(&service, &pool, &source).await;
    let detail = service.get_potential_match(match_id).await.unwrap();
    assert_eq!(detail.persons.len(), 4);

    let membership = group_membership(&service, match_id).await;
    let (p1_uuid, p1_version, r1) = membership["r1"];
    let (p2_uuid, p2_version, r2) = membership["r2"];
    let (p3_uuid, p3_version, r3) = membership["r3"];
    let (p4_uuid, _, _) = membership["r4"];

    // p1 keeps r1 and absorbs r2; p2 takes r3; p3 keeps nothing; p4 untouched.
    let updates = vec![
        PersonUpdate {
            uuid: Some(p1_uuid),
            version: Some(p1_version),
            new_person_record_ids: vec![r1, r2],
        },
        PersonUpdate {
            uuid: Some(p2_uuid),
            version: Some(p2_version),
            new_person_record_ids: vec![r3],
        },
        PersonUpdate {
            uuid: Some(p3_uuid),
            version: Some(p3_version),
            new_person_record_ids: vec![],
        },
    ];

    let event = service
        .match_person_records(match_id, detail.version, &updates, Some(7), &[])
        .await
        .unwrap();

    let persons: Vec<(Uuid, i64, i64, Option<chrono::DateTime<chrono::Utc>>)> = sqlx::query_as(
        "select uuid, record_count, version, deleted from person where uuid = any($1)",
    )
    .bind(vec![p1_uuid, p2_uuid, p3_uuid, p4_uuid])
    .fetch_all(&pool)
    .await
    .unwrap();
    let by_uuid: std::collections::HashMap<Uuid, (i64, i64, bool)> = persons
        .into_iter()
        .map(|(uuid, count, version, deleted)| (uuid, (count, version, deleted.is_some())))
        .collect();

    assert_eq!(by_uuid[&p1_uuid], (2, p1_version + 1, false));
    assert_eq!(by_uuid[&p2_uuid], (1, p2_version + 1, false));
    assert_eq!(by_uuid[&p3_uuid].0, 0);
    assert!(by_uuid[&p3_uuid].2, "emptied person is soft-deleted");
    assert_eq!(by_uuid[&p4_uuid], (1, 1, false), "untouched person keeps v1");

    // 2 review (r1 stays, r4 untouched) + 2 remove (r2, r3) + 2 add, with
    // every remove id below every add id.
    let actions: Vec<(i64, String, Option<i64>)> = sqlx::query_as(
        "select id, type, performed_by from person_action
         where match_event_id = $1 order by id",
    )
    .bind(event.id)
    .fetch_all(&pool)
    .await
    .unwrap();
    let types: Vec<&str> = actions.iter().map(|(_, t, _)| t.as_str()).collect();
    assert_eq!(
        types,
        vec!["review", "review", "remove-record", "remove-record", "add-record", "add-record"]
    );
    assert!(actions.iter().all(|(_, _, by)| *by == Some(7)));

    let max_remove = actions
        .iter()
        .filter(|(_, t, _)| t == "remove-record")
        .map(|(id, _, _)| *id)
        .max()
        .unwrap();
    let min_add = actions
        .iter()
        .filter(|(_, t, _)| t == "add-record")
        .map(|(id, _, _)| *id)
        .min()
        .unwrap();
    assert!(max_remove < min_add);

    let (matched, version): (Option<chrono::DateTime<chrono::Utc>>, i64) =
        sqlx::query_as("select matched, version from match_group where id = $1")
            .bind(match_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(matched.is_some());
    assert_eq!(version, detail.version + 1);
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn s4_concurrent_match_updates_fails_fast() {
    let pool = pool().await;
    let service = EmpiService::new(pool.clone());

    // Simulate the matcher holding MATCH_UPDATE exclusively in an open
    // transaction on another connection.
    let mut blocker = pool.begin().await.unwrap();
    sqlx::query("select pg_advisory_xact_lock($1)")
        .bind(DbLockId::MatchUpdate.key())
        .execute(&mut *blocker)
        .await
        .unwrap();

    let before: i64 =
        sqlx::query_scalar("select count(*) from match_event where type = 'manual-match'")
            .fetch_one(&pool)
            .await
            .unwrap();

    let err = service
        .match_person_records(i64::MAX - 5, 1, &[], None, &[])
        .await
        .unwrap_err();
    assert!(
        matches!(err, ServiceError::ConcurrentMatchUpdates),
        "lock check precedes everything else, got {err:?}"
    );

    let after: i64 =
        sqlx::query_scalar("select count(*) from match_event where type = 'manual-match'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(before, after, "no event may be written");

    // Once the lock is released the same call reaches the not-found check.
    blocker.rollback().await.unwrap();
    let err = service
        .match_person_records(i64::MAX - 5, 1, &[], None, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::PotentialMatchNotFound(_)));
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn s5_version_mismatch_writes_nothing() {
    let pool = pool().await;
    let service = EmpiService::new(pool.clone());
    let source = unique_source();

    let match_id = seed_open_group(&service, &pool, &source).await;
    let detail = service.get_potential_match(match_id).await.unwrap();
    let membership = group_membership(&service, match_id).await;
    let (p1_uuid, p1_version, r1) = membership["r1"];

    let before: i64 =
        sqlx::query_scalar("select count(*) from match_event where type = 'manual-match'")
            .fetch_one(&pool)
            .await
            .unwrap();

    let err = service
        .match_person_records(
            match_id,
            detail.version - 1,
            &[PersonUpdate {
                uuid: Some(p1_uuid),
                version: Some(p1_version),
                new_person_record_ids: vec![r1],
            }],
            None,
            &[],
        )
        .await
        .unwrap_err();

    match err {
        ServiceError::InvalidPotentialMatch(message) => {
            assert_eq!(message, "Potential match version is outdated");
        }
        other => panic!("expected InvalidPotentialMatch, got {other:?}"),
    }

    let after: i64 =
        sqlx::query_scalar("select count(*) from match_event where type = 'manual-match'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn s6_records_linked_through_persons_surface_in_group() {
    let pool = pool().await;
    let service = EmpiService::new(pool.clone());
    let source = unique_source();

    let match_id = seed_open_group(&service, &pool, &source).await;
    let membership = group_membership(&service, match_id).await;
    let (_, _, r1) = membership["r1"];

    // Attach an extra record to r1's person without any result referencing
    // it, as if an earlier job had assigned it there.
    let (person_id,): (i64,) =
        sqlx::query_as("select person_id from person_record where id = $1")
            .bind(r1)
            .fetch_one(&pool)
            .await
            .unwrap();
    let (job_id,): (i64,) = sqlx::query_as("select job_id from person_record where id = $1")
        .bind(r1)
        .fetch_one(&pool)
        .await
        .unwrap();
    sqlx::query(
        "insert into person_record (
             created, job_id, person_id, person_updated, sha256, data_source,
             source_person_id, first_name, last_name, sex, race, birth_date, death_date,
             social_security_number, address, city, state, zip_code, county, phone
         )
         values (statement_timestamp(), $1, $2, statement_timestamp(),
                 digest($3, 'sha256'), $4, 'r9', 'Lou', $4, 'F', '', '1965-04-04',
                 '', '', '', '', '', '', '', '')",
    )
    .bind(job_id)
    .bind(person_id)
    .bind(format!("{source}-extra"))
    .bind(&source)
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("update person set record_count = record_count + 1 where id = $1")
        .bind(person_id)
        .execute(&pool)
        .await
        .unwrap();

    let detail = service.get_potential_match(match_id).await.unwrap();
    let all_sources: Vec<String> = detail
        .persons
        .iter()
        .flat_map(|p| p.records.iter().map(|r| r.source_person_id.clone()))
        .collect();
    assert!(
        all_sources.contains(&"r9".to_string()),
        "record attached via person ownership must surface: {all_sources:?}"
    );

    // The summary view counts it too.
    let summaries = service
        .get_potential_matches(&SearchParams {
            data_source: Some(source.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].data_sources.contains(&source));
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn import_rejects_bad_header() {
    let pool = pool().await;
    let service = EmpiService::new(pool.clone());

    let config = service
        .create_config(PartialConfig {
            splink_settings: json!({
                "blocking_rules_to_generate_predictions": ["l.phone = r.phone"],
            }),
            potential_match_threshold: 0.5,
            auto_match_threshold: 0.9,
        })
        .await
        .unwrap();

    let err = service
        .import_person_records(b"wrong,header\nrow,here\n", "test://import", config.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidPersonRecordFileFormat(_)));
}

#[tokio::test]
#[ignore] // Requires running PostgreSQL
async fn export_round_trips_imported_records() {
    let pool = pool().await;
    let service = EmpiService::new(pool.clone());
    let source = unique_source();

    seed_open_group(&service, &pool, &source).await;

    let mut sink: Vec<u8> = Vec::new();
    let exported = service.export_person_records(&mut sink).await.unwrap();
    assert!(exported >= 4);

    let text = String::from_utf8(sink).unwrap();
    assert!(text.starts_with("person_id,source_person_id,data_source,"));
    assert!(text.contains(&source));
}
