//! Match event creation.

use anyhow::Result;
use empi_core::{MatchEvent, MatchEventType};
use sqlx::PgConnection;
use tracing::info;

/// Insert a new match event stamped with `statement_timestamp()`.
///
/// The returned event's `created` is the timestamp every write belonging to
/// the event must reuse.
pub async fn create_match_event(
    conn: &mut PgConnection,
    job_id: Option<i64>,
    event_type: MatchEventType,
) -> Result<MatchEvent> {
    info!("Creating '{}' match event", event_type);

    let event: MatchEvent = sqlx::query_as(
        "insert into match_event (created, job_id, type)
         values (statement_timestamp(), $1, $2)
         returning id, created, job_id, type",
    )
    .bind(job_id)
    .bind(event_type)
    .fetch_one(&mut *conn)
    .await?;

    info!("Created '{}' match event with id {}", event_type, event.id);
    Ok(event)
}
