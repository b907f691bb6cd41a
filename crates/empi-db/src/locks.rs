//! Transaction-scoped advisory locks.
//!
//! All locks are released automatically when the enclosing transaction ends;
//! there is no explicit unlock.

use empi_core::DbLockId;
use sqlx::PgConnection;
use tracing::info;

/// Block until the exclusive lock is acquired.
pub async fn obtain_advisory_lock(conn: &mut PgConnection, lock: DbLockId) -> sqlx::Result<()> {
    info!("Waiting for exclusive lock of {} ({})", lock.name(), lock.key());

    sqlx::query("select pg_advisory_xact_lock($1)")
        .bind(lock.key())
        .execute(&mut *conn)
        .await?;

    info!("Acquired exclusive lock of {} ({})", lock.name(), lock.key());
    Ok(())
}

/// Try to acquire the exclusive lock without blocking.
pub async fn try_advisory_lock(conn: &mut PgConnection, lock: DbLockId) -> sqlx::Result<bool> {
    let acquired: bool = sqlx::query_scalar("select pg_try_advisory_xact_lock($1)")
        .bind(lock.key())
        .fetch_one(&mut *conn)
        .await?;

    info!(
        "Try exclusive lock of {} ({}): acquired={}",
        lock.name(),
        lock.key(),
        acquired
    );
    Ok(acquired)
}

/// Try to acquire a shared (reader) hold without blocking.
///
/// Succeeds alongside other shared holders; fails while an exclusive holder
/// is present.
pub async fn try_advisory_lock_shared(
    conn: &mut PgConnection,
    lock: DbLockId,
) -> sqlx::Result<bool> {
    let acquired: bool = sqlx::query_scalar("select pg_try_advisory_xact_lock_shared($1)")
        .bind(lock.key())
        .fetch_one(&mut *conn)
        .await?;

    info!(
        "Try shared lock of {} ({}): acquired={}",
        lock.name(),
        lock.key(),
        acquired
    );
    Ok(acquired)
}
