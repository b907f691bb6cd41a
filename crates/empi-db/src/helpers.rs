//! Temp tables, schema tweaks and index maintenance.
//!
//! Table and column names come from compile-time constants throughout the
//! core, but everything is still quoted defensively the same way user-facing
//! identifiers would be.

use anyhow::{bail, Result};
use sqlx::PgConnection;
use tracing::debug;

/// Quote an identifier for interpolation into DDL/DML.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Create a transaction-scoped temporary table with explicit columns.
///
/// Each column is `(name, sql_type, constraints)`; constraints may be empty.
pub async fn create_temp_table(
    conn: &mut PgConnection,
    table: &str,
    columns: &[(&str, &str, &str)],
) -> Result<()> {
    let cols = columns
        .iter()
        .map(|(name, sql_type, constraints)| {
            format!("{} {} {}", quote_ident(name), sql_type, constraints)
        })
        .collect::<Vec<_>>()
        .join(", ");

    let stmt = format!(
        "create temporary table {} ({}) on commit drop",
        quote_ident(table),
        cols
    );
    debug!("Creating temp table: {}", stmt);
    sqlx::query(&stmt).execute(&mut *conn).await?;
    Ok(())
}

/// Create a transaction-scoped temporary table with the shape of another table.
pub async fn create_temp_table_like(
    conn: &mut PgConnection,
    table: &str,
    like_table: &str,
) -> Result<()> {
    let stmt = format!(
        "create temporary table {} (like {}) on commit drop",
        quote_ident(table),
        quote_ident(like_table)
    );
    debug!("Creating temp table: {}", stmt);
    sqlx::query(&stmt).execute(&mut *conn).await?;
    Ok(())
}

pub async fn drop_table(conn: &mut PgConnection, table: &str) -> Result<()> {
    let stmt = format!("drop table {}", quote_ident(table));
    sqlx::query(&stmt).execute(&mut *conn).await?;
    Ok(())
}

pub async fn add_column(
    conn: &mut PgConnection,
    table: &str,
    column: &str,
    column_type: &str,
    constraints: &[&str],
) -> Result<()> {
    let stmt = format!(
        "alter table {} add column {} {} {}",
        quote_ident(table),
        quote_ident(column),
        column_type,
        constraints.join(" ")
    );
    sqlx::query(&stmt).execute(&mut *conn).await?;
    Ok(())
}

pub async fn drop_column(conn: &mut PgConnection, table: &str, column: &str) -> Result<()> {
    let stmt = format!(
        "alter table {} drop column {}",
        quote_ident(table),
        quote_ident(column)
    );
    sqlx::query(&stmt).execute(&mut *conn).await?;
    Ok(())
}

/// Create an index and refresh planner statistics for the table.
pub async fn create_index(
    conn: &mut PgConnection,
    table: &str,
    column: &str,
    index_name: &str,
) -> Result<()> {
    if index_name.len() > 63 {
        bail!("index name exceeds Postgres identifier limit: {}", index_name);
    }

    let stmt = format!(
        "create index {} on {} ({})",
        quote_ident(index_name),
        quote_ident(table),
        quote_ident(column)
    );
    sqlx::query(&stmt).execute(&mut *conn).await?;

    let analyze = format!("analyze {}", quote_ident(table));
    sqlx::query(&analyze).execute(&mut *conn).await?;
    Ok(())
}
