//! CSV bulk COPY in and out of Postgres.
//!
//! Row structs are serialized positionally, so their field order must match
//! the column list handed to the COPY statement.

use anyhow::{bail, Context, Result};
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgConnection;
use tracing::debug;

use crate::helpers::quote_ident;

/// Bulk-load rows into a table via `COPY ... FROM STDIN`.
///
/// Fails if the server reports a different row count than the number of rows
/// serialized.
pub async fn copy_in_csv<T: Serialize>(
    conn: &mut PgConnection,
    table: &str,
    columns: &[&str],
    rows: &[T],
) -> Result<u64> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).context("serializing COPY payload")?;
    }
    let payload = writer.into_inner().context("flushing COPY payload")?;

    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(",");
    let stmt = format!(
        "copy {} ({}) from stdin with (format csv, delimiter ',')",
        quote_ident(table),
        cols
    );
    debug!("COPY in: {}", stmt);

    let mut copy_in = conn.copy_in_raw(&stmt).await?;
    copy_in.send(payload.as_slice()).await?;
    let copied = copy_in.finish().await?;

    if copied != rows.len() as u64 {
        bail!(
            "Copied fewer rows than expected. Expected: {} Actual: {}",
            rows.len(),
            copied
        );
    }

    Ok(copied)
}

/// Bulk-extract a query result via `COPY ... TO STDOUT` into typed rows.
///
/// The query's output column names must match the target struct's fields
/// (the CSV header drives deserialization).
pub async fn copy_out_csv<T: DeserializeOwned>(
    conn: &mut PgConnection,
    query: &str,
) -> Result<Vec<T>> {
    let stmt = format!(
        "copy ({}) to stdout with (format csv, header, delimiter ',')",
        query
    );
    debug!("COPY out: {}", stmt);

    let mut stream = conn.copy_out_raw(&stmt).await?;
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.try_next().await? {
        buf.extend_from_slice(&chunk);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(buf.as_slice());
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row.context("deserializing COPY output")?);
    }
    Ok(rows)
}
