//! CSV staging import and person-record export.
//!
//! The bytes come from whatever object store the deployment uses; fetching
//! and uploading them is the caller's concern.

use anyhow::Context;
use empi_core::DEMOGRAPHIC_COLUMNS;
use empi_db::{create_temp_table_like, drop_column, quote_ident};
use serde::Serialize;
use sqlx::PgConnection;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::service::EmpiService;

type Result<T> = std::result::Result<T, ServiceError>;

/// One exported person record row; `person_id` is the owning person's uuid.
#[derive(Debug, Serialize, sqlx::FromRow)]
struct ExportRow {
    person_id: Uuid,
    source_person_id: String,
    data_source: String,
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

impl EmpiService {
    /// Load a person-records CSV into staging and create the import job.
    ///
    /// The header must match the demographic column list exactly. Blank
    /// fields are forced to empty strings so the content hash is stable.
    /// Returns the new job's id.
    pub async fn import_person_records(
        &self,
        csv_bytes: &[u8],
        source_uri: &str,
        config_id: i64,
    ) -> Result<i64> {
        info!("Importing person records");

        let expected_header = DEMOGRAPHIC_COLUMNS.join(",");
        let actual_header = first_line(csv_bytes);

        if actual_header != expected_header {
            let message = format!(
                "invalid header. Expected header: '{}' Actual header: '{}'",
                expected_header, actual_header
            );
            error!("Incorrectly formatted person records file: {}", message);
            return Err(ServiceError::InvalidPersonRecordFileFormat(message));
        }

        let mut tx = self.pool().begin().await?;

        let job = self.create_job_in(&mut tx, source_uri, config_id).await?;

        let temp_table = "person_record_staging_temp";
        create_temp_table_like(&mut tx, temp_table, "person_record_staging")
            .await
            .map_err(ServiceError::Internal)?;
        for column in ["id", "created", "job_id", "row_number"] {
            drop_column(&mut tx, temp_table, column)
                .await
                .map_err(ServiceError::Internal)?;
        }

        let columns = DEMOGRAPHIC_COLUMNS
            .iter()
            .map(|col| quote_ident(col))
            .collect::<Vec<_>>()
            .join(",");
        let copy_stmt = format!(
            "copy {} ({columns}) from stdin \
             with (format csv, delimiter ',', header, force_not_null ({columns}))",
            quote_ident(temp_table),
        );

        let copied = copy_csv_body(&mut tx, &copy_stmt, csv_bytes).await?;
        info!("Copied {} staging rows from import file", copied);

        let insert_stmt = format!(
            "insert into person_record_staging (job_id, created, {cols})
             select $1, statement_timestamp(), {cols}
             from {temp}",
            cols = DEMOGRAPHIC_COLUMNS.join(", "),
            temp = quote_ident(temp_table),
        );
        sqlx::query(&insert_stmt)
            .bind(job.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!("Created import job {} with {} staging rows", job.id, copied);
        Ok(job.id)
    }

    /// Stream every live person record with its person uuid as CSV into the
    /// sink. Returns the number of exported rows.
    pub async fn export_person_records(&self, sink: &mut dyn std::io::Write) -> Result<u64> {
        info!("Exporting person records");

        let rows: Vec<ExportRow> = sqlx::query_as(
            "select
                 p.uuid as person_id,
                 pr.source_person_id,
                 pr.data_source,
                 pr.first_name,
                 pr.last_name,
                 pr.sex,
                 pr.race,
                 pr.birth_date,
                 pr.death_date,
                 pr.social_security_number,
                 pr.address,
                 pr.city,
                 pr.state,
                 pr.zip_code,
                 pr.county,
                 pr.phone
             from person_record pr
             inner join person p on pr.person_id = p.id
             order by pr.id",
        )
        .fetch_all(self.pool())
        .await?;

        let mut writer = csv::WriterBuilder::new().has_headers(true).from_writer(sink);
        for row in &rows {
            writer
                .serialize(row)
                .context("serializing export row")
                .map_err(ServiceError::Internal)?;
        }
        writer
            .flush()
            .context("flushing export sink")
            .map_err(ServiceError::Internal)?;

        info!("Exported {} person records", rows.len());
        Ok(rows.len() as u64)
    }
}

/// First line of the file, without the trailing newline/carriage return.
fn first_line(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
        .trim_end_matches('\r')
        .to_string()
}

/// Run the COPY, mapping malformed-data failures to the file-format error.
async fn copy_csv_body(
    conn: &mut PgConnection,
    copy_stmt: &str,
    csv_bytes: &[u8],
) -> Result<u64> {
    let mut copy_in = conn.copy_in_raw(copy_stmt).await?;
    if let Err(err) = copy_in.send(csv_bytes).await {
        // Abort the COPY before surfacing the data error.
        let _ = copy_in.abort("malformed import file").await;
        return Err(ServiceError::InvalidPersonRecordFileFormat(err.to_string()));
    }
    match copy_in.finish().await {
        Ok(copied) => Ok(copied),
        Err(err) => Err(ServiceError::InvalidPersonRecordFileFormat(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_handles_crlf() {
        assert_eq!(first_line(b"a,b,c\r\nrow"), "a,b,c");
        assert_eq!(first_line(b"a,b,c\nrow"), "a,b,c");
        assert_eq!(first_line(b"a,b,c"), "a,b,c");
    }

    #[test]
    fn header_mismatch_message_names_both_headers() {
        let expected = DEMOGRAPHIC_COLUMNS.join(",");
        assert!(expected.starts_with("data_source,source_person_id,"));
        assert!(expected.ends_with(",phone"));
    }
}
