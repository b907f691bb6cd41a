//! Postgres plumbing for the EMPI core: advisory locks, transaction-scoped
//! temp tables and CSV bulk COPY.

pub mod copy;
pub mod helpers;
pub mod locks;

use sqlx::PgPool;

pub use copy::{copy_in_csv, copy_out_csv};
pub use helpers::{
    add_column, create_index, create_temp_table, create_temp_table_like, drop_column, drop_table,
    quote_ident,
};
pub use locks::{obtain_advisory_lock, try_advisory_lock, try_advisory_lock_shared};

/// Apply the schema migrations bundled with this crate.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
