//! Typed errors surfaced to the operator-facing layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// A matching job holds the exclusive match-update lock. The caller
    /// should retry once the job finishes rather than queue behind it.
    #[error(
        "A matching job is currently updating matches. \
         Please wait until the job finishes to perform a match."
    )]
    ConcurrentMatchUpdates,

    /// The referenced potential match is gone, replaced or already matched,
    /// or the supplied version is outdated.
    #[error("{0}")]
    InvalidPotentialMatch(String),

    /// A person update in a manual match request is malformed or conflicts
    /// with the current group state.
    #[error("{0}")]
    InvalidPersonUpdate(String),

    #[error("{0}")]
    PotentialMatchNotFound(String),

    #[error("Person does not exist")]
    PersonNotFound,

    #[error("Incorrectly formatted person records file: {0}")]
    InvalidPersonRecordFileFormat(String),

    #[error("{0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
