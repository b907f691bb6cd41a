//! Analyzer input and output rows.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// One scored pair handed to the analyzer.
///
/// `row_number` is the caller's stable handle for the result; the analyzer
/// never interprets it beyond uniqueness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultRow {
    pub row_number: i64,
    pub match_probability: f64,
    pub person_record_l_id: i64,
    pub person_record_r_id: i64,
}

/// Person-to-record projection covering exactly the records referenced by the
/// results under analysis. One row per record.
#[derive(Debug, Clone, PartialEq)]
pub struct CrosswalkRow {
    pub person_id: i64,
    pub person_created: DateTime<Utc>,
    pub person_version: i64,
    pub record_count: i64,
    pub person_record_id: i64,
}

/// A proposed match group. `matched` is true when every record in the group
/// resolves to a single person after auto-match reassignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchGroupOut {
    pub uuid: Uuid,
    pub matched: bool,
}

/// Assignment of one result row to its match group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupResult {
    pub result_row_number: i64,
    pub match_group_uuid: Uuid,
}

/// One record moving between persons due to an auto-match.
///
/// Versions are the optimistic-concurrency tokens observed while the rows
/// were locked; the writer refuses to apply the move if they have drifted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonReassignment {
    pub match_group_uuid: Uuid,
    pub person_record_id: i64,
    pub from_person_id: i64,
    pub from_person_version: i64,
    pub to_person_id: i64,
    pub to_person_version: i64,
}

/// Full analyzer output.
#[derive(Debug, Clone)]
pub struct MatchAnalysis {
    pub match_groups: Vec<MatchGroupOut>,
    pub results: Vec<GroupResult>,
    pub person_actions: Vec<PersonReassignment>,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("results must not be empty")]
    EmptyResults,

    #[error("persons must not be empty")]
    EmptyCrosswalk,

    #[error(
        "person crosswalk must contain a Person for each PersonRecord referenced \
         in the results; missing PersonRecord {0}"
    )]
    MissingCrosswalkEntry(i64),

    #[error(
        "person crosswalk must contain a Person for each PersonRecord referenced \
         in the results and must not contain extra Persons"
    )]
    CrosswalkMismatch,
}
