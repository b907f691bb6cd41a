//! Operator-facing DTOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Parameters for a new linkage config snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct PartialConfig {
    pub splink_settings: Value,
    pub potential_match_threshold: f64,
    pub auto_match_threshold: f64,
}

/// One person in a manual match request.
///
/// Either `uuid` + `version` reference an existing person of the match
/// group, or both are absent and a new person is created for the listed
/// records.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersonUpdate {
    pub uuid: Option<Uuid>,
    pub version: Option<i64>,
    pub new_person_record_ids: Vec<i64>,
}

/// Operator note attached to a person record during a manual match.
#[derive(Debug, Clone, Deserialize)]
pub struct PersonRecordComment {
    pub person_record_id: i64,
    pub comment: String,
}

/// Optional filters shared by the potential-match and person searches.
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub birth_date: Option<String>,
    pub person_id: Option<String>,
    pub source_person_id: Option<String>,
    pub data_source: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PotentialMatchSummary {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub data_sources: Vec<String>,
    pub max_match_probability: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonRecordDetail {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub person_uuid: Uuid,
    pub person_updated: DateTime<Utc>,
    pub matched_or_reviewed: Option<DateTime<Utc>>,
    pub data_source: String,
    pub source_person_id: String,
    pub first_name: String,
    pub last_name: String,
    pub sex: String,
    pub race: String,
    pub birth_date: String,
    pub death_date: String,
    pub social_security_number: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub county: String,
    pub phone: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonDetail {
    pub uuid: Uuid,
    pub created: DateTime<Utc>,
    pub version: i64,
    pub records: Vec<PersonRecordDetail>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PredictionResult {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub match_probability: f64,
    pub person_record_l_id: i64,
    pub person_record_r_id: i64,
}

/// Full detail of one active match group.
#[derive(Debug, Clone, Serialize)]
pub struct PotentialMatch {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub version: i64,
    pub persons: Vec<PersonDetail>,
    pub results: Vec<PredictionResult>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PersonSummary {
    pub uuid: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub data_sources: Vec<String>,
}

/// One (person, record) membership of a match group, as read under lock for
/// a manual match.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MatchGroupRecord {
    pub person_id: i64,
    pub person_uuid: Uuid,
    pub person_record_id: i64,
}
