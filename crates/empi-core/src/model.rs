//! Entities and enum-valued columns.

use std::error::Error;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgArgumentBuffer, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Type};
use uuid::Uuid;

/// `to_char` format used whenever a timestamp is rendered into a text frame.
pub const TIMESTAMP_FORMAT: &str = "YYYY-MM-DD\"T\"HH24:MI:SS.USTZH:TZM";

/// Demographic columns of a person record, in canonical order.
///
/// This order is load-bearing: it defines the sha256 pre-image, the import
/// CSV header and the frame handed to the linker.
pub const DEMOGRAPHIC_COLUMNS: [&str; 15] = [
    "data_source",
    "source_person_id",
    "first_name",
    "last_name",
    "sex",
    "race",
    "birth_date",
    "death_date",
    "social_security_number",
    "address",
    "city",
    "state",
    "zip_code",
    "county",
    "phone",
];

/// Error returned when a text column holds no known enum variant.
#[derive(Debug)]
pub struct UnknownVariant {
    value: String,
    expected: &'static str,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} value: {:?}", self.expected, self.value)
    }
}

impl Error for UnknownVariant {}

/// Declares a text-backed enum with serde and sqlx codecs.
///
/// Values are stored in TEXT columns, so the sqlx impls delegate to `&str`
/// rather than mapping a Postgres enum type.
macro_rules! text_enum {
    ($(#[$doc:meta])* $name:ident { $($(#[$vdoc:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vdoc])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant)),+,
                    other => Err(UnknownVariant {
                        value: other.to_string(),
                        expected: stringify!($name),
                    }),
                }
            }
        }

        impl Type<Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as Type<Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <&str as Type<Postgres>>::compatible(ty)
            }
        }

        impl<'q> Encode<'q, Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as Encode<'q, Postgres>>::encode_by_ref(&self.as_str(), buf)
            }
        }

        impl<'r> Decode<'r, Postgres> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
                let text = <&str as Decode<'r, Postgres>>::decode(value)?;
                Ok(text.parse::<$name>()?)
            }
        }
    };
}

text_enum! {
    /// Lifecycle of a matching job. Terminal states are final.
    JobStatus {
        New => "new",
        Succeeded => "succeeded",
        Failed => "failed",
    }
}

text_enum! {
    JobType {
        ImportPersonRecords => "import_person_records",
        ExportPotentialMatches => "export_potential_matches",
    }
}

text_enum! {
    /// Atomic unit of change in the audit log.
    MatchEventType {
        /// Assignment of fresh Persons to newly loaded PersonRecords.
        NewIds => "new-ids",
        /// Automatic reassignment of PersonRecords above the auto threshold.
        AutoMatches => "auto-matches",
        /// Operator-driven split/merge inside one match group.
        ManualMatch => "manual-match",
        /// Splitting of an existing Person into two or more Persons.
        PersonSplit => "person-split",
    }
}

text_enum! {
    PersonActionType {
        AddRecord => "add-record",
        RemoveRecord => "remove-record",
        Review => "review",
    }
}

text_enum! {
    MatchGroupActionType {
        AddResult => "add-result",
        RemoveResult => "remove-result",
        UpdatePerson => "update-person",
        Match => "match",
    }
}

/// Immutable snapshot of linkage parameters.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Config {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub potential_match_threshold: f64,
    pub auto_match_threshold: f64,
    /// Opaque linker settings (blocking rules, comparisons).
    pub splink_settings: serde_json::Value,
}

/// One run of the matching pipeline.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub config_id: i64,
    pub source_uri: String,
    pub status: JobStatus,
    pub reason: Option<String>,
    pub job_type: JobType,
}

/// Untrusted raw row tied to a job; deleted once the job terminates.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PersonRecordStaging {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub job_id: i64,
    /// Set by the loader; used only to join with freshly created Persons.
    pub row_number: Option<i64>,
    pub sha256: Option<Vec<u8>>,
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

/// Logical identity owning one or more PersonRecords.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Person {
    pub id: i64,
    pub uuid: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub job_id: Option<i64>,
    /// Optimistic-concurrency token, incremented on every write.
    pub version: i64,
    pub deleted: Option<DateTime<Utc>>,
    pub record_count: i64,
}

/// Canonical, immutable person record; content-addressed by sha256.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PersonRecord {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub job_id: i64,
    pub person_id: i64,
    pub person_updated: DateTime<Utc>,
    pub matched_or_reviewed: Option<DateTime<Utc>>,
    pub sha256: Vec<u8>,
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

/// Proposed cluster of person records awaiting confirmation.
///
/// Active iff `deleted IS NULL AND matched IS NULL`. New matcher runs replace
/// unmatched groups by soft-deleting them; matched and deleted groups are kept
/// so events can be replayed or undone.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MatchGroup {
    pub id: i64,
    pub uuid: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
    pub job_id: i64,
    pub version: i64,
    pub matched: Option<DateTime<Utc>>,
}

impl MatchGroup {
    pub fn is_active(&self) -> bool {
        self.deleted.is_none() && self.matched.is_none()
    }
}

/// Pairwise linkage score between two PersonRecords.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SplinkResult {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub job_id: i64,
    pub match_group_id: i64,
    pub match_group_updated: DateTime<Utc>,
    pub match_weight: f64,
    pub match_probability: f64,
    pub person_record_l_id: i64,
    pub person_record_r_id: i64,
    pub data: serde_json::Value,
}

/// Events are strictly ordered by id; replaying them in order reproduces the
/// current person/group state.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MatchEvent {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub job_id: Option<i64>,
    #[sqlx(rename = "type")]
    pub event_type: MatchEventType,
}

/// Single-row delta on a Person's record set.
///
/// Within one event, `remove-record` actions always receive smaller ids than
/// `add-record` actions.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PersonAction {
    pub id: i64,
    pub match_event_id: i64,
    pub match_group_id: Option<i64>,
    pub person_id: i64,
    pub person_record_id: i64,
    #[sqlx(rename = "type")]
    pub action_type: PersonActionType,
    pub performed_by: Option<i64>,
}

/// Single-row delta on a MatchGroup's result set or status.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MatchGroupAction {
    pub id: i64,
    pub match_event_id: i64,
    pub match_group_id: Option<i64>,
    pub splink_result_id: Option<i64>,
    #[sqlx(rename = "type")]
    pub action_type: MatchGroupActionType,
    pub performed_by: Option<i64>,
}
