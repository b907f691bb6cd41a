//! Interactive EMPI surface.
//!
//! [`EmpiService`] carries the operator-facing operations: manual match with
//! optimistic concurrency, potential-match and person queries, config/job
//! creation and CSV import/export. The HTTP layer on top of it is not part
//! of this crate.

pub mod error;
mod import;
mod service;
pub mod types;
pub mod validate;

pub use error::ServiceError;
pub use service::EmpiService;
pub use types::{
    MatchGroupRecord, PartialConfig, PersonDetail, PersonRecordComment, PersonRecordDetail,
    PersonSummary, PersonUpdate, PotentialMatch, PotentialMatchSummary, PredictionResult,
    SearchParams,
};
