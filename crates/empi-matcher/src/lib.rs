//! Batch matching pipeline.
//!
//! [`Matcher`] orchestrates a single job inside one durable transaction:
//! staging load, linker prediction, lock acquisition, graph analysis and the
//! result/group/action writer. The [`Linker`] and [`JobRunner`] traits are
//! the seams to the external scoring engine and the process launcher.

pub mod events;
pub mod job_runner;
pub mod linker;
pub mod matcher;
pub mod staging;
mod writer;

pub use job_runner::{InProcessJobRunner, JobRunner};
pub use linker::{
    job_scoped_settings, ExactMatchLinker, FixedLinker, Linker, PersonRecordFrameRow, ScoredPair,
};
pub use matcher::{JobOutcome, Matcher};
