//! Pure in-memory analysis of pairwise linkage results.
//!
//! Turns (scored record pairs, person crosswalk) into match groups, a
//! result-to-group mapping and the person reassignments implied by scores
//! above the auto-match threshold. No I/O happens here; the matcher persists
//! the output.

mod graph;
mod types;

pub use graph::MatchGraph;
pub use types::{
    CrosswalkRow, GraphError, GroupResult, MatchAnalysis, MatchGroupOut, PersonReassignment,
    ResultRow,
};
