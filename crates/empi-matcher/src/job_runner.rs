//! Job runner contract.
//!
//! The scheduler depends only on this trait; the in-process implementation
//! drives the matcher directly, while container-based launchers live outside
//! the core.

use anyhow::Result;
use async_trait::async_trait;

use crate::matcher::{JobOutcome, Matcher};

/// Launches the matching pipeline for one job and reports its exit status as
/// `(return_code, error_message)`.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, job_id: i64) -> Result<(i32, Option<String>)>;
}

/// Runs the matcher on the current process.
pub struct InProcessJobRunner {
    matcher: Matcher,
}

impl InProcessJobRunner {
    pub fn new(matcher: Matcher) -> Self {
        InProcessJobRunner { matcher }
    }
}

#[async_trait]
impl JobRunner for InProcessJobRunner {
    async fn run_job(&self, job_id: i64) -> Result<(i32, Option<String>)> {
        match self.matcher.process_job(job_id).await? {
            JobOutcome::Succeeded => Ok((0, None)),
            JobOutcome::Failed(reason) => Ok((1, Some(reason))),
        }
    }
}
