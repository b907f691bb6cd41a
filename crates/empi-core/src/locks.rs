//! Advisory lock identifiers.
//!
//! Keys are part of the persisted coordination contract: every deployment
//! talking to the same database must agree on them.

/// Named transaction-scoped advisory locks used by the matching pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbLockId {
    /// Held by the scheduler loop to prevent duplicate workers across pods.
    MatchingService,
    /// Serializes matcher workers; jobs are processed one at a time.
    MatchingJob,
    /// Guards person reassignment. Exclusive for the matcher, shared for
    /// interactive manual matches.
    MatchUpdate,
}

impl DbLockId {
    /// Numeric key passed to `pg_advisory_xact_lock` and friends.
    pub fn key(self) -> i64 {
        match self {
            DbLockId::MatchingService => 100,
            DbLockId::MatchingJob => 200,
            DbLockId::MatchUpdate => 300,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DbLockId::MatchingService => "MATCHING_SERVICE",
            DbLockId::MatchingJob => "MATCHING_JOB",
            DbLockId::MatchUpdate => "MATCH_UPDATE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_stable() {
        assert_eq!(DbLockId::MatchingService.key(), 100);
        assert_eq!(DbLockId::MatchingJob.key(), 200);
        assert_eq!(DbLockId::MatchUpdate.key(), 300);
    }
}
