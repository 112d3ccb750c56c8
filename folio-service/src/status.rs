//! Job lifecycle vocabulary and the two status authorities.
//!
//! `JobStatus` is what *this* process last recorded in the [`StatusStore`];
//! `ProbeStatus` is what the external indexer reports. [`reconcile`] folds the
//! two into the status callers should act on.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::ServiceResult;

/// Partition key shared by every status row.
pub const STATUS_PARTITION: &str = "indexing";

/// Lifecycle of an indexing job, in the order the orchestrator walks it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    IngestionStarted,
    GraphragStarted,
    GraphragCompleted,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Position along the happy path. `Failed` sits beside `Completed`.
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::IngestionStarted => 1,
            JobStatus::GraphragStarted => 2,
            JobStatus::GraphragCompleted => 3,
            JobStatus::Completed | JobStatus::Failed => 4,
        }
    }

    /// Whether a record at `self` may be overwritten with `next`.
    ///
    /// Writing the same status again is accepted so redelivered messages can
    /// replay a step. Terminal states accept nothing else; `Failed` is
    /// reachable from every non-terminal state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next == JobStatus::Failed || next.rank() > self.rank()
    }
}

/// Durable job-id → status table.
///
/// Writers hold the queue lease for the job; readers need no lock.
pub trait StatusStore: Send + Sync {
    /// Record a newly enqueued job as `queued`. A terminal row left over from
    /// an earlier run is reset; a live row is left alone and reported as
    /// `ServiceError::InvalidTransition`.
    fn create(&self, job_id: &str) -> ServiceResult<()>;

    fn get(&self, job_id: &str) -> ServiceResult<Option<JobStatus>>;

    /// Move an existing row forward. Regressions fail with
    /// `ServiceError::InvalidTransition`, missing rows with `JobNotFound`.
    fn transition(&self, job_id: &str, status: JobStatus) -> ServiceResult<()>;

    /// Remove the row. Deleting a missing row succeeds.
    fn delete(&self, job_id: &str) -> ServiceResult<()>;
}

/// Closed vocabulary for the external indexer's run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProbeStatus {
    Completed,
    Failed,
    InProgress,
    /// The status could not be determined (transport failure or non-200).
    Error,
}

impl ProbeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProbeStatus::Completed | ProbeStatus::Failed)
    }
}

/// Status surfaced to callers after combining both authorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReconciledStatus {
    Completed,
    Failed,
    InProgress,
    /// The indexer could not be asked; the pipeline itself may be fine.
    Error,
}

impl ReconciledStatus {
    pub fn message(&self) -> &'static str {
        match self {
            ReconciledStatus::Completed => "Job completed successfully",
            ReconciledStatus::Failed => "Job failed",
            ReconciledStatus::InProgress => "Job is still in progress",
            ReconciledStatus::Error => "Error checking job status",
        }
    }
}

/// Combine the local record with the indexer's probe.
///
/// | local       | external    | result      |
/// |-------------|-------------|-------------|
/// | completed   | completed   | completed   |
/// | failed      | any         | failed      |
/// | any         | failed      | failed      |
/// | otherwise   | error       | error       |
/// | otherwise   | otherwise   | in_progress |
///
/// Only agreement produces `completed`: after a crash mid-poll the local row
/// can lag the indexer, and the indexer alone cannot tell whether the graph
/// stage ran.
pub fn reconcile(local: JobStatus, external: ProbeStatus) -> ReconciledStatus {
    match (local, external) {
        (JobStatus::Completed, ProbeStatus::Completed) => ReconciledStatus::Completed,
        (JobStatus::Failed, _) | (_, ProbeStatus::Failed) => ReconciledStatus::Failed,
        (_, ProbeStatus::Error) => ReconciledStatus::Error,
        _ => ReconciledStatus::InProgress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::IngestionStarted,
        JobStatus::GraphragStarted,
        JobStatus::GraphragCompleted,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    #[test]
    fn test_status_strings_round_trip() {
        for status in ALL {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert_eq!(JobStatus::GraphragCompleted.as_str(), "graphrag_completed");
        assert_eq!(
            serde_json::to_string(&JobStatus::IngestionStarted).unwrap(),
            "\"ingestion_started\""
        );
    }

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::IngestionStarted));
        assert!(JobStatus::IngestionStarted.can_transition_to(JobStatus::GraphragStarted));
        assert!(JobStatus::GraphragStarted.can_transition_to(JobStatus::GraphragCompleted));
        assert!(JobStatus::GraphragCompleted.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_regressions_rejected() {
        assert!(!JobStatus::GraphragStarted.can_transition_to(JobStatus::IngestionStarted));
        assert!(!JobStatus::GraphragCompleted.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::GraphragCompleted));
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal_state() {
        for status in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(status.can_transition_to(JobStatus::Failed), "{status}");
        }
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_same_status_is_idempotent() {
        for status in ALL {
            assert!(status.can_transition_to(status));
        }
    }

    #[test]
    fn test_reconcile_truth_table() {
        use ProbeStatus as P;
        use ReconciledStatus as R;

        assert_eq!(reconcile(JobStatus::Completed, P::Completed), R::Completed);
        assert_eq!(reconcile(JobStatus::Completed, P::Failed), R::Failed);
        assert_eq!(reconcile(JobStatus::Completed, P::InProgress), R::InProgress);
        assert_eq!(reconcile(JobStatus::Completed, P::Error), R::Error);

        assert_eq!(reconcile(JobStatus::Failed, P::Completed), R::Failed);
        assert_eq!(reconcile(JobStatus::Failed, P::Error), R::Failed);

        assert_eq!(reconcile(JobStatus::GraphragCompleted, P::Completed), R::InProgress);
        assert_eq!(reconcile(JobStatus::GraphragStarted, P::Failed), R::Failed);
        assert_eq!(reconcile(JobStatus::Queued, P::Error), R::Error);
        assert_eq!(reconcile(JobStatus::IngestionStarted, P::InProgress), R::InProgress);
    }
}
