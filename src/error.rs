use thiserror::Error;

use crate::scheduler::job::{JobId, JobStatus};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} is a member of several status sets: {statuses:?}")]
    InconsistentStatus {
        job_id: JobId,
        statuses: Vec<JobStatus>,
    },

    #[error("Job {0} is not registered for garbage collection")]
    JobNotRegistered(JobId),

    #[error("Job {0} is already registered for garbage collection")]
    JobAlreadyRegistered(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Unknown job status: {0}")]
    UnknownStatus(String),

    #[error("Affinity token of {len} bytes exceeds the {max} byte limit")]
    AffinityTokenTooLong { len: usize, max: usize },

    #[error("Corrupt affinity dump: {0}")]
    CorruptDump(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Faults that indicate a bug in the caller or the core rather than a
    /// runtime condition. The orchestrator must stop serving the queue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueueError::InconsistentStatus { .. }
                | QueueError::JobNotRegistered(_)
                | QueueError::JobAlreadyRegistered(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(QueueError::JobAlreadyRegistered(1).is_fatal());
        assert!(QueueError::JobNotRegistered(1).is_fatal());
        assert!(QueueError::InconsistentStatus {
            job_id: 1,
            statuses: vec![JobStatus::Pending, JobStatus::Done],
        }
        .is_fatal());
        assert!(!QueueError::InvalidTransition {
            job_id: 1,
            from: JobStatus::Done,
            to: JobStatus::Running,
        }
        .is_fatal());
        assert!(!QueueError::JobNotFound(1).is_fatal());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = QueueError::InvalidTransition {
            job_id: 42,
            from: JobStatus::Done,
            to: JobStatus::Running,
        };
        assert_eq!(err.to_string(), "Invalid transition for job 42: Done -> Running");
    }
}
