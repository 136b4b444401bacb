use thiserror::Error;

use crate::staging::StagingError;
use crate::state::{JobStatus, StateError};

/// Rejections and failures of control operations.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Cannot {op} job {id}: job is {status}")]
    InvalidState {
        id: String,
        op: &'static str,
        status: JobStatus,
    },

    #[error("Job {0} has nothing to retry")]
    NothingToRetry(String),

    #[error("Invalid job: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(StateError),

    #[error(transparent)]
    Staging(#[from] StagingError),
}

impl From<StateError> for ControlError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::JobNotFound(id) => ControlError::NotFound(id),
            StateError::JobBusy { id, status } => ControlError::InvalidState {
                id,
                op: "delete",
                status,
            },
            StateError::InvalidJob(reason) => ControlError::Invalid(reason),
            other => ControlError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_mapped() {
        assert!(matches!(
            ControlError::from(StateError::JobNotFound("x".into())),
            ControlError::NotFound(_)
        ));
        let busy = ControlError::from(StateError::JobBusy {
            id: "x".into(),
            status: JobStatus::Running,
        });
        assert_eq!(busy.to_string(), "Cannot delete job x: job is RUNNING");
    }
}
