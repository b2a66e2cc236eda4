//! Per-request restoration job record and its forward-only state machine.

use std::path::{Path, PathBuf};

use crate::restore::{PredictionHandle, RestoreError, UploadSlot};

/// Lifecycle state of a restoration job.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum JobStatus {
    Pending,
    Uploading,
    Submitted,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Submitted => "submitted",
            Self::Polling => "polling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timedOut",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Returns whether `next` directly follows `self`. Stages are never skipped.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Uploading)
            | (Self::Uploading, Self::Submitted)
            | (Self::Submitted, Self::Polling)
            | (Self::Polling, Self::Succeeded | Self::TimedOut | Self::Cancelled) => true,
            (current, Self::Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Ephemeral record of one restoration request.
///
/// `result_path` is set exactly when the job reaches [`JobStatus::Succeeded`].
#[derive(Debug)]
pub struct RestoreJob {
    id: String,
    source_path: PathBuf,
    upload_slot: Option<UploadSlot>,
    prediction: Option<PredictionHandle>,
    status: JobStatus,
    result_path: Option<PathBuf>,
}

impl RestoreJob {
    pub fn new(id: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source_path: source_path.into(),
            upload_slot: None,
            prediction: None,
            status: JobStatus::Pending,
            result_path: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn result_path(&self) -> Option<&Path> {
        self.result_path.as_deref()
    }

    /// Records the issued upload slot and moves to `uploading`.
    pub fn begin_upload(&mut self, slot: UploadSlot) -> Result<&UploadSlot, RestoreError> {
        self.transition(JobStatus::Uploading)?;
        Ok(self.upload_slot.insert(slot))
    }

    /// Records the prediction handle and moves to `submitted`.
    pub fn mark_submitted(
        &mut self,
        handle: PredictionHandle,
    ) -> Result<&PredictionHandle, RestoreError> {
        self.transition(JobStatus::Submitted)?;
        Ok(self.prediction.insert(handle))
    }

    pub fn begin_polling(&mut self) -> Result<(), RestoreError> {
        self.transition(JobStatus::Polling)
    }

    pub fn succeed(&mut self, result_path: PathBuf) -> Result<(), RestoreError> {
        self.transition(JobStatus::Succeeded)?;
        self.result_path = Some(result_path);
        Ok(())
    }

    /// Moves the job to the terminal state matching `err`.
    ///
    /// Timeouts and cancellations only end a job that is polling; any other
    /// error, or one raised outside polling, marks it `failed`.
    pub fn fail(&mut self, err: &RestoreError) {
        let next = match err {
            RestoreError::Timeout { .. } if self.status == JobStatus::Polling => {
                JobStatus::TimedOut
            }
            RestoreError::Cancelled if self.status == JobStatus::Polling => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        };
        if self.status.can_advance_to(next) {
            self.status = next;
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), RestoreError> {
        if !self.status.can_advance_to(next) {
            return Err(RestoreError::Internal(format!(
                "job {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }
}
