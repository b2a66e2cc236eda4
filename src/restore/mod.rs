//! Client abstraction for the remote restoration service.
//!
//! The orchestrator depends on the [`RestorationService`] trait instead of a
//! concrete HTTP client, which keeps the workflow testable without network
//! access.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::config::AppConfig;
use crate::error::AppError;

pub mod replicate;

/// Pipeline step that talks to the remote service.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Stage {
    /// Requesting a presigned upload/download URL pair.
    AcquireUpload,
    /// Sending the staged bytes to the presigned upload URL.
    Upload,
    /// Creating the prediction job.
    Submit,
    /// Checking prediction status.
    Poll,
    /// Downloading the restored image.
    Fetch,
}

impl Stage {
    /// Returns the wire-format stage name used in error details.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AcquireUpload => "acquire_upload",
            Self::Upload => "upload",
            Self::Submit => "submit",
            Self::Poll => "poll",
            Self::Fetch => "fetch",
        }
    }

    /// Human-readable message reported to clients when this stage fails.
    pub fn failure_message(self) -> &'static str {
        match self {
            Self::AcquireUpload => "failed to acquire upload url",
            Self::Upload => "failed to upload image",
            Self::Submit => "failed to submit prediction",
            Self::Poll => "failed to check prediction status",
            Self::Fetch => "failed to download restored image",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single restoration job.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("{stage} stage failed (status {status:?}): {body}")]
    Upstream {
        stage: Stage,
        status: Option<u16>,
        body: String,
    },
    #[error("prediction reported failure")]
    PredictionFailed { detail: Value },
    #[error("prediction did not finish after {attempts} status checks")]
    Timeout { attempts: u32 },
    #[error("restoration cancelled before completion")]
    Cancelled,
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Internal(String),
}

impl RestoreError {
    /// Builds an upstream error for a transport-level failure with no response.
    pub fn transport(stage: Stage, err: impl fmt::Display) -> Self {
        Self::Upstream {
            stage,
            status: None,
            body: err.to_string(),
        }
    }
}

/// Presigned URL pair issued for one upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadSlot {
    /// URL accepting a `PUT` of the raw bytes.
    pub upload_url: String,
    /// URL the prediction reads the uploaded bytes from.
    pub download_url: String,
}

/// Opaque URL used to poll one prediction.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PredictionHandle(pub String);

impl fmt::Display for PredictionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Prediction lifecycle state reported by the service.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PredictionState {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionState {
    /// Parses a status string; unknown values are treated as still pending.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "processing" => Self::Processing,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Pending,
        }
    }
}

/// One status response from the prediction endpoint.
#[derive(Debug, Clone)]
pub struct PredictionStatus {
    pub state: PredictionState,
    /// Full response body, forwarded to clients when the prediction fails.
    pub raw: Value,
}

impl PredictionStatus {
    pub fn from_json(raw: Value) -> Self {
        let state = raw
            .get("status")
            .and_then(Value::as_str)
            .map(PredictionState::parse)
            .unwrap_or(PredictionState::Pending);
        Self { state, raw }
    }

    /// Returns the output URL; array outputs yield their first element.
    pub fn output_url(&self) -> Option<String> {
        let url = match self.raw.get("output")? {
            Value::String(url) => Some(url.clone()),
            Value::Array(items) => items.first()?.as_str().map(ToOwned::to_owned),
            _ => None,
        };
        url.filter(|url| !url.trim().is_empty())
    }
}

/// Contract implemented by remote restoration services.
#[async_trait]
pub trait RestorationService: Send + Sync {
    /// Requests a presigned upload slot for `filename`.
    async fn create_upload(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<UploadSlot, RestoreError>;

    /// Uploads raw bytes to a previously issued slot.
    async fn upload(
        &self,
        slot: &UploadSlot,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), RestoreError>;

    /// Starts a prediction reading its input image from `input_url`.
    async fn create_prediction(&self, input_url: &str) -> Result<PredictionHandle, RestoreError>;

    /// Fetches the current status of a prediction.
    async fn get_prediction(
        &self,
        handle: &PredictionHandle,
    ) -> Result<PredictionStatus, RestoreError>;

    /// Downloads the bytes behind an output URL.
    async fn fetch_output(&self, url: &str) -> Result<Vec<u8>, RestoreError>;
}

/// Builds the configured restoration service client.
pub fn build_service(cfg: &AppConfig) -> Result<Arc<dyn RestorationService>, AppError> {
    Ok(Arc::new(replicate::ReplicateClient::new(cfg)?))
}
