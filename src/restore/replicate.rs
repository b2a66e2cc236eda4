//! Replicate-style prediction API client.
//!
//! API calls carry `Authorization: Token <token>`. Presigned upload URLs and
//! prediction outputs are fetched without credentials.

use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::StatusCode;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::restore::{
    PredictionHandle, PredictionStatus, RestorationService, RestoreError, Stage, UploadSlot,
};

/// HTTP client for a Replicate-compatible API.
pub struct ReplicateClient {
    client: Client,
    api_base: String,
    auth_header: String,
    model_version: String,
}

#[derive(Debug, Deserialize)]
struct PredictionCreated {
    urls: PredictionUrls,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    get: String,
}

impl ReplicateClient {
    /// Creates a client with the configured base URL, token, and request timeout.
    pub fn new(cfg: &AppConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(cfg.upstream_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| AppError::internal(format!("failed to create HTTP client: {err}")))?;

        Ok(Self {
            client,
            api_base: cfg.upstream_base.trim_end_matches('/').to_string(),
            auth_header: format!("Token {}", cfg.upstream_token),
            model_version: cfg.model_version.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }
}

/// Converts a non-accepted response into an upstream error carrying its body.
async fn reject(stage: Stage, response: Response) -> RestoreError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|err| format!("<unreadable body: {err}>"));
    RestoreError::Upstream {
        stage,
        status: Some(status),
        body,
    }
}

fn malformed(stage: Stage, status: StatusCode, err: impl std::fmt::Display) -> RestoreError {
    RestoreError::Upstream {
        stage,
        status: Some(status.as_u16()),
        body: format!("malformed response: {err}"),
    }
}

#[async_trait]
impl RestorationService for ReplicateClient {
    async fn create_upload(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<UploadSlot, RestoreError> {
        let stage = Stage::AcquireUpload;
        let response = self
            .client
            .post(self.endpoint("uploads"))
            .header(AUTHORIZATION, &self.auth_header)
            .json(&json!({"filename": filename, "content_type": content_type}))
            .send()
            .await
            .map_err(|err| RestoreError::transport(stage, err))?;

        let status = response.status();
        if status != StatusCode::CREATED {
            return Err(reject(stage, response).await);
        }
        response
            .json::<UploadSlot>()
            .await
            .map_err(|err| malformed(stage, status, err))
    }

    async fn upload(
        &self,
        slot: &UploadSlot,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), RestoreError> {
        let stage = Stage::Upload;
        let size = bytes.len();
        let response = self
            .client
            .put(&slot.upload_url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|err| RestoreError::transport(stage, err))?;

        if !response.status().is_success() {
            return Err(reject(stage, response).await);
        }
        debug!(bytes = size, "uploaded image to presigned url");
        Ok(())
    }

    async fn create_prediction(&self, input_url: &str) -> Result<PredictionHandle, RestoreError> {
        let stage = Stage::Submit;
        let response = self
            .client
            .post(self.endpoint("predictions"))
            .header(AUTHORIZATION, &self.auth_header)
            .json(&json!({
                "version": self.model_version,
                "input": {"img": input_url},
            }))
            .send()
            .await
            .map_err(|err| RestoreError::transport(stage, err))?;

        let status = response.status();
        if status != StatusCode::CREATED && status != StatusCode::ACCEPTED {
            return Err(reject(stage, response).await);
        }
        let created = response
            .json::<PredictionCreated>()
            .await
            .map_err(|err| malformed(stage, status, err))?;
        Ok(PredictionHandle(created.urls.get))
    }

    async fn get_prediction(
        &self,
        handle: &PredictionHandle,
    ) -> Result<PredictionStatus, RestoreError> {
        let stage = Stage::Poll;
        let response = self
            .client
            .get(&handle.0)
            .header(AUTHORIZATION, &self.auth_header)
            .send()
            .await
            .map_err(|err| RestoreError::transport(stage, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(reject(stage, response).await);
        }
        let raw = response
            .json::<Value>()
            .await
            .map_err(|err| malformed(stage, status, err))?;
        Ok(PredictionStatus::from_json(raw))
    }

    async fn fetch_output(&self, url: &str) -> Result<Vec<u8>, RestoreError> {
        let stage = Stage::Fetch;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| RestoreError::transport(stage, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(reject(stage, response).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| RestoreError::transport(stage, err))?;
        Ok(bytes.to_vec())
    }
}
