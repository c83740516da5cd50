//! # Risk Service API Client
//!
//! HTTP side of the contract with the risk-analysis service. Everything the
//! engine needs from the service that is not the audio socket goes through
//! the `SessionApi` trait, so the poller, scheduler and lifecycle manager can
//! be driven by a fake in tests.
//!
//! ## Endpoints:
//! - `POST /sessions` creates a call session
//! - `GET /sessions/{id}/status` (404 when unknown)
//! - `GET /sessions/{id}/risk`
//! - `GET /agent/script`
//! - `GET /agent/audio/{segment_index}?format=mp3`
//! - `POST /enrollment/create` (multipart: `user_id`, `name`, `audio`)

use crate::audio::Recording;
use crate::config::ApiConfig;
use crate::error::{AppError, AppResult};
use crate::models::{
    AgentScript, EnrollmentResponse, ErrorBody, RiskSnapshot, SessionCreated, SessionStatus,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::json;
use tracing::debug;

/// Operations the engine performs against the risk service.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(&self, user_id: &str) -> AppResult<SessionCreated>;

    /// `AppError::SessionNotFound` when the service answers 404.
    async fn session_status(&self, session_id: &str) -> AppResult<SessionStatus>;

    /// Any failure is reported as `AppError::RiskFetchFailed`.
    async fn session_risk(&self, session_id: &str) -> AppResult<RiskSnapshot>;

    async fn agent_script(&self) -> AppResult<AgentScript>;

    async fn agent_audio(&self, segment_index: usize, format: &str) -> AppResult<Vec<u8>>;

    /// Failures carry the server's `detail` in `AppError::EnrollmentFailed`.
    async fn create_enrollment(
        &self,
        user_id: &str,
        name: &str,
        recording: &Recording,
    ) -> AppResult<EnrollmentResponse>;
}

/// `SessionApi` over reqwest.
#[derive(Clone)]
pub struct HttpSessionApi {
    client: Client,
    base_url: String,
}

impl HttpSessionApi {
    pub fn new(config: &ApiConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Turn a non-success response into an error message, preferring `detail`.
async fn error_detail(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => parsed.detail,
        Err(_) if body.trim().is_empty() => format!("HTTP {}", status),
        Err(_) => format!("HTTP {}: {}", status, body.trim()),
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(&self, user_id: &str) -> AppResult<SessionCreated> {
        let response = self
            .client
            .post(self.url("/sessions"))
            .json(&json!({ "user_id": user_id }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Api(format!(
                "Failed to create session: {}",
                error_detail(response).await
            )));
        }

        let created: SessionCreated = response.json().await?;
        debug!("Created session {}", created.session_id);
        Ok(created)
    }

    async fn session_status(&self, session_id: &str) -> AppResult<SessionStatus> {
        let response = self
            .client
            .get(self.url(&format!("/sessions/{}/status", session_id)))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(AppError::SessionNotFound(session_id.to_string())),
            status if status.is_success() => Ok(response.json().await?),
            _ => Err(AppError::Api(format!(
                "Failed to fetch session status: {}",
                error_detail(response).await
            ))),
        }
    }

    async fn session_risk(&self, session_id: &str) -> AppResult<RiskSnapshot> {
        let response = self
            .client
            .get(self.url(&format!("/sessions/{}/risk", session_id)))
            .send()
            .await
            .map_err(|e| AppError::RiskFetchFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::RiskFetchFailed(error_detail(response).await));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::RiskFetchFailed(e.to_string()))
    }

    async fn agent_script(&self) -> AppResult<AgentScript> {
        let response = self.client.get(self.url("/agent/script")).send().await?;

        if !response.status().is_success() {
            return Err(AppError::Api(format!(
                "Failed to fetch agent script: {}",
                error_detail(response).await
            )));
        }

        Ok(response.json().await?)
    }

    async fn agent_audio(&self, segment_index: usize, format: &str) -> AppResult<Vec<u8>> {
        let response = self
            .client
            .get(self.url(&format!("/agent/audio/{}", segment_index)))
            .query(&[("format", format)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Api(format!(
                "Failed to fetch agent audio {}: {}",
                segment_index,
                error_detail(response).await
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }

    async fn create_enrollment(
        &self,
        user_id: &str,
        name: &str,
        recording: &Recording,
    ) -> AppResult<EnrollmentResponse> {
        let part = reqwest::multipart::Part::bytes(recording.bytes.clone())
            .file_name("enrollment.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .text("user_id", user_id.to_string())
            .text("name", name.to_string())
            .part("audio", part);

        let response = self
            .client
            .post(self.url("/enrollment/create"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| AppError::EnrollmentFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::EnrollmentFailed(error_detail(response).await));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::EnrollmentFailed(e.to_string()))
    }
}
