use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::ServerError;
use super::types::{
    AgentMetadata, ClaimRequest, HandshakeResponse, HeartbeatRequest, HeartbeatResponse,
    ReserveResponse,
};
use crate::events::{AgentEvent, EventSink};
use crate::services::AgentJobService;
use crate::state_machine::{JobRequest, JobSpecification};

const API_PREFIX: &str = "/api/v1/agent";

/// JSON-over-HTTP client for the job server.
pub struct ServerClient {
    client: Client,
    base_url: String,
}

impl ServerClient {
    pub fn new(
        base_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create a client with short timeouts pointing at a custom base URL (useful for testing).
    pub fn with_base_url(base_url: &str) -> Result<Self, ServerError> {
        Self::new(base_url, Duration::from_secs(2), Duration::from_secs(5))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base_url)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ServerError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        let response = check_status(response).await?;
        decode(response).await
    }

    async fn post_no_content<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ServerError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, ServerError> {
        let response = self.client.get(self.url(path)).send().await?;
        let response = check_status(response).await?;
        decode(response).await
    }

    pub async fn heartbeat(
        &self,
        job_id: &str,
        agent_id: &str,
    ) -> Result<HeartbeatResponse, ServerError> {
        let body = HeartbeatRequest {
            agent_id: agent_id.to_string(),
        };
        self.post_json(&format!("/jobs/{job_id}/heartbeat"), &body)
            .await
    }
}

async fn check_status(response: Response) -> Result<Response, ServerError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1000))
            .unwrap_or(1000);
        return Err(ServerError::RateLimited {
            retry_after_ms: retry_after,
        });
    }

    if status == StatusCode::CONFLICT {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "conflict".to_string());
        return Err(ServerError::Rejected(message));
    }

    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(ServerError::ApiError {
            status: status.as_u16(),
            message,
        });
    }

    Ok(response)
}

async fn decode<R: DeserializeOwned>(response: Response) -> Result<R, ServerError> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| ServerError::ParseError(e.to_string()))
}

#[async_trait]
impl AgentJobService for ServerClient {
    async fn handshake(&self, metadata: &AgentMetadata) -> Result<(), ServerError> {
        let response: HandshakeResponse = self.post_json("/handshake", metadata).await?;
        if response.accepted {
            Ok(())
        } else {
            Err(ServerError::Rejected(response.message))
        }
    }

    async fn reserve_job_id(&self, request: &JobRequest) -> Result<String, ServerError> {
        let response: ReserveResponse = self.post_json("/jobs/reserve", request).await?;
        if response.job_id.trim().is_empty() {
            return Err(ServerError::ParseError("blank job id in reservation".into()));
        }
        Ok(response.job_id)
    }

    async fn resolve_job_specification(
        &self,
        job_id: &str,
    ) -> Result<JobSpecification, ServerError> {
        self.post_json(&format!("/jobs/{job_id}/resolve"), &serde_json::json!({}))
            .await
    }

    async fn get_job_specification(&self, job_id: &str) -> Result<JobSpecification, ServerError> {
        self.get_json(&format!("/jobs/{job_id}/specification")).await
    }

    async fn resolve_job_specification_dry_run(
        &self,
        request: &JobRequest,
    ) -> Result<JobSpecification, ServerError> {
        self.post_json("/jobs/dry-run", request).await
    }

    async fn claim_job(&self, job_id: &str, metadata: &AgentMetadata) -> Result<(), ServerError> {
        let body = ClaimRequest {
            agent: metadata.clone(),
        };
        self.post_no_content(&format!("/jobs/{job_id}/claim"), &body)
            .await
    }
}

#[async_trait]
impl EventSink for ServerClient {
    async fn publish(&self, event: &AgentEvent) -> Result<(), ServerError> {
        self.post_no_content("/events", event).await
    }
}
