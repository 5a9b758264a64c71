//! `ForgeClient` — thin `reqwest` wrapper over `forge-server`'s `/api/v1`
//! surface: a base URL, an optional bearer token, and one method per route.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ForgeClient {
    base_url: String,
    http: Client,
    admin_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterRequest {
    pub token: String,
    pub display_name: String,
    pub platform: String,
    pub executor: String,
    pub capabilities: Value,
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    pub worker_id: Uuid,
    pub worker_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub pending_tasks: u32,
    pub current_task_id: Option<Uuid>,
    pub directive: String,
}

#[derive(Debug, Serialize)]
pub struct TransitionRequest {
    pub new_status: String,
    pub actor: Value,
    pub expected_version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionResponse {
    pub task_id: Uuid,
    pub status: String,
    pub previous_status: String,
    pub version: i64,
}

#[derive(Debug, Deserialize)]
pub struct PmStatusResponse {
    pub status: String,
    pub in_flight: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct BoardSnapshot {
    pub columns: HashMap<String, Vec<Value>>,
    pub stats: HashMap<String, i64>,
    pub workers: HashMap<String, i64>,
}

#[derive(Debug, Serialize)]
pub struct CreateTokenRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTokenResponse {
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

impl ForgeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), http: Client::new(), admin_token: None }
    }

    /// Reads `FORGE_URL` and `FORGE_ADMIN_TOKEN`, defaulting the URL to the
    /// same loopback address `forge-server` binds by default.
    pub fn from_env() -> Self {
        let base_url = std::env::var("FORGE_URL").unwrap_or_else(|_| "http://localhost:8080".into());
        let admin_token = std::env::var("FORGE_ADMIN_TOKEN").ok();
        Self { base_url, http: Client::new(), admin_token }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn check(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
            anyhow::bail!("{} ({}): {}", envelope.error.kind, status, envelope.error.message);
        }
        anyhow::bail!("request failed with {status}: {body}");
    }

    pub async fn register_worker(&self, req: RegisterRequest) -> anyhow::Result<RegisterResponse> {
        let resp = self.http.post(self.url("/api/v1/workers/register")).json(&req).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn heartbeat(&self, worker_id: Uuid, worker_secret: &str) -> anyhow::Result<HeartbeatResponse> {
        let resp = self
            .http
            .post(self.url(&format!("/api/v1/workers/{worker_id}/heartbeat")))
            .json(&serde_json::json!({ "worker_secret": worker_secret }))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn transition_task(
        &self,
        task_id: Uuid,
        req: TransitionRequest,
    ) -> anyhow::Result<TransitionResponse> {
        let resp = self
            .http
            .post(self.url(&format!("/api/v1/tasks/{task_id}/transition")))
            .json(&req)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn pm_start(&self, project_id: Uuid) -> anyhow::Result<()> {
        let resp = self.http.post(self.url(&format!("/api/v1/pm/{project_id}/start"))).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn pm_pause(&self, project_id: Uuid) -> anyhow::Result<()> {
        let resp = self.http.post(self.url(&format!("/api/v1/pm/{project_id}/pause"))).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn pm_queue_next(&self, project_id: Uuid) -> anyhow::Result<()> {
        let resp =
            self.http.post(self.url(&format!("/api/v1/pm/{project_id}/queue-next"))).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn pm_status(&self, project_id: Uuid) -> anyhow::Result<PmStatusResponse> {
        let resp = self.http.get(self.url(&format!("/api/v1/pm/{project_id}/status"))).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn board(&self, project_id: Uuid) -> anyhow::Result<BoardSnapshot> {
        let resp = self.http.get(self.url(&format!("/api/v1/board/{project_id}"))).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn create_token(&self, req: CreateTokenRequest) -> anyhow::Result<CreateTokenResponse> {
        let Some(admin_token) = &self.admin_token else {
            anyhow::bail!("FORGE_ADMIN_TOKEN (or --admin-token) is required to mint registration tokens");
        };
        let resp = self
            .http
            .post(self.url("/api/v1/admin/tokens"))
            .bearer_auth(admin_token)
            .json(&req)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}
