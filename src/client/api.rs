//! Transports the Client Controller drives: in-process and HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::api::ErrorBody;
use crate::error::{ClientError, JobError};
use crate::jobs::settings::Settings;
use crate::orchestrator::{
    GlobalStatus, JobStatusView, JobSummary, MessageResponse, Orchestrator, ResetAllStep,
    ResetCheck, StartJobResponse, StartResetAllResponse, StartResetResponse, StepResponse,
};

/// Every operation the orchestrator exposes to a client.
#[async_trait]
pub trait SeederApi: Send + Sync {
    async fn list_jobs(&self) -> Result<Vec<JobSummary>, ClientError>;
    async fn start_job(&self, key: &str, settings: Settings) -> Result<StartJobResponse, ClientError>;
    async fn step_batch(&self, key: &str) -> Result<StepResponse, ClientError>;
    async fn cancel_job(&self, key: &str) -> Result<MessageResponse, ClientError>;
    async fn get_status(&self, key: &str) -> Result<JobStatusView, ClientError>;
    async fn get_global_status(&self) -> Result<GlobalStatus, ClientError>;

    async fn can_reset(&self, key: &str) -> Result<ResetCheck, ClientError>;
    async fn start_reset(&self, key: &str) -> Result<StartResetResponse, ClientError>;
    async fn step_reset(&self, key: &str) -> Result<StepResponse, ClientError>;
    async fn reset_job_now(&self, key: &str) -> Result<MessageResponse, ClientError>;

    async fn start_reset_all(&self) -> Result<StartResetAllResponse, ClientError>;
    async fn step_reset_all(&self) -> Result<ResetAllStep, ClientError>;
    async fn cancel_reset_all(&self) -> Result<MessageResponse, ClientError>;
    async fn reset_all_now(&self) -> Result<MessageResponse, ClientError>;
}

// ── In-process ──────────────────────────────────────────────────────────

/// Calls the orchestrator directly.
pub struct LocalApi {
    orchestrator: Arc<Orchestrator>,
}

impl LocalApi {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl SeederApi for LocalApi {
    async fn list_jobs(&self) -> Result<Vec<JobSummary>, ClientError> {
        Ok(self.orchestrator.list_jobs().await?)
    }

    async fn start_job(&self, key: &str, settings: Settings) -> Result<StartJobResponse, ClientError> {
        Ok(self.orchestrator.start_job(key, settings).await?)
    }

    async fn step_batch(&self, key: &str) -> Result<StepResponse, ClientError> {
        Ok(self.orchestrator.step_batch(key).await?)
    }

    async fn cancel_job(&self, key: &str) -> Result<MessageResponse, ClientError> {
        Ok(self.orchestrator.cancel_job(key).await?)
    }

    async fn get_status(&self, key: &str) -> Result<JobStatusView, ClientError> {
        Ok(self.orchestrator.get_status(key).await?)
    }

    async fn get_global_status(&self) -> Result<GlobalStatus, ClientError> {
        Ok(self.orchestrator.get_global_status().await?)
    }

    async fn can_reset(&self, key: &str) -> Result<ResetCheck, ClientError> {
        Ok(self.orchestrator.can_reset(key).await?)
    }

    async fn start_reset(&self, key: &str) -> Result<StartResetResponse, ClientError> {
        Ok(self.orchestrator.start_reset(key).await?)
    }

    async fn step_reset(&self, key: &str) -> Result<StepResponse, ClientError> {
        Ok(self.orchestrator.step_reset(key).await?)
    }

    async fn reset_job_now(&self, key: &str) -> Result<MessageResponse, ClientError> {
        Ok(self.orchestrator.reset_job_now(key).await?)
    }

    async fn start_reset_all(&self) -> Result<StartResetAllResponse, ClientError> {
        Ok(self.orchestrator.start_reset_all().await?)
    }

    async fn step_reset_all(&self) -> Result<ResetAllStep, ClientError> {
        Ok(self.orchestrator.step_reset_all().await?)
    }

    async fn cancel_reset_all(&self) -> Result<MessageResponse, ClientError> {
        Ok(self.orchestrator.cancel_reset_all().await?)
    }

    async fn reset_all_now(&self) -> Result<MessageResponse, ClientError> {
        Ok(self.orchestrator.reset_all_now().await?)
    }
}

// ── HTTP ────────────────────────────────────────────────────────────────

/// Talks to a running `data-seeder serve` over its REST routes.
pub struct HttpApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let resp = self.client.get(self.url(path)).send().await?;
        decode(resp).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let resp = self.client.post(self.url(path)).send().await?;
        decode(resp).await
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let resp = self.client.post(self.url(path)).json(body).send().await?;
        decode(resp).await
    }
}

/// Decode a success body, or turn an error body back into a typed error.
async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await?);
    }

    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => Err(job_error(status, &body).map_or_else(
            || ClientError::Api {
                status: status.as_u16(),
                message: body.error.clone(),
            },
            ClientError::Job,
        )),
        Err(_) => Err(ClientError::Api {
            status: status.as_u16(),
            message: text,
        }),
    }
}

/// Rebuild the orchestrator error an error body was rendered from. Server
/// failures (hooks, batches, storage) stay `ClientError::Api`.
fn job_error(status: StatusCode, body: &ErrorBody) -> Option<JobError> {
    if let Some(running_job) = &body.running_job {
        return Some(JobError::AlreadyRunning {
            running_job: running_job.clone(),
        });
    }
    if let (Some(key), Some(name), Some(blocking)) =
        (&body.job_key, &body.job_name, &body.blocking_dependents)
    {
        return Some(JobError::BlockedByDependents {
            key: key.clone(),
            name: name.clone(),
            blocking: blocking.clone(),
        });
    }
    match (status, &body.job_key) {
        (StatusCode::NOT_FOUND, Some(key)) => Some(JobError::NotFound { key: key.clone() }),
        (StatusCode::CONFLICT, Some(key)) => Some(JobError::NotRunning { key: key.clone() }),
        (StatusCode::UNPROCESSABLE_ENTITY, _) => Some(JobError::Validation(body.error.clone())),
        _ => None,
    }
}

#[async_trait]
impl SeederApi for HttpApi {
    async fn list_jobs(&self) -> Result<Vec<JobSummary>, ClientError> {
        self.get("/api/jobs").await
    }

    async fn start_job(&self, key: &str, settings: Settings) -> Result<StartJobResponse, ClientError> {
        self.post_json(&format!("/api/jobs/{key}/start"), &settings).await
    }

    async fn step_batch(&self, key: &str) -> Result<StepResponse, ClientError> {
        self.post(&format!("/api/jobs/{key}/step")).await
    }

    async fn cancel_job(&self, key: &str) -> Result<MessageResponse, ClientError> {
        self.post(&format!("/api/jobs/{key}/cancel")).await
    }

    async fn get_status(&self, key: &str) -> Result<JobStatusView, ClientError> {
        self.get(&format!("/api/jobs/{key}/status")).await
    }

    async fn get_global_status(&self) -> Result<GlobalStatus, ClientError> {
        self.get("/api/status").await
    }

    async fn can_reset(&self, key: &str) -> Result<ResetCheck, ClientError> {
        self.get(&format!("/api/jobs/{key}/can-reset")).await
    }

    async fn start_reset(&self, key: &str) -> Result<StartResetResponse, ClientError> {
        self.post(&format!("/api/jobs/{key}/reset/start")).await
    }

    async fn step_reset(&self, key: &str) -> Result<StepResponse, ClientError> {
        self.post(&format!("/api/jobs/{key}/reset/step")).await
    }

    async fn reset_job_now(&self, key: &str) -> Result<MessageResponse, ClientError> {
        self.post(&format!("/api/jobs/{key}/reset/now")).await
    }

    async fn start_reset_all(&self) -> Result<StartResetAllResponse, ClientError> {
        self.post("/api/reset-all/start").await
    }

    async fn step_reset_all(&self) -> Result<ResetAllStep, ClientError> {
        self.post("/api/reset-all/step").await
    }

    async fn cancel_reset_all(&self) -> Result<MessageResponse, ClientError> {
        self.post("/api/reset-all/cancel").await
    }

    async fn reset_all_now(&self) -> Result<MessageResponse, ClientError> {
        self.post("/api/reset-all/now").await
    }
}
