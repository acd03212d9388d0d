use crate::{
    error::ApiError,
    types::{GenerationRequest, RemoteTask, SubmitEnvelope, TaskEnvelope},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Url};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.piapi.ai";
const TASK_PATH: &str = "api/v1/task";

/// The remote music generation service, as seen by the task manager.
#[async_trait]
pub trait MusicApi: Send + Sync {
    /// Submits one synthesis request and returns the remote task id.
    async fn submit_generation(&self, request: &GenerationRequest) -> Result<String, ApiError>;

    async fn task_status(&self, task_id: &str) -> Result<RemoteTask, ApiError>;
}

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl Client {
    pub fn new(base_url: Option<&str>, api_key: Option<String>) -> Result<Self> {
        let mut url = base_url
            .map(Url::parse)
            .unwrap_or_else(|| Url::parse(DEFAULT_BASE_URL))
            .context("invalid music API base URL")?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base_url: url, api_key })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn task_url(&self, task_id: Option<&str>) -> Result<Url, ApiError> {
        let path = match task_id {
            Some(id) => format!("{TASK_PATH}/{id}"),
            None => TASK_PATH.to_string(),
        };
        self.base_url.join(&path).map_err(|err| ApiError::Transport(err.to_string()))
    }

    fn authorized(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ApiError> {
        let key = self
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(ApiError::MissingApiKey)?;
        Ok(builder
            .bearer_auth(key)
            .header("X-API-Key", key)
            .header(header::ACCEPT, "application/json"))
    }
}

#[async_trait]
impl MusicApi for Client {
    async fn submit_generation(&self, request: &GenerationRequest) -> Result<String, ApiError> {
        let url = self.task_url(None)?;
        let response = self.authorized(self.http.post(url))?.json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), %body, "generation submit rejected");
            return Err(ApiError::from_response(status.as_u16(), &body));
        }
        let envelope: SubmitEnvelope = response.json().await?;
        envelope
            .into_task_id()
            .ok_or_else(|| ApiError::Malformed("submission response carried no task id".into()))
    }

    async fn task_status(&self, task_id: &str) -> Result<RemoteTask, ApiError> {
        let url = self.task_url(Some(task_id))?;
        let response = self.authorized(self.http.get(url))?.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_response(status.as_u16(), &body));
        }
        let envelope: TaskEnvelope = response.json().await?;
        Ok(RemoteTask::from(envelope))
    }
}
