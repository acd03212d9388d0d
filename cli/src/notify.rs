use crate::{config::AppConfig, contacts::Contacts, share, task::TaskStatus};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const USER_NAME: &str = "Music Lover";
const COMPLETED_MESSAGE: &str = "Here's your Valentine's song!";
const FAILED_MESSAGE: &str = "We couldn't finish your song this time.";

/// Template fields for one completion notice.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionNotice {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub url: Option<String>,
}

impl CompletionNotice {
    pub fn text(&self) -> String {
        match (self.status, self.url.as_deref()) {
            (TaskStatus::Completed, Some(url)) => {
                format!("Your song \"{}\" is ready: {url}", self.title)
            }
            (TaskStatus::Completed, None) => format!("Your song \"{}\" is ready.", self.title),
            _ => format!("Your song \"{}\" could not be generated.", self.title),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    NothingToSend,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_status(&self, to: &str, notice: &CompletionNotice) -> Result<()>;
    async fn send_share(&self, to: &str, title: &str, link: &str, sender: &str) -> Result<()>;
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send_sms(&self, phone: &str, message: &str) -> Result<()>;
}

/// Fire-and-forget completion notices. `Err` means every channel that had
/// an address failed.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn dispatch(
        &self,
        contacts: &Contacts,
        notice: &CompletionNotice,
    ) -> Result<DispatchOutcome>;
}

pub struct Dispatcher {
    email: Option<Arc<dyn EmailSender>>,
    sms: Option<Arc<dyn SmsSender>>,
    sms_max_chars: usize,
}

impl Dispatcher {
    pub fn new(
        email: Option<Arc<dyn EmailSender>>,
        sms: Option<Arc<dyn SmsSender>>,
        sms_max_chars: usize,
    ) -> Self {
        Self { email, sms, sms_max_chars }
    }

    pub fn from_config(config: &AppConfig, http: reqwest::Client) -> Self {
        let email = EmailJsClient::from_config(config, http.clone())
            .map(|client| Arc::new(client) as Arc<dyn EmailSender>);
        let sms = SmsGatewayClient::from_config(config, http)
            .map(|client| Arc::new(client) as Arc<dyn SmsSender>);
        Self::new(email, sms, config.sms().max_chars)
    }
}

#[async_trait]
impl Notifier for Dispatcher {
    async fn dispatch(
        &self,
        contacts: &Contacts,
        notice: &CompletionNotice,
    ) -> Result<DispatchOutcome> {
        let mut attempted = 0;
        let mut failures = Vec::new();

        if let (Some(sender), Some(to)) = (&self.email, contacts.email.as_deref()) {
            attempted += 1;
            if let Err(err) = sender.send_status(to, notice).await {
                warn!(task_id = %notice.task_id, "email notification failed: {err:#}");
                failures.push(format!("email: {err}"));
            }
        }
        if let (Some(sender), Some(phone)) = (&self.sms, contacts.phone.as_deref()) {
            attempted += 1;
            let message = share::bounded_message(&notice.text(), self.sms_max_chars);
            if let Err(err) = sender.send_sms(phone, &message).await {
                warn!(task_id = %notice.task_id, "sms notification failed: {err:#}");
                failures.push(format!("sms: {err}"));
            }
        }

        if attempted == 0 {
            return Ok(DispatchOutcome::NothingToSend);
        }
        if failures.len() == attempted {
            return Err(anyhow!(failures.join("; ")));
        }
        Ok(DispatchOutcome::Sent)
    }
}

#[derive(Debug, Serialize)]
struct EmailRequest<'a, P: Serialize> {
    service_id: &'a str,
    template_id: &'a str,
    user_id: &'a str,
    template_params: P,
}

#[derive(Debug, Serialize)]
struct StatusParams<'a> {
    to_email: &'a str,
    user_name: &'a str,
    message: &'a str,
    title: &'a str,
    status: &'a str,
    url: &'a str,
}

#[derive(Debug, Serialize)]
struct ShareParams<'a> {
    to_email: &'a str,
    song_title: &'a str,
    song_url: &'a str,
    from_name: &'a str,
}

/// EmailJS REST delivery.
pub struct EmailJsClient {
    http: reqwest::Client,
    endpoint: Url,
    service_id: String,
    status_template_id: String,
    share_template_id: String,
    public_key: String,
}

impl EmailJsClient {
    /// `None` unless the service, template and key are all configured.
    pub fn from_config(config: &AppConfig, http: reqwest::Client) -> Option<Self> {
        let email = config.email();
        let endpoint = Url::parse(&email.endpoint)
            .map_err(|err| warn!("invalid email endpoint {}: {err}", email.endpoint))
            .ok()?;
        Some(Self {
            http,
            endpoint,
            service_id: email.service_id.clone()?,
            status_template_id: email.status_template_id.clone()?,
            share_template_id: email
                .share_template_id
                .clone()
                .or_else(|| email.status_template_id.clone())?,
            public_key: email.public_key.clone()?,
        })
    }

    async fn send<P: Serialize + Send + Sync>(&self, template_id: &str, params: P) -> Result<()> {
        let body = EmailRequest {
            service_id: &self.service_id,
            template_id,
            user_id: &self.public_key,
            template_params: params,
        };
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .context("email request failed")?;
        let status = response.status();
        if status != StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            bail!("email service responded with {status}: {text}");
        }
        Ok(())
    }
}

#[async_trait]
impl EmailSender for EmailJsClient {
    async fn send_status(&self, to: &str, notice: &CompletionNotice) -> Result<()> {
        let message = match notice.status {
            TaskStatus::Completed => COMPLETED_MESSAGE,
            _ => FAILED_MESSAGE,
        };
        let params = StatusParams {
            to_email: to,
            user_name: USER_NAME,
            message,
            title: &notice.title,
            status: notice.status.as_str(),
            url: notice.url.as_deref().unwrap_or_default(),
        };
        self.send(&self.status_template_id, params).await?;
        info!(task_id = %notice.task_id, "status email sent");
        Ok(())
    }

    async fn send_share(&self, to: &str, title: &str, link: &str, sender: &str) -> Result<()> {
        let params =
            ShareParams { to_email: to, song_title: title, song_url: link, from_name: sender };
        self.send(&self.share_template_id, params).await
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    status: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SmsResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct Recipient<'a> {
    mobile: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SmsRequest<'a> {
    msisdn: Vec<Recipient<'a>>,
    source_address: &'a str,
    message: &'a str,
    #[serde(rename = "transaction_id")]
    transaction_id: String,
    #[serde(rename = "payment_method")]
    payment_method: &'a str,
}

enum SendAttempt {
    Delivered,
    TokenRejected,
}

/// Bulk SMS gateway with username/password login and a cached bearer token.
pub struct SmsGatewayClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
    source_address: String,
    country_code: String,
    token: Mutex<Option<String>>,
}

impl SmsGatewayClient {
    pub fn from_config(config: &AppConfig, http: reqwest::Client) -> Option<Self> {
        let sms = config.sms();
        let base = sms.base_url.as_deref()?;
        let mut base_url = Url::parse(base)
            .map_err(|err| warn!("invalid sms base url {base}: {err}"))
            .ok()?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Some(Self {
            http,
            base_url,
            username: sms.username.clone()?,
            password: sms.password.clone()?,
            source_address: sms.source_address.clone()?,
            country_code: sms.country_code.clone(),
            token: Mutex::new(None),
        })
    }

    async fn login(&self) -> Result<String> {
        let url = self.base_url.join("v1/login").context("failed to build sms login URL")?;
        let body = serde_json::json!({ "username": self.username, "password": self.password });
        let response: LoginResponse = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .context("sms login request failed")?
            .json()
            .await
            .context("failed to decode sms login response")?;
        match response.token {
            Some(token) if response.status == "success" && !token.is_empty() => {
                *self.token.lock().await = Some(token.clone());
                Ok(token)
            }
            _ => bail!(
                "sms login refused: {}",
                response.comment.unwrap_or_else(|| response.status.clone())
            ),
        }
    }

    async fn token(&self) -> Result<String> {
        if let Some(token) = self.token.lock().await.clone() {
            return Ok(token);
        }
        self.login().await
    }

    async fn attempt(&self, token: &str, mobile: &str, message: &str) -> Result<SendAttempt> {
        let url = self.base_url.join("v2/sms").context("failed to build sms send URL")?;
        let request = SmsRequest {
            msisdn: vec![Recipient { mobile }],
            source_address: &self.source_address,
            message,
            transaction_id: Utc::now().timestamp_millis().to_string(),
            payment_method: "0",
        };
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .context("sms send request failed")?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(SendAttempt::TokenRejected);
        }
        let body: SmsResponse = response.json().await.context("failed to decode sms response")?;
        if body.status == "success" {
            return Ok(SendAttempt::Delivered);
        }
        let detail = body.message.unwrap_or_default();
        if detail.to_lowercase().contains("token") {
            return Ok(SendAttempt::TokenRejected);
        }
        bail!("sms gateway refused message: {detail}")
    }
}

#[async_trait]
impl SmsSender for SmsGatewayClient {
    async fn send_sms(&self, phone: &str, message: &str) -> Result<()> {
        let mobile = international_number(phone, &self.country_code);
        let token = self.token().await?;
        match self.attempt(&token, &mobile, message).await? {
            SendAttempt::Delivered => return Ok(()),
            SendAttempt::TokenRejected => info!("sms token rejected, logging in again"),
        }
        let token = self.login().await?;
        match self.attempt(&token, &mobile, message).await? {
            SendAttempt::Delivered => Ok(()),
            SendAttempt::TokenRejected => bail!("sms gateway rejected a fresh token"),
        }
    }
}

/// Digits only, prefixed with the country code unless already present.
pub fn international_number(phone: &str, country_code: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.starts_with(country_code) {
        digits
    } else {
        format!("{country_code}{digits}")
    }
}
