use crate::{config::AppConfig, profanity::ProfanityFilter};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

pub const MAX_LYRICS_CHARS: usize = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LyricKind {
    #[default]
    Romantic,
    Friendship,
    Nature,
    Inspiration,
}

impl LyricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LyricKind::Romantic => "romantic",
            LyricKind::Friendship => "friendship",
            LyricKind::Nature => "nature",
            LyricKind::Inspiration => "inspiration",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LyricsError {
    #[error("{0}")]
    Maintenance(String),
    #[error("Please enter at least {min} characters for your lyrics idea")]
    IdeaTooShort { min: usize },
    #[error("Please remove inappropriate content before generating lyrics.")]
    Inappropriate,
    #[error("Lyrics service key is missing. Set SERENADE_OPENAI_API_KEY.")]
    MissingApiKey,
    #[error("Failed to generate lyrics. Please try again.")]
    Failed(String),
    #[error("No lyrics generated")]
    Empty,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    presence_penalty: f32,
    frequency_penalty: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Turns a short idea into verse/chorus lyrics via a chat-completions API.
pub struct LyricsGenerator {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    min_idea_chars: usize,
    maintenance: Option<String>,
    filter: ProfanityFilter,
}

impl LyricsGenerator {
    pub fn from_config(config: &AppConfig, http: reqwest::Client) -> Self {
        let settings = config.lyrics();
        Self {
            http,
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone().filter(|key| !key.trim().is_empty()),
            model: settings.model.clone(),
            min_idea_chars: config.min_idea_chars(),
            maintenance: (!config.app_enabled()).then(|| config.maintenance_message().to_string()),
            filter: ProfanityFilter::default(),
        }
    }

    pub fn check_idea(&self, idea: &str) -> Result<(), LyricsError> {
        if let Some(message) = &self.maintenance {
            return Err(LyricsError::Maintenance(message.clone()));
        }
        if !self.filter.is_clean(idea) {
            return Err(LyricsError::Inappropriate);
        }
        if idea.trim().is_empty() || idea.chars().count() < self.min_idea_chars {
            return Err(LyricsError::IdeaTooShort { min: self.min_idea_chars });
        }
        Ok(())
    }

    pub async fn generate(&self, idea: &str, kind: LyricKind) -> Result<String, LyricsError> {
        self.check_idea(idea)?;
        let api_key = self.api_key.as_deref().ok_or(LyricsError::MissingApiKey)?;

        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".into(),
                content: Some(build_prompt(idea, kind)),
            }],
            temperature: 0.7,
            max_tokens: 900,
            presence_penalty: 0.6,
            frequency_penalty: 0.2,
        };
        debug!(kind = kind.as_str(), "requesting lyrics");

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| failed("lyrics request failed", err))?
            .error_for_status()
            .map_err(|err| failed("lyrics service rejected the request", err))?
            .json::<ChatResponse>()
            .await
            .map_err(|err| failed("unreadable lyrics response", err))?;

        let lyrics = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(LyricsError::Empty)?;
        Ok(fit_lyrics(&lyrics))
    }
}

fn failed(context: &str, err: reqwest::Error) -> LyricsError {
    error!("{context}: {err}");
    LyricsError::Failed(err.to_string())
}

pub fn build_prompt(idea: &str, kind: LyricKind) -> String {
    format!(
        "Write concise song lyrics based on this idea: \"{idea}\"\n\
         Style: {kind}\n\
         Strict Requirements:\n\
         - Must be under {MAX_LYRICS_CHARS} characters total\n\
         - Include exactly two verses and two choruses\n\
         - Keep it family-friendly and Valentine's themed\n\
         - Make it emotional and meaningful\n\
         - Focus on quality over quantity\n\
         Format:\n\
         [Verse]\n(4 lines max)\n\n\
         [Chorus]\n(4 lines max)\n\n\
         [Verse]\n(4 lines max)\n\n\
         [Chorus]\n(4 lines max)",
        kind = kind.as_str(),
    )
}

/// Cuts overlong lyrics at the limit, then back to the last full line.
pub fn fit_lyrics(lyrics: &str) -> String {
    if lyrics.chars().count() <= MAX_LYRICS_CHARS {
        return lyrics.to_string();
    }
    let cut: String = lyrics.chars().take(MAX_LYRICS_CHARS).collect();
    match cut.rfind('\n') {
        Some(newline) if newline > 0 => cut[..newline].to_string(),
        _ => cut,
    }
}
