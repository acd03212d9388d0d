use serde::Deserialize;
use thiserror::Error;

const CREDITS_CODE: &str = "INSUFFICIENT_CREDITS";

/// Failure talking to the music generation API, already phrased for the
/// person who triggered the request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("API key is missing. Please check your configuration.")]
    MissingApiKey,
    #[error("Authentication failed. Please check your API key.")]
    Unauthorized,
    #[error("Access forbidden. Please check your account permissions.")]
    Forbidden,
    #[error("API rate limit exceeded. Please try again later.")]
    RateLimited,
    #[error("Credit limit exceeded. Please check your account balance.")]
    InsufficientCredits,
    #[error("Server error: {0}")]
    Server(String),
    #[error("Server error. Please try again later or contact support.")]
    ServerUnknown,
    #[error("{0}")]
    Rejected(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Malformed(String),
}

impl ApiError {
    pub fn is_credits(&self) -> bool {
        matches!(self, Self::InsufficientCredits)
    }

    /// Link the person can follow to fix the problem themselves.
    pub fn action_link<'a>(&self, account_url: &'a str) -> Option<&'a str> {
        self.is_credits().then_some(account_url)
    }

    /// Maps a non-success HTTP response onto the taxonomy.
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            429 => Self::RateLimited,
            500 => {
                let detail = parsed.detail.unwrap_or_default();
                if detail.code.as_deref() == Some(CREDITS_CODE) {
                    return Self::InsufficientCredits;
                }
                if let Some(message) = detail.message.filter(|m| !m.is_empty()) {
                    return Self::Server(message);
                }
                match parsed.message.filter(|m| !m.is_empty()) {
                    Some(message) if mentions_credits(&message) => Self::InsufficientCredits,
                    Some(message) => Self::Server(message),
                    None => Self::ServerUnknown,
                }
            }
            _ => parsed
                .message
                .or(parsed.error)
                .filter(|m| !m.is_empty())
                .map(Self::Rejected)
                .unwrap_or_else(|| Self::Rejected(format!("Request failed with status {status}"))),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

pub fn mentions_credits(message: &str) -> bool {
    message.to_lowercase().contains("credit")
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<ErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Why a submit or retry did not produce a pending task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Please enter lyrics before generating a song")]
    EmptyPrompt,
    #[error("Lyrics must be at least {min} characters (got {actual})")]
    PromptTooShort { min: usize, actual: usize },
    #[error("Lyrics must be at most {max} characters (got {actual})")]
    PromptTooLong { max: usize, actual: usize },
    #[error(
        "You have reached the maximum limit of {limit} songs. \
         Please delete some songs to generate more."
    )]
    LimitReached { limit: usize },
    #[error("{0}")]
    Maintenance(String),
    #[error("no task with id {0}")]
    UnknownTask(String),
    #[error("task {0} has not failed and cannot be retried")]
    NotRetryable(String),
    #[error("task {0} is already tracked")]
    DuplicateTask(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl SubmitError {
    pub fn action_link<'a>(&self, account_url: &'a str) -> Option<&'a str> {
        match self {
            Self::Api(err) => err.action_link(account_url),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_auth_and_rate_limit_statuses() {
        assert_eq!(ApiError::from_response(401, ""), ApiError::Unauthorized);
        assert_eq!(ApiError::from_response(403, "{}"), ApiError::Forbidden);
        assert_eq!(ApiError::from_response(429, "not json"), ApiError::RateLimited);
    }

    #[test]
    fn detects_credit_exhaustion_from_detail_code_or_message() {
        let coded = r#"{"detail":{"code":"INSUFFICIENT_CREDITS","message":"nope"}}"#;
        let worded = r#"{"message":"Not enough credit on account"}"#;
        assert_eq!(ApiError::from_response(500, coded), ApiError::InsufficientCredits);
        assert_eq!(ApiError::from_response(500, worded), ApiError::InsufficientCredits);
        assert_eq!(
            ApiError::InsufficientCredits.action_link("https://example.test/account"),
            Some("https://example.test/account")
        );
    }

    #[test]
    fn server_errors_prefer_detail_message() {
        let body = r#"{"message":"outer","detail":{"message":"model overloaded"}}"#;
        let err = ApiError::from_response(500, body);
        assert_eq!(err.to_string(), "Server error: model overloaded");
        assert_eq!(ApiError::from_response(500, ""), ApiError::ServerUnknown);
        assert!(err.action_link("https://example.test").is_none());
    }

    #[test]
    fn other_statuses_surface_body_message() {
        let err = ApiError::from_response(400, r#"{"message":"prompt too long"}"#);
        assert_eq!(err.to_string(), "prompt too long");
        let bare = ApiError::from_response(502, "");
        assert_eq!(bare.to_string(), "Request failed with status 502");
    }

    #[test]
    fn submit_error_wraps_api_error_transparently() {
        let err = SubmitError::from(ApiError::RateLimited);
        assert_eq!(err.to_string(), "API rate limit exceeded. Please try again later.");
        assert!(SubmitError::from(ApiError::InsufficientCredits).action_link("x").is_some());
    }
}
