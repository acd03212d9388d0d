use anyhow::{Context, Result};
use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD},
    Engine as _,
};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const PLAY_ROUTE: &str = "#/play/";
const TINYURL_ENDPOINT: &str = "https://tinyurl.com/api-create.php";
const FACEBOOK_SHARER: &str = "https://www.facebook.com/sharer/sharer.php";
const WHATSAPP_ENDPOINT: &str = "https://wa.me/";
const ELLIPSIS: &str = "...";

/// What the player page needs to show a shared song.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharePayload {
    pub url: String,
    pub title: String,
    pub sender: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShareError {
    #[error("Failed to load song data. Please try again. (link is not valid base64)")]
    Encoding,
    #[error("Failed to load song data. Please try again. (link payload is not text)")]
    Text,
    #[error("Failed to load song data. Please try again. ({0})")]
    Payload(String),
    #[error("Failed to load song data. Please try again. (link has no song)")]
    Empty,
}

pub fn encode(payload: &SharePayload) -> String {
    // Serializing three strings cannot fail.
    let json = serde_json::to_vec(payload).unwrap_or_default();
    STANDARD.encode(json)
}

/// Reverses [`encode`]. Accepts the bare segment or a full play URL, and
/// tolerates URL-safe alphabets and stripped padding.
pub fn decode(link: &str) -> Result<SharePayload, ShareError> {
    let segment = link
        .rsplit_once(PLAY_ROUTE)
        .map(|(_, tail)| tail)
        .unwrap_or(link)
        .trim()
        .trim_end_matches('/');
    if segment.is_empty() {
        return Err(ShareError::Empty);
    }
    let bytes = [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(segment).ok())
        .ok_or(ShareError::Encoding)?;
    let text = String::from_utf8(bytes).map_err(|_| ShareError::Text)?;
    let payload: SharePayload =
        serde_json::from_str(&text).map_err(|err| ShareError::Payload(err.to_string()))?;
    if payload.url.trim().is_empty() {
        return Err(ShareError::Empty);
    }
    Ok(payload)
}

/// Player page link carrying the encoded payload.
pub fn play_url(share_base_url: &str, payload: &SharePayload) -> String {
    let base = share_base_url.trim_end_matches('/');
    format!("{base}/{PLAY_ROUTE}{}", encode(payload))
}

/// Absolute location of a song; relative API paths hang off the media base.
pub fn absolute_song_url(media_base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = media_base_url.trim_end_matches('/');
    let clean = path.trim_start_matches('/');
    format!("{base}/{clean}")
}

/// Cuts `message` to at most `max_chars` characters, marking the cut.
pub fn bounded_message(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    let mut cut: String = message.chars().take(keep).collect();
    cut.push_str(ELLIPSIS);
    cut
}

pub fn sms_message(title: &str, link: &str, max_chars: usize) -> String {
    bounded_message(
        &format!("Check out this Valentine's song I created: \"{title}\"\n\nListen here: {link}"),
        max_chars,
    )
}

pub fn whatsapp_message(title: &str, link: &str, app_url: &str) -> String {
    format!(
        "🎵 Check out this Valentine's song I created: \"{title}\"\n\n\
         Listen here: {link}\n\n\
         💝 Create your own Valentine's song at: {app_url}"
    )
}

pub fn whatsapp_url(message: &str) -> Result<String> {
    let url = Url::parse_with_params(WHATSAPP_ENDPOINT, &[("text", message)])
        .context("failed to build WhatsApp link")?;
    Ok(url.into())
}

pub fn facebook_url(link: &str) -> Result<String> {
    let url = Url::parse_with_params(FACEBOOK_SHARER, &[("u", link)])
        .context("failed to build Facebook share link")?;
    Ok(url.into())
}

/// Asks TinyURL for a short alias. Any failure keeps the long link.
pub async fn shorten(http: &reqwest::Client, long_url: &str) -> String {
    match try_shorten(http, long_url).await {
        Ok(short) => short,
        Err(err) => {
            warn!("url shortening failed, keeping long link: {err:#}");
            long_url.to_string()
        }
    }
}

async fn try_shorten(http: &reqwest::Client, long_url: &str) -> Result<String> {
    let url = Url::parse_with_params(TINYURL_ENDPOINT, &[("url", long_url)])
        .context("failed to build shortener URL")?;
    let body = http
        .get(url)
        .send()
        .await
        .context("shortener request failed")?
        .error_for_status()
        .context("shortener rejected the link")?
        .text()
        .await
        .context("failed to read shortener response")?;
    let short = body.trim();
    if !short.starts_with("http") {
        anyhow::bail!("invalid response from shortener: {short:?}");
    }
    Ok(short.to_string())
}
