use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_CONFIG_PATH: &str = "SERENADE_CONFIG_PATH";
const ENV_API_URL: &str = "SERENADE_API_URL";
const ENV_API_KEY: &str = "SERENADE_API_KEY";
const ENV_MODEL: &str = "SERENADE_MODEL";
const ENV_TASK_LIMIT: &str = "SERENADE_TASK_LIMIT";
const ENV_POLL_INTERVAL: &str = "SERENADE_POLL_INTERVAL_SECS";
const ENV_APP_ENABLED: &str = "SERENADE_APP_ENABLED";
const ENV_MAINTENANCE_MESSAGE: &str = "SERENADE_MAINTENANCE_MESSAGE";
const ENV_DATA_DIR: &str = "SERENADE_DATA_DIR";
const ENV_SHARE_BASE_URL: &str = "SERENADE_SHARE_BASE_URL";
const ENV_MEDIA_BASE_URL: &str = "SERENADE_MEDIA_BASE_URL";
const ENV_EMAIL_SERVICE_ID: &str = "SERENADE_EMAILJS_SERVICE_ID";
const ENV_EMAIL_TEMPLATE_ID: &str = "SERENADE_EMAILJS_TEMPLATE_ID";
const ENV_EMAIL_SHARE_TEMPLATE_ID: &str = "SERENADE_EMAILJS_SHARE_TEMPLATE_ID";
const ENV_EMAIL_PUBLIC_KEY: &str = "SERENADE_EMAILJS_PUBLIC_KEY";
const ENV_SMS_BASE_URL: &str = "SERENADE_SMS_BASE_URL";
const ENV_SMS_USERNAME: &str = "SERENADE_SMS_USERNAME";
const ENV_SMS_PASSWORD: &str = "SERENADE_SMS_PASSWORD";
const ENV_SMS_SOURCE_ADDRESS: &str = "SERENADE_SMS_SOURCE_ADDRESS";
const ENV_SMS_MAX_CHARS: &str = "SERENADE_SMS_MAX_CHARS";
const ENV_OPENAI_API_KEY: &str = "SERENADE_OPENAI_API_KEY";

const DEFAULT_SHARE_BASE_URL: &str = "http://localhost:5173/lyrics-to-song/";

#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub endpoint: String,
    pub service_id: Option<String>,
    pub status_template_id: Option<String>,
    pub share_template_id: Option<String>,
    pub public_key: Option<String>,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.emailjs.com/api/v1.0/email/send".into(),
            service_id: None,
            status_template_id: None,
            share_template_id: None,
            public_key: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmsSettings {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub source_address: Option<String>,
    pub max_chars: usize,
    pub country_code: String,
}

impl Default for SmsSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            username: None,
            password: None,
            source_address: None,
            max_chars: 160,
            country_code: "94".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LyricsSettings {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for LyricsSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            api_key: None,
            model: "gpt-3.5-turbo".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    api_base_url: Option<String>,
    api_key: Option<String>,
    model: String,
    account_url: String,
    task_limit: usize,
    min_prompt_chars: usize,
    max_prompt_chars: usize,
    min_idea_chars: usize,
    poll_interval_secs: u64,
    app_enabled: bool,
    maintenance_message: String,
    data_dir: Option<PathBuf>,
    share_base_url: String,
    media_base_url: Option<String>,
    sender_name: String,
    shorten_links: bool,
    email: EmailSettings,
    sms: SmsSettings,
    lyrics: LyricsSettings,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        let path = match config_file_override() {
            Some(path) => path,
            None => Self::default_config_path()?,
        };
        if path.exists() {
            let partial = read_partial(&path)?;
            config.apply_partial(partial);
        }

        config.apply_env()?;
        Ok(config)
    }

    pub fn api_base_url(&self) -> Option<&str> {
        self.api_base_url.as_deref()
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn account_url(&self) -> &str {
        &self.account_url
    }

    pub fn task_limit(&self) -> usize {
        self.task_limit
    }

    pub fn min_prompt_chars(&self) -> usize {
        self.min_prompt_chars
    }

    pub fn max_prompt_chars(&self) -> usize {
        self.max_prompt_chars
    }

    pub fn min_idea_chars(&self) -> usize {
        self.min_idea_chars
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn app_enabled(&self) -> bool {
        self.app_enabled
    }

    pub fn maintenance_message(&self) -> &str {
        &self.maintenance_message
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn share_base_url(&self) -> &str {
        &self.share_base_url
    }

    pub fn media_base_url(&self) -> &str {
        self.media_base_url.as_deref().unwrap_or(&self.share_base_url)
    }

    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    pub fn shorten_links(&self) -> bool {
        self.shorten_links
    }

    pub fn email(&self) -> &EmailSettings {
        &self.email
    }

    pub fn sms(&self) -> &SmsSettings {
        &self.sms
    }

    pub fn lyrics(&self) -> &LyricsSettings {
        &self.lyrics
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("com", "Serenade", "Serenade")
            .ok_or_else(|| anyhow!("unable to determine config directory"))?;
        Ok(dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        set_some(&mut self.api_base_url, partial.api_base_url);
        set_some(&mut self.api_key, partial.api_key);
        set_value(&mut self.model, partial.model);
        set_value(&mut self.account_url, partial.account_url);
        set_value(&mut self.task_limit, partial.task_limit);
        set_value(&mut self.min_prompt_chars, partial.min_prompt_chars);
        set_value(&mut self.max_prompt_chars, partial.max_prompt_chars);
        set_value(&mut self.min_idea_chars, partial.min_idea_chars);
        set_value(&mut self.poll_interval_secs, partial.poll_interval_secs);
        set_value(&mut self.app_enabled, partial.app_enabled);
        set_value(&mut self.maintenance_message, partial.maintenance_message);
        set_some(&mut self.data_dir, partial.data_dir);
        set_value(&mut self.share_base_url, partial.share_base_url);
        set_some(&mut self.media_base_url, partial.media_base_url);
        set_value(&mut self.sender_name, partial.sender_name);
        set_value(&mut self.shorten_links, partial.shorten_links);

        if let Some(email) = partial.email {
            set_value(&mut self.email.endpoint, email.endpoint);
            set_some(&mut self.email.service_id, email.service_id);
            set_some(&mut self.email.status_template_id, email.status_template_id);
            set_some(&mut self.email.share_template_id, email.share_template_id);
            set_some(&mut self.email.public_key, email.public_key);
        }
        if let Some(sms) = partial.sms {
            set_some(&mut self.sms.base_url, sms.base_url);
            set_some(&mut self.sms.username, sms.username);
            set_some(&mut self.sms.password, sms.password);
            set_some(&mut self.sms.source_address, sms.source_address);
            set_value(&mut self.sms.max_chars, sms.max_chars);
            set_value(&mut self.sms.country_code, sms.country_code);
        }
        if let Some(lyrics) = partial.lyrics {
            set_value(&mut self.lyrics.endpoint, lyrics.endpoint);
            set_some(&mut self.lyrics.api_key, lyrics.api_key);
            set_value(&mut self.lyrics.model, lyrics.model);
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(value) = env_string(ENV_API_URL) {
            self.api_base_url = Some(value);
        }
        if let Some(value) = env_string(ENV_API_KEY) {
            self.api_key = Some(value);
        }
        if let Some(value) = env_string(ENV_MODEL) {
            self.model = value;
        }
        if let Some(value) = env_parsed(ENV_TASK_LIMIT)? {
            self.task_limit = value;
        }
        if let Some(value) = env_parsed(ENV_POLL_INTERVAL)? {
            self.poll_interval_secs = value;
        }
        if let Some(value) = env_parsed(ENV_APP_ENABLED)? {
            self.app_enabled = value;
        }
        if let Some(value) = env_string(ENV_MAINTENANCE_MESSAGE) {
            self.maintenance_message = value;
        }
        if let Some(value) = env_string(ENV_DATA_DIR) {
            self.data_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = env_string(ENV_SHARE_BASE_URL) {
            self.share_base_url = value;
        }
        if let Some(value) = env_string(ENV_MEDIA_BASE_URL) {
            self.media_base_url = Some(value);
        }
        if let Some(value) = env_string(ENV_EMAIL_SERVICE_ID) {
            self.email.service_id = Some(value);
        }
        if let Some(value) = env_string(ENV_EMAIL_TEMPLATE_ID) {
            self.email.status_template_id = Some(value);
        }
        if let Some(value) = env_string(ENV_EMAIL_SHARE_TEMPLATE_ID) {
            self.email.share_template_id = Some(value);
        }
        if let Some(value) = env_string(ENV_EMAIL_PUBLIC_KEY) {
            self.email.public_key = Some(value);
        }
        if let Some(value) = env_string(ENV_SMS_BASE_URL) {
            self.sms.base_url = Some(value);
        }
        if let Some(value) = env_string(ENV_SMS_USERNAME) {
            self.sms.username = Some(value);
        }
        if let Some(value) = env_string(ENV_SMS_PASSWORD) {
            self.sms.password = Some(value);
        }
        if let Some(value) = env_string(ENV_SMS_SOURCE_ADDRESS) {
            self.sms.source_address = Some(value);
        }
        if let Some(value) = env_parsed(ENV_SMS_MAX_CHARS)? {
            self.sms.max_chars = value;
        }
        if let Some(value) = env_string(ENV_OPENAI_API_KEY) {
            self.lyrics.api_key = Some(value);
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            api_key: None,
            model: "music-u".into(),
            account_url: "https://piapi.ai/account".into(),
            task_limit: 5,
            min_prompt_chars: 1,
            max_prompt_chars: 900,
            min_idea_chars: 25,
            poll_interval_secs: 5,
            app_enabled: true,
            maintenance_message: "System is temporarily unavailable".into(),
            data_dir: None,
            share_base_url: DEFAULT_SHARE_BASE_URL.into(),
            media_base_url: None,
            sender_name: "A Valentine's Friend".into(),
            shorten_links: true,
            email: EmailSettings::default(),
            sms: SmsSettings::default(),
            lyrics: LyricsSettings::default(),
        }
    }
}

fn set_value<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn set_some<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_string(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("{name} has an invalid value {value:?}"))
        })
        .transpose()
}

fn config_file_override() -> Option<PathBuf> {
    let value = env::var_os(ENV_CONFIG_PATH).filter(|value| !value.is_empty())?;
    let path = PathBuf::from(value);
    if path.is_dir() {
        return Some(path.join(CONFIG_FILE_NAME));
    }
    Some(path)
}

fn read_partial(path: &Path) -> Result<PartialConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    parse_partial(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_partial(contents: &str) -> Result<PartialConfig> {
    Ok(toml::from_str(contents)?)
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PartialConfig {
    api_base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    account_url: Option<String>,
    task_limit: Option<usize>,
    min_prompt_chars: Option<usize>,
    max_prompt_chars: Option<usize>,
    min_idea_chars: Option<usize>,
    poll_interval_secs: Option<u64>,
    app_enabled: Option<bool>,
    maintenance_message: Option<String>,
    data_dir: Option<PathBuf>,
    share_base_url: Option<String>,
    media_base_url: Option<String>,
    sender_name: Option<String>,
    shorten_links: Option<bool>,
    email: Option<PartialEmail>,
    sms: Option<PartialSms>,
    lyrics: Option<PartialLyrics>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PartialEmail {
    endpoint: Option<String>,
    service_id: Option<String>,
    status_template_id: Option<String>,
    share_template_id: Option<String>,
    public_key: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PartialSms {
    base_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    source_address: Option<String>,
    max_chars: Option<usize>,
    country_code: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PartialLyrics {
    endpoint: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
}
