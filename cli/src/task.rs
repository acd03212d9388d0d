use crate::{style::StyleOptions, types::Song};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

// Stored histories may carry statuses written by older clients; anything
// unrecognised is still waiting on the remote side.
impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(match raw.as_deref().unwrap_or_default() {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        })
    }
}

/// One music generation request and its lifecycle, as persisted in the
/// history list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTask {
    pub id: String,
    pub prompt: String,
    pub status: TaskStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub songs: Option<Vec<Song>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub notification_sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StyleOptions>,
}

impl GenerationTask {
    pub fn pending(id: String, prompt: String, style: StyleOptions, now: DateTime<Utc>) -> Self {
        Self {
            id,
            prompt,
            status: TaskStatus::Pending,
            timestamp: now,
            completed_at: None,
            songs: None,
            error: None,
            notification_sent: false,
            tags: Some(style.tags()),
            style: Some(style),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    /// Style for resubmission: the stored options, else the voice implied
    /// by the stored tags.
    pub fn style_options(&self) -> StyleOptions {
        self.style
            .or_else(|| self.tags.as_deref().map(StyleOptions::infer_from_tags))
            .unwrap_or_default()
    }

    /// Leaves `pending` with output. Returns false (and changes nothing) if
    /// the task is already terminal.
    pub fn complete(&mut self, songs: Vec<Song>, at: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.songs = Some(songs);
        self.error = None;
        self.completed_at = Some(at);
        true
    }

    pub fn fail(&mut self, reason: String, at: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(reason);
        self.songs = None;
        self.completed_at = Some(at);
        true
    }

    /// Puts a failed task back to `pending` for resubmission.
    pub fn restart(&mut self, at: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Failed {
            return false;
        }
        self.status = TaskStatus::Pending;
        self.error = None;
        self.songs = None;
        self.completed_at = None;
        self.notification_sent = false;
        self.timestamp = at;
        true
    }

    pub fn mark_notified(&mut self) -> bool {
        if !self.status.is_terminal() || self.notification_sent {
            return false;
        }
        self.notification_sent = true;
        true
    }

    pub fn first_playable(&self) -> Option<&Song> {
        self.songs.as_deref().and_then(|songs| songs.iter().find(|song| song.is_playable()))
    }

    pub fn title(&self) -> String {
        self.first_playable()
            .map(|song| song.title.clone())
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| "Your Song".to_string())
    }

    /// Repairs records written by older or interrupted clients so the
    /// lifecycle invariants hold again.
    pub fn normalize(&mut self) {
        match self.status {
            TaskStatus::Pending => {
                self.completed_at = None;
                self.songs = None;
                self.error = None;
                self.notification_sent = false;
            }
            TaskStatus::Completed => {
                self.error = None;
                self.completed_at.get_or_insert(self.timestamp);
            }
            TaskStatus::Failed => {
                self.songs = None;
                self.completed_at.get_or_insert(self.timestamp);
            }
        }
    }
}
