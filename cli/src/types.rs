use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LyricsType {
    Generate,
    Instrumental,
    User,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    GenerateMusic,
    GenerateMusicCustom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub task_type: TaskType,
    pub input: GenerationInput,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationInput {
    pub prompt: String,
    pub lyrics_type: LyricsType,
    pub tags: String,
    pub negative_tags: String,
    pub make_instrumental: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpt_description_prompt: Option<String>,
}

/// One rendered output of a generation task. Failed outputs carry
/// placeholder songs with most fields `null`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Song {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub song_path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lyrics: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Song {
    pub fn is_playable(&self) -> bool {
        self.finished && !self.song_path.trim().is_empty()
    }
}

/// Reads an explicit `null` the same as a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Remote task status. Anything the API reports besides `completed` and
/// `failed` (queued, processing, staged, ...) is still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoteStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl<'de> Deserialize<'de> for RemoteStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(match raw.unwrap_or_default().to_ascii_lowercase().as_str() {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteError {
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TaskOutput {
    #[serde(default)]
    pub songs: Option<Vec<Song>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskData {
    #[serde(default)]
    pub status: RemoteStatus,
    #[serde(default)]
    pub error: Option<RemoteError>,
    #[serde(default)]
    pub output: Option<TaskOutput>,
}

/// Envelope returned by `GET /api/v1/task/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskEnvelope {
    pub data: TaskData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitData {
    pub task_id: String,
}

/// Submission response. Some deployments wrap the id in `data`, others
/// return it at the top level.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitEnvelope {
    #[serde(default)]
    pub data: Option<SubmitData>,
    #[serde(default)]
    pub task_id: Option<String>,
}

impl SubmitEnvelope {
    pub fn into_task_id(self) -> Option<String> {
        self.data
            .map(|data| data.task_id)
            .or(self.task_id)
            .filter(|id| !id.trim().is_empty())
    }
}

/// Status of a task as seen by one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTask {
    pub status: RemoteStatus,
    pub songs: Vec<Song>,
    pub error: Option<String>,
}

impl RemoteTask {
    /// Completed-with-output and failed are terminal; a completed report
    /// without songs is treated as still rendering.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            RemoteStatus::Completed => !self.songs.is_empty(),
            RemoteStatus::Failed => true,
            RemoteStatus::Pending => false,
        }
    }
}

impl From<TaskEnvelope> for RemoteTask {
    fn from(envelope: TaskEnvelope) -> Self {
        let data = envelope.data;
        let songs = data.output.and_then(|output| output.songs).unwrap_or_default();
        let error = data
            .error
            .map(|err| err.message)
            .filter(|message| !message.trim().is_empty());
        Self { status: data.status, songs, error }
    }
}
