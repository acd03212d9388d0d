use crate::types::{GenerationInput, GenerationRequest, LyricsType, TaskType};
use clap::ValueEnum;
use rand::Rng;
use serde::{Deserialize, Serialize};

const MALE_TAGS: [&str; 3] = ["male_vocals", "male_voice", "male_singer"];
const FEMALE_TAGS: [&str; 3] = ["female_vocals", "female_voice", "female_singer"];
const SEED_CEILING: u32 = 1_000_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    #[default]
    Male,
    Female,
}

impl Voice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
        }
    }

    fn tags(&self) -> [&'static str; 3] {
        match self {
            Self::Male => MALE_TAGS,
            Self::Female => FEMALE_TAGS,
        }
    }

    fn opposite(&self) -> Self {
        match self {
            Self::Male => Self::Female,
            Self::Female => Self::Male,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
pub enum Genre {
    #[serde(rename = "pop")]
    #[value(name = "pop")]
    Pop,
    #[serde(rename = "rock")]
    #[value(name = "rock")]
    Rock,
    #[serde(rename = "r&b")]
    #[value(name = "r&b")]
    RnB,
    #[serde(rename = "hip-hop")]
    #[value(name = "hip-hop")]
    HipHop,
    #[serde(rename = "jazz")]
    #[value(name = "jazz")]
    Jazz,
    #[serde(rename = "classical")]
    #[value(name = "classical")]
    Classical,
    #[serde(rename = "electronic")]
    #[value(name = "electronic")]
    Electronic,
}

impl Genre {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pop => "pop",
            Self::Rock => "rock",
            Self::RnB => "r&b",
            Self::HipHop => "hip-hop",
            Self::Jazz => "jazz",
            Self::Classical => "classical",
            Self::Electronic => "electronic",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Happy,
    Sad,
    Energetic,
    Calm,
    Romantic,
    Melancholic,
}

impl Mood {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Happy => "happy",
            Self::Sad => "sad",
            Self::Energetic => "energetic",
            Self::Calm => "calm",
            Self::Romantic => "romantic",
            Self::Melancholic => "melancholic",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
pub enum Era {
    #[serde(rename = "1970s")]
    #[value(name = "1970s")]
    Seventies,
    #[serde(rename = "1980s")]
    #[value(name = "1980s")]
    Eighties,
    #[serde(rename = "1990s")]
    #[value(name = "1990s")]
    Nineties,
    #[serde(rename = "2000s")]
    #[value(name = "2000s")]
    TwoThousands,
    #[serde(rename = "2010s")]
    #[value(name = "2010s")]
    TwentyTens,
    #[serde(rename = "modern")]
    #[value(name = "modern")]
    Modern,
}

impl Era {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seventies => "1970s",
            Self::Eighties => "1980s",
            Self::Nineties => "1990s",
            Self::TwoThousands => "2000s",
            Self::TwentyTens => "2010s",
            Self::Modern => "modern",
        }
    }
}

/// Musical style chosen alongside the lyrics. Persisted with each task so a
/// retry renders with the same voice and tags as the first attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StyleOptions {
    #[serde(default)]
    pub voice: Voice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<Genre>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<Mood>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub era: Option<Era>,
}

impl StyleOptions {
    pub fn tags(&self) -> String {
        self.voice.tags().join(",")
    }

    pub fn negative_tags(&self) -> String {
        self.voice.opposite().tags().join(",")
    }

    pub fn description(&self) -> String {
        let mut parts = vec![self.voice.as_str()];
        parts.extend(self.genre.map(|genre| genre.as_str()));
        parts.extend(self.mood.map(|mood| mood.as_str()));
        parts.extend(self.era.map(|era| era.as_str()));
        parts.join(", ")
    }

    /// Recovers the voice from a stored tag string for records saved before
    /// style options were persisted alongside them.
    pub fn infer_from_tags(tags: &str) -> Self {
        let female = tags.split(',').any(|tag| tag.trim().eq_ignore_ascii_case(FEMALE_TAGS[0]));
        let voice = if female { Voice::Female } else { Voice::Male };
        Self { voice, ..Self::default() }
    }

    pub fn build_request(&self, model: &str, prompt: &str) -> GenerationRequest {
        let seed = rand::thread_rng().gen_range(0..SEED_CEILING);
        GenerationRequest {
            model: model.to_string(),
            task_type: TaskType::GenerateMusic,
            input: GenerationInput {
                prompt: prompt.to_string(),
                lyrics_type: LyricsType::User,
                tags: self.tags(),
                negative_tags: self.negative_tags(),
                make_instrumental: false,
                seed: Some(seed),
                gpt_description_prompt: Some(self.description()),
            },
        }
    }
}
