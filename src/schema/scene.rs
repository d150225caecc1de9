use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::affect::Mode;
use super::persona::{PersonaId, SpeakerId};

#[derive(Debug, Error)]
pub enum SceneFormatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid relationship '{0}', expected \"A->B: description\"")]
    Relationship(String),
}

/// A directed edge between two speakers, written `"A->B: description"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Relationship {
    pub source: SpeakerId,
    pub target: SpeakerId,
    pub description: String,
}

impl Relationship {
    pub fn parse(text: &str) -> Result<Self, SceneFormatError> {
        let invalid = || SceneFormatError::Relationship(text.to_string());
        let (edge, description) = match text.split_once(':') {
            Some((edge, rest)) => (edge, rest.trim()),
            None => (text, ""),
        };
        let (source, target) = edge.split_once("->").ok_or_else(invalid)?;
        let (source, target) = (source.trim(), target.trim());
        if source.is_empty() || target.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            source: SpeakerId::from(source),
            target: SpeakerId::from(target),
            description: description.to_string(),
        })
    }

    pub fn involves(&self, a: &SpeakerId, b: &SpeakerId) -> bool {
        &self.source == a && &self.target == b
    }
}

impl TryFrom<String> for Relationship {
    type Error = SceneFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Relationship> for String {
    fn from(rel: Relationship) -> Self {
        rel.to_string()
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}->{}", self.source, self.target)
        } else {
            write!(f, "{}->{}: {}", self.source, self.target, self.description)
        }
    }
}

/// One scripted line, with optional author overrides of the tracked state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneLine {
    pub speaker: SpeakerId,
    pub text: String,
    #[serde(default)]
    pub mode_override: Option<Mode>,
    #[serde(default)]
    pub intensity_override: Option<f32>,
}

impl SceneLine {
    pub fn new(speaker: &str, text: &str) -> Self {
        Self {
            speaker: SpeakerId::from(speaker),
            text: text.to_string(),
            mode_override: None,
            intensity_override: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneDefinition {
    pub id: String,
    pub source_lang: String,
    pub target_lang: String,
    #[serde(default)]
    pub setting: String,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    pub cast: BTreeMap<SpeakerId, PersonaId>,
    pub turns: Vec<SceneLine>,
}

impl SceneDefinition {
    pub fn parse_ron(input: &str) -> Result<Self, SceneFormatError> {
        Ok(ron::from_str(input)?)
    }

    pub fn load_from_ron(path: &std::path::Path) -> Result<Self, SceneFormatError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// The listener for turn `index`: the next distinct speaker in turn order,
    /// else the previous distinct one. `None` for a monologue.
    pub fn listener_for(&self, index: usize) -> Option<&SpeakerId> {
        let speaker = &self.turns.get(index)?.speaker;
        self.turns[index + 1..]
            .iter()
            .map(|line| &line.speaker)
            .find(|s| *s != speaker)
            .or_else(|| {
                self.turns[..index]
                    .iter()
                    .rev()
                    .map(|line| &line.speaker)
                    .find(|s| *s != speaker)
            })
    }

    pub fn relationship(&self, from: &SpeakerId, to: &SpeakerId) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.involves(from, to))
    }

    /// Speakers that appear in `turns`, in order of first appearance.
    pub fn speakers(&self) -> Vec<&SpeakerId> {
        let mut seen: Vec<&SpeakerId> = Vec::new();
        for line in &self.turns {
            if !seen.contains(&&line.speaker) {
                seen.push(&line.speaker);
            }
        }
        seen
    }
}
