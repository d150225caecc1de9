use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use super::affect::{IntensityBand, Mode};
use super::record::ZLeakMarker;

/// Newtype wrapper for speaker ids (the scene role key, e.g. "A").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeakerId(pub String);

/// Newtype wrapper for persona ids. A scene's cast maps speakers onto these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonaId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(SpeakerId);
string_id!(PersonaId);

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("malformed persona '{persona}': {reason}")]
    Malformed { persona: String, reason: String },
    #[error("duplicate persona id: {0}")]
    Duplicate(PersonaId),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

/// An idiosyncratic verbal pattern: sentence ending, quirk, or tic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechPattern {
    pub pattern: String,
    #[serde(default)]
    pub trigger_condition: String,
    #[serde(default)]
    pub nuance: String,
}

/// A named opposition the character is torn between. Guidance only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictAxis {
    pub axis: String,
    #[serde(default)]
    pub side_a: String,
    #[serde(default)]
    pub side_b: String,
    #[serde(default = "default_axis_weight")]
    pub weight: f32,
}

fn default_axis_weight() -> f32 {
    1.0
}

/// A rule mapping what the *other* speaker just said to a change in this
/// character's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub name: String,
    /// Literal phrases or keywords the matcher looks for in the other line.
    #[serde(default)]
    pub patterns: Vec<String>,
    pub delta_intensity: f32,
    #[serde(default)]
    pub mode_shift: Option<Mode>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Trigger {
    pub const RELATIONAL_BREAKTHROUGH: &'static str = "relational_breakthrough";
}

/// How strongly an emotion state asks for a given surface device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerRequirement {
    None,
    #[default]
    Optional,
    Required,
}

impl MarkerRequirement {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Optional => "optional",
            Self::Required => "required",
        }
    }
}

/// Surface-marker hints for generation at a given intensity band.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurfaceHint {
    /// 0..=4
    #[serde(default)]
    pub hesitation: u8,
    /// 0..=4
    #[serde(default)]
    pub stutter_count: u8,
    #[serde(default)]
    pub negation_first: bool,
    #[serde(default)]
    pub overwrite: MarkerRequirement,
    #[serde(default)]
    pub residual: MarkerRequirement,
    #[serde(default)]
    pub tone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionState {
    pub name: String,
    pub band: IntensityBand,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub hint: SurfaceHint,
    #[serde(default)]
    pub z_leak: Vec<ZLeakMarker>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExampleLine {
    #[serde(default)]
    pub situation: String,
    pub line: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Static description of one character. Loaded once, never mutated while a
/// scene runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub id: PersonaId,
    pub name: String,
    pub first_person_form: String,
    #[serde(default)]
    pub sentence_ending_patterns: Vec<SpeechPattern>,
    #[serde(default)]
    pub speech_quirks: Vec<SpeechPattern>,
    #[serde(default)]
    pub conflict_axes: Vec<ConflictAxis>,
    /// Declaration order matters: it breaks ties between equally strong triggers.
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Target-language code → substitute devices.
    #[serde(default)]
    pub compensation_strategies: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    #[serde(default = "default_baseline")]
    pub baseline_intensity: f32,
    /// Modes beyond the universal catalog.
    #[serde(default)]
    pub modes: Vec<Mode>,
    #[serde(default)]
    pub emotion_states: Vec<EmotionState>,
    #[serde(default)]
    pub example_lines: Vec<ExampleLine>,
}

fn default_baseline() -> f32 {
    0.5
}

impl PersonaProfile {
    /// Parse a single persona from a RON string and validate it.
    pub fn parse_ron(input: &str) -> Result<PersonaProfile, ProfileError> {
        let profile: PersonaProfile = ron::from_str(input)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Reject profiles the engine cannot run with.
    pub fn validate(&self) -> Result<(), ProfileError> {
        let malformed = |reason: String| ProfileError::Malformed {
            persona: self.id.0.clone(),
            reason,
        };

        if self.id.0.trim().is_empty() {
            return Err(malformed("missing id".to_string()));
        }
        if self.first_person_form.trim().is_empty() {
            return Err(malformed("missing first_person_form".to_string()));
        }
        if !(0.0..=1.0).contains(&self.baseline_intensity) {
            return Err(malformed(format!(
                "baseline_intensity {} outside [0, 1]",
                self.baseline_intensity
            )));
        }
        for trigger in &self.triggers {
            if trigger.name.trim().is_empty() {
                return Err(malformed("trigger without a name".to_string()));
            }
            if trigger.patterns.iter().all(|p| p.trim().is_empty()) {
                return Err(malformed(format!(
                    "trigger '{}' has no patterns",
                    trigger.name
                )));
            }
            if !trigger.delta_intensity.is_finite() {
                return Err(malformed(format!(
                    "trigger '{}' has a non-finite delta_intensity",
                    trigger.name
                )));
            }
            if let Some(ref mode) = trigger.mode_shift {
                if !self.declares_mode(mode) {
                    return Err(malformed(format!(
                        "trigger '{}' shifts to undeclared mode '{}'",
                        trigger.name, mode
                    )));
                }
            }
        }
        Ok(())
    }

    /// `none`, the universal catalog, and anything listed in `modes`.
    pub fn declares_mode(&self, mode: &Mode) -> bool {
        mode.is_none()
            || Mode::UNIVERSAL.contains(&mode.as_str())
            || self.modes.iter().any(|m| m == mode)
    }

    /// Map a free-form label onto this persona's mode vocabulary.
    /// Returns `None` when the label is not declared.
    pub fn resolve_mode(&self, label: &str) -> Option<Mode> {
        let mode = Mode::new(label);
        self.declares_mode(&mode).then_some(mode)
    }

    pub fn compensation_for(&self, lang: &str) -> &[String] {
        self.compensation_strategies
            .get(lang)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Emotion state declared for a band, preferring one whose mode matches.
    pub fn emotion_state_for(&self, band: IntensityBand, mode: &Mode) -> Option<&EmotionState> {
        self.emotion_states
            .iter()
            .find(|s| s.band == band && &s.mode == mode)
            .or_else(|| self.emotion_states.iter().find(|s| s.band == band))
    }

    /// Heaviest conflict axis, named when extraction only reports faint
    /// activations.
    pub fn dominant_axis(&self) -> Option<&ConflictAxis> {
        self.conflict_axes
            .iter()
            .max_by(|a, b| a.weight.total_cmp(&b.weight))
    }
}
