use serde::{Deserialize, Serialize};
use std::fmt;

/// The dominant emotional strategy of a character at a given moment.
///
/// Modes are data-driven: personas may declare modes beyond the universal
/// catalog, so this is an open tag rather than a closed enum. `none` is the
/// universal fallback and is valid for every persona.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Mode(String);

impl Mode {
    pub const NONE: &'static str = "none";

    /// Modes every persona understands without declaring them.
    pub const UNIVERSAL: [&'static str; 6] = ["collapse", "rage", "numb", "plea", "shame", "leak"];

    /// Modes that floor the effective intensity used for banding.
    pub const HIGH_PRESSURE: [&'static str; 4] = ["collapse", "shame", "plea", "rage"];

    pub fn new(name: impl AsRef<str>) -> Self {
        let normalized = name.as_ref().trim().to_lowercase();
        if normalized.is_empty() || normalized == "stable" {
            Self::none()
        } else {
            Self(normalized)
        }
    }

    pub fn none() -> Self {
        Self(Self::NONE.to_string())
    }

    pub fn is_none(&self) -> bool {
        self.0 == Self::NONE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the tag string for this mode (e.g., "mode:leak").
    pub fn tag(&self) -> String {
        format!("mode:{}", self.0)
    }

    pub fn is_high_pressure(&self) -> bool {
        Self::HIGH_PRESSURE.contains(&self.0.as_str())
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Mode {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Mode {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.0
    }
}

/// Coarse narrative trajectory of a character within a scene.
///
/// Transitions are not monotonic; see `core::tracker::next_arc_phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcPhase {
    #[default]
    Stable,
    Rise,
    Bottom,
    Break,
    Recovery,
}

impl ArcPhase {
    /// Returns the tag string for this phase (e.g., "arc:bottom").
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Stable => "arc:stable",
            Self::Rise => "arc:rise",
            Self::Bottom => "arc:bottom",
            Self::Break => "arc:break",
            Self::Recovery => "arc:recovery",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Rise => "rise",
            Self::Bottom => "bottom",
            Self::Break => "break",
            Self::Recovery => "recovery",
        }
    }

    /// Lenient parse used on generator output. Unknown labels map to `Stable`.
    pub fn parse_lenient(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "rise" | "rising" => Self::Rise,
            "bottom" => Self::Bottom,
            "break" | "breakthrough" => Self::Break,
            "recovery" | "recovering" => Self::Recovery,
            _ => Self::Stable,
        }
    }
}

impl fmt::Display for ArcPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Three-level rendering of intensity used by prompts and emotion-state lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntensityBand {
    Low,
    Medium,
    High,
}

impl IntensityBand {
    pub const MEDIUM_FROM: f32 = 0.45;
    pub const HIGH_FROM: f32 = 0.75;
    /// Floor applied to the band (never to the stored intensity) under a high-pressure mode.
    pub const HIGH_PRESSURE_FLOOR: f32 = 0.7;

    pub fn from_intensity(intensity: f32) -> Self {
        if intensity >= Self::HIGH_FROM {
            Self::High
        } else if intensity >= Self::MEDIUM_FROM {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Band for an intensity under a given mode. High-pressure modes lift the
    /// effective value to the floor before banding, which lands in `medium`
    /// at the least and keeps such lines out of `low`.
    pub fn for_state(intensity: f32, mode: &Mode) -> Self {
        let effective = if mode.is_high_pressure() {
            intensity.max(Self::HIGH_PRESSURE_FLOOR)
        } else {
            intensity
        };
        Self::from_intensity(effective)
    }

    /// Read a generator label; anything but low/medium/high is `None`.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "mid" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Mutable per-character affective state. Owned exclusively by the tracker's
/// caller; every update goes through `core::tracker`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectiveState {
    pub intensity: f32,
    pub mode: Mode,
    pub arc_phase: ArcPhase,
    /// Intensity recorded at each of this character's turns, oldest first.
    #[serde(default)]
    pub history: Vec<f32>,
}

impl AffectiveState {
    pub fn from_baseline(baseline: f32) -> Self {
        Self {
            intensity: clamp_intensity(baseline),
            mode: Mode::none(),
            arc_phase: ArcPhase::Stable,
            history: Vec::new(),
        }
    }

    pub fn band(&self) -> IntensityBand {
        IntensityBand::for_state(self.intensity, &self.mode)
    }
}

impl Default for AffectiveState {
    fn default() -> Self {
        Self::from_baseline(0.5)
    }
}

/// Clamp an intensity into `[0.0, 1.0]`. NaN collapses to 0.0.
pub fn clamp_intensity(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
