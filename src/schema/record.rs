use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::affect::{AffectiveState, ArcPhase, IntensityBand, Mode};
use super::persona::SpeakerId;

/// A surface tell of suppressed emotion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZLeakMarker {
    Stutter,
    Ellipsis,
    Repetition,
    NegationFirst,
    Overwrite,
    Trailing,
    SelfNegation,
    AbsoluteQuantifier,
    Custom(String),
}

impl ZLeakMarker {
    pub const BUILTIN: [ZLeakMarker; 8] = [
        Self::Stutter,
        Self::Ellipsis,
        Self::Repetition,
        Self::NegationFirst,
        Self::Overwrite,
        Self::Trailing,
        Self::SelfNegation,
        Self::AbsoluteQuantifier,
    ];

    /// Lenient parse of a generator label. Unknown non-empty labels become `Custom`.
    pub fn parse(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase().replace(|c: char| c == ' ' || c == '-', "_");
        let marker = match normalized.as_str() {
            "" | "none" => return None,
            "stutter" => Self::Stutter,
            "ellipsis" => Self::Ellipsis,
            "repetition" | "repeat" => Self::Repetition,
            "negation_first" => Self::NegationFirst,
            "overwrite" => Self::Overwrite,
            "trailing" => Self::Trailing,
            "self_negation" => Self::SelfNegation,
            "absolute_quantifier" => Self::AbsoluteQuantifier,
            other => Self::Custom(other.to_string()),
        };
        Some(marker)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Stutter => "stutter",
            Self::Ellipsis => "ellipsis",
            Self::Repetition => "repetition",
            Self::NegationFirst => "negation_first",
            Self::Overwrite => "overwrite",
            Self::Trailing => "trailing",
            Self::SelfNegation => "self_negation",
            Self::AbsoluteQuantifier => "absolute_quantifier",
            Self::Custom(name) => name,
        }
    }

    /// How much losing (or inventing) this marker costs in ZAP scoring.
    pub fn salience(&self) -> f32 {
        match self {
            Self::SelfNegation => 1.0,
            Self::Overwrite => 0.9,
            Self::Stutter | Self::Repetition | Self::NegationFirst => 0.8,
            Self::AbsoluteQuantifier => 0.7,
            Self::Ellipsis | Self::Trailing => 0.5,
            Self::Custom(_) => 0.6,
        }
    }
}

impl fmt::Display for ZLeakMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Insertion-ordered set of markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerSet(Vec<ZLeakMarker>);

impl MarkerSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns false when the marker was already present.
    pub fn insert(&mut self, marker: ZLeakMarker) -> bool {
        if self.0.contains(&marker) {
            return false;
        }
        self.0.push(marker);
        true
    }

    pub fn contains(&self, marker: &ZLeakMarker) -> bool {
        self.0.contains(marker)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ZLeakMarker> {
        self.0.iter()
    }

    pub fn total_salience(&self) -> f32 {
        self.0.iter().map(ZLeakMarker::salience).sum()
    }

    /// Markers in `self` that `other` lacks, in `self`'s order.
    pub fn difference<'a>(&'a self, other: &'a MarkerSet) -> impl Iterator<Item = &'a ZLeakMarker> {
        self.0.iter().filter(move |m| !other.contains(m))
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|m| m.name().to_string()).collect()
    }
}

impl FromIterator<ZLeakMarker> for MarkerSet {
    fn from_iter<I: IntoIterator<Item = ZLeakMarker>>(iter: I) -> Self {
        let mut set = MarkerSet::new();
        for marker in iter {
            set.insert(marker);
        }
        set
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    ConflictExtraction,
    InterferenceAnalysis,
    Generation,
    /// Reading a finished translation back; not part of a turn.
    ReverseAnalysis,
}

impl PipelineStage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConflictExtraction => "conflict_extraction",
            Self::InterferenceAnalysis => "interference_analysis",
            Self::Generation => "generation",
            Self::ReverseAnalysis => "reverse_analysis",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Audit marker for a non-fatal event during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnWarning {
    /// Several fired triggers shared the strongest |Δ|; the earliest declared won.
    AmbiguousTriggerMatch { chosen: String, tied: Vec<String> },
    /// Interference analysis found no markers.
    DegenerateExtraction,
    StageFallback { stage: PipelineStage, reason: String },
    /// A generator-reported mode that the persona does not declare.
    UndeclaredMode { label: String },
    EvaluatorFailed { evaluator: String, reason: String },
    Untranslated { reason: String },
    /// Inbound triggers consumed at this turn.
    TriggersFired { names: Vec<String> },
}

impl TurnWarning {
    /// Short machine-readable label (e.g., "warn:stage_fallback").
    pub fn tag(&self) -> &'static str {
        match self {
            Self::AmbiguousTriggerMatch { .. } => "warn:ambiguous_trigger_match",
            Self::DegenerateExtraction => "warn:degenerate_extraction",
            Self::StageFallback { .. } => "warn:stage_fallback",
            Self::UndeclaredMode { .. } => "warn:undeclared_mode",
            Self::EvaluatorFailed { .. } => "warn:evaluator_failed",
            Self::Untranslated { .. } => "warn:untranslated",
            Self::TriggersFired { .. } => "audit:triggers_fired",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorScores {
    /// `None` when the evaluator failed; see the turn's warnings.
    pub iap: Option<f32>,
    pub zap: Option<f32>,
    #[serde(default)]
    pub iap_markers: Vec<String>,
    #[serde(default)]
    pub zap_markers: Vec<String>,
    /// Present when a judge scored the turn; `zap` then carries its overall.
    #[serde(default)]
    pub zap_judgement: Option<ZapJudgement>,
}

/// A persona-aware reading of how well a translation keeps the character
/// alive: voice, emotional level, who is being addressed, speech habits, and
/// the z-axis itself. Scores are in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZapJudgement {
    pub overall: f32,
    pub character_voice: f32,
    pub emotional_intensity: f32,
    pub original_level: Option<IntensityBand>,
    pub translated_level: Option<IntensityBand>,
    pub listener_relationship: f32,
    /// e.g. "direct_address" vs "third_person".
    pub original_address: String,
    pub translated_address: String,
    pub speech_pattern: f32,
    pub z_axis_fidelity: f32,
    pub mode_detected: Mode,
    pub mode_appropriate: bool,
    pub markers_found: MarkerSet,
    pub markers_appropriate: bool,
    pub arc_phase_appropriate: bool,
    #[serde(default)]
    pub critical_issues: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

impl ZapJudgement {
    /// Emotional level dropped between source and translation.
    pub fn is_flattened(&self) -> bool {
        matches!(
            (self.original_level, self.translated_level),
            (Some(original), Some(translated)) if translated < original
        )
    }
}

/// One processed line. Never modified after it is appended to a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub index: usize,
    pub speaker_id: SpeakerId,
    pub listener_id: Option<SpeakerId>,
    pub source_text: String,
    pub predicted_intensity: f32,
    pub predicted_mode: Mode,
    pub observed_mode: Mode,
    pub arc_phase: ArcPhase,
    pub conflict_axis: Option<String>,
    pub z_leak_markers: MarkerSet,
    pub translated_text: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    pub evaluator_scores: EvaluatorScores,
    #[serde(default)]
    pub warnings: Vec<TurnWarning>,
}

impl TurnRecord {
    pub fn has_warning(&self, tag: &str) -> bool {
        self.warnings.iter().any(|w| w.tag() == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneReport {
    pub scene_id: String,
    pub source_lang: String,
    pub target_lang: String,
    pub turns: Vec<TurnRecord>,
    pub final_states: BTreeMap<SpeakerId, AffectiveState>,
}

impl SceneReport {
    pub fn mean_iap(&self) -> Option<f32> {
        mean(self.turns.iter().filter_map(|t| t.evaluator_scores.iap))
    }

    pub fn mean_zap(&self) -> Option<f32> {
        mean(self.turns.iter().filter_map(|t| t.evaluator_scores.zap))
    }

    pub fn warning_count(&self) -> usize {
        self.turns.iter().map(|t| t.warnings.len()).sum()
    }
}

fn mean(values: impl Iterator<Item = f32>) -> Option<f32> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_parse_is_lenient() {
        assert_eq!(ZLeakMarker::parse("Negation-First"), Some(ZLeakMarker::NegationFirst));
        assert_eq!(ZLeakMarker::parse("self negation"), Some(ZLeakMarker::SelfNegation));
        assert_eq!(ZLeakMarker::parse("none"), None);
        assert_eq!(
            ZLeakMarker::parse("sigh"),
            Some(ZLeakMarker::Custom("sigh".to_string()))
        );
    }

    #[test]
    fn marker_set_keeps_insertion_order_without_duplicates() {
        let set: MarkerSet = [
            ZLeakMarker::Ellipsis,
            ZLeakMarker::Stutter,
            ZLeakMarker::Ellipsis,
        ]
        .into_iter()
        .collect();
        assert_eq!(set.names(), vec!["ellipsis", "stutter"]);
        assert!((set.total_salience() - 1.3).abs() < 1e-6);
    }

    #[test]
    fn marker_set_difference() {
        let a: MarkerSet = [ZLeakMarker::Stutter, ZLeakMarker::Trailing].into_iter().collect();
        let b: MarkerSet = [ZLeakMarker::Trailing].into_iter().collect();
        let diff: Vec<_> = a.difference(&b).collect();
        assert_eq!(diff, vec![&ZLeakMarker::Stutter]);
    }

    #[test]
    fn custom_marker_ron_form() {
        let m: ZLeakMarker = ron::from_str("custom(\"sigh\")").unwrap();
        assert_eq!(m, ZLeakMarker::Custom("sigh".to_string()));
        let m: ZLeakMarker = ron::from_str("self_negation").unwrap();
        assert_eq!(m, ZLeakMarker::SelfNegation);
    }

    #[test]
    fn report_means_skip_missing_scores() {
        let mut record = TurnRecord {
            index: 0,
            speaker_id: SpeakerId::from("A"),
            listener_id: None,
            source_text: "…".to_string(),
            predicted_intensity: 0.5,
            predicted_mode: Mode::none(),
            observed_mode: Mode::none(),
            arc_phase: ArcPhase::Stable,
            conflict_axis: None,
            z_leak_markers: MarkerSet::new(),
            translated_text: "...".to_string(),
            notes: String::new(),
            alternatives: Vec::new(),
            evaluator_scores: EvaluatorScores {
                iap: Some(0.8),
                zap: None,
                ..Default::default()
            },
            warnings: vec![TurnWarning::EvaluatorFailed {
                evaluator: "zap".to_string(),
                reason: "boom".to_string(),
            }],
        };
        let second = {
            record.index = 1;
            record.evaluator_scores.iap = Some(0.4);
            record.clone()
        };
        record.index = 0;
        record.evaluator_scores.iap = Some(0.8);
        let report = SceneReport {
            scene_id: "s".to_string(),
            source_lang: "ja".to_string(),
            target_lang: "en".to_string(),
            turns: vec![record, second],
            final_states: BTreeMap::new(),
        };
        assert!((report.mean_iap().unwrap() - 0.6).abs() < 1e-6);
        assert!(report.mean_zap().is_none());
        assert_eq!(report.warning_count(), 2);
        assert!(report.turns[0].has_warning("warn:evaluator_failed"));
    }
}
