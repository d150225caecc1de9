/// The turn pipeline: conflict extraction → interference analysis →
/// action-preserving generation.
///
/// Stages run strictly in order. Only fatal generation errors escape
/// `TurnPipeline::run`; everything else degrades to a documented fallback
/// and leaves a warning behind.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::config::StageTemperatures;
use crate::core::generation::{parse_json, GenerationError, ResilientGenerator, RetryError};
use crate::core::prompts;
use crate::core::lexicon::detect_markers;
use crate::schema::affect::{AffectiveState, ArcPhase, IntensityBand, Mode};
use crate::schema::persona::PersonaProfile;
use crate::schema::record::{MarkerSet, PipelineStage, TurnWarning, ZLeakMarker};
use crate::schema::scene::Relationship;

/// Activation below this does not make an axis the active one.
pub const MIN_AXIS_ACTIVATION: f32 = 0.15;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} failed after {attempts} attempts: {last}")]
    StageFailed {
        stage: PipelineStage,
        attempts: u32,
        last: GenerationError,
    },
    #[error("{stage} hit a fatal generation error: {source}")]
    Fatal {
        stage: PipelineStage,
        source: GenerationError,
    },
}

impl PipelineError {
    fn from_retry(stage: PipelineStage, err: RetryError) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => Self::StageFailed {
                stage,
                attempts,
                last,
            },
            RetryError::Fatal(source) => Self::Fatal { stage, source },
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerType {
    #[default]
    OtherSpecific,
    OtherGeneral,
    #[serde(rename = "self")]
    SelfDirected,
    Absent,
}

impl ListenerType {
    pub fn parse_lenient(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "other_general" => Self::OtherGeneral,
            "self" | "monologue" => Self::SelfDirected,
            "absent" => Self::Absent,
            _ => Self::OtherSpecific,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OtherSpecific => "other_specific",
            Self::OtherGeneral => "other_general",
            Self::SelfDirected => "self",
            Self::Absent => "absent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegationType {
    Concealment,
    Declaration,
    Rationalization,
    #[default]
    None,
}

impl NegationType {
    pub fn parse_lenient(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "concealment" => Self::Concealment,
            "declaration" => Self::Declaration,
            "rationalization" => Self::Rationalization,
            _ => Self::None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Concealment => "concealment",
            Self::Declaration => "declaration",
            Self::Rationalization => "rationalization",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interference {
    Constructive,
    Destructive,
    #[default]
    Mixed,
}

impl Interference {
    pub fn parse_lenient(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "constructive" => Self::Constructive,
            "destructive" => Self::Destructive,
            _ => Self::Mixed,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Constructive => "constructive",
            Self::Destructive => "destructive",
            Self::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerPosition {
    Start,
    #[default]
    Middle,
    End,
}

impl MarkerPosition {
    pub fn parse_lenient(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "start" | "beginning" => Self::Start,
            "end" => Self::End,
            _ => Self::Middle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivatedConflict {
    pub axis: String,
    pub side_a: String,
    pub side_b: String,
    pub activation: f32,
}

/// Stage 1 output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictExtraction {
    pub activated_conflicts: Vec<ActivatedConflict>,
    pub active_axis: Option<String>,
    pub mode: Mode,
    pub intensity: f32,
    pub listener_type: ListenerType,
    pub summary: String,
    /// Label the generator reported that the persona does not declare.
    pub undeclared_mode: Option<String>,
}

impl ConflictExtraction {
    /// The "no conflict" result. Observes no mode; intensity stays at the
    /// tracked value.
    pub fn none(state: &AffectiveState) -> Self {
        Self {
            activated_conflicts: Vec::new(),
            active_axis: None,
            mode: Mode::none(),
            intensity: state.intensity,
            listener_type: ListenerType::default(),
            summary: String::new(),
            undeclared_mode: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionedMarker {
    pub marker: ZLeakMarker,
    pub position: MarkerPosition,
}

/// Stage 2 output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InterferenceAnalysis {
    pub markers: Vec<PositionedMarker>,
    pub negation_type: NegationType,
    pub interference: Interference,
    pub self_directed_rebinding: bool,
    pub summary: String,
}

impl InterferenceAnalysis {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn marker_set(&self) -> MarkerSet {
        self.markers.iter().map(|m| m.marker.clone()).collect()
    }

    pub fn is_degenerate(&self) -> bool {
        self.markers.is_empty()
    }
}

/// Stage 3 output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TranslationOutput {
    pub translation: String,
    pub notes: String,
    pub alternatives: Vec<String>,
}

/// Everything a stage may look at for one turn.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub persona: &'a PersonaProfile,
    pub state: &'a AffectiveState,
    pub source_text: &'a str,
    pub source_lang: &'a str,
    pub target_lang: &'a str,
    pub setting: &'a str,
    pub relationship: Option<&'a Relationship>,
    pub context_block: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub conflict: ConflictExtraction,
    pub interference: InterferenceAnalysis,
    pub translation: TranslationOutput,
    pub warnings: Vec<TurnWarning>,
}

/// What a line means to say, what it holds back, and how the two meet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Wave {
    pub true_intent: String,
    pub suppressed: String,
    pub interference: Interference,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InferredConflict {
    pub conflict: ActivatedConflict,
    /// The side currently prevailing, as the generator named it.
    pub winning: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersonaHints {
    pub expression_pattern: String,
    pub default_mode: Mode,
    pub weaknesses: Vec<String>,
}

/// A finished translation read back into the structure that would have
/// produced it. Useful for auditing output from other translators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseAnalysis {
    /// Markers the generator named, then any more the lexicon finds.
    pub markers: MarkerSet,
    pub intensity: Option<IntensityBand>,
    pub wave: Wave,
    /// Strongest first.
    pub conflicts: Vec<InferredConflict>,
    pub arc_phase: ArcPhase,
    pub persona_hints: PersonaHints,
    pub act: String,
}

// Generator reply shapes. Every field is optional on the wire.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConflictReply {
    activated_conflicts: Vec<ActivatedConflict>,
    mode: String,
    intensity: Option<f32>,
    listener_type: String,
    summary: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MarkerReply {
    marker: String,
    position: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InterferenceReply {
    z_leak: Vec<MarkerReply>,
    negation_type: String,
    interference: String,
    self_directed_rebinding: bool,
    summary: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TranslationReply {
    translation: String,
    notes: String,
    alternatives: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WaveReply {
    true_intent: String,
    suppressed: String,
    interference: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InferredConflictReply {
    axis: String,
    side_a: String,
    side_b: String,
    activation: f32,
    winning: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PersonaHintsReply {
    expression_pattern: String,
    default_mode: String,
    weaknesses: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReverseReply {
    z_leak: Vec<String>,
    intensity: String,
    wave: WaveReply,
    conflicts: Vec<InferredConflictReply>,
    arc_phase: String,
    persona_hints: PersonaHintsReply,
    act: String,
}

pub struct TurnPipeline {
    generator: ResilientGenerator,
    temperatures: StageTemperatures,
}

impl TurnPipeline {
    pub fn new(generator: ResilientGenerator, temperatures: StageTemperatures) -> Self {
        Self {
            generator,
            temperatures,
        }
    }

    /// Stage 1.
    pub async fn extract_conflicts(
        &self,
        ctx: &StageContext<'_>,
    ) -> Result<ConflictExtraction, PipelineError> {
        let request = prompts::conflict_request(ctx, self.temperatures.conflict);
        let reply: ConflictReply = self
            .generator
            .generate_with(&request, parse_json)
            .await
            .map_err(|e| PipelineError::from_retry(PipelineStage::ConflictExtraction, e))?;
        Ok(normalize_conflict(reply, ctx))
    }

    /// Stage 2.
    pub async fn analyze_interference(
        &self,
        ctx: &StageContext<'_>,
        conflict: &ConflictExtraction,
    ) -> Result<InterferenceAnalysis, PipelineError> {
        let request = prompts::interference_request(ctx, conflict, self.temperatures.interference);
        let reply: InterferenceReply = self
            .generator
            .generate_with(&request, parse_json)
            .await
            .map_err(|e| PipelineError::from_retry(PipelineStage::InterferenceAnalysis, e))?;
        Ok(InterferenceAnalysis {
            markers: reply
                .z_leak
                .iter()
                .filter_map(|m| {
                    ZLeakMarker::parse(&m.marker).map(|marker| PositionedMarker {
                        marker,
                        position: MarkerPosition::parse_lenient(&m.position),
                    })
                })
                .collect(),
            negation_type: NegationType::parse_lenient(&reply.negation_type),
            interference: Interference::parse_lenient(&reply.interference),
            self_directed_rebinding: reply.self_directed_rebinding,
            summary: reply.summary,
        })
    }

    /// Stage 3. An empty translation counts as a failed attempt.
    pub async fn generate(
        &self,
        ctx: &StageContext<'_>,
        conflict: &ConflictExtraction,
        interference: &InterferenceAnalysis,
    ) -> Result<TranslationOutput, PipelineError> {
        let request =
            prompts::translation_request(ctx, conflict, interference, self.temperatures.generation);
        self.translate(&request).await
    }

    /// The fallback: a plain, unmarked, meaning-preserving translation.
    pub async fn flat_translate(
        &self,
        ctx: &StageContext<'_>,
    ) -> Result<TranslationOutput, PipelineError> {
        let request = prompts::flat_translation_request(ctx, self.temperatures.generation);
        self.translate(&request).await
    }

    async fn translate(
        &self,
        request: &crate::core::generation::GenerationRequest,
    ) -> Result<TranslationOutput, PipelineError> {
        self.generator
            .generate_with(request, parse_translation)
            .await
            .map_err(|e| PipelineError::from_retry(PipelineStage::Generation, e))
    }

    /// Reverse analysis of a finished line in `lang`. Runs outside any turn
    /// and never touches tracked state.
    pub async fn reverse_analyze(
        &self,
        text: &str,
        lang: &str,
        context: Option<&str>,
    ) -> Result<ReverseAnalysis, PipelineError> {
        let request =
            prompts::reverse_analysis_request(text, lang, context, self.temperatures.interference);
        let reply: ReverseReply = self
            .generator
            .generate_with(&request, parse_json)
            .await
            .map_err(|e| PipelineError::from_retry(PipelineStage::ReverseAnalysis, e))?;
        Ok(normalize_reverse(reply, text))
    }

    /// Run all three stages with fallbacks. Errors only on a fatal
    /// generation failure.
    pub async fn run(&self, ctx: &StageContext<'_>) -> Result<PipelineOutcome, PipelineError> {
        let mut warnings = Vec::new();

        let conflict = match self.extract_conflicts(ctx).await {
            Ok(conflict) => conflict,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "conflict extraction failed, using none");
                warnings.push(stage_fallback(PipelineStage::ConflictExtraction, &err));
                ConflictExtraction::none(ctx.state)
            }
        };
        if let Some(ref label) = conflict.undeclared_mode {
            warnings.push(TurnWarning::UndeclaredMode {
                label: label.clone(),
            });
        }
        tracing::debug!(
            axis = conflict.active_axis.as_deref().unwrap_or("none"),
            mode = %conflict.mode,
            listener = conflict.listener_type.name(),
            "stage 1 complete"
        );

        let interference = match self.analyze_interference(ctx, &conflict).await {
            Ok(analysis) => analysis,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "interference analysis failed, using none");
                warnings.push(stage_fallback(PipelineStage::InterferenceAnalysis, &err));
                InterferenceAnalysis::none()
            }
        };
        if interference.is_degenerate() {
            warnings.push(TurnWarning::DegenerateExtraction);
        }
        tracing::debug!(
            markers = ?interference.marker_set().names(),
            negation = interference.negation_type.name(),
            interference = interference.interference.name(),
            "stage 2 complete"
        );

        let translation = match self.generate(ctx, &conflict, &interference).await {
            Ok(output) => output,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "generation failed, retrying as flat translation");
                warnings.push(stage_fallback(PipelineStage::Generation, &err));
                match self.flat_translate(ctx).await {
                    Ok(output) => output,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        tracing::warn!(error = %err, "flat translation failed, keeping source text");
                        warnings.push(TurnWarning::Untranslated {
                            reason: err.to_string(),
                        });
                        TranslationOutput {
                            translation: ctx.source_text.to_string(),
                            ..Default::default()
                        }
                    }
                }
            }
        };

        Ok(PipelineOutcome {
            conflict,
            interference,
            translation,
            warnings,
        })
    }
}

fn stage_fallback(stage: PipelineStage, err: &PipelineError) -> TurnWarning {
    TurnWarning::StageFallback {
        stage,
        reason: err.to_string(),
    }
}

fn parse_translation(text: &str) -> Result<TranslationOutput, GenerationError> {
    let reply: TranslationReply = parse_json(text)?;
    let translation = reply.translation.trim().to_string();
    if translation.is_empty() {
        return Err(GenerationError::Transient("empty translation".to_string()));
    }
    let mut alternatives: Vec<String> = reply
        .alternatives
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();
    alternatives.truncate(2);
    Ok(TranslationOutput {
        translation,
        notes: reply.notes.trim().to_string(),
        alternatives,
    })
}

fn normalize_conflict(reply: ConflictReply, ctx: &StageContext<'_>) -> ConflictExtraction {
    let mut activated: Vec<ActivatedConflict> = reply
        .activated_conflicts
        .into_iter()
        .filter(|c| !c.axis.trim().is_empty())
        .map(|mut c| {
            c.activation = c.activation.clamp(0.0, 1.0);
            c
        })
        .collect();
    activated.sort_by(|a, b| b.activation.total_cmp(&a.activation));
    let active_axis = activated
        .first()
        .filter(|c| c.activation >= MIN_AXIS_ACTIVATION)
        .map(|c| c.axis.clone())
        .or_else(|| {
            // conflict reported, but too faint to name one
            if activated.is_empty() {
                None
            } else {
                ctx.persona.dominant_axis().map(|a| a.axis.clone())
            }
        });

    let (mode, undeclared_mode) = if reply.mode.trim().is_empty() {
        (Mode::none(), None)
    } else {
        match ctx.persona.resolve_mode(&reply.mode) {
            Some(mode) => (mode, None),
            None => (Mode::none(), Some(reply.mode.trim().to_string())),
        }
    };

    ConflictExtraction {
        activated_conflicts: activated,
        active_axis,
        mode,
        intensity: reply
            .intensity
            .map(crate::schema::affect::clamp_intensity)
            .unwrap_or(ctx.state.intensity),
        listener_type: ListenerType::parse_lenient(&reply.listener_type),
        summary: reply.summary,
        undeclared_mode,
    }
}

fn normalize_reverse(reply: ReverseReply, text: &str) -> ReverseAnalysis {
    let mut markers: MarkerSet = reply
        .z_leak
        .iter()
        .filter_map(|m| ZLeakMarker::parse(m))
        .collect();
    for marker in detect_markers(text).iter() {
        markers.insert(marker.clone());
    }

    let mut conflicts: Vec<InferredConflict> = reply
        .conflicts
        .into_iter()
        .filter(|c| !c.axis.trim().is_empty())
        .map(|c| InferredConflict {
            conflict: ActivatedConflict {
                axis: c.axis.trim().to_string(),
                side_a: c.side_a,
                side_b: c.side_b,
                activation: c.activation.clamp(0.0, 1.0),
            },
            winning: c.winning.trim().to_string(),
        })
        .collect();
    conflicts.sort_by(|a, b| b.conflict.activation.total_cmp(&a.conflict.activation));

    ReverseAnalysis {
        markers,
        intensity: IntensityBand::parse(&reply.intensity),
        wave: Wave {
            true_intent: reply.wave.true_intent.trim().to_string(),
            suppressed: reply.wave.suppressed.trim().to_string(),
            interference: Interference::parse_lenient(&reply.wave.interference),
        },
        conflicts,
        arc_phase: ArcPhase::parse_lenient(&reply.arc_phase),
        persona_hints: PersonaHints {
            expression_pattern: reply.persona_hints.expression_pattern.trim().to_string(),
            default_mode: Mode::new(&reply.persona_hints.default_mode),
            weaknesses: reply.persona_hints.weaknesses,
        },
        act: reply.act.trim().to_string(),
    }
}
