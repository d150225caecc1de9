/// Judged ZAP: asks the generator whether a translation still sounds like the
/// persona, aspect by aspect. The lexical score in `zap` stays the
/// deterministic fallback when no judge is configured or the judge fails.
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::core::generation::{parse_json, GenerationError, ResilientGenerator, RetryError};
use crate::core::prompts;
use crate::schema::affect::{ArcPhase, IntensityBand, Mode};
use crate::schema::persona::PersonaProfile;
use crate::schema::record::{MarkerSet, ZLeakMarker, ZapJudgement};

#[derive(Debug, Error)]
pub enum ZapJudgeError {
    #[error("zap judgement failed: {0}")]
    Generation(#[from] RetryError),
}

/// What the judge is shown for one turn.
#[derive(Debug, Clone, Copy)]
pub struct JudgeInput<'a> {
    pub persona: &'a PersonaProfile,
    pub source_text: &'a str,
    pub translated_text: &'a str,
    pub target_lang: &'a str,
    pub context: &'a str,
    pub expected_mode: &'a Mode,
    pub expected_markers: &'a MarkerSet,
    pub expected_arc_phase: ArcPhase,
    /// Name of the persona's emotion state for the turn's band, if declared.
    pub emotion_state: Option<&'a str>,
}

#[async_trait]
pub trait ZapJudge: Send + Sync {
    async fn judge(&self, input: &JudgeInput<'_>) -> Result<ZapJudgement, ZapJudgeError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AspectReply {
    score: Option<f32>,
    original_level: String,
    translated_level: String,
    original_type: String,
    translated_type: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FidelityReply {
    score: Option<f32>,
    z_mode_detected: String,
    z_mode_appropriate: bool,
    z_leak_markers_found: Vec<String>,
    z_leak_appropriate: bool,
    arc_phase_appropriate: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JudgementReply {
    overall_score: Option<f32>,
    character_voice: AspectReply,
    emotional_intensity: AspectReply,
    listener_relationship: AspectReply,
    speech_pattern: AspectReply,
    z_axis_fidelity: FidelityReply,
    critical_issues: Vec<String>,
    summary: String,
}

/// Missing aspect scores take the overall; a missing overall is the mean of
/// the aspects given. A reply with no score at all is retried.
fn parse_judgement(text: &str) -> Result<ZapJudgement, GenerationError> {
    let reply: JudgementReply = parse_json(text)?;
    let aspects = [
        reply.character_voice.score,
        reply.emotional_intensity.score,
        reply.listener_relationship.score,
        reply.speech_pattern.score,
        reply.z_axis_fidelity.score,
    ];
    let given: Vec<f32> = aspects.iter().flatten().map(|s| s.clamp(0.0, 1.0)).collect();
    let overall = match reply.overall_score {
        Some(score) => score.clamp(0.0, 1.0),
        None if !given.is_empty() => given.iter().sum::<f32>() / given.len() as f32,
        None => {
            return Err(GenerationError::Transient(
                "judgement carries no scores".to_string(),
            ))
        }
    };
    let score = |s: Option<f32>| s.map_or(overall, |s| s.clamp(0.0, 1.0));

    let fidelity = reply.z_axis_fidelity;
    Ok(ZapJudgement {
        overall,
        character_voice: score(reply.character_voice.score),
        emotional_intensity: score(reply.emotional_intensity.score),
        original_level: IntensityBand::parse(&reply.emotional_intensity.original_level),
        translated_level: IntensityBand::parse(&reply.emotional_intensity.translated_level),
        listener_relationship: score(reply.listener_relationship.score),
        original_address: reply.listener_relationship.original_type.trim().to_lowercase(),
        translated_address: reply.listener_relationship.translated_type.trim().to_lowercase(),
        speech_pattern: score(reply.speech_pattern.score),
        z_axis_fidelity: score(fidelity.score),
        mode_detected: Mode::new(&fidelity.z_mode_detected),
        mode_appropriate: fidelity.z_mode_appropriate,
        markers_found: fidelity
            .z_leak_markers_found
            .iter()
            .filter_map(|m| ZLeakMarker::parse(m))
            .collect(),
        markers_appropriate: fidelity.z_leak_appropriate,
        arc_phase_appropriate: fidelity.arc_phase_appropriate,
        critical_issues: reply
            .critical_issues
            .into_iter()
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty())
            .collect(),
        summary: reply.summary.trim().to_string(),
    })
}

/// Judges through the shared generator, with its timeout and retry.
pub struct GeneratorZapJudge {
    generator: ResilientGenerator,
    temperature: f32,
}

impl GeneratorZapJudge {
    pub fn new(generator: ResilientGenerator, temperature: f32) -> Self {
        Self {
            generator,
            temperature,
        }
    }
}

#[async_trait]
impl ZapJudge for GeneratorZapJudge {
    async fn judge(&self, input: &JudgeInput<'_>) -> Result<ZapJudgement, ZapJudgeError> {
        let request = prompts::zap_judge_request(input, self.temperature);
        let judgement = self
            .generator
            .generate_with(&request, parse_judgement)
            .await?;
        tracing::debug!(
            overall = judgement.overall,
            mode = %judgement.mode_detected,
            issues = judgement.critical_issues.len(),
            "zap judged"
        );
        Ok(judgement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generation::{
        FnGenerator, GenerationOutput, GenerationRequest, GenerationTask, RetryPolicy,
    };
    use std::sync::Arc;

    const FULL_REPLY: &str = r#"{
        "overall_score": 0.62,
        "character_voice": {"score": 0.8, "preserved": true, "comment": "in character"},
        "emotional_intensity": {"score": 0.4, "preserved": false,
            "original_level": "high", "translated_level": "medium", "comment": "cooler"},
        "listener_relationship": {"score": 0.3, "preserved": false,
            "original_type": "direct_address", "translated_type": "third_person", "comment": ""},
        "speech_pattern": {"score": 0.7, "preserved": true, "comment": ""},
        "z_axis_fidelity": {"score": 0.9, "z_mode_appropriate": true, "z_mode_detected": "leak",
            "z_leak_markers_found": ["ellipsis", "trailing", "none"], "z_leak_appropriate": true,
            "arc_phase_appropriate": false, "comment": ""},
        "critical_issues": ["Third-person narration replacing direct confession", " "],
        "summary": "voice kept, intimacy lost"
    }"#;

    fn make_persona() -> PersonaProfile {
        PersonaProfile::parse_ron(
            r#"(id: "rem", name: "Rem", first_person_form: "レム", modes: ["devotion"])"#,
        )
        .unwrap()
    }

    #[test]
    fn full_reply_fills_every_aspect() {
        let j = parse_judgement(FULL_REPLY).unwrap();
        assert!((j.overall - 0.62).abs() < 1e-6);
        assert_eq!(j.listener_relationship, 0.3);
        assert_eq!(j.original_level, Some(IntensityBand::High));
        assert_eq!(j.translated_level, Some(IntensityBand::Medium));
        assert!(j.is_flattened());
        assert_eq!(j.original_address, "direct_address");
        assert_eq!(j.mode_detected, Mode::new("leak"));
        assert_eq!(j.markers_found.names(), vec!["ellipsis", "trailing"]);
        assert!(!j.arc_phase_appropriate);
        assert_eq!(j.critical_issues.len(), 1);
    }

    #[test]
    fn partial_reply_fills_from_what_is_given() {
        let j = parse_judgement(
            r#"{"character_voice": {"score": 0.6}, "speech_pattern": {"score": 1.4}}"#,
        )
        .unwrap();
        assert!((j.overall - 0.8).abs() < 1e-6);
        assert_eq!(j.speech_pattern, 1.0);
        assert!((j.z_axis_fidelity - 0.8).abs() < 1e-6);
        assert!(j.mode_detected.is_none());
        assert!(!j.is_flattened());
    }

    #[test]
    fn reply_without_scores_is_rejected() {
        assert!(parse_judgement(r#"{"translation": "Fine."}"#).is_err());
    }

    #[tokio::test]
    async fn judge_sends_expectations_and_parses_reply() {
        let generator = FnGenerator::new(|req: &GenerationRequest| {
            assert_eq!(req.task, GenerationTask::ZapJudgement);
            assert_eq!(req.temperature, 0.0);
            assert!(req.user.contains("[Expected Mode] leak"));
            assert!(req.user.contains("[Expected Z-Leak] ellipsis, trailing"));
            assert!(req.user.contains("[Expected Arc Phase] break"));
            assert!(req.user.contains("Rem loves Subaru-kun…"));
            Ok(GenerationOutput::new(FULL_REPLY))
        });
        let policy = RetryPolicy {
            max_attempts: 1,
            timeout_ms: 1_000,
            ..Default::default()
        };
        let judge = GeneratorZapJudge::new(
            ResilientGenerator::new(Arc::new(generator), policy),
            0.0,
        );
        let persona = make_persona();
        let mode = Mode::new("leak");
        let markers: MarkerSet = [ZLeakMarker::Ellipsis, ZLeakMarker::Trailing]
            .into_iter()
            .collect();
        let input = JudgeInput {
            persona: &persona,
            source_text: "レムは、スバルくんが…",
            translated_text: "Rem loves Subaru-kun…",
            target_lang: "en",
            context: "",
            expected_mode: &mode,
            expected_markers: &markers,
            expected_arc_phase: ArcPhase::Break,
            emotion_state: None,
        };
        let j = judge.judge(&input).await.unwrap();
        assert!((j.overall - 0.62).abs() < 1e-6);
    }
}
