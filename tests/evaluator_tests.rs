/// Evaluator integration tests: IAP over extracted acts, ZAP against the
/// fixture personas, and generator-backed extraction inside a scene.

use dialogue_engine::core::acts::{ActType, AddressMode, LexicalActExtractor};
use dialogue_engine::core::config::{ActExtraction, EngineConfig, ZapEvaluation};
use dialogue_engine::core::generation::{GenerationOutput, GenerationRequest, GenerationTask};
use dialogue_engine::core::iap::{score_acts, IapScore};
use dialogue_engine::core::zap::score_zap;
use dialogue_engine::schema::affect::{ArcPhase, IntensityBand};
use dialogue_engine::schema::persona::{PersonaId, PersonaProfile};
use dialogue_engine::schema::record::{MarkerSet, TurnWarning, ZLeakMarker};
use dialogue_engine::{
    DialogueEngine, FnGenerator, GenerationError, PersonaRegistry, SceneDefinition,
};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn iap(original: &str, translated: &str) -> IapScore {
    let extractor = LexicalActExtractor;
    score_acts(&extractor.extract_sync(original), &extractor.extract_sync(translated))
}

fn load_personas() -> PersonaRegistry {
    let mut registry = PersonaRegistry::new();
    registry.load_dir(Path::new("tests/fixtures/personas")).unwrap();
    registry
}

fn rem(registry: &PersonaRegistry) -> &PersonaProfile {
    registry.get(&PersonaId::from("rem")).unwrap()
}

#[test]
fn reported_confession_scores_below_direct_address() {
    let original = "I love you, Subaru-kun. It has to be you.";
    let direct = iap(original, "Subaru-kun, I love you. It has to be you.");
    let reported = iap(original, "Rem loves Subaru-kun. It has to be him.");

    assert!((direct.overall - 1.0).abs() < 1e-5);
    assert!(direct.markers.is_empty());

    // same acts, wrong addressee
    assert_eq!(reported.set, 1.0);
    assert!(reported.overall < direct.overall);
    assert_eq!(reported.address_penalty, 0.35);
    assert!(reported
        .markers
        .contains(&"address:direct->reported".to_string()));
}

#[test]
fn dropped_refusal_is_a_critical_loss() {
    let original = "I won't accept anyone else.";
    let faithful = iap(original, "I won't accept anyone else.");
    let softened = iap(original, "Someone else is fine.");

    assert!((faithful.overall - 1.0).abs() < 1e-5);
    assert!(softened.critical_loss_penalty > 0.0);
    assert!(softened.lost.iter().any(ActType::is_critical));
    assert!(softened.overall < faithful.overall);
}

#[test]
fn lexical_extraction_tells_address_modes_apart() {
    let extractor = LexicalActExtractor;
    assert_eq!(
        extractor.extract_sync("I love you, Subaru-kun.").address_mode,
        AddressMode::Direct
    );
    assert_eq!(
        extractor.extract_sync("Rem loves Subaru-kun.").address_mode,
        AddressMode::Reported
    );
    assert_eq!(
        extractor.extract_sync("Why am I like this...").address_mode,
        AddressMode::Monologue
    );
}

#[test]
fn zap_rewards_kept_markers_and_voice() {
    let registry = load_personas();
    let persona = rem(&registry);
    let predicted: MarkerSet = [ZLeakMarker::Ellipsis, ZLeakMarker::Trailing]
        .into_iter()
        .collect();

    let kept = score_zap(&predicted, "Subaru-kun… Rem isn't…", persona, "en");
    assert_eq!(kept.recall, 1.0);
    assert_eq!(kept.voice, 1.0);
    assert!((kept.score - 1.0).abs() < 1e-5);

    let flattened = score_zap(&predicted, "Subaru-kun. Rem is fine.", persona, "en");
    assert_eq!(flattened.recall, 0.0);
    assert!(flattened.score < kept.score);
    assert!(flattened.markers.contains(&"missing:ellipsis".to_string()));
    assert!(flattened.markers.contains(&"device_missing:contraction".to_string()));
}

#[test]
fn zap_without_compensation_for_target_language() {
    let registry = load_personas();
    let persona = rem(&registry);
    let predicted: MarkerSet = [ZLeakMarker::Ellipsis].into_iter().collect();

    let z = score_zap(&predicted, "Subaru-kun… Rem est…", persona, "fr");
    assert_eq!(z.voice, 1.0);
    assert!(z.markers.iter().all(|m| !m.starts_with("device_missing")));
}

#[tokio::test]
async fn generator_extraction_is_cached_across_runs() {
    let act_calls = Arc::new(AtomicU32::new(0));
    let counter = act_calls.clone();
    let generator = FnGenerator::new(move |req: &GenerationRequest| {
        let body = match req.task {
            GenerationTask::ActExtraction => {
                counter.fetch_add(1, Ordering::SeqCst);
                r#"{"primary_act": "EXPRESS", "address_mode": "direct", "acts": [
                    {"type": "EXPRESS", "target_role": "LISTENER", "target_entity": "you",
                     "force": "", "intensity": 0.6}
                ]}"#
            }
            GenerationTask::ConflictExtraction => r#"{"activated_conflicts": []}"#,
            GenerationTask::InterferenceAnalysis => r#"{"z_leak": []}"#,
            _ => r#"{"translation": "Fine."}"#,
        };
        Ok(GenerationOutput::new(body))
    });

    let mut config = EngineConfig::load_from_ron(Path::new("tests/fixtures/config.ron")).unwrap();
    config.act_extraction = ActExtraction::Generator;
    let engine = DialogueEngine::builder()
        .with_config(config)
        .with_personas(load_personas())
        .with_generator(Arc::new(generator))
        .build()
        .unwrap();
    let scene = SceneDefinition::load_from_ron(Path::new("tests/fixtures/scene.ron")).unwrap();

    let first = engine.run_scene(&scene).await.unwrap();
    // three distinct sources plus one shared translation
    assert_eq!(act_calls.load(Ordering::SeqCst), 4);
    for turn in &first.turns {
        let score = turn.evaluator_scores.iap.unwrap();
        assert!((score - 1.0).abs() < 1e-5);
    }

    let second = engine.run_scene(&scene).await.unwrap();
    assert_eq!(act_calls.load(Ordering::SeqCst), 4);
    assert_eq!(first, second);
}

/// Pipeline replies for the fixture scene; the ZAP judge and reverse
/// analysis are left to `judge`.
fn with_judge(
    judge: impl Fn(&GenerationRequest) -> Result<GenerationOutput, GenerationError>
        + Send
        + Sync
        + 'static,
) -> FnGenerator<impl Fn(&GenerationRequest) -> Result<GenerationOutput, GenerationError> + Send + Sync>
{
    FnGenerator::new(move |req: &GenerationRequest| {
        let body = match req.task {
            GenerationTask::ZapJudgement | GenerationTask::ReverseAnalysis => return judge(req),
            GenerationTask::ConflictExtraction => r#"{"activated_conflicts": []}"#,
            GenerationTask::InterferenceAnalysis => r#"{"z_leak": []}"#,
            _ if req.user.contains("スバルくん") => r#"{"translation": "Subaru-kun… Rem, Rem is…"}"#,
            _ => r#"{"translation": "Fine."}"#,
        };
        Ok(GenerationOutput::new(body))
    })
}

fn judged_engine(generator: impl dialogue_engine::Generator + 'static, judged: bool) -> DialogueEngine {
    let mut config = EngineConfig::load_from_ron(Path::new("tests/fixtures/config.ron")).unwrap();
    if judged {
        config.zap_evaluation = ZapEvaluation::Generator;
    }
    DialogueEngine::builder()
        .with_config(config)
        .with_personas(load_personas())
        .with_generator(Arc::new(generator))
        .build()
        .unwrap()
}

#[tokio::test]
async fn judged_zap_carries_aspect_scores() {
    let generator = with_judge(|req| {
        let levels = if req.user.contains("Rem, Rem") {
            r#""original_level": "high", "translated_level": "low""#
        } else {
            r#""original_level": "medium", "translated_level": "medium""#
        };
        Ok(GenerationOutput::new(format!(
            r#"{{
                "overall_score": 0.7,
                "character_voice": {{"score": 0.9}},
                "emotional_intensity": {{"score": 0.5, {levels}}},
                "listener_relationship": {{"score": 0.8, "original_type": "direct_address",
                                           "translated_type": "direct_address"}},
                "speech_pattern": {{"score": 0.6}},
                "z_axis_fidelity": {{"score": 0.7, "z_mode_detected": "leak",
                                     "z_mode_appropriate": true, "arc_phase_appropriate": true}},
                "critical_issues": ["lost intimacy"]
            }}"#
        )))
    });
    let engine = judged_engine(generator, true);
    let scene = SceneDefinition::load_from_ron(Path::new("tests/fixtures/scene.ron")).unwrap();
    let report = engine.run_scene(&scene).await.unwrap();

    for turn in &report.turns {
        let scores = &turn.evaluator_scores;
        assert!((scores.zap.unwrap() - 0.7).abs() < 1e-5);
        let judgement = scores.zap_judgement.as_ref().unwrap();
        assert_eq!(judgement.character_voice, 0.9);
        assert!(judgement.mode_appropriate);
        assert!(scores.zap_markers.contains(&"critical:lost intimacy".to_string()));
        assert!(!turn.has_warning("warn:evaluator_failed"));
    }

    let marked = &report.turns[1].evaluator_scores;
    assert_eq!(
        marked.zap_judgement.as_ref().unwrap().original_level,
        Some(IntensityBand::High)
    );
    assert!(marked.zap_markers.contains(&"flattened:high->low".to_string()));
}

#[tokio::test]
async fn failed_judge_falls_back_to_lexical_zap() {
    let scene = SceneDefinition::load_from_ron(Path::new("tests/fixtures/scene.ron")).unwrap();
    let failing = with_judge(|_req| Err(GenerationError::Transient("overloaded".to_string())));
    let judged = judged_engine(failing, true).run_scene(&scene).await.unwrap();
    let lexical = judged_engine(with_judge(|_req| unreachable!()), false)
        .run_scene(&scene)
        .await
        .unwrap();

    for (turn, reference) in judged.turns.iter().zip(&lexical.turns) {
        assert!(turn.evaluator_scores.zap_judgement.is_none());
        assert_eq!(turn.evaluator_scores.zap, reference.evaluator_scores.zap);
        assert!(turn.warnings.iter().any(|w| matches!(
            w,
            TurnWarning::EvaluatorFailed { evaluator, .. } if evaluator == "zap_judge"
        )));
    }
}

#[tokio::test]
async fn reverse_analysis_reads_the_line_back() {
    let generator = with_judge(|req| {
        assert_eq!(req.task, GenerationTask::ReverseAnalysis);
        Ok(GenerationOutput::new(
            r#"{"z_leak": ["repetition"], "intensity": "high", "arc_phase": "bottom",
                "conflicts": [{"axis": "devotion vs self-worth", "activation": 0.8, "winning": "devotion"}]}"#,
        ))
    });
    let engine = judged_engine(generator, false);
    let analysis = engine
        .reverse_analyze("Subaru-kun… Rem, Rem is…", "en", None)
        .await
        .unwrap();

    assert_eq!(
        analysis.markers.names(),
        vec!["repetition", "ellipsis", "trailing"]
    );
    assert_eq!(analysis.intensity, Some(IntensityBand::High));
    assert_eq!(analysis.arc_phase, ArcPhase::Bottom);
    assert_eq!(analysis.conflicts[0].winning, "devotion");
}
