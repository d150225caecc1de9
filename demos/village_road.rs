/// Village Road demo: runs the fixture scene through the engine with a
/// scripted generator and prints the turn records.
///
/// Run with: cargo run --example village_road
/// Set RUST_LOG=dialogue_engine=debug to watch triggers and stages.

use dialogue_engine::core::generation::{GenerationOutput, GenerationRequest, GenerationTask};
use dialogue_engine::{DialogueEngine, FnGenerator, GenerationError, SceneDefinition};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Canned replies keyed on the line under translation.
fn scripted(req: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
    let target = req
        .user
        .split("[Target]\n")
        .nth(1)
        .and_then(|rest| rest.split("\n\n").next())
        .unwrap_or_default()
        .trim();
    let body = match req.task {
        GenerationTask::ConflictExtraction => serde_json::json!({
            "activated_conflicts": [
                {"axis": "devotion vs self-worth", "side_a": "devotion", "side_b": "worthlessness", "activation": 0.7}
            ],
            "listener_type": "other_specific"
        }),
        GenerationTask::InterferenceAnalysis if target.contains('…') => serde_json::json!({
            "z_leak": [
                {"marker": "ellipsis", "position": "middle"},
                {"marker": "repetition", "position": "middle"},
                {"marker": "trailing", "position": "end"}
            ],
            "negation_type": "concealment",
            "interference": "destructive"
        }),
        GenerationTask::InterferenceAnalysis => serde_json::json!({"z_leak": []}),
        _ => {
            let translation = match target {
                "レム、君は大事だ。" => "Rem, you matter.",
                "スバルくん…レムは、レムは…" => "Subaru-kun… Rem's, Rem's…",
                "行こう。" => "Let's go.",
                other => other,
            };
            serde_json::json!({"translation": translation})
        }
    };
    Ok(GenerationOutput::new(body.to_string()))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let engine = DialogueEngine::builder()
        .config_path("tests/fixtures/config.ron")
        .personas_dir("tests/fixtures/personas")
        .with_generator(Arc::new(FnGenerator::new(scripted)))
        .build()
        .expect("Failed to build engine");

    let scene = SceneDefinition::load_from_ron(std::path::Path::new("tests/fixtures/scene.ron"))
        .expect("Failed to load scene");

    let report = engine.run_scene(&scene).await.expect("Scene aborted");

    for turn in &report.turns {
        println!(
            "[{}] {} -> {}  (intensity {:.2}, mode {}, arc {})",
            turn.speaker_id,
            turn.source_text,
            turn.translated_text,
            turn.predicted_intensity,
            turn.predicted_mode,
            turn.arc_phase,
        );
        println!(
            "     markers {:?}  iap {:?}  zap {:?}",
            turn.z_leak_markers.names(),
            turn.evaluator_scores.iap,
            turn.evaluator_scores.zap,
        );
        for warning in &turn.warnings {
            println!("     {}", warning.tag());
        }
    }

    println!(
        "\n{}",
        serde_json::to_string_pretty(&report).expect("Failed to serialize report")
    );
}
