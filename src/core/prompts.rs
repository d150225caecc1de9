/// Prompt construction for the three pipeline stages, the flat fallback,
/// the ZAP judge, and reverse analysis.
///
/// Every builder is a pure function of its inputs, so identical turns yield
/// identical requests.
use serde_json::json;

use crate::core::generation::{GenerationRequest, GenerationTask, ResponseFormat};
use crate::core::judge::JudgeInput;
use crate::core::pipeline::{ConflictExtraction, InterferenceAnalysis, StageContext};
use crate::schema::affect::IntensityBand;
use crate::schema::persona::{MarkerRequirement, PersonaProfile};

/// Few-shot examples injected into stage 3.
pub const MAX_EXAMPLE_LINES: usize = 3;

const NO_CHAIN_OF_THOUGHT: &str =
    "Output MUST be a single JSON object following the schema. Do NOT include chain-of-thought.";

pub fn conflict_request(ctx: &StageContext<'_>, temperature: f32) -> GenerationRequest {
    let system = format!(
        "You extract the active inner conflict behind a line of dialogue.\n\
         Infer which conflict axes are activated, the speaker's emotional mode, \
         the intensity (0..1), and who the line is directed at:\n\
         - other_specific: a specific person present in the scene\n\
         - other_general: a general or unspecified audience\n\
         - self: monologue or self-talk\n\
         - absent: talking about someone who is not present\n\
         Known modes: {}.\n\
         {}\nsummary must be <= 25 words.",
        known_modes(ctx.persona),
        NO_CHAIN_OF_THOUGHT
    );
    let user = format!(
        "[Persona]\n{}\n\n[Conversation]\n{}\n\n[Tracked State]\n{}\n\n[Target]\n{}\n\n[Languages]\n{} -> {}",
        persona_block(ctx.persona),
        or_placeholder(ctx.context_block, "(start of scene)"),
        state_line(ctx),
        ctx.source_text,
        ctx.source_lang,
        ctx.target_lang
    );
    GenerationRequest {
        task: GenerationTask::ConflictExtraction,
        system,
        user,
        temperature,
        format: ResponseFormat::Structured {
            schema: json!({
                "activated_conflicts": [{"axis": "string", "side_a": "string", "side_b": "string", "activation": "number 0..1"}],
                "mode": "string",
                "intensity": "number 0..1",
                "listener_type": "other_specific | other_general | self | absent",
                "summary": "string"
            }),
        },
    }
}

pub fn interference_request(
    ctx: &StageContext<'_>,
    conflict: &ConflictExtraction,
    temperature: f32,
) -> GenerationRequest {
    let system = format!(
        "You analyse how suppressed feeling interferes with what a line says on the surface.\n\
         List the z_leak markers the line shows, in order, each with its position \
         (start | middle | end). Markers: stutter, ellipsis, repetition, negation_first, \
         overwrite, trailing, self_negation, absolute_quantifier, or a short custom label.\n\
         Classify the negation:\n\
         - concealment: hiding true feelings; true intent is opposite to the surface\n\
         - declaration: asserting the truth; intent matches the surface\n\
         - rationalization: logic masking an emotional motive\n\
         - none: no negation\n\
         Set self_directed_rebinding when the speaker must deny twice to convince themselves.\n\
         An empty z_leak list is a valid answer for a flat line.\n{}",
        NO_CHAIN_OF_THOUGHT
    );
    let conflict_json = serde_json::to_string(conflict).unwrap_or_default();
    let user = format!(
        "[Stage 1]\n{}\n\n[Relationship]\n{}\n\n[Target]\n{}\n\n[Intensity Band]\n{}",
        conflict_json,
        ctx.relationship
            .map(|r| r.to_string())
            .unwrap_or_else(|| "(unspecified)".to_string()),
        ctx.source_text,
        ctx.state.band().name()
    );
    GenerationRequest {
        task: GenerationTask::InterferenceAnalysis,
        system,
        user,
        temperature,
        format: ResponseFormat::Structured {
            schema: json!({
                "z_leak": [{"marker": "string", "position": "start | middle | end"}],
                "negation_type": "concealment | declaration | rationalization | none",
                "interference": "constructive | destructive | mixed",
                "self_directed_rebinding": "boolean",
                "summary": "string"
            }),
        },
    }
}

pub fn translation_request(
    ctx: &StageContext<'_>,
    conflict: &ConflictExtraction,
    interference: &InterferenceAnalysis,
    temperature: f32,
) -> GenerationRequest {
    if interference.is_degenerate() {
        let mut request = flat_translation_request(ctx, temperature);
        request.task = GenerationTask::Translation;
        return request;
    }

    let markers = interference
        .markers
        .iter()
        .map(|m| format!("{} ({:?})", m.marker, m.position).to_lowercase())
        .collect::<Vec<_>>()
        .join(", ");
    let system = format!(
        "You translate a line of dialogue so that it performs the same action as the source, \
         not only says the same thing.\n\
         Preserve meaning, register, the direction of any negation ({}), \
         and who the line is addressed to ({}).\n\
         Re-create these surface markers in the target language: {}.\n\
         {}\n\n{}\n\n[Example Lines] (tone reference only, do not copy)\n{}\n\n{}",
        interference.negation_type.name(),
        conflict.listener_type.name(),
        markers,
        if interference.self_directed_rebinding {
            "The speaker fails to convince themselves: keep the second, self-directed denial."
        } else {
            "Do not add self-directed repairs the source lacks."
        },
        constraint_block(ctx),
        example_block(ctx.persona),
        NO_CHAIN_OF_THOUGHT
    );
    let user = format!(
        "[Voice]\nFirst person: {}\nCompensation devices for {}: {}\n\n[Conversation]\n{}\n\n\
         [Target]\n{}\n\n[Target Language]\n{}\n\n\
         Keep it natural. Do not over-explain. Provide up to 2 alternatives.",
        ctx.persona.first_person_form,
        ctx.target_lang,
        join_or(ctx.persona.compensation_for(ctx.target_lang), "(none)"),
        or_placeholder(ctx.context_block, "(start of scene)"),
        ctx.source_text,
        ctx.target_lang
    );
    GenerationRequest {
        task: GenerationTask::Translation,
        system,
        user,
        temperature,
        format: translation_format(),
    }
}

/// Plain translation with no markers requested.
pub fn flat_translation_request(ctx: &StageContext<'_>, temperature: f32) -> GenerationRequest {
    let system = format!(
        "Translate the line from {} to {}. Produce a flat, unmarked, meaning-preserving \
         translation: no added hesitation, stutter, or ellipsis.\n{}",
        ctx.source_lang, ctx.target_lang, NO_CHAIN_OF_THOUGHT
    );
    let user = format!("[Target]\n{}", ctx.source_text);
    GenerationRequest {
        task: GenerationTask::FlatTranslation,
        system,
        user,
        temperature,
        format: translation_format(),
    }
}

pub fn zap_judge_request(input: &JudgeInput<'_>, temperature: f32) -> GenerationRequest {
    let system = format!(
        "You judge whether a translation keeps a character's voice and emotional dynamics, \
         not only the literal meaning. Score each aspect 0..1:\n\
         - character_voice: would this character say it? first person, politeness, word choice\n\
         - emotional_intensity: low | medium | high in the original and in the translation\n\
         - listener_relationship: direct_address | third_person | self_reference | indirect. \
         A Japanese speaker naming themselves in a confession (\"レムは…\") is still direct address.\n\
         - speech_pattern: hesitation, negation, verbal tics\n\
         - z_axis_fidelity: the breakdown mode the translation shows ({}), \
         the z_leak markers present, and whether the tone fits the arc phase \
         (bottom | rise | break | recovery | stable)\n\
         List critical issues: third-person narration replacing a confession, lost intimacy, \
         emotional flattening, wrong register, missing markers at high intensity, wrong mode.\n{}",
        known_modes(input.persona),
        NO_CHAIN_OF_THOUGHT
    );
    let mut expectations = vec![format!("[Expected Mode] {}", input.expected_mode)];
    if !input.expected_markers.is_empty() {
        expectations.push(format!(
            "[Expected Z-Leak] {}",
            input.expected_markers.names().join(", ")
        ));
    }
    expectations.push(format!("[Expected Arc Phase] {}", input.expected_arc_phase));
    if let Some(state) = input.emotion_state {
        expectations.push(format!("[Emotion State] {state}"));
    }
    let user = format!(
        "[Persona]\n{}\n\n[Context]\n{}\n\n{}\n\n[Original]\n{}\n\n[Translation ({})]\n{}",
        persona_block(input.persona),
        or_placeholder(input.context, "(none)"),
        expectations.join("\n"),
        input.source_text,
        input.target_lang,
        input.translated_text
    );
    let aspect = json!({"score": "number 0..1", "preserved": "boolean", "comment": "string"});
    GenerationRequest {
        task: GenerationTask::ZapJudgement,
        system,
        user,
        temperature,
        format: ResponseFormat::Structured {
            schema: json!({
                "overall_score": "number 0..1",
                "character_voice": aspect.clone(),
                "emotional_intensity": {"score": "number 0..1", "original_level": "low | medium | high", "translated_level": "low | medium | high"},
                "listener_relationship": {"score": "number 0..1", "original_type": "string", "translated_type": "string"},
                "speech_pattern": aspect,
                "z_axis_fidelity": {
                    "score": "number 0..1",
                    "z_mode_detected": "string",
                    "z_mode_appropriate": "boolean",
                    "z_leak_markers_found": ["string"],
                    "z_leak_appropriate": "boolean",
                    "arc_phase_appropriate": "boolean"
                },
                "critical_issues": ["string"],
                "summary": "string"
            }),
        },
    }
}

/// Read a finished translation back into the structure that produced it.
pub fn reverse_analysis_request(
    text: &str,
    lang: &str,
    context: Option<&str>,
    temperature: f32,
) -> GenerationRequest {
    let system = format!(
        "You reverse-engineer the emotional structure behind a translated line of dialogue.\n\
         - z_leak: surface markers present (stutter, ellipsis, repetition, negation_first, \
         overwrite, trailing, self_negation, absolute_quantifier)\n\
         - intensity: low (controlled) | medium (some leakage) | high (overflow)\n\
         - wave: true_intent (what the speaker wants to convey), suppressed (what they hide), \
         interference (constructive | destructive | mixed)\n\
         - conflicts: internal axes as \"A vs B\" with activation 0..1 and the winning side\n\
         - arc_phase: bottom | rise | break | recovery | stable\n\
         - persona_hints: expression pattern, default mode, weaknesses\n\
         - act: what the line does to the listener, not what it means\n{}",
        NO_CHAIN_OF_THOUGHT
    );
    let mut user = format!("[Language]\n{lang}\n\n");
    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        user.push_str(&format!("[Context]\n{}\n\n", context.trim()));
    }
    user.push_str(&format!("[Target]\n{}", text.trim()));
    GenerationRequest {
        task: GenerationTask::ReverseAnalysis,
        system,
        user,
        temperature,
        format: ResponseFormat::Structured {
            schema: json!({
                "z_leak": ["string"],
                "intensity": "low | medium | high",
                "wave": {"true_intent": "string", "suppressed": "string", "interference": "constructive | destructive | mixed"},
                "conflicts": [{"axis": "string", "side_a": "string", "side_b": "string", "activation": "number 0..1", "winning": "string"}],
                "arc_phase": "string",
                "persona_hints": {"expression_pattern": "string", "default_mode": "string", "weaknesses": ["string"]},
                "act": "string"
            }),
        },
    }
}

fn translation_format() -> ResponseFormat {
    ResponseFormat::Structured {
        schema: json!({
            "translation": "string",
            "notes": "string",
            "alternatives": ["string"]
        }),
    }
}

fn persona_block(persona: &PersonaProfile) -> String {
    let mut lines = vec![
        format!("Name: {}", persona.name),
        format!("First person: {}", persona.first_person_form),
    ];
    for quirk in persona
        .sentence_ending_patterns
        .iter()
        .chain(&persona.speech_quirks)
    {
        lines.push(format!(
            "Pattern: {} (when: {}; nuance: {})",
            quirk.pattern,
            or_placeholder(&quirk.trigger_condition, "any"),
            or_placeholder(&quirk.nuance, "-")
        ));
    }
    for axis in &persona.conflict_axes {
        lines.push(format!(
            "Conflict: {} [{} / {}] weight {:.2}",
            axis.axis, axis.side_a, axis.side_b, axis.weight
        ));
    }
    for trigger in &persona.triggers {
        lines.push(format!(
            "Trigger: {} -> Δ{:+.2}{}",
            trigger.name,
            trigger.delta_intensity,
            trigger
                .mode_shift
                .as_ref()
                .map(|m| format!(", {}", m.tag()))
                .unwrap_or_default()
        ));
    }
    if !persona.risk_flags.is_empty() {
        lines.push(format!("Risks: {}", persona.risk_flags.join("; ")));
    }
    lines.join("\n")
}

fn constraint_block(ctx: &StageContext<'_>) -> String {
    let band = ctx.state.band();
    let header = format!("[Surface Constraints] (band={})", band.name());
    match ctx.persona.emotion_state_for(band, &ctx.state.mode) {
        Some(state) => {
            let hint = &state.hint;
            let mut lines = vec![
                header,
                format!("- hesitation: {}/4", hint.hesitation.min(4)),
                format!("- stutter_count: {}", hint.stutter_count.min(4)),
                format!("- negation_first: {}", hint.negation_first),
                format!("- overwrite: {}", hint.overwrite.name()),
                format!("- residual: {}", hint.residual.name()),
            ];
            if !hint.tone.is_empty() {
                lines.push(format!("- tone: {}", hint.tone));
            }
            if !state.z_leak.is_empty() {
                let typical: Vec<&str> = state.z_leak.iter().map(|m| m.name()).collect();
                lines.push(format!("- typical z_leak: {}", typical.join(", ")));
            }
            lines.join("\n")
        }
        None => format!(
            "{}\n- overwrite: {}\n- residual: {}",
            header,
            MarkerRequirement::Optional.name(),
            MarkerRequirement::Optional.name()
        ),
    }
}

fn example_block(persona: &PersonaProfile) -> String {
    if persona.example_lines.is_empty() {
        return "(no example lines)".to_string();
    }
    persona
        .example_lines
        .iter()
        .take(MAX_EXAMPLE_LINES)
        .map(|ex| {
            let tags = if ex.tags.is_empty() {
                "general".to_string()
            } else {
                ex.tags.join(", ")
            };
            format!("- [{}] ({}) {}", tags, ex.situation, ex.line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn known_modes(persona: &PersonaProfile) -> String {
    let mut modes: Vec<String> = vec!["none".to_string()];
    modes.extend(crate::schema::affect::Mode::UNIVERSAL.iter().map(|m| m.to_string()));
    modes.extend(persona.modes.iter().map(|m| m.to_string()));
    modes.dedup();
    modes.join(", ")
}

fn state_line(ctx: &StageContext<'_>) -> String {
    format!(
        "intensity={:.2} ({}), mode={}, arc={}",
        ctx.state.intensity,
        IntensityBand::for_state(ctx.state.intensity, &ctx.state.mode).name(),
        ctx.state.mode,
        ctx.state.arc_phase
    )
}

fn or_placeholder<'a>(text: &'a str, placeholder: &'a str) -> &'a str {
    if text.trim().is_empty() {
        placeholder
    } else {
        text
    }
}

fn join_or(items: &[String], placeholder: &str) -> String {
    if items.is_empty() {
        placeholder.to_string()
    } else {
        items.join(", ")
    }
}
