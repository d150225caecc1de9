/// The dialogue orchestrator: Scene → Turn Records.
///
/// Wires the affect tracker and the turn pipeline to the fidelity
/// evaluators. Each scene owns its state table; the engine itself is
/// shared read-only, so independent scenes run in parallel.
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::core::acts::{
    ActExtractionError, ActExtractor, CachedActExtractor, GeneratorActExtractor,
    LexicalActExtractor,
};
use crate::core::config::{
    ActExtraction, ConfigError, EngineConfig, ModePropagation, ZapEvaluation,
};
use crate::core::context::{ContextEntry, DialogueContext};
use crate::core::generation::{Generator, ResilientGenerator};
use crate::core::iap::{score_acts, IapScore};
use crate::core::judge::{GeneratorZapJudge, JudgeInput, ZapJudge, ZapJudgeError};
use crate::core::matcher::TriggerMatcher;
use crate::core::pipeline::{PipelineError, ReverseAnalysis, StageContext, TurnPipeline};
use crate::core::registry::PersonaRegistry;
use crate::core::tracker::{AffectTracker, Listener, TriggerEvent, TurnInput, TurnUpdate};
use crate::core::zap::score_zap;
use crate::schema::affect::{clamp_intensity, AffectiveState};
use crate::schema::persona::{PersonaId, PersonaProfile, ProfileError, SpeakerId};
use crate::schema::record::{
    EvaluatorScores, MarkerSet, SceneReport, TurnRecord, TurnWarning, ZapJudgement,
};
use crate::schema::scene::SceneDefinition;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no generator configured")]
    MissingGenerator,
    #[error("profile error: {0}")]
    Profile(#[from] ProfileError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("scene '{0}' has no turns")]
    EmptyScene(String),
    #[error("speaker '{0}' is not in the cast")]
    UnknownSpeaker(SpeakerId),
    #[error("speaker '{speaker}' is cast as unknown persona '{persona}'")]
    UnknownPersona { speaker: SpeakerId, persona: PersonaId },
    #[error("scene aborted: {0}")]
    Fatal(#[from] PipelineError),
}

/// The top-level engine. Built via `DialogueEngine::builder()`.
pub struct DialogueEngine {
    config: EngineConfig,
    personas: PersonaRegistry,
    tracker: AffectTracker,
    pipeline: TurnPipeline,
    acts: Arc<dyn ActExtractor>,
    judge: Option<Arc<dyn ZapJudge>>,
}

/// Builder for constructing a `DialogueEngine`.
#[derive(Default)]
pub struct DialogueEngineBuilder {
    config: Option<EngineConfig>,
    config_path: Option<PathBuf>,
    personas: Option<PersonaRegistry>,
    personas_dir: Option<PathBuf>,
    matcher: Option<Box<dyn TriggerMatcher>>,
    generator: Option<Arc<dyn Generator>>,
    act_extractor: Option<Arc<dyn ActExtractor>>,
    zap_judge: Option<Arc<dyn ZapJudge>>,
}

/// Per-scene mutable state. Never shared between scenes.
struct SceneState<'s> {
    cast: BTreeMap<&'s SpeakerId, &'s PersonaProfile>,
    states: BTreeMap<SpeakerId, AffectiveState>,
    queued: HashMap<SpeakerId, Vec<TriggerEvent>>,
    context: DialogueContext,
}

impl DialogueEngine {
    pub fn builder() -> DialogueEngineBuilder {
        DialogueEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn personas(&self) -> &PersonaRegistry {
        &self.personas
    }

    /// Process every line of a scene in order. Fails only when the scene
    /// cannot be set up or a generation error is fatal.
    pub async fn run_scene(&self, scene: &SceneDefinition) -> Result<SceneReport, SceneError> {
        let mut run = self.prepare(scene)?;
        tracing::info!(
            scene = %scene.id,
            turns = scene.turns.len(),
            source = %scene.source_lang,
            target = %scene.target_lang,
            "scene started"
        );

        let mut records = Vec::with_capacity(scene.turns.len());
        for index in 0..scene.turns.len() {
            let record = self.run_turn(scene, index, &mut run).await?;
            records.push(record);
        }

        let report = SceneReport {
            scene_id: scene.id.clone(),
            source_lang: scene.source_lang.clone(),
            target_lang: scene.target_lang.clone(),
            turns: records,
            final_states: run.states,
        };
        tracing::info!(
            scene = %scene.id,
            mean_iap = ?report.mean_iap(),
            mean_zap = ?report.mean_zap(),
            warnings = report.warning_count(),
            "scene finished"
        );
        Ok(report)
    }

    /// Read a finished line back into markers, intensity, waves, conflict
    /// axes, and persona hints. Touches no scene state.
    pub async fn reverse_analyze(
        &self,
        text: &str,
        lang: &str,
        context: Option<&str>,
    ) -> Result<ReverseAnalysis, PipelineError> {
        self.pipeline.reverse_analyze(text, lang, context).await
    }

    /// Run independent scenes in parallel. Results keep the input order.
    pub async fn run_scenes(
        &self,
        scenes: &[SceneDefinition],
    ) -> Vec<Result<SceneReport, SceneError>> {
        join_all(scenes.iter().map(|scene| self.run_scene(scene))).await
    }

    fn prepare<'s>(&'s self, scene: &'s SceneDefinition) -> Result<SceneState<'s>, SceneError> {
        if scene.turns.is_empty() {
            return Err(SceneError::EmptyScene(scene.id.clone()));
        }
        let mut cast = BTreeMap::new();
        for (speaker, persona_id) in &scene.cast {
            let persona = self
                .personas
                .get(persona_id)
                .ok_or_else(|| SceneError::UnknownPersona {
                    speaker: speaker.clone(),
                    persona: persona_id.clone(),
                })?;
            cast.insert(speaker, persona);
        }
        if let Some(speaker) = scene.speakers().into_iter().find(|s| !cast.contains_key(*s)) {
            return Err(SceneError::UnknownSpeaker(speaker.clone()));
        }
        let states = cast
            .iter()
            .map(|(id, persona)| {
                (
                    (*id).clone(),
                    AffectiveState::from_baseline(persona.baseline_intensity),
                )
            })
            .collect();
        Ok(SceneState {
            cast,
            states,
            queued: HashMap::new(),
            context: DialogueContext::new(self.config.context_window, &scene.target_lang),
        })
    }

    async fn run_turn(
        &self,
        scene: &SceneDefinition,
        index: usize,
        run: &mut SceneState<'_>,
    ) -> Result<TurnRecord, SceneError> {
        let line = &scene.turns[index];
        let speaker_id = &line.speaker;
        let persona = run.cast[speaker_id];
        let listener_id = scene.listener_for(index);

        // (a) tracker: inbound events in, pending events out
        let inbound = run.queued.remove(speaker_id).unwrap_or_default();
        let TurnUpdate {
            speaker_state: mut state,
            pending,
            mut warnings,
        } = {
            let listener = listener_id.map(|id| Listener {
                id,
                persona: run.cast[id],
                state: &run.states[id],
            });
            self.tracker.apply_turn(TurnInput {
                speaker_id,
                speaker: persona,
                speaker_state: &run.states[speaker_id],
                listener,
                source_text: &line.text,
                inbound: &inbound,
            })
        };

        // (b) per-line overrides
        if let Some(intensity) = line.intensity_override {
            state.intensity = clamp_intensity(intensity);
            if let Some(last) = state.history.last_mut() {
                *last = state.intensity;
            }
        }
        if let Some(ref mode) = line.mode_override {
            if persona.declares_mode(mode) {
                state.mode = mode.clone();
            } else {
                warnings.push(TurnWarning::UndeclaredMode {
                    label: mode.to_string(),
                });
            }
        }

        // (c) pipeline
        let relationship = listener_id.and_then(|l| scene.relationship(speaker_id, l));
        let context_block = run.context.render(&scene.setting, relationship);
        let stage_ctx = StageContext {
            persona,
            state: &state,
            source_text: &line.text,
            source_lang: &scene.source_lang,
            target_lang: &scene.target_lang,
            setting: &scene.setting,
            relationship,
            context_block: &context_block,
        };
        let outcome = self.pipeline.run(&stage_ctx).await?;
        warnings.extend(outcome.warnings);

        let predicted_markers = outcome.interference.marker_set();
        let translated = outcome.translation.translation;

        // (d) evaluators
        let evaluator_scores = if self.config.evaluate {
            self.evaluate(scene, &stage_ctx, &translated, &predicted_markers, &mut warnings)
                .await
        } else {
            EvaluatorScores::default()
        };

        // (e) record
        let observed_mode = outcome.conflict.mode;
        let record = TurnRecord {
            index,
            speaker_id: speaker_id.clone(),
            listener_id: listener_id.cloned(),
            source_text: line.text.clone(),
            predicted_intensity: state.intensity,
            predicted_mode: state.mode.clone(),
            observed_mode: observed_mode.clone(),
            arc_phase: state.arc_phase,
            conflict_axis: outcome.conflict.active_axis,
            z_leak_markers: predicted_markers,
            translated_text: translated.clone(),
            notes: outcome.translation.notes,
            alternatives: outcome.translation.alternatives,
            evaluator_scores,
            warnings,
        };
        tracing::info!(
            scene = %scene.id,
            turn = index,
            speaker = %speaker_id,
            intensity = record.predicted_intensity,
            mode = %record.predicted_mode,
            arc = %record.arc_phase,
            warnings = record.warnings.len(),
            "turn processed"
        );

        // (f) queue for the listener
        for event in pending {
            run.queued.entry(event.listener.clone()).or_default().push(event);
        }

        // (g) mode propagation
        if self.config.mode_propagation == ModePropagation::ObservedOverrides
            && !observed_mode.is_none()
            && persona.declares_mode(&observed_mode)
        {
            state.mode = observed_mode;
        }

        run.context.push(ContextEntry {
            speaker_name: persona.name.clone(),
            source_text: line.text.clone(),
            translated_text: translated,
            mode: state.mode.clone(),
            arc_phase: state.arc_phase,
        });
        run.states.insert(speaker_id.clone(), state);
        Ok(record)
    }

    /// IAP, lexical ZAP, and the ZAP judge (when configured) run side by
    /// side. A failed evaluator leaves a warning behind; a failed judge falls
    /// back to the lexical score.
    async fn evaluate(
        &self,
        scene: &SceneDefinition,
        ctx: &StageContext<'_>,
        translated: &str,
        predicted: &MarkerSet,
        warnings: &mut Vec<TurnWarning>,
    ) -> EvaluatorScores {
        let iap = self.score_iap(scene, ctx.source_text, translated);
        let lexical = async { score_zap(predicted, translated, ctx.persona, &scene.target_lang) };
        let judged = self.judge_zap(ctx, translated, predicted);
        let (iap, lexical, judged) = tokio::join!(iap, lexical, judged);

        let mut scores = EvaluatorScores {
            zap: Some(lexical.score),
            zap_markers: lexical.markers,
            ..Default::default()
        };
        match iap {
            Ok(iap) => {
                scores.iap = Some(iap.overall);
                scores.iap_markers = iap.markers;
            }
            Err(err) => {
                tracing::warn!(scene = %scene.id, error = %err, "IAP evaluation failed");
                warnings.push(TurnWarning::EvaluatorFailed {
                    evaluator: "iap".to_string(),
                    reason: err.to_string(),
                });
            }
        }
        match judged {
            Some(Ok(judgement)) => {
                scores.zap = Some(judgement.overall);
                if let (true, Some(from), Some(to)) = (
                    judgement.is_flattened(),
                    judgement.original_level,
                    judgement.translated_level,
                ) {
                    scores.zap_markers.push(format!("flattened:{}->{}", from.name(), to.name()));
                }
                scores.zap_markers.extend(
                    judgement
                        .critical_issues
                        .iter()
                        .map(|issue| format!("critical:{issue}")),
                );
                scores.zap_judgement = Some(judgement);
            }
            Some(Err(err)) => {
                tracing::warn!(scene = %scene.id, error = %err, "ZAP judge failed, keeping lexical score");
                warnings.push(TurnWarning::EvaluatorFailed {
                    evaluator: "zap_judge".to_string(),
                    reason: err.to_string(),
                });
            }
            None => {}
        }
        scores
    }

    async fn judge_zap(
        &self,
        ctx: &StageContext<'_>,
        translated: &str,
        predicted: &MarkerSet,
    ) -> Option<Result<ZapJudgement, ZapJudgeError>> {
        let judge = self.judge.as_ref()?;
        let emotion_state = ctx
            .persona
            .emotion_state_for(ctx.state.band(), &ctx.state.mode)
            .map(|state| state.name.as_str());
        let input = JudgeInput {
            persona: ctx.persona,
            source_text: ctx.source_text,
            translated_text: translated,
            target_lang: ctx.target_lang,
            context: ctx.context_block,
            expected_mode: &ctx.state.mode,
            expected_markers: predicted,
            expected_arc_phase: ctx.state.arc_phase,
            emotion_state,
        };
        Some(judge.judge(&input).await)
    }

    async fn score_iap(
        &self,
        scene: &SceneDefinition,
        source: &str,
        translated: &str,
    ) -> Result<IapScore, ActExtractionError> {
        let context = Some(scene.setting.as_str()).filter(|s| !s.trim().is_empty());
        let (original, candidate) = tokio::join!(
            self.acts.extract(source, &scene.source_lang, context),
            self.acts.extract(translated, &scene.target_lang, context),
        );
        Ok(score_acts(&original?, &candidate?))
    }
}

impl DialogueEngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Load the config from a RON file at build time.
    pub fn config_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_personas(mut self, personas: PersonaRegistry) -> Self {
        self.personas = Some(personas);
        self
    }

    /// Load every `.ron` persona file in `dir` at build time, on top of any
    /// registry given directly.
    pub fn personas_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.personas_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Override the matcher the config's strategy would build.
    pub fn with_matcher(mut self, matcher: Box<dyn TriggerMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Override the act extractor the config would pick.
    pub fn with_act_extractor(mut self, extractor: Arc<dyn ActExtractor>) -> Self {
        self.act_extractor = Some(extractor);
        self
    }

    /// Judge ZAP with `judge`, whatever the config's `zap_evaluation` says.
    pub fn with_zap_judge(mut self, judge: Arc<dyn ZapJudge>) -> Self {
        self.zap_judge = Some(judge);
        self
    }

    pub fn build(self) -> Result<DialogueEngine, EngineError> {
        let config = match (self.config, self.config_path) {
            (Some(config), _) => config,
            (None, Some(path)) => EngineConfig::load_from_ron(&path)?,
            (None, None) => EngineConfig::default(),
        };
        config.validate()?;

        let mut personas = self.personas.unwrap_or_default();
        if let Some(ref dir) = self.personas_dir {
            personas.load_dir(dir)?;
        }

        let generator = self.generator.ok_or(EngineError::MissingGenerator)?;
        let resilient = ResilientGenerator::new(generator, config.retry.clone());
        let matcher = self.matcher.unwrap_or_else(|| config.matcher.build());
        let acts: Arc<dyn ActExtractor> = match self.act_extractor {
            Some(extractor) => extractor,
            None => match config.act_extraction {
                ActExtraction::Generator => Arc::new(CachedActExtractor::new(Arc::new(
                    GeneratorActExtractor::new(resilient.clone(), config.evaluator_temperature),
                ))),
                ActExtraction::Lexical => Arc::new(LexicalActExtractor),
            },
        };
        let judge: Option<Arc<dyn ZapJudge>> = match self.zap_judge {
            Some(judge) => Some(judge),
            None => match config.zap_evaluation {
                ZapEvaluation::Generator => Some(Arc::new(GeneratorZapJudge::new(
                    resilient.clone(),
                    config.evaluator_temperature,
                ))),
                ZapEvaluation::Lexical => None,
            },
        };
        tracing::debug!(
            personas = personas.len(),
            matcher = matcher.name(),
            zap_judge = judge.is_some(),
            "dialogue engine built"
        );

        Ok(DialogueEngine {
            pipeline: TurnPipeline::new(resilient, config.temperatures),
            tracker: AffectTracker::new(matcher),
            personas,
            acts,
            judge,
            config,
        })
    }
}
