/// Affective state tracker: propagates trigger pressure between speakers
/// and derives each character's arc phase. Pure; never calls a generator.
use serde::{Deserialize, Serialize};

use crate::core::matcher::TriggerMatcher;
use crate::schema::affect::{clamp_intensity, AffectiveState, ArcPhase, Mode};
use crate::schema::persona::{PersonaProfile, SpeakerId};
use crate::schema::record::TurnWarning;

/// Intensity changes smaller than this count as flat for the arc policy.
const FLAT_EPSILON: f32 = 1e-4;

/// A fired trigger waiting to be applied at the listener's next turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub listener: SpeakerId,
    pub trigger: String,
    pub delta_intensity: f32,
    pub mode_shift: Option<Mode>,
    pub tags: Vec<String>,
    /// Position of the trigger in the listener's profile.
    pub order: usize,
}

impl TriggerEvent {
    pub fn is_breakthrough(&self) -> bool {
        self.tags
            .iter()
            .any(|t| t == crate::schema::persona::Trigger::RELATIONAL_BREAKTHROUGH)
    }
}

/// The other party of a turn.
#[derive(Debug, Clone, Copy)]
pub struct Listener<'a> {
    pub id: &'a SpeakerId,
    pub persona: &'a PersonaProfile,
    pub state: &'a AffectiveState,
}

pub struct TurnInput<'a> {
    pub speaker_id: &'a SpeakerId,
    pub speaker: &'a PersonaProfile,
    pub speaker_state: &'a AffectiveState,
    pub listener: Option<Listener<'a>>,
    pub source_text: &'a str,
    /// Events queued for the speaker by the other side's previous line.
    pub inbound: &'a [TriggerEvent],
}

#[derive(Debug, Clone)]
pub struct TurnUpdate {
    pub speaker_state: AffectiveState,
    /// Events this line fires against the listener's triggers.
    pub pending: Vec<TriggerEvent>,
    pub warnings: Vec<TurnWarning>,
}

/// Combined effect of a batch of inbound events.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvents {
    pub delta_intensity: f32,
    pub mode_shift: Option<Mode>,
    pub breakthrough: bool,
    pub ambiguity: Option<TurnWarning>,
}

#[derive(Debug)]
pub struct AffectTracker {
    matcher: Box<dyn TriggerMatcher>,
}

impl AffectTracker {
    pub fn new(matcher: Box<dyn TriggerMatcher>) -> Self {
        Self { matcher }
    }

    pub fn matcher_name(&self) -> &'static str {
        self.matcher.name()
    }

    /// Apply one turn: consume the speaker's inbound events, record the new
    /// intensity, advance the arc, and compute events for the listener.
    pub fn apply_turn(&self, input: TurnInput<'_>) -> TurnUpdate {
        let mut state = input.speaker_state.clone();
        let mut warnings = Vec::new();
        let mut breakthrough = false;

        if !input.inbound.is_empty() {
            let resolved = resolve_events(input.inbound);
            state.intensity = clamp_intensity(state.intensity + resolved.delta_intensity);
            if let Some(mode) = resolved.mode_shift {
                if input.speaker.declares_mode(&mode) {
                    state.mode = mode;
                } else {
                    warnings.push(TurnWarning::UndeclaredMode {
                        label: mode.to_string(),
                    });
                }
            }
            breakthrough = resolved.breakthrough;
            if let Some(warning) = resolved.ambiguity {
                warnings.push(warning);
            }
            warnings.push(TurnWarning::TriggersFired {
                names: input.inbound.iter().map(|e| e.trigger.clone()).collect(),
            });
        }

        state.history.push(state.intensity);
        state.arc_phase = next_arc_phase(state.arc_phase, &state.history, breakthrough);

        let pending = match input.listener {
            Some(listener) => {
                let events = self.match_triggers(input.source_text, listener.id, listener.persona);
                if !events.is_empty() {
                    let delta: f32 = events.iter().map(|e| e.delta_intensity).sum();
                    tracing::debug!(
                        speaker = %input.speaker_id,
                        listener = %listener.id,
                        listener_intensity = listener.state.intensity,
                        queued_delta = delta,
                        "queued trigger events"
                    );
                }
                events
            }
            None => Vec::new(),
        };

        TurnUpdate {
            speaker_state: state,
            pending,
            warnings,
        }
    }

    /// Match `text` against every trigger of the listener's profile, in
    /// declaration order.
    pub fn match_triggers(
        &self,
        text: &str,
        listener_id: &SpeakerId,
        listener: &PersonaProfile,
    ) -> Vec<TriggerEvent> {
        listener
            .triggers
            .iter()
            .enumerate()
            .filter(|(_, trigger)| self.matcher.matches(trigger, text))
            .map(|(order, trigger)| {
                tracing::debug!(
                    listener = %listener_id,
                    trigger = %trigger.name,
                    delta = trigger.delta_intensity,
                    matcher = self.matcher.name(),
                    "trigger fired"
                );
                TriggerEvent {
                    listener: listener_id.clone(),
                    trigger: trigger.name.clone(),
                    delta_intensity: trigger.delta_intensity,
                    mode_shift: trigger.mode_shift.clone(),
                    tags: trigger.tags.clone(),
                    order,
                }
            })
            .collect()
    }
}

/// Sum the deltas; the strongest |Δ| decides the mode shift, earliest
/// declaration winning ties.
pub fn resolve_events(events: &[TriggerEvent]) -> ResolvedEvents {
    let delta_intensity = events.iter().map(|e| e.delta_intensity).sum();
    let breakthrough = events.iter().any(TriggerEvent::is_breakthrough);

    let strongest = events
        .iter()
        .map(|e| e.delta_intensity.abs())
        .fold(0.0_f32, f32::max);
    let mut tied: Vec<&TriggerEvent> = events
        .iter()
        .filter(|e| (e.delta_intensity.abs() - strongest).abs() <= f32::EPSILON)
        .collect();
    tied.sort_by_key(|e| e.order);

    let winner = tied.first();
    let ambiguity = match winner {
        Some(chosen) if tied.len() > 1 => {
            tracing::warn!(
                chosen = %chosen.trigger,
                tied = tied.len(),
                "ambiguous trigger match, using declaration order"
            );
            Some(TurnWarning::AmbiguousTriggerMatch {
                chosen: chosen.trigger.clone(),
                tied: tied.iter().map(|e| e.trigger.clone()).collect(),
            })
        }
        _ => None,
    };

    ResolvedEvents {
        delta_intensity,
        mode_shift: winner.and_then(|e| e.mode_shift.clone()),
        breakthrough,
        ambiguity,
    }
}

/// Arc policy. Total over every input.
///
/// Rules, first match wins: a breakthrough gives `break`; a fall after
/// `break`/`recovery` gives `recovery`; two consecutive falls give `bottom`;
/// two consecutive rises give `rise`; a `break` that did not fall settles to
/// `stable`; anything else keeps the previous phase.
pub fn next_arc_phase(previous: ArcPhase, history: &[f32], breakthrough: bool) -> ArcPhase {
    if breakthrough {
        return ArcPhase::Break;
    }
    if history.is_empty() {
        return ArcPhase::Stable;
    }

    let diffs: Vec<f32> = history.windows(2).map(|w| w[1] - w[0]).collect();
    let trailing = |pred: fn(f32) -> bool| diffs.iter().rev().take_while(|d| pred(**d)).count();
    let falls = trailing(|d| d < -FLAT_EPSILON);
    let rises = trailing(|d| d > FLAT_EPSILON);

    match previous {
        ArcPhase::Break | ArcPhase::Recovery if falls >= 1 => ArcPhase::Recovery,
        _ if falls >= 2 => ArcPhase::Bottom,
        _ if rises >= 2 => ArcPhase::Rise,
        ArcPhase::Break => ArcPhase::Stable,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::matcher::LiteralMatcher;
    use crate::schema::persona::{PersonaId, Trigger};
    use std::collections::HashMap;

    fn make_persona(id: &str, triggers: Vec<Trigger>) -> PersonaProfile {
        PersonaProfile {
            id: PersonaId::from(id),
            name: id.to_string(),
            first_person_form: "I".to_string(),
            sentence_ending_patterns: Vec::new(),
            speech_quirks: Vec::new(),
            conflict_axes: Vec::new(),
            triggers,
            compensation_strategies: HashMap::new(),
            risk_flags: Vec::new(),
            baseline_intensity: 0.5,
            modes: Vec::new(),
            emotion_states: Vec::new(),
            example_lines: Vec::new(),
        }
    }

    fn make_trigger(name: &str, pattern: &str, delta: f32, mode: Option<&str>) -> Trigger {
        Trigger {
            name: name.to_string(),
            patterns: vec![pattern.to_string()],
            delta_intensity: delta,
            mode_shift: mode.map(Mode::new),
            tags: Vec::new(),
        }
    }

    fn make_event(name: &str, delta: f32, mode: Option<&str>, order: usize) -> TriggerEvent {
        TriggerEvent {
            listener: SpeakerId::from("A"),
            trigger: name.to_string(),
            delta_intensity: delta,
            mode_shift: mode.map(Mode::new),
            tags: Vec::new(),
            order,
        }
    }

    fn tracker() -> AffectTracker {
        AffectTracker::new(Box::new(LiteralMatcher))
    }

    #[test]
    fn affirmation_drops_shame_into_leak() {
        let a = make_persona(
            "a",
            vec![make_trigger("affirmed", "you matter", -0.5, Some("leak"))],
        );
        let b = make_persona("b", Vec::new());
        let (a_id, b_id) = (SpeakerId::from("A"), SpeakerId::from("B"));
        let mut a_state = AffectiveState::from_baseline(0.86);
        a_state.mode = Mode::new("shame");
        let b_state = AffectiveState::from_baseline(0.4);

        // B speaks; A's trigger fires and is queued, not applied.
        let update = tracker().apply_turn(TurnInput {
            speaker_id: &b_id,
            speaker: &b,
            speaker_state: &b_state,
            listener: Some(Listener {
                id: &a_id,
                persona: &a,
                state: &a_state,
            }),
            source_text: "Hey. You matter, okay?",
            inbound: &[],
        });
        assert_eq!(update.pending.len(), 1);
        assert!((a_state.intensity - 0.86).abs() < 1e-6);

        // A's next turn consumes it.
        let next = tracker().apply_turn(TurnInput {
            speaker_id: &a_id,
            speaker: &a,
            speaker_state: &a_state,
            listener: Some(Listener {
                id: &b_id,
                persona: &b,
                state: &update.speaker_state,
            }),
            source_text: "…idiot.",
            inbound: &update.pending,
        });
        assert!((next.speaker_state.intensity - 0.36).abs() < 1e-5);
        assert_eq!(next.speaker_state.mode, Mode::new("leak"));
        assert!(next
            .warnings
            .iter()
            .any(|w| w.tag() == "audit:triggers_fired"));
    }

    #[test]
    fn deltas_sum_then_clamp() {
        let a = make_persona("a", Vec::new());
        let id = SpeakerId::from("A");
        let state = AffectiveState::from_baseline(0.9);
        let events = vec![
            make_event("x", 0.3, None, 0),
            make_event("y", 0.4, None, 1),
        ];
        let update = tracker().apply_turn(TurnInput {
            speaker_id: &id,
            speaker: &a,
            speaker_state: &state,
            listener: None,
            source_text: "",
            inbound: &events,
        });
        assert_eq!(update.speaker_state.intensity, 1.0);
        assert!(update.pending.is_empty());
    }

    #[test]
    fn strongest_delta_picks_mode() {
        let events = vec![
            make_event("weak", 0.1, Some("rage"), 0),
            make_event("strong", -0.4, Some("numb"), 1),
        ];
        let resolved = resolve_events(&events);
        assert_eq!(resolved.mode_shift, Some(Mode::new("numb")));
        assert!(resolved.ambiguity.is_none());
        assert!((resolved.delta_intensity + 0.3).abs() < 1e-6);
    }

    #[test]
    fn tie_resolved_by_declaration_order_with_warning() {
        let events = vec![
            make_event("later", 0.3, Some("rage"), 4),
            make_event("earlier", -0.3, Some("plea"), 1),
        ];
        let resolved = resolve_events(&events);
        assert_eq!(resolved.mode_shift, Some(Mode::new("plea")));
        match resolved.ambiguity {
            Some(TurnWarning::AmbiguousTriggerMatch { chosen, tied }) => {
                assert_eq!(chosen, "earlier");
                assert_eq!(tied.len(), 2);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn strongest_without_mode_shift_keeps_mode() {
        let events = vec![
            make_event("big", 0.5, None, 0),
            make_event("small", 0.1, Some("rage"), 1),
        ];
        assert_eq!(resolve_events(&events).mode_shift, None);
    }

    #[test]
    fn speaker_state_untouched_by_own_line() {
        let a = make_persona("a", vec![make_trigger("self", "hello", 0.5, None)]);
        let b = make_persona("b", vec![make_trigger("greet", "hello", 0.2, None)]);
        let (a_id, b_id) = (SpeakerId::from("A"), SpeakerId::from("B"));
        let a_state = AffectiveState::from_baseline(0.5);
        let b_state = AffectiveState::from_baseline(0.5);
        let update = tracker().apply_turn(TurnInput {
            speaker_id: &a_id,
            speaker: &a,
            speaker_state: &a_state,
            listener: Some(Listener {
                id: &b_id,
                persona: &b,
                state: &b_state,
            }),
            source_text: "hello",
            inbound: &[],
        });
        assert!((update.speaker_state.intensity - 0.5).abs() < 1e-6);
        assert_eq!(update.pending[0].trigger, "greet");
        assert_eq!(update.pending[0].listener, b_id);
    }

    #[test]
    fn arc_first_turn_is_stable() {
        assert_eq!(next_arc_phase(ArcPhase::Stable, &[], false), ArcPhase::Stable);
        assert_eq!(next_arc_phase(ArcPhase::Stable, &[0.5], false), ArcPhase::Stable);
    }

    #[test]
    fn arc_breakthrough_wins() {
        assert_eq!(
            next_arc_phase(ArcPhase::Bottom, &[0.9, 0.5, 0.2], true),
            ArcPhase::Break
        );
    }

    #[test]
    fn arc_falls_and_rises() {
        assert_eq!(
            next_arc_phase(ArcPhase::Stable, &[0.9, 0.7, 0.5], false),
            ArcPhase::Bottom
        );
        assert_eq!(
            next_arc_phase(ArcPhase::Stable, &[0.2, 0.4, 0.6], false),
            ArcPhase::Rise
        );
        assert_eq!(
            next_arc_phase(ArcPhase::Rise, &[0.2, 0.4, 0.4], false),
            ArcPhase::Rise
        );
    }

    #[test]
    fn arc_recovers_after_break() {
        assert_eq!(
            next_arc_phase(ArcPhase::Break, &[0.8, 0.6], false),
            ArcPhase::Recovery
        );
        assert_eq!(
            next_arc_phase(ArcPhase::Break, &[0.6, 0.6], false),
            ArcPhase::Stable
        );
    }

    #[test]
    fn arc_policy_is_total() {
        let phases = [
            ArcPhase::Stable,
            ArcPhase::Rise,
            ArcPhase::Bottom,
            ArcPhase::Break,
            ArcPhase::Recovery,
        ];
        let histories: [&[f32]; 6] = [
            &[],
            &[0.5],
            &[0.1, 0.9],
            &[0.9, 0.1, 0.5],
            &[f32::NAN, 0.5],
            &[1.0, 1.0, 1.0, 1.0],
        ];
        for phase in phases {
            for history in histories {
                for breakthrough in [false, true] {
                    let next = next_arc_phase(phase, history, breakthrough);
                    assert!(phases.contains(&next));
                }
            }
        }
    }
}
