/// ZAP: z-axis preservation. Checks that the surface markers predicted for a
/// turn survive into the candidate translation, and that nothing was
/// invented on top of them.
use serde::{Deserialize, Serialize};

use crate::core::lexicon::{detect_markers, implied_markers, CompensationDevice};
use crate::schema::persona::PersonaProfile;
use crate::schema::record::{MarkerSet, ZLeakMarker};

const RECALL_WEIGHT: f32 = 0.75;
const VOICE_WEIGHT: f32 = 0.25;
const ADDITION_RATE: f32 = 0.15;
const ADDITION_CAP: f32 = 0.45;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZapScore {
    pub score: f32,
    pub recall: f32,
    pub voice: f32,
    pub addition_penalty: f32,
    pub realized: MarkerSet,
    pub markers: Vec<String>,
}

fn weight<'a>(markers: impl Iterator<Item = &'a ZLeakMarker>) -> f32 {
    markers.map(ZLeakMarker::salience).sum()
}

/// Score `candidate` against the markers predicted for the turn.
///
/// Custom markers are outside the lexicon's reach: they are neither
/// credited nor charged. Markers that only appear inside a predicted
/// marker's own surface form are not charged either.
pub fn score_zap(
    predicted: &MarkerSet,
    candidate: &str,
    persona: &PersonaProfile,
    target_lang: &str,
) -> ZapScore {
    let realized = detect_markers(candidate);
    let checkable: MarkerSet = predicted
        .iter()
        .filter(|m| !matches!(m, ZLeakMarker::Custom(_)))
        .cloned()
        .collect();

    let predicted_weight = checkable.total_salience();
    let recall = if predicted_weight > 0.0 {
        weight(checkable.iter().filter(|m| realized.contains(m))) / predicted_weight
    } else {
        1.0
    };

    let implied = implied_markers(candidate, &checkable);
    let unrequested: Vec<&ZLeakMarker> = realized
        .difference(&checkable)
        .filter(|m| !implied.contains(m))
        .collect();
    let addition_penalty =
        (ADDITION_RATE * weight(unrequested.iter().copied())).min(ADDITION_CAP);

    let devices: Vec<CompensationDevice> = persona
        .compensation_for(target_lang)
        .iter()
        .filter_map(|s| CompensationDevice::recognize(s))
        .collect();
    let missing_devices: Vec<CompensationDevice> = devices
        .iter()
        .copied()
        .filter(|d| !d.is_realized(candidate))
        .collect();
    let voice = if devices.is_empty() {
        1.0
    } else {
        (devices.len() - missing_devices.len()) as f32 / devices.len() as f32
    };

    let score = (RECALL_WEIGHT * recall + VOICE_WEIGHT * voice - addition_penalty).clamp(0.0, 1.0);

    let mut markers: Vec<String> = checkable
        .difference(&realized)
        .map(|m| format!("missing:{m}"))
        .collect();
    markers.extend(unrequested.iter().map(|m| format!("unrequested:{m}")));
    markers.extend(missing_devices.iter().map(|d| format!("device_missing:{d}")));

    ZapScore {
        score,
        recall,
        voice,
        addition_penalty,
        realized,
        markers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::persona::PersonaProfile;

    fn make_persona(devices: &str) -> PersonaProfile {
        PersonaProfile::parse_ron(&format!(
            r#"(
                id: "rin",
                name: "Rin",
                first_person_form: "あたし",
                compensation_strategies: {{"en": [{devices}]}},
            )"#
        ))
        .unwrap()
    }

    fn predicted(markers: &[ZLeakMarker]) -> MarkerSet {
        markers.iter().cloned().collect()
    }

    #[test]
    fn exact_markers_score_full() {
        let persona = make_persona("");
        let m = predicted(&[ZLeakMarker::Stutter, ZLeakMarker::Ellipsis]);
        let z = score_zap(&m, "I-I didn't... whatever", &persona, "en");
        assert_eq!(z.recall, 1.0);
        assert_eq!(z.addition_penalty, 0.0);
        assert_eq!(z.score, 1.0);
        assert!(z.markers.is_empty());
    }

    #[test]
    fn added_marker_scores_lower() {
        let persona = make_persona("");
        let m = predicted(&[ZLeakMarker::Stutter, ZLeakMarker::Ellipsis]);
        let exact = score_zap(&m, "I-I didn't... whatever", &persona, "en");
        let extra = score_zap(&m, "I-I didn't... I mean, whatever", &persona, "en");
        assert!(extra.score < exact.score);
        assert!(extra.markers.contains(&"unrequested:overwrite".to_string()));
    }

    #[test]
    fn dropped_marker_scores_lower() {
        let persona = make_persona("");
        let m = predicted(&[ZLeakMarker::Stutter, ZLeakMarker::Ellipsis]);
        let exact = score_zap(&m, "I-I didn't... whatever", &persona, "en");
        let dropped = score_zap(&m, "I didn't... whatever", &persona, "en");
        assert!(dropped.score < exact.score);
        assert!(dropped.markers.contains(&"missing:stutter".to_string()));
    }

    #[test]
    fn nothing_predicted_and_nothing_added() {
        let persona = make_persona("");
        let z = score_zap(&MarkerSet::new(), "Fine. Let's go.", &persona, "en");
        assert_eq!(z.score, 1.0);
    }

    #[test]
    fn addition_penalty_is_capped() {
        let persona = make_persona("");
        let z = score_zap(
            &MarkerSet::new(),
            "N-no, no... I mean, I'm useless, I always fail—",
            &persona,
            "en",
        );
        assert_eq!(z.addition_penalty, ADDITION_CAP);
    }

    #[test]
    fn voice_counts_recognizable_devices() {
        let persona = make_persona(r#""contractions", "em-dash interruption", "stay warm""#);
        let z = score_zap(&MarkerSet::new(), "I'm here, okay.", &persona, "en");
        assert_eq!(z.voice, 0.5);
        assert!(z.markers.contains(&"device_missing:em_dash".to_string()));
    }

    #[test]
    fn em_dash_stutter_is_a_stutter() {
        let persona = make_persona("");
        let m = predicted(&[ZLeakMarker::Stutter, ZLeakMarker::Ellipsis]);
        let z = score_zap(&m, "I— I... didn't mean it", &persona, "en");
        assert_eq!(z.realized.names(), vec!["stutter", "ellipsis"]);
        assert_eq!(z.score, 1.0);
        assert!(z.markers.is_empty());
    }

    #[test]
    fn trailing_ellipsis_is_not_charged_as_extra() {
        let persona = make_persona("");
        let m = predicted(&[ZLeakMarker::Stutter, ZLeakMarker::Trailing]);
        let z = score_zap(&m, "I-it's not like I did it for you...", &persona, "en");
        assert_eq!(z.addition_penalty, 0.0);
        assert_eq!(z.score, 1.0);

        // a second ellipsis mid-line is still an addition
        let extra = score_zap(&m, "I-it's... not like I did it for you...", &persona, "en");
        assert!(extra.markers.contains(&"unrequested:ellipsis".to_string()));
    }

    #[test]
    fn repeated_word_carries_its_dash_and_quantifier() {
        let persona = make_persona("");
        let m = predicted(&[ZLeakMarker::Repetition]);
        let z = score_zap(&m, "Nobody— nobody came.", &persona, "en");
        assert_eq!(z.recall, 1.0);
        assert_eq!(z.addition_penalty, 0.0);
        assert_eq!(z.score, 1.0);
    }

    #[test]
    fn custom_markers_are_not_charged() {
        let persona = make_persona("");
        let m = predicted(&[ZLeakMarker::Custom("sigh".to_string())]);
        let z = score_zap(&m, "Fine.", &persona, "en");
        assert_eq!(z.recall, 1.0);
    }
}
