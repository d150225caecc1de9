/// IAP: illocutionary-act preservation between a source line and its
/// translation. Pure and deterministic.
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::core::acts::{strip_honorifics, ActType, AddressMode, ExtractedActs, SpeechAct, TargetRole};

const CRITICAL_LOSS_PENALTY: f32 = 0.2;
const CRITICAL_LOSS_CAP: f32 = 0.4;
const GATE_GAMMA: f32 = 0.7;
/// Pass-one threshold: only exact type matches pair up first.
const EXACT_MATCH: f32 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreservedAct {
    pub original: ActType,
    pub translated: ActType,
    pub type_match: f32,
    pub target_match: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IapScore {
    pub overall: f32,
    pub set: f32,
    pub force: f32,
    pub target: f32,
    pub critical_loss_penalty: f32,
    pub address_penalty: f32,
    pub preserved: Vec<PreservedAct>,
    pub lost: Vec<ActType>,
    pub added: Vec<ActType>,
    pub markers: Vec<String>,
}

const EQUIV_CLASSES: &[&[ActType]] = &[
    &[ActType::Assert, ActType::DenyAssumption],
    &[ActType::Direct, ActType::Request, ActType::Command],
    &[ActType::AssertChoice, ActType::Commit, ActType::Vow],
    &[ActType::CloseEscape, ActType::Deny],
];

const CLOSE_PAIRS: &[(ActType, ActType, f32)] = &[
    (ActType::Assert, ActType::AssertChoice, 0.75),
    (ActType::Assert, ActType::CloseEscape, 0.70),
    (ActType::Assert, ActType::Express, 0.60),
    (ActType::Request, ActType::Direct, 0.7),
    (ActType::Deny, ActType::DenyAssumption, 0.75),
    (ActType::CloseEscape, ActType::Deny, 0.7),
    (ActType::Commit, ActType::Vow, 0.9),
    (ActType::AssertChoice, ActType::CloseEscape, 0.65),
    (ActType::Ultimatum, ActType::Commit, 0.6),
    (ActType::Express, ActType::AssertChoice, 0.50),
];

/// Similarity of two act types: 1 for identity, 0.8 within an equivalence
/// class, a fixed score for known near pairs, else 0.
pub fn act_type_match(a: ActType, b: ActType) -> f32 {
    if a == b {
        return 1.0;
    }
    if EQUIV_CLASSES
        .iter()
        .any(|class| class.contains(&a) && class.contains(&b))
    {
        return 0.8;
    }
    CLOSE_PAIRS
        .iter()
        .find(|(x, y, _)| (*x == a && *y == b) || (*x == b && *y == a))
        .map(|(_, _, score)| *score)
        .unwrap_or(0.0)
}

/// Role agreement, with act-specific allowances where two roles are
/// interchangeable for that act.
pub fn role_match(original: TargetRole, translated: TargetRole, act: ActType) -> f32 {
    use TargetRole::*;
    if original == translated {
        return 1.0;
    }
    let compat: &[(TargetRole, TargetRole, f32)] = match act {
        ActType::CloseEscape => &[
            (Listener, Situation, 0.90),
            (Listener, Proposition, 0.90),
            (Situation, Proposition, 0.95),
            (ThirdParty, Situation, 0.85),
            (ThirdParty, Proposition, 0.85),
        ],
        ActType::Ultimatum => &[(Listener, Situation, 0.85), (Listener, Proposition, 0.80)],
        ActType::DenyAssumption => &[(Proposition, Situation, 0.90), (Proposition, Listener, 0.75)],
        _ => &[],
    };
    if let Some((_, _, score)) = compat.iter().find(|(a, b, _)| {
        (*a == original && *b == translated) || (*a == translated && *b == original)
    }) {
        return *score;
    }

    match (original, translated) {
        (Listener, ThirdParty) | (ThirdParty, Listener) => 0.85,
        (Speaker, Listener) | (Listener, Speaker) => 0.70,
        (Speaker, ThirdParty) | (ThirdParty, Speaker) => 0.50,
        (a, b) if !a.is_person() && !b.is_person() => 0.80,
        (a, b) if a.is_person() != b.is_person() => 0.30,
        _ => 0.40,
    }
}

static KANA: Lazy<FxHashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("あ", "a"), ("い", "i"), ("う", "u"), ("え", "e"), ("お", "o"),
        ("か", "ka"), ("き", "ki"), ("く", "ku"), ("け", "ke"), ("こ", "ko"),
        ("さ", "sa"), ("し", "shi"), ("す", "su"), ("せ", "se"), ("そ", "so"),
        ("た", "ta"), ("ち", "chi"), ("つ", "tsu"), ("て", "te"), ("と", "to"),
        ("な", "na"), ("に", "ni"), ("ぬ", "nu"), ("ね", "ne"), ("の", "no"),
        ("は", "ha"), ("ひ", "hi"), ("ふ", "fu"), ("へ", "he"), ("ほ", "ho"),
        ("ま", "ma"), ("み", "mi"), ("む", "mu"), ("め", "me"), ("も", "mo"),
        ("や", "ya"), ("ゆ", "yu"), ("よ", "yo"),
        ("ら", "ra"), ("り", "ri"), ("る", "ru"), ("れ", "re"), ("ろ", "ro"),
        ("わ", "wa"), ("を", "wo"), ("ん", "n"),
        ("が", "ga"), ("ぎ", "gi"), ("ぐ", "gu"), ("げ", "ge"), ("ご", "go"),
        ("ざ", "za"), ("じ", "ji"), ("ず", "zu"), ("ぜ", "ze"), ("ぞ", "zo"),
        ("だ", "da"), ("ぢ", "di"), ("づ", "du"), ("で", "de"), ("ど", "do"),
        ("ば", "ba"), ("び", "bi"), ("ぶ", "bu"), ("べ", "be"), ("ぼ", "bo"),
        ("ぱ", "pa"), ("ぴ", "pi"), ("ぷ", "pu"), ("ぺ", "pe"), ("ぽ", "po"),
        ("きゃ", "kya"), ("きゅ", "kyu"), ("きょ", "kyo"),
        ("しゃ", "sha"), ("しゅ", "shu"), ("しょ", "sho"),
        ("ちゃ", "cha"), ("ちゅ", "chu"), ("ちょ", "cho"),
        ("にゃ", "nya"), ("にゅ", "nyu"), ("にょ", "nyo"),
        ("ひゃ", "hya"), ("ひゅ", "hyu"), ("ひょ", "hyo"),
        ("みゃ", "mya"), ("みゅ", "myu"), ("みょ", "myo"),
        ("りゃ", "rya"), ("りゅ", "ryu"), ("りょ", "ryo"),
        ("ぎゃ", "gya"), ("ぎゅ", "gyu"), ("ぎょ", "gyo"),
        ("じゃ", "ja"), ("じゅ", "ju"), ("じょ", "jo"),
        ("びゃ", "bya"), ("びゅ", "byu"), ("びょ", "byo"),
        ("ぴゃ", "pya"), ("ぴゅ", "pyu"), ("ぴょ", "pyo"),
        ("ふぁ", "fa"), ("ふぃ", "fi"), ("ふぇ", "fe"), ("ふぉ", "fo"),
        ("てぃ", "ti"), ("でぃ", "di"), ("うぃ", "wi"), ("うぇ", "we"),
        ("ちぇ", "che"), ("しぇ", "she"), ("じぇ", "je"),
        ("っ", ""), ("ー", ""),
    ]
    .into_iter()
    .collect()
});

/// Katakana to hiragana, then hiragana to romaji. Sokuon and the long-vowel
/// mark vanish; repeated letters are collapsed later anyway.
fn romanize(text: &str) -> String {
    let hira: Vec<char> = text
        .chars()
        .map(|c| match c as u32 {
            0x30A1..=0x30F6 => char::from_u32(c as u32 - 0x60).unwrap_or(c),
            _ => c,
        })
        .collect();
    let mut out = String::new();
    let mut i = 0;
    while i < hira.len() {
        if i + 1 < hira.len() {
            let pair: String = hira[i..i + 2].iter().collect();
            if let Some(r) = KANA.get(pair.as_str()) {
                out.push_str(r);
                i += 2;
                continue;
            }
        }
        let single = hira[i].to_string();
        match KANA.get(single.as_str()) {
            Some(r) => out.push_str(r),
            None => out.push(hira[i]),
        }
        i += 1;
    }
    out
}

/// Comparable form of an entity name: honorifics dropped, kana romanized,
/// l/r merged and doubled letters collapsed.
pub fn canonical_entity(entity: &str) -> String {
    let stripped = strip_honorifics(&entity.trim().to_lowercase());
    let romanized = romanize(&stripped);
    let mut out = String::new();
    for c in romanized.chars().filter(|c| c.is_ascii_alphanumeric()) {
        let c = if c == 'l' { 'r' } else { c };
        if !out.ends_with(c) {
            out.push(c);
        }
    }
    out
}

fn strip_trailing_vowels(s: &str) -> &str {
    s.trim_end_matches(['a', 'i', 'u', 'e', 'o'])
}

/// Generic referents, already in canonical form.
const GENERIC_ENTITIES: &[&[&str]] = &[
    &["ristener", "adrese", "you", "hearer", "anata"],
    &["speaker", "serf", "myserf", "watashi", "boku", "ore"],
    &["arternatives", "others", "anyone", "other", "hoka", "betsu"],
    &["everyone", "mina"],
];

pub fn entity_match(original: &str, translated: &str) -> f32 {
    let a = canonical_entity(original);
    let b = canonical_entity(translated);
    if a.is_empty() || b.is_empty() {
        return 0.5;
    }
    if a == b {
        return 1.0;
    }
    let (sa, sb) = (strip_trailing_vowels(&a), strip_trailing_vowels(&b));
    if !sa.is_empty() && sa == sb {
        return 0.95;
    }
    if a.contains(&b) || b.contains(&a) {
        return 0.90;
    }
    if !sa.is_empty() && !sb.is_empty() && (sa.contains(sb) || sb.contains(sa)) {
        return 0.88;
    }
    if a.len() >= 3 && b.len() >= 3 && a[..3] == b[..3] {
        return 0.85;
    }
    if a.len() > 6 && b.len() > 6 && (0..=a.len() - 3).any(|i| b.contains(&a[i..i + 3])) {
        return 0.80;
    }
    let generic = GENERIC_ENTITIES.iter().any(|set| {
        set.iter().any(|kw| a.contains(kw)) && set.iter().any(|kw| b.contains(kw))
    });
    if generic {
        0.75
    } else {
        0.30
    }
}

pub fn target_match(original: &SpeechAct, translated: &SpeechAct) -> f32 {
    0.6 * role_match(original.target_role, translated.target_role, original.act_type)
        + 0.4 * entity_match(&original.target_entity, &translated.target_entity)
}

/// Penalty for a change of address mode. Turning direct address into a
/// report is the costliest shift.
pub fn address_penalty(original: AddressMode, translated: AddressMode) -> f32 {
    use AddressMode::*;
    match (original, translated) {
        (Direct, Reported) => 0.35,
        (Direct, Monologue) => 0.20,
        (Reported, Direct) | (Reported, Monologue) | (Monologue, Direct) => 0.10,
        (Monologue, Reported) => 0.15,
        _ => 0.0,
    }
}

fn clip01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

/// Pair up acts in two passes: exact types first, then the best remaining
/// similar type. Returns (original index, translated index, type match).
fn match_acts(original: &[SpeechAct], translated: &[SpeechAct]) -> Vec<(usize, usize, f32)> {
    let mut used_t = vec![false; translated.len()];
    let mut used_o = vec![false; original.len()];
    let mut pairs = Vec::new();

    for threshold in [EXACT_MATCH, f32::MIN_POSITIVE] {
        for (i, oa) in original.iter().enumerate() {
            if used_o[i] {
                continue;
            }
            let mut best: Option<(usize, f32)> = None;
            for (j, ta) in translated.iter().enumerate() {
                if used_t[j] {
                    continue;
                }
                let s = act_type_match(oa.act_type, ta.act_type);
                if s >= threshold && best.map_or(true, |(_, b)| s > b) {
                    best = Some((j, s));
                }
            }
            if let Some((j, s)) = best {
                used_o[i] = true;
                used_t[j] = true;
                pairs.push((i, j, s));
            }
        }
    }
    pairs
}

fn weighted(act: &SpeechAct) -> f32 {
    act.act_type.force_weight() * act.intensity
}

pub fn score_acts(original: &ExtractedActs, translated: &ExtractedActs) -> IapScore {
    let o_acts = &original.acts;
    let t_acts = &translated.acts;
    let pairs = match_acts(o_acts, t_acts);

    let matched_o: Vec<usize> = pairs.iter().map(|(i, _, _)| *i).collect();
    let matched_t: Vec<usize> = pairs.iter().map(|(_, j, _)| *j).collect();
    let lost: Vec<ActType> = o_acts
        .iter()
        .enumerate()
        .filter(|(i, _)| !matched_o.contains(i))
        .map(|(_, a)| a.act_type)
        .collect();
    let added: Vec<ActType> = t_acts
        .iter()
        .enumerate()
        .filter(|(j, _)| !matched_t.contains(j))
        .map(|(_, a)| a.act_type)
        .collect();

    let set = if o_acts.is_empty() {
        1.0
    } else {
        pairs.len() as f32 / o_acts.len() as f32
    };

    let total_weight: f32 = o_acts.iter().map(weighted).sum();
    let force = if total_weight > 0.0 {
        let kept: f32 = pairs
            .iter()
            .map(|&(i, j, type_match)| {
                let (ow, tw) = (weighted(&o_acts[i]), weighted(&t_acts[j]));
                let agreement = 1.0 - (ow - tw).abs() / ow.max(tw).max(0.01);
                ow * type_match * clip01(agreement)
            })
            .sum();
        kept / total_weight
    } else {
        1.0
    };

    let preserved: Vec<PreservedAct> = pairs
        .iter()
        .map(|&(i, j, type_match)| PreservedAct {
            original: o_acts[i].act_type,
            translated: t_acts[j].act_type,
            type_match,
            target_match: target_match(&o_acts[i], &t_acts[j]),
        })
        .collect();

    let target = if o_acts.is_empty() {
        1.0
    } else {
        let (sum, weight) = preserved.iter().fold((0.0, 0.0), |(sum, weight), p| {
            let w = p.original.target_weight();
            (sum + p.target_match * w, weight + w)
        });
        if weight > 0.0 {
            sum / weight
        } else {
            0.0
        }
    };

    let critical_lost: Vec<ActType> = lost.iter().copied().filter(ActType::is_critical).collect();
    let critical_loss_penalty =
        (CRITICAL_LOSS_PENALTY * critical_lost.len() as f32).min(CRITICAL_LOSS_CAP);
    let address = address_penalty(original.address_mode, translated.address_mode);

    let base = 0.4 * set + 0.35 * force + 0.25 * target;
    let gate = set.min(force).min(target).max(0.0).powf(GATE_GAMMA);
    let overall = clip01(base * gate - critical_loss_penalty - address);

    let mut markers: Vec<String> = lost.iter().map(|a| format!("lost:{a}")).collect();
    markers.extend(added.iter().map(|a| format!("added:{a}")));
    markers.extend(critical_lost.iter().map(|a| format!("critical_loss:{a}")));
    if address > 0.0 {
        markers.push(format!(
            "address:{}->{}",
            original.address_mode.name(),
            translated.address_mode.name()
        ));
    }

    IapScore {
        overall,
        set: clip01(set),
        force: clip01(force),
        target: clip01(target),
        critical_loss_penalty,
        address_penalty: address,
        preserved,
        lost,
        added,
        markers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_act(act_type: ActType, role: TargetRole, entity: &str, intensity: f32) -> SpeechAct {
        SpeechAct {
            act_type,
            target_role: role,
            target_entity: entity.to_string(),
            force: String::new(),
            intensity,
        }
    }

    fn make_acts(acts: Vec<SpeechAct>, address_mode: AddressMode) -> ExtractedActs {
        ExtractedActs {
            primary_act: acts.first().map(|a| a.act_type).unwrap_or(ActType::Assert),
            overall_force: String::new(),
            acts,
            address_mode,
        }
    }

    fn confession(address_mode: AddressMode, role: TargetRole) -> ExtractedActs {
        make_acts(
            vec![
                make_act(ActType::Express, role, "Subaru", 0.9),
                make_act(ActType::AssertChoice, role, "Subaru", 0.9),
            ],
            address_mode,
        )
    }

    #[test]
    fn identical_acts_score_one() {
        let original = confession(AddressMode::Direct, TargetRole::Listener);
        let score = score_acts(&original, &original.clone());
        assert!((score.overall - 1.0).abs() < 1e-5);
        assert!(score.markers.is_empty());
    }

    #[test]
    fn reported_confession_scores_below_direct() {
        let original = make_acts(
            vec![
                make_act(ActType::Express, TargetRole::Listener, "スバルくん", 0.9),
                make_act(ActType::AssertChoice, TargetRole::Listener, "スバルくん", 0.9),
            ],
            AddressMode::Direct,
        );
        let direct = confession(AddressMode::Direct, TargetRole::Listener);
        let reported = confession(AddressMode::Reported, TargetRole::ThirdParty);

        let keep = score_acts(&original, &direct);
        let report = score_acts(&original, &reported);
        assert!(keep.overall > report.overall);
        assert_eq!(report.address_penalty, 0.35);
        assert!(report.markers.contains(&"address:direct->reported".to_string()));
    }

    #[test]
    fn address_penalty_is_asymmetric() {
        assert!(
            address_penalty(AddressMode::Direct, AddressMode::Reported)
                > address_penalty(AddressMode::Reported, AddressMode::Direct)
        );
        assert_eq!(address_penalty(AddressMode::Monologue, AddressMode::Monologue), 0.0);
    }

    #[test]
    fn critical_loss_is_capped() {
        let original = make_acts(
            vec![
                make_act(ActType::CloseEscape, TargetRole::Situation, "others", 1.0),
                make_act(ActType::Ultimatum, TargetRole::Listener, "you", 1.0),
                make_act(ActType::Declare, TargetRole::Situation, "us", 1.0),
            ],
            AddressMode::Direct,
        );
        let flat = make_acts(
            vec![make_act(ActType::Express, TargetRole::Speaker, "self", 0.3)],
            AddressMode::Direct,
        );
        let score = score_acts(&original, &flat);
        assert_eq!(score.critical_loss_penalty, CRITICAL_LOSS_CAP);
        assert_eq!(score.overall, 0.0);
        assert!(score.markers.contains(&"critical_loss:ULTIMATUM".to_string()));
        assert!(score.markers.contains(&"added:EXPRESS".to_string()));
    }

    #[test]
    fn exact_types_pair_before_similar_ones() {
        let original = make_acts(
            vec![
                make_act(ActType::Assert, TargetRole::Listener, "you", 0.5),
                make_act(ActType::AssertChoice, TargetRole::Listener, "you", 0.5),
            ],
            AddressMode::Direct,
        );
        let translated = make_acts(
            vec![
                make_act(ActType::AssertChoice, TargetRole::Listener, "you", 0.5),
                make_act(ActType::Assert, TargetRole::Listener, "you", 0.5),
            ],
            AddressMode::Direct,
        );
        let score = score_acts(&original, &translated);
        assert!(score.preserved.iter().all(|p| p.type_match == 1.0));
    }

    #[test]
    fn type_similarity_table() {
        assert_eq!(act_type_match(ActType::Request, ActType::Command), 0.8);
        assert_eq!(act_type_match(ActType::Deny, ActType::DenyAssumption), 0.75);
        assert_eq!(act_type_match(ActType::Express, ActType::Ultimatum), 0.0);
    }

    #[test]
    fn role_compatibility_depends_on_act() {
        assert_eq!(
            role_match(TargetRole::Listener, TargetRole::Situation, ActType::CloseEscape),
            0.90
        );
        assert_eq!(
            role_match(TargetRole::Listener, TargetRole::Situation, ActType::Express),
            0.30
        );
        assert_eq!(
            role_match(TargetRole::Situation, TargetRole::Abstract, ActType::Express),
            0.80
        );
    }

    #[test]
    fn entity_names_match_across_scripts() {
        assert_eq!(canonical_entity("スバルくん"), "subaru");
        assert_eq!(entity_match("スバルくん", "Subaru"), 1.0);
        assert_eq!(entity_match("レム", "Rem"), 0.95);
        assert_eq!(entity_match("you", "the listener"), 0.75);
        assert_eq!(entity_match("", "anyone"), 0.5);
    }

    #[test]
    fn empty_original_is_trivially_preserved() {
        let empty = make_acts(vec![], AddressMode::Direct);
        let score = score_acts(&empty, &empty.clone());
        assert_eq!(score.overall, 1.0);
    }
}
