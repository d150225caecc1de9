/// Illocutionary acts: the canonical vocabulary, label normalization, and
/// the extractors that turn an utterance into a set of acts.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::core::generation::{
    parse_json, GenerationRequest, GenerationTask, ResilientGenerator, ResponseFormat, RetryError,
};

#[derive(Debug, Error)]
pub enum ActExtractionError {
    #[error("act extraction failed: {0}")]
    Generation(#[from] RetryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActType {
    Assert,
    AssertChoice,
    CloseEscape,
    Express,
    Direct,
    Commit,
    Deny,
    DenyAssumption,
    Ultimatum,
    Request,
    Command,
    Vow,
    Declare,
}

impl ActType {
    pub const ALL: [ActType; 13] = [
        Self::Assert,
        Self::AssertChoice,
        Self::CloseEscape,
        Self::Express,
        Self::Direct,
        Self::Commit,
        Self::Deny,
        Self::DenyAssumption,
        Self::Ultimatum,
        Self::Request,
        Self::Command,
        Self::Vow,
        Self::Declare,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Assert => "ASSERT",
            Self::AssertChoice => "ASSERT_CHOICE",
            Self::CloseEscape => "CLOSE_ESCAPE",
            Self::Express => "EXPRESS",
            Self::Direct => "DIRECT",
            Self::Commit => "COMMIT",
            Self::Deny => "DENY",
            Self::DenyAssumption => "DENY_ASSUMPTION",
            Self::Ultimatum => "ULTIMATUM",
            Self::Request => "REQUEST",
            Self::Command => "COMMAND",
            Self::Vow => "VOW",
            Self::Declare => "DECLARE",
        }
    }

    /// Map any label, canonical or invented, onto the vocabulary.
    /// Unrecognizable labels fall back to `ASSERT`.
    pub fn normalize(label: &str) -> Self {
        let upper = label.trim().to_uppercase().replace(|c: char| c == ' ' || c == '-', "_");
        if let Some(act) = Self::ALL.iter().find(|a| a.name() == upper) {
            return *act;
        }
        let exact = match upper.as_str() {
            "ASSERTION" | "STATEMENT" | "STATE" | "DESCRIBE" | "CLAIM" => Some(Self::Assert),
            "PROMISE" | "PLEDGE" => Some(Self::Commit),
            "CHOICE" => Some(Self::AssertChoice),
            "EXPRESSION" | "EMOTION" | "EMOTE" | "EXPRESSIVE" => Some(Self::Express),
            "ORDER" => Some(Self::Command),
            "DIRECTIVE" | "PRESSURE" => Some(Self::Direct),
            "DENIAL" | "REJECTION" | "REJECT" | "REFUSE" => Some(Self::Deny),
            "BLOCK" | "SHUTDOWN" | "EXCLUDE" => Some(Self::CloseEscape),
            _ => None,
        };
        if let Some(act) = exact {
            return act;
        }

        let lower = upper.to_lowercase();
        let has = |cues: &[&str]| cues.iter().any(|c| lower.contains(c));
        if has(&["confess", "love", "like", "desire", "want", "feel", "emotion", "express", "romantic", "affection"]) {
            Self::Express
        } else if has(&["choice", "choose", "select", "prefer", "exclusive", "specific", "only"]) {
            Self::AssertChoice
        } else if has(&["alternative", "escape", "block", "exclude", "close", "shut", "eliminate"]) {
            Self::CloseEscape
        } else if has(&["deny", "negat", "reject", "refus"]) {
            Self::Deny
        } else if has(&["assumption", "presuppos", "correct", "wrong"]) {
            Self::DenyAssumption
        } else if has(&["commit", "promise", "pledge", "resolve", "swear"]) {
            Self::Commit
        } else if has(&["vow", "oath"]) {
            Self::Vow
        } else if has(&["direct", "pressure", "demand", "urge", "push"]) {
            Self::Direct
        } else if has(&["request", "ask", "beg", "plead"]) {
            Self::Request
        } else if has(&["command", "order", "instruct"]) {
            Self::Command
        } else if has(&["ultimatum", "condition", "if_not", "or_else"]) {
            Self::Ultimatum
        } else if has(&["declar", "announce", "pronounce"]) {
            Self::Declare
        } else {
            Self::Assert
        }
    }

    /// Extractors over-use `ASSERT`; re-read the force text for a more
    /// specific act.
    pub fn promote_by_force(self, force: &str, entity: &str) -> Self {
        if self != Self::Assert {
            return self;
        }
        let combined = format!("{} {}", force, entity).to_lowercase();
        let has = |cues: &[&str]| cues.iter().any(|c| combined.contains(c));
        let closing = ["close", "block", "reject", "refuse"];

        if has(&[
            "close", "block", "reject", "refuse", "unacceptable", "won't have", "won't accept",
            "can't accept", "cannot accept", "no one else", "nothing else", "not acceptable",
            "alternative", "other option", "other choice", "eliminate", "exclude", "shut",
        ]) {
            Self::CloseEscape
        } else if has(&[
            "only", "exclusive", "the one", "no other", "sole", "must be", "has to be",
            "none but", "just you", "specific", "selected", "preferred",
        ]) && !has(&closing)
        {
            Self::AssertChoice
        } else if has(&[
            "want", "desire", "like", "love", "prefer", "feeling", "emotion", "affection",
            "longing", "attracted", "fond of", "care for",
        ]) {
            Self::Express
        } else if has(&[
            "assumption", "presupposition", "implied", "mistaken", "wrong", "incorrect",
            "not true", "misunderstand",
        ]) {
            Self::DenyAssumption
        } else if has(&["will always", "will never", "promise", "vow", "swear", "commit", "pledge", "resolve"]) {
            Self::Commit
        } else {
            self
        }
    }

    /// Structural weight used by force preservation. Acts that change the
    /// shape of a relationship weigh more.
    pub fn force_weight(&self) -> f32 {
        match self {
            Self::Express | Self::Assert => 1.0,
            Self::AssertChoice => 1.3,
            Self::Deny | Self::DenyAssumption | Self::Direct | Self::Request | Self::Command => 1.2,
            Self::Commit | Self::Vow => 1.4,
            Self::CloseEscape => 1.5,
            Self::Declare => 1.6,
            Self::Ultimatum => 1.8,
        }
    }

    /// How much getting the target right matters for this act.
    pub fn target_weight(&self) -> f32 {
        match self {
            Self::CloseEscape | Self::Ultimatum => 2.0,
            Self::Direct | Self::Declare => 1.5,
            Self::Deny | Self::DenyAssumption => 1.3,
            Self::Commit | Self::Vow => 1.2,
            _ => 1.0,
        }
    }

    /// Losing one of these costs an explicit penalty.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::CloseEscape | Self::Ultimatum | Self::Declare | Self::DenyAssumption | Self::Commit
        )
    }
}

impl fmt::Display for ActType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetRole {
    #[serde(rename = "SELF")]
    Speaker,
    Listener,
    ThirdParty,
    Situation,
    Proposition,
    Abstract,
}

impl TargetRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Speaker => "SELF",
            Self::Listener => "LISTENER",
            Self::ThirdParty => "THIRD_PARTY",
            Self::Situation => "SITUATION",
            Self::Proposition => "PROPOSITION",
            Self::Abstract => "ABSTRACT",
        }
    }

    pub fn is_person(&self) -> bool {
        matches!(self, Self::Speaker | Self::Listener | Self::ThirdParty)
    }

    /// Lenient parse; unknown labels default to `LISTENER`.
    pub fn normalize(label: &str) -> Self {
        let upper = label.trim().to_uppercase().replace(|c: char| c == ' ' || c == '-', "_");
        match upper.as_str() {
            "SELF" | "SPEAKER" | "MYSELF" => return Self::Speaker,
            "LISTENER" | "ADDRESSEE" | "HEARER" | "AUDIENCE" => return Self::Listener,
            "THIRD_PARTY" | "OTHER" | "OTHERS" | "SOMEONE" => return Self::ThirdParty,
            "SITUATION" | "CONDITION" | "EVENT" | "CIRCUMSTANCE" | "STATE" | "RESULT" => {
                return Self::Situation
            }
            "PROPOSITION" | "TRUTH" | "ASSUMPTION" | "PREMISE" => return Self::Proposition,
            "ABSTRACT" | "CONCEPT" | "IDEA" | "VALUE" | "IDEAL" => return Self::Abstract,
            _ => {}
        }
        let lower = upper.to_lowercase();
        let has = |cues: &[&str]| cues.iter().any(|c| lower.contains(c));
        if has(&["self", "speaker", "myself", "own"]) {
            Self::Speaker
        } else if has(&["listen", "address", "you", "hearer"]) {
            Self::Listener
        } else if has(&["third", "other", "someone", "person"]) {
            Self::ThirdParty
        } else if has(&["situation", "condition", "event", "circumstance", "state", "result"]) {
            Self::Situation
        } else if has(&["proposition", "assumption", "premise", "claim", "that"]) {
            Self::Proposition
        } else if has(&["abstract", "value", "ideal", "meaning", "freedom", "justice", "concept"]) {
            Self::Abstract
        } else {
            Self::Listener
        }
    }
}

/// How an utterance addresses its audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressMode {
    #[default]
    Direct,
    Reported,
    Monologue,
}

impl AddressMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Reported => "reported",
            Self::Monologue => "monologue",
        }
    }

    pub fn parse_lenient(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "reported" => Self::Reported,
            "monologue" => Self::Monologue,
            _ => Self::Direct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechAct {
    pub act_type: ActType,
    pub target_role: TargetRole,
    pub target_entity: String,
    pub force: String,
    pub intensity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedActs {
    pub primary_act: ActType,
    pub overall_force: String,
    pub acts: Vec<SpeechAct>,
    pub address_mode: AddressMode,
}

/// Turns an utterance into its illocutionary acts.
#[async_trait]
pub trait ActExtractor: Send + Sync {
    async fn extract(
        &self,
        text: &str,
        lang: &str,
        context: Option<&str>,
    ) -> Result<ExtractedActs, ActExtractionError>;
}

const JA_HONORIFICS: [&str; 6] = ["くん", "さん", "ちゃん", "先輩", "先生", "様"];
const EN_HONORIFICS: [&str; 6] = ["-kun", "-san", "-chan", "-senpai", "-sensei", "-sama"];

/// When the entity is addressed by name in the text, the act targets the
/// listener no matter what the extractor said.
pub fn apply_vocative_correction(act: &mut SpeechAct, text: &str) {
    let text = text.to_lowercase();
    let name = strip_honorifics(&act.target_entity.to_lowercase());
    let name = name.trim();
    if name.is_empty() {
        return;
    }
    let addressed = JA_HONORIFICS
        .iter()
        .any(|suffix| text.contains(&format!("{name}{suffix}")))
        || [",", "—", "!", ".", "-kun", "-san"]
            .iter()
            .any(|p| text.contains(&format!("{name}{p}")));
    if addressed {
        act.target_role = TargetRole::Listener;
    }
}

pub(crate) fn strip_honorifics(entity: &str) -> String {
    let mut out = entity.to_string();
    for suffix in EN_HONORIFICS.iter().chain(JA_HONORIFICS.iter()) {
        out = out.replace(suffix, "");
    }
    out
}

/// Deterministic cue-lexicon extractor for English and Japanese.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalActExtractor;

struct Cue {
    act: ActType,
    phrases: &'static [&'static str],
}

const CUES: &[Cue] = &[
    Cue {
        act: ActType::CloseEscape,
        phrases: &["no one else", "anyone else", "won't accept", "can't accept", "nobody else", "じゃなきゃ", "でなきゃ", "以外は", "じゃないと嫌"],
    },
    Cue {
        act: ActType::AssertChoice,
        phrases: &["only you", "has to be", "the one", "it's you", "i choose", "がいい", "が良い", "しかいない", "だけなの"],
    },
    Cue {
        act: ActType::Ultimatum,
        phrases: &["if you don't", "or else", "otherwise", "unless you", "なければ", "ないなら", "しないと"],
    },
    Cue {
        act: ActType::Vow,
        phrases: &["i swear", "i vow", "誓う", "誓います"],
    },
    Cue {
        act: ActType::Commit,
        phrases: &["i will", "i'll always", "i'll never", "i promise", "i won't", "約束", "絶対に守る", "してみせる"],
    },
    Cue {
        act: ActType::DenyAssumption,
        phrases: &["that's not", "you're wrong", "not true", "that isn't", "it's not like", "違う", "そうじゃない", "勘違い"],
    },
    Cue {
        act: ActType::Request,
        phrases: &["please", "could you", "would you", "お願い", "ください", "てほしい", "て欲しい"],
    },
    Cue {
        act: ActType::Command,
        phrases: &["stop it", "get out", "shut up", "listen to me", "やめろ", "黙れ", "しろ"],
    },
    Cue {
        act: ActType::Direct,
        phrases: &["come on", "hurry", "you should", "早く", "さっさと"],
    },
    Cue {
        act: ActType::Declare,
        phrases: &["it's over", "from now on", "we're done", "これで終わり", "今日から"],
    },
    Cue {
        act: ActType::Express,
        phrases: &["love", "i like", "i want", "i hate", "i miss", "i'm glad", "scared", "好き", "嫌い", "愛して", "会いたい", "嬉しい", "怖い", "嫌"],
    },
    Cue {
        act: ActType::Deny,
        phrases: &["no,", "no.", "no!", "not for", "don't", "i'm not", "別に", "じゃない", "いや"],
    },
];

const SECOND_PERSON: &[&str] = &[" you", "あなた", "あんた", "お前", "君", "貴様"];
const FIRST_PERSON: &[&str] = &[" i ", " i'", " me ", " me.", " my ", "myself", "私", "俺", "僕", "あたし", "うち"];
const THIRD_PERSON: &[&str] = &[" he ", " she ", " him", " her ", " they ", " them", " his ", "彼", "彼女"];
const MONOLOGUE: &[&str] = &["i wonder", "why am i", "maybe i", "かな", "のかしら", "だろうか"];
const EMPHASIS: &[&str] = &["!", "really", "so ", "truly", "absolutely", "本当", "絶対", "すごく", "！"];

impl LexicalActExtractor {
    pub fn extract_sync(&self, text: &str) -> ExtractedActs {
        let lower = format!(" {} ", text.to_lowercase());
        let has = |cues: &[&str]| cues.iter().any(|c| lower.contains(c));

        let second = has(SECOND_PERSON);
        let first = has(FIRST_PERSON);
        let third = has(THIRD_PERSON);

        let address_mode = if second {
            AddressMode::Direct
        } else if has(MONOLOGUE) {
            AddressMode::Monologue
        } else if third || (!first && reported_subject(text)) {
            AddressMode::Reported
        } else {
            AddressMode::Direct
        };

        let emphasis = EMPHASIS.iter().filter(|c| lower.contains(*c)).count();
        let intensity = (0.5 + 0.15 * emphasis as f32).min(1.0);

        let mut acts: Vec<SpeechAct> = CUES
            .iter()
            .filter(|cue| has(cue.phrases))
            .map(|cue| {
                let role = lexical_role(cue.act, second, first, third);
                SpeechAct {
                    act_type: cue.act,
                    target_role: role,
                    target_entity: default_entity(role).to_string(),
                    force: String::new(),
                    intensity,
                }
            })
            .collect();
        if acts.is_empty() && !text.trim().is_empty() {
            let role = lexical_role(ActType::Assert, second, first, third);
            acts.push(SpeechAct {
                act_type: ActType::Assert,
                target_role: role,
                target_entity: default_entity(role).to_string(),
                force: String::new(),
                intensity,
            });
        }

        ExtractedActs {
            primary_act: acts.first().map(|a| a.act_type).unwrap_or(ActType::Assert),
            overall_force: String::new(),
            acts,
            address_mode,
        }
    }
}

#[async_trait]
impl ActExtractor for LexicalActExtractor {
    async fn extract(
        &self,
        text: &str,
        _lang: &str,
        _context: Option<&str>,
    ) -> Result<ExtractedActs, ActExtractionError> {
        Ok(self.extract_sync(text))
    }
}

/// A capitalized name followed by a third-person verb ("Rem loves ...").
fn reported_subject(text: &str) -> bool {
    let mut words = text.split_whitespace();
    match (words.next(), words.next()) {
        (Some(subject), Some(verb)) => {
            subject.chars().next().is_some_and(char::is_uppercase)
                && verb.len() > 2
                && verb.ends_with('s')
                && !verb.ends_with("ss")
        }
        _ => false,
    }
}

fn lexical_role(act: ActType, second: bool, first: bool, third: bool) -> TargetRole {
    if second {
        TargetRole::Listener
    } else if third {
        TargetRole::ThirdParty
    } else {
        match act {
            ActType::DenyAssumption => TargetRole::Proposition,
            ActType::CloseEscape | ActType::Ultimatum | ActType::Declare => TargetRole::Situation,
            _ if first => TargetRole::Speaker,
            _ => TargetRole::Listener,
        }
    }
}

fn default_entity(role: TargetRole) -> &'static str {
    match role {
        TargetRole::Speaker => "self",
        TargetRole::Listener => "you",
        TargetRole::ThirdParty => "other",
        TargetRole::Situation => "situation",
        TargetRole::Proposition => "assumption",
        TargetRole::Abstract => "value",
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ActReply {
    primary_act: String,
    overall_force: String,
    address_mode: String,
    acts: Vec<ActItemReply>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ActItemReply {
    #[serde(rename = "type")]
    act_type: String,
    target_role: String,
    target_entity: String,
    force: String,
    intensity: f32,
}

/// Extracts acts by asking the generator, then normalizes the labels.
pub struct GeneratorActExtractor {
    generator: ResilientGenerator,
    temperature: f32,
}

impl GeneratorActExtractor {
    pub fn new(generator: ResilientGenerator, temperature: f32) -> Self {
        Self {
            generator,
            temperature,
        }
    }

    fn request(&self, text: &str, lang: &str, context: Option<&str>) -> GenerationRequest {
        let acts = ActType::ALL
            .iter()
            .map(|a| a.name())
            .collect::<Vec<_>>()
            .join(", ");
        let system = format!(
            "Extract the illocutionary acts the utterance performs.\n\
             act types MUST be one of: [{acts}]\n\
             target_role MUST be one of: [SELF, LISTENER, THIRD_PARTY, SITUATION, PROPOSITION, ABSTRACT]\n\
             ASSERT is the last resort; prefer a specific act.\n\
             A person addressed by name is the LISTENER, not THIRD_PARTY.\n\
             address_mode: direct (second person), reported (third-person narration), monologue (self-talk).\n\
             Return ONLY a single JSON object."
        );
        let mut user = format!("[language_hint] {lang}\n\n");
        if let Some(ctx) = context.filter(|c| !c.trim().is_empty()) {
            user.push_str(&format!("[context]\n{}\n\n", ctx.trim()));
        }
        user.push_str(&format!("[utterance]\n{}", text.trim()));
        GenerationRequest {
            task: GenerationTask::ActExtraction,
            system,
            user,
            temperature: self.temperature,
            format: ResponseFormat::Structured {
                schema: serde_json::json!({
                    "primary_act": "act type",
                    "overall_force": "string",
                    "address_mode": "direct | reported | monologue",
                    "acts": [{"type": "act type", "target_role": "role", "target_entity": "string", "force": "string", "intensity": "number 0..1"}]
                }),
            },
        }
    }
}

#[async_trait]
impl ActExtractor for GeneratorActExtractor {
    async fn extract(
        &self,
        text: &str,
        lang: &str,
        context: Option<&str>,
    ) -> Result<ExtractedActs, ActExtractionError> {
        let request = self.request(text, lang, context);
        let reply: ActReply = self.generator.generate_with(&request, parse_json).await?;
        let acts = reply
            .acts
            .into_iter()
            .map(|item| {
                let entity = item.target_entity.trim().to_string();
                let force = item.force.trim().to_string();
                let mut act = SpeechAct {
                    act_type: ActType::normalize(&item.act_type).promote_by_force(&force, &entity),
                    target_role: TargetRole::normalize(&item.target_role),
                    target_entity: entity,
                    force,
                    intensity: item.intensity.clamp(0.0, 1.0),
                };
                apply_vocative_correction(&mut act, text);
                act
            })
            .collect();
        Ok(ExtractedActs {
            primary_act: ActType::normalize(&reply.primary_act),
            overall_force: reply.overall_force.trim().to_string(),
            acts,
            address_mode: AddressMode::parse_lenient(&reply.address_mode),
        })
    }
}

/// Memoizes another extractor keyed by (lang, context, text).
pub struct CachedActExtractor {
    inner: Arc<dyn ActExtractor>,
    cache: Mutex<HashMap<(String, String, String), ExtractedActs>>,
}

impl CachedActExtractor {
    pub fn new(inner: Arc<dyn ActExtractor>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, key: &(String, String, String)) -> Option<ExtractedActs> {
        let cache = self.cache.lock().ok()?;
        cache.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store(&self, key: (String, String, String), acts: ExtractedActs) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, acts);
        }
    }
}

#[async_trait]
impl ActExtractor for CachedActExtractor {
    async fn extract(
        &self,
        text: &str,
        lang: &str,
        context: Option<&str>,
    ) -> Result<ExtractedActs, ActExtractionError> {
        let key = (
            lang.to_string(),
            context.unwrap_or_default().to_string(),
            text.to_string(),
        );
        if let Some(hit) = self.lookup(&key) {
            tracing::debug!(lang, "act extraction cache hit");
            return Ok(hit);
        }
        let extracted = self.inner.extract(text, lang, context).await?;
        self.store(key, extracted.clone());
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generation::{FnGenerator, GenerationOutput, RetryPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn normalize_maps_synonyms_and_inventions() {
        assert_eq!(ActType::normalize("close-escape"), ActType::CloseEscape);
        assert_eq!(ActType::normalize("Promise"), ActType::Commit);
        assert_eq!(ActType::normalize("VOW"), ActType::Vow);
        assert_eq!(ActType::normalize("romantic confession"), ActType::Express);
        assert_eq!(ActType::normalize("???"), ActType::Assert);
    }

    #[test]
    fn assert_promoted_by_force_text() {
        assert_eq!(
            ActType::Assert.promote_by_force("won't accept anyone else", ""),
            ActType::CloseEscape
        );
        assert_eq!(
            ActType::Assert.promote_by_force("it has to be him", ""),
            ActType::AssertChoice
        );
        assert_eq!(ActType::Deny.promote_by_force("love", ""), ActType::Deny);
    }

    #[test]
    fn target_role_normalization() {
        assert_eq!(TargetRole::normalize("addressee"), TargetRole::Listener);
        assert_eq!(TargetRole::normalize("myself"), TargetRole::Speaker);
        assert_eq!(TargetRole::normalize("the premise"), TargetRole::Proposition);
        assert_eq!(TargetRole::normalize(""), TargetRole::Listener);
    }

    #[test]
    fn vocative_makes_entity_the_listener() {
        let mut act = SpeechAct {
            act_type: ActType::AssertChoice,
            target_role: TargetRole::ThirdParty,
            target_entity: "Subaru-kun".to_string(),
            force: String::new(),
            intensity: 0.9,
        };
        apply_vocative_correction(&mut act, "スバルくんが良いんです。");
        assert_eq!(act.target_role, TargetRole::ThirdParty);
        apply_vocative_correction(&mut act, "Subaru, it has to be you.");
        assert_eq!(act.target_role, TargetRole::Listener);
    }

    #[test]
    fn lexical_direct_confession() {
        let acts = LexicalActExtractor.extract_sync("I love you, Subaru-kun. Only you!");
        assert_eq!(acts.address_mode, AddressMode::Direct);
        let types: Vec<_> = acts.acts.iter().map(|a| a.act_type).collect();
        assert!(types.contains(&ActType::Express));
        assert!(types.contains(&ActType::AssertChoice));
        assert!(acts.acts.iter().all(|a| a.target_role == TargetRole::Listener));
    }

    #[test]
    fn lexical_reported_confession() {
        let acts = LexicalActExtractor.extract_sync("Rem loves Subaru.");
        assert_eq!(acts.address_mode, AddressMode::Reported);
        assert_eq!(acts.acts[0].act_type, ActType::Express);
    }

    #[test]
    fn lexical_flat_line_is_plain_assert() {
        let acts = LexicalActExtractor.extract_sync("The train leaves at nine.");
        assert_eq!(acts.acts.len(), 1);
        assert_eq!(acts.primary_act, ActType::Assert);
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn generator_extractor_normalizes_reply() {
        let gen = FnGenerator::new(|_req| {
            Ok(GenerationOutput::new(
                r#"{"primary_act": "confession", "address_mode": "DIRECT", "acts": [
                    {"type": "ASSERT", "target_role": "other", "target_entity": "Subaru-kun",
                     "force": "nobody else will do; no one else", "intensity": 1.4}
                ]}"#,
            ))
        });
        let extractor = GeneratorActExtractor::new(
            ResilientGenerator::new(Arc::new(gen), fast_policy()),
            0.0,
        );
        let acts = extractor
            .extract("Subaru, no one else.", "en", None)
            .await
            .unwrap();
        assert_eq!(acts.primary_act, ActType::Express);
        assert_eq!(acts.acts[0].act_type, ActType::CloseEscape);
        assert_eq!(acts.acts[0].target_role, TargetRole::Listener);
        assert_eq!(acts.acts[0].intensity, 1.0);
    }

    #[tokio::test]
    async fn cache_skips_repeat_calls() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let gen = FnGenerator::new(move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(GenerationOutput::new(r#"{"primary_act": "EXPRESS", "acts": []}"#))
        });
        let inner = GeneratorActExtractor::new(
            ResilientGenerator::new(Arc::new(gen), fast_policy()),
            0.0,
        );
        let cached = CachedActExtractor::new(Arc::new(inner));
        cached.extract("好き", "ja", None).await.unwrap();
        cached.extract("好き", "ja", None).await.unwrap();
        cached.extract("好き", "ja", Some("ctx")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cached.len(), 2);
    }
}
