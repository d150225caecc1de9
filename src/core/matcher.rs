/// Trigger matching: deciding whether a line fires one of the listener's triggers.
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::schema::persona::Trigger;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\p{Latin}\p{N}']+|[\p{Han}\p{Hiragana}\p{Katakana}ー]+").unwrap()
});

/// Decides whether a line of dialogue fires a trigger.
///
/// Implementations must be pure: the same `(trigger, text)` always gives the
/// same answer.
pub trait TriggerMatcher: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn matches(&self, trigger: &Trigger, text: &str) -> bool;
}

/// Case-insensitive substring match on each trigger pattern.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralMatcher;

impl TriggerMatcher for LiteralMatcher {
    fn name(&self) -> &'static str {
        "literal"
    }

    fn matches(&self, trigger: &Trigger, text: &str) -> bool {
        let haystack = text.to_lowercase();
        trigger
            .patterns
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .any(|p| haystack.contains(&p))
    }
}

/// Fires when the share of a pattern's tokens present in the line reaches
/// `threshold`. Latin tokens compare as whole words; CJK runs compare as
/// substrings since the script has no word boundaries.
#[derive(Debug, Clone, Copy)]
pub struct KeywordOverlapMatcher {
    pub threshold: f32,
}

impl Default for KeywordOverlapMatcher {
    fn default() -> Self {
        Self { threshold: 0.6 }
    }
}

impl KeywordOverlapMatcher {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Fraction of `pattern` tokens found in `text`.
    pub fn overlap(pattern: &str, text: &str) -> f32 {
        let pattern_tokens = tokens(pattern);
        if pattern_tokens.is_empty() {
            return 0.0;
        }
        let lowered = text.to_lowercase();
        let text_words: FxHashSet<String> = tokens(&lowered).into_iter().collect();
        let hits = pattern_tokens
            .iter()
            .filter(|tok| {
                if is_latin(tok) {
                    text_words.contains(tok.as_str())
                } else {
                    lowered.contains(tok.as_str())
                }
            })
            .count();
        hits as f32 / pattern_tokens.len() as f32
    }
}

impl TriggerMatcher for KeywordOverlapMatcher {
    fn name(&self) -> &'static str {
        "keyword_overlap"
    }

    fn matches(&self, trigger: &Trigger, text: &str) -> bool {
        trigger
            .patterns
            .iter()
            .any(|p| Self::overlap(p, text) >= self.threshold && !p.trim().is_empty())
    }
}

/// Which matcher an engine uses; the serializable half of the choice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherStrategy {
    Literal,
    KeywordOverlap { threshold: f32 },
}

impl Default for MatcherStrategy {
    fn default() -> Self {
        Self::Literal
    }
}

impl MatcherStrategy {
    pub fn build(&self) -> Box<dyn TriggerMatcher> {
        match *self {
            Self::Literal => Box::new(LiteralMatcher),
            Self::KeywordOverlap { threshold } => Box::new(KeywordOverlapMatcher::new(threshold)),
        }
    }
}

fn tokens(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in TOKEN.find_iter(text) {
        let tok = m.as_str().to_lowercase();
        if !out.contains(&tok) {
            out.push(tok);
        }
    }
    out
}

fn is_latin(token: &str) -> bool {
    token.chars().all(|c| c.is_ascii() || (c.is_alphabetic() && !is_cjk(c)))
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32, 0x3040..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF)
}
