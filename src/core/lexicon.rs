/// Surface lexicon: detects realized z-leak markers and compensation devices
/// in English and Japanese text.
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::ops::Range;

use crate::schema::record::{MarkerSet, ZLeakMarker};

static ELLIPSIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"…|\.\.\.|・・・").unwrap());

static TRAILING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:…|\.\.\.|・・・|—|–|--|けど|のに)[」』"'’\s]*$"#).unwrap()
});

static NEGATION_FIRST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^[\s「『“]*(?:no\b|not\b|nope\b|never\b|it'?s not\b|it isn'?t\b|that'?s not\b|i don'?t\b|don'?t\b|別に|べ、べつに|違|ちが|いや|そんなこと)",
    )
    .unwrap()
});

static OVERWRITE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:i mean|or rather|no wait|scratch that|what i meant)\b|じゃなくて|っていうか|ていうか|というより|いや、",
    )
    .unwrap()
});

/// A word cut off by a dash and followed by another word.
static DASH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\p{L}\p{N}']+)[—–]\s?([\p{L}\p{N}']+)").unwrap());

static SELF_NEGATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bi'?m (?:not (?:good|worth|enough)|no good|useless|worthless|nothing)\b|\bi don'?t deserve\b|\bi can'?t do anything\b|\bsomeone like me\b|(?:私|僕|俺|あたし)なんか|どうせ(?:私|僕|俺|あたし)|役立たず|ダメな(?:私|僕|俺|あたし)",
    )
    .unwrap()
});

static ABSOLUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:always|never|nobody|no one|everyone|everything|nothing|only)\b|いつも|絶対|誰も|全部|みんな|決して|しか",
    )
    .unwrap()
});

static EN_STUTTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b([a-z]{1,2})(?:-|[—–]\s?)([a-z]+)").unwrap());

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}']+").unwrap());

/// Every built-in marker realized in `text`, in canonical order.
pub fn detect_markers(text: &str) -> MarkerSet {
    let text = text.trim();
    if text.is_empty() {
        return MarkerSet::new();
    }
    ZLeakMarker::BUILTIN
        .iter()
        .filter(|marker| is_realized(marker, text))
        .cloned()
        .collect()
}

/// Custom markers have no surface form the lexicon knows.
pub fn is_realized(marker: &ZLeakMarker, text: &str) -> bool {
    match marker {
        ZLeakMarker::Stutter => !stutter_spans(text).is_empty(),
        ZLeakMarker::Ellipsis => ELLIPSIS.is_match(text),
        ZLeakMarker::Repetition => !repetition_spans(text).is_empty(),
        ZLeakMarker::NegationFirst => NEGATION_FIRST.is_match(text),
        ZLeakMarker::Overwrite => OVERWRITE.is_match(text) || has_dash_restart(text),
        ZLeakMarker::Trailing => TRAILING.is_match(text),
        ZLeakMarker::SelfNegation => SELF_NEGATION.is_match(text),
        ZLeakMarker::AbsoluteQuantifier => ABSOLUTE.is_match(text),
        ZLeakMarker::Custom(_) => false,
    }
}

/// Markers in `text` that only occur inside the surface form of a marker in
/// `predicted`: the ellipsis of a trailing-off ending, or the dash and
/// quantifier of "Nobody— nobody".
pub fn implied_markers(text: &str, predicted: &MarkerSet) -> MarkerSet {
    let text = text.trim();
    let spans: Vec<Range<usize>> = predicted
        .iter()
        .flat_map(|marker| match marker {
            ZLeakMarker::Stutter => stutter_spans(text),
            ZLeakMarker::Repetition => repetition_spans(text),
            ZLeakMarker::Trailing => TRAILING.find(text).map(|m| m.range()).into_iter().collect(),
            _ => Vec::new(),
        })
        .collect();
    if spans.is_empty() {
        return MarkerSet::new();
    }
    let rest: String = text
        .char_indices()
        .map(|(i, c)| if spans.iter().any(|s| s.contains(&i)) { ' ' } else { c })
        .collect();
    let remaining = detect_markers(&rest);
    let found = detect_markers(text);
    found
        .iter()
        .filter(|m| !predicted.contains(m) && !remaining.contains(m))
        .cloned()
        .collect()
}

/// "I-I", "I— I", "W-what", or a kana broken by a comma and repeated ("べ、べつに").
fn stutter_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans: Vec<Range<usize>> = EN_STUTTER
        .captures_iter(text)
        .filter(|caps| caps[2].to_lowercase().starts_with(&caps[1].to_lowercase()))
        .filter_map(|caps| caps.get(0).map(|m| m.range()))
        .collect();
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    for w in chars.windows(3) {
        let ((start, first), (_, sep), (last_at, last)) = (w[0], w[1], w[2]);
        if is_kana(first) && matches!(sep, '、' | ',' | '…') && last == first {
            spans.push(start..last_at + last.len_utf8());
        }
    }
    spans
}

fn is_kana(c: char) -> bool {
    matches!(c as u32, 0x3041..=0x3096 | 0x30A1..=0x30FA)
}

/// The same word twice in a row, ignoring case and punctuation between.
fn repetition_spans(text: &str) -> Vec<Range<usize>> {
    let words: Vec<(Range<usize>, String)> = WORD
        .find_iter(text)
        .map(|m| (m.range(), m.as_str().to_lowercase()))
        .collect();
    words
        .windows(2)
        .filter(|pair| pair[0].1 == pair[1].1 && pair[0].1.chars().count() > 1)
        .map(|pair| pair[0].0.start..pair[1].0.end)
        .collect()
}

/// A dash that breaks one word off and starts another. A dash before a
/// repeat of the same word is a stutter or repetition, not a restart.
fn has_dash_restart(text: &str) -> bool {
    DASH_BREAK.captures_iter(text).any(|caps| {
        let before = caps[1].to_lowercase();
        !caps[2].to_lowercase().starts_with(&before)
    })
}

/// A persona-level device for carrying voice into the target language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompensationDevice {
    Contraction,
    EmDash,
    TagQuestion,
    Ellipsis,
    Honorific,
}

static CONTRACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b\w+['’](?:m|re|s|t|ll|ve|d)\b").unwrap());
static DASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"—|–|--").unwrap());
static TAG_QUESTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i),\s*(?:\w+n'?t (?:it|you|i|we|they|he|she)|right|okay|huh)\s*[?？]|(?:でしょ|よね|じゃない)[?？]",
    )
    .unwrap()
});
static HONORIFIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)-(?:kun|san|chan|senpai|sensei|sama)\b|くん|さん|ちゃん|先輩|先生|様").unwrap()
});

impl CompensationDevice {
    /// Read a free-text strategy. Strategies the lexicon cannot check yield `None`.
    pub fn recognize(strategy: &str) -> Option<Self> {
        let s = strategy.to_lowercase();
        if s.contains("contraction") {
            Some(Self::Contraction)
        } else if s.contains("dash") || s.contains("interrupt") {
            Some(Self::EmDash)
        } else if s.contains("tag question") || s.contains("tag-question") {
            Some(Self::TagQuestion)
        } else if s.contains("ellipsis") || s.contains("trail") {
            Some(Self::Ellipsis)
        } else if s.contains("honorific") {
            Some(Self::Honorific)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Contraction => "contraction",
            Self::EmDash => "em_dash",
            Self::TagQuestion => "tag_question",
            Self::Ellipsis => "ellipsis",
            Self::Honorific => "honorific",
        }
    }

    pub fn is_realized(&self, text: &str) -> bool {
        match self {
            Self::Contraction => CONTRACTION.is_match(text),
            Self::EmDash => DASH.is_match(text),
            Self::TagQuestion => TAG_QUESTION.is_match(text),
            Self::Ellipsis => ELLIPSIS.is_match(text),
            Self::Honorific => HONORIFIC.is_match(text),
        }
    }
}

impl fmt::Display for CompensationDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
