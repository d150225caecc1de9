/// Dialogue context: a sliding window of recently processed turns, rendered
/// into the conversation block each prompt carries.
use std::collections::VecDeque;

use crate::schema::affect::{ArcPhase, Mode};
use crate::schema::scene::Relationship;

#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    pub speaker_name: String,
    pub source_text: String,
    pub translated_text: String,
    pub mode: Mode,
    pub arc_phase: ArcPhase,
}

/// Keeps the last `window` turns of a scene.
#[derive(Debug, Clone)]
pub struct DialogueContext {
    window: usize,
    target_lang: String,
    entries: VecDeque<ContextEntry>,
}

impl DialogueContext {
    pub fn new(window: usize, target_lang: &str) -> Self {
        Self {
            window,
            target_lang: target_lang.to_uppercase(),
            entries: VecDeque::with_capacity(window),
        }
    }

    pub fn push(&mut self, entry: ContextEntry) {
        if self.window == 0 {
            return;
        }
        if self.entries.len() == self.window {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the scene header and the window, oldest turn first.
    pub fn render(&self, setting: &str, relationship: Option<&Relationship>) -> String {
        let mut lines = Vec::new();
        if !setting.trim().is_empty() {
            lines.push(format!("[Scene] {}", setting.trim()));
        }
        if let Some(rel) = relationship {
            lines.push(format!("[Relationship] {}", rel));
        }
        for entry in &self.entries {
            lines.push(format!(
                "[{}] (mode={}, arc={}) {}",
                entry.speaker_name, entry.mode, entry.arc_phase, entry.source_text
            ));
            if !entry.translated_text.is_empty() {
                lines.push(format!(
                    "[{} ({})] {}",
                    entry.speaker_name, self.target_lang, entry.translated_text
                ));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(i: usize) -> ContextEntry {
        ContextEntry {
            speaker_name: format!("S{i}"),
            source_text: format!("line {i}"),
            translated_text: format!("translated {i}"),
            mode: Mode::none(),
            arc_phase: ArcPhase::Stable,
        }
    }

    #[test]
    fn window_keeps_most_recent() {
        let mut ctx = DialogueContext::new(5, "en");
        for i in 0..8 {
            ctx.push(make_entry(i));
        }
        assert_eq!(ctx.len(), 5);
        let rendered = ctx.render("", None);
        assert!(!rendered.contains("line 2"));
        assert!(rendered.starts_with("[S3] (mode=none, arc=stable) line 3"));
        assert!(rendered.contains("[S7 (EN)] translated 7"));
    }

    #[test]
    fn header_includes_setting_and_relationship() {
        let ctx = DialogueContext::new(5, "en");
        let rel = Relationship::parse("A->B: rivals").unwrap();
        let rendered = ctx.render("Rooftop at dusk", Some(&rel));
        assert_eq!(rendered, "[Scene] Rooftop at dusk\n[Relationship] A->B: rivals");
    }

    #[test]
    fn zero_window_renders_nothing() {
        let mut ctx = DialogueContext::new(0, "en");
        ctx.push(make_entry(1));
        assert!(ctx.is_empty());
        assert_eq!(ctx.render("", None), "");
    }
}
