//! Boilerplate removal for model text, plus an incremental wrapper that
//! withholds a trailing window so streamed output never shows text that a
//! later pass removes.

use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use tracing::warn;

pub trait Sanitize: Send + Sync {
    fn sanitize(&self, raw: &str) -> String;

    /// Smallest streaming holdback, in characters, that keeps a partial match
    /// from being released before the rest of it arrives.
    fn min_holdback(&self) -> usize {
        0
    }
}

/// Removes known filler phrases, case-insensitively, together with the
/// whitespace that follows them. Only text at or after a phrase start is
/// touched.
#[derive(Clone, Debug)]
pub struct BoilerplateSanitizer {
    pattern: Option<Regex>,
    longest_phrase_chars: usize,
}

impl BoilerplateSanitizer {
    pub const DEFAULT_PHRASES: &'static [&'static str] = &[
        "As an AI language model,",
        "As an AI assistant,",
        "Como um modelo de linguagem,",
        "Como assistente de IA,",
        "I hope this helps!",
        "Espero ter ajudado!",
        "Is there anything else I can help you with?",
        "Posso ajudar em algo mais?",
    ];

    pub fn new<I, S>(phrases: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases: Vec<String> = phrases
            .into_iter()
            .map(|phrase| phrase.as_ref().trim().to_string())
            .filter(|phrase| !phrase.is_empty())
            .collect();
        let longest_phrase_chars =
            phrases.iter().map(|phrase| phrase.chars().count()).max().unwrap_or(0);
        if phrases.is_empty() {
            return Ok(Self { pattern: None, longest_phrase_chars });
        }

        let alternation =
            phrases.iter().map(|phrase| regex::escape(phrase)).collect::<Vec<_>>().join("|");
        let pattern =
            RegexBuilder::new(&format!(r"(?:{alternation})\s*")).case_insensitive(true).build()?;
        Ok(Self { pattern: Some(pattern), longest_phrase_chars })
    }

    pub fn builtin() -> Result<Self, regex::Error> {
        Self::new(Self::DEFAULT_PHRASES)
    }
}

impl Sanitize for BoilerplateSanitizer {
    fn sanitize(&self, raw: &str) -> String {
        match &self.pattern {
            Some(pattern) => pattern.replace_all(raw, "").into_owned(),
            None => raw.to_string(),
        }
    }

    fn min_holdback(&self) -> usize {
        self.longest_phrase_chars
    }
}

/// Passes text through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSanitizer;

impl Sanitize for NoopSanitizer {
    fn sanitize(&self, raw: &str) -> String {
        raw.to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SanitizedOutput {
    /// Text not yet emitted as a chunk.
    pub tail: String,
    /// Complete sanitised text of the turn.
    pub full: String,
}

/// Incremental output buffer with a trailing holdback window, in characters.
pub struct StreamingSanitizer {
    sanitizer: Arc<dyn Sanitize>,
    holdback: usize,
    raw: String,
    emitted: String,
}

impl StreamingSanitizer {
    pub fn new(sanitizer: Arc<dyn Sanitize>, holdback: usize) -> Self {
        Self { sanitizer, holdback, raw: String::new(), emitted: String::new() }
    }

    pub fn emitted(&self) -> &str {
        &self.emitted
    }

    /// Appends raw text and returns the newly releasable sanitised text, if any.
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        self.raw.push_str(chunk);
        let sanitized = self.sanitizer.sanitize(&self.raw);
        let releasable = sanitized.chars().count().saturating_sub(self.holdback);
        let candidate = char_prefix(&sanitized, releasable);

        if candidate.len() <= self.emitted.len() {
            return None;
        }
        // Released text is final. If a rewrite reached into it, wait for
        // more input instead of emitting a diverging continuation.
        let delta = candidate.strip_prefix(self.emitted.as_str())?.to_string();
        self.emitted.push_str(&delta);
        Some(delta)
    }

    pub fn finish(self) -> SanitizedOutput {
        let full = self.sanitizer.sanitize(&self.raw);
        match full.strip_prefix(self.emitted.as_str()) {
            Some(tail) => SanitizedOutput { tail: tail.to_string(), full: full.clone() },
            None => {
                warn!(
                    event_name = "stream.prefix_divergence",
                    emitted_chars = self.emitted.chars().count(),
                    holdback = self.holdback,
                    "sanitiser rewrote text already streamed; keeping streamed prefix"
                );
                SanitizedOutput { tail: String::new(), full: self.emitted }
            }
        }
    }
}

fn char_prefix(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
