//! Assembles finalized transcript fragments into complete user utterances.

use callbridge_core::types::TranscriptEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorOutput {
    /// Interim hypothesis for live captions. Never starts a turn.
    Caption(String),
    /// A complete utterance ready for text generation.
    Finalized(String),
}

#[derive(Debug)]
pub struct UtteranceAggregator {
    fragments: Vec<String>,
    finalize_on_punctuation: bool,
}

impl Default for UtteranceAggregator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl UtteranceAggregator {
    /// With `finalize_on_punctuation` off, only an utterance boundary completes an utterance.
    pub fn new(finalize_on_punctuation: bool) -> Self {
        Self {
            fragments: Vec::new(),
            finalize_on_punctuation,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.fragments.is_empty()
    }

    pub fn on_transcript_event(&mut self, event: TranscriptEvent) -> Option<AggregatorOutput> {
        match event {
            TranscriptEvent::Interim(text) => {
                let text = text.trim();
                if text.is_empty() {
                    None
                } else {
                    Some(AggregatorOutput::Caption(text.to_string()))
                }
            }
            TranscriptEvent::Final(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }
                self.fragments.push(text.to_string());
                if self.finalize_on_punctuation && ends_sentence(text) {
                    return self.take();
                }
                None
            }
            TranscriptEvent::UtteranceBoundary => self.take(),
        }
    }

    fn take(&mut self) -> Option<AggregatorOutput> {
        if self.fragments.is_empty() {
            return None;
        }
        let text = self.fragments.join(" ");
        self.fragments.clear();
        Some(AggregatorOutput::Finalized(text))
    }
}

fn ends_sentence(text: &str) -> bool {
    matches!(text.chars().last(), Some('.' | '!' | '?'))
}
