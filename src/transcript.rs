//! Turn reconstruction from streamed transcript fragments

use serde::{Deserialize, Serialize};

/// Who spoke a chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// Transcript direction of a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// What the guest said
    Input,
    /// What the assistant said
    Output,
}

/// A retrieval source cited by an assistant turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingReference {
    pub title: String,
    pub uri: String,
}

/// One completed turn of the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub speaker: Speaker,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grounding_references: Vec<GroundingReference>,
}

/// Accumulates input and output fragments until the endpoint signals a turn boundary
#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    input: String,
    output: String,
    interim: String,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment in arrival order
    pub fn on_fragment(&mut self, direction: Direction, text: &str) {
        match direction {
            Direction::Input => {
                self.input.push_str(text);
                let trimmed = self.input.trim();
                if !trimmed.is_empty() {
                    self.interim = trimmed.to_string();
                }
            }
            Direction::Output => self.output.push_str(text),
        }
    }

    /// Flush both buffers at a turn boundary
    ///
    /// Returns the USER turn (if any) followed by the ASSISTANT turn (if any).
    /// Buffers and the interim caption are cleared even when nothing is emitted.
    pub fn on_turn_complete(&mut self, grounding: Vec<GroundingReference>) -> Vec<ChatTurn> {
        let mut turns = Vec::with_capacity(2);

        let input = self.input.trim();
        if !input.is_empty() {
            turns.push(ChatTurn {
                speaker: Speaker::User,
                text: input.to_string(),
                grounding_references: Vec::new(),
            });
        }

        let output = self.output.trim();
        if !output.is_empty() {
            turns.push(ChatTurn {
                speaker: Speaker::Assistant,
                text: output.to_string(),
                grounding_references: grounding,
            });
        }

        self.reset();
        turns
    }

    /// Live caption of the guest's current utterance, empty when none
    pub fn interim(&self) -> &str {
        &self.interim
    }

    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.interim.clear();
    }
}
