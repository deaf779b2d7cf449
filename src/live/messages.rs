use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::prompt::SessionSetup;
use crate::audio::AudioBlob;
use crate::transcript::GroundingReference;

/// Server message as sent by the live endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    pub grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
    pub grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    #[serde(default)]
    pub grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingChunk {
    pub web: Option<ChunkSource>,
    pub maps: Option<ChunkSource>,
    pub retrieved_context: Option<ChunkSource>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkSource {
    pub uri: Option<String>,
    pub title: Option<String>,
}

impl GroundingChunk {
    fn reference(&self) -> Option<GroundingReference> {
        let source = self
            .web
            .as_ref()
            .or(self.maps.as_ref())
            .or(self.retrieved_context.as_ref())?;
        let uri = source.uri.clone().filter(|u| !u.is_empty())?;
        let title = source
            .title
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| uri.clone());
        Some(GroundingReference { title, uri })
    }
}

/// One decoded inbound delivery; any subset of fields may be present
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub setup_complete: bool,
    pub input_transcript: Option<String>,
    pub output_transcript: Option<String>,
    pub turn_complete: bool,
    pub grounding: Vec<GroundingReference>,
    /// Base64 PCM fragments in delivery order
    pub audio: Vec<String>,
    pub interrupted: bool,
    pub go_away: bool,
}

impl From<ServerMessage> for InboundMessage {
    fn from(msg: ServerMessage) -> Self {
        let mut inbound = InboundMessage {
            setup_complete: msg.setup_complete.is_some(),
            go_away: msg.go_away.is_some(),
            ..InboundMessage::default()
        };

        let Some(content) = msg.server_content else {
            return inbound;
        };

        inbound.input_transcript = content.input_transcription.map(|t| t.text);
        inbound.output_transcript = content.output_transcription.map(|t| t.text);
        inbound.turn_complete = content.turn_complete;
        inbound.interrupted = content.interrupted;

        let mut metadata = content.grounding_metadata.into_iter().collect::<Vec<_>>();
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    if inline.mime_type.is_empty() || inline.mime_type.starts_with("audio/") {
                        inbound.audio.push(inline.data);
                    }
                }
            }
            metadata.extend(turn.grounding_metadata);
        }

        inbound.grounding = metadata
            .iter()
            .flat_map(|m| m.grounding_chunks.iter())
            .filter_map(GroundingChunk::reference)
            .collect();

        inbound
    }
}

/// Decode a raw server payload
pub fn decode_server_message(payload: &[u8]) -> Result<InboundMessage> {
    let msg: ServerMessage =
        serde_json::from_slice(payload).context("Failed to parse server message")?;
    Ok(msg.into())
}

/// First client message: model, voice, instructions and tools
pub fn setup_message(setup: &SessionSetup) -> Value {
    let mut body = json!({
        "model": setup.model,
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": setup.voice } }
            }
        },
        "systemInstruction": { "parts": [{ "text": setup.system_instruction }] },
        "inputAudioTranscription": {},
        "outputAudioTranscription": {},
    });

    if let Some(location) = &setup.retrieval_location {
        body["tools"] = json!([{ "googleMaps": {} }, { "googleSearch": {} }]);
        body["toolConfig"] = json!({
            "retrievalConfig": {
                "latLng": { "latitude": location.latitude, "longitude": location.longitude }
            }
        });
    }

    json!({ "setup": body })
}

/// Streaming microphone input
pub fn realtime_input_message(blob: &AudioBlob) -> Value {
    json!({ "realtimeInput": { "audio": blob } })
}
