//! Wire frames exchanged with the relay endpoints.
//!
//! Every WebSocket message is one JSON object. The discriminant lives in `type`
//! (conversation relay messages) or, failing that, in `event` (media stream
//! messages). Decoding never panics; anything we cannot understand comes back as
//! a [`ProtocolError`] for the channel to log and drop.

use crate::error::ProtocolError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// The closed set of discriminants a channel can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Setup,
    Prompt,
    Interrupt,
    Text,
    End,
    Connected,
    Media,
    Mark,
    TranscriptionLanguage,
}

impl FrameKind {
    /// Map a wire discriminant (including accepted aliases) to a kind.
    pub fn from_wire(discriminant: &str) -> Option<FrameKind> {
        match discriminant {
            "setup" => Some(FrameKind::Setup),
            "prompt" | "fragment" => Some(FrameKind::Prompt),
            "interrupt" | "interruption" => Some(FrameKind::Interrupt),
            "text" | "text-result" => Some(FrameKind::Text),
            "end" | "stop" | "termination" => Some(FrameKind::End),
            "connected" => Some(FrameKind::Connected),
            "media" => Some(FrameKind::Media),
            "mark" => Some(FrameKind::Mark),
            "transcriptionLanguage" => Some(FrameKind::TranscriptionLanguage),
            _ => None,
        }
    }

    /// Canonical wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Setup => "setup",
            FrameKind::Prompt => "prompt",
            FrameKind::Interrupt => "interrupt",
            FrameKind::Text => "text",
            FrameKind::End => "end",
            FrameKind::Connected => "connected",
            FrameKind::Media => "media",
            FrameKind::Mark => "mark",
            FrameKind::TranscriptionLanguage => "transcriptionLanguage",
        }
    }
}

/// First message on every relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupFrame {
    pub from: String,
    pub call_sid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_call_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_sid: Option<String>,
}

/// A transcribed utterance that needs translating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFrame {
    #[serde(alias = "text")]
    pub voice_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptFrame {
    pub utterance_until_interrupt: String,
    #[serde(deserialize_with = "millis_from_number_or_string")]
    pub duration_until_interrupt_ms: u64,
}

/// Text to be spoken on the receiving leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextFrame {
    pub token: String,
    pub last: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFrame {
    pub media: MediaChunk,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_sid: Option<String>,
}

/// Base64 audio payload of a media frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaChunk {
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkFrame {
    pub mark: MarkLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_sid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkLabel {
    pub name: String,
}

/// Switches the speech recognizer of a leg to another language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionLanguageFrame {
    pub lang: String,
}

/// One parsed message. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Setup(SetupFrame),
    Prompt(PromptFrame),
    Interrupt(InterruptFrame),
    Text(TextFrame),
    End(EndFrame),
    Connected(ConnectedFrame),
    Media(MediaFrame),
    Mark(MarkFrame),
    TranscriptionLanguage(TranscriptionLanguageFrame),
}

impl Frame {
    /// Decode one raw transport message.
    pub fn decode(raw: &str) -> Result<Frame, ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(ProtocolError::Malformed)?;

        let kind = {
            let discriminant = value
                .get("type")
                .and_then(Value::as_str)
                .or_else(|| value.get("event").and_then(Value::as_str))
                .ok_or(ProtocolError::MissingDiscriminant)?;
            FrameKind::from_wire(discriminant)
                .ok_or_else(|| ProtocolError::UnknownDiscriminant(discriminant.to_string()))?
        };

        let invalid = |source| ProtocolError::InvalidFields {
            kind: kind.as_str(),
            source,
        };

        let frame = match kind {
            FrameKind::Setup => Frame::Setup(serde_json::from_value(value).map_err(invalid)?),
            FrameKind::Prompt => Frame::Prompt(serde_json::from_value(value).map_err(invalid)?),
            FrameKind::Interrupt => {
                Frame::Interrupt(serde_json::from_value(value).map_err(invalid)?)
            }
            FrameKind::Text => Frame::Text(serde_json::from_value(value).map_err(invalid)?),
            FrameKind::End => Frame::End(serde_json::from_value(value).map_err(invalid)?),
            FrameKind::Connected => {
                Frame::Connected(serde_json::from_value(value).map_err(invalid)?)
            }
            FrameKind::Media => Frame::Media(serde_json::from_value(value).map_err(invalid)?),
            FrameKind::Mark => Frame::Mark(serde_json::from_value(value).map_err(invalid)?),
            FrameKind::TranscriptionLanguage => {
                Frame::TranscriptionLanguage(serde_json::from_value(value).map_err(invalid)?)
            }
        };

        Ok(frame)
    }

    /// Serialize for the wire, using the canonical discriminant in `type`.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Setup(_) => FrameKind::Setup,
            Frame::Prompt(_) => FrameKind::Prompt,
            Frame::Interrupt(_) => FrameKind::Interrupt,
            Frame::Text(_) => FrameKind::Text,
            Frame::End(_) => FrameKind::End,
            Frame::Connected(_) => FrameKind::Connected,
            Frame::Media(_) => FrameKind::Media,
            Frame::Mark(_) => FrameKind::Mark,
            Frame::TranscriptionLanguage(_) => FrameKind::TranscriptionLanguage,
        }
    }

    /// Final text frame carrying one translated utterance.
    pub fn text(token: impl Into<String>, lang: Option<String>) -> Frame {
        Frame::Text(TextFrame {
            token: token.into(),
            last: true,
            lang,
        })
    }
}

// The relay sends this duration as a string, other producers as a number.
fn millis_from_number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(ms) => Ok(ms),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}
