use crate::error::EngineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Replaced with the caller leg's language name in both templates
pub const CALLER_LANGUAGE_PLACEHOLDER: &str = "[CALLER_LANGUAGE]";

/// Replaced with the agent leg's language name in both templates
pub const AGENT_LANGUAGE_PLACEHOLDER: &str = "[AGENT_LANGUAGE]";

/// Name of the structured output schema sent to the engine
pub const TRANSLATION_SCHEMA_NAME: &str = "translation";

const CALLER_TO_AGENT_PROMPT: &str = r#"You are a live interpreter on a phone call between a customer and a support agent.
The customer speaks [CALLER_LANGUAGE]. The agent speaks [AGENT_LANGUAGE].

You will receive one utterance spoken by the customer, already transcribed to text.
Translate it from [CALLER_LANGUAGE] into [AGENT_LANGUAGE] so the agent can read it aloud.

## Rules
- Translate faithfully; do not answer, summarize or add commentary
- Keep names, phone numbers, account numbers and addresses exactly as spoken
- Preserve the speaker's tone and level of formality
- If the utterance is already in [AGENT_LANGUAGE], return it unchanged
- If the utterance is unintelligible, return it unchanged

Respond with sourceLanguage, targetLanguage and translationText."#;

const AGENT_TO_CALLER_PROMPT: &str = r#"You are a live interpreter on a phone call between a support agent and a customer.
The agent speaks [AGENT_LANGUAGE]. The customer speaks [CALLER_LANGUAGE].

You will receive one utterance spoken by the agent, already transcribed to text.
Translate it from [AGENT_LANGUAGE] into [CALLER_LANGUAGE] so the customer can hear it.

## Rules
- Translate faithfully; do not answer, summarize or add commentary
- Keep product names, reference numbers and amounts exactly as spoken
- Use a polite, natural register suitable for customer service
- If the utterance is already in [CALLER_LANGUAGE], return it unchanged
- If the utterance is unintelligible, return it unchanged

Respond with sourceLanguage, targetLanguage and translationText."#;

/// Which leg is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    CallerToAgent,
    AgentToCaller,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::CallerToAgent => f.write_str("caller->agent"),
            Direction::AgentToCaller => f.write_str("agent->caller"),
        }
    }
}

/// Language settings of one leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegLanguage {
    /// Name used in prompts (e.g., "Spanish")
    pub name: String,
    /// BCP-47 code used for transcription and speech (e.g., "es-US")
    pub code: String,
    /// Text-to-speech voice (e.g., "es-US-Wavenet-B")
    pub voice: String,
}

impl LegLanguage {
    pub fn new(name: &str, code: &str, voice: &str) -> Self {
        Self {
            name: name.to_string(),
            code: code.to_string(),
            voice: voice.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguagePair {
    pub caller: LegLanguage,
    pub agent: LegLanguage,
}

impl LanguagePair {
    pub fn source(&self, direction: Direction) -> &LegLanguage {
        match direction {
            Direction::CallerToAgent => &self.caller,
            Direction::AgentToCaller => &self.agent,
        }
    }

    pub fn target(&self, direction: Direction) -> &LegLanguage {
        match direction {
            Direction::CallerToAgent => &self.agent,
            Direction::AgentToCaller => &self.caller,
        }
    }
}

impl Default for LanguagePair {
    fn default() -> Self {
        Self {
            caller: LegLanguage::new("Spanish", "es-US", "es-US-Wavenet-B"),
            agent: LegLanguage::new("English", "en-US", "en-US-Wavenet-B"),
        }
    }
}

/// Structured result the engine must produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationPayload {
    pub source_language: String,
    pub target_language: String,
    pub translation_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// One request to the completion engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub schema_name: &'static str,
    pub schema: Value,
}

/// Black-box completion service.
///
/// Implementations that stream must accumulate every increment and return the
/// complete text only once the engine signals completion.
#[async_trait]
pub trait CompletionEngine: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, EngineError>;
}

/// JSON schema for [`TranslationPayload`]
pub fn translation_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "sourceLanguage": { "type": "string" },
            "targetLanguage": { "type": "string" },
            "translationText": { "type": "string" }
        },
        "required": ["sourceLanguage", "targetLanguage", "translationText"],
        "additionalProperties": false
    })
}

/// Build the instruction message for one direction
fn build_system_prompt(languages: &LanguagePair, direction: Direction) -> String {
    let template = match direction {
        Direction::CallerToAgent => CALLER_TO_AGENT_PROMPT,
        Direction::AgentToCaller => AGENT_TO_CALLER_PROMPT,
    };

    template
        .replace(CALLER_LANGUAGE_PLACEHOLDER, &languages.caller.name)
        .replace(AGENT_LANGUAGE_PLACEHOLDER, &languages.agent.name)
}

/// Build the two-message request for one utterance
pub fn build_request(text: &str, languages: &LanguagePair, direction: Direction) -> CompletionRequest {
    CompletionRequest {
        messages: vec![
            ChatMessage {
                role: "system".to_string(),
                content: build_system_prompt(languages, direction),
            },
            ChatMessage {
                role: "user".to_string(),
                content: text.to_string(),
            },
        ],
        schema_name: TRANSLATION_SCHEMA_NAME,
        schema: translation_schema(),
    }
}

/// Parse the engine's accumulated output
pub fn parse_translation(raw: &str) -> Result<TranslationPayload, EngineError> {
    serde_json::from_str(raw.trim()).map_err(EngineError::Schema)
}

/// Turns utterances into translated utterances through a [`CompletionEngine`].
#[derive(Clone)]
pub struct Translator {
    engine: Arc<dyn CompletionEngine>,
}

impl Translator {
    pub fn new(engine: Arc<dyn CompletionEngine>) -> Self {
        Self { engine }
    }

    /// Translate one utterance.
    ///
    /// One engine round trip per call and no retries: a failed or malformed
    /// completion is returned as an error for the caller to log and drop.
    pub async fn translate(
        &self,
        text: &str,
        languages: &LanguagePair,
        direction: Direction,
    ) -> Result<TranslationPayload, EngineError> {
        let request = build_request(text, languages, direction);

        debug!(
            %direction,
            from = %languages.source(direction).name,
            to = %languages.target(direction).name,
            "Requesting translation of: {}",
            text
        );

        let raw = self.engine.complete(&request).await?;
        let payload = parse_translation(&raw)?;

        debug!(
            %direction,
            source = %payload.source_language,
            target = %payload.target_language,
            "Translated to: {}",
            payload.translation_text
        );

        Ok(payload)
    }
}
