use crate::translation::{LanguagePair, LegLanguage};
use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub port: u16,
    pub public_domain: String,

    // OpenAI
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_api_url: String,
    pub openai_timeout_secs: u64,

    // Twilio
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_api_url: String,
    pub twilio_caller_number: String,
    pub twilio_agent_number: String,

    // Languages
    pub caller_language: String,
    pub caller_language_code: String,
    pub caller_voice: String,
    pub agent_language: String,
    pub agent_language_code: String,
    pub agent_voice: String,

    // Behaviour
    pub welcome_greeting: String,
    pub auto_start_translation: bool,
    /// Where the provider goes after the agent leg's relay connection ends
    pub agent_connect_action_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            // Server
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            public_domain: std::env::var("PUBLIC_DOMAIN")
                .context("PUBLIC_DOMAIN not set")?,

            // OpenAI
            openai_api_key: std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY not set")?,
            openai_model: std::env::var("OPENAI_MODEL")
                .unwrap_or_else(|_| "gpt-4o-2024-08-06".to_string()),
            openai_api_url: std::env::var("OPENAI_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string()),
            openai_timeout_secs: std::env::var("OPENAI_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),

            // Twilio - credentials for originating the agent leg
            twilio_account_sid: std::env::var("TWILIO_ACCOUNT_SID")
                .context("TWILIO_ACCOUNT_SID not set")?,
            twilio_auth_token: std::env::var("TWILIO_AUTH_TOKEN")
                .context("TWILIO_AUTH_TOKEN not set")?,
            twilio_api_url: std::env::var("TWILIO_API_URL")
                .unwrap_or_else(|_| "https://api.twilio.com".to_string()),
            twilio_caller_number: std::env::var("TWILIO_CALLER_NUMBER")
                .context("TWILIO_CALLER_NUMBER not set")?,
            twilio_agent_number: std::env::var("TWILIO_AGENT_NUMBER")
                .context("TWILIO_AGENT_NUMBER not set")?,

            // Languages
            caller_language: std::env::var("CALLER_LANGUAGE")
                .unwrap_or_else(|_| "Spanish".to_string()),
            caller_language_code: std::env::var("CALLER_LANGUAGE_CODE")
                .unwrap_or_else(|_| "es-US".to_string()),
            caller_voice: std::env::var("CALLER_VOICE")
                .unwrap_or_else(|_| "es-US-Wavenet-B".to_string()),
            agent_language: std::env::var("AGENT_LANGUAGE")
                .unwrap_or_else(|_| "English".to_string()),
            agent_language_code: std::env::var("AGENT_LANGUAGE_CODE")
                .unwrap_or_else(|_| "en-US".to_string()),
            agent_voice: std::env::var("AGENT_VOICE")
                .unwrap_or_else(|_| "en-US-Wavenet-B".to_string()),

            // Behaviour
            welcome_greeting: std::env::var("WELCOME_GREETING")
                .unwrap_or_else(|_| "Hello".to_string()),
            auto_start_translation: std::env::var("AUTO_START_TRANSLATION")
                .ok()
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
            agent_connect_action_url: std::env::var("AGENT_CONNECT_ACTION_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        })
    }

    pub fn languages(&self) -> LanguagePair {
        LanguagePair {
            caller: LegLanguage::new(
                &self.caller_language,
                &self.caller_language_code,
                &self.caller_voice,
            ),
            agent: LegLanguage::new(
                &self.agent_language,
                &self.agent_language_code,
                &self.agent_voice,
            ),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            port: 0,
            public_domain: "relay.example.com".to_string(),
            openai_api_key: "test_key".to_string(),
            openai_model: "gpt-4o-2024-08-06".to_string(),
            openai_api_url: "http://127.0.0.1:9/v1/chat/completions".to_string(),
            openai_timeout_secs: 5,
            twilio_account_sid: "ACtest".to_string(),
            twilio_auth_token: "test_token".to_string(),
            twilio_api_url: "http://127.0.0.1:9".to_string(),
            twilio_caller_number: "+15551230000".to_string(),
            twilio_agent_number: "+15559998888".to_string(),
            caller_language: "Spanish".to_string(),
            caller_language_code: "es-US".to_string(),
            caller_voice: "es-US-Wavenet-B".to_string(),
            agent_language: "English".to_string(),
            agent_language_code: "en-US".to_string(),
            agent_voice: "en-US-Wavenet-B".to_string(),
            welcome_greeting: "Hello".to_string(),
            auto_start_translation: true,
            agent_connect_action_url: None,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
