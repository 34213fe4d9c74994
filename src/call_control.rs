use crate::config::Config;
use crate::error::CallControlError;
use async_trait::async_trait;
use serde::Deserialize;

/// Everything needed to dial the second leg of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginateRequest {
    /// Number the call is placed from
    pub from: String,
    /// Number to dial (the agent queue)
    pub to: String,
    /// Caller id presented to the agent, so the agent leg can be matched back
    pub caller_id: String,
    /// Markup telling the far end how to connect to the relay
    pub markup: String,
}

/// Originates outbound call legs.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Place the call. Returns the provider's call identifier.
    async fn originate(&self, request: OriginateRequest) -> Result<String, CallControlError>;
}

#[derive(Debug, Deserialize)]
struct CreatedCall {
    sid: String,
}

/// Call control through the Twilio REST API.
pub struct TwilioCallControl {
    client: reqwest::Client,
    api_url: String,
    account_sid: String,
    auth_token: String,
}

impl TwilioCallControl {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.twilio_api_url.trim_end_matches('/').to_string(),
            account_sid: config.twilio_account_sid.clone(),
            auth_token: config.twilio_auth_token.clone(),
        }
    }
}

#[async_trait]
impl CallControl for TwilioCallControl {
    async fn originate(&self, request: OriginateRequest) -> Result<String, CallControlError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.api_url, self.account_sid
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("From", request.from.as_str()),
                ("To", request.to.as_str()),
                ("CallerId", request.caller_id.as_str()),
                ("Twiml", request.markup.as_str()),
            ])
            .send()
            .await
            .map_err(CallControlError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallControlError::Status { status, body });
        }

        let created: CreatedCall = response.json().await.map_err(CallControlError::Request)?;
        Ok(created.sid)
    }
}
