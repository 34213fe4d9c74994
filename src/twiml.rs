//! Markup telling the telephony provider how to reach the relay.

use crate::relay::LegDirection;
use crate::translation::LegLanguage;
use anyhow::{Context, Result};
use reqwest::Url;

/// WebSocket address a leg connects back to.
///
/// The party identifier travels in the query string so the agent leg can be
/// matched to the caller's session.
pub fn relay_url(public_domain: &str, direction: LegDirection, from: &str) -> Result<String> {
    let mut url = Url::parse(&format!("wss://{}/intercept", public_domain))
        .with_context(|| format!("Invalid public domain: {}", public_domain))?;

    url.query_pairs_mut()
        .append_pair("direction", direction.as_str())
        .append_pair("from", from);

    Ok(url.to_string())
}

/// `<Connect><ConversationRelay>` response for one leg.
///
/// With an `action`, the provider requests that URL for further instructions
/// once the relay connection ends.
pub fn connect_relay(
    relay_url: &str,
    language: &LegLanguage,
    welcome_greeting: &str,
    action: Option<&str>,
) -> String {
    let connect = match action {
        Some(action) => format!(r#"<Connect action="{}">"#, escape_xml(action)),
        None => "<Connect>".to_string(),
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
  {}
    <ConversationRelay url="{}" welcomeGreeting="{}">
      <Lang code="{}" voice="{}"/>
    </ConversationRelay>
  </Connect>
</Response>"#,
        connect,
        escape_xml(relay_url),
        escape_xml(welcome_greeting),
        escape_xml(&language.code),
        escape_xml(&language.voice)
    )
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
