//! Error taxonomy for the relay.
//!
//! None of these ever escape a frame handler: channels, sessions and workers log
//! them and move on. They exist so tests and logs can tell failures apart.

use thiserror::Error;

/// A frame that could not be turned into a [`crate::frame::Frame`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("frame has neither a `type` nor an `event` discriminant")]
    MissingDiscriminant,

    #[error("unrecognized frame discriminant `{0}`")]
    UnknownDiscriminant(String),

    #[error("invalid fields for `{kind}` frame: {source}")]
    InvalidFields {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Session lookup and state machine failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no session registered for {0}")]
    NotFound(String),

    #[error("party identifier {0:?} is empty after normalization")]
    InvalidKey(String),

    #[error("cannot {action} while session is {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    #[error("session {0} does not have both legs bound yet")]
    NotReady(String),
}

/// Failures of a translation round trip.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to reach completion engine: {0}")]
    Request(#[source] reqwest::Error),

    #[error("completion engine error ({status}): {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("completion stream failed: {0}")]
    Stream(String),

    #[error("completion engine returned no content")]
    EmptyResponse,

    #[error("completion does not match the translation schema: {0}")]
    Schema(#[source] serde_json::Error),
}

/// Failures originating the second leg of a call.
#[derive(Debug, Error)]
pub enum CallControlError {
    #[error("failed to send request to call-control API: {0}")]
    Request(#[source] reqwest::Error),

    #[error("call-control API error ({status}): {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_messages() {
        let err = SessionError::InvalidTransition {
            action: "attach first leg",
            state: "active",
        };
        assert_eq!(err.to_string(), "cannot attach first leg while session is active");

        let err = SessionError::NotFound("+15550001111".to_string());
        assert!(err.to_string().contains("+15550001111"));
    }

    #[test]
    fn test_protocol_error_unknown_discriminant_message() {
        let err = ProtocolError::UnknownDiscriminant("dtmf".to_string());
        assert!(err.to_string().contains("dtmf"));
    }
}
