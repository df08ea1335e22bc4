//! Error taxonomy for the session core.
//!
//! Transport errors are recovered by the connection manager and only surface
//! as status. Application failures are attached to the entity they concern
//! (a message, a recording) rather than thrown.

use serde::{Deserialize, Serialize};

use crate::models::{ConversationId, TempId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ConnectionError {
    /// Transient transport failure; the connection manager keeps backing off.
    #[error("network error: {0}")]
    Network(String),

    /// Token rejected. Terminal: no retry loop is started.
    #[error("authentication rejected: {0}")]
    Auth(String),
}

impl ConnectionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Network(_) => "network",
            Self::Auth(_) => "auth",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Why a message never reached the server. Kept on the message entry so the
/// UI can offer an inline retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SendFailure {
    #[error("not connected")]
    NotConnected,

    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("channel closed before acknowledgement")]
    ChannelClosed,
}

impl SendFailure {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Rejected(_) => "rejected",
            Self::ChannelClosed => "channel_closed",
        }
    }
}

/// Manual retry could not be started for a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    #[error("no pending message {0}")]
    UnknownMessage(TempId),

    #[error("message {0} is already confirmed")]
    AlreadySent(TempId),

    #[error("message {0} already has a send in flight")]
    InFlight(TempId),
}

/// Resync after reconnect failed. Surfaced transiently; the next reconnect
/// tries again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("resync failed for conversation {conversation_id}: {reason}")]
pub struct SyncGapError {
    pub conversation_id: ConversationId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SignalingError {
    #[error("join rejected: {0}")]
    JoinRejected(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("not joined to an interview")]
    NotJoined,

    #[error("already joined to interview {0}")]
    AlreadyJoined(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("channel closed")]
    ChannelClosed,
}

impl SignalingError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::JoinRejected(_) => "join_rejected",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::NotJoined => "not_joined",
            Self::AlreadyJoined(_) => "already_joined",
            Self::NegotiationFailed(_) => "negotiation_failed",
            Self::ChannelClosed => "channel_closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("peer connection could not be created: {0}")]
    CreateFailed(String),

    #[error("signal rejected by peer connection: {0}")]
    SignalRejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordingError {
    #[error("no media stream available to record")]
    NoSource,

    #[error("recorder is {0}, cannot {1}")]
    InvalidState(&'static str, &'static str),

    #[error("recorder failure: {0}")]
    Recorder(String),
}

/// Upload of a finished recording failed. The blob is retained so the caller
/// can retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("upload failed: {reason}")]
pub struct UploadError {
    pub reason: String,
}

/// Errors from handle calls against the session task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session has been shut down")]
    Closed,

    #[error("session did not respond")]
    NoResponse,

    #[error("request failed: {0}")]
    Backend(String),

    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error(transparent)]
    Send(#[from] SendFailure),
}

impl SessionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Closed => "closed",
            Self::NoResponse => "no_response",
            Self::Backend(_) => "backend",
            Self::UnknownConversation(_) => "unknown_conversation",
            Self::Retry(_) => "retry",
            Self::Signaling(e) => e.error_code(),
            Self::Recording(_) => "recording",
            Self::Send(e) => e.error_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(ConnectionError::Auth("bad".into()).error_code(), "auth");
        assert_eq!(SendFailure::ChannelClosed.error_code(), "channel_closed");
        assert_eq!(
            SessionError::Signaling(SignalingError::NotJoined).error_code(),
            "not_joined"
        );
    }

    #[test]
    fn only_network_errors_retry() {
        assert!(ConnectionError::Network("reset".into()).is_retryable());
        assert!(!ConnectionError::Auth("expired".into()).is_retryable());
    }

    #[test]
    fn send_failure_serde() {
        let json = serde_json::to_string(&SendFailure::Rejected("too long".into())).unwrap();
        let back: SendFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SendFailure::Rejected("too long".into()));
    }
}
