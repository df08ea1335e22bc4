//! Event channel contract.
//!
//! Names are semantic; how they are framed on the wire is the transport's
//! business. Requests that expect an acknowledgement carry a reply slot on
//! the `Outbound` envelope (see `connection`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    ConversationId, InterviewId, Message, MessageId, Role, RoomMember, TempId, UserId,
};

/// Opaque session-description / candidate payload. Relayed verbatim.
pub type SignalPayload = serde_json::Value;

/// Events sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    /// Acknowledged with `Reply::MessageAck`
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        temp_id: TempId,
    },
    StartTyping {
        conversation_id: ConversationId,
    },
    StopTyping {
        conversation_id: ConversationId,
    },
    /// Acknowledged with `Reply::OnlineUsers`
    GetOnlineUsers,
    /// Acknowledged with `Reply::InterviewJoined`
    JoinInterview {
        interview_id: InterviewId,
        role: Role,
    },
    SendSignal {
        interview_id: InterviewId,
        signal: SignalPayload,
    },
    NotifyMediaState {
        interview_id: InterviewId,
        audio: bool,
        video: bool,
    },
    NotifyRecordingStarted {
        interview_id: InterviewId,
    },
    NotifyRecordingStopped {
        interview_id: InterviewId,
        duration_secs: u64,
    },
    /// Acknowledged with `Reply::ChatAck`
    SendChatMessage {
        interview_id: InterviewId,
        text: String,
    },
    EndInterview {
        interview_id: InterviewId,
    },
}

impl ClientEvent {
    /// Whether the server answers this event with a `Reply`.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Self::SendMessage { .. }
                | Self::GetOnlineUsers
                | Self::JoinInterview { .. }
                | Self::SendChatMessage { .. }
        )
    }
}

/// A chat line exchanged inside an interview room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewChatMessage {
    pub message_id: String,
    pub sender_id: UserId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Events sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    NewMessage {
        message: Message,
    },
    MessageRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        /// Who read them. When it is the local user the conversation's
        /// unread badge is cleared.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        read_by: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        read_at: Option<DateTime<Utc>>,
    },
    UserPresence {
        user_id: UserId,
        is_online: bool,
    },
    OnlineUsers {
        user_ids: Vec<UserId>,
    },
    UserJoined {
        role: Role,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },
    UserLeft {
        name: String,
    },
    PeerDisconnected,
    Signal {
        from: UserId,
        signal: SignalPayload,
    },
    TypingStart {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    TypingStop {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    MediaStateChanged {
        user_id: UserId,
        audio: bool,
        video: bool,
    },
    ChatMessage(InterviewChatMessage),
}

/// Acknowledgement payloads for requests that expect one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Reply {
    MessageAck { message: Message },
    OnlineUsers { user_ids: Vec<UserId> },
    InterviewJoined { existing_users: Vec<RoomMember> },
    ChatAck { message: InterviewChatMessage },
    Error { message: String },
}
