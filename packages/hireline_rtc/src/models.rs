//! Data model shared by every component: identifiers, conversations, messages
//! and interview participants.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SendFailure;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Platform user (candidate or recruiter).
    UserId
);
string_id!(ConversationId);
string_id!(
    /// Durable, server-assigned message id.
    MessageId
);
string_id!(InterviewId);

/// Client-generated placeholder id for a message that has not been
/// acknowledged yet. Unique per client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(pub Uuid);

impl TempId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp-{}", self.0)
    }
}

/// The two roles that meet in a conversation or an interview room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Candidate,
    Recruiter,
}

impl Role {
    pub fn counterpart(self) -> Role {
        match self {
            Role::Candidate => Role::Recruiter,
            Role::Recruiter => Role::Candidate,
        }
    }

    /// The recruiter always creates the offer; the candidate always answers.
    /// Fixing this per role means two parties never race with competing offers.
    pub fn is_offerer(self) -> bool {
        matches!(self, Role::Recruiter)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Candidate => f.write_str("candidate"),
            Role::Recruiter => f.write_str("recruiter"),
        }
    }
}

/// Snapshot of "the other participant" as shown in the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub user_id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub role: Role,
}

/// Why a conversation exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationContext {
    JobApplication { application_id: String },
    ProfileUnlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub sender_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Exactly two participants.
    pub participants: [UserId; 2],
    pub other: ParticipantSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ConversationContext>,
}

impl Conversation {
    pub fn involves(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    /// Record a newly appended message. `last_message_at` never moves backwards.
    pub fn touch(&mut self, message: &Message) {
        let newer = self
            .last_message_at
            .is_none_or(|current| message.sent_at >= current);
        if newer {
            self.last_message_at = Some(message.sent_at);
            self.last_message = Some(MessagePreview {
                sender_id: message.sender_id.clone(),
                content: message.content.clone(),
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    #[default]
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Present once the server has persisted the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Echoed back by the server for messages this client sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(skip)]
    pub failure: Option<SendFailure>,
}

impl Message {
    /// Optimistic local entry awaiting acknowledgement.
    pub fn pending(
        temp_id: TempId,
        conversation_id: ConversationId,
        sender_id: UserId,
        recipient_id: UserId,
        content: String,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            temp_id: Some(temp_id),
            conversation_id,
            sender_id,
            recipient_id,
            content,
            sent_at,
            is_read: false,
            read_at: None,
            status: MessageStatus::Pending,
            failure: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.id.is_some()
    }
}

/// A member of an interview room as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub name: String,
    pub role: Role,
}

/// The counterpart occupying the single remote slot of an interview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub user_id: Option<UserId>,
    pub name: String,
    pub role: Role,
    pub audio: bool,
    pub video: bool,
}

impl RemoteParticipant {
    pub fn from_member(member: RoomMember) -> Self {
        Self {
            user_id: member.user_id,
            name: member.name,
            role: member.role,
            audio: true,
            video: true,
        }
    }

    pub fn same_member(&self, member: &RoomMember) -> bool {
        match (&self.user_id, &member.user_id) {
            (Some(a), Some(b)) => a == b,
            _ => self.name == member.name && self.role == member.role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message_at(secs: i64, content: &str) -> Message {
        Message {
            id: Some(MessageId::new(format!("m{secs}"))),
            temp_id: None,
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
            recipient_id: "u2".into(),
            content: content.to_string(),
            sent_at: Utc.timestamp_opt(secs, 0).unwrap(),
            is_read: false,
            read_at: None,
            status: MessageStatus::Sent,
            failure: None,
        }
    }

    fn conversation() -> Conversation {
        Conversation {
            id: "c1".into(),
            participants: ["u1".into(), "u2".into()],
            other: ParticipantSnapshot {
                user_id: "u2".into(),
                name: "Dana".into(),
                avatar_url: None,
                role: Role::Recruiter,
            },
            last_message: None,
            last_message_at: None,
            unread_count: 0,
            context: Some(ConversationContext::ProfileUnlock),
        }
    }

    #[test]
    fn touch_is_monotonic() {
        let mut convo = conversation();
        convo.touch(&message_at(200, "newer"));
        convo.touch(&message_at(100, "older"));

        assert_eq!(convo.last_message_at, Some(Utc.timestamp_opt(200, 0).unwrap()));
        assert_eq!(convo.last_message.unwrap().content, "newer");
    }

    #[test]
    fn counterpart_roles() {
        assert_eq!(Role::Candidate.counterpart(), Role::Recruiter);
        assert!(Role::Recruiter.is_offerer());
        assert!(!Role::Candidate.is_offerer());
    }

    #[test]
    fn server_message_defaults_to_sent() {
        let json = r#"{
            "id": "m1",
            "conversation_id": "c1",
            "sender_id": "u2",
            "recipient_id": "u1",
            "content": "hi",
            "sent_at": "2026-01-02T03:04:05Z"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);
        assert!(msg.is_confirmed());
        assert!(msg.temp_id.is_none());
    }
}
