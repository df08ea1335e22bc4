//! Events published by the session, and typed subscriptions over them.

use std::collections::HashSet;

use tokio::sync::broadcast;
use tracing::warn;

use crate::connection::ConnectionEvent;
use crate::error::{SendFailure, SignalingError, SyncGapError, UploadError};
use crate::interview::{MediaStream, PeerState, RecordingState, SignalingState};
use crate::messages::PrependOutcome;
use crate::models::{ConversationId, RemoteParticipant, TempId, UserId};
use crate::protocol::InterviewChatMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connection(ConnectionEvent),

    PresenceSynced { online: Vec<UserId> },
    PresenceChanged { user_id: UserId, is_online: bool },

    ConversationsChanged,
    UnreadChanged { total: u32 },

    MessagesChanged { conversation_id: ConversationId },
    MessageFailed {
        conversation_id: ConversationId,
        temp_id: TempId,
        failure: SendFailure,
    },
    OlderLoaded {
        conversation_id: ConversationId,
        outcome: PrependOutcome,
    },
    SyncGap(SyncGapError),

    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },

    SignalingChanged(SignalingState),
    SignalingFailed(SignalingError),
    PeerJoined(RemoteParticipant),
    PeerLeft,
    PeerStateChanged(PeerState),
    RemoteStream(MediaStream),
    RemoteMediaChanged { audio: bool, video: bool },
    InterviewChat(InterviewChatMessage),

    RecordingChanged(RecordingState),
    UploadProgress { percent: u8 },
    UploadFailed(UploadError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connection,
    Presence,
    Conversations,
    Messages,
    Typing,
    Interview,
    Recording,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connection(_) => EventKind::Connection,
            Self::PresenceSynced { .. } | Self::PresenceChanged { .. } => EventKind::Presence,
            Self::ConversationsChanged | Self::UnreadChanged { .. } => EventKind::Conversations,
            Self::MessagesChanged { .. }
            | Self::MessageFailed { .. }
            | Self::OlderLoaded { .. }
            | Self::SyncGap(_) => EventKind::Messages,
            Self::Typing { .. } => EventKind::Typing,
            Self::SignalingChanged(_)
            | Self::SignalingFailed(_)
            | Self::PeerJoined(_)
            | Self::PeerLeft
            | Self::PeerStateChanged(_)
            | Self::RemoteStream(_)
            | Self::RemoteMediaChanged { .. }
            | Self::InterviewChat(_) => EventKind::Interview,
            Self::RecordingChanged(_) | Self::UploadProgress { .. } | Self::UploadFailed(_) => {
                EventKind::Recording
            }
        }
    }
}

/// Receives the session's events of the requested kinds, in publish order.
/// Dropping it (or calling `unsubscribe`) ends the subscription.
pub struct Subscription {
    rx: broadcast::Receiver<SessionEvent>,
    kinds: HashSet<EventKind>,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<SessionEvent>, kinds: &[EventKind]) -> Self {
        Self {
            rx,
            kinds: kinds.iter().copied().collect(),
        }
    }

    fn wants(&self, event: &SessionEvent) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&event.kind())
    }

    /// Next matching event, or `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscription_filters_by_kind() {
        let (tx, _) = broadcast::channel(16);
        let mut typing_only = Subscription::new(tx.subscribe(), &[EventKind::Typing]);
        let mut everything = Subscription::new(tx.subscribe(), &[]);

        tx.send(SessionEvent::ConversationsChanged).unwrap();
        tx.send(SessionEvent::Typing {
            conversation_id: "c1".into(),
            user_id: "u2".into(),
            is_typing: true,
        })
        .unwrap();
        drop(tx);

        assert!(matches!(typing_only.recv().await, Some(SessionEvent::Typing { .. })));
        assert_eq!(typing_only.recv().await, None);
        assert_eq!(everything.recv().await, Some(SessionEvent::ConversationsChanged));
    }

    #[test]
    fn kinds_group_related_events() {
        assert_eq!(SessionEvent::PeerLeft.kind(), EventKind::Interview);
        assert_eq!(SessionEvent::UploadProgress { percent: 5 }.kind(), EventKind::Recording);
        assert_eq!(
            SessionEvent::UnreadChanged { total: 2 }.kind(),
            EventKind::Conversations
        );
    }
}
