use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

use super::actor::{ActorParts, Command, SessionActor};
use super::events::{EventKind, SessionEvent, Subscription};
use super::{InterviewSnapshot, RecordingSnapshot};
use crate::backend::Backend;
use crate::config::RtcConfig;
use crate::connection::{ConnectionManager, ConnectionStatus, Connector};
use crate::directory::ConversationPage;
use crate::error::{ConnectionError, SessionError};
use crate::interview::{
    MediaPrefs, MediaStream, PeerConnector, PeerMediaSession, RecorderFactory,
    RecordingController, SignalingState,
};
use crate::messages::{PrependOutcome, StreamSnapshot};
use crate::models::{Conversation, ConversationId, InterviewId, Role, TempId, UserId};
use crate::protocol::InterviewChatMessage;

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Everything a session is built from.
pub struct SessionOptions {
    pub user_id: UserId,
    pub config: RtcConfig,
    pub connector: Arc<dyn Connector>,
    pub backend: Arc<dyn Backend>,
    pub peers: Arc<dyn PeerConnector>,
    pub recorder: Arc<dyn RecorderFactory>,
}

/// Cloneable handle to a running session.
///
/// Every call is answered by the session task in the order it was made.
/// Once the task is gone calls fail with `SessionError::Closed`.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<Command>,
    connection: Arc<ConnectionManager>,
    events: broadcast::Sender<SessionEvent>,
    user_id: UserId,
}

impl SessionHandle {
    /// Spawn the session task. Must be called inside a tokio runtime.
    pub fn spawn(options: SessionOptions) -> Self {
        let SessionOptions {
            user_id,
            config,
            connector,
            backend,
            peers,
            recorder,
        } = options;

        let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (channel_tx, channel) = mpsc::unbounded_channel();
        let (peer_tx, peer_events) = mpsc::unbounded_channel();

        let connection = Arc::new(ConnectionManager::new(
            connector,
            config.connection.clone(),
            channel_tx,
        ));
        let recording = RecordingController::new(
            recorder,
            config.recording.mime_type.clone(),
            config.recording.progress_step_percent,
        );

        let actor = SessionActor::new(ActorParts {
            user_id: user_id.clone(),
            config,
            connection: connection.clone(),
            backend,
            events: events.clone(),
            commands,
            channel,
            media: PeerMediaSession::new(peers, peer_tx),
            peer_events,
            recording,
        });
        tokio::spawn(actor.run());
        debug!(user = %user_id, "session spawned");

        Self {
            sender,
            connection,
            events,
            user_id,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::NoResponse)
    }

    async fn tell(&self, command: Command) -> Result<(), SessionError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    // -- connection --

    pub async fn connect(&self, token: &str) -> Result<(), ConnectionError> {
        self.connection.connect(token).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn status_text(&self) -> String {
        self.connection.status_text()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    pub fn retry_now(&self) {
        self.connection.retry_now()
    }

    /// Subscribe to events of the given kinds; an empty slice means all.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        Subscription::new(self.events.subscribe(), kinds)
    }

    // -- presence --

    pub async fn is_online(&self, user_id: UserId) -> Result<bool, SessionError> {
        self.call(|respond_to| Command::IsOnline {
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn online_users(&self) -> Result<Vec<UserId>, SessionError> {
        self.call(|respond_to| Command::OnlineUsers { respond_to }).await
    }

    // -- conversations --

    /// One page of the conversation list, served from cache when possible.
    pub async fn list_conversations(
        &self,
        search: Option<String>,
        page: u32,
    ) -> Result<ConversationPage, SessionError> {
        self.call(|respond_to| Command::ListConversations {
            search,
            page,
            respond_to,
        })
        .await?
    }

    pub async fn cached_conversations(&self) -> Result<Vec<Conversation>, SessionError> {
        self.call(|respond_to| Command::CachedConversations { respond_to })
            .await
    }

    pub async fn total_unread(&self) -> Result<u32, SessionError> {
        self.call(|respond_to| Command::TotalUnread { respond_to }).await
    }

    // -- messages --

    /// Join the conversation's room and load its latest history page.
    pub async fn open_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<StreamSnapshot, SessionError> {
        self.call(|respond_to| Command::OpenConversation {
            conversation_id,
            respond_to,
        })
        .await?
    }

    pub async fn leave_conversation(&self, conversation_id: ConversationId) -> Result<(), SessionError> {
        self.call(|respond_to| Command::LeaveConversation {
            conversation_id,
            respond_to,
        })
        .await
    }

    pub async fn messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<StreamSnapshot>, SessionError> {
        self.call(|respond_to| Command::Messages {
            conversation_id,
            respond_to,
        })
        .await
    }

    /// Append an optimistic entry and send it. Returns its temp id at once;
    /// the outcome arrives as `MessagesChanged` / `MessageFailed` events.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> Result<TempId, SessionError> {
        let content = content.into();
        self.call(|respond_to| Command::SendMessage {
            conversation_id,
            content,
            respond_to,
        })
        .await?
    }

    pub async fn retry_message(
        &self,
        conversation_id: ConversationId,
        temp_id: TempId,
    ) -> Result<(), SessionError> {
        self.call(|respond_to| Command::RetryMessage {
            conversation_id,
            temp_id,
            respond_to,
        })
        .await?
    }

    /// Prepend the next older page. `Ok(None)` when a load is already
    /// running or history is exhausted.
    pub async fn load_older(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<PrependOutcome>, SessionError> {
        self.call(|respond_to| Command::LoadOlder {
            conversation_id,
            respond_to,
        })
        .await?
    }

    pub async fn set_first_visible_row(
        &self,
        conversation_id: ConversationId,
        row: usize,
    ) -> Result<(), SessionError> {
        self.tell(Command::SetFirstVisibleRow {
            conversation_id,
            row,
        })
        .await
    }

    // -- typing --

    pub async fn keystroke(&self, conversation_id: ConversationId) -> Result<(), SessionError> {
        self.tell(Command::Keystroke { conversation_id }).await
    }

    pub async fn typing_users(&self, conversation_id: ConversationId) -> Result<Vec<UserId>, SessionError> {
        self.call(|respond_to| Command::TypingUsers {
            conversation_id,
            respond_to,
        })
        .await
    }

    // -- interview --

    pub async fn join_interview(
        &self,
        interview_id: InterviewId,
        role: Role,
    ) -> Result<SignalingState, SessionError> {
        self.call(|respond_to| Command::JoinInterview {
            interview_id,
            role,
            respond_to,
        })
        .await?
    }

    pub async fn end_interview(&self) -> Result<(), SessionError> {
        self.call(|respond_to| Command::EndInterview { respond_to })
            .await
    }

    /// Provide the local camera/microphone stream used by the next peer
    /// connection.
    pub async fn set_local_stream(&self, stream: MediaStream) -> Result<(), SessionError> {
        self.tell(Command::SetLocalStream { stream }).await
    }

    pub async fn toggle_audio(&self) -> Result<MediaPrefs, SessionError> {
        self.call(|respond_to| Command::ToggleAudio { respond_to }).await
    }

    pub async fn toggle_video(&self) -> Result<MediaPrefs, SessionError> {
        self.call(|respond_to| Command::ToggleVideo { respond_to }).await
    }

    pub async fn interview_status(&self) -> Result<InterviewSnapshot, SessionError> {
        self.call(|respond_to| Command::InterviewStatus { respond_to })
            .await
    }

    pub async fn send_interview_chat(
        &self,
        text: impl Into<String>,
    ) -> Result<InterviewChatMessage, SessionError> {
        let text = text.into();
        self.call(|respond_to| Command::SendInterviewChat { text, respond_to })
            .await?
    }

    // -- recording --

    pub async fn start_recording(&self) -> Result<(), SessionError> {
        self.call(|respond_to| Command::StartRecording { respond_to })
            .await?
    }

    pub async fn pause_recording(&self) -> Result<bool, SessionError> {
        self.call(|respond_to| Command::PauseRecording { respond_to })
            .await?
    }

    pub async fn resume_recording(&self) -> Result<bool, SessionError> {
        self.call(|respond_to| Command::ResumeRecording { respond_to })
            .await?
    }

    /// Stop and start uploading. Returns the recorded duration.
    pub async fn stop_recording(&self) -> Result<Duration, SessionError> {
        self.call(|respond_to| Command::StopRecording { respond_to })
            .await?
    }

    pub async fn retry_upload(&self) -> Result<(), SessionError> {
        self.call(|respond_to| Command::RetryUpload { respond_to })
            .await?
    }

    pub async fn recording_status(&self) -> Result<RecordingSnapshot, SessionError> {
        self.call(|respond_to| Command::RecordingStatus { respond_to })
            .await
    }

    /// Tear the session down: leave the interview, release media, discard
    /// any recording and close the channel. Idempotent.
    pub async fn shutdown(&self) {
        if self
            .call(|respond_to| Command::Shutdown { respond_to })
            .await
            .is_err()
        {
            debug!("session already shut down");
        }
    }
}
