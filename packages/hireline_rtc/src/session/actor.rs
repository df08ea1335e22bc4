use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::SessionEvent;
use super::{InterviewSnapshot, RecordingSnapshot};
use crate::backend::Backend;
use crate::config::RtcConfig;
use crate::connection::{ChannelEvent, ConnectionEvent, ConnectionManager, Outbox};
use crate::directory::{ConversationDirectory, ConversationPage, ConversationQuery, NewMessageOutcome};
use crate::error::{ConnectionError, SendFailure, SessionError, SignalingError, UploadError};
use crate::interview::{
    InterviewChat, MediaPrefs, MediaStream, PeerEvent, PeerEventEnvelope, PeerMediaSession,
    PeerState, RecordingController, RecordingState, RecordingUpload, SignalingEffect,
    SignalingSession, SignalingState, UploadProgress,
};
use crate::messages::{Incoming, MessagePage, MessageStream, PrependOutcome, StreamSnapshot};
use crate::models::{
    Conversation, ConversationId, InterviewId, Message, Role, RoomMember, TempId, UserId,
};
use crate::presence::PresenceSet;
use crate::protocol::{ClientEvent, InterviewChatMessage, Reply, ServerEvent};
use crate::typing::{LocalTyping, RemoteTyping, TypingSignal};

pub(crate) type Responder<T> = oneshot::Sender<T>;

/// Commands sent by `SessionHandle` to the session actor
#[derive(Debug)]
pub(crate) enum Command {
    IsOnline {
        user_id: UserId,
        respond_to: Responder<bool>,
    },
    OnlineUsers {
        respond_to: Responder<Vec<UserId>>,
    },
    ListConversations {
        search: Option<String>,
        page: u32,
        respond_to: Responder<Result<ConversationPage, SessionError>>,
    },
    CachedConversations {
        respond_to: Responder<Vec<Conversation>>,
    },
    TotalUnread {
        respond_to: Responder<u32>,
    },
    OpenConversation {
        conversation_id: ConversationId,
        respond_to: Responder<Result<StreamSnapshot, SessionError>>,
    },
    LeaveConversation {
        conversation_id: ConversationId,
        respond_to: Responder<()>,
    },
    Messages {
        conversation_id: ConversationId,
        respond_to: Responder<Option<StreamSnapshot>>,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        respond_to: Responder<Result<TempId, SessionError>>,
    },
    RetryMessage {
        conversation_id: ConversationId,
        temp_id: TempId,
        respond_to: Responder<Result<(), SessionError>>,
    },
    LoadOlder {
        conversation_id: ConversationId,
        respond_to: Responder<Result<Option<PrependOutcome>, SessionError>>,
    },
    SetFirstVisibleRow {
        conversation_id: ConversationId,
        row: usize,
    },
    Keystroke {
        conversation_id: ConversationId,
    },
    TypingUsers {
        conversation_id: ConversationId,
        respond_to: Responder<Vec<UserId>>,
    },
    JoinInterview {
        interview_id: InterviewId,
        role: Role,
        respond_to: Responder<Result<SignalingState, SessionError>>,
    },
    EndInterview {
        respond_to: Responder<()>,
    },
    SetLocalStream {
        stream: MediaStream,
    },
    ToggleAudio {
        respond_to: Responder<MediaPrefs>,
    },
    ToggleVideo {
        respond_to: Responder<MediaPrefs>,
    },
    InterviewStatus {
        respond_to: Responder<InterviewSnapshot>,
    },
    SendInterviewChat {
        text: String,
        respond_to: Responder<Result<InterviewChatMessage, SessionError>>,
    },
    StartRecording {
        respond_to: Responder<Result<(), SessionError>>,
    },
    PauseRecording {
        respond_to: Responder<Result<bool, SessionError>>,
    },
    ResumeRecording {
        respond_to: Responder<Result<bool, SessionError>>,
    },
    StopRecording {
        respond_to: Responder<Result<Duration, SessionError>>,
    },
    RetryUpload {
        respond_to: Responder<Result<(), SessionError>>,
    },
    RecordingStatus {
        respond_to: Responder<RecordingSnapshot>,
    },
    Shutdown {
        respond_to: Responder<()>,
    },
}

/// Completions of work the actor spawned, fed back into its mailbox.
enum Internal {
    SendSettled {
        conversation_id: ConversationId,
        temp_id: TempId,
        result: Result<Reply, ConnectionError>,
    },
    OnlineUsers {
        result: Result<Reply, ConnectionError>,
    },
    JoinSettled {
        epoch: u64,
        result: Result<Reply, ConnectionError>,
    },
    ChatSettled {
        result: Result<Reply, ConnectionError>,
        respond_to: Responder<Result<InterviewChatMessage, SessionError>>,
    },
    ConversationsFetched {
        query: ConversationQuery,
        result: anyhow::Result<ConversationPage>,
        respond_to: Responder<Result<ConversationPage, SessionError>>,
    },
    DirectoryRefetched {
        query: ConversationQuery,
        result: anyhow::Result<ConversationPage>,
    },
    LatestFetched {
        conversation_id: ConversationId,
        result: anyhow::Result<MessagePage>,
    },
    OlderFetched {
        conversation_id: ConversationId,
        result: anyhow::Result<MessagePage>,
        respond_to: Responder<Result<Option<PrependOutcome>, SessionError>>,
    },
    ResyncFetched {
        conversation_id: ConversationId,
        result: anyhow::Result<Vec<Message>>,
    },
    MarkedRead {
        conversation_id: ConversationId,
        result: anyhow::Result<()>,
    },
    UploadProgress(UploadProgress),
    UploadFinished(anyhow::Result<()>),
}

fn backend_error(error: anyhow::Error) -> SessionError {
    SessionError::Backend(format!("{error:#}"))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Channels and collaborators the actor is built from.
pub(crate) struct ActorParts {
    pub user_id: UserId,
    pub config: RtcConfig,
    pub connection: Arc<ConnectionManager>,
    pub backend: Arc<dyn Backend>,
    pub events: broadcast::Sender<SessionEvent>,
    pub commands: mpsc::Receiver<Command>,
    pub channel: mpsc::UnboundedReceiver<ChannelEvent>,
    pub media: PeerMediaSession,
    pub peer_events: mpsc::UnboundedReceiver<PeerEventEnvelope>,
    pub recording: RecordingController,
}

/// Owns all session state. Every mutation happens on this task, one event
/// at a time.
pub(crate) struct SessionActor {
    self_id: UserId,
    config: RtcConfig,
    connection: Arc<ConnectionManager>,
    backend: Arc<dyn Backend>,
    events: broadcast::Sender<SessionEvent>,
    commands: mpsc::Receiver<Command>,
    channel: mpsc::UnboundedReceiver<ChannelEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    peer_events: mpsc::UnboundedReceiver<PeerEventEnvelope>,
    teardown: CancellationToken,
    outbox: Option<Outbox>,

    presence: PresenceSet,
    directory: ConversationDirectory,
    streams: HashMap<ConversationId, MessageStream>,
    /// Conversation currently on screen (joined on the channel).
    active: Option<ConversationId>,
    pending_opens: HashMap<ConversationId, Vec<Responder<Result<StreamSnapshot, SessionError>>>>,
    local_typing: HashMap<ConversationId, LocalTyping>,
    remote_typing: RemoteTyping,

    signaling: SignalingSession,
    join_epoch: u64,
    pending_join: Option<Responder<Result<SignalingState, SessionError>>>,
    media: PeerMediaSession,
    recording: RecordingController,
    chat: InterviewChat,
}

impl SessionActor {
    pub(crate) fn new(parts: ActorParts) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let conversation_limit = parts.config.messages.conversation_page_size;
        let remote_expiry = parts.config.typing.remote_expiry();
        Self {
            directory: ConversationDirectory::new(parts.user_id.clone(), conversation_limit),
            remote_typing: RemoteTyping::new(parts.user_id.clone(), remote_expiry),
            signaling: SignalingSession::new(parts.user_id.clone()),
            self_id: parts.user_id,
            config: parts.config,
            connection: parts.connection,
            backend: parts.backend,
            events: parts.events,
            commands: parts.commands,
            channel: parts.channel,
            internal_tx,
            internal_rx,
            peer_events: parts.peer_events,
            teardown: CancellationToken::new(),
            outbox: None,
            presence: PresenceSet::new(),
            streams: HashMap::new(),
            active: None,
            pending_opens: HashMap::new(),
            local_typing: HashMap::new(),
            join_epoch: 0,
            pending_join: None,
            media: parts.media,
            recording: parts.recording,
            chat: InterviewChat::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        info!(user = %self.self_id, "session started");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { respond_to }) => {
                        self.shutdown().await;
                        let _ = respond_to.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.channel.recv() => self.handle_channel(event).await,
                Some(done) = self.internal_rx.recv() => self.handle_internal(done),
                Some(envelope) = self.peer_events.recv() => self.handle_peer(envelope),
                _ = sleep_until(deadline) => self.handle_timers(Instant::now()),
            }
        }

        debug!("all session handles dropped");
        self.shutdown().await;
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish_conversations(&self) {
        self.publish(SessionEvent::ConversationsChanged);
        self.publish(SessionEvent::UnreadChanged {
            total: self.directory.total_unread(),
        });
    }

    fn emit(&self, event: ClientEvent) -> Result<(), SendFailure> {
        let outbox = self.outbox.as_ref().ok_or(SendFailure::NotConnected)?;
        outbox.try_emit(event).map_err(|e| {
            warn!(error = %e, "outbound event dropped");
            SendFailure::ChannelClosed
        })
    }

    fn request(&self, event: ClientEvent) -> Result<oneshot::Receiver<Reply>, SendFailure> {
        let outbox = self.outbox.as_ref().ok_or(SendFailure::NotConnected)?;
        outbox.try_request(event).map_err(|e| {
            warn!(error = %e, "outbound request dropped");
            SendFailure::ChannelClosed
        })
    }

    /// Await an ack off the actor task. Not tied to teardown: an in-flight
    /// request settles on its own, and a result arriving after teardown has
    /// nowhere to go.
    fn settle<F>(&self, reply: oneshot::Receiver<Reply>, done: F)
    where
        F: FnOnce(Result<Reply, ConnectionError>) -> Internal + Send + 'static,
    {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = reply
                .await
                .map_err(|_| ConnectionError::Network("link dropped before ack".to_string()));
            let _ = internal.send(done(result));
        });
    }

    /// Run a backend call off the actor task; cancelled on teardown.
    fn spawn_backend<T, F>(&self, call: BoxFuture<'static, anyhow::Result<T>>, done: F)
    where
        T: Send + 'static,
        F: FnOnce(anyhow::Result<T>) -> Internal + Send + 'static,
    {
        let internal = self.internal_tx.clone();
        let teardown = self.teardown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = teardown.cancelled() => {}
                result = call => {
                    let _ = internal.send(done(result));
                }
            }
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.local_typing
            .values()
            .filter_map(LocalTyping::deadline)
            .chain(self.remote_typing.next_deadline())
            .min()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::IsOnline {
                user_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.presence.is_online(&user_id));
            }

            Command::OnlineUsers { respond_to } => {
                let _ = respond_to.send(self.presence.online_users());
            }

            Command::ListConversations {
                search,
                page,
                respond_to,
            } => self.list_conversations(search, page, respond_to),

            Command::CachedConversations { respond_to } => {
                let _ = respond_to.send(self.directory.items());
            }

            Command::TotalUnread { respond_to } => {
                let _ = respond_to.send(self.directory.total_unread());
            }

            Command::OpenConversation {
                conversation_id,
                respond_to,
            } => self.open_conversation(conversation_id, respond_to),

            Command::LeaveConversation {
                conversation_id,
                respond_to,
            } => {
                self.leave_conversation(&conversation_id);
                let _ = respond_to.send(());
            }

            Command::Messages {
                conversation_id,
                respond_to,
            } => {
                let snapshot = self.streams.get(&conversation_id).map(MessageStream::snapshot);
                let _ = respond_to.send(snapshot);
            }

            Command::SendMessage {
                conversation_id,
                content,
                respond_to,
            } => {
                let _ = respond_to.send(self.send_message(conversation_id, content));
            }

            Command::RetryMessage {
                conversation_id,
                temp_id,
                respond_to,
            } => {
                let result = if self.outbox.is_none() {
                    Err(SessionError::Send(SendFailure::NotConnected))
                } else {
                    self.dispatch(&conversation_id, temp_id)
                };
                let _ = respond_to.send(result);
            }

            Command::LoadOlder {
                conversation_id,
                respond_to,
            } => self.load_older(conversation_id, respond_to),

            Command::SetFirstVisibleRow {
                conversation_id,
                row,
            } => {
                if let Some(stream) = self.streams.get_mut(&conversation_id) {
                    stream.set_first_visible_row(row);
                }
            }

            Command::Keystroke { conversation_id } => self.keystroke(conversation_id),

            Command::TypingUsers {
                conversation_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.remote_typing.typing_in(&conversation_id));
            }

            Command::JoinInterview {
                interview_id,
                role,
                respond_to,
            } => self.join_interview(interview_id, role, respond_to),

            Command::EndInterview { respond_to } => {
                self.end_interview();
                let _ = respond_to.send(());
            }

            Command::SetLocalStream { stream } => self.media.set_local_stream(stream),

            Command::ToggleAudio { respond_to } => {
                let prefs = self.media.toggle_audio();
                self.broadcast_media_state(prefs);
                let _ = respond_to.send(prefs);
            }

            Command::ToggleVideo { respond_to } => {
                let prefs = self.media.toggle_video();
                self.broadcast_media_state(prefs);
                let _ = respond_to.send(prefs);
            }

            Command::InterviewStatus { respond_to } => {
                let _ = respond_to.send(self.interview_snapshot());
            }

            Command::SendInterviewChat { text, respond_to } => {
                self.send_interview_chat(text, respond_to)
            }

            Command::StartRecording { respond_to } => {
                let _ = respond_to.send(self.start_recording());
            }

            Command::PauseRecording { respond_to } => {
                let result = self.recording.pause(Instant::now());
                if matches!(result, Ok(true)) {
                    self.publish(SessionEvent::RecordingChanged(self.recording.state()));
                }
                let _ = respond_to.send(result.map_err(SessionError::from));
            }

            Command::ResumeRecording { respond_to } => {
                let result = self.recording.resume(Instant::now());
                if matches!(result, Ok(true)) {
                    self.publish(SessionEvent::RecordingChanged(self.recording.state()));
                }
                let _ = respond_to.send(result.map_err(SessionError::from));
            }

            Command::StopRecording { respond_to } => {
                let _ = respond_to.send(self.stop_recording());
            }

            Command::RetryUpload { respond_to } => {
                let result = self.recording.retry_upload().map(|upload| {
                    self.publish(SessionEvent::RecordingChanged(self.recording.state()));
                    self.start_upload(upload);
                });
                let _ = respond_to.send(result.map_err(SessionError::from));
            }

            Command::RecordingStatus { respond_to } => {
                let _ = respond_to.send(RecordingSnapshot {
                    state: self.recording.state(),
                    duration: self.recording.duration(Instant::now()),
                    progress: self.recording.progress(),
                    last_error: self.recording.last_error().cloned(),
                });
            }

            // Handled in `run`.
            Command::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    // =========================================================================
    // Conversations and messages
    // =========================================================================

    fn list_conversations(
        &mut self,
        search: Option<String>,
        page: u32,
        respond_to: Responder<Result<ConversationPage, SessionError>>,
    ) {
        let limit = self.config.messages.conversation_page_size;
        let query = ConversationQuery::new(search.as_deref(), page, limit);
        if let Some(cached) = self.directory.cached(&query) {
            let _ = respond_to.send(Ok(cached));
            return;
        }
        let call = self.backend.fetch_conversations(query.clone());
        self.spawn_backend(call, move |result| Internal::ConversationsFetched {
            query,
            result,
            respond_to,
        });
    }

    fn spawn_refetch(&self, query: ConversationQuery) {
        debug!(search = ?query.search, "refetching conversation list");
        let call = self.backend.fetch_conversations(query.clone());
        self.spawn_backend(call, move |result| Internal::DirectoryRefetched { query, result });
    }

    fn open_conversation(
        &mut self,
        conversation_id: ConversationId,
        respond_to: Responder<Result<StreamSnapshot, SessionError>>,
    ) {
        if let Some(previous) = self.active.clone() {
            if previous != conversation_id {
                self.leave_conversation(&previous);
            }
        }
        self.active = Some(conversation_id.clone());
        if self.directory.select(&conversation_id) {
            self.publish_conversations();
        }
        // Offline is fine: the room is joined again on connect.
        let _ = self.emit(ClientEvent::JoinConversation {
            conversation_id: conversation_id.clone(),
        });

        let counterpart = self
            .directory
            .get(&conversation_id)
            .map(|c| c.other.user_id.clone());
        let self_id = self.self_id.clone();
        let loaded = self
            .streams
            .entry(conversation_id.clone())
            .or_insert_with(|| MessageStream::new(conversation_id.clone(), self_id, counterpart))
            .is_loaded();

        if loaded {
            debug!(conversation = %conversation_id, "resuming cached conversation");
            self.mark_viewed(&conversation_id);
            let snapshot = self.streams.get(&conversation_id).map(MessageStream::snapshot);
            let _ = respond_to.send(snapshot.ok_or(SessionError::UnknownConversation(conversation_id)));
            return;
        }

        let waiters = self.pending_opens.entry(conversation_id.clone()).or_default();
        waiters.push(respond_to);
        if waiters.len() == 1 {
            let limit = self.config.messages.history_page_size;
            let call = self.backend.fetch_messages(conversation_id.clone(), 1, limit);
            self.spawn_backend(call, move |result| Internal::LatestFetched {
                conversation_id,
                result,
            });
        }
    }

    /// Unsubscribe from the conversation's room. Its stream stays cached.
    fn leave_conversation(&mut self, conversation_id: &ConversationId) {
        self.stop_local_typing(conversation_id);
        let _ = self.emit(ClientEvent::LeaveConversation {
            conversation_id: conversation_id.clone(),
        });
        if self.active.as_ref() == Some(conversation_id) {
            self.active = None;
        }
    }

    fn mark_viewed(&mut self, conversation_id: &ConversationId) {
        if !self.config.messages.mark_read_on_view {
            return;
        }
        let flipped = self
            .streams
            .get_mut(conversation_id)
            .map(|stream| stream.mark_incoming_read(Utc::now()))
            .unwrap_or(0);
        if flipped > 0 {
            self.publish(SessionEvent::MessagesChanged {
                conversation_id: conversation_id.clone(),
            });
        }
        if self.directory.on_read(conversation_id) {
            self.publish_conversations();
        }
        let call = self.backend.mark_as_read(conversation_id.clone());
        let conversation_id = conversation_id.clone();
        self.spawn_backend(call, move |result| Internal::MarkedRead {
            conversation_id,
            result,
        });
    }

    fn send_message(
        &mut self,
        conversation_id: ConversationId,
        content: String,
    ) -> Result<TempId, SessionError> {
        if content.trim().is_empty() {
            return Err(SessionError::Send(SendFailure::Rejected(
                "empty message".to_string(),
            )));
        }
        let stream = self
            .streams
            .get_mut(&conversation_id)
            .ok_or_else(|| SessionError::UnknownConversation(conversation_id.clone()))?;
        let temp_id = stream.compose(content, Utc::now());
        self.stop_local_typing(&conversation_id);
        self.publish(SessionEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });

        if self.outbox.is_some() {
            // A failure is recorded on the entry itself.
            let _ = self.dispatch(&conversation_id, temp_id);
        } else {
            debug!(conversation = %conversation_id, %temp_id, "offline, message stays pending");
        }
        Ok(temp_id)
    }

    fn dispatch(&mut self, conversation_id: &ConversationId, temp_id: TempId) -> Result<(), SessionError> {
        let stream = self
            .streams
            .get_mut(conversation_id)
            .ok_or_else(|| SessionError::UnknownConversation(conversation_id.clone()))?;
        let event = stream.dispatch(temp_id)?;
        self.publish(SessionEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });

        match self.request(event) {
            Ok(reply) => {
                let conversation_id = conversation_id.clone();
                self.settle(reply, move |result| Internal::SendSettled {
                    conversation_id,
                    temp_id,
                    result,
                });
                Ok(())
            }
            Err(failure) => {
                self.fail_send(conversation_id, temp_id, failure.clone());
                Err(failure.into())
            }
        }
    }

    fn fail_send(&mut self, conversation_id: &ConversationId, temp_id: TempId, failure: SendFailure) {
        if let Some(stream) = self.streams.get_mut(conversation_id) {
            stream.on_send_failed(temp_id, failure.clone());
        }
        self.publish(SessionEvent::MessageFailed {
            conversation_id: conversation_id.clone(),
            temp_id,
            failure,
        });
        self.publish(SessionEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });
    }

    fn on_send_settled(
        &mut self,
        conversation_id: ConversationId,
        temp_id: TempId,
        result: Result<Reply, ConnectionError>,
    ) {
        let message = match result {
            Ok(Reply::MessageAck { message }) => message,
            Ok(Reply::Error { message }) => {
                return self.fail_send(&conversation_id, temp_id, SendFailure::Rejected(message));
            }
            Ok(other) => {
                warn!(?other, "unexpected reply to send-message");
                let failure = SendFailure::Rejected("unexpected reply".to_string());
                return self.fail_send(&conversation_id, temp_id, failure);
            }
            Err(error) => {
                debug!(%error, %temp_id, "send did not complete");
                return self.fail_send(&conversation_id, temp_id, SendFailure::ChannelClosed);
            }
        };

        debug!(conversation = %conversation_id, %temp_id, id = ?message.id, "message acknowledged");
        self.update_directory(&message);
        if let Some(stream) = self.streams.get_mut(&conversation_id) {
            stream.on_ack(temp_id, message);
            self.publish(SessionEvent::MessagesChanged { conversation_id });
        }
    }

    fn load_older(
        &mut self,
        conversation_id: ConversationId,
        respond_to: Responder<Result<Option<PrependOutcome>, SessionError>>,
    ) {
        let Some(stream) = self.streams.get_mut(&conversation_id) else {
            let _ = respond_to.send(Err(SessionError::UnknownConversation(conversation_id)));
            return;
        };
        let Some(page) = stream.begin_load_older() else {
            let _ = respond_to.send(Ok(None));
            return;
        };
        let limit = self.config.messages.history_page_size;
        let call = self.backend.fetch_messages(conversation_id.clone(), page, limit);
        self.spawn_backend(call, move |result| Internal::OlderFetched {
            conversation_id,
            result,
            respond_to,
        });
    }

    fn update_directory(&mut self, message: &Message) {
        match self.directory.on_new_message(message) {
            NewMessageOutcome::Moved { from_page } => {
                debug!(conversation = %message.conversation_id, from_page, "conversation moved to top");
                self.publish_conversations();
            }
            NewMessageOutcome::Refetch(query) => {
                self.spawn_refetch(query);
                self.publish_conversations();
            }
            NewMessageOutcome::RefetchQueued
            | NewMessageOutcome::NotLoaded
            | NewMessageOutcome::Duplicate => {}
        }
    }

    fn on_new_message(&mut self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        let from_other = message.sender_id != self.self_id;

        if from_other && self.remote_typing.stop(&conversation_id, &message.sender_id) {
            self.publish(SessionEvent::Typing {
                conversation_id: conversation_id.clone(),
                user_id: message.sender_id.clone(),
                is_typing: false,
            });
        }

        if let Some(stream) = self.streams.get_mut(&conversation_id) {
            if stream.on_incoming(message.clone()) != Incoming::Ignored {
                self.publish(SessionEvent::MessagesChanged {
                    conversation_id: conversation_id.clone(),
                });
            }
        }

        self.update_directory(&message);

        if from_other && self.active.as_ref() == Some(&conversation_id) {
            self.mark_viewed(&conversation_id);
        }
    }

    fn start_resync(&mut self) {
        let due: Vec<(ConversationId, DateTime<Utc>)> = self
            .streams
            .iter_mut()
            .filter_map(|(id, stream)| stream.begin_resync().map(|since| (id.clone(), since)))
            .collect();
        for (conversation_id, since) in due {
            debug!(conversation = %conversation_id, %since, "resyncing");
            self.publish(SessionEvent::MessagesChanged {
                conversation_id: conversation_id.clone(),
            });
            let call = self.backend.fetch_messages_since(conversation_id.clone(), since);
            self.spawn_backend(call, move |result| Internal::ResyncFetched {
                conversation_id,
                result,
            });
        }
    }

    // =========================================================================
    // Typing
    // =========================================================================

    fn keystroke(&mut self, conversation_id: ConversationId) {
        let idle = self.config.typing.idle_timeout();
        let signal = self
            .local_typing
            .entry(conversation_id.clone())
            .or_insert_with(|| LocalTyping::new(idle))
            .keystroke(Instant::now());
        if signal == Some(TypingSignal::Start) {
            let _ = self.emit(ClientEvent::StartTyping { conversation_id });
        }
    }

    fn stop_local_typing(&mut self, conversation_id: &ConversationId) {
        let stopped = self
            .local_typing
            .get_mut(conversation_id)
            .and_then(LocalTyping::stop);
        if stopped.is_some() {
            let _ = self.emit(ClientEvent::StopTyping {
                conversation_id: conversation_id.clone(),
            });
        }
    }

    fn handle_timers(&mut self, now: Instant) {
        let idle: Vec<ConversationId> = self
            .local_typing
            .iter_mut()
            .filter_map(|(id, typing)| typing.tick(now).map(|_| id.clone()))
            .collect();
        for conversation_id in idle {
            let _ = self.emit(ClientEvent::StopTyping { conversation_id });
        }

        for (conversation_id, user_id) in self.remote_typing.expire(now) {
            self.publish(SessionEvent::Typing {
                conversation_id,
                user_id,
                is_typing: false,
            });
        }
    }

    // =========================================================================
    // Interview
    // =========================================================================

    fn join_interview(
        &mut self,
        interview_id: InterviewId,
        role: Role,
        respond_to: Responder<Result<SignalingState, SessionError>>,
    ) {
        let event = match self.signaling.begin_join(interview_id, role) {
            Ok(event) => event,
            Err(error) => {
                let _ = respond_to.send(Err(error.into()));
                return;
            }
        };
        self.join_epoch += 1;
        let epoch = self.join_epoch;
        self.publish(SessionEvent::SignalingChanged(SignalingState::Joining));

        match self.request(event) {
            Ok(reply) => {
                self.pending_join = Some(respond_to);
                self.settle(reply, move |result| Internal::JoinSettled { epoch, result });
            }
            Err(failure) => {
                let error = self
                    .signaling
                    .fail_join(SignalingError::JoinRejected(failure.to_string()));
                self.publish(SessionEvent::SignalingFailed(error.clone()));
                self.publish(SessionEvent::SignalingChanged(self.signaling.state()));
                let _ = respond_to.send(Err(error.into()));
            }
        }
    }

    fn on_join_settled(&mut self, epoch: u64, result: Result<Reply, ConnectionError>) {
        if epoch != self.join_epoch {
            debug!(epoch, current = self.join_epoch, "stale join reply");
            return;
        }
        let Some(respond_to) = self.pending_join.take() else {
            return;
        };

        let outcome = match result {
            Ok(Reply::InterviewJoined { existing_users }) => self.signaling.on_joined(existing_users),
            Ok(Reply::Error { message }) => {
                Err(self.signaling.fail_join(SignalingError::JoinRejected(message)))
            }
            Ok(other) => Err(self.signaling.fail_join(SignalingError::ProtocolViolation(
                format!("unexpected reply to join: {other:?}"),
            ))),
            Err(error) => Err(self
                .signaling
                .fail_join(SignalingError::JoinRejected(error.to_string()))),
        };

        match outcome {
            Ok(effects) => {
                if let Some(remote) = self.signaling.remote().cloned() {
                    self.publish(SessionEvent::PeerJoined(remote));
                }
                self.apply_signaling(effects);
                let state = self.signaling.state();
                self.publish(SessionEvent::SignalingChanged(state));
                let _ = respond_to.send(Ok(state));
            }
            Err(error) => {
                self.publish(SessionEvent::SignalingFailed(error.clone()));
                self.publish(SessionEvent::SignalingChanged(self.signaling.state()));
                let _ = respond_to.send(Err(error.into()));
            }
        }
    }

    fn apply_signaling(&mut self, effects: Vec<SignalingEffect>) {
        for effect in effects {
            match effect {
                SignalingEffect::Emit(event) => {
                    if let Err(failure) = self.emit(event) {
                        warn!(%failure, "room event not sent");
                    }
                }
                SignalingEffect::StartPeer { offerer } => {
                    if let Err(error) = self.media.initialize(offerer) {
                        self.negotiation_failed(error.to_string());
                    }
                }
                SignalingEffect::TearDownPeer => self.media.close_connection(),
                SignalingEffect::DeliverSignal(signal) => {
                    if let Err(error) = self.media.apply_signal(signal) {
                        self.negotiation_failed(error.to_string());
                    }
                }
            }
        }
    }

    fn negotiation_failed(&mut self, reason: String) {
        let effects = self.signaling.on_negotiation_failed(reason);
        if let Some(error) = self.signaling.error().cloned() {
            self.publish(SessionEvent::SignalingFailed(error));
        }
        self.apply_signaling(effects);
    }

    /// Run a signaling transition and publish what changed.
    fn signaling_step(&mut self, step: impl FnOnce(&mut SignalingSession) -> Vec<SignalingEffect>) {
        let before = self.signaling.state();
        let had_remote = self.signaling.remote().is_some();

        let effects = step(&mut self.signaling);

        match (had_remote, self.signaling.remote().cloned()) {
            (false, Some(remote)) => self.publish(SessionEvent::PeerJoined(remote)),
            (true, None) => self.publish(SessionEvent::PeerLeft),
            _ => {}
        }
        self.apply_signaling(effects);
        let after = self.signaling.state();
        if after != before {
            self.publish(SessionEvent::SignalingChanged(after));
        }
    }

    fn handle_peer(&mut self, envelope: PeerEventEnvelope) {
        let Some(event) = self.media.on_event(envelope) else {
            return;
        };
        match event {
            PeerEvent::SignalReady(signal) => {
                let before = self.signaling.state();
                if let Some(event) = self.signaling.on_local_signal(signal) {
                    if let Err(failure) = self.emit(event) {
                        warn!(%failure, "signal not relayed");
                    }
                }
                if self.signaling.state() != before {
                    self.publish(SessionEvent::SignalingChanged(self.signaling.state()));
                }
            }
            PeerEvent::RemoteStream(stream) => self.publish(SessionEvent::RemoteStream(stream)),
            PeerEvent::StateChanged(state) => {
                self.publish(SessionEvent::PeerStateChanged(state));
                match state {
                    PeerState::Connected => self.signaling_step(|s| {
                        s.on_peer_connected();
                        Vec::new()
                    }),
                    PeerState::Failed => {
                        let before = self.signaling.state();
                        self.negotiation_failed("peer connection failed".to_string());
                        if self.signaling.state() != before {
                            self.publish(SessionEvent::SignalingChanged(self.signaling.state()));
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn broadcast_media_state(&self, prefs: MediaPrefs) {
        if let Some(event) = self.signaling.media_state(prefs.audio, prefs.video) {
            if let Err(failure) = self.emit(event) {
                warn!(%failure, "media state not broadcast");
            }
        }
    }

    fn send_interview_chat(
        &mut self,
        text: String,
        respond_to: Responder<Result<InterviewChatMessage, SessionError>>,
    ) {
        let event = match self
            .signaling
            .room_event(|interview_id| ClientEvent::SendChatMessage { interview_id, text })
        {
            Ok(event) => event,
            Err(error) => {
                let _ = respond_to.send(Err(error.into()));
                return;
            }
        };
        match self.request(event) {
            Ok(reply) => self.settle(reply, move |result| Internal::ChatSettled { result, respond_to }),
            Err(failure) => {
                let _ = respond_to.send(Err(failure.into()));
            }
        }
    }

    fn on_chat_settled(
        &mut self,
        result: Result<Reply, ConnectionError>,
        respond_to: Responder<Result<InterviewChatMessage, SessionError>>,
    ) {
        let outcome = match result {
            Ok(Reply::ChatAck { message }) => {
                if self.chat.push(message.clone()) {
                    self.publish(SessionEvent::InterviewChat(message.clone()));
                }
                Ok(message)
            }
            Ok(Reply::Error { message }) => Err(SendFailure::Rejected(message).into()),
            Ok(other) => Err(SendFailure::Rejected(format!("unexpected reply: {other:?}")).into()),
            Err(_) => Err(SendFailure::ChannelClosed.into()),
        };
        let _ = respond_to.send(outcome);
    }

    fn end_interview(&mut self) {
        if matches!(
            self.recording.state(),
            RecordingState::Recording | RecordingState::Paused
        ) {
            if let Err(error) = self.stop_recording() {
                warn!(%error, "could not stop recording at interview end");
            }
        }
        if let Some(respond_to) = self.pending_join.take() {
            let _ = respond_to.send(Err(SignalingError::JoinRejected("interview ended".to_string()).into()));
        }
        self.signaling_step(SignalingSession::end);
        self.media.destroy();
        self.chat.clear();
    }

    fn interview_snapshot(&self) -> InterviewSnapshot {
        InterviewSnapshot {
            interview_id: self.signaling.interview_id().cloned(),
            state: self.signaling.state(),
            role: self.signaling.role(),
            remote: self.signaling.remote().cloned(),
            prefs: self.media.prefs(),
            peer_state: self.media.state(),
            error: self.signaling.error().cloned(),
            chat: self.chat.lines().to_vec(),
        }
    }

    // =========================================================================
    // Recording
    // =========================================================================

    fn start_recording(&mut self) -> Result<(), SessionError> {
        let interview_id = self
            .signaling
            .interview_id()
            .filter(|_| self.signaling.state().is_joined())
            .cloned()
            .ok_or(SignalingError::NotJoined)?;
        self.recording.start(
            interview_id.clone(),
            self.media.local(),
            self.media.remote(),
            Instant::now(),
        )?;
        if let Err(failure) = self.emit(ClientEvent::NotifyRecordingStarted { interview_id }) {
            warn!(%failure, "recording start not announced");
        }
        self.publish(SessionEvent::RecordingChanged(self.recording.state()));
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<Duration, SessionError> {
        let upload = self.recording.stop(Instant::now())?;
        let duration = upload.duration;
        let notice = self.signaling.room_event(|interview_id| ClientEvent::NotifyRecordingStopped {
            interview_id,
            duration_secs: duration.as_secs(),
        });
        if let Ok(event) = notice {
            if let Err(failure) = self.emit(event) {
                warn!(%failure, "recording stop not announced");
            }
        }
        self.publish(SessionEvent::RecordingChanged(self.recording.state()));
        self.start_upload(upload);
        Ok(duration)
    }

    fn start_upload(&self, upload: RecordingUpload) {
        info!(size = upload.size(), "uploading recording");
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                if internal.send(Internal::UploadProgress(progress)).is_err() {
                    break;
                }
            }
        });
        let call = self.backend.upload_recording(upload, progress_tx);
        self.spawn_backend(call, Internal::UploadFinished);
    }

    // =========================================================================
    // Channel events
    // =========================================================================

    async fn handle_channel(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Lifecycle(lifecycle) => {
                self.publish(SessionEvent::Connection(lifecycle.clone()));
                match lifecycle {
                    ConnectionEvent::Connect | ConnectionEvent::Reconnect { .. } => {
                        self.on_connected().await
                    }
                    ConnectionEvent::Disconnect { reason } => self.on_disconnected(&reason),
                    _ => {}
                }
            }
            ChannelEvent::Server(event) => self.handle_server(event),
        }
    }

    async fn on_connected(&mut self) {
        self.outbox = self.connection.outbox().await;
        if self.outbox.is_none() {
            debug!("link dropped before the session saw it open");
            return;
        }

        match self.request(ClientEvent::GetOnlineUsers) {
            Ok(reply) => self.settle(reply, |result| Internal::OnlineUsers { result }),
            Err(failure) => warn!(%failure, "presence snapshot not requested"),
        }

        if let Some(conversation_id) = self.active.clone() {
            let _ = self.emit(ClientEvent::JoinConversation { conversation_id });
        }

        self.start_resync();
    }

    fn on_disconnected(&mut self, reason: &str) {
        info!(%reason, "session offline");
        self.outbox = None;
        self.presence.mark_stale();

        for typing in self.local_typing.values_mut() {
            typing.stop();
        }
        for (conversation_id, user_id) in self.remote_typing.clear() {
            self.publish(SessionEvent::Typing {
                conversation_id,
                user_id,
                is_typing: false,
            });
        }

        if let Some(error) = self.signaling.on_channel_lost() {
            if let Some(respond_to) = self.pending_join.take() {
                let _ = respond_to.send(Err(error.clone().into()));
            }
            self.publish(SessionEvent::SignalingFailed(error));
            self.publish(SessionEvent::SignalingChanged(self.signaling.state()));
        }
    }

    fn handle_server(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage { message } => self.on_new_message(message),

            ServerEvent::MessageRead {
                conversation_id,
                message_ids,
                read_by,
                read_at,
            } => {
                let read_at = read_at.unwrap_or_else(Utc::now);
                if let Some(stream) = self.streams.get_mut(&conversation_id) {
                    if stream.on_read_receipt(&message_ids, read_at) > 0 {
                        self.publish(SessionEvent::MessagesChanged {
                            conversation_id: conversation_id.clone(),
                        });
                    }
                }
                if read_by.as_ref() == Some(&self.self_id) && self.directory.on_read(&conversation_id) {
                    self.publish_conversations();
                }
            }

            ServerEvent::UserPresence { user_id, is_online } => {
                if self.presence.apply(user_id.clone(), is_online) {
                    self.publish(SessionEvent::PresenceChanged { user_id, is_online });
                }
            }

            ServerEvent::OnlineUsers { user_ids } => self.apply_presence_snapshot(user_ids),

            ServerEvent::UserJoined {
                role,
                name,
                user_id,
            } => {
                let member = RoomMember {
                    user_id,
                    name,
                    role,
                };
                self.signaling_step(|s| s.on_peer_joined(member));
            }

            ServerEvent::UserLeft { name } => self.signaling_step(|s| s.on_peer_left(&name)),

            ServerEvent::PeerDisconnected => {
                self.signaling_step(SignalingSession::on_peer_disconnected)
            }

            ServerEvent::Signal { from, signal } => {
                self.signaling_step(|s| s.on_remote_signal(&from, signal))
            }

            ServerEvent::TypingStart {
                conversation_id,
                user_id,
            } => {
                if self
                    .remote_typing
                    .start(conversation_id.clone(), user_id.clone(), Instant::now())
                {
                    self.publish(SessionEvent::Typing {
                        conversation_id,
                        user_id,
                        is_typing: true,
                    });
                }
            }

            ServerEvent::TypingStop {
                conversation_id,
                user_id,
            } => {
                if self.remote_typing.stop(&conversation_id, &user_id) {
                    self.publish(SessionEvent::Typing {
                        conversation_id,
                        user_id,
                        is_typing: false,
                    });
                }
            }

            ServerEvent::MediaStateChanged {
                user_id,
                audio,
                video,
            } => {
                if self.signaling.on_media_state_changed(&user_id, audio, video) {
                    self.publish(SessionEvent::RemoteMediaChanged { audio, video });
                }
            }

            ServerEvent::ChatMessage(message) => {
                if self.chat.push(message.clone()) {
                    self.publish(SessionEvent::InterviewChat(message));
                }
            }
        }
    }

    fn apply_presence_snapshot(&mut self, user_ids: Vec<UserId>) {
        self.presence.replace(user_ids);
        self.publish(SessionEvent::PresenceSynced {
            online: self.presence.online_users(),
        });
    }

    // =========================================================================
    // Completions
    // =========================================================================

    fn handle_internal(&mut self, done: Internal) {
        match done {
            Internal::SendSettled {
                conversation_id,
                temp_id,
                result,
            } => self.on_send_settled(conversation_id, temp_id, result),

            Internal::OnlineUsers { result } => match result {
                Ok(Reply::OnlineUsers { user_ids }) => self.apply_presence_snapshot(user_ids),
                Ok(other) => warn!(?other, "unexpected reply to get-online-users"),
                Err(error) => warn!(%error, "presence snapshot failed"),
            },

            Internal::JoinSettled { epoch, result } => self.on_join_settled(epoch, result),

            Internal::ChatSettled { result, respond_to } => self.on_chat_settled(result, respond_to),

            Internal::ConversationsFetched {
                query,
                result,
                respond_to,
            } => {
                let outcome = result.map(|page| self.directory.store_page(&query, page));
                if outcome.is_ok() {
                    self.publish_conversations();
                }
                let _ = respond_to.send(outcome.map_err(backend_error));
            }

            Internal::DirectoryRefetched { query, result } => {
                let page = match result {
                    Ok(page) => Some(page),
                    Err(error) => {
                        warn!(error = %format!("{error:#}"), "conversation refetch failed");
                        None
                    }
                };
                if let Some(next) = self.directory.on_refetched(&query, page) {
                    self.spawn_refetch(next);
                }
                self.publish_conversations();
            }

            Internal::LatestFetched {
                conversation_id,
                result,
            } => self.on_latest_fetched(conversation_id, result),

            Internal::OlderFetched {
                conversation_id,
                result,
                respond_to,
            } => {
                let Some(stream) = self.streams.get_mut(&conversation_id) else {
                    let _ = respond_to.send(Err(SessionError::UnknownConversation(conversation_id)));
                    return;
                };
                match result {
                    Ok(page) => {
                        let outcome = stream.apply_older(page);
                        self.publish(SessionEvent::OlderLoaded {
                            conversation_id: conversation_id.clone(),
                            outcome,
                        });
                        self.publish(SessionEvent::MessagesChanged { conversation_id });
                        let _ = respond_to.send(Ok(Some(outcome)));
                    }
                    Err(error) => {
                        stream.older_failed();
                        let _ = respond_to.send(Err(backend_error(error)));
                    }
                }
            }

            Internal::ResyncFetched {
                conversation_id,
                result,
            } => {
                let Some(stream) = self.streams.get_mut(&conversation_id) else {
                    return;
                };
                match result {
                    Ok(messages) => {
                        stream.apply_resync(messages);
                    }
                    Err(error) => {
                        let gap = stream.resync_failed(format!("{error:#}"));
                        warn!(%gap, "resync failed");
                        self.publish(SessionEvent::SyncGap(gap));
                    }
                }
                self.publish(SessionEvent::MessagesChanged { conversation_id });
            }

            Internal::MarkedRead {
                conversation_id,
                result,
            } => {
                if let Err(error) = result {
                    warn!(conversation = %conversation_id, error = %format!("{error:#}"), "mark as read failed");
                }
            }

            Internal::UploadProgress(progress) => {
                if let Some(percent) = self.recording.on_progress(progress) {
                    self.publish(SessionEvent::UploadProgress { percent });
                }
            }

            Internal::UploadFinished(result) => {
                let result = result.map_err(|error| UploadError {
                    reason: format!("{error:#}"),
                });
                self.recording.on_upload_finished(result);
                self.publish(SessionEvent::RecordingChanged(self.recording.state()));
                if self.recording.state() == RecordingState::UploadFailed {
                    if let Some(error) = self.recording.last_error().cloned() {
                        self.publish(SessionEvent::UploadFailed(error));
                    }
                }
            }
        }
    }

    fn on_latest_fetched(&mut self, conversation_id: ConversationId, result: anyhow::Result<MessagePage>) {
        let waiters = self.pending_opens.remove(&conversation_id).unwrap_or_default();
        let page = match result {
            Ok(page) => page,
            Err(error) => {
                let error = backend_error(error);
                warn!(conversation = %conversation_id, %error, "history fetch failed");
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                return;
            }
        };

        let Some(stream) = self.streams.get_mut(&conversation_id) else {
            return;
        };
        stream.apply_latest(page);
        if self.active.as_ref() == Some(&conversation_id) {
            self.mark_viewed(&conversation_id);
        }
        if let Some(snapshot) = self.streams.get(&conversation_id).map(MessageStream::snapshot) {
            for waiter in waiters {
                let _ = waiter.send(Ok(snapshot.clone()));
            }
        }
        self.publish(SessionEvent::MessagesChanged { conversation_id });
    }

    async fn shutdown(&mut self) {
        info!(user = %self.self_id, "session shutting down");
        self.teardown.cancel();

        // The room hears about it before anything local is released.
        self.signaling_step(SignalingSession::end);
        self.media.destroy();
        self.recording.discard();
        self.connection.disconnect().await;
        self.outbox = None;

        for (_, waiters) in self.pending_opens.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(SessionError::Closed));
            }
        }
        if let Some(respond_to) = self.pending_join.take() {
            let _ = respond_to.send(Err(SessionError::Closed));
        }
    }
}
