//! In-memory stand-ins for the transport, backend, media engine and
//! recorder, shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use hireline_rtc::connection::OpenFuture;
use hireline_rtc::directory::{ConversationPage, ConversationQuery};
use hireline_rtc::models::{ParticipantSnapshot, RoomMember};
use hireline_rtc::{
    Backend, ClientEvent, ConnectionError, Connector, Conversation, ConversationId, EventKind,
    InterviewChatMessage, Link, MediaError, MediaRecorder, MediaStream, Message, MessageId,
    MessagePage, MessageStatus, Outbound, PeerConnection, PeerConnector, PeerEvent, PeerEventSink,
    RecorderFactory, RecordingError, RecordingUpload, Reply, Role, RtcConfig, ServerEvent,
    SessionEvent, SessionHandle, SessionOptions, StreamSnapshot, Subscription, TrackKind,
    UploadProgress, UserId,
};

pub const ME: &str = "me";
pub const OTHER: &str = "u2";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + chrono::Duration::minutes(minute)
}

pub fn message(id: &str, conversation: &str, sender: &str, minute: i64) -> Message {
    let recipient = if sender == ME { OTHER } else { ME };
    Message {
        id: Some(MessageId::from(id)),
        temp_id: None,
        conversation_id: conversation.into(),
        sender_id: sender.into(),
        recipient_id: recipient.into(),
        content: format!("message {id}"),
        sent_at: at(minute),
        is_read: false,
        read_at: None,
        status: MessageStatus::Sent,
        failure: None,
    }
}

pub fn conversation(id: &str, other_name: &str, minute: i64) -> Conversation {
    Conversation {
        id: id.into(),
        participants: [ME.into(), OTHER.into()],
        other: ParticipantSnapshot {
            user_id: OTHER.into(),
            name: other_name.to_string(),
            avatar_url: None,
            role: Role::Recruiter,
        },
        last_message: None,
        last_message_at: Some(at(minute)),
        unread_count: 0,
        context: None,
    }
}

pub fn member(user: &str, name: &str, role: Role) -> RoomMember {
    RoomMember {
        user_id: Some(user.into()),
        name: name.to_string(),
        role,
    }
}

// =============================================================================
// Transport
// =============================================================================

#[derive(Default)]
struct ServerState {
    accepting: bool,
    opens: usize,
    sent: Vec<ClientEvent>,
    inbound: Option<mpsc::Sender<ServerEvent>>,
    online: Vec<UserId>,
    room: Vec<RoomMember>,
    /// Pushed to the joiner before the join is acknowledged.
    announce_on_join: Vec<ServerEvent>,
    /// Echo sent messages back as `new-message` before acking them.
    echo_before_ack: bool,
    ack_messages: bool,
    next_message_id: u32,
}

/// Plays the server end of every link the session opens.
#[derive(Clone)]
pub struct FakeServer {
    user_id: UserId,
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.into(),
            state: Arc::new(Mutex::new(ServerState {
                accepting: true,
                ack_messages: true,
                next_message_id: 1,
                ..ServerState::default()
            })),
        }
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.state.lock().unwrap().accepting = accepting;
    }

    pub fn set_online(&self, users: &[&str]) {
        self.state.lock().unwrap().online = users.iter().map(|u| UserId::from(*u)).collect();
    }

    pub fn set_room(&self, members: Vec<RoomMember>) {
        self.state.lock().unwrap().room = members;
    }

    pub fn announce_on_join(&self, event: ServerEvent) {
        self.state.lock().unwrap().announce_on_join.push(event);
    }

    pub fn set_echo_before_ack(&self, echo: bool) {
        self.state.lock().unwrap().echo_before_ack = echo;
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn sent(&self) -> Vec<ClientEvent> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_matching(&self, pred: impl Fn(&ClientEvent) -> bool) -> usize {
        self.state.lock().unwrap().sent.iter().filter(|e| pred(e)).count()
    }

    /// Deliver a server event on the live link.
    pub async fn push(&self, event: ServerEvent) {
        let inbound = self.state.lock().unwrap().inbound.clone();
        inbound
            .expect("no live link")
            .send(event)
            .await
            .expect("session stopped reading");
    }

    /// Close the live link from the server side.
    pub fn drop_link(&self) {
        self.state.lock().unwrap().inbound = None;
    }

    fn serve(&self, outbound: Outbound, inbound: &mpsc::Sender<ServerEvent>) {
        let Outbound { event, reply } = outbound;
        let mut state = self.state.lock().unwrap();
        state.sent.push(event.clone());

        let response = match event {
            ClientEvent::SendMessage {
                conversation_id,
                content,
                temp_id,
            } => {
                if !state.ack_messages {
                    return;
                }
                let id = format!("m{}", state.next_message_id);
                state.next_message_id += 1;
                let message = Message {
                    id: Some(MessageId::new(id)),
                    temp_id: Some(temp_id),
                    conversation_id,
                    sender_id: self.user_id.clone(),
                    recipient_id: OTHER.into(),
                    content,
                    sent_at: Utc::now(),
                    is_read: false,
                    read_at: None,
                    status: MessageStatus::Sent,
                    failure: None,
                };
                if state.echo_before_ack {
                    let _ = inbound.try_send(ServerEvent::NewMessage {
                        message: message.clone(),
                    });
                }
                Reply::MessageAck { message }
            }
            ClientEvent::GetOnlineUsers => Reply::OnlineUsers {
                user_ids: state.online.clone(),
            },
            ClientEvent::JoinInterview { .. } => {
                for announce in state.announce_on_join.drain(..) {
                    let _ = inbound.try_send(announce);
                }
                Reply::InterviewJoined {
                    existing_users: state.room.clone(),
                }
            }
            ClientEvent::SendChatMessage { text, .. } => {
                let id = format!("chat{}", state.next_message_id);
                state.next_message_id += 1;
                Reply::ChatAck {
                    message: InterviewChatMessage {
                        message_id: id,
                        sender_id: self.user_id.clone(),
                        message: text,
                        timestamp: Utc::now(),
                    },
                }
            }
            _ => return,
        };
        if let Some(reply) = reply {
            let _ = reply.send(response);
        }
    }
}

pub struct FakeConnector {
    pub server: FakeServer,
}

impl Connector for FakeConnector {
    fn open(&self, _token: &str) -> OpenFuture {
        let server = self.server.clone();
        async move {
            let (inbound_tx, inbound_rx) = mpsc::channel(64);
            let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(64);
            {
                let mut state = server.state.lock().unwrap();
                state.opens += 1;
                if !state.accepting {
                    return Err(ConnectionError::Network("connection refused".to_string()));
                }
                state.inbound = Some(inbound_tx.clone());
            }
            // Only `state.inbound` keeps the link open, so `drop_link` closes it.
            let inbound = inbound_tx.downgrade();
            drop(inbound_tx);
            tokio::spawn(async move {
                while let Some(outbound) = outbound_rx.recv().await {
                    let Some(inbound) = inbound.upgrade() else {
                        break;
                    };
                    server.serve(outbound, &inbound);
                }
            });
            Ok(Link {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        }
        .boxed()
    }
}

// =============================================================================
// Backend
// =============================================================================

#[derive(Default)]
struct BackendState {
    conversations: Vec<Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    conversation_fetches: usize,
    message_fetches: Vec<(ConversationId, u32)>,
    since_fetches: usize,
    marked_read: Vec<ConversationId>,
    uploads: Vec<RecordingUpload>,
    fail_uploads: bool,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub fn add_conversation(&self, conversation: Conversation) {
        self.state.lock().unwrap().conversations.push(conversation);
    }

    /// Stored in chronological order.
    pub fn add_message(&self, message: Message) {
        let mut state = self.state.lock().unwrap();
        let list = state
            .messages
            .entry(message.conversation_id.clone())
            .or_default();
        list.push(message);
        list.sort_by_key(|m| m.sent_at);
    }

    pub fn conversation_fetches(&self) -> usize {
        self.state.lock().unwrap().conversation_fetches
    }

    pub fn message_fetches(&self) -> Vec<(ConversationId, u32)> {
        self.state.lock().unwrap().message_fetches.clone()
    }

    pub fn since_fetches(&self) -> usize {
        self.state.lock().unwrap().since_fetches
    }

    pub fn marked_read(&self) -> Vec<ConversationId> {
        self.state.lock().unwrap().marked_read.clone()
    }

    pub fn uploads(&self) -> Vec<RecordingUpload> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.state.lock().unwrap().fail_uploads = fail;
    }
}

impl Backend for FakeBackend {
    fn fetch_conversations(
        &self,
        query: ConversationQuery,
    ) -> BoxFuture<'static, anyhow::Result<ConversationPage>> {
        let mut state = self.state.lock().unwrap();
        state.conversation_fetches += 1;
        let mut matching: Vec<Conversation> = state
            .conversations
            .iter()
            .filter(|c| {
                query
                    .search
                    .as_deref()
                    .is_none_or(|s| c.other.name.to_lowercase().contains(&s.to_lowercase()))
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));

        let limit = query.limit as usize;
        let skip = (query.page.saturating_sub(1) as usize) * limit;
        let has_more = matching.len() > skip + limit;
        let items = matching.into_iter().skip(skip).take(limit).collect();
        async move { Ok(ConversationPage { items, has_more }) }.boxed()
    }

    fn fetch_messages(
        &self,
        conversation: ConversationId,
        page: u32,
        limit: u32,
    ) -> BoxFuture<'static, anyhow::Result<MessagePage>> {
        let mut state = self.state.lock().unwrap();
        state.message_fetches.push((conversation.clone(), page));
        let all = state.messages.get(&conversation).cloned().unwrap_or_default();

        let limit = limit as usize;
        let skip = (page.saturating_sub(1) as usize) * limit;
        let messages: Vec<Message> = all.iter().rev().skip(skip).take(limit).cloned().collect();
        let has_more = all.len() > skip + limit;
        async move { Ok(MessagePage { messages, has_more }) }.boxed()
    }

    fn fetch_messages_since(
        &self,
        conversation: ConversationId,
        after: DateTime<Utc>,
    ) -> BoxFuture<'static, anyhow::Result<Vec<Message>>> {
        let mut state = self.state.lock().unwrap();
        state.since_fetches += 1;
        let newer: Vec<Message> = state
            .messages
            .get(&conversation)
            .map(|all| all.iter().filter(|m| m.sent_at > after).cloned().collect())
            .unwrap_or_default();
        async move { Ok(newer) }.boxed()
    }

    fn mark_as_read(&self, conversation: ConversationId) -> BoxFuture<'static, anyhow::Result<()>> {
        self.state.lock().unwrap().marked_read.push(conversation);
        async { Ok(()) }.boxed()
    }

    fn upload_recording(
        &self,
        upload: RecordingUpload,
        progress: mpsc::UnboundedSender<UploadProgress>,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        let state = self.state.clone();
        async move {
            let total = upload.size() as u64;
            let _ = progress.send(UploadProgress { sent: total / 2, total });
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = progress.send(UploadProgress { sent: total, total });

            let failing = state.lock().unwrap().fail_uploads;
            if failing {
                anyhow::bail!("storage unavailable");
            }
            state.lock().unwrap().uploads.push(upload);
            Ok(())
        }
        .boxed()
    }
}

// =============================================================================
// Media engine and recorder
// =============================================================================

#[derive(Default)]
pub struct PeerLog {
    pub created: usize,
    pub offers: usize,
    pub applied: Vec<serde_json::Value>,
    pub tracks: Vec<(TrackKind, bool)>,
    pub closed: usize,
    pub sinks: Vec<PeerEventSink>,
}

#[derive(Clone, Default)]
pub struct FakePeers {
    pub log: Arc<Mutex<PeerLog>>,
}

impl FakePeers {
    pub fn created(&self) -> usize {
        self.log.lock().unwrap().created
    }

    pub fn offers(&self) -> usize {
        self.log.lock().unwrap().offers
    }

    pub fn tracks(&self) -> Vec<(TrackKind, bool)> {
        self.log.lock().unwrap().tracks.clone()
    }

    /// Report an engine event on the newest connection.
    pub fn emit(&self, event: PeerEvent) {
        let sink = self.log.lock().unwrap().sinks.last().cloned();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }
}

struct FakePeer {
    log: Arc<Mutex<PeerLog>>,
    sink: PeerEventSink,
}

impl PeerConnection for FakePeer {
    fn apply_signal(&mut self, signal: serde_json::Value) -> Result<(), MediaError> {
        self.log.lock().unwrap().applied.push(signal);
        Ok(())
    }

    fn create_offer(&mut self) -> Result<(), MediaError> {
        self.log.lock().unwrap().offers += 1;
        self.sink
            .emit(PeerEvent::SignalReady(serde_json::json!({ "type": "offer", "sdp": "v=0" })));
        Ok(())
    }

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) {
        self.log.lock().unwrap().tracks.push((kind, enabled));
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closed += 1;
    }
}

impl PeerConnector for FakePeers {
    fn create(
        &self,
        _local: Option<&MediaStream>,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, MediaError> {
        let mut log = self.log.lock().unwrap();
        log.created += 1;
        log.sinks.push(events.clone());
        Ok(Box::new(FakePeer {
            log: self.log.clone(),
            sink: events,
        }))
    }
}

pub struct FakeRecorderFactory;

struct FakeRecorder {
    sources: usize,
}

impl MediaRecorder for FakeRecorder {
    fn pause(&mut self) -> Result<(), RecordingError> {
        Ok(())
    }

    fn resume(&mut self) -> Result<(), RecordingError> {
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>, RecordingError> {
        Ok(vec![7u8; 1000 * self.sources])
    }
}

impl RecorderFactory for FakeRecorderFactory {
    fn start(
        &self,
        sources: &[&MediaStream],
        _mime_type: &str,
    ) -> Result<Box<dyn MediaRecorder>, RecordingError> {
        Ok(Box::new(FakeRecorder {
            sources: sources.len(),
        }))
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub session: SessionHandle,
    pub server: FakeServer,
    pub backend: FakeBackend,
    pub peers: FakePeers,
}

impl Harness {
    pub fn new(user_id: &str) -> Self {
        Self::with_config(user_id, RtcConfig::default())
    }

    pub fn with_config(user_id: &str, config: RtcConfig) -> Self {
        init_tracing();
        let server = FakeServer::new(user_id);
        let backend = FakeBackend::default();
        let peers = FakePeers::default();
        let session = SessionHandle::spawn(SessionOptions {
            user_id: user_id.into(),
            config,
            connector: Arc::new(FakeConnector {
                server: server.clone(),
            }),
            backend: Arc::new(backend.clone()),
            peers: Arc::new(peers.clone()),
            recorder: Arc::new(FakeRecorderFactory),
        });
        Self {
            session,
            server,
            backend,
            peers,
        }
    }

    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.session.subscribe(kinds)
    }
}

/// Wait (on the paused clock) for an event matching `pred`.
pub async fn expect_event(
    sub: &mut Subscription,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match sub.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("session closed while waiting for event"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll the stream of `conversation` until `pred` holds.
pub async fn poll_messages(
    session: &SessionHandle,
    conversation: &str,
    pred: impl Fn(&StreamSnapshot) -> bool,
) -> StreamSnapshot {
    for _ in 0..200 {
        if let Some(snapshot) = session.messages(conversation.into()).await.unwrap() {
            if pred(&snapshot) {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("message stream never reached the expected state");
}

/// Poll `cond` until it holds, letting spawned tasks run in between.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}
