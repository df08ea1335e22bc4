//! Real-time session core for candidate/recruiter messaging and live
//! interviews.
//!
//! A [`SessionHandle`] spawns one task that owns the duplex channel, the
//! presence set, the conversation directory, per-conversation message
//! streams, typing indicators and the interview (signaling, peer media,
//! recording, chat). Transport, HTTP backend, media engine and recorder are
//! injected through the traits in [`connection`], [`backend`] and
//! [`interview`].

pub mod backend;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod interview;
pub mod messages;
pub mod models;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod typing;

pub use backend::Backend;
pub use config::{RtcConfig, load_config};
pub use connection::{
    ChannelEvent, ConnectionEvent, ConnectionManager, ConnectionStatus, Connector, Link, Outbound,
};
pub use directory::{ConversationPage, ConversationQuery};
pub use error::{
    ConnectionError, MediaError, RecordingError, RetryError, SendFailure, SessionError,
    SignalingError, SyncGapError, UploadError,
};
pub use interview::{
    MediaPrefs, MediaRecorder, MediaStream, MediaTrack, PeerConnection, PeerConnector, PeerEvent,
    PeerEventSink, PeerState, RecorderFactory, RecordingState, RecordingUpload, SignalingState,
    TrackKind, UploadProgress,
};
pub use messages::{MessagePage, PrependOutcome, StreamSnapshot};
pub use models::{
    Conversation, ConversationId, InterviewId, Message, MessageId, MessageStatus, Role, TempId,
    UserId,
};
pub use protocol::{ClientEvent, InterviewChatMessage, Reply, ServerEvent};
pub use session::{
    EventKind, InterviewSnapshot, RecordingSnapshot, SessionEvent, SessionHandle, SessionOptions,
    Subscription,
};
