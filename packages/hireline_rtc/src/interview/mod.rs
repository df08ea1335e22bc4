//! Live interview: room signaling, peer media, recording and chat.

pub mod chat;
pub mod media;
pub mod recording;
pub mod signaling;

pub use chat::InterviewChat;
pub use media::{
    MediaPrefs, MediaStream, MediaTrack, PeerConnection, PeerConnector, PeerEvent,
    PeerEventEnvelope, PeerEventSink, PeerMediaSession, PeerState, TrackKind,
};
pub use recording::{
    MediaRecorder, RecorderFactory, RecordingController, RecordingState, RecordingUpload,
    UploadProgress,
};
pub use signaling::{SignalingEffect, SignalingSession, SignalingState};
