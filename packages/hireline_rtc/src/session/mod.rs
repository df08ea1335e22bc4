//! The client session: one actor task owning every component, a cloneable
//! handle to talk to it, and the events it publishes.

mod actor;
mod events;
mod handle;

pub use events::{EventKind, SessionEvent, Subscription};
pub use handle::{SessionHandle, SessionOptions};

use std::time::Duration;

use crate::error::{SignalingError, UploadError};
use crate::interview::{MediaPrefs, PeerState, RecordingState, SignalingState};
use crate::models::{InterviewId, RemoteParticipant, Role};
use crate::protocol::InterviewChatMessage;

/// Point-in-time view of the interview.
#[derive(Debug, Clone, PartialEq)]
pub struct InterviewSnapshot {
    pub interview_id: Option<InterviewId>,
    pub state: SignalingState,
    pub role: Role,
    pub remote: Option<RemoteParticipant>,
    pub prefs: MediaPrefs,
    pub peer_state: PeerState,
    /// Last signaling failure; the interview cannot proceed until rejoined.
    pub error: Option<SignalingError>,
    pub chat: Vec<InterviewChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSnapshot {
    pub state: RecordingState,
    pub duration: Duration,
    pub progress: u8,
    pub last_error: Option<UploadError>,
}
