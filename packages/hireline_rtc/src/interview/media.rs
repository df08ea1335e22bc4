//! Peer media session: local/remote streams and the single peer connection
//! of an interview.
//!
//! The media engine sits behind `PeerConnector`. Its callbacks are posted
//! into the session's mailbox through a `PeerEventSink` tagged with the
//! generation of the connection that produced them, so events from a
//! connection that has since been closed are dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::MediaError;
use crate::protocol::SignalPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    pub fn set_enabled(&mut self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter_mut().filter(|t| t.kind == kind) {
            track.enabled = enabled;
        }
    }
}

/// Desired mute/camera state. Kept even while no stream or connection
/// exists and applied once they do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPrefs {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaPrefs {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// A connection in this state still counts as the session's connection.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Local description or candidate ready to be relayed.
    SignalReady(SignalPayload),
    RemoteStream(MediaStream),
    StateChanged(PeerState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEventEnvelope {
    pub generation: u64,
    pub event: PeerEvent,
}

/// Handed to the media engine for reporting back into the session.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEventEnvelope>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerEventEnvelope>) -> Self {
        Self { generation, tx }
    }

    /// Returns false once the session is gone.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(PeerEventEnvelope {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

pub trait PeerConnection: Send {
    /// Apply a remote description or candidate.
    fn apply_signal(&mut self, signal: SignalPayload) -> Result<(), MediaError>;
    /// Start negotiation; the offer comes back as `PeerEvent::SignalReady`.
    fn create_offer(&mut self) -> Result<(), MediaError>;
    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool);
    fn close(&mut self);
}

pub trait PeerConnector: Send + Sync + 'static {
    fn create(
        &self,
        local: Option<&MediaStream>,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, MediaError>;
}

pub struct PeerMediaSession {
    connector: Arc<dyn PeerConnector>,
    events: mpsc::UnboundedSender<PeerEventEnvelope>,
    generation: u64,
    connection: Option<Box<dyn PeerConnection>>,
    state: PeerState,
    local: Option<MediaStream>,
    remote: Option<MediaStream>,
    prefs: MediaPrefs,
    /// Inbound signals that arrived before the connection existed.
    pending_signals: VecDeque<SignalPayload>,
}

impl PeerMediaSession {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        events: mpsc::UnboundedSender<PeerEventEnvelope>,
    ) -> Self {
        Self {
            connector,
            events,
            generation: 0,
            connection: None,
            state: PeerState::Closed,
            local: None,
            remote: None,
            prefs: MediaPrefs::default(),
            pending_signals: VecDeque::new(),
        }
    }

    pub fn set_local_stream(&mut self, mut stream: MediaStream) {
        stream.set_enabled(TrackKind::Audio, self.prefs.audio);
        stream.set_enabled(TrackKind::Video, self.prefs.video);
        self.local = Some(stream);
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_some() && self.state.is_active()
    }

    /// Create the peer connection unless an active one exists. Returns
    /// whether a new connection was created.
    pub fn initialize(&mut self, offerer: bool) -> Result<bool, MediaError> {
        if self.is_active() {
            debug!(generation = self.generation, "peer connection already active");
            return Ok(false);
        }
        if let Some(mut stale) = self.connection.take() {
            stale.close();
        }

        self.generation += 1;
        let sink = PeerEventSink::new(self.generation, self.events.clone());
        let mut connection = self.connector.create(self.local.as_ref(), sink)?;
        info!(generation = self.generation, offerer, "peer connection created");

        connection.set_track_enabled(TrackKind::Audio, self.prefs.audio);
        connection.set_track_enabled(TrackKind::Video, self.prefs.video);
        if offerer {
            if let Err(e) = connection.create_offer() {
                warn!(generation = self.generation, error = %e, "offer failed, closing connection");
                connection.close();
                self.state = PeerState::Failed;
                self.pending_signals.clear();
                return Err(e);
            }
        }
        while let Some(signal) = self.pending_signals.pop_front() {
            if let Err(e) = connection.apply_signal(signal) {
                warn!(error = %e, "queued signal rejected");
            }
        }

        self.connection = Some(connection);
        self.state = PeerState::New;
        Ok(true)
    }

    /// Hand an inbound payload to the connection, or queue it until one exists.
    pub fn apply_signal(&mut self, signal: SignalPayload) -> Result<(), MediaError> {
        match &mut self.connection {
            Some(connection) if self.state.is_active() => connection.apply_signal(signal),
            _ => {
                debug!(queued = self.pending_signals.len() + 1, "no peer connection yet, queueing signal");
                self.pending_signals.push_back(signal);
                Ok(())
            }
        }
    }

    fn apply_prefs(&mut self) {
        let prefs = self.prefs;
        if let Some(local) = &mut self.local {
            local.set_enabled(TrackKind::Audio, prefs.audio);
            local.set_enabled(TrackKind::Video, prefs.video);
        }
        if let Some(connection) = &mut self.connection {
            connection.set_track_enabled(TrackKind::Audio, prefs.audio);
            connection.set_track_enabled(TrackKind::Video, prefs.video);
        }
    }

    /// Flip the microphone. Works with or without a connection.
    pub fn toggle_audio(&mut self) -> MediaPrefs {
        self.prefs.audio = !self.prefs.audio;
        self.apply_prefs();
        self.prefs
    }

    pub fn toggle_video(&mut self) -> MediaPrefs {
        self.prefs.video = !self.prefs.video;
        self.apply_prefs();
        self.prefs
    }

    /// Apply an engine event. Events from an older connection are dropped.
    pub fn on_event(&mut self, envelope: PeerEventEnvelope) -> Option<PeerEvent> {
        if envelope.generation != self.generation || self.connection.is_none() {
            debug!(
                generation = envelope.generation,
                current = self.generation,
                "dropping stale peer event"
            );
            return None;
        }
        match &envelope.event {
            PeerEvent::StateChanged(state) => {
                debug!(?state, "peer state changed");
                self.state = *state;
            }
            PeerEvent::RemoteStream(stream) => {
                self.remote = Some(stream.clone());
            }
            PeerEvent::SignalReady(_) => {}
        }
        Some(envelope.event)
    }

    /// Close the connection but keep the local stream, ready for the next
    /// counterpart.
    pub fn close_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            info!(generation = self.generation, "peer connection closed");
        }
        self.state = PeerState::Closed;
        self.remote = None;
        self.pending_signals.clear();
    }

    /// Release everything. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        self.close_connection();
        self.local = None;
        self.prefs = MediaPrefs::default();
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn prefs(&self) -> MediaPrefs {
        self.prefs
    }

    pub fn local(&self) -> Option<&MediaStream> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&MediaStream> {
        self.remote.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
