//! Interview room signaling: join protocol, the two-party counterpart slot,
//! and relay of opaque negotiation payloads.
//!
//! The machine is synchronous. Every transition returns the effects the
//! session must carry out (events to emit, peer connection lifecycle,
//! payloads to hand to the media layer).

use tracing::{debug, info, warn};

use crate::error::SignalingError;
use crate::models::{InterviewId, RemoteParticipant, Role, RoomMember, UserId};
use crate::protocol::{ClientEvent, SignalPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    Joining,
    /// Joined, no counterpart in the room.
    Waiting,
    /// Joined with a counterpart; the peer connection is being set up.
    PeerPresent,
    Negotiating,
    Connected,
    Ended,
}

impl SignalingState {
    pub fn is_joined(self) -> bool {
        matches!(
            self,
            Self::Waiting | Self::PeerPresent | Self::Negotiating | Self::Connected
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEffect {
    Emit(ClientEvent),
    /// Create the peer connection. The offerer also creates the offer.
    StartPeer { offerer: bool },
    TearDownPeer,
    DeliverSignal(SignalPayload),
}

#[derive(Debug)]
pub struct SignalingSession {
    self_id: UserId,
    interview_id: Option<InterviewId>,
    role: Role,
    state: SignalingState,
    remote: Option<RemoteParticipant>,
    /// Set once negotiation has been started for the current counterpart.
    initiated: bool,
    error: Option<SignalingError>,
}

impl SignalingSession {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            interview_id: None,
            role: Role::Candidate,
            state: SignalingState::Idle,
            remote: None,
            initiated: false,
            error: None,
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn interview_id(&self) -> Option<&InterviewId> {
        self.interview_id.as_ref()
    }

    pub fn remote(&self) -> Option<&RemoteParticipant> {
        self.remote.as_ref()
    }

    pub fn error(&self) -> Option<&SignalingError> {
        self.error.as_ref()
    }

    fn joined_id(&self) -> Result<InterviewId, SignalingError> {
        match (&self.interview_id, self.state.is_joined()) {
            (Some(id), true) => Ok(id.clone()),
            _ => Err(SignalingError::NotJoined),
        }
    }

    pub fn begin_join(
        &mut self,
        interview_id: InterviewId,
        role: Role,
    ) -> Result<ClientEvent, SignalingError> {
        if !matches!(self.state, SignalingState::Idle | SignalingState::Ended) {
            let current = self
                .interview_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            return Err(SignalingError::AlreadyJoined(current));
        }
        info!(interview = %interview_id, %role, "joining interview");
        self.interview_id = Some(interview_id.clone());
        self.role = role;
        self.state = SignalingState::Joining;
        self.remote = None;
        self.initiated = false;
        self.error = None;
        Ok(ClientEvent::JoinInterview { interview_id, role })
    }

    fn is_counterpart(&self, member: &RoomMember) -> bool {
        if member.user_id.as_ref() == Some(&self.self_id) {
            return false;
        }
        if member.role != self.role.counterpart() {
            warn!(name = %member.name, role = %member.role, "ignoring room member with our own role");
            return false;
        }
        true
    }

    fn initiate(&mut self) -> Vec<SignalingEffect> {
        if self.initiated {
            return Vec::new();
        }
        self.initiated = true;
        self.state = SignalingState::PeerPresent;
        debug!(offerer = self.role.is_offerer(), "starting negotiation");
        vec![SignalingEffect::StartPeer {
            offerer: self.role.is_offerer(),
        }]
    }

    /// Join acknowledged with the current room members.
    pub fn on_joined(
        &mut self,
        existing: Vec<RoomMember>,
    ) -> Result<Vec<SignalingEffect>, SignalingError> {
        if self.state != SignalingState::Joining {
            return Err(SignalingError::ProtocolViolation(
                "join acknowledged while not joining".to_string(),
            ));
        }

        let mut counterparts: Vec<RoomMember> = existing
            .into_iter()
            .filter(|m| self.is_counterpart(m))
            .collect();
        if let Some(remote) = &self.remote {
            // A user-joined may have raced ahead of the ack.
            counterparts.retain(|m| !remote.same_member(m));
        }
        let slots_taken = counterparts.len() + usize::from(self.remote.is_some());
        if slots_taken > 1 {
            let error = SignalingError::ProtocolViolation(format!(
                "{} participants with role {} in a two-party room",
                slots_taken,
                self.role.counterpart()
            ));
            return Err(self.fail_join(error));
        }

        if let Some(member) = counterparts.pop() {
            self.remote = Some(RemoteParticipant::from_member(member));
        }
        if self.remote.is_some() {
            Ok(self.initiate())
        } else {
            self.state = SignalingState::Waiting;
            Ok(Vec::new())
        }
    }

    /// Join failed or was rejected. Requires a manual rejoin.
    pub fn fail_join(&mut self, error: SignalingError) -> SignalingError {
        warn!(%error, "interview join failed");
        self.state = SignalingState::Idle;
        self.remote = None;
        self.initiated = false;
        self.error = Some(error.clone());
        error
    }

    pub fn on_peer_joined(&mut self, member: RoomMember) -> Vec<SignalingEffect> {
        if !(self.state == SignalingState::Joining || self.state.is_joined()) {
            return Vec::new();
        }
        if !self.is_counterpart(&member) {
            return Vec::new();
        }
        match &self.remote {
            Some(remote) if remote.same_member(&member) => {
                debug!(name = %member.name, "counterpart already present");
            }
            Some(remote) => {
                warn!(
                    present = %remote.name,
                    joined = %member.name,
                    "second counterpart joined a two-party room, ignoring"
                );
                return Vec::new();
            }
            None => {
                info!(name = %member.name, role = %member.role, "counterpart joined");
                self.remote = Some(RemoteParticipant::from_member(member));
            }
        }
        if self.state == SignalingState::Joining {
            // Initiation waits for the join ack.
            return Vec::new();
        }
        self.initiate()
    }

    /// `user-left` for the named member. A name that does not match the
    /// counterpart is ignored.
    pub fn on_peer_left(&mut self, name: &str) -> Vec<SignalingEffect> {
        if self.remote.as_ref().is_some_and(|remote| remote.name == name) {
            self.drop_peer()
        } else {
            Vec::new()
        }
    }

    pub fn on_peer_disconnected(&mut self) -> Vec<SignalingEffect> {
        self.drop_peer()
    }

    fn drop_peer(&mut self) -> Vec<SignalingEffect> {
        if self.state == SignalingState::Joining {
            // Left before our ack arrived; the ack decides Waiting vs PeerPresent.
            if self.remote.take().is_some() {
                debug!("counterpart left before join ack");
            }
            self.initiated = false;
            return Vec::new();
        }
        if !self.state.is_joined() {
            return Vec::new();
        }
        info!("counterpart left, waiting");
        self.remote = None;
        self.state = SignalingState::Waiting;
        if std::mem::take(&mut self.initiated) {
            vec![SignalingEffect::TearDownPeer]
        } else {
            Vec::new()
        }
    }

    /// Inbound relayed payload.
    pub fn on_remote_signal(&mut self, from: &UserId, signal: SignalPayload) -> Vec<SignalingEffect> {
        if from == &self.self_id {
            debug!("dropping our own signal");
            return Vec::new();
        }
        if !self.state.is_joined() {
            debug!(state = ?self.state, "signal outside a joined room, dropping");
            return Vec::new();
        }
        if self.state == SignalingState::PeerPresent {
            self.state = SignalingState::Negotiating;
        }
        vec![SignalingEffect::DeliverSignal(signal)]
    }

    /// Outbound payload produced by the local peer connection.
    pub fn on_local_signal(&mut self, signal: SignalPayload) -> Option<ClientEvent> {
        let interview_id = self.joined_id().ok()?;
        if self.state == SignalingState::PeerPresent {
            self.state = SignalingState::Negotiating;
        }
        Some(ClientEvent::SendSignal {
            interview_id,
            signal,
        })
    }

    pub fn on_peer_connected(&mut self) {
        if matches!(
            self.state,
            SignalingState::PeerPresent | SignalingState::Negotiating
        ) {
            info!("peer connection established");
            self.state = SignalingState::Connected;
            self.error = None;
        }
    }

    /// Negotiation failed. No automatic renegotiation: the guard stays set
    /// until the counterpart rejoins or the user ends and rejoins.
    pub fn on_negotiation_failed(&mut self, reason: String) -> Vec<SignalingEffect> {
        if !self.state.is_joined() {
            return Vec::new();
        }
        let error = SignalingError::NegotiationFailed(reason);
        warn!(%error, "negotiation failed");
        self.error = Some(error);
        self.state = SignalingState::PeerPresent;
        vec![SignalingEffect::TearDownPeer]
    }

    /// Local mute/camera change, broadcast as a discrete event.
    pub fn media_state(&self, audio: bool, video: bool) -> Option<ClientEvent> {
        let interview_id = self.joined_id().ok()?;
        Some(ClientEvent::NotifyMediaState {
            interview_id,
            audio,
            video,
        })
    }

    /// Remote mute/camera change. Returns whether the counterpart was updated.
    pub fn on_media_state_changed(&mut self, user: &UserId, audio: bool, video: bool) -> bool {
        match &mut self.remote {
            Some(remote) if remote.user_id.as_ref().is_none_or(|id| id == user) => {
                remote.audio = audio;
                remote.video = video;
                true
            }
            _ => false,
        }
    }

    /// Event to emit on behalf of the joined room (chat, recording notices).
    pub fn room_event(
        &self,
        build: impl FnOnce(InterviewId) -> ClientEvent,
    ) -> Result<ClientEvent, SignalingError> {
        self.joined_id().map(build)
    }

    /// The channel dropped while a join was outstanding.
    pub fn on_channel_lost(&mut self) -> Option<SignalingError> {
        (self.state == SignalingState::Joining)
            .then(|| self.fail_join(SignalingError::ChannelClosed))
    }

    /// Leave the room: the room is told first, then local teardown. Calling
    /// it again is a no-op.
    pub fn end(&mut self) -> Vec<SignalingEffect> {
        let mut effects = Vec::new();
        if self.state == SignalingState::Joining || self.state.is_joined() {
            if let Some(interview_id) = self.interview_id.clone() {
                info!(interview = %interview_id, "ending interview");
                effects.push(SignalingEffect::Emit(ClientEvent::EndInterview {
                    interview_id,
                }));
            }
        }
        if self.state != SignalingState::Ended && self.state != SignalingState::Idle {
            effects.push(SignalingEffect::TearDownPeer);
            self.state = SignalingState::Ended;
        }
        self.remote = None;
        self.initiated = false;
        effects
    }
}
