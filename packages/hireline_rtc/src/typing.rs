//! Typing indicator.
//!
//! `LocalTyping` debounces the local user's keystrokes into one start and one
//! stop signal. `RemoteTyping` tracks who else is typing where, with an
//! optional receiver-side expiry so a lost stop event cannot leave the
//! indicator stuck.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::models::{ConversationId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

/// Local debounce for one conversation.
#[derive(Debug)]
pub struct LocalTyping {
    idle_timeout: Duration,
    deadline: Option<Instant>,
}

impl LocalTyping {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            deadline: None,
        }
    }

    /// Returns `Start` only for the first keystroke after being idle. Every
    /// keystroke pushes the idle deadline out.
    pub fn keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        let was_idle = self.deadline.is_none();
        self.deadline = Some(now + self.idle_timeout);
        was_idle.then_some(TypingSignal::Start)
    }

    /// Idle timer check.
    pub fn tick(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.stop(),
            _ => None,
        }
    }

    /// Send or leave: stop immediately. Emits at most once per typing burst.
    pub fn stop(&mut self) -> Option<TypingSignal> {
        self.deadline.take().map(|_| TypingSignal::Stop)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_typing(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Typing state of other participants, keyed by (conversation, user).
#[derive(Debug)]
pub struct RemoteTyping {
    self_id: UserId,
    expiry: Option<Duration>,
    typing: HashMap<(ConversationId, UserId), Option<Instant>>,
}

impl RemoteTyping {
    pub fn new(self_id: UserId, expiry: Option<Duration>) -> Self {
        Self {
            self_id,
            expiry,
            typing: HashMap::new(),
        }
    }

    /// Returns whether the visible state changed. Events about the local user
    /// are ignored.
    pub fn start(&mut self, conversation: ConversationId, user: UserId, now: Instant) -> bool {
        if user == self.self_id {
            return false;
        }
        let expires_at = self.expiry.map(|expiry| now + expiry);
        self.typing.insert((conversation, user), expires_at).is_none()
    }

    pub fn stop(&mut self, conversation: &ConversationId, user: &UserId) -> bool {
        self.typing
            .remove(&(conversation.clone(), user.clone()))
            .is_some()
    }

    pub fn is_typing(&self, conversation: &ConversationId, user: &UserId) -> bool {
        self.typing
            .contains_key(&(conversation.clone(), user.clone()))
    }

    pub fn typing_in(&self, conversation: &ConversationId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .typing
            .keys()
            .filter(|(c, _)| c == conversation)
            .map(|(_, u)| u.clone())
            .collect();
        users.sort();
        users
    }

    /// Drop entries whose expiry has passed and return them.
    pub fn expire(&mut self, now: Instant) -> Vec<(ConversationId, UserId)> {
        let expired: Vec<(ConversationId, UserId)> = self
            .typing
            .iter()
            .filter(|(_, deadline)| deadline.is_some_and(|d| d <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.typing.remove(key);
            debug!(conversation = %key.0, user = %key.1, "remote typing expired");
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.typing.values().filter_map(|d| *d).min()
    }

    /// The channel dropped: nobody is typing anymore. Returns who was.
    pub fn clear(&mut self) -> Vec<(ConversationId, UserId)> {
        self.typing.drain().map(|(key, _)| key).collect()
    }
}
