//! Text chat inside an interview room. Lines are deduplicated by their
//! server id; our own lines arrive both as ack and as broadcast.

use std::collections::HashSet;

use crate::protocol::InterviewChatMessage;

#[derive(Debug, Default)]
pub struct InterviewChat {
    lines: Vec<InterviewChatMessage>,
    seen: HashSet<String>,
}

impl InterviewChat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false for a line already shown.
    pub fn push(&mut self, message: InterviewChatMessage) -> bool {
        if !self.seen.insert(message.message_id.clone()) {
            return false;
        }
        let at = self
            .lines
            .partition_point(|line| line.timestamp <= message.timestamp);
        self.lines.insert(at, message);
        true
    }

    pub fn lines(&self) -> &[InterviewChatMessage] {
        &self.lines
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.seen.clear();
    }
}
