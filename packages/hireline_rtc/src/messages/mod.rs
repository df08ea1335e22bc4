//! Message history for conversations.

mod store;
mod stream;

pub use store::{EntryKey, MessageStore};
pub use stream::{Incoming, MessageStream, PrependOutcome, StreamSnapshot};

use serde::{Deserialize, Serialize};

use crate::models::Message;

/// One page of history as returned by the backend: newest first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}
