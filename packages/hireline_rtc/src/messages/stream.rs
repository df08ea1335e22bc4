//! Per-conversation message stream.
//!
//! Holds the ordered history of one conversation and reconciles three
//! sources into it: optimistic local sends, server acks, and at-least-once
//! real-time delivery (plus paged history and post-reconnect resync). Every
//! merge is keyed by durable id or temp id, so replays and reorderings are
//! absorbed without duplicates.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::MessagePage;
use super::store::{EntryKey, MessageStore};
use crate::error::{RetryError, SendFailure, SyncGapError};
use crate::models::{ConversationId, Message, MessageId, MessageStatus, TempId, UserId};
use crate::protocol::ClientEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    Appended,
    Reconciled,
    Ignored,
}

/// Result of prepending older history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrependOutcome {
    pub inserted: usize,
    /// Row now occupied by the message that was topmost before the prepend.
    pub anchor_row: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSnapshot {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub has_more_older: bool,
    pub is_syncing: bool,
    pub first_visible_row: usize,
}

pub struct MessageStream {
    conversation_id: ConversationId,
    self_id: UserId,
    counterpart: Option<UserId>,
    store: MessageStore,
    in_flight: HashSet<TempId>,
    loaded: bool,
    has_more_older: bool,
    next_older_page: u32,
    loading_older: bool,
    is_syncing: bool,
    first_visible_row: usize,
}

impl MessageStream {
    pub fn new(conversation_id: ConversationId, self_id: UserId, counterpart: Option<UserId>) -> Self {
        Self {
            conversation_id,
            self_id,
            counterpart,
            store: MessageStore::new(),
            in_flight: HashSet::new(),
            loaded: false,
            has_more_older: false,
            next_older_page: 2,
            loading_older: false,
            is_syncing: false,
            first_visible_row: 0,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn learn_counterpart(&mut self, message: &Message) {
        if self.counterpart.is_some() {
            return;
        }
        let other = if message.sender_id == self.self_id {
            &message.recipient_id
        } else {
            &message.sender_id
        };
        self.counterpart = Some(other.clone());
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Append an optimistic entry. Nothing is sent yet; see `dispatch`.
    pub fn compose(&mut self, content: String, now: DateTime<Utc>) -> TempId {
        let temp_id = TempId::generate();
        let recipient = self
            .counterpart
            .clone()
            .unwrap_or_else(|| UserId::new(String::new()));
        let message = Message::pending(
            temp_id,
            self.conversation_id.clone(),
            self.self_id.clone(),
            recipient,
            content,
            now,
        );
        self.store.push_back(message);
        debug!(conversation = %self.conversation_id, %temp_id, "optimistic message appended");
        temp_id
    }

    /// Start the network send for an unconfirmed entry. Used for the first
    /// send and for manual retries; at most one send per temp id is in flight.
    pub fn dispatch(&mut self, temp_id: TempId) -> Result<ClientEvent, RetryError> {
        let key = self
            .store
            .find_temp(&temp_id)
            .ok_or(RetryError::UnknownMessage(temp_id))?;
        if self.store.get(key).is_confirmed() {
            return Err(RetryError::AlreadySent(temp_id));
        }
        if !self.in_flight.insert(temp_id) {
            return Err(RetryError::InFlight(temp_id));
        }
        self.store.update(key, |m| {
            m.status = MessageStatus::Pending;
            m.failure = None;
        });
        Ok(ClientEvent::SendMessage {
            conversation_id: self.conversation_id.clone(),
            content: self.store.get(key).content.clone(),
            temp_id,
        })
    }

    pub fn is_in_flight(&self, temp_id: &TempId) -> bool {
        self.in_flight.contains(temp_id)
    }

    /// Server acknowledged the send.
    pub fn on_ack(&mut self, temp_id: TempId, mut message: Message) {
        self.in_flight.remove(&temp_id);
        message.temp_id = Some(temp_id);
        message.status = MessageStatus::Sent;
        message.failure = None;

        let by_temp = self.store.find_temp(&temp_id);
        let by_id = message.id.as_ref().and_then(|id| self.store.find(Some(id), None));

        match (by_temp, by_id) {
            (Some(pending), Some(echoed)) if pending != echoed => {
                // The echo arrived first without our temp id and was appended
                // on its own; fold the optimistic entry into it.
                self.store.merge_into(pending, echoed);
                self.reconcile(echoed, message);
            }
            (Some(key), _) | (None, Some(key)) => {
                self.reconcile(key, message);
            }
            (None, None) => {
                warn!(conversation = %self.conversation_id, %temp_id, "ack for unknown message, appending");
                self.store.insert_chronological(message);
            }
        }
    }

    /// Send failed: the entry keeps its content and waits for a manual retry.
    pub fn on_send_failed(&mut self, temp_id: TempId, failure: SendFailure) {
        self.in_flight.remove(&temp_id);
        let Some(key) = self.store.find_temp(&temp_id) else {
            return;
        };
        if self.store.get(key).is_confirmed() {
            // An echo already confirmed it; the failure is moot.
            return;
        }
        warn!(conversation = %self.conversation_id, %temp_id, %failure, "message send failed");
        self.store.update(key, |m| {
            m.status = MessageStatus::Failed;
            m.failure = Some(failure);
        });
    }

    /// Replace `key` with the confirmed version, keeping read state already
    /// known locally. A temp id reconciles to one durable id only.
    fn reconcile(&mut self, key: EntryKey, mut message: Message) -> bool {
        let existing = self.store.get(key);
        if let (Some(current), Some(incoming)) = (&existing.id, &message.id) {
            if current != incoming {
                warn!(
                    conversation = %self.conversation_id,
                    current = %current,
                    incoming = %incoming,
                    "temp id already reconciled to another message, ignoring"
                );
                return false;
            }
        }
        message.is_read |= existing.is_read;
        if message.read_at.is_none() {
            message.read_at = existing.read_at;
        }
        message.status = MessageStatus::Sent;
        message.failure = None;
        self.store.replace(key, message);
        true
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    /// Real-time delivery. Same durable id or same temp id replaces in place,
    /// anything else is inserted in `sent_at` order.
    pub fn on_incoming(&mut self, mut message: Message) -> Incoming {
        self.learn_counterpart(&message);
        message.status = MessageStatus::Sent;
        message.failure = None;

        match self.store.find(message.id.as_ref(), message.temp_id.as_ref()) {
            Some(key) => {
                if self.reconcile(key, message) {
                    Incoming::Reconciled
                } else {
                    Incoming::Ignored
                }
            }
            None => {
                self.store.insert_chronological(message);
                Incoming::Appended
            }
        }
    }

    /// First page (wire order is newest first).
    pub fn apply_latest(&mut self, page: MessagePage) -> usize {
        self.loaded = true;
        self.has_more_older = page.has_more;
        self.next_older_page = 2;
        self.merge_missing(page.messages)
    }

    fn merge_missing(&mut self, messages: Vec<Message>) -> usize {
        let mut appended = 0;
        for message in messages {
            if matches!(self.on_incoming(message), Incoming::Appended) {
                appended += 1;
            }
        }
        appended
    }

    // =========================================================================
    // Older history
    // =========================================================================

    /// Page number to fetch next, or `None` if nothing older exists or a
    /// fetch is already running.
    pub fn begin_load_older(&mut self) -> Option<u32> {
        if !self.has_more_older || self.loading_older {
            return None;
        }
        self.loading_older = true;
        Some(self.next_older_page)
    }

    /// Prepend an older page, skipping ids already present. The viewport's
    /// first visible row shifts by the number of rows inserted so the
    /// previously visible message stays put.
    pub fn apply_older(&mut self, page: MessagePage) -> PrependOutcome {
        self.loading_older = false;
        self.has_more_older = page.has_more;
        self.next_older_page += 1;

        let anchor = self.store.first_key();
        let mut inserted = 0;
        // Newest first on the wire: pushing each to the front leaves the
        // page in chronological order ahead of the existing history.
        for mut message in page.messages {
            if self.store.find(message.id.as_ref(), message.temp_id.as_ref()).is_some() {
                continue;
            }
            self.learn_counterpart(&message);
            message.status = MessageStatus::Sent;
            self.store.push_front(message);
            inserted += 1;
        }

        self.first_visible_row += inserted;
        PrependOutcome {
            inserted,
            anchor_row: anchor.and_then(|key| self.store.position(key)),
        }
    }

    pub fn older_failed(&mut self) {
        self.loading_older = false;
    }

    // =========================================================================
    // Reconnect resync
    // =========================================================================

    /// Timestamp to resync from, if the stream holds any confirmed message.
    pub fn begin_resync(&mut self) -> Option<DateTime<Utc>> {
        let since = self.store.latest_confirmed_at()?;
        self.is_syncing = true;
        Some(since)
    }

    /// Merge messages newer than the resync point. Returns how many were new.
    pub fn apply_resync(&mut self, messages: Vec<Message>) -> usize {
        self.is_syncing = false;
        let appended = self.merge_missing(messages);
        debug!(conversation = %self.conversation_id, appended, "resync merged");
        appended
    }

    pub fn resync_failed(&mut self, reason: String) -> SyncGapError {
        self.is_syncing = false;
        SyncGapError {
            conversation_id: self.conversation_id.clone(),
            reason,
        }
    }

    // =========================================================================
    // Read state
    // =========================================================================

    /// Read receipt from the server: flip matching ids regardless of who is
    /// looking at the conversation.
    pub fn on_read_receipt(&mut self, ids: &[MessageId], read_at: DateTime<Utc>) -> usize {
        let keys: Vec<EntryKey> = ids
            .iter()
            .filter_map(|id| self.store.find(Some(id), None))
            .collect();
        let mut flipped = 0;
        for key in keys {
            if !self.store.get(key).is_read {
                self.store.update(key, |m| {
                    m.is_read = true;
                    m.read_at = Some(read_at);
                });
                flipped += 1;
            }
        }
        flipped
    }

    /// Local user viewed the conversation: everything addressed to them is read.
    pub fn mark_incoming_read(&mut self, read_at: DateTime<Utc>) -> usize {
        let keys: Vec<EntryKey> = self
            .store
            .keys()
            .filter(|key| {
                let m = self.store.get(*key);
                m.sender_id != self.self_id && !m.is_read
            })
            .collect();
        for key in &keys {
            self.store.update(*key, |m| {
                m.is_read = true;
                m.read_at = Some(read_at);
            });
        }
        keys.len()
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn first_visible_row(&self) -> usize {
        self.first_visible_row
    }

    pub fn set_first_visible_row(&mut self, row: usize) {
        self.first_visible_row = row.min(self.store.len().saturating_sub(1));
    }

    pub fn has_more_older(&self) -> bool {
        self.has_more_older
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.store.iter().cloned().collect()
    }

    pub fn find_by_temp(&self, temp_id: &TempId) -> Option<&Message> {
        self.store.find_temp(temp_id).map(|key| self.store.get(key))
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            conversation_id: self.conversation_id.clone(),
            messages: self.messages(),
            has_more_older: self.has_more_older,
            is_syncing: self.is_syncing,
            first_visible_row: self.first_visible_row,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn stream() -> MessageStream {
        MessageStream::new("c1".into(), "me".into(), Some("them".into()))
    }

    fn server(id: &str, sender: &str, secs: i64) -> Message {
        let recipient = if sender == "me" { "them" } else { "me" };
        Message {
            id: Some(id.into()),
            temp_id: None,
            conversation_id: "c1".into(),
            sender_id: sender.into(),
            recipient_id: recipient.into(),
            content: format!("body {id}"),
            sent_at: at(secs),
            is_read: false,
            read_at: None,
            status: MessageStatus::Sent,
            failure: None,
        }
    }

    fn echo_of(id: &str, temp_id: TempId, content: &str, secs: i64) -> Message {
        let mut m = server(id, "me", secs);
        m.temp_id = Some(temp_id);
        m.content = content.to_string();
        m
    }

    fn contents(stream: &MessageStream) -> Vec<String> {
        stream.messages().into_iter().map(|m| m.content).collect()
    }

    #[test]
    fn send_appends_pending_and_dispatches_once() {
        let mut s = stream();
        let temp = s.compose("Hello".into(), at(10));
        let event = s.dispatch(temp).unwrap();
        assert!(matches!(event, ClientEvent::SendMessage { temp_id, .. } if temp_id == temp));

        assert_eq!(s.dispatch(temp), Err(RetryError::InFlight(temp)));
        let entry = s.find_by_temp(&temp).unwrap();
        assert_eq!(entry.status, MessageStatus::Pending);
        assert_eq!(entry.recipient_id.as_str(), "them");
    }

    #[test]
    fn ack_then_echo_leaves_one_entry() {
        let mut s = stream();
        let temp = s.compose("Hello".into(), at(10));
        s.dispatch(temp).unwrap();

        s.on_ack(temp, echo_of("m1", temp, "Hello", 11));
        assert_eq!(s.on_incoming(echo_of("m1", temp, "Hello", 11)), Incoming::Reconciled);

        assert_eq!(s.len(), 1);
        let m = &s.messages()[0];
        assert_eq!(m.id, Some("m1".into()));
        assert_eq!(m.status, MessageStatus::Sent);
    }

    #[test]
    fn echo_then_ack_leaves_one_entry() {
        let mut s = stream();
        let temp = s.compose("Hello".into(), at(10));
        s.dispatch(temp).unwrap();

        assert_eq!(s.on_incoming(echo_of("m1", temp, "Hello", 11)), Incoming::Reconciled);
        s.on_ack(temp, echo_of("m1", temp, "Hello", 11));

        assert_eq!(s.len(), 1);
        assert!(!s.is_in_flight(&temp));
    }

    #[test]
    fn echo_without_temp_id_is_folded_by_ack() {
        let mut s = stream();
        let temp = s.compose("Hello".into(), at(10));
        s.dispatch(temp).unwrap();

        let mut bare = echo_of("m1", temp, "Hello", 11);
        bare.temp_id = None;
        assert_eq!(s.on_incoming(bare), Incoming::Appended);
        assert_eq!(s.len(), 2);

        s.on_ack(temp, echo_of("m1", temp, "Hello", 11));
        assert_eq!(s.len(), 1);
        assert_eq!(s.find_by_temp(&temp).unwrap().id, Some("m1".into()));
    }

    #[test]
    fn duplicate_delivery_is_idempotent() {
        let mut s = stream();
        assert_eq!(s.on_incoming(server("m1", "them", 1)), Incoming::Appended);
        assert_eq!(s.on_incoming(server("m1", "them", 1)), Incoming::Reconciled);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn out_of_order_delivery_is_sorted() {
        let mut s = stream();
        s.on_incoming(server("m3", "them", 3));
        s.on_incoming(server("m1", "them", 1));
        s.on_incoming(server("m2", "them", 2));
        assert_eq!(contents(&s), vec!["body m1", "body m2", "body m3"]);
    }

    #[test]
    fn failure_keeps_content_for_manual_retry() {
        let mut s = stream();
        let temp = s.compose("Hello".into(), at(10));
        s.dispatch(temp).unwrap();
        s.on_send_failed(temp, SendFailure::ChannelClosed);

        let entry = s.find_by_temp(&temp).unwrap();
        assert_eq!(entry.status, MessageStatus::Failed);
        assert_eq!(entry.content, "Hello");
        assert_eq!(entry.failure, Some(SendFailure::ChannelClosed));

        let retry = s.dispatch(temp).unwrap();
        assert!(matches!(retry, ClientEvent::SendMessage { ref content, .. } if content == "Hello"));
        assert_eq!(s.find_by_temp(&temp).unwrap().status, MessageStatus::Pending);
    }

    #[test]
    fn retry_of_confirmed_message_is_rejected() {
        let mut s = stream();
        let temp = s.compose("Hello".into(), at(10));
        s.dispatch(temp).unwrap();
        s.on_ack(temp, echo_of("m1", temp, "Hello", 11));
        assert_eq!(s.dispatch(temp), Err(RetryError::AlreadySent(temp)));
        let unknown = TempId::generate();
        assert_eq!(s.dispatch(unknown), Err(RetryError::UnknownMessage(unknown)));
    }

    #[test]
    fn temp_id_reconciles_to_one_durable_id() {
        let mut s = stream();
        let temp = s.compose("Hello".into(), at(10));
        s.dispatch(temp).unwrap();
        s.on_ack(temp, echo_of("m1", temp, "Hello", 11));

        assert_eq!(s.on_incoming(echo_of("m9", temp, "Hello", 11)), Incoming::Ignored);
        assert_eq!(s.len(), 1);
        assert_eq!(s.messages()[0].id, Some("m1".into()));
    }

    #[test]
    fn load_older_prepends_and_keeps_anchor_row() {
        let mut s = stream();
        s.apply_latest(MessagePage {
            messages: (11..=20).rev().map(|i| server(&format!("m{i}"), "them", i)).collect(),
            has_more: true,
        });
        assert_eq!(s.len(), 10);
        let top_before = s.messages()[0].id.clone();
        assert_eq!(s.first_visible_row(), 0);

        assert_eq!(s.begin_load_older(), Some(2));
        assert_eq!(s.begin_load_older(), None);
        let outcome = s.apply_older(MessagePage {
            messages: (1..=10).rev().map(|i| server(&format!("m{i}"), "them", i)).collect(),
            has_more: false,
        });

        assert_eq!(s.len(), 20);
        assert_eq!(outcome.inserted, 10);
        assert_eq!(outcome.anchor_row, Some(10));
        assert_eq!(s.first_visible_row(), 10);
        assert_eq!(s.messages()[s.first_visible_row()].id, top_before);
        assert_eq!(s.messages()[0].id, Some("m1".into()));
        assert!(!s.has_more_older());
        assert_eq!(s.begin_load_older(), None);
    }

    #[test]
    fn load_older_skips_ids_already_present() {
        let mut s = stream();
        s.apply_latest(MessagePage {
            messages: vec![server("m3", "them", 3), server("m2", "them", 2)],
            has_more: true,
        });
        s.begin_load_older();
        // Offset paging shifted: m2 shows up again.
        let outcome = s.apply_older(MessagePage {
            messages: vec![server("m2", "them", 2), server("m1", "them", 1)],
            has_more: false,
        });
        assert_eq!(outcome.inserted, 1);
        assert_eq!(contents(&s), vec!["body m1", "body m2", "body m3"]);
    }

    #[test]
    fn resync_merges_only_missing() {
        let mut s = stream();
        s.on_incoming(server("m1", "them", 1));
        s.on_incoming(server("m2", "them", 2));

        assert_eq!(s.begin_resync(), Some(at(2)));
        assert!(s.is_syncing());
        let appended = s.apply_resync(vec![server("m2", "them", 2), server("m3", "them", 3)]);
        assert_eq!(appended, 1);
        assert!(!s.is_syncing());
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn resync_needs_a_confirmed_message() {
        let mut s = stream();
        s.compose("offline".into(), at(1));
        assert_eq!(s.begin_resync(), None);
    }

    #[test]
    fn read_receipts_flip_matching_ids() {
        let mut s = stream();
        s.on_incoming(server("m1", "me", 1));
        s.on_incoming(server("m2", "me", 2));
        assert_eq!(s.on_read_receipt(&["m2".into(), "zz".into()], at(5)), 1);

        let messages = s.messages();
        assert!(!messages[0].is_read);
        assert!(messages[1].is_read);
        assert_eq!(messages[1].read_at, Some(at(5)));
    }

    #[test]
    fn viewing_marks_only_incoming_read() {
        let mut s = stream();
        s.on_incoming(server("m1", "them", 1));
        s.on_incoming(server("m2", "me", 2));
        assert_eq!(s.mark_incoming_read(at(3)), 1);
        assert!(s.messages()[0].is_read);
        assert!(!s.messages()[1].is_read);
    }
}
