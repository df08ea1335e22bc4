//! Arena-and-index message store.
//!
//! Entries live in an arena and never move; display order is a separate deque
//! of keys, so prepending older history and reconciling optimistic entries
//! never invalidate a lookup. Two indexes resolve an incoming message to its
//! slot: durable id, and the temp-id alias recorded when the entry was created
//! (or echoed back by the server).

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::models::{Message, MessageId, TempId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey(usize);

#[derive(Debug, Default)]
pub struct MessageStore {
    arena: Vec<Message>,
    order: VecDeque<EntryKey>,
    by_id: HashMap<MessageId, EntryKey>,
    by_temp: HashMap<TempId, EntryKey>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, message: Message) -> EntryKey {
        let key = EntryKey(self.arena.len());
        self.index(key, &message);
        self.arena.push(message);
        key
    }

    fn index(&mut self, key: EntryKey, message: &Message) {
        if let Some(id) = &message.id {
            self.by_id.insert(id.clone(), key);
        }
        if let Some(temp_id) = message.temp_id {
            self.by_temp.entry(temp_id).or_insert(key);
        }
    }

    pub fn push_back(&mut self, message: Message) -> EntryKey {
        let key = self.alloc(message);
        self.order.push_back(key);
        key
    }

    pub fn push_front(&mut self, message: Message) -> EntryKey {
        let key = self.alloc(message);
        self.order.push_front(key);
        key
    }

    /// Insert keeping confirmed messages in `sent_at` order: the new entry goes
    /// after the last entry that is not newer than it.
    pub fn insert_chronological(&mut self, message: Message) -> EntryKey {
        let sent_at = message.sent_at;
        let position = self
            .order
            .iter()
            .rposition(|key| self.arena[key.0].sent_at <= sent_at)
            .map(|p| p + 1)
            .unwrap_or(0);
        let key = self.alloc(message);
        self.order.insert(position, key);
        key
    }

    /// Resolve by durable id first, then by temp-id alias.
    pub fn find(&self, id: Option<&MessageId>, temp_id: Option<&TempId>) -> Option<EntryKey> {
        id.and_then(|id| self.by_id.get(id))
            .or_else(|| temp_id.and_then(|t| self.by_temp.get(t)))
            .copied()
    }

    pub fn find_temp(&self, temp_id: &TempId) -> Option<EntryKey> {
        self.by_temp.get(temp_id).copied()
    }

    pub fn contains_id(&self, id: &MessageId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, key: EntryKey) -> &Message {
        &self.arena[key.0]
    }

    /// Swap the entry's content in place. Its display position is unchanged
    /// and the temp alias keeps pointing at it.
    pub fn replace(&mut self, key: EntryKey, mut message: Message) {
        let previous_temp = self.arena[key.0].temp_id;
        if message.temp_id.is_none() {
            message.temp_id = previous_temp;
        }
        self.index(key, &message);
        self.arena[key.0] = message;
    }

    /// Drop `duplicate` from display and point its temp alias at `survivor`.
    /// Used when one message ended up in two entries.
    pub fn merge_into(&mut self, duplicate: EntryKey, survivor: EntryKey) {
        self.order.retain(|key| *key != duplicate);
        if let Some(temp_id) = self.arena[duplicate.0].temp_id {
            self.by_temp.insert(temp_id, survivor);
        }
        if let Some(id) = self.arena[duplicate.0].id.clone() {
            self.by_id.insert(id, survivor);
        }
    }

    /// Mutate fields that are not indexed (status, read flags).
    pub fn update(&mut self, key: EntryKey, f: impl FnOnce(&mut Message)) {
        let entry = &mut self.arena[key.0];
        let id = entry.id.clone();
        let temp_id = entry.temp_id;
        f(entry);
        entry.id = id;
        entry.temp_id = temp_id;
    }

    /// Display row of an entry.
    pub fn position(&self, key: EntryKey) -> Option<usize> {
        self.order.iter().position(|k| *k == key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.order.iter().map(|key| &self.arena[key.0])
    }

    pub fn keys(&self) -> impl Iterator<Item = EntryKey> + '_ {
        self.order.iter().copied()
    }

    pub fn first_key(&self) -> Option<EntryKey> {
        self.order.front().copied()
    }

    /// Newest `sent_at` among server-confirmed messages.
    pub fn latest_confirmed_at(&self) -> Option<DateTime<Utc>> {
        self.iter()
            .filter(|m| m.is_confirmed())
            .map(|m| m.sent_at)
            .max()
    }
}
