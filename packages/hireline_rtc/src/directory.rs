//! Conversation directory: cached, recency-sorted, paginated conversation list
//! that absorbs real-time events.
//!
//! Pages are contiguous and every conversation lives in exactly one cached
//! page. A new message for a cached conversation moves it to the head of page
//! one and shifts the tail of each page above its old slot down by one. A new
//! message for a conversation that is not cached invalidates the cache and asks
//! for a refetch; its rank is never guessed. A re-delivered message id is
//! recognised and leaves the directory untouched.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{Conversation, ConversationId, Message, MessageId, UserId};

/// How many recent message ids are remembered for duplicate detection.
const SEEN_CAPACITY: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// 1-based
    pub page: u32,
    pub limit: u32,
}

impl ConversationQuery {
    pub fn new(search: Option<&str>, page: u32, limit: u32) -> Self {
        Self {
            search: normalize_search(search),
            page: page.max(1),
            limit: limit.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConversationPage {
    pub items: Vec<Conversation>,
    pub has_more: bool,
}

fn normalize_search(search: Option<&str>) -> Option<String> {
    search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refetch {
    Idle,
    InFlight,
    /// Another invalidation arrived while the refetch was running.
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewMessageOutcome {
    /// Conversation was cached and now heads page one.
    Moved { from_page: usize },
    /// Cache dropped; caller must issue this fetch.
    Refetch(ConversationQuery),
    /// Cache dropped; a refetch is already running and will be repeated.
    RefetchQueued,
    /// Nothing has been listed yet, so there is nothing to keep current.
    NotLoaded,
    /// This message id was already applied.
    Duplicate,
}

pub struct ConversationDirectory {
    self_id: UserId,
    search: Option<String>,
    limit: u32,
    pages: Vec<Vec<Conversation>>,
    has_more: bool,
    loaded: bool,
    refetch: Refetch,
    selected: Option<ConversationId>,
    seen: HashSet<MessageId>,
    seen_order: VecDeque<MessageId>,
}

impl ConversationDirectory {
    pub fn new(self_id: UserId, limit: u32) -> Self {
        Self {
            self_id,
            search: None,
            limit: limit.max(1),
            pages: Vec::new(),
            has_more: false,
            loaded: false,
            refetch: Refetch::Idle,
            selected: None,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Remember `id`; false if it was already applied.
    fn first_sighting(&mut self, id: &MessageId) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.seen_order.push_back(id.clone());
        if self.seen_order.len() > SEEN_CAPACITY {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Serve a page from cache if this exact page of this query is held.
    pub fn cached(&self, query: &ConversationQuery) -> Option<ConversationPage> {
        if !self.loaded || query.search != self.search || query.limit != self.limit {
            return None;
        }
        let index = (query.page as usize).checked_sub(1)?;
        let items = self.pages.get(index)?.clone();
        Some(ConversationPage {
            items,
            has_more: (query.page as usize) < self.pages.len() || self.has_more,
        })
    }

    /// Store a fetched page. A different search or limit resets the cache;
    /// a page that would leave a gap is returned but not cached.
    pub fn store_page(
        &mut self,
        query: &ConversationQuery,
        page: ConversationPage,
    ) -> ConversationPage {
        if query.search != self.search || query.limit != self.limit {
            debug!(search = ?query.search, "directory query changed, resetting cache");
            self.search = query.search.clone();
            self.limit = query.limit;
            self.pages.clear();
            self.has_more = false;
        }

        let Some(index) = (query.page as usize).checked_sub(1) else {
            return page;
        };
        if index > self.pages.len() {
            debug!(page = query.page, cached = self.pages.len(), "page out of sequence, not caching");
            return page;
        }

        for item in &page.items {
            for (i, cached) in self.pages.iter_mut().enumerate() {
                if i != index {
                    cached.retain(|c| c.id != item.id);
                }
            }
        }

        if index == self.pages.len() {
            self.pages.push(page.items.clone());
        } else {
            self.pages[index] = page.items.clone();
        }
        if index + 1 == self.pages.len() {
            self.has_more = page.has_more;
        }
        self.loaded = true;
        page
    }

    fn locate(&self, id: &ConversationId) -> Option<(usize, usize)> {
        self.pages.iter().enumerate().find_map(|(p, page)| {
            page.iter()
                .position(|c| &c.id == id)
                .map(|i| (p, i))
        })
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.locate(id).map(|(p, i)| &self.pages[p][i])
    }

    fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        let (p, i) = self.locate(id)?;
        Some(&mut self.pages[p][i])
    }

    /// Position as (page, index), both 0-based.
    pub fn position(&self, id: &ConversationId) -> Option<(usize, usize)> {
        self.locate(id)
    }

    pub fn on_new_message(&mut self, message: &Message) -> NewMessageOutcome {
        if let Some(id) = &message.id {
            if !self.first_sighting(id) {
                debug!(conversation = %message.conversation_id, message = %id, "duplicate delivery, directory unchanged");
                return NewMessageOutcome::Duplicate;
            }
        }
        if !self.loaded {
            return NewMessageOutcome::NotLoaded;
        }

        let Some((page, index)) = self.locate(&message.conversation_id) else {
            debug!(conversation = %message.conversation_id, "message for uncached conversation, invalidating");
            return match self.invalidate() {
                Some(query) => NewMessageOutcome::Refetch(query),
                None => NewMessageOutcome::RefetchQueued,
            };
        };

        let mut convo = self.pages[page].remove(index);
        convo.touch(message);
        if message.sender_id != self.self_id {
            convo.unread_count += 1;
        }
        self.pages[0].insert(0, convo);

        // Page 0 grew by one and `page` shrank by one; shift the overflow down.
        for k in 0..page {
            if let Some(last) = self.pages[k].pop() {
                self.pages[k + 1].insert(0, last);
            }
        }

        NewMessageOutcome::Moved { from_page: page }
    }

    /// Drop every cached page. Returns the fetch to issue, unless one is
    /// already running (then it is repeated once it finishes).
    pub fn invalidate(&mut self) -> Option<ConversationQuery> {
        self.pages.clear();
        self.has_more = false;
        match self.refetch {
            Refetch::Idle => {
                self.refetch = Refetch::InFlight;
                Some(ConversationQuery {
                    search: self.search.clone(),
                    page: 1,
                    limit: self.limit,
                })
            }
            Refetch::InFlight | Refetch::Queued => {
                self.refetch = Refetch::Queued;
                None
            }
        }
    }

    /// Feed the result of a refetch. Returns a follow-up fetch if another
    /// invalidation was queued meanwhile.
    pub fn on_refetched(
        &mut self,
        query: &ConversationQuery,
        result: Option<ConversationPage>,
    ) -> Option<ConversationQuery> {
        if self.refetch == Refetch::Queued {
            self.refetch = Refetch::InFlight;
            return Some(ConversationQuery {
                search: self.search.clone(),
                page: 1,
                limit: self.limit,
            });
        }
        self.refetch = Refetch::Idle;
        match result {
            Some(page) => {
                self.store_page(query, page);
            }
            None => self.loaded = false,
        }
        None
    }

    pub fn is_refetching(&self) -> bool {
        self.refetch != Refetch::Idle
    }

    /// Read event: clear the badge in place, order untouched.
    pub fn on_read(&mut self, id: &ConversationId) -> bool {
        match self.get_mut(id) {
            Some(convo) if convo.unread_count > 0 => {
                convo.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    /// Select a conversation, zeroing its badge before the server confirms.
    /// Returns whether there was anything unread.
    pub fn select(&mut self, id: &ConversationId) -> bool {
        self.selected = Some(id.clone());
        self.on_read(id)
    }

    pub fn selected(&self) -> Option<&ConversationId> {
        self.selected.as_ref()
    }

    pub fn total_unread(&self) -> u32 {
        self.pages.iter().flatten().map(|c| c.unread_count).sum()
    }

    /// All cached conversations in display order.
    pub fn items(&self) -> Vec<Conversation> {
        self.pages.iter().flatten().cloned().collect()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageStatus, ParticipantSnapshot, Role};
    use chrono::{TimeZone, Utc};

    fn convo(id: &str, at: i64, unread: u32) -> Conversation {
        Conversation {
            id: id.into(),
            participants: ["me".into(), format!("other-{id}").as_str().into()],
            other: ParticipantSnapshot {
                user_id: format!("other-{id}").as_str().into(),
                name: format!("Other {id}"),
                avatar_url: None,
                role: Role::Recruiter,
            },
            last_message: None,
            last_message_at: Some(Utc.timestamp_opt(at, 0).unwrap()),
            unread_count: unread,
            context: None,
        }
    }

    fn message(conversation: &str, sender: &str, at: i64) -> Message {
        Message {
            id: Some(format!("m-{conversation}-{at}").as_str().into()),
            temp_id: None,
            conversation_id: conversation.into(),
            sender_id: sender.into(),
            recipient_id: "me".into(),
            content: "new".into(),
            sent_at: Utc.timestamp_opt(at, 0).unwrap(),
            is_read: false,
            read_at: None,
            status: MessageStatus::Sent,
            failure: None,
        }
    }

    /// Two pages of two: [a, b] [c, d]
    fn loaded() -> ConversationDirectory {
        let mut dir = ConversationDirectory::new("me".into(), 2);
        dir.store_page(
            &ConversationQuery::new(None, 1, 2),
            ConversationPage {
                items: vec![convo("a", 40, 0), convo("b", 30, 0)],
                has_more: true,
            },
        );
        dir.store_page(
            &ConversationQuery::new(None, 2, 2),
            ConversationPage {
                items: vec![convo("c", 20, 1), convo("d", 10, 0)],
                has_more: false,
            },
        );
        dir
    }

    fn ids(dir: &ConversationDirectory) -> Vec<String> {
        dir.items().into_iter().map(|c| c.id.0).collect()
    }

    #[test]
    fn cached_pages_are_served() {
        let dir = loaded();
        let page = dir.cached(&ConversationQuery::new(None, 1, 2)).unwrap();
        assert!(page.has_more);
        assert_eq!(page.items.len(), 2);

        let last = dir.cached(&ConversationQuery::new(None, 2, 2)).unwrap();
        assert!(!last.has_more);
        assert!(dir.cached(&ConversationQuery::new(None, 3, 2)).is_none());
        assert!(dir.cached(&ConversationQuery::new(Some("acme"), 1, 2)).is_none());
    }

    #[test]
    fn new_message_moves_cached_conversation_to_head() {
        let mut dir = loaded();
        let outcome = dir.on_new_message(&message("d", "other-d", 50));

        assert_eq!(outcome, NewMessageOutcome::Moved { from_page: 1 });
        assert_eq!(ids(&dir), vec!["d", "a", "b", "c"]);
        // Pages stay contiguous and full.
        assert_eq!(dir.position(&"b".into()), Some((1, 0)));
        let head = dir.get(&"d".into()).unwrap();
        assert_eq!(head.unread_count, 1);
        assert_eq!(head.last_message_at, Some(Utc.timestamp_opt(50, 0).unwrap()));
        assert_eq!(head.last_message.as_ref().unwrap().content, "new");
    }

    #[test]
    fn redelivered_message_counts_once() {
        let mut dir = loaded();
        let m = message("b", "other-b", 50);
        assert_eq!(dir.on_new_message(&m), NewMessageOutcome::Moved { from_page: 0 });
        assert_eq!(dir.on_new_message(&m), NewMessageOutcome::Duplicate);

        assert_eq!(ids(&dir), vec!["b", "a", "c", "d"]);
        assert_eq!(dir.get(&"b".into()).unwrap().unread_count, 1);
        assert_eq!(dir.total_unread(), 2);
    }

    #[test]
    fn self_sent_message_does_not_bump_unread() {
        let mut dir = loaded();
        dir.on_new_message(&message("b", "me", 50));
        assert_eq!(ids(&dir), vec!["b", "a", "c", "d"]);
        assert_eq!(dir.get(&"b".into()).unwrap().unread_count, 0);
    }

    #[test]
    fn uncached_conversation_triggers_single_refetch() {
        let mut dir = loaded();

        let first = dir.on_new_message(&message("zz", "other-zz", 60));
        let NewMessageOutcome::Refetch(query) = first else {
            panic!("expected refetch, got {first:?}");
        };
        assert_eq!(query.page, 1);
        assert!(dir.items().is_empty());

        // Another unknown conversation while the refetch runs: no second fetch.
        assert_eq!(
            dir.on_new_message(&message("yy", "other-yy", 61)),
            NewMessageOutcome::RefetchQueued
        );

        // The queued invalidation is replayed exactly once.
        let again = dir.on_refetched(&query, Some(ConversationPage::default()));
        assert!(again.is_some());
        let done = dir.on_refetched(
            &query,
            Some(ConversationPage {
                items: vec![convo("yy", 61, 1), convo("zz", 60, 1)],
                has_more: true,
            }),
        );
        assert!(done.is_none());
        assert!(!dir.is_refetching());
        assert_eq!(ids(&dir), vec!["yy", "zz"]);
    }

    #[test]
    fn read_event_resets_unread_without_reordering() {
        let mut dir = loaded();
        assert!(dir.on_read(&"c".into()));
        assert_eq!(dir.get(&"c".into()).unwrap().unread_count, 0);
        assert_eq!(ids(&dir), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn select_zeroes_unread_optimistically() {
        let mut dir = loaded();
        assert_eq!(dir.total_unread(), 1);
        assert!(dir.select(&"c".into()));
        assert_eq!(dir.total_unread(), 0);
        assert_eq!(dir.selected(), Some(&"c".into()));
    }

    #[test]
    fn overlapping_page_keeps_item_in_one_page() {
        let mut dir = loaded();
        // "b" slid onto page two on the server between fetches.
        dir.store_page(
            &ConversationQuery::new(None, 2, 2),
            ConversationPage {
                items: vec![convo("b", 30, 0), convo("c", 20, 1)],
                has_more: true,
            },
        );
        assert_eq!(ids(&dir), vec!["a", "b", "c"]);
        assert_eq!(dir.position(&"b".into()), Some((1, 0)));
    }

    #[test]
    fn search_change_resets_cache() {
        let mut dir = loaded();
        dir.store_page(
            &ConversationQuery::new(Some("  Acme "), 1, 2),
            ConversationPage {
                items: vec![convo("x", 5, 0)],
                has_more: false,
            },
        );
        assert_eq!(ids(&dir), vec!["x"]);
        assert!(dir.cached(&ConversationQuery::new(Some("acme"), 1, 2)).is_some());
    }

    #[test]
    fn messages_before_first_listing_are_ignored() {
        let mut dir = ConversationDirectory::new("me".into(), 20);
        assert_eq!(
            dir.on_new_message(&message("a", "other-a", 1)),
            NewMessageOutcome::NotLoaded
        );
    }
}
