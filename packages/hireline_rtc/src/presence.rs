//! Online-user set: replaced by a snapshot on every (re)connect, then kept
//! current by incremental deltas.

use std::collections::HashSet;

use tracing::debug;

use crate::models::UserId;

#[derive(Debug, Default)]
pub struct PresenceSet {
    online: HashSet<UserId>,
    /// False until the first snapshot of the current connection arrives.
    synced: bool,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set with a fresh snapshot.
    pub fn replace(&mut self, snapshot: impl IntoIterator<Item = UserId>) {
        self.online = snapshot.into_iter().collect();
        self.synced = true;
        debug!(online = self.online.len(), "presence snapshot applied");
    }

    /// Apply one delta. Returns whether membership changed.
    pub fn apply(&mut self, user_id: UserId, is_online: bool) -> bool {
        if is_online {
            self.online.insert(user_id)
        } else {
            self.online.remove(&user_id)
        }
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains(user_id)
    }

    /// Snapshot no longer reflects the server (channel dropped). Membership is
    /// kept for display until the next snapshot replaces it.
    pub fn mark_stale(&mut self) {
        self.synced = false;
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.iter().cloned().collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_then_delta() {
        let mut presence = PresenceSet::new();
        presence.replace(["u1".into(), "u2".into(), "u9".into()]);

        assert!(presence.apply("u9".into(), false));

        assert!(!presence.is_online(&"u9".into()));
        assert!(presence.is_online(&"u1".into()));
        assert!(presence.is_online(&"u2".into()));
    }

    #[test]
    fn snapshot_replaces_previous_state() {
        let mut presence = PresenceSet::new();
        presence.replace(["u1".into()]);
        presence.apply("u5".into(), true);
        presence.mark_stale();
        assert!(!presence.is_synced());

        presence.replace(["u2".into()]);
        assert!(presence.is_synced());
        assert_eq!(presence.online_users(), vec![UserId::from("u2")]);
    }

    #[test]
    fn repeated_delta_is_not_a_change() {
        let mut presence = PresenceSet::new();
        assert!(presence.apply("u1".into(), true));
        assert!(!presence.apply("u1".into(), true));
        assert!(!presence.apply("u3".into(), false));
        assert_eq!(presence.len(), 1);
    }
}
