use std::collections::HashSet;

use shared::domain::{PresenceStatus, UserId};

/// Online-user set fed from two sources: push deltas as they arrive, and a
/// periodic poll snapshot that replaces the whole set. The poll is the
/// authoritative baseline; push events bound the latency between polls.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashSet<UserId>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one push delta. Returns whether the set changed.
    pub fn apply_push_event(&mut self, user_id: UserId, status: PresenceStatus) -> bool {
        match status {
            PresenceStatus::Online => self.online.insert(user_id),
            PresenceStatus::Offline => self.online.remove(&user_id),
        }
    }

    /// Replaces the set with a poll snapshot.
    pub fn reconcile_full_snapshot(&mut self, user_ids: impl IntoIterator<Item = UserId>) {
        self.online = user_ids.into_iter().collect();
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.online.contains(&user_id)
    }

    pub fn current_online_set(&self) -> HashSet<UserId> {
        self.online.clone()
    }
}
