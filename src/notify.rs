use dashmap::DashMap;
use ulid::Ulid;

use crate::model::Notification;

/// Persistent per-user notification queue.
///
/// The queue itself is plain state — all mutations arrive as WAL events
/// applied by the engine, so notifications survive restarts and the
/// reconciler can write messages for users who are not on this request.
#[derive(Default)]
pub struct NotificationQueue {
    by_user: DashMap<Ulid, Vec<Notification>>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self {
            by_user: DashMap::new(),
        }
    }

    /// Apply a queued-notification event. Append-only, no dedup.
    pub fn apply_queued(&self, record: Notification) {
        self.by_user
            .entry(record.user_id)
            .or_default()
            .push(record);
    }

    /// Apply a read-marker event for the given notification ids.
    pub fn apply_read(&self, user_id: Ulid, ids: &[Ulid]) {
        if let Some(mut list) = self.by_user.get_mut(&user_id) {
            for n in list.iter_mut() {
                if ids.contains(&n.id) {
                    n.read = true;
                }
            }
        }
    }

    /// Unread notifications for a user, creation time ascending.
    pub fn unread(&self, user_id: Ulid) -> Vec<Notification> {
        let mut out: Vec<Notification> = self
            .by_user
            .get(&user_id)
            .map(|list| list.iter().filter(|n| !n.read).cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// All notifications for a user (read and unread), for compaction.
    pub fn all_for(&self, user_id: Ulid) -> Vec<Notification> {
        self.by_user
            .get(&user_id)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn user_ids(&self) -> Vec<Ulid> {
        self.by_user.iter().map(|e| *e.key()).collect()
    }

    /// Drop a user's queue entirely (account-deletion cascade).
    pub fn remove_user(&self, user_id: Ulid) {
        self.by_user.remove(&user_id);
    }
}
