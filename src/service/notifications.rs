use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{Notification, NotificationKind};
use crate::validation::validate_user;

/// Builds an unread notification. Values are stored as JSON strings.
pub(crate) fn build_notification<const N: usize>(
    user: &str,
    kind: NotificationKind,
    message: String,
    data: [(&str, String); N],
) -> Notification {
    let data: Map<String, Value> = data
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::String(v)))
        .collect();

    Notification {
        id: Uuid::new_v4().to_string(),
        user: user.to_string(),
        kind,
        message,
        data,
        created_at: Utc::now(),
        read: false,
        read_at: None,
    }
}

/// Per-user inbox for sharing events.
#[derive(Clone)]
pub struct NotificationManager {
    store: Arc<dyn Store>,
}

impl NotificationManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn notify(
        &self,
        user: &str,
        kind: NotificationKind,
        message: &str,
        data: Map<String, Value>,
    ) -> Result<Notification> {
        validate_user(user, "recipient")?;
        let notification = Notification {
            data,
            ..build_notification(user, kind, message.to_string(), [])
        };
        self.store.create_notification(&notification)?;
        debug!("Notified {user}: {kind}");
        Ok(notification)
    }

    /// Newest first.
    pub fn list(&self, user: &str, unread_only: bool) -> Result<Vec<Notification>> {
        self.store.list_notifications(user, unread_only)
    }

    pub fn unread_count(&self, user: &str) -> Result<i64> {
        self.store.count_unread_notifications(user)
    }

    fn owned(&self, id: &str, user: &str) -> Result<Notification> {
        let notification = self
            .store
            .get_notification(id)?
            .ok_or_else(|| Error::not_found("notification", id))?;
        if notification.user != user {
            return Err(Error::Forbidden(format!(
                "notification '{id}' does not belong to {user}"
            )));
        }
        Ok(notification)
    }

    /// Returns false if the notification was already read.
    pub fn mark_as_read(&self, id: &str, user: &str) -> Result<bool> {
        self.owned(id, user)?;
        self.store.mark_notification_read(id, Utc::now())
    }

    pub fn mark_all_as_read(&self, user: &str) -> Result<usize> {
        self.store.mark_all_notifications_read(user, Utc::now())
    }

    pub fn delete_notification(&self, id: &str, user: &str) -> Result<()> {
        self.owned(id, user)?;
        self.store.delete_notification(id)?;
        Ok(())
    }

    pub fn clear_all(&self, user: &str) -> Result<usize> {
        self.store.delete_user_notifications(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn manager() -> NotificationManager {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        NotificationManager::new(Arc::new(store))
    }

    fn data(key: &str, value: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(key.to_string(), Value::String(value.to_string()));
        map
    }

    #[test]
    fn test_notify_and_read() {
        let manager = manager();
        let first = manager
            .notify("u1", NotificationKind::TokenUsed, "token used", data("token_id", "t1"))
            .unwrap();
        manager
            .notify("u1", NotificationKind::AccessRevoked, "revoked", Map::new())
            .unwrap();
        manager
            .notify("u2", NotificationKind::TokenUsed, "other", Map::new())
            .unwrap();

        assert_eq!(manager.unread_count("u1").unwrap(), 2);
        assert!(manager.mark_as_read(&first.id, "u1").unwrap());
        assert!(!manager.mark_as_read(&first.id, "u1").unwrap());
        assert_eq!(manager.unread_count("u1").unwrap(), 1);

        let unread = manager.list("u1", true).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].kind, NotificationKind::AccessRevoked);

        let stored = manager.list("u1", false).unwrap();
        let read = stored.iter().find(|n| n.id == first.id).unwrap();
        assert!(read.read);
        assert!(read.read_at.is_some());
        assert_eq!(read.data.get("token_id"), Some(&Value::String("t1".to_string())));
    }

    #[test]
    fn test_only_recipient_may_modify() {
        let manager = manager();
        let n = manager
            .notify("u1", NotificationKind::TokenUsed, "token used", Map::new())
            .unwrap();

        assert!(matches!(
            manager.delete_notification(&n.id, "u2"),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(manager.mark_as_read(&n.id, "u2"), Err(Error::Forbidden(_))));
        assert!(matches!(
            manager.delete_notification("missing", "u1"),
            Err(Error::NotFound(_))
        ));

        manager.delete_notification(&n.id, "u1").unwrap();
        assert!(manager.list("u1", false).unwrap().is_empty());
    }

    #[test]
    fn test_mark_all_and_clear() {
        let manager = manager();
        for i in 0..3 {
            manager
                .notify("u1", NotificationKind::InvitationReceived, &format!("n{i}"), Map::new())
                .unwrap();
        }
        manager
            .notify("u2", NotificationKind::InvitationReceived, "keep", Map::new())
            .unwrap();

        assert_eq!(manager.mark_all_as_read("u1").unwrap(), 3);
        assert_eq!(manager.mark_all_as_read("u1").unwrap(), 0);
        assert_eq!(manager.unread_count("u1").unwrap(), 0);

        assert_eq!(manager.clear_all("u1").unwrap(), 3);
        assert_eq!(manager.list("u2", false).unwrap().len(), 1);
    }

    #[test]
    fn test_build_notification_data() {
        let n = build_notification(
            "u1",
            NotificationKind::TokenUsed,
            "used".to_string(),
            [("token_id", "t1".to_string()), ("redeemed_by", "u2".to_string())],
        );
        assert_eq!(n.data.len(), 2);
        assert!(!n.read);
        assert_eq!(n.data["redeemed_by"], Value::String("u2".to_string()));
    }
}
