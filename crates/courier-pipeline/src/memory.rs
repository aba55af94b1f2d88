//! In-memory repository adapter.
//!
//! Backs tests and the development composition root. `save_all` holds a
//! single write lock for the whole batch, giving the all-or-nothing
//! visibility the digest sweep requires.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use courier_common::{
    DeadLetterRecord, DeadLetterStatus, DeliveryRecord, Frequency, Notification,
    NotificationPreference, NotificationStatus, NotificationType,
};

use crate::repository::NotificationRepository;

#[derive(Default)]
pub struct InMemoryNotificationRepository {
    notifications: DashMap<String, Notification>,
    preferences: DashMap<(String, NotificationType), NotificationPreference>,
    delivery_records: DashMap<String, DeliveryRecord>,
    dead_letters: DashMap<String, DeadLetterRecord>,
    /// Serializes save_all batches.
    batch_lock: Mutex<()>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: all notifications for a user, oldest first.
    pub fn notifications_for(&self, user_id: &str) -> Vec<Notification> {
        let mut rows: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|n| n.created_at);
        rows
    }

    /// Test helper: all dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        let mut rows: Vec<DeadLetterRecord> = self
            .dead_letters
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn save_notification(&self, notification: Notification) -> Result<()> {
        self.notifications.insert(notification.id.clone(), notification);
        Ok(())
    }

    async fn find_notification(&self, id: &str) -> Result<Option<Notification>> {
        Ok(self.notifications.get(id).map(|entry| entry.value().clone()))
    }

    async fn mark_read(&self, id: &str, at: DateTime<Utc>) -> Result<Option<Notification>> {
        let mut entry = match self.notifications.get_mut(id) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        if entry.status == NotificationStatus::Unread {
            entry.status = NotificationStatus::Read;
            entry.read_at = Some(at);
        }
        Ok(Some(entry.clone()))
    }

    async fn archive(&self, id: &str) -> Result<Option<Notification>> {
        let mut entry = match self.notifications.get_mut(id) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        entry.status = NotificationStatus::Archived;
        Ok(Some(entry.clone()))
    }

    async fn find_unread_undigested_since(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let mut rows: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|entry| {
                let n = entry.value();
                n.user_id == user_id
                    && n.status == NotificationStatus::Unread
                    && n.digest_processed_at.is_none()
                    && n.created_at > cutoff
            })
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|n| n.created_at);
        Ok(rows)
    }

    async fn save_all(&self, notifications: Vec<Notification>) -> Result<()> {
        let _guard = self.batch_lock.lock();
        for notification in notifications {
            self.notifications.insert(notification.id.clone(), notification);
        }
        Ok(())
    }

    async fn save_preference(&self, preference: NotificationPreference) -> Result<()> {
        self.preferences.insert(
            (preference.user_id.clone(), preference.notification_type),
            preference,
        );
        Ok(())
    }

    async fn find_preference(
        &self,
        user_id: &str,
        notification_type: NotificationType,
    ) -> Result<Option<NotificationPreference>> {
        Ok(self
            .preferences
            .get(&(user_id.to_string(), notification_type))
            .map(|entry| entry.value().clone()))
    }

    async fn find_preferences_by_digest_frequency(
        &self,
        frequency: Frequency,
    ) -> Result<Vec<NotificationPreference>> {
        Ok(self
            .preferences
            .iter()
            .filter(|entry| entry.value().frequency == frequency)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn save_delivery_record(&self, record: DeliveryRecord) -> Result<()> {
        self.delivery_records.insert(record.tracking_id.clone(), record);
        Ok(())
    }

    async fn find_delivery_record(&self, tracking_id: &str) -> Result<Option<DeliveryRecord>> {
        Ok(self
            .delivery_records
            .get(tracking_id)
            .map(|entry| entry.value().clone()))
    }

    async fn save_dead_letter(&self, record: DeadLetterRecord) -> Result<()> {
        self.dead_letters.insert(record.id.clone(), record);
        Ok(())
    }

    async fn find_dead_letter(&self, id: &str) -> Result<Option<DeadLetterRecord>> {
        Ok(self.dead_letters.get(id).map(|entry| entry.value().clone()))
    }

    async fn find_dead_letters_by_status(
        &self,
        status: DeadLetterStatus,
        limit: u32,
    ) -> Result<Vec<DeadLetterRecord>> {
        let mut rows: Vec<DeadLetterRecord> = self
            .dead_letters
            .iter()
            .filter(|entry| entry.value().status == status)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn count_dead_letters(&self) -> Result<u64> {
        Ok(self.dead_letters.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_then_archive_is_monotonic() {
        let repo = InMemoryNotificationRepository::new();
        let notification = Notification::new("u-1", NotificationType::HiveActivity, "t", "c");
        let id = notification.id.clone();
        repo.save_notification(notification).await.unwrap();

        let read = repo.mark_read(&id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(read.status, NotificationStatus::Read);
        assert!(read.read_at.is_some());

        let archived = repo.archive(&id).await.unwrap().unwrap();
        assert_eq!(archived.status, NotificationStatus::Archived);

        // Re-reading an archived row does not resurrect it.
        let after = repo.mark_read(&id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(after.status, NotificationStatus::Archived);
    }

    #[tokio::test]
    async fn unread_undigested_query_filters() {
        let repo = InMemoryNotificationRepository::new();
        let cutoff = Utc::now() - chrono::Duration::hours(24);

        let fresh = Notification::new("u-1", NotificationType::HiveActivity, "fresh", "c");
        let fresh_id = fresh.id.clone();
        repo.save_notification(fresh).await.unwrap();

        let mut digested = Notification::new("u-1", NotificationType::HiveActivity, "done", "c");
        digested.digest_processed_at = Some(Utc::now());
        repo.save_notification(digested).await.unwrap();

        let mut old = Notification::new("u-1", NotificationType::HiveActivity, "old", "c");
        old.created_at = Utc::now() - chrono::Duration::hours(48);
        repo.save_notification(old).await.unwrap();

        let other_user = Notification::new("u-2", NotificationType::HiveActivity, "other", "c");
        repo.save_notification(other_user).await.unwrap();

        let rows = repo.find_unread_undigested_since("u-1", cutoff).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, fresh_id);
    }

    #[tokio::test]
    async fn digest_frequency_query() {
        let repo = InMemoryNotificationRepository::new();
        let mut daily = NotificationPreference::default_for("u-1", NotificationType::HiveActivity);
        daily.frequency = Frequency::DailyDigest;
        repo.save_preference(daily).await.unwrap();

        let immediate =
            NotificationPreference::default_for("u-2", NotificationType::PasswordReset);
        repo.save_preference(immediate).await.unwrap();

        let found = repo
            .find_preferences_by_digest_frequency(Frequency::DailyDigest)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user_id, "u-1");
    }
}
