//! Notification repository contract.
//!
//! The pipeline consumes this interface; the storage driver behind it is out
//! of scope. `save_all` must be transactional: the digest sweep relies on it
//! to mark every included notification in one step.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_common::{
    DeadLetterRecord, DeadLetterStatus, DeliveryRecord, Frequency, Notification,
    NotificationPreference, NotificationType,
};

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    async fn save_notification(&self, notification: Notification) -> Result<()>;

    async fn find_notification(&self, id: &str) -> Result<Option<Notification>>;

    /// Mark a notification read. Returns the updated row; a no-op for rows
    /// already read or archived.
    async fn mark_read(&self, id: &str, at: DateTime<Utc>) -> Result<Option<Notification>>;

    /// Archive a notification. Read state is preserved; archiving is
    /// monotonic and cannot be undone.
    async fn archive(&self, id: &str) -> Result<Option<Notification>>;

    /// Unread, not-yet-digested notifications created after `cutoff`.
    async fn find_unread_undigested_since(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Notification>>;

    /// Transactional multi-row upsert, used for atomic digest marking.
    async fn save_all(&self, notifications: Vec<Notification>) -> Result<()>;

    // ------------------------------------------------------------------
    // Preferences
    // ------------------------------------------------------------------

    async fn save_preference(&self, preference: NotificationPreference) -> Result<()>;

    async fn find_preference(
        &self,
        user_id: &str,
        notification_type: NotificationType,
    ) -> Result<Option<NotificationPreference>>;

    async fn find_preferences_by_digest_frequency(
        &self,
        frequency: Frequency,
    ) -> Result<Vec<NotificationPreference>>;

    // ------------------------------------------------------------------
    // Delivery records
    // ------------------------------------------------------------------

    async fn save_delivery_record(&self, record: DeliveryRecord) -> Result<()>;

    async fn find_delivery_record(&self, tracking_id: &str) -> Result<Option<DeliveryRecord>>;

    // ------------------------------------------------------------------
    // Dead letters
    // ------------------------------------------------------------------

    async fn save_dead_letter(&self, record: DeadLetterRecord) -> Result<()>;

    async fn find_dead_letter(&self, id: &str) -> Result<Option<DeadLetterRecord>>;

    async fn find_dead_letters_by_status(
        &self,
        status: DeadLetterStatus,
        limit: u32,
    ) -> Result<Vec<DeadLetterRecord>>;

    async fn count_dead_letters(&self) -> Result<u64>;
}
