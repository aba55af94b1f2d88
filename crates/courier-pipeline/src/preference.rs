//! Preference evaluation: per-user channel toggles, frequency, quiet hours.
//!
//! Absence semantics: a user with no stored preference is treated as enabled
//! at read time; a default row is materialized lazily on the first mutation,
//! never on reads.

use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveTime;
use serde_json::json;
use tracing::debug;

use courier_common::{Channel, Frequency, NotificationPreference, NotificationType};

use crate::audit::AuditLogger;
use crate::repository::NotificationRepository;

/// Partial update applied by `upsert`. Unset fields keep their value.
#[derive(Debug, Default, Clone)]
pub struct PreferenceUpdate {
    pub in_app_enabled: Option<bool>,
    pub email_enabled: Option<bool>,
    pub push_enabled: Option<bool>,
    pub frequency: Option<Frequency>,
    /// `Some(None)` clears the quiet window.
    pub quiet_start: Option<Option<NaiveTime>>,
    pub quiet_end: Option<Option<NaiveTime>>,
}

/// True iff `t` falls inside the window [start, end), honoring wrap-around
/// past midnight: start=22:00, end=07:00 covers [22:00,24:00) and
/// [00:00,07:00).
pub fn quiet_window_contains(start: NaiveTime, end: NaiveTime, t: NaiveTime) -> bool {
    if start < end {
        start <= t && t < end
    } else if start > end {
        t >= start || t < end
    } else {
        // Degenerate zero-length window.
        false
    }
}

pub struct PreferenceEngine {
    repository: Arc<dyn NotificationRepository>,
    audit: Arc<AuditLogger>,
}

impl PreferenceEngine {
    pub fn new(repository: Arc<dyn NotificationRepository>, audit: Arc<AuditLogger>) -> Self {
        Self { repository, audit }
    }

    /// Resolve the preference for (user, type), returning the per-type
    /// default when no row exists. Reads never persist.
    pub async fn get(
        &self,
        user_id: &str,
        notification_type: NotificationType,
    ) -> Result<NotificationPreference> {
        match self.repository.find_preference(user_id, notification_type).await? {
            Some(preference) => Ok(preference),
            None => Ok(NotificationPreference::default_for(user_id, notification_type)),
        }
    }

    /// Apply a partial update, materializing the default row first when none
    /// exists. Emits an audit record with the field-level diff.
    pub async fn upsert(
        &self,
        user_id: &str,
        notification_type: NotificationType,
        update: PreferenceUpdate,
    ) -> Result<NotificationPreference> {
        let existing = self.repository.find_preference(user_id, notification_type).await?;
        let created = existing.is_none();
        let mut preference = existing
            .unwrap_or_else(|| NotificationPreference::default_for(user_id, notification_type));

        let mut diff = serde_json::Map::new();
        let mut record_change = |field: &str, from: serde_json::Value, to: serde_json::Value| {
            if from != to {
                diff.insert(field.to_string(), json!({ "from": from, "to": to }));
            }
        };

        if let Some(value) = update.in_app_enabled {
            record_change("inAppEnabled", json!(preference.in_app_enabled), json!(value));
            preference.in_app_enabled = value;
        }
        if let Some(value) = update.email_enabled {
            record_change("emailEnabled", json!(preference.email_enabled), json!(value));
            preference.email_enabled = value;
        }
        if let Some(value) = update.push_enabled {
            record_change("pushEnabled", json!(preference.push_enabled), json!(value));
            preference.push_enabled = value;
        }
        if let Some(value) = update.frequency {
            record_change("frequency", json!(preference.frequency), json!(value));
            preference.frequency = value;
        }
        if let Some(value) = update.quiet_start {
            record_change("quietStart", json!(preference.quiet_start), json!(value));
            preference.quiet_start = value;
        }
        if let Some(value) = update.quiet_end {
            record_change("quietEnd", json!(preference.quiet_end), json!(value));
            preference.quiet_end = value;
        }

        preference.updated_at = chrono::Utc::now();
        self.repository.save_preference(preference.clone()).await?;

        self.audit.preference_changed(
            user_id,
            notification_type.as_str(),
            created,
            serde_json::Value::Object(diff),
        );

        Ok(preference)
    }

    /// True iff delivery on `channel` is allowed: frequency is not OFF and
    /// the channel toggle is set. Absent preference defaults to enabled.
    pub async fn is_enabled(
        &self,
        user_id: &str,
        notification_type: NotificationType,
        channel: Channel,
    ) -> Result<bool> {
        let preference = self.get(user_id, notification_type).await?;
        if preference.frequency == Frequency::Off {
            return Ok(false);
        }
        Ok(preference.channel_enabled(channel))
    }

    /// True iff a quiet window is configured and `local_time` falls within
    /// it (user-local time of day).
    pub async fn in_quiet_hours(
        &self,
        user_id: &str,
        notification_type: NotificationType,
        local_time: NaiveTime,
    ) -> Result<bool> {
        let preference = self.get(user_id, notification_type).await?;
        match (preference.quiet_start, preference.quiet_end) {
            (Some(start), Some(end)) => Ok(quiet_window_contains(start, end, local_time)),
            _ => Ok(false),
        }
    }

    /// One-time seeding: create one preference row per notification type
    /// with per-type defaults. Existing rows are left untouched.
    pub async fn seed_defaults(&self, user_id: &str) -> Result<usize> {
        let mut created = 0;
        for notification_type in NotificationType::all() {
            if self
                .repository
                .find_preference(user_id, *notification_type)
                .await?
                .is_none()
            {
                let preference = NotificationPreference::default_for(user_id, *notification_type);
                self.repository.save_preference(preference).await?;
                created += 1;
            }
        }
        debug!(user_id = %user_id, created = created, "Seeded default preferences");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryNotificationRepository;

    fn engine() -> (PreferenceEngine, Arc<InMemoryNotificationRepository>) {
        let repo = Arc::new(InMemoryNotificationRepository::new());
        let engine = PreferenceEngine::new(repo.clone(), Arc::new(AuditLogger::default()));
        (engine, repo)
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn absent_preference_is_enabled_and_not_persisted() {
        let (engine, repo) = engine();

        assert!(engine
            .is_enabled("u-1", NotificationType::PasswordReset, Channel::Email)
            .await
            .unwrap());

        // Read did not materialize a row.
        assert!(repo
            .find_preference("u-1", NotificationType::PasswordReset)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn off_frequency_suppresses_all_channels() {
        let (engine, _repo) = engine();
        engine
            .upsert(
                "u-1",
                NotificationType::HiveActivity,
                PreferenceUpdate {
                    frequency: Some(Frequency::Off),
                    ..PreferenceUpdate::default()
                },
            )
            .await
            .unwrap();

        for channel in Channel::all() {
            assert!(!engine
                .is_enabled("u-1", NotificationType::HiveActivity, channel)
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn upsert_materializes_default_then_applies_diff() {
        let (engine, repo) = engine();
        let updated = engine
            .upsert(
                "u-1",
                NotificationType::Marketing,
                PreferenceUpdate {
                    push_enabled: Some(true),
                    ..PreferenceUpdate::default()
                },
            )
            .await
            .unwrap();

        // Marketing defaults carry email off; the update only touched push.
        assert!(!updated.email_enabled);
        assert!(updated.push_enabled);

        assert!(repo
            .find_preference("u-1", NotificationType::Marketing)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn quiet_hours_respect_wraparound() {
        let (engine, _repo) = engine();
        engine
            .upsert(
                "u-1",
                NotificationType::SessionReminder,
                PreferenceUpdate {
                    quiet_start: Some(Some(t(22, 0))),
                    quiet_end: Some(Some(t(7, 0))),
                    ..PreferenceUpdate::default()
                },
            )
            .await
            .unwrap();

        let quiet = |time| engine.in_quiet_hours("u-1", NotificationType::SessionReminder, time);
        assert!(quiet(t(23, 30)).await.unwrap());
        assert!(quiet(t(3, 0)).await.unwrap());
        assert!(!quiet(t(7, 0)).await.unwrap());
        assert!(!quiet(t(12, 0)).await.unwrap());
        assert!(quiet(t(22, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn seed_defaults_is_idempotent() {
        let (engine, _repo) = engine();
        let first = engine.seed_defaults("u-1").await.unwrap();
        assert_eq!(first, NotificationType::all().len());

        let second = engine.seed_defaults("u-1").await.unwrap();
        assert_eq!(second, 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn any_time() -> impl Strategy<Value = NaiveTime> {
            (0u32..24, 0u32..60).prop_map(|(h, m)| t(h, m))
        }

        proptest! {
            #[test]
            fn window_matches_reference_predicate(
                start in any_time(),
                end in any_time(),
                probe in any_time(),
            ) {
                let expected = if start < end {
                    start <= probe && probe < end
                } else if start > end {
                    probe >= start || probe < end
                } else {
                    false
                };
                prop_assert_eq!(quiet_window_contains(start, end, probe), expected);
            }
        }
    }
}
