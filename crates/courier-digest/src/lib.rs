//! Courier Digest Scheduler
//!
//! Aggregates deferred notifications into daily/weekly digest emails. A
//! single timer task ticks once a minute, computes which recipients are due
//! in their local timezone (daily at 08:00, weekly on Monday at 09:00), and
//! dispatches per-user work through the delivery pipeline. Per-user failures
//! are isolated: they are logged and counted, never halting the sweep.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn, Instrument};

use courier_common::{Channel, Clock, Frequency, Notification, NotificationType};
use courier_pipeline::{
    CachedUserInfoProvider, DeliveryPipeline, NotificationRepository, PreferenceEngine,
};

#[derive(Error, Debug)]
pub enum DigestError {
    #[error("Repository error: {0}")]
    Repository(#[from] anyhow::Error),

    #[error("Pipeline rejected digest: {0}")]
    Pipeline(String),

    #[error("Per-user deadline exceeded")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct DigestSchedulerConfig {
    pub enabled: bool,
    /// Hour of day (user local) for the daily sweep.
    pub daily_hour: u32,
    /// Hour of day (user local) for the weekly sweep, Mondays.
    pub weekly_hour: u32,
    pub tick: Duration,
    pub per_user_timeout: Duration,
    /// Items listed per type before the overflow indicator.
    pub items_per_type: usize,
}

impl Default for DigestSchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_hour: 8,
            weekly_hour: 9,
            tick: Duration::from_secs(60),
            per_user_timeout: Duration::from_secs(30),
            items_per_type: 5,
        }
    }
}

/// Read-only inspection of what a digest would contain.
#[derive(Debug, Clone)]
pub struct DigestSummary {
    pub total_count: usize,
    pub type_breakdown: BTreeMap<String, usize>,
    pub cutoff: DateTime<Utc>,
}

pub struct DigestScheduler {
    config: DigestSchedulerConfig,
    repository: Arc<dyn NotificationRepository>,
    pipeline: Arc<DeliveryPipeline>,
    preferences: Arc<PreferenceEngine>,
    users: Arc<CachedUserInfoProvider>,
    clock: Arc<dyn Clock>,
    /// Self-handle for the timer task.
    me: Weak<DigestScheduler>,
    running: Arc<RwLock<bool>>,
    /// Local date of the last completed run per (user, frequency), so a user
    /// is swept at most once per due day.
    last_run: DashMap<(String, Frequency), NaiveDate>,
}

impl DigestScheduler {
    pub fn new(
        config: DigestSchedulerConfig,
        repository: Arc<dyn NotificationRepository>,
        pipeline: Arc<DeliveryPipeline>,
        preferences: Arc<PreferenceEngine>,
        users: Arc<CachedUserInfoProvider>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            repository,
            pipeline,
            preferences,
            users,
            clock,
            me: me.clone(),
            running: Arc::new(RwLock::new(false)),
            last_run: DashMap::new(),
        })
    }

    /// Start the timer task.
    pub async fn start(&self) {
        if !self.config.enabled {
            info!("Digest scheduler is disabled");
            return;
        }

        let mut running = self.running.write().await;
        if *running {
            warn!("Digest scheduler already running");
            return;
        }
        *running = true;
        drop(running);

        info!(
            daily_hour = self.config.daily_hour,
            weekly_hour = self.config.weekly_hour,
            tick_secs = self.config.tick.as_secs(),
            "Starting digest scheduler"
        );

        let scheduler = match self.me.upgrade() {
            Some(scheduler) => scheduler,
            None => return,
        };
        let tick = self.config.tick;
        tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                ticker.tick().await;
                if !*scheduler.running.read().await {
                    break;
                }
                scheduler.tick().await;
            }
        });
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!("Digest scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// One scheduler tick: sweep users whose local due time has arrived.
    async fn tick(&self) {
        for frequency in [Frequency::DailyDigest, Frequency::WeeklyDigest] {
            if let Err(e) = self.sweep_due(frequency).await {
                error!(frequency = ?frequency, error = %e, "Digest sweep failed");
            }
        }
    }

    async fn sweep_due(&self, frequency: Frequency) -> Result<(), DigestError> {
        let preferences = self
            .repository
            .find_preferences_by_digest_frequency(frequency)
            .await?;

        let mut user_ids: Vec<String> =
            preferences.into_iter().map(|p| p.user_id).collect();
        user_ids.sort();
        user_ids.dedup();

        for user_id in user_ids {
            if !self.due_now(&user_id, frequency).await {
                continue;
            }
            self.run_user_isolated(&user_id, frequency).await;
        }
        Ok(())
    }

    /// Cron-equivalent entry point: process every daily-digest recipient now.
    pub async fn run_daily(&self) {
        self.run_all(Frequency::DailyDigest).await;
    }

    /// Cron-equivalent entry point: process every weekly-digest recipient now.
    pub async fn run_weekly(&self) {
        self.run_all(Frequency::WeeklyDigest).await;
    }

    async fn run_all(&self, frequency: Frequency) {
        let preferences = match self
            .repository
            .find_preferences_by_digest_frequency(frequency)
            .await
        {
            Ok(preferences) => preferences,
            Err(e) => {
                error!(frequency = ?frequency, error = %e, "Failed to load digest preferences");
                return;
            }
        };

        let mut user_ids: Vec<String> =
            preferences.into_iter().map(|p| p.user_id).collect();
        user_ids.sort();
        user_ids.dedup();

        info!(frequency = ?frequency, users = user_ids.len(), "Running digest sweep");
        for user_id in user_ids {
            self.run_user_isolated(&user_id, frequency).await;
        }
    }

    /// Process one user under the per-user deadline; failures never
    /// propagate.
    async fn run_user_isolated(&self, user_id: &str, frequency: Frequency) {
        let result = tokio::time::timeout(
            self.config.per_user_timeout,
            self.process_user(user_id, frequency),
        )
        .instrument(courier_common::logging::digest_span(user_id))
        .await;

        match result {
            Ok(Ok(Some(tracking_id))) => {
                metrics::counter!("digest.sent").increment(1);
                debug!(user_id = %user_id, tracking_id = %tracking_id, "Digest dispatched");
            }
            Ok(Ok(None)) => {
                debug!(user_id = %user_id, "No digest content");
            }
            Ok(Err(e)) => {
                metrics::counter!("digest.errors").increment(1);
                error!(user_id = %user_id, error = %e, "Digest processing failed");
            }
            Err(_) => {
                metrics::counter!("digest.errors").increment(1);
                error!(user_id = %user_id, "Digest processing timed out");
            }
        }
    }

    /// Aggregate a user's deferred notifications into one digest email.
    ///
    /// Returns the tracking id of the enqueued digest, or `None` when the
    /// user had nothing to digest or is inside quiet hours.
    pub async fn process_user(
        &self,
        user_id: &str,
        frequency: Frequency,
    ) -> Result<Option<String>, DigestError> {
        let now = self.clock.now_utc();
        let cutoff = now - Self::window(frequency);

        // Quiet-hour suppression: skip this run entirely; the rows stay
        // undigested and are picked up by the next sweep.
        let local_time = (now
            + chrono::Duration::minutes(self.user_offset_minutes(user_id).await as i64))
        .time();
        if self
            .preferences
            .in_quiet_hours(user_id, NotificationType::DigestSummary, local_time)
            .await?
        {
            debug!(user_id = %user_id, "Recipient in quiet hours, skipping digest");
            return Ok(None);
        }

        let notifications = self
            .repository
            .find_unread_undigested_since(user_id, cutoff)
            .await?;
        if notifications.is_empty() {
            return Ok(None);
        }

        let total = notifications.len();
        let summary = self.build_summary(&notifications);
        let period = match frequency {
            Frequency::WeeklyDigest => "weekly",
            _ => "daily",
        };

        let request = courier_common::NotificationRequest::new(
            user_id,
            NotificationType::DigestSummary,
        )
        .with_channels(vec![Channel::Email])
        .with_variable("summary", summary)
        .with_variable("notification_count", total as i64)
        .with_variable("period", period);

        let tracking_id = self
            .pipeline
            .enqueue(request)
            .await
            .map_err(|e| DigestError::Pipeline(e.to_string()))?;

        // Mark every included row in one transactional step, all with the
        // same timestamp.
        let processed_at = self.clock.now_utc();
        let marked: Vec<Notification> = notifications
            .into_iter()
            .map(|mut n| {
                n.digest_processed_at = Some(processed_at);
                n
            })
            .collect();
        self.repository.save_all(marked).await?;

        Ok(Some(tracking_id))
    }

    /// Read-only inspection of the pending digest for a user.
    pub async fn summary(
        &self,
        user_id: &str,
        frequency: Frequency,
    ) -> Result<DigestSummary, DigestError> {
        let cutoff = self.clock.now_utc() - Self::window(frequency);
        let notifications = self
            .repository
            .find_unread_undigested_since(user_id, cutoff)
            .await?;

        let mut type_breakdown: BTreeMap<String, usize> = BTreeMap::new();
        for notification in &notifications {
            *type_breakdown
                .entry(notification.notification_type.to_string())
                .or_insert(0) += 1;
        }

        Ok(DigestSummary {
            total_count: notifications.len(),
            type_breakdown,
            cutoff,
        })
    }

    /// Type-grouped digest body: up to `items_per_type` titles per type plus
    /// an overflow indicator.
    fn build_summary(&self, notifications: &[Notification]) -> String {
        let mut grouped: BTreeMap<String, Vec<&Notification>> = BTreeMap::new();
        for notification in notifications {
            grouped
                .entry(notification.notification_type.to_string())
                .or_default()
                .push(notification);
        }

        let mut lines = Vec::new();
        for (type_name, mut rows) in grouped {
            rows.sort_by_key(|n| n.created_at);
            lines.push(format!("{} ({}):", type_name, rows.len()));
            for row in rows.iter().take(self.config.items_per_type) {
                lines.push(format!("  - {}", row.title));
            }
            if rows.len() > self.config.items_per_type {
                lines.push(format!(
                    "  ... and {} more",
                    rows.len() - self.config.items_per_type
                ));
            }
            lines.push(String::new());
        }
        lines.join("\n").trim_end().to_string()
    }

    fn window(frequency: Frequency) -> chrono::Duration {
        match frequency {
            Frequency::WeeklyDigest => chrono::Duration::days(7),
            _ => chrono::Duration::hours(24),
        }
    }

    async fn user_offset_minutes(&self, user_id: &str) -> i32 {
        match self.users.resolve(user_id).await {
            Ok(Some(resolved)) => resolved.info.utc_offset_minutes.unwrap_or(0),
            _ => 0,
        }
    }

    /// Whether this user's local due time has arrived and the run has not
    /// happened yet today.
    async fn due_now(&self, user_id: &str, frequency: Frequency) -> bool {
        let offset = self.user_offset_minutes(user_id).await;
        let local = self.clock.now_utc() + chrono::Duration::minutes(offset as i64);

        let due = match frequency {
            Frequency::DailyDigest => local.hour() == self.config.daily_hour,
            Frequency::WeeklyDigest => {
                local.weekday() == Weekday::Mon && local.hour() == self.config.weekly_hour
            }
            _ => false,
        };
        if !due {
            return false;
        }

        let key = (user_id.to_string(), frequency);
        let today = local.date_naive();
        if self.last_run.get(&key).map(|d| *d == today).unwrap_or(false) {
            return false;
        }
        self.last_run.insert(key, today);
        true
    }
}
