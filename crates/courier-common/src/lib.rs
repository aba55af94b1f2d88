use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub mod clock;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};

// ============================================================================
// Channels, priorities, frequencies
// ============================================================================

/// Delivery channel. The set is closed; per-channel handlers are registered
/// at pipeline construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    InApp,
    Email,
    Push,
}

impl Channel {
    pub fn all() -> [Channel; 3] {
        [Channel::InApp, Channel::Email, Channel::Push]
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::InApp => write!(f, "IN_APP"),
            Channel::Email => write!(f, "EMAIL"),
            Channel::Push => write!(f, "PUSH"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Delivery frequency for a (user, type) preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Immediate,
    Hourly,
    DailyDigest,
    WeeklyDigest,
    Off,
}

impl Frequency {
    /// Digest frequencies defer email delivery to the digest sweep.
    pub fn is_digest(&self) -> bool {
        matches!(self, Frequency::DailyDigest | Frequency::WeeklyDigest)
    }
}

impl Default for Frequency {
    fn default() -> Self {
        Frequency::Immediate
    }
}

// ============================================================================
// Notification types
// ============================================================================

/// Closed set of notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    PasswordReset,
    EmailVerification,
    SessionReminder,
    SecurityAlert,
    HiveActivity,
    HiveInvitation,
    WeeklySummary,
    Marketing,
    SystemAnnouncement,
    /// Aggregated digest email produced by the digest scheduler.
    DigestSummary,
}

impl NotificationType {
    pub fn all() -> &'static [NotificationType] {
        &[
            NotificationType::PasswordReset,
            NotificationType::EmailVerification,
            NotificationType::SessionReminder,
            NotificationType::SecurityAlert,
            NotificationType::HiveActivity,
            NotificationType::HiveInvitation,
            NotificationType::WeeklySummary,
            NotificationType::Marketing,
            NotificationType::SystemAnnouncement,
            NotificationType::DigestSummary,
        ]
    }

    /// Types whose templates are loaded eagerly at startup.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            NotificationType::PasswordReset
                | NotificationType::EmailVerification
                | NotificationType::SessionReminder
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::PasswordReset => "PASSWORD_RESET",
            NotificationType::EmailVerification => "EMAIL_VERIFICATION",
            NotificationType::SessionReminder => "SESSION_REMINDER",
            NotificationType::SecurityAlert => "SECURITY_ALERT",
            NotificationType::HiveActivity => "HIVE_ACTIVITY",
            NotificationType::HiveInvitation => "HIVE_INVITATION",
            NotificationType::WeeklySummary => "WEEKLY_SUMMARY",
            NotificationType::Marketing => "MARKETING",
            NotificationType::SystemAnnouncement => "SYSTEM_ANNOUNCEMENT",
            NotificationType::DigestSummary => "DIGEST_SUMMARY",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A request to deliver one notification to one user. Immutable after enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub id: String,
    pub user_id: String,
    pub notification_type: NotificationType,
    /// BCP-47 language tag, e.g. "en" or "de-AT".
    pub language: String,
    #[serde(default)]
    pub priority: Priority,
    /// Template variables; keys must cover the template's required set.
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    pub requested_channels: Vec<Channel>,
    pub created_at: DateTime<Utc>,
}

impl NotificationRequest {
    pub fn new(user_id: impl Into<String>, notification_type: NotificationType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            notification_type,
            language: "en".to_string(),
            priority: Priority::Normal,
            variables: HashMap::new(),
            requested_channels: vec![Channel::Email, Channel::InApp],
            created_at: Utc::now(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.requested_channels = channels;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Preferences
// ============================================================================

/// Per-(user, type) delivery preference. Exactly one row per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreference {
    pub user_id: String,
    pub notification_type: NotificationType,
    pub in_app_enabled: bool,
    pub email_enabled: bool,
    pub push_enabled: bool,
    pub frequency: Frequency,
    /// Quiet window start, user-local time of day.
    pub quiet_start: Option<NaiveTime>,
    /// Quiet window end; may be earlier than start (wraps past midnight).
    pub quiet_end: Option<NaiveTime>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationPreference {
    /// Per-type default used when no row exists yet.
    pub fn default_for(user_id: &str, notification_type: NotificationType) -> Self {
        let mut pref = Self {
            user_id: user_id.to_string(),
            notification_type,
            in_app_enabled: true,
            email_enabled: true,
            push_enabled: true,
            frequency: Frequency::Immediate,
            quiet_start: None,
            quiet_end: None,
            updated_at: Utc::now(),
        };
        match notification_type {
            NotificationType::Marketing => {
                pref.email_enabled = false;
                pref.push_enabled = false;
            }
            NotificationType::WeeklySummary => {
                pref.frequency = Frequency::WeeklyDigest;
            }
            NotificationType::HiveActivity => {
                pref.frequency = Frequency::DailyDigest;
                pref.push_enabled = false;
            }
            _ => {}
        }
        pref
    }

    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::InApp => self.in_app_enabled,
            Channel::Email => self.email_enabled,
            Channel::Push => self.push_enabled,
        }
    }
}

// ============================================================================
// Templates and rendered output
// ============================================================================

/// A message template keyed by (type, language).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub notification_type: NotificationType,
    pub language: String,
    pub subject: String,
    /// Plain-text body; must be non-empty.
    pub body_text: String,
    pub body_html: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Output of rendering a template against a variable map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedMessage {
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub variable_count: usize,
    pub processed_at: DateTime<Utc>,
}

// ============================================================================
// Stored notifications (in-app rows, digest source)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Unread,
    Read,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub notification_type: NotificationType,
    pub title: String,
    pub content: String,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    /// Set exactly once, when a digest sweep includes this row.
    pub digest_processed_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(
        user_id: impl Into<String>,
        notification_type: NotificationType,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            notification_type,
            title: title.into(),
            content: content.into(),
            status: NotificationStatus::Unread,
            created_at: Utc::now(),
            read_at: None,
            digest_processed_at: None,
        }
    }
}

// ============================================================================
// Delivery records
// ============================================================================

/// Lifecycle state of one delivery attempt chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Pending,
    Scheduled,
    Sending,
    Sent,
    Delivered,
    Bounced,
    Complained,
    Failed,
    DeadLetter,
}

impl DeliveryState {
    /// Terminal states are fixed points; no transition may leave them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered
                | DeliveryState::Bounced
                | DeliveryState::Complained
                | DeliveryState::Failed
                | DeliveryState::DeadLetter
        )
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryState::Pending => "PENDING",
            DeliveryState::Scheduled => "SCHEDULED",
            DeliveryState::Sending => "SENDING",
            DeliveryState::Sent => "SENT",
            DeliveryState::Delivered => "DELIVERED",
            DeliveryState::Bounced => "BOUNCED",
            DeliveryState::Complained => "COMPLAINED",
            DeliveryState::Failed => "FAILED",
            DeliveryState::DeadLetter => "DEAD_LETTER",
        };
        f.write_str(s)
    }
}

/// Compact enumerated reason attached to FAILED/SCHEDULED records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    Suppressed,
    RateLimited,
    MissingTemplate,
    MissingVariables,
    InvalidRecipient,
    UnknownUser,
    Cancelled,
    PermanentTransport,
    RetriesExhausted,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub state: DeliveryState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    /// 128-bit UUID in canonical hex form, returned from enqueue.
    pub tracking_id: String,
    pub notification_id: Option<String>,
    pub user_id: String,
    pub recipient: String,
    pub channel: Channel,
    pub state: DeliveryState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failure_reason: Option<FailureReason>,
    /// Transport message id once submitted, for callback correlation.
    pub message_id: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Timestamps for each state transition, oldest first.
    pub transitions: Vec<StateTransition>,
}

impl DeliveryRecord {
    pub fn new(user_id: impl Into<String>, recipient: impl Into<String>, channel: Channel) -> Self {
        let now = Utc::now();
        Self {
            tracking_id: uuid::Uuid::new_v4().to_string(),
            notification_id: None,
            user_id: user_id.into(),
            recipient: recipient.into(),
            channel,
            state: DeliveryState::Pending,
            attempts: 0,
            last_error: None,
            failure_reason: None,
            message_id: None,
            scheduled_for: None,
            created_at: now,
            updated_at: now,
            transitions: vec![StateTransition { state: DeliveryState::Pending, at: now }],
        }
    }
}

// ============================================================================
// Dead letters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterStatus {
    Pending,
    Processing,
    Retried,
    RetryFailed,
    Resolved,
    MaxRetriesExceeded,
    Expired,
}

/// Persistent record of a delivery that exhausted its retries. Retained for
/// inspection and manual retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub id: String,
    pub tracking_id: String,
    pub user_id: String,
    pub recipient: String,
    pub subject: String,
    pub content: String,
    pub error_message: String,
    pub retry_count: u32,
    pub status: DeadLetterStatus,
    /// UTC, RFC3339 on the wire.
    pub created_at: DateTime<Utc>,
    pub retried_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadLetterRecord {
    /// A record is retryable while PENDING or RETRY_FAILED and under the
    /// retry budget.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        matches!(self.status, DeadLetterStatus::Pending | DeadLetterStatus::RetryFailed)
            && self.retry_count < max_retries
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

/// Rate-limit operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateClass {
    Read,
    Write,
    Admin,
    Public,
}

impl RateClass {
    pub fn all() -> [RateClass; 4] {
        [RateClass::Read, RateClass::Write, RateClass::Admin, RateClass::Public]
    }
}

impl std::fmt::Display for RateClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RateClass::Read => "READ",
            RateClass::Write => "WRITE",
            RateClass::Admin => "ADMIN",
            RateClass::Public => "PUBLIC",
        };
        f.write_str(s)
    }
}

// ============================================================================
// User info
// ============================================================================

/// Contact information resolved from the identity service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Minutes east of UTC; None means unknown (treated as UTC).
    pub utc_offset_minutes: Option<i32>,
    pub email_verified: bool,
}
