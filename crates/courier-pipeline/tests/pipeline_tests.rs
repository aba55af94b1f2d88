//! Delivery pipeline integration tests.
//!
//! Exercises the end-to-end flow with an in-memory repository and a scripted
//! mail transport: happy path, suppression, digest deferral, quiet hours,
//! rate limiting, retries, circuit breaking, dead-lettering, and shutdown
//! draining.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveTime, TimeZone, Utc};
use parking_lot::Mutex;

use courier_common::{
    Channel, Clock, DeliveryState, FailureReason, Frequency, ManualClock, NotificationRequest,
    NotificationStatus, NotificationType, Priority, SystemClock, Template, UserInfo,
};
use courier_pipeline::{
    AuditLogger, CachedUserInfoProvider, ChannelHandlers, CircuitBreaker, CircuitBreakerConfig,
    DeliveryError, DeliveryPipeline, DeliveryPipelineConfig, InMemoryCounterStore,
    InMemoryNotificationRepository, MailTransport, NoOpPushSender, OutboundEmail,
    PipelineComponents, PipelineMetrics, PreferenceEngine, PreferenceUpdate, RateLimiter,
    RateLimiterConfig, RetryPolicy, StaticUserInfoProvider, StatusTracker, TransportError,
    TransportEvent,
};
use courier_template::{
    InMemoryTemplateRepository, RendererConfig, TemplateRenderer, TemplateRepository,
    TemplateStore, TemplateStoreConfig,
};

// ----------------------------------------------------------------------
// Scripted transport
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum SendPlan {
    Ok,
    Transient,
    Permanent,
    InvalidRecipient,
    Hang,
}

struct ScriptedTransport {
    /// Planned outcomes, consumed front to back; empty means Ok.
    script: Mutex<VecDeque<SendPlan>>,
    calls: AtomicU32,
    sent: Mutex<Vec<OutboundEmail>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn plan(&self, plans: &[SendPlan]) {
        self.script.lock().extend(plans.iter().copied());
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let plan = self.script.lock().pop_front().unwrap_or(SendPlan::Ok);
        match plan {
            SendPlan::Ok => {
                self.sent.lock().push(email.clone());
                Ok(uuid::Uuid::new_v4().to_string())
            }
            SendPlan::Transient => Err(TransportError::Transient("503 service unavailable".into())),
            SendPlan::Permanent => Err(TransportError::Permanent("550 mailbox unavailable".into())),
            SendPlan::InvalidRecipient => {
                Err(TransportError::InvalidRecipient("no such user".into()))
            }
            SendPlan::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("never".into())
            }
        }
    }
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

struct Harness {
    pipeline: Arc<DeliveryPipeline>,
    transport: Arc<ScriptedTransport>,
    repository: Arc<InMemoryNotificationRepository>,
    tracker: Arc<StatusTracker>,
    preferences: Arc<PreferenceEngine>,
    metrics: Arc<PipelineMetrics>,
}

struct HarnessOptions {
    clock: Arc<dyn Clock>,
    pipeline: DeliveryPipelineConfig,
    rate_limit: RateLimiterConfig,
    breaker: CircuitBreakerConfig,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            pipeline: DeliveryPipelineConfig {
                workers: 4,
                queue_capacity: 100,
                accept_timeout: Duration::from_millis(50),
                transport_timeout: Duration::from_millis(500),
                send_rate_per_minute: None,
                retry: RetryPolicy {
                    max_attempts: 3,
                    base: Duration::from_millis(20),
                    multiplier: 2.0,
                    cap: Duration::from_millis(100),
                    jitter: 0.0,
                },
            },
            rate_limit: RateLimiterConfig::default(),
            breaker: CircuitBreakerConfig {
                min_calls: 1_000, // effectively disabled unless a test lowers it
                ..CircuitBreakerConfig::default()
            },
        }
    }
}

async fn build_harness(options: HarnessOptions) -> Harness {
    let clock = options.clock;
    let audit = Arc::new(AuditLogger::default());
    let repository = Arc::new(InMemoryNotificationRepository::new());
    let template_repository = Arc::new(InMemoryTemplateRepository::new());

    // Seed the templates the tests rely on.
    for (notification_type, subject, body) in [
        (
            NotificationType::PasswordReset,
            "Reset your password",
            "Click {{link}} to reset your password.",
        ),
        (
            NotificationType::SessionReminder,
            "Session starting soon",
            "Your session {{session}} starts soon.",
        ),
        (
            NotificationType::HiveActivity,
            "Activity in {{hive}}",
            "There is new activity in {{hive}}.",
        ),
        (
            NotificationType::DigestSummary,
            "Your {{period}} summary",
            "You have {{notification_count}} notifications.\n\n{{summary}}",
        ),
    ] {
        template_repository
            .save(Template {
                notification_type,
                language: "en".into(),
                subject: subject.into(),
                body_text: body.into(),
                body_html: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let renderer = Arc::new(TemplateRenderer::new(RendererConfig::default()));
    let templates = Arc::new(TemplateStore::new(
        TemplateStoreConfig::default(),
        template_repository,
        renderer,
    ));

    let transport = ScriptedTransport::new();
    let breaker = Arc::new(CircuitBreaker::new("mail", options.breaker));
    let rate_limiter = Arc::new(RateLimiter::new(
        options.rate_limit,
        Arc::new(InMemoryCounterStore::new(clock.clone())),
        clock.clone(),
        audit.clone(),
    ));

    let users = Arc::new(CachedUserInfoProvider::new(
        Arc::new(
            StaticUserInfoProvider::new()
                .with_user(UserInfo {
                    user_id: "u-1".into(),
                    email: Some("u-1@example.com".into()),
                    phone: None,
                    utc_offset_minutes: Some(0),
                    email_verified: true,
                })
                .with_user(UserInfo {
                    user_id: "u-2".into(),
                    email: Some("u-2@example.com".into()),
                    phone: None,
                    utc_offset_minutes: Some(0),
                    email_verified: true,
                })
                .with_user(UserInfo {
                    user_id: "no-email".into(),
                    email: None,
                    phone: None,
                    utc_offset_minutes: Some(0),
                    email_verified: false,
                }),
        ),
        Duration::from_secs(300),
    ));

    let preferences = Arc::new(PreferenceEngine::new(repository.clone(), audit.clone()));
    let tracker = Arc::new(StatusTracker::new(repository.clone(), clock.clone()));
    let metrics = Arc::new(PipelineMetrics::new());
    let handlers = Arc::new(ChannelHandlers::new(
        transport.clone(),
        Arc::new(NoOpPushSender),
        repository.clone(),
    ));

    let pipeline = DeliveryPipeline::new(
        options.pipeline,
        PipelineComponents {
            preferences: preferences.clone(),
            rate_limiter,
            breaker,
            templates,
            handlers,
            tracker: tracker.clone(),
            users,
            repository: repository.clone(),
            metrics: metrics.clone(),
            audit,
            clock,
        },
    );
    pipeline.start();

    Harness {
        pipeline,
        transport,
        repository,
        tracker,
        preferences,
        metrics,
    }
}

async fn default_harness() -> Harness {
    build_harness(HarnessOptions::default()).await
}

/// Poll until the record reaches `state` or the timeout expires.
async fn wait_for_state(harness: &Harness, tracking_id: &str, state: DeliveryState) {
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(record) = harness.pipeline.status(tracking_id).await {
            if record.state == state {
                return;
            }
        }
        if std::time::Instant::now() > deadline {
            let current = harness
                .pipeline
                .status(tracking_id)
                .await
                .map(|r| r.state.to_string());
            panic!("timed out waiting for {state}, current state: {current:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn password_reset(user_id: &str) -> NotificationRequest {
    NotificationRequest::new(user_id, NotificationType::PasswordReset)
        .with_channels(vec![Channel::Email])
        .with_variable("link", "https://x/reset?t=ab")
}

// ----------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------

#[tokio::test]
async fn happy_path_email_reaches_delivered() {
    let harness = default_harness().await;

    let tracking_id = harness.pipeline.enqueue(password_reset("u-1")).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Sent).await;

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(record.recipient, "u-1@example.com");
    let message_id = record.message_id.unwrap();

    // Transport callback finishes the lifecycle.
    harness
        .tracker
        .on_transport_callback(&message_id, TransportEvent::Delivered)
        .await
        .unwrap();
    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.state, DeliveryState::Delivered);

    // The rendered body carried the variable.
    let sent = harness.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body_text.contains("https://x/reset?t=ab"));
    assert_eq!(sent[0].subject, "Reset your password");

    assert_eq!(harness.metrics.snapshot().total_sent, 1);
}

#[tokio::test]
async fn frequency_off_suppresses_delivery() {
    let harness = default_harness().await;
    harness
        .preferences
        .upsert(
            "u-1",
            NotificationType::PasswordReset,
            PreferenceUpdate {
                frequency: Some(Frequency::Off),
                ..PreferenceUpdate::default()
            },
        )
        .await
        .unwrap();

    let tracking_id = harness.pipeline.enqueue(password_reset("u-1")).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Failed).await;

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.failure_reason, Some(FailureReason::Suppressed));
    assert_eq!(harness.transport.calls(), 0);
}

#[tokio::test]
async fn disabled_channel_suppresses_delivery() {
    let harness = default_harness().await;
    harness
        .preferences
        .upsert(
            "u-1",
            NotificationType::PasswordReset,
            PreferenceUpdate {
                email_enabled: Some(false),
                ..PreferenceUpdate::default()
            },
        )
        .await
        .unwrap();

    let tracking_id = harness.pipeline.enqueue(password_reset("u-1")).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Failed).await;

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.failure_reason, Some(FailureReason::Suppressed));
}

#[tokio::test]
async fn missing_template_fails_without_retry() {
    let harness = default_harness().await;

    // No MARKETING template was seeded.
    let request = NotificationRequest::new("u-1", NotificationType::Marketing)
        .with_channels(vec![Channel::InApp]);
    let tracking_id = harness.pipeline.enqueue(request).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Failed).await;

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.failure_reason, Some(FailureReason::MissingTemplate));
    assert_eq!(record.attempts, 0);
}

#[tokio::test]
async fn missing_variables_fail_without_retry() {
    let harness = default_harness().await;

    let request = NotificationRequest::new("u-1", NotificationType::PasswordReset)
        .with_channels(vec![Channel::Email]);
    let tracking_id = harness.pipeline.enqueue(request).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Failed).await;

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.failure_reason, Some(FailureReason::MissingVariables));
    assert!(record.last_error.unwrap().contains("link"));
    assert_eq!(harness.transport.calls(), 0);
}

#[tokio::test]
async fn digest_preference_defers_email_and_stores_row() {
    let harness = default_harness().await;
    harness
        .preferences
        .upsert(
            "u-1",
            NotificationType::HiveActivity,
            PreferenceUpdate {
                frequency: Some(Frequency::DailyDigest),
                ..PreferenceUpdate::default()
            },
        )
        .await
        .unwrap();

    let request = NotificationRequest::new("u-1", NotificationType::HiveActivity)
        .with_channels(vec![Channel::Email])
        .with_variable("hive", "rust-hive");
    let tracking_id = harness.pipeline.enqueue(request).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Scheduled).await;

    // No email went out; a notification row backs the future digest.
    assert_eq!(harness.transport.calls(), 0);
    let rows = harness.repository.notifications_for("u-1");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, NotificationStatus::Unread);
    assert!(rows[0].digest_processed_at.is_none());
    assert_eq!(rows[0].title, "Activity in rust-hive");
}

#[tokio::test]
async fn quiet_hours_defer_normal_priority() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 23, 30, 0).unwrap());
    let harness = build_harness(HarnessOptions {
        clock: clock.clone(),
        ..HarnessOptions::default()
    })
    .await;

    harness
        .preferences
        .upsert(
            "u-1",
            NotificationType::SessionReminder,
            PreferenceUpdate {
                quiet_start: Some(Some(NaiveTime::from_hms_opt(22, 0, 0).unwrap())),
                quiet_end: Some(Some(NaiveTime::from_hms_opt(7, 0, 0).unwrap())),
                ..PreferenceUpdate::default()
            },
        )
        .await
        .unwrap();

    let request = NotificationRequest::new("u-1", NotificationType::SessionReminder)
        .with_channels(vec![Channel::Email])
        .with_variable("session", "standup");
    let tracking_id = harness.pipeline.enqueue(request).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Scheduled).await;

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    let scheduled_for = record.scheduled_for.unwrap();
    assert_eq!(
        scheduled_for,
        Utc.with_ymd_and_hms(2025, 6, 2, 7, 0, 0).unwrap()
    );
    assert_eq!(harness.transport.calls(), 0);
}

#[tokio::test]
async fn critical_priority_ignores_quiet_hours() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 23, 30, 0).unwrap());
    let harness = build_harness(HarnessOptions {
        clock,
        ..HarnessOptions::default()
    })
    .await;

    harness
        .preferences
        .upsert(
            "u-1",
            NotificationType::SessionReminder,
            PreferenceUpdate {
                quiet_start: Some(Some(NaiveTime::from_hms_opt(22, 0, 0).unwrap())),
                quiet_end: Some(Some(NaiveTime::from_hms_opt(7, 0, 0).unwrap())),
                ..PreferenceUpdate::default()
            },
        )
        .await
        .unwrap();

    let request = NotificationRequest::new("u-1", NotificationType::SessionReminder)
        .with_channels(vec![Channel::Email])
        .with_priority(Priority::Critical)
        .with_variable("session", "incident-bridge");
    let tracking_id = harness.pipeline.enqueue(request).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Sent).await;
}

#[tokio::test]
async fn rate_limited_delivery_fails_with_hint() {
    let harness = build_harness(HarnessOptions {
        rate_limit: RateLimiterConfig {
            write_limit: 2,
            ..RateLimiterConfig::default()
        },
        ..HarnessOptions::default()
    })
    .await;

    let mut tracking_ids = Vec::new();
    for _ in 0..3 {
        tracking_ids.push(harness.pipeline.enqueue(password_reset("u-1")).await.unwrap());
    }

    // Wait until all three records settle.
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        let mut settled = 0;
        for id in &tracking_ids {
            if let Some(record) = harness.pipeline.status(id).await {
                if record.state.is_terminal() || record.state == DeliveryState::Sent {
                    settled += 1;
                }
            }
        }
        if settled == 3 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "records did not settle");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut sent = 0;
    let mut limited = 0;
    for id in &tracking_ids {
        let record = harness.pipeline.status(id).await.unwrap();
        match record.state {
            DeliveryState::Sent => sent += 1,
            DeliveryState::Failed => {
                assert_eq!(record.failure_reason, Some(FailureReason::RateLimited));
                assert!(record.last_error.unwrap().contains("retry after"));
                limited += 1;
            }
            other => panic!("unexpected state {other}"),
        }
    }
    assert_eq!(sent, 2);
    assert_eq!(limited, 1);
}

#[tokio::test]
async fn transient_failures_retry_then_recover() {
    let harness = default_harness().await;
    harness
        .transport
        .plan(&[SendPlan::Transient, SendPlan::Transient, SendPlan::Ok]);

    let tracking_id = harness.pipeline.enqueue(password_reset("u-1")).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Sent).await;

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.attempts, 3);
    assert_eq!(harness.transport.calls(), 3);
    assert_eq!(harness.metrics.snapshot().total_retried, 2);
}

#[tokio::test]
async fn exhausted_retries_dead_letter() {
    let harness = default_harness().await;
    harness
        .transport
        .plan(&[SendPlan::Transient, SendPlan::Transient, SendPlan::Transient]);

    let tracking_id = harness.pipeline.enqueue(password_reset("u-1")).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::DeadLetter).await;

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.attempts, 3);

    let dead_letters = harness.repository.dead_letters();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].tracking_id, tracking_id);
    assert_eq!(dead_letters[0].recipient, "u-1@example.com");
    assert!(dead_letters[0].error_message.contains("503"));
    assert_eq!(harness.metrics.snapshot().total_dead_lettered, 1);
}

#[tokio::test]
async fn permanent_failure_does_not_retry() {
    let harness = default_harness().await;
    harness.transport.plan(&[SendPlan::Permanent]);

    let tracking_id = harness.pipeline.enqueue(password_reset("u-1")).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Failed).await;

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(record.failure_reason, Some(FailureReason::PermanentTransport));
    assert_eq!(harness.transport.calls(), 1);
    assert!(harness.repository.dead_letters().is_empty());
}

#[tokio::test]
async fn invalid_recipient_fails_terminally() {
    let harness = default_harness().await;
    harness.transport.plan(&[SendPlan::InvalidRecipient]);

    let tracking_id = harness.pipeline.enqueue(password_reset("u-1")).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Failed).await;

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.failure_reason, Some(FailureReason::InvalidRecipient));
}

#[tokio::test]
async fn user_without_email_fails_on_email_channel() {
    let harness = default_harness().await;

    let tracking_id = harness
        .pipeline
        .enqueue(password_reset("no-email"))
        .await
        .unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Failed).await;

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.failure_reason, Some(FailureReason::InvalidRecipient));
}

#[tokio::test]
async fn unknown_user_fails_terminally() {
    let harness = default_harness().await;

    let tracking_id = harness.pipeline.enqueue(password_reset("ghost")).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Failed).await;

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.failure_reason, Some(FailureReason::UnknownUser));
}

#[tokio::test]
async fn in_app_only_request_completes_without_transport() {
    let harness = default_harness().await;

    let request = NotificationRequest::new("u-1", NotificationType::HiveActivity)
        .with_channels(vec![Channel::InApp])
        .with_variable("hive", "rust-hive");
    let tracking_id = harness.pipeline.enqueue(request).await.unwrap();
    wait_for_state(&harness, &tracking_id, DeliveryState::Sent).await;

    assert_eq!(harness.transport.calls(), 0);
    let rows = harness.repository.notifications_for("u-1");
    assert_eq!(rows.len(), 1);

    let record = harness.pipeline.status(&tracking_id).await.unwrap();
    assert_eq!(record.notification_id.as_deref(), Some(rows[0].id.as_str()));
}

#[tokio::test]
async fn circuit_opens_then_recovers_and_drains() {
    let harness = build_harness(HarnessOptions {
        breaker: CircuitBreakerConfig {
            min_calls: 5,
            failure_rate: 0.5,
            cooldown: Duration::from_millis(100),
            probe_count: 2,
            ..CircuitBreakerConfig::default()
        },
        pipeline: DeliveryPipelineConfig {
            workers: 4,
            queue_capacity: 100,
            accept_timeout: Duration::from_millis(50),
            transport_timeout: Duration::from_millis(500),
            send_rate_per_minute: None,
            retry: RetryPolicy {
                max_attempts: 10,
                base: Duration::from_millis(40),
                multiplier: 1.5,
                cap: Duration::from_millis(200),
                jitter: 0.0,
            },
        },
        ..HarnessOptions::default()
    })
    .await;

    // Enough transient failures to trip the breaker, then recovery.
    harness.transport.plan(&[
        SendPlan::Transient,
        SendPlan::Transient,
        SendPlan::Transient,
        SendPlan::Transient,
        SendPlan::Transient,
        SendPlan::Transient,
        SendPlan::Transient,
    ]);

    let mut tracking_ids = Vec::new();
    for user in ["u-1", "u-2"] {
        for _ in 0..3 {
            tracking_ids.push(harness.pipeline.enqueue(password_reset(user)).await.unwrap());
        }
    }

    // With retries queued behind the open breaker, everything eventually
    // drains once the cooldown passes and probes succeed.
    for tracking_id in &tracking_ids {
        wait_for_state(&harness, tracking_id, DeliveryState::Sent).await;
    }
}

#[tokio::test]
async fn overload_rejects_when_queue_full() {
    let harness = build_harness(HarnessOptions {
        pipeline: DeliveryPipelineConfig {
            workers: 1,
            queue_capacity: 1,
            accept_timeout: Duration::from_millis(30),
            transport_timeout: Duration::from_secs(60),
            send_rate_per_minute: None,
            retry: RetryPolicy::default(),
        },
        ..HarnessOptions::default()
    })
    .await;
    harness
        .transport
        .plan(&[SendPlan::Hang, SendPlan::Hang, SendPlan::Hang, SendPlan::Hang]);

    let mut overloaded = 0;
    for _ in 0..4 {
        if let Err(DeliveryError::Overloaded) =
            harness.pipeline.enqueue(password_reset("u-1")).await
        {
            overloaded += 1;
        }
    }
    assert!(overloaded >= 1, "expected at least one Overloaded rejection");
}

#[tokio::test]
async fn enqueue_batch_returns_tracking_per_recipient() {
    let harness = default_harness().await;

    let accepted = harness
        .pipeline
        .enqueue_batch(vec![password_reset("u-1"), password_reset("u-2")])
        .await;

    assert_eq!(accepted.len(), 2);
    for tracking_id in accepted.values() {
        wait_for_state(&harness, tracking_id, DeliveryState::Sent).await;
    }
}

#[tokio::test]
async fn validation_errors_surface_synchronously() {
    let harness = default_harness().await;

    let mut request = password_reset("u-1");
    request.user_id = String::new();
    assert!(matches!(
        harness.pipeline.enqueue(request).await,
        Err(DeliveryError::Validation(_))
    ));

    let mut request = password_reset("u-1");
    request.requested_channels.clear();
    assert!(matches!(
        harness.pipeline.enqueue(request).await,
        Err(DeliveryError::Validation(_))
    ));
}

#[tokio::test]
async fn shutdown_flushes_unprocessed_queue_to_dead_letters() {
    let harness = build_harness(HarnessOptions {
        pipeline: DeliveryPipelineConfig {
            workers: 1,
            queue_capacity: 50,
            accept_timeout: Duration::from_millis(50),
            transport_timeout: Duration::from_secs(60),
            send_rate_per_minute: None,
            retry: RetryPolicy::default(),
        },
        ..HarnessOptions::default()
    })
    .await;
    // The single worker wedges on the first send; the rest stay queued.
    harness.transport.plan(&[SendPlan::Hang]);

    for _ in 0..5 {
        let _ = harness.pipeline.enqueue(password_reset("u-1")).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.pipeline.shutdown(Duration::from_millis(100)).await;

    // Everything still queued was flushed to PENDING dead letters.
    assert!(!harness.repository.dead_letters().is_empty());
}

#[tokio::test]
async fn enqueue_after_shutdown_is_rejected() {
    let harness = default_harness().await;
    harness.pipeline.shutdown(Duration::from_millis(50)).await;

    assert!(matches!(
        harness.pipeline.enqueue(password_reset("u-1")).await,
        Err(DeliveryError::Overloaded)
    ));
}
