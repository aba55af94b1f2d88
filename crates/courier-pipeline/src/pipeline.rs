//! DeliveryPipeline - the central orchestrator.
//!
//! Requests enter a bounded in-memory queue and are consumed by a fixed
//! worker pool. Each request is gated through preferences, quiet hours, rate
//! limits, and the circuit breaker, rendered, and dispatched to its channel
//! handlers. Transient transport failures re-enter the queue on a backoff
//! due-time (workers never sleep on a backoff); exhausted retries land in
//! the dead-letter queue.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

use courier_common::{
    Channel, Clock, DeadLetterRecord, DeadLetterStatus, DeliveryRecord, DeliveryState,
    NotificationRequest, Priority, RateClass, RenderedMessage,
};
use courier_template::{TemplateError, TemplateStore};

use crate::audit::AuditLogger;
use crate::breaker::{BreakerError, CircuitBreaker};
use crate::channel::ChannelHandlers;
use crate::error::DeliveryError;
use crate::metrics::PipelineMetrics;
use crate::preference::PreferenceEngine;
use crate::ratelimit::RateLimiter;
use crate::repository::NotificationRepository;
use crate::status::StatusTracker;
use crate::transport::{OutboundEmail, TransportError};
use crate::userinfo::CachedUserInfoProvider;

type SendSmoother = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Retry policy: exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    /// Jitter fraction, e.g. 0.2 for +/-20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next attempt, given the attempts already made.
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1) as i32;
        let raw = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.cap.as_millis() as f64);
        let factor = 1.0 + self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_millis((capped * factor).max(0.0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryPipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// How long enqueue may block before returning Overloaded.
    pub accept_timeout: Duration,
    pub transport_timeout: Duration,
    /// Optional outbound smoothing towards the mail relay.
    pub send_rate_per_minute: Option<u32>,
    pub retry: RetryPolicy,
}

impl Default for DeliveryPipelineConfig {
    fn default() -> Self {
        Self {
            workers: 32,
            queue_capacity: 10_000,
            accept_timeout: Duration::from_millis(50),
            transport_timeout: Duration::from_secs(5),
            send_rate_per_minute: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Collaborators wired in by the composition root.
pub struct PipelineComponents {
    pub preferences: Arc<PreferenceEngine>,
    pub rate_limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub templates: Arc<TemplateStore>,
    pub handlers: Arc<ChannelHandlers>,
    pub tracker: Arc<StatusTracker>,
    pub users: Arc<CachedUserInfoProvider>,
    pub repository: Arc<dyn NotificationRepository>,
    pub metrics: Arc<PipelineMetrics>,
    pub audit: Arc<AuditLogger>,
    pub clock: Arc<dyn Clock>,
}

/// Work consumed by the pool: fresh requests, and resumed sends re-entering
/// after a retry backoff or a quiet-hours deferral.
enum WorkItem {
    Fresh(Box<FreshWork>),
    Send(Box<SendWork>),
}

struct FreshWork {
    request: NotificationRequest,
    tracking_id: String,
    deadline: Option<Instant>,
}

struct SendWork {
    tracking_id: String,
    user_id: String,
    email: OutboundEmail,
    deadline: Option<Instant>,
}

pub struct DeliveryPipeline {
    config: DeliveryPipelineConfig,
    components: PipelineComponents,

    /// Self-handle for delay tasks spawned by workers.
    me: Weak<DeliveryPipeline>,

    tx: mpsc::Sender<WorkItem>,
    /// Shared by workers; also used by shutdown to flush leftovers.
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,

    accepting: AtomicBool,
    queue_depth: AtomicUsize,
    in_flight: AtomicUsize,

    send_smoother: Option<Arc<SendSmoother>>,

    shutdown_tx: watch::Sender<bool>,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DeliveryPipeline {
    pub fn new(config: DeliveryPipelineConfig, components: PipelineComponents) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);

        let send_smoother = config.send_rate_per_minute.and_then(|rpm| {
            NonZeroU32::new(rpm)
                .map(|nz| Arc::new(governor::RateLimiter::direct(Quota::per_minute(nz))))
        });

        Arc::new_cyclic(|me| Self {
            config,
            components,
            me: me.clone(),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            accepting: AtomicBool::new(true),
            queue_depth: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            send_smoother,
            shutdown_tx,
            worker_handles: Mutex::new(Vec::new()),
        })
    }

    /// Start the worker pool.
    pub fn start(&self) {
        let this = match self.me.upgrade() {
            Some(this) => this,
            None => return,
        };
        let mut handles = self.worker_handles.lock();
        if !handles.is_empty() {
            return;
        }
        info!(
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "Starting delivery pipeline"
        );
        for worker_id in 0..self.config.workers {
            let pipeline = Arc::clone(&this);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    let item = {
                        let mut rx = pipeline.rx.lock().await;
                        tokio::select! {
                            item = rx.recv() => item,
                            _ = shutdown_rx.changed() => continue,
                        }
                    };
                    match item {
                        Some(item) => pipeline.process(item).await,
                        None => break,
                    }
                }
                debug!(worker_id = worker_id, "Pipeline worker exited");
            }));
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Enqueue a request. Returns the tracking id synchronously; blocks at
    /// most the accept timeout under backpressure before failing with
    /// `Overloaded`.
    pub async fn enqueue(&self, request: NotificationRequest) -> Result<String, DeliveryError> {
        self.enqueue_with_deadline(request, None).await
    }

    /// Enqueue with an explicit processing deadline. Work still pending when
    /// the deadline passes fails with reason CANCELLED.
    pub async fn enqueue_with_deadline(
        &self,
        request: NotificationRequest,
        deadline: Option<Instant>,
    ) -> Result<String, DeliveryError> {
        let accept_start = Instant::now();

        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DeliveryError::Overloaded);
        }
        if request.user_id.is_empty() {
            return Err(DeliveryError::Validation("userId must not be empty".into()));
        }
        if request.requested_channels.is_empty() {
            return Err(DeliveryError::Validation(
                "requestedChannels must not be empty".into(),
            ));
        }
        if request.language.is_empty() {
            return Err(DeliveryError::Validation("language must not be empty".into()));
        }

        let primary = if request.requested_channels.contains(&Channel::Email) {
            Channel::Email
        } else {
            request.requested_channels[0]
        };

        let record = self
            .components
            .tracker
            .create(&request.user_id, &request.user_id, primary);
        let tracking_id = record.tracking_id.clone();

        let item = WorkItem::Fresh(Box::new(FreshWork {
            request,
            tracking_id: tracking_id.clone(),
            deadline,
        }));

        match self.tx.send_timeout(item, self.config.accept_timeout).await {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::SeqCst);
                metrics::gauge!("pipeline.queue_depth")
                    .set(self.queue_depth.load(Ordering::SeqCst) as f64);
                metrics::histogram!("queue.accept")
                    .record(accept_start.elapsed().as_secs_f64() * 1_000.0);
                Ok(tracking_id)
            }
            Err(_) => {
                self.components.tracker.discard(&tracking_id);
                warn!("Pipeline queue full, rejecting enqueue");
                Err(DeliveryError::Overloaded)
            }
        }
    }

    /// Enqueue a batch; returns recipient -> tracking id for accepted
    /// requests.
    pub async fn enqueue_batch(
        &self,
        requests: Vec<NotificationRequest>,
    ) -> std::collections::HashMap<String, String> {
        let mut accepted = std::collections::HashMap::new();
        for request in requests {
            let user_id = request.user_id.clone();
            match self.enqueue(request).await {
                Ok(tracking_id) => {
                    accepted.insert(user_id, tracking_id);
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Batch enqueue entry rejected");
                }
            }
        }
        accepted
    }

    /// Delivery record lookup by tracking id.
    pub async fn status(&self, tracking_id: &str) -> Option<DeliveryRecord> {
        self.components.tracker.get(tracking_id).await.ok().flatten()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting, wait for in-flight work up to `drain_timeout`, then
    /// flush whatever is still queued to the dead-letter queue.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        info!("Pipeline shutdown requested, draining");
        self.accepting.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + drain_timeout;
        while Instant::now() < deadline {
            if self.queue_depth.load(Ordering::SeqCst) == 0
                && self.in_flight.load(Ordering::SeqCst) == 0
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let _ = self.shutdown_tx.send(true);

        // Flush undrained entries to the DLQ as PENDING, best effort.
        let mut flushed = 0usize;
        {
            let mut rx = self.rx.lock().await;
            while let Ok(item) = rx.try_recv() {
                self.queue_depth.fetch_sub(1, Ordering::SeqCst);
                self.flush_to_dead_letter(item).await;
                flushed += 1;
            }
        }
        if flushed > 0 {
            warn!(flushed = flushed, "Flushed undrained queue entries to dead letters");
        }

        // Workers that are past the deadline and still wedged on a transport
        // call are aborted; their records keep their last transient state.
        let handles: Vec<_> = self.worker_handles.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        info!("Pipeline shutdown complete");
    }

    // ------------------------------------------------------------------
    // Worker internals
    // ------------------------------------------------------------------

    async fn process(&self, item: WorkItem) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.queue_depth.fetch_sub(1, Ordering::SeqCst);
        metrics::gauge!("pipeline.queue_depth")
            .set(self.queue_depth.load(Ordering::SeqCst) as f64);

        // All events below correlate on the tracking id via the span.
        let span = match &item {
            WorkItem::Fresh(work) => {
                courier_common::logging::delivery_span(&work.tracking_id, &work.request.user_id)
            }
            WorkItem::Send(work) => {
                courier_common::logging::delivery_span(&work.tracking_id, &work.user_id)
            }
        };

        let started = Instant::now();
        async {
            match item {
                WorkItem::Fresh(work) => self.process_fresh(*work, started).await,
                WorkItem::Send(work) => self.process_send(*work, started).await,
            }
        }
        .instrument(span)
        .await;
        metrics::histogram!("pipeline.process").record(started.elapsed().as_secs_f64() * 1_000.0);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn process_fresh(&self, work: FreshWork, started: Instant) {
        let tracking_id = work.tracking_id.clone();
        let request = &work.request;

        if Self::deadline_passed(work.deadline) {
            self.fail(&tracking_id, DeliveryError::Cancelled, started).await;
            return;
        }

        // Preference gate.
        let preference = match self
            .components
            .preferences
            .get(&request.user_id, request.notification_type)
            .await
        {
            Ok(preference) => preference,
            Err(e) => {
                self.fail(&tracking_id, DeliveryError::Internal(e.to_string()), started).await;
                return;
            }
        };

        if preference.frequency == courier_common::Frequency::Off {
            self.fail(&tracking_id, DeliveryError::Suppressed, started).await;
            return;
        }

        let effective: Vec<Channel> = request
            .requested_channels
            .iter()
            .copied()
            .filter(|channel| preference.channel_enabled(*channel))
            .collect();
        if effective.is_empty() {
            self.fail(&tracking_id, DeliveryError::Suppressed, started).await;
            return;
        }

        // Recipient resolution; the pipeline tolerates unknown users.
        let resolved = match self.components.users.resolve(&request.user_id).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                self.fail(
                    &tracking_id,
                    DeliveryError::UnknownUser(request.user_id.clone()),
                    started,
                )
                .await;
                return;
            }
            Err(e) => {
                self.fail(&tracking_id, DeliveryError::Internal(e.to_string()), started).await;
                return;
            }
        };
        if let Some(email) = &resolved.info.email {
            self.components.tracker.set_recipient(&tracking_id, email);
        }

        // Digest classification: store instead of emailing. Digest-bound
        // work is never quiet-hour deferred; the sweep applies its own
        // quiet-hour check at send time.
        let digest_email = preference.frequency.is_digest() && effective.contains(&Channel::Email);

        // Quiet hours: defer non-critical work until the window ends.
        if !digest_email && request.priority < Priority::Critical {
            if let (Some(start), Some(end)) = (preference.quiet_start, preference.quiet_end) {
                let offset_minutes = resolved.info.utc_offset_minutes.unwrap_or(0);
                let now = self.components.clock.now_utc();
                let local_now = now + chrono::Duration::minutes(offset_minutes as i64);
                if crate::preference::quiet_window_contains(start, end, local_now.time()) {
                    let resume_at = Self::next_quiet_end(local_now, end, offset_minutes);
                    self.defer_until(work, resume_at).await;
                    return;
                }
            }
        }

        // Template acquisition and rendering.
        let rendered = match self.render(request).await {
            Ok(rendered) => rendered,
            Err(e) => {
                self.fail(&tracking_id, e, started).await;
                return;
            }
        };

        if digest_email {
            // Persist the row the digest sweep aggregates; no inline email.
            match self
                .components
                .handlers
                .deliver_in_app(&request.user_id, request.notification_type, &rendered)
                .await
            {
                Ok(notification) => {
                    self.components
                        .tracker
                        .set_notification_id(&tracking_id, &notification.id);
                }
                Err(e) => {
                    self.fail(&tracking_id, DeliveryError::Internal(e.to_string()), started).await;
                    return;
                }
            }
            if effective.contains(&Channel::Push) {
                if let Err(e) = self
                    .components
                    .handlers
                    .deliver_push(&request.user_id, &rendered)
                    .await
                {
                    warn!(tracking_id = %tracking_id, error = %e, "Push delivery failed");
                }
            }
            let _ = self
                .components
                .tracker
                .transition(&tracking_id, DeliveryState::Scheduled)
                .await;
            debug!(tracking_id = %tracking_id, "Email deferred for digest");
            return;
        }

        // Rate limit on the write class.
        let decision = self
            .components
            .rate_limiter
            .allow(&request.user_id, RateClass::Write)
            .await;
        if !decision.allowed {
            self.components.tracker.set_error(
                &tracking_id,
                &format!("rate limited, retry after {}", decision.reset_at.to_rfc3339()),
                None,
            );
            self.fail(
                &tracking_id,
                DeliveryError::RateLimited { retry_after: decision.reset_at },
                started,
            )
            .await;
            return;
        }

        // In-app delivery persists an inbox row.
        if effective.contains(&Channel::InApp) {
            match self
                .components
                .handlers
                .deliver_in_app(&request.user_id, request.notification_type, &rendered)
                .await
            {
                Ok(notification) => {
                    self.components
                        .tracker
                        .set_notification_id(&tracking_id, &notification.id);
                }
                Err(e) => {
                    warn!(tracking_id = %tracking_id, error = %e, "In-app delivery failed");
                }
            }
        }

        if effective.contains(&Channel::Push) {
            if let Err(e) = self
                .components
                .handlers
                .deliver_push(&request.user_id, &rendered)
                .await
            {
                warn!(tracking_id = %tracking_id, error = %e, "Push delivery failed");
            }
        }

        if effective.contains(&Channel::Email) {
            let address = match resolved.info.email.as_deref() {
                Some(address) if resolved.info.email_verified => address.to_string(),
                Some(address) => {
                    debug!(user_id = %request.user_id, "Email not verified, sending anyway to {address}");
                    address.to_string()
                }
                None => {
                    self.fail(
                        &tracking_id,
                        DeliveryError::InvalidRecipient("no email address on file".into()),
                        started,
                    )
                    .await;
                    return;
                }
            };

            let _ = self
                .components
                .tracker
                .transition(&tracking_id, DeliveryState::Sending)
                .await;

            let send = SendWork {
                tracking_id,
                user_id: request.user_id.clone(),
                email: OutboundEmail::from_rendered(address, &rendered),
                deadline: work.deadline,
            };
            self.process_send(send, started).await;
        } else {
            // In-app/push only: the record completes at SENT.
            let _ = self
                .components
                .tracker
                .transition(&tracking_id, DeliveryState::Sending)
                .await;
            let _ = self
                .components
                .tracker
                .transition(&tracking_id, DeliveryState::Sent)
                .await;
            self.components.metrics.record_sent(started.elapsed());
        }
    }

    async fn render(&self, request: &NotificationRequest) -> Result<RenderedMessage, DeliveryError> {
        let template = self
            .components
            .templates
            .get(request.notification_type, &request.language)
            .await
            .map_err(|e| DeliveryError::Internal(e.to_string()))?
            .ok_or_else(|| DeliveryError::MissingTemplate {
                notification_type: request.notification_type.to_string(),
                language: request.language.clone(),
            })?;

        self.components
            .templates
            .renderer()
            .render(&template, &request.variables)
            .map_err(|e| match e {
                TemplateError::MissingVariables { names } => {
                    DeliveryError::MissingVariables { names }
                }
                other => DeliveryError::Internal(other.to_string()),
            })
    }

    async fn process_send(&self, work: SendWork, started: Instant) {
        let tracking_id = work.tracking_id.clone();

        if Self::deadline_passed(work.deadline) {
            self.fail(&tracking_id, DeliveryError::Cancelled, started).await;
            return;
        }

        // A resumed item may still be SCHEDULED; move it back to SENDING.
        let _ = self
            .components
            .tracker
            .transition(&tracking_id, DeliveryState::Sending)
            .await;

        // Optional smoothing towards the relay.
        if let Some(smoother) = &self.send_smoother {
            while smoother.check().is_err() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        let attempts = self.components.tracker.record_attempt(&tracking_id);
        let transport_timeout = self.config.transport_timeout;
        let transport = self.components.handlers.mail.clone();
        let email = work.email.clone();

        let result = self
            .components
            .breaker
            .execute(async move {
                match tokio::time::timeout(transport_timeout, transport.send(&email)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                }
            })
            .await;

        match result {
            Ok(message_id) => {
                self.components.tracker.set_message_id(&tracking_id, &message_id);
                let _ = self
                    .components
                    .tracker
                    .transition(&tracking_id, DeliveryState::Sent)
                    .await;
                metrics::counter!("email.sent").increment(1);
                self.components.metrics.record_sent(started.elapsed());
                debug!(tracking_id = %tracking_id, message_id = %message_id, attempts = attempts, "Email sent");
            }
            Err(BreakerError::Open) => {
                self.handle_retryable(work, attempts, "circuit open", started).await;
            }
            Err(BreakerError::Inner(e)) if e.is_transient() => {
                self.handle_retryable(work, attempts, &e.to_string(), started).await;
            }
            Err(BreakerError::Inner(TransportError::InvalidRecipient(message))) => {
                self.fail(&tracking_id, DeliveryError::InvalidRecipient(message), started).await;
            }
            Err(BreakerError::Inner(e)) => {
                self.fail(&tracking_id, DeliveryError::PermanentTransport(e.to_string()), started)
                    .await;
            }
        }
    }

    /// Schedule a retry without holding a worker slot, or dead-letter when
    /// the attempt budget is spent.
    async fn handle_retryable(
        &self,
        work: SendWork,
        attempts: u32,
        error: &str,
        started: Instant,
    ) {
        let tracking_id = work.tracking_id.clone();
        self.components.tracker.set_error(&tracking_id, error, None);

        if attempts >= self.config.retry.max_attempts {
            self.dead_letter_send(&work, error).await;
            self.components.metrics.record_failed(started.elapsed());
            return;
        }

        let delay = self.config.retry.backoff(attempts);
        metrics::counter!("email.retried").increment(1);
        self.components.metrics.record_retry();
        debug!(
            tracking_id = %tracking_id,
            attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Scheduling retry"
        );

        let pipeline = match self.me.upgrade() {
            Some(pipeline) => pipeline,
            None => return,
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pipeline.requeue(WorkItem::Send(Box::new(work))).await;
        });
    }

    /// Quiet-hours deferral: mark SCHEDULED and re-enter the queue when the
    /// window ends.
    async fn defer_until(&self, work: FreshWork, resume_at: DateTime<Utc>) {
        let tracking_id = work.tracking_id.clone();
        self.components.tracker.set_scheduled_for(&tracking_id, resume_at);
        let _ = self
            .components
            .tracker
            .transition(&tracking_id, DeliveryState::Scheduled)
            .await;

        let now = self.components.clock.now_utc();
        let delay = (resume_at - now).to_std().unwrap_or(Duration::ZERO);
        info!(
            tracking_id = %tracking_id,
            resume_at = %resume_at.to_rfc3339(),
            "Delivery deferred for quiet hours"
        );

        let pipeline = match self.me.upgrade() {
            Some(pipeline) => pipeline,
            None => return,
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pipeline.requeue(WorkItem::Fresh(Box::new(work))).await;
        });
    }

    /// Re-enter the queue from a delay task. Items that can no longer be
    /// queued (shutdown) are flushed to the dead-letter queue.
    async fn requeue(&self, item: WorkItem) {
        match self.tx.send(item).await {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::SeqCst);
            }
            Err(mpsc::error::SendError(item)) => {
                warn!("Requeue after shutdown, flushing to dead letters");
                self.flush_to_dead_letter(item).await;
            }
        }
    }

    async fn fail(&self, tracking_id: &str, error: DeliveryError, started: Instant) {
        let reason = error.failure_reason();
        self.components
            .tracker
            .set_error(tracking_id, &error.to_string(), reason);
        let _ = self
            .components
            .tracker
            .transition(tracking_id, DeliveryState::Failed)
            .await;

        let kind = match &error {
            DeliveryError::Suppressed => "suppressed",
            DeliveryError::RateLimited { .. } => "rate_limited",
            DeliveryError::MissingTemplate { .. } => "missing_template",
            DeliveryError::MissingVariables { .. } => "missing_variables",
            DeliveryError::UnknownUser(_) => "unknown_user",
            DeliveryError::InvalidRecipient(_) => "invalid_recipient",
            DeliveryError::PermanentTransport(_) => "permanent_transport",
            DeliveryError::Cancelled => "cancelled",
            DeliveryError::Internal(_) => "internal",
            _ => "other",
        };
        metrics::counter!("email.failed", "error" => kind).increment(1);
        self.components.metrics.record_failed(started.elapsed());

        if let DeliveryError::Internal(message) = &error {
            error!(tracking_id = %tracking_id, error = %message, "Internal pipeline error");
            self.components.audit.internal_error("pipeline", message);
        } else {
            debug!(tracking_id = %tracking_id, error = %error, "Delivery failed");
        }
    }

    async fn dead_letter_send(&self, work: &SendWork, error: &str) {
        let record = DeadLetterRecord {
            id: uuid::Uuid::new_v4().to_string(),
            tracking_id: work.tracking_id.clone(),
            user_id: work.user_id.clone(),
            recipient: work.email.to.clone(),
            subject: work.email.subject.clone(),
            content: work.email.body_text.clone(),
            error_message: error.to_string(),
            retry_count: 0,
            status: DeadLetterStatus::Pending,
            created_at: self.components.clock.now_utc(),
            retried_at: None,
            resolved_at: None,
        };
        if let Err(e) = self.components.repository.save_dead_letter(record).await {
            error!(tracking_id = %work.tracking_id, error = %e, "Failed to persist dead letter");
        }
        let _ = self
            .components
            .tracker
            .transition(&work.tracking_id, DeliveryState::DeadLetter)
            .await;
        metrics::counter!("email.deadletter").increment(1);
        self.components.metrics.record_dead_letter();
        warn!(tracking_id = %work.tracking_id, error = %error, "Delivery dead-lettered");

        if let Ok(depth) = self.components.repository.count_dead_letters().await {
            metrics::gauge!("pipeline.dlq_depth").set(depth as f64);
        }
    }

    /// Flush a never-processed queue entry to the DLQ (shutdown path).
    async fn flush_to_dead_letter(&self, item: WorkItem) {
        match item {
            WorkItem::Fresh(work) => {
                let record = DeadLetterRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    tracking_id: work.tracking_id.clone(),
                    user_id: work.request.user_id.clone(),
                    recipient: work.request.user_id.clone(),
                    subject: work.request.notification_type.to_string(),
                    content: serde_json::to_string(&work.request.variables).unwrap_or_default(),
                    error_message: "pipeline shutdown before processing".to_string(),
                    retry_count: 0,
                    status: DeadLetterStatus::Pending,
                    created_at: self.components.clock.now_utc(),
                    retried_at: None,
                    resolved_at: None,
                };
                let _ = self.components.repository.save_dead_letter(record).await;
                let _ = self
                    .components
                    .tracker
                    .transition(&work.tracking_id, DeliveryState::DeadLetter)
                    .await;
            }
            WorkItem::Send(work) => {
                self.dead_letter_send(&work, "pipeline shutdown before send").await;
            }
        }
    }

    fn deadline_passed(deadline: Option<Instant>) -> bool {
        deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// UTC instant at which the quiet window ends, relative to the user's
    /// local now.
    fn next_quiet_end(
        local_now: DateTime<Utc>,
        quiet_end: chrono::NaiveTime,
        offset_minutes: i32,
    ) -> DateTime<Utc> {
        let local_date = local_now.date_naive();
        let end_today = local_date.and_time(quiet_end);
        let local_naive = local_now.naive_utc();

        let local_end = if local_naive < end_today {
            end_today
        } else {
            (local_date + chrono::Duration::days(1)).and_time(quiet_end)
        };

        DateTime::<Utc>::from_naive_utc_and_offset(
            local_end - chrono::Duration::minutes(offset_minutes as i64),
            Utc,
        )
    }
}
