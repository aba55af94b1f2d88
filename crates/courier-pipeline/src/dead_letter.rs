//! Dead-letter administration: manual retry, resolution, and expiry sweeps.
//!
//! Manual retries bypass the rendering stages (the dead letter carries the
//! rendered payload) but still go through the circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use courier_common::{Clock, DeadLetterRecord, DeadLetterStatus};

use crate::audit::AuditLogger;
use crate::breaker::{BreakerError, CircuitBreaker};
use crate::repository::NotificationRepository;
use crate::transport::{MailTransport, OutboundEmail};

#[derive(Debug, Clone)]
pub struct DeadLetterServiceConfig {
    /// Manual retry budget per record.
    pub max_retries: u32,
    /// Records older than this are expired by the sweep.
    pub retention: Duration,
    /// Sweep interval.
    pub sweep_interval: Duration,
    /// Batch size per sweep.
    pub sweep_batch: u32,
}

impl Default for DeadLetterServiceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retention: Duration::from_secs(30 * 24 * 3_600),
            sweep_interval: Duration::from_secs(3_600),
            sweep_batch: 500,
        }
    }
}

/// Outcome of a manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Sent,
    Failed,
    NotRetryable,
    NotFound,
}

pub struct DeadLetterService {
    config: DeadLetterServiceConfig,
    repository: Arc<dyn NotificationRepository>,
    transport: Arc<dyn MailTransport>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLogger>,
}

impl DeadLetterService {
    pub fn new(
        config: DeadLetterServiceConfig,
        repository: Arc<dyn NotificationRepository>,
        transport: Arc<dyn MailTransport>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            config,
            repository,
            transport,
            breaker,
            clock,
            audit,
        }
    }

    /// Manually retry a dead letter. The record moves to PROCESSING while
    /// the send is in flight, then to RETRIED, RETRY_FAILED, or
    /// MAX_RETRIES_EXCEEDED.
    pub async fn retry(&self, id: &str, actor: &str) -> Result<RetryOutcome> {
        let mut record = match self.repository.find_dead_letter(id).await? {
            Some(record) => record,
            None => return Ok(RetryOutcome::NotFound),
        };

        if !record.can_retry(self.config.max_retries) {
            if record.retry_count >= self.config.max_retries
                && matches!(
                    record.status,
                    DeadLetterStatus::Pending | DeadLetterStatus::RetryFailed
                )
            {
                record.status = DeadLetterStatus::MaxRetriesExceeded;
                self.repository.save_dead_letter(record).await?;
            }
            return Ok(RetryOutcome::NotRetryable);
        }

        record.status = DeadLetterStatus::Processing;
        self.repository.save_dead_letter(record.clone()).await?;
        self.audit.admin_action(actor, "dead_letter_retry", id);

        let email = OutboundEmail {
            to: record.recipient.clone(),
            subject: record.subject.clone(),
            body_text: record.content.clone(),
            body_html: None,
        };

        let now = self.clock.now_utc();
        record.retry_count += 1;
        record.retried_at = Some(now);

        match self.breaker.execute(self.transport.send(&email)).await {
            Ok(message_id) => {
                info!(dead_letter_id = %id, message_id = %message_id, "Dead letter retried successfully");
                record.status = DeadLetterStatus::Retried;
                record.resolved_at = Some(now);
                self.repository.save_dead_letter(record).await?;
                Ok(RetryOutcome::Sent)
            }
            Err(BreakerError::Open) => {
                warn!(dead_letter_id = %id, "Dead letter retry rejected by open circuit");
                record.status = if record.retry_count >= self.config.max_retries {
                    DeadLetterStatus::MaxRetriesExceeded
                } else {
                    DeadLetterStatus::RetryFailed
                };
                record.error_message = "circuit open".to_string();
                self.repository.save_dead_letter(record).await?;
                Ok(RetryOutcome::Failed)
            }
            Err(BreakerError::Inner(e)) => {
                warn!(dead_letter_id = %id, error = %e, "Dead letter retry failed");
                record.status = if record.retry_count >= self.config.max_retries {
                    DeadLetterStatus::MaxRetriesExceeded
                } else {
                    DeadLetterStatus::RetryFailed
                };
                record.error_message = e.to_string();
                self.repository.save_dead_letter(record).await?;
                Ok(RetryOutcome::Failed)
            }
        }
    }

    /// Mark a record resolved without retrying.
    pub async fn resolve(&self, id: &str, actor: &str) -> Result<bool> {
        let mut record = match self.repository.find_dead_letter(id).await? {
            Some(record) => record,
            None => return Ok(false),
        };
        record.status = DeadLetterStatus::Resolved;
        record.resolved_at = Some(self.clock.now_utc());
        self.repository.save_dead_letter(record).await?;
        self.audit.admin_action(actor, "dead_letter_resolve", id);
        Ok(true)
    }

    /// Expire pending records older than the retention window. Returns the
    /// number of records expired.
    pub async fn expire_old(&self) -> Result<usize> {
        let cutoff = self.clock.now_utc()
            - chrono::Duration::from_std(self.config.retention).unwrap_or_default();

        let pending = self
            .repository
            .find_dead_letters_by_status(DeadLetterStatus::Pending, self.config.sweep_batch)
            .await?;

        let mut expired = 0;
        for mut record in pending {
            if record.created_at < cutoff {
                record.status = DeadLetterStatus::Expired;
                self.repository.save_dead_letter(record).await?;
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired = expired, "Expired old dead letters");
        }
        Ok(expired)
    }

    /// Spawn the periodic expiry sweep.
    pub fn spawn_sweep(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.expire_old().await {
                    warn!(error = %e, "Dead letter expiry sweep failed");
                }
            }
        })
    }

    pub async fn pending(&self, limit: u32) -> Result<Vec<DeadLetterRecord>> {
        self.repository
            .find_dead_letters_by_status(DeadLetterStatus::Pending, limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::memory::InMemoryNotificationRepository;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use chrono::Utc;
    use courier_common::SystemClock;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ScriptedTransport {
        fail: AtomicBool,
    }

    #[async_trait]
    impl MailTransport for ScriptedTransport {
        async fn send(&self, _email: &OutboundEmail) -> Result<String, TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(TransportError::Transient("503".into()))
            } else {
                Ok(uuid::Uuid::new_v4().to_string())
            }
        }
    }

    fn dead_letter(id: &str) -> DeadLetterRecord {
        DeadLetterRecord {
            id: id.to_string(),
            tracking_id: "t-1".into(),
            user_id: "u-1".into(),
            recipient: "u-1@example.com".into(),
            subject: "s".into(),
            content: "c".into(),
            error_message: "timeout".into(),
            retry_count: 0,
            status: DeadLetterStatus::Pending,
            created_at: Utc::now(),
            retried_at: None,
            resolved_at: None,
        }
    }

    fn service(
        fail: bool,
    ) -> (Arc<DeadLetterService>, Arc<InMemoryNotificationRepository>) {
        let repo = Arc::new(InMemoryNotificationRepository::new());
        let transport = Arc::new(ScriptedTransport { fail: AtomicBool::new(fail) });
        let breaker = Arc::new(CircuitBreaker::new("mail", CircuitBreakerConfig::default()));
        let service = Arc::new(DeadLetterService::new(
            DeadLetterServiceConfig::default(),
            repo.clone(),
            transport,
            breaker,
            Arc::new(SystemClock),
            Arc::new(AuditLogger::default()),
        ));
        (service, repo)
    }

    #[tokio::test]
    async fn successful_retry_marks_retried() {
        let (service, repo) = service(false);
        repo.save_dead_letter(dead_letter("dl-1")).await.unwrap();

        let outcome = service.retry("dl-1", "admin").await.unwrap();
        assert_eq!(outcome, RetryOutcome::Sent);

        let record = repo.find_dead_letter("dl-1").await.unwrap().unwrap();
        assert_eq!(record.status, DeadLetterStatus::Retried);
        assert_eq!(record.retry_count, 1);
        assert!(record.retried_at.is_some());
    }

    #[tokio::test]
    async fn failed_retry_marks_retry_failed_then_exceeded() {
        let (service, repo) = service(true);
        repo.save_dead_letter(dead_letter("dl-1")).await.unwrap();

        for expected_count in 1..=3u32 {
            let outcome = service.retry("dl-1", "admin").await.unwrap();
            assert_eq!(outcome, RetryOutcome::Failed);
            let record = repo.find_dead_letter("dl-1").await.unwrap().unwrap();
            assert_eq!(record.retry_count, expected_count);
        }

        let record = repo.find_dead_letter("dl-1").await.unwrap().unwrap();
        assert_eq!(record.status, DeadLetterStatus::MaxRetriesExceeded);

        // Budget exhausted: further retries are refused.
        let outcome = service.retry("dl-1", "admin").await.unwrap();
        assert_eq!(outcome, RetryOutcome::NotRetryable);
    }

    #[tokio::test]
    async fn resolve_without_retry() {
        let (service, repo) = service(false);
        repo.save_dead_letter(dead_letter("dl-1")).await.unwrap();

        assert!(service.resolve("dl-1", "admin").await.unwrap());
        let record = repo.find_dead_letter("dl-1").await.unwrap().unwrap();
        assert_eq!(record.status, DeadLetterStatus::Resolved);
        assert!(record.resolved_at.is_some());
    }

    #[tokio::test]
    async fn expiry_sweep_marks_old_records() {
        let (service, repo) = service(false);

        let mut old = dead_letter("dl-old");
        old.created_at = Utc::now() - chrono::Duration::days(60);
        repo.save_dead_letter(old).await.unwrap();
        repo.save_dead_letter(dead_letter("dl-new")).await.unwrap();

        let expired = service.expire_old().await.unwrap();
        assert_eq!(expired, 1);

        let old = repo.find_dead_letter("dl-old").await.unwrap().unwrap();
        assert_eq!(old.status, DeadLetterStatus::Expired);
        let fresh = repo.find_dead_letter("dl-new").await.unwrap().unwrap();
        assert_eq!(fresh.status, DeadLetterStatus::Pending);
    }

    #[tokio::test]
    async fn missing_record_reports_not_found() {
        let (service, _repo) = service(false);
        assert_eq!(service.retry("ghost", "admin").await.unwrap(), RetryOutcome::NotFound);
    }
}
