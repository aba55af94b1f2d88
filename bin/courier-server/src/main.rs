//! Courier Notification Service
//!
//! Composition root wiring the delivery core: configuration, logging,
//! repositories, SMTP transport behind the circuit breaker, the delivery
//! pipeline and its worker pool, template warm-up, the digest scheduler,
//! and the dead-letter expiry sweep.
//!
//! ## Development Mode
//!
//! Set `COURIER_DEV_MODE=true` (or `dev_mode = true` in courier.toml) to log
//! outbound email instead of speaking SMTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::info;

use courier_common::{Clock, SystemClock, UserInfo};
use courier_config::AppConfig;
use courier_digest::{DigestScheduler, DigestSchedulerConfig};
use courier_pipeline::{
    AuditLogger, CachedUserInfoProvider, ChannelHandlers, CircuitBreaker, CircuitBreakerConfig,
    DeadLetterService, DeadLetterServiceConfig, DeliveryPipeline, DeliveryPipelineConfig,
    InMemoryCounterStore, InMemoryNotificationRepository, LogMailTransport, MailTransport,
    NoOpPushSender, PipelineComponents, PipelineMetrics, PreferenceEngine, RateLimiter,
    RateLimiterConfig, RetryPolicy, SmtpMailTransport, SmtpTransportConfig, StaticUserInfoProvider,
    StatusTracker,
};
use courier_template::{
    InMemoryTemplateRepository, RendererConfig, TemplateRenderer, TemplateStore,
    TemplateStoreConfig, TemplateWarmer,
};

#[tokio::main]
async fn main() -> Result<()> {
    courier_common::logging::init_logging("courier-server");

    info!("Starting Courier Notification Service");

    // 1. Configuration
    let config = AppConfig::load()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // 2. Audit and metrics
    let audit = Arc::new(AuditLogger::default());
    let pipeline_metrics = Arc::new(PipelineMetrics::new());

    // 3. Repositories (in-memory adapters; swap for a persistent driver)
    let repository = Arc::new(InMemoryNotificationRepository::new());
    let template_repository = Arc::new(InMemoryTemplateRepository::new());

    // 4. Template store + renderer
    let renderer = Arc::new(TemplateRenderer::new(RendererConfig {
        cache_max_entries: config.template_cache.rendered_max_entries,
        cache_ttl: Duration::from_secs(config.template_cache.rendered_ttl_secs),
        cache_max_body_bytes: config.template_cache.rendered_max_body_bytes,
    }));
    let templates = Arc::new(TemplateStore::new(
        TemplateStoreConfig {
            max_entries: config.template_cache.max_entries,
            ttl: Duration::from_secs(config.template_cache.ttl_secs),
            ..TemplateStoreConfig::default()
        },
        template_repository.clone(),
        renderer,
    ));

    // 5. Mail transport (dev mode logs instead of sending)
    let transport: Arc<dyn MailTransport> = if config.dev_mode {
        info!("Dev mode: outbound email is logged, not sent");
        Arc::new(LogMailTransport)
    } else {
        Arc::new(SmtpMailTransport::new(SmtpTransportConfig {
            host: config.smtp.host.clone(),
            port: config.smtp.port,
            from: config.smtp.from.clone(),
            starttls: config.smtp.starttls,
            username: config.smtp.username.clone(),
            password: config.smtp.password.clone(),
            timeout: Duration::from_millis(config.smtp.timeout_ms),
        })
        .map_err(|e| anyhow::anyhow!("SMTP transport setup failed: {e}"))?)
    };

    // 6. Circuit breaker over the transport
    let breaker = Arc::new(
        CircuitBreaker::new(
            "mail-transport",
            CircuitBreakerConfig {
                window_size: config.circuit.window_size,
                window_duration: Duration::from_secs(config.circuit.window_secs),
                min_calls: config.circuit.min_calls,
                failure_rate: config.circuit.failure_rate,
                slow_call_threshold: Duration::from_millis(config.circuit.slow_call_ms),
                slow_rate: config.circuit.slow_rate,
                cooldown: Duration::from_secs(config.circuit.cooldown_secs),
                probe_count: config.circuit.probe_count,
            },
        )
        .with_audit(audit.clone()),
    );

    // 7. Rate limiter
    let rate_limiter = Arc::new(RateLimiter::new(
        RateLimiterConfig {
            window: Duration::from_secs(config.rate_limit.window_secs),
            read_limit: config.rate_limit.read_limit,
            write_limit: config.rate_limit.write_limit,
            admin_limit: config.rate_limit.admin_limit,
            public_limit: config.rate_limit.public_limit,
            violation_threshold: config.rate_limit.violation_threshold,
            violation_window: Duration::from_secs(config.rate_limit.violation_window_secs),
            block_duration: Duration::from_secs(config.rate_limit.block_secs),
        },
        Arc::new(InMemoryCounterStore::new(clock.clone())),
        clock.clone(),
        audit.clone(),
    ));

    // 8. Collaborator services
    let preferences = Arc::new(PreferenceEngine::new(repository.clone(), audit.clone()));
    let tracker = Arc::new(StatusTracker::new(repository.clone(), clock.clone()));
    let users = Arc::new(CachedUserInfoProvider::new(
        Arc::new(StaticUserInfoProvider::new().with_user(UserInfo {
            user_id: "demo".to_string(),
            email: Some("demo@localhost".to_string()),
            phone: None,
            utc_offset_minutes: Some(0),
            email_verified: true,
        })),
        Duration::from_secs(300),
    ));
    let handlers = Arc::new(ChannelHandlers::new(
        transport.clone(),
        Arc::new(NoOpPushSender),
        repository.clone(),
    ));

    // 9. Delivery pipeline
    let pipeline = DeliveryPipeline::new(
        DeliveryPipelineConfig {
            workers: config.pipeline.workers,
            queue_capacity: config.pipeline.queue_capacity,
            accept_timeout: Duration::from_millis(config.pipeline.accept_timeout_ms),
            transport_timeout: Duration::from_millis(config.pipeline.transport_timeout_ms),
            send_rate_per_minute: config.pipeline.send_rate_per_minute,
            retry: RetryPolicy {
                max_attempts: config.retry.max_attempts,
                base: Duration::from_millis(config.retry.base_ms),
                multiplier: config.retry.multiplier,
                cap: Duration::from_millis(config.retry.cap_ms),
                jitter: config.retry.jitter,
            },
        },
        PipelineComponents {
            preferences: preferences.clone(),
            rate_limiter,
            breaker: breaker.clone(),
            templates: templates.clone(),
            handlers,
            tracker,
            users: users.clone(),
            repository: repository.clone(),
            metrics: pipeline_metrics,
            audit: audit.clone(),
            clock: clock.clone(),
        },
    );
    pipeline.start();

    // 10. Template warm-up
    if config.warmup.enabled {
        let warmer = Arc::new(TemplateWarmer::new(
            templates.clone(),
            config.warmup.languages.clone(),
            config.warmup.parallelism,
        ));
        warmer.spawn();
    }

    // 11. Digest scheduler
    let digest = DigestScheduler::new(
        DigestSchedulerConfig {
            enabled: config.digest.enabled,
            daily_hour: config.digest.daily_hour,
            weekly_hour: config.digest.weekly_hour,
            tick: Duration::from_secs(config.digest.tick_secs),
            per_user_timeout: Duration::from_secs(config.digest.per_user_timeout_secs),
            items_per_type: config.digest.items_per_type,
        },
        repository.clone(),
        pipeline.clone(),
        preferences,
        users,
        clock.clone(),
    );
    digest.start().await;

    // 12. Dead-letter expiry sweep
    let dead_letters = Arc::new(DeadLetterService::new(
        DeadLetterServiceConfig::default(),
        repository,
        transport,
        breaker,
        clock,
        audit,
    ));
    dead_letters.spawn_sweep();

    info!("Courier is up");

    // 13. Graceful shutdown on ctrl-c
    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    digest.stop().await;
    pipeline.shutdown(Duration::from_secs(30)).await;

    Ok(())
}
