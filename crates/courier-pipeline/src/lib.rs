//! Courier Delivery Pipeline
//!
//! This crate provides the core delivery functionality:
//! - DeliveryPipeline: bounded queue + worker pool orchestrating every
//!   delivery through preference, rate-limit, and circuit-breaker gates
//! - PreferenceEngine: channel toggles, frequencies, quiet hours
//! - RateLimiter: fixed-window limits per (identity, class) with violation
//!   escalation and temporary blocks
//! - CircuitBreaker: failure-rate and slow-call protection over the mail
//!   transport
//! - StatusTracker: per-delivery lifecycle records and transport callbacks
//! - DeadLetterService: manual retry and expiry of exhausted deliveries
//! - PipelineMetrics: throughput/error-rate/latency snapshots
//! - AuditLogger: structured security event emission with masking

pub mod audit;
pub mod breaker;
pub mod channel;
pub mod dead_letter;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod preference;
pub mod ratelimit;
pub mod repository;
pub mod status;
pub mod transport;
pub mod userinfo;

pub use audit::{AuditLogger, AuditRecord, AuditSink, TracingAuditSink};
pub use breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use channel::{ChannelHandlers, NoOpPushSender, PushSender};
pub use dead_letter::{DeadLetterService, DeadLetterServiceConfig, RetryOutcome};
pub use error::DeliveryError;
pub use memory::InMemoryNotificationRepository;
pub use metrics::{MetricsSnapshot, PipelineMetrics, PipelineMetricsConfig};
pub use pipeline::{
    DeliveryPipeline, DeliveryPipelineConfig, PipelineComponents, RetryPolicy,
};
pub use preference::{quiet_window_contains, PreferenceEngine, PreferenceUpdate};
pub use ratelimit::{
    CounterStore, Decision, InMemoryCounterStore, RateLimiter, RateLimiterConfig,
};
pub use repository::NotificationRepository;
pub use status::{DeliveryStatistics, StatusTracker};
pub use transport::{
    LogMailTransport, MailTransport, OutboundEmail, SmtpMailTransport, SmtpTransportConfig,
    TransportError, TransportEvent,
};
pub use userinfo::{
    CachedUserInfoProvider, ResolvedUserInfo, StaticUserInfoProvider, UserInfoProvider,
};

pub type Result<T> = std::result::Result<T, DeliveryError>;
