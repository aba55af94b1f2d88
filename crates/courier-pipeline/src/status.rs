//! Per-delivery lifecycle tracking.
//!
//! Live records are held in memory; terminal transitions are written through
//! the repository. Transitions are idempotent and terminal states are fixed
//! points, so repeated transport callbacks never regress a record.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use courier_common::{
    Channel, Clock, DeliveryRecord, DeliveryState, FailureReason, StateTransition,
};

use crate::repository::NotificationRepository;
use crate::transport::TransportEvent;

/// Read-only delivery statistics over a trailing window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatistics {
    pub sent: u64,
    pub delivered: u64,
    pub bounced: u64,
    pub complained: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub delivery_rate: f64,
    pub bounce_rate: f64,
}

pub struct StatusTracker {
    records: DashMap<String, DeliveryRecord>,
    /// Transport message id -> tracking id, for callback correlation.
    message_index: DashMap<String, String>,
    repository: Arc<dyn NotificationRepository>,
    clock: Arc<dyn Clock>,
}

impl StatusTracker {
    pub fn new(repository: Arc<dyn NotificationRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            message_index: DashMap::new(),
            repository,
            clock,
        }
    }

    /// Register a new record (state PENDING).
    pub fn create(&self, user_id: &str, recipient: &str, channel: Channel) -> DeliveryRecord {
        let mut record = DeliveryRecord::new(user_id, recipient, channel);
        let now = self.clock.now_utc();
        record.created_at = now;
        record.updated_at = now;
        record.transitions = vec![StateTransition { state: DeliveryState::Pending, at: now }];
        self.records.insert(record.tracking_id.clone(), record.clone());
        record
    }

    /// Remove a record that never entered the pipeline (failed enqueue).
    pub fn discard(&self, tracking_id: &str) {
        self.records.remove(tracking_id);
    }

    /// Apply a state transition. Returns false when the transition was
    /// refused (unknown record or already terminal). Re-applying the current
    /// state is an accepted no-op.
    pub async fn transition(&self, tracking_id: &str, to: DeliveryState) -> Result<bool> {
        let persisted = {
            let mut entry = match self.records.get_mut(tracking_id) {
                Some(entry) => entry,
                None => return Ok(false),
            };

            if entry.state == to {
                return Ok(true);
            }
            if entry.state.is_terminal() {
                debug!(
                    tracking_id = %tracking_id,
                    current = %entry.state,
                    refused = %to,
                    "Refusing transition out of terminal state"
                );
                return Ok(false);
            }

            let now = self.clock.now_utc();
            entry.state = to;
            entry.updated_at = now;
            entry.transitions.push(StateTransition { state: to, at: now });
            to.is_terminal().then(|| entry.clone())
        };

        if let Some(record) = persisted {
            self.repository.save_delivery_record(record).await?;
        }
        Ok(true)
    }

    /// Record a send attempt; returns the new attempt count.
    pub fn record_attempt(&self, tracking_id: &str) -> u32 {
        match self.records.get_mut(tracking_id) {
            Some(mut entry) => {
                entry.attempts += 1;
                entry.attempts
            }
            None => 0,
        }
    }

    pub fn set_error(&self, tracking_id: &str, error: &str, reason: Option<FailureReason>) {
        if let Some(mut entry) = self.records.get_mut(tracking_id) {
            entry.last_error = Some(error.to_string());
            if reason.is_some() {
                entry.failure_reason = reason;
            }
        }
    }

    pub fn set_scheduled_for(&self, tracking_id: &str, at: chrono::DateTime<Utc>) {
        if let Some(mut entry) = self.records.get_mut(tracking_id) {
            entry.scheduled_for = Some(at);
        }
    }

    pub fn set_recipient(&self, tracking_id: &str, recipient: &str) {
        if let Some(mut entry) = self.records.get_mut(tracking_id) {
            entry.recipient = recipient.to_string();
        }
    }

    pub fn set_notification_id(&self, tracking_id: &str, notification_id: &str) {
        if let Some(mut entry) = self.records.get_mut(tracking_id) {
            entry.notification_id = Some(notification_id.to_string());
        }
    }

    /// Register the transport message id for callback correlation.
    pub fn set_message_id(&self, tracking_id: &str, message_id: &str) {
        if let Some(mut entry) = self.records.get_mut(tracking_id) {
            entry.message_id = Some(message_id.to_string());
        }
        self.message_index
            .insert(message_id.to_string(), tracking_id.to_string());
    }

    /// Look up a record, falling back to the repository for records evicted
    /// from memory.
    pub async fn get(&self, tracking_id: &str) -> Result<Option<DeliveryRecord>> {
        if let Some(entry) = self.records.get(tracking_id) {
            return Ok(Some(entry.clone()));
        }
        self.repository.find_delivery_record(tracking_id).await
    }

    /// Ingress hook for asynchronous transport callbacks. Idempotent: events
    /// for records already terminal are ignored.
    pub async fn on_transport_callback(
        &self,
        message_id: &str,
        event: TransportEvent,
    ) -> Result<bool> {
        let tracking_id = match self.message_index.get(message_id) {
            Some(entry) => entry.clone(),
            None => {
                warn!(message_id = %message_id, "Callback for unknown message id");
                return Ok(false);
            }
        };

        let to = match event {
            TransportEvent::Delivered => DeliveryState::Delivered,
            TransportEvent::Bounced => DeliveryState::Bounced,
            TransportEvent::Complained => DeliveryState::Complained,
            TransportEvent::Failed => DeliveryState::Failed,
        };

        if event == TransportEvent::Bounced {
            metrics::counter!("email.bounced").increment(1);
        }

        self.transition(&tracking_id, to).await
    }

    /// Delivery statistics over records whose last transition happened
    /// within `window`.
    pub fn statistics(&self, window: Duration) -> DeliveryStatistics {
        let cutoff = self.clock.now_utc()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());

        let mut stats = DeliveryStatistics {
            sent: 0,
            delivered: 0,
            bounced: 0,
            complained: 0,
            failed: 0,
            dead_lettered: 0,
            delivery_rate: 0.0,
            bounce_rate: 0.0,
        };

        for entry in self.records.iter() {
            let record = entry.value();
            if record.updated_at < cutoff {
                continue;
            }
            let reached_sent = record
                .transitions
                .iter()
                .any(|t| matches!(t.state, DeliveryState::Sent));
            if reached_sent {
                stats.sent += 1;
            }
            match record.state {
                DeliveryState::Delivered => stats.delivered += 1,
                DeliveryState::Bounced => stats.bounced += 1,
                DeliveryState::Complained => stats.complained += 1,
                DeliveryState::Failed => stats.failed += 1,
                DeliveryState::DeadLetter => stats.dead_lettered += 1,
                _ => {}
            }
        }

        if stats.sent > 0 {
            stats.delivery_rate = stats.delivered as f64 / stats.sent as f64;
            stats.bounce_rate = stats.bounced as f64 / stats.sent as f64;
        }
        stats
    }

    pub fn live_count(&self) -> usize {
        self.records.len()
    }
}
