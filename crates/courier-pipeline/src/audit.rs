//! Structured audit event emission.
//!
//! Security-relevant events are emitted through an `AuditSink` as structured
//! records. Sensitive fields are masked before they leave the process:
//! tokens keep the first and last four characters, email addresses keep one
//! character of the local part and the top-level domain, phone numbers keep
//! the last four digits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::info;

/// Fire-and-forget sink for audit records.
pub trait AuditSink: Send + Sync {
    fn emit(&self, record: &AuditRecord);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// Default sink: structured `tracing` events under the `audit` target.
#[derive(Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, record: &AuditRecord) {
        info!(
            target: "audit",
            event = %record.event,
            audit_id = %record.id,
            details = %record.details,
            "audit event"
        );
    }
}

/// Mask a token: first four and last four characters survive.
pub fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "****".to_string();
    }
    format!("{}****{}", &token[..4], &token[token.len() - 4..])
}

/// Mask an email address: one character of the local part and the top-level
/// domain survive.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            let tld = domain.rsplit_once('.').map(|(_, tld)| tld).unwrap_or("");
            if tld.is_empty() {
                format!("{first}***@***")
            } else {
                format!("{first}***@***.{tld}")
            }
        }
        None => "***".to_string(),
    }
}

/// Mask a phone number: last four digits survive.
pub fn mask_phone(phone: &str) -> String {
    if phone.len() <= 4 {
        return "****".to_string();
    }
    format!("****{}", &phone[phone.len() - 4..])
}

/// Emits structured audit records for security-relevant events.
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    fn emit(&self, event: &str, details: serde_json::Value) {
        let record = AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            event: event.to_string(),
            timestamp: Utc::now(),
            details,
        };
        self.sink.emit(&record);
    }

    pub fn authentication_success(&self, user_id: &str) {
        self.emit("AUTH_SUCCESS", json!({ "userId": user_id }));
    }

    pub fn authentication_failure(&self, user_id: &str, reason: &str) {
        self.emit("AUTH_FAILURE", json!({ "userId": user_id, "reason": reason }));
    }

    /// Preference create/update with a field-level diff.
    pub fn preference_changed(
        &self,
        user_id: &str,
        notification_type: &str,
        created: bool,
        diff: serde_json::Value,
    ) {
        self.emit(
            if created { "PREFERENCE_CREATED" } else { "PREFERENCE_UPDATED" },
            json!({
                "userId": user_id,
                "notificationType": notification_type,
                "diff": diff,
            }),
        );
    }

    pub fn template_created(&self, notification_type: &str, language: &str) {
        self.emit(
            "TEMPLATE_CREATED",
            json!({ "notificationType": notification_type, "language": language }),
        );
    }

    pub fn template_deleted(&self, notification_type: &str, language: &str) {
        self.emit(
            "TEMPLATE_DELETED",
            json!({ "notificationType": notification_type, "language": language }),
        );
    }

    pub fn admin_action(&self, actor: &str, action: &str, target: &str) {
        self.emit(
            "ADMIN_ACTION",
            json!({ "actor": actor, "action": action, "target": target }),
        );
    }

    pub fn suspicious_activity(&self, identity: &str, description: &str) {
        self.emit(
            "SUSPICIOUS_ACTIVITY",
            json!({ "identity": identity, "description": description }),
        );
    }

    pub fn rate_limit_violation(&self, identity: &str, class: &str) {
        self.emit(
            "RATE_LIMIT_VIOLATION",
            json!({ "identity": identity, "class": class }),
        );
    }

    pub fn rate_limit_blocked(&self, identity: &str, until: DateTime<Utc>) {
        self.emit(
            "RATE_LIMIT_BLOCKED",
            json!({ "identity": identity, "blockedUntil": until.to_rfc3339() }),
        );
    }

    pub fn circuit_transition(&self, name: &str, from: &str, to: &str) {
        self.emit(
            "CIRCUIT_TRANSITION",
            json!({ "breaker": name, "from": from, "to": to }),
        );
    }

    pub fn security_config_changed(&self, setting: &str, actor: &str) {
        self.emit(
            "SECURITY_CONFIG_CHANGED",
            json!({ "setting": setting, "actor": actor }),
        );
    }

    /// Unexpected core failures surface here as well as in the status record.
    pub fn internal_error(&self, component: &str, error: &str) {
        self.emit("INTERNAL_ERROR", json!({ "component": component, "error": error }));
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct CapturingSink {
        pub records: Mutex<Vec<AuditRecord>>,
    }

    impl AuditSink for CapturingSink {
        fn emit(&self, record: &AuditRecord) {
            self.records.lock().push(record.clone());
        }
    }

    #[test]
    fn masks_tokens() {
        assert_eq!(mask_token("abcd1234efgh5678"), "abcd****5678");
        assert_eq!(mask_token("short"), "****");
    }

    #[test]
    fn masks_emails() {
        assert_eq!(mask_email("user@example.com"), "u***@***.com");
        assert_eq!(mask_email("a@b"), "a***@***");
        assert_eq!(mask_email("not-an-email"), "***");
    }

    #[test]
    fn masks_phones() {
        assert_eq!(mask_phone("+4366012345678"), "****5678");
        assert_eq!(mask_phone("123"), "****");
    }

    #[test]
    fn preference_change_carries_diff() {
        let sink = Arc::new(CapturingSink::default());
        let logger = AuditLogger::new(sink.clone());

        logger.preference_changed(
            "u-1",
            "MARKETING",
            false,
            json!({ "emailEnabled": { "from": true, "to": false } }),
        );

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "PREFERENCE_UPDATED");
        assert_eq!(records[0].details["userId"], "u-1");
        assert!(records[0].details["diff"]["emailEnabled"].is_object());
    }

    #[test]
    fn rate_limit_events() {
        let sink = Arc::new(CapturingSink::default());
        let logger = AuditLogger::new(sink.clone());

        logger.rate_limit_violation("u-9", "WRITE");
        logger.rate_limit_blocked("u-9", Utc::now());

        let records = sink.records.lock();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, "RATE_LIMIT_VIOLATION");
        assert_eq!(records[1].event, "RATE_LIMIT_BLOCKED");
    }
}
