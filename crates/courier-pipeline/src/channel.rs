//! Per-channel delivery handlers.
//!
//! The channel set is closed; handlers are registered once at pipeline
//! construction. Email drives the delivery record's state machine, in-app
//! persists a notification row, push is fire-and-forget through the sender.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use courier_common::{Notification, NotificationType, RenderedMessage};

use crate::repository::NotificationRepository;
use crate::transport::MailTransport;

/// Push delivery contract. Failures are logged, never retried.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn push(&self, user_id: &str, title: &str, body: &str) -> Result<()>;
}

/// Default sender when no push backend is wired.
#[derive(Default)]
pub struct NoOpPushSender;

#[async_trait]
impl PushSender for NoOpPushSender {
    async fn push(&self, user_id: &str, title: &str, _body: &str) -> Result<()> {
        debug!(user_id = %user_id, title = %title, "Push delivery skipped (no sender configured)");
        Ok(())
    }
}

/// Handler records registered at pipeline construction.
pub struct ChannelHandlers {
    pub mail: Arc<dyn MailTransport>,
    pub push: Arc<dyn PushSender>,
    pub repository: Arc<dyn NotificationRepository>,
}

impl ChannelHandlers {
    pub fn new(
        mail: Arc<dyn MailTransport>,
        push: Arc<dyn PushSender>,
        repository: Arc<dyn NotificationRepository>,
    ) -> Self {
        Self { mail, push, repository }
    }

    /// In-app delivery: persist a notification row for the user's inbox.
    pub async fn deliver_in_app(
        &self,
        user_id: &str,
        notification_type: NotificationType,
        rendered: &RenderedMessage,
    ) -> Result<Notification> {
        let notification = Notification::new(
            user_id,
            notification_type,
            rendered.subject.clone(),
            rendered.body_text.clone(),
        );
        self.repository.save_notification(notification.clone()).await?;
        Ok(notification)
    }

    /// Push delivery, best effort.
    pub async fn deliver_push(&self, user_id: &str, rendered: &RenderedMessage) -> Result<()> {
        self.push.push(user_id, &rendered.subject, &rendered.body_text).await
    }
}
