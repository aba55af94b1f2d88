//! Outbound mail transport contract and the SMTP adapter.
//!
//! Errors are classified into transient (network, timeout, 4xx-transient
//! SMTP responses) and permanent (invalid recipient, 5xx rejections) so the
//! pipeline can decide whether to retry.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use courier_common::RenderedMessage;

/// Final delivery events reported asynchronously by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Delivered,
    Bounced,
    Complained,
    Failed,
}

/// One outbound email, fully rendered.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
}

impl OutboundEmail {
    pub fn from_rendered(to: impl Into<String>, rendered: &RenderedMessage) -> Self {
        Self {
            to: to.into(),
            subject: rendered.subject.clone(),
            body_text: rendered.body_text.clone(),
            body_html: rendered.body_html.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("permanent transport failure: {0}")]
    Permanent(String),

    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("transport timeout")]
    Timeout,

    #[error("connection failure: {0}")]
    Connection(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Transient(_) | TransportError::Timeout | TransportError::Connection(_)
        )
    }
}

/// Outbound mail transport. `send` returns the message id used to correlate
/// asynchronous delivery callbacks.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError>;
}

#[derive(Debug, Clone)]
pub struct SmtpTransportConfig {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub starttls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl Default for SmtpTransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25,
            from: "courier@localhost".to_string(),
            starttls: false,
            username: None,
            password: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// SMTP adapter on lettre's async transport.
pub struct SmtpMailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    /// Message-ID domain suffix.
    id_domain: String,
}

impl SmtpMailTransport {
    pub fn new(config: SmtpTransportConfig) -> Result<Self, TransportError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| TransportError::Permanent(format!("invalid from address: {e}")))?;

        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| TransportError::Connection(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        builder = builder
            .port(config.port)
            .timeout(Some(config.timeout));

        if let (Some(user), Some(pass)) = (config.username.clone(), config.password.clone()) {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        info!(
            host = %config.host,
            port = config.port,
            starttls = config.starttls,
            "SmtpMailTransport initialized"
        );

        Ok(Self {
            transport: builder.build(),
            id_domain: config.host.clone(),
            from,
        })
    }

    fn build_message(&self, email: &OutboundEmail, message_id: &str) -> Result<Message, TransportError> {
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| TransportError::InvalidRecipient(format!("{}: {e}", email.to)))?;

        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&email.subject)
            .message_id(Some(format!("<{message_id}@{}>", self.id_domain)));

        let message = match &email.body_html {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(
                email.body_text.clone(),
                html.clone(),
            )),
            None => builder
                .header(ContentType::TEXT_PLAIN)
                .body(email.body_text.clone()),
        };

        message.map_err(|e| TransportError::Permanent(format!("message build failed: {e}")))
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let message = self.build_message(email, &message_id)?;

        match self.transport.send(message).await {
            Ok(_) => {
                debug!(message_id = %message_id, "SMTP accepted message");
                Ok(message_id)
            }
            Err(e) => {
                if e.is_permanent() {
                    Err(TransportError::Permanent(e.to_string()))
                } else if e.is_transient() {
                    Err(TransportError::Transient(e.to_string()))
                } else if e.is_timeout() {
                    Err(TransportError::Timeout)
                } else {
                    Err(TransportError::Connection(e.to_string()))
                }
            }
        }
    }
}

/// Development transport: logs instead of sending.
#[derive(Default)]
pub struct LogMailTransport;

#[async_trait]
impl MailTransport for LogMailTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        info!(
            to = %email.to,
            subject = %email.subject,
            message_id = %message_id,
            "LogMailTransport: email suppressed (dev mode)"
        );
        Ok(message_id)
    }
}
