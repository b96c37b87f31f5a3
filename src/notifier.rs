//! Operator alerts
//!
//! Alerts are fire-and-forget: [`AlertNotifier::notify`] returns immediately
//! and delivery failures are only logged.

use crate::config::AlertConfig;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A single alert about a backend
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub backend: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Alert raised when a backend's breaker opens
    pub fn breaker_tripped(backend: &str) -> Self {
        Self::new(
            backend,
            format!(
                "Circuit breaker triggered for {}. Service temporarily unavailable.",
                backend
            ),
        )
    }

    pub fn subject(&self) -> String {
        format!("Alert: Service Issue in {}", self.backend)
    }

    pub fn body(&self) -> String {
        format!(
            "{}\n\nService: {}\nTimestamp: {}\n\n---\nFleetgate\n",
            self.message,
            self.backend,
            self.timestamp.to_rfc3339()
        )
    }
}

/// Sink for operator alerts
///
/// Implementations must not block or fail the caller; the breaker registry
/// calls this from the request path.
pub trait AlertNotifier: Send + Sync {
    fn notify(&self, event: AlertEvent);
}

/// Notifier that only writes alerts to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl AlertNotifier for LogNotifier {
    fn notify(&self, event: AlertEvent) {
        warn!(
            backend = %event.backend,
            subject = %event.subject(),
            message = %event.message,
            "Alert raised (email delivery disabled)"
        );
    }
}

/// Notifier that emails the operator over SMTP with STARTTLS
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailNotifier {
    /// Build the SMTP transport once; the connection itself is opened per send
    pub fn new(settings: &AlertConfig) -> Result<Self> {
        // SMTP usernames are not always addresses
        let from: Mailbox = settings
            .smtp_username
            .parse()
            .or_else(|_| format!("fleetgate@{}", settings.smtp_server).parse())
            .map_err(|e| anyhow!("Invalid sender address {}: {}", settings.smtp_username, e))?;

        let to: Mailbox = settings
            .recipient
            .parse()
            .map_err(|e| anyhow!("Invalid alert recipient {}: {}", settings.recipient, e))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_server)
            .map_err(|e| anyhow!("Failed to create SMTP transport: {}", e))?
            .port(settings.smtp_port)
            .credentials(Credentials::new(
                settings.smtp_username.clone(),
                settings.smtp_password.clone(),
            ))
            .build();

        Ok(Self {
            transport,
            from,
            to,
        })
    }

    fn build_message(&self, event: &AlertEvent) -> Result<Message> {
        Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(event.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(event.body())
            .map_err(|e| anyhow!("Failed to build email: {}", e))
    }
}

impl AlertNotifier for EmailNotifier {
    fn notify(&self, event: AlertEvent) {
        let email = match self.build_message(&event) {
            Ok(email) => email,
            Err(e) => {
                error!(backend = %event.backend, error = %e, "Failed to prepare alert email");
                return;
            }
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(backend = %event.backend, "No async runtime available, alert email dropped");
            return;
        };

        let transport = self.transport.clone();
        let backend = event.backend;
        handle.spawn(async move {
            match transport.send(email).await {
                Ok(_) => debug!(backend = %backend, "Alert email sent"),
                Err(e) => error!(backend = %backend, error = %e, "Failed to send alert email"),
            }
        });
    }
}

/// Pick the notifier matching the alert configuration
pub fn from_config(settings: &AlertConfig) -> Result<Arc<dyn AlertNotifier>> {
    if settings.enabled {
        Ok(Arc::new(EmailNotifier::new(settings)?))
    } else {
        Ok(Arc::new(LogNotifier))
    }
}
