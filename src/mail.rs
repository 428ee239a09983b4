//! Outgoing notifications.
//!
//! The gateway does not speak SMTP. With `email.enable` and an
//! `email.outbox` directory configured, each notification is written as
//! an RFC 5322 message file for a local MTA to pick up. Otherwise sending
//! is logged and skipped.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::schema::EmailConfig;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("failed to write outbox message {path}: {source}")]
    Outbox {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Notification sink.
pub trait Mailer: Send + Sync {
    fn send_password_reset(&self, to: &str, link: &str) -> Result<(), MailError>;
}

/// Writes messages into an outbox directory.
pub struct OutboxMailer {
    dir: PathBuf,
    from: String,
}

impl OutboxMailer {
    pub fn new(dir: impl Into<PathBuf>, from: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            from: from.into(),
        }
    }
}

impl Mailer for OutboxMailer {
    fn send_password_reset(&self, to: &str, link: &str) -> Result<(), MailError> {
        let path = self.dir.join(format!("{}.eml", uuid::Uuid::new_v4()));
        let message = format!(
            "From: {from}\r\nTo: {to}\r\nSubject: Password reset\r\n\r\n\
             A password reset was requested for your account.\r\n\
             Follow this link within 15 minutes to choose a new password:\r\n\r\n\
             {link}\r\n",
            from = self.from,
        );
        std::fs::create_dir_all(&self.dir)
            .and_then(|_| std::fs::write(&path, message))
            .map_err(|source| MailError::Outbox {
                path: path.clone(),
                source,
            })?;
        tracing::info!(to = %to, path = %path.display(), "Password reset mail queued");
        Ok(())
    }
}

/// Used when notifications are disabled.
pub struct DisabledMailer;

impl Mailer for DisabledMailer {
    fn send_password_reset(&self, to: &str, _link: &str) -> Result<(), MailError> {
        tracing::warn!(to = %to, "Email notifications disabled, password reset not sent");
        Ok(())
    }
}

/// Mailer selected by `config`.
pub fn from_config(config: &EmailConfig, sender_host: &str) -> Arc<dyn Mailer> {
    match (&config.enable, &config.outbox) {
        (true, Some(dir)) => Arc::new(OutboxMailer::new(
            dir.clone(),
            format!("panel-gateway@{sender_host}"),
        )),
        _ => Arc::new(DisabledMailer),
    }
}
