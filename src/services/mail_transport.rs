//! services/mail_transport.rs
//! Envío SMTP. Sin reintentos: eso lo decide el motor de envíos.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
        PoolConfig,
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;

use crate::config::app_config::SmtpConfig;
use crate::errors::{ConfigError, TransportError};

/// Addresses the server accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub accepted: Vec<String>,
}

/// Outbound mail capability used by the dispatch engine.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        from: &str,
        to: &[String],
        subject: &str,
        body_html: &str,
    ) -> Result<SendReceipt, TransportError>;
}

#[derive(Clone)]
pub struct SmtpMailer {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    timeout: Duration,
}

impl SmtpMailer {
    /// `max_connections` bounds the lettre pool; each concurrent sender gets
    /// its own connection.
    pub fn new(config: &SmtpConfig, max_connections: u32) -> Result<Self, ConfigError> {
        config
            .from_address
            .parse::<Mailbox>()
            .map_err(|e| ConfigError::Invalid {
                key: "SMTP_FROM",
                reason: e.to_string(),
            })?;

        let tls = if config.tls_required {
            let params = TlsParameters::new(config.host.clone()).map_err(|e| ConfigError::Invalid {
                key: "SMTP_HOST",
                reason: e.to_string(),
            })?;
            Tls::Required(params)
        } else {
            log::warn!("SMTP sin TLS hacia {}:{}", config.host, config.port);
            Tls::None
        };

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .tls(tls)
            .timeout(Some(config.timeout))
            .pool_config(PoolConfig::new().max_size(max_connections.max(1)))
            .build();

        Ok(SmtpMailer {
            mailer,
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(
        &self,
        from: &str,
        to: &[String],
        subject: &str,
        body_html: &str,
    ) -> Result<SendReceipt, TransportError> {
        let from: Mailbox = from.parse().map_err(|e| TransportError::Rejected {
            address: from.to_string(),
            reason: format!("invalid from address: {e}"),
        })?;

        let mut builder = Message::builder().from(from).subject(subject);
        for recip_str in to {
            let mailbox: Mailbox = recip_str.parse().map_err(|e| TransportError::Rejected {
                address: recip_str.clone(),
                reason: format!("invalid recipient address: {e}"),
            })?;
            builder = builder.to(mailbox);
        }

        let message = builder
            .header(ContentType::TEXT_HTML)
            .body(body_html.to_string())
            .map_err(|e| TransportError::Rejected {
                address: to.join(", "),
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(self.timeout, self.mailer.send(message)).await {
            Ok(Ok(_response)) => Ok(SendReceipt {
                accepted: to.to_vec(),
            }),
            Ok(Err(e)) => Err(classify_smtp_error(&e, to, self.timeout)),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

/// Maps lettre's error onto the transport taxonomy. 530/534/535/538 are the
/// authentication replies; any other server reply is a rejection.
fn classify_smtp_error(
    err: &lettre::transport::smtp::Error,
    to: &[String],
    timeout: Duration,
) -> TransportError {
    let reason = err.to_string();
    if err.is_timeout() {
        return TransportError::Timeout(timeout);
    }

    let code = err.status().map(|code| code.to_string());
    match code.as_deref() {
        Some("530" | "534" | "535" | "538") => TransportError::AuthenticationFailed(reason),
        Some(_) if err.is_permanent() || err.is_transient() => TransportError::Rejected {
            address: to.join(", "),
            reason,
        },
        _ if reason.to_lowercase().contains("authentication") => {
            TransportError::AuthenticationFailed(reason)
        }
        _ => TransportError::ConnectionFailed(reason),
    }
}
