//! config/app_config.rs
//! Configuración de la app leída del entorno (.env incluido).
//! Cada componente recibe su parte en el constructor; no hay estado global.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub smtp: SmtpConfig,
    pub template: TemplateConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls_required: bool,
    /// Dirección "From" de los newsletters
    pub from_address: String,
    pub timeout: Duration,
}

// El password no sale nunca en logs.
impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tls_required", &self.tls_required)
            .field("from_address", &self.from_address)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TemplateConfig {
    pub subject: String,
    /// Si es None se usa la plantilla embebida.
    pub body_path: Option<PathBuf>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        TemplateConfig {
            subject: TemplateConfig::DEFAULT_SUBJECT.to_string(),
            body_path: None,
        }
    }
}

impl TemplateConfig {
    pub const DEFAULT_SUBJECT: &'static str = "ISO 50001 Update {{ quarter }}";
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub workers: usize,
    pub max_failed_attempts: i64,
    pub send_timeout: Duration,
    pub stale_pending_after: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            workers: 4,
            max_failed_attempts: 3,
            send_timeout: Duration::from_secs(30),
            stale_pending_after: Duration::from_secs(3600),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            smtp: SmtpConfig::from_env()?,
            template: TemplateConfig::from_env(),
            dispatch: DispatchConfig::from_env()?,
        })
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_var("PORT", 5022)?,
        })
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:data/iso_newsletter_app.db".to_string()),
            max_connections: parse_var("DB_MAX_CONNECTIONS", 5)?,
        })
    }
}

impl SmtpConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = required_var("SMTP_HOST")?;
        let username = required_var("SMTP_USERNAME")?;
        let password = required_var("SMTP_PASSWORD")?;
        let from_address = env::var("SMTP_FROM").unwrap_or_else(|_| username.clone());

        Ok(SmtpConfig {
            host,
            port: parse_var("SMTP_PORT", 587)?,
            username,
            password,
            tls_required: parse_var("SMTP_USE_TLS", true)?,
            from_address,
            timeout: Duration::from_secs(parse_var("SMTP_TIMEOUT_SECS", 30)?),
        })
    }
}

impl TemplateConfig {
    pub fn from_env() -> Self {
        TemplateConfig {
            subject: env::var("NEWSLETTER_SUBJECT")
                .unwrap_or_else(|_| TemplateConfig::DEFAULT_SUBJECT.to_string()),
            body_path: env::var("NEWSLETTER_TEMPLATE_PATH").ok().map(PathBuf::from),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = DispatchConfig::default();
        let workers: usize = parse_var("DISPATCH_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                key: "DISPATCH_WORKERS",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(DispatchConfig {
            workers,
            max_failed_attempts: parse_var(
                "DISPATCH_MAX_FAILED_ATTEMPTS",
                defaults.max_failed_attempts,
            )?,
            send_timeout: Duration::from_secs(parse_var(
                "DISPATCH_SEND_TIMEOUT_SECS",
                defaults.send_timeout.as_secs(),
            )?),
            stale_pending_after: Duration::from_secs(parse_var(
                "DISPATCH_STALE_PENDING_SECS",
                defaults.stale_pending_after.as_secs(),
            )?),
        })
    }
}

fn required_var(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn parse_var<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
