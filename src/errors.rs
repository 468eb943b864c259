//! errors.rs
//! Errores tipados del núcleo de envío. Los errores del store siguen siendo
//! `anyhow::Error` con contexto; aquí solo lo que el motor necesita distinguir.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Plantilla mal formada o que usa un campo inexistente.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("could not load template from {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("malformed template '{name}': {reason}")]
    Syntax { name: &'static str, reason: String },

    #[error("failed to render template '{name}': {reason}")]
    Render { name: &'static str, reason: String },
}

/// Per-recipient delivery failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("recipient {address} rejected: {reason}")]
    Rejected { address: String, reason: String },

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

/// Errores que abortan la corrida completa.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("targeting failed: {0:#}")]
    Targeting(anyhow::Error),

    #[error("invalid dispatch request: {0}")]
    InvalidRequest(String),
}

impl From<ConfigError> for DispatchError {
    fn from(e: ConfigError) -> Self {
        DispatchError::Configuration(e.to_string())
    }
}
