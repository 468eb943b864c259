//! services/mod.rs
//! Módulo que agrupa distintos "servicios" o "capas de negocio" de la app.

pub mod dispatch_service;
pub mod mail_transport;
pub mod newsletter_service;
pub mod newsletter_store;
pub mod targeting;
pub mod template_service;
