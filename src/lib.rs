//! lib.rs
//! Motor de envío del newsletter regulatorio ISO 50001: selección de
//! destinatarios, render, envío SMTP y registro de cada intento.

pub mod app;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod logger;
pub mod models;
pub mod services;

#[cfg(test)]
mod tests;
