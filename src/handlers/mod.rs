//! handlers/mod.rs
pub mod change_handler;
pub mod dispatch_handler;
pub mod newsletter_handler;
