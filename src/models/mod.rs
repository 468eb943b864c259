//! models/mod.rs
//! Módulo raíz para modelos/estructuras compartidas.

pub mod change_model;
pub mod customer_model;
pub mod dispatch_model;
pub mod newsletter_model;
