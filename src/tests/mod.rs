//! tests/mod.rs
//! Pruebas de punta a punta contra una base SQLite temporal y un transporte
//! en memoria.

mod dispatch_tests;
mod support;
