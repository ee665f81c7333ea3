//! b402 paywall gateway.
//!
//! Serves the paywall resources stored in SQLite (payment links, widgets and
//! credit plans) behind the x402 payment gate, plus the credit consumption
//! endpoint and a reconciliation pass for confirmed receipts whose ledger
//! effect was never applied.
//!
//! # Modules
//!
//! - [`config`] - Server configuration with environment variable expansion
//! - [`error`] - Gateway error types and their HTTP mapping
//! - [`handlers`] - Axum route handlers and router builder
//! - [`app`] - Wiring of store, verifiers and gate
//! - [`util`] - Shutdown signal handling

pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod util;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use handlers::{GatewayState, gateway_router};
