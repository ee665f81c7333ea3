#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for x402 pay-per-request payment gating.
//!
//! A gated endpoint answers an unpaid request with `402 Payment Required` and a
//! set of challenge headers (payee, amount, nonce). The client settles the
//! payment on an external ledger and retries with a receipt. This crate
//! decides prices, issues and tracks nonces, checks receipts through a
//! pluggable verifier and applies the bookkeeping that follows a confirmed
//! payment. It is transport-agnostic; see `b402-http` for the tower layer.
//!
//! # Modules
//!
//! - [`amount`] - Fixed-point amount parsing, quantization and fee splits
//! - [`challenge`] - Nonce generation and challenge issuing
//! - [`config`] - Gate configuration and global pricing rules
//! - [`error`] - Error taxonomy shared by every component
//! - [`gate`] - The per-request state machine tying everything together
//! - [`ledger`] - Payment-link and credit-plan effects of confirmed payments
//! - [`memory`] - In-process store implementations for tests and single-node use
//! - [`pricing`] - Path patterns, tenant rules and price resolution
//! - [`receipt`] - Durable receipt records and their lifecycle
//! - [`replay`] - Two-tier nonce replay protection
//! - [`store`] - Storage traits the gate is generic over
//! - [`verifier`] - Receipt verifier contract and registry

pub mod amount;
pub mod challenge;
pub mod config;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod memory;
pub mod pricing;
pub mod receipt;
pub mod replay;
pub mod store;
pub mod timestamp;
pub mod verifier;

pub use config::GateConfig;
pub use error::{ConfigError, GateError, StoreError};
pub use gate::{GateController, GateDecision, GateRequest, PaymentContext};
pub use pricing::TenantId;
pub use verifier::{ReceiptVerifier, VerificationResult, VerifierRegistry};
