#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! HTTP transport for the b402 payment gate.
//!
//! [`PaymentGateLayer`] wraps any tower service taking an `axum_core` request.
//! For every request it builds a [`b402::GateRequest`], asks the
//! [`b402::GateController`] for a decision and then either forwards the
//! request, forwards it with a [`b402::PaymentContext`] extension, or answers
//! `402 Payment Required` with the challenge headers.
//!
//! An upstream authenticator can scope pricing to a tenant by inserting a
//! [`b402::TenantId`] request extension before this layer runs.
//!
//! # Modules
//!
//! - [`constants`] - Header names, query parameters and response texts
//! - [`layer`] - The tower layer and service
//! - [`request`] - Mapping HTTP requests onto gate requests
//! - [`response`] - `402`, `500` and `503` responses

pub mod constants;
pub mod layer;
pub mod request;
pub mod response;

pub use layer::{PaymentGateLayer, PaymentGateService};
