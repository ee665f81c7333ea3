#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! SQLite backend for the b402 payment gate.
//!
//! [`SqliteStore`] implements every storage trait of `b402`: the shared nonce
//! cache, durable receipts, tenant pricing rules and the payment ledger. One
//! database file can be opened by several gateway processes; writes that must
//! be atomic run inside `BEGIN IMMEDIATE` transactions and SQLite's busy
//! timeout serialises them across processes.
//!
//! Besides the trait operations the store exposes the administrative writes a
//! dashboard needs: creating or editing tenant rules, payment links and credit
//! plans. Saving a link or plan keeps its pricing rule in step within the same
//! transaction.

mod error;
mod ledger;
mod nonces;
mod receipts;
mod rules;
mod store;

pub use error::SqliteError;
pub use store::SqliteStore;
