#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Algorand settlement rail for b402.
//!
//! [`AlgorandVerifier`] implements [`b402::ReceiptVerifier`] by looking up the
//! receipt's transaction on an Algorand indexer and checking that it is a
//! confirmed asset transfer of the expected asset, to the expected payee, for
//! at least the required amount, with the challenge nonce in its note.
//!
//! ```ignore
//! let verifier = AlgorandVerifier::from_config(&AlgorandConfig::testnet("https://testnet-idx.algonode.cloud"))?;
//! let registry = VerifierRegistry::new().with(AlgorandVerifier::NAME, Arc::new(verifier));
//! ```

pub mod config;
pub mod indexer;
pub mod verifier;

pub use config::{AlgorandConfig, AlgorandNetwork};
pub use indexer::{IndexerClient, IndexerError};
pub use verifier::AlgorandVerifier;
