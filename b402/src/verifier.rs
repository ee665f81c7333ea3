//! Receipt verifier contract and registry.
//!
//! A [`ReceiptVerifier`] checks a client-supplied receipt against an external
//! settlement ledger. The gate never interprets the ledger itself, so another
//! settlement rail only needs another implementation of this trait registered
//! under a new name in the [`VerifierRegistry`].
//!
//! Verifiers must report acceptance explicitly: an `Ok` result carries a
//! [`VerificationStatus`], and there is no implicit default.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::amount::amount_from_value;
use crate::error::{ConfigError, VerificationFailure};
use crate::receipt::Metadata;

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const B64_STANDARD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const B64_URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// Request-side facts a verifier checks the receipt against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationContext {
    /// Normalized request path.
    pub path: String,
    /// Upper-case request method.
    pub method: String,
    /// Address that must have received the funds.
    pub pay_to: String,
    /// Currency of the price.
    pub currency: String,
    /// Settlement network.
    pub network: String,
}

/// Explicit accept/reject signal of a verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationStatus {
    /// The payment is settled and acceptable.
    Confirmed,
    /// The ledger answered but the payment is final and unacceptable.
    Rejected {
        /// Machine-readable reason stored on the receipt.
        reason: String,
    },
}

/// Normalized outcome of a successful ledger lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationResult {
    /// Accept or reject.
    pub status: VerificationStatus,
    /// Nonce the receipt claims.
    pub nonce: String,
    /// Paying address, when the ledger reports one.
    pub payer: Option<String>,
    /// Amount the ledger shows as transferred.
    pub amount: Decimal,
    /// Ledger transaction id.
    pub transaction_id: String,
    /// Ledger details recorded on the receipt.
    pub metadata: Metadata,
}

impl VerificationResult {
    /// A confirmed result with no payer or metadata.
    #[must_use]
    pub fn confirmed(
        nonce: impl Into<String>,
        amount: Decimal,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self {
            status: VerificationStatus::Confirmed,
            nonce: nonce.into(),
            payer: None,
            amount,
            transaction_id: transaction_id.into(),
            metadata: Metadata::new(),
        }
    }

    /// Sets the payer.
    #[must_use]
    pub fn with_payer(mut self, payer: impl Into<String>) -> Self {
        self.payer = Some(payer.into());
        self
    }

    /// Replaces the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Marks the result rejected with `reason`.
    #[must_use]
    pub fn rejected(mut self, reason: impl Into<String>) -> Self {
        self.status = VerificationStatus::Rejected {
            reason: reason.into(),
        };
        self
    }
}

/// Checks receipts against a settlement ledger.
#[async_trait]
pub trait ReceiptVerifier: Send + Sync {
    /// Verifies `token` for a request priced at `price`.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationFailure`] when the receipt cannot be accepted
    /// now. The nonce stays pending, so the client may present it again.
    async fn verify(
        &self,
        token: &str,
        price: Decimal,
        context: &VerificationContext,
    ) -> Result<VerificationResult, VerificationFailure>;
}

/// Receipt header payload: JSON, raw or base64-encoded.
///
/// ```json
/// {"nonce": "…", "txid": "…", "amount": "0.75", "asset_id": 31566704, "metadata": {}}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReceiptPayload {
    /// Challenge nonce.
    #[serde(default)]
    pub nonce: Option<String>,
    /// Ledger transaction id.
    #[serde(default)]
    pub txid: Option<String>,
    /// Alternative spelling of [`Self::txid`].
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Amount the client claims to have paid.
    #[serde(default)]
    pub amount: Option<serde_json::Value>,
    /// Asset the client claims to have paid in.
    #[serde(default)]
    pub asset_id: Option<serde_json::Value>,
    /// Client-supplied metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl ReceiptPayload {
    /// Decodes a receipt token as raw JSON, then as base64 (standard or
    /// URL-safe alphabet) JSON.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationFailure::InvalidFormat`] if no candidate decodes
    /// to a JSON object.
    pub fn decode(token: &str) -> Result<Self, VerificationFailure> {
        let token = token.trim();
        if token.is_empty() {
            return Err(VerificationFailure::InvalidFormat("empty receipt".into()));
        }
        if let Ok(payload) = serde_json::from_str::<Self>(token) {
            return Ok(payload);
        }
        [B64_STANDARD, B64_URL_SAFE]
            .iter()
            .filter_map(|engine| engine.decode(token).ok())
            .find_map(|bytes| serde_json::from_slice::<Self>(&bytes).ok())
            .ok_or_else(|| {
                VerificationFailure::InvalidFormat("receipt is not JSON or base64 JSON".into())
            })
    }

    /// The nonce, required.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationFailure::MissingNonce`] when absent or blank.
    pub fn require_nonce(&self) -> Result<&str, VerificationFailure> {
        self.nonce
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(VerificationFailure::MissingNonce)
    }

    /// The transaction id (`txid`, else `transaction_id`), required.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationFailure::MissingTransactionId`] when absent or blank.
    pub fn require_transaction_id(&self) -> Result<&str, VerificationFailure> {
        [self.txid.as_deref(), self.transaction_id.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .ok_or(VerificationFailure::MissingTransactionId)
    }

    /// Declared amount, if present and numeric.
    #[must_use]
    pub fn declared_amount(&self) -> Option<Decimal> {
        self.amount.as_ref().and_then(|v| amount_from_value(v).ok())
    }

    /// Declared asset id, if present and a non-zero integer.
    #[must_use]
    pub fn asset_id(&self) -> Option<u64> {
        match self.asset_id.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .filter(|id| *id != 0)
    }

    /// Client metadata when it is a JSON object.
    #[must_use]
    pub fn metadata(&self) -> Metadata {
        match &self.metadata {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => Metadata::new(),
        }
    }
}

/// Verifiers available for selection by name.
#[derive(Default)]
pub struct VerifierRegistry(HashMap<String, Arc<dyn ReceiptVerifier>>);

impl Debug for VerifierRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.0.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_tuple("VerifierRegistry").field(&names).finish()
    }
}

impl VerifierRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Registers `verifier` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, verifier: Arc<dyn ReceiptVerifier>) {
        self.0.insert(name.into(), verifier);
    }

    /// Builder-style [`Self::register`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, verifier: Arc<dyn ReceiptVerifier>) -> Self {
        self.register(name, verifier);
        self
    }

    /// Looks up a verifier by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ReceiptVerifier>> {
        self.0.get(name).map(Arc::clone)
    }

    /// Resolves the configured verifier.
    ///
    /// # Errors
    ///
    /// [`ConfigError::VerifierNotConfigured`] without a name,
    /// [`ConfigError::UnknownVerifier`] for an unregistered one.
    pub fn select(&self, name: Option<&str>) -> Result<Arc<dyn ReceiptVerifier>, ConfigError> {
        let name = name
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::VerifierNotConfigured)?;
        self.get(name)
            .ok_or_else(|| ConfigError::UnknownVerifier(name.to_owned()))
    }
}
