//! Error taxonomy of the payment gate.
//!
//! Only [`GateError`] ever escapes the per-request entry point, and it carries
//! just the genuinely fatal kinds: a configuration defect or an unavailable
//! store. [`VerificationFailure`] and [`ReplayRejected`] are ordinary outcomes
//! that end in the same uniform `402` challenge. [`LedgerEffectError`] is
//! logged after confirmation and never revokes access.

use rust_decimal::Decimal;

use crate::amount::AmountError;
use crate::receipt::ReceiptStatus;

/// A configuration defect. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Paywall enabled but no payee address is available.
    #[error("x402 is enabled but no pay-to address is configured")]
    MissingPayTo,
    /// Paywall enabled but no verifier was selected.
    #[error("x402 is enabled but no receipt verifier is configured")]
    VerifierNotConfigured,
    /// The selected verifier name is not registered.
    #[error("unknown receipt verifier {0:?}")]
    UnknownVerifier(String),
    /// Any other malformed setting.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure reported by a durable or ephemeral store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The backend could not be reached or returned an I/O error.
    #[error("storage backend failure: {0}")]
    Backend(String),
    /// A stored value failed to (de)serialize.
    #[error("stored value is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A stored amount is not a valid decimal.
    #[error("stored amount is malformed: {0}")]
    Amount(#[from] AmountError),
    /// A credit debit exceeded the available balance.
    #[error("insufficient credits: {available} available, {requested} requested")]
    InsufficientCredits {
        /// Balance before the debit.
        available: i64,
        /// Credits the caller asked for.
        requested: i64,
    },
    /// The referenced row does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// The caller supplied a value the store refuses.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    /// Wraps any displayable backend error.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Why a receipt was not accepted by a verifier.
///
/// Every variant leads to the same external response; the distinction exists
/// for logs and for the `rejection_reason` stored on the receipt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum VerificationFailure {
    /// The receipt token is neither JSON nor base64-encoded JSON.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    /// The receipt payload has no `nonce`.
    #[error("Receipt is missing a nonce")]
    MissingNonce,
    /// The receipt payload has no `txid` / `transaction_id`.
    #[error("Receipt is missing a transaction id")]
    MissingTransactionId,
    /// The ledger does not know the transaction.
    #[error("Transaction not found")]
    TransactionNotFound,
    /// The transaction is not the kind of transfer the verifier accepts.
    #[error("Unsupported transaction type {0:?}")]
    UnsupportedTransaction(String),
    /// The transferred asset is not the expected one.
    #[error("Payment asset is invalid with respect to the challenge")]
    AssetMismatch,
    /// The transfer went to someone other than the payee.
    #[error("Payment recipient is invalid with respect to the challenge")]
    RecipientMismatch,
    /// The transferred amount is below the price.
    #[error("Payment amount {received} is below the required {required}")]
    InsufficientAmount {
        /// Price of the gated request.
        required: Decimal,
        /// Amount the ledger shows.
        received: Decimal,
    },
    /// The transaction has not reached a confirmed round.
    #[error("Transaction is not confirmed yet")]
    Unconfirmed,
    /// The transaction note does not carry the nonce.
    #[error("Transaction note does not contain the challenge nonce")]
    NonceNotBound,
    /// The transaction already settled a different receipt.
    #[error("Transaction already settled another challenge")]
    TransactionReused,
    /// The ledger could not be queried (network, timeout, bad response).
    #[error("Ledger query failed: {0}")]
    Ledger(String),
}

impl VerificationFailure {
    /// Machine-readable reason code.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::InvalidFormat(_) => "invalid_format",
            Self::MissingNonce => "missing_nonce",
            Self::MissingTransactionId => "missing_transaction_id",
            Self::TransactionNotFound => "transaction_not_found",
            Self::UnsupportedTransaction(_) => "unsupported_transaction",
            Self::AssetMismatch => "asset_mismatch",
            Self::RecipientMismatch => "recipient_mismatch",
            Self::InsufficientAmount { .. } => "amount_below_required",
            Self::Unconfirmed => "unconfirmed",
            Self::NonceNotBound => "nonce_not_bound",
            Self::TransactionReused => "transaction_reused",
            Self::Ledger(_) => "ledger_unavailable",
        }
    }
}

impl From<serde_json::Error> for VerificationFailure {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidFormat(value.to_string())
    }
}

/// Why the replay guard refused a nonce.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayRejected {
    /// Neither store knows the nonce.
    #[error("nonce is unknown or expired")]
    UnknownNonce,
    /// The ephemeral store has the nonce marked consumed.
    #[error("nonce was already consumed")]
    AlreadyConsumed,
    /// The durable receipt already reached a terminal status.
    #[error("receipt already {0}")]
    Terminal(ReceiptStatus),
    /// The receipt was issued for a different request.
    #[error("nonce was issued for {expected}, presented on {actual}")]
    BindingMismatch {
        /// `METHOD path` the challenge was issued for.
        expected: String,
        /// `METHOD path` of the current request.
        actual: String,
    },
    /// Another request won the race to finalize this nonce.
    #[error("nonce was finalized concurrently")]
    LostRace,
}

/// Post-confirmation bookkeeping failed.
#[derive(Debug, thiserror::Error)]
pub enum LedgerEffectError {
    /// The durable store refused the write.
    #[error("ledger store error: {0}")]
    Store(#[from] StoreError),
    /// Fee computation failed.
    #[error("fee computation failed: {0}")]
    Amount(#[from] AmountError),
    /// Effects are only applied to confirmed receipts.
    #[error("receipt {0} is not confirmed")]
    NotConfirmed(String),
}

/// Fatal error of the gate entry point.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Misconfiguration such as a missing payee.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    /// A store the gate depends on is unavailable.
    #[error(transparent)]
    Store(#[from] StoreError),
}
