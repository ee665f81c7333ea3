//! Challenge issuing.
//!
//! A challenge is the body of a `402 Payment Required` response: who to pay,
//! how much, and a single-use nonce the payment must carry. Issuing one writes
//! the nonce to the ephemeral store and a pending receipt to the durable
//! store, concurrently.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::amount::{format_amount, quantize};
use crate::error::{ConfigError, GateError};
use crate::pricing::{PriceQuote, TenantId};
use crate::receipt::{Metadata, ReceiptDraft};
use crate::replay::ReplayGuard;
use crate::store::ReceiptStore;
use crate::timestamp::UnixTimestamp;

/// Protocol tag sent in `X-402-Protocol`.
pub const PROTOCOL: &str = "x402";

/// Random bytes per nonce (256 bits).
pub const NONCE_BYTES: usize = 32;

/// Challenge and receipt header names.
pub mod header {
    /// Payee address.
    pub const PAY_TO: &str = "X-402-PayTo";
    /// Price as minimal decimal text.
    pub const AMOUNT: &str = "X-402-Amount";
    /// Single-use nonce.
    pub const NONCE: &str = "X-402-Nonce";
    /// Protocol tag.
    pub const PROTOCOL: &str = "X-402-Protocol";
    /// Currency code.
    pub const CURRENCY: &str = "X-402-Currency";
    /// Settlement network.
    pub const NETWORK: &str = "X-402-Network";
    /// Optional callback URL.
    pub const CALLBACK: &str = "X-402-Callback";
    /// Receipt presented by the client.
    pub const RECEIPT: &str = "X-402-Receipt";
}

/// Generates a URL-safe nonce from [`NONCE_BYTES`] bytes of OS randomness.
#[must_use]
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// What a nonce was issued for. Stored with the pending nonce and on the receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeSnapshot {
    /// Normalized path.
    pub path: String,
    /// Upper-case method.
    pub method: String,
    /// Required price.
    pub price: Decimal,
    /// Currency code.
    pub currency: String,
    /// Settlement network.
    pub network: String,
    /// Payee address.
    pub pay_to: String,
    /// Tenant owning the winning rule, else the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<TenantId>,
}

impl ChallengeSnapshot {
    /// Builds the pending receipt for `nonce` from this snapshot.
    #[must_use]
    pub fn to_draft(&self, nonce: &str) -> ReceiptDraft {
        let mut metadata = Metadata::new();
        if let Ok(challenge) = serde_json::to_value(self) {
            metadata.insert("challenge".to_owned(), challenge);
        }
        ReceiptDraft {
            nonce: nonce.to_owned(),
            amount: quantize(self.price),
            currency: self.currency.clone(),
            network: self.network.clone(),
            owner: self.owner,
            request_path: self.path.clone(),
            request_method: self.method.clone(),
            metadata,
        }
    }
}

/// An issued payment challenge.
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    /// Single-use nonce.
    pub nonce: String,
    /// Details the nonce is bound to.
    pub snapshot: ChallengeSnapshot,
    /// Optional callback URL.
    pub callback_url: Option<String>,
    /// Issue time.
    pub created_at: UnixTimestamp,
    /// Validity of the ephemeral nonce entry.
    pub ttl: Duration,
}

impl Challenge {
    /// Header name/value pairs of the `402` response, in a stable order.
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (header::PAY_TO, self.snapshot.pay_to.clone()),
            (header::AMOUNT, format_amount(self.snapshot.price)),
            (header::NONCE, self.nonce.clone()),
            (header::PROTOCOL, PROTOCOL.to_owned()),
            (header::CURRENCY, self.snapshot.currency.clone()),
            (header::NETWORK, self.snapshot.network.clone()),
        ];
        if let Some(callback) = &self.callback_url {
            headers.push((header::CALLBACK, callback.clone()));
        }
        headers
    }
}

/// Issues challenges for priced requests.
pub struct ChallengeIssuer {
    replay: Arc<ReplayGuard>,
    receipts: Arc<dyn ReceiptStore>,
    default_pay_to: String,
    currency: String,
    network: String,
    callback_url: Option<String>,
}

impl std::fmt::Debug for ChallengeIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeIssuer")
            .field("default_pay_to", &self.default_pay_to)
            .field("currency", &self.currency)
            .field("network", &self.network)
            .field("callback_url", &self.callback_url)
            .finish_non_exhaustive()
    }
}

impl ChallengeIssuer {
    /// Creates an issuer with the configured defaults.
    #[must_use]
    pub fn new(
        replay: Arc<ReplayGuard>,
        receipts: Arc<dyn ReceiptStore>,
        default_pay_to: impl Into<String>,
        currency: impl Into<String>,
        network: impl Into<String>,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            replay,
            receipts,
            default_pay_to: default_pay_to.into(),
            currency: currency.into(),
            network: network.into(),
            callback_url: callback_url.filter(|url| !url.trim().is_empty()),
        }
    }

    /// Payee for a quote: the winning rule's override, else the default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingPayTo`] if neither is set.
    pub fn resolve_pay_to(&self, quote: &PriceQuote) -> Result<String, ConfigError> {
        quote
            .rule
            .as_ref()
            .and_then(|rule| rule.pay_to.as_deref())
            .or(Some(self.default_pay_to.as_str()))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .ok_or(ConfigError::MissingPayTo)
    }

    /// Currency and network for a quote, rule overrides first.
    #[must_use]
    pub fn currency_and_network(&self, quote: &PriceQuote) -> (String, String) {
        let rule = quote.rule.as_ref();
        let currency = rule
            .and_then(|r| r.currency.clone())
            .unwrap_or_else(|| self.currency.clone());
        let network = rule
            .and_then(|r| r.network.clone())
            .unwrap_or_else(|| self.network.clone());
        (currency, network)
    }

    /// Issues a challenge for `quote`.
    ///
    /// The nonce goes to the ephemeral store and a pending receipt to the
    /// durable store. One failing write is logged; the challenge is still
    /// usable through the other. Both failing is an error.
    ///
    /// # Errors
    ///
    /// [`GateError::Configuration`] without a payee, [`GateError::Store`] when
    /// neither store accepts the nonce.
    pub async fn issue(
        &self,
        quote: &PriceQuote,
        tenant: Option<TenantId>,
        request_meta: &Metadata,
    ) -> Result<Challenge, GateError> {
        let pay_to = self.resolve_pay_to(quote)?;
        let (currency, network) = self.currency_and_network(quote);
        let nonce = generate_nonce();
        let snapshot = ChallengeSnapshot {
            path: quote.path.clone(),
            method: quote.method.clone(),
            price: quote.price,
            currency,
            network,
            pay_to,
            owner: quote.rule_owner().or(tenant),
        };

        let mut draft = snapshot.to_draft(&nonce);
        if !request_meta.is_empty() {
            draft
                .metadata
                .insert("request".to_owned(), request_meta.clone().into());
        }

        let (ephemeral, durable) = tokio::join!(
            self.replay.register(&nonce, snapshot.clone()),
            self.receipts.insert_or_fetch(draft),
        );
        match (ephemeral, durable) {
            (Err(ephemeral), Err(durable)) => {
                tracing::error!(nonce, error = %durable, ephemeral_error = %ephemeral, "Failed to record x402 challenge");
                return Err(durable.into());
            }
            (Err(err), Ok(_)) => {
                tracing::warn!(nonce, error = %err, "Failed to cache x402 nonce; durable receipt will back it");
            }
            (Ok(()), Err(err)) => {
                tracing::warn!(nonce, error = %err, "Failed to persist x402 receipt placeholder");
            }
            (Ok(()), Ok((_, created))) => {
                if !created {
                    tracing::debug!(nonce, "x402 receipt placeholder already existed");
                }
            }
        }

        tracing::debug!(nonce, path = %snapshot.path, amount = %format_amount(snapshot.price), "Issued x402 challenge");
        Ok(Challenge {
            nonce,
            snapshot,
            callback_url: self.callback_url.clone(),
            created_at: UnixTimestamp::now(),
            ttl: self.replay.ttl(),
        })
    }
}
