//! Receipt verification against Algorand asset transfers.

use std::time::Duration;

use async_trait::async_trait;
use b402::error::VerificationFailure;
use b402::receipt::Metadata;
use b402::verifier::{ReceiptPayload, ReceiptVerifier, VerificationContext, VerificationResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::config::AlgorandConfig;
use crate::indexer::{IndexerClient, IndexerError, Transaction};

/// Transaction type of an asset transfer.
const ASSET_TRANSFER: &str = "axfer";

/// Verifies receipts by looking their transaction up on an indexer.
///
/// Problems with the transaction itself (wrong type, asset, receiver, amount
/// or note) are final and reported as a rejected [`VerificationResult`].
/// Problems that may clear up on retry (bad payload, unknown or unconfirmed
/// transaction, indexer outage) are returned as [`VerificationFailure`] and
/// leave the nonce pending.
#[derive(Debug, Clone)]
pub struct AlgorandVerifier {
    client: IndexerClient,
    default_asset_id: u64,
    asset_decimals: u32,
}

impl AlgorandVerifier {
    /// Registry name of this verifier.
    pub const NAME: &'static str = "algorand";

    /// Creates a verifier over an indexer client.
    #[must_use]
    pub const fn new(client: IndexerClient, default_asset_id: u64, asset_decimals: u32) -> Self {
        Self {
            client,
            default_asset_id,
            asset_decimals,
        }
    }

    /// Builds the client and verifier from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError`] if the indexer URL is unusable.
    pub fn from_config(config: &AlgorandConfig) -> Result<Self, IndexerError> {
        let client = IndexerClient::try_from(config.indexer_url.as_str())?
            .with_api_token(config.api_token().map(str::to_owned))
            .with_timeout(Duration::from_secs(config.timeout_seconds.max(1)));
        Ok(Self::new(
            client,
            config.default_asset_id(),
            config.asset_decimals,
        ))
    }

    async fn fetch(&self, txid: &str) -> Result<Transaction, VerificationFailure> {
        match self.client.transaction(txid).await {
            Ok(response) => response
                .transaction
                .ok_or(VerificationFailure::TransactionNotFound),
            Err(err) if err.is_not_found() => Err(VerificationFailure::TransactionNotFound),
            Err(err) => {
                tracing::warn!(tx_id = txid, error = %err, "Algorand indexer lookup failed");
                Err(VerificationFailure::Ledger(err.to_string()))
            }
        }
    }

    fn to_decimal(&self, base_units: u64) -> Result<Decimal, VerificationFailure> {
        Decimal::try_from_i128_with_scale(i128::from(base_units), self.asset_decimals)
            .map_err(|e| VerificationFailure::Ledger(format!("amount out of range: {e}")))
    }
}

fn decode_note(note: Option<&str>) -> Option<String> {
    let bytes = STANDARD.decode(note?.trim()).ok()?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    (!text.is_empty()).then_some(text)
}

#[async_trait]
impl ReceiptVerifier for AlgorandVerifier {
    async fn verify(
        &self,
        token: &str,
        price: Decimal,
        context: &VerificationContext,
    ) -> Result<VerificationResult, VerificationFailure> {
        let payload = ReceiptPayload::decode(token)?;
        let nonce = payload.require_nonce()?;
        let txid = payload.require_transaction_id()?;
        let expected_asset = payload.asset_id().unwrap_or(self.default_asset_id);

        let tx = self.fetch(txid).await?;
        let payer = tx.sender.clone();
        let rejected = |failure: VerificationFailure,
                        amount: Decimal|
         -> Result<VerificationResult, VerificationFailure> {
            tracing::warn!(tx_id = txid, nonce, error = %failure, "Algorand receipt rejected");
            let result = VerificationResult::confirmed(nonce, amount, txid);
            let result = match &payer {
                Some(payer) => result.with_payer(payer.clone()),
                None => result,
            };
            Ok(result.rejected(failure.reason()))
        };

        let tx_type = tx.tx_type.as_deref().unwrap_or_default();
        let Some(transfer) = tx
            .asset_transfer_transaction
            .as_ref()
            .filter(|_| tx_type == ASSET_TRANSFER)
        else {
            return rejected(
                VerificationFailure::UnsupportedTransaction(tx_type.to_owned()),
                Decimal::ZERO,
            );
        };
        if transfer.asset_id != expected_asset {
            return rejected(VerificationFailure::AssetMismatch, Decimal::ZERO);
        }

        let receiver = transfer.receiver.as_deref().unwrap_or_default();
        if receiver.is_empty() || !receiver.eq_ignore_ascii_case(context.pay_to.trim()) {
            return rejected(VerificationFailure::RecipientMismatch, Decimal::ZERO);
        }

        let Some(base_units) = transfer.amount else {
            return rejected(
                VerificationFailure::UnsupportedTransaction("asset transfer without amount".into()),
                Decimal::ZERO,
            );
        };
        let amount = self.to_decimal(base_units)?;
        if amount < price {
            return rejected(
                VerificationFailure::InsufficientAmount {
                    required: price,
                    received: amount,
                },
                amount,
            );
        }

        let note = decode_note(tx.note.as_deref());
        if note.as_deref().is_some_and(|n| !n.contains(nonce)) {
            return rejected(VerificationFailure::NonceNotBound, amount);
        }

        let Some(confirmed_round) = tx.confirmed_round.filter(|r| *r > 0) else {
            tracing::info!(tx_id = txid, "Algorand transaction not confirmed yet");
            return Err(VerificationFailure::Unconfirmed);
        };

        let mut metadata = Metadata::new();
        metadata.insert("transaction_id".into(), txid.into());
        metadata.insert("asset_id".into(), transfer.asset_id.into());
        metadata.insert("confirmed_round".into(), confirmed_round.into());
        metadata.insert("receiver".into(), receiver.into());
        metadata.insert("note".into(), note.map_or(Value::Null, Value::String));
        if let Some(declared) = payload.declared_amount().filter(|d| *d > amount) {
            metadata.insert("declared_amount".into(), declared.normalize().to_string().into());
        }
        for (key, value) in payload.metadata() {
            metadata.entry(key).or_insert(value);
        }

        tracing::debug!(tx_id = txid, nonce, %amount, confirmed_round, "Algorand transfer verified");
        let result = VerificationResult::confirmed(nonce, amount, txid).with_metadata(metadata);
        Ok(match payer {
            Some(payer) => result.with_payer(payer),
            None => result,
        })
    }
}
