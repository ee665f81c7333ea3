//! Two-tier nonce replay protection.
//!
//! The ephemeral [`NonceCache`] answers the hot path: a `consumed` entry
//! rejects immediately. When the entry has expired the durable receipt
//! decides, and only a `pending` receipt may still be consumed. The durable
//! compare-and-swap in [`ReceiptStore::finalize`] is what makes consumption
//! happen at most once across processes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::challenge::ChallengeSnapshot;
use crate::error::{ReplayRejected, StoreError};
use crate::receipt::{ReceiptOutcome, ReceiptRecord};
use crate::store::{NonceCache, ReceiptStore};

/// State of a nonce in the ephemeral store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonceState {
    /// Challenge issued, not yet used.
    Pending,
    /// Used; any further presentation is a replay.
    Consumed,
}

/// Value stored under `{namespace}:nonce:{nonce}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonceEntry {
    /// Lifecycle state.
    pub status: NonceState,
    /// Challenge details, present while pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeSnapshot>,
}

impl NonceEntry {
    /// A freshly issued challenge.
    #[must_use]
    pub const fn pending(challenge: ChallengeSnapshot) -> Self {
        Self {
            status: NonceState::Pending,
            challenge: Some(challenge),
        }
    }

    /// A consumed marker.
    #[must_use]
    pub const fn consumed() -> Self {
        Self {
            status: NonceState::Consumed,
            challenge: None,
        }
    }
}

/// Either a replay refusal or a store failure.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The nonce may not be consumed.
    #[error(transparent)]
    Rejected(#[from] ReplayRejected),
    /// A store could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tracks nonces from issue to consumption.
pub struct ReplayGuard {
    cache: Arc<dyn NonceCache>,
    receipts: Arc<dyn ReceiptStore>,
    namespace: String,
    ttl: Duration,
}

impl std::fmt::Debug for ReplayGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayGuard")
            .field("namespace", &self.namespace)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ReplayGuard {
    /// Creates a guard over the given stores.
    #[must_use]
    pub fn new(
        cache: Arc<dyn NonceCache>,
        receipts: Arc<dyn ReceiptStore>,
        namespace: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            receipts,
            namespace: namespace.into(),
            ttl,
        }
    }

    /// Ephemeral-store key of a nonce.
    #[must_use]
    pub fn key(&self, nonce: &str) -> String {
        format!("{}:nonce:{nonce}", self.namespace)
    }

    /// Challenge TTL.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Records a freshly issued nonce as pending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the ephemeral store rejects the write.
    pub async fn register(&self, nonce: &str, challenge: ChallengeSnapshot) -> Result<(), StoreError> {
        self.cache
            .set(&self.key(nonce), &NonceEntry::pending(challenge), self.ttl)
            .await
    }

    /// Checks that `nonce` may still be consumed by `method path`.
    ///
    /// Returns the pending receipt on success. If the durable placeholder was
    /// never written but the ephemeral entry still holds the challenge, the
    /// placeholder is created from it.
    ///
    /// # Errors
    ///
    /// [`ReplayError::Rejected`] when the nonce is consumed, unknown, terminal
    /// or bound to another request; [`ReplayError::Store`] on store failure.
    pub async fn check(
        &self,
        nonce: &str,
        path: &str,
        method: &str,
    ) -> Result<ReceiptRecord, ReplayError> {
        let entry = self.cache.get(&self.key(nonce)).await?;
        if entry
            .as_ref()
            .is_some_and(|e| e.status == NonceState::Consumed)
        {
            return Err(ReplayRejected::AlreadyConsumed.into());
        }

        let receipt = match self.receipts.fetch(nonce).await? {
            Some(receipt) => receipt,
            None => {
                let Some(challenge) = entry.and_then(|e| e.challenge) else {
                    return Err(ReplayRejected::UnknownNonce.into());
                };
                let (receipt, _) = self
                    .receipts
                    .insert_or_fetch(challenge.to_draft(nonce))
                    .await?;
                receipt
            }
        };

        if receipt.status.is_terminal() {
            return Err(ReplayRejected::Terminal(receipt.status).into());
        }
        let actual = format!("{method} {path}");
        if receipt.binding() != actual {
            return Err(ReplayRejected::BindingMismatch {
                expected: receipt.binding(),
                actual,
            }
            .into());
        }
        Ok(receipt)
    }

    /// Marks `nonce` consumed and moves its receipt to a terminal status.
    ///
    /// The ephemeral marker is written first; a failure there is logged and
    /// the durable transition still decides.
    ///
    /// # Errors
    ///
    /// [`ReplayRejected::LostRace`] when the receipt was finalized by someone
    /// else; [`ReplayError::Store`] when the durable store fails.
    pub async fn finalize(
        &self,
        nonce: &str,
        outcome: ReceiptOutcome,
    ) -> Result<ReceiptRecord, ReplayError> {
        if let Err(err) = self
            .cache
            .set(&self.key(nonce), &NonceEntry::consumed(), self.ttl)
            .await
        {
            tracing::warn!(nonce, error = %err, "Failed to mark x402 nonce consumed in ephemeral store");
        }
        self.receipts
            .finalize(nonce, outcome)
            .await?
            .ok_or_else(|| ReplayRejected::LostRace.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNonceCache, MemoryStore};
    use crate::receipt::{Metadata, ReceiptStatus};
    use rust_decimal::Decimal;

    fn snapshot() -> ChallengeSnapshot {
        ChallengeSnapshot {
            path: "/paid".into(),
            method: "GET".into(),
            price: Decimal::ONE,
            currency: "USDC".into(),
            network: "algorand".into(),
            pay_to: "PAYEE".into(),
            owner: None,
        }
    }

    fn confirmed() -> ReceiptOutcome {
        ReceiptOutcome::Confirmed {
            amount: Decimal::ONE,
            payer: None,
            receipt_token: "tok".into(),
            metadata: Metadata::new(),
        }
    }

    fn guard(ttl: Duration) -> (ReplayGuard, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let guard = ReplayGuard::new(
            Arc::new(MemoryNonceCache::new()),
            Arc::clone(&store) as Arc<dyn ReceiptStore>,
            "x402",
            ttl,
        );
        (guard, store)
    }

    #[tokio::test]
    async fn test_unknown_nonce_is_rejected() {
        let (guard, _) = guard(Duration::from_secs(60));
        let err = guard.check("nope", "/paid", "GET").await.unwrap_err();
        assert!(matches!(err, ReplayError::Rejected(ReplayRejected::UnknownNonce)));
    }

    #[tokio::test]
    async fn test_pending_nonce_recreates_missing_placeholder() {
        let (guard, store) = guard(Duration::from_secs(60));
        guard.register("n1", snapshot()).await.unwrap();
        let receipt = guard.check("n1", "/paid", "GET").await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Pending);
        assert!(store.fetch("n1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_consumed_nonce_is_rejected_even_after_expiry() {
        let (guard, _) = guard(Duration::from_millis(200));
        guard.register("n1", snapshot()).await.unwrap();
        guard.check("n1", "/paid", "GET").await.unwrap();
        guard.finalize("n1", confirmed()).await.unwrap();

        let err = guard.check("n1", "/paid", "GET").await.unwrap_err();
        assert!(matches!(err, ReplayError::Rejected(ReplayRejected::AlreadyConsumed)));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let err = guard.check("n1", "/paid", "GET").await.unwrap_err();
        assert!(matches!(
            err,
            ReplayError::Rejected(ReplayRejected::Terminal(ReceiptStatus::Confirmed))
        ));
    }

    #[tokio::test]
    async fn test_second_finalize_loses() {
        let (guard, _) = guard(Duration::from_secs(60));
        guard.register("n1", snapshot()).await.unwrap();
        guard.check("n1", "/paid", "GET").await.unwrap();
        guard.finalize("n1", confirmed()).await.unwrap();
        let err = guard.finalize("n1", confirmed()).await.unwrap_err();
        assert!(matches!(err, ReplayError::Rejected(ReplayRejected::LostRace)));
    }

    #[tokio::test]
    async fn test_nonce_bound_to_challenge_request() {
        let (guard, _) = guard(Duration::from_secs(60));
        guard.register("n1", snapshot()).await.unwrap();
        let err = guard.check("n1", "/other", "GET").await.unwrap_err();
        assert!(matches!(
            err,
            ReplayError::Rejected(ReplayRejected::BindingMismatch { .. })
        ));
        // the nonce is still usable on the right request
        assert!(guard.check("n1", "/paid", "GET").await.is_ok());
    }

    #[test]
    fn test_key_uses_namespace() {
        let (guard, _) = guard(Duration::from_secs(1));
        assert_eq!(guard.key("abc"), "x402:nonce:abc");
    }
}
