//! The per-request payment state machine.
//!
//! ```text
//! NO_PRICE ──────────────────────────────────────────────▶ pass through
//! priced, no receipt ─────────────────────────────────────▶ challenge (new nonce)
//! priced + receipt ─▶ replay check ─▶ verify ─▶ amount ≥ price ─▶ admit
//!                         │              │           │
//!                         └──────────────┴───────────┴─────▶ challenge (new nonce)
//! ```
//!
//! Every denial produces a fresh challenge, whatever the cause, so the
//! response never reveals which check failed. Only configuration defects and
//! unavailable stores surface as [`GateError`].

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::instrument;

use crate::amount::{format_amount, quantize};
use crate::challenge::{Challenge, ChallengeIssuer, ChallengeSnapshot};
use crate::config::GateConfig;
use crate::error::{ConfigError, GateError, StoreError, VerificationFailure};
use crate::ledger::{CONSUMER_HINT_KEY, LedgerEffect, LedgerPostProcessor};
use crate::memory::{MemoryNonceCache, MemoryStore};
use crate::pricing::{PriceQuote, PricingResolver, TenantId};
use crate::receipt::{Metadata, ReceiptOutcome, ReceiptRecord};
use crate::replay::{ReplayError, ReplayGuard};
use crate::store::{LedgerStore, NonceCache, PricingRuleStore, ReceiptStore};
use crate::verifier::{
    ReceiptPayload, ReceiptVerifier, VerificationContext, VerificationStatus, VerifierRegistry,
};

/// Transport-independent view of an inbound request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateRequest {
    /// Request path, normalized by the gate.
    pub path: String,
    /// Request method.
    pub method: String,
    /// Tenant established by an upstream authenticator.
    pub tenant: Option<TenantId>,
    /// Raw `X-402-Receipt` value.
    pub receipt: Option<String>,
    /// Consumer reference supplied by the caller for credit plans.
    pub consumer: Option<String>,
    /// Client details recorded on the receipt.
    pub request_meta: Metadata,
}

impl GateRequest {
    /// A request without tenant, receipt or metadata.
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    /// Sets the authenticated tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant: Option<TenantId>) -> Self {
        self.tenant = tenant;
        self
    }

    /// Sets the presented receipt token.
    #[must_use]
    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }

    /// Sets the consumer reference.
    #[must_use]
    pub fn with_consumer(mut self, consumer: Option<String>) -> Self {
        self.consumer = consumer;
        self
    }

    /// Sets the request metadata.
    #[must_use]
    pub fn with_request_meta(mut self, request_meta: Metadata) -> Self {
        self.request_meta = request_meta;
        self
    }

    fn receipt_token(&self) -> Option<&str> {
        self.receipt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn consumer_hint(&self) -> Option<&str> {
        self.consumer
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Payment details handed to the downstream handler on admit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentContext {
    /// Consumed nonce.
    pub nonce: String,
    /// Amount the ledger confirmed.
    pub amount: Decimal,
    /// Price that was required.
    pub required: Decimal,
    /// Paying address.
    pub payer: Option<String>,
    /// Ledger transaction id.
    pub transaction_id: String,
    /// Currency code.
    pub currency: String,
    /// Settlement network.
    pub network: String,
    /// Payee address.
    pub pay_to: String,
    /// Verifier metadata.
    pub metadata: Metadata,
    /// Bookkeeping applied for the payment, if any.
    pub ledger_effect: Option<LedgerEffect>,
}

/// What to do with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// No price applies; forward the request untouched.
    PassThrough,
    /// Paid; forward the request with the payment attached.
    Admit(Box<PaymentContext>),
    /// Deny with `402` and these challenge headers.
    Challenge(Box<Challenge>),
}

/// The stores a gate runs on.
#[derive(Clone)]
pub struct GateStores {
    /// Ephemeral nonce state.
    pub nonces: Arc<dyn NonceCache>,
    /// Durable receipts.
    pub receipts: Arc<dyn ReceiptStore>,
    /// Tenant pricing rules.
    pub rules: Arc<dyn PricingRuleStore>,
    /// Links, plans and subscriptions.
    pub ledger: Arc<dyn LedgerStore>,
}

impl std::fmt::Debug for GateStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateStores").finish_non_exhaustive()
    }
}

impl GateStores {
    /// Uses one backend for every durable concern.
    pub fn shared<S>(nonces: Arc<dyn NonceCache>, store: Arc<S>) -> Self
    where
        S: ReceiptStore + PricingRuleStore + LedgerStore + 'static,
    {
        Self {
            nonces,
            receipts: Arc::clone(&store) as Arc<dyn ReceiptStore>,
            rules: Arc::clone(&store) as Arc<dyn PricingRuleStore>,
            ledger: store,
        }
    }

    /// Process-local stores. Replay protection then only holds within this process.
    #[must_use]
    pub fn memory() -> Self {
        Self::shared(Arc::new(MemoryNonceCache::new()), Arc::new(MemoryStore::new()))
    }
}

/// Counts of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Confirmed receipts without applied bookkeeping that were examined.
    pub scanned: usize,
    /// Receipts whose bookkeeping is now applied.
    pub applied: usize,
    /// Receipts that failed again and remain pending reconciliation.
    pub failed: usize,
}

/// Runs pricing, challenge, replay, verification and bookkeeping per request.
pub struct GateController {
    enabled: bool,
    pricing: Arc<PricingResolver>,
    issuer: ChallengeIssuer,
    replay: Arc<ReplayGuard>,
    receipts: Arc<dyn ReceiptStore>,
    verifier: Option<Arc<dyn ReceiptVerifier>>,
    ledger: LedgerPostProcessor,
}

impl std::fmt::Debug for GateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateController")
            .field("enabled", &self.enabled)
            .field("pricing", &self.pricing)
            .field("issuer", &self.issuer)
            .field("replay", &self.replay)
            .finish_non_exhaustive()
    }
}

impl GateController {
    /// Builds a gate from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an enabled gate has no payee, or when its
    /// verifier is missing or not registered.
    pub fn new(
        config: &GateConfig,
        stores: GateStores,
        verifiers: &VerifierRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let verifier = if config.enabled {
            Some(verifiers.select(config.verifier_name())?)
        } else {
            config.verifier_name().and_then(|name| verifiers.get(name))
        };

        let pricing = Arc::new(PricingResolver::new(
            stores.rules,
            config.rules.clone().into_rules(),
            config.default_price,
        ));
        let replay = Arc::new(ReplayGuard::new(
            stores.nonces,
            Arc::clone(&stores.receipts),
            config.cache_namespace.trim(),
            config.nonce_ttl(),
        ));
        let issuer = ChallengeIssuer::new(
            Arc::clone(&replay),
            Arc::clone(&stores.receipts),
            config.pay_to.trim(),
            config.currency.clone(),
            config.network.clone(),
            config.callback_url.clone(),
        );

        tracing::info!(
            enabled = config.enabled,
            rules = config.rules.len(),
            default_price = ?config.default_price.map(format_amount),
            verifier = ?config.verifier_name(),
            "Configured x402 gate"
        );
        Ok(Self {
            enabled: config.enabled,
            pricing,
            issuer,
            replay,
            receipts: stores.receipts,
            verifier,
            ledger: LedgerPostProcessor::new(stores.ledger),
        })
    }

    /// Whether the gate charges at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The price resolver, for cache invalidation after rule writes.
    #[must_use]
    pub fn pricing(&self) -> &Arc<PricingResolver> {
        &self.pricing
    }

    /// The ledger post-processor.
    #[must_use]
    pub const fn ledger(&self) -> &LedgerPostProcessor {
        &self.ledger
    }

    /// Decides what happens to `request`.
    ///
    /// # Errors
    ///
    /// [`GateError`] only for configuration defects and store outages. Every
    /// payment problem is a [`GateDecision::Challenge`].
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn evaluate(&self, request: &GateRequest) -> Result<GateDecision, GateError> {
        if !self.enabled {
            return Ok(GateDecision::PassThrough);
        }
        let Some(quote) = self
            .pricing
            .resolve(&request.path, &request.method, request.tenant)
            .await?
        else {
            return Ok(GateDecision::PassThrough);
        };

        if let Some(token) = request.receipt_token() {
            if let Some(payment) = self.settle(&quote, token, request).await? {
                return Ok(GateDecision::Admit(Box::new(payment)));
            }
        }

        let challenge = self
            .issuer
            .issue(&quote, request.tenant, &request.request_meta)
            .await?;
        Ok(GateDecision::Challenge(Box::new(challenge)))
    }

    /// Consumes the nonce of `token` if the receipt pays for `quote`.
    ///
    /// `Ok(None)` means "deny"; the caller issues a fresh challenge.
    async fn settle(
        &self,
        quote: &PriceQuote,
        token: &str,
        request: &GateRequest,
    ) -> Result<Option<PaymentContext>, GateError> {
        let nonce = match ReceiptPayload::decode(token).and_then(|p| p.require_nonce().map(str::to_owned)) {
            Ok(nonce) => nonce,
            Err(failure) => {
                tracing::info!(reason = failure.reason(), "Ignoring undecodable x402 receipt");
                return Ok(None);
            }
        };

        let receipt = match self.replay.check(&nonce, &quote.path, &quote.method).await {
            Ok(receipt) => receipt,
            Err(ReplayError::Rejected(rejected)) => {
                tracing::info!(nonce, reason = %rejected, "Refused x402 receipt");
                return Ok(None);
            }
            Err(ReplayError::Store(err)) => return Err(err.into()),
        };

        let context = self.verification_context(quote, &receipt)?;
        let verifier = self
            .verifier
            .as_ref()
            .ok_or(ConfigError::VerifierNotConfigured)?;

        let result = match verifier.verify(token, quote.price, &context).await {
            Ok(result) => result,
            Err(failure) => {
                tracing::warn!(nonce, reason = failure.reason(), error = %failure, "x402 receipt not verified; nonce stays pending");
                return Ok(None);
            }
        };
        if result.nonce.trim() != nonce {
            tracing::warn!(nonce, claimed = %result.nonce, "x402 verifier answered for another nonce");
            return Ok(None);
        }

        if let VerificationStatus::Rejected { reason } = &result.status {
            self.reject(&nonce, reason, token, result.metadata.clone()).await?;
            return Ok(None);
        }

        let amount = quantize(result.amount);
        if amount < quote.price {
            let failure = VerificationFailure::InsufficientAmount {
                required: quote.price,
                received: amount,
            };
            let mut metadata = result.metadata.clone();
            metadata.insert("expected_amount".to_owned(), format_amount(quote.price).into());
            metadata.insert("received_amount".to_owned(), format_amount(amount).into());
            tracing::warn!(nonce, error = %failure, "Rejecting underpaid x402 receipt");
            self.reject(&nonce, failure.reason(), token, metadata).await?;
            return Ok(None);
        }

        let claimed = self
            .receipts
            .claim_transaction(&context.network, &result.transaction_id, &nonce)
            .await?;
        if !claimed {
            let failure = VerificationFailure::TransactionReused;
            let mut metadata = result.metadata.clone();
            metadata.insert("transaction_id".to_owned(), result.transaction_id.clone().into());
            tracing::warn!(nonce, tx_id = %result.transaction_id, error = %failure, "Rejecting reused x402 transaction");
            self.reject(&nonce, failure.reason(), token, metadata).await?;
            return Ok(None);
        }

        let mut metadata = result.metadata.clone();
        metadata.insert("transaction_id".to_owned(), result.transaction_id.clone().into());
        metadata.insert("expected_receiver".to_owned(), context.pay_to.clone().into());
        if let Some(hint) = request.consumer_hint() {
            metadata.insert(CONSUMER_HINT_KEY.to_owned(), hint.into());
        }
        let outcome = ReceiptOutcome::Confirmed {
            amount,
            payer: result.payer.clone(),
            receipt_token: token.to_owned(),
            metadata,
        };
        let confirmed = match self.replay.finalize(&nonce, outcome).await {
            Ok(receipt) => receipt,
            Err(ReplayError::Rejected(rejected)) => {
                tracing::info!(nonce, reason = %rejected, "x402 receipt consumed concurrently");
                return Ok(None);
            }
            Err(ReplayError::Store(err)) => return Err(err.into()),
        };
        tracing::info!(
            nonce,
            tx_id = %result.transaction_id,
            amount = %format_amount(amount),
            payer = ?result.payer,
            "Accepted x402 payment"
        );

        let ledger_effect = self.apply_ledger(&confirmed).await;
        Ok(Some(PaymentContext {
            nonce,
            amount,
            required: quote.price,
            payer: result.payer,
            transaction_id: result.transaction_id,
            currency: context.currency,
            network: context.network,
            pay_to: context.pay_to,
            metadata: result.metadata,
            ledger_effect,
        }))
    }

    /// Payee, currency and network the nonce was issued with, falling back to
    /// the current quote for receipts created before snapshots were stored.
    fn verification_context(
        &self,
        quote: &PriceQuote,
        receipt: &ReceiptRecord,
    ) -> Result<VerificationContext, ConfigError> {
        let snapshot = receipt
            .metadata
            .get("challenge")
            .and_then(|value| serde_json::from_value::<ChallengeSnapshot>(value.clone()).ok());
        let (pay_to, currency, network) = match snapshot {
            Some(snapshot) => (snapshot.pay_to, snapshot.currency, snapshot.network),
            None => {
                let (currency, network) = self.issuer.currency_and_network(quote);
                (self.issuer.resolve_pay_to(quote)?, currency, network)
            }
        };
        Ok(VerificationContext {
            path: quote.path.clone(),
            method: quote.method.clone(),
            pay_to,
            currency,
            network,
        })
    }

    async fn reject(
        &self,
        nonce: &str,
        reason: &str,
        token: &str,
        metadata: Metadata,
    ) -> Result<(), StoreError> {
        let outcome = ReceiptOutcome::Rejected {
            reason: reason.to_owned(),
            receipt_token: Some(token.to_owned()),
            metadata,
        };
        match self.replay.finalize(nonce, outcome).await {
            Ok(_) => {
                tracing::info!(nonce, reason, "Rejected x402 receipt");
                Ok(())
            }
            Err(ReplayError::Rejected(rejected)) => {
                tracing::debug!(nonce, reason = %rejected, "x402 receipt already finalized");
                Ok(())
            }
            Err(ReplayError::Store(err)) => Err(err),
        }
    }

    /// Applies bookkeeping; failures are logged and left for reconciliation.
    async fn apply_ledger(&self, receipt: &ReceiptRecord) -> Option<LedgerEffect> {
        match self.ledger.apply(receipt).await {
            Ok(effect) => {
                if let Err(err) = self.receipts.mark_ledger_applied(&receipt.nonce).await {
                    tracing::warn!(nonce = %receipt.nonce, error = %err, "Failed to flag x402 ledger effect as applied");
                }
                effect
            }
            Err(err) => {
                tracing::error!(nonce = %receipt.nonce, error = %err, "x402 ledger post-processing failed; payment stays confirmed");
                None
            }
        }
    }

    /// Re-applies bookkeeping for confirmed receipts that never got it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the pending receipts cannot be listed.
    pub async fn reconcile(&self, limit: usize) -> Result<ReconcileReport, StoreError> {
        let pending = self.receipts.unapplied_confirmed(limit).await?;
        let mut report = ReconcileReport {
            scanned: pending.len(),
            ..ReconcileReport::default()
        };
        for receipt in &pending {
            let applied = match self.ledger.apply(receipt).await {
                Ok(_) => self.receipts.mark_ledger_applied(&receipt.nonce).await.map_err(Into::into),
                Err(err) => Err(err),
            };
            match applied {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(nonce = %receipt.nonce, error = %err, "x402 reconciliation failed");
                }
            }
        }
        if report.scanned > 0 {
            tracing::info!(scanned = report.scanned, applied = report.applied, failed = report.failed, "Reconciled x402 ledger effects");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::GlobalRules;
    use crate::ledger::{CreditPlan, credit_plan_path};
    use crate::pricing::{PricingRule, TenantRule};
    use crate::receipt::{ReceiptDraft, ReceiptStatus};
    use crate::verifier::VerificationResult;

    #[derive(Debug, Clone)]
    enum Mode {
        Pay(&'static str),
        Refuse(&'static str),
        Unavailable,
    }

    #[derive(Debug)]
    struct StubVerifier(Mutex<Mode>);

    impl StubVerifier {
        fn set(&self, mode: Mode) {
            *self.0.lock().unwrap() = mode;
        }
    }

    #[async_trait]
    impl ReceiptVerifier for StubVerifier {
        async fn verify(
            &self,
            token: &str,
            _price: Decimal,
            context: &VerificationContext,
        ) -> Result<VerificationResult, VerificationFailure> {
            let payload = ReceiptPayload::decode(token)?;
            let nonce = payload.require_nonce()?;
            let txid = payload.require_transaction_id()?;
            let mode = self.0.lock().unwrap().clone();
            match mode {
                Mode::Pay(amount) => Ok(VerificationResult::confirmed(nonce, amount.parse().unwrap(), txid)
                    .with_payer("PAYER")
                    .with_metadata(Metadata::from_iter([(
                        "receiver".to_owned(),
                        context.pay_to.clone().into(),
                    )]))),
                Mode::Refuse(reason) => {
                    Ok(VerificationResult::confirmed(nonce, Decimal::ZERO, txid).rejected(reason))
                }
                Mode::Unavailable => Err(VerificationFailure::Ledger("timeout".into())),
            }
        }
    }

    struct Harness {
        gate: GateController,
        store: Arc<MemoryStore>,
        verifier: Arc<StubVerifier>,
    }

    fn config() -> GateConfig {
        GateConfig {
            enabled: true,
            pay_to: "PAYEE".into(),
            rules: GlobalRules::from(vec![
                PricingRule::global("/paid", "0.75".parse().unwrap()),
                PricingRule::global("/paid/free", Decimal::ZERO),
            ]),
            verifier: Some("stub".into()),
            ..GateConfig::default()
        }
    }

    fn harness(config: &GateConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let verifier = Arc::new(StubVerifier(Mutex::new(Mode::Pay("0.75"))));
        let registry = VerifierRegistry::new().with("stub", Arc::clone(&verifier) as Arc<dyn ReceiptVerifier>);
        let stores = GateStores::shared(Arc::new(MemoryNonceCache::new()), Arc::clone(&store));
        let gate = GateController::new(config, stores, &registry).unwrap();
        Harness { gate, store, verifier }
    }

    fn receipt_for(challenge: &Challenge) -> String {
        receipt_with_tx(challenge, &format!("TX-{}", challenge.nonce))
    }

    fn receipt_with_tx(challenge: &Challenge, txid: &str) -> String {
        serde_json::json!({"nonce": challenge.nonce, "txid": txid}).to_string()
    }

    async fn challenge(gate: &GateController, request: &GateRequest) -> Challenge {
        match gate.evaluate(request).await.unwrap() {
            GateDecision::Challenge(challenge) => *challenge,
            other => panic!("expected a challenge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unpriced_and_disabled_pass_through() {
        let h = harness(&config());
        let free = h.gate.evaluate(&GateRequest::new("GET", "/other")).await.unwrap();
        assert_eq!(free, GateDecision::PassThrough);

        let off = harness(&GateConfig {
            enabled: false,
            ..config()
        });
        let decision = off.gate.evaluate(&GateRequest::new("GET", "/paid")).await.unwrap();
        assert_eq!(decision, GateDecision::PassThrough);
    }

    #[tokio::test]
    async fn test_zero_rule_exempts_from_default_price() {
        let h = harness(&GateConfig {
            default_price: Some("0.05".parse().unwrap()),
            ..config()
        });
        let exempt = h.gate.evaluate(&GateRequest::new("GET", "/paid/free/")).await.unwrap();
        assert_eq!(exempt, GateDecision::PassThrough);
        let priced = challenge(&h.gate, &GateRequest::new("GET", "/elsewhere")).await;
        assert_eq!(priced.snapshot.price, "0.05".parse::<Decimal>().unwrap());
    }

    #[tokio::test]
    async fn test_round_trip_admits_exactly_once() {
        let h = harness(&config());
        let request = GateRequest::new("GET", "/paid");
        let issued = challenge(&h.gate, &request).await;
        let paid = request.clone().with_receipt(receipt_for(&issued));

        let GateDecision::Admit(payment) = h.gate.evaluate(&paid).await.unwrap() else {
            panic!("expected admit");
        };
        assert_eq!(payment.nonce, issued.nonce);
        assert_eq!(payment.amount, "0.75".parse::<Decimal>().unwrap());
        assert_eq!(payment.payer.as_deref(), Some("PAYER"));
        assert_eq!(payment.pay_to, "PAYEE");
        assert_eq!(payment.transaction_id, format!("TX-{}", issued.nonce));

        let receipt = h.store.fetch(&issued.nonce).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Confirmed);
        assert_eq!(receipt.metadata["expected_receiver"], "PAYEE");
        assert!(receipt.ledger_applied);

        let replayed = challenge(&h.gate, &paid).await;
        assert_ne!(replayed.nonce, issued.nonce);
    }

    #[tokio::test]
    async fn test_transaction_settles_only_one_challenge() {
        let h = harness(&config());
        let request = GateRequest::new("GET", "/paid");
        let first = challenge(&h.gate, &request).await;
        let paid = request.clone().with_receipt(receipt_with_tx(&first, "TX-SHARED"));
        assert!(matches!(h.gate.evaluate(&paid).await.unwrap(), GateDecision::Admit(_)));

        let second = challenge(&h.gate, &request).await;
        let reused = request.with_receipt(receipt_with_tx(&second, "TX-SHARED"));
        challenge(&h.gate, &reused).await;

        let receipt = h.store.fetch(&second.nonce).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
        assert_eq!(receipt.metadata["rejection_reason"], "transaction_reused");
        assert_eq!(receipt.metadata["transaction_id"], "TX-SHARED");
    }

    #[tokio::test]
    async fn test_underpayment_is_rejected_terminally() {
        let h = harness(&config());
        h.verifier.set(Mode::Pay("0.5"));
        let request = GateRequest::new("GET", "/paid");
        let issued = challenge(&h.gate, &request).await;
        challenge(&h.gate, &request.clone().with_receipt(receipt_for(&issued))).await;

        let receipt = h.store.fetch(&issued.nonce).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
        assert_eq!(receipt.metadata["rejection_reason"], "amount_below_required");
        assert_eq!(receipt.metadata["expected_amount"], "0.75");
        assert_eq!(receipt.metadata["received_amount"], "0.5");

        h.verifier.set(Mode::Pay("0.75"));
        challenge(&h.gate, &request.with_receipt(receipt_for(&issued))).await;
    }

    #[tokio::test]
    async fn test_explicit_rejection_is_terminal() {
        let h = harness(&config());
        h.verifier.set(Mode::Refuse("asset_mismatch"));
        let request = GateRequest::new("GET", "/paid");
        let issued = challenge(&h.gate, &request).await;
        challenge(&h.gate, &request.with_receipt(receipt_for(&issued))).await;
        let receipt = h.store.fetch(&issued.nonce).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Rejected);
        assert_eq!(receipt.metadata["rejection_reason"], "asset_mismatch");
    }

    #[tokio::test]
    async fn test_verifier_failure_leaves_nonce_pending() {
        let h = harness(&config());
        h.verifier.set(Mode::Unavailable);
        let request = GateRequest::new("GET", "/paid");
        let issued = challenge(&h.gate, &request).await;
        let paid = request.with_receipt(receipt_for(&issued));
        challenge(&h.gate, &paid).await;
        let receipt = h.store.fetch(&issued.nonce).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Pending);

        h.verifier.set(Mode::Pay("1"));
        assert!(matches!(h.gate.evaluate(&paid).await.unwrap(), GateDecision::Admit(_)));
    }

    #[tokio::test]
    async fn test_receipt_for_other_route_is_refused() {
        let h = harness(&GateConfig {
            default_price: Some(Decimal::ONE),
            ..config()
        });
        let issued = challenge(&h.gate, &GateRequest::new("GET", "/a")).await;
        let elsewhere = GateRequest::new("GET", "/b").with_receipt(receipt_for(&issued));
        challenge(&h.gate, &elsewhere).await;
        let receipt = h.store.fetch(&issued.nonce).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Pending);
    }

    #[tokio::test]
    async fn test_garbage_receipt_gets_challenge() {
        let h = harness(&config());
        let request = GateRequest::new("GET", "/paid").with_receipt("%%%");
        challenge(&h.gate, &request).await;
    }

    #[tokio::test]
    async fn test_credit_plan_payment_tops_up_consumer() {
        let h = harness(&config());
        let owner = TenantId(7);
        let plan = h
            .store
            .insert_credit_plan(CreditPlan {
                id: 0,
                owner,
                slug: "api".into(),
                title: "API".into(),
                description: None,
                amount: "1.25".parse().unwrap(),
                currency: "USDC".into(),
                network: "algorand".into(),
                pay_to_address: Some("TENANT".into()),
                platform_fee_percent: "20".parse().unwrap(),
                credits_per_payment: 10,
                pattern: credit_plan_path(owner, "api"),
                active: true,
                metadata: Metadata::new(),
            })
            .await;
        h.store
            .upsert_tenant_rule(TenantRule {
                id: 0,
                owner,
                pattern: plan.pattern.clone(),
                methods: vec!["GET".into()],
                amount: plan.amount,
                currency: None,
                network: None,
                priority: 0,
                active: true,
                pay_to_address: Some("TENANT".into()),
                metadata: Metadata::new(),
            })
            .await
            .unwrap();
        h.verifier.set(Mode::Pay("1.25"));

        let request = GateRequest::new("GET", plan.pattern.clone()).with_consumer(Some("user-1".into()));
        let issued = challenge(&h.gate, &request).await;
        assert_eq!(issued.snapshot.pay_to, "TENANT");
        assert_eq!(issued.snapshot.owner, Some(owner));

        let GateDecision::Admit(payment) = h.gate.evaluate(&request.with_receipt(receipt_for(&issued))).await.unwrap() else {
            panic!("expected admit");
        };
        assert_eq!(
            payment.ledger_effect,
            Some(LedgerEffect::CreditTopUp {
                plan_id: plan.id,
                consumer_ref: "user-1".into(),
                credits_remaining: 10,
                applied: true,
            })
        );
    }

    #[tokio::test]
    async fn test_reconcile_applies_missing_effects() {
        let h = harness(&config());
        let (_, created) = h
            .store
            .insert_or_fetch(ReceiptDraft {
                nonce: "late".into(),
                amount: Decimal::ONE,
                currency: "USDC".into(),
                network: "algorand".into(),
                owner: None,
                request_path: "/paid".into(),
                request_method: "GET".into(),
                metadata: Metadata::new(),
            })
            .await
            .unwrap();
        assert!(created);
        h.store
            .finalize(
                "late",
                ReceiptOutcome::Confirmed {
                    amount: Decimal::ONE,
                    payer: None,
                    receipt_token: "t".into(),
                    metadata: Metadata::new(),
                },
            )
            .await
            .unwrap();

        let report = h.gate.reconcile(10).await.unwrap();
        assert_eq!(report, ReconcileReport { scanned: 1, applied: 1, failed: 0 });
        assert_eq!(h.gate.reconcile(10).await.unwrap().scanned, 0);
    }

    #[test]
    fn test_enabled_gate_requires_payee_and_verifier() {
        let registry = VerifierRegistry::new();
        let err = GateController::new(
            &GateConfig {
                pay_to: " ".into(),
                ..config()
            },
            GateStores::memory(),
            &registry,
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::MissingPayTo);

        let err = GateController::new(&config(), GateStores::memory(), &registry).unwrap_err();
        assert_eq!(err, ConfigError::UnknownVerifier("stub".into()));
    }
}
