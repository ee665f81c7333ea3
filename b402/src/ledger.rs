//! Bookkeeping applied once a payment is confirmed.
//!
//! A confirmed receipt is routed to at most one effect, found by matching its
//! request path against configured resources:
//!
//! - a payment link or widget: a [`LinkEvent`] with the platform fee split;
//! - otherwise a credit plan: a top-up of the consumer's [`CreditSubscription`]
//!   plus an immutable [`CreditUsage`] row.
//!
//! Both effects are keyed by `(resource, receipt)` in the store, so running the
//! processor again for the same receipt never posts twice. That is what makes
//! out-of-band reconciliation safe.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::amount::FeeSplit;
use crate::error::{LedgerEffectError, StoreError};
use crate::pricing::TenantId;
use crate::receipt::{Metadata, ReceiptRecord, ReceiptStatus};
use crate::store::LedgerStore;
use crate::timestamp::UnixTimestamp;

/// Consumer reference used when nothing identifies the buyer.
pub const ANONYMOUS_CONSUMER: &str = "anonymous";

/// Metadata key under which the gate records the request's consumer hint.
pub const CONSUMER_HINT_KEY: &str = "consumer_ref";

/// Flavour of a payment link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Standalone payment link.
    Link,
    /// Embeddable widget.
    Widget,
}

impl LinkKind {
    /// Storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::Widget => "widget",
        }
    }

    /// URL segment under `/paywall/tenant/{id}/`.
    #[must_use]
    pub const fn path_segment(&self) -> &'static str {
        match self {
            Self::Link => "links",
            Self::Widget => "widgets",
        }
    }
}

impl Display for LinkKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "link" => Ok(Self::Link),
            "widget" => Ok(Self::Widget),
            other => Err(format!("unknown link kind {other:?}")),
        }
    }
}

/// Path of a link or widget resource.
#[must_use]
pub fn link_path(owner: TenantId, kind: LinkKind, slug: &str) -> String {
    format!("/paywall/tenant/{owner}/{}/{slug}", kind.path_segment())
}

/// Path of a credit plan resource.
#[must_use]
pub fn credit_plan_path(owner: TenantId, slug: &str) -> String {
    format!("/paywall/tenant/{owner}/credits/{slug}")
}

/// A sellable link or widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentLink {
    /// Row id.
    pub id: i64,
    /// Owning tenant.
    pub owner: TenantId,
    /// Link or widget.
    pub kind: LinkKind,
    /// Public slug.
    pub slug: String,
    /// Display title.
    pub title: String,
    /// Optional description.
    pub description: Option<String>,
    /// Price per payment.
    pub amount: Decimal,
    /// Currency code.
    pub currency: String,
    /// Settlement network.
    pub network: String,
    /// Payee override.
    pub pay_to_address: Option<String>,
    /// Platform share in percent.
    pub platform_fee_percent: Decimal,
    /// Path payments are matched against.
    pub pattern: String,
    /// Inactive links are ignored.
    pub active: bool,
    /// Free-form metadata.
    pub metadata: Metadata,
}

/// A prepaid credit product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPlan {
    /// Row id.
    pub id: i64,
    /// Owning tenant.
    pub owner: TenantId,
    /// Public slug.
    pub slug: String,
    /// Display title.
    pub title: String,
    /// Optional description.
    pub description: Option<String>,
    /// Price per top-up.
    pub amount: Decimal,
    /// Currency code.
    pub currency: String,
    /// Settlement network.
    pub network: String,
    /// Payee override.
    pub pay_to_address: Option<String>,
    /// Platform share in percent.
    pub platform_fee_percent: Decimal,
    /// Credits granted by one payment.
    pub credits_per_payment: i64,
    /// Path payments are matched against.
    pub pattern: String,
    /// Inactive plans are ignored.
    pub active: bool,
    /// Free-form metadata.
    pub metadata: Metadata,
}

/// Running balance of one consumer on one plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditSubscription {
    /// Row id.
    pub id: i64,
    /// Plan.
    pub plan_id: i64,
    /// Consumer reference.
    pub consumer_ref: String,
    /// Credits still available.
    pub credits_remaining: i64,
    /// Credits ever granted.
    pub total_credits: i64,
    /// Last top-up.
    pub last_purchase_at: Option<UnixTimestamp>,
    /// Creation time.
    pub created_at: UnixTimestamp,
}

/// Direction of a credit movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// Credits granted by a payment.
    TopUp,
    /// Credits spent.
    Consumption,
}

impl UsageKind {
    /// Storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TopUp => "top_up",
            Self::Consumption => "consumption",
        }
    }
}

impl FromStr for UsageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "top_up" => Ok(Self::TopUp),
            "consumption" => Ok(Self::Consumption),
            other => Err(format!("unknown usage kind {other:?}")),
        }
    }
}

/// Immutable audit row of a credit movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditUsage {
    /// Row id.
    pub id: i64,
    /// Subscription moved.
    pub subscription_id: i64,
    /// Plan of the subscription.
    pub plan_id: i64,
    /// Receipt that paid for a top-up.
    pub receipt_nonce: Option<String>,
    /// Top-up or consumption.
    pub kind: UsageKind,
    /// Positive for top-ups, negative for consumption.
    pub credits_delta: i64,
    /// Gross amount paid (zero for consumption).
    pub amount: Decimal,
    /// Platform share.
    pub fee_amount: Decimal,
    /// Merchant share.
    pub merchant_amount: Decimal,
    /// Optional description.
    pub description: Option<String>,
    /// Free-form metadata.
    pub metadata: Metadata,
    /// Creation time.
    pub created_at: UnixTimestamp,
}

/// Payment recorded against a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkEvent {
    /// Row id.
    pub id: i64,
    /// Link paid for.
    pub link_id: i64,
    /// Receipt that paid.
    pub receipt_nonce: String,
    /// Gross amount.
    pub amount: Decimal,
    /// Platform share.
    pub fee_amount: Decimal,
    /// Merchant share.
    pub merchant_amount: Decimal,
    /// Currency code.
    pub currency: String,
    /// Settlement network.
    pub network: String,
    /// Payer address.
    pub payer: Option<String>,
    /// Receipt metadata.
    pub metadata: Metadata,
    /// Creation time.
    pub created_at: UnixTimestamp,
}

/// Input of [`LedgerStore::upsert_link_event`].
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEventDraft {
    /// Link paid for.
    pub link_id: i64,
    /// Receipt that paid.
    pub receipt_nonce: String,
    /// Gross amount.
    pub amount: Decimal,
    /// Fee split of the amount.
    pub split: FeeSplit,
    /// Currency code.
    pub currency: String,
    /// Settlement network.
    pub network: String,
    /// Payer address.
    pub payer: Option<String>,
    /// Receipt metadata.
    pub metadata: Metadata,
}

/// Input of [`LedgerStore::apply_credit_top_up`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreditTopUp {
    /// Plan credited.
    pub plan_id: i64,
    /// Consumer credited.
    pub consumer_ref: String,
    /// Receipt that paid.
    pub receipt_nonce: String,
    /// Credits granted.
    pub credits: i64,
    /// Gross amount.
    pub amount: Decimal,
    /// Fee split of the amount.
    pub split: FeeSplit,
    /// Audit metadata.
    pub metadata: Metadata,
}

/// Input of [`LedgerStore::consume_credits`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditDebit {
    /// Plan debited.
    pub plan_id: i64,
    /// Consumer debited.
    pub consumer_ref: String,
    /// Credits to spend, positive.
    pub credits: i64,
    /// Optional description.
    pub description: Option<String>,
    /// Audit metadata.
    pub metadata: Metadata,
}

/// Result of a credit movement.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditMovement {
    /// Subscription after the movement.
    pub subscription: CreditSubscription,
    /// Audit row of the movement.
    pub usage: CreditUsage,
    /// `false` when a top-up for the same receipt already existed.
    pub applied: bool,
}

/// Summary of the effect applied for a receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEffect {
    /// A link event was recorded.
    LinkEvent {
        /// Link paid for.
        link_id: i64,
        /// Event row.
        event_id: i64,
        /// Platform share.
        fee_amount: Decimal,
        /// Merchant share.
        merchant_amount: Decimal,
    },
    /// A credit subscription was topped up.
    CreditTopUp {
        /// Plan credited.
        plan_id: i64,
        /// Consumer credited.
        consumer_ref: String,
        /// Balance after the top-up.
        credits_remaining: i64,
        /// Whether this call performed the top-up.
        applied: bool,
    },
}

/// Resolves who a credit top-up belongs to.
///
/// Order: the request's explicit hint, a `consumer`/`customer` key in the
/// receipt metadata, the payer, then [`ANONYMOUS_CONSUMER`].
#[must_use]
pub fn resolve_consumer(hint: Option<&str>, metadata: &Metadata, payer: Option<&str>) -> String {
    let from_metadata = ["consumer", "customer"]
        .iter()
        .find_map(|key| metadata.get(*key).and_then(serde_json::Value::as_str));
    hint.into_iter()
        .chain(from_metadata)
        .chain(payer)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(ANONYMOUS_CONSUMER)
        .to_owned()
}

/// Routes confirmed receipts to their ledger effect.
#[derive(Clone)]
pub struct LedgerPostProcessor {
    store: Arc<dyn LedgerStore>,
}

impl std::fmt::Debug for LedgerPostProcessor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerPostProcessor").finish_non_exhaustive()
    }
}

impl LedgerPostProcessor {
    /// Creates a processor over a ledger store.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Applies the effect of a confirmed receipt.
    ///
    /// Returns `Ok(None)` when the path matches no link or plan.
    ///
    /// # Errors
    ///
    /// [`LedgerEffectError::NotConfirmed`] for non-confirmed receipts, and any
    /// store or fee computation failure.
    pub async fn apply(
        &self,
        receipt: &ReceiptRecord,
    ) -> Result<Option<LedgerEffect>, LedgerEffectError> {
        if receipt.status != ReceiptStatus::Confirmed {
            return Err(LedgerEffectError::NotConfirmed(receipt.nonce.clone()));
        }
        let path = receipt.request_path.as_str();

        if let Some(link) = self.find_link(receipt.owner, path).await? {
            let split = FeeSplit::compute(receipt.amount, link.platform_fee_percent)?;
            let event = self
                .store
                .upsert_link_event(LinkEventDraft {
                    link_id: link.id,
                    receipt_nonce: receipt.nonce.clone(),
                    amount: receipt.amount,
                    split,
                    currency: receipt.currency.clone(),
                    network: receipt.network.clone(),
                    payer: receipt.payer.clone(),
                    metadata: receipt.metadata.clone(),
                })
                .await?;
            tracing::info!(nonce = %receipt.nonce, link_id = link.id, fee = %event.fee_amount, "Recorded payment link event");
            return Ok(Some(LedgerEffect::LinkEvent {
                link_id: link.id,
                event_id: event.id,
                fee_amount: event.fee_amount,
                merchant_amount: event.merchant_amount,
            }));
        }

        if let Some(plan) = self.find_plan(receipt.owner, path).await? {
            let consumer_ref = resolve_consumer(
                receipt
                    .metadata
                    .get(CONSUMER_HINT_KEY)
                    .and_then(serde_json::Value::as_str),
                &receipt.metadata,
                receipt.payer.as_deref(),
            );
            let split = FeeSplit::compute(receipt.amount, plan.platform_fee_percent)?;
            let mut metadata = receipt.metadata.clone();
            metadata.insert("receipt_nonce".to_owned(), receipt.nonce.clone().into());
            let movement = self
                .store
                .apply_credit_top_up(CreditTopUp {
                    plan_id: plan.id,
                    consumer_ref: consumer_ref.clone(),
                    receipt_nonce: receipt.nonce.clone(),
                    credits: plan.credits_per_payment,
                    amount: receipt.amount,
                    split,
                    metadata,
                })
                .await?;
            if movement.applied {
                tracing::info!(nonce = %receipt.nonce, plan_id = plan.id, consumer = %consumer_ref, credits = plan.credits_per_payment, "Applied credit top-up");
            } else {
                tracing::debug!(nonce = %receipt.nonce, plan_id = plan.id, "Credit top-up already applied");
            }
            return Ok(Some(LedgerEffect::CreditTopUp {
                plan_id: plan.id,
                consumer_ref,
                credits_remaining: movement.subscription.credits_remaining,
                applied: movement.applied,
            }));
        }

        Ok(None)
    }

    /// Spends credits of `consumer` on `plan`.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidInput`] for non-positive amounts,
    /// [`StoreError::InsufficientCredits`] when the balance is too low.
    pub async fn consume(
        &self,
        plan: &CreditPlan,
        consumer: &str,
        credits: i64,
        description: Option<String>,
        metadata: Metadata,
    ) -> Result<CreditMovement, LedgerEffectError> {
        if credits <= 0 {
            return Err(StoreError::InvalidInput("credits must be positive".into()).into());
        }
        let consumer = consumer.trim();
        if consumer.is_empty() {
            return Err(StoreError::InvalidInput("consumer is required".into()).into());
        }
        let movement = self
            .store
            .consume_credits(CreditDebit {
                plan_id: plan.id,
                consumer_ref: consumer.to_owned(),
                credits,
                description,
                metadata,
            })
            .await?;
        tracing::info!(plan_id = plan.id, consumer, credits, remaining = movement.subscription.credits_remaining, "Consumed credits");
        Ok(movement)
    }

    /// Owner-scoped lookup first, then across all tenants.
    async fn find_link(
        &self,
        owner: Option<TenantId>,
        path: &str,
    ) -> Result<Option<PaymentLink>, StoreError> {
        if let Some(owner) = owner {
            if let Some(link) = self.store.find_payment_link(Some(owner), path).await? {
                return Ok(Some(link));
            }
        }
        self.store.find_payment_link(None, path).await
    }

    async fn find_plan(
        &self,
        owner: Option<TenantId>,
        path: &str,
    ) -> Result<Option<CreditPlan>, StoreError> {
        if let Some(owner) = owner {
            if let Some(plan) = self.store.find_credit_plan(Some(owner), path).await? {
                return Ok(Some(plan));
            }
        }
        self.store.find_credit_plan(None, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::receipt::{ReceiptDraft, ReceiptOutcome};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn confirmed(nonce: &str, path: &str, amount: &str, metadata: Metadata) -> ReceiptRecord {
        let mut record = ReceiptDraft {
            nonce: nonce.into(),
            amount: dec(amount),
            currency: "USDC".into(),
            network: "algorand".into(),
            owner: Some(TenantId(7)),
            request_path: path.into(),
            request_method: "GET".into(),
            metadata: Metadata::new(),
        }
        .into_record(UnixTimestamp::from_secs(1));
        record.finalize(
            ReceiptOutcome::Confirmed {
                amount: dec(amount),
                payer: Some("PAYER".into()),
                receipt_token: "token".into(),
                metadata,
            },
            UnixTimestamp::from_secs(2),
        );
        record
    }

    fn link(owner: TenantId) -> PaymentLink {
        PaymentLink {
            id: 0,
            owner,
            kind: LinkKind::Link,
            slug: "guide".into(),
            title: "Guide".into(),
            description: None,
            amount: dec("0.75"),
            currency: "USDC".into(),
            network: "algorand".into(),
            pay_to_address: None,
            platform_fee_percent: dec("15"),
            pattern: link_path(owner, LinkKind::Link, "guide"),
            active: true,
            metadata: Metadata::new(),
        }
    }

    fn plan(owner: TenantId) -> CreditPlan {
        CreditPlan {
            id: 0,
            owner,
            slug: "api".into(),
            title: "API credits".into(),
            description: None,
            amount: dec("1.25"),
            currency: "USDC".into(),
            network: "algorand".into(),
            pay_to_address: None,
            platform_fee_percent: dec("20"),
            credits_per_payment: 10,
            pattern: credit_plan_path(owner, "api"),
            active: true,
            metadata: Metadata::new(),
        }
    }

    fn processor() -> (LedgerPostProcessor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let processor = LedgerPostProcessor::new(Arc::clone(&store) as Arc<dyn LedgerStore>);
        (processor, store)
    }

    #[test]
    fn test_resolve_consumer_order() {
        let mut metadata = Metadata::new();
        metadata.insert("customer".into(), "cust-1".into());
        assert_eq!(resolve_consumer(Some("hint"), &metadata, Some("PAYER")), "hint");
        assert_eq!(resolve_consumer(None, &metadata, Some("PAYER")), "cust-1");
        assert_eq!(resolve_consumer(Some("  "), &Metadata::new(), Some("PAYER")), "PAYER");
        assert_eq!(resolve_consumer(None, &Metadata::new(), None), ANONYMOUS_CONSUMER);
    }

    #[test]
    fn test_resource_paths() {
        assert_eq!(link_path(TenantId(3), LinkKind::Widget, "w"), "/paywall/tenant/3/widgets/w");
        assert_eq!(credit_plan_path(TenantId(3), "c"), "/paywall/tenant/3/credits/c");
    }

    #[tokio::test]
    async fn test_link_payment_records_fee_split_once() {
        let (processor, store) = processor();
        let link = store.insert_payment_link(link(TenantId(7))).await;
        let receipt = confirmed("n1", &link.pattern, "0.75", Metadata::new());

        let effect = processor.apply(&receipt).await.unwrap().unwrap();
        assert_eq!(
            effect,
            LedgerEffect::LinkEvent {
                link_id: link.id,
                event_id: store.link_events().await[0].id,
                fee_amount: dec("0.1125"),
                merchant_amount: dec("0.6375"),
            }
        );

        processor.apply(&receipt).await.unwrap();
        let events = store.link_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payer.as_deref(), Some("PAYER"));
    }

    #[tokio::test]
    async fn test_credit_top_up_then_consume() {
        let (processor, store) = processor();
        let plan = store.insert_credit_plan(plan(TenantId(7))).await;
        let mut metadata = Metadata::new();
        metadata.insert(CONSUMER_HINT_KEY.into(), "user-42".into());
        let receipt = confirmed("n2", &plan.pattern, "1.25", metadata);

        let effect = processor.apply(&receipt).await.unwrap().unwrap();
        assert_eq!(
            effect,
            LedgerEffect::CreditTopUp {
                plan_id: plan.id,
                consumer_ref: "user-42".into(),
                credits_remaining: 10,
                applied: true,
            }
        );
        let usage = &store.credit_usages().await[0];
        assert_eq!(usage.fee_amount, dec("0.25"));
        assert_eq!(usage.merchant_amount, dec("1.00"));

        let again = processor.apply(&receipt).await.unwrap().unwrap();
        assert!(matches!(again, LedgerEffect::CreditTopUp { credits_remaining: 10, applied: false, .. }));

        let movement = processor
            .consume(&plan, "user-42", 4, Some("batch".into()), Metadata::new())
            .await
            .unwrap();
        assert_eq!(movement.subscription.credits_remaining, 6);
        assert_eq!(movement.usage.credits_delta, -4);

        let err = processor
            .consume(&plan, "user-42", 7, None, Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerEffectError::Store(StoreError::InsufficientCredits { available: 6, requested: 7 })
        ));
        assert_eq!(store.credit_usages().await.len(), 2);
    }

    #[tokio::test]
    async fn test_consume_rejects_bad_input() {
        let (processor, store) = processor();
        let plan = store.insert_credit_plan(plan(TenantId(7))).await;
        assert!(processor.consume(&plan, "u", 0, None, Metadata::new()).await.is_err());
        assert!(processor.consume(&plan, " ", 1, None, Metadata::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_unmatched_path_has_no_effect() {
        let (processor, _) = processor();
        let receipt = confirmed("n3", "/elsewhere", "1", Metadata::new());
        assert_eq!(processor.apply(&receipt).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_receipt_is_refused() {
        let (processor, _) = processor();
        let receipt = ReceiptDraft {
            nonce: "n4".into(),
            amount: Decimal::ONE,
            currency: "USDC".into(),
            network: "algorand".into(),
            owner: None,
            request_path: "/p".into(),
            request_method: "GET".into(),
            metadata: Metadata::new(),
        }
        .into_record(UnixTimestamp::from_secs(1));
        assert!(matches!(
            processor.apply(&receipt).await,
            Err(LedgerEffectError::NotConfirmed(_))
        ));
    }

    #[tokio::test]
    async fn test_unscoped_lookup_when_owner_differs() {
        let (processor, store) = processor();
        let link = store.insert_payment_link(link(TenantId(8))).await;
        let receipt = confirmed("n5", &link.pattern, "0.75", Metadata::new());
        assert!(matches!(
            processor.apply(&receipt).await.unwrap(),
            Some(LedgerEffect::LinkEvent { link_id, .. }) if link_id == link.id
        ));
    }
}
