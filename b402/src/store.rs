//! Storage traits the gate is generic over.
//!
//! Two kinds of backing store are involved. The ephemeral [`NonceCache`] holds
//! short-lived nonce state with a TTL and must be shared by every worker. The
//! durable stores hold receipts, tenant pricing rules and the ledger. A
//! database backend usually implements all durable traits on one type.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::ledger::{
    CreditDebit, CreditMovement, CreditPlan, CreditSubscription, CreditTopUp, LinkEvent,
    LinkEventDraft, LinkKind, PaymentLink,
};
use crate::pricing::{TenantId, TenantRule};
use crate::receipt::{ReceiptDraft, ReceiptOutcome, ReceiptRecord};
use crate::replay::NonceEntry;

/// Set-with-TTL / get store for nonce state. Expiry is enforced lazily on read.
#[async_trait]
pub trait NonceCache: Send + Sync {
    /// Returns the live entry for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<NonceEntry>, StoreError>;

    /// Stores `entry` under `key`, replacing any previous value, for `ttl`.
    async fn set(&self, key: &str, entry: &NonceEntry, ttl: Duration) -> Result<(), StoreError>;
}

/// Durable receipt records keyed by unique nonce.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Inserts a pending receipt, or returns the existing one for that nonce.
    ///
    /// The boolean is `true` when a new row was created.
    async fn insert_or_fetch(&self, draft: ReceiptDraft)
    -> Result<(ReceiptRecord, bool), StoreError>;

    /// Fetches a receipt by nonce.
    async fn fetch(&self, nonce: &str) -> Result<Option<ReceiptRecord>, StoreError>;

    /// Atomically moves a pending receipt to a terminal status.
    ///
    /// Returns `None` when the receipt does not exist or is no longer pending,
    /// meaning another caller already finalized it.
    async fn finalize(
        &self,
        nonce: &str,
        outcome: ReceiptOutcome,
    ) -> Result<Option<ReceiptRecord>, StoreError>;

    /// Binds an on-ledger transaction to the receipt of `nonce`.
    ///
    /// Returns `false` when the transaction is already bound to another
    /// nonce. Claiming again for the same nonce succeeds.
    async fn claim_transaction(
        &self,
        network: &str,
        transaction_id: &str,
        nonce: &str,
    ) -> Result<bool, StoreError>;

    /// Records that post-confirmation bookkeeping has been applied.
    async fn mark_ledger_applied(&self, nonce: &str) -> Result<(), StoreError>;

    /// Confirmed receipts whose bookkeeping has not been applied yet, oldest first.
    async fn unapplied_confirmed(&self, limit: usize) -> Result<Vec<ReceiptRecord>, StoreError>;
}

/// Tenant-scoped pricing rules.
#[async_trait]
pub trait PricingRuleStore: Send + Sync {
    /// A counter that changes whenever the tenant's rules change.
    async fn rules_version(&self, owner: TenantId) -> Result<u64, StoreError>;

    /// Active rules of the tenant, in any order.
    async fn active_rules(&self, owner: TenantId) -> Result<Vec<TenantRule>, StoreError>;
}

/// Payment links, credit plans and their ledger rows.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Active link or widget whose pattern equals `path`.
    ///
    /// `owner = None` searches every tenant.
    async fn find_payment_link(
        &self,
        owner: Option<TenantId>,
        path: &str,
    ) -> Result<Option<PaymentLink>, StoreError>;

    /// Active credit plan whose pattern equals `path`.
    ///
    /// `owner = None` searches every tenant.
    async fn find_credit_plan(
        &self,
        owner: Option<TenantId>,
        path: &str,
    ) -> Result<Option<CreditPlan>, StoreError>;

    /// Looks up a link or widget by its public slug.
    async fn payment_link_by_slug(
        &self,
        owner: TenantId,
        kind: LinkKind,
        slug: &str,
    ) -> Result<Option<PaymentLink>, StoreError>;

    /// Looks up a credit plan by its public slug.
    async fn credit_plan_by_slug(
        &self,
        owner: TenantId,
        slug: &str,
    ) -> Result<Option<CreditPlan>, StoreError>;

    /// Inserts the event for `(link, receipt)` or updates payer and metadata of
    /// the existing one. Amounts of an existing event are never changed.
    async fn upsert_link_event(&self, draft: LinkEventDraft) -> Result<LinkEvent, StoreError>;

    /// Credits a subscription once per `(plan, receipt)`.
    ///
    /// Creates the subscription if needed. A repeated call for the same receipt
    /// returns the existing usage row with `applied = false`.
    async fn apply_credit_top_up(&self, top_up: CreditTopUp)
    -> Result<CreditMovement, StoreError>;

    /// Debits a subscription, failing with [`StoreError::InsufficientCredits`]
    /// when the balance is too low.
    async fn consume_credits(&self, debit: CreditDebit) -> Result<CreditMovement, StoreError>;

    /// Current subscription of `consumer` on `plan_id`.
    async fn credit_subscription(
        &self,
        plan_id: i64,
        consumer: &str,
    ) -> Result<Option<CreditSubscription>, StoreError>;
}
