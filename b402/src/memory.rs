//! In-process store implementations.
//!
//! [`MemoryNonceCache`] and [`MemoryStore`] keep everything in this process,
//! so they only give replay protection for a single worker. They back the test
//! suites and single-node development setups; multi-worker deployments use a
//! shared backend such as `b402-sqlite`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::ledger::{
    CreditDebit, CreditMovement, CreditPlan, CreditSubscription, CreditTopUp, CreditUsage,
    LinkEvent, LinkEventDraft, LinkKind, PaymentLink, UsageKind,
};
use crate::pricing::{TenantId, TenantRule};
use crate::receipt::{ReceiptDraft, ReceiptOutcome, ReceiptRecord, ReceiptStatus};
use crate::replay::NonceEntry;
use crate::store::{LedgerStore, NonceCache, PricingRuleStore, ReceiptStore};
use crate::timestamp::UnixTimestamp;

/// TTL map of nonce entries, expired lazily on read.
#[derive(Debug, Default)]
pub struct MemoryNonceCache {
    entries: DashMap<String, (NonceEntry, Instant)>,
}

impl MemoryNonceCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NonceCache for MemoryNonceCache {
    async fn get(&self, key: &str) -> Result<Option<NonceEntry>, StoreError> {
        let now = Instant::now();
        let live = self
            .entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());
        if live.is_none() {
            self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        }
        Ok(live)
    }

    async fn set(&self, key: &str, entry: &NonceEntry, ttl: Duration) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_owned(), (entry.clone(), Instant::now() + ttl));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    receipts: HashMap<String, ReceiptRecord>,
    transactions: HashMap<(String, String), String>,
    rules: Vec<TenantRule>,
    rule_versions: HashMap<TenantId, u64>,
    links: Vec<PaymentLink>,
    plans: Vec<CreditPlan>,
    link_events: Vec<LinkEvent>,
    subscriptions: Vec<CreditSubscription>,
    usages: Vec<CreditUsage>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Durable-store stand-in holding every table in one mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tenant rule (`id == 0`) or replaces the rule with the same id,
    /// bumping the tenant's rules version.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidInput`] when the rule fails [`TenantRule::validate`].
    pub async fn upsert_tenant_rule(&self, mut rule: TenantRule) -> Result<TenantRule, StoreError> {
        rule.validate()?;
        let mut state = self.state.lock().await;
        if rule.id == 0 {
            rule.id = state.next_id();
        }
        match state.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule.clone(),
            None => state.rules.push(rule.clone()),
        }
        *state.rule_versions.entry(rule.owner).or_default() += 1;
        Ok(rule)
    }

    /// Inserts a payment link, assigning its id.
    pub async fn insert_payment_link(&self, mut link: PaymentLink) -> PaymentLink {
        let mut state = self.state.lock().await;
        link.id = state.next_id();
        state.links.push(link.clone());
        link
    }

    /// Inserts a credit plan, assigning its id.
    pub async fn insert_credit_plan(&self, mut plan: CreditPlan) -> CreditPlan {
        let mut state = self.state.lock().await;
        plan.id = state.next_id();
        state.plans.push(plan.clone());
        plan
    }

    /// All link events, in insertion order.
    pub async fn link_events(&self) -> Vec<LinkEvent> {
        self.state.lock().await.link_events.clone()
    }

    /// All credit usage rows, in insertion order.
    pub async fn credit_usages(&self) -> Vec<CreditUsage> {
        self.state.lock().await.usages.clone()
    }
}

#[async_trait]
impl ReceiptStore for MemoryStore {
    async fn insert_or_fetch(
        &self,
        draft: ReceiptDraft,
    ) -> Result<(ReceiptRecord, bool), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.receipts.get(&draft.nonce) {
            return Ok((existing.clone(), false));
        }
        let record = draft.into_record(UnixTimestamp::now());
        state.receipts.insert(record.nonce.clone(), record.clone());
        Ok((record, true))
    }

    async fn fetch(&self, nonce: &str) -> Result<Option<ReceiptRecord>, StoreError> {
        Ok(self.state.lock().await.receipts.get(nonce).cloned())
    }

    async fn finalize(
        &self,
        nonce: &str,
        outcome: ReceiptOutcome,
    ) -> Result<Option<ReceiptRecord>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(record) = state.receipts.get_mut(nonce) else {
            return Ok(None);
        };
        if record.finalize(outcome, UnixTimestamp::now()) {
            Ok(Some(record.clone()))
        } else {
            Ok(None)
        }
    }

    async fn claim_transaction(
        &self,
        network: &str,
        transaction_id: &str,
        nonce: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let owner = state
            .transactions
            .entry((network.to_owned(), transaction_id.to_owned()))
            .or_insert_with(|| nonce.to_owned());
        Ok(owner.as_str() == nonce)
    }

    async fn mark_ledger_applied(&self, nonce: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .receipts
            .get_mut(nonce)
            .ok_or_else(|| StoreError::NotFound(format!("receipt {nonce}")))?;
        record.ledger_applied = true;
        Ok(())
    }

    async fn unapplied_confirmed(&self, limit: usize) -> Result<Vec<ReceiptRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut pending: Vec<ReceiptRecord> = state
            .receipts
            .values()
            .filter(|r| r.status == ReceiptStatus::Confirmed && !r.ledger_applied)
            .cloned()
            .collect();
        pending.sort_by(|a, b| (a.verified_at, &a.nonce).cmp(&(b.verified_at, &b.nonce)));
        pending.truncate(limit);
        Ok(pending)
    }
}

#[async_trait]
impl PricingRuleStore for MemoryStore {
    async fn rules_version(&self, owner: TenantId) -> Result<u64, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .rule_versions
            .get(&owner)
            .copied()
            .unwrap_or_default())
    }

    async fn active_rules(&self, owner: TenantId) -> Result<Vec<TenantRule>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .rules
            .iter()
            .filter(|r| r.owner == owner && r.active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn find_payment_link(
        &self,
        owner: Option<TenantId>,
        path: &str,
    ) -> Result<Option<PaymentLink>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .links
            .iter()
            .find(|l| l.active && l.pattern == path && owner.is_none_or(|o| l.owner == o))
            .cloned())
    }

    async fn find_credit_plan(
        &self,
        owner: Option<TenantId>,
        path: &str,
    ) -> Result<Option<CreditPlan>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .plans
            .iter()
            .find(|p| p.active && p.pattern == path && owner.is_none_or(|o| p.owner == o))
            .cloned())
    }

    async fn payment_link_by_slug(
        &self,
        owner: TenantId,
        kind: LinkKind,
        slug: &str,
    ) -> Result<Option<PaymentLink>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .links
            .iter()
            .find(|l| l.owner == owner && l.kind == kind && l.slug == slug)
            .cloned())
    }

    async fn credit_plan_by_slug(
        &self,
        owner: TenantId,
        slug: &str,
    ) -> Result<Option<CreditPlan>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .plans
            .iter()
            .find(|p| p.owner == owner && p.slug == slug)
            .cloned())
    }

    async fn upsert_link_event(&self, draft: LinkEventDraft) -> Result<LinkEvent, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .link_events
            .iter_mut()
            .find(|e| e.link_id == draft.link_id && e.receipt_nonce == draft.receipt_nonce)
        {
            if draft.payer.is_some() {
                existing.payer = draft.payer;
            }
            existing.metadata.extend(draft.metadata);
            return Ok(existing.clone());
        }
        let event = LinkEvent {
            id: state.next_id(),
            link_id: draft.link_id,
            receipt_nonce: draft.receipt_nonce,
            amount: draft.amount,
            fee_amount: draft.split.fee,
            merchant_amount: draft.split.merchant,
            currency: draft.currency,
            network: draft.network,
            payer: draft.payer,
            metadata: draft.metadata,
            created_at: UnixTimestamp::now(),
        };
        state.link_events.push(event.clone());
        Ok(event)
    }

    async fn apply_credit_top_up(&self, top_up: CreditTopUp) -> Result<CreditMovement, StoreError> {
        if top_up.credits <= 0 {
            return Err(StoreError::InvalidInput("credits_per_payment must be positive".into()));
        }
        let mut state = self.state.lock().await;
        let now = UnixTimestamp::now();

        let existing_usage = state
            .usages
            .iter()
            .find(|u| {
                u.plan_id == top_up.plan_id
                    && u.kind == UsageKind::TopUp
                    && u.receipt_nonce.as_deref() == Some(top_up.receipt_nonce.as_str())
            })
            .cloned();
        if let Some(usage) = existing_usage {
            let subscription = state
                .subscriptions
                .iter()
                .find(|s| s.id == usage.subscription_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("subscription {}", usage.subscription_id)))?;
            return Ok(CreditMovement {
                subscription,
                usage,
                applied: false,
            });
        }

        let position = state
            .subscriptions
            .iter()
            .position(|s| s.plan_id == top_up.plan_id && s.consumer_ref == top_up.consumer_ref);
        let subscription = match position {
            Some(index) => {
                let subscription = &mut state.subscriptions[index];
                subscription.credits_remaining += top_up.credits;
                subscription.total_credits += top_up.credits;
                subscription.last_purchase_at = Some(now);
                subscription.clone()
            }
            None => {
                let subscription = CreditSubscription {
                    id: state.next_id(),
                    plan_id: top_up.plan_id,
                    consumer_ref: top_up.consumer_ref.clone(),
                    credits_remaining: top_up.credits,
                    total_credits: top_up.credits,
                    last_purchase_at: Some(now),
                    created_at: now,
                };
                state.subscriptions.push(subscription.clone());
                subscription
            }
        };

        let usage = CreditUsage {
            id: state.next_id(),
            subscription_id: subscription.id,
            plan_id: top_up.plan_id,
            receipt_nonce: Some(top_up.receipt_nonce),
            kind: UsageKind::TopUp,
            credits_delta: top_up.credits,
            amount: top_up.amount,
            fee_amount: top_up.split.fee,
            merchant_amount: top_up.split.merchant,
            description: None,
            metadata: top_up.metadata,
            created_at: now,
        };
        state.usages.push(usage.clone());
        Ok(CreditMovement {
            subscription,
            usage,
            applied: true,
        })
    }

    async fn consume_credits(&self, debit: CreditDebit) -> Result<CreditMovement, StoreError> {
        if debit.credits <= 0 {
            return Err(StoreError::InvalidInput("credits must be positive".into()));
        }
        let mut state = self.state.lock().await;
        let now = UnixTimestamp::now();
        let index = state
            .subscriptions
            .iter()
            .position(|s| s.plan_id == debit.plan_id && s.consumer_ref == debit.consumer_ref)
            .ok_or(StoreError::InsufficientCredits {
                available: 0,
                requested: debit.credits,
            })?;
        let subscription = &mut state.subscriptions[index];
        if subscription.credits_remaining < debit.credits {
            return Err(StoreError::InsufficientCredits {
                available: subscription.credits_remaining,
                requested: debit.credits,
            });
        }
        subscription.credits_remaining -= debit.credits;
        let subscription = subscription.clone();

        let usage = CreditUsage {
            id: state.next_id(),
            subscription_id: subscription.id,
            plan_id: debit.plan_id,
            receipt_nonce: None,
            kind: UsageKind::Consumption,
            credits_delta: -debit.credits,
            amount: Decimal::ZERO,
            fee_amount: Decimal::ZERO,
            merchant_amount: Decimal::ZERO,
            description: debit.description,
            metadata: debit.metadata,
            created_at: now,
        };
        state.usages.push(usage.clone());
        Ok(CreditMovement {
            subscription,
            usage,
            applied: true,
        })
    }

    async fn credit_subscription(
        &self,
        plan_id: i64,
        consumer: &str,
    ) -> Result<Option<CreditSubscription>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .iter()
            .find(|s| s.plan_id == plan_id && s.consumer_ref == consumer)
            .cloned())
    }
}
