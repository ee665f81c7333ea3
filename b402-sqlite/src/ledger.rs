//! Payment links, credit plans and the rows confirmed payments post to them.

use async_trait::async_trait;
use b402::StoreError;
use b402::ledger::{
    CreditDebit, CreditMovement, CreditPlan, CreditSubscription, CreditTopUp, CreditUsage,
    LinkEvent, LinkEventDraft, LinkKind, PaymentLink, UsageKind, credit_plan_path, link_path,
};
use b402::pricing::{TenantId, normalize_path};
use b402::receipt::Metadata;
use b402::store::LedgerStore;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use rust_decimal::Decimal;
use serde_json::json;

use crate::error::SqliteError;
use crate::rules::{ResourceRule, sync_resource_rule};
use crate::store::{
    SqliteStore, amount_text, decimal_col, metadata_col, now_secs, opt_timestamp_col, owner_param,
    parsed_col, tenant_col, timestamp_col,
};

const LINK_COLUMNS: &str = "id, owner_id, kind, slug, title, description, amount, currency, \
     network, pay_to_address, platform_fee_percent, pattern, active, metadata";

const PLAN_COLUMNS: &str = "id, owner_id, slug, title, description, amount, currency, network, \
     pay_to_address, platform_fee_percent, credits_per_payment, pattern, active, metadata";

const EVENT_COLUMNS: &str = "id, link_id, receipt_nonce, amount, fee_amount, merchant_amount, \
     currency, network, payer, metadata, created_at";

const SUBSCRIPTION_COLUMNS: &str =
    "id, plan_id, consumer_ref, credits_remaining, total_credits, last_purchase_at, created_at";

const USAGE_COLUMNS: &str = "id, subscription_id, plan_id, receipt_nonce, kind, credits_delta, \
     amount, fee_amount, merchant_amount, description, metadata, created_at";

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentLink> {
    Ok(PaymentLink {
        id: row.get(0)?,
        owner: tenant_col(row, 1)?,
        kind: parsed_col(row, 2)?,
        slug: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        amount: decimal_col(row, 6)?,
        currency: row.get(7)?,
        network: row.get(8)?,
        pay_to_address: row.get(9)?,
        platform_fee_percent: decimal_col(row, 10)?,
        pattern: row.get(11)?,
        active: row.get(12)?,
        metadata: metadata_col(row, 13)?,
    })
}

fn plan_from_row(row: &Row<'_>) -> rusqlite::Result<CreditPlan> {
    Ok(CreditPlan {
        id: row.get(0)?,
        owner: tenant_col(row, 1)?,
        slug: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        amount: decimal_col(row, 5)?,
        currency: row.get(6)?,
        network: row.get(7)?,
        pay_to_address: row.get(8)?,
        platform_fee_percent: decimal_col(row, 9)?,
        credits_per_payment: row.get(10)?,
        pattern: row.get(11)?,
        active: row.get(12)?,
        metadata: metadata_col(row, 13)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<LinkEvent> {
    Ok(LinkEvent {
        id: row.get(0)?,
        link_id: row.get(1)?,
        receipt_nonce: row.get(2)?,
        amount: decimal_col(row, 3)?,
        fee_amount: decimal_col(row, 4)?,
        merchant_amount: decimal_col(row, 5)?,
        currency: row.get(6)?,
        network: row.get(7)?,
        payer: row.get(8)?,
        metadata: metadata_col(row, 9)?,
        created_at: timestamp_col(row, 10)?,
    })
}

fn subscription_from_row(row: &Row<'_>) -> rusqlite::Result<CreditSubscription> {
    Ok(CreditSubscription {
        id: row.get(0)?,
        plan_id: row.get(1)?,
        consumer_ref: row.get(2)?,
        credits_remaining: row.get(3)?,
        total_credits: row.get(4)?,
        last_purchase_at: opt_timestamp_col(row, 5)?,
        created_at: timestamp_col(row, 6)?,
    })
}

fn usage_from_row(row: &Row<'_>) -> rusqlite::Result<CreditUsage> {
    Ok(CreditUsage {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        plan_id: row.get(2)?,
        receipt_nonce: row.get(3)?,
        kind: parsed_col(row, 4)?,
        credits_delta: row.get(5)?,
        amount: decimal_col(row, 6)?,
        fee_amount: decimal_col(row, 7)?,
        merchant_amount: decimal_col(row, 8)?,
        description: row.get(9)?,
        metadata: metadata_col(row, 10)?,
        created_at: timestamp_col(row, 11)?,
    })
}

fn select_link(conn: &Connection, id: i64) -> Result<PaymentLink, SqliteError> {
    let sql = format!("SELECT {LINK_COLUMNS} FROM payment_links WHERE id = ?1");
    conn.query_row(&sql, params![id], link_from_row)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("payment link {id}")).into())
}

fn select_plan(conn: &Connection, id: i64) -> Result<CreditPlan, SqliteError> {
    let sql = format!("SELECT {PLAN_COLUMNS} FROM credit_plans WHERE id = ?1");
    conn.query_row(&sql, params![id], plan_from_row)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("credit plan {id}")).into())
}

fn select_event(
    conn: &Connection,
    link_id: i64,
    nonce: &str,
) -> Result<Option<LinkEvent>, SqliteError> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM link_events WHERE link_id = ?1 AND receipt_nonce = ?2"
    );
    Ok(conn
        .query_row(&sql, params![link_id, nonce], event_from_row)
        .optional()?)
}

fn select_subscription(
    conn: &Connection,
    plan_id: i64,
    consumer: &str,
) -> Result<Option<CreditSubscription>, SqliteError> {
    let sql = format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM credit_subscriptions \
         WHERE plan_id = ?1 AND consumer_ref = ?2"
    );
    Ok(conn
        .query_row(&sql, params![plan_id, consumer], subscription_from_row)
        .optional()?)
}

fn select_subscription_by_id(
    conn: &Connection,
    id: i64,
) -> Result<CreditSubscription, SqliteError> {
    let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM credit_subscriptions WHERE id = ?1");
    conn.query_row(&sql, params![id], subscription_from_row)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("subscription {id}")).into())
}

fn select_usage(conn: &Connection, id: i64) -> Result<CreditUsage, SqliteError> {
    let sql = format!("SELECT {USAGE_COLUMNS} FROM credit_usages WHERE id = ?1");
    conn.query_row(&sql, params![id], usage_from_row)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("credit usage {id}")).into())
}

#[allow(clippy::too_many_arguments)]
fn insert_usage(
    conn: &Connection,
    subscription_id: i64,
    plan_id: i64,
    receipt_nonce: Option<&str>,
    kind: UsageKind,
    credits_delta: i64,
    amounts: [Decimal; 3],
    description: Option<&str>,
    metadata: &Metadata,
) -> Result<CreditUsage, SqliteError> {
    let [amount, fee, merchant] = amounts;
    conn.execute(
        "INSERT INTO credit_usages (subscription_id, plan_id, receipt_nonce, kind, \
         credits_delta, amount, fee_amount, merchant_amount, description, metadata, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            subscription_id,
            plan_id,
            receipt_nonce,
            kind.as_str(),
            credits_delta,
            amount_text(amount),
            amount_text(fee),
            amount_text(merchant),
            description,
            serde_json::to_string(metadata)?,
            now_secs(),
        ],
    )?;
    select_usage(conn, conn.last_insert_rowid())
}

fn validate_fee_percent(percent: Decimal) -> Result<(), StoreError> {
    if percent < Decimal::ZERO || percent > Decimal::ONE_HUNDRED {
        return Err(StoreError::InvalidInput(format!(
            "platform_fee_percent must be between 0 and 100, got {percent}"
        )));
    }
    Ok(())
}

fn validate_slug(slug: &str) -> Result<(), StoreError> {
    let valid = !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidInput(format!("invalid slug {slug:?}")))
    }
}

impl SqliteStore {
    /// Creates (`id == 0`) or updates a payment link or widget.
    ///
    /// An empty pattern defaults to the resource path. The link's pricing
    /// rule is written in the same transaction and follows its `active` flag.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidInput`] for a bad slug or fee percent,
    /// [`StoreError::NotFound`] when updating an unknown id, and backend
    /// failures such as a duplicate slug.
    pub async fn save_payment_link(&self, link: PaymentLink) -> Result<PaymentLink, StoreError> {
        validate_slug(&link.slug)?;
        validate_fee_percent(link.platform_fee_percent)?;
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let pattern = if link.pattern.trim().is_empty() {
                link_path(link.owner, link.kind, &link.slug)
            } else {
                normalize_path(&link.pattern)
            };
            let metadata = serde_json::to_string(&link.metadata)?;
            let id = if link.id == 0 {
                tx.execute(
                    "INSERT INTO payment_links (owner_id, kind, slug, title, description, amount, \
                     currency, network, pay_to_address, platform_fee_percent, pattern, active, \
                     metadata) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        owner_param(link.owner),
                        link.kind.as_str(),
                        link.slug,
                        link.title,
                        link.description,
                        amount_text(link.amount),
                        link.currency,
                        link.network,
                        link.pay_to_address,
                        amount_text(link.platform_fee_percent),
                        pattern,
                        link.active,
                        metadata,
                    ],
                )?;
                tx.last_insert_rowid()
            } else {
                let updated = tx.execute(
                    "UPDATE payment_links SET owner_id = ?1, kind = ?2, slug = ?3, title = ?4, \
                     description = ?5, amount = ?6, currency = ?7, network = ?8, \
                     pay_to_address = ?9, platform_fee_percent = ?10, pattern = ?11, \
                     active = ?12, metadata = ?13 WHERE id = ?14",
                    params![
                        owner_param(link.owner),
                        link.kind.as_str(),
                        link.slug,
                        link.title,
                        link.description,
                        amount_text(link.amount),
                        link.currency,
                        link.network,
                        link.pay_to_address,
                        amount_text(link.platform_fee_percent),
                        pattern,
                        link.active,
                        metadata,
                        link.id,
                    ],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound(format!("payment link {}", link.id)).into());
                }
                link.id
            };
            let mut rule_metadata = Metadata::new();
            rule_metadata.insert("payment_link_id".into(), json!(id));
            rule_metadata.insert("link_kind".into(), json!(link.kind.as_str()));
            rule_metadata.insert(
                "platform_fee_percent".into(),
                json!(amount_text(link.platform_fee_percent)),
            );
            sync_resource_rule(
                &tx,
                &ResourceRule {
                    source_kind: link.kind.as_str(),
                    source_id: id,
                    owner: link.owner,
                    pattern: &pattern,
                    amount: link.amount,
                    currency: &link.currency,
                    network: &link.network,
                    pay_to_address: link.pay_to_address.as_deref(),
                    active: link.active,
                    metadata: rule_metadata,
                },
            )?;
            let saved = select_link(&tx, id)?;
            tx.commit()?;
            tracing::info!(link_id = id, owner = %saved.owner, pattern = %saved.pattern, "Saved payment link");
            Ok(saved)
        })
        .await
    }

    /// Creates (`id == 0`) or updates a credit plan, keeping its pricing rule
    /// in step.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidInput`] for a bad slug, fee percent or a
    /// non-positive `credits_per_payment`, [`StoreError::NotFound`] when
    /// updating an unknown id.
    pub async fn save_credit_plan(&self, plan: CreditPlan) -> Result<CreditPlan, StoreError> {
        validate_slug(&plan.slug)?;
        validate_fee_percent(plan.platform_fee_percent)?;
        if plan.credits_per_payment <= 0 {
            return Err(StoreError::InvalidInput(
                "credits_per_payment must be positive".into(),
            ));
        }
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let pattern = if plan.pattern.trim().is_empty() {
                credit_plan_path(plan.owner, &plan.slug)
            } else {
                normalize_path(&plan.pattern)
            };
            let metadata = serde_json::to_string(&plan.metadata)?;
            let id = if plan.id == 0 {
                tx.execute(
                    "INSERT INTO credit_plans (owner_id, slug, title, description, amount, \
                     currency, network, pay_to_address, platform_fee_percent, \
                     credits_per_payment, pattern, active, metadata) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        owner_param(plan.owner),
                        plan.slug,
                        plan.title,
                        plan.description,
                        amount_text(plan.amount),
                        plan.currency,
                        plan.network,
                        plan.pay_to_address,
                        amount_text(plan.platform_fee_percent),
                        plan.credits_per_payment,
                        pattern,
                        plan.active,
                        metadata,
                    ],
                )?;
                tx.last_insert_rowid()
            } else {
                let updated = tx.execute(
                    "UPDATE credit_plans SET owner_id = ?1, slug = ?2, title = ?3, \
                     description = ?4, amount = ?5, currency = ?6, network = ?7, \
                     pay_to_address = ?8, platform_fee_percent = ?9, credits_per_payment = ?10, \
                     pattern = ?11, active = ?12, metadata = ?13 WHERE id = ?14",
                    params![
                        owner_param(plan.owner),
                        plan.slug,
                        plan.title,
                        plan.description,
                        amount_text(plan.amount),
                        plan.currency,
                        plan.network,
                        plan.pay_to_address,
                        amount_text(plan.platform_fee_percent),
                        plan.credits_per_payment,
                        pattern,
                        plan.active,
                        metadata,
                        plan.id,
                    ],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound(format!("credit plan {}", plan.id)).into());
                }
                plan.id
            };
            let mut rule_metadata = Metadata::new();
            rule_metadata.insert("credit_plan_id".into(), json!(id));
            rule_metadata.insert("credits_per_payment".into(), json!(plan.credits_per_payment));
            rule_metadata.insert(
                "platform_fee_percent".into(),
                json!(amount_text(plan.platform_fee_percent)),
            );
            sync_resource_rule(
                &tx,
                &ResourceRule {
                    source_kind: "credit_plan",
                    source_id: id,
                    owner: plan.owner,
                    pattern: &pattern,
                    amount: plan.amount,
                    currency: &plan.currency,
                    network: &plan.network,
                    pay_to_address: plan.pay_to_address.as_deref(),
                    active: plan.active,
                    metadata: rule_metadata,
                },
            )?;
            let saved = select_plan(&tx, id)?;
            tx.commit()?;
            tracing::info!(plan_id = id, owner = %saved.owner, pattern = %saved.pattern, "Saved credit plan");
            Ok(saved)
        })
        .await
    }

    /// Events recorded against `link_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub async fn link_events(&self, link_id: i64) -> Result<Vec<LinkEvent>, StoreError> {
        self.run(move |conn| {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM link_events WHERE link_id = ?1 ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let events = stmt
                .query_map(params![link_id], event_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(events)
        })
        .await
    }

    /// Credit movements of `plan_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub async fn credit_usages(&self, plan_id: i64) -> Result<Vec<CreditUsage>, StoreError> {
        self.run(move |conn| {
            let sql = format!("SELECT {USAGE_COLUMNS} FROM credit_usages WHERE plan_id = ?1 ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let usages = stmt
                .query_map(params![plan_id], usage_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(usages)
        })
        .await
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn find_payment_link(
        &self,
        owner: Option<TenantId>,
        path: &str,
    ) -> Result<Option<PaymentLink>, StoreError> {
        let path = path.to_owned();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {LINK_COLUMNS} FROM payment_links WHERE active = 1 AND pattern = ?1 \
                 AND (?2 IS NULL OR owner_id = ?2) ORDER BY id LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![path, owner.map(owner_param)], link_from_row)
                .optional()?)
        })
        .await
    }

    async fn find_credit_plan(
        &self,
        owner: Option<TenantId>,
        path: &str,
    ) -> Result<Option<CreditPlan>, StoreError> {
        let path = path.to_owned();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {PLAN_COLUMNS} FROM credit_plans WHERE active = 1 AND pattern = ?1 \
                 AND (?2 IS NULL OR owner_id = ?2) ORDER BY id LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![path, owner.map(owner_param)], plan_from_row)
                .optional()?)
        })
        .await
    }

    async fn payment_link_by_slug(
        &self,
        owner: TenantId,
        kind: LinkKind,
        slug: &str,
    ) -> Result<Option<PaymentLink>, StoreError> {
        let slug = slug.to_owned();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {LINK_COLUMNS} FROM payment_links \
                 WHERE owner_id = ?1 AND kind = ?2 AND slug = ?3"
            );
            Ok(conn
                .query_row(
                    &sql,
                    params![owner_param(owner), kind.as_str(), slug],
                    link_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn credit_plan_by_slug(
        &self,
        owner: TenantId,
        slug: &str,
    ) -> Result<Option<CreditPlan>, StoreError> {
        let slug = slug.to_owned();
        self.run(move |conn| {
            let sql =
                format!("SELECT {PLAN_COLUMNS} FROM credit_plans WHERE owner_id = ?1 AND slug = ?2");
            Ok(conn
                .query_row(&sql, params![owner_param(owner), slug], plan_from_row)
                .optional()?)
        })
        .await
    }

    async fn upsert_link_event(&self, draft: LinkEventDraft) -> Result<LinkEvent, StoreError> {
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(mut existing) = select_event(&tx, draft.link_id, &draft.receipt_nonce)? {
                if draft.payer.is_some() {
                    existing.payer = draft.payer;
                }
                existing.metadata.extend(draft.metadata);
                tx.execute(
                    "UPDATE link_events SET payer = ?1, metadata = ?2 WHERE id = ?3",
                    params![
                        existing.payer,
                        serde_json::to_string(&existing.metadata)?,
                        existing.id
                    ],
                )?;
                tx.commit()?;
                return Ok(existing);
            }
            tx.execute(
                "INSERT INTO link_events (link_id, receipt_nonce, amount, fee_amount, \
                 merchant_amount, currency, network, payer, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    draft.link_id,
                    draft.receipt_nonce,
                    amount_text(draft.amount),
                    amount_text(draft.split.fee),
                    amount_text(draft.split.merchant),
                    draft.currency,
                    draft.network,
                    draft.payer,
                    serde_json::to_string(&draft.metadata)?,
                    now_secs(),
                ],
            )?;
            let event = select_event(&tx, draft.link_id, &draft.receipt_nonce)?
                .ok_or_else(|| StoreError::NotFound(format!("link event {}", draft.receipt_nonce)))?;
            tx.commit()?;
            Ok(event)
        })
        .await
    }

    async fn apply_credit_top_up(&self, top_up: CreditTopUp) -> Result<CreditMovement, StoreError> {
        if top_up.credits <= 0 {
            return Err(StoreError::InvalidInput(
                "credits_per_payment must be positive".into(),
            ));
        }
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT id, subscription_id FROM credit_usages \
                     WHERE plan_id = ?1 AND receipt_nonce = ?2 AND kind = 'top_up'",
                    params![top_up.plan_id, top_up.receipt_nonce],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((usage_id, subscription_id)) = existing {
                let movement = CreditMovement {
                    subscription: select_subscription_by_id(&tx, subscription_id)?,
                    usage: select_usage(&tx, usage_id)?,
                    applied: false,
                };
                return Ok(movement);
            }

            let now = now_secs();
            tx.execute(
                "INSERT INTO credit_subscriptions (plan_id, consumer_ref, credits_remaining, \
                 total_credits, last_purchase_at, created_at) VALUES (?1, ?2, ?3, ?3, ?4, ?4) \
                 ON CONFLICT(plan_id, consumer_ref) DO UPDATE SET \
                 credits_remaining = credits_remaining + excluded.credits_remaining, \
                 total_credits = total_credits + excluded.total_credits, \
                 last_purchase_at = excluded.last_purchase_at",
                params![top_up.plan_id, top_up.consumer_ref, top_up.credits, now],
            )?;
            let subscription = select_subscription(&tx, top_up.plan_id, &top_up.consumer_ref)?
                .ok_or_else(|| StoreError::NotFound(format!("subscription {}", top_up.consumer_ref)))?;
            let usage = insert_usage(
                &tx,
                subscription.id,
                top_up.plan_id,
                Some(&top_up.receipt_nonce),
                UsageKind::TopUp,
                top_up.credits,
                [top_up.amount, top_up.split.fee, top_up.split.merchant],
                None,
                &top_up.metadata,
            )?;
            tx.commit()?;
            Ok(CreditMovement {
                subscription,
                usage,
                applied: true,
            })
        })
        .await
    }

    async fn consume_credits(&self, debit: CreditDebit) -> Result<CreditMovement, StoreError> {
        if debit.credits <= 0 {
            return Err(StoreError::InvalidInput("credits must be positive".into()));
        }
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut subscription) =
                select_subscription(&tx, debit.plan_id, &debit.consumer_ref)?
            else {
                return Err(StoreError::InsufficientCredits {
                    available: 0,
                    requested: debit.credits,
                }
                .into());
            };
            let updated = tx.execute(
                "UPDATE credit_subscriptions SET credits_remaining = credits_remaining - ?1 \
                 WHERE id = ?2 AND credits_remaining >= ?1",
                params![debit.credits, subscription.id],
            )?;
            if updated == 0 {
                return Err(StoreError::InsufficientCredits {
                    available: subscription.credits_remaining,
                    requested: debit.credits,
                }
                .into());
            }
            subscription.credits_remaining -= debit.credits;
            let usage = insert_usage(
                &tx,
                subscription.id,
                debit.plan_id,
                None,
                UsageKind::Consumption,
                -debit.credits,
                [Decimal::ZERO; 3],
                debit.description.as_deref(),
                &debit.metadata,
            )?;
            tx.commit()?;
            Ok(CreditMovement {
                subscription,
                usage,
                applied: true,
            })
        })
        .await
    }

    async fn credit_subscription(
        &self,
        plan_id: i64,
        consumer: &str,
    ) -> Result<Option<CreditSubscription>, StoreError> {
        let consumer = consumer.to_owned();
        self.run(move |conn| select_subscription(conn, plan_id, &consumer))
            .await
    }
}
