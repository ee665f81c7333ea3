use async_trait::async_trait;
use b402::StoreError;
use b402::pricing::{TenantId, TenantRule};
use b402::receipt::Metadata;
use b402::store::PricingRuleStore;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use rust_decimal::Decimal;

use crate::error::SqliteError;
use crate::store::{
    SqliteStore, amount_text, conversion_error, decimal_col, metadata_col, owner_param, tenant_col,
};

const RULE_COLUMNS: &str = "id, owner_id, pattern, methods, amount, currency, network, priority, \
     active, pay_to_address, metadata";

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<TenantRule> {
    let methods: String = row.get(3)?;
    Ok(TenantRule {
        id: row.get(0)?,
        owner: tenant_col(row, 1)?,
        pattern: row.get(2)?,
        methods: serde_json::from_str(&methods).map_err(|e| conversion_error(3, e))?,
        amount: decimal_col(row, 4)?,
        currency: row.get(5)?,
        network: row.get(6)?,
        priority: row.get(7)?,
        active: row.get(8)?,
        pay_to_address: row.get(9)?,
        metadata: metadata_col(row, 10)?,
    })
}

/// Increments the rules version of `owner`, invalidating resolver caches.
pub(crate) fn bump_rules_version(conn: &Connection, owner: TenantId) -> Result<(), SqliteError> {
    conn.execute(
        "INSERT INTO pricing_rule_versions (owner_id, version) VALUES (?1, 1) \
         ON CONFLICT(owner_id) DO UPDATE SET version = version + 1",
        params![owner_param(owner)],
    )?;
    Ok(())
}

/// Pricing rule mirrored from a link, widget or credit plan.
pub(crate) struct ResourceRule<'a> {
    pub source_kind: &'a str,
    pub source_id: i64,
    pub owner: TenantId,
    pub pattern: &'a str,
    pub amount: Decimal,
    pub currency: &'a str,
    pub network: &'a str,
    pub pay_to_address: Option<&'a str>,
    pub active: bool,
    pub metadata: Metadata,
}

/// Writes the rule of a resource, creating it on first save.
///
/// Must run inside the transaction that saves the resource.
pub(crate) fn sync_resource_rule(
    conn: &Connection,
    rule: &ResourceRule<'_>,
) -> Result<(), SqliteError> {
    let previous_owner: Option<TenantId> = conn
        .query_row(
            "SELECT owner_id FROM pricing_rules WHERE source_kind = ?1 AND source_id = ?2",
            params![rule.source_kind, rule.source_id],
            |row| tenant_col(row, 0),
        )
        .optional()?;
    conn.execute(
        "INSERT INTO pricing_rules (owner_id, pattern, methods, amount, currency, network, \
         priority, active, pay_to_address, metadata, source_kind, source_id) \
         VALUES (?1, ?2, '[\"GET\"]', ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT(source_kind, source_id) DO UPDATE SET \
         owner_id = excluded.owner_id, pattern = excluded.pattern, amount = excluded.amount, \
         currency = excluded.currency, network = excluded.network, active = excluded.active, \
         pay_to_address = excluded.pay_to_address, metadata = excluded.metadata",
        params![
            owner_param(rule.owner),
            rule.pattern,
            amount_text(rule.amount),
            rule.currency,
            rule.network,
            rule.active,
            rule.pay_to_address,
            serde_json::to_string(&rule.metadata)?,
            rule.source_kind,
            rule.source_id,
        ],
    )?;
    bump_rules_version(conn, rule.owner)?;
    if let Some(previous) = previous_owner.filter(|p| *p != rule.owner) {
        bump_rules_version(conn, previous)?;
    }
    Ok(())
}

impl SqliteStore {
    /// Inserts a tenant rule (`id == 0`) or replaces the rule with that id.
    ///
    /// Bumps the tenant's rules version in the same transaction.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when updating an id that does not exist,
    /// [`StoreError::InvalidInput`] for a negative price or empty pattern.
    pub async fn upsert_tenant_rule(&self, rule: TenantRule) -> Result<TenantRule, StoreError> {
        rule.validate()?;
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let methods = serde_json::to_string(&rule.methods)?;
            let metadata = serde_json::to_string(&rule.metadata)?;
            let mut stored = rule.clone();
            if rule.id == 0 {
                tx.execute(
                    "INSERT INTO pricing_rules (owner_id, pattern, methods, amount, currency, \
                     network, priority, active, pay_to_address, metadata) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        owner_param(rule.owner),
                        rule.pattern,
                        methods,
                        amount_text(rule.amount),
                        rule.currency,
                        rule.network,
                        rule.priority,
                        rule.active,
                        rule.pay_to_address,
                        metadata,
                    ],
                )?;
                stored.id = tx.last_insert_rowid();
            } else {
                let previous_owner: TenantId = tx
                    .query_row(
                        "SELECT owner_id FROM pricing_rules WHERE id = ?1",
                        params![rule.id],
                        |row| tenant_col(row, 0),
                    )
                    .optional()?
                    .ok_or_else(|| StoreError::NotFound(format!("pricing rule {}", rule.id)))?;
                tx.execute(
                    "UPDATE pricing_rules SET owner_id = ?1, pattern = ?2, methods = ?3, \
                     amount = ?4, currency = ?5, network = ?6, priority = ?7, active = ?8, \
                     pay_to_address = ?9, metadata = ?10 WHERE id = ?11",
                    params![
                        owner_param(rule.owner),
                        rule.pattern,
                        methods,
                        amount_text(rule.amount),
                        rule.currency,
                        rule.network,
                        rule.priority,
                        rule.active,
                        rule.pay_to_address,
                        metadata,
                        rule.id,
                    ],
                )?;
                if previous_owner != rule.owner {
                    bump_rules_version(&tx, previous_owner)?;
                }
            }
            bump_rules_version(&tx, rule.owner)?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }
}

#[async_trait]
impl PricingRuleStore for SqliteStore {
    async fn rules_version(&self, owner: TenantId) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let version: Option<i64> = conn
                .query_row(
                    "SELECT version FROM pricing_rule_versions WHERE owner_id = ?1",
                    params![owner_param(owner)],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(version.map_or(0, |v| u64::try_from(v).unwrap_or_default()))
        })
        .await
    }

    async fn active_rules(&self, owner: TenantId) -> Result<Vec<TenantRule>, StoreError> {
        self.run(move |conn| {
            let sql = format!(
                "SELECT {RULE_COLUMNS} FROM pricing_rules WHERE owner_id = ?1 AND active = 1 \
                 ORDER BY priority, pattern, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rules = stmt
                .query_map(params![owner_param(owner)], rule_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rules)
        })
        .await
    }
}
