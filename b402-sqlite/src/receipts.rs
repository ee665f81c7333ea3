use async_trait::async_trait;
use b402::StoreError;
use b402::receipt::{ReceiptDraft, ReceiptOutcome, ReceiptRecord, ReceiptStatus};
use b402::store::ReceiptStore;
use b402::timestamp::UnixTimestamp;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::error::SqliteError;
use crate::store::{
    SqliteStore, amount_text, decimal_col, metadata_col, now_secs, opt_timestamp_col, owner_param,
    parsed_col, timestamp_col, to_sql_int,
};

const RECEIPT_COLUMNS: &str = "nonce, status, amount, currency, network, payer, receipt_token, \
     owner_id, request_path, request_method, metadata, created_at, verified_at, ledger_applied";

fn receipt_from_row(row: &Row<'_>) -> rusqlite::Result<ReceiptRecord> {
    let owner: Option<i64> = row.get(7)?;
    Ok(ReceiptRecord {
        nonce: row.get(0)?,
        status: parsed_col(row, 1)?,
        amount: decimal_col(row, 2)?,
        currency: row.get(3)?,
        network: row.get(4)?,
        payer: row.get(5)?,
        receipt_token: row.get(6)?,
        owner: owner
            .and_then(|o| u64::try_from(o).ok())
            .map(b402::TenantId),
        request_path: row.get(8)?,
        request_method: row.get(9)?,
        metadata: metadata_col(row, 10)?,
        created_at: timestamp_col(row, 11)?,
        verified_at: opt_timestamp_col(row, 12)?,
        ledger_applied: row.get(13)?,
    })
}

fn select_receipt(conn: &Connection, nonce: &str) -> Result<Option<ReceiptRecord>, SqliteError> {
    let sql = format!("SELECT {RECEIPT_COLUMNS} FROM receipts WHERE nonce = ?1");
    Ok(conn
        .query_row(&sql, params![nonce], receipt_from_row)
        .optional()?)
}

#[async_trait]
impl ReceiptStore for SqliteStore {
    async fn insert_or_fetch(
        &self,
        draft: ReceiptDraft,
    ) -> Result<(ReceiptRecord, bool), StoreError> {
        self.run(move |conn| {
            let metadata = serde_json::to_string(&draft.metadata)?;
            let inserted = conn.execute(
                "INSERT INTO receipts (nonce, status, amount, currency, network, owner_id, \
                 request_path, request_method, metadata, created_at) \
                 VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(nonce) DO NOTHING",
                params![
                    draft.nonce,
                    amount_text(draft.amount),
                    draft.currency,
                    draft.network,
                    draft.owner.map(owner_param),
                    draft.request_path,
                    draft.request_method,
                    metadata,
                    now_secs(),
                ],
            )?;
            let record = select_receipt(conn, &draft.nonce)?
                .ok_or_else(|| StoreError::NotFound(format!("receipt {}", draft.nonce)))?;
            Ok((record, inserted == 1))
        })
        .await
    }

    async fn fetch(&self, nonce: &str) -> Result<Option<ReceiptRecord>, StoreError> {
        let nonce = nonce.to_owned();
        self.run(move |conn| select_receipt(conn, &nonce)).await
    }

    async fn finalize(
        &self,
        nonce: &str,
        outcome: ReceiptOutcome,
    ) -> Result<Option<ReceiptRecord>, StoreError> {
        let nonce = nonce.to_owned();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut record) = select_receipt(&tx, &nonce)? else {
                return Ok(None);
            };
            if !record.finalize(outcome, UnixTimestamp::now()) {
                return Ok(None);
            }
            // Compare-and-swap on the pending status.
            let updated = tx.execute(
                "UPDATE receipts SET status = ?1, amount = ?2, payer = ?3, receipt_token = ?4, \
                 metadata = ?5, verified_at = ?6 WHERE nonce = ?7 AND status = 'pending'",
                params![
                    record.status.as_str(),
                    amount_text(record.amount),
                    record.payer,
                    record.receipt_token,
                    serde_json::to_string(&record.metadata)?,
                    record.verified_at.map(|t| to_sql_int(t.as_secs())),
                    nonce,
                ],
            )?;
            if updated != 1 {
                return Ok(None);
            }
            tx.commit()?;
            Ok(Some(record))
        })
        .await
    }

    async fn claim_transaction(
        &self,
        network: &str,
        transaction_id: &str,
        nonce: &str,
    ) -> Result<bool, StoreError> {
        let (network, transaction_id, nonce) =
            (network.to_owned(), transaction_id.to_owned(), nonce.to_owned());
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO receipt_transactions (network, transaction_id, nonce, created_at) \
                 VALUES (?1, ?2, ?3, ?4) ON CONFLICT(network, transaction_id) DO NOTHING",
                params![network, transaction_id, nonce, now_secs()],
            )?;
            let owner: String = conn.query_row(
                "SELECT nonce FROM receipt_transactions WHERE network = ?1 AND transaction_id = ?2",
                params![network, transaction_id],
                |row| row.get(0),
            )?;
            Ok(owner == nonce)
        })
        .await
    }

    async fn mark_ledger_applied(&self, nonce: &str) -> Result<(), StoreError> {
        let nonce = nonce.to_owned();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE receipts SET ledger_applied = 1 WHERE nonce = ?1",
                params![nonce],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("receipt {nonce}")).into());
            }
            Ok(())
        })
        .await
    }

    async fn unapplied_confirmed(&self, limit: usize) -> Result<Vec<ReceiptRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let sql = format!(
                "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE status = ?1 AND ledger_applied = 0 \
                 ORDER BY verified_at, nonce LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![ReceiptStatus::Confirmed.as_str(), limit],
                    receipt_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use b402::receipt::Metadata;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn draft(nonce: &str) -> ReceiptDraft {
        let mut metadata = Metadata::new();
        metadata.insert("challenge".into(), json!({"pay_to": "PAYEE"}));
        ReceiptDraft {
            nonce: nonce.into(),
            amount: Decimal::new(75, 2),
            currency: "USDC".into(),
            network: "algorand".into(),
            owner: Some(b402::TenantId(7)),
            request_path: "/paid".into(),
            request_method: "GET".into(),
            metadata,
        }
    }

    fn confirmed(token: &str) -> ReceiptOutcome {
        let mut metadata = Metadata::new();
        metadata.insert("transaction_id".into(), json!("TX1"));
        ReceiptOutcome::Confirmed {
            amount: Decimal::new(80, 2),
            payer: Some("PAYER".into()),
            receipt_token: token.into(),
            metadata,
        }
    }

    #[tokio::test]
    async fn test_insert_or_fetch_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let (first, created) = store.insert_or_fetch(draft("n1")).await.unwrap();
        assert!(created);
        assert_eq!(first.status, ReceiptStatus::Pending);
        assert_eq!(first.owner, Some(b402::TenantId(7)));
        assert_eq!(first.amount, Decimal::new(75, 2));

        let mut other = draft("n1");
        other.amount = Decimal::ONE;
        let (second, created) = store.insert_or_fetch(other).await.unwrap();
        assert!(!created);
        assert_eq!(second.amount, Decimal::new(75, 2));
        assert_eq!(second.metadata["challenge"]["pay_to"], "PAYEE");
    }

    #[tokio::test]
    async fn test_finalize_is_compare_and_swap() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_or_fetch(draft("n1")).await.unwrap();

        let record = store
            .finalize("n1", confirmed("tok"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ReceiptStatus::Confirmed);
        assert_eq!(record.payer.as_deref(), Some("PAYER"));
        assert_eq!(record.metadata["transaction_id"], "TX1");
        assert_eq!(record.metadata["challenge"]["pay_to"], "PAYEE");
        assert!(record.verified_at.is_some());

        let again = store
            .finalize(
                "n1",
                ReceiptOutcome::Rejected {
                    reason: "late".into(),
                    receipt_token: None,
                    metadata: Metadata::new(),
                },
            )
            .await
            .unwrap();
        assert!(again.is_none());
        assert!(store.finalize("missing", confirmed("t")).await.unwrap().is_none());

        let stored = store.fetch("n1").await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_concurrent_finalize_has_one_winner() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_or_fetch(draft("race")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.finalize("race", confirmed(&format!("tok-{i}"))).await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_unapplied_confirmed_and_mark_applied() {
        let store = SqliteStore::in_memory().unwrap();
        for nonce in ["a", "b", "c"] {
            store.insert_or_fetch(draft(nonce)).await.unwrap();
        }
        store.finalize("a", confirmed("t")).await.unwrap();
        store.finalize("b", confirmed("t")).await.unwrap();

        let pending = store.unapplied_confirmed(10).await.unwrap();
        let nonces: Vec<_> = pending.iter().map(|r| r.nonce.as_str()).collect();
        assert_eq!(nonces, ["a", "b"]);
        assert_eq!(store.unapplied_confirmed(1).await.unwrap().len(), 1);

        store.mark_ledger_applied("a").await.unwrap();
        let pending = store.unapplied_confirmed(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].nonce, "b");
        assert!(store.fetch("a").await.unwrap().unwrap().ledger_applied);

        assert!(matches!(
            store.mark_ledger_applied("zzz").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transaction_is_claimed_once() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.claim_transaction("algorand", "TX1", "n1").await.unwrap());
        assert!(store.claim_transaction("algorand", "TX1", "n1").await.unwrap());
        assert!(!store.claim_transaction("algorand", "TX1", "n2").await.unwrap());
        assert!(store.claim_transaction("testnet", "TX1", "n2").await.unwrap());
    }
}
