use std::path::Path;
use std::sync::{Arc, Mutex};

use b402::StoreError;
use b402::amount::parse_amount;
use b402::pricing::TenantId;
use b402::receipt::Metadata;
use b402::timestamp::UnixTimestamp;
use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, Row};
use rust_decimal::Decimal;

use crate::error::SqliteError;

/// Schema applied on every open.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Receipts, rules, ledger and nonce cache in one SQLite database.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub fn in_memory() -> Result<Self, SqliteError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, SqliteError> {
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::debug!("sqlite schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `op` against the connection on the blocking pool.
    pub(crate) async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, SqliteError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| SqliteError::Poisoned)?;
            op(&mut *guard)
        })
        .await
        .map_err(|e| SqliteError::Join(e.to_string()))?;
        result.map_err(|err| {
            if !matches!(err, SqliteError::Store(_)) {
                tracing::warn!(error = %err, "sqlite operation failed");
            }
            StoreError::from(err)
        })
    }
}

pub(crate) fn now_secs() -> i64 {
    to_sql_int(UnixTimestamp::now().as_secs())
}

pub(crate) fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn owner_param(owner: TenantId) -> i64 {
    to_sql_int(owner.0)
}

pub(crate) fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

pub(crate) fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    parse_amount(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn metadata_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Metadata> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn timestamp_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<UnixTimestamp> {
    let secs: i64 = row.get(idx)?;
    Ok(UnixTimestamp::from_secs(u64::try_from(secs).unwrap_or_default()))
}

pub(crate) fn opt_timestamp_col(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<UnixTimestamp>> {
    let secs: Option<i64> = row.get(idx)?;
    Ok(secs.map(|s| UnixTimestamp::from_secs(u64::try_from(s).unwrap_or_default())))
}

pub(crate) fn tenant_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<TenantId> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw)
        .map(TenantId)
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| conversion_error(idx, e))
}

pub(crate) fn amount_text(amount: Decimal) -> String {
    b402::amount::format_amount(amount)
}
