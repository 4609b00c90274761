//! Store abstraction shared by ingestion, purge, transfer, truncation and rotation.
//!
//! Components receive explicit store handles instead of reaching for global
//! connections; each handle knows which role (main, staging, backup) it plays.

pub mod memory;
pub mod postgres;
pub mod value;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use value::{row_id, DynRow, DynValue};

pub type StoreResult<T> = Result<T, StoreError>;

/// Managed tables, parents before children. Transfer walks this order;
/// pruning walks it backwards.
pub const TABLES: [&str; 7] = [
    "providers",
    "services",
    "regions",
    "skus",
    "prices",
    "terms",
    "saving_plans",
];

/// (child table, column, parent table) for every declared foreign key.
/// All of them cascade on delete.
pub const FOREIGN_KEYS: [(&str, &str, &str); 8] = [
    ("services", "provider_id", "providers"),
    ("regions", "provider_id", "providers"),
    ("skus", "region_id", "regions"),
    ("skus", "provider_id", "providers"),
    ("prices", "sku_id", "skus"),
    ("terms", "sku_id", "skus"),
    ("terms", "price_id", "prices"),
    ("saving_plans", "region_id", "regions"),
];

pub fn is_managed_table(table: &str) -> bool {
    TABLES.contains(&table)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreRole {
    Main,
    Staging,
    Backup,
}

impl StoreRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreRole::Main => "main",
            StoreRole::Staging => "staging",
            StoreRole::Backup => "backup",
        }
    }
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One relational store holding the managed tables.
///
/// Table names passed in must be one of [`TABLES`]; backends reject others with
/// [`StoreError::UnknownTable`] so names can be spliced into SQL safely.
#[async_trait]
pub trait Store: Send + Sync {
    fn role(&self) -> StoreRole;

    async fn count_rows(&self, table: &str) -> StoreResult<i64>;

    /// Every row of `table`, ordered by id.
    async fn fetch_all(&self, table: &str) -> StoreResult<Vec<DynRow>>;

    /// Bulk insert as a single statement. Rows are expected to share one column set.
    async fn insert_rows(&self, table: &str, rows: &[DynRow]) -> StoreResult<u64>;

    /// Bulk insert overwriting existing rows with the same id.
    async fn upsert_rows(&self, table: &str, rows: &[DynRow]) -> StoreResult<u64>;

    async fn delete_ids(&self, table: &str, ids: &[i64]) -> StoreResult<u64>;

    async fn exists(&self, table: &str, column: &str, value: &DynValue) -> StoreResult<bool>;

    /// Id of the first row matching every `(column, value)` filter.
    async fn find_id(&self, table: &str, filters: &[(&str, DynValue)]) -> StoreResult<Option<i64>>;

    /// Insert a single row (without id) and return the assigned id.
    async fn insert_returning_id(&self, table: &str, row: &DynRow) -> StoreResult<i64>;

    /// Remove every row, cascade to dependents and reset the id sequence.
    async fn truncate_table(&self, table: &str) -> StoreResult<()>;

    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;
}

/// Unit of work on one store. Dropping it without `commit` discards its changes.
#[async_trait]
pub trait StoreTx: Send {
    async fn select_ids(
        &mut self,
        table: &str,
        column: &str,
        value: &DynValue,
    ) -> StoreResult<Vec<i64>>;

    async fn delete_where_in(&mut self, table: &str, column: &str, ids: &[i64])
        -> StoreResult<u64>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Id of the first row of `table` matching `filters`, inserting `row` when none does.
pub async fn first_or_create(
    store: &dyn Store,
    table: &str,
    filters: &[(&str, DynValue)],
    row: &DynRow,
) -> StoreResult<i64> {
    if let Some(id) = store.find_id(table, filters).await? {
        return Ok(id);
    }
    store.insert_returning_id(table, row).await
}

pub(crate) fn check_table(table: &str) -> StoreResult<()> {
    if is_managed_table(table) {
        Ok(())
    } else {
        Err(StoreError::UnknownTable(table.to_string()))
    }
}

/// Column names are spliced into SQL; only plain identifiers pass.
pub(crate) fn check_column(column: &str) -> StoreResult<()> {
    let valid = !column.is_empty()
        && column
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Other(format!("invalid column name {column:?}")))
    }
}
