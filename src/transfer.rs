//! Generic batched copy of the managed tables between two stores.
//!
//! Rows travel as [`DynRow`]s so every table goes through the same code. Tables
//! are processed strictly in the order given (parents first) and batches within a
//! table strictly in source order.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::error::TransferError;
use crate::store::{row_id, DynRow, DynValue, Store, TABLES};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// (table, column, parent table): rows whose `column` value has no row in the
/// destination's parent table are dropped instead of written.
pub const REFERENCE_GUARDS: [(&str, &str, &str); 2] =
    [("prices", "sku_id", "skus"), ("terms", "sku_id", "skus")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Plain bulk insert into a destination the caller emptied.
    Insert,
    /// Make the destination an exact copy of the source without truncating it:
    /// destination rows missing from the source (or differing from it) are deleted,
    /// then every source row is upserted by id.
    Mirror,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub read: u64,
    pub written: u64,
    pub dropped: u64,
    pub pruned: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub tables: Vec<TableReport>,
}

impl TransferReport {
    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn written(&self) -> u64 {
        self.tables.iter().map(|t| t.written).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.tables.iter().map(|t| t.dropped).sum()
    }
}

#[derive(Debug, Clone)]
pub struct TableTransferEngine {
    batch_size: usize,
}

impl Default for TableTransferEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl TableTransferEngine {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Copy every managed table from `source` to `destination`.
    pub async fn transfer(
        &self,
        source: &dyn Store,
        destination: &dyn Store,
        mode: WriteMode,
    ) -> Result<TransferReport, TransferError> {
        self.transfer_tables(source, destination, &TABLES, mode).await
    }

    /// Copy `tables` in the given order. A failing batch aborts the transfer;
    /// tables already copied stay in the destination.
    #[instrument(skip_all, fields(from = %source.role(), to = %destination.role(), mode = ?mode))]
    pub async fn transfer_tables(
        &self,
        source: &dyn Store,
        destination: &dyn Store,
        tables: &[&str],
        mode: WriteMode,
    ) -> Result<TransferReport, TransferError> {
        let mut pruned = HashMap::new();
        if mode == WriteMode::Mirror {
            // children first, so parents never lose rows still referenced
            for table in tables.iter().rev() {
                let removed = prune_stale(source, destination, table).await?;
                pruned.insert(*table, removed);
            }
        }

        let mut report = TransferReport::default();
        for table in tables {
            let mut table_report = self.copy_table(source, destination, table, mode).await?;
            table_report.pruned = pruned.get(table).copied().unwrap_or(0);
            info!(
                table = %table_report.table,
                read = table_report.read,
                written = table_report.written,
                dropped = table_report.dropped,
                pruned = table_report.pruned,
                "table transferred"
            );
            report.tables.push(table_report);
        }
        Ok(report)
    }

    async fn copy_table(
        &self,
        source: &dyn Store,
        destination: &dyn Store,
        table: &str,
        mode: WriteMode,
    ) -> Result<TableReport, TransferError> {
        let rows = source
            .fetch_all(table)
            .await
            .map_err(|source| TransferError::ReadFailure {
                table: table.to_string(),
                source,
            })?;
        let mut report = TableReport {
            table: table.to_string(),
            read: rows.len() as u64,
            ..TableReport::default()
        };
        let mut guard = ReferenceGuard::for_table(table);

        for (n, chunk) in rows.chunks(self.batch_size).enumerate() {
            let batch_start = n * self.batch_size;
            let batch_end = batch_start + chunk.len();

            let batch = match guard.as_mut() {
                Some(guard) => guard.retain_present(destination, chunk).await?,
                None => chunk.to_vec(),
            };
            report.dropped += (chunk.len() - batch.len()) as u64;
            if batch.is_empty() {
                debug!(table, batch_start, batch_end, "batch empty after filtering, skipped");
                continue;
            }

            let written = match mode {
                WriteMode::Insert => destination.insert_rows(table, &batch).await,
                WriteMode::Mirror => destination.upsert_rows(table, &batch).await,
            }
            .map_err(|source| TransferError::WriteFailure {
                table: table.to_string(),
                batch_start,
                batch_end,
                source,
            })?;
            debug!(table, batch_start, batch_end, rows = written, "batch written");
            report.written += written;
        }
        Ok(report)
    }
}

/// Delete destination rows of `table` that the source does not hold verbatim.
/// Changed rows are removed too so the following upsert cannot trip unique keys.
async fn prune_stale(
    source: &dyn Store,
    destination: &dyn Store,
    table: &str,
) -> Result<u64, TransferError> {
    let prune_err = |source| TransferError::PruneFailure {
        table: table.to_string(),
        source,
    };
    let wanted: HashMap<i64, DynRow> = source
        .fetch_all(table)
        .await
        .map_err(|source| TransferError::ReadFailure {
            table: table.to_string(),
            source,
        })?
        .into_iter()
        .filter_map(|row| row_id(&row).map(|id| (id, row)))
        .collect();
    let existing = destination.fetch_all(table).await.map_err(prune_err)?;

    let stale: Vec<i64> = existing
        .iter()
        .filter_map(|row| {
            let id = row_id(row)?;
            match wanted.get(&id) {
                Some(current) if current == row => None,
                _ => Some(id),
            }
        })
        .collect();
    if stale.is_empty() {
        return Ok(0);
    }
    let removed = destination
        .delete_ids(table, &stale)
        .await
        .map_err(prune_err)?;
    debug!(table, rows = removed, "pruned stale destination rows");
    Ok(removed)
}

/// Existence checks against the destination, remembered for one table pass.
struct ReferenceGuard {
    column: &'static str,
    parent: &'static str,
    present: HashSet<String>,
    missing: HashSet<String>,
}

impl ReferenceGuard {
    fn for_table(table: &str) -> Option<Self> {
        REFERENCE_GUARDS
            .iter()
            .find(|(t, _, _)| *t == table)
            .map(|&(_, column, parent)| Self {
                column,
                parent,
                present: HashSet::new(),
                missing: HashSet::new(),
            })
    }

    async fn retain_present(
        &mut self,
        destination: &dyn Store,
        chunk: &[DynRow],
    ) -> Result<Vec<DynRow>, TransferError> {
        let mut kept = Vec::with_capacity(chunk.len());
        for row in chunk {
            let value = row.get(self.column).cloned().unwrap_or(DynValue::Null);
            if self.is_present(destination, &value).await? {
                kept.push(row.clone());
            }
        }
        Ok(kept)
    }

    async fn is_present(
        &mut self,
        destination: &dyn Store,
        value: &DynValue,
    ) -> Result<bool, TransferError> {
        if value.is_null() {
            return Ok(false);
        }
        let key = value.to_string();
        if self.present.contains(&key) {
            return Ok(true);
        }
        if self.missing.contains(&key) {
            return Ok(false);
        }
        let found = destination
            .exists(self.parent, "id", value)
            .await
            .map_err(|source| TransferError::ReadFailure {
                table: self.parent.to_string(),
                source,
            })?;
        if found {
            self.present.insert(key);
        } else {
            self.missing.insert(key);
        }
        Ok(found)
    }
}
