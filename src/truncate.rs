use serde::Serialize;
use tracing::{info, warn};

use crate::error::TruncateError;
use crate::store::{Store, StoreRole, TABLES};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TruncateOutcome {
    Truncated { tables: usize },
    /// The backup store is only ever written through transfer.
    SkippedBackup,
}

/// Wipes every managed table of a store and resets its id sequences.
pub struct TruncateAll;

impl TruncateAll {
    pub async fn truncate(store: &dyn Store) -> Result<TruncateOutcome, TruncateError> {
        let role = store.role();
        if role == StoreRole::Backup {
            warn!(%role, "refusing to truncate the backup store");
            return Ok(TruncateOutcome::SkippedBackup);
        }
        for table in TABLES {
            store
                .truncate_table(table)
                .await
                .map_err(|source| TruncateError::StorageFailure {
                    role,
                    table: table.to_string(),
                    source,
                })?;
        }
        info!(%role, tables = TABLES.len(), "store truncated");
        Ok(TruncateOutcome::Truncated {
            tables: TABLES.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_chain;
    use crate::purge::tests::{row, seeded_staging};
    use crate::store::memory::FailOp;
    use crate::store::MemoryStore;
    use crate::transfer::{TableTransferEngine, WriteMode};

    #[tokio::test]
    async fn empties_every_table_and_restarts_ids() {
        let store = seeded_staging().await;
        let outcome = TruncateAll::truncate(&store).await.unwrap();
        assert_eq!(outcome, TruncateOutcome::Truncated { tables: 7 });
        for table in TABLES {
            assert_eq!(store.count_rows(table).await.unwrap(), 0, "{table}");
        }
        let id = store
            .insert_returning_id("providers", &row(&[("name", "Azure".into())]))
            .await
            .unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn backup_is_never_touched() {
        let source = seeded_staging().await;
        let backup = MemoryStore::new(StoreRole::Backup);
        TableTransferEngine::default()
            .transfer(&source, &backup, WriteMode::Mirror)
            .await
            .unwrap();
        // even a store that would fail every truncate is left alone
        backup.fail_on(FailOp::Truncate, None);

        let outcome = TruncateAll::truncate(&backup).await.unwrap();
        assert_eq!(outcome, TruncateOutcome::SkippedBackup);
        for table in TABLES {
            assert_eq!(
                backup.count_rows(table).await.unwrap(),
                source.count_rows(table).await.unwrap(),
                "{table}"
            );
        }
    }

    #[tokio::test]
    async fn truncating_empty_store_succeeds() {
        let store = MemoryStore::new(StoreRole::Main);
        assert!(TruncateAll::truncate(&store).await.is_ok());
        assert!(TruncateAll::truncate(&store).await.is_ok());
    }

    #[tokio::test]
    async fn failure_names_role_and_table() {
        let store = seeded_staging().await;
        store.fail_on(FailOp::Truncate, Some("skus"));
        let err = TruncateAll::truncate(&store).await.unwrap_err();
        assert_eq!(err.to_string(), "failed to truncate table skus in staging store");
        assert_eq!(
            error_chain(&err),
            "failed to truncate table skus in staging store: injected failure: Truncate on skus"
        );
    }
}
