//! Promotion of the staging dataset into main, keeping the previous main in backup.
//!
//! Steps run strictly in order and each failure aborts the rotation. Backup is
//! refreshed before main is emptied, so a crash in between leaves main intact. A
//! crash after main is emptied and before staging lands leaves main empty until
//! the next successful rotation; staging still holds the data at that point.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::error::RotateError;
use crate::store::{PgStore, Store, StoreRole};
use crate::transfer::{TableTransferEngine, TransferReport, WriteMode};
use crate::truncate::{TruncateAll, TruncateOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct RotationReport {
    /// Main providers counted before anything moved.
    pub main_providers: i64,
    /// None when main was empty and nothing needed preserving.
    pub backup: Option<TransferReport>,
    pub main_truncate: Option<TruncateOutcome>,
    pub promoted: TransferReport,
    pub staging_truncate: TruncateOutcome,
}

pub struct DatabaseRotator {
    main: Arc<dyn Store>,
    staging: Arc<dyn Store>,
    backup: Arc<dyn Store>,
    engine: TableTransferEngine,
}

/// Open a Postgres store for `role` from the configured DSNs.
pub async fn connect_role(config: &DatabaseConfig, role: StoreRole) -> Result<Arc<dyn Store>, RotateError> {
    let store = PgStore::connect(role, config.url(role), config.max_connections)
        .await
        .map_err(|source| RotateError::ConnectFailure { role, source })?;
    Ok(Arc::new(store))
}

fn expect_role(store: &dyn Store, expected: StoreRole) -> Result<(), RotateError> {
    let actual = store.role();
    if actual == expected {
        Ok(())
    } else {
        Err(RotateError::RoleMismatch { expected, actual })
    }
}

impl DatabaseRotator {
    pub fn new(
        main: Arc<dyn Store>,
        staging: Arc<dyn Store>,
        backup: Arc<dyn Store>,
    ) -> Result<Self, RotateError> {
        expect_role(main.as_ref(), StoreRole::Main)?;
        expect_role(staging.as_ref(), StoreRole::Staging)?;
        expect_role(backup.as_ref(), StoreRole::Backup)?;
        Ok(Self {
            main,
            staging,
            backup,
            engine: TableTransferEngine::default(),
        })
    }

    pub fn with_engine(mut self, engine: TableTransferEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Connect to all three stores; the first failing connection aborts.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, RotateError> {
        let main = connect_role(config, StoreRole::Main).await?;
        let staging = connect_role(config, StoreRole::Staging).await?;
        let backup = connect_role(config, StoreRole::Backup).await?;
        Self::new(main, staging, backup)
    }

    #[instrument(skip(self))]
    pub async fn rotate(&self) -> Result<RotationReport, RotateError> {
        let main_providers = self
            .main
            .count_rows("providers")
            .await
            .map_err(RotateError::Inspect)?;

        let mut backup = None;
        let mut main_truncate = None;
        if main_providers > 0 {
            info!(main_providers, "backing up main");
            let report = self
                .engine
                .transfer(self.main.as_ref(), self.backup.as_ref(), WriteMode::Mirror)
                .await
                .map_err(|source| RotateError::Transfer {
                    from: StoreRole::Main,
                    to: StoreRole::Backup,
                    source,
                })?;
            backup = Some(report);
            main_truncate = Some(TruncateAll::truncate(self.main.as_ref()).await?);
        } else {
            info!("main is empty, skipping backup");
        }

        let promoted = self
            .engine
            .transfer(self.staging.as_ref(), self.main.as_ref(), WriteMode::Insert)
            .await
            .map_err(|source| RotateError::Transfer {
                from: StoreRole::Staging,
                to: StoreRole::Main,
                source,
            })?;
        let staging_truncate = TruncateAll::truncate(self.staging.as_ref()).await?;

        info!(
            promoted_rows = promoted.written(),
            dropped_rows = promoted.dropped(),
            backed_up_rows = backup.as_ref().map_or(0, TransferReport::written),
            "rotation complete"
        );
        Ok(RotationReport {
            main_providers,
            backup,
            main_truncate,
            promoted,
            staging_truncate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purge::tests::row;
    use crate::store::memory::FailOp;
    use crate::store::{DynRow, MemoryStore, TABLES};

    /// `providers` providers, `regions` regions and `skus` skus spread round robin,
    /// one price per sku.
    async fn seed(store: &MemoryStore, providers: i64, regions: i64, skus: i64, tag: &str) {
        let mut provider_ids = Vec::new();
        for p in 0..providers {
            provider_ids.push(
                store
                    .insert_returning_id("providers", &row(&[("name", format!("{tag}-provider-{p}").into())]))
                    .await
                    .unwrap(),
            );
        }
        let mut region_ids = Vec::new();
        for r in 0..regions {
            let provider = provider_ids[(r % providers) as usize];
            let id = store
                .insert_returning_id(
                    "regions",
                    &row(&[("code", format!("{tag}-region-{r}").into()), ("provider_id", provider.into())]),
                )
                .await
                .unwrap();
            region_ids.push((id, provider));
        }
        for s in 0..skus {
            let (region, provider) = region_ids[(s % regions) as usize];
            let sku = store
                .insert_returning_id(
                    "skus",
                    &row(&[
                        ("sku_code", format!("{tag}-sku-{s}").into()),
                        ("region_id", region.into()),
                        ("provider_id", provider.into()),
                    ]),
                )
                .await
                .unwrap();
            store
                .insert_returning_id("prices", &row(&[("sku_id", sku.into()), ("unit", "Hrs".into())]))
                .await
                .unwrap();
        }
    }

    async fn snapshot(store: &MemoryStore) -> Vec<Vec<DynRow>> {
        let mut tables = Vec::new();
        for table in TABLES {
            tables.push(store.fetch_all(table).await.unwrap());
        }
        tables
    }

    async fn counts(store: &MemoryStore) -> (i64, i64, i64) {
        (
            store.count_rows("providers").await.unwrap(),
            store.count_rows("regions").await.unwrap(),
            store.count_rows("skus").await.unwrap(),
        )
    }

    fn stores() -> (MemoryStore, MemoryStore, MemoryStore) {
        (
            MemoryStore::new(StoreRole::Main),
            MemoryStore::new(StoreRole::Staging),
            MemoryStore::new(StoreRole::Backup),
        )
    }

    fn rotator(main: &MemoryStore, staging: &MemoryStore, backup: &MemoryStore) -> DatabaseRotator {
        DatabaseRotator::new(
            Arc::new(main.clone()),
            Arc::new(staging.clone()),
            Arc::new(backup.clone()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn promotes_staging_and_keeps_previous_main() {
        let (main, staging, backup) = stores();
        seed(&main, 3, 10, 50, "old").await;
        seed(&staging, 1, 2, 5, "new").await;
        let main_before = snapshot(&main).await;
        let staging_before = snapshot(&staging).await;

        let report = rotator(&main, &staging, &backup).rotate().await.unwrap();

        assert_eq!(counts(&backup).await, (3, 10, 50));
        assert_eq!(counts(&main).await, (1, 2, 5));
        assert_eq!(counts(&staging).await, (0, 0, 0));
        assert_eq!(snapshot(&backup).await, main_before);
        assert_eq!(snapshot(&main).await, staging_before);
        for table in TABLES {
            assert_eq!(staging.count_rows(table).await.unwrap(), 0, "{table}");
        }
        assert_eq!(report.main_providers, 3);
        assert!(report.backup.is_some());
        assert_eq!(report.promoted.table("prices").unwrap().written, 5);
    }

    #[tokio::test]
    async fn empty_main_skips_backup() {
        let (main, staging, backup) = stores();
        seed(&backup, 2, 2, 4, "older").await;
        seed(&staging, 1, 1, 3, "new").await;
        let backup_before = snapshot(&backup).await;

        let report = rotator(&main, &staging, &backup).rotate().await.unwrap();

        assert!(report.backup.is_none());
        assert!(report.main_truncate.is_none());
        assert_eq!(snapshot(&backup).await, backup_before);
        assert_eq!(counts(&main).await, (1, 1, 3));
        assert_eq!(counts(&staging).await, (0, 0, 0));
    }

    #[tokio::test]
    async fn repeated_rotations_keep_one_backup_generation() {
        let (main, staging, backup) = stores();
        let rotator = rotator(&main, &staging, &backup);

        seed(&staging, 2, 4, 8, "first").await;
        rotator.rotate().await.unwrap();
        seed(&staging, 1, 3, 6, "second").await;
        rotator.rotate().await.unwrap();
        let second = snapshot(&main).await;
        seed(&staging, 1, 1, 1, "third").await;
        rotator.rotate().await.unwrap();

        assert_eq!(snapshot(&backup).await, second);
        assert_eq!(counts(&backup).await, (1, 3, 6));
        assert_eq!(counts(&main).await, (1, 1, 1));
    }

    #[tokio::test]
    async fn failed_promotion_is_recovered_by_rerun() {
        let (main, staging, backup) = stores();
        seed(&main, 3, 10, 50, "old").await;
        seed(&staging, 1, 2, 5, "new").await;
        let main_before = snapshot(&main).await;
        let staging_before = snapshot(&staging).await;
        let rotator = rotator(&main, &staging, &backup);

        main.fail_on(FailOp::Insert, Some("providers"));
        let err = rotator.rotate().await.unwrap_err();
        assert!(matches!(
            err,
            RotateError::Transfer {
                from: StoreRole::Staging,
                to: StoreRole::Main,
                ..
            }
        ));
        assert_eq!(snapshot(&backup).await, main_before);
        assert_eq!(counts(&main).await, (0, 0, 0));
        assert_eq!(snapshot(&staging).await, staging_before);

        // main was left without providers, so the rerun goes straight to promotion
        main.clear_failures();
        let report = rotator.rotate().await;
        assert!(report.is_ok());
        assert_eq!(snapshot(&main).await, staging_before);
        assert_eq!(snapshot(&backup).await, main_before);
    }

    #[tokio::test]
    async fn truncate_failure_aborts_before_promotion() {
        let (main, staging, backup) = stores();
        seed(&main, 1, 1, 1, "old").await;
        seed(&staging, 1, 1, 1, "new").await;
        main.fail_on(FailOp::Truncate, Some("prices"));

        let err = rotator(&main, &staging, &backup).rotate().await.unwrap_err();
        assert!(matches!(err, RotateError::Truncate(_)));
        assert_eq!(counts(&staging).await, (1, 1, 1));
        assert_eq!(counts(&backup).await, (1, 1, 1));
    }

    #[test]
    fn stores_must_match_their_slot() {
        let (main, staging, backup) = stores();
        let err = DatabaseRotator::new(Arc::new(staging), Arc::new(main), Arc::new(backup))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RotateError::RoleMismatch {
                expected: StoreRole::Main,
                actual: StoreRole::Staging
            }
        ));
    }
}
