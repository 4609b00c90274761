use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::catalog::{CatalogSource, RegionCatalog, SkuRecord};
use crate::error::{CatalogError, IngestError, StoreError};
use crate::model::{NewPrice, NewProvider, NewRegion, NewSavingsPlan, NewService, NewSku, NewTerm};
use crate::purge::{PurgeSummary, RegionPurger};
use crate::store::{first_or_create, DynRow, DynValue, Store};
use crate::track::{MarkerState, RegionTrackMarker};

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub provider: String,
    /// What crash recovery removed before ingesting, if the marker asked for it.
    pub recovered: Option<PurgeSummary>,
    pub regions_done: usize,
    pub regions_skipped: usize,
    pub skus: u64,
    pub skus_failed: u64,
    pub prices: u64,
    pub terms: u64,
    pub saving_plans: u64,
}

/// Writes one provider's catalogs into the staging store, region by region,
/// keeping the provider's marker current so a crash can be cleaned up later.
pub struct ProviderIngestor {
    store: Arc<dyn Store>,
    source: Arc<dyn CatalogSource>,
    marker: RegionTrackMarker,
}

impl ProviderIngestor {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn CatalogSource>, marker: RegionTrackMarker) -> Self {
        Self {
            store,
            source,
            marker,
        }
    }

    pub fn provider(&self) -> &str {
        self.source.provider()
    }

    #[instrument(skip(self), fields(provider = %self.source.provider()))]
    pub async fn run(&self) -> Result<IngestSummary, IngestError> {
        let provider = self.source.provider().to_string();
        let marker_err = |source| IngestError::Marker {
            provider: provider.clone(),
            source,
        };
        let storage_err = |source| IngestError::Storage {
            provider: provider.clone(),
            source,
        };
        let catalog_err = |source| IngestError::Catalog {
            provider: provider.clone(),
            source,
        };

        let marker = self.marker.ensure().await.map_err(marker_err)?;
        let now = Utc::now();
        let provider_id = first_or_create(
            self.store.as_ref(),
            "providers",
            &[("name", provider.as_str().into())],
            &NewProvider {
                name: provider.clone(),
            }
            .to_row(now),
        )
        .await
        .map_err(storage_err)?;

        let mut summary = IngestSummary {
            provider: provider.clone(),
            ..IngestSummary::default()
        };
        if let Some(region) = marker.pending_region() {
            warn!(region, "previous run stopped mid-region, purging it");
            let purged = RegionPurger::new(self.store.as_ref())
                .purge_provider_region(provider_id, region)
                .await
                .map_err(|source| IngestError::Recovery {
                    provider: provider.clone(),
                    source,
                })?;
            summary.recovered = Some(purged);
        }

        first_or_create(
            self.store.as_ref(),
            "services",
            &[
                ("provider_id", provider_id.into()),
                ("name", self.source.service().into()),
            ],
            &NewService {
                provider_id,
                name: self.source.service().to_string(),
            }
            .to_row(now),
        )
        .await
        .map_err(storage_err)?;

        let regions = self.source.regions().await.map_err(catalog_err)?;
        info!(regions = regions.len(), "ingesting regions");

        for code in &regions {
            self.marker
                .update_marker(code, MarkerState::Processing)
                .await
                .map_err(marker_err)?;
            let region_id = first_or_create(
                self.store.as_ref(),
                "regions",
                &[("provider_id", provider_id.into()), ("code", code.as_str().into())],
                &NewRegion {
                    provider_id,
                    code: code.clone(),
                }
                .to_row(Utc::now()),
            )
            .await
            .map_err(storage_err)?;

            let catalog = match self.source.region_catalog(code).await {
                Ok(catalog) => catalog,
                Err(e @ CatalogError::Transient { .. }) => {
                    warn!(region = %code, error = %e, "catalog unavailable, skipping region");
                    summary.regions_skipped += 1;
                    continue;
                }
                Err(e) => return Err(catalog_err(e)),
            };

            self.write_region(provider_id, region_id, code, &catalog, &mut summary)
                .await
                .map_err(storage_err)?;
            self.marker
                .update_marker(code, MarkerState::Processed)
                .await
                .map_err(marker_err)?;
            summary.regions_done += 1;
            info!(region = %code, skus = catalog.skus.len(), "region ingested");
        }

        info!(
            regions_done = summary.regions_done,
            regions_skipped = summary.regions_skipped,
            skus = summary.skus,
            skus_failed = summary.skus_failed,
            prices = summary.prices,
            "provider ingestion finished"
        );
        Ok(summary)
    }

    async fn write_region(
        &self,
        provider_id: i64,
        region_id: i64,
        code: &str,
        catalog: &RegionCatalog,
        summary: &mut IngestSummary,
    ) -> Result<(), StoreError> {
        for sku in &catalog.skus {
            match self.write_sku(provider_id, region_id, code, sku).await {
                Ok((prices, terms)) => {
                    summary.skus += 1;
                    summary.prices += prices;
                    summary.terms += terms;
                }
                Err(e) => {
                    warn!(region = code, sku = %sku.sku_code, error = %e, "sku insert failed, skipping");
                    summary.skus_failed += 1;
                }
            }
        }

        if catalog.savings_plans.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let plans: Vec<DynRow> = catalog
            .savings_plans
            .iter()
            .map(|p| {
                NewSavingsPlan {
                    region_id,
                    sku: p.sku.clone(),
                    discounted_sku: p.discounted_sku.clone(),
                    lease_length: p.lease_length,
                    discounted_rate: p.discounted_rate.clone(),
                    discounted_instance_type: p.discounted_instance_type.clone(),
                    unit: p.unit.clone(),
                }
                .to_row(now)
            })
            .collect();
        summary.saving_plans += self.store.insert_rows("saving_plans", &plans).await?;
        Ok(())
    }

    /// One SKU with its prices and terms. Returns (prices, terms) written.
    async fn write_sku(
        &self,
        provider_id: i64,
        region_id: i64,
        code: &str,
        sku: &SkuRecord,
    ) -> Result<(u64, u64), StoreError> {
        let now = Utc::now();
        let sku_id = first_or_create(
            self.store.as_ref(),
            "skus",
            &[("sku_code", DynValue::from(sku.sku_code.as_str()))],
            &NewSku {
                sku_code: sku.sku_code.clone(),
                region_id,
                provider_id,
                region_code: code.to_string(),
                attributes: sku.attributes.clone(),
            }
            .to_row(now),
        )
        .await?;

        let (mut prices, mut terms) = (0, 0);
        for price in &sku.prices {
            let price_id = self
                .store
                .insert_returning_id(
                    "prices",
                    &NewPrice {
                        sku_id,
                        effective_date: price.effective_date.clone(),
                        unit: price.unit.clone(),
                        price_per_unit: price.price_per_unit.clone(),
                    }
                    .to_row(now),
                )
                .await?;
            prices += 1;
            if price.term.is_empty() {
                continue;
            }
            self.store
                .insert_returning_id(
                    "terms",
                    &NewTerm {
                        sku_id,
                        price_id,
                        attributes: price.term.clone(),
                    }
                    .to_row(now),
                )
                .await?;
            terms += 1;
        }
        Ok((prices, terms))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::ingest::catalog::{PriceRecord, SavingsPlanRecord};
    use crate::model::TermAttributes;
    use crate::purge::tests::seeded_staging;
    use crate::store::memory::FailOp;
    use crate::store::{MemoryStore, StoreRole};

    #[derive(Clone)]
    pub(crate) enum Outcome {
        Ready(RegionCatalog),
        Unavailable,
        Broken,
    }

    pub(crate) struct StubSource {
        pub provider: String,
        pub regions: Vec<(String, Outcome)>,
    }

    impl StubSource {
        pub(crate) fn new(provider: &str, regions: Vec<(&str, Outcome)>) -> Self {
            Self {
                provider: provider.to_string(),
                regions: regions.into_iter().map(|(r, o)| (r.to_string(), o)).collect(),
            }
        }
    }

    #[async_trait::async_trait]
    impl CatalogSource for StubSource {
        fn provider(&self) -> &str {
            &self.provider
        }

        fn service(&self) -> &str {
            "Compute"
        }

        async fn regions(&self) -> Result<Vec<String>, CatalogError> {
            Ok(self.regions.iter().map(|(r, _)| r.clone()).collect())
        }

        async fn region_catalog(&self, region: &str) -> Result<RegionCatalog, CatalogError> {
            let outcomes: HashMap<&str, &Outcome> =
                self.regions.iter().map(|(r, o)| (r.as_str(), o)).collect();
            match outcomes.get(region) {
                Some(Outcome::Ready(catalog)) => Ok(catalog.clone()),
                Some(Outcome::Broken) => Err(CatalogError::Malformed {
                    region: region.to_string(),
                    reason: "products is not an object".into(),
                }),
                _ => Err(CatalogError::Transient {
                    region: region.to_string(),
                    reason: "connection reset".into(),
                }),
            }
        }
    }

    /// `skus` skus with an on-demand and a reserved price each, plus `plans` plans.
    pub(crate) fn catalog(prefix: &str, skus: usize, plans: usize) -> RegionCatalog {
        RegionCatalog {
            skus: (0..skus)
                .map(|n| SkuRecord {
                    sku_code: format!("{prefix}-{n}"),
                    prices: vec![
                        PriceRecord {
                            unit: "Hrs".into(),
                            price_per_unit: "0.0960000000".into(),
                            ..PriceRecord::default()
                        },
                        PriceRecord {
                            unit: "Hrs".into(),
                            price_per_unit: "0.0600000000".into(),
                            term: TermAttributes {
                                lease_length: Some("1yr".into()),
                                ..TermAttributes::default()
                            },
                            ..PriceRecord::default()
                        },
                    ],
                    ..SkuRecord::default()
                })
                .collect(),
            savings_plans: (0..plans)
                .map(|n| SavingsPlanRecord {
                    sku: format!("{prefix}-plan-{n}"),
                    discounted_sku: format!("{prefix}-0"),
                    lease_length: 1,
                    discounted_rate: "0.05".into(),
                    ..SavingsPlanRecord::default()
                })
                .collect(),
        }
    }

    fn ingestor(store: &MemoryStore, source: StubSource, dir: &std::path::Path) -> ProviderIngestor {
        let marker = RegionTrackMarker::for_provider(dir, &source.provider.to_lowercase());
        ProviderIngestor::new(Arc::new(store.clone()), Arc::new(source), marker)
    }

    async fn skus_in_region(store: &MemoryStore, code: &str) -> usize {
        store
            .fetch_all("skus")
            .await
            .unwrap()
            .iter()
            .filter(|r| r.get("region_code").and_then(DynValue::as_str) == Some(code))
            .count()
    }

    #[tokio::test]
    async fn ingests_every_region_and_marks_processed() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(StoreRole::Staging);
        let source = StubSource::new(
            "AWS",
            vec![
                ("us-east-1", Outcome::Ready(catalog("use1", 3, 2))),
                ("us-west-2", Outcome::Ready(catalog("usw2", 2, 0))),
            ],
        );
        let ingestor = ingestor(&store, source, dir.path());

        let summary = ingestor.run().await.unwrap();
        assert_eq!(summary.regions_done, 2);
        assert_eq!(summary.skus, 5);
        assert_eq!(summary.prices, 10);
        assert_eq!(summary.terms, 5);
        assert_eq!(summary.saving_plans, 2);
        assert!(summary.recovered.is_none());

        assert_eq!(store.count_rows("providers").await.unwrap(), 1);
        assert_eq!(store.count_rows("services").await.unwrap(), 1);
        assert_eq!(store.count_rows("regions").await.unwrap(), 2);
        assert_eq!(store.count_rows("terms").await.unwrap(), 5);

        let marker = ingestor.marker.read_marker().await.unwrap();
        assert_eq!(marker.region_name, "us-west-2");
        assert_eq!(marker.state, MarkerState::Processed);
    }

    #[tokio::test]
    async fn interrupted_region_is_purged_and_reingested() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_staging().await;
        let marker = RegionTrackMarker::for_provider(dir.path(), "aws");
        marker
            .update_marker("eu-west-1", MarkerState::Processing)
            .await
            .unwrap();

        let source = StubSource::new("AWS", vec![("eu-west-1", Outcome::Ready(catalog("euw1", 2, 1)))]);
        let summary = ingestor(&store, source, dir.path()).run().await.unwrap();

        let recovered = summary.recovered.unwrap();
        assert_eq!((recovered.regions, recovered.skus, recovered.saving_plans), (1, 12, 3));
        // the other region of the seeded provider is left alone
        assert_eq!(store.count_rows("skus").await.unwrap(), 2 + 2);
        assert_eq!(store.count_rows("saving_plans").await.unwrap(), 1 + 1);
        assert_eq!(store.count_rows("providers").await.unwrap(), 1);
        assert_eq!(skus_in_region(&store, "eu-west-1").await, 2);
    }

    #[tokio::test]
    async fn unavailable_region_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(StoreRole::Staging);
        let source = StubSource::new(
            "Azure",
            vec![
                ("eastus", Outcome::Unavailable),
                ("westeurope", Outcome::Ready(catalog("weu", 1, 0))),
            ],
        );
        let summary = ingestor(&store, source, dir.path()).run().await.unwrap();
        assert_eq!(summary.regions_skipped, 1);
        assert_eq!(summary.regions_done, 1);
        assert_eq!(summary.skus, 1);
    }

    #[tokio::test]
    async fn malformed_catalog_aborts_and_leaves_marker_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(StoreRole::Staging);
        let source = StubSource::new(
            "GCP",
            vec![
                ("us-east1", Outcome::Ready(catalog("use1", 1, 0))),
                ("europe-west1", Outcome::Broken),
                ("asia-east1", Outcome::Ready(catalog("ase1", 1, 0))),
            ],
        );
        let ingestor = ingestor(&store, source, dir.path());

        let err = ingestor.run().await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Catalog {
                source: CatalogError::Malformed { .. },
                ..
            }
        ));
        let marker = ingestor.marker.read_marker().await.unwrap();
        assert_eq!(marker.pending_region(), Some("europe-west1"));
        assert_eq!(skus_in_region(&store, "asia-east1").await, 0);
    }

    #[tokio::test]
    async fn failed_sku_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(StoreRole::Staging);
        store.fail_on(FailOp::Insert, Some("skus"));
        let source = StubSource::new("AWS", vec![("us-east-1", Outcome::Ready(catalog("use1", 3, 0)))]);

        let summary = ingestor(&store, source, dir.path()).run().await.unwrap();
        assert_eq!(summary.skus_failed, 1);
        assert_eq!(summary.skus, 2);
        assert_eq!(store.count_rows("skus").await.unwrap(), 2);
        assert_eq!(store.count_rows("prices").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn existing_sku_code_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(StoreRole::Staging);
        let source = StubSource::new(
            "AWS",
            vec![
                ("us-east-1", Outcome::Ready(catalog("shared", 2, 0))),
                ("us-east-2", Outcome::Ready(catalog("shared", 2, 0))),
            ],
        );
        let summary = ingestor(&store, source, dir.path()).run().await.unwrap();
        assert_eq!(summary.skus, 4);
        assert_eq!(store.count_rows("skus").await.unwrap(), 2);
        assert_eq!(store.count_rows("prices").await.unwrap(), 8);
    }
}
