//! Transactional removal of everything ingested for one region.

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::{PurgeError, StoreError};
use crate::store::{DynValue, Store, StoreTx};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub regions: u64,
    pub skus: u64,
    pub prices: u64,
    pub terms: u64,
    pub saving_plans: u64,
}

impl PurgeSummary {
    pub fn is_noop(&self) -> bool {
        self.regions == 0
    }
}

pub struct RegionPurger<'a> {
    store: &'a dyn Store,
}

impl<'a> RegionPurger<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Delete every region with code `region` and all rows depending on it.
    /// A region that does not exist is a successful no-op.
    #[instrument(skip(self), fields(role = %self.store.role()))]
    pub async fn purge_region(&self, region: &str) -> Result<PurgeSummary, PurgeError> {
        self.purge(region, None).await
    }

    /// Same as [`purge_region`](Self::purge_region) but limited to one provider's
    /// region, since region codes are only unique per provider.
    #[instrument(skip(self), fields(role = %self.store.role()))]
    pub async fn purge_provider_region(
        &self,
        provider_id: i64,
        region: &str,
    ) -> Result<PurgeSummary, PurgeError> {
        self.purge(region, Some(provider_id)).await
    }

    async fn purge(&self, region: &str, provider_id: Option<i64>) -> Result<PurgeSummary, PurgeError> {
        let fail = |step: &'static str| {
            let region = region.to_string();
            move |source: StoreError| PurgeError::Storage {
                region,
                step,
                source,
            }
        };

        let mut tx = self.store.begin().await.map_err(fail("opening transaction"))?;
        match delete_region_tree(tx.as_mut(), region, provider_id).await {
            Ok(summary) => {
                tx.commit().await.map_err(fail("committing"))?;
                if summary.is_noop() {
                    info!(region, "region not present, nothing to purge");
                } else {
                    info!(
                        region,
                        skus = summary.skus,
                        prices = summary.prices,
                        terms = summary.terms,
                        saving_plans = summary.saving_plans,
                        "purged region data"
                    );
                }
                Ok(summary)
            }
            Err((step, source)) => {
                if let Err(e) = tx.rollback().await {
                    warn!(region, error = %e, "rollback after failed purge also failed");
                }
                Err(fail(step)(source))
            }
        }
    }
}

async fn delete_region_tree(
    tx: &mut dyn StoreTx,
    region: &str,
    provider_id: Option<i64>,
) -> Result<PurgeSummary, (&'static str, StoreError)> {
    let mut region_ids = tx
        .select_ids("regions", "code", &DynValue::from(region))
        .await
        .map_err(|e| ("looking up region", e))?;
    if let Some(provider_id) = provider_id {
        let owned = tx
            .select_ids("regions", "provider_id", &DynValue::Int(provider_id))
            .await
            .map_err(|e| ("looking up region", e))?;
        region_ids.retain(|id| owned.contains(id));
    }
    if region_ids.is_empty() {
        return Ok(PurgeSummary::default());
    }

    let mut sku_ids = Vec::new();
    for id in &region_ids {
        let ids = tx
            .select_ids("skus", "region_id", &DynValue::Int(*id))
            .await
            .map_err(|e| ("looking up skus", e))?;
        sku_ids.extend(ids);
    }

    // children first so stores without cascading keys accept every delete
    let terms = tx
        .delete_where_in("terms", "sku_id", &sku_ids)
        .await
        .map_err(|e| ("deleting terms", e))?;
    let prices = tx
        .delete_where_in("prices", "sku_id", &sku_ids)
        .await
        .map_err(|e| ("deleting prices", e))?;
    let skus = tx
        .delete_where_in("skus", "region_id", &region_ids)
        .await
        .map_err(|e| ("deleting skus", e))?;
    let saving_plans = tx
        .delete_where_in("saving_plans", "region_id", &region_ids)
        .await
        .map_err(|e| ("deleting saving plans", e))?;
    let regions = tx
        .delete_where_in("regions", "id", &region_ids)
        .await
        .map_err(|e| ("deleting region", e))?;

    Ok(PurgeSummary {
        regions,
        skus,
        prices,
        terms,
        saving_plans,
    })
}
