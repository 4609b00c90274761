//! Normalized catalog records handed to ingestion by the provider-specific fetchers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::model::{SkuAttributes, TermAttributes};

/// Everything published for one region of one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionCatalog {
    pub skus: Vec<SkuRecord>,
    #[serde(default)]
    pub savings_plans: Vec<SavingsPlanRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkuRecord {
    pub sku_code: String,
    #[serde(flatten)]
    pub attributes: SkuAttributes,
    #[serde(default)]
    pub prices: Vec<PriceRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    #[serde(default)]
    pub effective_date: String,
    pub unit: String,
    pub price_per_unit: String,
    /// Empty for on-demand prices.
    #[serde(default)]
    pub term: TermAttributes,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavingsPlanRecord {
    pub sku: String,
    pub discounted_sku: String,
    #[serde(default)]
    pub lease_length: i32,
    pub discounted_rate: String,
    #[serde(default)]
    pub discounted_instance_type: String,
    #[serde(default)]
    pub unit: String,
}

/// Provider-specific fetcher. Download, pagination and schema mapping happen
/// behind this trait; ingestion only sees normalized records.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Provider name as stored in `providers.name`.
    fn provider(&self) -> &str;

    /// Service row the provider's catalog belongs to.
    fn service(&self) -> &str;

    async fn regions(&self) -> Result<Vec<String>, CatalogError>;

    async fn region_catalog(&self, region: &str) -> Result<RegionCatalog, CatalogError>;
}
