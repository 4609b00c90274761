use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::catalog::{CatalogSource, RegionCatalog};
use crate::error::CatalogError;

/// Reads normalized catalogs written by the provider fetchers:
/// `<root>/<provider key>/<region code>.json`, one file per region.
#[derive(Debug, Clone)]
pub struct FileCatalogSource {
    dir: PathBuf,
    provider: String,
    service: String,
}

impl FileCatalogSource {
    pub fn new(dir: impl Into<PathBuf>, provider: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            provider: provider.into(),
            service: service.into(),
        }
    }

    /// Source for one of the configured provider keys (`aws`, `azure`, `gcp`).
    pub fn for_provider(root: &Path, key: &str) -> Self {
        let (provider, service) = match key {
            "aws" => ("AWS", "AmazonEC2"),
            "azure" => ("Azure", "Virtual Machines"),
            "gcp" => ("GCP", "Compute Engine"),
            other => (other, "Compute"),
        };
        Self::new(root.join(key), provider, service)
    }

    fn region_path(&self, region: &str) -> PathBuf {
        self.dir.join(format!("{region}.json"))
    }
}

#[async_trait]
impl CatalogSource for FileCatalogSource {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn service(&self) -> &str {
        &self.service
    }

    /// Region codes are the `.json` file stems, sorted.
    async fn regions(&self) -> Result<Vec<String>, CatalogError> {
        let unreadable = |e: std::io::Error| CatalogError::Transient {
            region: "*".into(),
            reason: format!("cannot list {}: {e}", self.dir.display()),
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(unreadable)?;
        let mut regions = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                regions.push(stem.to_string());
            }
        }
        regions.sort();
        debug!(provider = %self.provider, regions = regions.len(), "catalog regions listed");
        Ok(regions)
    }

    async fn region_catalog(&self, region: &str) -> Result<RegionCatalog, CatalogError> {
        let path = self.region_path(region);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| CatalogError::Transient {
                region: region.to_string(),
                reason: format!("{}: {e}", path.display()),
            })?;
        serde_json::from_slice(&data).map_err(|e| CatalogError::Malformed {
            region: region.to_string(),
            reason: format!("{}: {e}", path.display()),
        })
    }
}
