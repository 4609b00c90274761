//! Provider ingestion into the staging store.

pub mod catalog;
pub mod file_source;
pub mod ingestor;
pub mod runner;

pub use catalog::{CatalogSource, PriceRecord, RegionCatalog, SavingsPlanRecord, SkuRecord};
pub use file_source::FileCatalogSource;
pub use ingestor::{IngestSummary, ProviderIngestor};
pub use runner::IngestionRunner;
