pub mod cli;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod purge;
pub mod retry;
pub mod rotate;
pub mod store;
pub mod track;
pub mod transfer;
pub mod truncate;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use config::PipelineConfig;
pub use orchestrator::{Pipeline, Stores, TickReport};
pub use purge::RegionPurger;
pub use rotate::DatabaseRotator;
pub use store::{DynRow, DynValue, Store, StoreRole};
pub use track::{MarkerState, RegionMarker, RegionTrackMarker};
pub use transfer::{TableTransferEngine, WriteMode};
pub use truncate::TruncateAll;
