//! Pipeline settings read from the environment (and `.env`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::retry::RetryPolicy;
use crate::store::StoreRole;
use crate::transfer::DEFAULT_BATCH_SIZE;
use crate::util::env::{env_flag, env_list, env_opt, env_parse, env_req};

pub const DEFAULT_PROVIDERS: [&str; 3] = ["aws", "azure", "gcp"];

#[derive(Clone)]
pub struct DatabaseConfig {
    pub main_url: String,
    pub staging_url: String,
    pub backup_url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            main_url: env_req("MAIN_DATABASE_URL")?,
            staging_url: env_req("STAGING_DATABASE_URL")?,
            backup_url: env_req("BACKUP_DATABASE_URL")?,
            max_connections: env_parse("DB_MAX_CONNS", 8u32),
        })
    }

    /// No DSNs at all; only usable with in-process stores.
    pub fn unset() -> Self {
        Self {
            main_url: String::new(),
            staging_url: String::new(),
            backup_url: String::new(),
            max_connections: 1,
        }
    }

    pub fn url(&self, role: StoreRole) -> &str {
        match role {
            StoreRole::Main => &self.main_url,
            StoreRole::Staging => &self.staging_url,
            StoreRole::Backup => &self.backup_url,
        }
    }
}

// DSNs carry credentials; keep them out of logs.
impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub databases: DatabaseConfig,
    pub track_dir: PathBuf,
    pub catalog_dir: PathBuf,
    pub providers: Vec<String>,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub schedule_interval: Duration,
    pub rotate_on_ingest_failure: bool,
}

impl PipelineConfig {
    /// Fails when a required key is missing, before anything touches a store.
    pub fn from_env() -> Result<Self> {
        Self::load(DatabaseConfig::from_env()?)
    }

    /// Everything except the database DSNs, for dry runs against in-process stores.
    pub fn from_env_dry_run() -> Result<Self> {
        Self::load(DatabaseConfig::unset())
    }

    fn load(databases: DatabaseConfig) -> Result<Self> {
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env_parse("RETRY_MAX_ATTEMPTS", defaults.max_attempts),
            initial_delay: Duration::from_millis(env_parse(
                "RETRY_INITIAL_DELAY_MS",
                defaults.initial_delay.as_millis() as u64,
            )),
            max_delay: Duration::from_millis(env_parse(
                "RETRY_MAX_DELAY_MS",
                defaults.max_delay.as_millis() as u64,
            )),
            max_jitter: Duration::from_millis(env_parse(
                "RETRY_JITTER_MS",
                defaults.max_jitter.as_millis() as u64,
            )),
        };
        let providers = env_list("PROVIDERS", &DEFAULT_PROVIDERS);
        if providers.is_empty() {
            anyhow::bail!("PROVIDERS must name at least one provider");
        }

        Ok(Self {
            databases,
            track_dir: PathBuf::from(env_opt("TRACK_DIR").unwrap_or_else(|| "./track".into())),
            catalog_dir: PathBuf::from(
                env_opt("CATALOG_DIR").unwrap_or_else(|| "./price-list".into()),
            ),
            providers,
            batch_size: env_parse("TRANSFER_BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            retry,
            schedule_interval: Duration::from_secs(env_parse("SCHEDULE_INTERVAL_SECS", 60u64).max(1)),
            rotate_on_ingest_failure: env_flag("ROTATE_ON_INGEST_FAILURE", true),
        })
    }
}
