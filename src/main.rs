use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cloud_pricing_sync::{
    cli::counts,
    logging::init_tracing,
    store::{DynValue, PgStore},
    util::{db::Db, env as env_util},
    Pipeline, PipelineConfig, RegionPurger, RegionTrackMarker, Store, StoreRole, Stores,
};
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pricing_sync", version, about = "Cloud pricing ingestion and database rotation")]
struct Cli {
    /// Use in-process stores instead of the configured databases (nothing is persisted).
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest every configured provider into the staging store once
    Ingest,
    /// Promote staging into main, keeping the previous main in backup
    Rotate,
    /// Ingestion followed by rotation, each under the retry policy
    Tick,
    /// Run `tick` on the configured interval until interrupted
    Schedule,
    /// Inspect or reset a provider's region marker
    Marker {
        #[command(subcommand)]
        action: MarkerAction,
    },
    /// Remove one region and everything under it from the staging store
    Purge {
        region: String,
        /// Only purge the region of this provider (providers.name, e.g. AWS)
        #[arg(long)]
        provider: Option<String>,
    },
    /// Row counts of every managed table in all three stores
    Counts,
    /// Apply the numbered SQL files to one or all stores
    Migrate {
        #[arg(long, value_enum)]
        role: Option<RoleArg>,
        #[arg(long, default_value = "./migrations")]
        dir: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum MarkerAction {
    Show { provider: String },
    /// Overwrite the marker with an empty, processed record
    Reset { provider: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Main,
    Staging,
    Backup,
}

impl From<RoleArg> for StoreRole {
    fn from(r: RoleArg) -> Self {
        match r {
            RoleArg::Main => StoreRole::Main,
            RoleArg::Staging => StoreRole::Staging,
            RoleArg::Backup => StoreRole::Backup,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing()?;
    let cli = Cli::parse();

    // missing DSNs abort here, before any store or marker is touched
    let config = if cli.dry_run {
        PipelineConfig::from_env_dry_run()?
    } else {
        PipelineConfig::from_env()?
    };
    info!(
        providers = ?config.providers,
        track_dir = %config.track_dir.display(),
        catalog_dir = %config.catalog_dir.display(),
        dry_run = cli.dry_run,
        "configuration loaded"
    );

    if let Command::Marker { action } = &cli.command {
        return run_marker(&config, action).await;
    }
    if let Command::Migrate { role, dir } = &cli.command {
        return run_migrate(&config, *role, dir).await;
    }

    let pipeline = if cli.dry_run {
        Pipeline::new(config, Stores::in_memory())
    } else {
        Pipeline::connect(config).await?
    };

    match cli.command {
        Command::Ingest => {
            let summaries = pipeline.run_ingestion().await?;
            print_json(&summaries)?;
        }
        Command::Rotate => {
            let report = pipeline.run_rotation().await?;
            print_json(&report)?;
        }
        Command::Tick => {
            let report = pipeline.run_tick().await;
            print_json(&report)?;
            if !report.succeeded() {
                anyhow::bail!("tick did not complete");
            }
        }
        Command::Schedule => pipeline.run_schedule().await?,
        Command::Purge { region, provider } => {
            let staging = pipeline.stores().staging.as_ref();
            let purger = RegionPurger::new(staging);
            let summary = match provider {
                Some(name) => {
                    let Some(provider_id) = staging
                        .find_id("providers", &[("name", DynValue::from(name.as_str()))])
                        .await?
                    else {
                        error!(provider = %name, "provider not found in staging");
                        anyhow::bail!("unknown provider {name}");
                    };
                    purger.purge_provider_region(provider_id, &region).await?
                }
                None => purger.purge_region(&region).await?,
            };
            print_json(&summary)?;
        }
        Command::Counts => {
            let mut all = Vec::new();
            for role in [StoreRole::Main, StoreRole::Staging, StoreRole::Backup] {
                all.push(counts::collect(pipeline.stores().get(role).as_ref()).await?);
            }
            print!("{}", counts::render(&all));
        }
        Command::Marker { .. } | Command::Migrate { .. } => {}
    }
    Ok(())
}

async fn run_marker(config: &PipelineConfig, action: &MarkerAction) -> Result<()> {
    match action {
        MarkerAction::Show { provider } => {
            let marker = RegionTrackMarker::for_provider(&config.track_dir, provider);
            if !marker.exists().await? {
                println!("no marker at {}", marker.path().display());
                return Ok(());
            }
            print_json(&marker.read_marker().await?)
        }
        MarkerAction::Reset { provider } => {
            let marker = RegionTrackMarker::for_provider(&config.track_dir, provider);
            marker.create_empty().await?;
            info!(path = %marker.path().display(), "marker reset");
            Ok(())
        }
    }
}

async fn run_migrate(config: &PipelineConfig, role: Option<RoleArg>, dir: &Path) -> Result<()> {
    let roles: Vec<StoreRole> = match role {
        Some(r) => vec![r.into()],
        None => vec![StoreRole::Main, StoreRole::Staging, StoreRole::Backup],
    };
    for role in roles {
        let store = PgStore::connect(role, config.databases.url(role), config.databases.max_connections)
            .await
            .with_context(|| format!("connecting to {role} store"))?;
        Db::run_migrations(&store.db().pool, dir)
            .await
            .with_context(|| format!("migrating {role} store"))?;
        info!(%role, "migrations applied");
    }
    Ok(())
}
