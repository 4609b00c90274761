use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreRole;

/// Failure reported by a store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("unknown table {0}")]
    UnknownTable(String),
    #[error("unsupported column type {type_name} for {table}.{column}")]
    UnsupportedColumn {
        table: String,
        column: String,
        type_name: String,
    },
    #[error("injected failure: {0}")]
    Injected(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum MarkerError {
    #[error("marker io on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid marker json in {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum PurgeError {
    #[error("purge of region {region} failed while {step}")]
    Storage {
        region: String,
        step: &'static str,
        #[source]
        source: StoreError,
    },
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("failed to read table {table}")]
    ReadFailure {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to write table {table} (batch {batch_start}-{batch_end})")]
    WriteFailure {
        table: String,
        batch_start: usize,
        batch_end: usize,
        #[source]
        source: StoreError,
    },
    #[error("failed to prune stale rows of {table}")]
    PruneFailure {
        table: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Error, Debug)]
pub enum TruncateError {
    #[error("failed to truncate table {table} in {role} store")]
    StorageFailure {
        role: StoreRole,
        table: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Error, Debug)]
pub enum RotateError {
    #[error("failed to connect to {role} store")]
    ConnectFailure {
        role: StoreRole,
        #[source]
        source: anyhow::Error,
    },
    #[error("store passed as {expected} reports role {actual}")]
    RoleMismatch {
        expected: StoreRole,
        actual: StoreRole,
    },
    #[error("failed to check whether main store has data")]
    Inspect(#[source] StoreError),
    #[error("transfer {from} -> {to} failed")]
    Transfer {
        from: StoreRole,
        to: StoreRole,
        #[source]
        source: TransferError,
    },
    #[error(transparent)]
    Truncate(#[from] TruncateError),
}

/// Failure raised by a catalog collaborator for one region.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The unit of work can be skipped (download failure, missing file).
    #[error("transient catalog failure for {region}: {reason}")]
    Transient { region: String, reason: String },
    /// The catalog exists but cannot be understood; aborts the provider run.
    #[error("malformed catalog for {region}: {reason}")]
    Malformed { region: String, reason: String },
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("provider {provider}: marker failure")]
    Marker {
        provider: String,
        #[source]
        source: MarkerError,
    },
    #[error("provider {provider}: crash recovery failed")]
    Recovery {
        provider: String,
        #[source]
        source: PurgeError,
    },
    #[error("provider {provider}: storage failure")]
    Storage {
        provider: String,
        #[source]
        source: StoreError,
    },
    #[error("provider {provider}: catalog failure")]
    Catalog {
        provider: String,
        #[source]
        source: CatalogError,
    },
    #[error("provider {provider}: task aborted: {reason}")]
    Aborted { provider: String, reason: String },
    #[error("{} provider ingestion(s) failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<IngestError>),
}

fn join_errors(errors: &[IngestError]) -> String {
    errors
        .iter()
        .map(|e| error_chain(e))
        .collect::<Vec<_>>()
        .join("; ")
}

/// `err` followed by each of its sources, separated like anyhow's `{:#}`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    std::iter::successors(Some(err), |e| e.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}
