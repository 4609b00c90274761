//! Persisted record of the region an ingestion run last touched.
//!
//! The marker is a two-field JSON document overwritten wholesale on every update.
//! A run that finds it in the `processing` state knows the previous run died
//! mid-region and purges that region before ingesting again.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MarkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerState {
    Processing,
    Processed,
}

impl fmt::Display for MarkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerState::Processing => f.write_str("processing"),
            MarkerState::Processed => f.write_str("processed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMarker {
    pub region_name: String,
    pub state: MarkerState,
}

impl RegionMarker {
    /// Marker left behind by a region that started but never finished.
    pub fn pending_region(&self) -> Option<&str> {
        match self.state {
            MarkerState::Processing => Some(self.region_name.as_str()),
            MarkerState::Processed => None,
        }
    }
}

/// File-backed marker. Single writer: only the ingestion owning `path` writes it.
#[derive(Debug, Clone)]
pub struct RegionTrackMarker {
    path: PathBuf,
}

impl RegionTrackMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Marker of one provider under `dir`, e.g. `track/aws.json`.
    pub fn for_provider(dir: &Path, provider: &str) -> Self {
        Self::new(dir.join(format!("{provider}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> Result<bool, MarkerError> {
        tokio::fs::try_exists(&self.path)
            .await
            .map_err(|source| self.io(source))
    }

    pub async fn read_marker(&self) -> Result<RegionMarker, MarkerError> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|source| self.io(source))?;
        serde_json::from_slice(&data).map_err(|source| MarkerError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    pub async fn create_empty(&self) -> Result<(), MarkerError> {
        self.write(&RegionMarker {
            region_name: String::new(),
            state: MarkerState::Processed,
        })
        .await
    }

    pub async fn update_marker(&self, region_name: &str, state: MarkerState) -> Result<(), MarkerError> {
        self.write(&RegionMarker {
            region_name: region_name.to_string(),
            state,
        })
        .await
    }

    /// Read the marker, creating the empty one first when none exists yet.
    pub async fn ensure(&self) -> Result<RegionMarker, MarkerError> {
        if !self.exists().await? {
            self.create_empty().await?;
        }
        self.read_marker().await
    }

    async fn write(&self, marker: &RegionMarker) -> Result<(), MarkerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io(source))?;
        }
        let data = serde_json::to_vec_pretty(marker).map_err(|source| MarkerError::Parse {
            path: self.path.clone(),
            source,
        })?;
        // write beside the target and rename so readers never see a torn record
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|source| self.io(source))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| self.io(source))?;
        debug!(path = %self.path.display(), region = %marker.region_name, state = %marker.state, "marker written");
        Ok(())
    }

    fn io(&self, source: std::io::Error) -> MarkerError {
        MarkerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let marker = RegionTrackMarker::new(dir.path().join("track.json"));

        assert!(!marker.exists().await.unwrap());
        assert!(matches!(
            marker.read_marker().await,
            Err(MarkerError::Io { .. })
        ));

        marker.create_empty().await.unwrap();
        let empty = marker.read_marker().await.unwrap();
        assert_eq!(empty.region_name, "");
        assert_eq!(empty.state, MarkerState::Processed);
        assert_eq!(empty.pending_region(), None);

        marker
            .update_marker("us-east-1", MarkerState::Processing)
            .await
            .unwrap();
        let current = marker.read_marker().await.unwrap();
        assert_eq!(current.region_name, "us-east-1");
        assert_eq!(current.state, MarkerState::Processing);
        assert_eq!(current.pending_region(), Some("us-east-1"));
    }

    #[tokio::test]
    async fn update_replaces_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let marker = RegionTrackMarker::for_provider(&dir.path().join("nested"), "aws");
        marker
            .update_marker("eu-west-1", MarkerState::Processing)
            .await
            .unwrap();
        marker
            .update_marker("eu-west-2", MarkerState::Processed)
            .await
            .unwrap();

        let raw = std::fs::read_to_string(marker.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"region_name": "eu-west-2", "state": "processed"})
        );
        assert!(!marker.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn ensure_keeps_existing_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = RegionTrackMarker::new(dir.path().join("gcp.json"));
        marker
            .update_marker("us-east1", MarkerState::Processing)
            .await
            .unwrap();
        let read = marker.ensure().await.unwrap();
        assert_eq!(read.pending_region(), Some("us-east1"));
    }

    #[tokio::test]
    async fn unknown_state_is_a_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure.json");
        std::fs::write(&path, r#"{"region_name":"westeurope","state":"done"}"#).unwrap();
        let marker = RegionTrackMarker::new(path);
        assert!(matches!(
            marker.read_marker().await,
            Err(MarkerError::Parse { .. })
        ));
    }
}
