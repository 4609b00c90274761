use futures::future::join_all;
use tracing::{error, info};

use super::ingestor::{IngestSummary, ProviderIngestor};
use crate::error::{error_chain, IngestError};

/// Runs provider ingestions concurrently and waits for all of them.
#[derive(Default)]
pub struct IngestionRunner {
    ingestors: Vec<ProviderIngestor>,
}

impl IngestionRunner {
    pub fn new(ingestors: Vec<ProviderIngestor>) -> Self {
        Self { ingestors }
    }

    pub fn push(&mut self, ingestor: ProviderIngestor) {
        self.ingestors.push(ingestor);
    }

    /// Every provider runs to completion. Failures (including panicked tasks) are
    /// collected into one [`IngestError::Aggregate`].
    pub async fn run_all(self) -> Result<Vec<IngestSummary>, IngestError> {
        let mut tasks = Vec::with_capacity(self.ingestors.len());
        for ingestor in self.ingestors {
            let provider = ingestor.provider().to_string();
            let handle = tokio::spawn(async move {
                info!(provider = ingestor.provider(), "starting ingestion");
                let res = ingestor.run().await;
                match &res {
                    Ok(_) => info!(provider = ingestor.provider(), "ingestion finished"),
                    Err(e) => error!(provider = ingestor.provider(), error = %error_chain(e), "ingestion failed"),
                }
                res
            });
            tasks.push((provider, handle));
        }

        let (providers, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let results = join_all(handles).await;

        let mut summaries = Vec::new();
        let mut errors = Vec::new();
        for (provider, result) in providers.into_iter().zip(results) {
            match result {
                Ok(Ok(summary)) => summaries.push(summary),
                Ok(Err(e)) => errors.push(e),
                Err(join_err) => errors.push(IngestError::Aborted {
                    provider,
                    reason: join_err.to_string(),
                }),
            }
        }
        if errors.is_empty() {
            Ok(summaries)
        } else {
            Err(IngestError::Aggregate(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ingest::ingestor::tests::{catalog, Outcome, StubSource};
    use crate::purge::tests::seeded_staging;
    use crate::store::{MemoryStore, Store, StoreRole};
    use crate::track::{MarkerState, RegionTrackMarker};

    fn ingestor(store: &MemoryStore, source: StubSource, dir: &std::path::Path) -> ProviderIngestor {
        let marker = RegionTrackMarker::for_provider(dir, &source.provider.to_lowercase());
        ProviderIngestor::new(Arc::new(store.clone()), Arc::new(source), marker)
    }

    #[tokio::test]
    async fn providers_share_the_staging_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(StoreRole::Staging);
        let runner = IngestionRunner::new(vec![
            ingestor(
                &store,
                StubSource::new("AWS", vec![("us-east-1", Outcome::Ready(catalog("aws", 3, 1)))]),
                dir.path(),
            ),
            ingestor(
                &store,
                StubSource::new("Azure", vec![("eastus", Outcome::Ready(catalog("az", 2, 0)))]),
                dir.path(),
            ),
        ]);

        let summaries = runner.run_all().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(store.count_rows("providers").await.unwrap(), 2);
        assert_eq!(store.count_rows("skus").await.unwrap(), 5);
        assert!(dir.path().join("aws.json").exists());
        assert!(dir.path().join("azure.json").exists());
    }

    #[tokio::test]
    async fn every_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(StoreRole::Staging);
        let mut runner = IngestionRunner::default();
        runner.push(ingestor(
            &store,
            StubSource::new("AWS", vec![("us-east-1", Outcome::Broken)]),
            dir.path(),
        ));
        runner.push(ingestor(
            &store,
            StubSource::new("GCP", vec![("us-east1", Outcome::Broken)]),
            dir.path(),
        ));
        runner.push(ingestor(
            &store,
            StubSource::new("Azure", vec![("eastus", Outcome::Ready(catalog("az", 1, 0)))]),
            dir.path(),
        ));

        let err = runner.run_all().await.unwrap_err();
        let IngestError::Aggregate(errors) = &err else {
            panic!("expected aggregate, got {err}");
        };
        assert_eq!(errors.len(), 2);
        let msg = err.to_string();
        assert!(msg.contains("AWS") && msg.contains("GCP"));
        // the healthy provider still finished
        assert_eq!(store.count_rows("skus").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn recovery_purge_keeps_rows_of_other_providers() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_staging().await;
        RegionTrackMarker::for_provider(dir.path(), "aws")
            .update_marker("eu-west-1", MarkerState::Processing)
            .await
            .unwrap();

        let runner = IngestionRunner::new(vec![
            ingestor(
                &store,
                StubSource::new(
                    "Azure",
                    vec![
                        ("eastus", Outcome::Ready(catalog("eus", 3, 1))),
                        ("westeurope", Outcome::Ready(catalog("weu", 3, 0))),
                    ],
                ),
                dir.path(),
            ),
            ingestor(
                &store,
                StubSource::new("AWS", vec![("eu-west-1", Outcome::Ready(catalog("euw1", 2, 1)))]),
                dir.path(),
            ),
        ]);

        let summaries = runner.run_all().await.unwrap();
        let aws = summaries.iter().find(|s| s.provider == "AWS").unwrap();
        assert_eq!(aws.recovered.as_ref().map(|r| r.skus), Some(12));

        assert_eq!(store.count_rows("providers").await.unwrap(), 2);
        // us-east-1 seed (2) + re-ingested eu-west-1 (2) + both Azure regions (6)
        assert_eq!(store.count_rows("skus").await.unwrap(), 2 + 2 + 6);
        assert_eq!(store.count_rows("prices").await.unwrap(), 2 + 2 * 2 + 6 * 2);
        assert_eq!(store.count_rows("regions").await.unwrap(), 4);
        assert_eq!(store.count_rows("saving_plans").await.unwrap(), 1 + 1 + 1);
    }
}
