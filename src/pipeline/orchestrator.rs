//! Pipeline Orchestrator - drives one run through its stages
//!
//! ingestion -> exploration -> pii_scanning -> quality_checks, strictly in
//! order. A stage error fails the run with that stage's message; results of
//! earlier stages stay on the run record. Cancellation is honored between
//! stages.

use crate::batch::TabularBatch;
use crate::connectors::{FetchRequest, SourceConnector};
use crate::error::{Result, SyncError};
use crate::pipeline::detectors::Detectors;
use crate::pipeline::explore::profile;
use crate::pipeline::run::{PipelineRun, PipelineStep, RunResults, RunTracker};
use crate::state::{IncrementalStateManager, StreamUpdate};
use crate::store::BoundedDataStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the ingestion stage gets its batch
pub enum IngestionSource<'a> {
    /// Pre-fetched rows (e.g. an uploaded file)
    Upload(TabularBatch),
    /// Fetch through a connector and advance the source's stream state
    Connector {
        source_id: String,
        connector: &'a mut dyn SourceConnector,
        request: FetchRequest,
    },
}

pub struct PipelineOrchestrator {
    store: Arc<BoundedDataStore>,
    state: Arc<IncrementalStateManager>,
    tracker: Arc<RunTracker>,
    detectors: Detectors,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<BoundedDataStore>,
        state: Arc<IncrementalStateManager>,
        tracker: Arc<RunTracker>,
        detectors: Detectors,
    ) -> Self {
        Self {
            store,
            state,
            tracker,
            detectors,
        }
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    pub fn store(&self) -> &Arc<BoundedDataStore> {
        &self.store
    }

    pub fn state(&self) -> &Arc<IncrementalStateManager> {
        &self.state
    }

    /// Submit and execute a run in one call
    pub async fn run(&self, dataset_name: &str, source: IngestionSource<'_>) -> Result<PipelineRun> {
        let run = self.tracker.submit(dataset_name);
        self.execute(&run.run_id, source).await
    }

    /// Execute a queued run. Stage failures are recorded on the run, not
    /// returned; the returned record is the run's final snapshot.
    pub async fn execute(&self, run_id: &str, source: IngestionSource<'_>) -> Result<PipelineRun> {
        self.tracker.start(run_id)?;
        info!("Run {} started", run_id);

        let mut source = Some(source);
        let mut batch: Option<Arc<TabularBatch>> = None;

        for step in PipelineStep::ALL {
            if self.tracker.is_terminal(run_id) {
                warn!("Run {} was stopped before {}", run_id, step);
                return self.final_snapshot(run_id);
            }
            self.tracker.advance(run_id, step)?;
            debug!("Run {} entering {}", run_id, step);

            let outcome = match step {
                PipelineStep::Ingestion => match source.take() {
                    Some(source) => self.ingest(run_id, source).await.map(|b| batch = Some(b)),
                    None => Err(SyncError::Validation("ingestion source already consumed".to_string())),
                },
                PipelineStep::Exploration => self.with_batch(&batch, |b| {
                    let explore = profile(b);
                    self.record(run_id, |r| r.explore = Some(explore))
                }),
                PipelineStep::PiiScanning => self.with_batch(&batch, |b| {
                    let report = self.detectors.pii.scan(b)?;
                    info!(
                        "Run {}: {} sensitive-field findings over {} fields",
                        run_id,
                        report.findings.len(),
                        report.total_fields
                    );
                    self.record(run_id, |r| r.pii = Some(report))
                }),
                PipelineStep::QualityChecks => self.with_batch(&batch, |b| {
                    let report = self.detectors.quality.check(b)?;
                    info!("Run {}: quality score {:.3}", run_id, report.overall_score);
                    self.record(run_id, |r| r.quality = Some(report))
                }),
            };

            if let Err(e) = outcome {
                if self.tracker.is_terminal(run_id) {
                    // cancelled while the stage was in flight
                    return self.final_snapshot(run_id);
                }
                let failure = match e {
                    stage @ SyncError::Stage { .. } => stage,
                    other => SyncError::stage(step.as_str(), other.to_string()),
                };
                self.tracker.fail(run_id, failure.to_string())?;
                return self.final_snapshot(run_id);
            }
        }

        if let Err(e) = self.tracker.complete(run_id) {
            warn!("Run {} could not complete: {}", run_id, e);
        }
        self.final_snapshot(run_id)
    }

    async fn ingest(&self, run_id: &str, source: IngestionSource<'_>) -> Result<Arc<TabularBatch>> {
        let dataset_name = self
            .tracker
            .snapshot(run_id)
            .map(|r| r.dataset_name)
            .unwrap_or_default();

        match source {
            IngestionSource::Upload(batch) => {
                if batch.column_count() == 0 {
                    return Err(SyncError::Validation("uploaded batch has no columns".to_string()));
                }
                let (stored, batch) = self.store.store_shared(run_id, &dataset_name, batch)?;
                self.record(run_id, |r| r.metadata = Some(stored))?;
                Ok(batch)
            }
            IngestionSource::Connector {
                source_id,
                connector,
                request,
            } => {
                let stream = request.target.clone();
                self.state
                    .ensure_source_state(&source_id, connector.descriptor().source_name())?;

                if let Some(field) = request.incremental_field() {
                    let persisted = self
                        .state
                        .get_stream_state(&source_id, &stream)
                        .filter(|s| s.cursor_field.as_deref() == Some(field))
                        .and_then(|s| s.cursor_value);
                    debug!("Seeding {}/{} cursor with {:?}", source_id, stream, persisted);
                    connector.seed_cursor(persisted);
                }

                let batch = connector.get_data(&request).await?;
                let rows = batch.len() as u64;
                // keep the inserted payload; concurrent stores may evict the entry
                let (stored, batch) = self.store.store_shared(run_id, &dataset_name, batch)?;

                // state only moves once the batch is safely stored
                let update = match request.incremental_field() {
                    Some(field) => StreamUpdate::incremental(field, connector.last_cursor().cloned(), rows),
                    None => StreamUpdate::full_refresh(rows),
                };
                self.state.update_stream_state(&source_id, &stream, update)?;

                self.record(run_id, |r| r.metadata = Some(stored))?;
                Ok(batch)
            }
        }
    }

    fn with_batch<F>(&self, batch: &Option<Arc<TabularBatch>>, stage: F) -> Result<()>
    where
        F: FnOnce(&TabularBatch) -> Result<()>,
    {
        match batch {
            Some(batch) => stage(batch),
            None => Err(SyncError::Validation("no ingested batch".to_string())),
        }
    }

    fn record(&self, run_id: &str, update: impl FnOnce(&mut RunResults)) -> Result<()> {
        self.tracker.record(run_id, update)
    }

    fn final_snapshot(&self, run_id: &str) -> Result<PipelineRun> {
        self.tracker
            .snapshot(run_id)
            .ok_or_else(|| SyncError::NotFound(format!("Run '{}' not found", run_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::detectors::{
        PiiReport, QualityReport, QualityValidator, RuleBasedQualityValidator, SensitiveFieldDetector,
    };
    use crate::pipeline::run::RunStatus;
    use crate::store::StoreConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct FailingValidator;

    impl QualityValidator for FailingValidator {
        fn name(&self) -> &str {
            "failing"
        }

        fn check(&self, _batch: &TabularBatch) -> Result<QualityReport> {
            Err(SyncError::Validation("scorer crashed".to_string()))
        }
    }

    fn orchestrator(detectors: Detectors) -> (tempfile::TempDir, PipelineOrchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let store = BoundedDataStore::new(StoreConfig {
            data_dir: dir.path().to_path_buf(),
            max_in_memory: 4,
            persist: false,
        })
        .unwrap();
        let orchestrator = PipelineOrchestrator::new(
            Arc::new(store),
            Arc::new(IncrementalStateManager::new()),
            Arc::new(RunTracker::new()),
            detectors,
        );
        (dir, orchestrator)
    }

    fn upload() -> TabularBatch {
        TabularBatch::from_records(vec![
            json!({"id": 1, "email": "a@example.com"}),
            json!({"id": 2, "email": "b@example.com"}),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_upload_completes_all_stages() {
        let (_dir, orchestrator) = orchestrator(Detectors::basic());
        let run = orchestrator.run("contacts", IngestionSource::Upload(upload())).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.current_step, Some(PipelineStep::QualityChecks));
        assert_eq!(run.results.metadata.as_ref().unwrap().row_count, 2);
        assert!(run.results.explore.is_some());
        assert!(run.results.pii.is_some());
        assert!(run.results.quality.is_some());
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn test_quality_failure_keeps_earlier_results() {
        let detectors = Detectors::select(None, Some(Arc::new(FailingValidator)));
        let (_dir, orchestrator) = orchestrator(detectors);
        let run = orchestrator.run("contacts", IngestionSource::Upload(upload())).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.current_step, Some(PipelineStep::QualityChecks));
        let error = run.error.unwrap();
        assert!(error.contains("quality_checks"));
        assert!(error.contains("scorer crashed"));
        assert!(run.results.metadata.is_some());
        assert!(run.results.pii.is_some());
        assert!(run.results.quality.is_none());
    }

    #[tokio::test]
    async fn test_empty_upload_fails_ingestion() {
        let (_dir, orchestrator) = orchestrator(Detectors::basic());
        let run = orchestrator
            .run("empty", IngestionSource::Upload(TabularBatch::empty()))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.current_step, Some(PipelineStep::Ingestion));
        assert!(run.results.metadata.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_run_is_not_executed() {
        let (_dir, orchestrator) = orchestrator(Detectors::basic());
        let run = orchestrator.tracker().submit("contacts");
        orchestrator.tracker().cancel(&run.run_id, "operator").unwrap();
        let err = orchestrator
            .execute(&run.run_id, IngestionSource::Upload(upload()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(orchestrator.store().list().is_empty());
    }

    /// Cancels every active run from inside the PII stage
    struct CancellingScanner {
        tracker: Arc<RunTracker>,
    }

    impl SensitiveFieldDetector for CancellingScanner {
        fn name(&self) -> &str {
            "cancelling"
        }

        fn scan(&self, batch: &TabularBatch) -> Result<PiiReport> {
            for run in self.tracker.list() {
                self.tracker.cancel(&run.run_id, "timeout").unwrap();
            }
            Ok(PiiReport {
                findings: Vec::new(),
                total_fields: batch.column_count(),
            })
        }
    }

    #[derive(Default)]
    struct CountingValidator {
        calls: AtomicUsize,
    }

    impl QualityValidator for CountingValidator {
        fn name(&self) -> &str {
            "counting"
        }

        fn check(&self, batch: &TabularBatch) -> Result<QualityReport> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            RuleBasedQualityValidator.check(batch)
        }
    }

    #[tokio::test]
    async fn test_cancel_during_stage_stops_at_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(RunTracker::new());
        let validator = Arc::new(CountingValidator::default());
        let detectors = Detectors::select(
            Some(Arc::new(CancellingScanner {
                tracker: tracker.clone(),
            })),
            Some(validator.clone()),
        );
        let store = BoundedDataStore::new(StoreConfig {
            data_dir: dir.path().to_path_buf(),
            max_in_memory: 4,
            persist: false,
        })
        .unwrap();
        let orchestrator = PipelineOrchestrator::new(
            Arc::new(store),
            Arc::new(IncrementalStateManager::new()),
            tracker,
            detectors,
        );

        let run = orchestrator.run("contacts", IngestionSource::Upload(upload())).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.current_step, Some(PipelineStep::PiiScanning));
        assert_eq!(run.error.as_deref(), Some("cancelled: timeout"));
        assert!(run.results.metadata.is_some());
        assert!(run.results.explore.is_some());
        // output of the interrupted stage is not written into a finished run
        assert!(run.results.pii.is_none());
        assert!(run.results.quality.is_none());
        assert_eq!(validator.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_on_a_tight_store_all_complete() {
        let dir = tempfile::tempdir().unwrap();
        let store = BoundedDataStore::new(StoreConfig {
            data_dir: dir.path().to_path_buf(),
            max_in_memory: 1,
            persist: false,
        })
        .unwrap();
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            Arc::new(store),
            Arc::new(IncrementalStateManager::new()),
            Arc::new(RunTracker::new()),
            Detectors::basic(),
        ));

        let mut runs = tokio::task::JoinSet::new();
        for n in 0..16 {
            let orchestrator = orchestrator.clone();
            runs.spawn(async move {
                orchestrator
                    .run(&format!("contacts-{}", n), IngestionSource::Upload(upload()))
                    .await
            });
        }
        while let Some(joined) = runs.join_next().await {
            let run = joined.unwrap().unwrap();
            assert_eq!(run.status, RunStatus::Completed, "{:?}", run.error);
            assert_eq!(run.results.explore.unwrap().row_count, 2);
        }
        assert_eq!(orchestrator.store().stats().resident, 1);
        assert_eq!(orchestrator.store().stats().entries, 16);
    }
}
