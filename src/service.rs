//! Connector Service - configured connectors and the scheduler trigger surface

use crate::connectors::{
    ConnectionDescriptor, ConnectorContext, ConnectorRegistry, FetchRequest, SourceConnector,
};
use crate::error::{Result, SyncError};
use crate::pipeline::{IngestionSource, PipelineOrchestrator, RunStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info, warn};

fn default_enabled() -> bool {
    true
}

/// One configured connector, as stored in the connectors file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    pub id: String,
    pub descriptor: ConnectionDescriptor,
    /// Table, object, range, endpoint path or query to sync
    pub target: String,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub cursor_field: Option<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    /// Sync interval; unscheduled connectors only run on demand
    #[serde(default)]
    pub schedule_minutes: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ConnectorDefinition {
    pub fn fetch_request(&self) -> FetchRequest {
        FetchRequest {
            target: self.target.clone(),
            incremental: self.incremental,
            cursor_field: self.cursor_field.clone(),
            filters: self.filters.clone(),
        }
    }
}

/// Outcome of one connector run
#[derive(Debug, Clone, Serialize)]
pub struct SyncRecord {
    pub run_id: String,
    pub connector_id: String,
    pub triggered_by: String,
    pub status: RunStatus,
    pub rows: usize,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub records: Vec<SyncRecord>,
}

pub struct ConnectorService {
    definitions: BTreeMap<String, ConnectorDefinition>,
    registry: ConnectorRegistry,
    context: ConnectorContext,
    orchestrator: PipelineOrchestrator,
}

impl ConnectorService {
    pub fn new(
        definitions: Vec<ConnectorDefinition>,
        registry: ConnectorRegistry,
        context: ConnectorContext,
        orchestrator: PipelineOrchestrator,
    ) -> Result<Self> {
        let mut by_id = BTreeMap::new();
        for definition in definitions {
            if !registry.is_registered(definition.descriptor.source_type()) {
                return Err(SyncError::Configuration(format!(
                    "Connector '{}' uses unknown type '{}', available: [{}]",
                    definition.id,
                    definition.descriptor.source_type(),
                    registry.available().join(", ")
                )));
            }
            if let Some(previous) = by_id.insert(definition.id.clone(), definition) {
                return Err(SyncError::Configuration(format!(
                    "Connector id '{}' is defined twice",
                    previous.id
                )));
            }
        }
        info!("Loaded {} connector definitions", by_id.len());
        Ok(Self {
            definitions: by_id,
            registry,
            context,
            orchestrator,
        })
    }

    /// Read definitions from a JSON array; a missing file means none
    pub fn load_definitions(path: &Path) -> Result<Vec<ConnectorDefinition>> {
        if !path.exists() {
            warn!("Connectors file {} not found", path.display());
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ConnectorDefinition> {
        self.definitions.values()
    }

    pub fn definition(&self, connector_id: &str) -> Result<&ConnectorDefinition> {
        self.definitions
            .get(connector_id)
            .ok_or_else(|| SyncError::NotFound(format!("Connector '{}' not configured", connector_id)))
    }

    fn connect(&self, definition: &ConnectorDefinition) -> Result<Box<dyn SourceConnector>> {
        self.registry.create(definition.descriptor.clone(), &self.context)
    }

    /// Start one run for one configured connector
    pub async fn run_connector(&self, connector_id: &str, triggered_by: &str) -> Result<SyncRecord> {
        let definition = self.definition(connector_id)?;
        let mut connector = self.connect(definition)?;
        let started_at = Utc::now();
        let clock = Instant::now();
        info!("Running connector '{}' (triggered by {})", connector_id, triggered_by);

        let outcome = self
            .orchestrator
            .run(
                &definition.id,
                IngestionSource::Connector {
                    source_id: definition.id.clone(),
                    connector: connector.as_mut(),
                    request: definition.fetch_request(),
                },
            )
            .await;
        if let Err(e) = connector.close().await {
            warn!("Closing connector '{}' failed: {}", connector_id, e);
        }
        let run = outcome?;

        let record = SyncRecord {
            run_id: run.run_id,
            connector_id: definition.id.clone(),
            triggered_by: triggered_by.to_string(),
            status: run.status,
            rows: run.results.metadata.map(|m| m.row_count).unwrap_or(0),
            duration_ms: clock.elapsed().as_millis() as u64,
            error: run.error,
            started_at,
            finished_at: Utc::now(),
        };
        match record.status {
            RunStatus::Completed => info!(
                "Connector '{}' synced {} rows in {} ms",
                connector_id, record.rows, record.duration_ms
            ),
            _ => error!(
                "Connector '{}' failed: {}",
                connector_id,
                record.error.as_deref().unwrap_or("unknown error")
            ),
        }
        Ok(record)
    }

    /// Whether a scheduled connector's interval has elapsed since its stream
    /// was last synced
    pub fn is_due(&self, definition: &ConnectorDefinition, now: DateTime<Utc>) -> bool {
        let Some(minutes) = definition.schedule_minutes.filter(|_| definition.enabled) else {
            return false;
        };
        let last = self
            .orchestrator
            .state()
            .get_stream_state(&definition.id, &definition.target)
            .and_then(|s| s.last_synced_at);
        match last {
            None => true,
            Some(last) => now - last >= ChronoDuration::minutes(minutes as i64),
        }
    }

    /// Run every enabled connector whose schedule is due
    pub async fn sync_all_scheduled(&self) -> SyncSummary {
        let now = Utc::now();
        let mut summary = SyncSummary {
            total: self.definitions.len(),
            ..Default::default()
        };

        for definition in self.definitions.values() {
            if !self.is_due(definition, now) {
                summary.skipped += 1;
                continue;
            }
            match self.run_connector(&definition.id, "scheduler").await {
                Ok(record) => {
                    if record.status == RunStatus::Completed {
                        summary.successful += 1;
                    } else {
                        summary.failed += 1;
                    }
                    summary.records.push(record);
                }
                Err(e) => {
                    error!("Connector '{}' could not start: {}", definition.id, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Scheduled sync: {} total, {} ok, {} failed, {} skipped",
            summary.total, summary.successful, summary.failed, summary.skipped
        );
        summary
    }

    /// Resolve the connector and check connectivity
    pub async fn test_connector(&self, connector_id: &str) -> Result<bool> {
        let definition = self.definition(connector_id)?;
        let mut connector = self.connect(definition)?;
        let result = connector.test_connection().await;
        if let Err(e) = connector.close().await {
            warn!("Closing connector '{}' failed: {}", connector_id, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Detectors, RunTracker};
    use crate::state::IncrementalStateManager;
    use crate::store::{BoundedDataStore, StoreConfig};
    use serde_json::json;
    use std::sync::Arc;

    fn service(definitions: serde_json::Value, context: ConnectorContext) -> (tempfile::TempDir, ConnectorService) {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = PipelineOrchestrator::new(
            Arc::new(
                BoundedDataStore::new(StoreConfig {
                    data_dir: dir.path().to_path_buf(),
                    max_in_memory: 4,
                    persist: false,
                })
                .unwrap(),
            ),
            Arc::new(IncrementalStateManager::new()),
            Arc::new(RunTracker::new()),
            Detectors::basic(),
        );
        let definitions: Vec<ConnectorDefinition> = serde_json::from_value(definitions).unwrap();
        let service =
            ConnectorService::new(definitions, ConnectorRegistry::with_builtin(), context, orchestrator).unwrap();
        (dir, service)
    }

    fn stream_definition(id: &str, schedule: Option<u64>, enabled: bool) -> serde_json::Value {
        json!({
            "id": id,
            "descriptor": {
                "source_type": "stream",
                "source_name": id,
                "params": {"topic": id, "poll_timeout_ms": 20}
            },
            "target": id,
            "incremental": true,
            "cursor_field": "seq",
            "schedule_minutes": schedule,
            "enabled": enabled
        })
    }

    #[tokio::test]
    async fn test_run_connector_advances_state() {
        let context = ConnectorContext::default();
        let hub = context.stream_hub.clone();
        let (_dir, service) = service(json!([stream_definition("events", Some(5), true)]), context);

        for seq in 1..=3 {
            hub.publish("events", json!({"seq": seq, "kind": "click"})).await.unwrap();
        }
        let record = service.run_connector("events", "test").await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.rows, 3);

        let stream = service
            .orchestrator()
            .state()
            .get_stream_state("events", "events")
            .unwrap();
        assert_eq!(stream.records_synced, 3);
        assert_eq!(stream.cursor_value, Some(json!(3)));

        // cursor seeded from state filters replayed records
        hub.publish("events", json!({"seq": 2, "kind": "replay"})).await.unwrap();
        hub.publish("events", json!({"seq": 4, "kind": "click"})).await.unwrap();
        let record = service.run_connector("events", "test").await.unwrap();
        assert_eq!(record.rows, 1);
    }

    #[tokio::test]
    async fn test_sync_all_scheduled_counts() {
        let definitions = json!([
            stream_definition("a", Some(5), true),
            stream_definition("b", None, true),
            stream_definition("c", Some(5), false),
        ]);
        let (_dir, service) = service(definitions, ConnectorContext::default());

        let summary = service.sync_all_scheduled().await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.skipped, 2);

        // "a" ran just now, so it is not due again
        let summary = service.sync_all_scheduled().await;
        assert_eq!(summary.skipped, 3);
    }

    #[tokio::test]
    async fn test_unknown_connector_and_type() {
        let (_dir, service) = service(json!([]), ConnectorContext::default());
        assert!(matches!(
            service.run_connector("ghost", "test").await,
            Err(SyncError::NotFound(_))
        ));

        let orchestrator = PipelineOrchestrator::new(
            Arc::new(
                BoundedDataStore::new(StoreConfig {
                    data_dir: std::env::temp_dir(),
                    max_in_memory: 1,
                    persist: false,
                })
                .unwrap(),
            ),
            Arc::new(IncrementalStateManager::new()),
            Arc::new(RunTracker::new()),
            Detectors::basic(),
        );
        let bad: Vec<ConnectorDefinition> = serde_json::from_value(json!([{
            "id": "x",
            "descriptor": {"source_type": "oracle", "source_name": "x"},
            "target": "t"
        }]))
        .unwrap();
        let err = ConnectorService::new(bad, ConnectorRegistry::with_builtin(), ConnectorContext::default(), orchestrator)
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown type 'oracle'"));
    }

    #[tokio::test]
    async fn test_test_connector() {
        let (_dir, service) = service(json!([stream_definition("a", None, true)]), ConnectorContext::default());
        assert!(service.test_connector("a").await.unwrap());
    }
}
