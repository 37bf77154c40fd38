//! Pipeline run records and the concurrent run tracker
//!
//! Runs move strictly forward through their steps. Once a run is
//! `completed` or `failed` the tracker rejects every further mutation.

use crate::error::{Result, SyncError};
use crate::pipeline::detectors::{PiiReport, QualityReport};
use crate::pipeline::explore::DatasetProfile;
use crate::store::StoredDataset;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Ingestion,
    Exploration,
    PiiScanning,
    QualityChecks,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 4] = [
        PipelineStep::Ingestion,
        PipelineStep::Exploration,
        PipelineStep::PiiScanning,
        PipelineStep::QualityChecks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStep::Ingestion => "ingestion",
            PipelineStep::Exploration => "exploration",
            PipelineStep::PiiScanning => "pii_scanning",
            PipelineStep::QualityChecks => "quality_checks",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage outputs; each stage fills its own slot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<StoredDataset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explore: Option<DatasetProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pii: Option<PiiReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub dataset_name: String,
    pub status: RunStatus,
    pub current_step: Option<PipelineStep>,
    pub results: RunResults,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    fn new(dataset_name: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            dataset_name: dataset_name.to_string(),
            status: RunStatus::Queued,
            current_step: None,
            results: RunResults::default(),
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// Run records readable by status pollers while stages execute
#[derive(Debug, Default)]
pub struct RunTracker {
    runs: DashMap<String, PipelineRun>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, dataset_name: &str) -> PipelineRun {
        let run = PipelineRun::new(dataset_name);
        self.runs.insert(run.run_id.clone(), run.clone());
        info!("Queued run {} for '{}'", run.run_id, dataset_name);
        run
    }

    /// Run `apply` against a non-terminal run
    fn mutate<T>(&self, run_id: &str, apply: impl FnOnce(&mut PipelineRun) -> Result<T>) -> Result<T> {
        let mut run = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| SyncError::NotFound(format!("Run '{}' not found", run_id)))?;
        if run.status.is_terminal() {
            return Err(SyncError::Validation(format!(
                "Run '{}' is already {:?}",
                run_id, run.status
            )));
        }
        let value = apply(&mut *run)?;
        run.updated_at = Utc::now();
        Ok(value)
    }

    pub fn start(&self, run_id: &str) -> Result<()> {
        self.mutate(run_id, |run| {
            if run.status != RunStatus::Queued {
                return Err(SyncError::Validation(format!("Run '{}' already started", run.run_id)));
            }
            run.status = RunStatus::Running;
            Ok(())
        })
    }

    /// Move to `step`; steps never move backward or repeat
    pub fn advance(&self, run_id: &str, step: PipelineStep) -> Result<()> {
        self.mutate(run_id, |run| {
            if run.status != RunStatus::Running {
                return Err(SyncError::Validation(format!("Run '{}' is not running", run.run_id)));
            }
            if run.current_step.is_some_and(|current| step <= current) {
                return Err(SyncError::Validation(format!(
                    "Run '{}' cannot move from {:?} to {}",
                    run.run_id, run.current_step, step
                )));
            }
            run.current_step = Some(step);
            Ok(())
        })
    }

    pub fn record(&self, run_id: &str, update: impl FnOnce(&mut RunResults)) -> Result<()> {
        self.mutate(run_id, |run| {
            update(&mut run.results);
            Ok(())
        })
    }

    pub fn complete(&self, run_id: &str) -> Result<()> {
        self.mutate(run_id, |run| {
            if run.status != RunStatus::Running {
                return Err(SyncError::Validation(format!("Run '{}' is not running", run.run_id)));
            }
            run.status = RunStatus::Completed;
            run.finished_at = Some(Utc::now());
            Ok(())
        })?;
        info!("Run {} completed", run_id);
        Ok(())
    }

    pub fn fail(&self, run_id: &str, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.mutate(run_id, |run| {
            run.status = RunStatus::Failed;
            run.error = Some(message.clone());
            run.finished_at = Some(Utc::now());
            Ok(())
        })?;
        warn!("Run {} failed: {}", run_id, message);
        Ok(())
    }

    /// Mark a run failed from outside; returns false if it already finished.
    /// The executing pipeline stops at its next stage boundary.
    pub fn cancel(&self, run_id: &str, reason: &str) -> Result<bool> {
        match self.fail(run_id, format!("cancelled: {}", reason)) {
            Ok(()) => Ok(true),
            Err(SyncError::Validation(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn snapshot(&self, run_id: &str) -> Option<PipelineRun> {
        self.runs.get(run_id).map(|run| run.value().clone())
    }

    pub fn is_terminal(&self, run_id: &str) -> bool {
        self.runs
            .get(run_id)
            .map(|run| run.status.is_terminal())
            .unwrap_or(true)
    }

    /// All runs, newest first
    pub fn list(&self) -> Vec<PipelineRun> {
        let mut runs: Vec<PipelineRun> = self.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    pub fn remove(&self, run_id: &str) -> Option<PipelineRun> {
        self.runs.remove(run_id).map(|(_, run)| run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        let tracker = RunTracker::new();
        let run = tracker.submit("orders");
        assert_eq!(run.status, RunStatus::Queued);
        assert!(tracker.advance(&run.run_id, PipelineStep::Ingestion).is_err());

        tracker.start(&run.run_id).unwrap();
        tracker.advance(&run.run_id, PipelineStep::Ingestion).unwrap();
        tracker.advance(&run.run_id, PipelineStep::PiiScanning).unwrap();
        assert!(tracker.advance(&run.run_id, PipelineStep::Exploration).is_err());
        assert!(tracker.advance(&run.run_id, PipelineStep::PiiScanning).is_err());

        tracker.complete(&run.run_id).unwrap();
        let done = tracker.snapshot(&run.run_id).unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert!(done.finished_at.is_some());
    }

    #[test]
    fn test_terminal_runs_are_frozen() {
        let tracker = RunTracker::new();
        let run = tracker.submit("orders");
        tracker.start(&run.run_id).unwrap();
        tracker.fail(&run.run_id, "boom").unwrap();

        assert!(tracker.record(&run.run_id, |r| r.pii = None).is_err());
        assert!(tracker.complete(&run.run_id).is_err());
        assert!(!tracker.cancel(&run.run_id, "late").unwrap());
        assert_eq!(tracker.snapshot(&run.run_id).unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_cancel_marks_failed() {
        let tracker = RunTracker::new();
        let run = tracker.submit("orders");
        assert!(tracker.cancel(&run.run_id, "timeout").unwrap());
        let snap = tracker.snapshot(&run.run_id).unwrap();
        assert_eq!(snap.status, RunStatus::Failed);
        assert_eq!(snap.error.as_deref(), Some("cancelled: timeout"));
        assert!(tracker.is_terminal(&run.run_id));
        assert!(matches!(tracker.cancel("nope", "x"), Err(SyncError::NotFound(_))));
    }

    #[test]
    fn test_step_names() {
        assert_eq!(PipelineStep::PiiScanning.to_string(), "pii_scanning");
        assert_eq!(
            serde_json::to_value(PipelineStep::QualityChecks).unwrap(),
            serde_json::json!("quality_checks")
        );
    }
}
