//! Staged processing of ingested batches

pub mod detectors;
pub mod explore;
pub mod orchestrator;
pub mod run;

pub use detectors::{
    Detectors, PiiFinding, PiiReport, QualityReport, QualityValidator, RegexPiiDetector,
    RuleBasedQualityValidator, SensitiveFieldDetector,
};
pub use explore::{ColumnProfile, DatasetProfile};
pub use orchestrator::{IngestionSource, PipelineOrchestrator};
pub use run::{PipelineRun, PipelineStep, RunResults, RunStatus, RunTracker};
