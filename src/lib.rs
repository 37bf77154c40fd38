//! source-sync: connectors over heterogeneous data sources, incremental sync
//! state, and a staged ingestion pipeline.

pub mod batch;
pub mod config;
pub mod connectors;
pub mod error;
pub mod pipeline;
pub mod service;
pub mod state;
pub mod store;

pub use batch::{ColumnType, Record, TabularBatch};
pub use config::AppConfig;
pub use error::{Result, SyncError};
pub use service::{ConnectorDefinition, ConnectorService, SyncRecord, SyncSummary};
pub use state::{IncrementalStateManager, SourceState, StateDocument, StreamState, StreamUpdate, SyncMode};
pub use store::{BoundedDataStore, StoreConfig, StoredDataset};
