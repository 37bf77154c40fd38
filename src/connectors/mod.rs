//! Source Connectors - one uniform contract over SQL, REST, SaaS,
//! spreadsheet and streaming sources
//!
//! Each connector owns exactly one live session (pool, HTTP client, or stream
//! receiver) and releases it on `close()`. Connectors remember the highest
//! cursor value they have seen, but never persist it; the pipeline hands it to
//! the incremental state manager once a batch has been stored.

pub mod descriptor;
pub mod http;
pub mod pagination;
pub mod postgres;
pub mod registry;
pub mod rest;
pub mod retry;
pub mod salesforce;
pub mod spreadsheet;
pub mod streaming;

pub use descriptor::{ConnectionDescriptor, Credentials, DescriptorSpec};
pub use pagination::{Page, PageRequest, PaginationStrategy, Paginator};
pub use registry::{ConnectorConstructor, ConnectorRegistry};
pub use retry::{RateLimitPolicy, RetryPolicy};
pub use streaming::StreamHub;

use crate::batch::{compare_values, TabularBatch};
use crate::config::AppConfig;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Column name -> source type name
pub type SchemaMap = BTreeMap<String, String>;

/// Parameters of one `get_data` call
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Table, object, sheet range, endpoint path, or a raw query
    pub target: String,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub cursor_field: Option<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
}

impl FetchRequest {
    pub fn full(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn incremental(target: impl Into<String>, cursor_field: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            incremental: true,
            cursor_field: Some(cursor_field.into()),
            filters: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, column: impl Into<String>, value: Value) -> Self {
        self.filters.insert(column.into(), value);
        self
    }

    /// Incremental mode needs both the flag and a cursor field
    pub fn incremental_field(&self) -> Option<&str> {
        if self.incremental {
            self.cursor_field.as_deref().filter(|f| !f.is_empty())
        } else {
            None
        }
    }
}

/// Source connector capability set
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn descriptor(&self) -> &ConnectionDescriptor;

    /// Verify connectivity (retried on transient failures)
    async fn test_connection(&mut self) -> Result<bool>;

    /// Fetch one batch; never drops rows silently
    async fn get_data(&mut self, request: &FetchRequest) -> Result<TabularBatch>;

    async fn get_schema(&mut self, table: &str) -> Result<SchemaMap>;

    async fn get_row_count(&mut self, table: &str, predicate: Option<&str>) -> Result<u64>;

    /// Release the connection/session
    async fn close(&mut self) -> Result<()>;

    /// Highest cursor value observed by incremental fetches
    fn last_cursor(&self) -> Option<&Value>;

    /// Resume from a previously persisted cursor
    fn seed_cursor(&mut self, cursor: Option<Value>);
}

/// Last-seen cursor bookkeeping shared by every connector family
#[derive(Clone, Debug, Default)]
pub struct CursorTracker {
    last: Option<Value>,
}

impl CursorTracker {
    pub fn value(&self) -> Option<&Value> {
        self.last.as_ref()
    }

    pub fn seed(&mut self, cursor: Option<Value>) {
        self.last = cursor.filter(|v| !v.is_null());
    }

    /// Cursor to filter on for this request, if it is incremental
    pub fn lower_bound(&self, request: &FetchRequest) -> Option<&Value> {
        request.incremental_field().and(self.last.as_ref())
    }

    /// Advance to the batch maximum. A cursor field missing from the batch
    /// leaves the cursor untouched for this call.
    pub fn observe(&mut self, request: &FetchRequest, batch: &TabularBatch) {
        let Some(field) = request.incremental_field() else {
            return;
        };
        if batch.is_empty() {
            return;
        }
        if !batch.has_column(field) {
            warn!(
                "Cursor field '{}' not present in '{}' results, cursor not advanced",
                field, request.target
            );
            return;
        }
        if let Some(max) = batch.max_value(field) {
            let advance = match &self.last {
                None => true,
                Some(current) => matches!(compare_values(&max, current), Some(Ordering::Greater)),
            };
            if advance {
                debug!("Cursor for '{}' advanced to {}", request.target, max);
                self.last = Some(max);
            }
        }
    }
}

/// Process-wide collaborators handed to connector constructors
#[derive(Clone, Debug)]
pub struct ConnectorContext {
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitPolicy,
    pub request_timeout: Duration,
    pub sql_pool_size: u32,
    pub stream_hub: Arc<StreamHub>,
}

impl Default for ConnectorContext {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
            request_timeout: Duration::from_secs(30),
            sql_pool_size: 5,
            stream_hub: Arc::new(StreamHub::new()),
        }
    }
}

impl ConnectorContext {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            retry: RetryPolicy::new(3, config.retry_base_delay),
            rate_limit: RateLimitPolicy {
                base_delay: config.retry_base_delay,
                ..RateLimitPolicy::default()
            },
            request_timeout: config.request_timeout,
            sql_pool_size: config.sql_pool_size,
            stream_hub: Arc::new(StreamHub::new()),
        }
    }
}
