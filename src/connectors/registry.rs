//! Connector Registry - source type name -> constructor

use crate::connectors::postgres::PostgresConnector;
use crate::connectors::rest::RestConnector;
use crate::connectors::salesforce::SalesforceConnector;
use crate::connectors::spreadsheet::SpreadsheetConnector;
use crate::connectors::streaming::StreamConnector;
use crate::connectors::{ConnectionDescriptor, ConnectorContext, SourceConnector};
use crate::error::{Result, SyncError};
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub type ConnectorConstructor = Arc<
    dyn Fn(ConnectionDescriptor, &ConnectorContext) -> Result<Box<dyn SourceConnector>> + Send + Sync,
>;

/// Maps lower-cased source type names to connector constructors.
/// Populated at startup, read-only afterwards.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    constructors: HashMap<String, ConnectorConstructor>,
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("types", &self.available())
            .finish()
    }
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in family and its aliases
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        let builtin: Vec<(&[&str], ConnectorConstructor)> = vec![
            (
                &["postgres", "postgresql"],
                Arc::new(|d, ctx| Ok(Box::new(PostgresConnector::new(d, ctx)?) as Box<dyn SourceConnector>)),
            ),
            (
                &["rest", "rest_api"],
                Arc::new(|d, ctx| Ok(Box::new(RestConnector::new(d, ctx)?) as Box<dyn SourceConnector>)),
            ),
            (
                &["salesforce"],
                Arc::new(|d, ctx| Ok(Box::new(SalesforceConnector::new(d, ctx)?) as Box<dyn SourceConnector>)),
            ),
            (
                &["google_sheets", "spreadsheet"],
                Arc::new(|d, ctx| Ok(Box::new(SpreadsheetConnector::new(d, ctx)?) as Box<dyn SourceConnector>)),
            ),
            (
                &["stream"],
                Arc::new(|d, ctx| Ok(Box::new(StreamConnector::new(d, ctx)?) as Box<dyn SourceConnector>)),
            ),
        ];
        for (names, constructor) in builtin {
            for name in names {
                registry.constructors.insert(name.to_string(), constructor.clone());
            }
        }
        registry
    }

    /// Register a constructor under `source_type`; duplicates are rejected
    pub fn register(&mut self, source_type: &str, constructor: ConnectorConstructor) -> Result<()> {
        let key = source_type.trim().to_lowercase();
        if key.is_empty() {
            return Err(SyncError::Configuration("source_type is required".to_string()));
        }
        if self.constructors.contains_key(&key) {
            return Err(SyncError::Configuration(format!(
                "Connector type '{}' is already registered",
                key
            )));
        }
        debug!("Registered connector type '{}'", key);
        self.constructors.insert(key, constructor);
        Ok(())
    }

    pub fn get(&self, source_type: &str) -> Result<ConnectorConstructor> {
        let key = source_type.trim().to_lowercase();
        self.constructors.get(&key).cloned().ok_or_else(|| {
            SyncError::Configuration(format!(
                "Unknown connector type '{}', available: [{}]",
                source_type,
                self.available().join(", ")
            ))
        })
    }

    /// Resolve the descriptor's source type and construct the connector
    pub fn create(
        &self,
        descriptor: ConnectionDescriptor,
        context: &ConnectorContext,
    ) -> Result<Box<dyn SourceConnector>> {
        let constructor = self.get(descriptor.source_type())?;
        constructor(descriptor, context)
    }

    pub fn is_registered(&self, source_type: &str) -> bool {
        self.constructors.contains_key(&source_type.trim().to_lowercase())
    }

    pub fn available(&self) -> Vec<String> {
        self.constructors.keys().cloned().sorted().collect()
    }
}
