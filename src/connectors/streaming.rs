//! Streaming Connector - continuous consumer over in-process topics
//!
//! Producers publish JSON records to a named topic on the [`StreamHub`]. A
//! `StreamConnector` checks the topic's receiver out of the hub, drains up to
//! `max_records` per `get_data` call within a poll window, and hands the
//! receiver back on `close()`.

use crate::batch::{compare_values, Record, TabularBatch};
use crate::connectors::{
    ConnectionDescriptor, ConnectorContext, CursorTracker, FetchRequest, SchemaMap, SourceConnector,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, Receiver, Sender};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

struct Topic {
    sender: Sender<Value>,
    receiver: Option<Receiver<Value>>,
}

/// Registry of in-process topics
pub struct StreamHub {
    topics: Mutex<HashMap<String, Topic>>,
    capacity: usize,
}

impl fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHub")
            .field("topics", &self.topics())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn topic_entry<'a>(
        &self,
        topics: &'a mut HashMap<String, Topic>,
        name: &str,
    ) -> &'a mut Topic {
        topics.entry(name.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::channel(self.capacity);
            Topic {
                sender,
                receiver: Some(receiver),
            }
        })
    }

    /// Producer handle for `topic`, creating the topic on first use
    pub fn sender(&self, topic: &str) -> Sender<Value> {
        let mut topics = self.lock();
        self.topic_entry(&mut topics, topic).sender.clone()
    }

    /// Publish one record; waits while the topic buffer is full
    pub async fn publish(&self, topic: &str, record: Value) -> Result<()> {
        let sender = self.sender(topic);
        sender
            .send(record)
            .await
            .map_err(|_| SyncError::Connection(format!("Topic '{}' is closed", topic)))
    }

    /// Check out the single consumer end of `topic`
    pub fn take_receiver(&self, topic: &str) -> Result<Receiver<Value>> {
        let mut topics = self.lock();
        self.topic_entry(&mut topics, topic)
            .receiver
            .take()
            .ok_or_else(|| SyncError::Validation(format!("Topic '{}' already has a consumer", topic)))
    }

    pub fn return_receiver(&self, topic: &str, receiver: Receiver<Value>) {
        let mut topics = self.lock();
        self.topic_entry(&mut topics, topic).receiver = Some(receiver);
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfig {
    pub topic: String,
    pub max_records: usize,
    pub poll_timeout: Duration,
}

impl StreamConfig {
    pub fn from_descriptor(d: &ConnectionDescriptor) -> Result<Self> {
        let max_records = d.param_u64("max_records")?.unwrap_or(1000);
        if max_records == 0 {
            return Err(SyncError::Configuration("max_records must be positive".to_string()));
        }
        Ok(Self {
            topic: d.require_param_str("topic")?.to_string(),
            max_records: max_records as usize,
            poll_timeout: Duration::from_millis(d.param_u64("poll_timeout_ms")?.unwrap_or(1000)),
        })
    }
}

pub struct StreamConnector {
    descriptor: ConnectionDescriptor,
    config: StreamConfig,
    hub: Arc<StreamHub>,
    receiver: Option<Receiver<Value>>,
    cursor: CursorTracker,
    consumed: u64,
    last_schema: SchemaMap,
}

impl StreamConnector {
    pub fn new(descriptor: ConnectionDescriptor, context: &ConnectorContext) -> Result<Self> {
        let config = StreamConfig::from_descriptor(&descriptor)?;
        Ok(Self {
            descriptor,
            config,
            hub: context.stream_hub.clone(),
            receiver: None,
            cursor: CursorTracker::default(),
            consumed: 0,
            last_schema: SchemaMap::new(),
        })
    }

    fn check_topic(&self, target: &str) -> Result<()> {
        let target = target.trim();
        if target.is_empty() || target == self.config.topic {
            Ok(())
        } else {
            Err(SyncError::Validation(format!(
                "Stream source '{}' consumes topic '{}', not '{}'",
                self.descriptor.source_name(),
                self.config.topic,
                target
            )))
        }
    }

    fn receiver(&mut self) -> Result<&mut Receiver<Value>> {
        if self.receiver.is_none() {
            let receiver = self.hub.take_receiver(&self.config.topic)?;
            debug!("Consumer attached to topic '{}'", self.config.topic);
            self.receiver = Some(receiver);
        }
        self.receiver
            .as_mut()
            .ok_or_else(|| SyncError::Connection("stream receiver unavailable".to_string()))
    }

    /// Drain queued records, waiting up to the poll window for the first one
    async fn drain(&mut self) -> Result<Vec<Value>> {
        let max = self.config.max_records;
        let deadline = Instant::now() + self.config.poll_timeout;
        let topic = self.config.topic.clone();
        let receiver = self.receiver()?;
        let mut records = Vec::new();

        while records.len() < max {
            match receiver.try_recv() {
                Ok(value) => records.push(value),
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) if !records.is_empty() => break,
                Err(TryRecvError::Empty) => match tokio::time::timeout_at(deadline, receiver.recv()).await {
                    Ok(Some(value)) => records.push(value),
                    Ok(None) => break,
                    Err(_) => {
                        debug!("Poll window elapsed on topic '{}' with no records", topic);
                        break;
                    }
                },
            }
        }
        Ok(records)
    }
}

fn as_record(value: Value) -> Record {
    match value {
        Value::Object(obj) => obj,
        other => {
            let mut wrapped = Record::new();
            wrapped.insert("value".to_string(), other);
            wrapped
        }
    }
}

#[async_trait]
impl SourceConnector for StreamConnector {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn test_connection(&mut self) -> Result<bool> {
        self.receiver()?;
        Ok(true)
    }

    async fn get_data(&mut self, request: &FetchRequest) -> Result<TabularBatch> {
        self.check_topic(&request.target)?;
        let drained = self.drain().await?;
        self.consumed += drained.len() as u64;

        let bound = self.cursor.lower_bound(request).cloned();
        let mut skipped = 0usize;
        let mut payloads = Vec::with_capacity(drained.len());
        for record in drained.into_iter().map(as_record) {
            let matches_filters = request
                .filters
                .iter()
                .all(|(column, expected)| record.get(column).unwrap_or(&Value::Null) == expected);
            let after_cursor = match (request.incremental_field(), &bound) {
                (Some(field), Some(bound)) => match record.get(field) {
                    Some(v) => compare_values(v, bound) == Some(Ordering::Greater),
                    None => true,
                },
                _ => true,
            };
            if matches_filters && after_cursor {
                payloads.push(Value::Object(record));
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            warn!(
                "Skipped {} records on topic '{}' (filters or cursor)",
                skipped, self.config.topic
            );
        }

        let batch = TabularBatch::from_records(payloads)?;
        self.cursor.observe(request, &batch);
        if !batch.is_empty() {
            self.last_schema = batch
                .infer_dtypes()
                .into_iter()
                .map(|(name, dtype)| (name, dtype.to_string()))
                .collect();
        }
        info!("Consumed {} records from topic '{}'", batch.len(), self.config.topic);
        Ok(batch)
    }

    /// Schema of the most recent non-empty batch
    async fn get_schema(&mut self, table: &str) -> Result<SchemaMap> {
        self.check_topic(table)?;
        Ok(self.last_schema.clone())
    }

    /// Records consumed by this connector so far
    async fn get_row_count(&mut self, table: &str, predicate: Option<&str>) -> Result<u64> {
        self.check_topic(table)?;
        if predicate.is_some() {
            return Err(SyncError::Validation(
                "Stream sources do not support row-count predicates".to_string(),
            ));
        }
        Ok(self.consumed)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(receiver) = self.receiver.take() {
            self.hub.return_receiver(&self.config.topic, receiver);
            info!("Consumer detached from topic '{}'", self.config.topic);
        }
        Ok(())
    }

    fn last_cursor(&self) -> Option<&Value> {
        self.cursor.value()
    }

    fn seed_cursor(&mut self, cursor: Option<Value>) {
        self.cursor.seed(cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::DescriptorSpec;
    use serde_json::json;

    fn connector(hub: Arc<StreamHub>, max_records: u64) -> StreamConnector {
        let mut params = HashMap::new();
        params.insert("topic".to_string(), json!("orders"));
        params.insert("max_records".to_string(), json!(max_records));
        params.insert("poll_timeout_ms".to_string(), json!(50));
        let descriptor = ConnectionDescriptor::new(DescriptorSpec {
            source_type: "stream".into(),
            source_name: "order-events".into(),
            params,
            ..Default::default()
        })
        .unwrap();
        let context = ConnectorContext {
            stream_hub: hub,
            ..ConnectorContext::default()
        };
        StreamConnector::new(descriptor, &context).unwrap()
    }

    #[tokio::test]
    async fn test_drains_up_to_max_records() {
        let hub = Arc::new(StreamHub::new());
        for i in 0..5 {
            hub.publish("orders", json!({"id": i, "seq": i})).await.unwrap();
        }
        let mut consumer = connector(hub.clone(), 3);
        let request = FetchRequest::incremental("orders", "seq");

        let first = consumer.get_data(&request).await.unwrap();
        assert_eq!(first.len(), 3);
        let second = consumer.get_data(&request).await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(consumer.last_cursor(), Some(&json!(4)));
        assert_eq!(consumer.get_row_count("orders", None).await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_topic_returns_after_poll_window() {
        let hub = Arc::new(StreamHub::new());
        let mut consumer = connector(hub, 10);
        let batch = consumer.get_data(&FetchRequest::full("orders")).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_single_consumer_and_close_returns_receiver() {
        let hub = Arc::new(StreamHub::new());
        let mut first = connector(hub.clone(), 10);
        let mut second = connector(hub.clone(), 10);

        assert!(first.test_connection().await.unwrap());
        assert!(matches!(second.test_connection().await, Err(SyncError::Validation(_))));

        first.close().await.unwrap();
        assert!(second.test_connection().await.unwrap());
        assert_eq!(hub.topics(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_wrong_topic_rejected() {
        let mut consumer = connector(Arc::new(StreamHub::new()), 10);
        let err = consumer.get_data(&FetchRequest::full("payments")).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }
}
