//! Salesforce Connector - object describe + SOQL with `nextRecordsUrl` paging

use crate::batch::{parse_timestamp, TabularBatch};
use crate::connectors::http::HttpSession;
use crate::connectors::pagination::{Page, PageRequest, PaginationStrategy, Paginator};
use crate::connectors::rest::extract_records;
use crate::connectors::{
    ConnectionDescriptor, ConnectorContext, CursorTracker, FetchRequest, SchemaMap, SourceConnector,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

lazy_static! {
    static ref SOQL_NAME: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap();
}

#[derive(Clone, Debug, PartialEq)]
pub struct SalesforceConfig {
    pub instance_url: String,
    pub access_token: String,
    pub api_version: String,
}

impl SalesforceConfig {
    pub fn from_descriptor(d: &ConnectionDescriptor) -> Result<Self> {
        Ok(Self {
            instance_url: d.require_endpoint()?.to_string(),
            access_token: d
                .credentials()
                .token
                .clone()
                .ok_or_else(|| d.missing("credentials.token"))?,
            api_version: d.param_str("api_version").unwrap_or("59.0").to_string(),
        })
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/services/data/v{}/{}", self.instance_url, self.api_version, path)
    }
}

pub struct SalesforceConnector {
    descriptor: ConnectionDescriptor,
    config: SalesforceConfig,
    session: HttpSession,
    cursor: CursorTracker,
}

impl SalesforceConnector {
    pub fn new(descriptor: ConnectionDescriptor, context: &ConnectorContext) -> Result<Self> {
        let config = SalesforceConfig::from_descriptor(&descriptor)?;
        let session = HttpSession::new(context)?;
        Ok(Self {
            descriptor,
            config,
            session,
            cursor: CursorTracker::default(),
        })
    }

    async fn describe(&self, object: &str) -> Result<Vec<(String, String)>> {
        validate_name(object)?;
        let url = self.config.data_url(&format!("sobjects/{}/describe", object));
        let body = self
            .session
            .get_json("salesforce describe", |c| c.get(&url).bearer_auth(&self.config.access_token))
            .await?;

        let fields = body
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::Validation(format!("Describe of '{}' has no fields", object)))?;
        Ok(fields
            .iter()
            .filter_map(|f| {
                let name = f.get("name")?.as_str()?;
                let kind = f.get("type").and_then(Value::as_str).unwrap_or("string");
                Some((name.to_string(), kind.to_string()))
            })
            .collect())
    }

    /// Run a SOQL query, following `nextRecordsUrl` until `done`
    async fn query(&self, soql: &str) -> Result<TabularBatch> {
        let paginator = Paginator::new(PaginationStrategy::Cursor, 2000)?;
        let result = paginator
            .collect(|request| async move {
                let url = match request {
                    PageRequest::Cursor { token: Some(next), .. } => {
                        format!("{}{}", self.config.instance_url, next)
                    }
                    _ => self.config.data_url("query"),
                };
                let body = self
                    .session
                    .get_json("salesforce query", |c| {
                        let rb = c.get(&url).bearer_auth(&self.config.access_token);
                        if url.ends_with("/query") {
                            rb.query(&[("q", soql)])
                        } else {
                            rb
                        }
                    })
                    .await?;

                let mut records = extract_records(&body, Some("records"))?;
                for record in &mut records {
                    record.remove("attributes");
                }
                let done = body.get("done").and_then(Value::as_bool).unwrap_or(true);
                let next = if done {
                    None
                } else {
                    body.get("nextRecordsUrl").and_then(Value::as_str).map(str::to_string)
                };
                Ok(Page::new(records, next))
            })
            .await?;

        TabularBatch::from_records(result.records.into_iter().map(Value::Object).collect())
    }
}

#[async_trait]
impl SourceConnector for SalesforceConnector {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn test_connection(&mut self) -> Result<bool> {
        let url = self.config.data_url("limits");
        self.session
            .get_json("salesforce test_connection", |c| {
                c.get(&url).bearer_auth(&self.config.access_token)
            })
            .await?;
        Ok(true)
    }

    async fn get_data(&mut self, request: &FetchRequest) -> Result<TabularBatch> {
        let target = request.target.trim();
        let soql = if target.to_lowercase().starts_with("select ") {
            if request.incremental_field().is_some() {
                warn!("Incremental filter not applied to raw SOQL; cursor still tracked");
            }
            target.to_string()
        } else {
            let fields = self.describe(target).await?;
            let mut cursor_field = request.incremental_field();
            if let Some(field) = cursor_field {
                if !fields.iter().any(|(name, _)| name == field) {
                    warn!(
                        "Cursor field '{}' not on {}, falling back to full fetch",
                        field, target
                    );
                    cursor_field = None;
                }
            }
            let bound = cursor_field.and(self.cursor.lower_bound(request));
            build_soql(target, &fields, &request.filters, cursor_field, bound)?
        };

        info!("SOQL for {}: {}", self.descriptor.source_name(), soql);
        let batch = self.query(&soql).await?;
        self.cursor.observe(request, &batch);
        Ok(batch)
    }

    async fn get_schema(&mut self, table: &str) -> Result<SchemaMap> {
        Ok(self.describe(table).await?.into_iter().collect())
    }

    async fn get_row_count(&mut self, table: &str, predicate: Option<&str>) -> Result<u64> {
        validate_name(table)?;
        let mut soql = format!("SELECT COUNT() FROM {}", table);
        if let Some(predicate) = predicate.map(str::trim).filter(|p| !p.is_empty()) {
            soql.push_str(" WHERE ");
            soql.push_str(predicate);
        }
        let url = self.config.data_url("query");
        let body = self
            .session
            .get_json("salesforce count", |c| {
                c.get(&url)
                    .bearer_auth(&self.config.access_token)
                    .query(&[("q", soql.as_str())])
            })
            .await?;
        body.get("totalSize")
            .and_then(Value::as_u64)
            .ok_or_else(|| SyncError::Validation("COUNT() response lacks totalSize".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.session.close();
        Ok(())
    }

    fn last_cursor(&self) -> Option<&Value> {
        self.cursor.value()
    }

    fn seed_cursor(&mut self, cursor: Option<Value>) {
        self.cursor.seed(cursor);
    }
}

fn validate_name(name: &str) -> Result<()> {
    if SOQL_NAME.is_match(name) {
        Ok(())
    } else {
        Err(SyncError::Validation(format!("Invalid Salesforce name '{}'", name)))
    }
}

fn build_soql(
    object: &str,
    fields: &[(String, String)],
    filters: &std::collections::BTreeMap<String, Value>,
    cursor_field: Option<&str>,
    bound: Option<&Value>,
) -> Result<String> {
    if fields.is_empty() {
        return Err(SyncError::NotFound(format!("Object '{}' exposes no fields", object)));
    }
    let names: Vec<&str> = fields.iter().map(|(name, _)| name.as_str()).collect();
    let mut soql = format!("SELECT {} FROM {}", names.join(", "), object);

    let mut conditions = Vec::new();
    for (column, value) in filters {
        validate_name(column)?;
        conditions.push(match value {
            Value::Null => format!("{} = null", column),
            other => format!("{} = {}", column, soql_literal(other)?),
        });
    }
    if let (Some(field), Some(bound)) = (cursor_field, bound) {
        conditions.push(format!("{} > {}", field, soql_literal(bound)?));
    }
    if !conditions.is_empty() {
        soql.push_str(" WHERE ");
        soql.push_str(&conditions.join(" AND "));
    }
    if let Some(field) = cursor_field {
        soql.push_str(&format!(" ORDER BY {} ASC", field));
    }
    Ok(soql)
}

/// Render a scalar as a SOQL literal; datetimes and dates are unquoted
fn soql_literal(value: &Value) -> Result<String> {
    match value {
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => {
            if s.len() == 10 && chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
                return Ok(s.clone());
            }
            if s.contains('T') {
                if let Some(ts) = parse_timestamp(s) {
                    let utc = Utc.from_utc_datetime(&ts);
                    return Ok(utc.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string());
                }
            }
            Ok(format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")))
        }
        other => Err(SyncError::Validation(format!("Unsupported SOQL literal: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{Credentials, DescriptorSpec};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use tiny_http::{Response as TinyResponse, Server};

    fn descriptor(endpoint: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::new(DescriptorSpec {
            source_type: "salesforce".into(),
            source_name: "crm".into(),
            endpoint: Some(endpoint.into()),
            credentials: Credentials {
                token: Some("tok".into()),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_soql_literals() {
        assert_eq!(soql_literal(&json!(5)).unwrap(), "5");
        assert_eq!(soql_literal(&json!("O'Brien")).unwrap(), "'O\\'Brien'");
        assert_eq!(soql_literal(&json!("2024-01-15")).unwrap(), "2024-01-15");
        assert_eq!(
            soql_literal(&json!("2024-01-15T10:00:00.000+0000")).unwrap(),
            "2024-01-15T10:00:00.000Z"
        );
        // sub-second cursors must not be truncated to the whole second
        assert_eq!(
            soql_literal(&json!("2024-01-15T10:00:00.500+0000")).unwrap(),
            "2024-01-15T10:00:00.500Z"
        );
        assert!(soql_literal(&json!([1])).is_err());
    }

    #[test]
    fn test_build_soql_with_cursor_and_filters() {
        let fields = vec![
            ("Id".to_string(), "id".to_string()),
            ("LastModifiedDate".to_string(), "datetime".to_string()),
        ];
        let mut filters = std::collections::BTreeMap::new();
        filters.insert("IsDeleted".to_string(), json!(false));
        let soql = build_soql(
            "Account",
            &fields,
            &filters,
            Some("LastModifiedDate"),
            Some(&json!("2024-01-01T00:00:00Z")),
        )
        .unwrap();
        assert_eq!(
            soql,
            "SELECT Id, LastModifiedDate FROM Account WHERE IsDeleted = false AND \
             LastModifiedDate > 2024-01-01T00:00:00.000Z ORDER BY LastModifiedDate ASC"
        );
    }

    #[tokio::test]
    async fn test_query_follows_next_records_url() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handle = thread::spawn(move || {
            let bodies = vec![
                json!({"fields": [{"name": "Id", "type": "id"}, {"name": "SystemModstamp", "type": "datetime"}]}),
                json!({
                    "done": false,
                    "nextRecordsUrl": "/services/data/v59.0/query/01g-2000",
                    "records": [{"attributes": {"type": "Account"}, "Id": "a1", "SystemModstamp": "2024-02-01T00:00:00.000+0000"}]
                }),
                json!({
                    "done": true,
                    "records": [{"attributes": {"type": "Account"}, "Id": "a2", "SystemModstamp": "2024-03-01T00:00:00.000+0000"}]
                }),
            ];
            for body in bodies {
                let request = server.recv().unwrap();
                seen_clone.lock().unwrap().push(request.url().to_string());
                request.respond(TinyResponse::from_string(body.to_string())).unwrap();
            }
        });

        let mut connector =
            SalesforceConnector::new(descriptor(&format!("http://{}", addr)), &ConnectorContext::default())
                .unwrap();
        let batch = connector
            .get_data(&FetchRequest::incremental("Account", "SystemModstamp"))
            .await
            .unwrap();
        handle.join().unwrap();

        assert_eq!(batch.len(), 2);
        assert!(!batch.has_column("attributes"));
        assert_eq!(
            connector.last_cursor(),
            Some(&json!("2024-03-01T00:00:00.000+0000"))
        );
        let seen = seen.lock().unwrap();
        assert!(seen[0].ends_with("/sobjects/Account/describe"));
        assert!(seen[1].contains("/query?q="));
        assert_eq!(seen[2], "/services/data/v59.0/query/01g-2000");
    }
}
