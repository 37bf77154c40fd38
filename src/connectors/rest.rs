//! REST Connector - paginated JSON APIs with header/token auth

use crate::batch::{Record, TabularBatch};
use crate::connectors::http::{json_path, HttpSession};
use crate::connectors::pagination::{Page, PageRequest, PaginationStrategy, Paginator};
use crate::connectors::{
    ConnectionDescriptor, ConnectorContext, CursorTracker, FetchRequest, SchemaMap, SourceConnector,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq)]
pub enum RestAuth {
    None,
    Bearer { token: String },
    ApiKey { header: String, key: String },
    Basic { username: String, password: Option<String> },
}

/// Typed REST configuration parsed from a descriptor
#[derive(Clone, Debug, PartialEq)]
pub struct RestConfig {
    pub base_url: String,
    pub auth: RestAuth,
    pub strategy: PaginationStrategy,
    pub page_size: u64,
    /// Dot path to the records array; empty means the body itself is the array
    pub records_path: Option<String>,
    pub next_cursor_path: String,
    pub offset_param: String,
    pub limit_param: String,
    pub page_param: String,
    pub page_size_param: String,
    pub cursor_param: String,
    /// Query parameter carrying the incremental lower bound
    pub incremental_param: String,
    pub health_path: String,
    pub headers: Vec<(String, String)>,
}

impl RestConfig {
    pub fn from_descriptor(d: &ConnectionDescriptor) -> Result<Self> {
        let base_url = d.require_endpoint()?.to_string();
        let creds = d.credentials();

        let auth = match d.param_str("auth_type").unwrap_or("none") {
            "none" => RestAuth::None,
            "bearer" => RestAuth::Bearer {
                token: creds.token.clone().ok_or_else(|| d.missing("credentials.token"))?,
            },
            "api_key" => RestAuth::ApiKey {
                header: d.param_str("api_key_header").unwrap_or("X-API-Key").to_string(),
                key: creds.api_key.clone().ok_or_else(|| d.missing("credentials.api_key"))?,
            },
            "basic" => RestAuth::Basic {
                username: creds.username.clone().ok_or_else(|| d.missing("credentials.username"))?,
                password: creds.password.clone(),
            },
            other => {
                return Err(SyncError::Configuration(format!(
                    "Unsupported auth_type '{}' for REST source '{}'",
                    other,
                    d.source_name()
                )))
            }
        };

        let headers = match d.param("headers") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
                .collect(),
            Some(_) => return Err(d.missing("params.headers (object)")),
        };

        let text = |key: &str, default: &str| d.param_str(key).unwrap_or(default).to_string();

        Ok(Self {
            base_url,
            auth,
            strategy: PaginationStrategy::parse(d.param_str("pagination").unwrap_or("none"))?,
            page_size: d.param_u64("page_size")?.unwrap_or(100),
            records_path: d.param_str("records_path").map(str::to_string),
            next_cursor_path: text("next_cursor_path", "next_cursor"),
            offset_param: text("offset_param", "offset"),
            limit_param: text("limit_param", "limit"),
            page_param: text("page_param", "page"),
            page_size_param: text("page_size_param", "per_page"),
            cursor_param: text("cursor_param", "cursor"),
            incremental_param: text("incremental_param", "since"),
            health_path: text("health_path", ""),
            headers,
        })
    }

    fn url_for(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

pub struct RestConnector {
    descriptor: ConnectionDescriptor,
    config: RestConfig,
    paginator: Paginator,
    session: HttpSession,
    cursor: CursorTracker,
}

impl RestConnector {
    pub fn new(descriptor: ConnectionDescriptor, context: &ConnectorContext) -> Result<Self> {
        let config = RestConfig::from_descriptor(&descriptor)?;
        let paginator = Paginator::new(config.strategy, config.page_size)?;
        let session = HttpSession::new(context)?;
        info!(
            "REST connector '{}' ready ({}, {:?} pagination)",
            descriptor.source_name(),
            config.base_url,
            config.strategy
        );
        Ok(Self {
            descriptor,
            config,
            paginator,
            session,
            cursor: CursorTracker::default(),
        })
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    fn authorize(&self, rb: RequestBuilder) -> RequestBuilder {
        let rb = self
            .config
            .headers
            .iter()
            .fold(rb, |rb, (k, v)| rb.header(k.as_str(), v.as_str()));
        match &self.config.auth {
            RestAuth::None => rb,
            RestAuth::Bearer { token } => rb.bearer_auth(token),
            RestAuth::ApiKey { header, key } => rb.header(header.as_str(), key.as_str()),
            RestAuth::Basic { username, password } => rb.basic_auth(username, password.as_ref()),
        }
    }

    async fn fetch_page(
        &self,
        url: &str,
        base_query: &[(String, String)],
        request: PageRequest,
    ) -> Result<Page> {
        let mut query = base_query.to_vec();
        match &request {
            PageRequest::Single => {}
            PageRequest::Offset { offset, limit } => {
                query.push((self.config.offset_param.clone(), offset.to_string()));
                query.push((self.config.limit_param.clone(), limit.to_string()));
            }
            PageRequest::PageNumber { page, page_size } => {
                query.push((self.config.page_param.clone(), page.to_string()));
                query.push((self.config.page_size_param.clone(), page_size.to_string()));
            }
            PageRequest::Cursor { token, limit } => {
                query.push((self.config.limit_param.clone(), limit.to_string()));
                if let Some(token) = token {
                    query.push((self.config.cursor_param.clone(), token.clone()));
                }
            }
        }

        let body = self
            .session
            .get_json("rest get_data", |client| self.authorize(client.get(url)).query(&query))
            .await?;

        let records = extract_records(&body, self.config.records_path.as_deref())?;
        let next_token = match self.config.strategy {
            PaginationStrategy::Cursor => token_at(&body, &self.config.next_cursor_path),
            _ => None,
        };
        Ok(Page::new(records, next_token))
    }

    async fn fetch_all(&self, request: &FetchRequest, lower_bound: Option<&Value>) -> Result<TabularBatch> {
        let url = self.config.url_for(&request.target);
        let mut base_query: Vec<(String, String)> = request
            .filters
            .iter()
            .map(|(k, v)| (k.clone(), scalar_to_param(v)))
            .collect();
        if let Some(bound) = lower_bound {
            base_query.push((self.config.incremental_param.clone(), scalar_to_param(bound)));
        }

        let result = self
            .paginator
            .collect(|page| self.fetch_page(&url, &base_query, page))
            .await?;

        let payloads = result.records.into_iter().map(Value::Object).collect();
        TabularBatch::from_records(payloads)
    }
}

#[async_trait]
impl SourceConnector for RestConnector {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn test_connection(&mut self) -> Result<bool> {
        let url = self.config.url_for(&self.config.health_path);
        self.session
            .get_text("rest test_connection", |client| self.authorize(client.get(&url)))
            .await?;
        Ok(true)
    }

    async fn get_data(&mut self, request: &FetchRequest) -> Result<TabularBatch> {
        let lower_bound = self.cursor.lower_bound(request).cloned();
        let batch = self.fetch_all(request, lower_bound.as_ref()).await?;
        self.cursor.observe(request, &batch);
        info!(
            "Fetched {} records from {} ({})",
            batch.len(),
            request.target,
            self.descriptor.source_name()
        );
        Ok(batch)
    }

    async fn get_schema(&mut self, table: &str) -> Result<SchemaMap> {
        let url = self.config.url_for(table);
        let page = self.fetch_page(&url, &[], first_page(&self.paginator)).await?;
        let batch = TabularBatch::from_records(page.records.into_iter().map(Value::Object).collect())?;
        Ok(batch
            .infer_dtypes()
            .into_iter()
            .map(|(name, dtype)| (name, dtype.to_string()))
            .collect())
    }

    async fn get_row_count(&mut self, table: &str, predicate: Option<&str>) -> Result<u64> {
        if predicate.is_some() {
            return Err(SyncError::Validation(
                "REST sources do not support row-count predicates; use filters".to_string(),
            ));
        }
        let batch = self.fetch_all(&FetchRequest::full(table), None).await?;
        Ok(batch.len() as u64)
    }

    async fn close(&mut self) -> Result<()> {
        if self.session.is_open() {
            self.session.close();
            info!("REST connector '{}' closed", self.descriptor.source_name());
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

fn first_page(paginator: &Paginator) -> PageRequest {
    let size = paginator.page_size();
    match paginator.strategy() {
        PaginationStrategy::None => PageRequest::Single,
        PaginationStrategy::OffsetLimit => PageRequest::Offset { offset: 0, limit: size },
        PaginationStrategy::PageNumber => PageRequest::PageNumber { page: 1, page_size: size },
        PaginationStrategy::Cursor => PageRequest::Cursor { token: None, limit: size },
    }
}

/// Pull the records array out of a response body
pub(crate) fn extract_records(body: &Value, records_path: Option<&str>) -> Result<Vec<Record>> {
    let located = match records_path {
        Some(path) => json_path(body, path).ok_or_else(|| {
            SyncError::Validation(format!("Response has no records at path '{}'", path))
        })?,
        None => match body {
            Value::Object(map) => match ["data", "results", "records", "items"]
                .iter()
                .find_map(|key| map.get(*key))
            {
                Some(records) => records,
                None => locate_unnamed_records(body, map)?,
            },
            _ => body,
        },
    };

    match located {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items
            .iter()
            .map(|item| match item {
                Value::Object(obj) => obj.clone(),
                other => {
                    let mut wrapped = Map::new();
                    wrapped.insert("value".to_string(), other.clone());
                    wrapped
                }
            })
            .collect()),
        Value::Object(obj) => Ok(vec![obj.clone()]),
        other => {
            warn!("Unexpected records payload: {}", other);
            Err(SyncError::Validation("Response records are not an array".to_string()))
        }
    }
}

/// An envelope with exactly one array member holds its records there. With
/// no array member the body is a single resource; with several the records
/// cannot be told apart from paging data.
fn locate_unnamed_records<'a>(body: &'a Value, map: &'a Map<String, Value>) -> Result<&'a Value> {
    let arrays: Vec<(&String, &Value)> = map.iter().filter(|(_, v)| v.is_array()).collect();
    match arrays.as_slice() {
        [(key, records)] => {
            debug!("Using '{}' as the records array", key);
            Ok(*records)
        }
        [] => {
            warn!("Response object has no records array; treating it as a single record");
            Ok(body)
        }
        _ => Err(SyncError::Validation(format!(
            "Response has several arrays ({}); set records_path",
            arrays.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(", ")
        ))),
    }
}

fn token_at(body: &Value, path: &str) -> Option<String> {
    match json_path(body, path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn scalar_to_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
