//! PostgreSQL Connector - pooled SQL source using sqlx
//!
//! Every query acquires a pooled connection, runs, and releases it. Pool
//! acquisition is bounded by `acquire_timeout` so a saturated pool surfaces a
//! connection error instead of blocking.

use crate::batch::TabularBatch;
use crate::connectors::retry::RetryPolicy;
use crate::connectors::{
    ConnectionDescriptor, ConnectorContext, CursorTracker, FetchRequest, SchemaMap, SourceConnector,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Postgres, QueryBuilder, Row, TypeInfo};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").unwrap();
    static ref SQL_TYPE_NAME: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_ ]*$").unwrap();
}

/// Typed Postgres configuration parsed from a descriptor
#[derive(Clone, Debug, PartialEq)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Option<String>,
    pub schema: String,
    pub pool_size: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout: Duration,
}

impl PostgresConfig {
    pub fn from_descriptor(d: &ConnectionDescriptor, context: &ConnectorContext) -> Result<Self> {
        let host = d.require_endpoint()?.to_string();
        let database = d.database().ok_or_else(|| d.missing("database"))?.to_string();
        let username = d
            .credentials()
            .username
            .clone()
            .ok_or_else(|| d.missing("credentials.username"))?;
        let schema = d.schema().unwrap_or("public").to_string();
        if !IDENTIFIER.is_match(&schema) {
            return Err(SyncError::Configuration(format!("Invalid schema name '{}'", schema)));
        }
        let pool_size = d
            .param_u64("pool_size")?
            .map(|n| {
                u32::try_from(n).map_err(|_| {
                    SyncError::Configuration(format!("pool_size {} is out of range", n))
                })
            })
            .transpose()?
            .unwrap_or(context.sql_pool_size)
            .max(1);

        Ok(Self {
            host,
            port: d.port().unwrap_or(5432),
            database,
            username,
            password: d.credentials().password.clone(),
            schema,
            pool_size,
            acquire_timeout: context.request_timeout,
            statement_timeout: context.request_timeout,
        })
    }

    fn connect_options(&self) -> PgConnectOptions {
        let statement_timeout = self.statement_timeout.as_millis().to_string();
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username)
            .options([("statement_timeout", statement_timeout.as_str())]);
        match &self.password {
            Some(password) => options.password(password),
            None => options,
        }
    }
}

/// A validated relation reference or wrapped query
#[derive(Clone, Debug, PartialEq)]
enum Relation {
    Table { schema: String, table: String },
    Query(String),
}

impl Relation {
    fn parse(target: &str, default_schema: &str) -> Result<Self> {
        let trimmed = target.trim();
        let lowered = trimmed.to_lowercase();
        if lowered.starts_with("select") || lowered.starts_with("with") {
            validate_select(trimmed)?;
            return Ok(Relation::Query(trimmed.trim_end_matches(';').to_string()));
        }

        let parts: Vec<&str> = trimmed.split('.').collect();
        let (schema, table) = match parts.as_slice() {
            [table] => (default_schema, *table),
            [schema, table] => (*schema, *table),
            _ => {
                return Err(SyncError::Validation(format!("Invalid table reference '{}'", target)))
            }
        };
        for ident in [schema, table] {
            validate_identifier(ident)?;
        }
        Ok(Relation::Table {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }

    fn from_clause(&self) -> String {
        match self {
            Relation::Table { schema, table } => format!("\"{}\".\"{}\"", schema, table),
            Relation::Query(sql) => format!("({}) AS src", sql),
        }
    }
}

fn validate_identifier(ident: &str) -> Result<()> {
    if IDENTIFIER.is_match(ident) {
        Ok(())
    } else {
        Err(SyncError::Validation(format!("Invalid SQL identifier '{}'", ident)))
    }
}

/// Only a single read-only query statement is accepted as a raw source query
fn validate_select(sql: &str) -> Result<()> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| SyncError::Validation(format!("Unparseable source query: {}", e)))?;
    match statements.as_slice() {
        [Statement::Query(_)] => Ok(()),
        [] => Err(SyncError::Validation("Empty source query".to_string())),
        [_] => Err(SyncError::Validation("Source query must be a SELECT".to_string())),
        _ => Err(SyncError::Validation("Source query must be a single statement".to_string())),
    }
}

fn validate_predicate(predicate: &str) -> Result<()> {
    validate_select(&format!("SELECT 1 FROM t WHERE {}", predicate))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQLSTATE for "relation does not exist"
const UNDEFINED_TABLE: &str = "42P01";

/// Report a missing relation as `NotFound`; other errors pass through
fn missing_relation(err: SyncError, target: &str) -> SyncError {
    if let SyncError::Database(sqlx::Error::Database(db)) = &err {
        if db.code().as_deref() == Some(UNDEFINED_TABLE) {
            return SyncError::NotFound(format!("Relation '{}' not found: {}", target, db.message()));
        }
    }
    err
}

/// Types `decode_cell` reads natively, under both the information_schema
/// spelling and the wire type name. Anything else is selected as `::text`.
fn natively_decoded(sql_type: &str) -> bool {
    matches!(
        sql_type.to_lowercase().as_str(),
        "boolean"
            | "bool"
            | "smallint"
            | "int2"
            | "integer"
            | "int4"
            | "bigint"
            | "int8"
            | "real"
            | "float4"
            | "double precision"
            | "float8"
            | "numeric"
            | "timestamp with time zone"
            | "timestamptz"
            | "timestamp without time zone"
            | "timestamp"
            | "date"
            | "uuid"
            | "json"
            | "jsonb"
            | "text"
            | "character varying"
            | "varchar"
            | "character"
            | "char"
            | "bpchar"
            | "name"
    )
}

/// Explicit select list, or `None` when `*` decodes every column
fn select_list(columns: &[(String, String)]) -> Option<String> {
    if columns.iter().all(|(_, sql_type)| natively_decoded(sql_type)) {
        return None;
    }
    let items: Vec<String> = columns
        .iter()
        .map(|(name, sql_type)| {
            let quoted = quote_ident(name);
            if natively_decoded(sql_type) {
                quoted
            } else {
                format!("{}::text AS {}", quoted, quoted)
            }
        })
        .collect();
    Some(items.join(", "))
}

/// Incremental lower bound together with the cursor column's SQL type
#[derive(Clone, Debug)]
struct CursorBound {
    field: String,
    value: Value,
    sql_type: Option<String>,
}

/// Builds the SELECT for one fetch; rebuilt for each retry attempt
#[derive(Clone, Debug)]
struct SelectPlan {
    relation: Relation,
    /// Explicit projection casting undecodable columns to text
    projection: Option<String>,
    filters: Vec<(String, Value)>,
    bound: Option<CursorBound>,
    order_by: Option<String>,
}

impl SelectPlan {
    fn builder(&self) -> Result<QueryBuilder<'static, Postgres>> {
        let projection = self.projection.as_deref().unwrap_or("*");
        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM {}",
            projection,
            self.relation.from_clause()
        ));
        let mut first = true;
        let mut next_clause = |qb: &mut QueryBuilder<'static, Postgres>| {
            qb.push(if first { " WHERE " } else { " AND " });
            first = false;
        };

        for (column, value) in &self.filters {
            next_clause(&mut qb);
            qb.push(format!("\"{}\"", column));
            if value.is_null() {
                qb.push(" IS NULL");
            } else {
                qb.push(" = ");
                push_scalar(&mut qb, value)?;
            }
        }

        if let Some(bound) = &self.bound {
            next_clause(&mut qb);
            match (&bound.value, &bound.sql_type) {
                (Value::String(s), Some(sql_type)) => {
                    qb.push(format!("\"{}\" > CAST(", bound.field));
                    qb.push_bind(s.clone());
                    qb.push(format!(" AS {})", sql_type));
                }
                (Value::String(s), None) => {
                    qb.push(format!("\"{}\"::text > ", bound.field));
                    qb.push_bind(s.clone());
                }
                (value, _) => {
                    qb.push(format!("\"{}\" > ", bound.field));
                    push_scalar(&mut qb, value)?;
                }
            }
        }

        if let Some(order) = &self.order_by {
            qb.push(format!(" ORDER BY \"{}\"", order));
        }
        Ok(qb)
    }
}

fn push_scalar(qb: &mut QueryBuilder<'static, Postgres>, value: &Value) -> Result<()> {
    match value {
        Value::Bool(b) => {
            qb.push_bind(*b);
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) => {
                qb.push_bind(i);
            }
            None => {
                qb.push_bind(n.as_f64().unwrap_or_default());
            }
        },
        Value::String(s) => {
            qb.push_bind(s.clone());
        }
        other => {
            return Err(SyncError::Validation(format!(
                "Unsupported filter value for SQL source: {}",
                other
            )))
        }
    }
    Ok(())
}

pub struct PostgresConnector {
    descriptor: ConnectionDescriptor,
    config: PostgresConfig,
    retry: RetryPolicy,
    pool: Option<PgPool>,
    cursor: CursorTracker,
}

impl PostgresConnector {
    pub fn new(descriptor: ConnectionDescriptor, context: &ConnectorContext) -> Result<Self> {
        let config = PostgresConfig::from_descriptor(&descriptor, context)?;
        Ok(Self {
            descriptor,
            config,
            retry: context.retry.clone(),
            pool: None,
            cursor: CursorTracker::default(),
        })
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }

    /// The pool is created on first use; connections are opened lazily
    fn pool(&mut self) -> PgPool {
        if let Some(pool) = &self.pool {
            return pool.clone();
        }
        info!(
            "Opening Postgres pool for '{}' ({}:{}/{}, max {} connections)",
            self.descriptor.source_name(),
            self.config.host,
            self.config.port,
            self.config.database,
            self.config.pool_size
        );
        let pool = PgPoolOptions::new()
            .max_connections(self.config.pool_size)
            .acquire_timeout(self.config.acquire_timeout)
            .connect_lazy_with(self.config.connect_options());
        self.pool = Some(pool.clone());
        pool
    }

    async fn table_columns(
        &self,
        pool: &PgPool,
        schema: &str,
        table: &str,
    ) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = self
            .retry
            .run("postgres get_schema", || async move {
                Ok(sqlx::query_as(
                    "SELECT column_name::text, data_type::text FROM information_schema.columns \
                     WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                )
                .bind(schema)
                .bind(table)
                .fetch_all(pool)
                .await?)
            })
            .await?;
        Ok(rows)
    }

    /// Columns with their SQL types, in select order. A missing relation is
    /// `NotFound`.
    async fn relation_columns(
        &self,
        pool: &PgPool,
        relation: &Relation,
        target: &str,
    ) -> Result<Vec<(String, String)>> {
        let columns = match relation {
            Relation::Table { schema, table } => self.table_columns(pool, schema, table).await?,
            Relation::Query(sql) => {
                let describe = self
                    .retry
                    .run("postgres describe", || async move { Ok(pool.describe(sql).await?) })
                    .await
                    .map_err(|e| missing_relation(e, target))?;
                describe
                    .columns()
                    .iter()
                    .map(|c| (c.name().to_string(), c.type_info().name().to_string()))
                    .collect()
            }
        };
        if columns.is_empty() {
            return Err(SyncError::NotFound(format!("Relation '{}' not found", target)));
        }
        Ok(columns)
    }
}

#[async_trait]
impl SourceConnector for PostgresConnector {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn test_connection(&mut self) -> Result<bool> {
        let pool = self.pool();
        let pool = &pool;
        let one: i32 = self
            .retry
            .run("postgres test_connection", || async move {
                Ok(sqlx::query_scalar("SELECT 1").fetch_one(pool).await?)
            })
            .await?;
        Ok(one == 1)
    }

    async fn get_data(&mut self, request: &FetchRequest) -> Result<TabularBatch> {
        let relation = Relation::parse(&request.target, &self.config.schema)?;
        let pool = self.pool();

        let mut filters = Vec::with_capacity(request.filters.len());
        for (column, value) in &request.filters {
            validate_identifier(column)?;
            filters.push((column.clone(), value.clone()));
        }

        let columns = self.relation_columns(&pool, &relation, &request.target).await?;
        let mut incremental_field = None;
        let mut bound = None;
        if let Some(field) = request.incremental_field() {
            validate_identifier(field)?;
            match columns.iter().find(|(name, _)| name == field).map(|(_, t)| t) {
                None => warn!(
                    "Cursor field '{}' not found in '{}', falling back to full fetch",
                    field, request.target
                ),
                Some(sql_type) => {
                    incremental_field = Some(field.to_string());
                    if let Some(value) = self.cursor.lower_bound(request) {
                        bound = Some(CursorBound {
                            field: field.to_string(),
                            value: value.clone(),
                            sql_type: Some(sql_type.clone())
                                .filter(|t| SQL_TYPE_NAME.is_match(t)),
                        });
                    }
                }
            }
        }

        let plan = SelectPlan {
            relation,
            projection: select_list(&columns),
            filters,
            bound,
            order_by: incremental_field.clone(),
        };
        debug!("Postgres fetch: {}", plan.builder()?.sql());

        let (plan_ref, pool_ref) = (&plan, &pool);
        let rows: Vec<PgRow> = self
            .retry
            .run("postgres get_data", || async move {
                let mut qb = plan_ref.builder()?;
                Ok(qb.build().fetch_all(pool_ref).await?)
            })
            .await
            .map_err(|e| missing_relation(e, &request.target))?;

        let names: Vec<String> = columns.into_iter().map(|(name, _)| name).collect();
        let batch = rows_to_batch(&rows, &names)?;
        if incremental_field.is_some() {
            self.cursor.observe(request, &batch);
        }
        info!(
            "Fetched {} rows from {} ({})",
            batch.len(),
            request.target,
            self.descriptor.source_name()
        );
        Ok(batch)
    }

    async fn get_schema(&mut self, table: &str) -> Result<SchemaMap> {
        let relation = Relation::parse(table, &self.config.schema)?;
        let pool = self.pool();
        let columns = self.relation_columns(&pool, &relation, table).await?;
        Ok(columns.into_iter().collect())
    }

    async fn get_row_count(&mut self, table: &str, predicate: Option<&str>) -> Result<u64> {
        let relation = Relation::parse(table, &self.config.schema)?;
        let mut sql = format!("SELECT COUNT(*) FROM {}", relation.from_clause());
        if let Some(predicate) = predicate.map(str::trim).filter(|p| !p.is_empty()) {
            validate_predicate(predicate)?;
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        let pool = self.pool();
        let (sql, pool) = (sql.as_str(), &pool);
        let count: i64 = self
            .retry
            .run("postgres get_row_count", || async move {
                Ok(sqlx::query_scalar(sql).fetch_one(pool).await?)
            })
            .await
            .map_err(|e| missing_relation(e, table))?;
        Ok(count.max(0) as u64)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
            info!("Postgres pool for '{}' closed", self.descriptor.source_name());
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

fn rows_to_batch(rows: &[PgRow], known_columns: &[String]) -> Result<TabularBatch> {
    let columns: Vec<String> = match rows.first() {
        Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
        None => known_columns.to_vec(),
    };

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let mut record = Map::new();
        for (idx, column) in row.columns().iter().enumerate() {
            let value = decode_cell(row, idx, column.type_info().name())
                .map_err(|e| match e {
                    SyncError::Validation(msg) => {
                        SyncError::Validation(format!("Column '{}': {}", column.name(), msg))
                    }
                    other => other,
                })?;
            record.insert(column.name().to_string(), value);
        }
        records.push(record);
    }
    Ok(TabularBatch::new(columns, records))
}

/// NUMERIC as an exact JSON number when one exists, else its decimal text
fn numeric_to_json(d: &BigDecimal) -> Value {
    if d.is_integer() {
        if let Some(i) = d.to_i64() {
            return Value::from(i);
        }
    } else if let Some(n) = d.to_f64().and_then(serde_json::Number::from_f64) {
        if BigDecimal::from_str(&n.to_string()).map_or(false, |back| &back == d) {
            return Value::Number(n);
        }
    }
    Value::String(d.to_string())
}

/// Convert one Postgres cell into a plain scalar
fn decode_cell(row: &PgRow, idx: usize, type_name: &str) -> Result<Value> {
    fn num(f: Option<f64>) -> Value {
        f.and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }

    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool).unwrap_or(Value::Null),
        "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(|v| Value::from(v)).unwrap_or(Value::Null),
        "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(|v| Value::from(v)).unwrap_or(Value::Null),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(|v| Value::from(v)).unwrap_or(Value::Null),
        "FLOAT4" => num(row.try_get::<Option<f32>, _>(idx)?.map(f64::from)),
        "FLOAT8" => num(row.try_get::<Option<f64>, _>(idx)?),
        "NUMERIC" => row
            .try_get::<Option<BigDecimal>, _>(idx)?
            .map(|d| numeric_to_json(&d))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|t| Value::String(t.to_rfc3339()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)?
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)?
            .map(|u| Value::String(u.to_string()))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(idx)?.unwrap_or(Value::Null),
        _ => match row.try_get::<Option<String>, _>(idx) {
            Ok(v) => v.map(Value::String).unwrap_or(Value::Null),
            Err(e) => {
                return Err(SyncError::Validation(format!(
                    "type {} cannot be decoded: {}",
                    type_name, e
                )))
            }
        },
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::DescriptorSpec;
    use crate::connectors::Credentials;
    use serde_json::json;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::new(DescriptorSpec {
            source_type: "postgres".into(),
            source_name: "warehouse".into(),
            endpoint: Some("db.internal".into()),
            database: Some("analytics".into()),
            credentials: Credentials {
                username: Some("etl".into()),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_config_defaults_and_required_fields() {
        let config = PostgresConfig::from_descriptor(&descriptor(), &ConnectorContext::default()).unwrap();
        assert_eq!(config.port, 5432);
        assert_eq!(config.schema, "public");
        assert_eq!(config.pool_size, 5);

        let d = ConnectionDescriptor::new(DescriptorSpec {
            source_type: "postgres".into(),
            source_name: "warehouse".into(),
            endpoint: Some("db.internal".into()),
            ..Default::default()
        })
        .unwrap();
        let err = PostgresConfig::from_descriptor(&d, &ConnectorContext::default()).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(ref m) if m.contains("database")));
    }

    #[test]
    fn test_relation_parsing_rejects_injection() {
        assert_eq!(
            Relation::parse("sales.orders", "public").unwrap(),
            Relation::Table { schema: "sales".into(), table: "orders".into() }
        );
        assert!(Relation::parse("orders; DROP TABLE x", "public").is_err());
        assert!(Relation::parse("SELECT 1; DELETE FROM orders", "public").is_err());
        assert!(matches!(
            Relation::parse("select id from orders where id > 3;", "public").unwrap(),
            Relation::Query(ref q) if !q.ends_with(';')
        ));
        assert!(validate_predicate("amount > 10 AND status = 'open'").is_ok());
        assert!(validate_predicate("1=1; DROP TABLE orders").is_err());
    }

    #[test]
    fn test_plan_sql_binds_filters_and_cursor() {
        let plan = SelectPlan {
            relation: Relation::Table { schema: "public".into(), table: "orders".into() },
            projection: None,
            filters: vec![("region".into(), json!("eu")), ("deleted_at".into(), Value::Null)],
            bound: Some(CursorBound {
                field: "updated_at".into(),
                value: json!("2024-01-01T00:00:00Z"),
                sql_type: Some("timestamp with time zone".into()),
            }),
            order_by: Some("updated_at".into()),
        };
        let qb = plan.builder().unwrap();
        assert_eq!(
            qb.sql(),
            "SELECT * FROM \"public\".\"orders\" WHERE \"region\" = $1 AND \"deleted_at\" IS NULL \
             AND \"updated_at\" > CAST($2 AS timestamp with time zone) ORDER BY \"updated_at\""
        );
    }

    #[test]
    fn test_plan_numeric_cursor_over_query() {
        let plan = SelectPlan {
            relation: Relation::Query("SELECT id, v FROM t".into()),
            projection: None,
            filters: vec![],
            bound: Some(CursorBound { field: "id".into(), value: json!(42), sql_type: None }),
            order_by: Some("id".into()),
        };
        assert_eq!(
            plan.builder().unwrap().sql(),
            "SELECT * FROM (SELECT id, v FROM t) AS src WHERE \"id\" > $1 ORDER BY \"id\""
        );
    }

    #[test]
    fn test_unsupported_types_are_cast_to_text() {
        for native in ["integer", "INT8", "numeric", "character varying", "BPCHAR", "jsonb", "timestamp with time zone"] {
            assert!(natively_decoded(native), "{}", native);
        }
        for cast in ["time without time zone", "interval", "bytea", "inet", "ARRAY", "USER-DEFINED", "money", "TEXT[]"] {
            assert!(!natively_decoded(cast), "{}", cast);
        }

        let columns = vec![
            ("id".to_string(), "integer".to_string()),
            ("mood".to_string(), "USER-DEFINED".to_string()),
            ("tags".to_string(), "ARRAY".to_string()),
        ];
        assert_eq!(
            select_list(&columns).unwrap(),
            "\"id\", \"mood\"::text AS \"mood\", \"tags\"::text AS \"tags\""
        );
        assert!(select_list(&columns[..1]).is_none());

        let plan = SelectPlan {
            relation: Relation::Table { schema: "public".into(), table: "people".into() },
            projection: select_list(&columns),
            filters: vec![],
            bound: None,
            order_by: None,
        };
        assert!(plan
            .builder()
            .unwrap()
            .sql()
            .starts_with("SELECT \"id\", \"mood\"::text AS \"mood\""));
    }

    #[test]
    fn test_numeric_keeps_exact_value() {
        let decimal = |s: &str| BigDecimal::from_str(s).unwrap();
        assert_eq!(numeric_to_json(&decimal("42")), json!(42));
        assert_eq!(numeric_to_json(&decimal("12.50")), json!(12.5));
        assert_eq!(
            numeric_to_json(&decimal("12345678901234567890.123456789")),
            json!("12345678901234567890.123456789")
        );
        assert_eq!(
            numeric_to_json(&decimal("100000000000000000000")),
            json!("100000000000000000000")
        );
    }

    #[derive(Debug)]
    struct PgFailure {
        code: &'static str,
    }

    impl std::fmt::Display for PgFailure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "error {}", self.code)
        }
    }

    impl std::error::Error for PgFailure {}

    impl sqlx::error::DatabaseError for PgFailure {
        fn message(&self) -> &str {
            "relation \"orders\" does not exist"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(self.code.into())
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn db_error(code: &'static str) -> SyncError {
        SyncError::Database(sqlx::Error::Database(Box::new(PgFailure { code })))
    }

    #[test]
    fn test_undefined_table_maps_to_not_found() {
        let err = missing_relation(db_error("42P01"), "orders");
        assert!(matches!(err, SyncError::NotFound(ref m) if m.contains("orders")));

        let err = missing_relation(db_error("42501"), "orders");
        assert!(matches!(err, SyncError::Database(_)));
        let err = missing_relation(SyncError::Validation("bad".into()), "orders");
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_pool_size_out_of_range_rejected() {
        let mut spec = DescriptorSpec {
            source_type: "postgres".into(),
            source_name: "warehouse".into(),
            endpoint: Some("db.internal".into()),
            database: Some("analytics".into()),
            credentials: Credentials {
                username: Some("etl".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        spec.params.insert("pool_size".into(), json!(u64::from(u32::MAX) + 1));
        let d = ConnectionDescriptor::new(spec).unwrap();
        let err = PostgresConfig::from_descriptor(&d, &ConnectorContext::default()).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(ref m) if m.contains("pool_size")));
    }
}
