//! Tabular Batch - the unit of data every connector returns
//!
//! Rows are JSON objects whose values are mostly plain scalars (int64, float64,
//! bool, string, null); nested values from API payloads are kept as-is.
//! Timestamps travel as RFC3339 strings. Conversion to and from Polars happens
//! only at the persistence boundary.

use crate::error::{Result, SyncError};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

pub type Record = Map<String, Value>;

/// Best-effort column type inferred from the values present in a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int64,
    Float64,
    Boolean,
    String,
    Timestamp,
    Null,
    Mixed,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Int64 => "int64",
            ColumnType::Float64 => "float64",
            ColumnType::Boolean => "bool",
            ColumnType::String => "string",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Null => "null",
            ColumnType::Mixed => "mixed",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Int64 | ColumnType::Float64)
    }

    fn of_value(value: &Value) -> ColumnType {
        match value {
            Value::Null => ColumnType::Null,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Int64,
            Value::Number(_) => ColumnType::Float64,
            Value::String(s) if parse_timestamp(s).is_some() => ColumnType::Timestamp,
            Value::String(_) => ColumnType::String,
            Value::Array(_) | Value::Object(_) => ColumnType::Mixed,
        }
    }

    fn merge(self, other: ColumnType) -> ColumnType {
        match (self, other) {
            (a, b) if a == b => a,
            (ColumnType::Null, b) => b,
            (a, ColumnType::Null) => a,
            (ColumnType::Int64, ColumnType::Float64) | (ColumnType::Float64, ColumnType::Int64) => {
                ColumnType::Float64
            }
            (ColumnType::Timestamp, ColumnType::String) | (ColumnType::String, ColumnType::Timestamp) => {
                ColumnType::String
            }
            _ => ColumnType::Mixed,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered columns plus row records
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

impl TabularBatch {
    pub fn new(columns: Vec<String>, rows: Vec<Record>) -> Self {
        Self { columns, rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a batch from JSON payloads; column order follows first appearance
    pub fn from_records(payloads: Vec<Value>) -> Result<Self> {
        let mut columns: Vec<String> = Vec::new();
        let mut rows = Vec::with_capacity(payloads.len());

        for (idx, payload) in payloads.into_iter().enumerate() {
            match payload {
                Value::Object(obj) => {
                    for key in obj.keys() {
                        if !columns.iter().any(|c| c == key) {
                            columns.push(key.clone());
                        }
                    }
                    rows.push(obj);
                }
                other => {
                    return Err(SyncError::Validation(format!(
                        "Record {} is not an object: {}",
                        idx, other
                    )))
                }
            }
        }

        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Values of one column, `Null` where a row lacks the key
    pub fn column_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows.iter().map(move |row| row.get(name).unwrap_or(&Value::Null))
    }

    pub fn infer_column_type(&self, name: &str) -> ColumnType {
        self.column_values(name)
            .fold(ColumnType::Null, |acc, v| acc.merge(ColumnType::of_value(v)))
    }

    pub fn infer_dtypes(&self) -> Vec<(String, ColumnType)> {
        self.columns
            .iter()
            .map(|c| (c.clone(), self.infer_column_type(c)))
            .collect()
    }

    /// Largest non-null value of a column under [`compare_values`]
    pub fn max_value(&self, name: &str) -> Option<Value> {
        let mut best: Option<&Value> = None;
        for value in self.column_values(name).filter(|v| !v.is_null()) {
            best = match best {
                None => Some(value),
                Some(current) => match compare_values(value, current) {
                    Some(Ordering::Greater) => Some(value),
                    _ => Some(current),
                },
            };
        }
        best.cloned()
    }

    /// Approximate in-memory footprint of the batch
    pub fn estimated_size_bytes(&self) -> u64 {
        let header: usize = self.columns.iter().map(|c| c.len() + 24).sum();
        let body: usize = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|(k, v)| k.len() + 32 + value_size(v))
                    .sum::<usize>()
            })
            .sum();
        (header + body) as u64
    }

    pub fn append(&mut self, other: TabularBatch) {
        for column in other.columns {
            if !self.has_column(&column) {
                self.columns.push(column);
            }
        }
        self.rows.extend(other.rows);
    }

    /// Columns that cannot round-trip through a native Polars dtype: nested or
    /// mixed values, ints mixed with floats, and integers beyond `i64`. They
    /// are spilled as JSON text and decoded on reload.
    pub fn json_encoded_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| self.needs_json_encoding(c))
            .cloned()
            .collect()
    }

    fn needs_json_encoding(&self, column: &str) -> bool {
        match self.infer_column_type(column) {
            ColumnType::Int64 => self
                .column_values(column)
                .any(|v| !v.is_null() && v.as_i64().is_none()),
            ColumnType::Float64 => self
                .column_values(column)
                .any(|v| matches!(v, Value::Number(n) if !n.is_f64())),
            ColumnType::Mixed => true,
            _ => false,
        }
    }

    /// Convert to a Polars DataFrame, one typed series per column. Columns
    /// listed by [`Self::json_encoded_columns`] become JSON text.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let json_columns = self.json_encoded_columns();
        let mut series = Vec::with_capacity(self.columns.len());

        for column in &self.columns {
            if json_columns.contains(column) {
                let values: Vec<Option<String>> = self
                    .column_values(column)
                    .map(|v| (!v.is_null()).then(|| v.to_string()))
                    .collect();
                series.push(Series::new(column, values));
                continue;
            }

            let s = match self.infer_column_type(column) {
                ColumnType::Int64 => {
                    let values: Vec<Option<i64>> =
                        self.column_values(column).map(|v| v.as_i64()).collect();
                    Series::new(column, values)
                }
                ColumnType::Float64 => {
                    let values: Vec<Option<f64>> =
                        self.column_values(column).map(|v| v.as_f64()).collect();
                    Series::new(column, values)
                }
                ColumnType::Boolean => {
                    let values: Vec<Option<bool>> =
                        self.column_values(column).map(|v| v.as_bool()).collect();
                    Series::new(column, values)
                }
                _ => {
                    let values: Vec<Option<String>> = self
                        .column_values(column)
                        .map(|v| v.as_str().map(str::to_string))
                        .collect();
                    Series::new(column, values)
                }
            };
            series.push(s);
        }

        Ok(DataFrame::new(series)?)
    }

    /// Rebuild a batch from a DataFrame, keeping `column_order` when given.
    /// `json_columns` are parsed back from the JSON text written by
    /// [`Self::to_dataframe`].
    pub fn from_dataframe(
        df: &DataFrame,
        column_order: Option<&[String]>,
        json_columns: &[String],
    ) -> Result<Self> {
        let columns: Vec<String> = match column_order {
            Some(order) => order.to_vec(),
            None => df.get_column_names().iter().map(|s| s.to_string()).collect(),
        };

        let mut rows = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            let mut row = Map::new();
            for name in &columns {
                let series = df.column(name)?;
                let value = match series.get(i)? {
                    AnyValue::String(text) if json_columns.contains(name) => {
                        serde_json::from_str(text)?
                    }
                    other => any_value_to_json(other),
                };
                row.insert(name.clone(), value);
            }
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => 8,
        Value::String(s) => s.len() + 24,
        other => other.to_string().len() + 24,
    }
}

fn any_value_to_json(value: AnyValue) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::Int64(i) => Value::Number(i.into()),
        AnyValue::Int32(i) => Value::Number(i.into()),
        AnyValue::UInt64(u) => Value::Number(u.into()),
        AnyValue::UInt32(u) => Value::Number(u.into()),
        AnyValue::Float64(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AnyValue::Float32(f) => serde_json::Number::from_f64(f as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        other => Value::String(other.to_string()),
    }
}

/// Parse the timestamp spellings sources commonly emit
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    // Salesforce style: 2024-01-15T10:00:00.000+0000
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Ordering used for cursor comparison: numbers numerically, timestamps
/// chronologically, other strings lexically. Mixed kinds are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return Some(x.cmp(&y));
            }
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Convert a raw text cell into the narrowest matching scalar
pub fn coerce_cell(s: &str) -> Value {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }

    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }

    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }

    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }

    Value::String(trimmed.to_string())
}
