//! Exploration stage - per-column profile of an ingested batch

use crate::batch::{compare_values, TabularBatch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub dtype: String,
    pub null_count: usize,
    pub distinct_count: usize,
    pub min: Option<Value>,
    pub max: Option<Value>,
    /// Numeric columns only
    pub mean: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub row_count: usize,
    pub column_count: usize,
    pub columns: Vec<ColumnProfile>,
}

impl DatasetProfile {
    pub fn column(&self, name: &str) -> Option<&ColumnProfile> {
        self.columns.iter().find(|c| c.name == name)
    }
}

pub fn profile(batch: &TabularBatch) -> DatasetProfile {
    let columns = batch
        .infer_dtypes()
        .into_iter()
        .map(|(name, dtype)| {
            let present: Vec<&Value> = batch.column_values(&name).filter(|v| !v.is_null()).collect();
            let distinct: HashSet<String> = present.iter().map(|v| v.to_string()).collect();

            let mut min: Option<&Value> = None;
            let mut max: Option<&Value> = None;
            for &value in &present {
                if min.map_or(true, |m| compare_values(value, m) == Some(Ordering::Less)) {
                    min = Some(value);
                }
                if max.map_or(true, |m| compare_values(value, m) == Some(Ordering::Greater)) {
                    max = Some(value);
                }
            }

            let mean = if dtype.is_numeric() && !present.is_empty() {
                let sum: f64 = present.iter().filter_map(|v| v.as_f64()).sum();
                Some(sum / present.len() as f64)
            } else {
                None
            };

            ColumnProfile {
                null_count: batch.len() - present.len(),
                distinct_count: distinct.len(),
                min: min.cloned(),
                max: max.cloned(),
                mean,
                dtype: dtype.to_string(),
                name,
            }
        })
        .collect();

    DatasetProfile {
        row_count: batch.len(),
        column_count: batch.column_count(),
        columns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_profile_numeric_and_text() {
        let batch = TabularBatch::from_records(vec![
            json!({"amount": 10, "city": "Oslo"}),
            json!({"amount": 30, "city": null}),
            json!({"amount": 20, "city": "Oslo"}),
        ])
        .unwrap();
        let profile = profile(&batch);
        assert_eq!(profile.row_count, 3);

        let amount = profile.column("amount").unwrap();
        assert_eq!(amount.dtype, "int64");
        assert_eq!(amount.min, Some(json!(10)));
        assert_eq!(amount.max, Some(json!(30)));
        assert_eq!(amount.mean, Some(20.0));

        let city = profile.column("city").unwrap();
        assert_eq!(city.null_count, 1);
        assert_eq!(city.distinct_count, 1);
        assert_eq!(city.mean, None);
    }
}
