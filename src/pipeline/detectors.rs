//! Detector capabilities consumed by the pipeline
//!
//! The orchestrator only sees the two traits. [`Detectors::select`] picks a
//! full-featured implementation when one is supplied and otherwise falls back
//! to the regex/rule based ones in this module.

use crate::batch::{parse_timestamp, ColumnType, TabularBatch};
use crate::error::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiiFinding {
    pub column: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub match_count: usize,
    pub sample_values: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PiiReport {
    pub findings: Vec<PiiFinding>,
    pub total_fields: usize,
}

impl PiiReport {
    pub fn findings_of(&self, entity_type: &str) -> impl Iterator<Item = &PiiFinding> + '_ {
        let entity_type = entity_type.to_string();
        self.findings.iter().filter(move |f| f.entity_type == entity_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityDetails {
    pub row_count: usize,
    pub column_count: usize,
    pub null_cells: usize,
    pub total_cells: usize,
    /// Column -> values failing its format rule
    pub invalid_values: BTreeMap<String, usize>,
    /// Column -> IQR outliers
    pub outliers: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub completeness_score: f64,
    pub validity_score: f64,
    pub consistency_score: f64,
    pub overall_score: f64,
    pub details: QualityDetails,
}

/// Finds columns holding personal data
pub trait SensitiveFieldDetector: Send + Sync {
    fn name(&self) -> &str;
    fn scan(&self, batch: &TabularBatch) -> Result<PiiReport>;
}

/// Scores a batch on completeness, validity and consistency
pub trait QualityValidator: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, batch: &TabularBatch) -> Result<QualityReport>;
}

#[derive(Clone)]
pub struct Detectors {
    pub pii: Arc<dyn SensitiveFieldDetector>,
    pub quality: Arc<dyn QualityValidator>,
}

impl std::fmt::Debug for Detectors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detectors")
            .field("pii", &self.pii.name())
            .field("quality", &self.quality.name())
            .finish()
    }
}

impl Default for Detectors {
    fn default() -> Self {
        Self::basic()
    }
}

impl Detectors {
    pub fn basic() -> Self {
        Self {
            pii: Arc::new(RegexPiiDetector),
            quality: Arc::new(RuleBasedQualityValidator),
        }
    }

    /// Prefer the supplied implementations, falling back per capability
    pub fn select(
        pii: Option<Arc<dyn SensitiveFieldDetector>>,
        quality: Option<Arc<dyn QualityValidator>>,
    ) -> Self {
        let basic = Self::basic();
        let selected = Self {
            pii: pii.unwrap_or(basic.pii),
            quality: quality.unwrap_or(basic.quality),
        };
        info!(
            "Detectors selected: pii={}, quality={}",
            selected.pii.name(),
            selected.quality.name()
        );
        selected
    }
}

lazy_static! {
    static ref EMAIL_SEARCH: Regex =
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap();
    static ref EMAIL_STRICT: Regex =
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$").unwrap();
    static ref PHONE: Regex =
        Regex::new(r"(?:\+?1[-.\s]?)?(?:\(\d{3}\)\s?|\b\d{3}[-.\s])\d{3}[-.\s]\d{4}\b").unwrap();
    static ref SSN: Regex = Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap();
    static ref CARD: Regex = Regex::new(r"\b(?:\d{4}[- ]?){3}\d{4}\b").unwrap();
    static ref IPV4: Regex = Regex::new(
        r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b"
    )
    .unwrap();
}

const SAMPLE_LIMIT: usize = 3;

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

fn first_match(entity_type: &str, text: &str) -> Option<String> {
    let found = match entity_type {
        "EMAIL_ADDRESS" => EMAIL_SEARCH.find(text),
        "PHONE_NUMBER" => PHONE.find(text),
        "US_SSN" => SSN.find(text),
        "CREDIT_CARD" => CARD.find_iter(text).find(|m| luhn_valid(m.as_str())),
        "IP_ADDRESS" => IPV4.find(text),
        _ => None,
    };
    found.map(|m| m.as_str().to_string())
}

/// Keep the first two characters of a sample
fn mask(sample: &str) -> String {
    let visible: String = sample.chars().take(2).collect();
    format!("{}***", visible)
}

const ENTITY_TYPES: [&str; 5] = ["EMAIL_ADDRESS", "PHONE_NUMBER", "US_SSN", "CREDIT_CARD", "IP_ADDRESS"];

/// Pattern-matching fallback detector
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexPiiDetector;

impl SensitiveFieldDetector for RegexPiiDetector {
    fn name(&self) -> &str {
        "regex"
    }

    fn scan(&self, batch: &TabularBatch) -> Result<PiiReport> {
        let mut findings = Vec::new();

        for column in &batch.columns {
            let texts: Vec<&str> = batch
                .column_values(column)
                .filter_map(Value::as_str)
                .collect();
            if texts.is_empty() {
                continue;
            }

            for entity_type in ENTITY_TYPES {
                let mut match_count = 0;
                let mut samples = Vec::new();
                for text in &texts {
                    if let Some(hit) = first_match(entity_type, text) {
                        match_count += 1;
                        if samples.len() < SAMPLE_LIMIT {
                            samples.push(mask(&hit));
                        }
                    }
                }
                if match_count > 0 {
                    debug!("{} matches of {} in '{}'", match_count, entity_type, column);
                    findings.push(PiiFinding {
                        column: column.clone(),
                        entity_type: entity_type.to_string(),
                        match_count,
                        sample_values: samples,
                        confidence: match_count as f64 / texts.len() as f64,
                    });
                }
            }
        }

        Ok(PiiReport {
            findings,
            total_fields: batch.column_count(),
        })
    }
}

const COMPLETENESS_WEIGHT: f64 = 0.4;
const VALIDITY_WEIGHT: f64 = 0.3;
const CONSISTENCY_WEIGHT: f64 = 0.3;

/// Rule-based fallback validator
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedQualityValidator;

/// Linear-interpolation quantile of sorted values
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = (sorted.len() - 1) as f64 * q;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (pos - lower as f64)
}

/// Values outside `[q1 - 1.5 IQR, q3 + 1.5 IQR]`
fn iqr_outliers(values: &[f64]) -> usize {
    if values.len() < 4 {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let fence = 1.5 * (q3 - q1);
    values
        .iter()
        .filter(|v| **v < q1 - fence || **v > q3 + fence)
        .count()
}

enum FormatRule {
    Email,
    Timestamp,
}

fn format_rule(column: &str, dtype: ColumnType) -> Option<FormatRule> {
    let lower = column.to_lowercase();
    if lower.contains("email") {
        Some(FormatRule::Email)
    } else if dtype == ColumnType::Timestamp
        || lower.ends_with("_at")
        || lower.ends_with("date")
    {
        Some(FormatRule::Timestamp)
    } else {
        None
    }
}

fn ratio_score(bad: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        1.0 - bad as f64 / total as f64
    }
}

impl QualityValidator for RuleBasedQualityValidator {
    fn name(&self) -> &str {
        "rule_based"
    }

    fn check(&self, batch: &TabularBatch) -> Result<QualityReport> {
        let mut details = QualityDetails {
            row_count: batch.len(),
            column_count: batch.column_count(),
            total_cells: batch.len() * batch.column_count(),
            ..Default::default()
        };
        let mut checked = 0usize;
        let mut invalid = 0usize;
        let mut numeric_values = 0usize;
        let mut outliers = 0usize;

        for (column, dtype) in batch.infer_dtypes() {
            let values: Vec<&Value> = batch.column_values(&column).collect();
            details.null_cells += values.iter().filter(|v| v.is_null()).count();

            if let Some(rule) = format_rule(&column, dtype) {
                let mut bad = 0;
                for value in values.iter().filter(|v| !v.is_null()) {
                    checked += 1;
                    let ok = match (&rule, value) {
                        (FormatRule::Email, Value::String(s)) => EMAIL_STRICT.is_match(s),
                        (FormatRule::Timestamp, Value::String(s)) => parse_timestamp(s).is_some(),
                        _ => false,
                    };
                    if !ok {
                        bad += 1;
                    }
                }
                if bad > 0 {
                    details.invalid_values.insert(column.clone(), bad);
                    invalid += bad;
                }
            }

            if dtype.is_numeric() {
                let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
                numeric_values += numbers.len();
                let count = iqr_outliers(&numbers);
                if count > 0 {
                    details.outliers.insert(column.clone(), count);
                    outliers += count;
                }
            }
        }

        let completeness_score = ratio_score(details.null_cells, details.total_cells);
        let validity_score = ratio_score(invalid, checked);
        let consistency_score = ratio_score(outliers, numeric_values);
        let overall_score = COMPLETENESS_WEIGHT * completeness_score
            + VALIDITY_WEIGHT * validity_score
            + CONSISTENCY_WEIGHT * consistency_score;

        Ok(QualityReport {
            completeness_score,
            validity_score,
            consistency_score,
            overall_score,
            details,
        })
    }
}
