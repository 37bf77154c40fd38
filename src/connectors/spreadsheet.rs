//! Spreadsheet Connector - range-addressed single fetch
//!
//! Reads either the Google Sheets values API or a local CSV export. The first
//! row of the addressed range is the header; cells are coerced to scalars.

use crate::batch::{coerce_cell, compare_values, Record, TabularBatch};
use crate::connectors::http::HttpSession;
use crate::connectors::{
    ConnectionDescriptor, ConnectorContext, CursorTracker, FetchRequest, SchemaMap, SourceConnector,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Url;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info};

lazy_static! {
    static ref CELL_REF: Regex = Regex::new(r"^([A-Za-z]*)(\d*)$").unwrap();
}

#[derive(Clone, Debug, PartialEq)]
pub enum SheetAuth {
    Bearer(String),
    ApiKey(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SpreadsheetBackend {
    GoogleSheets {
        base_url: String,
        spreadsheet_id: String,
        auth: SheetAuth,
    },
    LocalCsv {
        path: PathBuf,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpreadsheetConfig {
    pub backend: SpreadsheetBackend,
    pub default_range: Option<String>,
}

impl SpreadsheetConfig {
    pub fn from_descriptor(d: &ConnectionDescriptor) -> Result<Self> {
        let default_range = d.param_str("range").map(str::to_string);

        if let Some(path) = d.param_str("file_path") {
            return Ok(Self {
                backend: SpreadsheetBackend::LocalCsv { path: PathBuf::from(path) },
                default_range,
            });
        }

        let spreadsheet_id = d.require_param_str("spreadsheet_id")?.to_string();
        let creds = d.credentials();
        let auth = match (&creds.token, &creds.api_key) {
            (Some(token), _) => SheetAuth::Bearer(token.clone()),
            (None, Some(key)) => SheetAuth::ApiKey(key.clone()),
            (None, None) => return Err(d.missing("credentials.token or credentials.api_key")),
        };
        Ok(Self {
            backend: SpreadsheetBackend::GoogleSheets {
                base_url: d
                    .endpoint()
                    .unwrap_or("https://sheets.googleapis.com")
                    .to_string(),
                spreadsheet_id,
                auth,
            },
            default_range,
        })
    }
}

/// A1-notation range, zero-based and inclusive
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CellRange {
    pub sheet: Option<String>,
    pub first_col: usize,
    pub first_row: usize,
    pub last_col: Option<usize>,
    pub last_row: Option<usize>,
}

impl CellRange {
    /// Parse `Sheet1!A1:D20`, `A1:D20`, `A:C`, `2:10` or a bare sheet name
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let (sheet, cells) = match raw.rsplit_once('!') {
            Some((sheet, cells)) => (Some(sheet.trim_matches('\'').to_string()), cells),
            None if !raw.contains(':') && !raw.bytes().any(|b| b.is_ascii_digit()) => {
                (Some(raw.to_string()), "")
            }
            None => (None, raw),
        };
        let mut range = CellRange { sheet, ..Default::default() };
        if cells.is_empty() {
            return Ok(range);
        }

        let (start, end) = cells.split_once(':').unwrap_or((cells, cells));
        let (start_col, start_row) = parse_cell(start)?;
        let (end_col, end_row) = parse_cell(end)?;
        range.first_col = start_col.unwrap_or(0);
        range.first_row = start_row.unwrap_or(0);
        range.last_col = end_col;
        range.last_row = end_row;

        if range.last_col.is_some_and(|c| c < range.first_col)
            || range.last_row.is_some_and(|r| r < range.first_row)
        {
            return Err(SyncError::Validation(format!("Range '{}' is inverted", raw)));
        }
        Ok(range)
    }

    /// Cut a full grid down to this range
    pub fn apply(&self, grid: Vec<Vec<String>>) -> Vec<Vec<String>> {
        let row_take = self.last_row.map(|r| r + 1 - self.first_row).unwrap_or(usize::MAX);
        grid.into_iter()
            .skip(self.first_row)
            .take(row_take)
            .map(|row| {
                let col_take = self.last_col.map(|c| c + 1 - self.first_col).unwrap_or(usize::MAX);
                row.into_iter().skip(self.first_col).take(col_take).collect()
            })
            .collect()
    }
}

fn parse_cell(cell: &str) -> Result<(Option<usize>, Option<usize>)> {
    let caps = CELL_REF
        .captures(cell.trim())
        .ok_or_else(|| SyncError::Validation(format!("Invalid cell reference '{}'", cell)))?;
    let letters = &caps[1];
    let digits = &caps[2];

    let col = if letters.is_empty() {
        None
    } else {
        let n = letters
            .to_ascii_uppercase()
            .bytes()
            .try_fold(0usize, |acc, b| {
                acc.checked_mul(26)?.checked_add((b - b'A' + 1) as usize)
            })
            .ok_or_else(|| SyncError::Validation(format!("Column out of range in '{}'", cell)))?;
        Some(n - 1)
    };
    let row = if digits.is_empty() {
        None
    } else {
        let n: usize = digits
            .parse()
            .map_err(|_| SyncError::Validation(format!("Invalid row in '{}'", cell)))?;
        if n == 0 {
            return Err(SyncError::Validation(format!("Rows are 1-based in '{}'", cell)));
        }
        Some(n - 1)
    };
    Ok((col, row))
}

/// First row is the header; short rows are padded with nulls
fn grid_to_batch(grid: Vec<Vec<String>>) -> TabularBatch {
    let mut rows = grid.into_iter();
    let Some(header) = rows.next() else {
        return TabularBatch::empty();
    };

    let mut seen = HashSet::new();
    let columns: Vec<String> = header
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let base = match name.trim() {
                "" => format!("column_{}", i + 1),
                trimmed => trimmed.to_string(),
            };
            let mut candidate = base.clone();
            let mut n = 2;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{}_{}", base, n);
                n += 1;
            }
            candidate
        })
        .collect();

    let records = rows
        .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .map(|row| {
            let mut record = Record::new();
            for (i, column) in columns.iter().enumerate() {
                let value = row.get(i).map(|c| coerce_cell(c)).unwrap_or(Value::Null);
                record.insert(column.clone(), value);
            }
            record
        })
        .collect();

    TabularBatch::new(columns, records)
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub struct SpreadsheetConnector {
    descriptor: ConnectionDescriptor,
    config: SpreadsheetConfig,
    session: HttpSession,
    cursor: CursorTracker,
}

impl SpreadsheetConnector {
    pub fn new(descriptor: ConnectionDescriptor, context: &ConnectorContext) -> Result<Self> {
        let config = SpreadsheetConfig::from_descriptor(&descriptor)?;
        let session = HttpSession::new(context)?;
        Ok(Self {
            descriptor,
            config,
            session,
            cursor: CursorTracker::default(),
        })
    }

    fn resolve_range<'a>(&'a self, target: &'a str) -> &'a str {
        if target.trim().is_empty() {
            self.config.default_range.as_deref().unwrap_or("")
        } else {
            target
        }
    }

    async fn fetch_grid(&self, range: &str) -> Result<Vec<Vec<String>>> {
        match &self.config.backend {
            SpreadsheetBackend::LocalCsv { path } => {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        SyncError::NotFound(format!("CSV file {}", path.display()))
                    } else {
                        SyncError::Io(e)
                    }
                })?;
                let mut reader = csv::ReaderBuilder::new()
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(content.as_bytes());
                let mut grid = Vec::new();
                for record in reader.records() {
                    grid.push(record?.iter().map(str::to_string).collect());
                }
                let parsed = CellRange::parse(range)?;
                debug!("Read {} CSV rows from {}", grid.len(), path.display());
                Ok(parsed.apply(grid))
            }
            SpreadsheetBackend::GoogleSheets {
                base_url,
                spreadsheet_id,
                auth,
            } => {
                CellRange::parse(range)?;
                if range.trim().is_empty() {
                    return Err(SyncError::Validation(
                        "Google Sheets fetch requires a range".to_string(),
                    ));
                }
                let mut url = Url::parse(base_url)
                    .map_err(|e| SyncError::Configuration(format!("Invalid endpoint: {}", e)))?;
                url.path_segments_mut()
                    .map_err(|_| SyncError::Configuration("Endpoint cannot be a base URL".to_string()))?
                    .extend(["v4", "spreadsheets", spreadsheet_id.as_str(), "values", range]);

                let body = self
                    .session
                    .get_json("sheets get_values", |c| match auth {
                        SheetAuth::Bearer(token) => c.get(url.clone()).bearer_auth(token),
                        SheetAuth::ApiKey(key) => c.get(url.clone()).query(&[("key", key)]),
                    })
                    .await?;

                let values = match body.get("values") {
                    None | Some(Value::Null) => return Ok(Vec::new()),
                    Some(Value::Array(rows)) => rows,
                    Some(_) => {
                        return Err(SyncError::Validation("Sheet values are not an array".to_string()))
                    }
                };
                Ok(values
                    .iter()
                    .map(|row| match row {
                        Value::Array(cells) => cells.iter().map(cell_text).collect(),
                        other => vec![cell_text(other)],
                    })
                    .collect())
            }
        }
    }
}

#[async_trait]
impl SourceConnector for SpreadsheetConnector {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn test_connection(&mut self) -> Result<bool> {
        match &self.config.backend {
            SpreadsheetBackend::LocalCsv { path } => {
                tokio::fs::metadata(path)
                    .await
                    .map_err(|e| SyncError::Connection(format!("{}: {}", path.display(), e)))?;
                Ok(true)
            }
            SpreadsheetBackend::GoogleSheets {
                base_url,
                spreadsheet_id,
                auth,
            } => {
                let url = format!("{}/v4/spreadsheets/{}", base_url, spreadsheet_id);
                self.session
                    .get_json("sheets test_connection", |c| {
                        let rb = c.get(&url).query(&[("fields", "spreadsheetId")]);
                        match auth {
                            SheetAuth::Bearer(token) => rb.bearer_auth(token),
                            SheetAuth::ApiKey(key) => rb.query(&[("key", key)]),
                        }
                    })
                    .await?;
                Ok(true)
            }
        }
    }

    async fn get_data(&mut self, request: &FetchRequest) -> Result<TabularBatch> {
        let range = self.resolve_range(&request.target).to_string();
        let mut batch = grid_to_batch(self.fetch_grid(&range).await?);

        if !request.filters.is_empty() {
            batch.rows.retain(|row| {
                request
                    .filters
                    .iter()
                    .all(|(column, expected)| row.get(column).unwrap_or(&Value::Null) == expected)
            });
        }
        if let (Some(field), Some(bound)) = (request.incremental_field(), self.cursor.lower_bound(request)) {
            if batch.has_column(field) {
                batch.rows.retain(|row| {
                    row.get(field)
                        .and_then(|v| compare_values(v, bound))
                        .is_some_and(|o| o == Ordering::Greater)
                });
            }
        }

        self.cursor.observe(request, &batch);
        info!(
            "Read {} rows from range '{}' ({})",
            batch.len(),
            range,
            self.descriptor.source_name()
        );
        Ok(batch)
    }

    async fn get_schema(&mut self, table: &str) -> Result<SchemaMap> {
        let range = self.resolve_range(table).to_string();
        let batch = grid_to_batch(self.fetch_grid(&range).await?);
        Ok(batch
            .infer_dtypes()
            .into_iter()
            .map(|(name, dtype)| (name, dtype.to_string()))
            .collect())
    }

    async fn get_row_count(&mut self, table: &str, predicate: Option<&str>) -> Result<u64> {
        if predicate.is_some() {
            return Err(SyncError::Validation(
                "Spreadsheet sources do not support row-count predicates".to_string(),
            ));
        }
        let range = self.resolve_range(table).to_string();
        Ok(grid_to_batch(self.fetch_grid(&range).await?).len() as u64)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{Credentials, DescriptorSpec};
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;
    use std::thread;
    use tiny_http::{Response as TinyResponse, Server};

    fn csv_connector(content: &str) -> (tempfile::NamedTempFile, SpreadsheetConnector) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let mut params = HashMap::new();
        params.insert("file_path".to_string(), json!(file.path().to_str().unwrap()));
        let descriptor = ConnectionDescriptor::new(DescriptorSpec {
            source_type: "spreadsheet".into(),
            source_name: "budget".into(),
            params,
            ..Default::default()
        })
        .unwrap();
        let connector = SpreadsheetConnector::new(descriptor, &ConnectorContext::default()).unwrap();
        (file, connector)
    }

    #[test]
    fn test_parse_a1_ranges() {
        let r = CellRange::parse("Sheet1!B2:D20").unwrap();
        assert_eq!(r.sheet.as_deref(), Some("Sheet1"));
        assert_eq!((r.first_col, r.first_row, r.last_col, r.last_row), (1, 1, Some(3), Some(19)));

        let r = CellRange::parse("A:C").unwrap();
        assert_eq!((r.first_col, r.first_row, r.last_col, r.last_row), (0, 0, Some(2), None));

        assert_eq!(CellRange::parse("AA1").unwrap().first_col, 26);
        assert_eq!(CellRange::parse("Budget").unwrap().sheet.as_deref(), Some("Budget"));
        assert!(CellRange::parse("D1:A1").is_err());
        let long = format!("{}1:B2", "Z".repeat(40));
        assert!(matches!(CellRange::parse(&long), Err(SyncError::Validation(_))));
        assert!(CellRange::parse("A0").is_err());
    }

    #[test]
    fn test_header_dedup_and_padding() {
        let grid = vec![
            vec!["id".into(), "id".into(), "".into()],
            vec!["1".into(), "x".into()],
            vec!["".into(), "".into(), "".into()],
        ];
        let batch = grid_to_batch(grid);
        assert_eq!(batch.columns, vec!["id", "id_2", "column_3"]);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.rows[0]["column_3"], Value::Null);
        assert_eq!(batch.rows[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_csv_range_and_incremental() {
        let (_file, mut connector) = csv_connector(
            "skip,skip,skip\nid,amount,updated\n1,10.5,2024-01-01\n2,20,2024-02-01\n3,30,2024-03-01\n",
        );
        let request = FetchRequest::incremental("A2:C5", "updated");
        connector.seed_cursor(Some(json!("2024-01-15")));
        let batch = connector.get_data(&request).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.rows[0]["amount"], json!(20));
        assert_eq!(connector.last_cursor(), Some(&json!("2024-03-01")));

        let count = connector.get_row_count("A2:C5", None).await.unwrap();
        assert_eq!(count, 3);
        assert!(connector.get_row_count("A2:C5", Some("id > 1")).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_csv_is_not_found() {
        let (file, mut connector) = csv_connector("a\n1\n");
        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
        let err = connector.get_data(&FetchRequest::full("")).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_google_sheets_values() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let handle = thread::spawn(move || {
            let request = server.recv().unwrap();
            let url = request.url().to_string();
            let auth = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("Authorization"))
                .map(|h| h.value.to_string());
            let body = json!({"range": "Sheet1!A1:B3", "values": [["name", "score"], ["ann", "7"], ["bob"]]});
            request.respond(TinyResponse::from_string(body.to_string())).unwrap();
            (url, auth)
        });

        let mut params = HashMap::new();
        params.insert("spreadsheet_id".to_string(), json!("abc123"));
        let descriptor = ConnectionDescriptor::new(DescriptorSpec {
            source_type: "google_sheets".into(),
            source_name: "scores".into(),
            endpoint: Some(format!("http://{}", addr)),
            credentials: Credentials {
                token: Some("tok".into()),
                ..Default::default()
            },
            params,
            ..Default::default()
        })
        .unwrap();
        let mut connector = SpreadsheetConnector::new(descriptor, &ConnectorContext::default()).unwrap();
        let batch = connector.get_data(&FetchRequest::full("Sheet1!A1:B3")).await.unwrap();
        let (url, auth) = handle.join().unwrap();

        assert!(url.starts_with("/v4/spreadsheets/abc123/values/Sheet1"));
        assert_eq!(auth.as_deref(), Some("Bearer tok"));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.rows[0]["score"], json!(7));
        assert_eq!(batch.rows[1]["score"], Value::Null);
    }
}
