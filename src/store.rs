//! Bounded Data Store - in-memory cache of ingested batches with parquet spill
//!
//! The in-memory tier is capped by entry count. When the cap is exceeded the
//! entries with the oldest `created_at` lose their payload; metadata and the
//! on-disk snapshot survive until `delete`.

use crate::batch::TabularBatch;
use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Metadata kept for every stored batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDataset {
    pub dataset_id: String,
    pub run_id: String,
    pub name: String,
    pub row_count: usize,
    pub column_count: usize,
    pub columns: Vec<String>,
    pub dtypes: BTreeMap<String, String>,
    /// Columns spilled as JSON text
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_columns: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub max_in_memory: usize,
    pub persist: bool,
}

impl StoreConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            max_in_memory: config.max_in_memory_datasets,
            persist: config.persist_datasets,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub resident: usize,
    pub resident_bytes: u64,
}

struct Entry {
    metadata: StoredDataset,
    /// Tie-break for equal `created_at` values
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    resident: HashMap<String, Arc<TabularBatch>>,
    next_seq: u64,
}

pub struct BoundedDataStore {
    config: StoreConfig,
    inner: Mutex<Inner>,
}

pub fn dataset_id_for_run(run_id: &str) -> String {
    format!("ds_{}", run_id)
}

impl BoundedDataStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        if config.max_in_memory == 0 {
            return Err(SyncError::Configuration(
                "Data store needs room for at least one dataset".to_string(),
            ));
        }
        Ok(Self {
            config,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `batch` for `run_id`, replacing any previous entry for that run
    pub fn store(&self, run_id: &str, name: &str, batch: TabularBatch) -> Result<StoredDataset> {
        self.store_shared(run_id, name, batch).map(|(metadata, _)| metadata)
    }

    /// Like [`Self::store`], also handing back the payload that was inserted.
    /// The handle stays valid even if a concurrent store evicts the entry.
    pub fn store_shared(
        &self,
        run_id: &str,
        name: &str,
        batch: TabularBatch,
    ) -> Result<(StoredDataset, Arc<TabularBatch>)> {
        let dataset_id = dataset_id_for_run(run_id);
        let json_columns = batch.json_encoded_columns();
        let storage_path = if self.config.persist {
            self.spill(&dataset_id, &batch)?
        } else {
            None
        };

        let metadata = StoredDataset {
            dataset_id: dataset_id.clone(),
            run_id: run_id.to_string(),
            name: name.to_string(),
            row_count: batch.len(),
            column_count: batch.column_count(),
            columns: batch.columns.clone(),
            dtypes: batch
                .infer_dtypes()
                .into_iter()
                .map(|(column, dtype)| (column, dtype.to_string()))
                .collect(),
            json_columns,
            created_at: Utc::now(),
            storage_path,
            size_bytes: batch.estimated_size_bytes(),
        };

        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            dataset_id.clone(),
            Entry {
                metadata: metadata.clone(),
                seq,
            },
        );
        let batch = Arc::new(batch);
        inner.resident.insert(dataset_id.clone(), batch.clone());
        self.evict_over_bound(&mut inner, &dataset_id);
        drop(inner);

        info!(
            "Stored dataset {} ({} rows x {} cols, ~{} bytes)",
            dataset_id, metadata.row_count, metadata.column_count, metadata.size_bytes
        );
        Ok((metadata, batch))
    }

    /// Resident payload, or a transparent reload from the parquet snapshot
    pub fn get(&self, dataset_id: &str) -> Result<Option<Arc<TabularBatch>>> {
        let (path, columns, json_columns) = {
            let inner = self.lock();
            if let Some(batch) = inner.resident.get(dataset_id) {
                return Ok(Some(batch.clone()));
            }
            match inner.entries.get(dataset_id) {
                Some(Entry {
                    metadata:
                        StoredDataset {
                            storage_path: Some(path),
                            columns,
                            json_columns,
                            ..
                        },
                    ..
                }) => (path.clone(), columns.clone(), json_columns.clone()),
                Some(_) => {
                    warn!("Dataset {} was evicted and has no snapshot", dataset_id);
                    return Ok(None);
                }
                None => return Ok(None),
            }
        };

        debug!("Reloading dataset {} from {}", dataset_id, path.display());
        let batch = Arc::new(read_snapshot(&path, &columns, &json_columns)?);

        let mut inner = self.lock();
        if !inner.entries.contains_key(dataset_id) {
            // deleted while we were reading
            return Ok(None);
        }
        let batch = inner
            .resident
            .entry(dataset_id.to_string())
            .or_insert(batch)
            .clone();
        self.evict_over_bound(&mut inner, dataset_id);
        Ok(Some(batch))
    }

    pub fn get_metadata(&self, dataset_id: &str) -> Option<StoredDataset> {
        self.lock().entries.get(dataset_id).map(|e| e.metadata.clone())
    }

    /// All metadata, oldest first
    pub fn list(&self) -> Vec<StoredDataset> {
        let inner = self.lock();
        let mut entries: Vec<&Entry> = inner.entries.values().collect();
        entries.sort_by_key(|e| (e.metadata.created_at, e.seq));
        entries.into_iter().map(|e| e.metadata.clone()).collect()
    }

    /// Ids whose payload is in memory, oldest first
    pub fn resident_ids(&self) -> Vec<String> {
        let inner = self.lock();
        let mut ids: Vec<(DateTime<Utc>, u64, String)> = inner
            .resident
            .keys()
            .filter_map(|id| {
                inner
                    .entries
                    .get(id)
                    .map(|e| (e.metadata.created_at, e.seq, id.clone()))
            })
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, _, id)| id).collect()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.lock();
        StoreStats {
            entries: inner.entries.len(),
            resident: inner.resident.len(),
            resident_bytes: inner
                .resident
                .keys()
                .filter_map(|id| inner.entries.get(id))
                .map(|e| e.metadata.size_bytes)
                .sum(),
        }
    }

    /// Remove metadata, payload and snapshot. Returns whether anything existed.
    pub fn delete(&self, dataset_id: &str) -> Result<bool> {
        let removed = {
            let mut inner = self.lock();
            inner.resident.remove(dataset_id);
            inner.entries.remove(dataset_id)
        };
        let Some(entry) = removed else {
            return Ok(false);
        };
        if let Some(path) = entry.metadata.storage_path {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!("Deleted dataset {}", dataset_id);
        Ok(true)
    }

    /// Drop payloads, oldest-created first, until the bound holds. `keep` is
    /// never evicted.
    fn evict_over_bound(&self, inner: &mut Inner, keep: &str) {
        while inner.resident.len() > self.config.max_in_memory {
            let victim = inner
                .resident
                .keys()
                .filter(|id| id.as_str() != keep)
                .filter_map(|id| inner.entries.get(id).map(|e| ((e.metadata.created_at, e.seq), id)))
                .min_by_key(|(order, _)| *order)
                .map(|(_, id)| id.clone());
            let Some(victim) = victim else {
                break;
            };
            inner.resident.remove(&victim);
            debug!("Evicted dataset {} from memory", victim);
        }
    }

    fn spill(&self, dataset_id: &str, batch: &TabularBatch) -> Result<Option<PathBuf>> {
        if batch.column_count() == 0 {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.config.data_dir)?;
        let path = self.config.data_dir.join(format!("{}.parquet", dataset_id));
        let mut df = batch.to_dataframe()?;
        let mut file = File::create(&path)?;
        ParquetWriter::new(&mut file).finish(&mut df)?;
        debug!("Spilled {} to {}", dataset_id, path.display());
        Ok(Some(path))
    }
}

fn read_snapshot(path: &Path, columns: &[String], json_columns: &[String]) -> Result<TabularBatch> {
    let file = File::open(path)
        .map_err(|e| SyncError::NotFound(format!("Snapshot {}: {}", path.display(), e)))?;
    let df = ParquetReader::new(file).finish()?;
    TabularBatch::from_dataframe(&df, Some(columns), json_columns)
}
