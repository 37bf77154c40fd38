//! Incremental State Manager - per-source, per-stream sync cursors
//!
//! Updates for one source are serialized behind that source's mutex; different
//! sources proceed in parallel. `total_records_synced` is always recomputed as
//! the sum of the source's stream counts.

use crate::batch::compare_values;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    FullRefresh,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub stream_name: String,
    #[serde(default)]
    pub cursor_field: Option<String>,
    #[serde(default)]
    pub cursor_value: Option<Value>,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub records_synced: u64,
}

impl StreamState {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            cursor_field: None,
            cursor_value: None,
            sync_mode: SyncMode::default(),
            last_synced_at: None,
            records_synced: 0,
        }
    }

    fn reset(&mut self) {
        self.cursor_value = None;
        self.records_synced = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    pub source_id: String,
    pub source_name: String,
    #[serde(default)]
    pub streams: BTreeMap<String, StreamState>,
    #[serde(default)]
    pub total_records_synced: u64,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SourceState {
    pub fn new(source_id: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            source_name: source_name.into(),
            streams: BTreeMap::new(),
            total_records_synced: 0,
            last_synced_at: None,
        }
    }

    fn recompute_total(&mut self) {
        self.total_records_synced = self.streams.values().map(|s| s.records_synced).sum();
    }
}

/// Optional fields of one `update_stream_state` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamUpdate {
    pub cursor_field: Option<String>,
    pub cursor_value: Option<Value>,
    pub sync_mode: Option<SyncMode>,
    /// Records added by this sync (cumulative counts are incremented)
    pub records_synced: Option<u64>,
}

impl StreamUpdate {
    pub fn incremental(cursor_field: impl Into<String>, cursor_value: Option<Value>, records: u64) -> Self {
        Self {
            cursor_field: Some(cursor_field.into()),
            cursor_value,
            sync_mode: Some(SyncMode::Incremental),
            records_synced: Some(records),
        }
    }

    pub fn full_refresh(records: u64) -> Self {
        Self {
            sync_mode: Some(SyncMode::FullRefresh),
            records_synced: Some(records),
            ..Default::default()
        }
    }
}

/// Serialized form of the whole manager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub sources: BTreeMap<String, SourceState>,
}

type SourceSlot = Arc<Mutex<SourceState>>;

#[derive(Debug, Default)]
pub struct IncrementalStateManager {
    sources: RwLock<HashMap<String, SourceSlot>>,
}

fn lock_source(slot: &SourceSlot) -> MutexGuard<'_, SourceState> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl IncrementalStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, source_id: &str) -> Option<SourceSlot> {
        let sources = self.sources.read().unwrap_or_else(|p| p.into_inner());
        sources.get(source_id).cloned()
    }

    fn require_slot(&self, source_id: &str) -> Result<SourceSlot> {
        self.slot(source_id)
            .ok_or_else(|| SyncError::NotFound(format!("Source '{}' not found", source_id)))
    }

    /// Register a source. Fails if the source id already exists.
    pub fn create_source_state(
        &self,
        source_id: &str,
        source_name: &str,
        streams: Option<&[String]>,
    ) -> Result<SourceState> {
        if source_id.trim().is_empty() {
            return Err(SyncError::Validation("source_id is required".to_string()));
        }
        let mut sources = self.sources.write().unwrap_or_else(|p| p.into_inner());
        if sources.contains_key(source_id) {
            return Err(SyncError::Validation(format!(
                "Source state '{}' already exists",
                source_id
            )));
        }

        let mut state = SourceState::new(source_id, source_name);
        for stream in streams.unwrap_or_default() {
            state.streams.insert(stream.clone(), StreamState::new(stream.as_str()));
        }
        sources.insert(source_id.to_string(), Arc::new(Mutex::new(state.clone())));
        info!("Created state for source '{}' ({} streams)", source_id, state.streams.len());
        Ok(state)
    }

    /// Get-or-create, for orchestrated runs that register lazily
    pub fn ensure_source_state(&self, source_id: &str, source_name: &str) -> Result<SourceState> {
        if let Some(slot) = self.slot(source_id) {
            return Ok(lock_source(&slot).clone());
        }
        match self.create_source_state(source_id, source_name, None) {
            Ok(state) => Ok(state),
            // lost a creation race; the other caller's state wins
            Err(SyncError::Validation(_)) => Ok(lock_source(&self.require_slot(source_id)?).clone()),
            Err(e) => Err(e),
        }
    }

    /// Apply one sync's outcome to a stream, creating the stream entry on
    /// first reference. Cursor regressions are ignored.
    pub fn update_stream_state(
        &self,
        source_id: &str,
        stream: &str,
        update: StreamUpdate,
    ) -> Result<StreamState> {
        let slot = self.require_slot(source_id)?;
        let mut source = lock_source(&slot);
        let now = Utc::now();

        let entry = source
            .streams
            .entry(stream.to_string())
            .or_insert_with(|| StreamState::new(stream));

        if let Some(field) = update.cursor_field {
            entry.cursor_field = Some(field);
        }
        if let Some(mode) = update.sync_mode {
            entry.sync_mode = mode;
        }
        if let Some(new) = update.cursor_value.filter(|v| !v.is_null()) {
            let regressed = entry
                .cursor_value
                .as_ref()
                .is_some_and(|current| compare_values(&new, current) == Some(Ordering::Less));
            if regressed {
                warn!(
                    "Ignoring cursor regression on {}/{}: {} < {:?}",
                    source_id, stream, new, entry.cursor_value
                );
            } else {
                entry.cursor_value = Some(new);
            }
        }
        if let Some(records) = update.records_synced {
            entry.records_synced = entry.records_synced.saturating_add(records);
        }
        entry.last_synced_at = Some(now);
        let updated = entry.clone();

        source.last_synced_at = Some(now);
        source.recompute_total();
        debug!(
            "Stream {}/{} now at {:?} ({} records)",
            source_id, stream, updated.cursor_value, updated.records_synced
        );
        Ok(updated)
    }

    /// Zero every stream's cursor and count, keeping stream identities
    pub fn reset_source_state(&self, source_id: &str) -> Result<()> {
        let slot = self.require_slot(source_id)?;
        let mut source = lock_source(&slot);
        source.streams.values_mut().for_each(StreamState::reset);
        source.recompute_total();
        info!("Reset all streams of source '{}'", source_id);
        Ok(())
    }

    pub fn reset_stream_state(&self, source_id: &str, stream: &str) -> Result<()> {
        let slot = self.require_slot(source_id)?;
        let mut source = lock_source(&slot);
        source
            .streams
            .get_mut(stream)
            .ok_or_else(|| {
                SyncError::NotFound(format!("Stream '{}' not found in source '{}'", stream, source_id))
            })?
            .reset();
        source.recompute_total();
        info!("Reset stream {}/{}", source_id, stream);
        Ok(())
    }

    pub fn get_source_state(&self, source_id: &str) -> Option<SourceState> {
        self.slot(source_id).map(|slot| lock_source(&slot).clone())
    }

    pub fn get_stream_state(&self, source_id: &str, stream: &str) -> Option<StreamState> {
        let slot = self.slot(source_id)?;
        let source = lock_source(&slot);
        source.streams.get(stream).cloned()
    }

    pub fn list_sources(&self) -> Vec<String> {
        let sources = self.sources.read().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<String> = sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn delete_source_state(&self, source_id: &str) -> bool {
        let mut sources = self.sources.write().unwrap_or_else(|p| p.into_inner());
        sources.remove(source_id).is_some()
    }

    pub fn export_state(&self) -> StateDocument {
        let sources = self.sources.read().unwrap_or_else(|p| p.into_inner());
        StateDocument {
            sources: sources
                .iter()
                .map(|(id, slot)| (id.clone(), lock_source(slot).clone()))
                .collect(),
        }
    }

    /// Replace all state with `document`
    pub fn import_state(&self, document: StateDocument) {
        let imported: HashMap<String, SourceSlot> = document
            .sources
            .into_iter()
            .map(|(id, mut state)| {
                state.recompute_total();
                (id, Arc::new(Mutex::new(state)))
            })
            .collect();
        let mut sources = self.sources.write().unwrap_or_else(|p| p.into_inner());
        info!("Imported state for {} sources", imported.len());
        *sources = imported;
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_state())?)
    }

    pub fn import_json(&self, blob: &str) -> Result<()> {
        let document: StateDocument = serde_json::from_str(blob)?;
        self.import_state(document);
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, self.export_json()?)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved sync state to {}", path.display());
        Ok(())
    }

    /// Load a manager from `path`; a missing file yields an empty manager
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let manager = Self::new();
        if path.exists() {
            let blob = std::fs::read_to_string(path)?;
            manager.import_json(&blob)?;
        } else {
            debug!("No state file at {}, starting empty", path.display());
        }
        Ok(manager)
    }
}
