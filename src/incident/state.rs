//! Persisted incident state and its transition function.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{IncidentFlags, IncidentType};

/// Incident persistence error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Key under which a (sensor, network) pair is stored.
pub fn incident_key(sensor: &str, network: &str) -> String {
    format!("{}::{}", sensor, network)
}

/// Inverse of [`incident_key`]. A key without separator is all sensor.
pub fn split_incident_key(key: &str) -> (&str, &str) {
    key.split_once("::").unwrap_or((key, ""))
}

/// An incident that is currently open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveIncident {
    pub start_ts: DateTime<Utc>,
}

/// A closed incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedIncident {
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub duration_ms: i64,
}

/// All incident state, keyed by [`incident_key`] and then incident type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentState {
    #[serde(default)]
    pub active: BTreeMap<String, BTreeMap<IncidentType, ActiveIncident>>,
    #[serde(default)]
    pub resolved: BTreeMap<String, BTreeMap<IncidentType, VecDeque<ResolvedIncident>>>,
    #[serde(default)]
    pub counters: BTreeMap<String, BTreeMap<IncidentType, u64>>,
}

impl IncidentState {
    /// Apply one evaluation for `key` at `now`.
    ///
    /// Rising flags open an active entry, falling flags close it into the
    /// bounded resolved history and bump the counter. Returns the events
    /// resolved by this call.
    pub fn apply(
        &mut self,
        key: &str,
        flags: &IncidentFlags,
        now: DateTime<Utc>,
        max_events_per_type: usize,
    ) -> Vec<(IncidentType, ResolvedIncident)> {
        let active = self.active.entry(key.to_string()).or_default();
        let resolved = self.resolved.entry(key.to_string()).or_default();
        let counters = self.counters.entry(key.to_string()).or_default();
        let mut newly_resolved = Vec::new();

        for kind in IncidentType::ALL {
            if flags.is_active(kind) {
                active
                    .entry(kind)
                    .or_insert_with(|| ActiveIncident { start_ts: now });
                continue;
            }

            let Some(open) = active.remove(&kind) else {
                continue;
            };
            let event = ResolvedIncident {
                start_ts: open.start_ts,
                end_ts: now,
                duration_ms: (now - open.start_ts).num_milliseconds(),
            };
            let events = resolved.entry(kind).or_default();
            events.push_back(event.clone());
            while events.len() > max_events_per_type {
                events.pop_front();
            }
            *counters.entry(kind).or_insert(0) += 1;
            newly_resolved.push((kind, event));
        }

        newly_resolved
    }

    /// Resolved history for `key`, empty if none.
    pub fn resolved_for(&self, key: &str) -> impl Iterator<Item = (IncidentType, &ResolvedIncident)> {
        self.resolved
            .get(key)
            .into_iter()
            .flat_map(|per_type| per_type.iter())
            .flat_map(|(kind, events)| events.iter().map(move |e| (*kind, e)))
    }
}

/// JSON file holding the [`IncidentState`].
#[derive(Debug, Clone)]
pub struct IncidentStore {
    path: PathBuf,
}

impl IncidentStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state file.
    pub fn read(&self) -> Result<IncidentState, StoreError> {
        let text = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load the state, falling back to an empty state if the file is missing or unreadable.
    pub fn load(&self) -> IncidentState {
        match self.read() {
            Ok(state) => state,
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => IncidentState::default(),
            Err(e) => {
                tracing::warn!(
                    "Incidents: ignoring unreadable state {}: {}",
                    self.path.display(),
                    e
                );
                IncidentState::default()
            }
        }
    }

    /// Overwrite the state file. Writes a sibling temp file and renames it into place.
    pub fn save(&self, state: &IncidentState) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
