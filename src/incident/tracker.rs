//! Owns the incident state for the process and mirrors it into metrics.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use super::{
    incident_key, split_incident_key, IncidentFlags, IncidentState, IncidentStore, IncidentType,
    ResolvedIncident,
};
use crate::metrics::{catalog, MetricsSink, Observation, SeriesFamily, SeriesTracker};

const RESOLVED_EVENT_FAMILY: SeriesFamily = SeriesFamily {
    metrics: &[catalog::INCIDENT_RESOLVED_EVENT_DURATION_MS],
    scope_len: 2,
};

/// Incident lifecycle for every (sensor, network) pair.
pub struct IncidentTracker {
    store: IncidentStore,
    state: IncidentState,
    max_events_per_type: usize,
    sink: Arc<dyn MetricsSink>,
    series: SeriesTracker,
}

impl IncidentTracker {
    /// Load persisted state and replay its counters into the sink.
    pub fn new(store: IncidentStore, sink: Arc<dyn MetricsSink>, max_events_per_type: usize) -> Self {
        let state = store.load();

        let mut replayed = 0u64;
        for (key, per_type) in &state.counters {
            let (sensor, network) = split_incident_key(key);
            for (kind, total) in per_type {
                if *total > 0 {
                    sink.inc_counter_by(
                        catalog::INCIDENTS_RESOLVED_TOTAL,
                        &[sensor, network, kind.as_str()],
                        *total as f64,
                    );
                    replayed += total;
                }
            }
        }
        tracing::info!(
            "Incidents: loaded {} ({} resolved so far)",
            store.path().display(),
            replayed
        );

        Self {
            store,
            state,
            max_events_per_type,
            series: SeriesTracker::new(sink.clone()),
            sink,
        }
    }

    pub fn state(&self) -> &IncidentState {
        &self.state
    }

    /// Apply one evaluation for a network and publish the result.
    pub fn update(
        &mut self,
        sensor: &str,
        network: &str,
        flags: &IncidentFlags,
        now: DateTime<Utc>,
    ) -> Vec<(IncidentType, ResolvedIncident)> {
        let key = incident_key(sensor, network);
        let resolved = self.state.apply(&key, flags, now, self.max_events_per_type);

        for (kind, event) in &resolved {
            self.sink.inc_counter(
                catalog::INCIDENTS_RESOLVED_TOTAL,
                &[sensor, network, kind.as_str()],
            );
            tracing::info!(
                "Incident {} on {} resolved after {} ms",
                kind.as_str(),
                network,
                event.duration_ms
            );
        }

        for kind in IncidentType::ALL {
            let value = if flags.is_active(kind) { 1.0 } else { 0.0 };
            self.sink
                .set_gauge(catalog::INCIDENT_ACTIVE, &[sensor, network, kind.as_str()], value);
        }

        let observations = self
            .state
            .resolved_for(&key)
            .map(|(kind, event)| Observation {
                key: vec![
                    sensor.to_string(),
                    network.to_string(),
                    kind.as_str().to_string(),
                    event.start_ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    event.end_ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                ],
                values: vec![Some(event.duration_ms as f64)],
                seen: event.end_ts,
            })
            .collect();
        self.series
            .reconcile(&RESOLVED_EVENT_FAMILY, &[sensor, network], observations);

        resolved
    }

    /// Write the state file. Failures are logged; in-memory state is kept.
    pub fn persist(&self) {
        if let Err(e) = self.store.save(&self.state) {
            tracing::error!(
                "Incidents: failed to save {}: {}",
                self.store.path().display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::RecordingSink;
    use chrono::Duration;
    use tempfile::TempDir;

    fn flags(active: &[IncidentType]) -> IncidentFlags {
        let mut flags = IncidentFlags::default();
        for kind in active {
            flags.set(*kind, true);
        }
        flags
    }

    #[test]
    fn test_update_publishes_and_counts() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut tracker =
            IncidentTracker::new(IncidentStore::new(dir.path().join("i.json")), sink.clone(), 3);
        let jitter = IncidentType::HighJitter;
        let t0 = Utc::now();

        tracker.update("s", "lab", &flags(&[jitter]), t0);
        assert_eq!(
            sink.gauge(catalog::INCIDENT_ACTIVE, &["s", "lab", "high_jitter"]),
            Some(1.0)
        );

        let resolved = tracker.update("s", "lab", &flags(&[]), t0 + Duration::seconds(30));
        assert_eq!(resolved.len(), 1);
        assert_eq!(
            sink.gauge(catalog::INCIDENT_ACTIVE, &["s", "lab", "high_jitter"]),
            Some(0.0)
        );
        assert_eq!(
            sink.counter(catalog::INCIDENTS_RESOLVED_TOTAL, &["s", "lab", "high_jitter"]),
            1.0
        );
        let events = sink.series(catalog::INCIDENT_RESOLVED_EVENT_DURATION_MS);
        assert_eq!(events.len(), 1);
        assert_eq!(sink.gauge(catalog::INCIDENT_RESOLVED_EVENT_DURATION_MS, &crate::metrics::label_refs(&events[0])), Some(30_000.0));
    }

    #[test]
    fn test_evicted_events_leave_metrics() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut tracker =
            IncidentTracker::new(IncidentStore::new(dir.path().join("i.json")), sink.clone(), 2);
        let kind = IncidentType::DhcpSlow;
        let mut t = Utc::now();

        for _ in 0..4 {
            tracker.update("s", "lab", &flags(&[kind]), t);
            t += Duration::seconds(1);
            tracker.update("s", "lab", &flags(&[]), t);
            t += Duration::seconds(1);
        }

        assert_eq!(sink.series(catalog::INCIDENT_RESOLVED_EVENT_DURATION_MS).len(), 2);
        assert_eq!(sink.removals(catalog::INCIDENT_RESOLVED_EVENT_DURATION_MS).len(), 2);
    }

    #[test]
    fn test_counters_replayed_on_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("i.json");
        let t0 = Utc::now();

        {
            let sink = Arc::new(RecordingSink::default());
            let mut tracker = IncidentTracker::new(IncidentStore::new(&path), sink, 3);
            for i in 0..2 {
                let t = t0 + Duration::seconds(i * 10);
                tracker.update("s", "lab", &flags(&[IncidentType::WeakSignal]), t);
                tracker.update("s", "lab", &flags(&[]), t + Duration::seconds(5));
            }
            tracker.persist();
        }

        let sink = Arc::new(RecordingSink::default());
        let tracker = IncidentTracker::new(IncidentStore::new(&path), sink.clone(), 3);
        assert_eq!(
            sink.counter(catalog::INCIDENTS_RESOLVED_TOTAL, &["s", "lab", "weak_signal"]),
            2.0
        );
        assert_eq!(tracker.state().counters["s::lab"][&IncidentType::WeakSignal], 2);
    }
}
