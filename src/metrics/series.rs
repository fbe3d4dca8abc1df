//! Bookkeeping for label-keyed series whose identity changes over time.
//!
//! Two policies are supported:
//!
//! - **Singleton replace**: a fact with exactly one current label tuple per
//!   identity (the associated BSSID, the running test). Publishing a new
//!   tuple first removes the previous one.
//! - **Observed-set reconciliation**: a family of series keyed by observed
//!   entities (access points, resolved incidents). Each update publishes the
//!   current set and removes tracked keys of the same scope that were not
//!   observed; [`SeriesTracker::expire`] additionally drops keys older than
//!   a TTL regardless of scope.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::{label_refs, MetricsSink, SeriesKey};

/// A group of metrics sharing one label set, reconciled together.
#[derive(Debug, Clone, Copy)]
pub struct SeriesFamily {
    /// Gauges published for every key, in the order of [`Observation::values`].
    pub metrics: &'static [&'static str],
    /// Number of leading labels that form the reconciliation scope.
    pub scope_len: usize,
}

impl SeriesFamily {
    fn id(&self) -> &'static str {
        self.metrics[0]
    }
}

/// One entity observed in the current update.
#[derive(Debug, Clone)]
pub struct Observation {
    pub key: SeriesKey,
    /// One value per metric of the family. `None` leaves that gauge unset.
    pub values: Vec<Option<f64>>,
    pub seen: DateTime<Utc>,
}

/// Tracks published series so stale ones can be removed from the sink.
pub struct SeriesTracker {
    sink: Arc<dyn MetricsSink>,
    singletons: HashMap<(&'static str, String), SeriesKey>,
    observed: HashMap<&'static str, HashMap<SeriesKey, DateTime<Utc>>>,
}

impl SeriesTracker {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink,
            singletons: HashMap::new(),
            observed: HashMap::new(),
        }
    }

    pub fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }

    // ------------------------------------------------------------------
    // Singleton replace
    // ------------------------------------------------------------------

    /// Publish `labels` as the only series of `metric` for `identity`.
    pub fn publish_singleton(
        &mut self,
        metric: &'static str,
        identity: &str,
        labels: SeriesKey,
        value: f64,
    ) {
        let slot = (metric, identity.to_string());
        if let Some(previous) = self.singletons.get(&slot) {
            if *previous != labels {
                self.sink.remove_series(metric, &label_refs(previous));
                tracing::debug!("Series: replaced {} for {}", metric, identity);
            }
        }
        self.sink.set_gauge(metric, &label_refs(&labels), value);
        self.singletons.insert(slot, labels);
    }

    /// Remove the remembered series of `metric` for `identity`, if any.
    pub fn clear_singleton(&mut self, metric: &'static str, identity: &str) {
        if let Some(previous) = self.singletons.remove(&(metric, identity.to_string())) {
            self.sink.remove_series(metric, &label_refs(&previous));
        }
    }

    // ------------------------------------------------------------------
    // Observed-set reconciliation
    // ------------------------------------------------------------------

    /// Publish `observations` and drop every tracked key in `scope` that is absent.
    ///
    /// Returns the number of series keys removed.
    pub fn reconcile(
        &mut self,
        family: &SeriesFamily,
        scope: &[&str],
        observations: Vec<Observation>,
    ) -> usize {
        let mut current: HashSet<SeriesKey> = HashSet::with_capacity(observations.len());

        for obs in observations {
            let labels = label_refs(&obs.key);
            for (metric, value) in family.metrics.iter().zip(&obs.values) {
                if let Some(value) = value {
                    self.sink.set_gauge(metric, &labels, *value);
                }
            }
            self.observed
                .entry(family.id())
                .or_default()
                .insert(obs.key.clone(), obs.seen);
            current.insert(obs.key);
        }

        let stale: Vec<SeriesKey> = self
            .tracked_keys(family)
            .filter(|key| in_scope(key, scope, family.scope_len) && !current.contains(*key))
            .cloned()
            .collect();
        self.remove_keys(family, &stale);
        stale.len()
    }

    /// Drop every tracked key of `family` last seen more than `ttl` before `now`.
    pub fn expire(&mut self, family: &SeriesFamily, now: DateTime<Utc>, ttl: Duration) -> usize {
        let cutoff = now - ttl;
        let expired: Vec<SeriesKey> = self
            .observed
            .get(family.id())
            .map(|keys| {
                keys.iter()
                    .filter(|(_, seen)| **seen < cutoff)
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default();
        self.remove_keys(family, &expired);
        expired.len()
    }

    /// Number of keys currently tracked for `family`.
    pub fn tracked(&self, family: &SeriesFamily) -> usize {
        self.observed.get(family.id()).map_or(0, HashMap::len)
    }

    fn tracked_keys<'a>(&'a self, family: &SeriesFamily) -> impl Iterator<Item = &'a SeriesKey> {
        self.observed.get(family.id()).into_iter().flat_map(|keys| keys.keys())
    }

    fn remove_keys(&mut self, family: &SeriesFamily, keys: &[SeriesKey]) {
        if keys.is_empty() {
            return;
        }
        let tracked = self.observed.entry(family.id()).or_default();
        for key in keys {
            let labels = label_refs(key);
            for metric in family.metrics {
                self.sink.remove_series(metric, &labels);
            }
            tracked.remove(key);
        }
        tracing::debug!("Series: removed {} stale keys of {}", keys.len(), family.id());
    }
}

fn in_scope(key: &[String], scope: &[&str], scope_len: usize) -> bool {
    let len = scope_len.min(scope.len());
    key.len() >= len && key[..len].iter().zip(scope).all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::RecordingSink;
    use crate::metrics::series_key;

    const INFO: &str = "info";
    const VALUE: &str = "value";
    const SEEN: &str = "seen";
    const FAMILY: SeriesFamily = SeriesFamily {
        metrics: &[VALUE, SEEN],
        scope_len: 2,
    };

    fn obs(labels: &[&str], seen: DateTime<Utc>) -> Observation {
        Observation {
            key: series_key(labels),
            values: vec![Some(1.0), Some(seen.timestamp() as f64)],
            seen,
        }
    }

    fn setup() -> (Arc<RecordingSink>, SeriesTracker) {
        let sink = Arc::new(RecordingSink::default());
        let tracker = SeriesTracker::new(sink.clone());
        (sink, tracker)
    }

    #[test]
    fn test_singleton_replace() {
        let (sink, mut tracker) = setup();
        tracker.publish_singleton(INFO, "s1", series_key(&["s1", "A"]), 1.0);
        tracker.publish_singleton(INFO, "s1", series_key(&["s1", "A"]), 1.0);
        assert!(sink.removals(INFO).is_empty());

        tracker.publish_singleton(INFO, "s1", series_key(&["s1", "B"]), 1.0);
        assert_eq!(sink.removals(INFO), vec![series_key(&["s1", "A"])]);
        assert_eq!(sink.series(INFO), vec![series_key(&["s1", "B"])]);
    }

    #[test]
    fn test_singleton_clear() {
        let (sink, mut tracker) = setup();
        tracker.publish_singleton(INFO, "s1", series_key(&["s1", "A"]), 1.0);
        tracker.clear_singleton(INFO, "s1");
        tracker.clear_singleton(INFO, "s1");
        assert!(sink.series(INFO).is_empty());
        assert_eq!(sink.removals(INFO).len(), 1);
    }

    #[test]
    fn test_reconcile_diff() {
        let (sink, mut tracker) = setup();
        let t0 = Utc::now();
        tracker.reconcile(
            &FAMILY,
            &["s", "n"],
            vec![obs(&["s", "n", "A"], t0), obs(&["s", "n", "B"], t0)],
        );

        let t1 = t0 + Duration::seconds(10);
        let removed = tracker.reconcile(
            &FAMILY,
            &["s", "n"],
            vec![obs(&["s", "n", "B"], t1), obs(&["s", "n", "C"], t1)],
        );
        assert_eq!(removed, 1);

        let mut live = sink.series(VALUE);
        live.sort();
        assert_eq!(live, vec![series_key(&["s", "n", "B"]), series_key(&["s", "n", "C"])]);
        assert_eq!(sink.removals(VALUE), vec![series_key(&["s", "n", "A"])]);
        assert_eq!(sink.removals(SEEN), vec![series_key(&["s", "n", "A"])]);
        assert_eq!(sink.gauge(SEEN, &["s", "n", "B"]), Some(t1.timestamp() as f64));
    }

    #[test]
    fn test_reconcile_leaves_other_scopes() {
        let (sink, mut tracker) = setup();
        let t0 = Utc::now();
        tracker.reconcile(&FAMILY, &["s", "wifi1"], vec![obs(&["s", "wifi1", "A"], t0)]);
        tracker.reconcile(&FAMILY, &["s", "wifi2"], vec![obs(&["s", "wifi2", "X"], t0)]);
        assert_eq!(sink.series(VALUE).len(), 2);
        assert_eq!(tracker.tracked(&FAMILY), 2);
    }

    #[test]
    fn test_ttl_expiry_without_stale_mark() {
        let (sink, mut tracker) = setup();
        let t0 = Utc::now();
        tracker.reconcile(&FAMILY, &["s", "wifi1"], vec![obs(&["s", "wifi1", "B"], t0)]);

        // Another scope keeps scanning; wifi1 never reports again.
        let ttl = Duration::seconds(300);
        let t1 = t0 + Duration::seconds(200);
        tracker.reconcile(&FAMILY, &["s", "wifi2"], vec![obs(&["s", "wifi2", "X"], t1)]);
        assert_eq!(tracker.expire(&FAMILY, t1, ttl), 0);

        let t2 = t0 + Duration::seconds(301);
        assert_eq!(tracker.expire(&FAMILY, t2, ttl), 1);
        assert_eq!(sink.series(VALUE), vec![series_key(&["s", "wifi2", "X"])]);
        assert_eq!(sink.removals(VALUE), vec![series_key(&["s", "wifi1", "B"])]);
    }

    #[test]
    fn test_none_values_not_published() {
        let (sink, mut tracker) = setup();
        let seen = Utc::now();
        tracker.reconcile(
            &FAMILY,
            &["s", "n"],
            vec![Observation {
                key: series_key(&["s", "n", "A"]),
                values: vec![None, Some(5.0)],
                seen,
            }],
        );
        assert!(sink.series(VALUE).is_empty());
        assert_eq!(sink.gauge(SEEN, &["s", "n", "A"]), Some(5.0));
    }
}
