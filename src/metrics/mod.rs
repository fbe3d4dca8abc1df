//! Metric publication.
//!
//! Components publish through the [`MetricsSink`] trait so that the
//! Prometheus registry can be swapped for a recording sink in tests.
//! [`SeriesTracker`] sits on top of a sink and keeps the set of live
//! label tuples consistent with what is currently observed.

pub mod catalog;
mod environment;
mod registry;
mod series;

pub use environment::*;
pub use registry::*;
pub use series::*;

/// Ordered label values identifying one series of a metric.
pub type SeriesKey = Vec<String>;

/// Destination for gauge and counter updates.
pub trait MetricsSink: Send + Sync {
    /// Set the gauge `name` for the given label values.
    fn set_gauge(&self, name: &str, labels: &[&str], value: f64);

    /// Add `value` to the counter `name`.
    fn inc_counter_by(&self, name: &str, labels: &[&str], value: f64);

    fn inc_counter(&self, name: &str, labels: &[&str]) {
        self.inc_counter_by(name, labels, 1.0);
    }

    /// Drop a single series. Removing a series that does not exist is not an error.
    fn remove_series(&self, name: &str, labels: &[&str]);
}

/// Borrow a [`SeriesKey`] as the label slice the sink expects.
pub fn label_refs(key: &[String]) -> Vec<&str> {
    key.iter().map(String::as_str).collect()
}

/// Build an owned [`SeriesKey`] from borrowed label values.
pub fn series_key(labels: &[&str]) -> SeriesKey {
    labels.iter().map(|l| l.to_string()).collect()
}
