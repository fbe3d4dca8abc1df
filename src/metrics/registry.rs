//! Prometheus-backed [`MetricsSink`].

use std::collections::HashMap;

use ::prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use super::catalog::{self, MetricKind};
use super::MetricsSink;

/// Metrics error types.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] ::prometheus::Error),
    #[error("exposition is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

enum Family {
    Gauge(GaugeVec),
    Counter(CounterVec),
}

/// Sink that owns a private registry holding every family from the catalog.
pub struct PrometheusSink {
    registry: Registry,
    families: HashMap<&'static str, Family>,
}

impl PrometheusSink {
    /// Register every catalogued metric in a fresh registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let mut families = HashMap::with_capacity(catalog::METRICS.len());

        for def in catalog::METRICS {
            let opts = Opts::new(def.name, def.help);
            let family = match def.kind {
                MetricKind::Gauge => {
                    let vec = GaugeVec::new(opts, def.labels)?;
                    registry.register(Box::new(vec.clone()))?;
                    Family::Gauge(vec)
                }
                MetricKind::Counter => {
                    let vec = CounterVec::new(opts, def.labels)?;
                    registry.register(Box::new(vec.clone()))?;
                    Family::Counter(vec)
                }
            };
            families.insert(def.name, family);
        }

        Ok(Self { registry, families })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl MetricsSink for PrometheusSink {
    fn set_gauge(&self, name: &str, labels: &[&str], value: f64) {
        match self.families.get(name) {
            Some(Family::Gauge(vec)) => match vec.get_metric_with_label_values(labels) {
                Ok(gauge) => gauge.set(value),
                Err(e) => tracing::warn!("Metrics: cannot set {}: {}", name, e),
            },
            _ => tracing::warn!("Metrics: {} is not a registered gauge", name),
        }
    }

    fn inc_counter_by(&self, name: &str, labels: &[&str], value: f64) {
        match self.families.get(name) {
            Some(Family::Counter(vec)) => match vec.get_metric_with_label_values(labels) {
                Ok(counter) => counter.inc_by(value),
                Err(e) => tracing::warn!("Metrics: cannot increment {}: {}", name, e),
            },
            _ => tracing::warn!("Metrics: {} is not a registered counter", name),
        }
    }

    fn remove_series(&self, name: &str, labels: &[&str]) {
        let result = match self.families.get(name) {
            Some(Family::Gauge(vec)) => vec.remove_label_values(labels),
            Some(Family::Counter(vec)) => vec.remove_label_values(labels),
            None => return,
        };
        if let Err(e) = result {
            tracing::debug!("Metrics: remove {} {:?}: {}", name, labels, e);
        }
    }
}
