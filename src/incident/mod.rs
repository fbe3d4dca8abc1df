//! Incident detection.
//!
//! Each cycle produces a set of boolean flags per (sensor, network) from the
//! probe results; [`IncidentTracker`] turns flag edges into durable active
//! and resolved events.

mod state;
mod tracker;

pub use state::*;
pub use tracker::*;

use serde::{Deserialize, Serialize};

use crate::config::Scope;
use crate::probe::{PingStats, StepResult};

/// Target name whose service results never raise loss, latency or jitter incidents.
const EXCLUDED_TARGET: &str = "gateway";

/// Kinds of incident, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    HighDnsLookupTime,
    DhcpSlow,
    PacketLoss,
    HighLatency,
    AssociationSlow,
    WeakSignal,
    CaptivePortal,
    HttpSlow,
    HighJitter,
}

impl IncidentType {
    pub const COUNT: usize = 9;

    pub const ALL: [IncidentType; Self::COUNT] = [
        IncidentType::HighDnsLookupTime,
        IncidentType::DhcpSlow,
        IncidentType::PacketLoss,
        IncidentType::HighLatency,
        IncidentType::AssociationSlow,
        IncidentType::WeakSignal,
        IncidentType::CaptivePortal,
        IncidentType::HttpSlow,
        IncidentType::HighJitter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::HighDnsLookupTime => "high_dns_lookup_time",
            IncidentType::DhcpSlow => "dhcp_slow",
            IncidentType::PacketLoss => "packet_loss",
            IncidentType::HighLatency => "high_latency",
            IncidentType::AssociationSlow => "association_slow",
            IncidentType::WeakSignal => "weak_signal",
            IncidentType::CaptivePortal => "captive_portal",
            IncidentType::HttpSlow => "http_slow",
            IncidentType::HighJitter => "high_jitter",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Active/inactive state of every incident type for one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncidentFlags([bool; IncidentType::COUNT]);

impl IncidentFlags {
    pub fn set(&mut self, kind: IncidentType, active: bool) {
        self.0[kind.index()] = active;
    }

    pub fn is_active(&self, kind: IncidentType) -> bool {
        self.0[kind.index()]
    }

    pub fn active(&self) -> impl Iterator<Item = IncidentType> + '_ {
        IncidentType::ALL.into_iter().filter(|kind| self.is_active(*kind))
    }
}

/// Thresholds above (or for RSSI, below) which an incident is raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentThresholds {
    pub dns_ms: f64,
    pub dhcp_ms: f64,
    pub packet_loss_pct: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub association_ms: f64,
    pub http_ms: f64,
    pub rssi_dbm: f64,
}

impl Default for IncidentThresholds {
    fn default() -> Self {
        Self {
            dns_ms: 200.0,
            dhcp_ms: 1500.0,
            packet_loss_pct: 5.0,
            latency_ms: 100.0,
            jitter_ms: 50.0,
            association_ms: 10_000.0,
            http_ms: 3000.0,
            rssi_dbm: -75.0,
        }
    }
}

/// ICMP result of one service, as seen by incident evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSample {
    pub target: String,
    pub scope: Scope,
    pub stats: PingStats,
}

/// Everything gathered for one network during one cycle.
#[derive(Debug, Clone, Default)]
pub struct NetworkObservations {
    pub association: Option<StepResult>,
    pub dhcp: Option<StepResult>,
    /// Slowest successful resolver of the cycle.
    pub dns: Option<StepResult>,
    pub http: Option<StepResult>,
    pub rssi_dbm: Option<f64>,
    pub services: Vec<ServiceSample>,
    pub captive_portal: bool,
}

fn slow(step: &Option<StepResult>, threshold_ms: f64) -> bool {
    matches!(step, Some(s) if s.ok && s.duration_ms() > threshold_ms)
}

fn max_of(samples: &[ServiceSample], pick: impl Fn(&PingStats) -> Option<f64>) -> Option<f64> {
    samples
        .iter()
        .filter(|s| s.target != EXCLUDED_TARGET)
        .filter_map(|s| pick(&s.stats))
        .reduce(f64::max)
}

/// Derive incident flags for one network from its cycle observations.
pub fn evaluate(obs: &NetworkObservations, thresholds: &IncidentThresholds) -> IncidentFlags {
    let mut flags = IncidentFlags::default();

    flags.set(IncidentType::HighDnsLookupTime, slow(&obs.dns, thresholds.dns_ms));
    flags.set(IncidentType::DhcpSlow, slow(&obs.dhcp, thresholds.dhcp_ms));
    flags.set(
        IncidentType::AssociationSlow,
        slow(&obs.association, thresholds.association_ms),
    );
    flags.set(IncidentType::HttpSlow, slow(&obs.http, thresholds.http_ms));
    flags.set(
        IncidentType::WeakSignal,
        matches!(obs.rssi_dbm, Some(rssi) if rssi < thresholds.rssi_dbm),
    );

    let exceeds = |value: Option<f64>, limit: f64| matches!(value, Some(v) if v > limit);
    flags.set(
        IncidentType::PacketLoss,
        exceeds(max_of(&obs.services, |s| s.loss_pct), thresholds.packet_loss_pct),
    );
    flags.set(
        IncidentType::HighLatency,
        exceeds(max_of(&obs.services, |s| s.rtt_avg_ms), thresholds.latency_ms),
    );
    flags.set(
        IncidentType::HighJitter,
        exceeds(max_of(&obs.services, |s| s.jitter_ms), thresholds.jitter_ms),
    );
    flags.set(IncidentType::CaptivePortal, obs.captive_portal);

    flags
}
