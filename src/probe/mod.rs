//! Probe boundary for all OS-level measurements.
//!
//! The scheduler only talks to [`ProbeProvider`]. [`SystemProbe`] is the
//! Linux implementation built on `nmcli`, `dhclient`, `ip`, `iw` and
//! `ping`, with HTTP, DNS and TCP probes done in-process.

mod dns;
mod http;
mod netinfo;
mod ping;
mod system;
mod tcp;

pub use dns::*;
pub use http::*;
pub use netinfo::*;
pub use ping::*;
pub use system::*;
pub use tcp::*;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::NetworkTarget;
use crate::wifi::{self, AccessPoint, WifiLinkInfo};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Outcome of one measured step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub ok: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

impl StepResult {
    pub fn success(duration: Duration) -> Self {
        Self {
            ok: true,
            duration,
            error: None,
        }
    }

    pub fn failure(duration: Duration, error: &str) -> Self {
        Self {
            ok: false,
            duration,
            error: Some(error.to_string()),
        }
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

/// ICMP statistics; a field is `None` when ping output did not report it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PingStats {
    pub rtt_avg_ms: Option<f64>,
    pub loss_pct: Option<f64>,
    pub jitter_ms: Option<f64>,
}

/// Repeated TCP connect statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TcpStats {
    pub latency_avg_ms: Option<f64>,
    /// Sample standard deviation of connect times.
    pub jitter_ms: Option<f64>,
    pub loss_pct: Option<f64>,
}

/// Addressing facts about an interface. Unknown values read `"unknown"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkInfo {
    pub ip_config: String,
    pub dhcp_server: String,
    pub gateway: String,
    pub primary_dns: String,
    pub secondary_dns: String,
    pub mac: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorIdentity {
    pub model: String,
    pub serial: String,
}

/// One finished throughput download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadSample {
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Raw scan text and the tool that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutput {
    /// `iw dev <iface> scan`
    Iw(String),
    /// `nmcli -t -f BSSID,SSID,CHAN,FREQ,SIGNAL,SECURITY device wifi list`
    Nmcli(String),
}

impl ScanOutput {
    pub fn parse(&self, scan_time: DateTime<Utc>) -> Vec<AccessPoint> {
        match self {
            ScanOutput::Iw(text) => wifi::parse_scan(text, scan_time),
            ScanOutput::Nmcli(text) => wifi::parse_nmcli_list(text, scan_time),
        }
    }
}

/// Everything the scheduler needs from the operating system.
///
/// For `associate`, `acquire_lease` and `scan_access_points` an `Err` is an
/// infrastructure error (a tool that cannot be run at all); ordinary failures
/// are part of the returned value. `resolve_dns` and `download` return `Err`
/// for a failed measurement.
#[async_trait]
pub trait ProbeProvider: Send + Sync {
    /// Join the wireless network described by `network`.
    async fn associate(&self, network: &NetworkTarget) -> Result<StepResult, ProbeError>;

    /// Run a full DHCP exchange. Returns the step and the acquired address.
    async fn acquire_lease(
        &self,
        iface: &str,
        timeout: Duration,
    ) -> Result<(StepResult, Option<String>), ProbeError>;

    async fn release_lease(&self, iface: &str) -> bool;

    async fn scan_access_points(&self, iface: &str) -> Result<ScanOutput, ProbeError>;

    /// Query `server` for `domain`, returning the round-trip time.
    async fn resolve_dns(&self, domain: &str, server: &str) -> Result<Duration, ProbeError>;

    async fn http_get(&self, url: &str) -> StepResult;

    async fn ping(&self, target: &str) -> PingStats;

    async fn tcp_connect(&self, host: &str, port: u16, attempts: u32) -> TcpStats;

    async fn detect_captive_portal(&self) -> bool;

    async fn wifi_link_info(&self, iface: &str) -> Option<WifiLinkInfo>;

    async fn channel_utilization(&self, iface: &str) -> Option<f64>;

    async fn frame_retry_rate(&self, iface: &str) -> Option<f64>;

    async fn client_count(&self, iface: &str) -> u32;

    async fn sensor_identity(&self) -> SensorIdentity;

    async fn network_info(&self, iface: &str, ip: Option<&str>) -> NetworkInfo;

    /// Resolvers configured on the interface, primary first.
    async fn dns_servers(&self, iface: &str) -> Vec<String>;

    /// Download `url` to nowhere, counting bytes.
    async fn download(&self, url: &str, timeout: Duration) -> Result<DownloadSample, ProbeError>;
}
