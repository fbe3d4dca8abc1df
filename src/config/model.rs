//! Typed configuration produced by [`super::normalize`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::incident::IncidentThresholds;

/// Where a service lives relative to the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Internal,
    External,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Internal => "internal",
            Scope::External => "external",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Wifi,
    Wired,
}

impl NetworkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkKind::Wifi => "wifi",
            NetworkKind::Wired => "wired",
        }
    }
}

/// One network attachment the sensor cycles through.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkTarget {
    pub name: String,
    pub kind: NetworkKind,
    pub iface: String,
    pub ssid: Option<String>,
    pub password: Option<String>,
    /// 802.1X: PEAP, TTLS, TLS
    pub eap_method: Option<String>,
    /// 802.1X inner auth: MSCHAPv2, PAP, CHAP
    pub phase2_auth: Option<String>,
    pub identity: Option<String>,
    pub anonymous_identity: Option<String>,
    /// Pin association to one BSSID.
    pub bssid_lock: Option<String>,
    pub external_url: String,
}

impl NetworkTarget {
    pub fn is_wifi(&self) -> bool {
        self.kind == NetworkKind::Wifi
    }

    /// WPA-Enterprise needs both an EAP method and an identity.
    pub fn is_enterprise(&self) -> bool {
        self.eap_method.is_some() && self.identity.is_some()
    }

    /// Label used in metrics: the SSID for wireless, the name otherwise.
    pub fn label(&self) -> &str {
        self.ssid.as_deref().unwrap_or(&self.name)
    }
}

/// Test kinds a service can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Http,
    Tcp80,
    Tcp443,
    Icmp,
    VoipMos,
    Throughput,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::Http => "http",
            TestKind::Tcp80 => "tcp_80",
            TestKind::Tcp443 => "tcp_443",
            TestKind::Icmp => "icmp",
            TestKind::VoipMos => "voip_mos",
            TestKind::Throughput => "throughput",
        }
    }

    /// Resolve a configured test name, accepting the usual aliases.
    pub fn parse(name: &str) -> Option<TestKind> {
        let key = name.trim().to_lowercase().replace('-', "_");
        let kind = match key.as_str() {
            "http" | "http_2xx" | "https" => TestKind::Http,
            "tcp80" | "tcp_80" | "tcp:80" => TestKind::Tcp80,
            "tcp443" | "tcp_443" | "tcp:443" => TestKind::Tcp443,
            "icmp" | "ping" | "icmp_ping" => TestKind::Icmp,
            "voip_mos" => TestKind::VoipMos,
            "throughput" => TestKind::Throughput,
            _ => return None,
        };
        Some(kind)
    }

    /// Number of result rows this kind produces per run.
    pub fn step_count(&self) -> usize {
        match self {
            TestKind::Http => 2,
            _ => 1,
        }
    }
}

/// Map a frequency class to seconds between runs. Unknown classes run every cycle.
pub fn frequency_seconds(class: &str) -> u64 {
    match class.trim().to_lowercase().as_str() {
        "10min" => 600,
        "20min" => 1200,
        "30min" => 1800,
        "1hr" => 3600,
        "2hr" => 7200,
        "4hr" => 14_400,
        "6hr" => 21_600,
        "12hr" => 43_200,
        _ => 0,
    }
}

/// A service probed from every network.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceTarget {
    pub scope: Scope,
    pub name: String,
    /// Host, IP or URL. Empty for throughput-only services.
    pub target: String,
    pub tests: Vec<TestKind>,
    pub frequency_seconds: u64,
}

impl ServiceTarget {
    /// Key used to remember when the service last ran.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.scope, self.name, self.target)
    }

    pub fn host(&self) -> String {
        extract_host(&self.target)
    }

    pub fn has(&self, kind: TestKind) -> bool {
        self.tests.contains(&kind)
    }

    /// Services without a target can only run throughput downloads.
    pub fn is_runnable(&self) -> bool {
        !self.target.is_empty()
            || (!self.tests.is_empty() && self.tests.iter().all(|t| *t == TestKind::Throughput))
    }
}

/// Hostname of a URL target, or the target itself when it is not a URL.
pub fn extract_host(target: &str) -> String {
    match reqwest::Url::parse(target) {
        Ok(url) => match url.host_str() {
            Some(host) => host.trim_matches(|c| c == '[' || c == ']').to_string(),
            None => target.to_string(),
        },
        Err(_) => target.to_string(),
    }
}

/// Prefix `https://` when the target carries no scheme.
pub fn normalize_http_target(target: &str) -> String {
    if reqwest::Url::parse(target).is_ok() {
        target.to_string()
    } else {
        format!("https://{}", target)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WifiEnvConfig {
    pub enabled: bool,
    pub max_aps: usize,
    pub min_rssi_dbm: f64,
    pub ttl_seconds: i64,
}

impl Default for WifiEnvConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_aps: 40,
            min_rssi_dbm: -90.0,
            ttl_seconds: 300,
        }
    }
}

pub const DEFAULT_THROUGHPUT_URLS: [&str; 3] = [
    "https://speed.cloudflare.com/__down?bytes=10000000",
    "https://proof.ovh.net/files/10Mb.dat",
    "http://speedtest.tele2.net/10MB.zip",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThroughputConfig {
    pub enabled: bool,
    pub urls: Vec<String>,
    pub workers: usize,
    pub timeout_seconds: u64,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            urls: DEFAULT_THROUGHPUT_URLS.iter().map(|u| u.to_string()).collect(),
            workers: 3,
            timeout_seconds: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub inter_test_delay_seconds: f64,
    pub inter_cycle_delay_seconds: f64,
    pub inter_network_delay_seconds: f64,
    pub dhcp_timeout_seconds: u64,
    pub tcp_attempts: u32,
    /// Run the per-network external HTTP reachability step.
    pub external_http_check: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            inter_test_delay_seconds: 5.0,
            inter_cycle_delay_seconds: 0.0,
            inter_network_delay_seconds: 2.0,
            dhcp_timeout_seconds: 60,
            tcp_attempts: 10,
            external_http_check: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub domain: String,
    /// Resolvers to query. Empty means the interface's own resolvers.
    pub servers: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            domain: "example.com".to_string(),
            servers: Vec::new(),
        }
    }
}

/// Manually configured sensor location.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub lat: String,
    pub lon: String,
    pub address_notes: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    pub db_path: String,
    pub retention_days: i64,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            db_path: "netsensor.db".to_string(),
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    pub state_path: String,
    pub max_events_per_type: usize,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            state_path: "/var/lib/netsensor/incidents.json".to_string(),
            max_events_per_type: 3,
        }
    }
}

/// Fully normalized sensor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub sensor_name: String,
    pub metrics_port: u16,
    pub networks: Vec<NetworkTarget>,
    /// Internal services first, then external.
    pub services: Vec<ServiceTarget>,
    pub external_http_url: String,
    pub thresholds: IncidentThresholds,
    pub incidents: IncidentConfig,
    pub wifi_environment: WifiEnvConfig,
    pub throughput: ThroughputConfig,
    pub schedule: ScheduleConfig,
    pub dns: DnsConfig,
    pub location: Option<Location>,
    pub results: ResultsConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_kind_aliases() {
        assert_eq!(TestKind::parse("ping"), Some(TestKind::Icmp));
        assert_eq!(TestKind::parse("ICMP-Ping"), Some(TestKind::Icmp));
        assert_eq!(TestKind::parse("http_2xx"), Some(TestKind::Http));
        assert_eq!(TestKind::parse("https"), Some(TestKind::Http));
        assert_eq!(TestKind::parse("tcp-80"), Some(TestKind::Tcp80));
        assert_eq!(TestKind::parse("tcp:443"), Some(TestKind::Tcp443));
        assert_eq!(TestKind::parse("voip-mos"), Some(TestKind::VoipMos));
        assert_eq!(TestKind::parse("smtp"), None);
    }

    #[test]
    fn test_frequency_seconds() {
        assert_eq!(frequency_seconds("fastest"), 0);
        assert_eq!(frequency_seconds("10min"), 600);
        assert_eq!(frequency_seconds(" 1HR "), 3600);
        assert_eq!(frequency_seconds("12hr"), 43_200);
        assert_eq!(frequency_seconds("fortnightly"), 0);
    }

    #[test]
    fn test_service_runnable() {
        let service = |target: &str, tests: Vec<TestKind>| ServiceTarget {
            scope: Scope::External,
            name: "Speed".to_string(),
            target: target.to_string(),
            tests,
            frequency_seconds: 0,
        };
        assert!(service("1.1.1.1", vec![TestKind::Icmp]).is_runnable());
        assert!(service("", vec![TestKind::Throughput]).is_runnable());
        assert!(!service("", vec![TestKind::Throughput, TestKind::Icmp]).is_runnable());
        assert!(!service("", Vec::new()).is_runnable());
    }

    #[test]
    fn test_service_key_and_host() {
        let service = ServiceTarget {
            scope: Scope::External,
            name: "Cloud".to_string(),
            target: "https://www.google.com/path".to_string(),
            tests: vec![TestKind::Icmp],
            frequency_seconds: 0,
        };
        assert_eq!(service.key(), "external:Cloud:https://www.google.com/path");
        assert_eq!(service.host(), "www.google.com");
        assert_eq!(extract_host("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn test_normalize_http_target() {
        assert_eq!(normalize_http_target("example.com"), "https://example.com");
        assert_eq!(normalize_http_target("http://a.example"), "http://a.example");
    }

    #[test]
    fn test_runnable() {
        let mut service = ServiceTarget {
            scope: Scope::External,
            name: "speed".to_string(),
            target: String::new(),
            tests: vec![TestKind::Throughput],
            frequency_seconds: 0,
        };
        assert!(service.is_runnable());
        service.tests.push(TestKind::Icmp);
        assert!(!service.is_runnable());
    }
}
