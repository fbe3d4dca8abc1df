//! Names, help text and label sets of every exported metric.

/// Kind of a registered metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

/// Static description of one metric family.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
    pub kind: MetricKind,
}

const SN: &[&str] = &["sensor", "network"];
const SERVICE: &[&str] = &["sensor", "network", "target", "scope"];
const AP: &[&str] = &[
    "sensor", "network", "iface", "ssid", "bssid", "band", "channel", "width_mhz",
];
const CHANNEL: &[&str] = &["sensor", "network", "band", "channel"];
const INCIDENT: &[&str] = &["sensor", "network", "type"];

// Steps
pub const CORE_OK: &str = "netsensor_core_ok";
pub const CORE_TIME_MS: &str = "netsensor_core_time_ms";
pub const AP_ASSOCIATION_TIME_MS: &str = "netsensor_ap_association_time_ms";
pub const DHCP_TIME_MS: &str = "netsensor_dhcp_time_ms";
pub const DNS_TIME_MS: &str = "netsensor_dns_time_ms";
pub const NETWORK_IP_PRESENT: &str = "netsensor_network_ip_present";
pub const CAPTIVE_PORTAL_DETECTED: &str = "netsensor_captive_portal_detected";
pub const CONNECTION_QUALITY_SCORE: &str = "netsensor_connection_quality_score";
pub const LAST_DATA_TIMESTAMP: &str = "netsensor_last_data_timestamp";

// Link
pub const WIFI_RSSI_DBM: &str = "netsensor_wifi_rssi_dbm";
pub const WIFI_FREQ_MHZ: &str = "netsensor_wifi_freq_mhz";
pub const WIFI_CHANNEL: &str = "netsensor_wifi_channel";
pub const WIFI_TX_BITRATE_MBPS: &str = "netsensor_wifi_tx_bitrate_mbps";
pub const WIFI_RX_BITRATE_MBPS: &str = "netsensor_wifi_rx_bitrate_mbps";
pub const WIFI_CHANNEL_BUSY_PCT: &str = "netsensor_wifi_channel_busy_pct";
pub const WIFI_FRAME_RETRY_RATE_PCT: &str = "netsensor_wifi_frame_retry_rate_pct";
pub const WIFI_CLIENT_COUNT: &str = "netsensor_wifi_client_count";
pub const WIFI_BAND: &str = "netsensor_wifi_band";
pub const WIFI_BSSID_INFO: &str = "netsensor_wifi_bssid_info";

// Environment scan
pub const WIFI_ENV_AP_RSSI_DBM: &str = "netsensor_wifi_env_ap_rssi_dbm";
pub const WIFI_ENV_AP_LAST_SEEN_SECONDS: &str = "netsensor_wifi_env_ap_last_seen_seconds";
pub const WIFI_ENV_CHANNEL_AP_COUNT: &str = "netsensor_wifi_env_channel_ap_count";
pub const WIFI_ENV_CHANNEL_MAX_RSSI_DBM: &str = "netsensor_wifi_env_channel_max_rssi_dbm";
pub const WIFI_ENV_CHANNEL_AVG_RSSI_DBM: &str = "netsensor_wifi_env_channel_avg_rssi_dbm";

// Services
pub const SERVICE_RTT_AVG_MS: &str = "netsensor_service_rtt_avg_ms";
pub const SERVICE_PACKET_LOSS_PCT: &str = "netsensor_service_packet_loss_pct";
pub const SERVICE_JITTER_MS: &str = "netsensor_service_jitter_ms";
pub const SERVICE_UP: &str = "netsensor_service_up";
pub const SERVICE_LAST_TEST_TIMESTAMP: &str = "netsensor_service_last_test_timestamp";
pub const SERVICE_SCOPE: &str = "netsensor_service_scope";
pub const SERVICE_HTTP_TIME_MS: &str = "netsensor_service_http_time_ms";
pub const SERVICE_TCP_CONNECT_MS: &str = "netsensor_service_tcp_connect_ms";
pub const VOIP_MOS: &str = "netsensor_voip_mos";
pub const THROUGHPUT_DOWNLOAD_MBPS: &str = "netsensor_throughput_download_mbps";

// Cycle progress
pub const CURRENT_TEST: &str = "netsensor_current_test";
pub const CYCLE_NUMBER: &str = "netsensor_cycle_number";
pub const CYCLE_PROGRESS_PCT: &str = "netsensor_cycle_progress_pct";
pub const CYCLE_TESTS_TOTAL: &str = "netsensor_cycle_tests_total";
pub const CYCLE_TESTS_COMPLETED: &str = "netsensor_cycle_tests_completed";
pub const CYCLE_TESTS_SKIPPED: &str = "netsensor_cycle_tests_skipped";

// Info
pub const SENSOR_INFO: &str = "netsensor_sensor_info";
pub const NETWORK_INFO: &str = "netsensor_network_info";
pub const SENSOR_LOCATION: &str = "netsensor_sensor_location";

// Incidents
pub const INCIDENT_ACTIVE: &str = "netsensor_incident_active";
pub const INCIDENTS_RESOLVED_TOTAL: &str = "netsensor_incidents_resolved_total";
pub const INCIDENT_RESOLVED_EVENT_DURATION_MS: &str =
    "netsensor_incident_resolved_event_duration_ms";

const fn gauge(name: &'static str, help: &'static str, labels: &'static [&'static str]) -> MetricDef {
    MetricDef { name, help, labels, kind: MetricKind::Gauge }
}

/// Every metric family the sensor exports.
pub const METRICS: &[MetricDef] = &[
    gauge(CORE_OK, "Step success (1=ok, 0=fail)", &["sensor", "network", "step"]),
    gauge(CORE_TIME_MS, "Step duration in milliseconds", &["sensor", "network", "step"]),
    gauge(AP_ASSOCIATION_TIME_MS, "Wi-Fi association time in milliseconds", SN),
    gauge(DHCP_TIME_MS, "DHCP lease acquisition time in milliseconds", SN),
    gauge(DNS_TIME_MS, "DNS lookup time in milliseconds", SN),
    gauge(NETWORK_IP_PRESENT, "IPv4 address present (1=present, 0=missing)", SN),
    gauge(CAPTIVE_PORTAL_DETECTED, "Captive portal detected (1=yes, 0=no)", SN),
    gauge(CONNECTION_QUALITY_SCORE, "Overall connection quality score (0-100)", SN),
    gauge(LAST_DATA_TIMESTAMP, "Unix timestamp of the last published result", SN),
    gauge(WIFI_RSSI_DBM, "Wi-Fi RSSI in dBm", SN),
    gauge(WIFI_FREQ_MHZ, "Wi-Fi frequency in MHz", SN),
    gauge(WIFI_CHANNEL, "Wi-Fi channel number", SN),
    gauge(WIFI_TX_BITRATE_MBPS, "Wi-Fi TX bitrate in Mbps", SN),
    gauge(WIFI_RX_BITRATE_MBPS, "Wi-Fi RX bitrate in Mbps", SN),
    gauge(WIFI_CHANNEL_BUSY_PCT, "Wi-Fi channel busy percentage", SN),
    gauge(WIFI_FRAME_RETRY_RATE_PCT, "Wi-Fi frame retry rate percentage", SN),
    gauge(WIFI_CLIENT_COUNT, "Active neighbours seen on the interface", SN),
    gauge(WIFI_BAND, "Wi-Fi band indicator", &["sensor", "network", "band"]),
    gauge(WIFI_BSSID_INFO, "Associated BSSID", &["sensor", "network", "bssid", "ssid"]),
    gauge(WIFI_ENV_AP_RSSI_DBM, "Environment scan AP RSSI in dBm", AP),
    gauge(WIFI_ENV_AP_LAST_SEEN_SECONDS, "Environment scan AP last seen timestamp", AP),
    gauge(WIFI_ENV_CHANNEL_AP_COUNT, "Environment scan AP count per channel", CHANNEL),
    gauge(WIFI_ENV_CHANNEL_MAX_RSSI_DBM, "Environment scan max RSSI per channel", CHANNEL),
    gauge(WIFI_ENV_CHANNEL_AVG_RSSI_DBM, "Environment scan mean RSSI per channel", CHANNEL),
    gauge(SERVICE_RTT_AVG_MS, "Service ICMP RTT average in ms", SERVICE),
    gauge(SERVICE_PACKET_LOSS_PCT, "Service ICMP packet loss percentage", SERVICE),
    gauge(SERVICE_JITTER_MS, "Service ICMP jitter (mdev) in ms", SERVICE),
    gauge(SERVICE_UP, "Service reachability (1=up, 0=down)", &["sensor", "network", "target", "scope", "name"]),
    gauge(SERVICE_LAST_TEST_TIMESTAMP, "Unix timestamp of the last service test", SERVICE),
    gauge(SERVICE_SCOPE, "Service scope marker", SERVICE),
    gauge(SERVICE_HTTP_TIME_MS, "Service HTTP GET time in ms", SERVICE),
    gauge(SERVICE_TCP_CONNECT_MS, "Service TCP connect time in ms", SERVICE),
    gauge(VOIP_MOS, "Estimated VoIP MOS", &["sensor", "network", "scope"]),
    gauge(THROUGHPUT_DOWNLOAD_MBPS, "Download throughput in Mbps", &["sensor", "network", "target"]),
    gauge(CURRENT_TEST, "Currently running test", &["sensor", "network", "test_type", "target", "service_name"]),
    gauge(CYCLE_NUMBER, "Current test cycle number", &["sensor"]),
    gauge(CYCLE_PROGRESS_PCT, "Test cycle progress percentage", SN),
    gauge(CYCLE_TESTS_TOTAL, "Estimated tests in the current cycle", SN),
    gauge(CYCLE_TESTS_COMPLETED, "Tests completed in the current cycle", SN),
    gauge(CYCLE_TESTS_SKIPPED, "Services skipped by frequency in the last cycle", &["sensor"]),
    gauge(SENSOR_INFO, "Sensor identity", &["sensor", "model", "serial"]),
    gauge(
        NETWORK_INFO,
        "Network addressing info",
        &["sensor", "network", "ip_config", "dhcp_server", "gateway", "primary_dns", "secondary_dns", "mac", "ip"],
    ),
    gauge(SENSOR_LOCATION, "Sensor location", &["sensor", "network", "lat", "lon", "address_notes"]),
    gauge(INCIDENT_ACTIVE, "Incident active (1=active, 0=clear)", INCIDENT),
    MetricDef {
        name: INCIDENTS_RESOLVED_TOTAL,
        help: "Incidents resolved",
        labels: INCIDENT,
        kind: MetricKind::Counter,
    },
    gauge(
        INCIDENT_RESOLVED_EVENT_DURATION_MS,
        "Duration of a recently resolved incident in ms",
        &["sensor", "network", "type", "start_ts", "end_ts"],
    ),
];

/// Look up a metric definition by name.
#[cfg(test)]
pub fn lookup(name: &str) -> Option<&'static MetricDef> {
    METRICS.iter().find(|def| def.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_unique() {
        let names: HashSet<_> = METRICS.iter().map(|m| m.name).collect();
        assert_eq!(names.len(), METRICS.len());
    }

    #[test]
    fn test_lookup() {
        let def = lookup(WIFI_ENV_AP_RSSI_DBM).unwrap();
        assert_eq!(def.labels.len(), 8);
        assert_eq!(lookup(INCIDENTS_RESOLVED_TOTAL).unwrap().kind, MetricKind::Counter);
        assert!(lookup("netsensor_nope").is_none());
    }
}
