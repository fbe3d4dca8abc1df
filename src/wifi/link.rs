//! Parsers for the associated link: `iw link`, `iw survey dump`, `iw station dump`.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use super::{band_channel, Band};

/// State of the current association as reported by `iw dev <iface> link`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WifiLinkInfo {
    pub bssid: Option<String>,
    pub ssid: Option<String>,
    pub rssi_dbm: Option<f64>,
    pub freq_mhz: Option<u32>,
    pub tx_bitrate_mbps: Option<f64>,
    pub rx_bitrate_mbps: Option<f64>,
    pub band: Option<Band>,
    pub channel: Option<u32>,
}

struct LinkPatterns {
    connected: Regex,
    ssid: Regex,
    signal: Regex,
    freq: Regex,
    tx: Regex,
    rx: Regex,
}

fn link_patterns() -> &'static LinkPatterns {
    static RE: OnceLock<LinkPatterns> = OnceLock::new();
    RE.get_or_init(|| LinkPatterns {
        connected: Regex::new(r"Connected to\s+((?:[0-9a-fA-F]{2}:){5}[0-9a-fA-F]{2})").unwrap(),
        ssid: Regex::new(r"(?m)^\s*SSID:\s*(.+?)\s*$").unwrap(),
        signal: Regex::new(r"signal:\s*(-?\d+)\s*dBm").unwrap(),
        freq: Regex::new(r"freq:\s*(\d+)").unwrap(),
        tx: Regex::new(r"tx bitrate:\s*([0-9.]+)\s*MBit/s").unwrap(),
        rx: Regex::new(r"rx bitrate:\s*([0-9.]+)\s*MBit/s").unwrap(),
    })
}

/// Parse `iw link` output. Returns `None` when not associated or nothing matched.
pub fn parse_link(output: &str) -> Option<WifiLinkInfo> {
    if output.contains("Not connected.") {
        return None;
    }
    let re = link_patterns();
    let capture = |pattern: &Regex| pattern.captures(output).map(|c| c[1].to_string());

    let mut info = WifiLinkInfo {
        bssid: capture(&re.connected).map(|b| b.to_ascii_lowercase()),
        ssid: capture(&re.ssid),
        rssi_dbm: capture(&re.signal).and_then(|v| v.parse().ok()),
        freq_mhz: capture(&re.freq).and_then(|v| v.parse().ok()),
        tx_bitrate_mbps: capture(&re.tx).and_then(|v| v.parse().ok()),
        rx_bitrate_mbps: capture(&re.rx).and_then(|v| v.parse().ok()),
        ..Default::default()
    };
    if let Some(freq) = info.freq_mhz {
        let (band, channel) = band_channel(freq);
        info.band = band;
        info.channel = channel;
    }

    if info == WifiLinkInfo::default() {
        return None;
    }
    Some(info)
}

fn survey_active_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"channel active time:\s*(\d+)\s*ms").unwrap())
}

fn survey_busy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"channel busy time:\s*(\d+)\s*ms").unwrap())
}

/// Busy percentage of the in-use channel from `iw survey dump`.
pub fn parse_survey(output: &str) -> Option<f64> {
    let mut in_use = false;
    let mut active_ms: Option<u64> = None;
    let mut busy_ms: Option<u64> = None;

    for raw_line in output.lines() {
        let line = raw_line.trim();
        if line.starts_with("Survey data from") {
            in_use = line.contains("in use");
            active_ms = None;
            busy_ms = None;
            continue;
        }
        if line.contains("in use") {
            in_use = true;
        }
        if let Some(c) = survey_active_re().captures(line) {
            active_ms = c[1].parse().ok();
        }
        if let Some(c) = survey_busy_re().captures(line) {
            busy_ms = c[1].parse().ok();
        }
        if let (true, Some(active), Some(busy)) = (in_use, active_ms, busy_ms) {
            if active == 0 {
                return None;
            }
            return Some(busy as f64 / active as f64 * 100.0);
        }
    }
    None
}

/// Transmit retry percentage from `iw station dump`.
pub fn parse_station_retries(output: &str) -> Option<f64> {
    let mut tx_packets: Option<u64> = None;
    let mut tx_retries: Option<u64> = None;

    for raw_line in output.lines() {
        let line = raw_line.trim();
        if let Some(v) = line.strip_prefix("tx packets:") {
            tx_packets = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("tx retries:") {
            tx_retries = v.trim().parse().ok();
        }
    }

    match (tx_packets, tx_retries) {
        (Some(packets), Some(retries)) if packets > 0 => {
            Some(retries as f64 / packets as f64 * 100.0)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINK: &str = "\
Connected to A0:25:D7:DF:3E:70 (on wlan0)
\tSSID: Office
\tfreq: 5180
\tRX: 1234 bytes (10 packets)
\tTX: 567 bytes (5 packets)
\tsignal: -58 dBm
\trx bitrate: 433.3 MBit/s VHT-MCS 9 80MHz short GI VHT-NSS 1
\ttx bitrate: 390.0 MBit/s VHT-MCS 8 80MHz short GI VHT-NSS 1
";

    #[test]
    fn test_parse_link() {
        let info = parse_link(LINK).unwrap();
        assert_eq!(info.bssid.as_deref(), Some("a0:25:d7:df:3e:70"));
        assert_eq!(info.ssid.as_deref(), Some("Office"));
        assert_eq!(info.rssi_dbm, Some(-58.0));
        assert_eq!(info.freq_mhz, Some(5180));
        assert_eq!(info.channel, Some(36));
        assert_eq!(info.band, Some(Band::Ghz5));
        assert_eq!(info.rx_bitrate_mbps, Some(433.3));
        assert_eq!(info.tx_bitrate_mbps, Some(390.0));
    }

    #[test]
    fn test_parse_link_not_connected() {
        assert!(parse_link("Not connected.").is_none());
        assert!(parse_link("").is_none());
    }

    #[test]
    fn test_parse_survey() {
        let output = "\
Survey data from wlan0
\tfrequency:\t\t\t2412 MHz
\tnoise:\t\t\t\t-95 dBm
\tchannel active time:\t\t100 ms
\tchannel busy time:\t\t10 ms
Survey data from wlan0
\tfrequency:\t\t\t5180 MHz [in use]
\tnoise:\t\t\t\t-92 dBm
\tchannel active time:\t\t2000 ms
\tchannel busy time:\t\t500 ms
";
        let busy = parse_survey(output).unwrap();
        assert!((busy - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_station_retries() {
        let output = "Station a0:25:d7:df:3e:70 (on wlan0)\n\ttx packets:\t200\n\ttx retries:\t10\n";
        assert_eq!(parse_station_retries(output), Some(5.0));
        assert_eq!(parse_station_retries("tx packets: 0\ntx retries: 3"), None);
    }
}
