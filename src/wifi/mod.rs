//! Wi-Fi environment model and text parsers for `iw` output.
//!
//! Everything in here is pure: raw command output goes in, typed records
//! come out. Parsers never fail; unrecognized lines are ignored.

mod link;
mod scan;

pub use link::*;
pub use scan::*;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Longest SSID the label layer will carry.
const MAX_SSID_LEN: usize = 32;

/// Label used when an SSID is missing or blank.
pub const HIDDEN_SSID: &str = "<hidden>";

/// Wi-Fi frequency band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Band {
    #[serde(rename = "2.4")]
    Ghz2_4,
    #[serde(rename = "5")]
    Ghz5,
    #[serde(rename = "6")]
    Ghz6,
}

impl Band {
    pub const ALL: [Band; 3] = [Band::Ghz2_4, Band::Ghz5, Band::Ghz6];

    /// Label value used in metric series.
    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Ghz2_4 => "2.4",
            Band::Ghz5 => "5",
            Band::Ghz6 => "6",
        }
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive band and channel from a center frequency in MHz.
///
/// Frequencies outside the three Wi-Fi bands yield `(None, None)`; a
/// computed channel of zero or below is reported as unknown.
pub fn band_channel(freq_mhz: u32) -> (Option<Band>, Option<u32>) {
    let freq = freq_mhz as i64;
    let (band, raw_channel) = match freq {
        2400..=2499 => (Band::Ghz2_4, (freq - 2407) / 5),
        5000..=5899 => (Band::Ghz5, (freq - 5000) / 5),
        5950..=7124 => (Band::Ghz6, (freq - 5950) / 5),
        _ => return (None, None),
    };
    let channel = if raw_channel > 0 {
        Some(raw_channel as u32)
    } else {
        None
    };
    (Some(band), channel)
}

/// Normalize an SSID for use as a label value.
pub fn sanitize_ssid(ssid: Option<&str>) -> String {
    let value = ssid.map(str::trim).unwrap_or_default();
    if value.is_empty() {
        return HIDDEN_SSID.to_string();
    }
    value.chars().take(MAX_SSID_LEN).collect()
}

/// A single access point observed in an environment scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessPoint {
    /// Lower-cased MAC address.
    pub bssid: String,
    pub ssid: String,
    pub freq_mhz: Option<u32>,
    pub band: Option<Band>,
    pub channel: Option<u32>,
    /// Channel width in MHz, 20 unless the scan says otherwise.
    pub width_mhz: u32,
    pub rssi_dbm: Option<f64>,
    pub last_seen: DateTime<Utc>,
}

impl AccessPoint {
    fn new(bssid: &str, scan_time: DateTime<Utc>) -> Self {
        Self {
            bssid: bssid.to_ascii_lowercase(),
            ssid: HIDDEN_SSID.to_string(),
            freq_mhz: None,
            band: None,
            channel: None,
            width_mhz: 20,
            rssi_dbm: None,
            last_seen: scan_time,
        }
    }

    fn set_freq(&mut self, freq_mhz: u32) {
        let (band, channel) = band_channel(freq_mhz);
        self.freq_mhz = Some(freq_mhz);
        self.band = band;
        self.channel = channel;
    }
}

/// Keep access points at or above `min_rssi_dbm`, strongest first, at most `max_aps`.
///
/// Records without a signal reading are dropped.
pub fn select_access_points(
    mut aps: Vec<AccessPoint>,
    min_rssi_dbm: f64,
    max_aps: usize,
) -> Vec<AccessPoint> {
    aps.retain(|ap| matches!(ap.rssi_dbm, Some(rssi) if rssi >= min_rssi_dbm));
    aps.sort_by(|a, b| {
        let a = a.rssi_dbm.unwrap_or(f64::MIN);
        let b = b.rssi_dbm.unwrap_or(f64::MIN);
        b.total_cmp(&a)
    });
    aps.truncate(max_aps);
    aps
}
