//! Parser for `iw dev <iface> scan` output, with an `nmcli` list fallback.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::{sanitize_ssid, AccessPoint};

fn bss_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^BSS\s+((?:[0-9a-f]{2}:){5}[0-9a-f]{2})").unwrap())
}

fn freq_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^freq:\s*(\d+)").unwrap())
}

fn signal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^signal:\s*(-?\d+(?:\.\d+)?)\s*dBm").unwrap())
}

fn width_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((\d+)\s*MHz\)").unwrap())
}

/// Parse raw scan text into access point records.
///
/// A `BSS <mac>` line opens a record; the open record is flushed when the
/// next one starts and at end of input. Inside a record, the HT operation
/// sub-block may widen the channel to 40 MHz via its secondary channel
/// offset, and any explicit `channel width: ... (<n> MHz)` line overrides
/// the width. Every record is stamped with `scan_time`.
pub fn parse_scan(output: &str, scan_time: DateTime<Utc>) -> Vec<AccessPoint> {
    let mut aps = Vec::new();
    let mut current: Option<AccessPoint> = None;
    let mut in_ht = false;

    for raw_line in output.lines() {
        // Sub-block entries are bulleted with "*" in current iw releases.
        let line = raw_line.trim().trim_start_matches('*').trim_start();

        if let Some(caps) = bss_re().captures(line) {
            if let Some(done) = current.take() {
                aps.push(done);
            }
            current = Some(AccessPoint::new(&caps[1], scan_time));
            in_ht = false;
            continue;
        }

        let Some(ap) = current.as_mut() else {
            continue;
        };

        if let Some(rest) = line.strip_prefix("SSID:") {
            ap.ssid = sanitize_ssid(Some(rest));
        } else if line.starts_with("freq:") {
            if let Some(freq) = freq_re()
                .captures(line)
                .and_then(|c| c[1].parse::<u32>().ok())
            {
                ap.set_freq(freq);
            }
        } else if line.starts_with("signal:") {
            if let Some(rssi) = signal_re()
                .captures(line)
                .and_then(|c| c[1].parse::<f64>().ok())
            {
                ap.rssi_dbm = Some(rssi);
            }
        } else if line.starts_with("HT operation:") {
            in_ht = true;
        } else if line.starts_with("VHT operation:") || line.starts_with("HE operation:") {
            in_ht = false;
        } else if in_ht && line.starts_with("secondary channel offset:") {
            if !line.contains("no secondary") {
                ap.width_mhz = 40;
            }
        } else if line.contains("channel width:") {
            if let Some(width) = width_re()
                .captures(line)
                .and_then(|c| c[1].parse::<u32>().ok())
            {
                ap.width_mhz = width;
            }
        }
    }

    if let Some(done) = current {
        aps.push(done);
    }
    aps
}

/// Parse `nmcli -t -f BSSID,SSID,CHAN,FREQ,SIGNAL,SECURITY dev wifi list` output.
///
/// Used when `iw` cannot scan a busy interface. nmcli reports signal as a
/// 0-100 quality, converted here to an approximate dBm value.
pub fn parse_nmcli_list(output: &str, scan_time: DateTime<Utc>) -> Vec<AccessPoint> {
    let mut aps = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Terse mode escapes the colons inside the BSSID.
        let unescaped = line.replace("\\:", ":");
        let parts: Vec<&str> = unescaped.split(':').collect();
        if parts.len() < 10 {
            continue;
        }

        let bssid = parts[..6].join(":");
        let mut ap = AccessPoint::new(&bssid, scan_time);
        ap.ssid = sanitize_ssid(Some(parts[6]));

        let freq = parts[8]
            .trim()
            .trim_end_matches("MHz")
            .trim()
            .parse::<u32>()
            .ok();
        if let Some(freq) = freq {
            ap.set_freq(freq);
        }
        if ap.channel.is_none() {
            ap.channel = parts[7].trim().parse::<u32>().ok().filter(|c| *c > 0);
        }

        ap.rssi_dbm = parts[9]
            .trim()
            .parse::<f64>()
            .ok()
            .map(|quality| (quality / 2.0 - 100.0).trunc());

        aps.push(ap);
    }
    aps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wifi::{Band, HIDDEN_SSID};

    const SAMPLE_SCAN: &str = "\
BSS 00:11:22:33:44:55(on wlan0)
\tfreq: 2412
\tsignal: -45.00 dBm
\tSSID: TestNet
\tHT operation:
\t\tprimary channel: 1
\t\tsecondary channel offset: above
BSS 66:77:88:99:AA:BB(on wlan0)
\tfreq: 5180
\tsignal: -60.00 dBm
\tSSID: FiveGig
\tVHT operation:
\t\tchannel width: 1 (80 MHz)
";

    #[test]
    fn test_parse_scan_sample() {
        let now = Utc::now();
        let aps = parse_scan(SAMPLE_SCAN, now);
        assert_eq!(aps.len(), 2);

        let first = &aps[0];
        assert_eq!(first.bssid, "00:11:22:33:44:55");
        assert_eq!(first.ssid, "TestNet");
        assert_eq!(first.band, Some(Band::Ghz2_4));
        assert_eq!(first.channel, Some(1));
        assert_eq!(first.width_mhz, 40);
        assert_eq!(first.rssi_dbm, Some(-45.0));

        let second = &aps[1];
        assert_eq!(second.bssid, "66:77:88:99:aa:bb");
        assert_eq!(second.band, Some(Band::Ghz5));
        assert_eq!(second.channel, Some(36));
        assert_eq!(second.width_mhz, 80);
        assert_eq!(second.last_seen, now);
    }

    #[test]
    fn test_parse_scan_no_secondary_keeps_20() {
        let text = "\
BSS aa:bb:cc:dd:ee:ff
\tfreq: 2437
\tSSID:
\tHT operation:
\t\t * secondary channel offset: no secondary
";
        let aps = parse_scan(text, Utc::now());
        assert_eq!(aps.len(), 1);
        assert_eq!(aps[0].width_mhz, 20);
        assert_eq!(aps[0].ssid, HIDDEN_SSID);
        assert_eq!(aps[0].rssi_dbm, None);
    }

    #[test]
    fn test_parse_scan_offset_outside_ht_ignored() {
        let text = "\
BSS aa:bb:cc:dd:ee:ff
\tfreq: 5180
\tVHT operation:
\t\t * secondary channel offset: above
";
        let aps = parse_scan(text, Utc::now());
        assert_eq!(aps[0].width_mhz, 20);
    }

    #[test]
    fn test_parse_scan_garbage() {
        assert!(parse_scan("", Utc::now()).is_empty());
        assert!(parse_scan("command failed: Device or resource busy (-16)", Utc::now()).is_empty());
    }

    #[test]
    fn test_parse_nmcli_list() {
        let text = "AA\\:BB\\:CC\\:DD\\:EE\\:FF:Office:6:2437 MHz:80:WPA2\n\
                    11\\:22\\:33\\:44\\:55\\:66::36:5180 MHz:40:WPA2\n";
        let aps = parse_nmcli_list(text, Utc::now());
        assert_eq!(aps.len(), 2);
        assert_eq!(aps[0].bssid, "aa:bb:cc:dd:ee:ff");
        assert_eq!(aps[0].ssid, "Office");
        assert_eq!(aps[0].channel, Some(6));
        assert_eq!(aps[0].rssi_dbm, Some(-60.0));
        assert_eq!(aps[1].ssid, HIDDEN_SSID);
        assert_eq!(aps[1].band, Some(Band::Ghz5));
        assert_eq!(aps[1].rssi_dbm, Some(-80.0));
    }
}
