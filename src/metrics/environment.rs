//! Environment-scan series: one series pair per access point plus per-channel aggregates.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use super::catalog;
use super::series::{Observation, SeriesFamily, SeriesTracker};
use crate::wifi::{AccessPoint, Band};

/// Per-AP rssi and last-seen gauges, scoped by (sensor, network).
pub const AP_FAMILY: SeriesFamily = SeriesFamily {
    metrics: &[catalog::WIFI_ENV_AP_RSSI_DBM, catalog::WIFI_ENV_AP_LAST_SEEN_SECONDS],
    scope_len: 2,
};

/// Per-channel count, max and mean rssi, scoped by (sensor, network).
pub const CHANNEL_FAMILY: SeriesFamily = SeriesFamily {
    metrics: &[
        catalog::WIFI_ENV_CHANNEL_AP_COUNT,
        catalog::WIFI_ENV_CHANNEL_MAX_RSSI_DBM,
        catalog::WIFI_ENV_CHANNEL_AVG_RSSI_DBM,
    ],
    scope_len: 2,
};

/// Aggregate of the access points heard on one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStats {
    pub count: usize,
    pub max_rssi_dbm: f64,
    pub mean_rssi_dbm: f64,
}

/// Group access points by (band, channel). Records missing either, or rssi, are skipped.
pub fn channel_stats(aps: &[AccessPoint]) -> BTreeMap<(Band, u32), ChannelStats> {
    let mut sums: BTreeMap<(Band, u32), (usize, f64, f64)> = BTreeMap::new();
    for ap in aps {
        let (Some(band), Some(channel), Some(rssi)) = (ap.band, ap.channel, ap.rssi_dbm) else {
            continue;
        };
        let entry = sums.entry((band, channel)).or_insert((0, 0.0, f64::MIN));
        entry.0 += 1;
        entry.1 += rssi;
        entry.2 = entry.2.max(rssi);
    }
    sums.into_iter()
        .map(|(key, (count, sum, max))| {
            let stats = ChannelStats {
                count,
                max_rssi_dbm: max,
                mean_rssi_dbm: sum / count as f64,
            };
            (key, stats)
        })
        .collect()
}

/// Publish one scan of `network` and remove series of access points it no longer sees.
///
/// The TTL sweep across all networks is applied afterwards.
pub fn publish_environment(
    tracker: &mut SeriesTracker,
    sensor: &str,
    network: &str,
    iface: &str,
    aps: &[AccessPoint],
    now: DateTime<Utc>,
    ttl: Duration,
) {
    let scope = [sensor, network];

    let ap_observations = aps
        .iter()
        .filter_map(|ap| {
            let (band, channel) = (ap.band?, ap.channel?);
            let key = vec![
                sensor.to_string(),
                network.to_string(),
                iface.to_string(),
                ap.ssid.clone(),
                ap.bssid.clone(),
                band.as_str().to_string(),
                channel.to_string(),
                ap.width_mhz.to_string(),
            ];
            Some(Observation {
                key,
                values: vec![ap.rssi_dbm, Some(ap.last_seen.timestamp() as f64)],
                seen: ap.last_seen,
            })
        })
        .collect();
    let removed = tracker.reconcile(&AP_FAMILY, &scope, ap_observations);
    if removed > 0 {
        tracing::debug!("Environment: {} access points gone on {}", removed, network);
    }
    expire_environment(tracker, now, ttl);

    let channel_observations = channel_stats(aps)
        .into_iter()
        .map(|((band, channel), stats)| Observation {
            key: vec![
                sensor.to_string(),
                network.to_string(),
                band.as_str().to_string(),
                channel.to_string(),
            ],
            values: vec![
                Some(stats.count as f64),
                Some(stats.max_rssi_dbm),
                Some(stats.mean_rssi_dbm),
            ],
            seen: now,
        })
        .collect();
    tracker.reconcile(&CHANNEL_FAMILY, &scope, channel_observations);
}

/// Drop access point series that no scan has refreshed within `ttl`.
pub fn expire_environment(tracker: &mut SeriesTracker, now: DateTime<Utc>, ttl: Duration) {
    let expired = tracker.expire(&AP_FAMILY, now, ttl);
    if expired > 0 {
        tracing::debug!("Environment: expired {} access point series", expired);
    }
}
