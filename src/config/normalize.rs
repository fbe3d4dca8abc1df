//! One pass from loosely shaped YAML into [`SensorConfig`].
//!
//! Several generations of config layout are accepted: a `services` block,
//! `targets.icmp_internal`/`icmp_external`, `targets.internal.icmp` and the
//! legacy flat `targets.icmp` list. Everything shape-dependent lives here.

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

use super::model::*;
use crate::incident::IncidentThresholds;

pub const MAX_NETWORKS: usize = 4;
const DEFAULT_EXTERNAL_URL: &str = "https://www.google.com";

/// Normalize a parsed YAML document.
pub fn normalize(root: &Value) -> SensorConfig {
    let services = services(root);
    let external_http_url = external_http_url(root, &services);
    let networks = build_networks(root, &external_http_url);

    let mut schedule: ScheduleConfig = section(root, "schedule");
    if root.get("schedule").is_none() {
        if let Some(delay) = root.get("inter_test_delay_seconds").and_then(Value::as_f64) {
            schedule.inter_test_delay_seconds = delay;
        }
        if let Some(delay) = root.get("inter_cycle_delay_seconds").and_then(Value::as_f64) {
            schedule.inter_cycle_delay_seconds = delay;
        }
    }

    let mut dns: DnsConfig = section(root, "dns");
    if let Some(domain) = root.get("dns_domain").and_then(scalar_string) {
        if root.get("dns").is_none() {
            dns.domain = domain;
        }
    }

    let mut incidents: IncidentConfig = section(root, "incidents");
    if let Some(path) = root.get("incident_state_path").and_then(scalar_string) {
        incidents.state_path = path;
    }

    SensorConfig {
        sensor_name: root
            .get("sensor_name")
            .and_then(scalar_string)
            .unwrap_or_else(default_sensor_name),
        metrics_port: root
            .get("metrics_port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(9105),
        networks,
        services,
        external_http_url,
        thresholds: section::<IncidentThresholds>(root, "incident_thresholds"),
        incidents,
        wifi_environment: section(root, "wifi_environment"),
        throughput: section(root, "throughput_test"),
        schedule,
        dns,
        location: location(root),
        results: section(root, "results"),
    }
}

/// Deserialize an optional section, keeping defaults when it is absent or malformed.
fn section<T: DeserializeOwned + Default>(root: &Value, key: &str) -> T {
    match root.get(key) {
        None | Some(Value::Null) => T::default(),
        Some(value) => serde_yaml::from_value(value.clone()).unwrap_or_else(|e| {
            tracing::warn!("Config: ignoring malformed section {}: {}", key, e);
            T::default()
        }),
    }
}

fn default_sensor_name() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "netsensor".to_string())
}

/// Render a scalar as trimmed text. Empty strings count as absent.
fn scalar_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn field(map: &Mapping, key: &str) -> Option<String> {
    map.get(key).and_then(scalar_string)
}

fn first_field(map: &Mapping, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| field(map, key))
}

fn nested<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root, |value, key| value.get(*key))
}

/// A list of targets given as plain strings or `{target|host|address}` maps.
pub fn target_entries(value: Option<&Value>) -> Vec<String> {
    let Some(items) = value.and_then(Value::as_sequence) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Mapping(map) => first_field(map, &["target", "host", "address"]),
            other => scalar_string(other),
        })
        .collect()
}

/// Test list as a sequence or a single scalar, aliases resolved, duplicates dropped.
fn tests(value: Option<&Value>, service: &str) -> Vec<TestKind> {
    let values: Vec<&Value> = match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(items)) => items.iter().collect(),
        Some(other) => vec![other],
    };

    let mut kinds = Vec::new();
    for name in values.into_iter().filter_map(scalar_string) {
        match TestKind::parse(&name) {
            Some(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Some(_) => {}
            None => tracing::warn!("Config: service {} has unknown test {}", service, name),
        }
    }
    kinds
}

/// Entries of `services.<scope>`.
pub fn service_entries(value: Option<&Value>, scope: Scope) -> Vec<ServiceTarget> {
    let Some(items) = value.and_then(Value::as_sequence) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(Value::as_mapping)
        .map(|map| {
            let target = first_field(map, &["target", "host", "address"]).unwrap_or_default();
            let name = field(map, "name")
                .or_else(|| (!target.is_empty()).then(|| target.clone()))
                .unwrap_or_else(|| "unnamed".to_string());
            let mut kinds = tests(map.get("tests"), &name);
            if kinds.is_empty() {
                tracing::warn!("Config: service {} has no tests; defaulting to icmp", name);
                kinds.push(TestKind::Icmp);
            }
            let frequency = field(map, "frequency").unwrap_or_else(|| "fastest".to_string());
            ServiceTarget {
                scope,
                name,
                target,
                tests: kinds,
                frequency_seconds: frequency_seconds(&frequency),
            }
        })
        .collect()
}

/// ICMP targets from the `targets` block, de-duplicated per scope.
pub fn legacy_icmp_targets(root: &Value) -> (Vec<String>, Vec<String>) {
    let targets = root.get("targets");
    let at = |path: &[&str]| targets.and_then(|t| nested(t, path));

    let mut internal = target_entries(at(&["icmp_internal"]));
    internal.extend(target_entries(at(&["internal", "icmp"])));

    let mut external = target_entries(at(&["icmp_external"]));
    external.extend(target_entries(at(&["external", "icmp"])));
    external.extend(target_entries(at(&["icmp"])));

    (dedup(internal), dedup(external))
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    unique
}

/// All services, internal before external, with legacy ICMP targets folded in.
pub fn services(root: &Value) -> Vec<ServiceTarget> {
    let block = root.get("services");
    let mut internal = service_entries(block.and_then(|b| b.get("internal")), Scope::Internal);
    let mut external = service_entries(block.and_then(|b| b.get("external")), Scope::External);

    let (legacy_internal, legacy_external) = legacy_icmp_targets(root);
    fold_legacy(&mut internal, legacy_internal, Scope::Internal);
    fold_legacy(&mut external, legacy_external, Scope::External);

    internal.extend(external);
    internal
}

fn fold_legacy(services: &mut Vec<ServiceTarget>, targets: Vec<String>, scope: Scope) {
    for target in targets {
        let host = extract_host(&target);
        let covered = services
            .iter()
            .any(|s| s.has(TestKind::Icmp) && s.host() == host);
        if covered {
            continue;
        }
        services.push(ServiceTarget {
            scope,
            name: host.clone(),
            target: host,
            tests: vec![TestKind::Icmp],
            frequency_seconds: 0,
        });
    }
}

/// URL for the per-network external reachability check.
///
/// Precedence: `external_http.url`, the first external service with an
/// http test, `targets.http_external` / `targets.external_http`,
/// `targets.external.http`, top-level `external_url`, then a default.
pub fn external_http_url(root: &Value, services: &[ServiceTarget]) -> String {
    if let Some(url) = nested(root, &["external_http", "url"]).and_then(scalar_string) {
        return url;
    }

    if let Some(service) = services
        .iter()
        .find(|s| s.scope == Scope::External && s.has(TestKind::Http))
    {
        return normalize_http_target(&service.target);
    }

    let targets = root.get("targets");
    let candidates = ["http_external", "external_http"]
        .iter()
        .map(|key| vec![*key])
        .chain(std::iter::once(vec!["external", "http"]));
    for path in candidates {
        let found = target_entries(targets.and_then(|t| nested(t, &path)));
        if let Some(first) = found.into_iter().next() {
            return first;
        }
    }

    root.get("external_url")
        .and_then(scalar_string)
        .unwrap_or_else(|| DEFAULT_EXTERNAL_URL.to_string())
}

/// Wireless entries first, then wired, at most [`MAX_NETWORKS`].
pub fn build_networks(root: &Value, external_http_url: &str) -> Vec<NetworkTarget> {
    let mut networks = Vec::new();
    let entries = |key: &str| -> Vec<Mapping> {
        root.get(key)
            .and_then(Value::as_sequence)
            .map(|items| items.iter().filter_map(Value::as_mapping).cloned().collect())
            .unwrap_or_default()
    };

    for entry in entries("wifi") {
        let (Some(iface), Some(ssid)) = (field(&entry, "iface"), field(&entry, "ssid")) else {
            tracing::warn!("Config: skipping wifi entry without iface/ssid");
            continue;
        };
        networks.push(NetworkTarget {
            name: field(&entry, "name").unwrap_or_else(|| format!("wifi-{}", ssid)),
            kind: NetworkKind::Wifi,
            iface,
            password: Some(field(&entry, "password").unwrap_or_default()),
            ssid: Some(ssid),
            eap_method: field(&entry, "eap_method"),
            phase2_auth: field(&entry, "phase2_auth"),
            identity: field(&entry, "identity"),
            anonymous_identity: field(&entry, "anonymous_identity"),
            bssid_lock: field(&entry, "bssid_lock"),
            external_url: field(&entry, "external_url")
                .unwrap_or_else(|| external_http_url.to_string()),
        });
    }

    for entry in entries("wired") {
        let Some(iface) = field(&entry, "iface") else {
            tracing::warn!("Config: skipping wired entry without iface");
            continue;
        };
        networks.push(NetworkTarget {
            name: field(&entry, "name").unwrap_or_else(|| format!("wired-{}", iface)),
            kind: NetworkKind::Wired,
            iface,
            ssid: None,
            password: None,
            eap_method: None,
            phase2_auth: None,
            identity: None,
            anonymous_identity: None,
            bssid_lock: None,
            external_url: field(&entry, "external_url")
                .unwrap_or_else(|| external_http_url.to_string()),
        });
    }

    if networks.len() > MAX_NETWORKS {
        tracing::warn!(
            "Config: {} networks configured, using the first {}",
            networks.len(),
            MAX_NETWORKS
        );
        networks.truncate(MAX_NETWORKS);
    }
    networks
}

fn location(root: &Value) -> Option<Location> {
    let block = root.get("location")?;
    let lat = block.get("lat").and_then(scalar_string)?;
    let lon = block.get("lon").and_then(scalar_string)?;
    Some(Location {
        lat,
        lon,
        address_notes: block
            .get("address_notes")
            .and_then(scalar_string)
            .unwrap_or_default(),
    })
}
