//! Parsers for interface and host facts reported by `ip`, `nmcli` and `/proc`.

use std::sync::OnceLock;

use regex::Regex;

pub const UNKNOWN: &str = "unknown";

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"inet\s+(\d+\.\d+\.\d+\.\d+)/\d+").unwrap())
}

fn gateway_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"default via (\S+)").unwrap())
}

fn dhcp_identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"dhcp_server_identifier\s*=\s*([0-9.]+)").unwrap())
}

/// First IPv4 address in `ip -4 addr show` output.
pub fn parse_ipv4(output: &str) -> Option<String> {
    ipv4_re().captures(output).map(|c| c[1].to_string())
}

/// Default gateway for `iface` in `ip route` output.
pub fn parse_default_gateway(output: &str, iface: &str) -> Option<String> {
    let dev = format!("dev {}", iface);
    output
        .lines()
        .filter(|line| line.starts_with("default") && line.contains(&dev))
        .find_map(|line| gateway_re().captures(line).map(|c| c[1].to_string()))
}

/// Map an nmcli IPv4 method to the label shown in network info.
pub fn ip_config_label(method: &str) -> String {
    match method.trim().to_lowercase().as_str() {
        "" => "Unknown".to_string(),
        "auto" => "DHCP".to_string(),
        "manual" => "Static".to_string(),
        other => other.to_uppercase(),
    }
}

/// DHCP server from the `DHCP4` option dump, when `IP4.DHCP_SERVER` is absent.
pub fn parse_dhcp_identifier(lines: &[String]) -> Option<String> {
    dhcp_identifier_re()
        .captures(&lines.join(" "))
        .map(|c| c[1].to_string())
}

/// Resolver addresses from `nmcli -g IP4.DNS` lines, split on `,`, `|` or whitespace.
pub fn parse_dns_tokens(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .flat_map(|line| line.split(|c: char| c == ',' || c == '|' || c.is_whitespace()))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Active SSID from `nmcli -t -f ACTIVE,SSID dev wifi list`.
pub fn parse_active_ssid(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("yes:").map(str::to_string))
}

/// Neighbours in an active state in `ip neigh show` output; at least 1 for the sensor itself.
pub fn count_neighbours(output: &str) -> u32 {
    const ACTIVE: [&str; 4] = ["REACHABLE", "STALE", "DELAY", "PROBE"];
    let count = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && ACTIVE.iter().any(|state| line.contains(state)))
        .count() as u32;
    count.max(1)
}

/// Value of the `Serial` line in `/proc/cpuinfo`.
pub fn parse_cpuinfo_serial(cpuinfo: &str) -> Option<String> {
    cpuinfo
        .lines()
        .filter(|line| line.to_lowercase().starts_with("serial"))
        .find_map(|line| {
            let (_, value) = line.split_once(':')?;
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        })
}

/// Trimmed text with NULs removed, or `None` when empty.
pub fn clean_text(raw: &[u8]) -> Option<String> {
    let text: String = String::from_utf8_lossy(raw).chars().filter(|c| *c != '\0').collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Substitute [`UNKNOWN`] for a missing or blank value.
pub fn or_unknown(value: Option<String>) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let output = "3: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n    inet 192.168.1.23/24 brd 192.168.1.255 scope global dynamic wlan0\n";
        assert_eq!(parse_ipv4(output).as_deref(), Some("192.168.1.23"));
        assert!(parse_ipv4("3: wlan0: <NO-CARRIER> mtu 1500").is_none());
    }

    #[test]
    fn test_parse_default_gateway() {
        let output = "default via 10.0.0.1 dev eth0 proto dhcp metric 100\ndefault via 192.168.1.1 dev wlan0 proto dhcp metric 600\n192.168.1.0/24 dev wlan0 proto kernel";
        assert_eq!(parse_default_gateway(output, "wlan0").as_deref(), Some("192.168.1.1"));
        assert_eq!(parse_default_gateway(output, "eth0").as_deref(), Some("10.0.0.1"));
        assert!(parse_default_gateway(output, "eth1").is_none());
    }

    #[test]
    fn test_ip_config_label() {
        assert_eq!(ip_config_label("auto"), "DHCP");
        assert_eq!(ip_config_label("manual\n"), "Static");
        assert_eq!(ip_config_label("link-local"), "LINK-LOCAL");
        assert_eq!(ip_config_label(""), "Unknown");
    }

    #[test]
    fn test_dns_and_dhcp_lines() {
        let lines = vec!["1.1.1.1 | 8.8.8.8".to_string(), "9.9.9.9".to_string()];
        assert_eq!(parse_dns_tokens(&lines), vec!["1.1.1.1", "8.8.8.8", "9.9.9.9"]);

        let dhcp = vec!["ip_address = 10.0.0.5".to_string(), "dhcp_server_identifier = 10.0.0.1".to_string()];
        assert_eq!(parse_dhcp_identifier(&dhcp).as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_parse_active_ssid() {
        let output = "no:Neighbour\nyes:Office WiFi\nno:Other\n";
        assert_eq!(parse_active_ssid(output).as_deref(), Some("Office WiFi"));
        assert!(parse_active_ssid("no:Neighbour\n").is_none());
    }

    #[test]
    fn test_count_neighbours() {
        let output = "10.0.0.1 lladdr aa:bb:cc:dd:ee:ff REACHABLE\n10.0.0.7 lladdr aa:bb:cc:dd:ee:01 STALE\n10.0.0.9 FAILED\n";
        assert_eq!(count_neighbours(output), 2);
        assert_eq!(count_neighbours(""), 1);
    }

    #[test]
    fn test_parse_cpuinfo_serial() {
        let cpuinfo = "processor\t: 0\nHardware\t: BCM2835\nSerial\t\t: 10000000abcdef01\nModel\t\t: Raspberry Pi 4\n";
        assert_eq!(parse_cpuinfo_serial(cpuinfo).as_deref(), Some("10000000abcdef01"));
        assert!(parse_cpuinfo_serial("processor\t: 0\n").is_none());
    }

    #[test]
    fn test_clean_text_and_unknown() {
        assert_eq!(clean_text(b"Raspberry Pi 4\0").as_deref(), Some("Raspberry Pi 4"));
        assert!(clean_text(b"\0\n").is_none());
        assert_eq!(or_unknown(None), "unknown");
        assert_eq!(or_unknown(Some(" ".into())), "unknown");
        assert_eq!(or_unknown(Some("x".into())), "x");
    }
}
