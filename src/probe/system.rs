//! [`ProbeProvider`] backed by the usual Linux networking tools.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use super::*;
use crate::config::NetworkTarget;
use crate::wifi::{parse_link, parse_station_retries, parse_survey, WifiLinkInfo};

const SHORT: Duration = Duration::from_secs(5);
const DHCP_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandOutput {
    /// stdout followed by stderr; several tools print useful lines on either.
    pub fn text(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Run `program` with a deadline. A command that overruns is killed and reported as timed out.
///
/// Only failing to spawn the program is an error.
pub async fn run_command<S: AsRef<OsStr>>(
    program: &str,
    args: &[S],
    timeout: Duration,
) -> Result<CommandOutput, ProbeError> {
    let start = Instant::now();
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            success: output.status.success(),
            timed_out: false,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: start.elapsed(),
        }),
        Ok(Err(e)) => Err(ProbeError::Command(format!("failed to execute {}: {}", program, e))),
        Err(_) => {
            tracing::debug!("Command {} timed out after {:?}", program, timeout);
            Ok(CommandOutput {
                success: false,
                timed_out: true,
                stdout: String::new(),
                stderr: String::new(),
                elapsed: start.elapsed(),
            })
        }
    }
}

/// Successful output of a command, treating spawn errors like any other failure.
async fn run_ok<S: AsRef<OsStr>>(program: &str, args: &[S], timeout: Duration) -> Option<CommandOutput> {
    match run_command(program, args, timeout).await {
        Ok(output) if output.success => Some(output),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("{}", e);
            None
        }
    }
}

/// Linux probe provider.
pub struct SystemProbe {
    http: reqwest::Client,
    /// Does not follow redirects, for captive portal detection.
    portal: reqwest::Client,
}

impl SystemProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;
        let portal = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;
        Ok(Self { http, portal })
    }

    async fn interface_ipv4(&self, iface: &str) -> Option<String> {
        let output = run_ok("ip", &["-4", "addr", "show", "dev", iface], Duration::from_secs(3)).await?;
        parse_ipv4(&output.stdout)
    }

    async fn nmcli_lines(&self, iface: &str, field: &str) -> Vec<String> {
        let Some(output) = run_ok("nmcli", &["-g", field, "dev", "show", iface], SHORT).await else {
            return Vec::new();
        };
        output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    async fn ip_config(&self, iface: &str) -> String {
        let mut lines = self.nmcli_lines(iface, "IPV4.METHOD").await;
        if lines.is_empty() {
            lines = self.nmcli_lines(iface, "IP4.METHOD").await;
        }
        if let Some(method) = lines.first() {
            return ip_config_label(method);
        }

        let connection = self.nmcli_lines(iface, "GENERAL.CONNECTION").await;
        if let Some(name) = connection.first() {
            let args = ["-g", "ipv4.method", "connection", "show", name.as_str()];
            if let Some(output) = run_ok("nmcli", &args, SHORT).await {
                return ip_config_label(&output.stdout);
            }
        }
        ip_config_label("")
    }

    async fn dhcp_server(&self, iface: &str) -> String {
        if let Some(server) = self.nmcli_lines(iface, "IP4.DHCP_SERVER").await.into_iter().next() {
            return or_unknown(Some(server));
        }
        or_unknown(parse_dhcp_identifier(&self.nmcli_lines(iface, "DHCP4").await))
    }

    async fn gateway(&self, iface: &str) -> Option<String> {
        let output = run_ok("ip", &["route"], SHORT).await?;
        parse_default_gateway(&output.stdout, iface)
    }

    async fn active_ssid(&self, iface: &str) -> Option<String> {
        let args = ["-t", "-f", "ACTIVE,SSID", "dev", "wifi", "list", "ifname", iface];
        let output = run_ok("nmcli", &args, SHORT).await?;
        parse_active_ssid(&output.stdout)
    }

    async fn connect_enterprise(
        &self,
        network: &NetworkTarget,
        ssid: &str,
        total: &mut Duration,
    ) -> Result<StepResult, ProbeError> {
        let con_name = format!("netsensor-{}", ssid);
        run_command("nmcli", &["con", "delete", con_name.as_str()], SHORT).await?;

        let eap = network.eap_method.as_deref().unwrap_or_default().to_lowercase();
        let mut args: Vec<String> = [
            "con", "add", "type", "wifi", "ifname", &network.iface, "con-name", &con_name, "ssid", ssid,
            "wifi-sec.key-mgmt", "wpa-eap", "802-1x.eap", &eap,
            "802-1x.identity", network.identity.as_deref().unwrap_or_default(),
            "802-1x.password", network.password.as_deref().unwrap_or_default(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(bssid) = &network.bssid_lock {
            tracing::info!("BSSID lock enabled: {}", bssid);
            args.extend(["wifi.bssid".to_string(), bssid.clone()]);
        }
        if let Some(phase2) = &network.phase2_auth {
            args.extend(["802-1x.phase2-auth".to_string(), phase2.to_lowercase()]);
        }
        if let Some(anonymous) = &network.anonymous_identity {
            args.extend(["802-1x.anonymous-identity".to_string(), anonymous.clone()]);
        }
        args.extend(["802-1x.system-ca-certs", "no", "802-1x.ca-cert", ""].map(String::from));

        let add = run_command("nmcli", &args, Duration::from_secs(10)).await?;
        *total += add.elapsed;
        if !add.success {
            tracing::warn!("Failed to create 802.1X profile {}: {}", con_name, add.stderr.trim());
            return Ok(StepResult::failure(*total, "nmcli_create_802.1x_failed"));
        }

        let up = run_command("nmcli", &["con", "up", con_name.as_str()], Duration::from_secs(30)).await?;
        *total += up.elapsed;
        if !up.success {
            tracing::warn!("Failed to bring up 802.1X network {}: {}", ssid, up.stderr.trim());
            return Ok(StepResult::failure(*total, "nmcli_802.1x_connect_failed"));
        }
        Ok(StepResult::success(*total))
    }
}

#[async_trait]
impl ProbeProvider for SystemProbe {
    async fn associate(&self, network: &NetworkTarget) -> Result<StepResult, ProbeError> {
        let ssid = network
            .ssid
            .as_deref()
            .ok_or_else(|| ProbeError::Config(format!("network {} has no ssid", network.name)))?;
        let iface = network.iface.as_str();
        let mut total = Duration::ZERO;

        // Always re-associate so the measured time is a fresh join.
        if self.active_ssid(iface).await.is_some() {
            let disconnect = run_command("nmcli", &["dev", "disconnect", iface], Duration::from_secs(10)).await?;
            total += disconnect.elapsed;
        }

        let radio = run_command("nmcli", &["radio", "wifi", "on"], SHORT).await?;
        total += radio.elapsed;
        if !radio.success {
            return Ok(StepResult::failure(total, "nmcli_radio_on_failed"));
        }

        if network.is_enterprise() {
            return self.connect_enterprise(network, ssid, &mut total).await;
        }

        let mut args = vec!["dev", "wifi", "connect", ssid];
        if let Some(password) = network.password.as_deref().filter(|p| !p.is_empty()) {
            args.extend(["password", password]);
        }
        args.extend(["ifname", iface]);
        if let Some(bssid) = network.bssid_lock.as_deref() {
            tracing::info!("BSSID lock enabled: {}", bssid);
            args.extend(["bssid", bssid]);
        }

        let connect = run_command("nmcli", &args, Duration::from_secs(20)).await?;
        total += connect.elapsed;
        if !connect.success {
            return Ok(StepResult::failure(total, "nmcli_connect_failed"));
        }
        Ok(StepResult::success(total))
    }

    async fn acquire_lease(
        &self,
        iface: &str,
        timeout: Duration,
    ) -> Result<(StepResult, Option<String>), ProbeError> {
        let start = Instant::now();

        if run_ok("dhclient", &["-1", "-v", iface], timeout).await.is_some() {
            if let Some(ip) = self.interface_ipv4(iface).await {
                return Ok((StepResult::success(start.elapsed()), Some(ip)));
            }
        }

        let reapply = run_command("nmcli", &["device", "reapply", iface], Duration::from_secs(10)).await?;
        if !reapply.success {
            run_command("nmcli", &["device", "connect", iface], Duration::from_secs(10)).await?;
        }

        let mut backoff = Duration::from_secs(1);
        while start.elapsed() < timeout {
            if let Some(ip) = self.interface_ipv4(iface).await {
                return Ok((StepResult::success(start.elapsed()), Some(ip)));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(DHCP_BACKOFF_MAX);
        }

        Ok((
            StepResult::failure(start.elapsed(), "no_response_from_dhcp_server"),
            None,
        ))
    }

    async fn release_lease(&self, iface: &str) -> bool {
        if run_ok("dhclient", &["-r", iface], SHORT).await.is_some() {
            tracing::debug!("Released DHCP lease via dhclient for {}", iface);
            return true;
        }
        if run_ok("nmcli", &["device", "disconnect", iface], SHORT).await.is_some() {
            tracing::debug!("Disconnected {} via nmcli", iface);
            return true;
        }
        if run_ok("ip", &["addr", "flush", "dev", iface], Duration::from_secs(3)).await.is_some() {
            tracing::debug!("Flushed addresses on {}", iface);
            return true;
        }
        tracing::warn!("Failed to release DHCP lease for {}", iface);
        false
    }

    async fn scan_access_points(&self, iface: &str) -> Result<ScanOutput, ProbeError> {
        if let Some(output) = run_ok("iw", &["dev", iface, "scan"], Duration::from_secs(15)).await {
            return Ok(ScanOutput::Iw(output.text()));
        }
        // Cached results when the interface is busy
        if let Some(output) = run_ok("iw", &["dev", iface, "scan", "-u"], SHORT).await {
            return Ok(ScanOutput::Iw(output.text()));
        }
        let args = [
            "-t", "-f", "BSSID,SSID,CHAN,FREQ,SIGNAL,SECURITY", "device", "wifi", "list", "ifname", iface,
        ];
        if let Some(output) = run_ok("nmcli", &args, Duration::from_secs(10)).await {
            if !output.stdout.trim().is_empty() {
                return Ok(ScanOutput::Nmcli(output.stdout));
            }
        }
        Err(ProbeError::Command(format!("all scan methods failed on {}", iface)))
    }

    async fn resolve_dns(&self, domain: &str, server: &str) -> Result<Duration, ProbeError> {
        run_dns_query(domain, server, DNS_TIMEOUT).await
    }

    async fn http_get(&self, url: &str) -> StepResult {
        run_http_get(&self.http, url).await
    }

    async fn ping(&self, target: &str) -> PingStats {
        run_ping(target).await.unwrap_or_else(|e| {
            tracing::warn!("Ping to {} failed: {}", target, e);
            PingStats::default()
        })
    }

    async fn tcp_connect(&self, host: &str, port: u16, attempts: u32) -> TcpStats {
        run_tcp_connect(host, port, attempts).await
    }

    async fn detect_captive_portal(&self) -> bool {
        run_captive_portal_check(&self.portal).await
    }

    async fn wifi_link_info(&self, iface: &str) -> Option<WifiLinkInfo> {
        let output = run_ok("iw", &["dev", iface, "link"], SHORT).await?;
        parse_link(&output.text())
    }

    async fn channel_utilization(&self, iface: &str) -> Option<f64> {
        let output = run_ok("iw", &["dev", iface, "survey", "dump"], SHORT).await?;
        parse_survey(&output.text())
    }

    async fn frame_retry_rate(&self, iface: &str) -> Option<f64> {
        let output = run_ok("iw", &["dev", iface, "station", "dump"], SHORT).await?;
        parse_station_retries(&output.text())
    }

    async fn client_count(&self, iface: &str) -> u32 {
        match run_ok("ip", &["neigh", "show", "dev", iface], SHORT).await {
            Some(output) => count_neighbours(&output.stdout),
            None => 1,
        }
    }

    async fn sensor_identity(&self) -> SensorIdentity {
        let mut model = tokio::fs::read("/proc/device-tree/model")
            .await
            .ok()
            .and_then(|raw| clean_text(&raw));
        if model.is_none() {
            model = run_command("uname", &["-a"], Duration::from_secs(3))
                .await
                .ok()
                .and_then(|output| clean_text(output.text().as_bytes()));
        }

        let serial = tokio::fs::read_to_string("/proc/cpuinfo")
            .await
            .ok()
            .and_then(|cpuinfo| parse_cpuinfo_serial(&cpuinfo));

        SensorIdentity {
            model: or_unknown(model),
            serial: or_unknown(serial),
        }
    }

    async fn network_info(&self, iface: &str, ip: Option<&str>) -> NetworkInfo {
        let dns = self.dns_servers(iface).await;
        let mac = tokio::fs::read(format!("/sys/class/net/{}/address", iface))
            .await
            .ok()
            .and_then(|raw| clean_text(&raw));
        let ip = match ip {
            Some(ip) => Some(ip.to_string()),
            None => self.interface_ipv4(iface).await,
        };

        NetworkInfo {
            ip_config: self.ip_config(iface).await,
            dhcp_server: self.dhcp_server(iface).await,
            gateway: or_unknown(self.gateway(iface).await),
            primary_dns: or_unknown(dns.first().cloned()),
            secondary_dns: or_unknown(dns.get(1).cloned()),
            mac: or_unknown(mac),
            ip: or_unknown(ip),
        }
    }

    async fn dns_servers(&self, iface: &str) -> Vec<String> {
        parse_dns_tokens(&self.nmcli_lines(iface, "IP4.DNS").await)
    }

    async fn download(&self, url: &str, timeout: Duration) -> Result<DownloadSample, ProbeError> {
        run_download(&self.http, url, timeout).await
    }
}
