//! Scheduler module: the cycle loop that drives every probe.
//!
//! A single task runs cycles forever. Each cycle walks the configured
//! networks in order: association (wireless only), DHCP, DNS, every due
//! service, the Wi-Fi environment scan, then incident evaluation and the
//! lease release. Results go to the metrics sink and, when a store is
//! attached, to the batch writer.

mod clock;
mod gate;
mod quality;
mod retention;
mod throughput;
mod writer;

pub use clock::*;
pub use gate::*;
pub use quality::*;
pub use retention::*;
pub use throughput::*;
pub use writer::*;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;

use crate::config::{NetworkTarget, SensorConfig, ServiceTarget, TestKind};
use crate::db::ResultRecord;
use crate::incident::{evaluate, IncidentTracker, NetworkObservations, ServiceSample};
use crate::metrics::{catalog, expire_environment, publish_environment, MetricsSink, SeriesTracker};
use crate::probe::{ProbeError, ProbeProvider, StepResult, UNKNOWN};
use crate::wifi::{select_access_points, Band, WifiLinkInfo};

/// Estimated counted steps for one network in one cycle.
pub fn estimate_tests(network: &NetworkTarget, config: &SensorConfig) -> usize {
    // dhcp plus primary and secondary resolver
    let mut total = 3;
    if network.is_wifi() {
        total += 1;
    }
    if config.schedule.external_http_check {
        total += 1;
    }
    let services: usize = config
        .services
        .iter()
        .flat_map(|service| service.tests.iter())
        .filter(|kind| **kind != TestKind::Throughput || config.throughput.enabled)
        .map(TestKind::step_count)
        .sum();
    total + services
}

/// Totals of one completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub tests_run: usize,
    pub skipped: usize,
}

/// What one network accumulated during the current cycle.
struct NetworkRun {
    sensor: String,
    label: String,
    tests_total: usize,
    tests_run: usize,
    obs: NetworkObservations,
    link: Option<WifiLinkInfo>,
    channel_busy: Option<f64>,
    throughput_mbps: Option<f64>,
}

impl NetworkRun {
    fn new(sensor: &str, network: &NetworkTarget, tests_total: usize) -> Self {
        Self {
            sensor: sensor.to_string(),
            label: network.label().to_string(),
            tests_total,
            tests_run: 0,
            obs: NetworkObservations::default(),
            link: None,
            channel_busy: None,
            throughput_mbps: None,
        }
    }

    fn labels(&self) -> [&str; 2] {
        [&self.sensor, &self.label]
    }
}

/// The cycle loop.
pub struct Scheduler {
    config: Arc<SensorConfig>,
    provider: Arc<dyn ProbeProvider>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
    series: SeriesTracker,
    incidents: IncidentTracker,
    gate: FrequencyGate,
    results: Option<mpsc::Sender<ResultRecord>>,
    cycle: u64,
    skipped: usize,
}

impl Scheduler {
    pub fn new(
        config: SensorConfig,
        provider: Arc<dyn ProbeProvider>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MetricsSink>,
        incidents: IncidentTracker,
    ) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            clock,
            series: SeriesTracker::new(sink.clone()),
            sink,
            incidents,
            gate: FrequencyGate::new(),
            results: None,
            cycle: 0,
            skipped: 0,
        }
    }

    /// Send every step result to the batch writer behind `tx`.
    pub fn with_results(mut self, tx: mpsc::Sender<ResultRecord>) -> Self {
        self.results = Some(tx);
        self
    }

    #[cfg(test)]
    pub fn incidents(&self) -> &IncidentTracker {
        &self.incidents
    }

    /// Run cycles forever.
    pub async fn run(mut self) {
        tracing::info!(
            "Scheduler: starting with {} networks and {} services",
            self.config.networks.len(),
            self.config.services.len()
        );
        loop {
            if let Err(panic) = AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
                tracing::error!(
                    "Cycle #{} aborted by a panic: {}",
                    self.cycle,
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    /// Run one full cycle across all networks.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        let config = self.config.clone();
        let sensor = config.sensor_name.as_str();
        self.cycle += 1;
        self.skipped = 0;
        let started = Instant::now();

        tracing::info!("Cycle #{} starting", self.cycle);
        self.sink.set_gauge(catalog::CYCLE_NUMBER, &[sensor], self.cycle as f64);
        self.publish_sensor_info(sensor).await;

        let mut tests_run = 0;
        for (i, network) in config.networks.iter().enumerate() {
            tests_run += self.run_network(network).await;
            if i + 1 < config.networks.len() {
                self.pause(config.schedule.inter_network_delay_seconds).await;
            }
        }

        self.series.clear_singleton(catalog::CURRENT_TEST, sensor);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        for network in &config.networks {
            let label = network.label();
            self.sink.set_gauge(catalog::CYCLE_PROGRESS_PCT, &[sensor, label], 100.0);
            self.sink.set_gauge(catalog::CORE_OK, &[sensor, label, "cycle"], 1.0);
            self.sink.set_gauge(catalog::CORE_TIME_MS, &[sensor, label, "cycle"], elapsed_ms);
        }
        self.sink.set_gauge(catalog::CYCLE_TESTS_SKIPPED, &[sensor], self.skipped as f64);
        tracing::info!(
            "Cycle #{} complete: {} tests run, {} skipped (frequency), duration={:.1}s",
            self.cycle,
            tests_run,
            self.skipped,
            elapsed_ms / 1000.0
        );

        let delay = config.schedule.inter_cycle_delay_seconds;
        if delay > 0.0 {
            let labels = vec![
                sensor.to_string(),
                "-".to_string(),
                "waiting".to_string(),
                "-".to_string(),
                "Inter-cycle delay".to_string(),
            ];
            self.series.publish_singleton(catalog::CURRENT_TEST, sensor, labels, 1.0);
            tracing::info!("Waiting {:.0} seconds before next cycle...", delay);
            self.pause(delay).await;
            self.series.clear_singleton(catalog::CURRENT_TEST, sensor);
        }

        CycleSummary {
            tests_run,
            skipped: self.skipped,
        }
    }

    async fn run_network(&mut self, network: &NetworkTarget) -> usize {
        let config = self.config.clone();
        let mut run = NetworkRun::new(&config.sensor_name, network, estimate_tests(network, &config));
        tracing::info!(
            "Network {} ({} on {})",
            run.label,
            network.kind.as_str(),
            network.iface
        );

        self.gauge(&run, catalog::CYCLE_TESTS_TOTAL, run.tests_total as f64);
        self.gauge(&run, catalog::CYCLE_TESTS_COMPLETED, 0.0);
        self.gauge(&run, catalog::CYCLE_PROGRESS_PCT, 0.0);
        self.publish_location(&run);

        let outcome = AssertUnwindSafe(self.probe_network(network, &mut run))
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                tracing::warn!("Network {}: probe infrastructure error: {}", run.label, e);
                Some(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("Network {}: probe panicked: {}", run.label, message);
                Some(format!("probe panicked: {}", message))
            }
        };
        if let Some(error) = error {
            let failed = StepResult::failure(Duration::ZERO, &error);
            self.publish_core(&run, "internal_error", &failed);
            self.complete_step(&mut run, "internal_error", "", &failed, None).await;
        }

        let flags = evaluate(&run.obs, &config.thresholds);
        self.incidents
            .update(&run.sensor, &run.label, &flags, self.clock.now());
        self.incidents.persist();

        let inputs = QualityInputs {
            rssi_dbm: run.obs.rssi_dbm,
            throughput_mbps: run.throughput_mbps,
            ..Default::default()
        }
        .with_service(preferred_external(&run.obs.services));
        match quality_score(&inputs) {
            Some(score) => self.gauge(&run, catalog::CONNECTION_QUALITY_SCORE, score),
            None => self
                .sink
                .remove_series(catalog::CONNECTION_QUALITY_SCORE, &run.labels()),
        }

        if network.is_wifi() {
            if self.provider.release_lease(&network.iface).await {
                tracing::debug!("Released lease for {}", run.label);
            } else {
                tracing::warn!("Network {}: failed to release lease on {}", run.label, network.iface);
            }
        } else {
            tracing::debug!("Keeping wired connection {}", run.label);
        }

        run.tests_run
    }

    async fn probe_network(&mut self, network: &NetworkTarget, run: &mut NetworkRun) -> Result<(), ProbeError> {
        if network.is_wifi() {
            self.associate(network, run).await?;
        }

        let ip = self.acquire_ip(network, run).await?;
        if ip.is_some() {
            self.check_captive_portal(run).await;
        }

        self.resolve_dns(network, run).await;

        if self.config.schedule.external_http_check && !network.external_url.is_empty() {
            self.external_http(network, run).await;
        }

        self.run_services(run).await;

        if network.is_wifi() && self.config.wifi_environment.enabled {
            self.scan_environment(network, run).await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Network steps
    // ------------------------------------------------------------------

    async fn associate(&mut self, network: &NetworkTarget, run: &mut NetworkRun) -> Result<(), ProbeError> {
        let ssid = network.ssid.as_deref().unwrap_or_default();
        self.current_test(run, "ap_assoc", ssid, "WiFi Association");

        let result = self.provider.associate(network).await?;
        if !result.ok {
            tracing::warn!(
                "Network {}: association failed: {}",
                run.label,
                result.error.as_deref().unwrap_or("unknown")
            );
        }
        self.gauge(run, catalog::AP_ASSOCIATION_TIME_MS, result.duration_ms());
        self.publish_core(run, "association", &result);
        self.complete_step(run, "association", ssid, &result, None).await;
        run.obs.association = Some(result);

        self.publish_link(network, run).await;
        Ok(())
    }

    async fn publish_link(&mut self, network: &NetworkTarget, run: &mut NetworkRun) {
        let iface = network.iface.as_str();
        let Some(link) = self.provider.wifi_link_info(iface).await else {
            tracing::debug!("Network {}: no link information on {}", run.label, iface);
            return;
        };

        run.obs.rssi_dbm = link.rssi_dbm;
        if let Some(rssi) = link.rssi_dbm {
            self.gauge(run, catalog::WIFI_RSSI_DBM, rssi);
        }
        if let Some(channel) = link.channel {
            self.gauge(run, catalog::WIFI_CHANNEL, channel as f64);
        }
        if let Some(rx) = link.rx_bitrate_mbps {
            self.gauge(run, catalog::WIFI_RX_BITRATE_MBPS, rx);
        }
        if let Some(tx) = link.tx_bitrate_mbps {
            self.gauge(run, catalog::WIFI_TX_BITRATE_MBPS, tx);
        }

        run.channel_busy = self.provider.channel_utilization(iface).await;
        if let Some(busy) = run.channel_busy {
            self.gauge(run, catalog::WIFI_CHANNEL_BUSY_PCT, busy);
        }
        if let Some(retry) = self.provider.frame_retry_rate(iface).await {
            self.gauge(run, catalog::WIFI_FRAME_RETRY_RATE_PCT, retry);
        }
        let clients = self.provider.client_count(iface).await;
        self.gauge(run, catalog::WIFI_CLIENT_COUNT, clients as f64);

        if let Some(freq) = link.freq_mhz.filter(|f| *f > 0) {
            self.gauge(run, catalog::WIFI_FREQ_MHZ, freq as f64);
            if let Some(band) = link.band {
                for candidate in Band::ALL {
                    let value = if candidate == band { 1.0 } else { 0.0 };
                    self.sink.set_gauge(
                        catalog::WIFI_BAND,
                        &[&run.sensor, &run.label, candidate.as_str()],
                        value,
                    );
                }
            }
        }

        let bssid = link.bssid.clone().unwrap_or_else(|| UNKNOWN.to_string());
        let ssid = link.ssid.clone().unwrap_or_else(|| run.label.clone());
        let labels = vec![run.sensor.clone(), run.label.clone(), bssid, ssid];
        self.series
            .publish_singleton(catalog::WIFI_BSSID_INFO, &run.label, labels, 1.0);

        run.link = Some(link);
    }

    async fn acquire_ip(
        &mut self,
        network: &NetworkTarget,
        run: &mut NetworkRun,
    ) -> Result<Option<String>, ProbeError> {
        let iface = network.iface.as_str();
        self.current_test(run, "dhcp", iface, "DHCP");

        let timeout = Duration::from_secs(self.config.schedule.dhcp_timeout_seconds);
        let (result, ip) = self.provider.acquire_lease(iface, timeout).await?;
        self.gauge(run, catalog::DHCP_TIME_MS, result.duration_ms());
        self.publish_core(run, "dhcp", &result);
        self.complete_step(run, "dhcp", iface, &result, None).await;
        run.obs.dhcp = Some(result);

        match &ip {
            Some(addr) => {
                let info = self.provider.network_info(iface, Some(addr)).await;
                let labels = vec![
                    run.sensor.clone(),
                    run.label.clone(),
                    info.ip_config,
                    info.dhcp_server,
                    info.gateway,
                    info.primary_dns,
                    info.secondary_dns,
                    info.mac,
                    info.ip,
                ];
                self.series
                    .publish_singleton(catalog::NETWORK_INFO, &run.label, labels, 1.0);
                self.gauge(run, catalog::NETWORK_IP_PRESENT, 1.0);
            }
            None => {
                tracing::warn!("Network {}: no IPv4 address on {}", run.label, iface);
                self.series.clear_singleton(catalog::NETWORK_INFO, &run.label);
                self.gauge(run, catalog::NETWORK_IP_PRESENT, 0.0);
            }
        }
        Ok(ip)
    }

    async fn check_captive_portal(&mut self, run: &mut NetworkRun) {
        self.current_test(run, "captive_portal", "", "Captive Portal");
        let start = Instant::now();
        let detected = self.provider.detect_captive_portal().await;
        let result = if detected {
            tracing::warn!("Network {}: captive portal detected", run.label);
            StepResult::failure(start.elapsed(), "captive_portal_detected")
        } else {
            StepResult::success(start.elapsed())
        };

        self.gauge(run, catalog::CAPTIVE_PORTAL_DETECTED, if detected { 1.0 } else { 0.0 });
        self.publish_core(run, "captive_portal", &result);
        self.record(run, "captive_portal", "", &result, None).await;
        run.obs.captive_portal = detected;
    }

    async fn resolve_dns(&mut self, network: &NetworkTarget, run: &mut NetworkRun) {
        let config = self.config.clone();
        let servers: Vec<String> = if config.dns.servers.is_empty() {
            self.provider
                .dns_servers(&network.iface)
                .await
                .into_iter()
                .filter(|server| !server.is_empty() && server != UNKNOWN)
                .take(2)
                .collect()
        } else {
            config.dns.servers.clone()
        };
        if servers.is_empty() {
            tracing::warn!("Network {}: no DNS servers to query", run.label);
        }

        let mut worst: Option<Duration> = None;
        for server in &servers {
            self.current_test(run, "dns", server, "DNS Resolution");
            let start = Instant::now();
            let result = match self.provider.resolve_dns(&config.dns.domain, server).await {
                Ok(elapsed) => {
                    self.gauge(run, catalog::DNS_TIME_MS, elapsed.as_secs_f64() * 1000.0);
                    worst = Some(worst.map_or(elapsed, |w| w.max(elapsed)));
                    StepResult::success(elapsed)
                }
                Err(e) => {
                    tracing::warn!("Network {}: DNS query to {} failed: {}", run.label, server, e);
                    StepResult::failure(start.elapsed(), &e.to_string())
                }
            };
            self.publish_core(run, "dns", &result);
            self.complete_step(run, "dns", server, &result, None).await;
        }

        run.obs.dns = worst.map(StepResult::success);
    }

    async fn external_http(&mut self, network: &NetworkTarget, run: &mut NetworkRun) {
        let url = network.external_url.as_str();
        self.current_test(run, "http_get", url, "External HTTP");
        let result = self.provider.http_get(url).await;
        self.publish_core(run, "external_http", &result);
        self.complete_step(run, "external_http", url, &result, None).await;
        run.obs.http = Some(result);
    }

    async fn scan_environment(&mut self, network: &NetworkTarget, run: &mut NetworkRun) {
        let config = self.config.clone();
        let env = &config.wifi_environment;
        let iface = network.iface.as_str();
        self.current_test(run, "wifi_scan", iface, "WiFi Environment Scan");

        let now = self.clock.now();
        let ttl = chrono::Duration::seconds(env.ttl_seconds);
        let start = Instant::now();

        let aps = match self.provider.scan_access_points(iface).await {
            Ok(output) => select_access_points(output.parse(now), env.min_rssi_dbm, env.max_aps),
            Err(e) => {
                tracing::warn!("Network {}: Wi-Fi scan failed: {}", run.label, e);
                let failed = StepResult::failure(start.elapsed(), &e.to_string());
                self.record(run, "wifi_scan", iface, &failed, None).await;
                expire_environment(&mut self.series, now, ttl);
                return;
            }
        };
        let scanned = StepResult::success(start.elapsed());
        self.record(run, "wifi_scan", iface, &scanned, Some(aps.len() as f64))
            .await;

        // An empty scan is not evidence that every AP left.
        if aps.is_empty() {
            tracing::debug!("Network {}: scan returned no access points", run.label);
            expire_environment(&mut self.series, now, ttl);
            return;
        }
        publish_environment(&mut self.series, &run.sensor, &run.label, iface, &aps, now, ttl);

        if run.channel_busy.is_none() {
            if let Some(link) = &run.link {
                let on_channel = aps
                    .iter()
                    .filter(|ap| link.channel.is_some() && ap.channel == link.channel && ap.band == link.band)
                    .count();
                if on_channel > 0 {
                    let estimate = (on_channel as f64 * 10.0).min(100.0);
                    self.gauge(run, catalog::WIFI_CHANNEL_BUSY_PCT, estimate);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    async fn run_services(&mut self, run: &mut NetworkRun) {
        let config = self.config.clone();
        for service in &config.services {
            if !service.is_runnable() {
                tracing::debug!("Service {} has no target, skipping", service.name);
                continue;
            }

            let key = service.key();
            let now = self.clock.now();
            if !self.gate.should_run(&key, service.frequency_seconds, now) {
                self.skipped += 1;
                tracing::debug!("Service {} not due yet", service.name);
                continue;
            }
            self.gate.mark(&key, now);

            self.run_service(service, run).await;
        }
    }

    async fn run_service(&mut self, service: &ServiceTarget, run: &mut NetworkRun) {
        let host = service.host();

        if service.has(TestKind::Http) {
            self.http_test(service, run, &format!("http://{}:80", host), "http80")
                .await;
        }
        if service.has(TestKind::Tcp80) {
            self.tcp_test(service, run, &host, 80, "tcp80").await;
        }
        if service.has(TestKind::Http) {
            self.http_test(service, run, &format!("https://{}:443", host), "http443")
                .await;
        }
        if service.has(TestKind::Tcp443) {
            self.tcp_test(service, run, &host, 443, "tcp443").await;
        }
        if service.has(TestKind::Icmp) {
            self.icmp_test(service, run, &host).await;
        }
        if service.has(TestKind::VoipMos) {
            self.voip_test(service, run, &host).await;
        }
        if service.has(TestKind::Throughput) && self.config.throughput.enabled {
            self.throughput_test(service, run).await;
        }
    }

    async fn http_test(&mut self, service: &ServiceTarget, run: &mut NetworkRun, url: &str, step: &str) {
        self.current_test(run, "http_get", url, &service.name);
        let result = self.provider.http_get(url).await;
        if result.ok {
            self.sink.set_gauge(
                catalog::SERVICE_HTTP_TIME_MS,
                &[&run.sensor, &run.label, url, service.scope.as_str()],
                result.duration_ms(),
            );
        }
        self.complete_step(run, step, url, &result, None).await;
        self.test_delay().await;
    }

    async fn tcp_test(&mut self, service: &ServiceTarget, run: &mut NetworkRun, host: &str, port: u16, step: &str) {
        let target = format!("{}:{}", host, port);
        self.current_test(run, "tcp_ping", &target, &service.name);

        let attempts = self.config.schedule.tcp_attempts;
        let stats = self.provider.tcp_connect(host, port, attempts).await;
        let result = match stats.latency_avg_ms {
            Some(latency) => {
                self.sink.set_gauge(
                    catalog::SERVICE_TCP_CONNECT_MS,
                    &[&run.sensor, &run.label, &target, service.scope.as_str()],
                    latency,
                );
                StepResult::success(Duration::from_secs_f64(latency.max(0.0) / 1000.0))
            }
            None => StepResult::failure(Duration::ZERO, "tcp_connect_failed"),
        };
        self.complete_step(run, step, &target, &result, stats.loss_pct)
            .await;
        self.test_delay().await;
    }

    async fn icmp_test(&mut self, service: &ServiceTarget, run: &mut NetworkRun, host: &str) {
        self.current_test(run, "icmp_ping", host, &service.name);
        let stats = self.provider.ping(host).await;
        let scope = service.scope.as_str();

        {
            let labels = [run.sensor.as_str(), run.label.as_str(), host, scope];
            if let Some(rtt) = stats.rtt_avg_ms {
                self.sink.set_gauge(catalog::SERVICE_RTT_AVG_MS, &labels, rtt);
            }
            if let Some(jitter) = stats.jitter_ms {
                self.sink.set_gauge(catalog::SERVICE_JITTER_MS, &labels, jitter);
            }
            if let Some(loss) = stats.loss_pct {
                self.sink.set_gauge(catalog::SERVICE_PACKET_LOSS_PCT, &labels, loss);
                let up = if loss < 100.0 { 1.0 } else { 0.0 };
                self.sink.set_gauge(
                    catalog::SERVICE_UP,
                    &[&run.sensor, &run.label, host, scope, &service.name],
                    up,
                );
            }
            let now = self.clock.now().timestamp() as f64;
            self.sink.set_gauge(catalog::SERVICE_LAST_TEST_TIMESTAMP, &labels, now);
            self.sink.set_gauge(catalog::SERVICE_SCOPE, &labels, 1.0);
        }

        let result = match stats.loss_pct {
            Some(loss) if loss < 100.0 => {
                let rtt = stats.rtt_avg_ms.unwrap_or_default().max(0.0);
                StepResult::success(Duration::from_secs_f64(rtt / 1000.0))
            }
            _ => StepResult::failure(Duration::ZERO, "icmp_unreachable"),
        };
        run.obs.services.push(ServiceSample {
            target: host.to_string(),
            scope: service.scope,
            stats,
        });
        self.complete_step(run, "icmp", host, &result, stats.rtt_avg_ms)
            .await;
        self.test_delay().await;
    }

    async fn voip_test(&mut self, service: &ServiceTarget, run: &mut NetworkRun, host: &str) {
        self.current_test(run, "voip_mos", host, &service.name);
        let stats = self.provider.ping(host).await;
        let mos = voip_mos(stats.rtt_avg_ms, stats.jitter_ms, stats.loss_pct);

        let result = match mos {
            Some(mos) => {
                self.sink.set_gauge(
                    catalog::VOIP_MOS,
                    &[&run.sensor, &run.label, service.scope.as_str()],
                    mos,
                );
                let rtt = stats.rtt_avg_ms.unwrap_or_default().max(0.0);
                StepResult::success(Duration::from_secs_f64(rtt / 1000.0))
            }
            None => StepResult::failure(Duration::ZERO, "voip_mos_unavailable"),
        };
        self.complete_step(run, "voip_mos", host, &result, mos).await;
        self.test_delay().await;
    }

    async fn throughput_test(&mut self, service: &ServiceTarget, run: &mut NetworkRun) {
        let config = self.config.clone();
        let settings = &config.throughput;
        self.current_test(run, "throughput", "speed.test", &service.name);

        let start = Instant::now();
        let outcome = run_throughput(
            self.provider.clone(),
            &settings.urls,
            settings.workers,
            Duration::from_secs(settings.timeout_seconds),
        )
        .await;

        let result = match outcome.mbps {
            Some(mbps) => {
                self.sink.set_gauge(
                    catalog::THROUGHPUT_DOWNLOAD_MBPS,
                    &[&run.sensor, &run.label, &service.name],
                    mbps,
                );
                tracing::info!(
                    "Throughput test {}: download={:.2} Mbps ({} downloads)",
                    service.name,
                    mbps,
                    outcome.completed
                );
                run.throughput_mbps = Some(mbps);
                StepResult::success(start.elapsed())
            }
            None => {
                tracing::warn!("Throughput test {}: FAILED", service.name);
                StepResult::failure(start.elapsed(), "throughput_failed")
            }
        };
        self.complete_step(run, "throughput", &service.name, &result, outcome.mbps)
            .await;
        self.test_delay().await;
    }

    // ------------------------------------------------------------------
    // Publication helpers
    // ------------------------------------------------------------------

    async fn publish_sensor_info(&mut self, sensor: &str) {
        let identity = self.provider.sensor_identity().await;
        let labels = vec![sensor.to_string(), identity.model, identity.serial];
        self.series
            .publish_singleton(catalog::SENSOR_INFO, sensor, labels, 1.0);
    }

    fn publish_location(&mut self, run: &NetworkRun) {
        match &self.config.location {
            Some(location) => {
                let labels = vec![
                    run.sensor.clone(),
                    run.label.clone(),
                    location.lat.clone(),
                    location.lon.clone(),
                    location.address_notes.clone(),
                ];
                self.series
                    .publish_singleton(catalog::SENSOR_LOCATION, &run.label, labels, 1.0);
            }
            None => self.series.clear_singleton(catalog::SENSOR_LOCATION, &run.label),
        }
    }

    fn current_test(&mut self, run: &NetworkRun, test_type: &str, target: &str, service_name: &str) {
        let labels = vec![
            run.sensor.clone(),
            run.label.clone(),
            test_type.to_string(),
            target.to_string(),
            service_name.to_string(),
        ];
        self.series
            .publish_singleton(catalog::CURRENT_TEST, &run.sensor, labels, 1.0);
    }

    fn gauge(&self, run: &NetworkRun, metric: &str, value: f64) {
        self.sink.set_gauge(metric, &run.labels(), value);
    }

    fn publish_core(&self, run: &NetworkRun, step: &str, result: &StepResult) {
        let labels = [run.sensor.as_str(), run.label.as_str(), step];
        self.sink
            .set_gauge(catalog::CORE_OK, &labels, if result.ok { 1.0 } else { 0.0 });
        self.sink
            .set_gauge(catalog::CORE_TIME_MS, &labels, result.duration_ms());
    }

    /// Record a counted step and advance the progress gauges.
    async fn complete_step(
        &self,
        run: &mut NetworkRun,
        step: &str,
        target: &str,
        result: &StepResult,
        value: Option<f64>,
    ) {
        self.record(run, step, target, result, value).await;

        run.tests_run += 1;
        let progress = (run.tests_run as f64 / run.tests_total.max(1) as f64 * 100.0).min(100.0);
        self.gauge(run, catalog::CYCLE_TESTS_COMPLETED, run.tests_run as f64);
        self.gauge(run, catalog::CYCLE_PROGRESS_PCT, progress);
        self.gauge(run, catalog::LAST_DATA_TIMESTAMP, self.clock.now().timestamp() as f64);
    }

    async fn record(&self, run: &NetworkRun, step: &str, target: &str, result: &StepResult, value: Option<f64>) {
        let Some(tx) = &self.results else {
            return;
        };
        let record = ResultRecord::from_step(self.clock.now(), &run.sensor, &run.label, step, target, result)
            .with_value(value);
        if tx.send(record).await.is_err() {
            tracing::error!("Failed to send {} result for {}", step, run.label);
        }
    }

    async fn test_delay(&self) {
        self.pause(self.config.schedule.inter_test_delay_seconds).await;
    }

    async fn pause(&self, seconds: f64) {
        if seconds.is_finite() && seconds > 0.0 {
            self.clock.sleep(Duration::from_secs_f64(seconds)).await;
        }
    }
}

/// Text of a caught panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;
    use crate::config::normalize::normalize;
    use crate::incident::{IncidentStore, IncidentType};
    use crate::metrics::testing::RecordingSink;
    use crate::metrics::{series_key, AP_FAMILY};
    use crate::probe::testing::FakeProvider;
    use crate::probe::PingStats;
    use chrono::Utc;
    use tempfile::TempDir;

    const WIRED: &str = r#"
sensor_name: pi-1
wired:
  - iface: eth0
    name: LAN
external_http:
  url: https://ext.example
schedule:
  inter_test_delay_seconds: 0.0
  inter_network_delay_seconds: 0.0
services:
  external:
    - name: Cloud
      target: example.com
      tests: [icmp, throughput, voip_mos, tcp_443, http, tcp_80]
throughput_test:
  enabled: true
  urls: [http://speed.test/a]
  timeout_seconds: 1
"#;

    const BOTH: &str = r#"
sensor_name: pi-1
wifi:
  - iface: wlan0
    ssid: Office
wired:
  - iface: eth0
    name: LAN
external_http:
  url: https://ext.example
schedule:
  inter_test_delay_seconds: 0.0
  inter_network_delay_seconds: 0.0
services:
  external:
    - name: Cloud
      target: 1.1.1.1
      tests: [icmp]
wifi_environment:
  enabled: false
"#;

    struct Harness {
        scheduler: Scheduler,
        provider: Arc<FakeProvider>,
        sink: Arc<RecordingSink>,
        clock: Arc<ManualClock>,
        _dir: TempDir,
    }

    fn harness(yaml: &str, provider: FakeProvider) -> Harness {
        let config = normalize(&serde_yaml::from_str(yaml).unwrap());
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(provider);
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let incidents = IncidentTracker::new(
            IncidentStore::new(dir.path().join("incidents.json")),
            sink.clone(),
            3,
        );
        let scheduler = Scheduler::new(config, provider.clone(), clock.clone(), sink.clone(), incidents);
        Harness {
            scheduler,
            provider,
            sink,
            clock,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_service_step_order() {
        let mut h = harness(WIRED, FakeProvider::default());
        let summary = h.scheduler.run_cycle().await;

        assert_eq!(
            h.provider.calls(),
            vec![
                "lease eth0",
                "portal",
                "dns 10.0.0.1",
                "http https://ext.example",
                "http http://example.com:80",
                "tcp example.com:80",
                "http https://example.com:443",
                "tcp example.com:443",
                "ping example.com",
                "ping example.com",
                "download http://speed.test/a",
            ]
        );
        // dhcp, dns, external http, 2 http, 2 tcp, icmp, voip, throughput
        assert_eq!(summary.tests_run, 10);
        assert_eq!(summary.skipped, 0);
        assert_eq!(
            h.sink.gauge(catalog::CYCLE_PROGRESS_PCT, &["pi-1", "LAN"]),
            Some(100.0)
        );
    }

    #[tokio::test]
    async fn test_disabled_kinds_are_omitted() {
        let yaml = WIRED.replace("[icmp, throughput, voip_mos, tcp_443, http, tcp_80]", "[tcp_443, icmp]");
        let mut h = harness(&yaml, FakeProvider::default());
        h.scheduler.run_cycle().await;

        let calls = h.provider.calls();
        let services: Vec<&str> = calls
            .iter()
            .map(String::as_str)
            .skip_while(|c| *c != "http https://ext.example")
            .skip(1)
            .collect();
        assert_eq!(services, vec!["tcp example.com:443", "ping example.com"]);
    }

    #[tokio::test]
    async fn test_infrastructure_error_becomes_synthetic_step() {
        let provider = FakeProvider {
            lease_error: true,
            ..Default::default()
        };
        let mut h = harness(BOTH, provider);
        let (tx, mut rx) = mpsc::channel(64);
        h.scheduler = h.scheduler.with_results(tx);

        let summary = h.scheduler.run_cycle().await;

        // association, then the synthetic step on each network
        assert_eq!(summary.tests_run, 3);
        assert_eq!(
            h.sink.gauge(catalog::CORE_OK, &["pi-1", "LAN", "internal_error"]),
            Some(0.0)
        );
        assert_eq!(
            h.sink.gauge(catalog::CORE_OK, &["pi-1", "Office", "internal_error"]),
            Some(0.0)
        );

        let mut steps = Vec::new();
        while let Ok(record) = rx.try_recv() {
            steps.push((record.network, record.step));
        }
        assert!(steps.contains(&("LAN".to_string(), "internal_error".to_string())));
        assert!(!h.provider.calls().iter().any(|c| c.starts_with("dns")));

        // The cycle still finishes and releases the wireless lease.
        assert!(h.provider.calls().contains(&"release wlan0".to_string()));
    }

    #[tokio::test]
    async fn test_panicking_provider_becomes_synthetic_step() {
        let provider = FakeProvider {
            portal_panics: true,
            ..Default::default()
        };
        let mut h = harness(BOTH, provider);

        let summary = h.scheduler.run_cycle().await;

        let calls = h.provider.calls();
        assert!(calls.contains(&"release wlan0".to_string()));
        assert!(calls.contains(&"lease eth0".to_string()));
        // association, dhcp and the synthetic step on Office; dhcp and the synthetic step on LAN
        assert_eq!(summary.tests_run, 5);
        for network in ["Office", "LAN"] {
            assert_eq!(
                h.sink.gauge(catalog::CORE_OK, &["pi-1", network, "internal_error"]),
                Some(0.0)
            );
        }
        assert_eq!(
            h.sink.gauge(catalog::CORE_OK, &["pi-1", "LAN", "cycle"]),
            Some(1.0)
        );

        // The next cycle still runs.
        h.provider.clear_calls();
        h.scheduler.run_cycle().await;
        assert!(h.provider.calls().contains(&"lease eth0".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_quality_removes_stale_score() {
        let provider = FakeProvider {
            ping: PingStats::default(),
            ..Default::default()
        };
        let mut h = harness(BOTH, provider);
        h.sink
            .set_gauge(catalog::CONNECTION_QUALITY_SCORE, &["pi-1", "LAN"], 55.0);

        h.scheduler.run_cycle().await;

        assert_eq!(
            h.sink.gauge(catalog::CONNECTION_QUALITY_SCORE, &["pi-1", "LAN"]),
            None
        );
        assert!(h
            .sink
            .removals(catalog::CONNECTION_QUALITY_SCORE)
            .contains(&series_key(&["pi-1", "LAN"])));
    }

    #[tokio::test]
    async fn test_no_network_delay_after_last_network() {
        let yaml = BOTH.replace(
            "inter_network_delay_seconds: 0.0",
            "inter_network_delay_seconds: 5.0",
        );
        let mut h = harness(&yaml, FakeProvider::default());
        h.scheduler.run_cycle().await;

        assert_eq!(h.clock.slept(), vec![Duration::from_secs(5)]);
    }

    #[tokio::test]
    async fn test_wired_never_released() {
        let mut h = harness(BOTH, FakeProvider::default());
        h.scheduler.run_cycle().await;

        let calls = h.provider.calls();
        let release = calls.iter().position(|c| c == "release wlan0").unwrap();
        let wired_lease = calls.iter().position(|c| c == "lease eth0").unwrap();
        assert!(release < wired_lease);
        assert!(!calls.contains(&"release eth0".to_string()));
    }

    #[tokio::test]
    async fn test_frequency_gate_skips_service() {
        let yaml = WIRED.replace("tcp_80]", "tcp_80]\n      frequency: 10min");
        let mut h = harness(&yaml, FakeProvider::default());

        let first = h.scheduler.run_cycle().await;
        assert_eq!(first.skipped, 0);

        h.provider.clear_calls();
        let second = h.scheduler.run_cycle().await;
        assert_eq!(second.skipped, 1);
        assert!(!h.provider.calls().iter().any(|c| c.starts_with("ping")));
        assert_eq!(h.sink.gauge(catalog::CYCLE_TESTS_SKIPPED, &["pi-1"]), Some(1.0));

        h.clock.advance(Duration::from_secs(600));
        let third = h.scheduler.run_cycle().await;
        assert_eq!(third.skipped, 0);
    }

    #[tokio::test]
    async fn test_sensor_info_singleton_replaced() {
        let mut h = harness(WIRED, FakeProvider::default());
        h.scheduler.run_cycle().await;
        h.provider.set_serial("B");
        h.scheduler.run_cycle().await;

        assert_eq!(
            h.sink.series(catalog::SENSOR_INFO),
            vec![series_key(&["pi-1", "Raspberry Pi 4", "B"])]
        );
        assert_eq!(
            h.sink.removals(catalog::SENSOR_INFO),
            vec![series_key(&["pi-1", "Raspberry Pi 4", "A"])]
        );
    }

    #[tokio::test]
    async fn test_packet_loss_raises_incident() {
        let provider = FakeProvider {
            ping: PingStats {
                rtt_avg_ms: Some(30.0),
                loss_pct: Some(20.0),
                jitter_ms: Some(3.0),
            },
            ..Default::default()
        };
        let mut h = harness(BOTH, provider);
        h.scheduler.run_cycle().await;

        assert_eq!(
            h.sink.gauge(
                catalog::INCIDENT_ACTIVE,
                &["pi-1", "LAN", IncidentType::PacketLoss.as_str()]
            ),
            Some(1.0)
        );
        assert_eq!(
            h.sink.gauge(
                catalog::INCIDENT_ACTIVE,
                &["pi-1", "LAN", IncidentType::HighLatency.as_str()]
            ),
            Some(0.0)
        );
        let state = h.scheduler.incidents().state();
        assert!(state.active.contains_key("pi-1::LAN"));
        // rtt 30 => 85, loss 20 => 0, jitter 3 => 97
        let expected = (0.25 * 85.0 + 0.25 * 0.0 + 0.15 * 97.0) / 0.65;
        let score = h
            .sink
            .gauge(catalog::CONNECTION_QUALITY_SCORE, &["pi-1", "LAN"])
            .unwrap();
        assert!((score - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_wifi_link_and_environment() {
        let scan = "BSS aa:bb:cc:00:00:01(on wlan0)\n\tfreq: 5180\n\tsignal: -48.00 dBm\n\tSSID: Office\n\
                    BSS aa:bb:cc:00:00:02(on wlan0)\n\tfreq: 5180\n\tsignal: -70.00 dBm\n\tSSID: Guest\n\
                    BSS aa:bb:cc:00:00:03(on wlan0)\n\tfreq: 2412\n\tsignal: -95.00 dBm\n\tSSID: Far\n";
        let provider = FakeProvider {
            link: Some(WifiLinkInfo {
                bssid: Some("aa:bb:cc:00:00:01".to_string()),
                ssid: Some("Office".to_string()),
                rssi_dbm: Some(-48.0),
                freq_mhz: Some(5180),
                band: Some(Band::Ghz5),
                channel: Some(36),
                ..Default::default()
            }),
            scan: Some(scan.to_string()),
            ..Default::default()
        };
        let yaml = BOTH.replace("enabled: false", "enabled: true");
        let mut h = harness(&yaml, provider);
        h.scheduler.run_cycle().await;

        let office = ["pi-1", "Office"];
        assert_eq!(h.sink.gauge(catalog::WIFI_RSSI_DBM, &office), Some(-48.0));
        assert_eq!(h.sink.gauge(catalog::WIFI_BAND, &["pi-1", "Office", "5"]), Some(1.0));
        assert_eq!(h.sink.gauge(catalog::WIFI_BAND, &["pi-1", "Office", "2.4"]), Some(0.0));
        assert_eq!(
            h.sink.series(catalog::WIFI_BSSID_INFO),
            vec![series_key(&["pi-1", "Office", "aa:bb:cc:00:00:01", "Office"])]
        );

        // The -95 dBm AP falls below the floor.
        assert_eq!(h.sink.series(catalog::WIFI_ENV_AP_RSSI_DBM).len(), 2);
        assert_eq!(h.scheduler.series.tracked(&AP_FAMILY), 2);
        // No survey data, so busy is estimated from the two APs on channel 36.
        assert_eq!(h.sink.gauge(catalog::WIFI_CHANNEL_BUSY_PCT, &office), Some(20.0));

        let calls = h.provider.calls();
        let scan_at = calls.iter().position(|c| c == "scan wlan0").unwrap();
        let release_at = calls.iter().position(|c| c == "release wlan0").unwrap();
        assert!(scan_at < release_at);
        assert!(!calls.contains(&"scan eth0".to_string()));
    }

    #[tokio::test]
    async fn test_inter_cycle_delay_uses_clock() {
        let yaml = WIRED.replace(
            "inter_network_delay_seconds: 0.0",
            "inter_network_delay_seconds: 0.0\n  inter_cycle_delay_seconds: 30.0",
        );
        let mut h = harness(&yaml, FakeProvider::default());
        h.scheduler.run_cycle().await;

        assert_eq!(h.clock.slept(), vec![Duration::from_secs(30)]);
        assert!(h.sink.series(catalog::CURRENT_TEST).is_empty());
    }

    #[test]
    fn test_estimate_tests() {
        let config = normalize(&serde_yaml::from_str(BOTH).unwrap());
        let wifi = &config.networks[0];
        let wired = &config.networks[1];
        // association, dhcp, 2 dns, external http, icmp
        assert_eq!(estimate_tests(wifi, &config), 6);
        assert_eq!(estimate_tests(wired, &config), 5);
    }
}
