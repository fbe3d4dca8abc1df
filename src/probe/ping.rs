//! ICMP statistics via the system `ping` command.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use super::{PingStats, ProbeError};

const PING_COUNT: &str = "10";
const PING_TIMEOUT: Duration = Duration::from_secs(12);

/// Ping `target` ten times and summarize.
///
/// A run that times out or exits non-zero still yields whatever the output
/// reported, so a fully lost run reads as 100% loss.
pub async fn run_ping(target: &str) -> Result<PingStats, ProbeError> {
    let child = Command::new("ping")
        .args(["-c", PING_COUNT, "-W", "1", "-n", target])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(PING_TIMEOUT, child).await {
        Ok(result) => {
            result.map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?
        }
        Err(_) => return Ok(PingStats::default()),
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(parse_ping_stats(&text))
}

fn loss_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)% packet loss").unwrap())
}

fn summary_re() -> &'static Regex {
    // "rtt min/avg/max/mdev = a/b/c/d ms" (Linux) or
    // "round-trip min/avg/max/stddev = a/b/c/d ms" (BSD)
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)/([0-9.]+)\s*ms").unwrap())
}

/// Extract average RTT, loss and jitter (mdev) from ping output.
pub fn parse_ping_stats(output: &str) -> PingStats {
    let loss_pct = loss_re()
        .captures(output)
        .and_then(|c| c[1].parse::<f64>().ok());

    let (rtt_avg_ms, jitter_ms) = match summary_re().captures(output) {
        Some(caps) => (caps[2].parse::<f64>().ok(), caps[4].parse::<f64>().ok()),
        None => (None, None),
    };

    PingStats {
        rtt_avg_ms,
        loss_pct,
        jitter_ms,
    }
}
