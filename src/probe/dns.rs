//! DNS probe implementation using raw UDP packets.

use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use super::ProbeError;

pub const DNS_TIMEOUT: Duration = Duration::from_secs(2);

/// Query `server` for the A record of `domain`.
///
/// Returns the round-trip time. A response with a non-zero RCODE is an error.
pub async fn run_dns_query(domain: &str, server: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    // Bare IPv4 or hostname gets the default port; IPv6 literals need brackets.
    let target_addr = if server.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{}]:53", server)
    } else if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:53", server)
    };

    let tx_id: u16 = rand::random();
    let packet = build_dns_query(tx_id, domain)?;

    let bind_addr = if target_addr.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;

    socket
        .connect(&target_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let start = Instant::now();

    socket
        .send(&packet)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut response = [0u8; 512];
    let n = tokio::time::timeout(timeout, socket.recv(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;

    let elapsed = start.elapsed();
    check_response(&response[..n], tx_id)?;
    Ok(elapsed)
}

/// Build a recursive query packet for the A record of `domain`.
pub fn build_dns_query(tx_id: u16, domain: &str) -> Result<Vec<u8>, ProbeError> {
    let flags: u16 = 0x0100; // Standard query, recursion desired
    let qd_count: u16 = 1;

    // Header (12 bytes)
    let mut packet = Vec::with_capacity(18 + domain.len());
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&qd_count.to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // AN, NS, AR counts

    // Question name: length-prefixed labels
    for label in domain.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProbeError::Config(format!("invalid domain: {}", domain)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    // QTYPE A, QCLASS IN
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());

    Ok(packet)
}

/// Validate length, transaction id and RCODE of a response.
pub fn check_response(response: &[u8], tx_id: u16) -> Result<(), ProbeError> {
    if response.len() < 12 {
        return Err(ProbeError::Network(format!(
            "response too short: {} bytes",
            response.len()
        )));
    }

    let resp_tx_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_tx_id != tx_id {
        return Err(ProbeError::Network(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    // RCODE is the lower 4 bits of byte 3
    let rcode = response[3] & 0x0F;
    if rcode != 0 {
        return Err(ProbeError::Network(format!("DNS error RCODE: {}", rcode)));
    }

    Ok(())
}
