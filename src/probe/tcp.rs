//! TCP connect "ping": repeated handshakes to one port.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::TcpStats;

pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connect to `host:port` `attempts` times in sequence.
pub async fn run_tcp_connect(host: &str, port: u16, attempts: u32) -> TcpStats {
    let mut durations = Vec::with_capacity(attempts as usize);
    for _ in 0..attempts {
        let start = Instant::now();
        let connect = TcpStream::connect((host, port));
        if let Ok(Ok(stream)) = tokio::time::timeout(TCP_CONNECT_TIMEOUT, connect).await {
            durations.push(start.elapsed().as_secs_f64() * 1000.0);
            drop(stream);
        }
    }
    summarize_connects(&durations, attempts)
}

/// Mean, sample standard deviation and loss over `attempts` tries of which `durations_ms` succeeded.
pub fn summarize_connects(durations_ms: &[f64], attempts: u32) -> TcpStats {
    let loss_pct = (attempts > 0)
        .then(|| (attempts as usize - durations_ms.len()) as f64 / attempts as f64 * 100.0);

    if durations_ms.is_empty() {
        return TcpStats {
            loss_pct,
            ..Default::default()
        };
    }

    let n = durations_ms.len() as f64;
    let mean = durations_ms.iter().sum::<f64>() / n;
    let std = if durations_ms.len() > 1 {
        let var = durations_ms.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0);
        var.sqrt()
    } else {
        0.0
    };

    TcpStats {
        latency_avg_ms: Some(mean),
        jitter_ms: Some(std),
        loss_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_summarize_connects() {
        let stats = summarize_connects(&[10.0, 20.0, 30.0], 4);
        assert_eq!(stats.latency_avg_ms, Some(20.0));
        assert_eq!(stats.jitter_ms, Some(10.0));
        assert_eq!(stats.loss_pct, Some(25.0));
    }

    #[test]
    fn test_summarize_single_and_empty() {
        let one = summarize_connects(&[5.0], 1);
        assert_eq!(one.jitter_ms, Some(0.0));
        assert_eq!(one.loss_pct, Some(0.0));

        let none = summarize_connects(&[], 10);
        assert!(none.latency_avg_ms.is_none());
        assert_eq!(none.loss_pct, Some(100.0));

        assert!(summarize_connects(&[], 0).loss_pct.is_none());
    }

    #[tokio::test]
    async fn test_tcp_connect_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((_socket, _)) = listener.accept().await {}
        });

        let stats = run_tcp_connect("127.0.0.1", port, 3).await;
        assert_eq!(stats.loss_pct, Some(0.0));
        assert!(stats.latency_avg_ms.is_some());
    }
}
