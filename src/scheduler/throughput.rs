//! Parallel download test.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::probe::{DownloadSample, ProbeError, ProbeProvider};

/// Aggregate of the downloads that finished before the deadline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputOutcome {
    pub mbps: Option<f64>,
    pub completed: usize,
    pub total_bytes: u64,
}

/// Download every URL with at most `workers` in flight and stop waiting at `timeout`.
///
/// Downloads still running at the deadline are detached and left out of the result.
pub async fn run_throughput(
    provider: Arc<dyn ProbeProvider>,
    urls: &[String],
    workers: usize,
    timeout: Duration,
) -> ThroughputOutcome {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut set = JoinSet::new();

    for url in urls {
        let provider = provider.clone();
        let semaphore = semaphore.clone();
        let url = url.clone();
        set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| ProbeError::Command("download pool closed".to_string()))?;
            provider.download(&url, timeout).await
        });
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let mut samples: Vec<DownloadSample> = Vec::with_capacity(urls.len());

    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok(Ok(sample)))) => samples.push(sample),
            Ok(Some(Ok(Err(e)))) => tracing::debug!("Throughput download failed: {}", e),
            Ok(Some(Err(e))) => tracing::warn!("Throughput worker panicked: {}", e),
            Ok(None) => break,
            Err(_) => {
                tracing::debug!("Throughput deadline reached with {} downloads running", set.len());
                set.detach_all();
                break;
            }
        }
    }

    aggregate(&samples)
}

/// Total bits over the slowest download's elapsed time.
pub fn aggregate(samples: &[DownloadSample]) -> ThroughputOutcome {
    let total_bytes: u64 = samples.iter().map(|s| s.bytes).sum();
    let max_elapsed = samples
        .iter()
        .map(|s| s.elapsed.as_secs_f64())
        .fold(0.0, f64::max);

    let mbps = (total_bytes > 0 && max_elapsed > 0.0)
        .then(|| total_bytes as f64 * 8.0 / (max_elapsed * 1_000_000.0));

    ThroughputOutcome {
        mbps,
        completed: samples.len(),
        total_bytes,
    }
}
