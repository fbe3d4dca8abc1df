//! Batch writer that moves result records from the cycle loop into SQLite.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::db::{ResultRecord, Store};

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const FLUSH_ROWS: usize = 500;

/// Spawn the writer and return the channel the scheduler sends on.
pub fn spawn_batch_writer(store: Arc<Store>) -> mpsc::Sender<ResultRecord> {
    let (tx, rx) = mpsc::channel(1000);
    tokio::spawn(run_batch_writer(rx, store));
    tx
}

/// Accumulate records and flush every two seconds or every 500 rows.
pub async fn run_batch_writer(mut rx: mpsc::Receiver<ResultRecord>, store: Arc<Store>) {
    let mut buffer: Vec<ResultRecord> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= FLUSH_ROWS {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<ResultRecord>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_results(buffer) {
        tracing::error!("Failed to flush {} results: {}", buffer.len(), e);
    }

    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_writer_flushes_on_close() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let (tx, rx) = mpsc::channel(16);
        let writer = tokio::spawn(run_batch_writer(rx, store.clone()));

        for step in ["association", "dhcp", "dns"] {
            let record = ResultRecord {
                time: Utc::now(),
                sensor: "pi-1".to_string(),
                network: "Office".to_string(),
                step: step.to_string(),
                target: String::new(),
                ok: true,
                duration_ms: 5.0,
                error: None,
                value: None,
            };
            tx.send(record).await.unwrap();
        }
        drop(tx);
        writer.await.unwrap();

        assert_eq!(store.count_results().unwrap(), 3);
    }
}
