//! Retention manager for cleaning up old results.

use crate::db::Store;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Deletes result rows older than the retention window.
pub struct RetentionManager {
    store: Arc<Store>,
    retention_days: i64,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention_days: i64) -> Self {
        Self {
            store,
            retention_days,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let stop = self.stop.clone();
        let retention_days = self.retention_days;

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(Duration::from_secs(60));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, retention_days, Utc::now());
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn process_retention(store: &Store, retention_days: i64, now: DateTime<Utc>) {
    if retention_days <= 0 {
        return;
    }

    let cutoff = now - ChronoDuration::days(retention_days);
    match store.delete_results_before(cutoff) {
        Ok(0) => {}
        Ok(deleted) => tracing::info!("RetentionManager: deleted {} results before {}", deleted, cutoff),
        Err(e) => tracing::error!("RetentionManager: Failed to delete results: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ResultRecord;
    use tempfile::NamedTempFile;

    fn record(time: DateTime<Utc>) -> ResultRecord {
        ResultRecord {
            time,
            sensor: "pi-1".to_string(),
            network: "Office".to_string(),
            step: "dhcp".to_string(),
            target: String::new(),
            ok: true,
            duration_ms: 10.0,
            error: None,
            value: None,
        }
    }

    #[test]
    fn test_process_retention() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let now = Utc::now();
        store
            .add_results(&[record(now - ChronoDuration::days(8)), record(now - ChronoDuration::days(1))])
            .unwrap();

        process_retention(&store, 7, now);
        assert_eq!(store.count_results().unwrap(), 1);

        // Zero keeps everything.
        process_retention(&store, 0, now + ChronoDuration::days(30));
        assert_eq!(store.count_results().unwrap(), 1);
    }
}
