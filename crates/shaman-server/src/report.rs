use std::sync::Arc;
use std::time::Duration;

use shaman_config::{log_server_info, log_server_warn};
use shaman_store::FileStore;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::upload::UploadCoordinator;

/// Periodically log store size and in-flight uploads until `cancel` fires.
pub fn spawn_reporter(
    store: Arc<FileStore>,
    uploads: Arc<UploadCoordinator>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let walker = store.clone();
            match tokio::task::spawn_blocking(move || walker.stats()).await {
                Ok(Ok(stats)) => log_server_info!(
                    "Store status",
                    stored_files = stats.stored_files,
                    stored_bytes = stats.stored_bytes,
                    avg_blob_size = stats.avg_blob_size(),
                    uploading_files = stats.uploading_files,
                    uploads_in_flight = uploads.in_flight(),
                ),
                Ok(Err(e)) => log_server_warn!(
                    "Unable to collect store statistics",
                    error = tracing::field::display(&e),
                ),
                Err(e) => log_server_warn!("Statistics task failed", error = tracing::field::display(&e)),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reporter_stops_on_cancel() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(temp.path()).unwrap());
        let uploads = Arc::new(UploadCoordinator::new(store.clone()));
        let cancel = CancellationToken::new();

        let handle = spawn_reporter(store, uploads, Duration::from_millis(5), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reporter did not stop")
            .unwrap();
    }
}
