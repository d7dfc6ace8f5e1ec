use std::sync::Arc;
use std::time::Duration;

use shaman_config::{log_gc_info, log_gc_warn};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{collect_in_background, GarbageCollector};

/// Collect every `period` until `cancel` fires. The first run happens one
/// period after startup.
pub fn spawn_periodic(
    collector: Arc<GarbageCollector>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log_gc_info!("Periodic garbage collection enabled", period_secs = period.as_secs());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match collect_in_background(collector.clone(), false, cancel.clone()).await {
                Ok(stats) if stats.aborted => break,
                Ok(_) => {}
                Err(e) => {
                    log_gc_warn!("Garbage collection failed", error = tracing::field::display(&e));
                }
            }
        }
        log_gc_info!("Periodic garbage collection stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shaman_store::FileStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(temp.path().join("file-store")).unwrap());
        let collector = Arc::new(GarbageCollector::new(
            store,
            temp.path().join("jobs"),
            Vec::new(),
            Duration::from_secs(3600),
        ));
        let cancel = CancellationToken::new();

        let handle = spawn_periodic(collector, Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("periodic task did not stop")
            .unwrap();
    }
}
