use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::WalStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once `threshold` appends have piled
/// up since the last compaction.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// Returns true if a compaction ran and succeeded.
pub async fn compact_if_due(store: &WalStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReservationStore;
    use crate::model::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("campsite_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn booking(start: &str, end: &str) -> Reservation {
        let span = Span::new(day(start), day(end));
        Reservation::new(User::new(None, None, "camper@example.com"), span)
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = WalStore::open(path.clone()).unwrap();

        let first = store.save(booking("2026-11-01", "2026-11-03")).await.unwrap();
        let id = first.id.unwrap();
        store.save(booking("2026-11-05", "2026-11-06")).await.unwrap();
        assert!(!compact_if_due(&store, 3).await);

        // Two updates of one reservation: four appends, two live reservations.
        let bumped = store
            .save(Reservation {
                end_date: day("2026-11-04"),
                ..first
            })
            .await
            .unwrap();
        store.save(bumped).await.unwrap();
        assert!(compact_if_due(&store, 3).await);
        assert_eq!(store.wal_appends_since_compact().await, 0);
        drop(store);

        let reopened = WalStore::open(path).unwrap();
        assert_eq!(reopened.len().await, 2);
        let got = reopened.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(got.version, Some(3));
        assert_eq!(got.end_date, day("2026-11-04"));
    }
}
