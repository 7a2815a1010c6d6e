//! Background log flushing.
//!
//! When `flush_every_ms` is set, committed log groups are written and synced
//! on a timer so callers do not have to call `flush` themselves.
//!
//! The flusher holds a `Weak<Inner>`: when the last `Db` handle is dropped,
//! `Weak::upgrade()` fails on the next tick and the flusher exits.
//!
//! Inside a tokio runtime the flusher is a task whose ticks run on the
//! blocking pool. Without a runtime it is a plain named thread.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;

use crate::db::Inner;

/// Start flushing `db` every `interval`.
pub(crate) fn spawn(db: Weak<Inner>, interval: Duration) {
    if let Ok(handle) = Handle::try_current() {
        drop(spawn_task(&handle, db, interval));
        return;
    }

    if let Err(e) = spawn_thread(db, interval) {
        tracing::warn!(error = %e, "failed to start background flusher");
    }
}

fn spawn_task(handle: &Handle, db: Weak<Inner>, interval: Duration) -> tokio::task::JoinHandle<()> {
    handle.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let db = Weak::clone(&db);
            match tokio::task::spawn_blocking(move || tick(&db)).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::error!(error = %e, "background flusher panicked");
                    break;
                }
            }
        }
    })
}

fn spawn_thread(
    db: Weak<Inner>,
    interval: Duration,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("treestore-flusher".to_string())
        .spawn(move || {
            loop {
                std::thread::sleep(interval);
                if !tick(&db) {
                    break;
                }
            }
        })
}

/// Flush once. Returns `false` once the database is gone.
fn tick(db: &Weak<Inner>) -> bool {
    let Some(inner) = db.upgrade() else {
        return false;
    };

    match inner.flush() {
        Ok(0) => {}
        Ok(bytes) => tracing::trace!(bytes, "background flush"),
        // A failed flush leaves the records buffered; the next tick retries.
        Err(e) => tracing::warn!(error = %e, "background flush failed"),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDb;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_task_exits_when_database_dropped() {
        let db = TestDb::new();
        let weak = Arc::downgrade(db.inner());
        let handle = spawn_task(&Handle::current(), weak, Duration::from_millis(10));

        drop(db);

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(
            result.is_ok(),
            "flusher should exit when the database is dropped"
        );
    }

    #[tokio::test]
    async fn test_task_flushes_committed_groups() {
        let db = TestDb::new();
        let _handle = spawn_task(
            &Handle::current(),
            Arc::downgrade(db.inner()),
            Duration::from_millis(10),
        );

        db.insert(b"k", b"v").expect("insert");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(db.flush().expect("flush"), 0, "nothing left to flush");
    }

    #[test]
    fn test_thread_exits_when_database_dropped() {
        let db = TestDb::new();
        let handle = spawn_thread(Arc::downgrade(db.inner()), Duration::from_millis(10))
            .expect("spawn flusher thread");

        db.insert(b"k", b"v").expect("insert");
        drop(db);

        handle.join().expect("flusher thread should not panic");
    }

    #[test]
    fn test_tick_on_dropped_database() {
        let db = TestDb::new();
        let weak = Arc::downgrade(db.inner());
        assert!(tick(&weak));

        drop(db);
        assert!(!tick(&weak));
    }
}
