use std::ops::Deref;

use tempfile::TempDir;

use crate::config::Config;
use crate::db::Db;
use crate::storage::wal::MIN_WAL_CAPACITY;

/// Configuration for tests: no background flusher, the smallest log and a
/// small node cache so that checkpoints and cache misses happen early.
pub fn test_config() -> Config {
    Config::new()
        .flush_every_ms(None)
        .log_capacity_bytes(MIN_WAL_CAPACITY)
        .cache_size_bytes(256 * 1024)
}

/// Install a tracing subscriber that honors `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A database in its own temporary directory.
///
/// The directory is deleted when the `TestDb` is dropped.
pub struct TestDb {
    db: Db,
    config: Config,
    // Declared last so the database is dropped before its directory.
    dir: TempDir,
}

impl TestDb {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    #[must_use]
    pub fn with_config(config: Config) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("create temp dir");
        let db = Db::open(dir.path().join("test.db"), config.clone()).expect("open test database");
        Self { db, config, dir }
    }

    /// Drop the database handle and open the file again.
    #[must_use]
    pub fn reopen(self) -> Self {
        let Self { db, config, dir } = self;
        drop(db);
        let db = Db::open(dir.path().join("test.db"), config.clone()).expect("reopen test database");
        Self { db, config, dir }
    }
}

impl Deref for TestDb {
    type Target = Db;

    fn deref(&self) -> &Db {
        &self.db
    }
}
