use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

use crate::adapters::db::{SqliteStore, open_connection, run_migrations};
use crate::app::services::SharedClock;
use crate::domain::session_state::Clock;

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);
const TEST_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn shared(now: DateTime<Utc>) -> SharedClock {
        Arc::new(Self(now))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn in_memory_store() -> SqliteStore {
    SqliteStore::open_in_memory().expect("in-memory store should open")
}

/// A separate handle on `path`, behaving like another service instance.
pub fn file_store(path: &Path) -> SqliteStore {
    SqliteStore::open(path.to_string_lossy().as_ref(), TEST_BUSY_TIMEOUT)
        .expect("file store should open")
}

pub fn temp_db_path(name: &str) -> PathBuf {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join(name);
    std::mem::forget(dir);
    path
}

/// Fresh copy of a migrated template database.
pub fn template_store(test_name: &str) -> SqliteStore {
    let template = ensure_template_db();
    let test_db_path = unique_test_db_path(test_name);

    if let Some(parent) = test_db_path.parent() {
        std::fs::create_dir_all(parent).expect("test db dir should be creatable");
    }

    std::fs::copy(&template, &test_db_path).expect("template db should be copied");
    file_store(&test_db_path)
}

fn ensure_template_db() -> PathBuf {
    static TEMPLATE_PATH: OnceLock<PathBuf> = OnceLock::new();

    TEMPLATE_PATH
        .get_or_init(|| {
            let template_path = std::env::var("TEST_DB_TEMPLATE_PATH")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| temp_db_path("orchestrator_template.db"));

            if let Some(parent) = template_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).expect("template parent dir should be creatable");
            }

            let mut connection =
                open_connection(template_path.to_string_lossy().as_ref(), TEST_BUSY_TIMEOUT)
                    .expect("template db opens");
            run_migrations(&mut connection).expect("template migrations should succeed");
            drop(connection);

            template_path
        })
        .clone()
}

fn unique_test_db_path(test_name: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir()
        .join("charge_orchestrator_testdb")
        .join(format!("{test_name}-{now}-{counter}.sqlite"))
}
