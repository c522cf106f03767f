use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::StorageError;

const SQLITE_PREFIX: &str = "sqlite://";
const IN_MEMORY: &str = ":memory:";
const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const CREATE_VISITS_TABLE: &str = "CREATE TABLE IF NOT EXISTS visits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

pub type EventId = i64;

/// One recorded visit. Never mutated once the log hands it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitEvent {
    pub id: EventId,
    pub occurred_at: DateTime<Utc>,
}

/// Append-only, authoritative record of visits.
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Durably persist one new visit. Not idempotent: a blind retry may double count.
    async fn append(&self) -> Result<VisitEvent, StorageError>;
    /// Exact number of visits committed before this call started.
    async fn count_all(&self) -> Result<u64, StorageError>;
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Integrity(err.to_string())
            }
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

/// SQLite-backed event log.
///
/// The database runs in WAL mode with `synchronous = FULL`, so an append is on
/// disk before it is acknowledged. All SQLite calls happen on the blocking pool.
#[derive(Clone)]
pub struct SqliteEventLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventLog {
    /// Open (or create) the log named by `url`: `sqlite://<path>`, a bare path, or `:memory:`.
    pub fn open(url: &str) -> Result<Self, StorageError> {
        let path = url.strip_prefix(SQLITE_PREFIX).unwrap_or(url);
        if path.is_empty() {
            return Err(StorageError::Unavailable(
                "empty database location".to_string(),
            ));
        }

        let conn = if path == IN_MEMORY {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StorageError::Unavailable(format!(
                            "fail to create directory {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
            }
            let conn = Connection::open(path)?;
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!("sqlite journal mode: {mode}");
            conn
        };

        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute(CREATE_VISITS_TABLE, [])?;

        tracing::info!("visit log opened at {path}");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StorageError::Unavailable("sqlite handle poisoned".to_string()))?;
            f(&conn).map_err(StorageError::from)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("sqlite worker failed: {e}")))?
    }
}

#[async_trait::async_trait]
impl EventLog for SqliteEventLog {
    async fn append(&self) -> Result<VisitEvent, StorageError> {
        let (id, created_at) = self
            .with_conn(|conn| {
                conn.query_row(
                    "INSERT INTO visits DEFAULT VALUES RETURNING id, created_at",
                    [],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
            })
            .await?;

        let occurred_at = NaiveDateTime::parse_from_str(&created_at, CREATED_AT_FORMAT)
            .map_err(|e| {
                StorageError::Integrity(format!("invalid created_at `{created_at}`: {e}"))
            })?
            .and_utc();

        Ok(VisitEvent { id, occurred_at })
    }

    async fn count_all(&self) -> Result<u64, StorageError> {
        let count = self
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM visits", [], |row| row.get::<_, i64>(0))
            })
            .await?;

        u64::try_from(count)
            .map_err(|_| StorageError::Integrity(format!("negative visit count {count}")))
    }
}

/// In-process event log for tests and local runs. Can be switched offline to
/// simulate an unreachable store.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<VisitEvent>>,
    offline: AtomicBool,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that already holds `n` visits.
    pub fn with_events(n: u64) -> Self {
        let now = Utc::now();
        let events = (1..=n as EventId)
            .map(|id| VisitEvent {
                id,
                occurred_at: now,
            })
            .collect();
        Self {
            events: Mutex::new(events),
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "memory log is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self) -> Result<VisitEvent, StorageError> {
        self.check_online()?;
        let mut events = self
            .events
            .lock()
            .map_err(|_| StorageError::Unavailable("memory log poisoned".to_string()))?;
        let event = VisitEvent {
            id: events.last().map_or(1, |last| last.id + 1),
            occurred_at: Utc::now(),
        };
        events.push(event.clone());
        Ok(event)
    }

    async fn count_all(&self) -> Result<u64, StorageError> {
        self.check_online()?;
        let events = self
            .events
            .lock()
            .map_err(|_| StorageError::Unavailable("memory log poisoned".to_string()))?;
        Ok(events.len() as u64)
    }
}
