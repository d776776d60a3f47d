//! Purpose: Record store reached by the ingestion adapter.
//! Exports: `IngestRow`, `InsertOutcome`, `RecordStore`, `SqliteStore`.
//! Role: Single-table `users` store; one handle per process, cloned into each adapter.
//! Invariants: Inserts are idempotent; a duplicate `id` or `email` is `Ignored`, not an error.
//! Invariants: SQLite calls run on the blocking pool, serialized by one connection mutex.
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, params};

use crate::core::error::{Error, ErrorKind};

/// A parsed, validated row on its way to the store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IngestRow {
    pub id: Option<i64>,
    pub name: String,
    pub email: String,
    pub age: Option<i64>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    Ignored,
}

pub trait RecordStore: Send + Sync + 'static {
    fn insert_if_absent(
        &self,
        row: IngestRow,
    ) -> impl Future<Output = Result<InsertOutcome, Error>> + Send;
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    name TEXT,
    email TEXT UNIQUE,
    age INTEGER
)";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

fn store_error(err: rusqlite::Error, message: &str) -> Error {
    Error::new(ErrorKind::Store)
        .with_message(message)
        .with_source(err)
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                Error::from_io(err, "failed to create store directory").with_path(parent)
            })?;
        }
        let conn = Connection::open(&path)
            .map_err(|err| store_error(err, "failed to open store").with_path(&path))?;
        Self::init(conn, Some(path))
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn =
            Connection::open_in_memory().map_err(|err| store_error(err, "failed to open store"))?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, Error> {
        conn.execute(SCHEMA, [])
            .map_err(|err| store_error(err, "failed to create users table"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of stored users.
    pub fn count(&self) -> Result<u64, Error> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .map_err(|err| store_error(err, "failed to count users"))?;
        Ok(count.max(0) as u64)
    }

    /// Looks up one user by id.
    pub fn get(&self, id: i64) -> Result<Option<IngestRow>, Error> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, name, email, age FROM users WHERE id = ?1")
            .map_err(|err| store_error(err, "failed to prepare lookup"))?;
        let mut rows = stmt
            .query_map([id], |row| {
                Ok(IngestRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    age: row.get(3)?,
                })
            })
            .map_err(|err| store_error(err, "failed to look up user"))?;
        rows.next()
            .transpose()
            .map_err(|err| store_error(err, "failed to read user"))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, Error> {
        self.conn
            .lock()
            .map_err(|_| Error::new(ErrorKind::Store).with_message("store connection poisoned"))
    }

    fn insert_blocking(&self, row: &IngestRow) -> Result<InsertOutcome, Error> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO users (id, name, email, age) VALUES (?1, ?2, ?3, ?4)",
                params![row.id, row.name, row.email, row.age],
            )
            .map_err(|err| store_error(err, "failed to insert user"))?;
        Ok(if changed == 0 {
            InsertOutcome::Ignored
        } else {
            InsertOutcome::Inserted
        })
    }
}

impl RecordStore for SqliteStore {
    async fn insert_if_absent(&self, row: IngestRow) -> Result<InsertOutcome, Error> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.insert_blocking(&row))
            .await
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("store task failed")
                    .with_source(err)
            })?
    }
}
