use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::error::{PersistenceError, PersistenceResult};
use super::store::{Change, ChangeOp, Store, StoreSession};
use crate::config::StoreConfig;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS entities (
    kind TEXT NOT NULL,
    key  TEXT NOT NULL,
    body BLOB NOT NULL,
    PRIMARY KEY (kind, key)
)";

/// File-backed store. Every session owns its own connection.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    config: StoreConfig,
}

impl SqliteStore {
    /// Opens the database file and creates the schema if needed.
    pub fn open(config: StoreConfig) -> PersistenceResult<Self> {
        if config.connection_string.trim() == ":memory:" {
            return Err(PersistenceError::Configuration(
                "an in-memory database cannot be shared between sessions; use MemoryStore".to_string(),
            ));
        }

        let started_at = Instant::now();
        let store = Self { config };
        let conn = store.connect()?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!(
            path = %store.config.connection_string,
            duration_ms = started_at.elapsed().as_millis() as u64,
            "Store opened"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.config.connection_string)
    }

    fn connect(&self) -> PersistenceResult<Connection> {
        let attempts = self.config.retry_count.saturating_add(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match Connection::open(&self.config.connection_string).and_then(|conn| {
                conn.busy_timeout(BUSY_TIMEOUT)?;
                Ok(conn)
            }) {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    if attempt < attempts {
                        warn!(
                            attempt,
                            attempts,
                            "Failed to open store {}: {}. Retrying in {:?}",
                            self.config.connection_string,
                            e,
                            self.config.retry_delay()
                        );
                        thread::sleep(self.config.retry_delay());
                    }
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no connection attempt made".to_string());
        error!(attempts, "Store unavailable: {}", reason);
        Err(PersistenceError::Unavailable { attempts, reason })
    }
}

impl Store for SqliteStore {
    type Session = SqliteSession;

    fn open_session(&self) -> PersistenceResult<SqliteSession> {
        Ok(SqliteSession {
            conn: self.connect()?,
        })
    }
}

pub struct SqliteSession {
    conn: Connection,
}

impl SqliteSession {
    fn apply_one(&self, change: &Change) -> PersistenceResult<()> {
        let changed = match &change.op {
            ChangeOp::Insert(body) => self
                .conn
                .execute(
                    "INSERT INTO entities (kind, key, body) VALUES (?1, ?2, ?3)",
                    params![change.kind, change.key, body],
                )
                .map_err(|e| match e.sqlite_error_code() {
                    Some(ErrorCode::ConstraintViolation) => {
                        PersistenceError::conflict(&change.kind, &change.key)
                    }
                    _ => PersistenceError::Sqlite(e),
                })?,
            ChangeOp::Update(body) => self.conn.execute(
                "UPDATE entities SET body = ?3 WHERE kind = ?1 AND key = ?2",
                params![change.kind, change.key, body],
            )?,
            ChangeOp::Delete => self.conn.execute(
                "DELETE FROM entities WHERE kind = ?1 AND key = ?2",
                params![change.kind, change.key],
            )?,
        };

        if changed == 0 {
            return Err(PersistenceError::not_found(&change.kind, &change.key));
        }
        Ok(())
    }
}

impl StoreSession for SqliteSession {
    fn load(&mut self, kind: &str, key: &str) -> PersistenceResult<Option<Vec<u8>>> {
        let body = self
            .conn
            .query_row(
                "SELECT body FROM entities WHERE kind = ?1 AND key = ?2",
                params![kind, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body)
    }

    fn scan(&mut self, kind: &str) -> PersistenceResult<Vec<(String, Vec<u8>)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key, body FROM entities WHERE kind = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![kind], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let documents = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(documents)
    }

    fn apply(&mut self, changes: &[Change]) -> PersistenceResult<usize> {
        if changes.is_empty() {
            return Ok(0);
        }

        // a savepoint nests inside an open transaction and acts as one otherwise
        self.conn.execute_batch("SAVEPOINT flush")?;
        for change in changes {
            if let Err(e) = self.apply_one(change) {
                if let Err(rollback) = self
                    .conn
                    .execute_batch("ROLLBACK TO flush; RELEASE flush")
                {
                    error!("Failed to roll back flush: {}", rollback);
                }
                return Err(e);
            }
        }
        self.conn.execute_batch("RELEASE flush")?;

        debug!(changes = changes.len(), "Changes flushed");
        Ok(changes.len())
    }

    fn begin(&mut self) -> PersistenceResult<()> {
        if self.in_transaction() {
            return Err(PersistenceError::TransactionAlreadyActive);
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> PersistenceResult<()> {
        if !self.in_transaction() {
            return Err(PersistenceError::NoActiveTransaction);
        }
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> PersistenceResult<()> {
        if !self.in_transaction() {
            return Err(PersistenceError::NoActiveTransaction);
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }
}
