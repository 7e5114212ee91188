//! SQLite-backed [`Store`].
//!
//! One table holds every partition. Bodies are stored as JSON so the schema
//! does not change when record types grow fields.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, params};

use crate::sqlite_util::open_secure_db;
use crate::store::{Page, Record, RecordBody, Store, StoreError, Write};

pub struct SqliteStore {
    db: Mutex<Connection>,
    page_size: usize,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS records (
            partition TEXT NOT NULL,
            sort TEXT NOT NULL,
            version INTEGER NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (partition, sort)
        ) WITHOUT ROWID;
    ";

    pub const DEFAULT_PAGE_SIZE: usize = 100;

    /// Open or create a store database at the given path.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let db = open_secure_db(path)?;
        Self::initialize(db)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory store")?;
        Self::initialize(db)
    }

    fn initialize(db: Connection) -> anyhow::Result<Self> {
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .context("Failed to set store pragmas")?;
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create store schema")?;
        Ok(Self {
            db: Mutex::new(db),
            page_size: Self::DEFAULT_PAGE_SIZE,
        })
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn backend(err: rusqlite::Error, what: &'static str) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err).context(what))
}

impl Store for SqliteStore {
    fn write_batch(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(|e| backend(e, "Failed to start store transaction"))?;

        for write in &writes {
            let current: Option<i64> = tx
                .query_row(
                    "SELECT version FROM records WHERE partition = ?1 AND sort = ?2",
                    params![write.record.partition, write.record.sort],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| backend(e, "Failed to read record version"))?;

            if !write.condition.holds(current.map(|v| v as u64)) {
                return Err(StoreError::ConditionFailed {
                    partition: write.record.partition.clone(),
                    sort: write.record.sort.clone(),
                });
            }
        }

        for write in &writes {
            let body = serde_json::to_string(&write.record.body)?;
            tx.execute(
                "INSERT OR REPLACE INTO records (partition, sort, version, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    write.record.partition,
                    write.record.sort,
                    write.record.version as i64,
                    body
                ],
            )
            .map_err(|e| backend(e, "Failed to write record"))?;
        }

        tx.commit()
            .map_err(|e| backend(e, "Failed to commit store transaction"))
    }

    fn query(
        &self,
        partition: &str,
        descending: bool,
        limit: usize,
        page_token: Option<&str>,
    ) -> Result<Page, StoreError> {
        let (order, cursor_op) = if descending {
            ("DESC", "<")
        } else {
            ("ASC", ">")
        };
        let cursor_clause = if page_token.is_some() {
            format!("AND sort {cursor_op} ?2")
        } else {
            "AND ?2 IS NULL".to_string()
        };
        let sql = format!(
            "SELECT sort, version, body FROM records
             WHERE partition = ?1 {cursor_clause}
             ORDER BY sort {order}
             LIMIT ?3"
        );

        // One extra row tells us whether another page exists.
        let take = limit.min(self.page_size);
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| backend(e, "Failed to prepare partition query"))?;
        let rows = stmt
            .query_map(params![partition, page_token, (take + 1) as i64], |row| {
                let sort: String = row.get(0)?;
                let version: i64 = row.get(1)?;
                let body: String = row.get(2)?;
                Ok((sort, version, body))
            })
            .map_err(|e| backend(e, "Failed to query partition"))?;

        let mut records = Vec::with_capacity(take);
        let mut has_more = false;
        for row in rows {
            let (sort, version, body) = row.map_err(|e| backend(e, "Failed to read record row"))?;
            if records.len() == take {
                has_more = true;
                break;
            }
            let body: RecordBody = serde_json::from_str(&body)?;
            records.push(Record {
                partition: partition.to_string(),
                sort,
                version: version as u64,
                body,
            });
        }

        let next = if has_more {
            records.last().map(|r| r.sort.clone())
        } else {
            None
        };
        Ok(Page { records, next })
    }
}
