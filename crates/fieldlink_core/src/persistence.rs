use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

use crate::config::FieldConfig;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Delivery state of one outgoing report for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientStatusRow {
    pub report_id: String,
    pub recipient_id: String,
    /// Wire name of the report kind (`order`, `report`, `methane`, `medevac`).
    pub kind: String,
    pub sent_at_millis: i64,
    pub delivered_at_millis: Option<i64>,
    pub read_at_millis: Option<i64>,
}

/// A report received by this device, with its local read flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingReportRow {
    pub report_id: String,
    pub kind: String,
    pub sender_id: String,
    pub received_at_millis: i64,
    pub read: bool,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Durable home for delivery/read state. Every tracker mutation writes
/// through one of these calls.
pub trait DeliveryStore: Send + Sync {
    /// Inserts a status row. Returns `false` (and leaves the existing row
    /// untouched) if one already exists for the pair.
    fn insert_status(&self, row: &RecipientStatusRow) -> Result<bool>;

    fn get_status(&self, report_id: &str, recipient_id: &str)
    -> Result<Option<RecipientStatusRow>>;

    fn update_status(&self, row: &RecipientStatusRow) -> Result<()>;

    fn statuses_for_report(&self, report_id: &str) -> Result<Vec<RecipientStatusRow>>;

    /// Records an incoming report. Returns `false` if it was already known.
    fn record_incoming(&self, row: &IncomingReportRow) -> Result<bool>;

    fn get_incoming(&self, report_id: &str) -> Result<Option<IncomingReportRow>>;

    /// Flips the read flag. Returns `true` only on the unread -> read
    /// transition; unknown or already-read reports return `false`.
    fn mark_incoming_read(&self, report_id: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store, used by tests and by deployments without a disk.
#[derive(Default)]
pub struct MemoryDeliveryStore {
    statuses: Mutex<HashMap<(String, String), RecipientStatusRow>>,
    incoming: Mutex<HashMap<String, IncomingReportRow>>,
}

impl MemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeliveryStore for MemoryDeliveryStore {
    fn insert_status(&self, row: &RecipientStatusRow) -> Result<bool> {
        let key = (row.report_id.clone(), row.recipient_id.clone());
        let mut statuses = self.statuses.lock();
        if statuses.contains_key(&key) {
            return Ok(false);
        }
        statuses.insert(key, row.clone());
        Ok(true)
    }

    fn get_status(
        &self,
        report_id: &str,
        recipient_id: &str,
    ) -> Result<Option<RecipientStatusRow>> {
        let key = (report_id.to_string(), recipient_id.to_string());
        Ok(self.statuses.lock().get(&key).cloned())
    }

    fn update_status(&self, row: &RecipientStatusRow) -> Result<()> {
        let key = (row.report_id.clone(), row.recipient_id.clone());
        self.statuses.lock().insert(key, row.clone());
        Ok(())
    }

    fn statuses_for_report(&self, report_id: &str) -> Result<Vec<RecipientStatusRow>> {
        let mut rows: Vec<_> = self
            .statuses
            .lock()
            .values()
            .filter(|r| r.report_id == report_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.recipient_id.cmp(&b.recipient_id));
        Ok(rows)
    }

    fn record_incoming(&self, row: &IncomingReportRow) -> Result<bool> {
        let mut incoming = self.incoming.lock();
        if incoming.contains_key(&row.report_id) {
            return Ok(false);
        }
        incoming.insert(row.report_id.clone(), row.clone());
        Ok(true)
    }

    fn get_incoming(&self, report_id: &str) -> Result<Option<IncomingReportRow>> {
        Ok(self.incoming.lock().get(report_id).cloned())
    }

    fn mark_incoming_read(&self, report_id: &str) -> Result<bool> {
        match self.incoming.lock().get_mut(report_id) {
            Some(row) if !row.read => {
                row.read = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// SQLite-backed delivery store at `~/.fieldlink/delivery.db`.
pub struct SqliteDeliveryStore {
    conn: Mutex<Connection>,
}

impl SqliteDeliveryStore {
    /// Opens (or creates) the database at the default location.
    pub fn open() -> Result<Self> {
        Self::open_at(FieldConfig::db_path()?)
    }

    /// Opens (or creates) the database at the given path.
    pub fn open_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("Delivery store opened at {}", path.display());
        Ok(store)
    }

    /// Opens an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS recipient_status (
                report_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                sent_at INTEGER NOT NULL,
                delivered_at INTEGER,
                read_at INTEGER,
                PRIMARY KEY (report_id, recipient_id)
            );

            CREATE TABLE IF NOT EXISTS incoming_report (
                report_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                read INTEGER NOT NULL DEFAULT 0
            );
            ",
        )?;
        Ok(())
    }

    fn status_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecipientStatusRow> {
        Ok(RecipientStatusRow {
            report_id: row.get(0)?,
            recipient_id: row.get(1)?,
            kind: row.get(2)?,
            sent_at_millis: row.get(3)?,
            delivered_at_millis: row.get(4)?,
            read_at_millis: row.get(5)?,
        })
    }
}

impl DeliveryStore for SqliteDeliveryStore {
    fn insert_status(&self, row: &RecipientStatusRow) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "INSERT OR IGNORE INTO recipient_status
                (report_id, recipient_id, kind, sent_at, delivered_at, read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.report_id,
                row.recipient_id,
                row.kind,
                row.sent_at_millis,
                row.delivered_at_millis,
                row.read_at_millis
            ],
        )?;
        Ok(changed == 1)
    }

    fn get_status(
        &self,
        report_id: &str,
        recipient_id: &str,
    ) -> Result<Option<RecipientStatusRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT report_id, recipient_id, kind, sent_at, delivered_at, read_at
                 FROM recipient_status WHERE report_id = ?1 AND recipient_id = ?2",
                params![report_id, recipient_id],
                Self::status_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn update_status(&self, row: &RecipientStatusRow) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE recipient_status SET delivered_at = ?3, read_at = ?4
             WHERE report_id = ?1 AND recipient_id = ?2",
            params![
                row.report_id,
                row.recipient_id,
                row.delivered_at_millis,
                row.read_at_millis
            ],
        )?;
        Ok(())
    }

    fn statuses_for_report(&self, report_id: &str) -> Result<Vec<RecipientStatusRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT report_id, recipient_id, kind, sent_at, delivered_at, read_at
             FROM recipient_status WHERE report_id = ?1 ORDER BY recipient_id",
        )?;
        let rows = stmt
            .query_map(params![report_id], Self::status_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn record_incoming(&self, row: &IncomingReportRow) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "INSERT OR IGNORE INTO incoming_report (report_id, kind, sender_id, received_at, read)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.report_id,
                row.kind,
                row.sender_id,
                row.received_at_millis,
                row.read
            ],
        )?;
        Ok(changed == 1)
    }

    fn get_incoming(&self, report_id: &str) -> Result<Option<IncomingReportRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT report_id, kind, sender_id, received_at, read
                 FROM incoming_report WHERE report_id = ?1",
                params![report_id],
                |row| {
                    Ok(IncomingReportRow {
                        report_id: row.get(0)?,
                        kind: row.get(1)?,
                        sender_id: row.get(2)?,
                        received_at_millis: row.get(3)?,
                        read: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn mark_incoming_read(&self, report_id: &str) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE incoming_report SET read = 1 WHERE report_id = ?1 AND read = 0",
            params![report_id],
        )?;
        Ok(changed == 1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
