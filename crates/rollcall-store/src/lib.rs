//! rollcall-store — SQLite persistence for identities and attendance.
//!
//! One [`SqliteStore`] implements both store traits from `rollcall-core`
//! over a single connection.
//!
//! # Schema
//!
//! - `identities`: `id`, `display_name`, `external_ref` (unique),
//!   `descriptors` (JSON array), `created_ms`, optional `category` and `rank`.
//! - `attendance`: one row per registration. `day_start_ms` is the UTC start
//!   of the record's attendance day; `(day_start_ms, sequence)` and
//!   `(identity_id, day_start_ms)` are unique.
//! - `edit_history`: append-only, keyed by `(record_id, position)`.

use chrono::{DateTime, TimeZone, Utc};
use rollcall_core::store::{AttendanceStore, DayWindow, IdentityStore, LedgerTx, StoreError};
use rollcall_core::{AttendanceRecord, Candidate, Descriptor, EditEntry, Identity, RecognitionMode};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    external_ref TEXT NOT NULL UNIQUE,
    descriptors TEXT NOT NULL DEFAULT '[]',
    created_ms INTEGER NOT NULL,
    category TEXT,
    rank TEXT
);
CREATE TABLE IF NOT EXISTS attendance (
    id TEXT PRIMARY KEY,
    day_start_ms INTEGER NOT NULL,
    sequence INTEGER NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    identity_id TEXT,
    display_name TEXT NOT NULL,
    mode TEXT NOT NULL,
    confidence INTEGER,
    is_visitor INTEGER NOT NULL,
    evidence_ref TEXT NOT NULL,
    UNIQUE (day_start_ms, sequence),
    UNIQUE (identity_id, day_start_ms)
);
CREATE INDEX IF NOT EXISTS idx_attendance_timestamp ON attendance(timestamp_ms);
CREATE TABLE IF NOT EXISTS edit_history (
    record_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    previous_name TEXT NOT NULL,
    edited_by TEXT NOT NULL,
    edited_ms INTEGER NOT NULL,
    PRIMARY KEY (record_id, position)
);
";

const IDENTITY_COLUMNS: &str = "id, display_name, external_ref, descriptors, created_ms, category, rank";

/// Columns added after the first release, for databases created before them.
const IDENTITY_ADDED_COLUMNS: [(&str, &str); 2] = [("category", "TEXT"), ("rank", "TEXT")];

const RECORD_COLUMNS: &str = "id, sequence, timestamp_ms, identity_id, display_name, mode, \
                              confidence, is_visitor, evidence_ref";

fn sql_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict(e.to_string())
        }
        _ => StoreError::Unavailable(e.to_string()),
    }
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

/// SQLite-backed identity and attendance store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(sql_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(sql_err)?;
        tracing::info!(path = %path.display(), journal = %mode, "opened attendance database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let existing = conn
        .prepare("SELECT name FROM pragma_table_info('identities')")
        .and_then(|mut stmt| {
            stmt.query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .map_err(sql_err)?;
    for (column, kind) in IDENTITY_ADDED_COLUMNS {
        if !existing.iter().any(|c| c == column) {
            conn.execute_batch(&format!("ALTER TABLE identities ADD COLUMN {column} {kind}"))
                .map_err(sql_err)?;
            tracing::info!(column, "identities table migrated");
        }
    }
    Ok(())
}

// --- identities ---

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<(Identity, String)> {
    let created_ms: i64 = row.get(4)?;
    Ok((
        Identity {
            id: row.get(0)?,
            display_name: row.get(1)?,
            external_ref: row.get(2)?,
            descriptors: Vec::new(),
            created_at: Utc.timestamp_millis_opt(created_ms).single().unwrap_or_default(),
            category: row.get(5)?,
            rank: row.get(6)?,
        },
        row.get(3)?,
    ))
}

fn decode_identity((mut identity, descriptors): (Identity, String)) -> Result<Identity, StoreError> {
    identity.descriptors = serde_json::from_str(&descriptors)
        .map_err(|e| StoreError::Corrupt(format!("descriptors of {}: {e}", identity.id)))?;
    Ok(identity)
}

fn load_identity(conn: &Connection, id: &str) -> Result<Identity, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
            params![id],
            identity_from_row,
        )
        .optional()
        .map_err(sql_err)?
        .ok_or_else(|| StoreError::IdentityNotFound(id.to_string()))?;
    decode_identity(row)
}

impl IdentityStore for SqliteStore {
    fn create_identity(&self, display_name: &str, external_ref: &str) -> Result<Identity, StoreError> {
        let conn = self.lock()?;
        let taken: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM identities WHERE external_ref = ?1)",
                params![external_ref],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        if taken {
            return Err(StoreError::DuplicateExternalRef(external_ref.to_string()));
        }

        let now = Utc::now();
        let identity = Identity {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            external_ref: external_ref.to_string(),
            descriptors: Vec::new(),
            created_at: now,
            category: None,
            rank: None,
        };
        conn.execute(
            "INSERT INTO identities (id, display_name, external_ref, descriptors, created_ms)
             VALUES (?1, ?2, ?3, '[]', ?4)",
            params![identity.id, identity.display_name, identity.external_ref, now.timestamp_millis()],
        )
        .map_err(|e| match sql_err(e) {
            StoreError::Conflict(_) => StoreError::DuplicateExternalRef(external_ref.to_string()),
            other => other,
        })?;
        tracing::info!(identity = %identity.id, name = display_name, "identity created");
        Ok(identity)
    }

    fn get_identity(&self, id: &str) -> Result<Identity, StoreError> {
        let conn = self.lock()?;
        load_identity(&conn, id)
    }

    fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY created_ms, rowid"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], identity_from_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter().map(decode_identity).collect()
    }

    fn rename_identity(&self, id: &str, display_name: &str) -> Result<Identity, StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE identities SET display_name = ?2 WHERE id = ?1",
                params![id, display_name],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::IdentityNotFound(id.to_string()));
        }
        load_identity(&conn, id)
    }

    fn set_attributes(
        &self,
        id: &str,
        category: Option<&str>,
        rank: Option<&str>,
    ) -> Result<Identity, StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE identities SET category = ?2, rank = ?3 WHERE id = ?1",
                params![id, category, rank],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::IdentityNotFound(id.to_string()));
        }
        load_identity(&conn, id)
    }

    fn replace_descriptors(&self, id: &str, descriptors: &[Descriptor]) -> Result<(), StoreError> {
        let json = serde_json::to_string(descriptors)
            .map_err(|e| StoreError::Corrupt(format!("encode descriptors: {e}")))?;
        let conn = self.lock()?;
        // Single UPDATE: the old set is replaced whole or not at all.
        let changed = conn
            .execute(
                "UPDATE identities SET descriptors = ?2 WHERE id = ?1",
                params![id, json],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::IdentityNotFound(id.to_string()));
        }
        tracing::debug!(identity = id, count = descriptors.len(), "reference descriptors replaced");
        Ok(())
    }

    fn candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        Ok(self
            .list_identities()?
            .into_iter()
            .filter(|i| i.is_enrolled())
            .map(|i| Candidate {
                identity_id: i.id,
                display_name: i.display_name,
                references: i.descriptors,
            })
            .collect())
    }
}

// --- attendance ---

struct RecordRow {
    id: String,
    sequence: u32,
    timestamp_ms: i64,
    identity_id: Option<String>,
    display_name: String,
    mode: String,
    confidence: Option<u8>,
    is_visitor: bool,
    evidence_ref: String,
}

fn record_row(row: &Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        id: row.get(0)?,
        sequence: row.get(1)?,
        timestamp_ms: row.get(2)?,
        identity_id: row.get(3)?,
        display_name: row.get(4)?,
        mode: row.get(5)?,
        confidence: row.get(6)?,
        is_visitor: row.get(7)?,
        evidence_ref: row.get(8)?,
    })
}

fn load_history(conn: &Connection, record_id: &str) -> Result<Vec<EditEntry>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT previous_name, edited_by, edited_ms FROM edit_history
             WHERE record_id = ?1 ORDER BY position",
        )
        .map_err(sql_err)?;
    let rows = stmt
        .query_map(params![record_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })
        .map_err(sql_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_err)?;
    rows.into_iter()
        .map(|(previous_name, edited_by, ms)| {
            Ok(EditEntry {
                previous_name,
                edited_by,
                edited_at: millis_to_utc(ms)?,
            })
        })
        .collect()
}

fn hydrate(conn: &Connection, row: RecordRow) -> Result<AttendanceRecord, StoreError> {
    let mode = RecognitionMode::parse(&row.mode)
        .ok_or_else(|| StoreError::Corrupt(format!("record {}: mode {:?}", row.id, row.mode)))?;
    let edit_history = load_history(conn, &row.id)?;
    Ok(AttendanceRecord {
        timestamp: millis_to_utc(row.timestamp_ms)?,
        id: row.id,
        sequence: row.sequence,
        identity_id: row.identity_id,
        display_name: row.display_name,
        mode,
        confidence: row.confidence,
        is_visitor: row.is_visitor,
        evidence_ref: row.evidence_ref,
        edit_history,
    })
}

fn load_record(conn: &Connection, id: &str) -> Result<AttendanceRecord, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM attendance WHERE id = ?1"),
            params![id],
            record_row,
        )
        .optional()
        .map_err(sql_err)?
        .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))?;
    hydrate(conn, row)
}

struct SqliteLedgerTx<'a> {
    conn: &'a Connection,
}

impl LedgerTx for SqliteLedgerTx<'_> {
    fn find_for_identity(
        &mut self,
        identity_id: &str,
        day: &DayWindow,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM attendance
                     WHERE identity_id = ?1 AND timestamp_ms >= ?2 AND timestamp_ms < ?3
                     ORDER BY sequence LIMIT 1"
                ),
                params![identity_id, day.start.timestamp_millis(), day.end.timestamp_millis()],
                record_row,
            )
            .optional()
            .map_err(sql_err)?;
        row.map(|r| hydrate(self.conn, r)).transpose()
    }

    fn max_sequence(&mut self, day: &DayWindow) -> Result<u32, StoreError> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM attendance
                 WHERE timestamp_ms >= ?1 AND timestamp_ms < ?2",
                params![day.start.timestamp_millis(), day.end.timestamp_millis()],
                |row| row.get(0),
            )
            .map_err(sql_err)
    }

    fn insert(&mut self, record: &AttendanceRecord, day: &DayWindow) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO attendance (id, day_start_ms, sequence, timestamp_ms, identity_id,
                     display_name, mode, confidence, is_visitor, evidence_ref)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    day.start.timestamp_millis(),
                    record.sequence,
                    record.timestamp.timestamp_millis(),
                    record.identity_id,
                    record.display_name,
                    record.mode.as_str(),
                    record.confidence,
                    record.is_visitor,
                    record.evidence_ref,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }
}

impl AttendanceStore for SqliteStore {
    fn write<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R, StoreError>,
    {
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front, so a second process cannot
        // slip an insert between our read and our write.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;
        let result = f(&mut SqliteLedgerTx { conn: &tx })?;
        tx.commit().map_err(sql_err)?;
        Ok(result)
    }

    fn get_record(&self, id: &str) -> Result<AttendanceRecord, StoreError> {
        let conn = self.lock()?;
        load_record(&conn, id)
    }

    fn rename_with_history(
        &self,
        id: &str,
        new_name: &str,
        edited_by: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        let previous_name: String = tx
            .query_row(
                "SELECT display_name FROM attendance WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?
            .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))?;
        let position: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM edit_history WHERE record_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(sql_err)?;

        tx.execute(
            "INSERT INTO edit_history (record_id, position, previous_name, edited_by, edited_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, position, previous_name, edited_by, edited_at.timestamp_millis()],
        )
        .map_err(sql_err)?;
        tx.execute(
            "UPDATE attendance SET display_name = ?2 WHERE id = ?1",
            params![id, new_name],
        )
        .map_err(sql_err)?;

        let record = load_record(&tx, id)?;
        tx.commit().map_err(sql_err)?;
        Ok(record)
    }

    fn list_window(&self, day: &DayWindow) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM attendance
                 WHERE timestamp_ms >= ?1 AND timestamp_ms < ?2 ORDER BY sequence"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                params![day.start.timestamp_millis(), day.end.timestamp_millis()],
                record_row,
            )
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter().map(|r| hydrate(&conn, r)).collect()
    }

    fn delete_record(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute("DELETE FROM edit_history WHERE record_id = ?1", params![id])
            .map_err(sql_err)?;
        let removed = tx
            .execute("DELETE FROM attendance WHERE id = ?1", params![id])
            .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        Ok(removed > 0)
    }
}
