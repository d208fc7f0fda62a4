//! SQLite datastore for identities, signatures, attendance and schedule.
//!
//! A connection is opened per operation; nothing is held across frames.

use chrono::{Days, NaiveDate, NaiveTime};
use rollcall_core::{
    AttendanceRecord, AttendanceStatus, AttendanceStore, DetectionMethod, GalleryEntry,
    GallerySource, Identity, IdentityId, ScheduleConfig, ScheduleSource, Signature, StoreError,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";

/// Days covered by the dashboard's daily series, today included.
const DASHBOARD_DAYS: u64 = 7;

const SCHEMA: &str = r"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS identities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        display_name TEXT NOT NULL,
        code TEXT,
        section TEXT,
        age INTEGER,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS signatures (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        identity_id INTEGER NOT NULL,
        data BLOB NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (identity_id) REFERENCES identities(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS attendance (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        identity_id INTEGER NOT NULL,
        date TEXT NOT NULL,
        time TEXT NOT NULL,
        method TEXT NOT NULL CHECK (method IN ('face', 'qr', 'manual')),
        status TEXT NOT NULL CHECK (status IN ('present', 'late', 'absent')),
        confidence REAL NOT NULL,
        FOREIGN KEY (identity_id) REFERENCES identities(id)
    );

    CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_face_once
        ON attendance(identity_id, date, method) WHERE method = 'face';

    CREATE TABLE IF NOT EXISTS schedule (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        entry_time TEXT NOT NULL,
        tolerance_minutes INTEGER NOT NULL,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    INSERT OR IGNORE INTO schedule (id, entry_time, tolerance_minutes)
    VALUES (1, '08:00:00', 15);
";

/// Identity columns missing from databases created by earlier releases.
const IDENTITY_COLUMNS: &[(&str, &str)] = &[("code", "TEXT"), ("section", "TEXT"), ("age", "INTEGER")];

const IDENTITY_SUMMARY: &str = "
    SELECT i.id, i.code, i.display_name, i.section, i.age, i.active, i.created_at, COUNT(s.id)
    FROM identities i
    LEFT JOIN signatures s ON s.identity_id = i.id";

/// An enrolled identity with its signature count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub id: IdentityId,
    /// Roster code, unique across identities.
    pub code: String,
    pub display_name: String,
    pub section: Option<String>,
    pub age: Option<u32>,
    pub active: bool,
    pub signatures: u32,
    /// UTC timestamp of enrollment.
    pub registered_at: String,
}

/// A new enrollment. Without a code, the next free numeric code is assigned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewIdentity {
    pub display_name: String,
    pub code: Option<String>,
    pub section: Option<String>,
    pub age: Option<u32>,
}

/// Fields to change on an identity. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityUpdate {
    pub display_name: Option<String>,
    pub code: Option<String>,
    pub section: Option<String>,
    pub age: Option<u32>,
}

/// Distinct attendees on one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub attendees: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCount {
    pub status: AttendanceStatus,
    pub count: u32,
}

/// Headline numbers for the dashboard.
///
/// An attendee is an identity with at least one non-absent row that day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub date: NaiveDate,
    /// Active identities.
    pub total_identities: u32,
    /// Active identities with at least one signature.
    pub with_signatures: u32,
    pub attendees: u32,
    /// `attendees` as a percentage of `total_identities`.
    pub attendance_rate: f64,
    /// The last seven days, oldest first, zero-filled.
    pub daily: Vec<DailyCount>,
    /// All-time row counts per status.
    pub by_status: Vec<StatusCount>,
}

/// An attendance row joined with the identity's name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEntry {
    pub display_name: String,
    #[serde(flatten)]
    pub record: AttendanceRecord,
}

/// Handle to the attendance database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path` and apply the schema.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::failed("create_data_dir", e))?;
            }
        }
        let store = Self { db_path };
        let conn = store.connect()?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::failed("initialize_schema", e))?;
        migrate(&conn)?;
        tracing::info!(path = %store.db_path.display(), "attendance database ready");
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path).map_err(|e| StoreError::failed("open_database", e))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| StoreError::failed("enable_foreign_keys", e))?;
        Ok(conn)
    }

    /// Enroll a new identity. Returns its id and roster code.
    pub fn add_identity(&self, new: &NewIdentity) -> Result<(IdentityId, String), StoreError> {
        let name = new.display_name.trim();
        if name.is_empty() {
            return Err(StoreError::failed("add_identity", "display name is empty"));
        }
        let section = non_empty(new.section.as_deref());

        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::failed("add_identity", e))?;
        let code = match non_empty(new.code.as_deref()) {
            Some(code) => code.to_string(),
            None => next_code(&tx)?,
        };
        tx.execute(
            "INSERT INTO identities (display_name, code, section, age) VALUES (?1, ?2, ?3, ?4)",
            params![name, code, section, new.age],
        )
        .map_err(|e| code_error("add_identity", &code, e))?;
        let id = IdentityId(tx.last_insert_rowid());
        tx.commit().map_err(|e| StoreError::failed("add_identity", e))?;

        tracing::info!(identity = %id, name, code = %code, "identity enrolled");
        Ok((id, code))
    }

    /// Change an identity's roster fields. Returns false if unknown.
    pub fn update_identity(&self, identity: IdentityId, update: &IdentityUpdate) -> Result<bool, StoreError> {
        let name = update.display_name.as_deref().map(str::trim);
        if name == Some("") {
            return Err(StoreError::failed("update_identity", "display name is empty"));
        }
        let code = update.code.as_deref().map(str::trim);
        if code == Some("") {
            return Err(StoreError::failed("update_identity", "code is empty"));
        }
        let changed = self
            .connect()?
            .execute(
                "UPDATE identities SET
                    display_name = COALESCE(?2, display_name),
                    code = COALESCE(?3, code),
                    section = COALESCE(?4, section),
                    age = COALESCE(?5, age)
                 WHERE id = ?1",
                params![
                    identity.0,
                    name,
                    code,
                    non_empty(update.section.as_deref()),
                    update.age
                ],
            )
            .map_err(|e| code_error("update_identity", code.unwrap_or_default(), e))?;
        if changed > 0 {
            tracing::info!(%identity, "identity updated");
        }
        Ok(changed > 0)
    }

    /// Look up an active identity by roster code.
    pub fn find_by_code(&self, code: &str) -> Result<Option<IdentitySummary>, StoreError> {
        self.connect()?
            .query_row(
                &format!("{IDENTITY_SUMMARY} WHERE i.code = ?1 AND i.active = 1 GROUP BY i.id"),
                params![code.trim()],
                summary_from_row,
            )
            .optional()
            .map_err(|e| StoreError::failed("find_by_code", e))
    }

    /// Attach one enrollment signature to an active identity.
    pub fn add_signature(&self, identity: IdentityId, signature: &Signature) -> Result<i64, StoreError> {
        if signature.is_empty() {
            return Err(StoreError::failed("add_signature", "signature is empty"));
        }
        let conn = self.connect()?;
        let active: Option<bool> = conn
            .query_row(
                "SELECT active FROM identities WHERE id = ?1",
                params![identity.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::failed("add_signature", e))?;
        match active {
            Some(true) => {}
            Some(false) => {
                return Err(StoreError::failed(
                    "add_signature",
                    format!("identity {identity} is inactive"),
                ))
            }
            None => {
                return Err(StoreError::failed(
                    "add_signature",
                    format!("identity {identity} not found"),
                ))
            }
        }
        conn.execute(
            "INSERT INTO signatures (identity_id, data) VALUES (?1, ?2)",
            params![identity.0, signature.to_le_bytes()],
        )
        .map_err(|e| StoreError::failed("add_signature", e))?;
        let id = conn.last_insert_rowid();
        tracing::info!(%identity, signature_id = id, dims = signature.len(), "signature stored");
        Ok(id)
    }

    /// Exclude an identity from future gallery loads. Returns false if unknown.
    pub fn deactivate_identity(&self, identity: IdentityId) -> Result<bool, StoreError> {
        let changed = self
            .connect()?
            .execute("UPDATE identities SET active = 0 WHERE id = ?1", params![identity.0])
            .map_err(|e| StoreError::failed("deactivate_identity", e))?;
        Ok(changed > 0)
    }

    pub fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(&format!("{IDENTITY_SUMMARY} GROUP BY i.id ORDER BY i.display_name, i.id"))
            .map_err(|e| StoreError::failed("list_identities", e))?;
        let rows = stmt
            .query_map([], summary_from_row)
            .map_err(|e| StoreError::failed("list_identities", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::failed("list_identities", e))
    }

    /// Active identities as CSV, one row each, with a header row.
    pub fn export_roster_csv(&self) -> Result<String, StoreError> {
        let fail = |e: csv::Error| StoreError::failed("export_roster", e);
        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        writer
            .write_record([
                "id",
                "code",
                "display_name",
                "section",
                "age",
                "signatures",
                "registered_at",
            ])
            .map_err(fail)?;

        let roster = self.list_identities()?;
        let mut exported = 0usize;
        for identity in roster.iter().filter(|i| i.active) {
            writer
                .write_record([
                    identity.id.0.to_string(),
                    identity.code.clone(),
                    identity.display_name.clone(),
                    identity.section.clone().unwrap_or_default(),
                    identity.age.map(|a| a.to_string()).unwrap_or_default(),
                    identity.signatures.to_string(),
                    identity.registered_at.clone(),
                ])
                .map_err(fail)?;
            exported += 1;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| StoreError::failed("export_roster", e))?;
        tracing::debug!(exported, "roster exported");
        String::from_utf8(bytes).map_err(|e| StoreError::failed("export_roster", e))
    }

    /// Dashboard numbers as of `today`.
    pub fn summary(&self, today: NaiveDate) -> Result<DashboardSummary, StoreError> {
        let fail = |e: rusqlite::Error| StoreError::failed("summary", e);
        let conn = self.connect()?;

        let (total_identities, with_signatures): (u32, u32) = conn
            .query_row(
                "SELECT
                    (SELECT COUNT(*) FROM identities WHERE active = 1),
                    (SELECT COUNT(DISTINCT s.identity_id)
                     FROM signatures s
                     JOIN identities i ON i.id = s.identity_id
                     WHERE i.active = 1)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(fail)?;

        let first = today
            .checked_sub_days(Days::new(DASHBOARD_DAYS - 1))
            .unwrap_or(today);
        let mut stmt = conn
            .prepare(
                "SELECT date, COUNT(DISTINCT identity_id)
                 FROM attendance
                 WHERE date BETWEEN ?1 AND ?2 AND status != 'absent'
                 GROUP BY date",
            )
            .map_err(fail)?;
        let per_day = stmt
            .query_map(
                params![first.format(DATE_FMT).to_string(), today.format(DATE_FMT).to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
            )
            .map_err(fail)?
            .collect::<Result<HashMap<_, _>, _>>()
            .map_err(fail)?;
        let daily: Vec<DailyCount> = first
            .iter_days()
            .take_while(|date| *date <= today)
            .map(|date| DailyCount {
                date,
                attendees: per_day
                    .get(&date.format(DATE_FMT).to_string())
                    .copied()
                    .unwrap_or(0),
            })
            .collect();
        let attendees = daily.last().map(|d| d.attendees).unwrap_or(0);

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM attendance GROUP BY status ORDER BY status")
            .map_err(fail)?;
        let by_status = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))
            .map_err(fail)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(fail)?
            .into_iter()
            .map(|(status, count)| -> Result<StatusCount, StoreError> {
                let status = status.parse().map_err(|detail| StoreError::Corrupt {
                    table: "attendance",
                    detail,
                })?;
                Ok(StatusCount { status, count })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let attendance_rate = if total_identities == 0 {
            0.0
        } else {
            f64::from(attendees) * 100.0 / f64::from(total_identities)
        };

        Ok(DashboardSummary {
            date: today,
            total_identities,
            with_signatures,
            attendees,
            attendance_rate,
            daily,
            by_status,
        })
    }

    /// All attendance rows for `date`, ordered by time.
    pub fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEntry>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT a.identity_id, i.display_name, a.date, a.time, a.method, a.status, a.confidence
                 FROM attendance a
                 JOIN identities i ON i.id = a.identity_id
                 WHERE a.date = ?1
                 ORDER BY a.time, a.id",
            )
            .map_err(|e| StoreError::failed("attendance_on", e))?;
        let raw = stmt
            .query_map(params![date.format(DATE_FMT).to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, f64>(6)?,
                ))
            })
            .map_err(|e| StoreError::failed("attendance_on", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::failed("attendance_on", e))?;

        raw.into_iter()
            .map(|(id, display_name, date, time, method, status, confidence)| {
                let corrupt = |detail: String| StoreError::Corrupt {
                    table: "attendance",
                    detail,
                };
                Ok(AttendanceEntry {
                    display_name,
                    record: AttendanceRecord {
                        identity: IdentityId(id),
                        date: NaiveDate::parse_from_str(&date, DATE_FMT)
                            .map_err(|e| corrupt(format!("date {date:?}: {e}")))?,
                        time: NaiveTime::parse_from_str(&time, TIME_FMT)
                            .map_err(|e| corrupt(format!("time {time:?}: {e}")))?,
                        method: method.parse().map_err(corrupt)?,
                        status: status.parse().map_err(corrupt)?,
                        confidence: confidence as f32,
                    },
                })
            })
            .collect()
    }

    /// Manually mark attendance, replacing an earlier manual mark for that day.
    pub fn mark_manual(
        &self,
        identity: IdentityId,
        date: NaiveDate,
        time: NaiveTime,
        status: AttendanceStatus,
    ) -> Result<(), StoreError> {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::failed("mark_manual", e))?;
        let date = date.format(DATE_FMT).to_string();
        tx.execute(
            "DELETE FROM attendance WHERE identity_id = ?1 AND date = ?2 AND method = 'manual'",
            params![identity.0, date],
        )
        .map_err(|e| StoreError::failed("mark_manual", e))?;
        tx.execute(
            "INSERT INTO attendance (identity_id, date, time, method, status, confidence)
             VALUES (?1, ?2, ?3, 'manual', ?4, 1.0)",
            params![identity.0, date, time.format(TIME_FMT).to_string(), status.as_str()],
        )
        .map_err(|e| StoreError::failed("mark_manual", e))?;
        tx.commit().map_err(|e| StoreError::failed("mark_manual", e))?;
        tracing::info!(%identity, %date, %status, "manual attendance marked");
        Ok(())
    }

    pub fn write_schedule(&self, schedule: &ScheduleConfig) -> Result<(), StoreError> {
        self.connect()?
            .execute(
                "INSERT INTO schedule (id, entry_time, tolerance_minutes, updated_at)
                 VALUES (1, ?1, ?2, CURRENT_TIMESTAMP)
                 ON CONFLICT(id) DO UPDATE SET
                    entry_time = excluded.entry_time,
                    tolerance_minutes = excluded.tolerance_minutes,
                    updated_at = excluded.updated_at",
                params![
                    schedule.entry_time.format(TIME_FMT).to_string(),
                    schedule.tolerance_minutes
                ],
            )
            .map_err(|e| StoreError::failed("write_schedule", e))?;
        tracing::info!(
            entry_time = %schedule.entry_time,
            tolerance_minutes = schedule.tolerance_minutes,
            "schedule updated"
        );
        Ok(())
    }

    /// Remove the schedule row (classification then defaults to present).
    pub fn clear_schedule(&self) -> Result<(), StoreError> {
        self.connect()?
            .execute("DELETE FROM schedule", [])
            .map_err(|e| StoreError::failed("clear_schedule", e))?;
        tracing::info!("schedule cleared");
        Ok(())
    }
}

/// Bring an older database up to the current identities layout.
fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let fail = |e: rusqlite::Error| StoreError::failed("migrate_schema", e);
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info('identities')")
        .map_err(fail)?;
    let existing = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(fail)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(fail)?;

    for (column, decl) in IDENTITY_COLUMNS {
        if !existing.iter().any(|c| c == column) {
            conn.execute_batch(&format!("ALTER TABLE identities ADD COLUMN {column} {decl}"))
                .map_err(fail)?;
            tracing::info!(column, "identities column added");
        }
    }

    // Rows enrolled before codes existed get their id as code.
    conn.execute_batch(
        "UPDATE identities SET code = CAST(id AS TEXT) WHERE code IS NULL;
         CREATE UNIQUE INDEX IF NOT EXISTS idx_identities_code ON identities(code);",
    )
    .map_err(fail)
}

/// One past the largest numeric code in use.
fn next_code(conn: &Connection) -> Result<String, StoreError> {
    let max: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(CAST(code AS INTEGER)), 0) FROM identities WHERE code GLOB '[0-9]*'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::failed("next_code", e))?;
    Ok((max + 1).to_string())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn code_error(operation: &str, code: &str, e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            StoreError::failed(operation, format!("code {code:?} is already in use"))
        }
        _ => StoreError::failed(operation, e),
    }
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<IdentitySummary> {
    Ok(IdentitySummary {
        id: IdentityId(row.get(0)?),
        code: row.get(1)?,
        display_name: row.get(2)?,
        section: row.get(3)?,
        age: row.get(4)?,
        active: row.get(5)?,
        registered_at: row.get(6)?,
        signatures: row.get(7)?,
    })
}

impl GallerySource for SqliteStore {
    fn load_all_signatures(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT i.id, i.display_name, s.id, s.data
                 FROM signatures s
                 JOIN identities i ON i.id = s.identity_id
                 WHERE i.active = 1
                 ORDER BY s.id",
            )
            .map_err(|e| StoreError::failed("load_all_signatures", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .map_err(|e| StoreError::failed("load_all_signatures", e))?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, display_name, signature_id, data) =
                row.map_err(|e| StoreError::failed("load_all_signatures", e))?;
            let Some(signature) = Signature::from_le_bytes(&data) else {
                tracing::warn!(signature_id, len = data.len(), "skipping malformed signature blob");
                continue;
            };
            entries.push(GalleryEntry {
                identity: Identity {
                    id: IdentityId(id),
                    display_name,
                },
                signature,
            });
        }
        Ok(entries)
    }
}

impl AttendanceStore for SqliteStore {
    fn exists(
        &self,
        identity: IdentityId,
        date: NaiveDate,
        method: DetectionMethod,
    ) -> Result<bool, StoreError> {
        self.connect()?
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM attendance
                    WHERE identity_id = ?1 AND date = ?2 AND method = ?3
                 )",
                params![identity.0, date.format(DATE_FMT).to_string(), method.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::failed("attendance_exists", e))
    }

    fn insert(&self, record: &AttendanceRecord) -> Result<bool, StoreError> {
        let inserted = self
            .connect()?
            .execute(
                "INSERT INTO attendance (identity_id, date, time, method, status, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT DO NOTHING",
                params![
                    record.identity.0,
                    record.date.format(DATE_FMT).to_string(),
                    record.time.format(TIME_FMT).to_string(),
                    record.method.as_str(),
                    record.status.as_str(),
                    f64::from(record.confidence),
                ],
            )
            .map_err(|e| StoreError::failed("insert_attendance", e))?;
        Ok(inserted == 1)
    }
}

impl ScheduleSource for SqliteStore {
    fn read_schedule(&self) -> Result<Option<ScheduleConfig>, StoreError> {
        let row: Option<(String, i64)> = self
            .connect()?
            .query_row(
                "SELECT entry_time, tolerance_minutes FROM schedule WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| StoreError::failed("read_schedule", e))?;

        let Some((entry_time, tolerance)) = row else {
            return Ok(None);
        };
        let corrupt = |detail: String| StoreError::Corrupt {
            table: "schedule",
            detail,
        };
        Ok(Some(ScheduleConfig {
            entry_time: NaiveTime::parse_from_str(&entry_time, TIME_FMT)
                .map_err(|e| corrupt(format!("entry_time {entry_time:?}: {e}")))?,
            tolerance_minutes: u32::try_from(tolerance)
                .map_err(|_| corrupt(format!("negative tolerance {tolerance}")))?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{AttendanceRecorder, Gallery, RecordOutcome};
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("nested/attendance.db")).unwrap();
        (dir, store)
    }

    fn enroll(store: &SqliteStore, name: &str) -> IdentityId {
        let new = NewIdentity {
            display_name: name.into(),
            ..NewIdentity::default()
        };
        store.add_identity(&new).unwrap().0
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
    }

    fn record(identity: i64, method: DetectionMethod) -> AttendanceRecord {
        AttendanceRecord {
            identity: IdentityId(identity),
            date: day(),
            time: NaiveTime::from_hms_opt(8, 3, 0).unwrap(),
            method,
            status: AttendanceStatus::Present,
            confidence: 0.9,
        }
    }

    #[test]
    fn test_default_schedule_row() {
        let (_dir, store) = open_temp();
        assert_eq!(store.read_schedule().unwrap(), Some(ScheduleConfig::default()));
    }

    #[test]
    fn test_schedule_update_and_clear() {
        let (_dir, store) = open_temp();
        let schedule = ScheduleConfig {
            entry_time: NaiveTime::from_hms_opt(7, 30, 0).unwrap(),
            tolerance_minutes: 10,
        };
        store.write_schedule(&schedule).unwrap();
        assert_eq!(store.read_schedule().unwrap(), Some(schedule));

        store.clear_schedule().unwrap();
        assert_eq!(store.read_schedule().unwrap(), None);
    }

    #[test]
    fn test_reopen_keeps_custom_schedule() {
        let (dir, store) = open_temp();
        let schedule = ScheduleConfig {
            entry_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            tolerance_minutes: 5,
        };
        store.write_schedule(&schedule).unwrap();
        let reopened = SqliteStore::open(dir.path().join("nested/attendance.db")).unwrap();
        assert_eq!(reopened.read_schedule().unwrap(), Some(schedule));
    }

    #[test]
    fn test_gallery_loads_active_identities_in_order() {
        let (_dir, store) = open_temp();
        let ana = enroll(&store, "Ana Torres");
        let luis = enroll(&store, "Luis Paz");
        store.add_signature(ana, &Signature::new(vec![0.1, 0.2])).unwrap();
        store.add_signature(luis, &Signature::new(vec![0.3, 0.4])).unwrap();
        store.add_signature(ana, &Signature::new(vec![0.5, 0.6])).unwrap();

        let entries = store.load_all_signatures().unwrap();
        let ids: Vec<IdentityId> = entries.iter().map(|e| e.identity.id).collect();
        assert_eq!(ids, vec![ana, luis, ana]);
        assert_eq!(entries[1].identity.display_name, "Luis Paz");
        assert_eq!(entries[2].signature, Signature::new(vec![0.5, 0.6]));

        assert!(store.deactivate_identity(luis).unwrap());
        let gallery = Gallery::load(&store).unwrap();
        assert_eq!(gallery.stats().identities, 1);
        assert_eq!(gallery.len(), 2);
    }

    #[test]
    fn test_signature_for_unknown_or_inactive_identity_rejected() {
        let (_dir, store) = open_temp();
        assert!(store.add_signature(IdentityId(99), &Signature::new(vec![1.0])).is_err());

        let id = enroll(&store, "Ana");
        store.deactivate_identity(id).unwrap();
        assert!(store.add_signature(id, &Signature::new(vec![1.0])).is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let (_dir, store) = open_temp();
        let blank = NewIdentity {
            display_name: "   ".into(),
            ..NewIdentity::default()
        };
        assert!(store.add_identity(&blank).is_err());
    }

    #[test]
    fn test_list_identities_counts_signatures() {
        let (_dir, store) = open_temp();
        let b = enroll(&store, "Beto");
        let a = enroll(&store, "Ana");
        store.add_signature(b, &Signature::new(vec![1.0])).unwrap();
        store.add_signature(b, &Signature::new(vec![2.0])).unwrap();

        let list = store.list_identities().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, a);
        assert_eq!(list[0].signatures, 0);
        assert_eq!(list[1].signatures, 2);
        assert!(list[1].active);
    }

    #[test]
    fn test_face_insert_unique_per_day() {
        let (_dir, store) = open_temp();
        let id = enroll(&store, "Ana");
        assert!(!store.exists(id, day(), DetectionMethod::Face).unwrap());
        assert!(store.insert(&record(id.0, DetectionMethod::Face)).unwrap());
        assert!(store.exists(id, day(), DetectionMethod::Face).unwrap());
        // The unique index turns a racing duplicate into a no-op.
        assert!(!store.insert(&record(id.0, DetectionMethod::Face)).unwrap());
        assert_eq!(store.attendance_on(day()).unwrap().len(), 1);
    }

    #[test]
    fn test_non_face_methods_not_constrained() {
        let (_dir, store) = open_temp();
        let id = enroll(&store, "Ana");
        assert!(store.insert(&record(id.0, DetectionMethod::Qr)).unwrap());
        assert!(store.insert(&record(id.0, DetectionMethod::Qr)).unwrap());
    }

    #[test]
    fn test_insert_for_unknown_identity_fails() {
        let (_dir, store) = open_temp();
        let err = store.insert(&record(42, DetectionMethod::Face)).unwrap_err();
        assert!(matches!(err, StoreError::OperationFailed { .. }));
    }

    #[test]
    fn test_manual_mark_replaces_previous() {
        let (_dir, store) = open_temp();
        let id = enroll(&store, "Ana");
        let t = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        store.mark_manual(id, day(), t, AttendanceStatus::Absent).unwrap();
        store.mark_manual(id, day(), t, AttendanceStatus::Late).unwrap();

        let rows = store.attendance_on(day()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.method, DetectionMethod::Manual);
        assert_eq!(rows[0].record.status, AttendanceStatus::Late);
        assert_eq!(rows[0].record.confidence, 1.0);
        assert_eq!(rows[0].display_name, "Ana");
    }

    #[test]
    fn test_recorder_over_sqlite_is_idempotent() {
        let (_dir, store) = open_temp();
        let id = enroll(&store, "Ana");
        let recorder = AttendanceRecorder::new(store.clone());
        let now = day().and_hms_opt(8, 14, 59).unwrap();
        let first = recorder.record_at(id, 0.9, DetectionMethod::Face, now).unwrap();
        let second = recorder.record_at(id, 0.9, DetectionMethod::Face, now).unwrap();

        assert_eq!(first, RecordOutcome::Recorded(AttendanceStatus::Present));
        assert_eq!(second, RecordOutcome::AlreadyRecorded);
        let rows = store.attendance_on(day()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.time, NaiveTime::from_hms_opt(8, 14, 59).unwrap());
    }

    #[test]
    fn test_attendance_on_other_day_empty() {
        let (_dir, store) = open_temp();
        let id = enroll(&store, "Ana");
        store.insert(&record(id.0, DetectionMethod::Face)).unwrap();
        let other = NaiveDate::from_ymd_opt(2024, 3, 12).unwrap();
        assert!(store.attendance_on(other).unwrap().is_empty());
    }

    #[test]
    fn test_codes_follow_largest_numeric_code() {
        let (_dir, store) = open_temp();
        let with_code = |name: &str, code: &str| NewIdentity {
            display_name: name.into(),
            code: Some(code.into()),
            ..NewIdentity::default()
        };

        let (_, first) = store.add_identity(&with_code("Ana", "")).unwrap();
        assert_eq!(first, "1");
        store.add_identity(&with_code("Beto", "A-7")).unwrap();
        store.add_identity(&with_code("Carla", "41")).unwrap();
        let (_, next) = store
            .add_identity(&NewIdentity {
                display_name: "Dario".into(),
                ..NewIdentity::default()
            })
            .unwrap();
        assert_eq!(next, "42");

        let err = store.add_identity(&with_code("Eva", " 41 ")).unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn test_update_identity_changes_given_fields_only() {
        let (_dir, store) = open_temp();
        let (id, code) = store
            .add_identity(&NewIdentity {
                display_name: "Ana".into(),
                section: Some("3B".into()),
                age: Some(15),
                ..NewIdentity::default()
            })
            .unwrap();
        let other = enroll(&store, "Beto");

        let update = IdentityUpdate {
            display_name: Some("Ana Torres".into()),
            age: Some(16),
            ..IdentityUpdate::default()
        };
        assert!(store.update_identity(id, &update).unwrap());
        let found = store.find_by_code(&code).unwrap().unwrap();
        assert_eq!(found.display_name, "Ana Torres");
        assert_eq!(found.age, Some(16));
        assert_eq!(found.section.as_deref(), Some("3B"));

        assert!(!store.update_identity(IdentityId(99), &update).unwrap());
        let steal = IdentityUpdate {
            code: Some(code.clone()),
            ..IdentityUpdate::default()
        };
        assert!(store.update_identity(other, &steal).is_err());
        let blank = IdentityUpdate {
            display_name: Some(" ".into()),
            ..IdentityUpdate::default()
        };
        assert!(store.update_identity(id, &blank).is_err());
    }

    #[test]
    fn test_find_by_code_skips_inactive() {
        let (_dir, store) = open_temp();
        let id = enroll(&store, "Ana");
        store.add_signature(id, &Signature::new(vec![1.0])).unwrap();
        let found = store.find_by_code("1").unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.signatures, 1);
        assert!(store.find_by_code("2").unwrap().is_none());

        store.deactivate_identity(id).unwrap();
        assert!(store.find_by_code("1").unwrap().is_none());
    }

    #[test]
    fn test_summary_counts() {
        let (_dir, store) = open_temp();
        let ana = enroll(&store, "Ana");
        let beto = enroll(&store, "Beto");
        let gone = enroll(&store, "Luis");
        store.add_signature(ana, &Signature::new(vec![1.0])).unwrap();
        store.add_signature(gone, &Signature::new(vec![2.0])).unwrap();
        store.deactivate_identity(gone).unwrap();

        store.insert(&record(ana.0, DetectionMethod::Face)).unwrap();
        let yesterday = day().pred_opt().unwrap();
        store
            .insert(&AttendanceRecord {
                date: yesterday,
                ..record(ana.0, DetectionMethod::Face)
            })
            .unwrap();
        let t = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        store.mark_manual(beto, day(), t, AttendanceStatus::Absent).unwrap();

        let summary = store.summary(day()).unwrap();
        assert_eq!(summary.total_identities, 2);
        assert_eq!(summary.with_signatures, 1);
        // Beto's absent mark does not count as attendance.
        assert_eq!(summary.attendees, 1);
        assert!((summary.attendance_rate - 50.0).abs() < 1e-9);

        assert_eq!(summary.daily.len(), 7);
        assert_eq!(summary.daily[0].date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        let counts: Vec<u32> = summary.daily.iter().map(|d| d.attendees).collect();
        assert_eq!(counts, vec![0, 0, 0, 0, 0, 1, 1]);

        assert_eq!(
            summary.by_status,
            vec![
                StatusCount { status: AttendanceStatus::Absent, count: 1 },
                StatusCount { status: AttendanceStatus::Present, count: 2 },
            ]
        );
    }

    #[test]
    fn test_summary_of_empty_roster() {
        let (_dir, store) = open_temp();
        let summary = store.summary(day()).unwrap();
        assert_eq!(summary.total_identities, 0);
        assert_eq!(summary.attendance_rate, 0.0);
        assert!(summary.by_status.is_empty());
    }

    #[test]
    fn test_roster_csv_quotes_fields_and_skips_inactive() {
        let (_dir, store) = open_temp();
        store
            .add_identity(&NewIdentity {
                display_name: "Torres, Ana".into(),
                section: Some("3B".into()),
                age: Some(15),
                ..NewIdentity::default()
            })
            .unwrap();
        let luis = enroll(&store, "Luis");
        store.deactivate_identity(luis).unwrap();

        let csv_text = store.export_roster_csv().unwrap();
        assert!(csv_text.starts_with("id,code,display_name,section,age,signatures,registered_at\n"));
        assert!(csv_text.contains("\"Torres, Ana\""));

        let mut reader = csv::Reader::from_reader(csv_text.as_bytes());
        let rows: Vec<csv::StringRecord> = reader.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][1], "1");
        assert_eq!(&rows[0][2], "Torres, Ana");
        assert_eq!(&rows[0][3], "3B");
        assert_eq!(&rows[0][4], "15");
        assert_eq!(&rows[0][5], "0");
    }

    #[test]
    fn test_manual_mark_on_chosen_date() {
        let (_dir, store) = open_temp();
        let id = enroll(&store, "Ana");
        let friday = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
        let t = NaiveTime::from_hms_opt(8, 30, 0).unwrap();
        store.mark_manual(id, friday, t, AttendanceStatus::Late).unwrap();

        let rows = store.attendance_on(friday).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.date, friday);
        assert!(store.attendance_on(day()).unwrap().is_empty());
    }

    #[test]
    fn test_open_migrates_identities_without_codes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE identities (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    display_name TEXT NOT NULL,
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
                 );
                 INSERT INTO identities (display_name) VALUES ('Ana'), ('Beto');",
            )
            .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let list = store.list_identities().unwrap();
        let codes: Vec<&str> = list.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(codes, vec!["1", "2"]);
        assert_eq!(list[0].section, None);
        assert_eq!(enroll(&store, "Carla"), IdentityId(3));
        assert_eq!(store.find_by_code("3").unwrap().unwrap().display_name, "Carla");
    }
}
