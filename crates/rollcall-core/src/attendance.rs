//! Attendance session: who has been seen, at most once per identity.

use crate::store::{IdentityStore, StoreError};
use crate::types::IdentityRecord;
use chrono::{Local, NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt::Write as _;
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS attendance (
        id   TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        date TEXT NOT NULL,
        time TEXT NOT NULL
    );
";

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("attendance record: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// One row of the attendance record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceEntry {
    pub id: String,
    pub name: String,
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM:SS`
    pub time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Recorded,
    AlreadyPresent,
}

/// Present/absent partition of the enrolled identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceSnapshot {
    pub present: Vec<IdentityRecord>,
    pub absent: Vec<IdentityRecord>,
    pub date: NaiveDate,
}

impl AttendanceSnapshot {
    /// Plain-text session summary: date, then present and absent names.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Date: {}", self.date.format("%Y-%m-%d"));
        for (title, list) in [("Present", &self.present), ("Absent", &self.absent)] {
            let _ = writeln!(out, "\n{title}:");
            if list.is_empty() {
                let _ = writeln!(out, "None");
            }
            for record in list {
                let _ = writeln!(out, "{}", record.name);
            }
        }
        out
    }
}

/// Sort key for display: numeric ids ascending, everything else after.
pub fn display_order(id: &str) -> (u8, i64) {
    match id.parse::<i64>() {
        Ok(n) => (0, n),
        Err(_) => (1, 0),
    }
}

/// The record for the current session. One instance per session; pass it to
/// whatever needs to mark or report attendance.
pub struct AttendanceSession {
    conn: Connection,
}

impl AttendanceSession {
    /// Open the session record at `path`. A missing record starts empty.
    pub fn open(path: &Path) -> Result<Self, AttendanceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// A session that lives only as long as this value.
    pub fn in_memory() -> Result<Self, AttendanceError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Record `id` as seen now. Repeat sightings change nothing.
    pub fn mark_seen(&mut self, id: &str, name: &str) -> Result<MarkOutcome, AttendanceError> {
        self.mark_seen_at(id, name, Local::now().naive_local())
    }

    pub fn mark_seen_at(
        &mut self,
        id: &str,
        name: &str,
        at: NaiveDateTime,
    ) -> Result<MarkOutcome, AttendanceError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO attendance (id, name, date, time) VALUES (?1, ?2, ?3, ?4)",
            params![
                id,
                name,
                at.format("%Y-%m-%d").to_string(),
                at.format("%H:%M:%S").to_string()
            ],
        )?;

        if inserted == 0 {
            return Ok(MarkOutcome::AlreadyPresent);
        }
        tracing::info!(id, name, "attendance marked");
        Ok(MarkOutcome::Recorded)
    }

    pub fn contains(&self, id: &str) -> Result<bool, AttendanceError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM attendance WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Entries in the order they were recorded.
    pub fn entries(&self) -> Result<Vec<AttendanceEntry>, AttendanceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, date, time FROM attendance ORDER BY rowid")?;
        let entries = stmt
            .query_map([], |row| {
                Ok(AttendanceEntry {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    date: row.get(2)?,
                    time: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Partition every enrolled identity into present and absent, each in
    /// display order.
    ///
    /// The record persists until [`reset`](Self::reset), so the snapshot is
    /// dated by the session's first entry; an empty session is dated today.
    pub fn snapshot(&self, store: &IdentityStore) -> Result<AttendanceSnapshot, AttendanceError> {
        let date = self.session_date()?.unwrap_or_else(|| Local::now().date_naive());
        self.snapshot_on(store, date)
    }

    /// Date of the first recorded sighting.
    pub fn session_date(&self) -> Result<Option<NaiveDate>, AttendanceError> {
        let first: Option<String> = self
            .conn
            .query_row(
                "SELECT date FROM attendance ORDER BY rowid LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(first.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()))
    }

    pub fn snapshot_on(
        &self,
        store: &IdentityStore,
        date: NaiveDate,
    ) -> Result<AttendanceSnapshot, AttendanceError> {
        let seen: std::collections::HashSet<String> =
            self.entries()?.into_iter().map(|e| e.id).collect();

        let (mut present, mut absent): (Vec<_>, Vec<_>) = store
            .list()?
            .into_iter()
            .partition(|record| seen.contains(&record.id));

        // Stable sort: equal keys keep enrollment order.
        present.sort_by_key(|r| display_order(&r.id));
        absent.sort_by_key(|r| display_order(&r.id));

        Ok(AttendanceSnapshot {
            present,
            absent,
            date,
        })
    }

    /// Clear the record. Safe on an empty record.
    pub fn reset(&mut self) -> Result<(), AttendanceError> {
        let cleared = self.conn.execute("DELETE FROM attendance", [])?;
        tracing::info!(cleared, "attendance session reset");
        Ok(())
    }
}
