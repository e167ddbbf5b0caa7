// src/db.rs

//! Installed-versions database
//!
//! The agent's durable memory of which targets have been staged, booted,
//! and confirmed. The update controller is the sole writer; everything
//! else reads through the accessors here. One row per (name, hash) pair
//! with flags:
//!
//! - `is_current`  - the target the device is booted on and has confirmed
//! - `is_pending`  - staged, waiting for a reboot to take effect
//! - `was_installed` - has ever been confirmed current; rows that never
//!   got there are failed installs and are excluded from rollback
//!   candidates

use crate::error::Result;
use crate::target::Target;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// How a version is being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstalledVersionMode {
    /// The target is confirmed and currently booted
    Current,
    /// The target is staged and becomes active after reboot
    Pending,
}

/// Open an existing database, applying connection pragmas
pub fn open<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let conn = Connection::open(path.as_ref())?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    // journal_mode responds with the resulting mode
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    Ok(conn)
}

/// Create (if needed) and migrate the database
pub fn init<P: AsRef<Path>>(path: P) -> Result<Connection> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = open(path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS installed_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT -1,
            custom TEXT NOT NULL DEFAULT '{}',
            is_current INTEGER NOT NULL DEFAULT 0,
            is_pending INTEGER NOT NULL DEFAULT 0,
            was_installed INTEGER NOT NULL DEFAULT 0,
            installed_at TEXT,
            UNIQUE(name, sha256)
        );",
    )?;
    Ok(conn)
}

/// One recorded target version
#[derive(Debug, Clone)]
pub struct InstalledVersion {
    pub id: Option<i64>,
    pub name: String,
    pub sha256: String,
    pub version: i64,
    pub custom: String,
    pub is_current: bool,
    pub is_pending: bool,
    pub was_installed: bool,
    pub installed_at: Option<String>,
}

impl InstalledVersion {
    /// Record a target as current or pending
    ///
    /// Recording a current version clears every other current flag and
    /// the row's own pending flag; recording a pending version clears
    /// every other pending flag.
    pub fn save(conn: &Connection, target: &Target, mode: InstalledVersionMode) -> Result<()> {
        let custom = serde_json::to_string(target.custom())?;
        let now = chrono::Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO installed_versions (name, sha256, version, custom)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name, sha256) DO UPDATE SET
                version = excluded.version,
                custom = excluded.custom",
            params![target.name(), target.sha256(), target.version(), custom],
        )?;

        match mode {
            InstalledVersionMode::Current => {
                conn.execute("UPDATE installed_versions SET is_current = 0", [])?;
                conn.execute(
                    "UPDATE installed_versions
                     SET is_current = 1, is_pending = 0, was_installed = 1, installed_at = ?3
                     WHERE name = ?1 AND sha256 = ?2",
                    params![target.name(), target.sha256(), now],
                )?;
            }
            InstalledVersionMode::Pending => {
                conn.execute("UPDATE installed_versions SET is_pending = 0", [])?;
                conn.execute(
                    "UPDATE installed_versions SET is_pending = 1
                     WHERE name = ?1 AND sha256 = ?2",
                    params![target.name(), target.sha256()],
                )?;
            }
        }

        Ok(())
    }

    /// Record a target sighting without touching the current/pending flags
    ///
    /// Used for failed installs (e.g. verification failures) so the
    /// target shows up as known-but-never-installed afterwards.
    pub fn record(conn: &Connection, target: &Target) -> Result<()> {
        let custom = serde_json::to_string(target.custom())?;
        conn.execute(
            "INSERT INTO installed_versions (name, sha256, version, custom)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name, sha256) DO UPDATE SET
                version = excluded.version,
                custom = excluded.custom",
            params![target.name(), target.sha256(), target.version(), custom],
        )?;
        Ok(())
    }

    /// The confirmed, currently booted target
    pub fn current(conn: &Connection) -> Result<Option<Target>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, sha256, version, custom, is_current, is_pending, was_installed, installed_at
             FROM installed_versions WHERE is_current = 1",
        )?;
        let row = stmt.query_row([], Self::from_row).optional()?;
        Ok(row.map(|v| v.to_target()))
    }

    /// The staged target waiting for a reboot, if any
    pub fn pending(conn: &Connection) -> Result<Option<Target>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, sha256, version, custom, is_current, is_pending, was_installed, installed_at
             FROM installed_versions WHERE is_pending = 1",
        )?;
        let row = stmt.query_row([], Self::from_row).optional()?;
        Ok(row.map(|v| v.to_target()))
    }

    /// Drop the pending flag (after finalization or undeploy)
    pub fn clear_pending(conn: &Connection) -> Result<()> {
        conn.execute("UPDATE installed_versions SET is_pending = 0", [])?;
        Ok(())
    }

    /// Every recorded version, ascending by version number
    pub fn known_versions(conn: &Connection) -> Result<Vec<Target>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, sha256, version, custom, is_current, is_pending, was_installed, installed_at
             FROM installed_versions ORDER BY version ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|v| v.to_target()).collect())
    }

    /// Newest once-confirmed version strictly older than `before_version`
    ///
    /// This is the target an app-driven rollback falls back to.
    pub fn rollback_candidate(conn: &Connection, before_version: i64) -> Result<Option<Target>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, sha256, version, custom, is_current, is_pending, was_installed, installed_at
             FROM installed_versions
             WHERE was_installed = 1 AND version < ?1
             ORDER BY version DESC, id DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row([before_version], Self::from_row)
            .optional()?;
        Ok(row.map(|v| v.to_target()))
    }

    /// Was this hash recorded but never confirmed current?
    ///
    /// True means a previous install of it was rolled back, so choosing
    /// it again is a rollback re-attempt.
    pub fn is_known_but_not_installed(conn: &Connection, sha256: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM installed_versions
             WHERE sha256 = ?1 AND was_installed = 0",
            [sha256],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn to_target(&self) -> Target {
        let custom = serde_json::from_str(&self.custom).unwrap_or(serde_json::Value::Null);
        Target::new(self.name.clone(), self.sha256.clone(), custom)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            sha256: row.get(2)?,
            version: row.get(3)?,
            custom: row.get(4)?,
            is_current: row.get::<_, i64>(5)? != 0,
            is_pending: row.get::<_, i64>(6)? != 0,
            was_installed: row.get::<_, i64>(7)? != 0,
            installed_at: row.get(8)?,
        })
    }
}
