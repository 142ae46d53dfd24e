// SQLite snapshot store

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use sheetsession_config::SessionSettings;
use sheetsession_engine::SheetKind;

use crate::error::SnapshotError;
use crate::snapshot::CompressedSnapshot;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    key TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    kind INTEGER NOT NULL,      -- 0=worksheet, 1=viewsheet
    payload BLOB NOT NULL,      -- gzip JSON, never read for filtering
    stored_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS snapshots_owner ON snapshots(owner);
"#;

const KIND_WORKSHEET: i64 = 0;
const KIND_VIEWSHEET: i64 = 1;

fn kind_code(kind: SheetKind) -> i64 {
    match kind {
        SheetKind::Worksheet => KIND_WORKSHEET,
        SheetKind::Viewsheet => KIND_VIEWSHEET,
    }
}

fn kind_from_code(code: i64) -> Result<SheetKind, SnapshotError> {
    match code {
        KIND_WORKSHEET => Ok(SheetKind::Worksheet),
        KIND_VIEWSHEET => Ok(SheetKind::Viewsheet),
        other => Err(SnapshotError::Decode(format!("unknown sheet kind {}", other))),
    }
}

/// Keyed snapshot storage. A `put` replaces the whole entry.
pub struct SnapshotStore {
    conn: Connection,
}

impl SnapshotStore {
    pub fn open(path: &Path) -> Result<Self, SnapshotError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, SnapshotError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Store at `snapshot_db`, or in memory when no path is configured.
    pub fn from_settings(settings: &SessionSettings) -> Result<Self, SnapshotError> {
        match &settings.snapshot_db {
            Some(path) => Self::open(path),
            None => Self::open_in_memory(),
        }
    }

    fn init(conn: Connection) -> Result<Self, SnapshotError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn put(&self, key: &str, snapshot: &CompressedSnapshot) -> Result<(), SnapshotError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO snapshots (key, owner, kind, payload, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key,
                snapshot.owner(),
                kind_code(snapshot.kind()),
                snapshot.payload(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        log::debug!("stored snapshot '{}' ({} bytes)", key, snapshot.len());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<CompressedSnapshot>, SnapshotError> {
        let row = self
            .conn
            .query_row(
                "SELECT payload, kind, owner FROM snapshots WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((payload, kind, owner)) => Ok(Some(CompressedSnapshot::from_parts(
                payload,
                kind_from_code(kind)?,
                owner,
            ))),
            None => Ok(None),
        }
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, key: &str) -> Result<bool, SnapshotError> {
        let removed = self
            .conn
            .execute("DELETE FROM snapshots WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    pub fn keys_for_owner(&self, owner: &str) -> Result<Vec<String>, SnapshotError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM snapshots WHERE owner = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![owner], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn len(&self) -> Result<usize, SnapshotError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, SnapshotError> {
        Ok(self.len()? == 0)
    }
}
