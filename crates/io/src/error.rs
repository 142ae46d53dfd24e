// Snapshot errors

use std::fmt;

use sheetsession_engine::{EngineError, SheetId};

#[derive(Debug)]
pub enum SnapshotError {
    /// State could not be serialized or compressed.
    Encode(String),
    /// Payload is corrupt or disagrees with its plain fields.
    Decode(String),
    Io(std::io::Error),
    Store(rusqlite::Error),
    UnknownSheet(SheetId),
    /// The pipeline refused the reactivated sheet.
    Engine(EngineError),
}

impl SnapshotError {
    pub fn code(&self) -> &'static str {
        match self {
            SnapshotError::Encode(_) => "snapshot_encode",
            SnapshotError::Decode(_) => "snapshot_decode",
            SnapshotError::Io(_) => "snapshot_io",
            SnapshotError::Store(_) => "snapshot_store",
            SnapshotError::UnknownSheet(_) => "sheet_not_found",
            SnapshotError::Engine(_) => "snapshot_engine",
        }
    }
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Encode(msg) => write!(f, "cannot encode snapshot: {}", msg),
            SnapshotError::Decode(msg) => write!(f, "cannot decode snapshot: {}", msg),
            SnapshotError::Io(e) => write!(f, "snapshot io: {}", e),
            SnapshotError::Store(e) => write!(f, "snapshot store: {}", e),
            SnapshotError::UnknownSheet(id) => write!(f, "no runtime sheet {}", id),
            SnapshotError::Engine(e) => write!(f, "cannot reactivate snapshot: {}", e),
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SnapshotError::Io(e) => Some(e),
            SnapshotError::Store(e) => Some(e),
            SnapshotError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SnapshotError {
    fn from(e: std::io::Error) -> Self {
        SnapshotError::Io(e)
    }
}

impl From<rusqlite::Error> for SnapshotError {
    fn from(e: rusqlite::Error) -> Self {
        SnapshotError::Store(e)
    }
}

impl From<EngineError> for SnapshotError {
    fn from(e: EngineError) -> Self {
        SnapshotError::Engine(e)
    }
}
