// Compressed session snapshots
//
// A snapshot is the gzip-compressed JSON of one runtime sheet's semantic
// state. Kind and owner are kept in plain fields next to the payload so
// listing and filtering never decompress anything.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use sheetsession_engine::runtime::{RestoredBody, WorksheetRuntime};
use sheetsession_engine::{
    AssetEntry, FormTable, HistoryCursor, Pipeline, SessionArena, SheetId, SheetKind, WorksheetParts,
};
use sheetsession_protocol::Binding;

use crate::error::SnapshotError;

/// Semantic content of a worksheet runtime.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorksheetState {
    pub assemblies: BTreeSet<String>,
    #[serde(default)]
    pub bindings: BTreeMap<String, Binding>,
    #[serde(default)]
    pub forms: BTreeMap<String, FormTable>,
    /// Entry path of the joined worksheet. Ids do not survive a restore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,
}

impl WorksheetState {
    fn capture(arena: &SessionArena, ws: &WorksheetRuntime) -> Self {
        Self {
            assemblies: ws.assemblies.clone(),
            bindings: ws.bindings.clone(),
            forms: ws.forms.clone(),
            join: ws
                .join
                .and_then(|id| arena.get(id).ok())
                .map(|sheet| sheet.entry.path.clone()),
        }
    }

    fn into_parts(self, arena: &SessionArena) -> WorksheetParts {
        let join = self.join.as_deref().and_then(|path| {
            arena.ids().into_iter().find(|id| {
                arena
                    .get(*id)
                    .map(|s| s.kind() == SheetKind::Worksheet && s.entry.path == path)
                    .unwrap_or(false)
            })
        });
        if self.join.is_some() && join.is_none() {
            log::debug!("joined worksheet {:?} is not open; restoring without join", self.join);
        }
        WorksheetParts {
            assemblies: self.assemblies,
            bindings: self.bindings,
            forms: self.forms,
            join,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionBody {
    Worksheet {
        worksheet: WorksheetState,
    },
    Viewsheet {
        assemblies: BTreeSet<String>,
        worksheet_entry: AssetEntry,
        worksheet_history: HistoryCursor,
        worksheet: WorksheetState,
    },
}

/// Live state of one runtime sheet.
///
/// Equality is semantic: sandbox ids and access times are not captured, so
/// two states are equal exactly when restoring them yields the same sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub entry: AssetEntry,
    pub owner: String,
    pub history: HistoryCursor,
    pub body: SessionBody,
}

impl SessionState {
    pub fn kind(&self) -> SheetKind {
        match self.body {
            SessionBody::Worksheet { .. } => SheetKind::Worksheet,
            SessionBody::Viewsheet { .. } => SheetKind::Viewsheet,
        }
    }

    pub fn capture(arena: &SessionArena, id: SheetId) -> Result<Self, SnapshotError> {
        let sheet = arena.get(id).map_err(|_| SnapshotError::UnknownSheet(id))?;
        let body = if let Some(ws) = sheet.as_worksheet() {
            SessionBody::Worksheet {
                worksheet: WorksheetState::capture(arena, ws),
            }
        } else if let Some(vs) = sheet.as_viewsheet() {
            let nested = arena
                .get(vs.worksheet)
                .map_err(|_| SnapshotError::UnknownSheet(vs.worksheet))?;
            let ws = nested
                .as_worksheet()
                .ok_or(SnapshotError::UnknownSheet(vs.worksheet))?;
            SessionBody::Viewsheet {
                assemblies: vs.assemblies.clone(),
                worksheet_entry: nested.entry.clone(),
                worksheet_history: nested.history.clone(),
                worksheet: WorksheetState::capture(arena, ws),
            }
        } else {
            return Err(SnapshotError::UnknownSheet(id));
        };

        Ok(Self {
            entry: sheet.entry.clone(),
            owner: sheet.owner.clone(),
            history: sheet.history.clone(),
            body,
        })
    }

    /// Reactivate into `arena`. The sheet (and a viewsheet's worksheet) get
    /// fresh ids and sandboxes. Use `reactivate` to also seed a pipeline's
    /// history ledger.
    pub fn restore(self, arena: &mut SessionArena) -> SheetId {
        match self.body {
            SessionBody::Worksheet { worksheet } => {
                let parts = worksheet.into_parts(arena);
                arena.insert_restored(self.entry, &self.owner, self.history, RestoredBody::Worksheet(parts))
            }
            SessionBody::Viewsheet {
                assemblies,
                worksheet_entry,
                worksheet_history,
                worksheet,
            } => {
                let parts = worksheet.into_parts(arena);
                let ws = arena.insert_restored(
                    worksheet_entry,
                    &self.owner,
                    worksheet_history,
                    RestoredBody::Worksheet(parts),
                );
                arena.insert_restored(
                    self.entry,
                    &self.owner,
                    self.history,
                    RestoredBody::Viewsheet { worksheet: ws, assemblies },
                )
            }
        }
    }
}

/// Compressed state plus the plain fields callers filter on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedSnapshot {
    payload: Vec<u8>,
    kind: SheetKind,
    owner: String,
}

impl CompressedSnapshot {
    /// Reassemble a snapshot read back from storage.
    pub fn from_parts(payload: Vec<u8>, kind: SheetKind, owner: impl Into<String>) -> Self {
        Self {
            payload,
            kind,
            owner: owner.into(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn kind(&self) -> SheetKind {
        self.kind
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Compressed size in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

pub fn compress(state: &SessionState, level: u32) -> Result<CompressedSnapshot, SnapshotError> {
    let json = serde_json::to_vec(state).map_err(|e| SnapshotError::Encode(e.to_string()))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(&json)
        .map_err(|e| SnapshotError::Encode(e.to_string()))?;
    let payload = encoder
        .finish()
        .map_err(|e| SnapshotError::Encode(e.to_string()))?;

    log::debug!(
        "compressed {} snapshot of {}: {} -> {} bytes",
        state.owner,
        state.entry.path,
        json.len(),
        payload.len()
    );
    Ok(CompressedSnapshot {
        payload,
        kind: state.kind(),
        owner: state.owner.clone(),
    })
}

pub fn decompress(snapshot: &CompressedSnapshot) -> Result<SessionState, SnapshotError> {
    let mut json = Vec::new();
    GzDecoder::new(snapshot.payload.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| SnapshotError::Decode(e.to_string()))?;
    let state: SessionState =
        serde_json::from_slice(&json).map_err(|e| SnapshotError::Decode(e.to_string()))?;

    if state.kind() != snapshot.kind {
        return Err(SnapshotError::Decode(format!(
            "payload holds a {:?}, snapshot says {:?}",
            state.kind(),
            snapshot.kind
        )));
    }
    if state.owner != snapshot.owner {
        return Err(SnapshotError::Decode(format!(
            "payload owner '{}' does not match '{}'",
            state.owner, snapshot.owner
        )));
    }
    Ok(state)
}

/// Snapshots owned by `owner`. Reads only the plain owner field.
pub fn filter_by_owner<'a, I>(snapshots: I, owner: &str) -> Vec<&'a CompressedSnapshot>
where
    I: IntoIterator<Item = &'a CompressedSnapshot>,
{
    snapshots.into_iter().filter(|s| s.owner == owner).collect()
}

/// Capture and compress one open sheet.
pub fn snapshot_sheet(arena: &SessionArena, id: SheetId, level: u32) -> Result<CompressedSnapshot, SnapshotError> {
    compress(&SessionState::capture(arena, id)?, level)
}

/// Decompress a snapshot and reactivate it in `pipeline`, reseeding its
/// history ledger for the new ids.
pub fn reactivate(pipeline: &mut Pipeline, snapshot: &CompressedSnapshot) -> Result<SheetId, SnapshotError> {
    let id = decompress(snapshot)?.restore(pipeline.arena_mut());
    pipeline.adopt_restored(id)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetsession_protocol::{DataRef, FormValue};

    fn sample_arena() -> (SessionArena, SheetId) {
        let mut arena = SessionArena::new();
        let mut bindings = BTreeMap::new();
        bindings.insert("grid".to_string(), Binding::to_table("orders").detail(DataRef::new("amount")));
        let mut forms = BTreeMap::new();
        let mut form = FormTable::from_rows(1, vec![vec![FormValue::from(1.0)]]);
        form.row_mut(0).unwrap().set(0, FormValue::from(2.0)).unwrap();
        forms.insert("grid".to_string(), form);
        let id = arena.open_worksheet(
            AssetEntry::worksheet("ws/orders"),
            "alice",
            WorksheetParts {
                assemblies: BTreeSet::from(["grid".to_string()]),
                bindings,
                forms,
                join: None,
            },
        );
        (arena, id)
    }

    #[test]
    fn capture_ignores_sandbox_and_access_time() {
        let (arena, id) = sample_arena();
        let state = SessionState::capture(&arena, id).unwrap();

        let mut other = SessionArena::new();
        // burn an id and a sandbox so the restored sheet differs in both
        other.open_worksheet(AssetEntry::worksheet("x"), "bob", WorksheetParts::default());
        let restored = state.clone().restore(&mut other);

        assert_ne!(
            arena.worksheet(id).unwrap().sandbox.id(),
            other.worksheet(restored).unwrap().sandbox.id()
        );
        assert_eq!(SessionState::capture(&other, restored).unwrap(), state);
    }

    #[test]
    fn owner_and_kind_live_outside_the_payload() {
        let (arena, id) = sample_arena();
        let snap = snapshot_sheet(&arena, id, 6).unwrap();
        assert_eq!(snap.owner(), "alice");
        assert_eq!(snap.kind(), SheetKind::Worksheet);
        assert!(!snap.is_empty());
        // gzip magic
        assert_eq!(&snap.payload()[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn mismatched_plain_fields_fail_decode() {
        let (arena, id) = sample_arena();
        let snap = snapshot_sheet(&arena, id, 1).unwrap();

        let wrong_owner = CompressedSnapshot::from_parts(snap.payload().to_vec(), snap.kind(), "mallory");
        assert_eq!(decompress(&wrong_owner).unwrap_err().code(), "snapshot_decode");

        let wrong_kind = CompressedSnapshot::from_parts(snap.payload().to_vec(), SheetKind::Viewsheet, "alice");
        assert_eq!(decompress(&wrong_kind).unwrap_err().code(), "snapshot_decode");
    }

    #[test]
    fn capture_of_missing_sheet() {
        let arena = SessionArena::new();
        let err = SessionState::capture(&arena, SheetId::from_raw(4)).unwrap_err();
        assert_eq!(err.code(), "sheet_not_found");
    }

    #[test]
    fn join_is_restored_by_path() {
        let mut arena = SessionArena::new();
        let base = arena.open_worksheet(AssetEntry::worksheet("ws/base"), "alice", WorksheetParts::default());
        let joined = arena.open_worksheet(
            AssetEntry::worksheet("ws/joined"),
            "alice",
            WorksheetParts { join: Some(base), ..WorksheetParts::default() },
        );
        let state = SessionState::capture(&arena, joined).unwrap();
        let restored = state.restore(&mut arena);
        assert_eq!(arena.worksheet(restored).unwrap().join, Some(base));

        let mut empty = SessionArena::new();
        let state = SessionState::capture(&arena, joined).unwrap();
        let orphan = state.restore(&mut empty);
        assert_eq!(empty.worksheet(orphan).unwrap().join, None);
    }
}
