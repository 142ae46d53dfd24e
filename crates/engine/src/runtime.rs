//! Runtime sheets and the per-session arena that owns them.
//!
//! A viewsheet does not own its worksheet directly: it holds the worksheet's
//! `SheetId`, and the arena resolves it. Worksheet joins work the same way.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use sheetsession_protocol::Binding;

use crate::error::EngineError;
use crate::form_row::FormTable;
use crate::history::HistoryCursor;

/// Stable identity of a runtime sheet within a session. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SheetId(u64);

impl SheetId {
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SheetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetKind {
    Worksheet,
    Viewsheet,
}

/// Repository entry a runtime sheet was opened from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    pub path: String,
    pub kind: SheetKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl AssetEntry {
    pub fn worksheet(path: impl Into<String>) -> Self {
        Self { path: path.into(), kind: SheetKind::Worksheet, owner: None }
    }

    pub fn viewsheet(path: impl Into<String>) -> Self {
        Self { path: path.into(), kind: SheetKind::Viewsheet, owner: None }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SandboxId(u64);

impl SandboxId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Cached query planning state of a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySession {
    pub initialized: bool,
    /// How many times planning was invalidated.
    pub invalidations: u64,
}

impl QuerySession {
    pub fn invalidate(&mut self) {
        self.initialized = false;
        self.invalidations += 1;
    }
}

/// Execution context that runs a worksheet's queries.
#[derive(Debug, Clone)]
pub struct QuerySandbox {
    id: SandboxId,
    pub query_session: Option<QuerySession>,
}

impl QuerySandbox {
    pub fn id(&self) -> SandboxId {
        self.id
    }
}

#[derive(Debug, Clone)]
pub struct WorksheetRuntime {
    pub sandbox: QuerySandbox,
    pub assemblies: BTreeSet<String>,
    pub bindings: BTreeMap<String, Binding>,
    pub forms: BTreeMap<String, FormTable>,
    /// Worksheet this one is joined against, if any.
    pub join: Option<SheetId>,
}

#[derive(Debug, Clone)]
pub struct ViewsheetRuntime {
    /// The nested worksheet, owned through the arena.
    pub worksheet: SheetId,
    pub assemblies: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub enum SheetBody {
    Worksheet(WorksheetRuntime),
    Viewsheet(ViewsheetRuntime),
}

#[derive(Debug, Clone)]
pub struct RuntimeSheet {
    id: SheetId,
    pub entry: AssetEntry,
    /// User the sheet was opened for.
    pub owner: String,
    pub history: HistoryCursor,
    pub last_access: DateTime<Utc>,
    pub body: SheetBody,
}

impl RuntimeSheet {
    pub fn id(&self) -> SheetId {
        self.id
    }

    pub fn entry(&self) -> &AssetEntry {
        &self.entry
    }

    pub fn kind(&self) -> SheetKind {
        match self.body {
            SheetBody::Worksheet(_) => SheetKind::Worksheet,
            SheetBody::Viewsheet(_) => SheetKind::Viewsheet,
        }
    }

    pub fn as_worksheet(&self) -> Option<&WorksheetRuntime> {
        match &self.body {
            SheetBody::Worksheet(ws) => Some(ws),
            SheetBody::Viewsheet(_) => None,
        }
    }

    pub fn as_worksheet_mut(&mut self) -> Option<&mut WorksheetRuntime> {
        match &mut self.body {
            SheetBody::Worksheet(ws) => Some(ws),
            SheetBody::Viewsheet(_) => None,
        }
    }

    pub fn as_viewsheet(&self) -> Option<&ViewsheetRuntime> {
        match &self.body {
            SheetBody::Viewsheet(vs) => Some(vs),
            SheetBody::Worksheet(_) => None,
        }
    }

    /// The sandbox of a worksheet runtime.
    pub fn asset_query_sandbox(&self) -> Option<&QuerySandbox> {
        self.as_worksheet().map(|ws| &ws.sandbox)
    }
}

/// Worksheet content supplied when opening or restoring a runtime.
#[derive(Debug, Clone, Default)]
pub struct WorksheetParts {
    pub assemblies: BTreeSet<String>,
    pub bindings: BTreeMap<String, Binding>,
    pub forms: BTreeMap<String, FormTable>,
    pub join: Option<SheetId>,
}

/// All runtime sheets of one session, addressed by id.
#[derive(Debug, Default)]
pub struct SessionArena {
    sheets: FxHashMap<SheetId, RuntimeSheet>,
    next_id: u64,
    next_sandbox: u64,
}

impl SessionArena {
    pub fn new() -> Self {
        Self {
            sheets: FxHashMap::default(),
            next_id: 1,
            next_sandbox: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.sheets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
    }

    /// Open ids in ascending order.
    pub fn ids(&self) -> Vec<SheetId> {
        let mut ids: Vec<_> = self.sheets.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: SheetId) -> bool {
        self.sheets.contains_key(&id)
    }

    pub fn get(&self, id: SheetId) -> Result<&RuntimeSheet, EngineError> {
        self.sheets.get(&id).ok_or(EngineError::SheetNotFound(id))
    }

    pub fn get_mut(&mut self, id: SheetId) -> Result<&mut RuntimeSheet, EngineError> {
        self.sheets.get_mut(&id).ok_or(EngineError::SheetNotFound(id))
    }

    pub fn worksheet(&self, id: SheetId) -> Result<&WorksheetRuntime, EngineError> {
        self.get(id)?.as_worksheet().ok_or(EngineError::NotAWorksheet(id))
    }

    pub fn worksheet_mut(&mut self, id: SheetId) -> Result<&mut WorksheetRuntime, EngineError> {
        self.get_mut(id)?.as_worksheet_mut().ok_or(EngineError::NotAWorksheet(id))
    }

    pub fn open_worksheet(&mut self, entry: AssetEntry, owner: &str, parts: WorksheetParts) -> SheetId {
        let id = self.alloc_id();
        let body = SheetBody::Worksheet(self.worksheet_body(parts));
        self.insert(id, entry, owner, HistoryCursor::new(), body);
        id
    }

    /// Open a viewsheet together with the worksheet it is built on.
    pub fn open_viewsheet(
        &mut self,
        entry: AssetEntry,
        worksheet_entry: AssetEntry,
        owner: &str,
        assemblies: BTreeSet<String>,
        worksheet: WorksheetParts,
    ) -> SheetId {
        let ws = self.open_worksheet(worksheet_entry, owner, worksheet);
        let id = self.alloc_id();
        let body = SheetBody::Viewsheet(ViewsheetRuntime { worksheet: ws, assemblies });
        self.insert(id, entry, owner, HistoryCursor::new(), body);
        id
    }

    /// Re-insert a sheet from persisted state. Gets a fresh id and sandbox.
    pub fn insert_restored(
        &mut self,
        entry: AssetEntry,
        owner: &str,
        history: HistoryCursor,
        body: RestoredBody,
    ) -> SheetId {
        let body = match body {
            RestoredBody::Worksheet(parts) => SheetBody::Worksheet(self.worksheet_body(parts)),
            RestoredBody::Viewsheet { worksheet, assemblies } => {
                SheetBody::Viewsheet(ViewsheetRuntime { worksheet, assemblies })
            }
        };
        let id = self.alloc_id();
        self.insert(id, entry, owner, history, body);
        id
    }

    /// Viewsheet whose nested worksheet is `id`, if any.
    pub fn viewsheet_of(&self, id: SheetId) -> Option<SheetId> {
        self.sheets
            .values()
            .find(|s| s.as_viewsheet().is_some_and(|vs| vs.worksheet == id))
            .map(|s| s.id)
    }

    /// Close a sheet. A viewsheet takes its nested worksheet with it; the
    /// nested worksheet itself cannot be closed on its own.
    /// Returns the ids actually removed.
    pub fn close(&mut self, id: SheetId) -> Result<Vec<SheetId>, EngineError> {
        if let Some(viewsheet) = self.viewsheet_of(id) {
            return Err(EngineError::NestedWorksheet { sheet: id, viewsheet });
        }
        let Some(sheet) = self.sheets.remove(&id) else {
            return Ok(Vec::new());
        };
        let mut closed = vec![id];
        if let SheetBody::Viewsheet(vs) = &sheet.body {
            if self.sheets.remove(&vs.worksheet).is_some() {
                closed.push(vs.worksheet);
            }
        }
        Ok(closed)
    }

    /// Top-level sheets idle for longer than `timeout` at `now`.
    /// Nested worksheets expire with their viewsheet.
    pub fn expired(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<SheetId> {
        let nested: BTreeSet<SheetId> = self
            .sheets
            .values()
            .filter_map(|s| s.as_viewsheet().map(|vs| vs.worksheet))
            .collect();
        let mut ids: Vec<SheetId> = self
            .sheets
            .values()
            .filter(|s| !nested.contains(&s.id))
            .filter(|s| {
                now.signed_duration_since(s.last_access)
                    .to_std()
                    .map(|idle| idle > timeout)
                    .unwrap_or(false)
            })
            .map(|s| s.id)
            .collect();
        ids.sort();
        ids
    }

    /// Display name for diagnostics. Missing sheets just have no name.
    pub fn sheet_name(&self, id: SheetId) -> Option<String> {
        let sheet = self.sheets.get(&id)?;
        sheet.entry.path.rsplit('/').next().map(str::to_string)
    }

    fn alloc_id(&mut self) -> SheetId {
        let id = SheetId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        id
    }

    fn worksheet_body(&mut self, parts: WorksheetParts) -> WorksheetRuntime {
        let sandbox = QuerySandbox {
            id: SandboxId(self.next_sandbox.max(1)),
            query_session: Some(QuerySession { initialized: true, invalidations: 0 }),
        };
        self.next_sandbox = sandbox.id.0 + 1;
        WorksheetRuntime {
            sandbox,
            assemblies: parts.assemblies,
            bindings: parts.bindings,
            forms: parts.forms,
            join: parts.join,
        }
    }

    fn insert(&mut self, id: SheetId, entry: AssetEntry, owner: &str, history: HistoryCursor, body: SheetBody) {
        self.sheets.insert(
            id,
            RuntimeSheet {
                id,
                entry,
                owner: owner.to_string(),
                history,
                last_access: Utc::now(),
                body,
            },
        );
    }
}

/// Body of a sheet being restored from a snapshot.
#[derive(Debug, Clone)]
pub enum RestoredBody {
    Worksheet(WorksheetParts),
    Viewsheet {
        worksheet: SheetId,
        assemblies: BTreeSet<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(names: &[&str]) -> WorksheetParts {
        WorksheetParts {
            assemblies: names.iter().map(|s| s.to_string()).collect(),
            ..WorksheetParts::default()
        }
    }

    #[test]
    fn ids_are_never_reused() {
        let mut arena = SessionArena::new();
        let a = arena.open_worksheet(AssetEntry::worksheet("ws/a"), "u", parts(&[]));
        arena.close(a).unwrap();
        let b = arena.open_worksheet(AssetEntry::worksheet("ws/b"), "u", parts(&[]));
        assert_ne!(a, b);
        assert_eq!(arena.get(a).unwrap_err(), EngineError::SheetNotFound(a));
    }

    #[test]
    fn viewsheet_references_nested_worksheet() {
        let mut arena = SessionArena::new();
        let vs = arena.open_viewsheet(
            AssetEntry::viewsheet("dash/sales"),
            AssetEntry::worksheet("ws/sales"),
            "alice",
            BTreeSet::new(),
            parts(&["orders"]),
        );
        let nested = arena.get(vs).unwrap().as_viewsheet().unwrap().worksheet;
        assert!(arena.worksheet(nested).unwrap().assemblies.contains("orders"));
        assert_eq!(arena.worksheet(vs).unwrap_err(), EngineError::NotAWorksheet(vs));
        assert_eq!(arena.get(vs).unwrap().kind(), SheetKind::Viewsheet);

        assert_eq!(arena.viewsheet_of(nested), Some(vs));
        assert_eq!(
            arena.close(nested).unwrap_err(),
            EngineError::NestedWorksheet { sheet: nested, viewsheet: vs }
        );
        assert!(arena.contains(nested));

        let closed = arena.close(vs).unwrap();
        assert_eq!(closed, vec![vs, nested]);
        assert!(arena.is_empty());
    }

    #[test]
    fn each_worksheet_gets_its_own_sandbox() {
        let mut arena = SessionArena::new();
        let a = arena.open_worksheet(AssetEntry::worksheet("a"), "u", parts(&[]));
        let b = arena.open_worksheet(AssetEntry::worksheet("b"), "u", parts(&[]));
        let sa = arena.get(a).unwrap().asset_query_sandbox().unwrap().id();
        let sb = arena.get(b).unwrap().asset_query_sandbox().unwrap().id();
        assert_ne!(sa, sb);
    }

    #[test]
    fn expiry_skips_nested_worksheets() {
        let mut arena = SessionArena::new();
        let vs = arena.open_viewsheet(
            AssetEntry::viewsheet("v"),
            AssetEntry::worksheet("w"),
            "u",
            BTreeSet::new(),
            parts(&[]),
        );
        let fresh = arena.open_worksheet(AssetEntry::worksheet("fresh"), "u", parts(&[]));
        let later = Utc::now() + chrono::Duration::seconds(120);
        arena.get_mut(fresh).unwrap().last_access = later;

        let expired = arena.expired(later, Duration::from_secs(60));
        assert_eq!(expired, vec![vs]);
    }

    #[test]
    fn sheet_name_degrades_to_none() {
        let mut arena = SessionArena::new();
        let id = arena.open_worksheet(AssetEntry::worksheet("folder/Orders"), "u", parts(&[]));
        assert_eq!(arena.sheet_name(id).as_deref(), Some("Orders"));
        assert_eq!(arena.sheet_name(SheetId::from_raw(999)), None);
    }
}
