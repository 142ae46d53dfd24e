//! Sheet Session Protocol
//!
//! Typed events (client → server) and commands (server → client) for an
//! interactive worksheet/viewsheet editing session. The transport itself is
//! not part of this crate; it only fixes the shape of what travels over it.
//!
//! # Usage
//!
//! ```ignore
//! use sheetsession_protocol::{Event, EventBody};
//!
//! let event = Event::new(7, EventBody::Refresh).with_user("alice");
//! let json = serde_json::to_string(&event)?;
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub mod binding;

pub use binding::{AggregateFormula, AggregateRef, Binding, DataRef, FormValue};

// =============================================================================
// Client → Server: events
// =============================================================================

/// One user action addressed to a runtime sheet.
///
/// Immutable after construction; consumed once by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Runtime sheet identifier.
    pub target: u64,
    /// Opaque principal link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub body: EventBody,
    /// Open-ended metadata. Nothing in the session layer reads it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(target: u64, body: EventBody) -> Self {
        Self {
            target,
            user: None,
            body,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    pub fn requires_return(&self) -> bool {
        self.body.requires_return()
    }

    pub fn is_undoable(&self) -> bool {
        self.body.is_undoable()
    }

    pub fn is_secondary(&self) -> bool {
        self.body.is_secondary()
    }

    pub fn close_expired(&self) -> bool {
        self.body.close_expired()
    }

    pub fn requires_reset(&self) -> bool {
        self.body.requires_reset()
    }

    pub fn assemblies(&self) -> AffectedAssemblies {
        self.body.assemblies()
    }

    pub fn is_worksheet_event(&self) -> bool {
        self.body.is_worksheet_event()
    }
}

/// Event payloads, one variant per action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    // Worksheet-shaped: a viewsheet target delegates these to its worksheet.
    SetBinding {
        assembly: String,
        binding: Binding,
    },
    CheckTrap {
        assembly: String,
        binding: Binding,
    },
    EditFormCell {
        table: String,
        row: usize,
        col: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<FormValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    AddFormRow {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_row: Option<usize>,
    },
    DeleteFormRow {
        table: String,
        row: usize,
    },
    CommitForm {
        table: String,
    },
    AddAssembly {
        name: String,
    },
    RenameAssembly {
        old: String,
        new: String,
    },
    RemoveAssembly {
        name: String,
    },
    Refresh,

    // Sheet-level: processed on the addressed runtime itself.
    Undo,
    Redo,
    Heartbeat,
    CloseSheet,
}

impl EventBody {
    /// Snake-case tag. Doubles as the history label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetBinding { .. } => "set_binding",
            Self::CheckTrap { .. } => "check_trap",
            Self::EditFormCell { .. } => "edit_form_cell",
            Self::AddFormRow { .. } => "add_form_row",
            Self::DeleteFormRow { .. } => "delete_form_row",
            Self::CommitForm { .. } => "commit_form",
            Self::AddAssembly { .. } => "add_assembly",
            Self::RenameAssembly { .. } => "rename_assembly",
            Self::RemoveAssembly { .. } => "remove_assembly",
            Self::Refresh => "refresh",
            Self::Undo => "undo",
            Self::Redo => "redo",
            Self::Heartbeat => "heartbeat",
            Self::CloseSheet => "close_sheet",
        }
    }

    pub fn requires_return(&self) -> bool {
        matches!(
            self,
            Self::SetBinding { .. } | Self::CheckTrap { .. } | Self::Undo | Self::Redo | Self::CloseSheet
        )
    }

    /// Structural edits that get a history entry.
    pub fn is_undoable(&self) -> bool {
        matches!(
            self,
            Self::SetBinding { .. }
                | Self::AddAssembly { .. }
                | Self::RenameAssembly { .. }
                | Self::RemoveAssembly { .. }
        )
    }

    /// Secondary events may fail without aborting the request.
    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::Heartbeat | Self::Refresh)
    }

    pub fn close_expired(&self) -> bool {
        !matches!(self, Self::Heartbeat | Self::CloseSheet)
    }

    pub fn requires_reset(&self) -> bool {
        matches!(self, Self::Refresh | Self::Undo | Self::Redo)
    }

    pub fn is_worksheet_event(&self) -> bool {
        !matches!(self, Self::Undo | Self::Redo | Self::Heartbeat | Self::CloseSheet)
    }

    /// Assemblies influenced by this event.
    pub fn assemblies(&self) -> AffectedAssemblies {
        match self {
            Self::Undo | Self::Redo | Self::Refresh => AffectedAssemblies::All,
            Self::SetBinding { assembly, .. } | Self::CheckTrap { assembly, .. } => {
                AffectedAssemblies::named([assembly.as_str()])
            }
            Self::AddAssembly { name } | Self::RemoveAssembly { name } => {
                AffectedAssemblies::named([name.as_str()])
            }
            Self::RenameAssembly { old, new } => AffectedAssemblies::named([old.as_str(), new.as_str()]),
            Self::EditFormCell { table, .. }
            | Self::AddFormRow { table, .. }
            | Self::DeleteFormRow { table, .. }
            | Self::CommitForm { table } => AffectedAssemblies::named([table.as_str()]),
            Self::Heartbeat | Self::CloseSheet => AffectedAssemblies::none(),
        }
    }
}

/// Set of assemblies an event influences.
///
/// `All` is the conservative "everything is affected" answer and is distinct
/// from `Named` with an empty set, which means nothing is affected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffectedAssemblies {
    All,
    Named(BTreeSet<String>),
}

impl AffectedAssemblies {
    pub fn named<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self::Named(names.into_iter().map(str::to_string).collect())
    }

    pub fn none() -> Self {
        Self::Named(BTreeSet::new())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// True only for an explicit empty set.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::Named(set) if set.is_empty())
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Named(set) => set.contains(name),
        }
    }

    /// Names for a refresh command; `None` when every assembly is affected.
    pub fn to_names(&self) -> Option<Vec<String>> {
        match self {
            Self::All => None,
            Self::Named(set) => Some(set.iter().cloned().collect()),
        }
    }
}

// =============================================================================
// Server → Client: commands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapSeverity {
    None,
    Notice,
    Trap,
}

/// One outbound instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    TrapReport {
        assembly: String,
        severity: TrapSeverity,
        dropped_tables: Vec<String>,
        added_tables: Vec<String>,
        dropped_aggregates: Vec<String>,
        added_aggregates: Vec<String>,
    },
    HistoryChanged {
        undoable: bool,
        redoable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        undo_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        redo_name: Option<String>,
    },
    /// `None` refreshes every assembly.
    RefreshAssemblies {
        assemblies: Option<Vec<String>>,
    },
    FormRowsChanged {
        table: String,
        changed: Vec<usize>,
        added: Vec<usize>,
        deleted: Vec<usize>,
    },
    AssemblyAdded {
        name: String,
    },
    AssemblyRenamed {
        old: String,
        new: String,
    },
    AssemblyRemoved {
        name: String,
    },
    Reset,
    SheetClosed {
        id: u64,
    },
    Error {
        code: String,
        message: String,
        secondary: bool,
    },
}

/// Ordered, append-only accumulator of commands for one request.
#[derive(Debug, Default)]
pub struct CommandBatch {
    commands: Vec<Command>,
    requires_return: bool,
}

impl CommandBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn extend(&mut self, commands: impl IntoIterator<Item = Command>) {
        self.commands.extend(commands);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    /// Whether the client waits on this batch before continuing.
    pub fn requires_return(&self) -> bool {
        self.requires_return
    }

    pub fn mark_requires_return(&mut self) {
        self.requires_return = true;
    }

    /// Consume the batch for the transport.
    pub fn flush(self) -> Vec<Command> {
        self.commands
    }

    /// Newline-delimited JSON, one command per line.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for command in &self.commands {
            out.push_str(&serde_json::to_string(command)?);
            out.push('\n');
        }
        Ok(out)
    }
}
