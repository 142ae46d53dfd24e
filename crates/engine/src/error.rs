use std::fmt;

use crate::runtime::SheetId;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Cell or label index outside the row width.
    OutOfRange { index: usize, width: usize },
    /// Row index outside a form table.
    RowOutOfRange { row: usize, rows: usize },
    /// No runtime sheet with this id is open.
    SheetNotFound(SheetId),
    /// Worksheet operation addressed to something without a worksheet.
    NotAWorksheet(SheetId),
    UnknownAssembly { sheet: SheetId, name: String },
    UnknownFormTable { sheet: SheetId, name: String },
    /// Assembly name already taken.
    DuplicateAssembly { sheet: SheetId, name: String },
    /// A viewsheet's worksheet only closes together with the viewsheet.
    NestedWorksheet { sheet: SheetId, viewsheet: SheetId },
    NothingToUndo,
    NothingToRedo,
    /// The history ledger could not restore a state.
    Ledger(String),
    /// An event's processing failed for a reason of its own.
    Processing { kind: &'static str, message: String },
}

impl EngineError {
    /// Stable code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfRange { .. } => "out_of_range",
            Self::RowOutOfRange { .. } => "row_out_of_range",
            Self::SheetNotFound(_) => "sheet_not_found",
            Self::NotAWorksheet(_) => "not_a_worksheet",
            Self::UnknownAssembly { .. } => "unknown_assembly",
            Self::UnknownFormTable { .. } => "unknown_form_table",
            Self::DuplicateAssembly { .. } => "duplicate_assembly",
            Self::NestedWorksheet { .. } => "nested_worksheet",
            Self::NothingToUndo => "nothing_to_undo",
            Self::NothingToRedo => "nothing_to_redo",
            Self::Ledger(_) => "ledger_error",
            Self::Processing { .. } => "processing_error",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { index, width } => {
                write!(f, "column {index} out of range for row of width {width}")
            }
            Self::RowOutOfRange { row, rows } => {
                write!(f, "row {row} out of range for table of {rows} row(s)")
            }
            Self::SheetNotFound(id) => write!(f, "runtime sheet {id} not found"),
            Self::NotAWorksheet(id) => write!(f, "runtime sheet {id} has no worksheet"),
            Self::UnknownAssembly { sheet, name } => {
                write!(f, "sheet {sheet}: unknown assembly '{name}'")
            }
            Self::UnknownFormTable { sheet, name } => {
                write!(f, "sheet {sheet}: unknown form table '{name}'")
            }
            Self::DuplicateAssembly { sheet, name } => {
                write!(f, "sheet {sheet}: assembly '{name}' already exists")
            }
            Self::NestedWorksheet { sheet, viewsheet } => {
                write!(f, "sheet {sheet} belongs to viewsheet {viewsheet}; close the viewsheet")
            }
            Self::NothingToUndo => write!(f, "nothing to undo"),
            Self::NothingToRedo => write!(f, "nothing to redo"),
            Self::Ledger(msg) => write!(f, "history ledger error: {msg}"),
            Self::Processing { kind, message } => write!(f, "{kind} failed: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}
