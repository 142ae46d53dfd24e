pub mod context;
pub mod error;
pub mod form_row;
pub mod history;
pub mod pipeline;
pub mod runtime;
pub mod trap;

#[cfg(test)]
pub mod harness;

pub use context::{EventContext, LogScope, SandboxGuard};
pub use error::EngineError;
pub use form_row::{FormRow, FormTable, RowState};
pub use history::{HistoryCursor, HistoryLedger, MemoryLedger};
pub use pipeline::{DispatchOutcome, Pipeline, PipelineOptions};
pub use runtime::{AssetEntry, RuntimeSheet, SessionArena, SheetId, SheetKind, WorksheetParts};
pub use trap::{SourceCatalog, TrapDetector, TrapInfo};
