//! Undo/redo position tracking.
//!
//! `HistoryCursor` only knows where in the history a sheet is. The saved
//! states themselves live behind `HistoryLedger`; the pipeline is the only
//! code that moves the cursor.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::runtime::SheetId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCursor {
    /// Number of saved states.
    pub undo_count: usize,
    /// Index of the state the sheet is in. `-1` before anything is saved.
    pub current: isize,
    pub undo_name: Option<String>,
    pub redo_name: Option<String>,
}

impl Default for HistoryCursor {
    fn default() -> Self {
        Self {
            undo_count: 0,
            current: -1,
            undo_name: None,
            redo_name: None,
        }
    }
}

impl HistoryCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_undoable(&self) -> bool {
        Self::in_range(self.current - 1, self.undo_count)
    }

    pub fn is_redoable(&self) -> bool {
        Self::in_range(self.current + 1, self.undo_count)
    }

    fn in_range(index: isize, count: usize) -> bool {
        index >= 0 && (index as usize) < count
    }

    /// Save a new state after `current`, discarding any redo tail.
    /// Keeps at most `max` states.
    pub(crate) fn record(
        &mut self,
        ledger: &mut dyn HistoryLedger,
        sheet: SheetId,
        label: &str,
        max: usize,
    ) -> Result<(), EngineError> {
        let next = (self.current + 1).max(0) as usize;
        ledger.truncate(sheet, next);
        ledger.save(sheet, next, label)?;
        self.current = next as isize;
        self.undo_count = next + 1;

        while self.undo_count > max.max(1) {
            ledger.drop_oldest(sheet);
            self.undo_count -= 1;
            self.current -= 1;
        }
        self.refresh_names(ledger, sheet);
        Ok(())
    }

    /// Fill an empty ledger for a sheet that was restored with this cursor.
    /// States other than the ones the cursor names get `fallback` as label.
    /// A cursor pointing outside its own count is reset to a single state.
    pub(crate) fn reseed(
        &mut self,
        ledger: &mut dyn HistoryLedger,
        sheet: SheetId,
        fallback: &str,
    ) -> Result<(), EngineError> {
        ledger.forget(sheet);
        if self.current < 0 || self.current as usize >= self.undo_count {
            *self = Self::new();
            return self.record(ledger, sheet, fallback, 1);
        }
        let current = self.current as usize;
        for index in 0..self.undo_count {
            let label = match index {
                i if i == current => self.undo_name.as_deref(),
                i if i == current + 1 => self.redo_name.as_deref(),
                _ => None,
            };
            ledger.save(sheet, index, label.unwrap_or(fallback))?;
        }
        self.refresh_names(ledger, sheet);
        Ok(())
    }

    pub(crate) fn step_back(
        &mut self,
        ledger: &mut dyn HistoryLedger,
        sheet: SheetId,
    ) -> Result<(), EngineError> {
        if !self.is_undoable() {
            return Err(EngineError::NothingToUndo);
        }
        let target = (self.current - 1) as usize;
        ledger.restore(sheet, target)?;
        self.current -= 1;
        self.refresh_names(ledger, sheet);
        Ok(())
    }

    pub(crate) fn step_forward(
        &mut self,
        ledger: &mut dyn HistoryLedger,
        sheet: SheetId,
    ) -> Result<(), EngineError> {
        if !self.is_redoable() {
            return Err(EngineError::NothingToRedo);
        }
        let target = (self.current + 1) as usize;
        ledger.restore(sheet, target)?;
        self.current += 1;
        self.refresh_names(ledger, sheet);
        Ok(())
    }

    fn refresh_names(&mut self, ledger: &dyn HistoryLedger, sheet: SheetId) {
        // The label of a state names the edit that produced it.
        self.undo_name = if self.is_undoable() {
            ledger.label(sheet, self.current as usize)
        } else {
            None
        };
        self.redo_name = if self.is_redoable() {
            ledger.label(sheet, (self.current + 1) as usize)
        } else {
            None
        };
    }
}

/// Storage for the per-index saved states of each sheet.
pub trait HistoryLedger {
    /// Store a state at `index`, which must be the next free slot.
    fn save(&mut self, sheet: SheetId, index: usize, label: &str) -> Result<(), EngineError>;
    /// Put the sheet back into the state stored at `index`.
    fn restore(&mut self, sheet: SheetId, index: usize) -> Result<(), EngineError>;
    /// Keep only the first `len` states.
    fn truncate(&mut self, sheet: SheetId, len: usize);
    fn drop_oldest(&mut self, sheet: SheetId);
    fn label(&self, sheet: SheetId, index: usize) -> Option<String>;
    /// Release everything stored for a closed sheet.
    fn forget(&mut self, sheet: SheetId);
}

/// Label-only ledger. Restoring is a no-op beyond bounds checking.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: FxHashMap<SheetId, Vec<String>>,
    restores: Vec<(SheetId, usize)>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self, sheet: SheetId) -> &[String] {
        self.entries.get(&sheet).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Restores performed so far, oldest first.
    pub fn restores(&self) -> &[(SheetId, usize)] {
        &self.restores
    }
}

impl HistoryLedger for MemoryLedger {
    fn save(&mut self, sheet: SheetId, index: usize, label: &str) -> Result<(), EngineError> {
        let entries = self.entries.entry(sheet).or_default();
        if index > entries.len() {
            return Err(EngineError::Ledger(format!(
                "sheet {sheet} cannot save state {index} after {} stored",
                entries.len()
            )));
        }
        entries.truncate(index);
        entries.push(label.to_string());
        Ok(())
    }

    fn restore(&mut self, sheet: SheetId, index: usize) -> Result<(), EngineError> {
        let len = self.entries.get(&sheet).map_or(0, Vec::len);
        if index >= len {
            return Err(EngineError::Ledger(format!(
                "sheet {sheet} has no state {index} ({len} stored)"
            )));
        }
        self.restores.push((sheet, index));
        Ok(())
    }

    fn truncate(&mut self, sheet: SheetId, len: usize) {
        if let Some(entries) = self.entries.get_mut(&sheet) {
            entries.truncate(len);
        }
    }

    fn drop_oldest(&mut self, sheet: SheetId) {
        if let Some(entries) = self.entries.get_mut(&sheet) {
            if !entries.is_empty() {
                entries.remove(0);
            }
        }
    }

    fn label(&self, sheet: SheetId, index: usize) -> Option<String> {
        self.entries.get(&sheet)?.get(index).cloned()
    }

    fn forget(&mut self, sheet: SheetId) {
        self.entries.remove(&sheet);
    }
}
