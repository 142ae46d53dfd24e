//! Event dispatch against runtime sheets.
//!
//! One call to `process_request` handles the events of one inbound request
//! in order, on the calling thread. Each event goes
//! `Constructed → Dispatched → (Delegated | Processed) → Terminal`:
//! worksheet-shaped events addressed to a viewsheet are delegated to the
//! viewsheet's nested worksheet, everything else is processed on the target.
//!
//! The pipeline is the only writer of `HistoryCursor` fields.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use sheetsession_config::SessionSettings;
use sheetsession_protocol::{Binding, Command, CommandBatch, Event, EventBody, TrapSeverity};

use crate::context::{EventContext, LogScope};
use crate::error::EngineError;
use crate::form_row::FormTable;
use crate::history::{HistoryCursor, HistoryLedger, MemoryLedger};
use crate::runtime::{AssetEntry, SessionArena, SheetId, WorksheetParts};
use crate::trap::{SourceCatalog, TrapDetector, TrapInfo};

/// Label of the state saved when a sheet is opened.
pub const OPEN_LABEL: &str = "open";

/// Label for restored states whose original label is unknown.
pub const RESTORED_LABEL: &str = "restored";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Most history states kept per sheet.
    pub max_undo: usize,
    /// Idle time after which a sheet is closed.
    pub session_timeout: Duration,
    pub aggregate_only_traps: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_undo: 50,
            session_timeout: Duration::from_secs(30 * 60),
            aggregate_only_traps: false,
        }
    }
}

impl From<&SessionSettings> for PipelineOptions {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            max_undo: settings.max_undo,
            session_timeout: Duration::from_secs(settings.session_timeout_secs),
            aggregate_only_traps: settings.aggregate_only_traps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Processed,
    /// Handled by the nested worksheet of a viewsheet.
    Delegated { worksheet: SheetId },
}

impl DispatchOutcome {
    pub fn worksheet(&self) -> Option<SheetId> {
        match self {
            Self::Processed => None,
            Self::Delegated { worksheet } => Some(*worksheet),
        }
    }
}

pub struct Pipeline {
    arena: SessionArena,
    ledger: Box<dyn HistoryLedger + Send>,
    catalog: SourceCatalog,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(catalog: SourceCatalog, options: PipelineOptions) -> Self {
        Self::with_ledger(catalog, options, Box::new(MemoryLedger::new()))
    }

    pub fn with_ledger(
        catalog: SourceCatalog,
        options: PipelineOptions,
        ledger: Box<dyn HistoryLedger + Send>,
    ) -> Self {
        Self {
            arena: SessionArena::new(),
            ledger,
            catalog,
            options,
        }
    }

    pub fn arena(&self) -> &SessionArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut SessionArena {
        &mut self.arena
    }

    pub fn ledger(&self) -> &dyn HistoryLedger {
        self.ledger.as_ref()
    }

    pub fn catalog(&self) -> &SourceCatalog {
        &self.catalog
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn history(&self, id: SheetId) -> Result<&HistoryCursor, EngineError> {
        Ok(&self.arena.get(id)?.history)
    }

    /// Display-only name; lookup failures just yield `None`.
    pub fn sheet_name(&self, id: SheetId) -> Option<String> {
        self.arena.sheet_name(id)
    }

    pub fn open_worksheet(&mut self, entry: AssetEntry, owner: &str, parts: WorksheetParts) -> SheetId {
        let id = self.arena.open_worksheet(entry, owner, parts);
        self.init_history(id);
        log::info!("opened worksheet {id} for {owner}");
        id
    }

    pub fn open_viewsheet(
        &mut self,
        entry: AssetEntry,
        worksheet_entry: AssetEntry,
        owner: &str,
        assemblies: BTreeSet<String>,
        worksheet: WorksheetParts,
    ) -> SheetId {
        let id = self
            .arena
            .open_viewsheet(entry, worksheet_entry, owner, assemblies, worksheet);
        let nested = self.arena.get(id).ok().and_then(|s| s.as_viewsheet()).map(|vs| vs.worksheet);
        if let Some(ws) = nested {
            self.init_history(ws);
        }
        self.init_history(id);
        log::info!("opened viewsheet {id} for {owner}");
        id
    }

    /// Take over a sheet inserted with `SessionArena::insert_restored`.
    ///
    /// The ledger holds nothing for the new id, so it is reseeded from the
    /// restored cursor (and the nested worksheet's, for a viewsheet).
    pub fn adopt_restored(&mut self, id: SheetId) -> Result<(), EngineError> {
        let nested = self.arena.get(id)?.as_viewsheet().map(|vs| vs.worksheet);
        for sheet_id in nested.into_iter().chain([id]) {
            let sheet = self.arena.get_mut(sheet_id)?;
            sheet.history.reseed(self.ledger.as_mut(), sheet_id, RESTORED_LABEL)?;
        }
        log::info!("adopted restored sheet {id}");
        Ok(())
    }

    /// Close a sheet (and a viewsheet's worksheet) and drop its history.
    pub fn close_sheet(&mut self, id: SheetId) -> Result<Vec<SheetId>, EngineError> {
        let closed = self.arena.close(id)?;
        for sheet in &closed {
            self.ledger.forget(*sheet);
        }
        Ok(closed)
    }

    /// Close every sheet idle past the session timeout at `now`.
    pub fn close_expired(&mut self, now: DateTime<Utc>) -> Vec<SheetId> {
        let mut closed = Vec::new();
        for id in self.arena.expired(now, self.options.session_timeout) {
            log::info!("closing expired sheet {id}");
            match self.close_sheet(id) {
                Ok(ids) => closed.extend(ids),
                Err(err) => log::warn!("cannot close expired sheet {id}: {err}"),
            }
        }
        closed
    }

    pub fn process_request(
        &mut self,
        ctx: &mut EventContext,
        events: &[Event],
    ) -> Result<CommandBatch, EngineError> {
        self.process_request_at(ctx, events, Utc::now())
    }

    /// Dispatch `events` in order. A failing secondary event is reported and
    /// skipped; any other failure aborts the request.
    pub fn process_request_at(
        &mut self,
        ctx: &mut EventContext,
        events: &[Event],
        now: DateTime<Utc>,
    ) -> Result<CommandBatch, EngineError> {
        let mut commands = CommandBatch::new();
        for event in events {
            match self.dispatch_at(ctx, event, &mut commands, now) {
                Ok(_) => {}
                Err(err) if event.is_secondary() => {
                    let name = self
                        .sheet_name(SheetId::from_raw(event.target))
                        .unwrap_or_else(|| format!("#{}", event.target));
                    log::warn!("secondary {} on {} failed: {}", event.kind(), name, err);
                    commands.push(Command::Error {
                        code: err.code().to_string(),
                        message: err.to_string(),
                        secondary: true,
                    });
                }
                Err(err) => return Err(err),
            }

            if event.close_expired() {
                for id in self.close_expired(now) {
                    commands.push(Command::SheetClosed { id: id.raw() });
                }
            }
        }
        Ok(commands)
    }

    pub fn dispatch(
        &mut self,
        ctx: &mut EventContext,
        event: &Event,
        commands: &mut CommandBatch,
    ) -> Result<DispatchOutcome, EngineError> {
        self.dispatch_at(ctx, event, commands, Utc::now())
    }

    fn dispatch_at(
        &mut self,
        ctx: &mut EventContext,
        event: &Event,
        commands: &mut CommandBatch,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, EngineError> {
        let scope_len = ctx.log_scope().map_or(0, LogScope::len);
        let result = self.dispatch_scoped(ctx, event, commands, now);
        if let Some(scope) = ctx.log_scope_mut() {
            scope.truncate(scope_len);
        }
        result
    }

    fn dispatch_scoped(
        &mut self,
        ctx: &mut EventContext,
        event: &Event,
        commands: &mut CommandBatch,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, EngineError> {
        let target = SheetId::from_raw(event.target);
        let sheet = self.arena.get_mut(target)?;
        sheet.last_access = now;
        if let Some(scope) = ctx.log_scope_mut() {
            scope.push("sheet", sheet.entry.path.clone());
        }

        let nested = if event.is_worksheet_event() {
            sheet.as_viewsheet().map(|vs| vs.worksheet)
        } else {
            None
        };
        let outcome = match nested {
            Some(ws) => {
                let worksheet = self.arena.get_mut(ws)?;
                worksheet.last_access = now;
                if let Some(scope) = ctx.log_scope_mut() {
                    scope.push("worksheet", worksheet.entry.path.clone());
                }
                DispatchOutcome::Delegated { worksheet: ws }
            }
            None => DispatchOutcome::Processed,
        };
        log::debug!("{}dispatch {} to {}", ctx.log_prefix(), event.kind(), target);

        if event.is_worksheet_event() {
            let ws = outcome.worksheet().unwrap_or(target);
            self.run_worksheet_event(ctx, ws, event, commands)?;
        } else {
            self.run_sheet_event(target, &event.body, commands)?;
        }

        if event.is_undoable() {
            self.record_history(target, event.kind(), commands)?;
        }
        if event.requires_reset() {
            commands.push(Command::Reset);
        }
        if event.requires_return() {
            commands.mark_requires_return();
        }
        Ok(outcome)
    }

    fn run_worksheet_event(
        &mut self,
        ctx: &mut EventContext,
        ws_id: SheetId,
        event: &Event,
        commands: &mut CommandBatch,
    ) -> Result<(), EngineError> {
        let sandbox = self.arena.worksheet(ws_id)?.sandbox.id();
        let guard = ctx.bind_sandbox(sandbox);

        if event.is_undoable() {
            // structural edits force query re-planning
            let ws = self.arena.worksheet_mut(ws_id)?;
            if let Some(session) = ws.sandbox.query_session.as_mut() {
                session.invalidate();
            }
        }

        let result = self.process_worksheet(ws_id, &event.body, commands);
        if let Err(err) = &result {
            log::debug!("{}{} failed: {}", guard.log_prefix(), event.kind(), err);
        }
        result
    }

    fn process_worksheet(
        &mut self,
        ws_id: SheetId,
        body: &EventBody,
        commands: &mut CommandBatch,
    ) -> Result<(), EngineError> {
        match body {
            EventBody::SetBinding { assembly, binding } => {
                self.set_binding(ws_id, assembly, binding, commands)
            }
            EventBody::CheckTrap { assembly, binding } => {
                let info = self.check_trap(ws_id, assembly, binding)?;
                commands.push(trap_report(assembly, &info));
                Ok(())
            }
            EventBody::EditFormCell { table, row, col, value, label } => {
                let form = self.form_mut(ws_id, table)?;
                let form_row = form.row_mut(*row)?;
                // check the column even when nothing is written
                form_row.get(*col)?;
                if let Some(value) = value {
                    form_row.set(*col, value.clone())?;
                }
                if let Some(label) = label {
                    form_row.set_label(*col, Some(label.clone()))?;
                }
                commands.push(form_rows(table, form));
                Ok(())
            }
            EventBody::AddFormRow { table, at, base_row } => {
                let form = self.form_mut(ws_id, table)?;
                match at {
                    Some(at) => {
                        form.insert_row(*at, *base_row)?;
                    }
                    None => {
                        form.append_row(*base_row);
                    }
                }
                commands.push(form_rows(table, form));
                Ok(())
            }
            EventBody::DeleteFormRow { table, row } => {
                let form = self.form_mut(ws_id, table)?;
                form.delete_row(*row)?;
                commands.push(form_rows(table, form));
                Ok(())
            }
            EventBody::CommitForm { table } => {
                let form = self.form_mut(ws_id, table)?;
                form.commit();
                commands.push(form_rows(table, form));
                Ok(())
            }
            EventBody::AddAssembly { name } => {
                let ws = self.arena.worksheet_mut(ws_id)?;
                if !ws.assemblies.insert(name.clone()) {
                    return Err(EngineError::DuplicateAssembly { sheet: ws_id, name: name.clone() });
                }
                commands.push(Command::AssemblyAdded { name: name.clone() });
                Ok(())
            }
            EventBody::RenameAssembly { old, new } => {
                let ws = self.arena.worksheet_mut(ws_id)?;
                if !ws.assemblies.contains(old) {
                    return Err(EngineError::UnknownAssembly { sheet: ws_id, name: old.clone() });
                }
                if ws.assemblies.contains(new) {
                    return Err(EngineError::DuplicateAssembly { sheet: ws_id, name: new.clone() });
                }
                ws.assemblies.remove(old);
                ws.assemblies.insert(new.clone());
                if let Some(binding) = ws.bindings.remove(old) {
                    ws.bindings.insert(new.clone(), binding);
                }
                if let Some(form) = ws.forms.remove(old) {
                    ws.forms.insert(new.clone(), form);
                }
                commands.push(Command::AssemblyRenamed { old: old.clone(), new: new.clone() });
                Ok(())
            }
            EventBody::RemoveAssembly { name } => {
                let ws = self.arena.worksheet_mut(ws_id)?;
                if !ws.assemblies.remove(name) {
                    return Err(EngineError::UnknownAssembly { sheet: ws_id, name: name.clone() });
                }
                ws.bindings.remove(name);
                ws.forms.remove(name);
                commands.push(Command::AssemblyRemoved { name: name.clone() });
                Ok(())
            }
            EventBody::Refresh => {
                commands.push(Command::RefreshAssemblies {
                    assemblies: body.assemblies().to_names(),
                });
                Ok(())
            }
            EventBody::Undo | EventBody::Redo | EventBody::Heartbeat | EventBody::CloseSheet => {
                Err(EngineError::Processing {
                    kind: body.kind(),
                    message: "not a worksheet event".to_string(),
                })
            }
        }
    }

    fn run_sheet_event(
        &mut self,
        target: SheetId,
        body: &EventBody,
        commands: &mut CommandBatch,
    ) -> Result<(), EngineError> {
        match body {
            EventBody::Undo | EventBody::Redo => {
                let sheet = self.arena.get_mut(target)?;
                if matches!(body, EventBody::Undo) {
                    sheet.history.step_back(self.ledger.as_mut(), target)?;
                } else {
                    sheet.history.step_forward(self.ledger.as_mut(), target)?;
                }
                commands.push(history_changed(&sheet.history));
                commands.push(Command::RefreshAssemblies {
                    assemblies: body.assemblies().to_names(),
                });
                Ok(())
            }
            EventBody::Heartbeat => Ok(()),
            EventBody::CloseSheet => {
                for id in self.close_sheet(target)? {
                    commands.push(Command::SheetClosed { id: id.raw() });
                }
                Ok(())
            }
            other => Err(EngineError::Processing {
                kind: other.kind(),
                message: "not a sheet-level event".to_string(),
            }),
        }
    }

    fn set_binding(
        &mut self,
        ws_id: SheetId,
        assembly: &str,
        binding: &Binding,
        commands: &mut CommandBatch,
    ) -> Result<(), EngineError> {
        let aggregate_only = self.options.aggregate_only_traps;
        let ws = self.arena.worksheet_mut(ws_id)?;
        if !ws.assemblies.contains(assembly) {
            return Err(EngineError::UnknownAssembly { sheet: ws_id, name: assembly.to_string() });
        }

        let old = ws.bindings.get(assembly);
        let mut detector = TrapDetector::new(&self.catalog, aggregate_only);
        let info = detector.check_trap(old, binding);
        let same_tables = detector.table_count_unchanged(old, Some(binding));

        if info.severity() != TrapSeverity::None {
            log::info!("rebind of '{assembly}' on {ws_id}: {:?}", info.severity());
            commands.push(trap_report(assembly, &info));
        }
        ws.bindings.insert(assembly.to_string(), binding.clone());
        if !same_tables {
            commands.push(Command::RefreshAssemblies {
                assemblies: Some(vec![assembly.to_string()]),
            });
        }
        Ok(())
    }

    fn check_trap(&self, ws_id: SheetId, assembly: &str, binding: &Binding) -> Result<TrapInfo, EngineError> {
        let ws = self.arena.worksheet(ws_id)?;
        if !ws.assemblies.contains(assembly) {
            return Err(EngineError::UnknownAssembly { sheet: ws_id, name: assembly.to_string() });
        }
        let mut detector = TrapDetector::new(&self.catalog, self.options.aggregate_only_traps);
        Ok(detector.check_trap(ws.bindings.get(assembly), binding))
    }

    fn form_mut(&mut self, ws_id: SheetId, table: &str) -> Result<&mut FormTable, EngineError> {
        self.arena
            .worksheet_mut(ws_id)?
            .forms
            .get_mut(table)
            .ok_or_else(|| EngineError::UnknownFormTable { sheet: ws_id, name: table.to_string() })
    }

    fn init_history(&mut self, id: SheetId) {
        let max = self.options.max_undo;
        if let Ok(sheet) = self.arena.get_mut(id) {
            if let Err(err) = sheet.history.record(self.ledger.as_mut(), id, OPEN_LABEL, max) {
                log::warn!("cannot save initial state of {id}: {err}");
            }
        }
    }

    fn record_history(
        &mut self,
        target: SheetId,
        label: &str,
        commands: &mut CommandBatch,
    ) -> Result<(), EngineError> {
        let max = self.options.max_undo;
        let sheet = self.arena.get_mut(target)?;
        sheet.history.record(self.ledger.as_mut(), target, label, max)?;
        commands.push(history_changed(&sheet.history));
        Ok(())
    }
}

fn history_changed(history: &HistoryCursor) -> Command {
    Command::HistoryChanged {
        undoable: history.is_undoable(),
        redoable: history.is_redoable(),
        undo_name: history.undo_name.clone(),
        redo_name: history.redo_name.clone(),
    }
}

fn form_rows(table: &str, form: &FormTable) -> Command {
    Command::FormRowsChanged {
        table: table.to_string(),
        changed: form.changed_rows(),
        added: form.added_rows(),
        deleted: form.deleted_rows(),
    }
}

fn trap_report(assembly: &str, info: &TrapInfo) -> Command {
    Command::TrapReport {
        assembly: assembly.to_string(),
        severity: info.severity(),
        dropped_tables: info.dropped_tables().into_iter().collect(),
        added_tables: info.added_tables().into_iter().collect(),
        dropped_aggregates: info.dropped_aggregates().iter().map(ToString::to_string).collect(),
        added_aggregates: info.added_aggregates().iter().map(ToString::to_string).collect(),
    }
}
