//! Per-request context passed explicitly through dispatch.
//!
//! Carries the diagnostic log scope and the active query sandbox slot.
//! The sandbox slot is only ever filled through `SandboxGuard`, which empties
//! it again when dropped, so a failed event cannot leave a stale sandbox for
//! the next one.

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::runtime::SandboxId;

/// Key/value tags attached to log lines emitted while an event runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogScope {
    tags: Vec<(&'static str, String)>,
}

impl LogScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: &'static str, value: impl Into<String>) {
        self.tags.push((key, value.into()));
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Drop tags pushed after the scope had `len` entries.
    pub fn truncate(&mut self, len: usize) {
        self.tags.truncate(len);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for LogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (k, v)) in self.tags.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Default)]
pub struct EventContext {
    log_scope: Option<LogScope>,
    sandbox: Option<SandboxId>,
    /// Most recently bound sandbox, kept after release for diagnostics.
    last_bound: Option<SandboxId>,
}

impl EventContext {
    /// Context without scoped logging.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_scope() -> Self {
        Self {
            log_scope: Some(LogScope::new()),
            ..Self::default()
        }
    }

    /// `None` when the caller does not support scoped log context.
    pub fn log_scope_mut(&mut self) -> Option<&mut LogScope> {
        self.log_scope.as_mut()
    }

    pub fn log_scope(&self) -> Option<&LogScope> {
        self.log_scope.as_ref()
    }

    /// Scope prefix for log lines; empty without a scope.
    pub fn log_prefix(&self) -> String {
        match &self.log_scope {
            Some(scope) if !scope.is_empty() => format!("{scope} "),
            _ => String::new(),
        }
    }

    pub fn active_sandbox(&self) -> Option<SandboxId> {
        self.sandbox
    }

    pub fn last_bound_sandbox(&self) -> Option<SandboxId> {
        self.last_bound
    }

    /// Clear the slot, then bind `id` until the guard is dropped.
    pub fn bind_sandbox(&mut self, id: SandboxId) -> SandboxGuard<'_> {
        if let Some(stale) = self.sandbox.take() {
            log::debug!("clearing stale sandbox {} before binding {}", stale.raw(), id.raw());
        }
        self.sandbox = Some(id);
        self.last_bound = Some(id);
        SandboxGuard { ctx: self }
    }

    /// Run `f` with `id` bound as the active sandbox.
    pub fn with_sandbox<T>(&mut self, id: SandboxId, f: impl FnOnce(&mut EventContext) -> T) -> T {
        let mut guard = self.bind_sandbox(id);
        f(&mut *guard)
    }
}

/// Holds the sandbox slot for the duration of one event.
pub struct SandboxGuard<'a> {
    ctx: &'a mut EventContext,
}

impl Deref for SandboxGuard<'_> {
    type Target = EventContext;

    fn deref(&self) -> &EventContext {
        self.ctx
    }
}

impl DerefMut for SandboxGuard<'_> {
    fn deref_mut(&mut self) -> &mut EventContext {
        self.ctx
    }
}

impl Drop for SandboxGuard<'_> {
    fn drop(&mut self) {
        self.ctx.sandbox = None;
    }
}
