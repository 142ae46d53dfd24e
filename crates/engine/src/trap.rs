//! Aggregation trap detection.
//!
//! A rebind is a "trap" when it silently changes the aggregation scope of an
//! assembly. Bindings are compared by the source tables their attributes
//! resolve to and by the aggregates they compute, never by raw attribute
//! lists, so reordering or re-aliasing fields is not a change.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use sheetsession_protocol::{AggregateFormula, Binding, DataRef, TrapSeverity};

/// Column → base source tables, per bound table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: BTreeMap<String, BTreeSet<String>>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Column whose values come from the given base tables.
    pub fn column<'a>(mut self, name: &str, sources: impl IntoIterator<Item = &'a str>) -> Self {
        self.columns
            .insert(name.to_string(), sources.into_iter().map(str::to_string).collect());
        self
    }

    pub fn sources(&self, column: &str) -> Option<&BTreeSet<String>> {
        self.columns.get(column)
    }
}

/// Tables known to the session, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCatalog {
    pub tables: BTreeMap<String, TableSchema>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, schema: TableSchema) -> Self {
        self.tables.insert(name.to_string(), schema);
        self
    }

    /// A plain table where every column sources from the table itself.
    pub fn with_base_table(self, name: &str, columns: &[&str]) -> Self {
        let schema = columns
            .iter()
            .fold(TableSchema::new(), |schema, col| schema.column(col, [name]));
        self.with_table(name, schema)
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }
}

/// Identity of an aggregate for comparison. Aliases are not part of it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub formula: AggregateFormula,
    pub table: Option<String>,
    pub attribute: String,
}

impl std::fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}({}.{})", self.formula, table, self.attribute),
            None => write!(f, "{}({})", self.formula, self.attribute),
        }
    }
}

/// Table and aggregate usage before and after a rebind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrapInfo {
    pub tables: BTreeSet<String>,
    pub aggregates: BTreeSet<AggregateKey>,
    pub old_tables: BTreeSet<String>,
    pub old_aggregates: BTreeSet<AggregateKey>,
    /// Whether an old binding took part in the comparison.
    pub has_old: bool,
}

impl TrapInfo {
    pub fn dropped_tables(&self) -> BTreeSet<String> {
        self.old_tables.difference(&self.tables).cloned().collect()
    }

    pub fn added_tables(&self) -> BTreeSet<String> {
        self.tables.difference(&self.old_tables).cloned().collect()
    }

    pub fn dropped_aggregates(&self) -> BTreeSet<AggregateKey> {
        self.old_aggregates.difference(&self.aggregates).cloned().collect()
    }

    pub fn added_aggregates(&self) -> BTreeSet<AggregateKey> {
        self.aggregates.difference(&self.old_aggregates).cloned().collect()
    }

    pub fn is_structurally_equal(&self) -> bool {
        self.tables == self.old_tables && self.aggregates == self.old_aggregates
    }

    /// Anything that fed the old binding and is gone now is a trap;
    /// additions alone only warrant a notice.
    pub fn severity(&self) -> TrapSeverity {
        if !self.has_old || self.is_structurally_equal() {
            return TrapSeverity::None;
        }
        if !self.dropped_tables().is_empty() || !self.dropped_aggregates().is_empty() {
            TrapSeverity::Trap
        } else {
            TrapSeverity::Notice
        }
    }
}

/// Resolution state shared by every pass of a detector.
///
/// Only one table is active at a time; the detector swaps it before each
/// pass over a binding.
#[derive(Debug)]
pub struct ResolutionContext<'a> {
    catalog: &'a SourceCatalog,
    active: Option<String>,
}

impl<'a> ResolutionContext<'a> {
    pub fn new(catalog: &'a SourceCatalog) -> Self {
        Self { catalog, active: None }
    }

    pub fn set_active(&mut self, table: Option<&str>) {
        self.active = table.map(str::to_string);
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Base tables an attribute comes from. Empty when it cannot be resolved.
    pub fn resolve(&self, field: &DataRef) -> BTreeSet<String> {
        let qualified = field
            .entity
            .as_deref()
            .and_then(|entity| self.catalog.table(entity))
            .and_then(|schema| schema.sources(&field.attribute));
        let sources = qualified.or_else(|| {
            self.active
                .as_deref()
                .and_then(|table| self.catalog.table(table))
                .and_then(|schema| schema.sources(&field.attribute))
        });
        match sources {
            Some(tables) => tables.clone(),
            None => {
                log::trace!(
                    "unresolved attribute '{}' (active table {:?})",
                    field.attribute,
                    self.active
                );
                BTreeSet::new()
            }
        }
    }
}

pub struct TrapDetector<'a> {
    ctx: ResolutionContext<'a>,
    aggregate_only: bool,
}

impl<'a> TrapDetector<'a> {
    pub fn new(catalog: &'a SourceCatalog, aggregate_only: bool) -> Self {
        Self {
            ctx: ResolutionContext::new(catalog),
            aggregate_only,
        }
    }

    pub fn aggregate_only(&self) -> bool {
        self.aggregate_only
    }

    pub fn check_trap(&mut self, old: Option<&Binding>, new: &Binding) -> TrapInfo {
        let (tables, aggregates) = self.resolve_binding(new);
        let mut info = TrapInfo {
            tables,
            aggregates,
            ..TrapInfo::default()
        };
        if let Some(old) = old {
            let (old_tables, old_aggregates) = self.resolve_binding(old);
            info.old_tables = old_tables;
            info.old_aggregates = old_aggregates;
            info.has_old = true;
        }
        info
    }

    /// Cheap pre-check before a refresh: `true` when the rebind keeps the
    /// same bound table and the same number of distinct source tables.
    /// An unbound side on either end always answers `false`.
    pub fn table_count_unchanged(&mut self, old: Option<&Binding>, new: Option<&Binding>) -> bool {
        let old_name = old.and_then(|b| b.table.as_deref());
        let new_name = new.and_then(|b| b.table.as_deref());
        match (old_name, new_name) {
            (Some(old_name), Some(new_name)) if old_name == new_name => {
                self.table_count(old) == self.table_count(new)
            }
            _ => false,
        }
    }

    /// Distinct source tables a binding reads from.
    pub fn table_count(&mut self, binding: Option<&Binding>) -> usize {
        binding.map_or(0, |b| self.resolve_binding(b).0.len())
    }

    fn resolve_binding(&mut self, binding: &Binding) -> (BTreeSet<String>, BTreeSet<AggregateKey>) {
        self.ctx.set_active(binding.table.as_deref());

        let mut tables = BTreeSet::new();
        let mut aggregates = BTreeSet::new();

        if !self.aggregate_only {
            for field in binding.groups.iter().chain(&binding.details) {
                tables.extend(self.ctx.resolve(field));
            }
        }

        for agg in &binding.aggregates {
            let sources = self.ctx.resolve(&agg.field);
            // Only a single source pins the aggregate to a table.
            let table = if sources.len() == 1 { sources.iter().next().cloned() } else { None };
            aggregates.insert(AggregateKey {
                formula: agg.formula,
                table,
                attribute: agg.field.attribute.clone(),
            });
            tables.extend(sources);
            if let Some(secondary) = &agg.secondary {
                tables.extend(self.ctx.resolve(secondary));
            }
        }

        (tables, aggregates)
    }
}
