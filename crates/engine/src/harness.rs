//! Test harness for session pipelines.
//!
//! `SessionHarness` wraps a `Pipeline` seeded with a small sales catalog and
//! keeps one `EventContext` (with log scope) across sends, the way a
//! request loop would.

use std::collections::{BTreeMap, BTreeSet};

use sheetsession_protocol::{
    AggregateFormula, AggregateRef, Binding, Command, DataRef, Event, EventBody, FormValue,
};

use crate::context::EventContext;
use crate::error::EngineError;
use crate::form_row::FormTable;
use crate::pipeline::{DispatchOutcome, Pipeline, PipelineOptions};
use crate::runtime::{AssetEntry, SheetId, WorksheetParts};
use crate::trap::{SourceCatalog, TableSchema};

pub const OWNER: &str = "alice";

/// Catalog with two base tables and a joined one.
pub fn sales_catalog() -> SourceCatalog {
    SourceCatalog::new()
        .with_base_table("orders", &["region", "amount", "customer_id"])
        .with_base_table("customers", &["customer_id", "segment"])
        .with_table(
            "orders_customers",
            TableSchema::new()
                .column("region", ["orders"])
                .column("amount", ["orders"])
                .column("segment", ["customers"])
                .column("customer_id", ["orders", "customers"]),
        )
}

/// `sum(amount)` by region over the joined table.
pub fn chart_binding() -> Binding {
    Binding::to_table("orders_customers")
        .group(DataRef::new("region"))
        .aggregate(AggregateRef::new(AggregateFormula::Sum, DataRef::new("amount")))
}

/// Worksheet with a bound `chart`, an unbound `orders` assembly and an
/// `entry` form of two committed rows.
pub fn sales_parts() -> WorksheetParts {
    let mut bindings = BTreeMap::new();
    bindings.insert("chart".to_string(), chart_binding());

    let mut forms = BTreeMap::new();
    forms.insert(
        "entry".to_string(),
        FormTable::from_rows(
            2,
            vec![
                vec![FormValue::from("north"), FormValue::from(10.0)],
                vec![FormValue::from("south"), FormValue::from(20.0)],
            ],
        ),
    );

    WorksheetParts {
        assemblies: ["chart", "orders", "entry"].into_iter().map(String::from).collect(),
        bindings,
        forms,
        join: None,
    }
}

pub struct SessionHarness {
    pub pipeline: Pipeline,
    pub ctx: EventContext,
}

impl SessionHarness {
    pub fn new() -> Self {
        Self::with_options(PipelineOptions::default())
    }

    pub fn with_options(options: PipelineOptions) -> Self {
        Self {
            pipeline: Pipeline::new(sales_catalog(), options),
            ctx: EventContext::with_log_scope(),
        }
    }

    pub fn open_worksheet(&mut self) -> SheetId {
        self.pipeline
            .open_worksheet(AssetEntry::worksheet("ws/sales"), OWNER, sales_parts())
    }

    /// Viewsheet over a fresh sales worksheet. Returns (viewsheet, worksheet).
    pub fn open_viewsheet(&mut self) -> (SheetId, SheetId) {
        let vs = self.pipeline.open_viewsheet(
            AssetEntry::viewsheet("dash/sales"),
            AssetEntry::worksheet("ws/sales"),
            OWNER,
            BTreeSet::from(["summary".to_string()]),
            sales_parts(),
        );
        let ws = self
            .pipeline
            .arena()
            .get(vs)
            .ok()
            .and_then(|s| s.as_viewsheet())
            .map(|v| v.worksheet)
            .unwrap_or(vs);
        (vs, ws)
    }

    /// Dispatch one event and return the commands it produced.
    pub fn send(&mut self, target: SheetId, body: EventBody) -> Result<Vec<Command>, EngineError> {
        self.send_event(Event::new(target.raw(), body)).map(|(_, commands)| commands)
    }

    pub fn send_event(&mut self, event: Event) -> Result<(DispatchOutcome, Vec<Command>), EngineError> {
        let mut batch = sheetsession_protocol::CommandBatch::new();
        let outcome = self.pipeline.dispatch(&mut self.ctx, &event, &mut batch)?;
        Ok((outcome, batch.flush()))
    }

    pub fn form(&self, ws: SheetId, table: &str) -> &FormTable {
        &self.pipeline.arena().worksheet(ws).unwrap().forms[table]
    }

    pub fn invalidations(&self, ws: SheetId) -> u64 {
        self.pipeline
            .arena()
            .worksheet(ws)
            .unwrap()
            .sandbox
            .query_session
            .as_ref()
            .map_or(0, |s| s.invalidations)
    }
}
