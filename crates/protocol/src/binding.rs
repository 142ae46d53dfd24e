//! Binding model carried by rebind events.
//!
//! These are opaque, typed values as far as the session layer is concerned:
//! the engine only reads them to resolve which source tables and aggregates a
//! binding touches.

use serde::{Deserialize, Serialize};

/// Reference to a column of the bound data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRef {
    /// Underlying column name.
    pub attribute: String,
    /// Optional table qualifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    /// Display alias. Never significant for comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl DataRef {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            entity: None,
            alias: None,
        }
    }

    pub fn of(entity: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            entity: Some(entity.into()),
            alias: None,
        }
    }

    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// The name shown to users (alias if present).
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.attribute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFormula {
    Sum,
    Count,
    DistinctCount,
    Average,
    Min,
    Max,
    First,
    Last,
}

impl AggregateFormula {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::DistinctCount => "distinct_count",
            Self::Average => "average",
            Self::Min => "min",
            Self::Max => "max",
            Self::First => "first",
            Self::Last => "last",
        }
    }

    /// Formulas that take a second column (e.g. `first(x, by y)`).
    pub fn takes_secondary(&self) -> bool {
        matches!(self, Self::First | Self::Last)
    }
}

impl std::fmt::Display for AggregateFormula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An aggregate applied to a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    pub field: DataRef,
    pub formula: AggregateFormula,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<DataRef>,
}

impl AggregateRef {
    pub fn new(formula: AggregateFormula, field: DataRef) -> Self {
        Self {
            field,
            formula,
            secondary: None,
        }
    }

    pub fn with_secondary(mut self, secondary: DataRef) -> Self {
        self.secondary = Some(secondary);
        self
    }
}

/// Data binding of one assembly.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Binding {
    /// Bound table name. `None` = unbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub groups: Vec<DataRef>,
    #[serde(default)]
    pub aggregates: Vec<AggregateRef>,
    #[serde(default)]
    pub details: Vec<DataRef>,
}

impl Binding {
    pub fn unbound() -> Self {
        Self::default()
    }

    pub fn to_table(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            ..Self::default()
        }
    }

    pub fn group(mut self, field: DataRef) -> Self {
        self.groups.push(field);
        self
    }

    pub fn aggregate(mut self, agg: AggregateRef) -> Self {
        self.aggregates.push(agg);
        self
    }

    pub fn detail(mut self, field: DataRef) -> Self {
        self.details.push(field);
        self
    }

    pub fn is_bound(&self) -> bool {
        self.table.is_some()
    }
}

/// A single cell value of an editable form table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum FormValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FormValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FormValue::Null)
    }
}

impl From<&str> for FormValue {
    fn from(s: &str) -> Self {
        FormValue::Text(s.to_string())
    }
}

impl From<f64> for FormValue {
    fn from(n: f64) -> Self {
        FormValue::Number(n)
    }
}

impl From<bool> for FormValue {
    fn from(b: bool) -> Self {
        FormValue::Bool(b)
    }
}
