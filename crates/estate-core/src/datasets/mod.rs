//! The nine importable datasets and the per-dataset row schemas that turn a
//! raw tabular record into a normalized [`WriteOp`] draft.

mod schemas;

use std::fmt;
use std::str::FromStr;

use estate_parser::RawRow;
use serde::{Deserialize, Serialize};

use crate::access::Module;
use crate::records::WriteOp;

pub use schemas::{
    DispatchSchema, ExpensesSchema, InventorySchema, LaborSchema, PepperSchema,
    ProcessingSchema, RainfallSchema, SalesSchema, TransactionsSchema, DEFAULT_BAG_WEIGHT_KG,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Processing,
    Pepper,
    Rainfall,
    Dispatch,
    Sales,
    Transactions,
    Inventory,
    Labor,
    Expenses,
}

impl Dataset {
    pub const ALL: [Dataset; 9] = [
        Dataset::Processing,
        Dataset::Pepper,
        Dataset::Rainfall,
        Dataset::Dispatch,
        Dataset::Sales,
        Dataset::Transactions,
        Dataset::Inventory,
        Dataset::Labor,
        Dataset::Expenses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::Processing => "processing",
            Dataset::Pepper => "pepper",
            Dataset::Rainfall => "rainfall",
            Dataset::Dispatch => "dispatch",
            Dataset::Sales => "sales",
            Dataset::Transactions => "transactions",
            Dataset::Inventory => "inventory",
            Dataset::Labor => "labor",
            Dataset::Expenses => "expenses",
        }
    }

    pub fn module(&self) -> Module {
        match self {
            Dataset::Processing | Dataset::Pepper => Module::Processing,
            Dataset::Rainfall => Module::Rainfall,
            Dataset::Dispatch => Module::Dispatch,
            Dataset::Sales => Module::Sales,
            Dataset::Transactions | Dataset::Inventory => Module::Inventory,
            Dataset::Labor | Dataset::Expenses => Module::Accounts,
        }
    }

    pub fn schema(&self) -> &'static dyn RowSchema {
        match self {
            Dataset::Processing => &ProcessingSchema,
            Dataset::Pepper => &PepperSchema,
            Dataset::Rainfall => &RainfallSchema,
            Dataset::Dispatch => &DispatchSchema,
            Dataset::Sales => &SalesSchema,
            Dataset::Transactions => &TransactionsSchema,
            Dataset::Inventory => &InventorySchema,
            Dataset::Labor => &LaborSchema,
            Dataset::Expenses => &ExpensesSchema,
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Dataset::ALL
            .into_iter()
            .find(|dataset| dataset.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unsupported dataset '{value}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row: usize,
    pub message: String,
}

impl RowError {
    pub fn new(row: usize, message: impl Into<String>) -> Self {
        Self {
            row,
            message: message.into(),
        }
    }
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}", self.row, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<RowError>,
    pub skipped: usize,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A validated row that still needs its location label resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RowDraft {
    pub location_label: Option<String>,
    pub op: WriteOp,
}

impl RowDraft {
    fn new(location_label: Option<String>, op: WriteOp) -> Self {
        Self { location_label, op }
    }
}

/// Dataset-specific validation and construction. Implementations are pure:
/// they never touch the store and never mutate the row.
pub trait RowSchema: Send + Sync {
    fn dataset(&self) -> Dataset;
    fn draft(&self, row: &RawRow) -> Result<RowDraft, String>;
}

pub fn validate_rows(dataset: Dataset, rows: &[RawRow]) -> ValidationReport {
    let schema = dataset.schema();
    let mut report = ValidationReport::default();

    for row in rows {
        if let Err(message) = schema.draft(row) {
            report.errors.push(RowError::new(row.row_number, message));
            report.skipped += 1;
        }
    }

    report
}
