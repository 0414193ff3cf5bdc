//! Normalized domain rows, in the shape the store persists them.
//!
//! Location ids are `None` while a row is still a draft; the commit step
//! fills them in through [`WriteOp::assign_location`].

use chrono::NaiveDate;
use estate_parser::{BagType, TransactionKind};
use uuid::Uuid;

use crate::locations::Location;
use crate::recompute::AggregateKey;

/// Measurement columns replaced wholesale on a processing upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessingMeasurements {
    pub crop_today_kg: Option<f64>,
    pub ripe_today_kg: Option<f64>,
    pub green_today_kg: Option<f64>,
    pub float_today_kg: Option<f64>,
    pub wet_parchment_kg: Option<f64>,
    pub dry_parchment_kg: Option<f64>,
    pub dry_cherry_kg: Option<f64>,
    pub dry_parchment_bags: Option<f64>,
    pub dry_cherry_bags: Option<f64>,
}

/// Natural key: (tenant, location, coffee type, date).
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRecord {
    pub location_id: Option<Uuid>,
    pub coffee_type: String,
    pub process_date: NaiveDate,
    pub measurements: ProcessingMeasurements,
    pub notes: Option<String>,
}

/// Natural key: (tenant, location, date).
#[derive(Debug, Clone, PartialEq)]
pub struct PepperRecord {
    pub location_id: Option<Uuid>,
    pub record_date: NaiveDate,
    pub kg_picked: f64,
    pub green_pepper_kg: f64,
    pub green_pepper_percent: f64,
    pub dry_pepper_kg: f64,
    pub dry_pepper_percent: f64,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RainfallRecord {
    pub record_date: NaiveDate,
    pub inches: f64,
    pub millimeters: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub location_id: Option<Uuid>,
    pub estate: Option<String>,
    pub dispatch_date: NaiveDate,
    pub coffee_type: String,
    pub bag_type: BagType,
    pub bags_dispatched: f64,
    pub kgs_received: Option<f64>,
    pub destination: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaleRecord {
    pub location_id: Option<Uuid>,
    pub sale_date: NaiveDate,
    pub coffee_type: String,
    pub bag_type: BagType,
    pub buyer: Option<String>,
    pub bags_sold: f64,
    pub kgs_sold: f64,
    pub bag_weight_kg: f64,
    pub price_per_bag: f64,
    pub price_per_kg: f64,
    pub revenue: f64,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InventoryTransaction {
    pub location_id: Option<Uuid>,
    pub item_type: String,
    pub transaction_date: NaiveDate,
    pub kind: TransactionKind,
    pub quantity: f64,
    pub price: f64,
    pub total_cost: f64,
    pub unit: Option<String>,
    pub notes: Option<String>,
}

/// Stock-balance row, keyed by (tenant, item type, location).
#[derive(Debug, Clone, PartialEq)]
pub struct StockLevel {
    pub location_id: Option<Uuid>,
    pub item_type: String,
    pub quantity: f64,
    pub unit: Option<String>,
    pub unit_price: Option<f64>,
    pub as_of: Option<NaiveDate>,
    pub notes: Option<String>,
}

impl StockLevel {
    /// The transaction that brings recorded history from `on_hand` to this
    /// row's quantity: a restock for a shortfall, a depletion for a surplus.
    /// A first import of a positive balance becomes the "Opening balance".
    pub fn balancing_transaction(
        &self,
        on_hand: f64,
        today: NaiveDate,
    ) -> Option<InventoryTransaction> {
        let delta = self.quantity - on_hand;
        if delta.abs() < f64::EPSILON {
            return None;
        }
        let (kind, quantity) = if delta > 0.0 {
            (TransactionKind::Restock, delta)
        } else {
            (TransactionKind::Deplete, -delta)
        };
        let price = self.unit_price.unwrap_or(0.0);
        let default_note = if on_hand == 0.0 {
            "Opening balance"
        } else {
            "Balance adjustment"
        };
        Some(InventoryTransaction {
            location_id: self.location_id,
            item_type: self.item_type.clone(),
            transaction_date: self.as_of.unwrap_or(today),
            kind,
            quantity,
            price,
            total_cost: quantity * price,
            unit: self.unit.clone(),
            notes: Some(
                self.notes
                    .clone()
                    .unwrap_or_else(|| default_note.to_string()),
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaborRecord {
    pub location_id: Option<Uuid>,
    pub work_date: NaiveDate,
    pub activity: Option<String>,
    pub hf_laborers: f64,
    pub hf_cost_per_laborer: f64,
    pub outside_laborers: f64,
    pub outside_cost_per_laborer: f64,
    pub total_cost: f64,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpenseRecord {
    pub location_id: Option<Uuid>,
    pub expense_date: NaiveDate,
    pub category: Option<String>,
    pub description: Option<String>,
    pub amount: f64,
    pub notes: Option<String>,
}

/// One row-level write handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Processing(ProcessingRecord),
    Pepper(PepperRecord),
    Rainfall(RainfallRecord),
    Dispatch(DispatchRecord),
    Sale(SaleRecord),
    Transaction(InventoryTransaction),
    StockLevel(StockLevel),
    Labor(LaborRecord),
    Expense(ExpenseRecord),
}

impl WriteOp {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Processing(_) => "processing",
            WriteOp::Pepper(_) => "pepper",
            WriteOp::Rainfall(_) => "rainfall",
            WriteOp::Dispatch(_) => "dispatch",
            WriteOp::Sale(_) => "sale",
            WriteOp::Transaction(_) => "transaction",
            WriteOp::StockLevel(_) => "stock_level",
            WriteOp::Labor(_) => "labor",
            WriteOp::Expense(_) => "expense",
        }
    }

    pub fn location_id(&self) -> Option<Uuid> {
        match self {
            WriteOp::Processing(record) => record.location_id,
            WriteOp::Pepper(record) => record.location_id,
            WriteOp::Rainfall(_) => None,
            WriteOp::Dispatch(record) => record.location_id,
            WriteOp::Sale(record) => record.location_id,
            WriteOp::Transaction(record) => record.location_id,
            WriteOp::StockLevel(record) => record.location_id,
            WriteOp::Labor(record) => record.location_id,
            WriteOp::Expense(record) => record.location_id,
        }
    }

    pub fn assign_location(&mut self, location: &Location) {
        let id = Some(location.id);
        match self {
            WriteOp::Processing(record) => record.location_id = id,
            WriteOp::Pepper(record) => record.location_id = id,
            WriteOp::Rainfall(_) => {}
            WriteOp::Dispatch(record) => {
                record.location_id = id;
                record.estate = Some(location.display_label().to_string());
            }
            WriteOp::Sale(record) => record.location_id = id,
            WriteOp::Transaction(record) => record.location_id = id,
            WriteOp::StockLevel(record) => record.location_id = id,
            WriteOp::Labor(record) => record.location_id = id,
            WriteOp::Expense(record) => record.location_id = id,
        }
    }

    /// The derived aggregate this write invalidates, if any.
    pub fn aggregate_key(&self) -> Option<AggregateKey> {
        match self {
            WriteOp::Processing(record) => record.location_id.map(|location_id| {
                AggregateKey::ProcessingTotals {
                    location_id,
                    coffee_type: record.coffee_type.clone(),
                }
            }),
            WriteOp::Transaction(record) => Some(AggregateKey::StockBalance {
                item_type: record.item_type.clone(),
                location_id: record.location_id,
            }),
            WriteOp::StockLevel(record) => Some(AggregateKey::StockBalance {
                item_type: record.item_type.clone(),
                location_id: record.location_id,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(quantity: f64) -> StockLevel {
        StockLevel {
            location_id: None,
            item_type: "Potash".into(),
            quantity,
            unit: Some("kg".into()),
            unit_price: Some(10.0),
            as_of: None,
            notes: None,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn first_positive_balance_is_an_opening_restock() {
        let txn = level(40.0).balancing_transaction(0.0, today()).unwrap();
        assert_eq!(txn.kind, TransactionKind::Restock);
        assert_eq!(txn.quantity, 40.0);
        assert_eq!(txn.total_cost, 400.0);
        assert_eq!(txn.notes.as_deref(), Some("Opening balance"));
    }

    #[test]
    fn later_balances_record_only_the_difference() {
        let up = level(60.0).balancing_transaction(40.0, today()).unwrap();
        assert_eq!((up.kind, up.quantity), (TransactionKind::Restock, 20.0));
        assert_eq!(up.notes.as_deref(), Some("Balance adjustment"));

        let down = level(25.0).balancing_transaction(40.0, today()).unwrap();
        assert_eq!((down.kind, down.quantity), (TransactionKind::Deplete, 15.0));

        assert!(level(40.0).balancing_transaction(40.0, today()).is_none());
        assert!(level(0.0).balancing_transaction(0.0, today()).is_none());
    }
}
