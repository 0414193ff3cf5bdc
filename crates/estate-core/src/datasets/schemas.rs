use chrono::NaiveDate;
use estate_parser::{
    normalize_bag_type, normalize_coffee_type, normalize_transaction_type, parse_date,
    parse_number, RawRow,
};

use super::{Dataset, RowDraft, RowSchema};
use crate::records::{
    DispatchRecord, ExpenseRecord, InventoryTransaction, LaborRecord, PepperRecord,
    ProcessingMeasurements, ProcessingRecord, RainfallRecord, SaleRecord, StockLevel, WriteOp,
};

pub const DEFAULT_BAG_WEIGHT_KG: f64 = 50.0;
const MM_PER_INCH: f64 = 25.4;

const LOCATION: &[&str] = &["location", "location_id", "location_name", "location_code", "block"];
const DISPATCH_LOCATION: &[&str] = &[
    "location",
    "location_id",
    "location_name",
    "location_code",
    "block",
    "estate",
];
const COFFEE_TYPE: &[&str] = &["coffee_type", "coffee", "variety", "coffee_variety"];
const BAG_TYPE: &[&str] = &["bag_type", "bag", "type_of_bag"];
const NOTES: &[&str] = &["notes", "note", "remarks", "comments"];
const ITEM_TYPE: &[&str] = &["item_type", "item", "item_name", "product"];
const UNIT: &[&str] = &["unit", "uom", "units"];

fn text(row: &RawRow, aliases: &[&str]) -> Option<String> {
    let value = row.field(aliases);
    (!value.is_empty()).then(|| value.to_string())
}

fn required_text(row: &RawRow, aliases: &[&str], label: &str) -> Result<String, String> {
    text(row, aliases).ok_or_else(|| format!("Missing {label}"))
}

fn number(row: &RawRow, aliases: &[&str]) -> Option<f64> {
    parse_number(row.field(aliases))
}

fn required_number(row: &RawRow, aliases: &[&str], label: &str) -> Result<f64, String> {
    number(row, aliases).ok_or_else(|| format!("Missing or invalid {label}"))
}

fn date(row: &RawRow, aliases: &[&str], label: &str) -> Result<Option<NaiveDate>, String> {
    let raw = row.field(aliases);
    if raw.is_empty() {
        return Ok(None);
    }
    parse_date(raw)
        .map(Some)
        .ok_or_else(|| format!("Invalid {label} '{raw}'"))
}

fn required_date(row: &RawRow, aliases: &[&str], label: &str) -> Result<NaiveDate, String> {
    date(row, aliases, label)?.ok_or_else(|| format!("Missing {label}"))
}

fn required_coffee_type(row: &RawRow) -> Result<String, String> {
    normalize_coffee_type(row.field(COFFEE_TYPE)).ok_or_else(|| "Missing coffee type".to_string())
}

/// `part / whole * 100`, or `0` when the whole is zero.
pub(crate) fn percentage(part: f64, whole: f64) -> f64 {
    if whole == 0.0 {
        0.0
    } else {
        part / whole * 100.0
    }
}

pub struct ProcessingSchema;

impl RowSchema for ProcessingSchema {
    fn dataset(&self) -> Dataset {
        Dataset::Processing
    }

    fn draft(&self, row: &RawRow) -> Result<RowDraft, String> {
        let process_date =
            required_date(row, &["date", "process_date", "processing_date"], "date")?;
        let location = required_text(row, LOCATION, "location")?;
        let coffee_type = required_coffee_type(row)?;

        let measurements = ProcessingMeasurements {
            crop_today_kg: number(row, &["crop_today", "crop_today_kg", "crop"]),
            ripe_today_kg: number(row, &["ripe_today", "ripe_today_kg", "ripe"]),
            green_today_kg: number(row, &["green_today", "green_today_kg", "green"]),
            float_today_kg: number(row, &["float_today", "float_today_kg", "float"]),
            wet_parchment_kg: number(row, &["wet_parchment", "wet_parchment_kg", "wet_p"]),
            dry_parchment_kg: number(
                row,
                &["dry_parchment", "dry_parchment_kg", "dry_p", "dry_p_kg"],
            ),
            dry_cherry_kg: number(row, &["dry_cherry", "dry_cherry_kg"]),
            dry_parchment_bags: number(row, &["dry_p_bags", "dry_parchment_bags"]),
            dry_cherry_bags: number(row, &["dry_cherry_bags"]),
        };

        Ok(RowDraft::new(
            Some(location),
            WriteOp::Processing(ProcessingRecord {
                location_id: None,
                coffee_type,
                process_date,
                measurements,
                notes: text(row, NOTES),
            }),
        ))
    }
}

pub struct PepperSchema;

impl RowSchema for PepperSchema {
    fn dataset(&self) -> Dataset {
        Dataset::Pepper
    }

    fn draft(&self, row: &RawRow) -> Result<RowDraft, String> {
        let record_date = required_date(row, &["date", "record_date", "picking_date"], "date")?;
        let location = required_text(row, LOCATION, "location")?;

        let kg_picked =
            number(row, &["kg_picked", "picked_kg", "kgs_picked", "picked"]).unwrap_or(0.0);
        let green_pepper_kg =
            number(row, &["green_pepper", "green_pepper_kg", "green_kg"]).unwrap_or(0.0);
        let dry_pepper_kg = number(row, &["dry_pepper", "dry_pepper_kg", "dry_kg"]).unwrap_or(0.0);
        let green_pepper_percent = number(
            row,
            &["green_pepper_percent", "green_pepper_pct", "green_percent"],
        )
        .unwrap_or_else(|| percentage(green_pepper_kg, kg_picked));
        let dry_pepper_percent =
            number(row, &["dry_pepper_percent", "dry_pepper_pct", "dry_percent"])
                .unwrap_or_else(|| percentage(dry_pepper_kg, green_pepper_kg));

        Ok(RowDraft::new(
            Some(location),
            WriteOp::Pepper(PepperRecord {
                location_id: None,
                record_date,
                kg_picked,
                green_pepper_kg,
                green_pepper_percent,
                dry_pepper_kg,
                dry_pepper_percent,
                notes: text(row, NOTES),
            }),
        ))
    }
}

pub struct RainfallSchema;

impl RowSchema for RainfallSchema {
    fn dataset(&self) -> Dataset {
        Dataset::Rainfall
    }

    fn draft(&self, row: &RawRow) -> Result<RowDraft, String> {
        let record_date = required_date(row, &["date", "record_date"], "date")?;
        let millimeters = number(row, &["mm", "millimeters", "rainfall_mm", "rain_mm"]);
        let inches = number(row, &["inches", "rainfall_inches", "rain_inches", "in"])
            .or_else(|| millimeters.map(|mm| mm / MM_PER_INCH))
            .ok_or_else(|| "Missing rainfall amount (inches or mm)".to_string())?;

        Ok(RowDraft::new(
            None,
            WriteOp::Rainfall(RainfallRecord {
                record_date,
                inches,
                millimeters,
                notes: text(row, NOTES),
            }),
        ))
    }
}

pub struct DispatchSchema;

impl RowSchema for DispatchSchema {
    fn dataset(&self) -> Dataset {
        Dataset::Dispatch
    }

    fn draft(&self, row: &RawRow) -> Result<RowDraft, String> {
        let dispatch_date = required_date(row, &["date", "dispatch_date"], "date")?;
        let coffee_type = required_coffee_type(row)?;
        let bag_type = normalize_bag_type(&required_text(row, BAG_TYPE, "bag type")?);
        let location = required_text(row, DISPATCH_LOCATION, "location")?;
        // Zero bags is a valid dispatch; a blank cell is not.
        let bags_dispatched = required_number(
            row,
            &["bags", "bags_dispatched", "bags_sent", "no_of_bags", "bag_count"],
            "bag count",
        )?;

        Ok(RowDraft::new(
            Some(location),
            WriteOp::Dispatch(DispatchRecord {
                location_id: None,
                estate: None,
                dispatch_date,
                coffee_type,
                bag_type,
                bags_dispatched,
                kgs_received: number(row, &["kgs_received", "received_kgs", "kgs"]),
                destination: text(row, &["destination", "dispatched_to", "curing_works", "buyer"]),
                notes: text(row, NOTES),
            }),
        ))
    }
}

pub struct SalesSchema;

impl RowSchema for SalesSchema {
    fn dataset(&self) -> Dataset {
        Dataset::Sales
    }

    fn draft(&self, row: &RawRow) -> Result<RowDraft, String> {
        let sale_date = required_date(row, &["date", "sale_date", "sales_date"], "date")?;
        let coffee_type = required_coffee_type(row)?;

        let bag_weight_kg = number(row, &["bag_weight_kg", "bag_weight", "kg_per_bag"])
            .filter(|weight| *weight > 0.0)
            .unwrap_or(DEFAULT_BAG_WEIGHT_KG);

        let bags = number(row, &["bags_sold", "bags", "bag_count"]);
        let kgs = number(row, &["kgs", "kgs_sold", "weight_kg", "weight", "kg"]);
        let (bags_sold, kgs_sold) = match (bags, kgs) {
            (Some(bags), Some(kgs)) => (bags, kgs),
            (Some(bags), None) => (bags, bags * bag_weight_kg),
            (None, Some(kgs)) => (kgs / bag_weight_kg, kgs),
            (None, None) => return Err("Missing bags sold or weight (kgs)".to_string()),
        };

        let per_bag = number(row, &["price_per_bag", "bag_price", "rate_per_bag"]);
        let per_kg = number(row, &["price_per_kg", "kg_price", "rate_per_kg"]);
        let (price_per_bag, price_per_kg) = match (per_bag, per_kg) {
            (Some(per_bag), Some(per_kg)) => (per_bag, per_kg),
            (Some(per_bag), None) => (per_bag, per_bag / bag_weight_kg),
            (None, Some(per_kg)) => (per_kg * bag_weight_kg, per_kg),
            (None, None) => return Err("Missing price per bag or price per kg".to_string()),
        };

        let revenue = number(row, &["revenue", "total_revenue", "amount", "total"])
            .unwrap_or(bags_sold * price_per_bag);

        Ok(RowDraft::new(
            text(row, LOCATION),
            WriteOp::Sale(SaleRecord {
                location_id: None,
                sale_date,
                coffee_type,
                bag_type: normalize_bag_type(row.field(BAG_TYPE)),
                buyer: text(row, &["buyer", "buyer_name", "customer"]),
                bags_sold,
                kgs_sold,
                bag_weight_kg,
                price_per_bag,
                price_per_kg,
                revenue,
                notes: text(row, NOTES),
            }),
        ))
    }
}

pub struct TransactionsSchema;

impl RowSchema for TransactionsSchema {
    fn dataset(&self) -> Dataset {
        Dataset::Transactions
    }

    fn draft(&self, row: &RawRow) -> Result<RowDraft, String> {
        let transaction_date = required_date(row, &["date", "transaction_date"], "date")?;
        let item_type = required_text(row, ITEM_TYPE, "item type")?;
        let quantity = required_number(row, &["quantity", "qty"], "quantity")?;
        let price = number(row, &["price", "unit_price", "rate", "cost_per_unit"]).unwrap_or(0.0);

        Ok(RowDraft::new(
            text(row, LOCATION),
            WriteOp::Transaction(InventoryTransaction {
                location_id: None,
                item_type,
                transaction_date,
                kind: normalize_transaction_type(row.field(&["transaction_type", "type", "kind"])),
                quantity,
                price,
                total_cost: quantity * price,
                unit: text(row, UNIT),
                notes: text(row, NOTES),
            }),
        ))
    }
}

pub struct InventorySchema;

impl RowSchema for InventorySchema {
    fn dataset(&self) -> Dataset {
        Dataset::Inventory
    }

    fn draft(&self, row: &RawRow) -> Result<RowDraft, String> {
        let item_type = required_text(row, ITEM_TYPE, "item type")?;
        let quantity = required_number(row, &["quantity", "qty", "stock", "balance"], "quantity")?;

        Ok(RowDraft::new(
            text(row, LOCATION),
            WriteOp::StockLevel(StockLevel {
                location_id: None,
                item_type,
                quantity,
                unit: text(row, UNIT),
                unit_price: number(row, &["price", "unit_price", "avg_price", "cost_per_unit"]),
                as_of: date(row, &["date", "as_of", "opening_date"], "date")?,
                notes: text(row, NOTES),
            }),
        ))
    }
}

pub struct LaborSchema;

impl RowSchema for LaborSchema {
    fn dataset(&self) -> Dataset {
        Dataset::Labor
    }

    fn draft(&self, row: &RawRow) -> Result<RowDraft, String> {
        let work_date = required_date(row, &["date", "work_date"], "date")?;

        let hf_laborers =
            number(row, &["hf_laborers", "estate_laborers", "hf_workers"]).unwrap_or(0.0);
        let hf_cost_per_laborer =
            number(row, &["hf_cost_per_laborer", "hf_rate", "estate_rate"]).unwrap_or(0.0);
        let outside_laborers = number(
            row,
            &["outside_laborers", "outside_workers", "contract_laborers"],
        )
        .unwrap_or(0.0);
        let outside_cost_per_laborer = number(
            row,
            &["outside_cost_per_laborer", "outside_rate", "contract_rate"],
        )
        .unwrap_or(0.0);
        let total_cost = number(row, &["total_cost", "total", "amount"]).unwrap_or(
            hf_laborers * hf_cost_per_laborer + outside_laborers * outside_cost_per_laborer,
        );

        Ok(RowDraft::new(
            text(row, LOCATION),
            WriteOp::Labor(LaborRecord {
                location_id: None,
                work_date,
                activity: text(row, &["activity", "code", "task", "work"]),
                hf_laborers,
                hf_cost_per_laborer,
                outside_laborers,
                outside_cost_per_laborer,
                total_cost,
                notes: text(row, NOTES),
            }),
        ))
    }
}

pub struct ExpensesSchema;

impl RowSchema for ExpensesSchema {
    fn dataset(&self) -> Dataset {
        Dataset::Expenses
    }

    fn draft(&self, row: &RawRow) -> Result<RowDraft, String> {
        let expense_date = required_date(row, &["date", "expense_date"], "date")?;
        let amount = required_number(row, &["amount", "total", "cost", "total_amount"], "amount")?;

        Ok(RowDraft::new(
            text(row, LOCATION),
            WriteOp::Expense(ExpenseRecord {
                location_id: None,
                expense_date,
                category: text(row, &["category", "code", "account", "expense_type"]),
                description: text(row, &["description", "details", "particulars"]),
                amount,
                notes: text(row, NOTES),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::validate_rows;
    use estate_parser::{BagType, TransactionKind};

    fn draft(dataset: Dataset, pairs: &[(&str, &str)]) -> Result<RowDraft, String> {
        dataset.schema().draft(&RawRow::from_pairs(2, pairs))
    }

    #[test]
    fn sales_derives_bags_price_and_revenue() {
        let draft = draft(
            Dataset::Sales,
            &[
                ("Date", "2024-02-01"),
                ("Coffee Type", "arabica"),
                ("Kgs", "300"),
                ("Bag Weight Kg", "50"),
                ("Price Per Kg", "20"),
            ],
        )
        .expect("sale drafts");

        let WriteOp::Sale(sale) = draft.op else {
            panic!("expected sale");
        };
        assert_eq!(sale.bags_sold, 6.0);
        assert_eq!(sale.price_per_bag, 1000.0);
        assert_eq!(sale.revenue, 6000.0);
        assert_eq!(sale.coffee_type, "Arabica");
        assert!(draft.location_label.is_none());
    }

    #[test]
    fn sales_requires_quantity_and_price() {
        let missing_quantity = draft(
            Dataset::Sales,
            &[("date", "2024-02-01"), ("coffee_type", "robusta"), ("price_per_bag", "900")],
        );
        assert_eq!(missing_quantity.unwrap_err(), "Missing bags sold or weight (kgs)");

        let missing_price = draft(
            Dataset::Sales,
            &[("date", "2024-02-01"), ("coffee_type", "robusta"), ("bags", "3")],
        );
        assert_eq!(missing_price.unwrap_err(), "Missing price per bag or price per kg");
    }

    #[test]
    fn supplied_revenue_wins() {
        let draft = draft(
            Dataset::Sales,
            &[
                ("date", "2024-02-01"),
                ("coffee_type", "robusta"),
                ("bags_sold", "2"),
                ("price_per_bag", "1,500"),
                ("revenue", "2900"),
            ],
        )
        .expect("sale drafts");
        let WriteOp::Sale(sale) = draft.op else {
            panic!("expected sale");
        };
        assert_eq!(sale.kgs_sold, 100.0);
        assert_eq!(sale.price_per_kg, 30.0);
        assert_eq!(sale.revenue, 2900.0);
    }

    #[test]
    fn pepper_derives_percentages() {
        let draft = draft(
            Dataset::Pepper,
            &[
                ("date", "2024-01-10"),
                ("location", "Hill Block"),
                ("kg_picked", "400"),
                ("green_pepper", "300"),
                ("dry_pepper", "105"),
            ],
        )
        .expect("pepper drafts");
        let WriteOp::Pepper(pepper) = draft.op else {
            panic!("expected pepper");
        };
        assert_eq!(pepper.green_pepper_percent, 75.0);
        assert_eq!(pepper.dry_pepper_percent, 35.0);
        assert_eq!(draft.location_label.as_deref(), Some("Hill Block"));
    }

    #[test]
    fn pepper_percentage_is_zero_without_a_whole() {
        let draft = draft(
            Dataset::Pepper,
            &[("date", "2024-01-10"), ("location", "Hill Block"), ("green_pepper", "12")],
        )
        .expect("pepper drafts");
        let WriteOp::Pepper(pepper) = draft.op else {
            panic!("expected pepper");
        };
        assert_eq!(pepper.green_pepper_percent, 0.0);
    }

    #[test]
    fn rainfall_converts_millimeters() {
        let draft = draft(Dataset::Rainfall, &[("date", "01/06/2024"), ("mm", "50.8")])
            .expect("rainfall drafts");
        let WriteOp::Rainfall(rain) = draft.op else {
            panic!("expected rainfall");
        };
        assert!((rain.inches - 2.0).abs() < 1e-9);
        assert_eq!(rain.record_date, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());

        let missing = draft_err(Dataset::Rainfall, &[("date", "2024-06-01")]);
        assert_eq!(missing, "Missing rainfall amount (inches or mm)");
    }

    fn draft_err(dataset: Dataset, pairs: &[(&str, &str)]) -> String {
        draft(dataset, pairs).expect_err("row should fail")
    }

    #[test]
    fn dispatch_accepts_zero_bags_but_not_blank() {
        let base = [
            ("date", "2024-03-01"),
            ("coffee_type", "Arabica"),
            ("bag_type", "dry cherry"),
            ("location", "North"),
        ];

        let mut with_zero = base.to_vec();
        with_zero.push(("bags", "0"));
        let draft = draft(Dataset::Dispatch, &with_zero).expect("zero bags is valid");
        let WriteOp::Dispatch(dispatch) = draft.op else {
            panic!("expected dispatch");
        };
        assert_eq!(dispatch.bags_dispatched, 0.0);
        assert_eq!(dispatch.bag_type, BagType::DryCherry);

        let mut blank = base.to_vec();
        blank.push(("bags", ""));
        assert_eq!(draft_err(Dataset::Dispatch, &blank), "Missing or invalid bag count");
    }

    #[test]
    fn dispatch_reports_first_missing_field() {
        assert_eq!(
            draft_err(Dataset::Dispatch, &[("coffee_type", "Arabica")]),
            "Missing date"
        );
        assert_eq!(
            draft_err(Dataset::Dispatch, &[("date", "not a date")]),
            "Invalid date 'not a date'"
        );
        assert_eq!(
            draft_err(
                Dataset::Dispatch,
                &[
                    ("date", "2024-03-01"),
                    ("coffee_type", "Arabica"),
                    ("bag_type", "cherry"),
                    ("bags", "4"),
                ]
            ),
            "Missing location"
        );
    }

    #[test]
    fn transactions_compute_total_cost() {
        let draft = draft(
            Dataset::Transactions,
            &[
                ("date", "2024-04-02"),
                ("item_type", "Urea"),
                ("transaction_type", "Restock"),
                ("quantity", "10"),
                ("price", "25.5"),
                ("unit", "kg"),
            ],
        )
        .expect("transaction drafts");
        let WriteOp::Transaction(txn) = draft.op else {
            panic!("expected transaction");
        };
        assert_eq!(txn.kind, TransactionKind::Restock);
        assert_eq!(txn.total_cost, 255.0);
        assert_eq!(txn.unit.as_deref(), Some("kg"));
    }

    #[test]
    fn inventory_date_is_optional_but_must_parse() {
        let ok = draft(Dataset::Inventory, &[("item", "Diesel"), ("quantity", "40")])
            .expect("inventory drafts");
        let WriteOp::StockLevel(stock) = ok.op else {
            panic!("expected stock level");
        };
        assert!(stock.as_of.is_none());

        assert_eq!(
            draft_err(
                Dataset::Inventory,
                &[("item", "Diesel"), ("quantity", "40"), ("date", "soon")]
            ),
            "Invalid date 'soon'"
        );
    }

    #[test]
    fn labor_total_falls_back_to_crew_costs() {
        let draft = draft(
            Dataset::Labor,
            &[
                ("date", "2024-05-05"),
                ("hf_laborers", "4"),
                ("hf_cost_per_laborer", "500"),
                ("outside_laborers", "2"),
                ("outside_cost_per_laborer", "650"),
            ],
        )
        .expect("labor drafts");
        let WriteOp::Labor(labor) = draft.op else {
            panic!("expected labor");
        };
        assert_eq!(labor.total_cost, 3300.0);
    }

    #[test]
    fn expenses_need_an_amount() {
        assert_eq!(
            draft_err(Dataset::Expenses, &[("date", "2024-05-05"), ("category", "Fuel")]),
            "Missing or invalid amount"
        );
    }

    #[test]
    fn validation_collects_every_failing_row() {
        let rows = vec![
            RawRow::from_pairs(2, &[("date", "2024-01-01"), ("mm", "10")]),
            RawRow::from_pairs(3, &[("date", ""), ("mm", "10")]),
            RawRow::from_pairs(4, &[("date", "2024-01-03")]),
        ];
        let report = validate_rows(Dataset::Rainfall, &rows);

        assert!(!report.is_valid());
        assert_eq!(report.skipped, 2);
        assert_eq!(report.errors[0].row, 3);
        assert_eq!(report.errors[1].row, 4);
    }

    #[test]
    fn datasets_parse_and_map_to_modules() {
        assert_eq!("Sales".parse::<Dataset>(), Ok(Dataset::Sales));
        assert!("payroll".parse::<Dataset>().is_err());
        for dataset in Dataset::ALL {
            assert_eq!(dataset.schema().dataset(), dataset);
        }
    }
}
