pub mod errors;
pub mod fields;
pub mod table;

pub use errors::TableError;
pub use fields::{
    format_date, normalize_bag_type, normalize_coffee_type, normalize_transaction_type,
    number_or, parse_date, parse_number, BagType, TransactionKind,
};
pub use table::{normalize_header, parse_table, RawRow, Table};
