#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use estate_core::{ImportConfig, ImportService, MemoryStore, Principal, Role};
use uuid::Uuid;

pub fn service_with(store: MemoryStore, config: ImportConfig) -> (Arc<MemoryStore>, ImportService) {
    let store = Arc::new(store);
    let service = ImportService::new(store.clone(), store.clone(), store.clone(), config);
    (store, service)
}

pub fn service() -> (Arc<MemoryStore>, ImportService) {
    service_with(MemoryStore::new(), ImportConfig::default())
}

pub fn owner() -> Principal {
    Principal::new(Uuid::new_v4(), "asha", Role::Owner).with_user_id(Uuid::new_v4())
}

pub fn clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).single().unwrap()
}

/// `header` followed by `rows` generated rows.
pub fn csv_rows(header: &str, rows: usize, row: impl Fn(usize) -> String) -> String {
    let mut csv = String::from(header);
    csv.push('\n');
    for index in 0..rows {
        csv.push_str(&row(index));
        csv.push('\n');
    }
    csv
}

pub fn rainfall_csv(rows: usize) -> String {
    csv_rows("Date,Inches", rows, |index| {
        format!("2024-01-{:02},{}.5", index % 28 + 1, index % 3)
    })
}
