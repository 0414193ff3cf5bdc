//! In-process store used by tests and dry runs. Mirrors the Postgres
//! upsert keys and supports injecting a failure on a chosen chunk.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use estate_parser::TransactionKind;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::datasets::Dataset;
use crate::error::StoreError;
use crate::jobs::{ImportJob, JobStatus};
use crate::locations::Location;
use crate::recompute::{AggregateKey, AggregateRecompute};
use crate::records::{PepperRecord, ProcessingRecord, StockLevel, WriteOp};
use crate::store::ImportStore;

type ProcessingKey = (Uuid, Option<Uuid>, String, NaiveDate);
type PepperKey = (Uuid, Option<Uuid>, NaiveDate);
type StockKey = (Uuid, String, Option<Uuid>);

#[derive(Debug, Default)]
struct MemoryState {
    ledger_missing: bool,
    fail_batch: Option<usize>,
    fail_recompute: bool,
    batch_calls: usize,
    batch_sizes: Vec<usize>,
    jobs: HashMap<Uuid, ImportJob>,
    locations: Vec<Location>,
    processing: HashMap<ProcessingKey, ProcessingRecord>,
    pepper: HashMap<PepperKey, PepperRecord>,
    stock: HashMap<StockKey, StockLevel>,
    appended: Vec<(Uuid, WriteOp)>,
    recomputed: Vec<AggregateKey>,
    batches_at_recompute: Vec<usize>,
    audit: Vec<AuditEvent>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behaves like a deployment whose ledger table was never created.
    pub fn without_ledger() -> Self {
        let store = Self::default();
        store.lock().ledger_missing = true;
        store
    }

    /// Makes the `nth` (1-based) call to `write_batch` fail.
    pub fn fail_on_batch(self, nth: usize) -> Self {
        self.lock().fail_batch = Some(nth);
        self
    }

    pub fn fail_recompute(self) -> Self {
        self.lock().fail_recompute = true;
        self
    }

    pub fn add_location(&self, tenant_id: Uuid, name: &str, code: &str) -> Location {
        let location = Location {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            code: code.to_string(),
            estate_label: None,
        };
        self.lock().locations.push(location.clone());
        location
    }

    pub fn job(&self, job_id: Uuid) -> Option<ImportJob> {
        self.lock().jobs.get(&job_id).cloned()
    }

    pub fn jobs(&self) -> Vec<ImportJob> {
        self.lock().jobs.values().cloned().collect()
    }

    /// Overwrites a stored job, e.g. to move its expiry into the past.
    pub fn put_job(&self, job: ImportJob) {
        self.lock().jobs.insert(job.id, job);
    }

    pub fn locations(&self, tenant_id: Uuid) -> Vec<Location> {
        self.lock()
            .locations
            .iter()
            .filter(|location| location.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    /// Every stored row for the tenant, upserted tables included.
    pub fn rows(&self, tenant_id: Uuid) -> Vec<WriteOp> {
        let state = self.lock();
        let mut rows: Vec<WriteOp> = state
            .appended
            .iter()
            .filter(|(tenant, _)| *tenant == tenant_id)
            .map(|(_, op)| op.clone())
            .collect();
        rows.extend(
            state
                .processing
                .iter()
                .filter(|(key, _)| key.0 == tenant_id)
                .map(|(_, record)| WriteOp::Processing(record.clone())),
        );
        rows.extend(
            state
                .pepper
                .iter()
                .filter(|(key, _)| key.0 == tenant_id)
                .map(|(_, record)| WriteOp::Pepper(record.clone())),
        );
        rows
    }

    pub fn row_count(&self, tenant_id: Uuid, kind: &str) -> usize {
        self.rows(tenant_id)
            .iter()
            .filter(|op| op.kind() == kind)
            .count()
    }

    pub fn stock_level(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
    ) -> Option<StockLevel> {
        self.lock()
            .stock
            .get(&(tenant_id, item_type.to_string(), location_id))
            .cloned()
    }

    pub fn recomputed(&self) -> Vec<AggregateKey> {
        self.lock().recomputed.clone()
    }

    /// How many `write_batch` calls had happened when each recompute ran.
    pub fn batches_at_recompute(&self) -> Vec<usize> {
        self.lock().batches_at_recompute.clone()
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.lock().audit.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ledger(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let state = self.lock();
        if state.ledger_missing {
            return Err(StoreError::LedgerUnavailable);
        }
        Ok(state)
    }
}

impl MemoryState {
    fn apply(&mut self, tenant_id: Uuid, op: &WriteOp) {
        match op {
            WriteOp::Processing(record) => {
                let key = (
                    tenant_id,
                    record.location_id,
                    record.coffee_type.clone(),
                    record.process_date,
                );
                self.processing.insert(key, record.clone());
            }
            WriteOp::Pepper(record) => {
                let key = (tenant_id, record.location_id, record.record_date);
                self.pepper.insert(key, record.clone());
            }
            WriteOp::StockLevel(level) => {
                let key = (tenant_id, level.item_type.clone(), level.location_id);
                let unit = level
                    .unit
                    .clone()
                    .or_else(|| self.stock.get(&key).and_then(|existing| existing.unit.clone()));
                self.stock.insert(
                    key,
                    StockLevel {
                        unit,
                        ..level.clone()
                    },
                );
            }
            other => self.appended.push((tenant_id, other.clone())),
        }
    }

    fn stock_from_history(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
    ) -> f64 {
        self.appended
            .iter()
            .filter(|(tenant, _)| *tenant == tenant_id)
            .filter_map(|(_, op)| match op {
                WriteOp::Transaction(txn)
                    if txn.item_type == item_type && txn.location_id == location_id =>
                {
                    Some(match txn.kind {
                        TransactionKind::Restock => txn.quantity,
                        TransactionKind::Deplete => -txn.quantity,
                    })
                }
                _ => None,
            })
            .sum()
    }
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn insert_job(&self, job: &ImportJob) -> Result<(), StoreError> {
        self.ledger()?.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &ImportJob, expected: JobStatus) -> Result<bool, StoreError> {
        let mut state = self.ledger()?;
        match state.jobs.get_mut(&job.id) {
            Some(stored) if stored.status == expected => {
                *stored = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<ImportJob>, StoreError> {
        Ok(self
            .ledger()?
            .jobs
            .get(&job_id)
            .filter(|job| job.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_job_by_fingerprint(
        &self,
        tenant_id: Uuid,
        dataset: Dataset,
        fingerprint: &str,
        exclude: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .ledger()?
            .jobs
            .values()
            .filter(|job| {
                job.tenant_id == tenant_id
                    && job.dataset == dataset
                    && job.content_fingerprint == fingerprint
                    && job.id != exclude
            })
            .max_by_key(|job| job.created_at)
            .map(|job| job.id))
    }

    async fn find_location_by_id(
        &self,
        tenant_id: Uuid,
        location_id: Uuid,
    ) -> Result<Option<Location>, StoreError> {
        Ok(self
            .lock()
            .locations
            .iter()
            .find(|location| location.tenant_id == tenant_id && location.id == location_id)
            .cloned())
    }

    async fn find_location_by_code(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<Option<Location>, StoreError> {
        Ok(self
            .lock()
            .locations
            .iter()
            .find(|location| {
                location.tenant_id == tenant_id && location.code.eq_ignore_ascii_case(code)
            })
            .cloned())
    }

    async fn list_locations(&self, tenant_id: Uuid) -> Result<Vec<Location>, StoreError> {
        Ok(self.locations(tenant_id))
    }

    async fn insert_location(
        &self,
        tenant_id: Uuid,
        code: &str,
        name: &str,
    ) -> Result<Option<Location>, StoreError> {
        let mut state = self.lock();
        let taken = state
            .locations
            .iter()
            .any(|location| {
                location.tenant_id == tenant_id && location.code.eq_ignore_ascii_case(code)
            });
        if taken {
            return Ok(None);
        }
        let location = Location {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            code: code.to_string(),
            estate_label: None,
        };
        state.locations.push(location.clone());
        Ok(Some(location))
    }

    async fn write_batch(&self, tenant_id: Uuid, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.batch_calls += 1;
        if state.fail_batch == Some(state.batch_calls) {
            return Err(StoreError::Backend(format!(
                "injected failure on batch {}",
                state.batch_calls
            )));
        }
        for op in ops {
            state.apply(tenant_id, op);
        }
        state.batch_sizes.push(ops.len());
        Ok(())
    }

    async fn stock_on_hand(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
    ) -> Result<f64, StoreError> {
        Ok(self.lock().stock_from_history(tenant_id, item_type, location_id))
    }

    async fn upsert_stock_unit(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
        unit: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let level = state
            .stock
            .entry((tenant_id, item_type.to_string(), location_id))
            .or_insert_with(|| StockLevel {
                location_id,
                item_type: item_type.to_string(),
                quantity: 0.0,
                unit: None,
                unit_price: None,
                as_of: None,
                notes: None,
            });
        level.unit = Some(unit.to_string());
        Ok(())
    }
}

#[async_trait]
impl AggregateRecompute for MemoryStore {
    async fn recalculate_inventory(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
    ) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.recomputed.push(AggregateKey::StockBalance {
            item_type: item_type.to_string(),
            location_id,
        });
        let seen = state.batch_calls;
        state.batches_at_recompute.push(seen);
        if state.fail_recompute {
            anyhow::bail!("stock recompute unavailable");
        }
        let quantity = state.stock_from_history(tenant_id, item_type, location_id);
        let level = state
            .stock
            .entry((tenant_id, item_type.to_string(), location_id))
            .or_insert_with(|| StockLevel {
                location_id,
                item_type: item_type.to_string(),
                quantity: 0.0,
                unit: None,
                unit_price: None,
                as_of: None,
                notes: None,
            });
        level.quantity = quantity;
        Ok(())
    }

    async fn recompute_processing_totals(
        &self,
        _tenant_id: Uuid,
        location_id: Uuid,
        coffee_type: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.recomputed.push(AggregateKey::ProcessingTotals {
            location_id,
            coffee_type: coffee_type.to_string(),
        });
        let seen = state.batch_calls;
        state.batches_at_recompute.push(seen);
        if state.fail_recompute {
            anyhow::bail!("processing recompute unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.lock().audit.push(event.clone());
        Ok(())
    }
}
