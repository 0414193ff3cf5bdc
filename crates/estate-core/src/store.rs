//! Storage collaborator used by the pipeline. The Postgres implementation
//! lives in [`crate::postgres`]; [`crate::memory`] backs the tests.

use async_trait::async_trait;
use uuid::Uuid;

use crate::datasets::Dataset;
use crate::error::StoreError;
use crate::jobs::{ImportJob, JobStatus};
use crate::locations::Location;
use crate::records::WriteOp;

#[async_trait]
pub trait ImportStore: Send + Sync {
    /// Fails with [`StoreError::LedgerUnavailable`] when the ledger table is missing.
    async fn insert_job(&self, job: &ImportJob) -> Result<(), StoreError>;

    /// Writes `job` only while the stored row is still in status `expected`.
    /// Returns `false` when another request moved the job first.
    async fn update_job(&self, job: &ImportJob, expected: JobStatus) -> Result<bool, StoreError>;

    async fn find_job(&self, tenant_id: Uuid, job_id: Uuid)
        -> Result<Option<ImportJob>, StoreError>;

    /// Most recent other job of the tenant carrying the same content fingerprint.
    async fn find_job_by_fingerprint(
        &self,
        tenant_id: Uuid,
        dataset: Dataset,
        fingerprint: &str,
        exclude: Uuid,
    ) -> Result<Option<Uuid>, StoreError>;

    async fn find_location_by_id(
        &self,
        tenant_id: Uuid,
        location_id: Uuid,
    ) -> Result<Option<Location>, StoreError>;

    /// Case-insensitive lookup on the location code.
    async fn find_location_by_code(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<Option<Location>, StoreError>;

    async fn list_locations(&self, tenant_id: Uuid) -> Result<Vec<Location>, StoreError>;

    /// Inserts a location unless its code already exists; `Ok(None)` on conflict.
    async fn insert_location(
        &self,
        tenant_id: Uuid,
        code: &str,
        name: &str,
    ) -> Result<Option<Location>, StoreError>;

    /// Writes one chunk as a single grouped operation: all rows or none.
    async fn write_batch(&self, tenant_id: Uuid, ops: &[WriteOp]) -> Result<(), StoreError>;

    /// Restocks minus depletions recorded for the key so far.
    async fn stock_on_hand(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
    ) -> Result<f64, StoreError>;

    /// Ensures a stock-balance row exists for the key and sets its unit.
    async fn upsert_stock_unit(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
        unit: &str,
    ) -> Result<(), StoreError>;
}
