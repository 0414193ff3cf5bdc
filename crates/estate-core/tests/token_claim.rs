mod common;

use std::sync::Arc;

use async_trait::async_trait;
use estate_core::jobs::JobStatus;
use estate_core::locations::Location;
use estate_core::records::WriteOp;
use estate_core::store::ImportStore;
use estate_core::{
    Dataset, ImportConfig, ImportError, ImportJob, ImportRequest, ImportService, MemoryStore,
    StoreError,
};
use tokio::task::yield_now;
use uuid::Uuid;

use common::{clock, owner, rainfall_csv};

/// Hands control back to the runtime before every call so that two commits
/// driven by `tokio::join!` interleave at each await.
struct YieldingStore {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl ImportStore for YieldingStore {
    async fn insert_job(&self, job: &ImportJob) -> Result<(), StoreError> {
        yield_now().await;
        self.inner.insert_job(job).await
    }

    async fn update_job(&self, job: &ImportJob, expected: JobStatus) -> Result<bool, StoreError> {
        yield_now().await;
        self.inner.update_job(job, expected).await
    }

    async fn find_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<ImportJob>, StoreError> {
        yield_now().await;
        self.inner.find_job(tenant_id, job_id).await
    }

    async fn find_job_by_fingerprint(
        &self,
        tenant_id: Uuid,
        dataset: Dataset,
        fingerprint: &str,
        exclude: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        yield_now().await;
        self.inner
            .find_job_by_fingerprint(tenant_id, dataset, fingerprint, exclude)
            .await
    }

    async fn find_location_by_id(
        &self,
        tenant_id: Uuid,
        location_id: Uuid,
    ) -> Result<Option<Location>, StoreError> {
        yield_now().await;
        self.inner.find_location_by_id(tenant_id, location_id).await
    }

    async fn find_location_by_code(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<Option<Location>, StoreError> {
        yield_now().await;
        self.inner.find_location_by_code(tenant_id, code).await
    }

    async fn list_locations(&self, tenant_id: Uuid) -> Result<Vec<Location>, StoreError> {
        yield_now().await;
        self.inner.list_locations(tenant_id).await
    }

    async fn insert_location(
        &self,
        tenant_id: Uuid,
        code: &str,
        name: &str,
    ) -> Result<Option<Location>, StoreError> {
        yield_now().await;
        self.inner.insert_location(tenant_id, code, name).await
    }

    async fn write_batch(&self, tenant_id: Uuid, ops: &[WriteOp]) -> Result<(), StoreError> {
        yield_now().await;
        self.inner.write_batch(tenant_id, ops).await
    }

    async fn stock_on_hand(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
    ) -> Result<f64, StoreError> {
        yield_now().await;
        self.inner.stock_on_hand(tenant_id, item_type, location_id).await
    }

    async fn upsert_stock_unit(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
        unit: &str,
    ) -> Result<(), StoreError> {
        yield_now().await;
        self.inner
            .upsert_stock_unit(tenant_id, item_type, location_id, unit)
            .await
    }
}

fn yielding_service(config: ImportConfig) -> (Arc<MemoryStore>, ImportService) {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(YieldingStore {
        inner: memory.clone(),
    });
    let service = ImportService::new(store, memory.clone(), memory.clone(), config);
    (memory, service)
}

#[tokio::test]
async fn overlapping_commits_of_one_token_write_once() {
    let (store, service) = yielding_service(ImportConfig {
        chunk_size: 1,
        ..ImportConfig::default()
    });
    let principal = owner();
    let token = service
        .handle_at(&principal, ImportRequest::validate("rainfall", rainfall_csv(3)), clock())
        .await
        .unwrap()
        .validation_token
        .unwrap();

    let (first, second) = tokio::join!(
        service.handle_at(&principal, ImportRequest::commit_token("rainfall", token), clock()),
        service.handle_at(&principal, ImportRequest::commit_token("rainfall", token), clock()),
    );

    let outcomes = [first, second];
    let committed: Vec<_> = outcomes.iter().filter_map(|outcome| outcome.as_ref().ok()).collect();
    assert_eq!(committed.len(), 1, "exactly one commit may win: {outcomes:?}");
    assert_eq!(committed[0].imported, 3);

    let rejected = outcomes
        .iter()
        .find_map(|outcome| outcome.as_ref().err())
        .unwrap();
    assert!(
        matches!(
            rejected,
            ImportError::TokenNotReady {
                status: JobStatus::CommitInProgress
            } | ImportError::TokenAlreadyCommitted
        ),
        "unexpected rejection: {rejected:?}"
    );

    assert_eq!(store.row_count(principal.tenant_id, "rainfall"), 3);
    assert_eq!(store.batch_sizes(), vec![1, 1, 1]);
    assert_eq!(store.job(token).unwrap().status, JobStatus::Committed);
}

#[tokio::test]
async fn a_claimed_job_cannot_be_committed_again() {
    let (store, service) = yielding_service(ImportConfig::default());
    let principal = owner();
    let token = service
        .handle_at(&principal, ImportRequest::validate("rainfall", rainfall_csv(2)), clock())
        .await
        .unwrap()
        .validation_token
        .unwrap();

    // A commit that wrote its rows but never recorded the outcome.
    let mut stuck = store.job(token).unwrap();
    stuck.status = JobStatus::CommitInProgress;
    store.put_job(stuck);

    let err = service
        .handle_at(&principal, ImportRequest::commit_token("rainfall", token), clock())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ImportError::TokenNotReady {
            status: JobStatus::CommitInProgress
        }
    ));
    assert_eq!(store.row_count(principal.tenant_id, "rainfall"), 0);
}

#[tokio::test]
async fn conditional_update_rejects_a_stale_status() {
    let store = MemoryStore::new();
    let principal = owner();
    let job = ImportJob::new_validation(&principal, Dataset::Rainfall, String::new(), 0, clock());
    store.insert_job(&job).await.unwrap();

    let mut claimed = job.clone();
    claimed.status = JobStatus::CommitInProgress;
    assert!(!store.update_job(&claimed, JobStatus::Validated).await.unwrap());
    assert!(store
        .update_job(&claimed, JobStatus::ValidateInProgress)
        .await
        .unwrap());
    assert_eq!(store.job(job.id).unwrap().status, JobStatus::CommitInProgress);
}
