//! The import entry point: validate a CSV, hand back a token, then commit
//! the stored content exactly as it was validated.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use estate_parser::{parse_table, RawRow, Table};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::access::{ensure_import_access, Principal};
use crate::audit::{AuditEvent, AuditSink};
use crate::batch::{BatchWriter, DEFAULT_CHUNK_SIZE};
use crate::datasets::{validate_rows, Dataset, RowError};
use crate::error::{ImportError, StoreError};
use crate::jobs::{
    check_commit, ImportJob, ImportMode, JobEvent, JobStatus, TokenRejection,
    DEFAULT_TOKEN_TTL_MINUTES,
};
use crate::locations::{resolve_location, LocationCache};
use crate::recompute::{AggregateRecompute, RecomputeSet};
use crate::records::WriteOp;
use crate::store::ImportStore;

pub const DEFAULT_MAX_ROWS: usize = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub chunk_size: usize,
    pub max_rows: usize,
    pub token_ttl_minutes: i64,
    /// Reject validate requests outright when the ledger is missing instead
    /// of returning a preview without a token.
    pub require_ledger: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_rows: DEFAULT_MAX_ROWS,
            token_ttl_minutes: DEFAULT_TOKEN_TTL_MINUTES,
            require_ledger: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub dataset: String,
    pub mode: ImportMode,
    #[serde(default)]
    pub csv: String,
    #[serde(default)]
    pub validation_token: Option<String>,
}

impl ImportRequest {
    pub fn validate(dataset: impl Into<String>, csv: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            mode: ImportMode::Validate,
            csv: csv.into(),
            validation_token: None,
        }
    }

    pub fn commit(dataset: impl Into<String>, csv: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            mode: ImportMode::Commit,
            csv: csv.into(),
            validation_token: None,
        }
    }

    pub fn commit_token(dataset: impl Into<String>, token: impl ToString) -> Self {
        Self {
            dataset: dataset.into(),
            mode: ImportMode::Commit,
            csv: String::new(),
            validation_token: Some(token.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResponse {
    pub valid: bool,
    pub row_count: usize,
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<RowError>,
    /// Present only for a passing validation, or echoing the consumed token.
    pub validation_token: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct CommitSummary {
    imported: usize,
    errors: Vec<RowError>,
    recompute_failures: Vec<String>,
}

#[derive(Debug)]
struct CommitFailure {
    imported: usize,
    skipped: usize,
    message: String,
}

#[derive(Clone)]
pub struct ImportService {
    store: Arc<dyn ImportStore>,
    recompute: Arc<dyn AggregateRecompute>,
    audit: Arc<dyn AuditSink>,
    config: ImportConfig,
}

impl ImportService {
    pub fn new(
        store: Arc<dyn ImportStore>,
        recompute: Arc<dyn AggregateRecompute>,
        audit: Arc<dyn AuditSink>,
        config: ImportConfig,
    ) -> Self {
        Self {
            store,
            recompute,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub async fn handle(
        &self,
        principal: &Principal,
        request: ImportRequest,
    ) -> Result<ImportResponse, ImportError> {
        self.handle_at(principal, request, Utc::now()).await
    }

    /// Same as [`ImportService::handle`] with an explicit clock.
    pub async fn handle_at(
        &self,
        principal: &Principal,
        request: ImportRequest,
        now: DateTime<Utc>,
    ) -> Result<ImportResponse, ImportError> {
        let dataset: Dataset = request
            .dataset
            .parse()
            .map_err(|_| ImportError::UnsupportedDataset(request.dataset.trim().to_string()))?;
        ensure_import_access(principal, dataset)?;

        let token = request
            .validation_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty());

        match (request.mode, token) {
            (ImportMode::Validate, _) => self.validate(principal, dataset, request.csv, now).await,
            (ImportMode::Commit, Some(token)) => {
                self.commit_with_token(principal, dataset, token, now).await
            }
            (ImportMode::Commit, None) => {
                self.commit_direct(principal, dataset, &request.csv, now).await
            }
        }
    }

    /// Looks up a job for its requester, or for an admin/owner of the tenant.
    pub async fn job(&self, principal: &Principal, token: &str) -> Result<ImportJob, ImportError> {
        let job_id = Uuid::parse_str(token.trim()).map_err(|_| ImportError::TokenNotFound)?;
        let job = self
            .store
            .find_job(principal.tenant_id, job_id)
            .await?
            .ok_or(ImportError::TokenNotFound)?;
        if job.is_requested_by(principal) || principal.role.can_manage() {
            Ok(job)
        } else {
            Err(ImportError::TokenNotFound)
        }
    }

    async fn validate(
        &self,
        principal: &Principal,
        dataset: Dataset,
        csv: String,
        now: DateTime<Utc>,
    ) -> Result<ImportResponse, ImportError> {
        let table = self.parse_input(&csv)?;
        let report = validate_rows(dataset, &table.rows);
        let mut job = ImportJob::new_validation(principal, dataset, csv, table.len(), now);

        match self.store.insert_job(&job).await {
            Ok(()) => {}
            Err(StoreError::LedgerUnavailable) if !self.config.require_ledger => {
                warn!(
                    tenant_id = %principal.tenant_id,
                    %dataset,
                    "import ledger missing; returning validation preview without a token"
                );
                return Ok(ImportResponse {
                    valid: report.is_valid(),
                    row_count: table.len(),
                    imported: 0,
                    skipped: report.skipped,
                    errors: report.errors,
                    validation_token: None,
                    expires_at: None,
                });
            }
            Err(err) => return Err(err.into()),
        }

        match self
            .store
            .find_job_by_fingerprint(principal.tenant_id, dataset, &job.content_fingerprint, job.id)
            .await
        {
            Ok(Some(previous)) => {
                info!(
                    job_id = %job.id,
                    previous_job_id = %previous,
                    %dataset,
                    "content was submitted before"
                );
                job.set_metadata("previous_job_id", json!(previous));
            }
            Ok(None) => {}
            Err(err) => warn!(job_id = %job.id, error = %err, "fingerprint lookup failed"),
        }

        job.record_validation(&report, Duration::minutes(self.config.token_ttl_minutes), now)?;
        if !self
            .store
            .update_job(&job, JobStatus::ValidateInProgress)
            .await?
        {
            return Err(StoreError::Backend(format!(
                "import job {} changed while it was being validated",
                job.id
            ))
            .into());
        }

        info!(
            tenant_id = %principal.tenant_id,
            job_id = %job.id,
            %dataset,
            rows = job.row_count,
            errors = job.error_count,
            status = %job.status,
            "validated import"
        );
        self.audit(
            principal,
            "import.validate",
            dataset,
            Some(job.id),
            json!({ "rows": job.row_count, "errors": job.error_count, "status": job.status }),
            now,
        )
        .await;

        let valid = report.is_valid();
        Ok(ImportResponse {
            valid,
            row_count: job.row_count,
            imported: 0,
            skipped: report.skipped,
            errors: report.errors,
            validation_token: valid.then_some(job.id),
            expires_at: if valid { job.expires_at } else { None },
        })
    }

    async fn commit_with_token(
        &self,
        principal: &Principal,
        dataset: Dataset,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<ImportResponse, ImportError> {
        let job_id = Uuid::parse_str(token).map_err(|_| ImportError::TokenNotFound)?;
        let mut job = self
            .store
            .find_job(principal.tenant_id, job_id)
            .await?
            .filter(|job| job.dataset == dataset && job.is_requested_by(principal))
            .ok_or(ImportError::TokenNotFound)?;

        if let Err(rejection) = check_commit(&job, now) {
            if rejection == TokenRejection::Expired && job.status == JobStatus::Validated {
                job.apply(JobEvent::Expire, now)?;
                self.store.update_job(&job, JobStatus::Validated).await?;
                info!(job_id = %job.id, %dataset, "validation token expired");
            }
            return Err(rejection.into());
        }

        // Only the request that moves the job out of `validated` may write.
        job.apply(JobEvent::BeginCommit, now)?;
        if !self.store.update_job(&job, JobStatus::Validated).await? {
            let status = self
                .store
                .find_job(principal.tenant_id, job.id)
                .await?
                .map_or(JobStatus::CommitInProgress, |current| current.status);
            warn!(
                job_id = %job.id,
                %dataset,
                %status,
                "validation token claimed by another commit"
            );
            return Err(match status {
                JobStatus::Committed => ImportError::TokenAlreadyCommitted,
                status => ImportError::TokenNotReady { status },
            });
        }

        let table = match parse_table(&job.raw_content) {
            Ok(table) => table,
            Err(err) => {
                let message = err.to_string();
                job.record_failure(0, &message, now)?;
                self.finish_job(&job).await;
                return Err(err.into());
            }
        };
        match self.write_rows(principal.tenant_id, dataset, &table.rows, now).await {
            Ok(summary) => {
                let skipped = summary.errors.len();
                job.record_commit(summary.imported, skipped, summary.errors.clone(), now)?;
                if !summary.recompute_failures.is_empty() {
                    job.set_metadata("recompute_failures", json!(summary.recompute_failures));
                }
                self.finish_job(&job).await;

                info!(
                    tenant_id = %principal.tenant_id,
                    job_id = %job.id,
                    %dataset,
                    imported = summary.imported,
                    skipped,
                    "committed import"
                );
                self.audit(
                    principal,
                    "import.commit",
                    dataset,
                    Some(job.id),
                    json!({ "imported": summary.imported, "skipped": skipped }),
                    now,
                )
                .await;

                Ok(ImportResponse {
                    valid: true,
                    row_count: job.row_count,
                    imported: summary.imported,
                    skipped,
                    errors: summary.errors,
                    validation_token: Some(job.id),
                    expires_at: None,
                })
            }
            Err(failure) => {
                job.record_failure(failure.imported, &failure.message, now)?;
                self.finish_job(&job).await;
                self.audit(
                    principal,
                    "import.commit_failed",
                    dataset,
                    Some(job.id),
                    json!({ "imported": failure.imported, "reason": failure.message }),
                    now,
                )
                .await;
                Err(ImportError::CommitFailed {
                    imported: failure.imported,
                    skipped: failure.skipped,
                    message: failure.message,
                    validation_token: Some(job.id),
                })
            }
        }
    }

    /// Records the outcome of a claimed commit. The rows are already written,
    /// so a failed update is logged and the job stays `commit_in_progress`,
    /// which no later request can claim.
    async fn finish_job(&self, job: &ImportJob) {
        match self.store.update_job(job, JobStatus::CommitInProgress).await {
            Ok(true) => {}
            Ok(false) => error!(
                job_id = %job.id,
                status = %job.status,
                "claimed import job changed before its outcome was recorded"
            ),
            Err(err) => error!(
                job_id = %job.id,
                status = %job.status,
                error = %err,
                "failed to record import outcome"
            ),
        }
    }

    async fn commit_direct(
        &self,
        principal: &Principal,
        dataset: Dataset,
        csv: &str,
        now: DateTime<Utc>,
    ) -> Result<ImportResponse, ImportError> {
        let table = self.parse_input(csv)?;
        match self.write_rows(principal.tenant_id, dataset, &table.rows, now).await {
            Ok(summary) => {
                let skipped = summary.errors.len();
                info!(
                    tenant_id = %principal.tenant_id,
                    %dataset,
                    imported = summary.imported,
                    skipped,
                    "committed import without validation token"
                );
                self.audit(
                    principal,
                    "import.commit_direct",
                    dataset,
                    None,
                    json!({
                        "rows": table.len(),
                        "imported": summary.imported,
                        "skipped": skipped,
                        "recompute_failures": summary.recompute_failures,
                    }),
                    now,
                )
                .await;
                Ok(ImportResponse {
                    valid: skipped == 0,
                    row_count: table.len(),
                    imported: summary.imported,
                    skipped,
                    errors: summary.errors,
                    validation_token: None,
                    expires_at: None,
                })
            }
            Err(failure) => {
                self.audit(
                    principal,
                    "import.commit_failed",
                    dataset,
                    None,
                    json!({ "imported": failure.imported, "reason": failure.message }),
                    now,
                )
                .await;
                Err(ImportError::CommitFailed {
                    imported: failure.imported,
                    skipped: failure.skipped,
                    message: failure.message,
                    validation_token: None,
                })
            }
        }
    }

    fn parse_input(&self, csv: &str) -> Result<Table, ImportError> {
        let table = parse_table(csv)?;
        if table.len() > self.config.max_rows {
            return Err(ImportError::TooManyRows {
                rows: table.len(),
                limit: self.config.max_rows,
            });
        }
        Ok(table)
    }

    /// Re-validates every row, resolves locations, writes in chunks and then
    /// recomputes every aggregate the written rows touched.
    async fn write_rows(
        &self,
        tenant_id: Uuid,
        dataset: Dataset,
        rows: &[RawRow],
        now: DateTime<Utc>,
    ) -> Result<CommitSummary, CommitFailure> {
        let schema = dataset.schema();
        let store = self.store.as_ref();
        let today = now.date_naive();
        let mut cache = LocationCache::new();
        let mut touched = RecomputeSet::default();
        let mut writer = BatchWriter::new(store, tenant_id, self.config.chunk_size);
        let mut errors = Vec::new();
        let mut failure = None;

        for row in rows {
            let mut draft = match schema.draft(row) {
                Ok(draft) => draft,
                Err(message) => {
                    errors.push(RowError::new(row.row_number, message));
                    continue;
                }
            };

            if let Some(label) = draft.location_label.as_deref() {
                match resolve_location(store, tenant_id, &mut cache, label).await {
                    Ok(Some(location)) => draft.op.assign_location(&location),
                    Ok(None) => {
                        errors.push(RowError::new(
                            row.row_number,
                            format!("Unable to resolve location '{label}'"),
                        ));
                        continue;
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            let key = draft.op.aggregate_key();
            let written = match draft.op {
                WriteOp::StockLevel(level) => {
                    match store
                        .stock_on_hand(tenant_id, &level.item_type, level.location_id)
                        .await
                    {
                        Ok(on_hand) => {
                            let balancing = level.balancing_transaction(on_hand, today);
                            let mut ops = vec![WriteOp::StockLevel(level)];
                            ops.extend(balancing.map(WriteOp::Transaction));
                            writer.write_row(&ops).await
                        }
                        Err(err) => Err(err),
                    }
                }
                WriteOp::Transaction(txn) => {
                    let unit_set = match txn.unit.as_deref() {
                        Some(unit) => {
                            store
                                .upsert_stock_unit(tenant_id, &txn.item_type, txn.location_id, unit)
                                .await
                        }
                        None => Ok(()),
                    };
                    match unit_set {
                        Ok(()) => writer.push(WriteOp::Transaction(txn)).await,
                        Err(err) => Err(err),
                    }
                }
                op => writer.push(op).await,
            };
            if let Some(key) = key {
                touched.touch(key);
            }
            if let Err(err) = written {
                failure = Some(err);
                break;
            }
        }

        if failure.is_none() {
            if let Err(err) = writer.finish().await {
                failure = Some(err);
            }
        }

        // Chunks written before a failure stay written, so their aggregates
        // are refreshed either way.
        let recompute = touched.run(self.recompute.as_ref(), tenant_id).await;

        if let Some(err) = failure {
            error!(
                %tenant_id,
                %dataset,
                imported = writer.imported(),
                error = %err,
                "import write failed"
            );
            return Err(CommitFailure {
                imported: writer.imported(),
                skipped: errors.len(),
                message: err.to_string(),
            });
        }

        if cache.created() > 0 {
            info!(
                %tenant_id,
                %dataset,
                created = cache.created(),
                "created locations during import"
            );
        }

        Ok(CommitSummary {
            imported: writer.imported(),
            errors,
            recompute_failures: recompute.failures,
        })
    }

    async fn audit(
        &self,
        principal: &Principal,
        action: &str,
        dataset: Dataset,
        job_id: Option<Uuid>,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        let event = AuditEvent::new(principal, action, dataset, job_id, details, now);
        if let Err(err) = self.audit.record(&event).await {
            warn!(action, error = %err, "failed to record audit event");
        }
    }
}
