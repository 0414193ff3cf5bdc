//! Postgres-backed store, recompute and audit sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgRow, Postgres};
use sqlx::{Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::datasets::{Dataset, RowError};
use crate::db::DbPool;
use crate::error::StoreError;
use crate::jobs::{ImportJob, ImportMode, JobStatus};
use crate::locations::Location;
use crate::recompute::AggregateRecompute;
use crate::records::WriteOp;
use crate::store::ImportStore;

const UNDEFINED_TABLE: &str = "42P01";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// Ledger queries report a missing `import_jobs` table as
/// [`StoreError::LedgerUnavailable`].
fn ledger_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNDEFINED_TABLE) {
            return StoreError::LedgerUnavailable;
        }
    }
    StoreError::Sqlx(err)
}

fn count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn job_from_row(row: &PgRow) -> Result<ImportJob, StoreError> {
    let dataset: String = row.try_get("dataset")?;
    let mode: String = row.try_get("mode")?;
    let status: String = row.try_get("status")?;
    let errors: Value = row.try_get("errors")?;
    let errors: Vec<RowError> = serde_json::from_value(errors)?;

    Ok(ImportJob {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        requested_by: row.try_get("requested_by")?,
        requested_by_id: row.try_get("requested_by_id")?,
        dataset: dataset.parse::<Dataset>().map_err(StoreError::Backend)?,
        mode: mode.parse::<ImportMode>().map_err(StoreError::Backend)?,
        status: status.parse::<JobStatus>().map_err(StoreError::Backend)?,
        content_fingerprint: row.try_get("content_fingerprint")?,
        raw_content: row.try_get("raw_content")?,
        row_count: row.try_get::<i64, _>("row_count")?.max(0) as usize,
        imported_count: row.try_get::<i64, _>("imported_count")?.max(0) as usize,
        skipped_count: row.try_get::<i64, _>("skipped_count")?.max(0) as usize,
        error_count: row.try_get::<i64, _>("error_count")?.max(0) as usize,
        errors,
        metadata: row.try_get("metadata")?,
        expires_at: row.try_get::<Option<DateTime<Utc>>, _>("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        committed_at: row.try_get::<Option<DateTime<Utc>>, _>("committed_at")?,
    })
}

fn location_from_row(row: &PgRow) -> Result<Location, StoreError> {
    Ok(Location {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        code: row.try_get("code")?,
        estate_label: row.try_get("estate_label")?,
    })
}

const LOCATION_COLUMNS: &str = "id, tenant_id, name, code, estate_label";

async fn write_op(
    db_tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    op: &WriteOp,
) -> Result<(), sqlx::Error> {
    match op {
        WriteOp::Processing(record) => {
            let m = &record.measurements;
            sqlx::query(
                r#"
                INSERT INTO processing_records (
                    tenant_id, location_id, coffee_type, process_date,
                    crop_today_kg, ripe_today_kg, green_today_kg, float_today_kg,
                    wet_parchment_kg, dry_parchment_kg, dry_cherry_kg,
                    dry_parchment_bags, dry_cherry_bags, notes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (tenant_id, location_id, coffee_type, process_date) DO UPDATE SET
                    crop_today_kg = EXCLUDED.crop_today_kg,
                    ripe_today_kg = EXCLUDED.ripe_today_kg,
                    green_today_kg = EXCLUDED.green_today_kg,
                    float_today_kg = EXCLUDED.float_today_kg,
                    wet_parchment_kg = EXCLUDED.wet_parchment_kg,
                    dry_parchment_kg = EXCLUDED.dry_parchment_kg,
                    dry_cherry_kg = EXCLUDED.dry_cherry_kg,
                    dry_parchment_bags = EXCLUDED.dry_parchment_bags,
                    dry_cherry_bags = EXCLUDED.dry_cherry_bags,
                    notes = EXCLUDED.notes,
                    updated_at = now()
                "#,
            )
            .bind(tenant_id)
            .bind(record.location_id)
            .bind(&record.coffee_type)
            .bind(record.process_date)
            .bind(m.crop_today_kg)
            .bind(m.ripe_today_kg)
            .bind(m.green_today_kg)
            .bind(m.float_today_kg)
            .bind(m.wet_parchment_kg)
            .bind(m.dry_parchment_kg)
            .bind(m.dry_cherry_kg)
            .bind(m.dry_parchment_bags)
            .bind(m.dry_cherry_bags)
            .bind(&record.notes)
            .execute(&mut **db_tx)
            .await?;
        }
        WriteOp::Pepper(record) => {
            sqlx::query(
                r#"
                INSERT INTO pepper_records (
                    tenant_id, location_id, record_date, kg_picked,
                    green_pepper_kg, green_pepper_percent, dry_pepper_kg, dry_pepper_percent, notes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (tenant_id, location_id, record_date) DO UPDATE SET
                    kg_picked = EXCLUDED.kg_picked,
                    green_pepper_kg = EXCLUDED.green_pepper_kg,
                    green_pepper_percent = EXCLUDED.green_pepper_percent,
                    dry_pepper_kg = EXCLUDED.dry_pepper_kg,
                    dry_pepper_percent = EXCLUDED.dry_pepper_percent,
                    notes = EXCLUDED.notes,
                    updated_at = now()
                "#,
            )
            .bind(tenant_id)
            .bind(record.location_id)
            .bind(record.record_date)
            .bind(record.kg_picked)
            .bind(record.green_pepper_kg)
            .bind(record.green_pepper_percent)
            .bind(record.dry_pepper_kg)
            .bind(record.dry_pepper_percent)
            .bind(&record.notes)
            .execute(&mut **db_tx)
            .await?;
        }
        WriteOp::Rainfall(record) => {
            sqlx::query(
                r#"
                INSERT INTO rainfall_records (tenant_id, record_date, inches, millimeters, notes)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(tenant_id)
            .bind(record.record_date)
            .bind(record.inches)
            .bind(record.millimeters)
            .bind(&record.notes)
            .execute(&mut **db_tx)
            .await?;
        }
        WriteOp::Dispatch(record) => {
            sqlx::query(
                r#"
                INSERT INTO dispatch_records (
                    tenant_id, location_id, estate, dispatch_date, coffee_type, bag_type,
                    bags_dispatched, kgs_received, destination, notes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(tenant_id)
            .bind(record.location_id)
            .bind(&record.estate)
            .bind(record.dispatch_date)
            .bind(&record.coffee_type)
            .bind(record.bag_type.as_str())
            .bind(record.bags_dispatched)
            .bind(record.kgs_received)
            .bind(&record.destination)
            .bind(&record.notes)
            .execute(&mut **db_tx)
            .await?;
        }
        WriteOp::Sale(record) => {
            sqlx::query(
                r#"
                INSERT INTO sales_records (
                    tenant_id, location_id, sale_date, coffee_type, bag_type, buyer,
                    bags_sold, kgs_sold, bag_weight_kg, price_per_bag, price_per_kg, revenue, notes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(tenant_id)
            .bind(record.location_id)
            .bind(record.sale_date)
            .bind(&record.coffee_type)
            .bind(record.bag_type.as_str())
            .bind(&record.buyer)
            .bind(record.bags_sold)
            .bind(record.kgs_sold)
            .bind(record.bag_weight_kg)
            .bind(record.price_per_bag)
            .bind(record.price_per_kg)
            .bind(record.revenue)
            .bind(&record.notes)
            .execute(&mut **db_tx)
            .await?;
        }
        WriteOp::Transaction(record) => {
            sqlx::query(
                r#"
                INSERT INTO inventory_transactions (
                    tenant_id, location_id, item_type, transaction_date, kind,
                    quantity, price, total_cost, unit, notes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(tenant_id)
            .bind(record.location_id)
            .bind(&record.item_type)
            .bind(record.transaction_date)
            .bind(record.kind.as_str())
            .bind(record.quantity)
            .bind(record.price)
            .bind(record.total_cost)
            .bind(&record.unit)
            .bind(&record.notes)
            .execute(&mut **db_tx)
            .await?;
        }
        WriteOp::StockLevel(level) => {
            sqlx::query(
                r#"
                INSERT INTO stock_levels (
                    tenant_id, item_type, location_id, quantity, unit, unit_price, as_of, notes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (tenant_id, item_type, location_id) DO UPDATE SET
                    quantity = EXCLUDED.quantity,
                    unit = COALESCE(EXCLUDED.unit, stock_levels.unit),
                    unit_price = EXCLUDED.unit_price,
                    as_of = EXCLUDED.as_of,
                    notes = EXCLUDED.notes,
                    updated_at = now()
                "#,
            )
            .bind(tenant_id)
            .bind(&level.item_type)
            .bind(level.location_id)
            .bind(level.quantity)
            .bind(&level.unit)
            .bind(level.unit_price)
            .bind(level.as_of)
            .bind(&level.notes)
            .execute(&mut **db_tx)
            .await?;
        }
        WriteOp::Labor(record) => {
            sqlx::query(
                r#"
                INSERT INTO labor_records (
                    tenant_id, location_id, work_date, activity, hf_laborers, hf_cost_per_laborer,
                    outside_laborers, outside_cost_per_laborer, total_cost, notes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(tenant_id)
            .bind(record.location_id)
            .bind(record.work_date)
            .bind(&record.activity)
            .bind(record.hf_laborers)
            .bind(record.hf_cost_per_laborer)
            .bind(record.outside_laborers)
            .bind(record.outside_cost_per_laborer)
            .bind(record.total_cost)
            .bind(&record.notes)
            .execute(&mut **db_tx)
            .await?;
        }
        WriteOp::Expense(record) => {
            sqlx::query(
                r#"
                INSERT INTO expense_records (
                    tenant_id, location_id, expense_date, category, description, amount, notes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(tenant_id)
            .bind(record.location_id)
            .bind(record.expense_date)
            .bind(&record.category)
            .bind(&record.description)
            .bind(record.amount)
            .bind(&record.notes)
            .execute(&mut **db_tx)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl ImportStore for PgStore {
    async fn insert_job(&self, job: &ImportJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO import_jobs (
                id, tenant_id, requested_by, requested_by_id, dataset, mode, status,
                content_fingerprint, raw_content, row_count, imported_count, skipped_count,
                error_count, errors, metadata, expires_at, created_at, updated_at, committed_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19
            )
            "#,
        )
        .bind(job.id)
        .bind(job.tenant_id)
        .bind(&job.requested_by)
        .bind(job.requested_by_id)
        .bind(job.dataset.as_str())
        .bind(job.mode.as_str())
        .bind(job.status.as_str())
        .bind(&job.content_fingerprint)
        .bind(&job.raw_content)
        .bind(count(job.row_count))
        .bind(count(job.imported_count))
        .bind(count(job.skipped_count))
        .bind(count(job.error_count))
        .bind(serde_json::to_value(&job.errors)?)
        .bind(&job.metadata)
        .bind(job.expires_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.committed_at)
        .execute(&self.pool)
        .await
        .map_err(ledger_error)?;
        Ok(())
    }

    async fn update_job(&self, job: &ImportJob, expected: JobStatus) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE import_jobs SET
                mode = $2,
                status = $3,
                row_count = $4,
                imported_count = $5,
                skipped_count = $6,
                error_count = $7,
                errors = $8,
                metadata = $9,
                expires_at = $10,
                updated_at = $11,
                committed_at = $12
            WHERE id = $1 AND status = $13
            "#,
        )
        .bind(job.id)
        .bind(job.mode.as_str())
        .bind(job.status.as_str())
        .bind(count(job.row_count))
        .bind(count(job.imported_count))
        .bind(count(job.skipped_count))
        .bind(count(job.error_count))
        .bind(serde_json::to_value(&job.errors)?)
        .bind(&job.metadata)
        .bind(job.expires_at)
        .bind(job.updated_at)
        .bind(job.committed_at)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(ledger_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<ImportJob>, StoreError> {
        let row = sqlx::query(r#"SELECT * FROM import_jobs WHERE id = $1 AND tenant_id = $2"#)
            .bind(job_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ledger_error)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_job_by_fingerprint(
        &self,
        tenant_id: Uuid,
        dataset: Dataset,
        fingerprint: &str,
        exclude: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM import_jobs
            WHERE tenant_id = $1 AND dataset = $2 AND content_fingerprint = $3 AND id <> $4
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(dataset.as_str())
        .bind(fingerprint)
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await
        .map_err(ledger_error)?;
        Ok(row.map(|row| row.try_get("id")).transpose()?)
    }

    async fn find_location_by_id(
        &self,
        tenant_id: Uuid,
        location_id: Uuid,
    ) -> Result<Option<Location>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LOCATION_COLUMNS} FROM locations WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(location_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn find_location_by_code(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<Option<Location>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LOCATION_COLUMNS} FROM locations \
             WHERE tenant_id = $1 AND upper(code) = upper($2)"
        ))
        .bind(tenant_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn list_locations(&self, tenant_id: Uuid) -> Result<Vec<Location>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOCATION_COLUMNS} FROM locations WHERE tenant_id = $1 ORDER BY created_at"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(location_from_row).collect()
    }

    async fn insert_location(
        &self,
        tenant_id: Uuid,
        code: &str,
        name: &str,
    ) -> Result<Option<Location>, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO locations (id, tenant_id, name, code) VALUES ($1, $2, $3, $4) \
             ON CONFLICT DO NOTHING RETURNING {LOCATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(name)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn write_batch(&self, tenant_id: Uuid, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut db_tx = self.pool.begin().await?;
        for op in ops {
            write_op(&mut db_tx, tenant_id, op).await?;
        }
        db_tx.commit().await?;
        debug!(%tenant_id, rows = ops.len(), "wrote import batch");
        Ok(())
    }

    async fn stock_on_hand(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
    ) -> Result<f64, StoreError> {
        let on_hand: f64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(CASE WHEN kind = 'restock' THEN quantity ELSE -quantity END), 0)
            FROM inventory_transactions
            WHERE tenant_id = $1 AND item_type = $2 AND location_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(tenant_id)
        .bind(item_type)
        .bind(location_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(on_hand)
    }

    async fn upsert_stock_unit(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
        unit: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stock_levels (tenant_id, item_type, location_id, quantity, unit)
            VALUES ($1, $2, $3, 0, $4)
            ON CONFLICT (tenant_id, item_type, location_id) DO UPDATE SET
                unit = EXCLUDED.unit,
                updated_at = now()
            "#,
        )
        .bind(tenant_id)
        .bind(item_type)
        .bind(location_id)
        .bind(unit)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AggregateRecompute for PgStore {
    async fn recalculate_inventory(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stock_levels (tenant_id, item_type, location_id, quantity, total_cost)
            SELECT $1, $2, $3,
                COALESCE(SUM(CASE WHEN kind = 'restock' THEN quantity ELSE -quantity END), 0),
                COALESCE(SUM(CASE WHEN kind = 'restock' THEN total_cost ELSE 0 END), 0)
            FROM inventory_transactions
            WHERE tenant_id = $1 AND item_type = $2 AND location_id IS NOT DISTINCT FROM $3
            ON CONFLICT (tenant_id, item_type, location_id) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                total_cost = EXCLUDED.total_cost,
                updated_at = now()
            "#,
        )
        .bind(tenant_id)
        .bind(item_type)
        .bind(location_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recompute_processing_totals(
        &self,
        tenant_id: Uuid,
        location_id: Uuid,
        coffee_type: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processing_totals (
                tenant_id, location_id, coffee_type, record_count, last_process_date,
                crop_total_kg, ripe_total_kg, green_total_kg, float_total_kg,
                wet_parchment_total_kg, dry_parchment_total_kg, dry_cherry_total_kg,
                dry_parchment_total_bags, dry_cherry_total_bags
            )
            SELECT $1, $2, $3, COUNT(*), MAX(process_date),
                COALESCE(SUM(crop_today_kg), 0), COALESCE(SUM(ripe_today_kg), 0),
                COALESCE(SUM(green_today_kg), 0), COALESCE(SUM(float_today_kg), 0),
                COALESCE(SUM(wet_parchment_kg), 0), COALESCE(SUM(dry_parchment_kg), 0),
                COALESCE(SUM(dry_cherry_kg), 0), COALESCE(SUM(dry_parchment_bags), 0),
                COALESCE(SUM(dry_cherry_bags), 0)
            FROM processing_records
            WHERE tenant_id = $1 AND location_id = $2 AND coffee_type = $3
            ON CONFLICT (tenant_id, location_id, coffee_type) DO UPDATE SET
                record_count = EXCLUDED.record_count,
                last_process_date = EXCLUDED.last_process_date,
                crop_total_kg = EXCLUDED.crop_total_kg,
                ripe_total_kg = EXCLUDED.ripe_total_kg,
                green_total_kg = EXCLUDED.green_total_kg,
                float_total_kg = EXCLUDED.float_total_kg,
                wet_parchment_total_kg = EXCLUDED.wet_parchment_total_kg,
                dry_parchment_total_kg = EXCLUDED.dry_parchment_total_kg,
                dry_cherry_total_kg = EXCLUDED.dry_cherry_total_kg,
                dry_parchment_total_bags = EXCLUDED.dry_parchment_total_bags,
                dry_cherry_total_bags = EXCLUDED.dry_cherry_total_bags,
                updated_at = now()
            "#,
        )
        .bind(tenant_id)
        .bind(location_id)
        .bind(coffee_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for PgStore {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, tenant_id, actor, action, dataset, job_id, details, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.tenant_id)
        .bind(&event.actor)
        .bind(&event.action)
        .bind(event.dataset.as_str())
        .bind(event.job_id)
        .bind(&event.details)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
