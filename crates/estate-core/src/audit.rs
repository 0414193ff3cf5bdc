use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::access::Principal;
use crate::datasets::Dataset;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub tenant_id: Uuid,
    pub actor: String,
    pub action: String,
    pub dataset: Dataset,
    pub job_id: Option<Uuid>,
    pub details: Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        principal: &Principal,
        action: &str,
        dataset: Dataset,
        job_id: Option<Uuid>,
        details: Value,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: principal.tenant_id,
            actor: principal.username.clone(),
            action: action.to_string(),
            dataset,
            job_id,
            details,
            recorded_at,
        }
    }
}

/// Receives one event per import outcome. Failures are logged by the caller
/// and never change the import result.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Emits audit events on the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

#[async_trait]
impl AuditSink for TracingAudit {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        info!(
            target: "audit",
            tenant_id = %event.tenant_id,
            actor = %event.actor,
            action = %event.action,
            dataset = %event.dataset,
            job_id = ?event.job_id,
            details = %event.details,
            "import audit event"
        );
        Ok(())
    }
}
