use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

/// A derived aggregate that must be refreshed after rows under it change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggregateKey {
    StockBalance {
        item_type: String,
        location_id: Option<Uuid>,
    },
    ProcessingTotals {
        location_id: Uuid,
        coffee_type: String,
    },
}

#[async_trait]
pub trait AggregateRecompute: Send + Sync {
    /// Recomputes the stock balance for one (item type, location) key.
    async fn recalculate_inventory(
        &self,
        tenant_id: Uuid,
        item_type: &str,
        location_id: Option<Uuid>,
    ) -> anyhow::Result<()>;

    /// Recomputes cumulative processing totals for one (location, coffee type) key.
    async fn recompute_processing_totals(
        &self,
        tenant_id: Uuid,
        location_id: Uuid,
        coffee_type: &str,
    ) -> anyhow::Result<()>;
}

/// Distinct keys touched during one import, in first-touch order.
#[derive(Debug, Default)]
pub struct RecomputeSet {
    seen: HashSet<AggregateKey>,
    ordered: Vec<AggregateKey>,
}

#[derive(Debug, Default)]
pub struct RecomputeOutcome {
    pub recomputed: usize,
    pub failures: Vec<String>,
}

impl RecomputeSet {
    /// Returns `false` when the key was already recorded.
    pub fn touch(&mut self, key: AggregateKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.ordered.push(key);
        true
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn keys(&self) -> &[AggregateKey] {
        &self.ordered
    }

    /// Runs one recompute per key. A failing key is logged and reported
    /// back; the remaining keys still run.
    pub async fn run<R>(self, recompute: &R, tenant_id: Uuid) -> RecomputeOutcome
    where
        R: AggregateRecompute + ?Sized,
    {
        let mut outcome = RecomputeOutcome::default();
        for key in self.ordered {
            let result = match &key {
                AggregateKey::StockBalance {
                    item_type,
                    location_id,
                } => {
                    recompute
                        .recalculate_inventory(tenant_id, item_type, *location_id)
                        .await
                }
                AggregateKey::ProcessingTotals {
                    location_id,
                    coffee_type,
                } => {
                    recompute
                        .recompute_processing_totals(tenant_id, *location_id, coffee_type)
                        .await
                }
            };
            match result {
                Ok(()) => {
                    debug!(%tenant_id, ?key, "recomputed aggregate");
                    outcome.recomputed += 1;
                }
                Err(err) => {
                    warn!(%tenant_id, ?key, error = %err, "aggregate recompute failed");
                    outcome.failures.push(format!("{key:?}: {err}"));
                }
            }
        }
        outcome
    }
}
