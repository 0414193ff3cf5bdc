use std::env;
use std::sync::Arc;

use anyhow::Result;
use estate_core::jobs::JobStatus;
use estate_core::{db, ImportConfig, ImportRequest, ImportService, PgStore, Principal, Role};
use uuid::Uuid;

#[tokio::test]
async fn import_round_trip_when_database_available() -> Result<()> {
    let database_url = match env::var("ESTATE_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping postgres import test because ESTATE_TEST_DATABASE_URL is not set");
            return Ok(());
        }
    };

    let pool = db::connect(&database_url, 4).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let service =
        ImportService::new(store.clone(), store.clone(), store.clone(), ImportConfig::default());
    let principal = Principal::new(Uuid::new_v4(), "integration", Role::Owner);

    let csv = "Date,Location,Item Type,Transaction Type,Quantity,Price,Unit\n\
2024-04-01,Store Room,Urea,Restock,50,20,kg\n\
2024-04-05,store room,Urea,Deplete,15,,kg\n";

    let preview = service
        .handle(&principal, ImportRequest::validate("transactions", csv))
        .await?;
    assert!(preview.valid);
    let token = preview.validation_token.expect("ledger is provisioned");

    let committed = service
        .handle(&principal, ImportRequest::commit_token("transactions", token))
        .await?;
    assert_eq!(committed.imported, 2);

    let job = service.job(&principal, &token.to_string()).await?;
    assert_eq!(job.status, JobStatus::Committed);

    let quantity: f64 = sqlx::query_scalar(
        "SELECT quantity FROM stock_levels WHERE tenant_id = $1 AND item_type = 'Urea'",
    )
    .bind(principal.tenant_id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(quantity, 35.0);

    let locations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM locations WHERE tenant_id = $1")
        .bind(principal.tenant_id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(locations, 1);

    Ok(())
}
