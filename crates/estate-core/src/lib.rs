//! Two-phase CSV import for estate ledger datasets.
//!
//! A validate request parses and checks a file, stores it in the import
//! ledger and returns a short-lived token. Committing the token replays the
//! stored content through the same checks, writes rows in chunks and then
//! refreshes the aggregates the rows touched.

pub mod access;
pub mod audit;
pub mod batch;
pub mod datasets;
pub mod db;
pub mod error;
pub mod import;
pub mod jobs;
pub mod locations;
pub mod memory;
pub mod postgres;
pub mod recompute;
pub mod records;
pub mod store;

pub use access::{Module, Principal, Role};
pub use audit::{AuditEvent, AuditSink, TracingAudit};
pub use datasets::{Dataset, RowError};
pub use error::{ImportError, StoreError};
pub use import::{ImportConfig, ImportRequest, ImportResponse, ImportService};
pub use jobs::{ImportJob, ImportMode, JobStatus};
pub use memory::MemoryStore;
pub use postgres::PgStore;
