use estate_parser::TableError;
use thiserror::Error;
use uuid::Uuid;

use crate::access::{Module, Role};
use crate::datasets::RowError;
use crate::jobs::{JobStatus, TokenRejection, TransitionError};

/// Failures raised by a storage collaborator.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The import ledger table does not exist for this deployment.
    #[error("import ledger is not provisioned")]
    LedgerUnavailable,

    #[error("database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Request-level outcomes of an import call. Row-level problems are never
/// reported here; they travel as [`RowError`]s inside a successful response.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("unsupported dataset '{0}'")]
    UnsupportedDataset(String),

    #[error("CSV input is empty")]
    EmptyInput,

    #[error("CSV input could not be read: {0}")]
    MalformedInput(String),

    #[error("import has {rows} rows which exceeds the limit of {limit}")]
    TooManyRows { rows: usize, limit: usize },

    #[error("the {module} module is not enabled for this account")]
    ModuleDisabled { module: Module },

    #[error("role '{role}' is read-only and cannot import data")]
    ReadOnlyRole { role: Role },

    #[error("validation token not found for this dataset")]
    TokenNotFound,

    #[error("validation token failed validation with {} row errors", errors.len())]
    TokenInvalid { errors: Vec<RowError> },

    #[error("validation token has already been used")]
    TokenAlreadyCommitted,

    #[error("validation token has expired; validate the file again")]
    TokenExpired,

    #[error("validation token is not ready to commit (status {status})")]
    TokenNotReady { status: JobStatus },

    #[error("bulk import is not enabled for this deployment")]
    LedgerUnavailable,

    #[error("commit failed after {imported} rows were written: {message}")]
    CommitFailed {
        imported: usize,
        skipped: usize,
        message: String,
        validation_token: Option<Uuid>,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(StoreError),
}

impl ImportError {
    /// Stable machine-readable identifier for the outcome.
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::UnsupportedDataset(_) => "unsupported_dataset",
            ImportError::EmptyInput => "empty_input",
            ImportError::MalformedInput(_) => "malformed_input",
            ImportError::TooManyRows { .. } => "too_many_rows",
            ImportError::ModuleDisabled { .. } => "module_disabled",
            ImportError::ReadOnlyRole { .. } => "read_only_role",
            ImportError::TokenNotFound => "token_not_found",
            ImportError::TokenInvalid { .. } => "token_invalid",
            ImportError::TokenAlreadyCommitted => "token_already_committed",
            ImportError::TokenExpired => "token_expired",
            ImportError::TokenNotReady { .. } => "token_not_ready",
            ImportError::LedgerUnavailable => "feature_not_enabled",
            ImportError::CommitFailed { .. } => "commit_failed",
            ImportError::Transition(_) => "invalid_transition",
            ImportError::Store(_) => "storage_error",
        }
    }
}

impl From<StoreError> for ImportError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LedgerUnavailable => ImportError::LedgerUnavailable,
            other => ImportError::Store(other),
        }
    }
}

impl From<TableError> for ImportError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::MissingHeader | TableError::Empty => ImportError::EmptyInput,
            TableError::Csv { source } => ImportError::MalformedInput(source.to_string()),
        }
    }
}

impl From<TokenRejection> for ImportError {
    fn from(rejection: TokenRejection) -> Self {
        match rejection {
            TokenRejection::Invalid { errors } => ImportError::TokenInvalid { errors },
            TokenRejection::AlreadyCommitted => ImportError::TokenAlreadyCommitted,
            TokenRejection::Expired => ImportError::TokenExpired,
            TokenRejection::NotReady { status } => ImportError::TokenNotReady { status },
        }
    }
}
