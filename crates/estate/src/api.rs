use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use estate_core::{
    ImportError, ImportJob, ImportRequest, ImportResponse, ImportService, Module, Principal, Role,
};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const ROLE_HEADER: &str = "x-role";
pub const MODULES_HEADER: &str = "x-modules";

#[derive(Clone)]
pub struct AppState {
    pub imports: ImportService,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/imports", post(submit_import))
        .route("/imports/{token}", get(import_job))
        .with_state(state)
}

async fn submit_import(
    State(state): State<Arc<AppState>>,
    Caller(principal): Caller,
    Json(request): Json<ImportRequest>,
) -> Result<Json<ImportResponse>, ApiError> {
    Ok(Json(state.imports.handle(&principal, request).await?))
}

async fn import_job(
    State(state): State<Arc<AppState>>,
    Caller(principal): Caller,
    Path(token): Path<String>,
) -> Result<Json<ImportJob>, ApiError> {
    Ok(Json(state.imports.job(&principal, &token).await?))
}

/// The authenticated caller, as forwarded by the gateway in request headers.
pub struct Caller(pub Principal);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        principal_from_headers(&parts.headers).map(Caller)
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub fn principal_from_headers(headers: &HeaderMap) -> Result<Principal, ApiError> {
    let tenant_id = header(headers, TENANT_HEADER)
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or_else(|| {
            ApiError::unauthorized(format!("missing or invalid {TENANT_HEADER} header"))
        })?;
    let username = header(headers, USER_HEADER)
        .ok_or_else(|| ApiError::unauthorized(format!("missing {USER_HEADER} header")))?;
    let role = match header(headers, ROLE_HEADER) {
        Some(value) => value.parse::<Role>().map_err(ApiError::unauthorized)?,
        None => Role::User,
    };

    let mut principal = Principal::new(tenant_id, username, role);
    if let Some(user_id) = header(headers, USER_ID_HEADER) {
        let user_id = Uuid::parse_str(user_id)
            .map_err(|_| ApiError::unauthorized(format!("invalid {USER_ID_HEADER} header")))?;
        principal = principal.with_user_id(user_id);
    }
    if let Some(modules) = header(headers, MODULES_HEADER) {
        let modules = modules
            .split(',')
            .map(str::trim)
            .filter(|module| !module.is_empty())
            .map(str::parse::<Module>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ApiError::unauthorized)?;
        principal = principal.with_modules(modules);
    }
    Ok(principal)
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    Import(ImportError),
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized(message.into())
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        ApiError::Import(err)
    }
}

pub fn status_for(err: &ImportError) -> StatusCode {
    match err {
        ImportError::UnsupportedDataset(_)
        | ImportError::EmptyInput
        | ImportError::MalformedInput(_)
        | ImportError::TooManyRows { .. } => StatusCode::BAD_REQUEST,
        ImportError::ModuleDisabled { .. } | ImportError::ReadOnlyRole { .. } => {
            StatusCode::FORBIDDEN
        }
        ImportError::TokenNotFound => StatusCode::NOT_FOUND,
        ImportError::TokenInvalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ImportError::TokenAlreadyCommitted | ImportError::TokenNotReady { .. } => {
            StatusCode::CONFLICT
        }
        ImportError::TokenExpired => StatusCode::GONE,
        ImportError::LedgerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ImportError::CommitFailed { .. } | ImportError::Transition(_) | ImportError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::Unauthorized(message) => {
                let body = json!({ "error": message, "code": "unauthorized" });
                return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
            }
            ApiError::Import(err) => err,
        };

        let status = status_for(&err);
        if status.is_server_error() {
            error!(code = err.code(), error = %err, "import request failed");
        }

        let mut body = json!({ "error": err.to_string(), "code": err.code() });
        match &err {
            ImportError::TokenInvalid { errors } => {
                body["errors"] = json!(errors);
            }
            ImportError::CommitFailed {
                imported,
                skipped,
                validation_token,
                ..
            } => {
                body["imported"] = json!(imported);
                body["skipped"] = json!(skipped);
                body["validationToken"] = json!(validation_token);
            }
            ImportError::TooManyRows { limit, .. } => {
                body["limit"] = json!(limit);
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}
