//! Resource handlers for the read API.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::store::StoreError;
use crate::types::{
    BulkIssues, IssueRecord, OrganizationRecord, Owner, RepositoryRecord, ResourceChangeEvent,
    UserRepositoriesRecord,
};

use super::AppState;

/// Errors mapped onto HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid authorization")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Store(e) => {
                warn!(error = %e, "store error while serving read API");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// Verifies the pre-shared key. A missing configured key disables the check;
/// a failed check sleeps a second before answering.
async fn verify_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.preshared_key() else {
        return Ok(());
    };

    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if presented.is_some_and(|key| key.eq_ignore_ascii_case(expected)) {
        return Ok(());
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    Err(ApiError::Unauthorized)
}

fn parse_owner(owner_type: &str, owner_name: &str) -> Result<Owner, ApiError> {
    let owner = match owner_type {
        "org" => Owner::org(owner_name),
        "user" => Owner::user(owner_name),
        other => {
            return Err(ApiError::BadRequest(format!(
                "invalid owner type: {}",
                other
            )));
        }
    };
    owner.map_err(|e| ApiError::BadRequest(e.to_string()))
}

pub async fn get_organization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<OrganizationRecord>, ApiError> {
    verify_auth(&state, &headers).await?;

    state
        .store()
        .get_organization(&name)?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

pub async fn get_user_repositories(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<UserRepositoriesRecord>, ApiError> {
    verify_auth(&state, &headers).await?;

    state
        .store()
        .get_user_repositories(&name)?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

pub async fn get_repository(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((owner_type, owner_name, repo_name)): Path<(String, String, String)>,
) -> Result<Json<RepositoryRecord>, ApiError> {
    verify_auth(&state, &headers).await?;

    let owner = parse_owner(&owner_type, &owner_name)?;
    state
        .store()
        .get_repository(&owner, &repo_name)?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

pub async fn get_issue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((owner_type, owner_name, repo_name, issue_number)): Path<(String, String, String, i64)>,
) -> Result<Json<IssueRecord>, ApiError> {
    verify_auth(&state, &headers).await?;

    let owner = parse_owner(&owner_type, &owner_name)?;
    state
        .store()
        .get_issue(&owner, &repo_name, issue_number)?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

/// Query parameters of the bulk issue endpoint: either an inclusive range or
/// a comma-separated list.
#[derive(Debug, Deserialize)]
pub struct BulkIssueParams {
    pub start: Option<i64>,
    pub end: Option<i64>,
    #[serde(rename = "issueList")]
    pub issue_list: Option<String>,
}

pub async fn get_bulk_issues(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((owner_type, owner_name, repo_name)): Path<(String, String, String)>,
    Query(params): Query<BulkIssueParams>,
) -> Result<Json<BulkIssues>, ApiError> {
    verify_auth(&state, &headers).await?;

    let owner = parse_owner(&owner_type, &owner_name)?;

    let numbers: Vec<i64> = match (params.start, params.end, &params.issue_list) {
        (Some(start), Some(end), _) => (start..=end).collect(),
        (_, _, Some(list)) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse()
                    .map_err(|_| ApiError::BadRequest(format!("invalid issue number: {}", s)))
            })
            .collect::<Result<_, _>>()?,
        _ => {
            return Err(ApiError::BadRequest(
                "either start+end or issueList is required".to_string(),
            ));
        }
    };

    let mut result = BulkIssues::default();
    for number in numbers {
        if let Some(issue) = state.store().get_issue(&owner, &repo_name, number)? {
            result.issues.push(issue);
        }
    }

    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ChangeEventParams {
    /// Epoch milliseconds; entries at or after this time are returned.
    pub since: i64,
}

pub async fn get_change_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ChangeEventParams>,
) -> Result<Json<Vec<ResourceChangeEvent>>, ApiError> {
    verify_auth(&state, &headers).await?;

    let events = state.store().read_recent_change_events(params.since)?;
    Ok(Json(events))
}

pub async fn trigger_full_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    verify_auth(&state, &headers).await?;

    state.full_scan_requested().store(true, Ordering::SeqCst);
    Ok(StatusCode::ACCEPTED)
}

pub async fn health() -> &'static str {
    "OK"
}
