//! Read-only HTTP API over the mirrored resources.
//!
//! Every resource endpoint verifies the pre-shared key from the
//! `Authorization` header before touching the store. A failed check sleeps
//! one second (cheap brute-force damping) and answers 401. Reads go through
//! the engine's cache + store. Nothing here writes mirror data; the only
//! mutation is flagging a full-scan request for the scheduler.
//!
//! # Endpoints
//!
//! - `GET /organization/{name}`
//! - `GET /user-repositories/{name}`
//! - `GET /repository/{ownerType}/{ownerName}/{repoName}`
//! - `GET /issue/{ownerType}/{ownerName}/{repoName}/{issueNumber}`
//! - `GET /bulk/issue/{ownerType}/{ownerName}/{repoName}?start=&end=` or `?issueList=1,2,3`
//! - `GET /resourceChangeEvent?since=<epoch-ms>`
//! - `POST /fullScan`
//! - `GET /health`

pub mod routes;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use axum::Router;
use axum::routing::{get, post};

use crate::store::Store;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn Store>,
    preshared_key: Option<String>,
    full_scan_requested: Arc<AtomicBool>,
}

impl AppState {
    /// Creates the handler state.
    ///
    /// `full_scan_requested` is the same flag the scheduler consumes (see
    /// `MirrorEngine::full_scan_signal`). A `None` pre-shared key disables
    /// the auth check.
    pub fn new(
        store: Arc<dyn Store>,
        preshared_key: Option<String>,
        full_scan_requested: Arc<AtomicBool>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                store,
                preshared_key,
                full_scan_requested,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn preshared_key(&self) -> Option<&str> {
        self.inner.preshared_key.as_deref()
    }

    pub fn full_scan_requested(&self) -> &Arc<AtomicBool> {
        &self.inner.full_scan_requested
    }
}

/// Builds the axum router with all endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/organization/{name}", get(routes::get_organization))
        .route(
            "/user-repositories/{name}",
            get(routes::get_user_repositories),
        )
        .route(
            "/repository/{ownerType}/{ownerName}/{repoName}",
            get(routes::get_repository),
        )
        .route(
            "/issue/{ownerType}/{ownerName}/{repoName}/{issueNumber}",
            get(routes::get_issue),
        )
        .route(
            "/bulk/issue/{ownerType}/{ownerName}/{repoName}",
            get(routes::get_bulk_issues),
        )
        .route("/resourceChangeEvent", get(routes::get_change_events))
        .route("/fullScan", post(routes::trigger_full_scan))
        .route("/health", get(routes::health))
        .with_state(state)
}
