use std::collections::HashMap;

use axum::{
    extract::{Json, Path, Query, State},
    http::{header, request, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use portkeeper::{
    AllocateRequest, AllocateResponse, Allocator, Dashboard, Group, GroupAllocation,
    GroupRelease, GroupReleaseRequest, GroupRequest, LookupResponse, PortAllocation,
    ProbeResult, ReleaseRequest, ReleaseResponse,
};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::assets;
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/alloc", post(allocate_port))
        .route("/release", post(release_port))
        .route("/list", get(list_allocations))
        .route("/lookup", get(lookup))
        .route("/dashboard", get(dashboard))
        .route("/groups", get(list_groups).post(allocate_group))
        .route("/groups/release", post(release_group))
        .route("/probe/{port}", get(probe))
        .fallback(assets::static_handler)
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(same_origin))
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .with_state(state)
}

/// Only the dashboard page the daemon itself serves may call it from a browser.
fn same_origin(origin: &HeaderValue, parts: &request::Parts) -> bool {
    let Some(host) = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
    else {
        return false;
    };
    origin
        .to_str()
        .is_ok_and(|o| o.strip_prefix("http://") == Some(host))
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<portkeeper::Error> for ApiError {
    fn from(err: portkeeper::Error) -> Self {
        use portkeeper::Error as E;
        let status = match &err {
            E::NoAvailablePorts { .. } | E::GroupAllocationFailed { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            E::PortOccupied { .. } | E::AlreadyAllocated { .. } | E::StillUnavailable { .. } => {
                StatusCode::CONFLICT
            }
            E::InvalidRange { .. }
            | E::InvalidRangeSyntax(_)
            | E::InvalidGroupSize
            | E::DuplicateRole(_)
            | E::Config(_) => StatusCode::BAD_REQUEST,
            E::KillFailed { .. } | E::Inspection { .. } | E::Io(_) | E::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Run an allocator call on the blocking pool; registry access takes a file lock.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Allocator) -> portkeeper::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let allocator = state.allocator.clone();
    tokio::task::spawn_blocking(move || f(&allocator))
        .await
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })?
        .map_err(ApiError::from)
}

async fn allocate_port(
    State(state): State<AppState>,
    Json(payload): Json<AllocateRequest>,
) -> Result<Json<AllocateResponse>, ApiError> {
    let response = blocking(&state, move |allocator| {
        let range = payload.range.unwrap_or_else(|| allocator.default_range());
        let entry = allocator.allocate_entry(range, payload.claim)?;
        Ok(AllocateResponse {
            port: entry.port,
            allocation: Some(entry.allocation),
        })
    })
    .await?;
    Ok(Json(response))
}

async fn release_port(
    State(state): State<AppState>,
    Json(payload): Json<ReleaseRequest>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let port = payload.port;
    let released = blocking(&state, move |allocator| allocator.release(port)).await?;
    Ok(Json(ReleaseResponse { port, released }))
}

async fn list_allocations(
    State(state): State<AppState>,
) -> Result<Json<Vec<PortAllocation>>, ApiError> {
    Ok(Json(
        blocking(&state, |allocator| allocator.list_allocations()).await?,
    ))
}

async fn lookup(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<LookupResponse>, ApiError> {
    let app = params.get("app").cloned();
    let worktree = params.get("worktree").cloned();
    if app.is_none() && worktree.is_none() {
        return Err(ApiError {
            status: StatusCode::BAD_REQUEST,
            message: "expected an `app` or `worktree` query parameter".to_string(),
        });
    }

    let (app_filter, worktree_filter) = (app.clone(), worktree.clone());
    let allocations = blocking(&state, move |allocator| {
        let mut matching = match &app_filter {
            Some(app) => allocator.ports_by_app(app)?,
            None => allocator.list_allocations()?,
        };
        if let Some(worktree) = &worktree_filter {
            matching.retain(|a| a.allocation.worktree() == Some(worktree.as_str()));
        }
        Ok(matching)
    })
    .await?;

    let all_ports: Vec<u16> = allocations.iter().map(|a| a.port).collect();
    Ok(Json(LookupResponse {
        app,
        worktree,
        port: all_ports.first().copied(),
        all_ports,
        allocations,
    }))
}

async fn dashboard(State(state): State<AppState>) -> Result<Json<Dashboard>, ApiError> {
    Ok(Json(
        blocking(&state, |allocator| allocator.all_grouped()).await?,
    ))
}

async fn list_groups(State(state): State<AppState>) -> Result<Json<Vec<Group>>, ApiError> {
    Ok(Json(blocking(&state, |allocator| allocator.groups()).await?))
}

async fn allocate_group(
    State(state): State<AppState>,
    Json(payload): Json<GroupRequest>,
) -> Result<Json<GroupAllocation>, ApiError> {
    let group = blocking(&state, move |allocator| {
        allocator.allocate_group(payload.count, payload.metadata, &payload.roles)
    })
    .await?;
    Ok(Json(group))
}

async fn release_group(
    State(state): State<AppState>,
    Json(payload): Json<GroupReleaseRequest>,
) -> Result<Json<GroupRelease>, ApiError> {
    let released = blocking(&state, move |allocator| {
        allocator.release_group(&payload.group_id)
    })
    .await?;
    Ok(Json(released))
}

async fn probe(State(state): State<AppState>, Path(port): Path<u16>) -> Json<ProbeResult> {
    Json(state.allocator.probe(port))
}
