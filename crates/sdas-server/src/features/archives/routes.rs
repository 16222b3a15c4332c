//! Archive API routes
//!
//! # Route Structure
//!
//! - `GET /api/v1/archives/:id` - Get an archive record
//! - `POST /api/v1/archives/:id/run` - Configure ETL workers and start the workflow
//! - `POST /api/v1/archives/:id/query` - Run an interactive query
//! - `GET /api/v1/archives/:id/views` - List catalog views
//! - `DELETE /api/v1/archives/:id/views/:name` - Delete a view
//! - `PUT /api/v1/archives/:id/expiration` - Set expiration and data deletion
//! - `GET /api/v1/queries/:execution_id/download` - Presigned link to query output
//! - `POST /api/v1/events/job-state` - Job runner callback
//! - `POST /api/v1/events/query-state` - Query engine callback

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};

use crate::api::response::ApiResponse;
use crate::archive::{JobStateEvent, QueryStateEvent};
use crate::error::AppError;
use crate::features::FeatureState;

use super::{
    commands::{
        self, DeleteViewCommand, DeleteViewError, EventError, RunArchiveCommand, RunArchiveError,
        SetExpirationCommand, SetExpirationError,
    },
    queries::{
        self, DownloadError, DownloadQuery, GetArchiveError, GetArchiveQuery, ListViewsError,
        ListViewsQuery, RunQueryError, RunQueryRequest,
    },
};

pub fn archives_routes() -> Router<FeatureState> {
    Router::new()
        .route("/archives/:id", get(get_archive))
        .route("/archives/:id/run", post(run_archive))
        .route("/archives/:id/query", post(run_query))
        .route("/archives/:id/views", get(list_views))
        .route("/archives/:id/views/:name", delete(delete_view))
        .route("/archives/:id/expiration", put(set_expiration))
        .route("/queries/:execution_id/download", get(download_results))
        .route("/events/job-state", post(job_state_event))
        .route("/events/query-state", post(query_state_event))
}

// ============================================================================
// Command Handlers (Write Operations)
// ============================================================================

/// Configure and start an archive
///
/// # Response
///
/// - `202 Accepted` - Workflow started on a background task
/// - `200 OK` - Configuration stored, `run_now` was false
/// - `400 Bad Request` - Worker count out of range
/// - `404 Not Found` - Archive not found
/// - `409 Conflict` - Archive is no longer `Queued`
#[tracing::instrument(skip(state, command), fields(archive_id = %id))]
async fn run_archive(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
    Json(mut command): Json<RunArchiveCommand>,
) -> Result<Response, ArchivesApiError> {
    command.archive_id = id;
    let response = commands::run::handle(&state, command).await?;

    let status = if response.started {
        tracing::info!("Archive workflow started via API");
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ApiResponse::success(response))).into_response())
}

#[tracing::instrument(skip(state, command), fields(archive_id = %id))]
async fn set_expiration(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
    Json(mut command): Json<SetExpirationCommand>,
) -> Result<Response, ArchivesApiError> {
    command.archive_id = id;
    let settings = commands::expiration::handle(&state, command).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(settings))).into_response())
}

#[tracing::instrument(skip(state))]
async fn delete_view(
    State(state): State<FeatureState>,
    Path((archive_id, view_name)): Path<(String, String)>,
) -> Result<Response, ArchivesApiError> {
    let command = DeleteViewCommand {
        archive_id,
        view_name,
    };
    let response = commands::delete_view::handle(&state, command).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(response))).into_response())
}

#[tracing::instrument(skip(state, event), fields(job_name = %event.job_name))]
async fn job_state_event(
    State(state): State<FeatureState>,
    Json(event): Json<JobStateEvent>,
) -> Result<Response, ArchivesApiError> {
    let outcome = commands::events::handle_job_state(&state, event).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(outcome))).into_response())
}

#[tracing::instrument(skip(state, event), fields(execution_id = %event.execution_id))]
async fn query_state_event(
    State(state): State<FeatureState>,
    Json(event): Json<QueryStateEvent>,
) -> Result<Response, ArchivesApiError> {
    let outcome = commands::events::handle_query_state(&state, event).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(outcome))).into_response())
}

// ============================================================================
// Query Handlers (Read Operations)
// ============================================================================

#[tracing::instrument(skip(state))]
async fn get_archive(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
) -> Result<Response, ArchivesApiError> {
    let query = GetArchiveQuery { archive_id: id };
    let archive = queries::get::handle(&state, query).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(archive))).into_response())
}

/// Run an interactive query or fetch a further page of a previous one
///
/// # Response
///
/// - `200 OK` - One page of results
/// - `400 Bad Request` - Missing SQL, or the query failed or was cancelled
/// - `404 Not Found` - Archive not found
/// - `504 Gateway Timeout` - Still running when the wait budget ran out
#[tracing::instrument(skip(state, request), fields(archive_id = %id))]
async fn run_query(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
    Json(mut request): Json<RunQueryRequest>,
) -> Result<Response, ArchivesApiError> {
    request.archive_id = id;
    let page = queries::run_query::handle(&state, request).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(page))).into_response())
}

#[tracing::instrument(skip(state))]
async fn list_views(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
) -> Result<Response, ArchivesApiError> {
    let query = ListViewsQuery { archive_id: id };
    let response = queries::list_views::handle(&state, query).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(response))).into_response())
}

#[tracing::instrument(skip(state))]
async fn download_results(
    State(state): State<FeatureState>,
    Path(execution_id): Path<String>,
) -> Result<Response, ArchivesApiError> {
    let query = DownloadQuery { execution_id };
    let response = queries::download::handle(&state, query).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(response))).into_response())
}

// ============================================================================
// Error Handling
// ============================================================================

/// Unified error type for archive API routes
#[derive(Debug)]
enum ArchivesApiError {
    Run(RunArchiveError),
    Expiration(SetExpirationError),
    DeleteView(DeleteViewError),
    Event(EventError),
    Get(GetArchiveError),
    Query(RunQueryError),
    ListViews(ListViewsError),
    Download(DownloadError),
}

impl From<RunArchiveError> for ArchivesApiError {
    fn from(err: RunArchiveError) -> Self {
        Self::Run(err)
    }
}

impl From<SetExpirationError> for ArchivesApiError {
    fn from(err: SetExpirationError) -> Self {
        Self::Expiration(err)
    }
}

impl From<DeleteViewError> for ArchivesApiError {
    fn from(err: DeleteViewError) -> Self {
        Self::DeleteView(err)
    }
}

impl From<EventError> for ArchivesApiError {
    fn from(err: EventError) -> Self {
        Self::Event(err)
    }
}

impl From<GetArchiveError> for ArchivesApiError {
    fn from(err: GetArchiveError) -> Self {
        Self::Get(err)
    }
}

impl From<RunQueryError> for ArchivesApiError {
    fn from(err: RunQueryError) -> Self {
        Self::Query(err)
    }
}

impl From<ListViewsError> for ArchivesApiError {
    fn from(err: ListViewsError) -> Self {
        Self::ListViews(err)
    }
}

impl From<DownloadError> for ArchivesApiError {
    fn from(err: DownloadError) -> Self {
        Self::Download(err)
    }
}

impl From<ArchivesApiError> for AppError {
    fn from(err: ArchivesApiError) -> Self {
        match err {
            ArchivesApiError::Run(RunArchiveError::Archive(e))
            | ArchivesApiError::Expiration(SetExpirationError::Archive(e))
            | ArchivesApiError::DeleteView(DeleteViewError::Archive(e))
            | ArchivesApiError::Event(EventError::Archive(e))
            | ArchivesApiError::Get(GetArchiveError::Archive(e))
            | ArchivesApiError::Query(RunQueryError::Archive(e))
            | ArchivesApiError::ListViews(ListViewsError::Archive(e)) => AppError::Archive(e),

            ArchivesApiError::DeleteView(DeleteViewError::Catalog(e))
            | ArchivesApiError::Query(RunQueryError::Engine(e))
            | ArchivesApiError::ListViews(ListViewsError::Catalog(e))
            | ArchivesApiError::Download(DownloadError::Engine(e)) => AppError::from(e),

            ArchivesApiError::Expiration(SetExpirationError::StorageNotConfigured)
            | ArchivesApiError::Download(DownloadError::StorageNotConfigured) => {
                AppError::Config("object storage is not configured".to_string())
            },
            ArchivesApiError::Expiration(SetExpirationError::Lifecycle(e))
            | ArchivesApiError::Download(DownloadError::Storage(e)) => AppError::Storage(e),

            ArchivesApiError::Run(e @ RunArchiveError::NotQueued { .. }) => {
                AppError::Conflict(e.to_string())
            },
            ArchivesApiError::Expiration(e @ SetExpirationError::LegalHold(_)) => {
                AppError::Conflict(e.to_string())
            },
            ArchivesApiError::Query(e @ RunQueryError::StillRunning(_)) => {
                AppError::Timeout(e.to_string())
            },

            ArchivesApiError::Expiration(e) => AppError::Validation(e.to_string()),
            ArchivesApiError::DeleteView(e) => AppError::Validation(e.to_string()),
            ArchivesApiError::Get(e) => AppError::Validation(e.to_string()),
            ArchivesApiError::Query(e) => AppError::Validation(e.to_string()),
            ArchivesApiError::Download(e) => AppError::Validation(e.to_string()),
        }
    }
}

impl IntoResponse for ArchivesApiError {
    fn into_response(self) -> Response {
        AppError::from(self).into_response()
    }
}
