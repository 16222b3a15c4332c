use chrono::{DateTime, Utc};
use mediator::Request;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::archive::gateway::GatewayError;
use crate::archive::types::QueryState;
use crate::features::FeatureState;
use crate::storage::DOWNLOAD_URL_EXPIRY;

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadQuery {
    pub execution_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub download_url: String,
    pub expires_in: u64,
    pub file_size: i64,
    pub last_modified: Option<DateTime<Utc>>,
    pub query_execution_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Query not completed successfully")]
    NotSucceeded,
    #[error("Query has no output location")]
    NoOutput,
    #[error("object storage is not configured")]
    StorageNotConfigured,
    #[error("Presigning failed: {0}")]
    Storage(#[from] anyhow::Error),
    #[error(transparent)]
    Engine(#[from] GatewayError),
}

impl Request<Result<DownloadResponse, DownloadError>> for DownloadQuery {}

/// Presigned link to the output of a succeeded query
#[tracing::instrument(skip(state))]
pub async fn handle(
    state: &FeatureState,
    query: DownloadQuery,
) -> Result<DownloadResponse, DownloadError> {
    let execution_id = query.execution_id;
    let execution = state.engine().get_query_execution(&execution_id).await?;
    if execution.state != QueryState::Succeeded {
        return Err(DownloadError::NotSucceeded);
    }
    let location = execution.output_location.ok_or(DownloadError::NoOutput)?;

    let storage = state
        .storage
        .as_ref()
        .ok_or(DownloadError::StorageNotConfigured)?;
    let download_url = storage
        .presigned_download(&location, DOWNLOAD_URL_EXPIRY)
        .await?;

    let (file_size, last_modified) = match storage.get_metadata(&location).await {
        Ok(metadata) => (metadata.size, metadata.last_modified),
        Err(e) => {
            warn!(error = %e, "Could not read query output metadata");
            (0, None)
        },
    };

    Ok(DownloadResponse {
        download_url,
        expires_in: DOWNLOAD_URL_EXPIRY.as_secs(),
        file_size,
        last_modified,
        query_execution_id: execution_id,
    })
}
