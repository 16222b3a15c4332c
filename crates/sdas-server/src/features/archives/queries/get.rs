use mediator::Request;
use serde::Deserialize;

use crate::archive::{Archive, ArchiveError};
use crate::features::FeatureState;

#[derive(Debug, Clone, Deserialize)]
pub struct GetArchiveQuery {
    pub archive_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GetArchiveError {
    #[error("archive id cannot be empty")]
    EmptyId,
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl Request<Result<Archive, GetArchiveError>> for GetArchiveQuery {}

pub async fn handle(
    state: &FeatureState,
    query: GetArchiveQuery,
) -> Result<Archive, GetArchiveError> {
    if query.archive_id.trim().is_empty() {
        return Err(GetArchiveError::EmptyId);
    }
    Ok(state.store().get_archive(&query.archive_id).await?)
}
