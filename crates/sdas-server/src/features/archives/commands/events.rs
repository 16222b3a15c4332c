//! Lifecycle event callbacks
//!
//! Inbound surface for the job runner and query engine. A non-2xx response
//! asks the event source to redeliver.

use mediator::Request;

use crate::archive::{
    ArchiveError, JobEventOutcome, JobStateEvent, QueryEventOutcome, QueryStateEvent,
};
use crate::features::FeatureState;

/// Errors from handling a lifecycle event; every one of them leaves the
/// event to be redelivered
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl Request<Result<JobEventOutcome, EventError>> for JobStateEvent {}

impl Request<Result<QueryEventOutcome, EventError>> for QueryStateEvent {}

pub async fn handle_job_state(
    state: &FeatureState,
    event: JobStateEvent,
) -> Result<JobEventOutcome, EventError> {
    Ok(state.coordinator.handle_job_event(event).await?)
}

pub async fn handle_query_state(
    state: &FeatureState,
    event: QueryStateEvent,
) -> Result<QueryEventOutcome, EventError> {
    Ok(state.coordinator.handle_query_event(event).await?)
}
