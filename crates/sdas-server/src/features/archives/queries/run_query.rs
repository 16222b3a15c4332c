//! Interactive query over an archive
//!
//! Logical table names in the submitted SQL are rewritten to the archive's
//! catalog names, the query runs in the archive's catalog database, and one
//! page of results is returned. Further pages are fetched by passing back
//! `query_execution_id` and `next_token`, which does not re-run the query.

use std::collections::BTreeSet;
use std::time::Duration;

use mediator::Request;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::archive::gateway::{GatewayError, QueryContext, QueryEngine};
use crate::archive::rewrite::rewrite;
use crate::archive::types::{Archive, QueryState, ResultRow};
use crate::archive::ArchiveError;
use crate::config::QueryConfig;
use crate::features::FeatureState;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunQueryRequest {
    #[serde(skip)]
    pub archive_id: String,
    #[serde(default)]
    pub sql_statement: Option<String>,
    #[serde(default)]
    pub query_execution_id: Option<String>,
    #[serde(default)]
    pub next_token: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPage {
    pub query_execution_id: String,
    /// First row of the first page is the column header
    pub rows: Vec<ResultRow>,
    pub next_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RunQueryError {
    #[error("sql_statement is required")]
    MissingSql,
    #[error("Query execution failed: {0}")]
    Failed(String),
    #[error("Query execution was cancelled")]
    Cancelled,
    /// The wait budget ran out; the query keeps running
    #[error("query {0} is still running; fetch it again with query_execution_id")]
    StillRunning(String),
    #[error(transparent)]
    Engine(#[from] GatewayError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl Request<Result<QueryPage, RunQueryError>> for RunQueryRequest {}

/// Rows requested per page, including the header row
pub fn max_results(page_size: Option<usize>) -> usize {
    page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE) + 1
}

#[tracing::instrument(skip(state, request), fields(archive_id = %request.archive_id))]
pub async fn handle(
    state: &FeatureState,
    request: RunQueryRequest,
) -> Result<QueryPage, RunQueryError> {
    let archive = state.store().get_archive(&request.archive_id).await?;
    let engine = state.engine();

    let execution_id = match request.query_execution_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => {
            let sql = request
                .sql_statement
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or(RunQueryError::MissingSql)?;
            start(state, &archive, sql).await?
        },
    };

    wait_for_completion(engine.as_ref(), &execution_id, &state.query).await?;

    let page = engine
        .get_query_results(
            &execution_id,
            request.next_token.as_deref(),
            max_results(request.page_size),
        )
        .await?;

    Ok(QueryPage {
        query_execution_id: execution_id,
        rows: page.rows,
        next_token: page.next_token,
    })
}

async fn start(
    state: &FeatureState,
    archive: &Archive,
    sql: &str,
) -> Result<String, RunQueryError> {
    let names = archive.names();
    let database = names.database();

    let views: BTreeSet<String> = match state.catalog().list_tables(&database).await {
        Ok(entries) => entries
            .into_iter()
            .filter(|t| t.is_view())
            .map(|t| t.name)
            .collect(),
        Err(e) => {
            warn!(error = %e, "Could not list views, continuing without them");
            BTreeSet::new()
        },
    };
    let tables: BTreeSet<String> = archive
        .table_details
        .iter()
        .map(|t| t.table.clone())
        .collect();

    let rewritten = rewrite(sql, &archive.id, &archive.connection.database, &tables, &views);
    debug!(original = %sql, rewritten = %rewritten, "Query rewritten");

    let context = QueryContext {
        database: Some(database),
        workgroup: Some(state.query.workgroup.clone()),
        output_location: state.query.output_location.clone(),
    };
    let execution_id = state.engine().start_query(&rewritten, context).await?;
    info!(%execution_id, "Query started");
    Ok(execution_id)
}

/// Poll the execution until it reaches a terminal state or the wait budget
/// runs out
pub async fn wait_for_completion(
    engine: &dyn QueryEngine,
    execution_id: &str,
    config: &QueryConfig,
) -> Result<(), RunQueryError> {
    let deadline = Instant::now() + Duration::from_secs(config.max_wait_secs);
    let interval = Duration::from_millis(config.poll_interval_ms.max(1));

    loop {
        let execution = engine.get_query_execution(execution_id).await?;
        match execution.state {
            QueryState::Succeeded => return Ok(()),
            QueryState::Failed => {
                return Err(RunQueryError::Failed(
                    execution
                        .state_change_reason
                        .unwrap_or_else(|| "Unknown error".to_string()),
                ));
            },
            QueryState::Cancelled => return Err(RunQueryError::Cancelled),
            QueryState::Queued | QueryState::Running => {},
        }

        if Instant::now() >= deadline {
            return Err(RunQueryError::StillRunning(execution_id.to_string()));
        }
        sleep(interval).await;
    }
}
