//! Validation fan-out planning and dispatch
//!
//! Every archived table gets a row-count check, plus at most one sampled
//! string check and one numeric check picked from its schema. The planned
//! tasks are reserved on the archive's `validation_count` before any of them
//! is started, so the completion target is never below the number of queries
//! in flight. The reservation is part of the table's extraction claim, so a
//! redelivered job event cannot reserve the same table twice.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::error::ArchiveResult;
use super::gateway::{QueryContext, QueryEngine};
use super::naming::CatalogNames;
use super::store::{RecordStore, TableExtraction};
use super::types::{Archive, Column, JobLookup, ValidationKind};
use crate::config::QueryConfig;

const NUMERIC_TYPES: [&str; 3] = ["decimal", "number", "int"];
const STRING_SAMPLE_SIZE: usize = 10;

/// One validation query to run against an archived table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationTask {
    pub kind: ValidationKind,
    /// Column under test; `None` for the count check
    pub column: Option<Column>,
}

impl ValidationTask {
    /// SQL for this check against the archived copy of `table`
    pub fn query(&self, names: &CatalogNames<'_>, table: &str) -> String {
        let target = names.qualified_table(table);
        match (&self.kind, &self.column) {
            (ValidationKind::String, Some(column)) => {
                let col = quote_identifier(&column.key);
                format!(
                    "SELECT {col} FROM {target} WHERE {col} IS NOT NULL \
                     ORDER BY {col} LIMIT {STRING_SAMPLE_SIZE}"
                )
            },
            (ValidationKind::Number, Some(column)) => {
                let col = quote_identifier(&column.key);
                format!("SELECT MIN({col}), MAX({col}), SUM({col}) FROM {target}")
            },
            _ => format!("SELECT COUNT(*) FROM {target}"),
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Decide which validations to run for a table schema
///
/// The count check is always planned. The string and numeric checks each take
/// the last matching column in declared order.
pub fn plan(schema: &[Column]) -> Vec<ValidationTask> {
    let mut tasks = vec![ValidationTask {
        kind: ValidationKind::Count,
        column: None,
    }];

    if let Some(column) = schema.iter().rev().find(|c| c.normalized_type == "string") {
        tasks.push(ValidationTask {
            kind: ValidationKind::String,
            column: Some(column.clone()),
        });
    }

    if let Some(column) = schema
        .iter()
        .rev()
        .find(|c| NUMERIC_TYPES.contains(&c.normalized_type.as_str()))
    {
        tasks.push(ValidationTask {
            kind: ValidationKind::Number,
            column: Some(column.clone()),
        });
    }

    tasks
}

/// Outcome of dispatching a table's planned validations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Execution ids of the queries that were started and indexed
    pub started: Vec<String>,
    pub failed: usize,
}

/// Reserves and starts validation queries
pub struct ValidationPlanner {
    store: Arc<dyn RecordStore>,
    engine: Arc<dyn QueryEngine>,
    query: QueryConfig,
}

impl ValidationPlanner {
    pub fn new(
        store: Arc<dyn RecordStore>,
        engine: Arc<dyn QueryEngine>,
        query: QueryConfig,
    ) -> Self {
        Self {
            store,
            engine,
            query,
        }
    }

    /// Add the planned tasks to the archive's validation target while
    /// counting the table as extracted
    ///
    /// Returns `None` when the table was already counted; nothing is reserved
    /// in that case.
    #[tracing::instrument(skip(self, tasks), fields(tasks = tasks.len()))]
    pub async fn reserve(
        &self,
        archive_id: &str,
        table_index: usize,
        tasks: &[ValidationTask],
    ) -> ArchiveResult<Option<TableExtraction>> {
        let delta = i64::try_from(tasks.len()).unwrap_or(i64::MAX);
        let extraction = self
            .store
            .mark_table_extracted(archive_id, table_index, delta)
            .await?;
        if let Some(extraction) = &extraction {
            debug!(
                validation_count = extraction.counters.validation.validation_count,
                etl_succeeded = extraction.counters.etl.succeeded,
                "Reserved validation tasks"
            );
        }
        Ok(extraction)
    }

    /// Start each task and index its execution id
    ///
    /// Tasks start concurrently. Failures are logged and counted but not
    /// compensated: the reserved target stays in place.
    #[tracing::instrument(skip(self, archive, tasks), fields(archive_id = %archive.id))]
    pub async fn dispatch(
        &self,
        archive: &Archive,
        table: &str,
        tasks: &[ValidationTask],
    ) -> DispatchReport {
        let names = archive.names();
        let starts = tasks
            .iter()
            .map(|task| self.start_task(archive, &names, table, task));

        let mut report = DispatchReport::default();
        for started in join_all(starts).await {
            match started {
                Some(execution_id) => report.started.push(execution_id),
                None => report.failed += 1,
            }
        }

        info!(
            table,
            started = report.started.len(),
            failed = report.failed,
            "Dispatched validation queries"
        );
        report
    }

    async fn start_task(
        &self,
        archive: &Archive,
        names: &CatalogNames<'_>,
        table: &str,
        task: &ValidationTask,
    ) -> Option<String> {
        let sql = task.query(names, table);
        let context = QueryContext {
            database: Some(names.database()),
            workgroup: Some(self.query.workgroup.clone()),
            output_location: self.query.output_location.clone(),
        };

        let execution_id = match self.engine.start_query(&sql, context).await {
            Ok(id) => id,
            Err(e) => {
                error!(kind = %task.kind, error = %e, "Failed to start validation query");
                return None;
            },
        };

        let lookup = JobLookup {
            execution_id: execution_id.clone(),
            archive_id: archive.id.clone(),
            table_name: table.to_string(),
            validation_type: task.kind,
            query: sql,
        };
        match self.store.put_job_lookup(&lookup).await {
            Ok(true) => Some(execution_id),
            Ok(false) => {
                warn!(%execution_id, "Job lookup already present, keeping the first");
                Some(execution_id)
            },
            Err(e) => {
                error!(%execution_id, error = %e, "Failed to index validation query");
                None
            },
        }
    }
}
