//! Archive workflow coordinator
//!
//! Drives an archive through its lifecycle:
//! 1. Start: `Queued -> Archiving`, provision catalog connection, database,
//!    tables and one ETL job per table, then submit every job run
//! 2. Job events: record each run; a failed run fails the archive, a
//!    succeeded run plans its table's validations
//! 3. Once every table has been extracted: `Archiving -> Validating`
//! 4. Query events: each finished validation query is counted by the
//!    [`CompletionCounter`](super::counter::CompletionCounter) before the
//!    event is acknowledged; the last one moves the archive to `Archived`
//!
//! Any provisioning fault marks the archive `Failed` before the error is
//! returned, so callers that drop the error still leave a durable signal.
//!
//! Events arrive at least once. An event whose handling fails is expected to
//! be delivered again, and every step it repeats is idempotent in the record
//! store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::counter::{CompletionCounter, CompletionOutcome, ValidationCompletion};
use super::error::{ArchiveError, ArchiveResult, ProvisionStep};
use super::gateway::{
    CatalogColumn, CatalogGateway, CatalogTable, ConnectionInput, DatabaseInput, GatewayError,
    JobDefinition, JobRunRequest, JobRunner, QueryEngine, SecretStore, TableKind,
};
use super::naming::{split_job_name, JobCorrelation};
use super::planner::{self, ValidationPlanner};
use super::store::{RecordStore, StatusUpdate};
use super::types::{
    Archive, ArchiveStatus, ArchiveTable, EtlConfiguration, JobRecord, JobRunState, JobStatus,
    QueryState, ValidationResult,
};
use crate::config::{ArchiveConfig, QueryConfig};

/// Rows fetched for a finished validation query
pub const VALIDATION_RESULT_LIMIT: usize = 123;

/// Job-state-changed event from the job runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateEvent {
    pub job_name: String,
    pub job_run_id: String,
    pub state: JobRunState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub started_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_on: Option<DateTime<Utc>>,
    /// Correlation attached at submission, when the runner echoes it back
    #[serde(default)]
    pub correlation: Option<JobCorrelation>,
}

/// Query-state-changed event from the interactive query engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStateEvent {
    pub execution_id: String,
    pub current_state: QueryState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobEventOutcome {
    /// A non-terminal state was recorded
    Recorded,
    /// The run or its table had already been handled; nothing changed
    Duplicate,
    /// The run failed and the archive was marked `Failed`
    ArchiveFailed,
    /// The table was extracted and its validations dispatched
    ValidationDispatched {
        started: usize,
        failed: usize,
        all_tables_extracted: bool,
    },
    /// The table was extracted but the archive had already failed
    ValidationSkipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QueryEventOutcome {
    /// The result was handed to the completion counter
    Completed(CompletionOutcome),
    /// The validation query did not succeed; the archive was marked `Failed`
    ArchiveFailed,
    /// Not a terminal state
    Ignored,
}

/// External capabilities used by the coordinator
#[derive(Clone)]
pub struct Gateways {
    pub catalog: Arc<dyn CatalogGateway>,
    pub jobs: Arc<dyn JobRunner>,
    pub engine: Arc<dyn QueryEngine>,
    pub secrets: Arc<dyn SecretStore>,
}

pub struct ArchiveCoordinator {
    store: Arc<dyn RecordStore>,
    gateways: Gateways,
    planner: ValidationPlanner,
    counter: CompletionCounter,
    config: ArchiveConfig,
}

impl ArchiveCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gateways: Gateways,
        config: ArchiveConfig,
        query: QueryConfig,
    ) -> Self {
        let planner = ValidationPlanner::new(store.clone(), gateways.engine.clone(), query);
        let counter = CompletionCounter::new(store.clone());
        Self {
            store,
            gateways,
            planner,
            counter,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn gateways(&self) -> &Gateways {
        &self.gateways
    }

    /// Set the ETL worker class and size; only allowed while `Queued`
    #[tracing::instrument(skip(self))]
    pub async fn configure_etl(
        &self,
        archive_id: &str,
        etl: EtlConfiguration,
    ) -> ArchiveResult<()> {
        if etl.worker_type.trim().is_empty() {
            return Err(ArchiveError::Validation("worker_type cannot be empty".to_string()));
        }
        if etl.worker_count == 0 || etl.worker_count > self.config.max_worker_count {
            return Err(ArchiveError::Validation(format!(
                "worker_count must be between 1 and {}",
                self.config.max_worker_count
            )));
        }
        self.store.set_etl_configuration(archive_id, &etl).await
    }

    /// Move a queued archive to `Archiving` and provision its resources
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, archive_id: &str) -> ArchiveResult<()> {
        match self
            .store
            .transition_status(archive_id, ArchiveStatus::Archiving)
            .await?
        {
            StatusUpdate::Applied { .. } => info!("Archive workflow started"),
            StatusUpdate::Rejected { current } => {
                return Err(ArchiveError::IllegalTransition {
                    archive_id: archive_id.to_string(),
                    from: current,
                    to: ArchiveStatus::Archiving,
                });
            },
        }

        let archive = self.store.get_archive(archive_id).await?;
        if let Err(e) = self.provision(&archive).await {
            error!(error = %e, "Provisioning failed");
            self.fail(archive_id).await;
            return Err(e);
        }

        info!(tables = archive.table_details.len(), "All ETL jobs submitted");
        Ok(())
    }

    async fn provision(&self, archive: &Archive) -> ArchiveResult<()> {
        let id = archive.id.as_str();

        self.ensure_connection(archive)
            .await
            .map_err(|e| ArchiveError::provisioning(id, ProvisionStep::Connection, e))?;
        self.ensure_database(archive)
            .await
            .map_err(|e| ArchiveError::provisioning(id, ProvisionStep::Database, e))?;

        for table in &archive.table_details {
            self.ensure_table(archive, table)
                .await
                .map_err(|e| ArchiveError::provisioning(id, ProvisionStep::Table, e))?;
            self.ensure_job(archive, table)
                .await
                .map_err(|e| ArchiveError::provisioning(id, ProvisionStep::Job, e))?;
        }

        for table in &archive.table_details {
            self.submit_run(archive, table)
                .await
                .map_err(|e| ArchiveError::provisioning(id, ProvisionStep::JobRun, e))?;
        }

        Ok(())
    }

    async fn ensure_connection(&self, archive: &Archive) -> ArchiveResult<()> {
        let name = archive.names().connection();
        if exists(self.gateways.catalog.get_connection(&name).await)? {
            debug!(%name, "Connection already provisioned");
            return Ok(());
        }

        let details = &archive.connection;
        let password = self.gateways.secrets.get_secret(&details.secret_ref).await?;
        let input = ConnectionInput {
            name: name.clone(),
            description: format!("Source connection for archive {}", archive.archive_name),
            jdbc_url: archive
                .database_engine
                .jdbc_url(&details.hostname, details.port, &details.database),
            username: details.username.clone(),
            password,
            enforce_ssl: false,
        };
        created(self.gateways.catalog.create_connection(input).await)?;
        info!(%name, "Connection created");
        Ok(())
    }

    async fn ensure_database(&self, archive: &Archive) -> ArchiveResult<()> {
        let name = archive.names().database();
        if exists(self.gateways.catalog.get_database(&name).await)? {
            return Ok(());
        }

        let input = DatabaseInput {
            name: name.clone(),
            description: format!("Archived copy of {}", archive.connection.database),
        };
        created(self.gateways.catalog.create_database(input).await)?;
        info!(%name, "Catalog database created");
        Ok(())
    }

    async fn ensure_table(&self, archive: &Archive, table: &ArchiveTable) -> ArchiveResult<()> {
        let names = archive.names();
        let database = names.database();
        let name = names.table(&table.table);
        if exists(self.gateways.catalog.get_table(&database, &name).await)? {
            return Ok(());
        }

        let entry = CatalogTable {
            name: name.clone(),
            kind: TableKind::ExternalTable,
            location: Some(names.data_location(&self.config.data_bucket, &table.table)),
            columns: table
                .schema
                .iter()
                .map(|c| CatalogColumn {
                    name: c.key.clone(),
                    data_type: c.normalized_type.clone(),
                    comment: String::new(),
                })
                .collect(),
            view_original_text: None,
            view_expanded_text: None,
            created_at: None,
            updated_at: None,
        };
        created(self.gateways.catalog.create_table(&database, entry).await)?;
        debug!(%name, "Catalog table created");
        Ok(())
    }

    async fn ensure_job(&self, archive: &Archive, table: &ArchiveTable) -> ArchiveResult<()> {
        let names = archive.names();
        let name = names.job(&table.table);
        if exists(self.gateways.jobs.get_job(&name).await)? {
            return Ok(());
        }

        let engine = archive.database_engine;
        let mut default_arguments = BTreeMap::new();
        default_arguments.insert("--job-language".to_string(), "python".to_string());
        if engine.disables_proxy_v2() {
            default_arguments.insert("--disable-proxy-v2".to_string(), "true".to_string());
        }

        let etl = &archive.configuration.etl;
        let definition = JobDefinition {
            name: name.clone(),
            script_location: format!(
                "{}/{}",
                self.config.script_location.trim_end_matches('/'),
                engine.script_name()
            ),
            connections: vec![names.connection()],
            default_arguments,
            max_retries: 0,
            worker_type: etl.worker_type.clone(),
            worker_count: etl.worker_count,
            timeout_minutes: self.config.job_timeout_minutes,
        };
        created(self.gateways.jobs.create_job(definition).await)?;
        debug!(%name, "ETL job created");
        Ok(())
    }

    async fn submit_run(&self, archive: &Archive, table: &ArchiveTable) -> ArchiveResult<()> {
        let names = archive.names();
        let job_name = names.job(&table.table);
        let etl = &archive.configuration.etl;

        let request = JobRunRequest {
            job_name: job_name.clone(),
            arguments: self.job_arguments(archive, table)?,
            worker_type: etl.worker_type.clone(),
            worker_count: etl.worker_count,
            timeout_minutes: self.config.job_timeout_minutes,
            correlation: JobCorrelation::new(
                &archive.id,
                &archive.connection.database,
                &table.table,
            ),
        };
        let job_run_id = self.gateways.jobs.start_job_run(request).await?;

        let record = JobRecord {
            job_name,
            job_run_id: job_run_id.clone(),
            state: JobRunState::Running,
            message: String::new(),
            started_on: Some(Utc::now()),
            completed_on: None,
            recorded_at: Utc::now(),
        };
        self.store.record_job(&archive.id, &record).await?;
        info!(table = %table.table, %job_run_id, "ETL job run submitted");
        Ok(())
    }

    fn job_arguments(
        &self,
        archive: &Archive,
        table: &ArchiveTable,
    ) -> ArchiveResult<BTreeMap<String, String>> {
        let mappings: Vec<[&str; 4]> = table
            .schema
            .iter()
            .map(|c| {
                let ty = if c.normalized_type.eq_ignore_ascii_case("array<string>") {
                    "array"
                } else {
                    c.normalized_type.as_str()
                };
                [c.key.as_str(), ty, c.key.as_str(), ty]
            })
            .collect();

        let mut arguments = BTreeMap::new();
        arguments.insert(
            "--job-bookmark-option".to_string(),
            "job-bookmark-disable".to_string(),
        );
        arguments.insert("--enable-job-insights".to_string(), "false".to_string());
        arguments.insert("--TempDir".to_string(), self.config.temp_dir.clone());
        arguments.insert("--TABLE".to_string(), table.table.clone());
        arguments.insert("--BUCKET".to_string(), self.config.data_bucket.clone());
        arguments.insert("--DATABASE".to_string(), archive.connection.database.clone());
        arguments.insert("--ARCHIVE_ID".to_string(), archive.id.clone());
        arguments.insert("--CONNECTION".to_string(), archive.names().connection());
        arguments.insert("--MAPPINGS".to_string(), serde_json::to_string(&mappings)?);

        if let (Some(flag), Some(owner)) = (
            archive.database_engine.owner_argument(),
            archive.connection.owner.as_ref(),
        ) {
            arguments.insert(flag.to_string(), owner.clone());
        }

        Ok(arguments)
    }

    async fn fail(&self, archive_id: &str) {
        match self
            .store
            .transition_status(archive_id, ArchiveStatus::Failed)
            .await
        {
            Ok(StatusUpdate::Applied { from }) => {
                warn!(archive_id, %from, "Archive marked Failed")
            },
            Ok(StatusUpdate::Rejected { current }) => {
                debug!(archive_id, %current, "Archive already terminal, not marking Failed")
            },
            Err(e) => error!(archive_id, error = %e, "Could not mark archive Failed"),
        }
    }

    // ========================================================================
    // Job events
    // ========================================================================

    /// Apply a job-state-changed event
    ///
    /// A redelivered terminal event repeats its handling: failing an archive
    /// is idempotent and a table is only counted once, so a delivery that
    /// failed halfway is finished by the next one.
    #[tracing::instrument(
        skip(self, event),
        fields(
            job_name = %event.job_name,
            job_run_id = %event.job_run_id,
            state = event.state.as_str(),
        )
    )]
    pub async fn handle_job_event(&self, event: JobStateEvent) -> ArchiveResult<JobEventOutcome> {
        let correlation = match &event.correlation {
            Some(correlation) => correlation.clone(),
            None => {
                let (archive_id, _) = split_job_name(&event.job_name)?;
                let archive = self.store.get_archive(archive_id).await?;
                JobCorrelation::resolve(&event.job_name, &archive)?
            },
        };

        let archive = self.store.get_archive(&correlation.archive_id).await?;
        let table_index = archive
            .table_index(&correlation.table)
            .ok_or_else(|| ArchiveError::InvalidJobName(event.job_name.clone()))?;

        let record = self.job_record(&event).await;
        if !self.store.record_job(&archive.id, &record).await? {
            let stored = archive.jobs.get(&event.job_run_id).map(|job| job.state);
            if !event.state.is_terminal() || stored != Some(event.state) {
                debug!(stored = ?stored, "Run already has a terminal state, ignoring event");
                return Ok(JobEventOutcome::Duplicate);
            }
            debug!("Terminal state already recorded, finishing its handling");
        }

        match event.state {
            JobRunState::Running => Ok(JobEventOutcome::Recorded),
            JobRunState::Failed => {
                warn!(message = %event.message, "ETL job run failed");
                self.store.set_job_status(&archive.id, JobStatus::Failed).await?;
                self.fail(&archive.id).await;
                Ok(JobEventOutcome::ArchiveFailed)
            },
            JobRunState::Succeeded => self.table_extracted(&archive, table_index).await,
        }
    }

    /// Build the job log entry, filling run timestamps from the runner when
    /// the event carries none
    async fn job_record(&self, event: &JobStateEvent) -> JobRecord {
        let (mut started_on, mut completed_on) = (event.started_on, event.completed_on);
        if started_on.is_none() && event.state.is_terminal() {
            match self
                .gateways
                .jobs
                .get_job_run(&event.job_name, &event.job_run_id)
                .await
            {
                Ok(run) => {
                    started_on = run.started_on;
                    completed_on = completed_on.or(run.completed_on);
                },
                Err(e) => debug!(error = %e, "Job run details unavailable"),
            }
        }

        JobRecord {
            job_name: event.job_name.clone(),
            job_run_id: event.job_run_id.clone(),
            state: event.state,
            message: event.message.clone(),
            started_on,
            completed_on,
            recorded_at: Utc::now(),
        }
    }

    async fn table_extracted(
        &self,
        archive: &Archive,
        table_index: usize,
    ) -> ArchiveResult<JobEventOutcome> {
        let table = &archive.table_details[table_index];
        let tasks = planner::plan(&table.schema);

        // validation target must include this table before it counts as extracted
        let Some(extraction) = self.planner.reserve(&archive.id, table_index, &tasks).await? else {
            debug!(table = %table.table, "Table already counted as extracted");
            return Ok(JobEventOutcome::Duplicate);
        };

        if extraction.all_tables_extracted {
            match extraction.archive_status {
                ArchiveStatus::Validating => info!("All tables extracted, archive is Validating"),
                current => warn!(%current, "All tables extracted but archive was not Archiving"),
            }
        }

        if extraction.archive_status == ArchiveStatus::Failed {
            warn!(table = %table.table, "Archive failed, not dispatching validations");
            return Ok(JobEventOutcome::ValidationSkipped);
        }

        let report = self.planner.dispatch(archive, &table.table, &tasks).await;
        if report.failed > 0 {
            error!(
                failed = report.failed,
                "Validation dispatch failed after reservation; archive cannot reach Archived"
            );
        }

        Ok(JobEventOutcome::ValidationDispatched {
            started: report.started.len(),
            failed: report.failed,
            all_tables_extracted: extraction.all_tables_extracted,
        })
    }

    // ========================================================================
    // Query events
    // ========================================================================

    /// Apply a query-state-changed event for a validation query
    ///
    /// A successful query is counted before this returns, so an error leaves
    /// the event unacknowledged for redelivery.
    #[tracing::instrument(skip(self, event), fields(execution_id = %event.execution_id))]
    pub async fn handle_query_event(
        &self,
        event: QueryStateEvent,
    ) -> ArchiveResult<QueryEventOutcome> {
        let lookup = self
            .store
            .get_job_lookup(&event.execution_id)
            .await?
            .ok_or_else(|| ArchiveError::UnknownExecution(event.execution_id.clone()))?;

        match event.current_state {
            QueryState::Succeeded => {
                let page = self
                    .gateways
                    .engine
                    .get_query_results(&event.execution_id, None, VALIDATION_RESULT_LIMIT)
                    .await?;

                let completion = ValidationCompletion {
                    archive_id: lookup.archive_id,
                    table_name: lookup.table_name,
                    kind: lookup.validation_type,
                    result: ValidationResult {
                        query_execution_id: event.execution_id,
                        query: lookup.query,
                        state: QueryState::Succeeded,
                        results: page.rows,
                    },
                };

                let outcome = self.counter.record_completion(&completion).await?;
                Ok(QueryEventOutcome::Completed(outcome))
            },
            QueryState::Failed | QueryState::Cancelled => {
                warn!(
                    archive_id = %lookup.archive_id,
                    table = %lookup.table_name,
                    kind = %lookup.validation_type,
                    "Validation query did not succeed"
                );
                self.fail(&lookup.archive_id).await;
                Ok(QueryEventOutcome::ArchiveFailed)
            },
            QueryState::Queued | QueryState::Running => Ok(QueryEventOutcome::Ignored),
        }
    }
}

/// `Ok(true)` if found, `Ok(false)` on not-found, otherwise the error
fn exists<T>(result: Result<T, GatewayError>) -> ArchiveResult<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(GatewayError::NotFound(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// A concurrent creator winning the race counts as success
fn created(result: Result<(), GatewayError>) -> ArchiveResult<()> {
    match result {
        Ok(()) | Err(GatewayError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
