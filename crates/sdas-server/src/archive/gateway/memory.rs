//! In-process gateway implementations
//!
//! [`MemoryGateway`] implements the catalog, job runner, query engine and
//! secret store over shared maps. Any operation can be made to fail with
//! [`MemoryGateway::fail`], which is how tests exercise the failure paths of
//! the workflow.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    CatalogConnection, CatalogDatabase, CatalogGateway, CatalogTable, ConnectionInput,
    DatabaseInput, GatewayError, GatewayResult, JobDefinition, JobRun, JobRunRequest, JobRunner,
    QueryContext, QueryEngine, QueryExecution, ResultPage, SecretStore, TableKind,
};
use crate::archive::types::{JobRunState, QueryState, ResultRow};

/// A query the engine was asked to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedQuery {
    pub execution_id: String,
    pub sql: String,
    pub context: QueryContext,
}

#[derive(Default)]
struct State {
    connections: BTreeMap<String, ConnectionInput>,
    databases: BTreeMap<String, DatabaseInput>,
    tables: BTreeMap<(String, String), CatalogTable>,
    jobs: BTreeMap<String, JobDefinition>,
    runs: BTreeMap<String, (JobRunRequest, JobRun)>,
    queries: Vec<StartedQuery>,
    executions: BTreeMap<String, QueryExecution>,
    results: BTreeMap<String, Vec<ResultRow>>,
    secrets: BTreeMap<String, String>,
    failures: HashSet<String>,
    create_calls: BTreeMap<&'static str, usize>,
    next_id: u64,
    query_state: Option<QueryState>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn check(&self, operation: &str) -> GatewayResult<()> {
        if self.failures.contains(operation) {
            return Err(GatewayError::Rejected(format!("{operation} failed")));
        }
        Ok(())
    }

    fn count_create(&mut self, kind: &'static str) {
        *self.create_calls.entry(kind).or_default() += 1;
    }
}

#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> GatewayResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| GatewayError::Transport("memory gateway lock poisoned".to_string()))
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut *state),
            Err(poisoned) => {
                let mut state = poisoned.into_inner();
                f(&mut *state)
            },
        }
    }

    /// Make `operation` (a trait method name) fail until cleared
    pub fn fail(&self, operation: &str) {
        self.with(|s| s.failures.insert(operation.to_string()));
    }

    pub fn clear_failures(&self) {
        self.with(|s| s.failures.clear());
    }

    /// State newly started queries report; defaults to `Succeeded`
    pub fn set_query_state(&self, state: QueryState) {
        self.with(|s| s.query_state = Some(state));
    }

    /// Override the state of one execution
    pub fn set_execution_state(&self, execution_id: &str, state: QueryState) {
        self.with(|s| {
            if let Some(execution) = s.executions.get_mut(execution_id) {
                execution.state = state;
            }
        });
    }

    pub fn set_results(&self, execution_id: &str, rows: Vec<ResultRow>) {
        self.with(|s| s.results.insert(execution_id.to_string(), rows));
    }

    pub fn add_view(&self, database: &str, name: &str, sql: &str) {
        self.with(|s| {
            s.tables.insert(
                (database.to_string(), name.to_string()),
                CatalogTable {
                    name: name.to_string(),
                    kind: TableKind::VirtualView,
                    location: None,
                    columns: vec![],
                    view_original_text: Some(sql.to_string()),
                    view_expanded_text: Some(sql.to_string()),
                    created_at: None,
                    updated_at: None,
                },
            )
        });
    }

    /// Number of create calls that reached the gateway for a resource kind
    /// (`connection`, `database`, `table`, `job`)
    pub fn create_calls(&self, kind: &str) -> usize {
        self.with(|s| s.create_calls.get(kind).copied().unwrap_or(0))
    }

    pub fn job_runs(&self) -> Vec<JobRunRequest> {
        self.with(|s| s.runs.values().map(|(request, _)| request.clone()).collect())
    }

    pub fn job_definition(&self, name: &str) -> Option<JobDefinition> {
        self.with(|s| s.jobs.get(name).cloned())
    }

    pub fn connection(&self, name: &str) -> Option<ConnectionInput> {
        self.with(|s| s.connections.get(name).cloned())
    }

    pub fn table_names(&self, database: &str) -> Vec<String> {
        self.with(|s| {
            s.tables
                .keys()
                .filter(|(db, _)| db == database)
                .map(|(_, name)| name.clone())
                .collect()
        })
    }

    pub fn started_queries(&self) -> Vec<StartedQuery> {
        self.with(|s| s.queries.clone())
    }
}

#[async_trait]
impl CatalogGateway for MemoryGateway {
    async fn get_connection(&self, name: &str) -> GatewayResult<CatalogConnection> {
        let state = self.lock()?;
        state.check("get_connection")?;
        state
            .connections
            .get(name)
            .map(|c| CatalogConnection {
                name: c.name.clone(),
                jdbc_url: c.jdbc_url.clone(),
            })
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    async fn create_connection(&self, input: ConnectionInput) -> GatewayResult<()> {
        let mut state = self.lock()?;
        state.check("create_connection")?;
        state.count_create("connection");
        if state.connections.contains_key(&input.name) {
            return Err(GatewayError::AlreadyExists(input.name));
        }
        state.connections.insert(input.name.clone(), input);
        Ok(())
    }

    async fn get_database(&self, name: &str) -> GatewayResult<CatalogDatabase> {
        let state = self.lock()?;
        state.check("get_database")?;
        state
            .databases
            .get(name)
            .map(|d| CatalogDatabase {
                name: d.name.clone(),
            })
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    async fn create_database(&self, input: DatabaseInput) -> GatewayResult<()> {
        let mut state = self.lock()?;
        state.check("create_database")?;
        state.count_create("database");
        if state.databases.contains_key(&input.name) {
            return Err(GatewayError::AlreadyExists(input.name));
        }
        state.databases.insert(input.name.clone(), input);
        Ok(())
    }

    async fn get_table(&self, database: &str, name: &str) -> GatewayResult<CatalogTable> {
        let state = self.lock()?;
        state.check("get_table")?;
        state
            .tables
            .get(&(database.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("{database}.{name}")))
    }

    async fn create_table(&self, database: &str, table: CatalogTable) -> GatewayResult<()> {
        let mut state = self.lock()?;
        state.check("create_table")?;
        state.count_create("table");
        if !state.databases.contains_key(database) {
            return Err(GatewayError::NotFound(database.to_string()));
        }
        let key = (database.to_string(), table.name.clone());
        if state.tables.contains_key(&key) {
            return Err(GatewayError::AlreadyExists(table.name));
        }
        state.tables.insert(key, table);
        Ok(())
    }

    async fn list_tables(&self, database: &str) -> GatewayResult<Vec<CatalogTable>> {
        let state = self.lock()?;
        state.check("list_tables")?;
        Ok(state
            .tables
            .iter()
            .filter(|((db, _), _)| db == database)
            .map(|(_, table)| table.clone())
            .collect())
    }

    async fn delete_table(&self, database: &str, name: &str) -> GatewayResult<()> {
        let mut state = self.lock()?;
        state.check("delete_table")?;
        state
            .tables
            .remove(&(database.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(format!("{database}.{name}")))
    }
}

#[async_trait]
impl JobRunner for MemoryGateway {
    async fn get_job(&self, name: &str) -> GatewayResult<JobDefinition> {
        let state = self.lock()?;
        state.check("get_job")?;
        state
            .jobs
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    async fn create_job(&self, definition: JobDefinition) -> GatewayResult<()> {
        let mut state = self.lock()?;
        state.check("create_job")?;
        state.count_create("job");
        if state.jobs.contains_key(&definition.name) {
            return Err(GatewayError::AlreadyExists(definition.name));
        }
        state.jobs.insert(definition.name.clone(), definition);
        Ok(())
    }

    async fn start_job_run(&self, request: JobRunRequest) -> GatewayResult<String> {
        let mut state = self.lock()?;
        state.check("start_job_run")?;
        if !state.jobs.contains_key(&request.job_name) {
            return Err(GatewayError::NotFound(request.job_name));
        }
        let run_id = state.next_id("jr");
        let run = JobRun {
            job_name: request.job_name.clone(),
            job_run_id: run_id.clone(),
            state: JobRunState::Running,
            message: String::new(),
            started_on: Some(chrono::Utc::now()),
            completed_on: None,
        };
        state.runs.insert(run_id.clone(), (request, run));
        Ok(run_id)
    }

    async fn get_job_run(&self, job_name: &str, job_run_id: &str) -> GatewayResult<JobRun> {
        let state = self.lock()?;
        state.check("get_job_run")?;
        state
            .runs
            .get(job_run_id)
            .filter(|(request, _)| request.job_name == job_name)
            .map(|(_, run)| run.clone())
            .ok_or_else(|| GatewayError::NotFound(job_run_id.to_string()))
    }
}

#[async_trait]
impl QueryEngine for MemoryGateway {
    async fn start_query(&self, sql: &str, context: QueryContext) -> GatewayResult<String> {
        let mut state = self.lock()?;
        state.check("start_query")?;
        let execution_id = state.next_id("q");
        let output_location = context
            .output_location
            .as_ref()
            .map(|prefix| format!("{}/{execution_id}.csv", prefix.trim_end_matches('/')));
        let query_state = state.query_state.unwrap_or(QueryState::Succeeded);

        state.executions.insert(
            execution_id.clone(),
            QueryExecution {
                execution_id: execution_id.clone(),
                state: query_state,
                state_change_reason: None,
                output_location,
            },
        );
        state.queries.push(StartedQuery {
            execution_id: execution_id.clone(),
            sql: sql.to_string(),
            context,
        });
        Ok(execution_id)
    }

    async fn get_query_execution(&self, execution_id: &str) -> GatewayResult<QueryExecution> {
        let state = self.lock()?;
        state.check("get_query_execution")?;
        state
            .executions
            .get(execution_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(execution_id.to_string()))
    }

    async fn get_query_results(
        &self,
        execution_id: &str,
        next_token: Option<&str>,
        max_results: usize,
    ) -> GatewayResult<ResultPage> {
        let state = self.lock()?;
        state.check("get_query_results")?;
        if !state.executions.contains_key(execution_id) {
            return Err(GatewayError::NotFound(execution_id.to_string()));
        }

        let rows = state
            .results
            .get(execution_id)
            .cloned()
            .unwrap_or_else(|| vec![ResultRow::new(["_col0"]), ResultRow::new(["0"])]);

        let offset = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| GatewayError::Rejected(format!("invalid next token: {token}")))?,
            None => 0,
        };
        let end = offset.saturating_add(max_results).min(rows.len());
        let page = rows.get(offset..end).map(<[ResultRow]>::to_vec).unwrap_or_default();

        Ok(ResultPage {
            rows: page,
            next_token: (end < rows.len()).then(|| end.to_string()),
        })
    }
}

#[async_trait]
impl SecretStore for MemoryGateway {
    async fn create_secret(&self, name: &str, value: &str) -> GatewayResult<String> {
        let mut state = self.lock()?;
        state.check("create_secret")?;
        let reference = format!("{name}-{}", state.next_id("secret"));
        state.secrets.insert(reference.clone(), value.to_string());
        Ok(reference)
    }

    async fn get_secret(&self, reference: &str) -> GatewayResult<String> {
        let state = self.lock()?;
        state.check("get_secret")?;
        state
            .secrets
            .get(reference)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(reference.to_string()))
    }
}
