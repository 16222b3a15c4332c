//! External capabilities the orchestrator drives
//!
//! The catalog, job runner, interactive query engine and secret store are
//! reached through the traits below. [`memory`] holds
//! in-process implementations with failure injection, [`http`] a JSON client
//! for a control-plane gateway.

pub mod http;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::naming::JobCorrelation;
use super::types::{JobRunState, QueryState, ResultRow};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInput {
    pub name: String,
    pub description: String,
    pub jdbc_url: String,
    pub username: String,
    pub password: String,
    pub enforce_ssl: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConnection {
    pub name: String,
    pub jdbc_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInput {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDatabase {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableKind {
    ExternalTable,
    VirtualView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogColumn {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogTable {
    pub name: String,
    pub kind: TableKind,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub columns: Vec<CatalogColumn>,
    #[serde(default)]
    pub view_original_text: Option<String>,
    #[serde(default)]
    pub view_expanded_text: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CatalogTable {
    pub fn is_view(&self) -> bool {
        self.kind == TableKind::VirtualView
    }
}

#[async_trait]
pub trait CatalogGateway: Send + Sync {
    async fn get_connection(&self, name: &str) -> GatewayResult<CatalogConnection>;
    async fn create_connection(&self, input: ConnectionInput) -> GatewayResult<()>;
    async fn get_database(&self, name: &str) -> GatewayResult<CatalogDatabase>;
    async fn create_database(&self, input: DatabaseInput) -> GatewayResult<()>;
    async fn get_table(&self, database: &str, name: &str) -> GatewayResult<CatalogTable>;
    async fn create_table(&self, database: &str, table: CatalogTable) -> GatewayResult<()>;
    /// Every table and view of `database`, across all pages
    async fn list_tables(&self, database: &str) -> GatewayResult<Vec<CatalogTable>>;
    async fn delete_table(&self, database: &str, name: &str) -> GatewayResult<()>;
}

// ============================================================================
// Job runner
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub script_location: String,
    pub connections: Vec<String>,
    pub default_arguments: BTreeMap<String, String>,
    pub max_retries: u32,
    pub worker_type: String,
    pub worker_count: u32,
    pub timeout_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunRequest {
    pub job_name: String,
    pub arguments: BTreeMap<String, String>,
    pub worker_type: String,
    pub worker_count: u32,
    pub timeout_minutes: u32,
    /// Returned verbatim on every state-change event of the run
    pub correlation: JobCorrelation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub job_name: String,
    pub job_run_id: String,
    pub state: JobRunState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub started_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_on: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn get_job(&self, name: &str) -> GatewayResult<JobDefinition>;
    async fn create_job(&self, definition: JobDefinition) -> GatewayResult<()>;
    /// Submit a run and return its id
    async fn start_job_run(&self, request: JobRunRequest) -> GatewayResult<String>;
    async fn get_job_run(&self, job_name: &str, job_run_id: &str) -> GatewayResult<JobRun>;
}

// ============================================================================
// Interactive query engine
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryContext {
    pub database: Option<String>,
    pub workgroup: Option<String>,
    pub output_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryExecution {
    pub execution_id: String,
    pub state: QueryState,
    #[serde(default)]
    pub state_change_reason: Option<String>,
    #[serde(default)]
    pub output_location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPage {
    pub rows: Vec<ResultRow>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Start `sql` and return the execution id
    async fn start_query(&self, sql: &str, context: QueryContext) -> GatewayResult<String>;
    async fn get_query_execution(&self, execution_id: &str) -> GatewayResult<QueryExecution>;
    async fn get_query_results(
        &self,
        execution_id: &str,
        next_token: Option<&str>,
        max_results: usize,
    ) -> GatewayResult<ResultPage>;
}

// ============================================================================
// Secret store
// ============================================================================

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Store `value` and return a reference to it
    async fn create_secret(&self, name: &str, value: &str) -> GatewayResult<String>;
    async fn get_secret(&self, reference: &str) -> GatewayResult<String>;
}
