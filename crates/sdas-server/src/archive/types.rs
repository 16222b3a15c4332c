//! Archive record model and the archive status state machine

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use sdas_common::SdasError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::naming::CatalogNames;

// ============================================================================
// Source engines
// ============================================================================

/// Relational engine an archive is extracted from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    Mysql,
    Mssql,
    Oracle,
    Postgresql,
}

impl DatabaseEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseEngine::Mysql => "mysql",
            DatabaseEngine::Mssql => "mssql",
            DatabaseEngine::Oracle => "oracle",
            DatabaseEngine::Postgresql => "postgresql",
        }
    }

    /// JDBC URL the ETL runner uses to reach the source database
    pub fn jdbc_url(&self, hostname: &str, port: u16, database: &str) -> String {
        match self {
            DatabaseEngine::Mysql => format!("jdbc:mysql://{hostname}:{port}/{database}"),
            DatabaseEngine::Mssql => {
                format!("jdbc:sqlserver://{hostname}:{port};database={database}")
            },
            DatabaseEngine::Oracle => format!("jdbc:oracle://{hostname}:{port}/{database}"),
            DatabaseEngine::Postgresql => {
                format!("jdbc:postgresql://{hostname}:{port}/{database}")
            },
        }
    }

    /// File name of the ETL template for this engine
    pub fn script_name(&self) -> &'static str {
        match self {
            DatabaseEngine::Mysql => "mysql-1-0-0.py",
            DatabaseEngine::Mssql => "mssql-1-0-0.py",
            DatabaseEngine::Oracle => "oracle-1-0-4.py",
            DatabaseEngine::Postgresql => "postgresql-1-0-0.py",
        }
    }

    pub fn disables_proxy_v2(&self) -> bool {
        matches!(self, DatabaseEngine::Mssql | DatabaseEngine::Postgresql)
    }

    /// Job argument carrying the owner/schema qualifier, if the engine takes one
    pub fn owner_argument(&self) -> Option<&'static str> {
        match self {
            DatabaseEngine::Mssql => Some("--MSSQL_SCHEMA"),
            DatabaseEngine::Oracle => Some("--OWNER"),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DatabaseEngine {
    type Err = SdasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mysql" => Ok(DatabaseEngine::Mysql),
            "mssql" => Ok(DatabaseEngine::Mssql),
            "oracle" => Ok(DatabaseEngine::Oracle),
            "postgresql" => Ok(DatabaseEngine::Postgresql),
            other => Err(SdasError::Parse(format!("unsupported database engine: {other}"))),
        }
    }
}

// ============================================================================
// Status axes
// ============================================================================

/// Lifecycle status of an archive
///
/// ```text
/// Queued -> Archiving -> Validating -> Archived
///    \          \             \
///     +----------+-------------+--> Failed
/// ```
///
/// `Archived` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveStatus {
    Queued,
    Archiving,
    Validating,
    Archived,
    Failed,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveStatus::Queued => "Queued",
            ArchiveStatus::Archiving => "Archiving",
            ArchiveStatus::Validating => "Validating",
            ArchiveStatus::Archived => "Archived",
            ArchiveStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ArchiveStatus::Archived | ArchiveStatus::Failed)
    }

    /// Statuses from which `self` may be entered
    pub fn predecessors(&self) -> &'static [ArchiveStatus] {
        match self {
            ArchiveStatus::Queued => &[],
            ArchiveStatus::Archiving => &[ArchiveStatus::Queued],
            ArchiveStatus::Validating => &[ArchiveStatus::Archiving],
            ArchiveStatus::Archived => &[ArchiveStatus::Validating],
            ArchiveStatus::Failed => &[
                ArchiveStatus::Queued,
                ArchiveStatus::Archiving,
                ArchiveStatus::Validating,
            ],
        }
    }

    pub fn can_transition_to(&self, to: ArchiveStatus) -> bool {
        to.predecessors().contains(self)
    }
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArchiveStatus {
    type Err = SdasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(ArchiveStatus::Queued),
            "Archiving" => Ok(ArchiveStatus::Archiving),
            "Validating" => Ok(ArchiveStatus::Validating),
            "Archived" => Ok(ArchiveStatus::Archived),
            "Failed" => Ok(ArchiveStatus::Failed),
            other => Err(SdasError::Parse(format!("unknown archive status: {other}"))),
        }
    }
}

/// Aggregate ETL outcome, independent of [`ArchiveStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    #[serde(rename = "")]
    Pending,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "",
            JobStatus::Succeeded => "Succeeded",
            JobStatus::Failed => "Failed",
        }
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Succeeded" => JobStatus::Succeeded,
            "Failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }
}

/// State reported by the job runner for a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobRunState {
    Running,
    Succeeded,
    Failed,
}

impl JobRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunState::Running => "RUNNING",
            JobRunState::Succeeded => "SUCCEEDED",
            JobRunState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobRunState::Running)
    }
}

/// State of an interactive query execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryState::Succeeded | QueryState::Failed | QueryState::Cancelled
        )
    }
}

// ============================================================================
// Archive record
// ============================================================================

/// Entry of the append-only job log, keyed by job run id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_name: String,
    pub job_run_id: String,
    pub state: JobRunState,
    #[serde(default)]
    pub message: String,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

/// Source database coordinates; the password lives in the secret store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDetails {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    /// Secret store reference, never the secret itself
    pub secret_ref: String,
    pub database: String,
    #[serde(default)]
    pub owner: Option<String>,
}

/// Column descriptor of a source table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub key: String,
    /// Lake-side type: `string`, `int`, `decimal`, `array<string>`, ...
    pub normalized_type: String,
    pub origin_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

/// The three validation checks a table can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValidationKind {
    #[serde(rename = "count_validation")]
    Count,
    #[serde(rename = "string_validation")]
    String,
    #[serde(rename = "number_validation")]
    Number,
}

impl ValidationKind {
    /// Name of the table sub-field holding this kind's result
    pub fn field_name(&self) -> &'static str {
        match self {
            ValidationKind::Count => "count_validation",
            ValidationKind::String => "string_validation",
            ValidationKind::Number => "number_validation",
        }
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

impl std::str::FromStr for ValidationKind {
    type Err = SdasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "count_validation" => Ok(ValidationKind::Count),
            "string_validation" => Ok(ValidationKind::String),
            "number_validation" => Ok(ValidationKind::Number),
            other => Err(SdasError::Parse(format!("unknown validation type: {other}"))),
        }
    }
}

/// One row of a query result page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    pub data: Vec<Option<String>>,
}

impl ResultRow {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            data: values.into_iter().map(|v| Some(v.into())).collect(),
        }
    }
}

/// Outcome of one validation query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub query_execution_id: String,
    pub query: String,
    pub state: QueryState,
    #[serde(default)]
    pub results: Vec<ResultRow>,
}

/// One source table to archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveTable {
    pub table: String,
    pub schema: Vec<Column>,
    #[serde(default)]
    pub count_validation: Option<ValidationResult>,
    #[serde(default)]
    pub string_validation: Option<ValidationResult>,
    #[serde(default)]
    pub number_validation: Option<ValidationResult>,
    /// Set once the table's successful run has been counted
    #[serde(default)]
    pub extracted: bool,
}

impl ArchiveTable {
    pub fn new(table: impl Into<String>, schema: Vec<Column>) -> Self {
        Self {
            table: table.into(),
            schema,
            count_validation: None,
            string_validation: None,
            number_validation: None,
            extracted: false,
        }
    }

    pub fn validation(&self, kind: ValidationKind) -> Option<&ValidationResult> {
        match kind {
            ValidationKind::Count => self.count_validation.as_ref(),
            ValidationKind::String => self.string_validation.as_ref(),
            ValidationKind::Number => self.number_validation.as_ref(),
        }
    }

    /// Fill the result slot for `kind`; returns `false` and keeps the stored
    /// result when the slot is already set
    pub fn set_validation(&mut self, kind: ValidationKind, result: ValidationResult) -> bool {
        let slot = match kind {
            ValidationKind::Count => &mut self.count_validation,
            ValidationKind::String => &mut self.string_validation,
            ValidationKind::Number => &mut self.number_validation,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        true
    }
}

/// Counter addressable through
/// [`RecordStore::atomic_increment`](super::store::RecordStore::atomic_increment)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ValidationCount,
    ValidationCompleted,
    EtlSucceeded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCounters {
    pub validation_count: i64,
    pub validation_completed: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtlCounters {
    pub succeeded: i64,
}

/// Snapshot of every counter of an archive, read in one atomic step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub validation: ValidationCounters,
    pub etl: EtlCounters,
}

impl Counters {
    pub fn bump(&mut self, counter: Counter, delta: i64) {
        match counter {
            Counter::ValidationCount => self.validation.validation_count += delta,
            Counter::ValidationCompleted => self.validation.validation_completed += delta,
            Counter::EtlSucceeded => self.etl.succeeded += delta,
        }
    }
}

/// Worker class and size for the ETL jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtlConfiguration {
    pub worker_type: String,
    pub worker_count: u32,
}

impl Default for EtlConfiguration {
    fn default() -> Self {
        Self {
            worker_type: "Standard".to_string(),
            worker_count: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub etl: EtlConfiguration,
}

/// Data-expiration settings; enforced by an object-store lifecycle rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationSettings {
    pub expiration_status: bool,
    pub expiration_date: Option<NaiveDate>,
    pub delete_data: bool,
}

/// One user-initiated archival request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub id: String,
    pub archive_name: String,
    pub database_engine: DatabaseEngine,
    pub connection: ConnectionDetails,
    pub table_details: Vec<ArchiveTable>,
    pub archive_status: ArchiveStatus,
    #[serde(default)]
    pub job_status: JobStatus,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobRecord>,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub configuration: Configuration,
    #[serde(default)]
    pub legal_hold: bool,
    #[serde(default)]
    pub expiration: ExpirationSettings,
    pub time_submitted: DateTime<Utc>,
}

impl Archive {
    /// New `Queued` archive with a fresh id and zeroed counters
    pub fn new(
        archive_name: impl Into<String>,
        database_engine: DatabaseEngine,
        connection: ConnectionDetails,
        table_details: Vec<ArchiveTable>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            archive_name: archive_name.into(),
            database_engine,
            connection,
            table_details,
            archive_status: ArchiveStatus::Queued,
            job_status: JobStatus::Pending,
            jobs: BTreeMap::new(),
            counters: Counters::default(),
            configuration: Configuration::default(),
            legal_hold: false,
            expiration: ExpirationSettings::default(),
            time_submitted: Utc::now(),
        }
    }

    pub fn names(&self) -> CatalogNames<'_> {
        CatalogNames::new(&self.id, &self.connection.database)
    }

    pub fn table_index(&self, table: &str) -> Option<usize> {
        self.table_details.iter().position(|t| t.table == table)
    }
}

/// Reverse index from a query execution id to the validation it serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLookup {
    pub execution_id: String,
    pub archive_id: String,
    pub table_name: String,
    pub validation_type: ValidationKind,
    pub query: String,
}
