//! Errors raised by the archive lifecycle orchestrator

use sdas_common::SdasError;
use thiserror::Error;

use super::gateway::GatewayError;
use super::types::ArchiveStatus;

/// Result alias for orchestrator operations
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Provisioning step that produced a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    Connection,
    Database,
    Table,
    Job,
    JobRun,
}

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStep::Connection => "connection",
            ProvisionStep::Database => "database",
            ProvisionStep::Table => "table",
            ProvisionStep::Job => "job",
            ProvisionStep::JobRun => "job_run",
        }
    }
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive not found: {0}")]
    NotFound(String),

    #[error("Illegal status transition for archive {archive_id}: {from} -> {to}")]
    IllegalTransition {
        archive_id: String,
        from: ArchiveStatus,
        to: ArchiveStatus,
    },

    #[error("Record store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Provisioning step '{step}' failed for archive {archive_id}: {source}")]
    Provisioning {
        archive_id: String,
        step: ProvisionStep,
        #[source]
        source: Box<ArchiveError>,
    },

    #[error("Cannot correlate job name '{0}' with an archive table")]
    InvalidJobName(String),

    #[error("Unknown query execution: {0}")]
    UnknownExecution(String),

    #[error("ETL configuration of archive {0} is frozen once the archive leaves Queued")]
    Frozen(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Decode(#[from] SdasError),
}

impl ArchiveError {
    pub(crate) fn provisioning(
        archive_id: &str,
        step: ProvisionStep,
        source: impl Into<ArchiveError>,
    ) -> Self {
        ArchiveError::Provisioning {
            archive_id: archive_id.to_string(),
            step,
            source: Box::new(source.into()),
        }
    }

    /// Record store faults that may succeed when repeated
    pub fn is_transient(&self) -> bool {
        matches!(self, ArchiveError::Store(_) | ArchiveError::Database(_))
    }
}
