//! Catalog and job naming
//!
//! Every per-archive resource in the catalog and the job runner is namespaced
//! by archive id and source database name:
//!
//! | Resource   | Name                              |
//! |------------|-----------------------------------|
//! | connection | `{id}-{db}-connection`            |
//! | database   | `{id}-{db}-database`              |
//! | table      | `{id}-{db}-{table}-table`         |
//! | job        | `{id}-{db}-{table}`               |
//! | data       | `s3://{bucket}/{id}/{db}/{table}` |
//!
//! Job-state events are correlated with `(archive, table)` through a
//! [`JobCorrelation`] attached to each run. Events without one fall back to
//! [`split_job_name`], which relies on archive ids being UUIDs.

use serde::{Deserialize, Serialize};

use super::error::{ArchiveError, ArchiveResult};
use super::types::Archive;

const UUID_LEN: usize = 36;

/// Name builder for one archive's catalog resources
#[derive(Debug, Clone, Copy)]
pub struct CatalogNames<'a> {
    archive_id: &'a str,
    database: &'a str,
}

impl<'a> CatalogNames<'a> {
    pub fn new(archive_id: &'a str, database: &'a str) -> Self {
        Self {
            archive_id,
            database,
        }
    }

    fn prefix(&self) -> String {
        format!("{}-{}", self.archive_id, self.database)
    }

    pub fn connection(&self) -> String {
        format!("{}-connection", self.prefix())
    }

    pub fn database(&self) -> String {
        format!("{}-database", self.prefix())
    }

    pub fn table(&self, table: &str) -> String {
        format!("{}-{table}-table", self.prefix())
    }

    pub fn job(&self, table: &str) -> String {
        format!("{}-{table}", self.prefix())
    }

    pub fn data_location(&self, bucket: &str, table: &str) -> String {
        format!("s3://{bucket}/{}/{}/{table}", self.archive_id, self.database)
    }

    /// Fully qualified, double-quoted reference used in rewritten SQL
    pub fn qualified_table(&self, table: &str) -> String {
        format!("\"{}\".\"{}\"", self.database(), self.table(table))
    }
}

/// Structured `(archive, database, table)` identity carried by a job run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCorrelation {
    pub archive_id: String,
    pub database: String,
    pub table: String,
}

impl JobCorrelation {
    pub fn new(
        archive_id: impl Into<String>,
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            archive_id: archive_id.into(),
            database: database.into(),
            table: table.into(),
        }
    }

    pub fn job_name(&self) -> String {
        CatalogNames::new(&self.archive_id, &self.database).job(&self.table)
    }

    /// Recover the correlation for `job_name` by comparing it against the
    /// job names generated for the archive's tables
    pub fn resolve(job_name: &str, archive: &Archive) -> ArchiveResult<Self> {
        let names = archive.names();
        archive
            .table_details
            .iter()
            .find(|t| names.job(&t.table) == job_name)
            .map(|t| JobCorrelation::new(&archive.id, &archive.connection.database, &t.table))
            .ok_or_else(|| ArchiveError::InvalidJobName(job_name.to_string()))
    }
}

/// Split a generated job name into its archive id and the `{db}-{table}` rest
pub fn split_job_name(job_name: &str) -> ArchiveResult<(&str, &str)> {
    let invalid = || ArchiveError::InvalidJobName(job_name.to_string());

    let archive_id = job_name.get(..UUID_LEN).ok_or_else(invalid)?;
    uuid::Uuid::parse_str(archive_id).map_err(|_| invalid())?;

    let rest = job_name
        .get(UUID_LEN..)
        .and_then(|r| r.strip_prefix('-'))
        .filter(|r| !r.is_empty())
        .ok_or_else(invalid)?;

    Ok((archive_id, rest))
}
