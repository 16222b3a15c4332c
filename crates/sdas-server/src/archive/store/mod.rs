//! Durable record store for archives and job lookups
//!
//! The store is the single source of truth for workflow state. Counters are
//! only ever changed through [`RecordStore::atomic_increment`], which returns
//! the post-increment values from the same atomic operation. Status changes go
//! through [`RecordStore::transition_status`], a compare-and-set against the
//! allowed predecessors of the target status.
//!
//! Redelivered events are absorbed here as well: a table's successful run and
//! a validation query's completion each carry a durable claim, so counting
//! them a second time is a no-op.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use super::error::ArchiveResult;
use super::types::{
    Archive, ArchiveStatus, Counter, Counters, EtlConfiguration, ExpirationSettings, JobLookup,
    JobRecord, JobStatus, ValidationKind, ValidationResult,
};

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

/// Result of a conditional status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Status changed; `from` is the status it replaced
    Applied { from: ArchiveStatus },
    /// Stored status was not an allowed predecessor; nothing written
    Rejected { current: ArchiveStatus },
}

impl StatusUpdate {
    pub fn is_applied(&self) -> bool {
        matches!(self, StatusUpdate::Applied { .. })
    }
}

/// State written by [`RecordStore::mark_table_extracted`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableExtraction {
    pub counters: Counters,
    /// Every table of the archive has now been counted
    pub all_tables_extracted: bool,
    /// Archive status after the write
    pub archive_status: ArchiveStatus,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_archive(&self, id: &str) -> ArchiveResult<Archive>;

    /// Insert or fully replace an archive record
    async fn put_archive(&self, archive: &Archive) -> ArchiveResult<()>;

    async fn transition_status(&self, id: &str, to: ArchiveStatus) -> ArchiveResult<StatusUpdate>;

    /// Last writer wins, except that `Failed` is never replaced
    async fn set_job_status(&self, id: &str, status: JobStatus) -> ArchiveResult<()>;

    /// Add or advance `jobs[record.job_run_id]`
    ///
    /// Returns `false` without writing when the stored entry is already
    /// terminal.
    async fn record_job(&self, id: &str, record: &JobRecord) -> ArchiveResult<bool>;

    /// Add `delta` to one counter and return every counter as of that write
    async fn atomic_increment(
        &self,
        id: &str,
        counter: Counter,
        delta: i64,
    ) -> ArchiveResult<Counters>;

    /// Count a table's successful run, once
    ///
    /// In one atomic step: flag `table_details[table_index]` as extracted, add
    /// `validation_tasks` to `validation_count` and bump `etl.succeeded`. When
    /// that was the last table, `job_status` becomes `Succeeded` (unless
    /// `Failed`) and an `Archiving` archive moves to `Validating`.
    ///
    /// Returns `None` without writing when the table was already counted.
    async fn mark_table_extracted(
        &self,
        id: &str,
        table_index: usize,
        validation_tasks: i64,
    ) -> ArchiveResult<Option<TableExtraction>>;

    /// Claim a validation execution and bump `validation_completed` in one
    /// atomic step
    ///
    /// Returns the counters as of that write, or `None` when the execution
    /// was already counted. Fails with
    /// [`ArchiveError::UnknownExecution`](super::error::ArchiveError::UnknownExecution)
    /// when no lookup exists for it.
    async fn count_completion(&self, execution_id: &str) -> ArchiveResult<Option<Counters>>;

    /// Write `table_details[table_index].<kind>` unless it is already set
    ///
    /// Returns `false` when a result was stored earlier.
    async fn set_table_validation(
        &self,
        id: &str,
        table_index: usize,
        kind: ValidationKind,
        result: &ValidationResult,
    ) -> ArchiveResult<bool>;

    /// Fails with [`ArchiveError::Frozen`](super::error::ArchiveError::Frozen)
    /// unless the archive is still `Queued`
    async fn set_etl_configuration(&self, id: &str, etl: &EtlConfiguration) -> ArchiveResult<()>;

    async fn set_expiration(&self, id: &str, expiration: &ExpirationSettings) -> ArchiveResult<()>;

    /// Write-once; returns `false` when a lookup for the execution exists
    async fn put_job_lookup(&self, lookup: &JobLookup) -> ArchiveResult<bool>;

    async fn get_job_lookup(&self, execution_id: &str) -> ArchiveResult<Option<JobLookup>>;
}
